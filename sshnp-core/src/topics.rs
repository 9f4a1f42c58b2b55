//! Notification-key construction, shared between the client, daemon and
//! relay so a publisher and its subscribers can never drift apart on the
//! exact string (spec.md §6 "Notification keys").
//!
//! The substrate already routes by `to` address (spec.md §1's black-box
//! `notify`/`subscribe`), so these keys only need to carry the part spec.md
//! §6 layers on top of that routing — the session/device/kind suffix — not
//! the `<from>`/`<to>` address prefixes the spec's wire notation writes out
//! literally.

use sshnp_common::{Address, DeviceName, SessionId};

/// `<sessionId>.<device>.sshnp<client>` (spec.md §6 "request").
pub fn request_key(session_id: SessionId, device: &DeviceName, client: &Address) -> String {
    format!("{session_id}.{device}.sshnp{client}")
}

/// Matches any request key for `device`, regardless of which client sent it.
pub fn request_pattern(device: &DeviceName) -> String {
    format!(r"^[0-9a-fA-F-]+\.{}\.sshnp", regex::escape(device.as_str()))
}

/// `<sessionId>.<device>.sshnp<daemon>` (spec.md §6 "response").
pub fn response_key(session_id: SessionId, device: &DeviceName, daemon: &Address) -> String {
    format!("{session_id}.{device}.sshnp{daemon}")
}

/// Shared-key name for the remote username (spec.md §6 "username share").
pub const USERNAME_SHARE_KEY: &str = "username";

/// `device_info.<device>` (spec.md §6 "device info"), published on the
/// daemon's own public board; `watch`'s `address` argument supplies the
/// `<daemon>` side the spec's wire notation writes inline.
pub fn device_info_key(device: &DeviceName) -> String {
    format!("device_info.{device}")
}

/// `heartbeat.<device>` (spec.md §6 "heartbeat").
pub fn heartbeat_key(device: &DeviceName) -> String {
    format!("heartbeat.{device}")
}

/// Directed liveness probe a client sends to one named device.
pub fn ping_key(device: &DeviceName) -> String {
    format!("ping.{device}")
}

pub fn ping_pattern(device: &DeviceName) -> String {
    format!(r"^ping\.{}$", regex::escape(device.as_str()))
}

/// A device's immediate reply to [`ping_key`], announced on its own board.
pub fn pong_key(device: &DeviceName) -> String {
    format!("pong.{device}")
}

/// Matches `device_info`, `heartbeat` and `pong` announcements for any
/// device behind the address being [`Substrate::watch`]ed.
///
/// [`Substrate::watch`]: sshnp_substrate::Substrate::watch
pub fn announcement_pattern() -> &'static str {
    r"^(device_info|heartbeat|pong)\..+$"
}

/// Control message a client sends asking every daemon behind an address to
/// re-announce its `device_info` immediately, since announcements aren't
/// retained by the substrate for late subscribers (spec.md §4.3
/// "Discovery" supplement — the spec's discovery routine otherwise has no
/// way to learn device names it hasn't already seen).
pub const DISCOVER_KEY: &str = "discover";

pub fn discover_pattern() -> &'static str {
    r"^discover$"
}

/// `<device>.sshrvd<client>` (spec.md §6 "rvd request").
pub fn rvd_request_key(device: &DeviceName, client: &Address) -> String {
    format!("{device}.sshrvd{client}")
}

pub fn rvd_request_pattern() -> &'static str {
    r"^.+\.sshrvd.+$"
}

/// Reply channel for one rendezvous allocation request.
pub fn rvd_reply_key(session_id: SessionId) -> String {
    format!("{session_id}.sshrvd")
}
