use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::session::SessionId;

/// Which path the daemon should use to complete the session (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Preferred: daemon dials the rendezvous relay with an ephemeral key.
    Direct,
    /// Legacy: daemon dials back to the client's host directly.
    Reverse,
}

/// Client → daemon request record (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: SessionId,
    pub mode: SessionMode,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ephemeral_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub remote_forward_port: Option<u16>,
    #[serde(default)]
    pub auth_hints: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rvd_nonce: Option<String>,
}

/// Client → rendezvous allocation request (spec.md §6: "rvd request ...
/// value = sessionId").
///
/// The literal spec wire value is a bare `sessionId` string; that alone
/// doesn't give the relay enough to resolve the daemon's verification key,
/// so this carries `daemon_address` alongside it rather than the relay
/// having to guess it from the request's routing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RvdRequest {
    pub session_id: SessionId,
    pub daemon_address: Address,
}
