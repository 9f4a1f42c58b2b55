//! A trait modeling the identity/messaging substrate this system rides on
//! (spec.md §1 "Out of scope"): encrypted notifications plus a recipient-
//! scoped key-value store, keyed by `<from>:<key>.<namespace>@<to>`. The
//! wire format and transport are an external collaborator; this crate only
//! fixes the interface both the client and daemon program against, plus an
//! in-memory reference implementation for tests and local multi-process
//! demos (SPEC_FULL.md §1).

mod memory;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use sshnp_common::{Address, PublicKeyRecord};

pub use memory::{InMemorySubstrate, SubstrateNetwork};

/// One notification delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Notification {
    pub from: Address,
    pub key: String,
    pub value: String,
}

pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    #[error("no public key on record for {0}")]
    UnknownPrincipal(Address),
    #[error("invalid subscription pattern: {0}")]
    BadPattern(#[from] regex::Error),
    #[error("substrate I/O error: {0}")]
    Io(String),
}

/// The black-box substrate interface: `notify(key, value)` and
/// `subscribe(regex) → stream` (spec.md §1), plus a public-key directory and
/// a short-lived shared-key store (spec.md §3 remote-username sharing,
/// §9 Open Question on shared-key TTL).
#[async_trait]
pub trait Substrate: Send + Sync {
    /// The address this substrate handle is authenticated as.
    fn address(&self) -> &Address;

    /// Sends an encrypted notification to `to`, addressed under `key`.
    async fn notify(&self, to: &Address, key: &str, value: &str) -> Result<(), SubstrateError>;

    /// Subscribes to every notification addressed to this substrate's own
    /// address whose key matches `pattern`.
    async fn subscribe(&self, pattern: &str) -> Result<NotificationStream, SubstrateError>;

    /// Fetches `address`'s long-term verification key. Implementations are
    /// expected to cache this per address (spec.md §4.4).
    async fn fetch_public_key(&self, address: &Address) -> Result<PublicKeyRecord, SubstrateError>;

    /// Shares a value with `to`, expiring after `ttl` (spec.md §3 username
    /// sharing; TTL default is this system's resolved Open Question, see
    /// SPEC_FULL.md §3).
    async fn share(
        &self,
        to: &Address,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), SubstrateError>;

    /// Reads back a value shared with this substrate's own address under
    /// `key`, or `None` if absent or expired.
    async fn fetch_shared(&self, from: &Address, key: &str) -> Result<Option<String>, SubstrateError>;

    /// Publishes a value under this substrate's own address's public
    /// board, e.g. `device_info`/`heartbeat` (spec.md §4.2, §6: "public-
    /// shared"). Unlike [`notify`](Substrate::notify), announcements have
    /// no single recipient — anyone can [`watch`](Substrate::watch) them.
    async fn announce(&self, key: &str, value: &str) -> Result<(), SubstrateError>;

    /// Subscribes to `address`'s public announcements whose key matches
    /// `pattern`, without needing a prior directed exchange with that
    /// address (spec.md §4.3 "Discovery").
    async fn watch(&self, address: &Address, pattern: &str) -> Result<NotificationStream, SubstrateError>;
}
