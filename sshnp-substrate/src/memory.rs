use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use sshnp_common::{Address, PublicKeyRecord};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;

use crate::{Notification, NotificationStream, Substrate, SubstrateError};

const INBOX_CAPACITY: usize = 256;

struct SharedEntry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Registry {
    inboxes: HashMap<Address, broadcast::Sender<Notification>>,
    outboxes: HashMap<Address, broadcast::Sender<Notification>>,
    pubkeys: HashMap<Address, PublicKeyRecord>,
    shared: HashMap<(Address, Address, String), SharedEntry>,
}

/// A shared in-process "network": every [`InMemorySubstrate`] handle minted
/// from the same network can notify/share with every other handle on it.
#[derive(Clone, Default)]
pub struct SubstrateNetwork(Arc<Mutex<Registry>>);

impl SubstrateNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a handle authenticated as `address`, registering its
    /// verification key so other handles on this network can
    /// `fetch_public_key` it.
    pub async fn handle(&self, address: Address, pubkey: PublicKeyRecord) -> InMemorySubstrate {
        let mut reg = self.0.lock().await;
        reg.pubkeys.insert(address.clone(), pubkey);
        reg.inboxes
            .entry(address.clone())
            .or_insert_with(|| broadcast::channel(INBOX_CAPACITY).0);
        InMemorySubstrate {
            network: self.clone(),
            address,
        }
    }
}

/// Reference [`Substrate`] implementation backed entirely by in-process
/// channels and maps, no network I/O. Used by this workspace's own tests and
/// for running a client/daemon/relay trio on one machine without a real
/// substrate deployment (SPEC_FULL.md §1).
#[derive(Clone)]
pub struct InMemorySubstrate {
    network: SubstrateNetwork,
    address: Address,
}

#[async_trait]
impl Substrate for InMemorySubstrate {
    fn address(&self) -> &Address {
        &self.address
    }

    async fn notify(&self, to: &Address, key: &str, value: &str) -> Result<(), SubstrateError> {
        let mut reg = self.network.0.lock().await;
        let sender = reg
            .inboxes
            .entry(to.clone())
            .or_insert_with(|| broadcast::channel(INBOX_CAPACITY).0);
        // A notification with no current subscriber is not an error: it's
        // fire-and-forget, same as the real substrate's push delivery.
        let _ = sender.send(Notification {
            from: self.address.clone(),
            key: key.to_owned(),
            value: value.to_owned(),
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<NotificationStream, SubstrateError> {
        let regex = Regex::new(pattern)?;
        let receiver = {
            let mut reg = self.network.0.lock().await;
            reg.inboxes
                .entry(self.address.clone())
                .or_insert_with(|| broadcast::channel(INBOX_CAPACITY).0)
                .subscribe()
        };
        let stream = BroadcastStream::new(receiver)
            .filter_map(|item| async move { item.ok() })
            .filter(move |n| {
                let matches = regex.is_match(&n.key);
                async move { matches }
            });
        Ok(Box::pin(stream))
    }

    async fn fetch_public_key(&self, address: &Address) -> Result<PublicKeyRecord, SubstrateError> {
        let reg = self.network.0.lock().await;
        reg.pubkeys
            .get(address)
            .cloned()
            .ok_or_else(|| SubstrateError::UnknownPrincipal(address.clone()))
    }

    async fn share(
        &self,
        to: &Address,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), SubstrateError> {
        let mut reg = self.network.0.lock().await;
        reg.shared.insert(
            (to.clone(), self.address.clone(), key.to_owned()),
            SharedEntry {
                value: value.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn fetch_shared(&self, from: &Address, key: &str) -> Result<Option<String>, SubstrateError> {
        let reg = self.network.0.lock().await;
        Ok(reg
            .shared
            .get(&(self.address.clone(), from.clone(), key.to_owned()))
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone()))
    }

    async fn announce(&self, key: &str, value: &str) -> Result<(), SubstrateError> {
        let mut reg = self.network.0.lock().await;
        let sender = reg
            .outboxes
            .entry(self.address.clone())
            .or_insert_with(|| broadcast::channel(INBOX_CAPACITY).0);
        let _ = sender.send(Notification {
            from: self.address.clone(),
            key: key.to_owned(),
            value: value.to_owned(),
        });
        Ok(())
    }

    async fn watch(&self, address: &Address, pattern: &str) -> Result<NotificationStream, SubstrateError> {
        let regex = Regex::new(pattern)?;
        let receiver = {
            let mut reg = self.network.0.lock().await;
            reg.outboxes
                .entry(address.clone())
                .or_insert_with(|| broadcast::channel(INBOX_CAPACITY).0)
                .subscribe()
        };
        let stream = BroadcastStream::new(receiver)
            .filter_map(|item| async move { item.ok() })
            .filter(move |n| {
                let matches = regex.is_match(&n.key);
                async move { matches }
            });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sshnp_common::SigningAlgo;

    use super::*;

    fn test_key() -> PublicKeyRecord {
        PublicKeyRecord {
            algo: SigningAlgo::Ed25519,
            key_bytes: vec![0u8; 32],
        }
    }

    #[tokio::test]
    async fn notify_and_subscribe_round_trip() {
        let network = SubstrateNetwork::new();
        let alice: Address = "@alice".parse().unwrap();
        let bob: Address = "@bob".parse().unwrap();
        let alice_sub = network.handle(alice.clone(), test_key()).await;
        let bob_sub = network.handle(bob.clone(), test_key()).await;

        let mut stream = bob_sub.subscribe(r"^hello\.").await.unwrap();
        alice_sub.notify(&bob, "hello.world", "payload").await.unwrap();

        let notification = stream.next().await.unwrap();
        assert_eq!(notification.from, alice);
        assert_eq!(notification.key, "hello.world");
        assert_eq!(notification.value, "payload");
    }

    #[tokio::test]
    async fn subscribe_pattern_filters_non_matching_keys() {
        let network = SubstrateNetwork::new();
        let alice: Address = "@alice".parse().unwrap();
        let bob: Address = "@bob".parse().unwrap();
        let alice_sub = network.handle(alice.clone(), test_key()).await;
        let bob_sub = network.handle(bob.clone(), test_key()).await;

        let mut stream = bob_sub.subscribe(r"^wanted\.").await.unwrap();
        alice_sub.notify(&bob, "ignored.key", "x").await.unwrap();
        alice_sub.notify(&bob, "wanted.key", "y").await.unwrap();

        let notification = stream.next().await.unwrap();
        assert_eq!(notification.key, "wanted.key");
    }

    #[tokio::test]
    async fn fetch_public_key_returns_registered_key() {
        let network = SubstrateNetwork::new();
        let alice: Address = "@alice".parse().unwrap();
        let bob: Address = "@bob".parse().unwrap();
        let bob_sub = network.handle(bob.clone(), test_key()).await;
        network.handle(alice.clone(), test_key()).await;

        let fetched = bob_sub.fetch_public_key(&alice).await.unwrap();
        assert_eq!(fetched, test_key());
    }

    #[tokio::test]
    async fn fetch_public_key_unknown_principal_errors() {
        let network = SubstrateNetwork::new();
        let bob_sub = network
            .handle("@bob".parse().unwrap(), test_key())
            .await;
        let result = bob_sub.fetch_public_key(&"@ghost".parse().unwrap()).await;
        assert!(matches!(result, Err(SubstrateError::UnknownPrincipal(_))));
    }

    #[tokio::test]
    async fn shared_value_expires_after_ttl() {
        let network = SubstrateNetwork::new();
        let alice: Address = "@alice".parse().unwrap();
        let bob: Address = "@bob".parse().unwrap();
        let alice_sub = network.handle(alice.clone(), test_key()).await;
        let bob_sub = network.handle(bob.clone(), test_key()).await;

        alice_sub
            .share(&bob, "username", "pi", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(
            bob_sub.fetch_shared(&alice, "username").await.unwrap(),
            Some("pi".to_owned())
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(bob_sub.fetch_shared(&alice, "username").await.unwrap(), None);
    }

    #[tokio::test]
    async fn announce_and_watch_round_trip() {
        let network = SubstrateNetwork::new();
        let alice: Address = "@alice".parse().unwrap();
        let bob: Address = "@bob".parse().unwrap();
        let alice_sub = network.handle(alice.clone(), test_key()).await;
        let bob_sub = network.handle(bob.clone(), test_key()).await;

        let mut stream = bob_sub.watch(&alice, r"^device_info$").await.unwrap();
        alice_sub.announce("device_info", "{}").await.unwrap();

        let notification = stream.next().await.unwrap();
        assert_eq!(notification.from, alice);
        assert_eq!(notification.key, "device_info");
        assert_eq!(notification.value, "{}");
    }

    #[tokio::test]
    async fn watch_pattern_filters_non_matching_keys() {
        let network = SubstrateNetwork::new();
        let alice: Address = "@alice".parse().unwrap();
        let bob: Address = "@bob".parse().unwrap();
        let alice_sub = network.handle(alice.clone(), test_key()).await;
        let bob_sub = network.handle(bob.clone(), test_key()).await;

        let mut stream = bob_sub.watch(&alice, r"^heartbeat$").await.unwrap();
        alice_sub.announce("device_info", "{}").await.unwrap();
        alice_sub.announce("heartbeat", "ping").await.unwrap();

        let notification = stream.next().await.unwrap();
        assert_eq!(notification.key, "heartbeat");
    }
}
