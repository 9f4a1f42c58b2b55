//! Subscribes to session requests, authorises the sender, generates
//! ephemeral credentials and bridges the resulting socket onto the
//! device's local sshd (spec.md §4.2).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use sshnp_common::{
    Address, DeviceInfo, Envelope, HashingAlgo, ResponsePayload, ResponseStatus, SessionMode,
    SessionRequest,
};
use sshnp_ssh::{
    bridge_to_local_sshd, generate_ephemeral_keypair, sign_envelope, validate_ssh_public_key_prefix,
    verify_envelope, AuthorizedKeySet, LongTermSigningKey, SshKeyAlgo,
};
use sshnp_substrate::{Notification, Substrate};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::cleanup::SessionGuard;
use crate::config::{DaemonConfig, RENDEZVOUS_TIMEOUT};
use crate::error::SessionError;
use crate::topics;

const CORE_PACKAGE_VERSION: &str = env!("CARGO_PKG_VERSION");
const SUPPORTED_FEATURES: [&str; 2] = ["direct", "reverse"];

/// Daemon-side session handler, one instance per running `npd` process
/// (spec.md §4.2). Owns the device's in-process authorised-key set and the
/// long-term key it signs responses with.
pub struct DaemonController<S: Substrate> {
    substrate: Arc<S>,
    config: DaemonConfig,
    signing_key: LongTermSigningKey,
    authorized_keys: Arc<AuthorizedKeySet>,
    rejected_senders: AtomicU64,
}

impl<S: Substrate + 'static> DaemonController<S> {
    pub fn new(substrate: Arc<S>, config: DaemonConfig, signing_key: LongTermSigningKey) -> Self {
        Self {
            substrate,
            config,
            signing_key,
            authorized_keys: Arc::new(AuthorizedKeySet::new()),
            rejected_senders: AtomicU64::new(0),
        }
    }

    pub fn authorized_keys(&self) -> Arc<AuthorizedKeySet> {
        self.authorized_keys.clone()
    }

    /// Count of requests dropped because the sender wasn't in the
    /// configured allow-list (spec.md §8 scenario 3: "counter increments").
    pub fn rejected_sender_count(&self) -> u64 {
        self.rejected_senders.load(Ordering::SeqCst)
    }

    /// Runs until `shutdown` is cancelled (spec.md §6: "Runs until killed").
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SessionError> {
        if !self.config.hidden {
            self.announce_device_info().await?;
        }

        let mut requests = self
            .substrate
            .subscribe(&topics::request_pattern(&self.config.device))
            .await?;
        let mut pings = self
            .substrate
            .subscribe(&topics::ping_pattern(&self.config.device))
            .await?;
        let mut discovers = self.substrate.subscribe(topics::discover_pattern()).await?;

        let mut heartbeat = tokio::time::interval(crate::config::HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(device = %self.config.device, "daemon shutting down");
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    if !self.config.hidden {
                        if let Err(error) = self.announce_heartbeat().await {
                            warn!(%error, "failed to publish heartbeat");
                        }
                    }
                }
                notification = discovers.next() => {
                    let Some(_notification) = notification else { return Ok(()) };
                    if !self.config.hidden {
                        if let Err(error) = self.announce_device_info().await {
                            warn!(%error, "failed to answer discovery request");
                        }
                    }
                }
                notification = pings.next() => {
                    let Some(_notification) = notification else { return Ok(()) };
                    if let Err(error) = self
                        .substrate
                        .announce(&topics::pong_key(&self.config.device), "")
                        .await
                    {
                        warn!(%error, "failed to answer ping");
                    }
                }
                notification = requests.next() => {
                    let Some(notification) = notification else { return Ok(()) };
                    self.handle_request(notification).await;
                }
            }
        }
    }

    async fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            devicename: self.config.device.to_string(),
            version: CORE_PACKAGE_VERSION.to_string(),
            core_package_version: CORE_PACKAGE_VERSION.to_string(),
            supported_features: SUPPORTED_FEATURES.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn announce_device_info(&self) -> Result<(), SessionError> {
        let json = serde_json::to_string(&self.device_info().await)
            .map_err(|e| SessionError::Remote(e.to_string()))?;
        self.substrate
            .announce(&topics::device_info_key(&self.config.device), &json)
            .await?;
        Ok(())
    }

    async fn announce_heartbeat(&self) -> Result<(), SessionError> {
        let json = serde_json::to_string(&self.device_info().await)
            .map_err(|e| SessionError::Remote(e.to_string()))?;
        self.substrate
            .announce(&topics::heartbeat_key(&self.config.device), &json)
            .await?;
        Ok(())
    }

    /// Steps 1-5 of spec.md §4.2 for one incoming request notification.
    async fn handle_request(&self, notification: Notification) {
        if !self.config.is_allow_listed(&notification.from) {
            self.rejected_senders.fetch_add(1, Ordering::SeqCst);
            debug!(sender = %notification.from, "dropping request from sender outside allow-list");
            return;
        }

        let envelope: Envelope<SessionRequest> = match serde_json::from_str(&notification.value) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "malformed session request, dropping");
                return;
            }
        };

        let client_addr = notification.from.clone();
        let client_key = match self.substrate.fetch_public_key(&client_addr).await {
            Ok(key) => key,
            Err(error) => {
                warn!(%error, "could not fetch requester's public key");
                return;
            }
        };
        if let Err(error) = verify_envelope(&envelope, &client_key) {
            warn!(sender = %client_addr, %error, "session request signature did not verify");
            return;
        }

        let session_id = envelope.payload.session_id;
        let guard = SessionGuard::new(session_id);

        let result = match envelope.payload.mode {
            SessionMode::Direct => self.handle_direct(&envelope.payload, &guard).await,
            SessionMode::Reverse => self.handle_reverse(&envelope.payload, &guard).await,
        };

        let response = match result {
            Ok(payload) => payload,
            Err(error) => {
                warn!(session = %session_id, %error, "session setup failed");
                ResponsePayload {
                    session_id,
                    status: ResponseStatus::Error,
                    message: Some(error.to_string()),
                    ephemeral_private_key: None,
                }
            }
        };

        if let Err(error) = self.publish_response(&client_addr, response).await {
            warn!(session = %session_id, %error, "failed to publish response");
        }

        guard.cleanup().await;
    }

    /// Preferred path (spec.md §4.2 step 3 "Direct"): mints an ephemeral key
    /// pair, authorises its public half locally, dials the rendezvous and
    /// begins the bridge before returning — so by the time the response
    /// reaches the client the daemon's side of the tunnel is already live
    /// (spec.md §5 ordering guarantee).
    async fn handle_direct(
        &self,
        request: &SessionRequest,
        guard: &SessionGuard,
    ) -> Result<ResponsePayload, SessionError> {
        let keypair = generate_ephemeral_keypair(SshKeyAlgo::Ed25519)
            .map_err(|e| SessionError::Remote(e.to_string()))?;

        self.authorized_keys.insert(
            request.session_id,
            keypair.public_openssh.clone(),
            self.config.sshd_port,
            self.config.idle_timeout,
        );
        self.register_authorized_key_cleanup(request.session_id, guard);

        let rvd_nonce = request
            .rvd_nonce
            .clone()
            .ok_or_else(|| SessionError::Remote("direct mode request missing rvd_nonce".into()))?;
        let rvd_addr: SocketAddr = format!("{}:{}", request.host, request.port)
            .parse()
            .map_err(|_| SessionError::Remote("malformed rendezvous address in request".into()))?;

        let mut transport = tokio::time::timeout(RENDEZVOUS_TIMEOUT, TcpStream::connect(rvd_addr))
            .await
            .map_err(|_| SessionError::Timeout("rendezvous dial"))??;

        let auth_envelope = sign_envelope(
            &self.signing_key,
            HashingAlgo::Sha256,
            sshnp_common::AuthPayload {
                rvd_nonce,
                session_id: request.session_id,
                client_nonce: None,
            },
        )
        .map_err(|e| SessionError::Remote(e.to_string()))?;
        let mut line = serde_json::to_string(&auth_envelope).map_err(|e| SessionError::Remote(e.to_string()))?;
        line.push('\n');
        transport.write_all(line.as_bytes()).await?;

        let sshd_port = self.config.sshd_port;
        let session_id = request.session_id;
        tokio::spawn(async move {
            if let Err(error) = bridge_to_local_sshd(transport, sshd_port).await {
                debug!(session = %session_id, %error, "direct-mode bridge to local sshd ended");
            }
        });

        Ok(ResponsePayload {
            session_id: request.session_id,
            status: ResponseStatus::Ok,
            message: None,
            ephemeral_private_key: Some(keypair.private_openssh),
        })
    }

    /// Legacy path (spec.md §4.2 step 3 "Reverse"): authorises the client's
    /// already-generated public key, then dials back to the client's host
    /// and bridges onto the local sshd, the same way [`Self::handle_direct`]
    /// bridges its rendezvous socket.
    async fn handle_reverse(
        &self,
        request: &SessionRequest,
        guard: &SessionGuard,
    ) -> Result<ResponsePayload, SessionError> {
        let public_key = request
            .ephemeral_public_key
            .clone()
            .ok_or_else(|| SessionError::Remote("reverse mode request missing ephemeral_public_key".into()))?;
        validate_ssh_public_key_prefix(&public_key).map_err(SessionError::Auth)?;

        self.authorized_keys.insert(
            request.session_id,
            public_key,
            self.config.sshd_port,
            self.config.idle_timeout,
        );
        self.register_authorized_key_cleanup(request.session_id, guard);

        let target: SocketAddr = format!("{}:{}", request.host, request.port)
            .parse()
            .map_err(|_| SessionError::Remote("malformed client host/port in reverse request".into()))?;

        let transport = tokio::time::timeout(RENDEZVOUS_TIMEOUT, TcpStream::connect(target))
            .await
            .map_err(|_| SessionError::Timeout("reverse dial to client host"))??;

        let sshd_port = self.config.sshd_port;
        let session_id = request.session_id;
        tokio::spawn(async move {
            if let Err(error) = bridge_to_local_sshd(transport, sshd_port).await {
                debug!(session = %session_id, %error, "reverse-mode bridge to local sshd ended");
            }
        });

        Ok(ResponsePayload {
            session_id: request.session_id,
            status: ResponseStatus::Ok,
            message: Some("connected".into()),
            ephemeral_private_key: None,
        })
    }

    fn register_authorized_key_cleanup(&self, session_id: sshnp_common::SessionId, guard: &SessionGuard) {
        let authorized_keys = self.authorized_keys.clone();
        guard.register(async move {
            authorized_keys.remove_session(session_id);
        });
    }

    async fn publish_response(&self, client: &Address, payload: ResponsePayload) -> Result<(), SessionError> {
        let session_id = payload.session_id;
        let envelope = sign_envelope(&self.signing_key, HashingAlgo::Sha256, payload)
            .map_err(|e| SessionError::Remote(e.to_string()))?;
        let json = serde_json::to_string(&envelope).map_err(|e| SessionError::Remote(e.to_string()))?;
        let key = topics::response_key(session_id, &self.config.device, self.substrate.address());
        self.substrate.notify(client, &key, &json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use sshnp_common::{DeviceName, SigningAlgo};
    use sshnp_substrate::SubstrateNetwork;

    use super::*;
    use crate::config::{DEFAULT_IDLE_TIMEOUT, DEFAULT_SHARED_KEY_TTL};

    fn signing_key() -> LongTermSigningKey {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        LongTermSigningKey::Ed25519(Box::new(ed25519_dalek::SigningKey::generate(&mut rng)))
    }

    fn config(device: &str, manager: Vec<Address>, sshd_port: u16) -> DaemonConfig {
        DaemonConfig {
            atsign: "@device".parse().unwrap(),
            manager,
            device: DeviceName::new(device).unwrap(),
            sshd_port,
            hidden: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            shared_key_ttl: DEFAULT_SHARED_KEY_TTL,
        }
    }

    #[tokio::test]
    async fn requests_outside_allow_list_are_rejected_and_counted() {
        let network = SubstrateNetwork::new();
        let key = signing_key();
        let daemon_addr: Address = "@device".parse().unwrap();
        let substrate = network.handle(daemon_addr, key.public_key_record()).await;
        let controller = DaemonController::new(
            Arc::new(substrate),
            config("office", vec!["@owner".parse().unwrap()], 22),
            key,
        );

        let notification = Notification {
            from: "@intruder".parse().unwrap(),
            key: "whatever".into(),
            value: "not even valid json".into(),
        };

        assert_eq!(controller.rejected_sender_count(), 0);
        controller.handle_request(notification).await;
        assert_eq!(controller.rejected_sender_count(), 1);
    }

    #[tokio::test]
    async fn direct_mode_session_authorises_ephemeral_key_and_bridges() {
        let network = SubstrateNetwork::new();
        let daemon_key = signing_key();
        let daemon_addr: Address = "@device".parse().unwrap();
        let substrate = network.handle(daemon_addr, daemon_key.public_key_record()).await;

        let sshd = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let sshd_port = sshd.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = sshd.accept().await;
        });

        let rvd = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let rvd_port = rvd.local_addr().unwrap().port();
        let rvd_task = tokio::spawn(async move { rvd.accept().await });

        let controller = DaemonController::new(
            Arc::new(substrate),
            config("office", vec![], sshd_port),
            daemon_key,
        );

        let request = SessionRequest {
            session_id: sshnp_common::SessionId::new(),
            mode: SessionMode::Direct,
            host: "127.0.0.1".into(),
            port: rvd_port,
            ephemeral_public_key: None,
            remote_forward_port: None,
            auth_hints: Default::default(),
            rvd_nonce: Some("nonce".into()),
        };
        let guard = SessionGuard::new(request.session_id);

        let response = tokio::time::timeout(Duration::from_secs(2), controller.handle_direct(&request, &guard))
            .await
            .expect("handle_direct should not hang")
            .expect("handle_direct should succeed");

        assert_eq!(response.status, ResponseStatus::Ok);
        assert!(response.ephemeral_private_key.is_some());
        assert_eq!(controller.authorized_keys().len(), 1);

        rvd_task.await.unwrap().unwrap();
    }
}
