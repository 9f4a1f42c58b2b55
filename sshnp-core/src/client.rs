//! Session Orchestrator: the client-side half of session establishment
//! (spec.md §4.3).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use sshnp_common::{
    Address, Envelope, HashingAlgo, RendezvousAllocation, ResponseStatus, RvdRequest, SessionId,
    SessionMode, SessionRequest,
};
use sshnp_common::ResponsePayload;
use sshnp_ssh::{generate_ephemeral_keypair, load_keypair_from_file, sign_envelope, verify_envelope, SshDriver};
use sshnp_substrate::Substrate;
use tokio::net::{TcpListener, TcpStream};
use tracing::*;

use crate::cleanup::SessionGuard;
use crate::config::{ClientConfig, RENDEZVOUS_TIMEOUT, RESPONSE_TIMEOUT};
use crate::error::SessionError;
use crate::topics;

/// Outcome of a completed session establishment (spec.md §4.3 step 6: "Emit
/// an `ssh` command line").
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub local_port: u16,
    pub remote_username: String,
    pub ssh_command: String,
}

/// Client-side session state machine (spec.md §4.3). One instance per `np`
/// invocation.
pub struct SessionOrchestrator<S: Substrate> {
    substrate: Arc<S>,
    config: ClientConfig,
    signing_key: sshnp_ssh::LongTermSigningKey,
    ssh_driver: Arc<dyn SshDriver>,
}

impl<S: Substrate + 'static> SessionOrchestrator<S> {
    pub fn new(
        substrate: Arc<S>,
        config: ClientConfig,
        signing_key: sshnp_ssh::LongTermSigningKey,
        ssh_driver: Arc<dyn SshDriver>,
    ) -> Self {
        Self {
            substrate,
            config,
            signing_key,
            ssh_driver,
        }
    }

    /// Runs the full 7-step algorithm (spec.md §4.3); cleans up and
    /// propagates on any failure (step 7).
    pub async fn run(&self) -> Result<SessionOutcome, SessionError> {
        let session_id = SessionId::new();
        let guard = SessionGuard::new(session_id);
        let result = self.run_inner(session_id, &guard).await;
        if result.is_err() {
            guard.cleanup().await;
        }
        result
    }

    async fn run_inner(&self, session_id: SessionId, guard: &SessionGuard) -> Result<SessionOutcome, SessionError> {
        // Step 1: preconditions.
        self.substrate.fetch_public_key(&self.config.daemon_address).await?;
        let response_key = topics::response_key(session_id, &self.config.device, &self.config.daemon_address);
        let mut responses = self
            .substrate
            .subscribe(&format!("^{}$", regex::escape(&response_key)))
            .await?;
        let remote_username = match &self.config.remote_username {
            Some(username) => username.clone(),
            None => self.resolve_remote_username().await?,
        };

        // `localPort=0` must resolve to a real bound port before the request
        // is published, not merely before the caller's `ssh` invocation
        // (spec.md §8 boundary behaviour). Binding it here, ahead of step 4,
        // also means `local_port` is already final when it's printed in the
        // step-6 `ssh` command line.
        let local_listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.local_port)).await?;
        let local_port = local_listener.local_addr()?.port();

        // Step 2: optional rendezvous allocation.
        let mut allocation: Option<RendezvousAllocation> = None;
        let (mode, host, port, rvd_nonce) = if let Ok(rvd_address) = self.config.host.parse::<Address>() {
            let alloc = self.request_rendezvous(session_id, &rvd_address).await?;
            let tuple = (SessionMode::Direct, alloc.ip.to_string(), alloc.port_b, Some(alloc.nonce.clone()));
            allocation = Some(alloc);
            tuple
        } else {
            (SessionMode::Reverse, self.config.host.clone(), self.config.port, None)
        };

        // Reverse mode: the client must be listening before the request is
        // published, since the daemon dials in while handling the request,
        // before replying (spec.md §5 ordering guarantee).
        let reverse_listener = if mode == SessionMode::Reverse {
            Some(TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?)
        } else {
            None
        };

        // Step 3: ephemeral key pair for this session, unless the caller
        // supplied a fixed identity file (spec.md §6 `--identity-file`).
        let own_keypair = match &self.config.identity_file {
            Some(path) => load_keypair_from_file(path).map_err(|e| SessionError::Remote(e.to_string()))?,
            None => generate_ephemeral_keypair(self.config.ssh_algo.into())
                .map_err(|e| SessionError::Remote(e.to_string()))?,
        };

        // Step 4: publish request, await response.
        let request = SessionRequest {
            session_id,
            mode,
            host,
            port,
            ephemeral_public_key: Some(own_keypair.public_openssh.clone()),
            remote_forward_port: None,
            auth_hints: HashMap::new(),
            rvd_nonce,
        };
        let envelope = sign_envelope(&self.signing_key, HashingAlgo::Sha256, request)
            .map_err(|e| SessionError::Remote(e.to_string()))?;
        let json = serde_json::to_string(&envelope).map_err(|e| SessionError::Remote(e.to_string()))?;
        let request_key = topics::request_key(session_id, &self.config.device, self.substrate.address());
        self.substrate
            .notify(&self.config.daemon_address, &request_key, &json)
            .await?;

        let notification = tokio::time::timeout(RESPONSE_TIMEOUT, responses.next())
            .await
            .map_err(|_| SessionError::Timeout("daemon response"))?
            .ok_or_else(|| SessionError::Remote("response subscription ended".into()))?;
        let response_envelope: Envelope<ResponsePayload> = serde_json::from_str(&notification.value)
            .map_err(|e| SessionError::Remote(e.to_string()))?;
        let daemon_key = self.substrate.fetch_public_key(&self.config.daemon_address).await?;
        verify_envelope(&response_envelope, &daemon_key)?;

        match &response_envelope.payload.status {
            ResponseStatus::Ok => {}
            ResponseStatus::Error => {
                return Err(SessionError::Remote(
                    response_envelope.payload.message.clone().unwrap_or_default(),
                ))
            }
            ResponseStatus::Unsupported(status) => {
                return Err(SessionError::Remote(format!("unsupported response status: {status}")))
            }
        }

        let identity = response_envelope
            .payload
            .ephemeral_private_key
            .as_ref()
            .map(|secret| secret.expose_secret().clone())
            .unwrap_or_else(|| own_keypair.private_openssh.expose_secret().clone());

        // The identity file handed to the printed `ssh` command: the
        // caller's own `--identity-file`, if given, is used as-is and is
        // not ours to delete; otherwise the resolved identity (which may
        // be the daemon's reverse-mode private key, not our own) is
        // written under a per-session scratch directory that the cleanup
        // guard removes regardless of outcome (spec.md §3, §6).
        let identity_path = match &self.config.identity_file {
            Some(path) => path.clone(),
            None => {
                let dir = session_identity_dir(session_id)?;
                let path = dir.join("id_ephemeral");
                write_identity_file(&path, &identity)?;
                let cleanup_dir = dir.clone();
                guard.register(async move {
                    let _ = tokio::fs::remove_dir_all(&cleanup_dir).await;
                });
                path
            }
        };

        // Step 5: bridge the established transport to a local port.
        let transport = match (mode, allocation, reverse_listener) {
            (SessionMode::Direct, Some(allocation), _) => {
                self.dial_rendezvous(session_id, &allocation).await?
            }
            (SessionMode::Reverse, _, Some(listener)) => {
                let (transport, peer) = tokio::time::timeout(RESPONSE_TIMEOUT, listener.accept())
                    .await
                    .map_err(|_| SessionError::Timeout("reverse connection from daemon"))??;
                debug!(%peer, "daemon connected for reverse session");
                transport
            }
            _ => unreachable!("mode and its matching transport source are always set together"),
        };

        self.ssh_driver.bridge(transport, local_listener).await?;

        // Step 6: emit an ssh command line.
        let ssh_command = format!(
            "ssh -p {local_port} -i {} {remote_username}@localhost",
            identity_path.display()
        );

        Ok(SessionOutcome {
            session_id,
            local_port,
            remote_username,
            ssh_command,
        })
    }

    async fn resolve_remote_username(&self) -> Result<String, SessionError> {
        self.substrate
            .fetch_shared(&self.config.daemon_address, topics::USERNAME_SHARE_KEY)
            .await?
            .ok_or_else(|| {
                SessionError::Remote(
                    "no shared remote username available; pass --remote-username".into(),
                )
            })
    }

    async fn request_rendezvous(
        &self,
        session_id: SessionId,
        rvd_address: &Address,
    ) -> Result<RendezvousAllocation, SessionError> {
        let reply_key = topics::rvd_reply_key(session_id);
        let mut replies = self
            .substrate
            .subscribe(&format!("^{}$", regex::escape(&reply_key)))
            .await?;

        let request_key = topics::rvd_request_key(&self.config.device, self.substrate.address());
        let payload = RvdRequest {
            session_id,
            daemon_address: self.config.daemon_address.clone(),
        };
        let value = serde_json::to_string(&payload).map_err(|e| SessionError::Remote(e.to_string()))?;
        self.substrate.notify(rvd_address, &request_key, &value).await?;

        let notification = tokio::time::timeout(RENDEZVOUS_TIMEOUT, replies.next())
            .await
            .map_err(|_| SessionError::Timeout("rendezvous allocation"))?
            .ok_or_else(|| SessionError::Remote("rendezvous reply subscription ended".into()))?;

        notification
            .value
            .parse::<RendezvousAllocation>()
            .map_err(|e| SessionError::Remote(e.to_string()))
    }

    /// Dials the rendezvous's client-facing port and presents this
    /// principal's auth envelope (spec.md §4.3 step 5).
    async fn dial_rendezvous(
        &self,
        session_id: SessionId,
        allocation: &RendezvousAllocation,
    ) -> Result<TcpStream, SessionError> {
        use tokio::io::AsyncWriteExt;

        let mut transport = TcpStream::connect((allocation.ip, allocation.port_a)).await?;
        let auth_envelope = sign_envelope(
            &self.signing_key,
            HashingAlgo::Sha256,
            sshnp_common::AuthPayload {
                rvd_nonce: allocation.nonce.clone(),
                session_id,
                client_nonce: None,
            },
        )
        .map_err(|e| SessionError::Remote(e.to_string()))?;
        let mut line = serde_json::to_string(&auth_envelope).map_err(|e| SessionError::Remote(e.to_string()))?;
        line.push('\n');
        transport.write_all(line.as_bytes()).await?;
        Ok(transport)
    }
}

/// Per-session scratch directory for the generated identity file (spec.md
/// §6: `$HOME/.sshnp/<sessionId>/`). Falls back to the system temp
/// directory if `$HOME` isn't set.
fn session_identity_dir(session_id: SessionId) -> Result<PathBuf, SessionError> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let dir = home.join(".sshnp").join(session_id.to_string());
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Writes the session's identity private key to `path` with owner-only
/// permissions, mirroring an `ssh -i` identity file on disk.
fn write_identity_file(path: &Path, private_openssh: &str) -> Result<(), SessionError> {
    std::fs::write(path, private_openssh)?;
    restrict_permissions(path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), SessionError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), SessionError> {
    Ok(())
}
