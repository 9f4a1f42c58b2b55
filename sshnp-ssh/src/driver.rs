use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::PrivateKey;
use russh::ChannelMsg;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::*;

use crate::error::AuthError;

/// How the orchestrator drives the post-establishment SSH session, selected
/// by the client's `sshClient ∈ {exec, dart}` configuration (spec.md §4.3).
/// The actual SSH server/client implementation behind either variant is an
/// external library (spec.md §1 "OUT OF SCOPE ... referenced only by
/// interface"); this trait is that interface boundary.
#[async_trait]
pub trait SshDriver: Send + Sync {
    /// Bridges `listener` (already bound by the caller — spec.md §8:
    /// `localPort=0` must resolve to a real port before the session request
    /// is published, which is earlier than this call) to the device's SSH
    /// service over `transport`, returning the bound port.
    async fn bridge(&self, transport: TcpStream, listener: TcpListener) -> std::io::Result<u16>;
}

/// Default driver (spec.md §4.3 step 6): prints an `ssh` command line
/// pointing at a local TCP bridge and leaves actually invoking `ssh` to the
/// caller/wrapper script. `bridge` here only forwards raw bytes between the
/// already-bound `listener` and `transport` — it does not speak SSH itself,
/// matching spec.md's "emit an ssh command line" wording rather than
/// embedding a client.
pub struct ExecSshDriver;

#[async_trait]
impl SshDriver for ExecSshDriver {
    async fn bridge(&self, transport: TcpStream, listener: TcpListener) -> std::io::Result<u16> {
        let bound_port = listener.local_addr()?.port();

        tokio::spawn(async move {
            match listener.accept().await {
                Ok((mut local, peer)) => {
                    debug!(%peer, "local ssh client connected, bridging to rendezvous socket");
                    let mut transport = transport;
                    if let Err(error) = tokio::io::copy_bidirectional(&mut local, &mut transport).await {
                        warn!(%error, "bridge closed with error");
                    }
                }
                Err(error) => warn!(%error, "failed to accept local ssh client"),
            }
        });

        Ok(bound_port)
    }
}

/// Alternative driver for callers that want a library-only path with no
/// `ssh` subprocess: drives `transport` with the embedded SSH client
/// directly and exposes a local TCP listener backed by a `direct-tcpip`
/// channel to the device's sshd, rather than raw byte forwarding.
pub struct EmbeddedSshDriver {
    username: String,
    private_key: Arc<PrivateKey>,
    sshd_port: u16,
}

impl EmbeddedSshDriver {
    pub fn new(username: String, private_key: Arc<PrivateKey>, sshd_port: u16) -> Self {
        Self {
            username,
            private_key,
            sshd_port,
        }
    }
}

struct AcceptAllHostKeys;

#[async_trait]
impl client::Handler for AcceptAllHostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // The tunnel's endpoint authenticity is already established by the
        // signed rendezvous handshake (spec.md §4.4); the SSH host key
        // check here is a second, independent layer rather than the trust
        // anchor, so an already-authenticated socket is accepted.
        Ok(true)
    }
}

#[async_trait]
impl SshDriver for EmbeddedSshDriver {
    async fn bridge(&self, transport: TcpStream, listener: TcpListener) -> std::io::Result<u16> {
        let config = Arc::new(client::Config::default());
        let mut session: Handle<AcceptAllHostKeys> =
            client::connect_stream(config, transport, AcceptAllHostKeys)
                .await
                .map_err(to_io_error)?;

        let authenticated = session
            .authenticate_publickey(&self.username, self.private_key.clone())
            .await
            .map_err(to_io_error)?;
        if !authenticated.success() {
            return Err(to_io_error(AuthError::SignatureMismatch));
        }

        let bound_port = listener.local_addr()?.port();
        let sshd_port = self.sshd_port;

        tokio::spawn(async move {
            loop {
                let (local, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(error) => {
                        warn!(%error, "embedded driver listener closed");
                        return;
                    }
                };
                debug!(%peer, "opening direct-tcpip channel for local client");
                let channel = match session
                    .channel_open_direct_tcpip("127.0.0.1", sshd_port as u32, "127.0.0.1", 0)
                    .await
                {
                    Ok(channel) => channel,
                    Err(error) => {
                        warn!(%error, "direct-tcpip channel open failed");
                        continue;
                    }
                };
                tokio::spawn(pump_channel(channel, local));
            }
        });

        Ok(bound_port)
    }
}

async fn pump_channel(mut channel: russh::Channel<client::Msg>, mut local: TcpStream) {
    let (mut read_half, mut write_half) = local.split();
    let mut buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            n = read_half.read(&mut buf) => {
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if channel.data(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if write_half.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }
        }
    }
    let _ = channel.close().await;
}

fn to_io_error(error: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(error.to_string())
}

/// Dials the device's local sshd and full-duplex copies bytes between it and
/// `transport` until either side closes (spec.md §4.2 steps 3-4: once the
/// daemon's rendezvous/reverse socket is established, it is simply bridged
/// onto `localhost:<sshd_port>`; the daemon never itself speaks SSH).
pub async fn bridge_to_local_sshd(mut transport: TcpStream, sshd_port: u16) -> std::io::Result<()> {
    let addr: SocketAddr = ([127, 0, 0, 1], sshd_port).into();
    let mut sshd = TcpStream::connect(addr).await?;
    tokio::io::copy_bidirectional(&mut transport, &mut sshd).await?;
    Ok(())
}
