use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use data_encoding::{BASE64, HEXLOWER};
use futures::StreamExt;
use rand::RngCore;
use sshnp_common::{
    get_crypto_rng, Address, Envelope, PublicKeyRecord, RendezvousAllocation, RvdRequest,
    SessionId,
};
use sshnp_ssh::{verify_envelope, AuthError};
use sshnp_substrate::Substrate;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::*;

use sshnp_common::AuthPayload;

use crate::topics;

/// Timeout from `ALLOCATED` to `BOTH_AUTHED` (spec.md §4.1).
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-direction buffer for the splice, `≥64 KiB` per spec.md §4.1.
const SPLICE_BUFFER: usize = 64 * 1024;
const MAX_AUTH_LINE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no ports available for allocation")]
    Exhausted,
    #[error("client or daemon address could not be resolved to a verification key")]
    UnknownPeers,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("rendezvous auth timed out waiting for both sides")]
    Timeout,
}

/// Lifecycle of one rendezvous allocation (spec.md §4.1):
/// `ALLOCATED → ONE_SIDE_AUTHED → BOTH_AUTHED → CLOSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Allocated,
    OneSideAuthed,
    BothAuthed,
    Closed,
}

/// A public relay that allocates a pair of TCP ports per session and
/// splices the two resulting authenticated sockets (spec.md §4.1). Each
/// allocation is independent; the relay hosts an unbounded number
/// concurrently, bounded only by file-descriptor and port availability
/// (spec.md §5 "Concurrency").
pub struct Relay {
    bind_ip: IpAddr,
    snoop: bool,
    auth_failures: Arc<AtomicU64>,
    allocations: Arc<Mutex<HashMap<SessionId, Arc<StdMutex<AllocationState>>>>>,
}

impl Relay {
    pub fn new(bind_ip: IpAddr, snoop: bool) -> Self {
        Self {
            bind_ip,
            snoop,
            auth_failures: Arc::new(AtomicU64::new(0)),
            allocations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn auth_failure_count(&self) -> u64 {
        self.auth_failures.load(Ordering::SeqCst)
    }

    /// Current lifecycle state of a still-tracked allocation (spec.md §4.1
    /// state machine); `None` once it has been reaped after `CLOSED`.
    pub async fn allocation_state(&self, session_id: SessionId) -> Option<AllocationState> {
        let allocations = self.allocations.lock().await;
        allocations
            .get(&session_id)
            .map(|state| *state.lock().expect("allocation state mutex poisoned"))
    }

    /// `REQUEST_SESSION` (spec.md §4.1): binds two ephemeral TCP listeners,
    /// mints a fresh `rvd_nonce`, and spawns the background task that
    /// carries the allocation through its state machine. Returns
    /// immediately with the allocation once both listeners are bound.
    pub async fn request_session(
        &self,
        session_id: SessionId,
        client_addr: Address,
        client_key: PublicKeyRecord,
        daemon_addr: Address,
        daemon_key: PublicKeyRecord,
    ) -> Result<RendezvousAllocation, RelayError> {
        let listener_a = TcpListener::bind((self.bind_ip, 0))
            .await
            .map_err(|_| RelayError::Exhausted)?;
        let listener_b = TcpListener::bind((self.bind_ip, 0))
            .await
            .map_err(|_| RelayError::Exhausted)?;
        let port_a = listener_a.local_addr()?.port();
        let port_b = listener_b.local_addr()?.port();
        let nonce = generate_nonce();

        let allocation = RendezvousAllocation {
            ip: self.bind_ip,
            port_a,
            port_b,
            nonce: nonce.clone(),
        };

        let snoop = self.snoop;
        let auth_failures = self.auth_failures.clone();
        let state = Arc::new(StdMutex::new(AllocationState::Allocated));
        self.allocations.lock().await.insert(session_id, state.clone());

        tokio::spawn(run_allocation(
            AllocationContext {
                session_id,
                client_addr,
                client_key,
                daemon_addr,
                daemon_key,
                nonce,
                listener_a,
                listener_b,
                snoop,
                auth_failures,
            },
            state,
            self.allocations.clone(),
        ));

        Ok(allocation)
    }
}

/// Runs the relay's substrate-facing control loop: subscribes to
/// `<device>.sshrvd<client>` requests (spec.md §6 "rvd request") addressed
/// to this relay, resolves both principals' verification keys, allocates a
/// session via [`Relay::request_session`], and replies with the wire
/// allocation string on `<sessionId>.sshrvd` (spec.md §3, §6).
///
/// A request whose addresses don't resolve is dropped with a warning rather
/// than replied to — the client's own rendezvous-allocation wait times out
/// the same way a dropped daemon request does (spec.md §7 propagation
/// policy).
pub async fn serve_rendezvous_requests<S: Substrate + 'static>(
    relay: Arc<Relay>,
    substrate: Arc<S>,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    let mut requests = substrate.subscribe(topics::rvd_request_pattern()).await?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            notification = requests.next() => {
                let Some(notification) = notification else { return Ok(()) };
                let relay = relay.clone();
                let substrate = substrate.clone();
                tokio::spawn(async move {
                    if let Err(error) = handle_rvd_request(&relay, substrate.as_ref(), notification).await {
                        warn!(%error, "rendezvous allocation request failed");
                    }
                });
            }
        }
    }
}

async fn handle_rvd_request<S: Substrate>(
    relay: &Relay,
    substrate: &S,
    notification: sshnp_substrate::Notification,
) -> Result<(), RelayError> {
    let request: RvdRequest = serde_json::from_str(&notification.value)
        .map_err(|e| RelayError::Auth(AuthError::MalformedKey(e.to_string())))?;

    let client_addr = notification.from.clone();
    let client_key = substrate
        .fetch_public_key(&client_addr)
        .await
        .map_err(|_| RelayError::UnknownPeers)?;
    let daemon_key = substrate
        .fetch_public_key(&request.daemon_address)
        .await
        .map_err(|_| RelayError::UnknownPeers)?;

    let allocation = relay
        .request_session(
            request.session_id,
            client_addr.clone(),
            client_key,
            request.daemon_address,
            daemon_key,
        )
        .await?;

    substrate
        .notify(&client_addr, &topics::rvd_reply_key(request.session_id), &allocation.to_string())
        .await
        .map_err(|e| RelayError::Io(std::io::Error::other(e.to_string())))?;

    Ok(())
}

fn generate_nonce() -> String {
    let mut rng = get_crypto_rng();
    let mut bytes = [0u8; 18]; // ≥128 bits, per spec.md §4.1
    rng.fill_bytes(&mut bytes);
    BASE64.encode(&bytes)
}

struct AllocationContext {
    session_id: SessionId,
    client_addr: Address,
    client_key: PublicKeyRecord,
    daemon_addr: Address,
    daemon_key: PublicKeyRecord,
    nonce: String,
    listener_a: TcpListener,
    listener_b: TcpListener,
    snoop: bool,
    auth_failures: Arc<AtomicU64>,
}

async fn run_allocation(
    ctx: AllocationContext,
    state: Arc<StdMutex<AllocationState>>,
    allocations: Arc<Mutex<HashMap<SessionId, Arc<StdMutex<AllocationState>>>>>,
) {
    let session_id = ctx.session_id;

    let client_side = async {
        let result = accept_and_auth(ctx.listener_a, session_id, ctx.nonce.clone(), ctx.client_key).await;
        if result.is_ok() {
            *state.lock().expect("allocation state mutex poisoned") = AllocationState::OneSideAuthed;
        }
        result
    };
    let daemon_side = async {
        let result = accept_and_auth(ctx.listener_b, session_id, ctx.nonce.clone(), ctx.daemon_key).await;
        if result.is_ok() {
            *state.lock().expect("allocation state mutex poisoned") = AllocationState::OneSideAuthed;
        }
        result
    };

    let result = tokio::time::timeout(AUTH_TIMEOUT, futures::future::try_join(client_side, daemon_side)).await;

    match result {
        Ok(Ok((client_sock, daemon_sock))) => {
            *state.lock().expect("allocation state mutex poisoned") = AllocationState::BothAuthed;
            debug!(session = %session_id, "both sides authenticated (BOTH_AUTHED), splicing");
            if let Err(error) = splice(client_sock, daemon_sock, ctx.snoop).await {
                debug!(session = %session_id, %error, "splice ended");
            }
        }
        Ok(Err(error)) => {
            ctx.auth_failures.fetch_add(1, Ordering::SeqCst);
            warn!(session = %session_id, daemon = %ctx.daemon_addr, client = %ctx.client_addr, %error, "rendezvous auth failed, tearing down allocation");
        }
        Err(_) => {
            debug!(session = %session_id, "rendezvous allocation timed out before BOTH_AUTHED, closing both listeners");
        }
    }

    *state.lock().expect("allocation state mutex poisoned") = AllocationState::Closed;
    allocations.lock().await.remove(&session_id);
}

async fn accept_and_auth(
    listener: TcpListener,
    expected_session: SessionId,
    expected_nonce: String,
    expected_key: PublicKeyRecord,
) -> Result<TcpStream, RelayError> {
    // Each listener accepts exactly one inbound connection, then the
    // listener (and its bound port) is dropped at the end of this
    // function's scope (spec.md §4.1).
    let (mut stream, _peer) = listener.accept().await?;
    let envelope = read_auth_envelope(&mut stream).await?;

    if envelope.payload.session_id != expected_session {
        return Err(AuthError::SessionMismatch.into());
    }
    if envelope.payload.rvd_nonce != expected_nonce {
        return Err(AuthError::NonceMismatch.into());
    }
    verify_envelope(&envelope, &expected_key)?;

    Ok(stream)
}

async fn read_auth_envelope(stream: &mut TcpStream) -> Result<Envelope<AuthPayload>, RelayError> {
    let line = read_line(stream, MAX_AUTH_LINE).await?;
    serde_json::from_str(&line)
        .map_err(|e| RelayError::Auth(AuthError::MalformedKey(e.to_string())))
}

/// Reads bytes up to (and excluding) the first `\n`, without buffering past
/// it, so the socket is left positioned exactly at the first tunnel byte
/// once the auth envelope is consumed (spec.md §4.1: "Read one JSON line").
async fn read_line(stream: &mut TcpStream, max_len: usize) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > max_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "auth envelope line exceeded maximum length",
            ));
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Full-duplex copy between `client` and `daemon` until either side EOFs or
/// errors (spec.md §4.1). `snoop` toggles hex-dump logging of spliced bytes
/// via a transparent wrapping reader, never mutating the stream; the
/// non-snoop path never constructs the wrapper, so it has zero overhead.
async fn splice(client: TcpStream, daemon: TcpStream, snoop: bool) -> std::io::Result<()> {
    let (client_r, client_w) = client.into_split();
    let (daemon_r, daemon_w) = daemon.into_split();

    if snoop {
        let client_r = SnoopReader::new(client_r, "client->daemon");
        let daemon_r = SnoopReader::new(daemon_r, "daemon->client");
        tokio::try_join!(
            copy_with_buffer(client_r, daemon_w, SPLICE_BUFFER),
            copy_with_buffer(daemon_r, client_w, SPLICE_BUFFER),
        )?;
    } else {
        tokio::try_join!(
            copy_with_buffer(client_r, daemon_w, SPLICE_BUFFER),
            copy_with_buffer(daemon_r, client_w, SPLICE_BUFFER),
        )?;
    }
    Ok(())
}

/// Reads, then writes the same bytes before reading again: the mirrored
/// write completing before the next read starts is what throttles a
/// misbehaving peer (spec.md §5 "Backpressure").
async fn copy_with_buffer<R, W>(mut reader: R, mut writer: W, buf_size: usize) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buf_size];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    Ok(total)
}

struct SnoopReader<R> {
    inner: R,
    label: &'static str,
}

impl<R> SnoopReader<R> {
    fn new(inner: R, label: &'static str) -> Self {
        Self { inner, label }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SnoopReader<R> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let label = self.label;
        let poll = std::pin::Pin::new(&mut self.inner).poll_read(cx, buf);
        if poll.is_ready() {
            let data = &buf.filled()[before..];
            if !data.is_empty() {
                trace!(direction = label, bytes = data.len(), hex = %HEXLOWER.encode(data), "snooped");
            }
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sshnp_common::HashingAlgo;
    use sshnp_ssh::{sign_envelope, LongTermSigningKey};

    use super::*;

    fn ed25519_key() -> LongTermSigningKey {
        let mut rng = rand_chacha::ChaCha20Rng::from_entropy();
        LongTermSigningKey::Ed25519(Box::new(ed25519_dalek::SigningKey::generate(&mut rng)))
    }

    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[tokio::test]
    async fn happy_path_splices_both_authenticated_sockets() {
        let relay = Relay::new("127.0.0.1".parse().unwrap(), false);
        let session_id = SessionId::new();
        let client_key = ed25519_key();
        let daemon_key = ed25519_key();

        let allocation = relay
            .request_session(
                session_id,
                "@client".parse().unwrap(),
                client_key.public_key_record(),
                "@daemon".parse().unwrap(),
                daemon_key.public_key_record(),
            )
            .await
            .unwrap();

        let client_task = tokio::spawn({
            let nonce = allocation.nonce.clone();
            let port = allocation.port_a;
            async move {
                let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                let envelope = sign_envelope(
                    &client_key,
                    HashingAlgo::Sha256,
                    AuthPayload { rvd_nonce: nonce, session_id, client_nonce: None },
                )
                .unwrap();
                let mut line = serde_json::to_string(&envelope).unwrap();
                line.push('\n');
                sock.write_all(line.as_bytes()).await.unwrap();
                sock.write_all(b"ping").await.unwrap();
                let mut buf = [0u8; 4];
                sock.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"pong");
            }
        });

        let daemon_task = tokio::spawn({
            let nonce = allocation.nonce.clone();
            let port = allocation.port_b;
            async move {
                let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                let envelope = sign_envelope(
                    &daemon_key,
                    HashingAlgo::Sha256,
                    AuthPayload { rvd_nonce: nonce, session_id, client_nonce: None },
                )
                .unwrap();
                let mut line = serde_json::to_string(&envelope).unwrap();
                line.push('\n');
                sock.write_all(line.as_bytes()).await.unwrap();
                let mut buf = [0u8; 4];
                sock.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"ping");
                sock.write_all(b"pong").await.unwrap();
            }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            client_task.await.unwrap();
            daemon_task.await.unwrap();
        })
        .await
        .expect("splice should complete quickly");
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let relay = Relay::new("127.0.0.1".parse().unwrap(), false);
        let session_id = SessionId::new();
        let client_key = ed25519_key();
        let daemon_key = ed25519_key();

        let allocation = relay
            .request_session(
                session_id,
                "@client".parse().unwrap(),
                client_key.public_key_record(),
                "@daemon".parse().unwrap(),
                daemon_key.public_key_record(),
            )
            .await
            .unwrap();

        let mut sock = TcpStream::connect(("127.0.0.1", allocation.port_a)).await.unwrap();
        let mut envelope = sign_envelope(
            &client_key,
            HashingAlgo::Sha256,
            AuthPayload { rvd_nonce: allocation.nonce.clone(), session_id, client_nonce: None },
        )
        .unwrap();
        envelope.payload.rvd_nonce.push('x');
        let mut line = serde_json::to_string(&envelope).unwrap();
        line.push('\n');
        sock.write_all(line.as_bytes()).await.unwrap();

        // the relay should close the socket rather than splice anything
        let mut buf = [0u8; 1];
        let n = sock.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
}
