use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use sshnp_common::SessionId;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Bound on any single teardown step (spec.md §4.5): cleanup must not block
/// indefinitely, so each registered step gets this long before it's
/// abandoned and the next step runs anyway.
const STEP_TIMEOUT: Duration = Duration::from_secs(2);

type CleanupStep = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Per-session scoped cleanup of temp keys, listeners, authorised-key
/// entries and subprocesses (spec.md §4.5). Steps are registered as they're
/// created during session setup and run, in registration order, on every
/// exit path: normal completion, error, remote nack, and SIGINT/SIGTERM
/// (spec.md §4.5, §5 "Cancellation").
///
/// `cleanup()` is idempotent — invoking it N times has the same effect as
/// once (spec.md §8) — and is also the cancellation token's target: any
/// in-flight I/O cancelled via [`SessionGuard::cancellation`] is expected to
/// unwind into a call to `cleanup()`.
pub struct SessionGuard {
    session_id: SessionId,
    cancellation: CancellationToken,
    steps: Mutex<Vec<CleanupStep>>,
    cleaned: AtomicBool,
}

impl SessionGuard {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            cancellation: CancellationToken::new(),
            steps: Mutex::new(Vec::new()),
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Registers a teardown step, e.g. deleting a keyfile, removing an
    /// authorised-key entry, or aborting a spawned task. Steps registered
    /// after `cleanup()` has already run execute immediately — there is no
    /// window where a late registration silently never fires.
    pub fn register<F>(&self, step: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cleaned.load(Ordering::SeqCst) {
            tokio::spawn(step);
            return;
        }
        self.steps
            .lock()
            .expect("cleanup step list mutex poisoned")
            .push(Box::pin(step));
    }

    /// Runs every registered step, each bounded at [`STEP_TIMEOUT`]; a step
    /// that times out or errors is logged and the rest still run
    /// best-effort (spec.md §4.5). Safe to call more than once.
    pub async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancellation.cancel();
        let steps = std::mem::take(&mut *self.steps.lock().expect("cleanup step list mutex poisoned"));
        for step in steps {
            if tokio::time::timeout(STEP_TIMEOUT, step).await.is_err() {
                warn!(session = %self.session_id, "cleanup step exceeded {:?}, continuing", STEP_TIMEOUT);
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.cleaned.load(Ordering::SeqCst) {
            return;
        }
        self.cancellation.cancel();
        let steps = std::mem::take(&mut *self.steps.lock().expect("cleanup step list mutex poisoned"));
        if steps.is_empty() {
            return;
        }
        let session_id = self.session_id;
        // Drop can't .await; spawn a detached best-effort sweep as a
        // fallback net, same as the teacher's `WarpgateServerHandle` Drop
        // impl. The explicit `cleanup()` call on every exit path remains
        // the primary mechanism.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for step in steps {
                    if tokio::time::timeout(STEP_TIMEOUT, step).await.is_err() {
                        warn!(session = %session_id, "drop-time cleanup step exceeded {:?}", STEP_TIMEOUT);
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn cleanup_runs_every_registered_step() {
        let guard = SessionGuard::new(SessionId::new());
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));

        for _ in 0..3 {
            let count = count.clone();
            guard.register(async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        guard.cleanup().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let guard = SessionGuard::new(SessionId::new());
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let count_clone = count.clone();
        guard.register(async move {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        guard.cleanup().await;
        guard.cleanup().await;
        guard.cleanup().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_cancels_the_token() {
        let guard = SessionGuard::new(SessionId::new());
        let token = guard.cancellation();
        assert!(!token.is_cancelled());
        guard.cleanup().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn a_slow_step_does_not_block_the_rest() {
        let guard = SessionGuard::new(SessionId::new());
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        guard.register(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        let ran_clone = ran.clone();
        guard.register(async move {
            ran_clone.store(true, Ordering::SeqCst);
        });

        tokio::time::timeout(Duration::from_secs(3), guard.cleanup())
            .await
            .expect("cleanup should finish within the per-step bound, not the slow step's duration");
        assert!(ran.load(Ordering::SeqCst));
    }
}
