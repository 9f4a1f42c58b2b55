use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sshnp_common::SessionId;

/// One entry in the in-process authorised-key set (spec.md §4.2, DESIGN
/// NOTES §9: "replace file appending with an in-process set guarded by a
/// mutex ... persist to disk only on clean shutdown").
#[derive(Debug, Clone)]
pub struct AuthorizedKeyEntry {
    pub session_id: SessionId,
    pub public_key: String,
    pub restriction: String,
    pub expires_at: Instant,
}

/// Renders the OpenSSH `authorized_keys` command-restriction options for an
/// ephemeral per-session key: limited to forwarding to the local sshd and
/// an idle timeout (spec.md §4.2 step 3).
pub fn render_restriction(sshd_port: u16, idle_timeout: Duration) -> String {
    format!(
        "permitopen=\"localhost:{sshd_port}\",no-agent-forwarding,no-X11-forwarding,no-pty,command=\"echo no-shell\" {}",
        format_args!("# idle-timeout={}s", idle_timeout.as_secs())
    )
}

/// Shared mutable state for one daemon's authorised keys, written by
/// multiple concurrent sessions; writes are serialised through the mutex
/// and each entry is tagged with its `session_id` so concurrent cleanups
/// only ever remove their own row (spec.md §5 "Shared resources").
#[derive(Default)]
pub struct AuthorizedKeySet {
    entries: Mutex<HashMap<String, AuthorizedKeyEntry>>,
}

impl AuthorizedKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `public_key` restricted to forwarding onto `sshd_port`,
    /// tagged with `session_id`, expiring after `idle_timeout` of being
    /// unused (spec.md §4.2: "exits after ≤20s idle").
    pub fn insert(&self, session_id: SessionId, public_key: String, sshd_port: u16, idle_timeout: Duration) {
        let restriction = render_restriction(sshd_port, idle_timeout);
        let mut entries = self.entries.lock().expect("authorized key set mutex poisoned");
        entries.insert(
            public_key.clone(),
            AuthorizedKeyEntry {
                session_id,
                public_key,
                restriction,
                expires_at: Instant::now() + idle_timeout,
            },
        );
    }

    /// Removes every entry tagged with `session_id`. Idempotent: a second
    /// call for the same session is a no-op (spec.md §8 idempotence
    /// property).
    pub fn remove_session(&self, session_id: SessionId) {
        let mut entries = self.entries.lock().expect("authorized key set mutex poisoned");
        entries.retain(|_, entry| entry.session_id != session_id);
    }

    pub fn contains(&self, public_key: &str) -> bool {
        let entries = self.entries.lock().expect("authorized key set mutex poisoned");
        entries.contains_key(public_key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("authorized key set mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders every live entry as `authorized_keys` lines, for the
    /// clean-shutdown persistence path (DESIGN NOTES §9).
    pub fn render_all(&self) -> Vec<String> {
        let entries = self.entries.lock().expect("authorized key set mutex poisoned");
        entries
            .values()
            .map(|entry| format!("{} {}", entry.restriction, entry.public_key))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::new()
    }

    #[test]
    fn insert_and_contains() {
        let set = AuthorizedKeySet::new();
        set.insert(session(), "ssh-ed25519 AAAA".into(), 22, Duration::from_secs(20));
        assert!(set.contains("ssh-ed25519 AAAA"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn removal_is_scoped_to_session() {
        let set = AuthorizedKeySet::new();
        let a = session();
        let b = session();
        set.insert(a, "key-a".into(), 22, Duration::from_secs(20));
        set.insert(b, "key-b".into(), 22, Duration::from_secs(20));

        set.remove_session(a);

        assert!(!set.contains("key-a"));
        assert!(set.contains("key-b"));
    }

    #[test]
    fn removal_is_idempotent() {
        let set = AuthorizedKeySet::new();
        let a = session();
        set.insert(a, "key-a".into(), 22, Duration::from_secs(20));

        set.remove_session(a);
        set.remove_session(a);

        assert!(set.is_empty());
    }

    #[test]
    fn restriction_string_is_exact() {
        let restriction = render_restriction(2222, Duration::from_secs(20));
        assert!(restriction.contains("permitopen=\"localhost:2222\""));
        assert!(restriction.contains("idle-timeout=20s"));
    }
}
