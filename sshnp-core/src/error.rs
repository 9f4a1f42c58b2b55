use sshnp_common::ConfigError;
use sshnp_ssh::AuthError;

/// The session-boundary error taxonomy from spec.md §7. Everything except
/// `TransientError` (handled locally by [`sshnp_common::retry_with_backoff`]
/// before it ever escalates) surfaces here, where cleanup runs and the
/// user-visible channel — stderr for the CLIs, a response envelope for
/// daemon→client — gets populated.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("resource exhausted: {0}")]
    Resource(&'static str),

    #[error("substrate error: {0}")]
    Substrate(#[from] sshnp_substrate::SubstrateError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Exit code per spec.md §6: `1` usage, `2` timeout, `3` remote error,
    /// everything else bucketed with remote/resource errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::Config(_) => 1,
            SessionError::Timeout(_) => 2,
            SessionError::Remote(_) => 3,
            _ => 3,
        }
    }
}
