use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Substrate-level I/O hiccup, retried up to `max_attempts` with exponential
/// backoff before escalating (spec.md §7).
#[derive(Debug, thiserror::Error)]
#[error("transient error after {attempts} attempt(s): {source}")]
pub struct TransientError<E: fmt::Debug + fmt::Display> {
    pub attempts: u32,
    pub source: E,
}

/// Base/cap/attempt knobs for [`retry_with_backoff`], fixed at spec.md §7's
/// "base 200 ms, cap 2 s" and 3 attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(200),
            cap: Duration::from_secs(2),
        }
    }
}

/// Retries `op` up to `config.max_attempts` times with exponential backoff,
/// doubling from `config.base` and clamped at `config.cap` between
/// attempts. Used by substrate calls in all three binaries (spec.md §7).
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: RetryConfig,
    mut op: F,
) -> Result<T, TransientError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Debug + fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(source) => {
                if attempt >= config.max_attempts {
                    return Err(TransientError { attempts: attempt, source });
                }
                let delay = config.base.saturating_mul(1 << (attempt - 1)).min(config.cap);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn succeeds_without_retry_on_first_ok() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, TransientError<&str>> =
            retry_with_backoff(RetryConfig::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(42)
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn escalates_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
        };
        let result: Result<u32, _> = retry_with_backoff(config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>("boom")
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
        };
        let result = retry_with_backoff(config, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err::<u32, &str>("not yet")
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }
}
