//! First-class retry policy for readiness polling.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Bounded polling with a fixed delay between attempts. Exhausting the
/// attempt budget is fatal for the whole run.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Poll `probe` until it yields a value. `Ok(None)` and `Err` both count
    /// as a missed attempt; the last error is carried into the final result.
    pub async fn run<T, F, Fut>(&self, what: &str, mut probe: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match probe().await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    debug!(what, attempt, "not ready yet");
                }
                Err(err) => {
                    debug!(what, attempt, %err, "probe failed");
                    last_error = Some(err);
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.delay).await;
            }
        }

        Err(match last_error {
            Some(err) => err.context(format!(
                "{what}: gave up after {} attempts",
                self.max_attempts
            )),
            None => anyhow!("{what}: gave up after {} attempts", self.max_attempts),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn returns_first_ready_value() {
        let attempts = AtomicU32::new(0);
        let value = fast_policy(5)
            .run("probe", || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                Ok((n >= 2).then_some("ready"))
            })
            .await
            .unwrap();

        assert_eq!(value, "ready");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_are_fatal() {
        let err = fast_policy(3)
            .run("probe", || async { Ok(None::<()>) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gave up after 3 attempts"));
    }

    #[tokio::test]
    async fn probe_errors_count_as_attempts_and_are_preserved() {
        let err = fast_policy(2)
            .run("probe", || async { Err::<Option<()>, _>(anyhow!("boom")) })
            .await
            .unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("gave up after 2 attempts"));
        assert!(chain.contains("boom"));
    }
}
