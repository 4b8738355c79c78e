//! Bounded retry for vendor connector calls
//!
//! Every attempt runs under an explicit deadline. A deadline expiry counts as
//! a connection failure, never a crash. Failed attempts are returned to the
//! caller so they can be audited as system retries.

use std::future::Future;
use std::time::Duration;

use crate::connectors::ConnectorError;

/// Retry settings for one vendor call
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Deadline for each single attempt
    pub call_deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            call_deadline: Duration::from_secs(30),
        }
    }
}

/// A failed attempt that was followed by another try
#[derive(Debug, Clone)]
pub struct FailedAttempt {
    pub operation: String,
    pub attempt: u32,
    pub error: String,
}

/// Outcome of a retried call
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, ConnectorError>,
    /// Total attempts made
    pub attempts: u32,
    /// Attempts that failed and were retried
    pub retried: Vec<FailedAttempt>,
}

/// Run `call` until it succeeds, fails permanently, or attempts run out
pub async fn with_vendor_retry<F, Fut, T>(
    operation: &str,
    policy: RetryPolicy,
    mut call: F,
) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut retried = Vec::new();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(policy.call_deadline, call()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout(policy.call_deadline.as_millis() as u64)),
        };

        match result {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                    retried,
                }
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Vendor call failed, retrying after backoff"
                );
                retried.push(FailedAttempt {
                    operation: operation.to_string(),
                    attempt,
                    error: err.to_string(),
                });
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
            Err(err) => {
                tracing::error!(operation, attempt, error = %err, "Vendor call failed");
                return Retried {
                    result: Err(err),
                    attempts: attempt,
                    retried,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            call_deadline: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let mut calls = 0;
        let outcome = with_vendor_retry("login", fast_policy(3), || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Err(ConnectorError::Network("connection reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), 3);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retried.len(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let outcome = with_vendor_retry("login", fast_policy(2), || async {
            Err::<(), _>(ConnectorError::Network("refused".into()))
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.retried.len(), 1);
    }

    #[tokio::test]
    async fn test_deadline_expiry_is_a_timeout_error() {
        let outcome = with_vendor_retry("extract", fast_policy(1), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), ConnectorError>(())
        })
        .await;

        assert!(matches!(outcome.result, Err(ConnectorError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let mut calls = 0;
        let outcome = with_vendor_retry("parse", fast_policy(5), || {
            calls += 1;
            async { Err::<(), _>(ConnectorError::Parse("bad csv".into())) }
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(calls, 1);
    }
}
