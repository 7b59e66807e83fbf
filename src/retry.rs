//! Retry policy shared by the field-bus and sensor clients.

use std::{fmt::Display, future::Future, time::Duration};

use tokio::time::sleep;

/// Defines a policy for retrying an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy for relay coil writes: three attempts, 200ms apart.
    pub fn coil_writes() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(200),
        }
    }
}

/// Errors that know whether trying again could help.
pub trait Transient {
    /// True for transport failures and timeouts.
    fn is_transient(&self) -> bool;
}

impl Transient for crate::Error {
    fn is_transient(&self) -> bool {
        crate::Error::is_transient(self)
    }
}

impl Transient for modbus::Error {
    fn is_transient(&self) -> bool {
        modbus::Error::is_transient(self)
    }
}

impl Transient for enip::Error {
    fn is_transient(&self) -> bool {
        enip::Error::is_transient(self)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts. `op` receives the 1-based attempt number.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    E: Transient + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && err.is_transient() => {
                tracing::warn!(operation, attempt, max_attempts, error = %err, "transient failure, retrying");
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;

    fn timeout() -> modbus::Error {
        modbus::Error::Timeout {
            operation: "write single coil",
            after_ms: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_succeeds() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, modbus::Error> = with_retry(&RetryPolicy::coil_writes(), "test", |attempt| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt >= 2 {
                    Ok(attempt)
                } else {
                    Err(timeout())
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_fails() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), modbus::Error> = with_retry(&RetryPolicy::coil_writes(), "test", |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(timeout()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), modbus::Error> = with_retry(&RetryPolicy::default(), "test", |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(modbus::Error::Exception {
                    function: 0x05,
                    code: modbus::ExceptionCode::IllegalDataAddress,
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_attempts() {
        let start = tokio::time::Instant::now();
        let _: Result<(), modbus::Error> =
            with_retry(&RetryPolicy::coil_writes(), "test", |_| async { Err(timeout()) }).await;

        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }
}
