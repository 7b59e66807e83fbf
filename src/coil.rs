//! Driving relay coils on the actuation targets.
//!
//! All writes, from every caller, go through one [CoilClient] and are
//! serialized by a single permit. A pulse holds the permit from the `true`
//! write until the `false` write, so two pulses never interleave on the bus.

use std::{fmt, sync::Arc, time::Duration};

use tokio::{
    net::TcpStream,
    sync::{Semaphore, SemaphorePermit},
    time::{sleep, timeout},
};

use crate::{
    net::resolve,
    retry::{with_retry, RetryPolicy},
    targets::CoilTarget,
    Error, Result,
};

/// How long a pulse holds the relay when the target does not say.
pub const DEFAULT_PULSE: Duration = Duration::from_secs(1);

/// Something that must let go of the field bus while we write to it.
pub trait Pausable: Send + Sync {
    /// Stop using the bus until [Pausable::resume].
    fn pause(&self);
    /// Carry on.
    fn resume(&self);
}

/// Time bounds applied to every coil write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CoilTimeouts {
    /// Waiting for the write permit.
    pub permit: Duration,
    /// Plain TCP reachability probe.
    pub probe: Duration,
    /// Protocol connect.
    pub connect: Duration,
    /// One whole write attempt: resolve, probe, connect and write.
    pub attempt: Duration,
    /// Retries of a failed attempt.
    pub retry: RetryPolicy,
}

impl Default for CoilTimeouts {
    fn default() -> Self {
        Self {
            permit: Duration::from_secs(5),
            probe: Duration::from_secs(2),
            connect: Duration::from_secs(2),
            attempt: Duration::from_secs(5),
            retry: RetryPolicy::coil_writes(),
        }
    }
}

struct Inner {
    permit: Semaphore,
    pausables: Vec<Arc<dyn Pausable>>,
    timeouts: CoilTimeouts,
}

/// Shared handle for writing coils. Clones share the same write permit.
#[derive(Clone)]
pub struct CoilClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for CoilClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoilClient")
            .field("pausables", &self.inner.pausables.len())
            .field("timeouts", &self.inner.timeouts)
            .finish()
    }
}

impl Default for CoilClient {
    fn default() -> Self {
        Self::new(CoilTimeouts::default(), Vec::new())
    }
}

impl CoilClient {
    /// A client with the given bounds that pauses `pausables` around every
    /// write.
    pub fn new(timeouts: CoilTimeouts, pausables: Vec<Arc<dyn Pausable>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                permit: Semaphore::new(1),
                pausables,
                timeouts,
            }),
        }
    }

    /// A client with default bounds that pauses `pausables` around every
    /// write.
    pub fn with_pausables(pausables: Vec<Arc<dyn Pausable>>) -> Self {
        Self::new(CoilTimeouts::default(), pausables)
    }

    /// Close the relay, hold it, then open it again.
    ///
    /// `None` holds for [DEFAULT_PULSE], `Some(n)` for `n` seconds, and
    /// `Some(0)` only closes the relay and leaves it latched.
    ///
    /// # Errors
    ///
    /// Returns [Error::ProtocolTimeout] if the write permit or a write times
    /// out, or [Error::ProtocolIo] if a write still fails after retries.
    pub async fn pulse(&self, target: &CoilTarget, pulse_seconds: Option<u32>) -> Result<()> {
        let _permit = self.acquire(target).await?;

        self.write(target, true).await?;
        let hold = match pulse_seconds {
            Some(0) => {
                tracing::info!(device = %target, "coil latched on");
                return Ok(());
            }
            Some(seconds) => Duration::from_secs(u64::from(seconds)),
            None => DEFAULT_PULSE,
        };

        tracing::debug!(device = %target, hold_ms = hold.as_millis() as u64, "holding pulse");
        sleep(hold).await;
        self.write(target, false).await
    }

    /// Write a single value.
    ///
    /// # Errors
    ///
    /// See [CoilClient::pulse].
    pub async fn set(&self, target: &CoilTarget, value: bool) -> Result<()> {
        let _permit = self.acquire(target).await?;
        self.write(target, value).await
    }

    async fn acquire(&self, target: &CoilTarget) -> Result<SemaphorePermit<'_>> {
        match timeout(self.inner.timeouts.permit, self.inner.permit.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            _ => Err(Error::ProtocolTimeout {
                operation: "acquire write permit",
                target: target.clone(),
            }),
        }
    }

    async fn write(&self, target: &CoilTarget, value: bool) -> Result<()> {
        self.inner.pausables.iter().for_each(|p| p.pause());
        let result = with_retry(&self.inner.timeouts.retry, "write coil", move |attempt| {
            tracing::debug!(device = %target, value, attempt, "writing coil");
            self.write_once(target, value)
        })
        .await;
        self.inner.pausables.iter().for_each(|p| p.resume());

        match result {
            Ok(()) => {
                tracing::info!(device = %target, value, "coil written");
                Ok(())
            }
            Err(modbus::Error::Timeout { operation, after_ms }) => {
                tracing::error!(device = %target, value, operation, after_ms, "coil write timed out");
                Err(Error::ProtocolTimeout {
                    operation,
                    target: target.clone(),
                })
            }
            Err(source) => {
                tracing::error!(device = %target, value, error = %source, "coil write failed");
                Err(Error::ProtocolIo {
                    target: target.clone(),
                    value,
                    source,
                })
            }
        }
    }

    async fn write_once(&self, target: &CoilTarget, value: bool) -> modbus::Result<()> {
        let timeouts = &self.inner.timeouts;
        let attempt = async {
            let addr = resolve(&target.host, target.port).await?;

            let probe = timeout(timeouts.probe, TcpStream::connect(addr))
                .await
                .map_err(|_| modbus::Error::Timeout {
                    operation: "probe connect",
                    after_ms: timeouts.probe.as_millis() as u64,
                })??;
            drop(probe);

            let mut client = modbus::Client::connect(addr, target.unit_id, timeouts.connect).await?;
            client.set_timeout(target.timeout);
            client.write_single_coil(target.coil.wire(), value).await
        };

        timeout(timeouts.attempt, attempt)
            .await
            .map_err(|_| modbus::Error::Timeout {
                operation: "write attempt",
                after_ms: timeouts.attempt.as_millis() as u64,
            })?
    }
}
