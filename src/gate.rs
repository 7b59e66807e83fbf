//! Time-window mutual exclusion between actuations.
//!
//! After the relays fire, the gate stays busy for the length of the pulse so
//! a second trigger (manual or from the input watcher) cannot start another
//! cycle while the mechanism is still moving. Callers check the gate and
//! skip; nothing is queued.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

/// Shared handle to the actuation window. Clones share the same window.
#[derive(Debug, Clone)]
pub struct ActuationGate {
    busy_until: Arc<Mutex<Option<Instant>>>,
}

impl Default for ActuationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ActuationGate {
    /// A gate that is not busy.
    pub fn new() -> Self {
        Self {
            busy_until: Arc::new(Mutex::new(None)),
        }
    }

    /// Keep the gate busy for at least `duration` from now. The window only
    /// ever grows: a shorter request never cuts an existing one short, and a
    /// zero duration is ignored.
    pub fn block_for(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }

        let until = Instant::now() + duration;
        let mut busy_until = self.busy_until.lock().unwrap_or_else(PoisonError::into_inner);
        if busy_until.map_or(true, |current| until > current) {
            *busy_until = Some(until);
        }
    }

    /// Whether the window is still open.
    pub fn is_busy(&self) -> bool {
        !self.remaining().is_zero()
    }

    /// Time left in the window; zero when idle.
    pub fn remaining(&self) -> Duration {
        let busy_until = self.busy_until.lock().unwrap_or_else(PoisonError::into_inner);
        busy_until.map_or(Duration::ZERO, |until| until.saturating_duration_since(Instant::now()))
    }

    /// Close the window immediately.
    pub fn clear(&self) {
        *self.busy_until.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
