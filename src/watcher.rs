//! Turning the external start signal into scan requests.
//!
//! The start signal is an input coil on one of the relay boards. The watcher
//! polls it and sends one trigger per `false -> true` transition; a level
//! held high does not retrigger.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::sleep,
};

use crate::{coil::Pausable, net::resolve, targets::CoilTarget};

/// Wait after a failed read before trying again.
pub const ERROR_BACKOFF: Duration = Duration::from_millis(500);

fn default_poll_ms() -> u64 {
    80
}

/// Input watcher settings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WatcherConfig {
    /// Poll interval in milliseconds.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_poll_ms(),
        }
    }
}

impl WatcherConfig {
    /// Poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }
}

/// Rising-edge detector over a sampled boolean.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct EdgeDetector {
    previous: bool,
}

impl EdgeDetector {
    /// Feed a sample; true if it is a rising edge.
    pub fn update(&mut self, value: bool) -> bool {
        let rising = value && !self.previous;
        self.previous = value;
        rising
    }

    /// Forget the last sample, as if it had been `false`.
    pub fn reset(&mut self) {
        self.previous = false;
    }
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Background poller of the start-signal coil.
pub struct InputWatcher {
    target: CoilTarget,
    poll: Duration,
    paused: Arc<AtomicBool>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for InputWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputWatcher")
            .field("target", &self.target)
            .field("poll", &self.poll)
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl InputWatcher {
    /// A stopped watcher of the coil in `target`.
    pub fn new(target: CoilTarget, poll: Duration) -> Self {
        Self {
            target,
            poll,
            paused: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
        }
    }

    /// The watched coil.
    pub fn target(&self) -> &CoilTarget {
        &self.target
    }

    /// Start polling, sending one `()` on `triggers` per rising edge. Does
    /// nothing if already running.
    pub fn start(&self, triggers: mpsc::Sender<()>) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(watch_loop(
            self.target.clone(),
            self.poll,
            self.paused.clone(),
            triggers,
            stop_rx,
        ));
        *running = Some(Running { stop, handle });
        tracing::info!(device = %self.target, poll_ms = self.poll.as_millis() as u64, "input watcher started");
    }

    /// Stop polling and wait for the task to exit.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Running { stop, handle }) = running {
            let _ = stop.send(true);
            if let Err(e) = handle.await {
                tracing::warn!(error = format!("{:?}", e), "input watcher ended abnormally");
            }
            tracing::info!(device = %self.target, "input watcher stopped");
        }
    }

    /// Whether the polling task is alive.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Whether polling is suspended for a coil write.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl Pausable for InputWatcher {
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

async fn read_input(client: &mut Option<modbus::Client>, target: &CoilTarget) -> modbus::Result<bool> {
    let mut active = match client.take() {
        Some(active) => active,
        None => {
            let addr = resolve(&target.host, target.port).await?;
            modbus::Client::connect(addr, target.unit_id, target.timeout).await?
        }
    };
    let value = active.read_coil(target.coil.wire()).await?;
    *client = Some(active);
    Ok(value)
}

async fn watch_loop(
    target: CoilTarget,
    poll: Duration,
    paused: Arc<AtomicBool>,
    triggers: mpsc::Sender<()>,
    mut stop: watch::Receiver<bool>,
) {
    let mut client: Option<modbus::Client> = None;
    let mut edges = EdgeDetector::default();

    loop {
        if *stop.borrow() {
            break;
        }

        // The last seen level survives a pause, so an input held high
        // across it does not count as a new edge on resume.
        let delay = if paused.load(Ordering::SeqCst) {
            client = None;
            poll
        } else {
            let outcome = tokio::select! {
                _ = stop.changed() => break,
                outcome = read_input(&mut client, &target) => outcome,
            };
            match outcome {
                Ok(value) => {
                    if edges.update(value) {
                        tracing::info!(device = %target, "start signal rising edge");
                        if triggers.try_send(()).is_err() {
                            tracing::debug!("trigger dropped, previous one still pending");
                        }
                    }
                    poll
                }
                Err(e) => {
                    tracing::debug!(device = %target, error = %e, "start signal read failed");
                    client = None;
                    edges.reset();
                    ERROR_BACKOFF
                }
            }
        };

        tokio::select! {
            _ = stop.changed() => break,
            _ = sleep(delay) => {}
        }
    }
}
