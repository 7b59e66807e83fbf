//! One scan cycle, start to finish.
//!
//! A trigger, manual or from the start signal, runs measurement,
//! classification and actuation in order, then counts the part. Only one
//! cycle runs at a time and none starts while the actuation gate is busy.
//! Anything the operator must look at (no matching rule, a full bin, a
//! relay board that does not answer) pauses the line until
//! [ScanOrchestrator::start] is called again.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::Duration,
};

use chrono::Utc;
use parse_display::Display;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::{
    calibration::{px_to_mm, CalibrationProfile},
    classify::{self, ClassificationRule},
    coil::CoilClient,
    config::{ActuationConfig, Config},
    counters::{GroupCounter, GroupCounters},
    frame::FrameSource,
    gate::ActuationGate,
    history::{ScanHistory, ScanRecord},
    laser::{AxisSource, AxisSources, DistanceSensors},
    measure::{BoundingRegion, ImageMeasurer, MeasureOptions},
    targets::ActuationTargets,
    Axis, Dimensions, Error, Result,
};

/// Pulse length used wherever a target does not configure one, in seconds.
pub const DEFAULT_PULSE_SECONDS: u32 = 1;

const EVENT_CAPACITY: usize = 64;

/// Where the orchestrator is in its cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    /// Waiting for a trigger.
    Idle,
    /// Grabbing frames and sensor values.
    Measuring,
    /// Matching dimensions to a rule.
    Classifying,
    /// Driving relays.
    Actuating,
    /// Stopped until the operator restarts.
    Paused,
}

/// Result of a completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOutcome {
    /// Measured dimensions in millimeters.
    pub dimensions: Dimensions,
    /// Top-view box, if an object was found.
    pub top: Option<BoundingRegion>,
    /// Side-view box, if an object was found.
    pub side: Option<BoundingRegion>,
    /// Selected group.
    pub group_index: u32,
    /// Selected group's name.
    pub group_name: String,
    /// Target the part was routed to.
    pub target: u32,
    /// How long the gate was armed for.
    pub gate_window: Duration,
    /// The group's counter after this part.
    pub counter: GroupCounter,
}

/// Things worth telling the operator about.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// The state machine moved.
    State(ScanState),
    /// A part was classified and counted.
    Classified(ScanOutcome),
    /// No rule can classify anything; the line paused.
    NoRule {
        /// What was measured.
        dimensions: Dimensions,
    },
    /// A bin just filled up; the line paused.
    GroupFull {
        /// The full group.
        group_index: u32,
        /// Its name.
        name: String,
    },
    /// A relay could not be driven; the line paused.
    ActuationFailed {
        /// Target that failed.
        target: u32,
        /// What went wrong.
        error: String,
    },
}

/// Static inputs of a cycle, copied out of the configuration.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Image measurement options.
    pub measure: MeasureOptions,
    /// Per-axis dimension source.
    pub axes: AxisSources,
    /// Pixel to millimeter coefficients.
    pub profile: CalibrationProfile,
    /// Size groups.
    pub rules: Vec<ClassificationRule>,
    /// Relay channels.
    pub targets: ActuationTargets,
    /// Special target roles.
    pub actuation: ActuationConfig,
}

impl ScanSettings {
    /// Settings from `config` with a loaded calibration `profile`.
    pub fn from_config(config: &Config, profile: CalibrationProfile) -> Self {
        Self {
            measure: config.measure_options(),
            axes: config.measurement.axes,
            profile,
            rules: config.rules.clone(),
            targets: config.actuation_targets(),
            actuation: config.actuation,
        }
    }
}

/// Shared collaborators of the orchestrator.
pub struct ScanDevices {
    /// Top camera.
    pub top: Arc<dyn FrameSource>,
    /// Side camera.
    pub side: Arc<dyn FrameSource>,
    /// Relay writer.
    pub coil: CoilClient,
    /// Actuation window.
    pub gate: ActuationGate,
    /// Distance sensors, if fitted.
    pub sensors: Option<DistanceSensors>,
    /// Group counters.
    pub counters: GroupCounters,
    /// Scan history.
    pub history: ScanHistory,
}

struct Inner {
    top: Arc<dyn FrameSource>,
    side: Arc<dyn FrameSource>,
    measurer: ImageMeasurer,
    axes: AxisSources,
    actuation: ActuationConfig,
    profile: RwLock<CalibrationProfile>,
    rules: RwLock<Vec<ClassificationRule>>,
    targets: RwLock<ActuationTargets>,
    coil: CoilClient,
    gate: ActuationGate,
    sensors: Option<DistanceSensors>,
    counters: Mutex<GroupCounters>,
    history: Mutex<ScanHistory>,
    running: AtomicBool,
    in_progress: AtomicBool,
    state: Mutex<ScanState>,
    events: broadcast::Sender<ScanEvent>,
}

/// Sequences measurement, classification and actuation. Clones share the
/// same state.
#[derive(Clone)]
pub struct ScanOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Clears the in-progress flag when a cycle ends, however it ends.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

impl ScanOrchestrator {
    /// A stopped orchestrator.
    pub fn new(settings: ScanSettings, devices: ScanDevices) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut counters = devices.counters;
        counters.refresh_from_rules(&settings.rules);

        Self {
            inner: Arc::new(Inner {
                top: devices.top,
                side: devices.side,
                measurer: ImageMeasurer::new(settings.measure),
                axes: settings.axes,
                actuation: settings.actuation,
                profile: RwLock::new(settings.profile),
                rules: RwLock::new(settings.rules),
                targets: RwLock::new(settings.targets),
                coil: devices.coil,
                gate: devices.gate,
                sensors: devices.sensors,
                counters: Mutex::new(counters),
                history: Mutex::new(devices.history),
                running: AtomicBool::new(false),
                in_progress: AtomicBool::new(false),
                state: Mutex::new(ScanState::Idle),
                events,
            }),
        }
    }

    /// Accept triggers. Also the operator's acknowledgment of a pause.
    pub fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        if self.state() == ScanState::Paused {
            self.set_state(ScanState::Idle);
        }
        tracing::info!("scanning started");
    }

    /// Ignore triggers until [ScanOrchestrator::start].
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        tracing::info!("scanning stopped");
    }

    /// Whether triggers are accepted.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive [ScanEvent]s from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.inner.events.subscribe()
    }

    /// The actuation gate shared with every trigger path.
    pub fn gate(&self) -> &ActuationGate {
        &self.inner.gate
    }

    /// Current calibration.
    pub fn profile(&self) -> CalibrationProfile {
        read(&self.inner.profile)
    }

    /// Replace the calibration used by later cycles.
    pub fn set_profile(&self, profile: CalibrationProfile) {
        *self.inner.profile.write().unwrap_or_else(PoisonError::into_inner) = profile;
    }

    /// Replace the rules used by later cycles and refresh counter names.
    pub fn set_rules(&self, rules: Vec<ClassificationRule>) {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .refresh_from_rules(&rules);
        *self.inner.rules.write().unwrap_or_else(PoisonError::into_inner) = rules;
    }

    /// Replace the actuation targets used by later cycles.
    pub fn set_targets(&self, targets: ActuationTargets) {
        *self.inner.targets.write().unwrap_or_else(PoisonError::into_inner) = targets;
    }

    /// Snapshot of all counters.
    pub fn counters(&self) -> Vec<GroupCounter> {
        let counters = self.inner.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.iter().cloned().collect()
    }

    /// Zero one group's counter.
    pub fn reset_counter(&self, index: u32) {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset(index, true);
    }

    /// Zero every counter.
    pub fn reset_all_counters(&self) {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset_all();
    }

    /// Completed cycles whose record falls in `from..=to`.
    pub fn scans_between(&self, from: chrono::DateTime<Utc>, to: chrono::DateTime<Utc>) -> usize {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .count_between(from, to)
    }

    /// Run one cycle if scanning is running, the gate is clear and no other
    /// cycle is in flight.
    ///
    /// # Errors
    ///
    /// Returns [Error::NotRunning], [Error::GateBusy] or
    /// [Error::ScanInProgress] when the trigger is skipped,
    /// [Error::NoClassificationRule] when nothing can classify the part, or
    /// the actuation error when a relay could not be driven.
    pub async fn trigger(&self) -> Result<ScanOutcome> {
        if !self.is_running() {
            tracing::warn!(state = %self.state(), "trigger ignored, scanning is not running");
            return Err(Error::NotRunning);
        }

        let remaining = self.inner.gate.remaining();
        if !remaining.is_zero() {
            tracing::info!(remaining_ms = remaining.as_millis() as u64, "trigger skipped, actuation gate busy");
            return Err(Error::GateBusy { remaining });
        }

        if self.inner.in_progress.swap(true, Ordering::SeqCst) {
            tracing::info!("trigger skipped, scan already in progress");
            return Err(Error::ScanInProgress);
        }
        let _in_progress = InProgress(&self.inner.in_progress);

        self.run_cycle().await
    }

    /// Handle triggers from `triggers` until the channel closes.
    pub async fn serve(&self, mut triggers: mpsc::Receiver<()>) {
        while triggers.recv().await.is_some() {
            match self.trigger().await {
                Ok(outcome) => tracing::debug!(group = outcome.group_index, "triggered scan complete"),
                Err(Error::NotRunning | Error::GateBusy { .. } | Error::ScanInProgress) => {}
                Err(e) => tracing::warn!(error = %e, "triggered scan failed"),
            }
        }
    }

    async fn run_cycle(&self) -> Result<ScanOutcome> {
        self.set_state(ScanState::Measuring);
        let (top, side) = tokio::join!(
            self.measure_view(self.inner.top.clone(), "top"),
            self.measure_view(self.inner.side.clone(), "side"),
        );

        let profile = self.profile();
        let mut dimensions = px_to_mm(top.as_ref(), side.as_ref(), profile.mapping, &profile);
        self.apply_laser_axes(&mut dimensions);
        tracing::info!(
            length = dimensions.length,
            width = dimensions.width,
            height = dimensions.height,
            "part measured"
        );

        self.set_state(ScanState::Classifying);
        let rules = read(&self.inner.rules);
        let Some(rule) = classify::select(&rules, dimensions.length, dimensions.width, dimensions.height) else {
            tracing::warn!(?dimensions, "no active rule with a target and all three limits, pausing");
            self.pause(ScanEvent::NoRule { dimensions });
            return Err(Error::NoClassificationRule);
        };
        let group_name = rule.display_name();
        // Candidates always have a target.
        let mapped = rule.target.unwrap_or_default();
        tracing::info!(group = rule.index, name = %group_name, routed_to = mapped, "part classified");

        self.set_state(ScanState::Actuating);
        let (gate_window, actuation) = self.actuate(mapped).await;
        self.inner.gate.block_for(gate_window);

        let (counter, just_filled) = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(rule.index, dimensions, Utc::now());
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(ScanRecord {
                at: counter.last_timestamp.unwrap_or_else(Utc::now),
                group_index: rule.index,
                group_name: group_name.clone(),
                x: dimensions.length,
                y: dimensions.width,
                z: dimensions.height,
            });

        let outcome = ScanOutcome {
            dimensions,
            top,
            side,
            group_index: rule.index,
            group_name: group_name.clone(),
            target: mapped,
            gate_window,
            counter,
        };
        self.emit(ScanEvent::Classified(outcome.clone()));

        if just_filled {
            tracing::warn!(group = rule.index, name = %group_name, limit = outcome.counter.limit, "bin full, pausing");
            self.pause(ScanEvent::GroupFull {
                group_index: rule.index,
                name: group_name,
            });
        }

        match actuation {
            Ok(()) => {
                if !just_filled {
                    self.set_state(ScanState::Idle);
                }
                Ok(outcome)
            }
            Err((target, e)) => {
                tracing::error!(target_id = target, error = %e, "actuation failed, pausing");
                self.pause(ScanEvent::ActuationFailed {
                    target,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn measure_view(&self, source: Arc<dyn FrameSource>, view: &'static str) -> Option<BoundingRegion> {
        let frame = match source.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(view, source = source.name(), error = format!("{:?}", e), "frame capture failed");
                return None;
            }
        };

        let measurer = self.inner.measurer;
        match tokio::task::spawn_blocking(move || measurer.measure(&frame)).await {
            Ok(Ok(Some(region))) => {
                tracing::debug!(view, ?region, "object found");
                Some(region)
            }
            Ok(Ok(None)) => {
                let err = Error::MeasurementNotFound { view };
                tracing::warn!(error = %err, "measurement degraded to zero");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(view, error = %e, "frame could not be measured");
                None
            }
            Err(e) => {
                tracing::error!(view, error = format!("{:?}", e), "measurement task failed");
                None
            }
        }
    }

    fn apply_laser_axes(&self, dimensions: &mut Dimensions) {
        if !self.inner.axes.uses_laser() {
            return;
        }
        let Some(sensors) = &self.inner.sensors else {
            for axis in Axis::ALL {
                if matches!(self.inner.axes.get(axis), AxisSource::Laser { .. }) {
                    tracing::warn!(%axis, "axis is laser-sourced but no distance sensors are fitted");
                    dimensions.set(axis, 0.0);
                }
            }
            return;
        };

        for (axis, value) in sensors.axes_with_offset(&self.inner.axes) {
            let value = value.unwrap_or_else(|| {
                tracing::warn!(%axis, "no laser reading, dimension set to 0");
                0.0
            });
            dimensions.set(axis, value);
        }
    }

    /// Pulse the mapped target, then the release target even if the first
    /// pulse failed. Returns the gate window and the first failure with the
    /// target it happened on.
    async fn actuate(&self, mapped: u32) -> (Duration, std::result::Result<(), (u32, Error)>) {
        let targets = read(&self.inner.targets);
        let release_id = self.inner.actuation.release_target;

        let mapped_target = targets.get(mapped);
        let mapped_pulse = mapped_target.and_then(|t| t.pulse());
        let release_pulse = if release_id == mapped {
            None
        } else {
            targets
                .get(release_id)
                .filter(|t| t.is_configured())
                .map(|t| t.pulse().or(mapped_pulse).unwrap_or(DEFAULT_PULSE_SECONDS))
        };

        let window_seconds = mapped_pulse
            .unwrap_or(DEFAULT_PULSE_SECONDS)
            .max(release_pulse.unwrap_or(0))
            .max(1);
        let window = Duration::from_secs(u64::from(window_seconds));

        let mapped_result = match targets.coil_target(mapped) {
            Ok(coil) => self.inner.coil.pulse(&coil, mapped_pulse).await,
            Err(e) => Err(e),
        }
        .map_err(|e| (mapped, e));
        if let Err((_, e)) = &mapped_result {
            tracing::warn!(routed_to = mapped, error = %e, "mapped pulse failed, releasing anyway");
        }

        let release_result = if release_id == mapped {
            Ok(())
        } else {
            match (release_pulse, targets.coil_target(release_id)) {
                (Some(pulse), Ok(release_coil)) => self
                    .inner
                    .coil
                    .pulse(&release_coil, Some(pulse))
                    .await
                    .map_err(|e| (release_id, e)),
                _ => {
                    tracing::warn!(release = release_id, "release target not configured, skipping release");
                    Ok(())
                }
            }
        };

        (window, mapped_result.and(release_result))
    }

    fn set_state(&self, state: ScanState) {
        let changed = {
            let mut current = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, state) != state
        };
        if changed {
            tracing::debug!(%state, "scan state");
            self.emit(ScanEvent::State(state));
        }
    }

    fn pause(&self, reason: ScanEvent) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.set_state(ScanState::Paused);
        self.emit(reason);
    }

    fn emit(&self, event: ScanEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}
