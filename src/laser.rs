//! Live distances from the laser sensors.
//!
//! One background task keeps an EtherNet/IP session to the sensor gateway
//! and reads a single assembly instance per sweep. Up to three sensors are
//! packed into that assembly, each a big-endian `u16` of millimeters at its
//! own byte offset. Readings are smoothed over the last
//! [SMOOTHING_WINDOW] valid samples; any invalid sample clears that
//! sensor's history so stale values never leak into a measurement.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use enip::Session;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle, time::sleep};

use crate::{
    net::resolve,
    retry::{with_retry, RetryPolicy},
    Axis,
};

/// Sensors packed into one assembly.
pub const SENSOR_COUNT: usize = 3;

/// Samples averaged per sensor.
pub const SMOOTHING_WINDOW: usize = 10;

/// Shortest accepted distance, in millimeters.
pub const MIN_DISTANCE_MM: u16 = 5;

/// Longest accepted distance, in millimeters.
pub const MAX_DISTANCE_MM: u16 = 10_000;

/// Polling never runs faster than this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Byte offset of the first sensor when none is configured.
pub const DEFAULT_SENSOR1_OFFSET: usize = 118;

fn default_port() -> u16 {
    enip::DEFAULT_PORT
}

fn default_poll_ms() -> u64 {
    100
}

fn default_timeout_ms() -> u64 {
    2000
}

/// Connection and layout of the sensor gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LaserConfig {
    /// Gateway host name or address. Empty disables polling.
    #[serde(default)]
    pub host: String,

    /// EtherNet/IP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Assembly instance holding all sensors; 0 means no data.
    #[serde(default)]
    pub instance: u16,

    /// Byte offset of each sensor in the assembly, in sensor order.
    #[serde(default)]
    pub offsets: Vec<usize>,

    /// Sweep interval in milliseconds, at least 50.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    /// Bound on connecting and on each request, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LaserConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            instance: 0,
            offsets: Vec::new(),
            poll_ms: default_poll_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl LaserConfig {
    /// Byte offset of the 0-based `sensor`, if it has one.
    pub fn offset(&self, sensor: usize) -> Option<usize> {
        let configured = self.offsets.get(sensor).copied();
        if sensor == 0 {
            return Some(configured.filter(|o| *o > 0).unwrap_or(DEFAULT_SENSOR1_OFFSET));
        }
        configured
    }

    /// Sweep interval, clamped to [MIN_POLL_INTERVAL].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms).max(MIN_POLL_INTERVAL)
    }

    /// Connect and request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Where one dimension comes from.
#[derive(Debug, Copy, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum AxisSource {
    /// The calibrated camera box.
    #[default]
    Camera,
    /// A laser sensor looking at the part: the dimension is `offset_mm`
    /// minus the smoothed distance.
    Laser {
        /// 1-based sensor number.
        sensor: usize,
        /// Distance from the sensor to the empty belt, in millimeters.
        offset_mm: f64,
    },
}

/// Per-axis dimension sources.
#[derive(Debug, Copy, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct AxisSources {
    /// Length.
    #[serde(default)]
    pub x: AxisSource,
    /// Width.
    #[serde(default)]
    pub y: AxisSource,
    /// Height.
    #[serde(default)]
    pub z: AxisSource,
}

impl AxisSources {
    /// Source of `axis`.
    pub fn get(&self, axis: Axis) -> AxisSource {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Whether any axis is measured by laser.
    pub fn uses_laser(&self) -> bool {
        Axis::ALL
            .iter()
            .any(|&axis| matches!(self.get(axis), AxisSource::Laser { .. }))
    }
}

/// Extract the distance of one sensor from an assembly. Returns `None` if
/// the buffer is too short or the value is outside
/// [MIN_DISTANCE_MM]..=[MAX_DISTANCE_MM].
pub fn parse_distance_mm(raw: &[u8], offset: usize) -> Option<u16> {
    let bytes = raw.get(offset..offset.checked_add(2)?)?;
    let value = u16::from_be_bytes([bytes[0], bytes[1]]);
    (MIN_DISTANCE_MM..=MAX_DISTANCE_MM).contains(&value).then_some(value)
}

/// Circular buffer of the last [SMOOTHING_WINDOW] samples.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct SmoothingBuffer {
    samples: [f64; SMOOTHING_WINDOW],
    len: usize,
    next: usize,
}

impl SmoothingBuffer {
    /// Add a sample, evicting the oldest once full.
    pub fn push(&mut self, sample: f64) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % SMOOTHING_WINDOW;
        self.len = (self.len + 1).min(SMOOTHING_WINDOW);
    }

    /// Mean of the held samples.
    pub fn mean(&self) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        Some(self.samples[..self.len].iter().sum::<f64>() / self.len as f64)
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Number of held samples.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no samples are held.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Default)]
struct Buffers([SmoothingBuffer; SENSOR_COUNT]);

impl Buffers {
    fn update(&mut self, raw: &[u8], config: &LaserConfig) {
        for (sensor, buffer) in self.0.iter_mut().enumerate() {
            match config.offset(sensor).and_then(|offset| parse_distance_mm(raw, offset)) {
                Some(mm) => buffer.push(f64::from(mm)),
                None => {
                    if !buffer.is_empty() {
                        tracing::debug!(sensor = sensor + 1, raw_len = raw.len(), "no valid distance");
                    }
                    buffer.clear();
                }
            }
        }
    }

    fn clear(&mut self) {
        self.0.iter_mut().for_each(SmoothingBuffer::clear);
    }
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Handle to the sensor poller. Clones share the readings and the task.
#[derive(Clone)]
pub struct DistanceSensors {
    config: Arc<LaserConfig>,
    buffers: Arc<Mutex<Buffers>>,
    running: Arc<Mutex<Option<Running>>>,
}

impl std::fmt::Debug for DistanceSensors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistanceSensors")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl DistanceSensors {
    /// A stopped poller for the gateway in `config`.
    pub fn new(config: LaserConfig) -> Self {
        Self {
            config: Arc::new(config),
            buffers: Arc::new(Mutex::new(Buffers::default())),
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// The gateway configuration.
    pub fn config(&self) -> &LaserConfig {
        &self.config
    }

    /// Spawn the polling task. Does nothing if it is already running or no
    /// host is configured.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }
        if self.config.host.trim().is_empty() {
            tracing::warn!("no laser host configured, distance polling disabled");
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(poll_loop(self.config.clone(), self.buffers.clone(), stop_rx));
        *running = Some(Running { stop, handle });
        tracing::info!(host = %self.config.host, instance = self.config.instance, "distance polling started");
    }

    /// Stop the polling task, wait for it to close its session, and drop all
    /// readings.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Running { stop, handle }) = running {
            let _ = stop.send(true);
            if let Err(e) = handle.await {
                tracing::warn!(error = format!("{:?}", e), "distance poller ended abnormally");
            }
            tracing::info!("distance polling stopped");
        }
        self.reset_averaging();
    }

    /// Whether the polling task is alive.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Smoothed distance of the 0-based `sensor`, in millimeters.
    pub fn reading(&self, sensor: usize) -> Option<f64> {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.0.get(sensor).and_then(SmoothingBuffer::mean)
    }

    /// Smoothed distances of all sensors.
    pub fn readings(&self) -> [Option<f64>; SENSOR_COUNT] {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.0.map(|b| b.mean())
    }

    /// Dimensions for the laser-sourced axes in `sources`: the axis offset
    /// minus the smoothed distance, or `None` when the sensor has no data.
    pub fn axes_with_offset(&self, sources: &AxisSources) -> Vec<(Axis, Option<f64>)> {
        Axis::ALL
            .iter()
            .filter_map(|&axis| match sources.get(axis) {
                AxisSource::Camera => None,
                AxisSource::Laser { sensor, offset_mm } => {
                    let distance = sensor.checked_sub(1).and_then(|s| self.reading(s));
                    Some((axis, distance.map(|d| offset_mm - d)))
                }
            })
            .collect()
    }

    /// Forget all smoothing history.
    pub fn reset_averaging(&self) {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

async fn connect(config: &LaserConfig) -> enip::Result<Session> {
    with_retry(&RetryPolicy::default(), "connect distance sensor", move |_| async move {
        let addr = resolve(&config.host, config.port).await?;
        Session::connect(addr, config.timeout()).await
    })
    .await
}

/// Read one assembly, connecting first if needed. The session stays in
/// `session` while the read is in flight, so a cancelled sweep still leaves
/// it to be unregistered.
async fn sweep(session: &mut Option<Session>, config: &LaserConfig) -> enip::Result<Vec<u8>> {
    let active = match session {
        Some(active) => active,
        slot @ None => slot.insert(connect(config).await?),
    };
    active.read_assembly(config.instance).await
}

async fn poll_loop(config: Arc<LaserConfig>, buffers: Arc<Mutex<Buffers>>, mut stop: watch::Receiver<bool>) {
    let interval = config.poll_interval();
    let mut session: Option<Session> = None;

    loop {
        if *stop.borrow() {
            break;
        }

        if config.instance == 0 {
            buffers.lock().unwrap_or_else(PoisonError::into_inner).clear();
        } else {
            let outcome = tokio::select! {
                _ = stop.changed() => break,
                outcome = sweep(&mut session, &config) => outcome,
            };
            match outcome {
                Ok(raw) => buffers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .update(&raw, &config),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        host = %config.host,
                        instance = config.instance,
                        "distance sweep failed, reconnecting next interval"
                    );
                    buffers.lock().unwrap_or_else(PoisonError::into_inner).clear();
                    session = None;
                }
            }
        }

        tokio::select! {
            _ = stop.changed() => break,
            _ = sleep(interval) => {}
        }
    }

    if let Some(session) = session {
        if let Err(e) = session.close().await {
            tracing::debug!(error = %e, "unregistering distance sensor session failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn assembly(offset: usize, value: u16) -> Vec<u8> {
        let mut raw = vec![0u8; offset + 2];
        raw[offset..].copy_from_slice(&value.to_be_bytes());
        raw
    }

    #[test]
    fn test_parse_distance_mm() {
        assert_eq!(parse_distance_mm(&assembly(118, 250), 118), Some(250));
        assert_eq!(parse_distance_mm(&assembly(0, 5), 0), Some(5));
        assert_eq!(parse_distance_mm(&assembly(0, 10_000), 0), Some(10_000));
    }

    #[test]
    fn test_parse_distance_mm_rejects() {
        assert_eq!(parse_distance_mm(&assembly(4, 4), 4), None);
        assert_eq!(parse_distance_mm(&assembly(4, 10_001), 4), None);
        assert_eq!(parse_distance_mm(&[0x01], 0), None);
        assert_eq!(parse_distance_mm(&assembly(4, 100), 5), None);
        assert_eq!(parse_distance_mm(&[], usize::MAX), None);
    }

    #[test]
    fn test_smoothing_buffer_window() {
        let mut buffer = SmoothingBuffer::default();
        assert_eq!(buffer.mean(), None);

        buffer.push(10.0);
        buffer.push(20.0);
        assert_eq!(buffer.mean(), Some(15.0));

        for _ in 0..SMOOTHING_WINDOW {
            buffer.push(100.0);
        }
        assert_eq!(buffer.len(), SMOOTHING_WINDOW);
        assert_eq!(buffer.mean(), Some(100.0));

        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_sensor_offsets() {
        let config = LaserConfig {
            offsets: vec![0, 10],
            ..Default::default()
        };
        assert_eq!(config.offset(0), Some(DEFAULT_SENSOR1_OFFSET));
        assert_eq!(config.offset(1), Some(10));
        assert_eq!(config.offset(2), None);

        let slow = LaserConfig {
            poll_ms: 10,
            ..Default::default()
        };
        assert_eq!(slow.poll_interval(), MIN_POLL_INTERVAL);
    }

    #[test]
    fn test_invalid_sample_clears_only_that_sensor() {
        let config = LaserConfig {
            offsets: vec![2, 4, 6],
            ..Default::default()
        };
        let mut buffers = Buffers::default();

        buffers.update(&[0, 0, 0, 100, 0, 200, 0, 50], &config);
        buffers.update(&[0, 0, 0, 110, 0, 200, 0, 50], &config);
        assert_eq!(buffers.0[0].mean(), Some(105.0));
        assert_eq!(buffers.0[2].len(), 2);

        // Sensor 2 drops out of range.
        buffers.update(&[0, 0, 0, 120, 0, 1, 0, 50], &config);
        assert_eq!(buffers.0[0].mean(), Some(110.0));
        assert!(buffers.0[1].is_empty());
        assert_eq!(buffers.0[2].len(), 3);
    }

    #[test]
    fn test_axes_with_offset() {
        let sensors = DistanceSensors::new(LaserConfig {
            offsets: vec![4, 0],
            ..Default::default()
        });
        // Sensor 1 reads 300 mm at offset 4, sensor 2 reads nothing.
        sensors
            .buffers
            .lock()
            .unwrap()
            .update(&[0x00, 0x00, 0x00, 0x00, 0x01, 0x2C], &sensors.config);

        let sources = AxisSources {
            x: AxisSource::Camera,
            y: AxisSource::Laser {
                sensor: 2,
                offset_mm: 400.0,
            },
            z: AxisSource::Laser {
                sensor: 1,
                offset_mm: 400.0,
            },
        };
        assert!(sources.uses_laser());
        assert_eq!(sensors.axes_with_offset(&sources), vec![(Axis::Y, None), (Axis::Z, Some(100.0))]);

        sensors.reset_averaging();
        assert_eq!(sensors.readings(), [None, None, None]);
    }

    #[test]
    fn test_axis_sources_from_toml() {
        let sources: AxisSources = toml::from_str(
            r#"
            z = { source = "laser", sensor = 1, offset_mm = 350.0 }
        "#,
        )
        .unwrap();
        assert_eq!(sources.x, AxisSource::Camera);
        assert_eq!(
            sources.z,
            AxisSource::Laser {
                sensor: 1,
                offset_mm: 350.0
            }
        );
    }

    #[tokio::test]
    async fn test_start_without_host_is_noop() {
        let sensors = DistanceSensors::new(LaserConfig::default());
        sensors.start();
        assert!(!sensors.is_running());
        sensors.stop().await;
    }
}
