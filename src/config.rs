//! Code for the configuration of the application.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{
    calibration::PROFILE_FILE,
    classify::ClassificationRule,
    counters::{COUNTERS_FILE, DEFAULT_GROUP_LIMIT},
    history::HISTORY_FILE,
    laser::{AxisSources, LaserConfig},
    measure::{BinarizeOptions, MeasureOptions, MinArea, Polarity},
    targets::{ActuationTarget, ActuationTargets},
    watcher::WatcherConfig,
    Dimensions, Error,
};

fn default_state_dir() -> PathBuf {
    PathBuf::from("robo-scanner-state")
}

fn default_nominal() -> Dimensions {
    Dimensions::new(100.0, 50.0, 50.0)
}

fn default_release_target() -> u32 {
    16
}

fn default_trigger_target() -> u32 {
    17
}

fn default_group_limit() -> u32 {
    DEFAULT_GROUP_LIMIT
}

/// The configuration of the application.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Where the calibration profile, counters and history live.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Frame sources.
    #[serde(default)]
    pub cameras: CamerasConfig,

    /// Preprocessing and thresholding.
    #[serde(default)]
    pub binarization: BinarizeOptions,

    /// Object search and dimension sources.
    #[serde(default)]
    pub measurement: MeasurementConfig,

    /// Reference part used by the calibration workflow.
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Size groups.
    #[serde(default)]
    pub rules: Vec<ClassificationRule>,

    /// Relay channels.
    #[serde(default)]
    pub targets: Vec<ActuationTarget>,

    /// Which targets play special roles.
    #[serde(default)]
    pub actuation: ActuationConfig,

    /// Distance sensor gateway, if fitted.
    #[serde(default)]
    pub laser: Option<LaserConfig>,

    /// Start-signal polling.
    #[serde(default)]
    pub watcher: WatcherConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            cameras: CamerasConfig::default(),
            binarization: BinarizeOptions::default(),
            measurement: MeasurementConfig::default(),
            calibration: CalibrationConfig::default(),
            rules: Vec::new(),
            targets: Vec::new(),
            actuation: ActuationConfig::default(),
            laser: None,
            watcher: WatcherConfig::default(),
        }
    }
}

impl Config {
    /// Parse a configuration from a toml file.
    pub fn from_file(file: &PathBuf) -> Result<Self> {
        let config = std::fs::read_to_string(file)?;
        Self::from_str(&config)
    }

    /// Parse a configuration from a toml string.
    pub fn from_str(config: &str) -> Result<Self> {
        let config: Self = toml::from_str(config)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-references between sections.
    ///
    /// # Errors
    ///
    /// Returns [Error::Config] if two targets or two rules share an id.
    pub fn validate(&self) -> crate::Result<()> {
        let mut ids = HashSet::new();
        if let Some(dup) = self.targets.iter().find(|t| !ids.insert(t.id)) {
            return Err(Error::Config(format!("target id {} is used twice", dup.id)));
        }

        let mut indexes = HashSet::new();
        if let Some(dup) = self.rules.iter().find(|r| !indexes.insert(r.index)) {
            return Err(Error::Config(format!("rule index {} is used twice", dup.index)));
        }

        for rule in self.rules.iter().filter(|r| r.is_candidate()) {
            if let Some(target) = rule.target.filter(|id| !ids.contains(id)) {
                tracing::warn!(rule = rule.index, target, "rule routes to an unconfigured target");
            }
        }
        Ok(())
    }

    /// Options for the image measurer.
    pub fn measure_options(&self) -> MeasureOptions {
        MeasureOptions {
            binarize: self.binarization,
            min_area: self.measurement.min_area,
            polarity: self.measurement.polarity,
        }
    }

    /// The configured actuation targets.
    pub fn actuation_targets(&self) -> ActuationTargets {
        ActuationTargets::new(self.targets.clone())
    }

    /// Path of the calibration profile.
    pub fn profile_path(&self) -> PathBuf {
        self.state_dir.join(PROFILE_FILE)
    }

    /// Path of the group counters.
    pub fn counters_path(&self) -> PathBuf {
        self.state_dir.join(COUNTERS_FILE)
    }

    /// Path of the scan history.
    pub fn history_path(&self) -> PathBuf {
        self.state_dir.join(HISTORY_FILE)
    }
}

/// Where frames come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CamerasConfig {
    /// Image file the top camera writes its latest frame to.
    #[serde(default)]
    pub top: Option<PathBuf>,
    /// Image file the side camera writes its latest frame to.
    #[serde(default)]
    pub side: Option<PathBuf>,
}

impl CamerasConfig {
    /// Whether both views are configured.
    pub fn is_complete(&self) -> bool {
        self.top.as_deref().is_some_and(has_path) && self.side.as_deref().is_some_and(has_path)
    }
}

fn has_path(path: &Path) -> bool {
    !path.as_os_str().is_empty()
}

/// Object search and dimension sources.
#[derive(Debug, Copy, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MeasurementConfig {
    /// Minimum object size.
    #[serde(default)]
    pub min_area: MinArea,
    /// Polarity policy.
    #[serde(default)]
    pub polarity: Polarity,
    /// Per-axis source.
    #[serde(default)]
    pub axes: AxisSources,
}

/// Reference part used by the calibration workflow.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct CalibrationConfig {
    /// Approximate dimensions, used to tell length from width.
    #[serde(default = "default_nominal")]
    pub nominal: Dimensions,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            nominal: default_nominal(),
        }
    }
}

/// Targets with special roles and the bin size.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActuationConfig {
    /// Pulsed after every mapped target to release the part.
    #[serde(default = "default_release_target")]
    pub release_target: u32,
    /// Whose coil carries the external start signal.
    #[serde(default = "default_trigger_target")]
    pub trigger_target: u32,
    /// Parts per bin before the line pauses.
    #[serde(default = "default_group_limit")]
    pub group_limit: u32,
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            release_target: default_release_target(),
            trigger_target: default_trigger_target(),
            group_limit: default_group_limit(),
        }
    }
}
