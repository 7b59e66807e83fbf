use std::sync::Arc;

use anyhow::{bail, Context, Result};
use robo_scanner::{
    calibration::CalibrationProfile,
    coil::CoilClient,
    config::Config,
    counters::GroupCounters,
    frame::{FrameSource, ImageFileSource},
    gate::ActuationGate,
    history::ScanHistory,
    laser::DistanceSensors,
    orchestrator::{ScanDevices, ScanOrchestrator, ScanSettings},
};

/// The top and side cameras.
pub fn cameras(cfg: &Config) -> Result<(Arc<dyn FrameSource>, Arc<dyn FrameSource>)> {
    let (Some(top), Some(side)) = (&cfg.cameras.top, &cfg.cameras.side) else {
        bail!("both [cameras] top and side must be configured");
    };
    if !cfg.cameras.is_complete() {
        bail!("camera paths must not be empty");
    }
    Ok((
        Arc::new(ImageFileSource::new("top", top)),
        Arc::new(ImageFileSource::new("side", side)),
    ))
}

/// Distance sensors, if the config has a gateway with a host.
pub fn sensors(cfg: &Config) -> Option<DistanceSensors> {
    cfg.laser
        .as_ref()
        .filter(|laser| !laser.host.trim().is_empty())
        .map(|laser| DistanceSensors::new(laser.clone()))
}

/// A stopped orchestrator wired from `cfg` and its state directory.
pub fn scanner(cfg: &Config, coil: CoilClient, sensors: Option<DistanceSensors>) -> Result<ScanOrchestrator> {
    let (top, side) = cameras(cfg)?;

    let profile = CalibrationProfile::load(&cfg.profile_path())?;
    if !profile.is_complete() {
        tracing::warn!(path = %cfg.profile_path().display(), "calibration incomplete, run `calibrate` first");
    }
    let counters = GroupCounters::load(&cfg.counters_path(), cfg.actuation.group_limit)
        .with_context(|| "loading group counters")?;
    let history = ScanHistory::load(&cfg.history_path()).with_context(|| "loading scan history")?;

    Ok(ScanOrchestrator::new(
        ScanSettings::from_config(cfg, profile),
        ScanDevices {
            top,
            side,
            coil,
            gate: ActuationGate::new(),
            sensors,
            counters,
            history,
        },
    ))
}
