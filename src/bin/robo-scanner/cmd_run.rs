use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use robo_scanner::{
    calibration::CalibrationProfile,
    coil::{CoilClient, Pausable},
    config::Config,
    laser::SMOOTHING_WINDOW,
    orchestrator::{ScanEvent, ScanOrchestrator},
    watcher::InputWatcher,
};
use tokio::sync::mpsc;

use super::{handle_signals, setup, Cli};

/// Re-read rules, targets and calibration into a running scanner. Camera,
/// laser and watcher settings only take effect on restart.
fn reload(path: &Path, scanner: &ScanOrchestrator) -> Result<()> {
    let cfg = Config::from_file(&path.to_path_buf())
        .with_context(|| format!("reloading config from {}", path.display()))?;
    let profile = CalibrationProfile::load(&cfg.profile_path())?;

    scanner.set_rules(cfg.rules.clone());
    scanner.set_targets(cfg.actuation_targets());
    scanner.set_profile(profile);
    tracing::info!(rules = cfg.rules.len(), targets = cfg.targets.len(), "configuration reloaded");
    Ok(())
}

#[cfg(unix)]
fn reload_on_hangup(path: &Path, scanner: &ScanOrchestrator) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = signal(SignalKind::hangup())?;
    let path = path.to_path_buf();
    let scanner = scanner.clone();
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            tracing::info!("received SIGHUP");
            if let Err(e) = reload(&path, &scanner) {
                tracing::warn!(error = format!("{:?}", e), "keeping previous configuration");
            }
        }
    });
    Ok(())
}

pub async fn main(cli: &Cli, cfg: &Config) -> Result<()> {
    let sensors = setup::sensors(cfg);
    if let Some(sensors) = &sensors {
        sensors.start();
    }

    let watcher = match cfg.actuation_targets().coil_target(cfg.actuation.trigger_target) {
        Ok(target) => Some(Arc::new(InputWatcher::new(target, cfg.watcher.poll_interval()))),
        Err(e) => {
            tracing::warn!(error = %e, "no start signal configured, scans will not be triggered");
            None
        }
    };
    let pausables: Vec<Arc<dyn Pausable>> = watcher
        .iter()
        .map(|w| -> Arc<dyn Pausable> { w.clone() })
        .collect();

    let scanner = setup::scanner(cfg, CoilClient::with_pausables(pausables), sensors.clone())?;

    let mut events = scanner.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ScanEvent::State(_) => {}
                ScanEvent::Classified(outcome) => tracing::info!(
                    group = outcome.group_index,
                    name = %outcome.group_name,
                    count = outcome.counter.count,
                    limit = outcome.counter.limit,
                    "part routed"
                ),
                ScanEvent::NoRule { dimensions } => {
                    tracing::warn!(?dimensions, "paused: no usable classification rule")
                }
                ScanEvent::GroupFull { group_index, name } => {
                    tracing::warn!(group = group_index, %name, "paused: bin full, empty it and reset the counter")
                }
                ScanEvent::ActuationFailed { target, error } => {
                    tracing::error!(target_id = target, %error, "paused: relay not driven")
                }
            }
        }
    });

    let (triggers, trigger_rx) = mpsc::channel(1);
    match &watcher {
        Some(watcher) => watcher.start(triggers),
        None => drop(triggers),
    }
    let serving = {
        let scanner = scanner.clone();
        tokio::spawn(async move { scanner.serve(trigger_rx).await })
    };

    #[cfg(unix)]
    reload_on_hangup(&cli.config, &scanner)?;

    scanner.start();
    handle_signals().await?;

    tracing::info!("triggering cleanup...");
    scanner.stop();
    if let Some(watcher) = &watcher {
        watcher.stop().await;
    }
    // The watcher held the only sender, so serve() returns once it stops.
    if let Err(e) = serving.await {
        tracing::warn!(error = format!("{:?}", e), "trigger loop ended abnormally");
    }
    if let Some(sensors) = &sensors {
        sensors.stop().await;
    }
    tracing::info!("all clean, exiting!");

    Ok(())
}

pub async fn scan_once(cli: &Cli, cfg: &Config) -> Result<()> {
    let sensors = setup::sensors(cfg);
    if let Some(sensors) = &sensors {
        sensors.start();
        // Let the averages fill before measuring.
        tokio::time::sleep(sensors.config().poll_interval() * SMOOTHING_WINDOW as u32).await;
    }

    let scanner = setup::scanner(cfg, CoilClient::default(), sensors.clone())?;
    scanner.start();
    let outcome = scanner.trigger().await;

    if let Some(sensors) = &sensors {
        sensors.stop().await;
    }

    let outcome = outcome?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        let d = outcome.dimensions;
        println!(
            "{:.1} x {:.1} x {:.1} mm -> {} (group {}, target {}, {}/{})",
            d.length,
            d.width,
            d.height,
            outcome.group_name,
            outcome.group_index,
            outcome.target,
            outcome.counter.count,
            outcome.counter.limit
        );
    }
    Ok(())
}
