use anyhow::{bail, Context, Result};
use robo_scanner::{coil::CoilClient, config::Config};

use super::{setup, Cli};

pub async fn pulse(cfg: &Config, id: u32, seconds: Option<u32>) -> Result<()> {
    let targets = cfg.actuation_targets();
    let target = targets.get(id).with_context(|| format!("no target {id} in the config"))?;
    let coil = target.coil_target()?;

    CoilClient::default().pulse(&coil, seconds.or(target.pulse())).await?;
    tracing::info!(device = %coil, "pulse done");
    Ok(())
}

pub async fn set_coil(cfg: &Config, id: u32, value: bool) -> Result<()> {
    let coil = cfg.actuation_targets().coil_target(id)?;
    CoilClient::default().set(&coil, value).await?;
    tracing::info!(device = %coil, value, "coil written");
    Ok(())
}

pub async fn laser(cli: &Cli, cfg: &Config, count: Option<usize>) -> Result<()> {
    let Some(sensors) = setup::sensors(cfg) else {
        bail!("no [laser] gateway configured");
    };
    sensors.start();

    let mut interval = tokio::time::interval(sensors.config().poll_interval());
    let mut printed = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {}
        }

        let readings = sensors.readings();
        if cli.json {
            println!("{}", serde_json::to_string(&readings)?);
        } else {
            let cells: Vec<String> = readings
                .iter()
                .enumerate()
                .map(|(i, r)| match r {
                    Some(mm) => format!("sensor {}: {mm:7.1} mm", i + 1),
                    None => format!("sensor {}:       --", i + 1),
                })
                .collect();
            println!("{}", cells.join("  "));
        }

        printed += 1;
        if count.is_some_and(|n| printed >= n) {
            break;
        }
    }

    sensors.stop().await;
    Ok(())
}
