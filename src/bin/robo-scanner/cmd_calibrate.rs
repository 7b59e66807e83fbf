use anyhow::{bail, Result};
use robo_scanner::{
    calibration::{calibrate, choose_axis_mapping},
    config::Config,
    frame::FrameSource,
    measure::{BoundingRegion, ImageMeasurer},
    Dimensions,
};

use super::{setup, Cli};

async fn measure(measurer: ImageMeasurer, source: &dyn FrameSource) -> Result<BoundingRegion> {
    let frame = source.capture().await?;
    let region = tokio::task::spawn_blocking(move || measurer.measure(&frame)).await??;
    match region {
        Some(region) => Ok(region),
        None => bail!("no object found in the {} frame", source.name()),
    }
}

pub async fn main(cli: &Cli, cfg: &Config, confirmed: Dimensions) -> Result<()> {
    let (top, side) = setup::cameras(cfg)?;
    let measurer = ImageMeasurer::new(cfg.measure_options());

    let top = measure(measurer, top.as_ref()).await?;
    let side = measure(measurer, side.as_ref()).await?;
    tracing::info!(?top, ?side, "reference part measured");

    let mapping = choose_axis_mapping(&top, &cfg.calibration.nominal);
    let profile = calibrate(&top, &side, mapping, &confirmed)?;
    profile.save(&cfg.profile_path())?;
    tracing::info!(path = %cfg.profile_path().display(), ?mapping, "calibration saved");

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
    } else {
        println!("mapping:     {:?}", profile.mapping);
        println!("axis 1 (mm/px): {:.5}", profile.mm_per_px_axis1);
        println!("axis 2 (mm/px): {:.5}", profile.mm_per_px_axis2);
        println!("side   (mm/px): {:.5}", profile.mm_per_px_side);
    }
    Ok(())
}
