use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use robo_scanner::config::Config;
use tracing_subscriber::{prelude::*, EnvFilter};

mod cmd_calibrate;
mod cmd_counters;
mod cmd_device;
mod cmd_run;
mod setup;

/// Measure parts, sort them into size groups and route them to their bins.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "robo-scanner")]
struct Cli {
    /// Config file to use
    #[arg(long, short, default_value = "robo-scanner.toml")]
    config: PathBuf,

    /// Print logs and command output as json
    #[arg(long, short, global = true)]
    json: bool,

    /// Print debug info
    #[arg(long, short, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan every part the start signal announces until interrupted.
    Run,

    /// Scan the part currently in view once and print the outcome.
    Scan,

    /// Measure a reference part and save the calibration profile.
    Calibrate {
        /// True length of the reference part, in millimeters.
        #[arg(long)]
        length: Option<f64>,
        /// True width of the reference part, in millimeters.
        #[arg(long)]
        width: Option<f64>,
        /// True height of the reference part, in millimeters.
        #[arg(long)]
        height: Option<f64>,
    },

    /// Pulse an actuation target's relay.
    Pulse {
        /// Target id.
        target: u32,
        /// Hold time in seconds; 0 latches. Defaults to the target's own.
        #[arg(long, short)]
        seconds: Option<u32>,
    },

    /// Force an actuation target's relay on or off.
    SetCoil {
        /// Target id.
        target: u32,
        /// `true` or `false`.
        #[arg(action = clap::ArgAction::Set)]
        value: bool,
    },

    /// Print live, smoothed distance sensor readings.
    Laser {
        /// Stop after this many samples.
        #[arg(long, short = 'n')]
        count: Option<usize>,
    },

    /// Print the per-group part counters.
    Counters,

    /// Zero the part counters.
    ResetCounters {
        /// Only this group.
        #[arg(long, short)]
        group: Option<u32>,
    },
}

async fn handle_signals() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up SIGINT handler");
            e
        })?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up SIGTERM handler");
            e
        })?;

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await.map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up Ctrl+C handler");
            anyhow::Error::new(e)
        })?;

        tracing::info!("received Ctrl+C (SIGINT)");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    let (json, pretty) = if cli.json {
        (
            Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
            None,
        )
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
    };

    // Initialize tracing.
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .with({
            #[cfg(feature = "debug")]
            {
                // When running with `debug`, we're going to hook in the console
                // subscriber for tokio-console.
                console_subscriber::spawn()
            }
            #[cfg(not(feature = "debug"))]
            {
                // Under normal cases, we need a blank Layer that doesn't
                // do anything.
                tracing_subscriber::layer::Identity::new()
            }
        })
        .init();

    #[cfg(feature = "debug")]
    {
        delouse::init()?;
    }

    let cfg = Config::from_file(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Run => cmd_run::main(&cli, &cfg).await,
        Commands::Scan => cmd_run::scan_once(&cli, &cfg).await,
        Commands::Calibrate { length, width, height } => {
            let nominal = cfg.calibration.nominal;
            let confirmed = robo_scanner::Dimensions::new(
                length.unwrap_or(nominal.length),
                width.unwrap_or(nominal.width),
                height.unwrap_or(nominal.height),
            );
            cmd_calibrate::main(&cli, &cfg, confirmed).await
        }
        Commands::Pulse { target, seconds } => cmd_device::pulse(&cfg, target, seconds).await,
        Commands::SetCoil { target, value } => cmd_device::set_coil(&cfg, target, value).await,
        Commands::Laser { count } => cmd_device::laser(&cli, &cfg, count).await,
        Commands::Counters => cmd_counters::show(&cli, &cfg),
        Commands::ResetCounters { group } => cmd_counters::reset(&cfg, group),
    }
}
