use anyhow::Result;
use chrono::{Duration, Utc};
use robo_scanner::{config::Config, counters::GroupCounters, history::ScanHistory};

use super::Cli;

fn load(cfg: &Config) -> Result<GroupCounters> {
    let mut counters = GroupCounters::load(&cfg.counters_path(), cfg.actuation.group_limit)?;
    counters.refresh_from_rules(&cfg.rules);
    Ok(counters)
}

pub fn show(cli: &Cli, cfg: &Config) -> Result<()> {
    let counters = load(cfg)?;

    if cli.json {
        let all: Vec<_> = counters.iter().collect();
        println!("{}", serde_json::to_string_pretty(&all)?);
        return Ok(());
    }

    for counter in counters.iter() {
        let last = counter
            .last_measurement
            .map(|d| format!("{:.1} x {:.1} x {:.1} mm", d.length, d.width, d.height))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>3} {:<20} {:>4}/{:<4}{}  last: {}",
            counter.group_index,
            counter.name,
            counter.count,
            counter.limit,
            if counter.is_full() { " FULL" } else { "     " },
            last
        );
    }

    let history = ScanHistory::load(&cfg.history_path())?;
    let now = Utc::now();
    println!(
        "scanned in the last hour: {}, last 24 hours: {}",
        history.count_between(now - Duration::hours(1), now),
        history.count_between(now - Duration::hours(24), now)
    );
    Ok(())
}

pub fn reset(cfg: &Config, group: Option<u32>) -> Result<()> {
    let mut counters = load(cfg)?;
    match group {
        Some(index) => {
            counters.reset(index, true);
            tracing::info!(group = index, "counter reset");
        }
        None => {
            counters.reset_all();
            tracing::info!("all counters reset");
        }
    }
    Ok(())
}
