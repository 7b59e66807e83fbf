//! Append-only log of classified parts, one JSON object per line.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the history file inside the state directory.
pub const HISTORY_FILE: &str = "scan_history.jsonl";

/// One classified part.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScanRecord {
    /// When the part was classified.
    pub at: DateTime<Utc>,
    /// Group it went to.
    pub group_index: u32,
    /// Group name at the time.
    pub group_name: String,
    /// Length in millimeters.
    pub x: f64,
    /// Width in millimeters.
    pub y: f64,
    /// Height in millimeters.
    pub z: f64,
}

/// The scan history, optionally backed by a file.
#[derive(Debug, Clone, Default)]
pub struct ScanHistory {
    path: Option<PathBuf>,
    records: Vec<ScanRecord>,
}

impl ScanHistory {
    /// History that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the history at `path`. Lines that do not parse are skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let mut records = Vec::new();
        if path.exists() {
            let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            for (number, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str(line) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!(line = number + 1, error = %e, path = %path.display(), "skipping bad history line")
                    }
                }
            }
        }

        Ok(Self {
            path: Some(path.to_path_buf()),
            records,
        })
    }

    /// Add a record and append it to the file. A write failure is logged and
    /// the record is still kept in memory.
    pub fn append(&mut self, record: ScanRecord) {
        if let Some(path) = &self.path {
            if let Err(e) = append_line(path, &record) {
                tracing::warn!(error = format!("{:?}", e), path = %path.display(), "failed to append scan record");
            }
        }
        self.records.push(record);
    }

    /// All records, oldest first.
    pub fn records(&self) -> &[ScanRecord] {
        &self.records
    }

    /// Number of records with `from <= at <= to`.
    pub fn count_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> usize {
        self.records.iter().filter(|r| r.at >= from && r.at <= to).count()
    }
}

fn append_line(path: &Path, record: &ScanRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", serde_json::to_string(record)?)?;
    Ok(())
}
