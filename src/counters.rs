//! Per-group part counters.
//!
//! Every classified part bumps its group's counter. When a group first
//! reaches its limit the line pauses so the operator can empty the bin.
//! Counters survive restarts in `group_counts.json`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{classify::ClassificationRule, Dimensions};

/// Name of the counters file inside the state directory.
pub const COUNTERS_FILE: &str = "group_counts.json";

/// Default number of parts per bin.
pub const DEFAULT_GROUP_LIMIT: u32 = 150;

/// Parts routed to one group.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GroupCounter {
    /// Rule index the counter belongs to.
    pub group_index: u32,
    /// Rule name.
    #[serde(default)]
    pub name: String,
    /// Parts counted since the last reset.
    pub count: u32,
    /// Parts that fit in the bin.
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Dimensions of the most recent part.
    #[serde(default)]
    pub last_measurement: Option<Dimensions>,
    /// When the most recent part was counted.
    #[serde(default)]
    pub last_timestamp: Option<DateTime<Utc>>,
}

fn default_limit() -> u32 {
    DEFAULT_GROUP_LIMIT
}

impl GroupCounter {
    fn new(group_index: u32, name: String, limit: u32) -> Self {
        Self {
            group_index,
            name,
            count: 0,
            limit,
            last_measurement: None,
            last_timestamp: None,
        }
    }

    /// Whether the bin is full.
    pub fn is_full(&self) -> bool {
        self.count >= self.limit
    }
}

/// All group counters, optionally backed by a file.
#[derive(Debug, Clone)]
pub struct GroupCounters {
    path: Option<PathBuf>,
    limit: u32,
    counters: BTreeMap<u32, GroupCounter>,
}

impl GroupCounters {
    /// Counters that are never written to disk.
    pub fn in_memory(limit: u32) -> Self {
        Self {
            path: None,
            limit,
            counters: BTreeMap::new(),
        }
    }

    /// Load counters from `path`; a missing file starts everything at zero.
    /// Every counter takes `limit`.
    pub fn load(path: &Path, limit: u32) -> Result<Self> {
        let mut counters = BTreeMap::new();
        if path.exists() {
            let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let saved: Vec<GroupCounter> =
                serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
            for mut counter in saved {
                counter.limit = limit;
                counters.insert(counter.group_index, counter);
            }
        }

        Ok(Self {
            path: Some(path.to_path_buf()),
            limit,
            counters,
        })
    }

    /// Per-group limit.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// The counter for `index`, if any part or rule created it.
    pub fn get(&self, index: u32) -> Option<&GroupCounter> {
        self.counters.get(&index)
    }

    /// All counters, by group index.
    pub fn iter(&self) -> impl Iterator<Item = &GroupCounter> {
        self.counters.values()
    }

    /// Whether any bin is full.
    pub fn any_full(&self) -> bool {
        self.counters.values().any(GroupCounter::is_full)
    }

    /// Count one part of `measurement` into group `index`. Returns the
    /// updated counter and whether this part filled the bin.
    pub fn record(&mut self, index: u32, measurement: Dimensions, at: DateTime<Utc>) -> (GroupCounter, bool) {
        let limit = self.limit;
        let counter = self
            .counters
            .entry(index)
            .or_insert_with(|| GroupCounter::new(index, format!("Group {index}"), limit));

        let was_full = counter.is_full();
        counter.count += 1;
        counter.last_measurement = Some(measurement);
        counter.last_timestamp = Some(at);
        let just_reached = !was_full && counter.is_full();

        let updated = counter.clone();
        self.persist();
        (updated, just_reached)
    }

    /// Zero one group, optionally forgetting its last part.
    pub fn reset(&mut self, index: u32, clear_last: bool) {
        if let Some(counter) = self.counters.get_mut(&index) {
            counter.count = 0;
            if clear_last {
                counter.last_measurement = None;
                counter.last_timestamp = None;
            }
            self.persist();
        }
    }

    /// Zero every group.
    pub fn reset_all(&mut self) {
        self.counters.values_mut().for_each(|c| c.count = 0);
        self.persist();
    }

    /// Make sure every rule has a counter and that names and limits follow
    /// the rules.
    pub fn refresh_from_rules(&mut self, rules: &[ClassificationRule]) {
        let limit = self.limit;
        for rule in rules {
            let counter = self
                .counters
                .entry(rule.index)
                .or_insert_with(|| GroupCounter::new(rule.index, String::new(), limit));
            counter.name = rule.display_name();
            counter.limit = limit;
        }
        self.persist();
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = self.save(path) {
            tracing::warn!(error = format!("{:?}", e), path = %path.display(), "failed to save group counters");
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let counters: Vec<&GroupCounter> = self.counters.values().collect();
        std::fs::write(path, serde_json::to_string_pretty(&counters)?)?;
        Ok(())
    }
}
