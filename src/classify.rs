//! Size-group rules and the selection of the rule a part belongs to.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

fn default_active() -> bool {
    true
}

/// A size group: parts strictly larger than all three limits may go here.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClassificationRule {
    /// Group number, also the key of its counter.
    pub index: u32,

    /// Operator-facing name.
    #[serde(default)]
    pub name: String,

    /// Inactive rules never match.
    #[serde(default = "default_active")]
    pub active: bool,

    /// Length limit in millimeters.
    #[serde(default)]
    pub max_x: Option<f64>,

    /// Width limit in millimeters.
    #[serde(default)]
    pub max_y: Option<f64>,

    /// Height limit in millimeters.
    #[serde(default)]
    pub max_z: Option<f64>,

    /// Actuation target id parts of this group are routed to.
    #[serde(default)]
    pub target: Option<u32>,
}

impl ClassificationRule {
    /// The three limits, if all are set.
    pub fn limits(&self) -> Option<(f64, f64, f64)> {
        Some((self.max_x?, self.max_y?, self.max_z?))
    }

    /// Whether this rule takes part in classification.
    pub fn is_candidate(&self) -> bool {
        self.active && self.target.is_some() && self.limits().is_some()
    }

    /// Name, falling back to the group number.
    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            format!("Group {}", self.index)
        } else {
            self.name.clone()
        }
    }
}

fn by_limits(a: &(f64, f64, f64), b: &(f64, f64, f64)) -> Ordering {
    a.0.total_cmp(&b.0)
        .then_with(|| a.1.total_cmp(&b.1))
        .then_with(|| a.2.total_cmp(&b.2))
}

/// Pick the rule for a part measuring `length` x `width` x `height`.
///
/// Candidates are sorted by their limits; the last one the part strictly
/// exceeds on every axis wins. A part that exceeds none falls back to the
/// smallest candidate. Returns `None` only when there are no candidates.
pub fn select(rules: &[ClassificationRule], length: f64, width: f64, height: f64) -> Option<&ClassificationRule> {
    let mut candidates: Vec<(&ClassificationRule, (f64, f64, f64))> = rules
        .iter()
        .filter(|rule| rule.active && rule.target.is_some())
        .filter_map(|rule| rule.limits().map(|limits| (rule, limits)))
        .collect();
    // Stable, so equal limits keep configuration order.
    candidates.sort_by(|a, b| by_limits(&a.1, &b.1));

    candidates
        .iter()
        .rev()
        .find(|(_, (max_x, max_y, max_z))| length > *max_x && width > *max_y && height > *max_z)
        .or_else(|| candidates.first())
        .map(|(rule, _)| *rule)
}
