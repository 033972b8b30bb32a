//! Core domain model and rollup policy types for bricksync.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bricksync-core";

/// Base tables in the order their statement files must be applied.
pub const DEFAULT_LOAD_ORDER: &[&str] = &[
    "themes",
    "sets",
    "minifigs",
    "inventories",
    "inventory_minifigs",
    "inventory_sets",
];

/// A catalog entry from the `sets` base table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub set_num: String,
    pub theme_id: i64,
    pub year: i32,
}

/// A row of the `themes` reference table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
}

/// A row of `recent_set_additions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentAddition {
    pub id: i64,
    pub set_num: String,
    pub theme_id: i64,
    pub added_date: DateTime<Utc>,
}

/// A row of `popular_themes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularitySnapshot {
    pub id: i64,
    pub theme_id: i64,
    pub collection_count: i64,
    pub snapshot_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Every derived-table statement commits on its own; a failing statement
    /// is logged and the rollup moves on.
    #[default]
    AutoCommit,
    /// The delta and rollup sequence runs in one transaction and the first
    /// failing statement rolls the whole sequence back.
    Atomic,
}

impl fmt::Display for CommitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitMode::AutoCommit => f.write_str("autocommit"),
            CommitMode::Atomic => f.write_str("atomic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCommitModeError(pub String);

impl fmt::Display for ParseCommitModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown commit mode `{}` (expected autocommit or atomic)", self.0)
    }
}

impl std::error::Error for ParseCommitModeError {}

impl FromStr for CommitMode {
    type Err = ParseCommitModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "autocommit" | "auto" | "auto_commit" => Ok(CommitMode::AutoCommit),
            "atomic" | "transaction" | "all_or_nothing" => Ok(CommitMode::Atomic),
            other => Err(ParseCommitModeError(other.to_string())),
        }
    }
}

/// Named policy values for one rollup pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupPolicy {
    /// Maximum `recent_set_additions` rows inserted per theme.
    pub recent_cap: usize,
    /// Number of themes recorded in each popularity snapshot.
    pub popular_top_n: usize,
    pub popular_retention_weeks: u32,
    pub commit_mode: CommitMode,
}

impl Default for RollupPolicy {
    fn default() -> Self {
        Self {
            recent_cap: 3,
            popular_top_n: 5,
            popular_retention_weeks: 12,
            commit_mode: CommitMode::AutoCommit,
        }
    }
}

impl RollupPolicy {
    pub fn popular_retention(&self) -> TimeDelta {
        TimeDelta::weeks(i64::from(self.popular_retention_weeks))
    }

    /// Snapshots stamped strictly before this instant are pruned.
    pub fn popular_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.popular_retention()
    }
}

/// Plan the `recent_set_additions` inserts for one pass.
///
/// `candidates` may arrive in any order; within each theme they are ranked
/// newest first by `(year desc, set_num desc)`. A theme only receives rows while
/// its current count (from `existing_counts`) is below `cap`. Rows already over
/// the cap are left alone.
pub fn plan_recent_additions(
    candidates: &[Item],
    existing_counts: &HashMap<i64, usize>,
    cap: usize,
) -> Vec<Item> {
    let mut by_theme: BTreeMap<i64, Vec<&Item>> = BTreeMap::new();
    for item in candidates {
        by_theme.entry(item.theme_id).or_default().push(item);
    }

    let mut planned = Vec::new();
    for (theme_id, mut items) in by_theme {
        items.sort_by(|a, b| {
            b.year
                .cmp(&a.year)
                .then_with(|| b.set_num.cmp(&a.set_num))
        });
        let current = existing_counts.get(&theme_id).copied().unwrap_or(0);
        let room = cap.saturating_sub(current);
        planned.extend(items.into_iter().take(room).cloned());
    }
    planned
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep {
    pub step: String,
    pub error: String,
}

/// Outcome of one `update_rollups` pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupReport {
    pub run_id: Uuid,
    pub commit_mode: CommitMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub new_item_ids: usize,
    pub affected_themes: Vec<i64>,
    pub recent_rows_deleted: u64,
    pub recent_rows_inserted: u64,
    /// Candidates left out because their theme was already at the cap.
    pub recent_rows_capped: usize,
    pub popular_rows_inserted: u64,
    pub popular_rows_pruned: u64,
    pub failed_steps: Vec<FailedStep>,
}

impl RollupReport {
    pub fn new(run_id: Uuid, commit_mode: CommitMode, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            commit_mode,
            started_at,
            finished_at: started_at,
            new_item_ids: 0,
            affected_themes: Vec::new(),
            recent_rows_deleted: 0,
            recent_rows_inserted: 0,
            recent_rows_capped: 0,
            popular_rows_inserted: 0,
            popular_rows_pruned: 0,
            failed_steps: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

/// Per-file result of applying a generated statement file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedFile {
    pub table: String,
    pub path: String,
    pub sha256: String,
    pub executed: usize,
    pub failed: usize,
    /// Set when the file could not be applied at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub files: Vec<LoadedFile>,
    pub skipped_tables: Vec<String>,
}

impl LoadReport {
    pub fn executed(&self) -> usize {
        self.files.iter().map(|f| f.executed).sum()
    }

    pub fn failed(&self) -> usize {
        self.files.iter().map(|f| f.failed).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(set_num: &str, theme_id: i64, year: i32) -> Item {
        Item {
            set_num: set_num.to_string(),
            theme_id,
            year,
        }
    }

    #[test]
    fn plan_orders_newest_first_by_year_then_set_num() {
        let candidates = vec![
            item("1000-1", 7, 2021),
            item("2000-1", 7, 2023),
            item("1500-1", 7, 2023),
            item("0900-1", 7, 2019),
        ];
        let planned = plan_recent_additions(&candidates, &HashMap::new(), 3);
        let nums: Vec<_> = planned.iter().map(|i| i.set_num.as_str()).collect();
        assert_eq!(nums, vec!["2000-1", "1500-1", "1000-1"]);
    }

    #[test]
    fn plan_respects_existing_rows_per_theme() {
        let candidates = vec![
            item("a-1", 1, 2024),
            item("a-2", 1, 2023),
            item("b-1", 2, 2022),
            item("b-2", 2, 2021),
        ];
        let existing = HashMap::from([(1, 2), (2, 3)]);
        let planned = plan_recent_additions(&candidates, &existing, 3);
        assert_eq!(planned, vec![item("a-1", 1, 2024)]);
    }

    #[test]
    fn plan_never_evicts_when_theme_is_over_cap() {
        let candidates = vec![item("x-1", 9, 2024)];
        let existing = HashMap::from([(9, 5)]);
        assert!(plan_recent_additions(&candidates, &existing, 3).is_empty());
    }

    #[test]
    fn commit_mode_parses_aliases() {
        assert_eq!("atomic".parse::<CommitMode>(), Ok(CommitMode::Atomic));
        assert_eq!(" AutoCommit ".parse::<CommitMode>(), Ok(CommitMode::AutoCommit));
        assert!("sometimes".parse::<CommitMode>().is_err());
    }

    #[test]
    fn retention_cutoff_is_twelve_weeks_by_default() {
        let now = Utc.with_ymd_and_hms(2026, 3, 29, 12, 0, 0).single().unwrap();
        let cutoff = RollupPolicy::default().popular_cutoff(now);
        assert_eq!(cutoff, Utc.with_ymd_and_hms(2026, 1, 4, 12, 0, 0).single().unwrap());
    }

    #[test]
    fn rollup_report_serializes_commit_mode_in_snake_case() {
        let started = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let report = RollupReport::new(Uuid::nil(), CommitMode::AutoCommit, started);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["commit_mode"], "auto_commit");
        assert!(report.is_clean());
    }
}
