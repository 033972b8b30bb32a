//! Sync pipeline orchestration: snapshot the base ids, apply the generated
//! statement files, then refresh the derived rollups.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bricksync_core::{CommitMode, LoadReport, RollupPolicy, RollupReport, DEFAULT_LOAD_ORDER};
use bricksync_storage::{clean_staging_dir, load_statement_files, redact_url, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod rollup;

pub use rollup::{update_rollups, RollupUpdater, DEFAULT_POPULARITY_SOURCE};

pub const CRATE_NAME: &str = "bricksync-sync";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<DatasetConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatasetConfig {
    pub table: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for DatasetRegistry {
    fn default() -> Self {
        Self {
            datasets: DEFAULT_LOAD_ORDER
                .iter()
                .map(|table| DatasetConfig {
                    table: (*table).to_string(),
                    enabled: true,
                    notes: None,
                })
                .collect(),
        }
    }
}

impl DatasetRegistry {
    /// Read `datasets.yaml` from the workspace root, falling back to the
    /// built-in table order when the file is absent.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("datasets.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        for dataset in &registry.datasets {
            bricksync_storage::validate_identifier(&dataset.table)?;
        }
        Ok(registry)
    }

    pub fn load_order(&self) -> Vec<String> {
        self.datasets
            .iter()
            .filter(|d| d.enabled)
            .map(|d| d.table.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub sql_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub policy: RollupPolicy,
    pub popularity_source: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = match lookup("DATABASE_URL") {
            Some(url) => url,
            None => mysql_url_from_parts(&lookup)?,
        };

        let defaults = RollupPolicy::default();
        let commit_mode = match lookup("BRICKSYNC_COMMIT_MODE") {
            Some(raw) => raw
                .parse::<CommitMode>()
                .context("parsing BRICKSYNC_COMMIT_MODE")?,
            None => defaults.commit_mode,
        };
        let policy = RollupPolicy {
            recent_cap: lookup("BRICKSYNC_RECENT_CAP")
                .map(|v| v.trim().parse::<usize>())
                .transpose()
                .context("parsing BRICKSYNC_RECENT_CAP")?
                .unwrap_or(defaults.recent_cap),
            popular_top_n: lookup("BRICKSYNC_POPULAR_TOP_N")
                .map(|v| v.trim().parse::<usize>())
                .transpose()
                .context("parsing BRICKSYNC_POPULAR_TOP_N")?
                .unwrap_or(defaults.popular_top_n),
            popular_retention_weeks: lookup("BRICKSYNC_POPULAR_RETENTION_WEEKS")
                .map(|v| v.trim().parse::<u32>())
                .transpose()
                .context("parsing BRICKSYNC_POPULAR_RETENTION_WEEKS")?
                .unwrap_or(defaults.popular_retention_weeks),
            commit_mode,
        };

        let popularity_source = lookup("BRICKSYNC_POPULARITY_SOURCE")
            .unwrap_or_else(|| DEFAULT_POPULARITY_SOURCE.to_string());
        bricksync_storage::validate_identifier(&popularity_source)
            .context("validating BRICKSYNC_POPULARITY_SOURCE")?;

        Ok(Self {
            database_url,
            sql_dir: lookup("BRICKSYNC_SQL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sql_output")),
            staging_dir: lookup("BRICKSYNC_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./temp")),
            workspace_root: lookup("BRICKSYNC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            policy,
            popularity_source,
            scheduler_enabled: lookup("BRICKSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: lookup("BRICKSYNC_SYNC_CRON").unwrap_or_else(|| "0 0 4 * * Sun".to_string()),
        })
    }
}

fn mysql_url_from_parts(lookup: &impl Fn(&str) -> Option<String>) -> Result<String> {
    let host = lookup("SQL_DB_HOST");
    let name = lookup("SQL_DB_NAME");
    let (Some(host), Some(name)) = (host, name) else {
        bail!("set DATABASE_URL or SQL_DB_HOST and SQL_DB_NAME");
    };
    let user = lookup("SQL_DB_USER").unwrap_or_default();
    let pass = lookup("SQL_DB_PASS").unwrap_or_default();
    let credentials = match (user.is_empty(), pass.is_empty()) {
        (true, _) => String::new(),
        (false, true) => format!("{}@", encode_userinfo(&user)),
        (false, false) => format!("{}:{}@", encode_userinfo(&user), encode_userinfo(&pass)),
    };
    Ok(format!("mysql://{credentials}{host}/{name}"))
}

/// Percent-encode characters that would end the userinfo part of a url.
fn encode_userinfo(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~".contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pre_reload_ids: i64,
    pub load: LoadReport,
    pub rollup: RollupReport,
    pub staged_files_removed: usize,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: DatasetRegistry,
    rollups: RollupUpdater,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let registry = DatasetRegistry::load(&config.workspace_root)?;
        let rollups = RollupUpdater::new(config.policy.clone(), &config.popularity_source)?;
        Ok(Self {
            config,
            registry,
            rollups,
        })
    }

    pub fn with_registry(mut self, registry: DatasetRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn connect(&self) -> Result<Store> {
        Store::connect(&self.config.database_url)
            .await
            .with_context(|| format!("connecting to {}", redact_url(&self.config.database_url)))
    }

    /// One full pass: snapshot ids, reload base tables, refresh rollups, clean up.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id);

        async move {
            let mut store = self.connect().await?;
            store
                .ensure_derived_schema()
                .await
                .context("ensuring derived schema")?;
            let pre_reload_ids = store
                .capture_pre_reload_ids()
                .await
                .context("capturing pre-reload set ids")?;

            let order = self.registry.load_order();
            let load = load_statement_files(store.conn(), &self.config.sql_dir, &order)
                .await
                .with_context(|| format!("loading statement files from {}", self.config.sql_dir.display()))?;

            let rollup = self
                .rollups
                .run(&mut store, run_id, Utc::now())
                .await
                .context("updating rollups")?;

            store
                .drop_pre_reload_ids()
                .await
                .context("dropping pre-reload set ids")?;
            store.close().await.context("closing store")?;

            let staged_files_removed = clean_staging_dir(&self.config.staging_dir).await?;
            let finished_at = Utc::now();
            info!(
                executed = load.executed(),
                failed = load.failed(),
                rollup_failures = rollup.failed_steps.len(),
                "data update completed"
            );

            Ok(SyncRunSummary {
                run_id,
                started_at,
                finished_at,
                pre_reload_ids,
                load,
                rollup,
                staged_files_removed,
            })
        }
        .instrument(span)
        .await
    }

    /// Rollup pass on its own, against the data currently in the store. With
    /// a freshly captured snapshot the delta is empty, so only the popularity
    /// snapshot and prune take effect.
    pub async fn run_rollups_only(&self) -> Result<RollupReport> {
        let mut store = self.connect().await?;
        store.ensure_derived_schema().await?;
        store.capture_pre_reload_ids().await?;
        let report = self.rollups.run(&mut store, Uuid::new_v4(), Utc::now()).await?;
        store.drop_pre_reload_ids().await?;
        store.close().await?;
        Ok(report)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    SyncPipeline::new(config)?.run_once().await
}

/// Register the sync job on its cron schedule when the scheduler is enabled.
/// A tick that fires while the previous run is still going is skipped.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().sync_cron.clone();
    let running = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let running = Arc::clone(&running);
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous sync still running; skipping this tick");
                return;
            };
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_assembles_mysql_url_from_store_settings() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("SQL_DB_HOST", "db"),
            ("SQL_DB_USER", "brick"),
            ("SQL_DB_PASS", "p@ss:word"),
            ("SQL_DB_NAME", "lego"),
        ]))
        .expect("config");
        assert_eq!(config.database_url, "mysql://brick:p%40ss%3Aword@db/lego");
        assert_eq!(config.policy, RollupPolicy::default());
        assert_eq!(config.popularity_source, DEFAULT_POPULARITY_SOURCE);
        assert!(!config.scheduler_enabled);
    }

    #[test]
    fn database_url_takes_precedence_and_policy_is_overridable() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite://catalog.db"),
            ("SQL_DB_HOST", "ignored"),
            ("BRICKSYNC_RECENT_CAP", "4"),
            ("BRICKSYNC_POPULAR_TOP_N", "10"),
            ("BRICKSYNC_POPULAR_RETENTION_WEEKS", "26"),
            ("BRICKSYNC_COMMIT_MODE", "atomic"),
            ("BRICKSYNC_SCHEDULER_ENABLED", "true"),
        ]))
        .expect("config");
        assert_eq!(config.database_url, "sqlite://catalog.db");
        assert_eq!(
            config.policy,
            RollupPolicy {
                recent_cap: 4,
                popular_top_n: 10,
                popular_retention_weeks: 26,
                commit_mode: CommitMode::Atomic,
            }
        );
        assert!(config.scheduler_enabled);
    }

    #[test]
    fn config_rejects_missing_store_and_bad_values() {
        assert!(SyncConfig::from_lookup(lookup_from(&[])).is_err());
        assert!(SyncConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("BRICKSYNC_COMMIT_MODE", "eventually"),
        ]))
        .is_err());
        assert!(SyncConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("BRICKSYNC_POPULARITY_SOURCE", "x; DROP TABLE sets"),
        ]))
        .is_err());
    }

    #[test]
    fn malformed_policy_numbers_are_errors_not_defaults() {
        for (key, raw) in [
            ("BRICKSYNC_RECENT_CAP", "three"),
            ("BRICKSYNC_RECENT_CAP", "-1"),
            ("BRICKSYNC_POPULAR_TOP_N", "5x"),
            ("BRICKSYNC_POPULAR_RETENTION_WEEKS", ""),
        ] {
            let err = SyncConfig::from_lookup(lookup_from(&[
                ("DATABASE_URL", "sqlite::memory:"),
                (key, raw),
            ]))
            .expect_err("malformed value must be rejected");
            assert!(format!("{err:#}").contains(key), "{key}={raw}: {err:#}");
        }
    }

    #[test]
    fn registry_defaults_to_dependency_order() {
        let dir = tempdir().expect("tempdir");
        let registry = DatasetRegistry::load(dir.path()).expect("registry");
        assert_eq!(
            registry.load_order(),
            DEFAULT_LOAD_ORDER.iter().map(|t| t.to_string()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn registry_yaml_can_disable_tables() {
        let registry = DatasetRegistry::from_yaml(
            "datasets:\n  - table: themes\n  - table: sets\n  - table: minifigs\n    enabled: false\n    notes: not tracked yet\n",
        )
        .expect("yaml");
        assert_eq!(registry.load_order(), vec!["themes", "sets"]);
        assert!(DatasetRegistry::from_yaml("datasets:\n  - table: \"sets;--\"\n").is_err());
    }

    fn sqlite_config(root: &Path) -> SyncConfig {
        let database_url = format!("sqlite://{}?mode=rwc", root.join("catalog.db").display());
        let sql_dir = root.join("sql_output").display().to_string();
        let staging_dir = root.join("temp").display().to_string();
        let workspace_root = root.display().to_string();
        SyncConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", database_url.as_str()),
            ("BRICKSYNC_SQL_DIR", sql_dir.as_str()),
            ("BRICKSYNC_STAGING_DIR", staging_dir.as_str()),
            ("BRICKSYNC_WORKSPACE_ROOT", workspace_root.as_str()),
        ]))
        .expect("config")
    }

    #[tokio::test]
    async fn pipeline_reloads_then_rolls_up_and_cleans_staging() {
        let root = tempdir().expect("tempdir");
        let sql_dir = root.path().join("sql_output");
        let staging = root.path().join("temp");
        std::fs::create_dir_all(&sql_dir).unwrap();
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join(".gitkeep"), b"").unwrap();
        std::fs::write(staging.join("sets.csv"), b"set_num\n").unwrap();

        std::fs::write(
            sql_dir.join("themes_inserts.sql"),
            "INSERT INTO themes (id, name) VALUES (1, 'Town'), (2, 'Space');",
        )
        .unwrap();
        std::fs::write(
            sql_dir.join("sets_inserts.sql"),
            "INSERT INTO sets (set_num, year, theme_id) VALUES ('6000-1', 1990, 1);\n\
             INSERT INTO sets (set_num, year, theme_id) VALUES ('6900-1', 1992, 2);\n\
             INSERT INTO set_collections (set_num, collection_count) VALUES ('6000-1', 12);\n",
        )
        .unwrap();

        let config = sqlite_config(root.path());
        let pipeline = SyncPipeline::new(config).expect("pipeline");
        {
            let mut store = pipeline.connect().await.expect("connect");
            for ddl in [
                "CREATE TABLE themes (id INTEGER PRIMARY KEY, name TEXT)",
                "CREATE TABLE sets (set_num VARCHAR(20) PRIMARY KEY, year INT, theme_id INT)",
                "CREATE TABLE set_collections (set_num VARCHAR(20), collection_count INT)",
            ] {
                sqlx::query(ddl).execute(store.conn()).await.unwrap();
            }
            store.close().await.unwrap();
        }

        let summary = pipeline.run_once().await.expect("sync run");

        assert_eq!(summary.pre_reload_ids, 0);
        assert_eq!(summary.load.executed(), 4);
        assert_eq!(summary.load.failed(), 0);
        assert_eq!(summary.rollup.new_item_ids, 2);
        assert_eq!(summary.rollup.recent_rows_inserted, 2);
        assert_eq!(summary.rollup.popular_rows_inserted, 1);
        assert_eq!(summary.staged_files_removed, 1);
        assert!(staging.join(".gitkeep").exists());

        let again = pipeline.run_once().await.expect("second run");
        assert_eq!(again.pre_reload_ids, 2);
        assert_eq!(again.rollup.new_item_ids, 0);
        assert_eq!(again.load.failed(), 3);
    }
}
