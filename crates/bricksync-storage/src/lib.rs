//! Relational snapshot store for bricksync: connection handling, derived-table
//! schema, the pre-reload id snapshot, and statement-file loading.

use bricksync_core::{Category, PopularitySnapshot, RecentAddition};
use sea_query::{Alias, Expr, Order, Query};
use sqlx::any::install_default_drivers;
use sqlx::{AnyConnection, Connection, Row};
use thiserror::Error;
use tracing::{debug, info};

pub mod backend;
pub mod loader;
pub mod schema;
pub mod staging;

pub use backend::{format_timestamp, parse_timestamp, redact_url, validate_identifier, Backend};
pub use loader::{load_statement_files, split_statements};
pub use staging::clean_staging_dir;

use schema::{ExistingSets, PopularThemes, RecentSetAdditions, Sets, Themes};

pub const CRATE_NAME: &str = "bricksync-storage";

/// Session-scoped table holding the `sets.set_num` values seen before reload.
pub const PRE_RELOAD_TABLE: &str = "existing_sets";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("statement `{step}` failed: {source}")]
    Statement {
        step: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("unsupported database url `{0}`")]
    UnsupportedUrl(String),
    #[error("invalid sql identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("building `{step}`: {source}")]
    Build {
        step: &'static str,
        #[source]
        source: sea_query::error::Error,
    },
    #[error("malformed timestamp `{0}`")]
    Timestamp(String),
    #[error("integer out of range in column `{0}`")]
    IntegerRange(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn statement(step: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
        move |source| StoreError::Statement { step, source }
    }

    pub fn build(step: &'static str) -> impl FnOnce(sea_query::error::Error) -> StoreError {
        move |source| StoreError::Build { step, source }
    }
}

/// One database session. Temporary tables live as long as this connection, so
/// the whole run shares a single `Store`.
pub struct Store {
    conn: AnyConnection,
    backend: Backend,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let backend = Backend::from_url(url)?;
        install_default_drivers();
        let target = redact_url(url);
        let mut conn = AnyConnection::connect(url)
            .await
            .map_err(|source| StoreError::Connect {
                target: target.clone(),
                source,
            })?;

        if backend == Backend::MySql {
            // derived timestamps are written and compared in UTC
            sqlx::query("SET time_zone = '+00:00'")
                .execute(&mut conn)
                .await
                .map_err(StoreError::statement("set_time_zone"))?;
        }

        info!(url = %target, ?backend, "connected to store");
        Ok(Self { conn, backend })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn conn(&mut self) -> &mut AnyConnection {
        &mut self.conn
    }

    pub async fn close(self) -> Result<(), StoreError> {
        self.conn
            .close()
            .await
            .map_err(StoreError::statement("close"))
    }

    /// Create `recent_set_additions` and `popular_themes` if missing.
    pub async fn ensure_derived_schema(&mut self) -> Result<(), StoreError> {
        for (step, table) in schema::derived_tables() {
            sqlx::query(&self.backend.schema(&table))
                .execute(&mut self.conn)
                .await
                .map_err(StoreError::statement(step))?;
        }
        debug!("derived schema ensured");
        Ok(())
    }

    /// Snapshot every `sets.set_num` into [`PRE_RELOAD_TABLE`]. Must run before
    /// the base table is reloaded. Returns the number of captured ids.
    pub async fn capture_pre_reload_ids(&mut self) -> Result<i64, StoreError> {
        sqlx::query(&self.backend.drop_pre_reload_table())
            .execute(&mut self.conn)
            .await
            .map_err(StoreError::statement("drop_stale_pre_reload_ids"))?;

        let current_ids = Query::select()
            .column(Sets::SetNum)
            .from(Sets::Table)
            .to_owned();
        sqlx::query(&format!(
            "CREATE TEMPORARY TABLE {PRE_RELOAD_TABLE} AS {}",
            self.backend.query(&current_ids)
        ))
        .execute(&mut self.conn)
        .await
        .map_err(StoreError::statement("capture_pre_reload_ids"))?;

        let count = Query::select()
            .expr(Expr::col(ExistingSets::SetNum).count())
            .from(ExistingSets::Table)
            .to_owned();
        let row = sqlx::query(&self.backend.query(&count))
            .fetch_one(&mut self.conn)
            .await
            .map_err(StoreError::statement("count_pre_reload_ids"))?;
        let captured: i64 = row
            .try_get(0)
            .map_err(StoreError::statement("count_pre_reload_ids"))?;
        info!(captured, "captured pre-reload set ids");
        Ok(captured)
    }

    pub async fn drop_pre_reload_ids(&mut self) -> Result<(), StoreError> {
        sqlx::query(&self.backend.drop_pre_reload_table())
            .execute(&mut self.conn)
            .await
            .map_err(StoreError::statement("drop_pre_reload_ids"))?;
        Ok(())
    }

    pub async fn categories(&mut self) -> Result<Vec<Category>, StoreError> {
        let select = Query::select()
            .columns([Themes::Id, Themes::Name])
            .from(Themes::Table)
            .order_by(Themes::Id, Order::Asc)
            .to_owned();
        let rows = sqlx::query(&self.backend.query(&select))
            .fetch_all(&mut self.conn)
            .await
            .map_err(StoreError::statement("list_categories"))?;

        rows.iter()
            .map(|row| {
                Ok(Category {
                    id: row
                        .try_get("id")
                        .map_err(StoreError::statement("list_categories"))?,
                    name: row
                        .try_get("name")
                        .map_err(StoreError::statement("list_categories"))?,
                })
            })
            .collect()
    }

    pub async fn recent_additions(&mut self) -> Result<Vec<RecentAddition>, StoreError> {
        let select = Query::select()
            .columns([
                RecentSetAdditions::Id,
                RecentSetAdditions::SetNum,
                RecentSetAdditions::ThemeId,
            ])
            .expr_as(
                self.backend.timestamp_text(RecentSetAdditions::AddedDate),
                Alias::new("added_text"),
            )
            .from(RecentSetAdditions::Table)
            .order_by(RecentSetAdditions::ThemeId, Order::Asc)
            .order_by(RecentSetAdditions::Id, Order::Asc)
            .to_owned();
        let rows = sqlx::query(&self.backend.query(&select))
            .fetch_all(&mut self.conn)
            .await
            .map_err(StoreError::statement("list_recent_additions"))?;

        rows.iter()
            .map(|row| {
                let added: String = row
                    .try_get("added_text")
                    .map_err(StoreError::statement("list_recent_additions"))?;
                Ok(RecentAddition {
                    id: row
                        .try_get("id")
                        .map_err(StoreError::statement("list_recent_additions"))?,
                    set_num: row
                        .try_get("set_num")
                        .map_err(StoreError::statement("list_recent_additions"))?,
                    theme_id: row
                        .try_get("theme_id")
                        .map_err(StoreError::statement("list_recent_additions"))?,
                    added_date: parse_timestamp(&added)?,
                })
            })
            .collect()
    }

    pub async fn popularity_snapshots(&mut self) -> Result<Vec<PopularitySnapshot>, StoreError> {
        let select = Query::select()
            .columns([
                PopularThemes::Id,
                PopularThemes::ThemeId,
                PopularThemes::CollectionCount,
            ])
            .expr_as(
                self.backend.timestamp_text(PopularThemes::SnapshotDate),
                Alias::new("snapshot_text"),
            )
            .from(PopularThemes::Table)
            .order_by(PopularThemes::SnapshotDate, Order::Desc)
            .order_by(PopularThemes::CollectionCount, Order::Desc)
            .order_by(PopularThemes::ThemeId, Order::Asc)
            .to_owned();
        let rows = sqlx::query(&self.backend.query(&select))
            .fetch_all(&mut self.conn)
            .await
            .map_err(StoreError::statement("list_popularity_snapshots"))?;

        rows.iter()
            .map(|row| {
                let stamped: String = row
                    .try_get("snapshot_text")
                    .map_err(StoreError::statement("list_popularity_snapshots"))?;
                Ok(PopularitySnapshot {
                    id: row
                        .try_get("id")
                        .map_err(StoreError::statement("list_popularity_snapshots"))?,
                    theme_id: row
                        .try_get("theme_id")
                        .map_err(StoreError::statement("list_popularity_snapshots"))?,
                    collection_count: row
                        .try_get("collection_count")
                        .map_err(StoreError::statement("list_popularity_snapshots"))?,
                    snapshot_date: parse_timestamp(&stamped)?,
                })
            })
            .collect()
    }
}

/// Narrow an integer column that every backend hands back as `i64`.
pub fn narrow_i32(value: i64, column: &'static str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::IntegerRange(column))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) async fn sqlite_store() -> Store {
        let mut store = Store::connect("sqlite::memory:").await.expect("sqlite store");
        for ddl in [
            "CREATE TABLE themes (id INTEGER PRIMARY KEY, name TEXT NOT NULL, parent_id INTEGER)",
            "CREATE TABLE sets (set_num VARCHAR(20) PRIMARY KEY, name TEXT, year INT, \
             theme_id INT REFERENCES themes(id), num_parts INT)",
        ] {
            sqlx::query(ddl).execute(store.conn()).await.expect("base ddl");
        }
        store
    }

    #[tokio::test]
    async fn derived_schema_is_idempotent() {
        let mut store = sqlite_store().await;
        store.ensure_derived_schema().await.expect("first");
        store.ensure_derived_schema().await.expect("second");
        assert!(store.recent_additions().await.expect("list").is_empty());
        assert!(store.popularity_snapshots().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn pre_reload_snapshot_captures_current_ids_and_can_be_retaken() {
        let mut store = sqlite_store().await;
        sqlx::query("INSERT INTO themes (id, name) VALUES (1, 'Town')")
            .execute(store.conn())
            .await
            .unwrap();
        sqlx::query("INSERT INTO sets (set_num, year, theme_id) VALUES ('6000-1', 1990, 1), ('6001-1', 1991, 1)")
            .execute(store.conn())
            .await
            .unwrap();

        assert_eq!(store.capture_pre_reload_ids().await.unwrap(), 2);
        sqlx::query("INSERT INTO sets (set_num, year, theme_id) VALUES ('6002-1', 1992, 1)")
            .execute(store.conn())
            .await
            .unwrap();
        assert_eq!(store.capture_pre_reload_ids().await.unwrap(), 3);

        store.drop_pre_reload_ids().await.unwrap();
        store.drop_pre_reload_ids().await.unwrap();
    }

    #[tokio::test]
    async fn pre_reload_snapshot_never_drops_a_permanent_table_of_the_same_name() {
        let mut store = sqlite_store().await;
        for sql in [
            "CREATE TABLE existing_sets (set_num VARCHAR(20))",
            "INSERT INTO existing_sets (set_num) VALUES ('keep-1')",
            "INSERT INTO themes (id, name) VALUES (1, 'Town')",
            "INSERT INTO sets (set_num, year, theme_id) VALUES ('6000-1', 1990, 1)",
        ] {
            sqlx::query(sql).execute(store.conn()).await.unwrap();
        }

        assert_eq!(store.capture_pre_reload_ids().await.unwrap(), 1);
        store.drop_pre_reload_ids().await.unwrap();
        store.drop_pre_reload_ids().await.unwrap();

        let row = sqlx::query("SELECT set_num FROM main.existing_sets")
            .fetch_one(store.conn())
            .await
            .expect("permanent table survives");
        let kept: String = row.try_get("set_num").unwrap();
        assert_eq!(kept, "keep-1");
    }

    #[tokio::test]
    async fn categories_are_listed_by_id() {
        let mut store = sqlite_store().await;
        sqlx::query("INSERT INTO themes (id, name) VALUES (2, 'Space'), (1, 'Town')")
            .execute(store.conn())
            .await
            .unwrap();
        let themes = store.categories().await.unwrap();
        assert_eq!(
            themes,
            vec![
                Category { id: 1, name: "Town".into() },
                Category { id: 2, name: "Space".into() },
            ]
        );
    }

    #[tokio::test]
    async fn derived_rows_must_reference_base_rows() {
        let mut store = sqlite_store().await;
        store.ensure_derived_schema().await.unwrap();
        let err = sqlx::query("INSERT INTO recent_set_additions (set_num, theme_id) VALUES ('nope-1', 99)")
            .execute(store.conn())
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn connect_rejects_unknown_scheme_without_leaking_password() {
        let Err(err) = Store::connect("oracle://scott:tiger@db/orcl").await else {
            panic!("oracle urls are not supported");
        };
        assert!(matches!(err, StoreError::UnsupportedUrl(_)));
        assert!(!err.to_string().contains("tiger"));
    }

    #[test]
    fn narrow_i32_reports_the_column() {
        assert_eq!(narrow_i32(2024, "year").unwrap(), 2024);
        assert!(matches!(
            narrow_i32(i64::MAX, "year"),
            Err(StoreError::IntegerRange("year"))
        ));
    }
}
