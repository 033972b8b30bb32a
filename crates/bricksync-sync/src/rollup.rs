//! Recomputes `recent_set_additions` and `popular_themes` after the `sets`
//! base table has been reloaded.
//!
//! The store must already hold the pre-reload id snapshot
//! ([`bricksync_storage::PRE_RELOAD_TABLE`]); new set ids are the ones present
//! in `sets` but missing from that snapshot.

use std::collections::{BTreeSet, HashMap};

use bricksync_core::{
    plan_recent_additions, CommitMode, FailedStep, Item, RollupPolicy, RollupReport,
};
use bricksync_storage::schema::{
    Collections, ExistingSets, PopularThemes, RecentSetAdditions, Sets, Themes,
};
use bricksync_storage::{
    format_timestamp, narrow_i32, validate_identifier, Backend, Store, StoreError,
};
use chrono::{DateTime, Utc};
use sea_query::{Alias, Expr, Func, Order, Query, SelectStatement};
use sqlx::{AnyConnection, Connection, Row};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Default collection-tracking table: one row per set with its owner count.
pub const DEFAULT_POPULARITY_SOURCE: &str = "set_collections";

#[derive(Debug, Clone)]
pub struct RollupUpdater {
    policy: RollupPolicy,
    popularity_source: String,
}

impl RollupUpdater {
    pub fn new(policy: RollupPolicy, popularity_source: &str) -> Result<Self, StoreError> {
        let popularity_source = validate_identifier(popularity_source)?.to_string();
        Ok(Self {
            policy,
            popularity_source,
        })
    }

    pub fn policy(&self) -> &RollupPolicy {
        &self.policy
    }

    /// Run one rollup pass. In [`CommitMode::AutoCommit`] statement failures are
    /// recorded in the report and the pass continues; in [`CommitMode::Atomic`]
    /// the first failure rolls back every derived-table change of this pass.
    pub async fn run(
        &self,
        store: &mut Store,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RollupReport, StoreError> {
        let backend = store.backend();
        let mode = self.policy.commit_mode;
        let span = info_span!("rollup", %run_id, commit_mode = %mode);

        async move {
            let mut report = RollupReport::new(run_id, mode, now);
            match mode {
                CommitMode::AutoCommit => {
                    self.apply(store.conn(), backend, now, &mut report).await?;
                }
                CommitMode::Atomic => {
                    let mut tx = store
                        .conn()
                        .begin()
                        .await
                        .map_err(StoreError::statement("begin_rollup"))?;
                    if let Err(err) = self.apply(&mut tx, backend, now, &mut report).await {
                        if let Err(rollback_err) = tx.rollback().await {
                            warn!(error = %rollback_err, "rollback failed");
                        }
                        return Err(err);
                    }
                    tx.commit()
                        .await
                        .map_err(StoreError::statement("commit_rollup"))?;
                }
            }
            report.finished_at = Utc::now();
            info!(
                new_item_ids = report.new_item_ids,
                recent_deleted = report.recent_rows_deleted,
                recent_inserted = report.recent_rows_inserted,
                popular_inserted = report.popular_rows_inserted,
                popular_pruned = report.popular_rows_pruned,
                failed_steps = report.failed_steps.len(),
                "rollup finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn apply(
        &self,
        conn: &mut AnyConnection,
        backend: Backend,
        now: DateTime<Utc>,
        report: &mut RollupReport,
    ) -> Result<(), StoreError> {
        let mode = self.policy.commit_mode;
        let stamp = format_timestamp(now);

        let fetched = select_new_items(conn, backend).await;
        if let Some(candidates) = settle(mode, report, "select_new_items", fetched)? {
            report.new_item_ids = candidates.len();
            if candidates.is_empty() {
                debug!("no new set ids; recent additions untouched");
            } else {
                self.refresh_recent_additions(conn, backend, &stamp, &candidates, report)
                    .await?;
            }
        }

        if self.policy.popular_top_n > 0 {
            let inserted = self.snapshot_popularity(conn, backend, &stamp).await;
            if let Some(rows) = settle(mode, report, "snapshot_popularity", inserted)? {
                report.popular_rows_inserted = rows;
            }
        }

        let cutoff = format_timestamp(self.policy.popular_cutoff(now));
        let pruned = prune_popularity(conn, backend, &cutoff).await;
        if let Some(rows) = settle(mode, report, "prune_popularity", pruned)? {
            report.popular_rows_pruned = rows;
        }
        Ok(())
    }

    async fn refresh_recent_additions(
        &self,
        conn: &mut AnyConnection,
        backend: Backend,
        stamp: &str,
        candidates: &[Item],
        report: &mut RollupReport,
    ) -> Result<(), StoreError> {
        let mode = self.policy.commit_mode;
        report.affected_themes = candidates
            .iter()
            .map(|item| item.theme_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let deleted = delete_stale_recent_additions(conn, backend).await;
        if let Some(rows) = settle(mode, report, "delete_stale_recent_additions", deleted)? {
            report.recent_rows_deleted = rows;
        }

        let counted = recent_counts_by_theme(conn, backend).await;
        let Some(existing) = settle(mode, report, "count_recent_additions", counted)? else {
            return Ok(());
        };

        let planned = plan_recent_additions(candidates, &existing, self.policy.recent_cap);
        report.recent_rows_capped = candidates.len() - planned.len();

        for item in &planned {
            let inserted = insert_recent_addition(conn, backend, item, stamp).await;
            if let Some(rows) = settle(mode, report, "insert_recent_addition", inserted)? {
                report.recent_rows_inserted += rows;
            }
        }
        Ok(())
    }

    async fn snapshot_popularity(
        &self,
        conn: &mut AnyConnection,
        backend: Backend,
        stamp: &str,
    ) -> Result<u64, StoreError> {
        let source = Alias::new(self.popularity_source.as_str());
        let total = Alias::new("total");
        let ranked = Query::select()
            .column((Sets::Table, Sets::ThemeId))
            .expr_as(
                Expr::col((source.clone(), Collections::CollectionCount)).sum(),
                total.clone(),
            )
            .expr(Expr::val(stamp))
            .from(source.clone())
            .inner_join(
                Sets::Table,
                Expr::col((Sets::Table, Sets::SetNum)).equals((source, Collections::SetNum)),
            )
            .inner_join(
                Themes::Table,
                Expr::col((Themes::Table, Themes::Id)).equals((Sets::Table, Sets::ThemeId)),
            )
            .group_by_col((Sets::Table, Sets::ThemeId))
            .order_by(total, Order::Desc)
            .order_by((Sets::Table, Sets::ThemeId), Order::Asc)
            .limit(u64::try_from(self.policy.popular_top_n).unwrap_or(u64::MAX))
            .to_owned();
        let insert = Query::insert()
            .into_table(PopularThemes::Table)
            .columns([
                PopularThemes::ThemeId,
                PopularThemes::CollectionCount,
                PopularThemes::SnapshotDate,
            ])
            .select_from(ranked)
            .map_err(StoreError::build("snapshot_popularity"))?
            .to_owned();

        sqlx::query(&backend.query(&insert))
            .execute(conn)
            .await
            .map(|done| done.rows_affected())
            .map_err(StoreError::statement("snapshot_popularity"))
    }
}

/// Convenience wrapper using the default popularity source table.
pub async fn update_rollups(
    store: &mut Store,
    policy: &RollupPolicy,
    run_id: Uuid,
    now: DateTime<Utc>,
) -> Result<RollupReport, StoreError> {
    RollupUpdater::new(policy.clone(), DEFAULT_POPULARITY_SOURCE)?
        .run(store, run_id, now)
        .await
}

/// Apply the statement-failure policy: under auto-commit a failure is logged,
/// recorded, and turned into `None`; under atomic mode it aborts the pass.
fn settle<T>(
    mode: CommitMode,
    report: &mut RollupReport,
    step: &'static str,
    result: Result<T, StoreError>,
) -> Result<Option<T>, StoreError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if mode == CommitMode::AutoCommit => {
            warn!(step, error = %err, "rollup statement failed; continuing");
            report.failed_steps.push(FailedStep {
                step: step.to_string(),
                error: err.to_string(),
            });
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// `sets` rows whose id is absent from the pre-reload snapshot, themed only.
fn new_sets() -> SelectStatement {
    Query::select()
        .from(Sets::Table)
        .left_join(
            ExistingSets::Table,
            Expr::col((Sets::Table, Sets::SetNum))
                .equals((ExistingSets::Table, ExistingSets::SetNum)),
        )
        .and_where(Expr::col((ExistingSets::Table, ExistingSets::SetNum)).is_null())
        .and_where(Expr::col((Sets::Table, Sets::ThemeId)).is_not_null())
        .to_owned()
}

async fn select_new_items(
    conn: &mut AnyConnection,
    backend: Backend,
) -> Result<Vec<Item>, StoreError> {
    let select = new_sets()
        .column((Sets::Table, Sets::SetNum))
        .column((Sets::Table, Sets::ThemeId))
        .expr_as(
            Func::coalesce([Expr::col((Sets::Table, Sets::Year)).into(), Expr::val(0).into()]),
            Alias::new("year"),
        )
        .to_owned();
    let rows = sqlx::query(&backend.query(&select))
        .fetch_all(conn)
        .await
        .map_err(StoreError::statement("select_new_items"))?;

    rows.iter()
        .map(|row| {
            let year: i64 = row
                .try_get("year")
                .map_err(StoreError::statement("select_new_items"))?;
            Ok(Item {
                set_num: row
                    .try_get("set_num")
                    .map_err(StoreError::statement("select_new_items"))?,
                theme_id: row
                    .try_get("theme_id")
                    .map_err(StoreError::statement("select_new_items"))?,
                year: narrow_i32(year, "year")?,
            })
        })
        .collect()
}

/// Clear every recent-addition row of a theme that received at least one new set.
async fn delete_stale_recent_additions(
    conn: &mut AnyConnection,
    backend: Backend,
) -> Result<u64, StoreError> {
    let affected_themes = new_sets()
        .column((Sets::Table, Sets::ThemeId))
        .to_owned();
    let delete = Query::delete()
        .from_table(RecentSetAdditions::Table)
        .and_where(Expr::col(RecentSetAdditions::ThemeId).in_subquery(affected_themes))
        .to_owned();
    sqlx::query(&backend.query(&delete))
        .execute(conn)
        .await
        .map(|done| done.rows_affected())
        .map_err(StoreError::statement("delete_stale_recent_additions"))
}

async fn recent_counts_by_theme(
    conn: &mut AnyConnection,
    backend: Backend,
) -> Result<HashMap<i64, usize>, StoreError> {
    let select = Query::select()
        .column(RecentSetAdditions::ThemeId)
        .expr_as(
            Expr::col(RecentSetAdditions::Id).count(),
            Alias::new("row_count"),
        )
        .from(RecentSetAdditions::Table)
        .and_where(Expr::col(RecentSetAdditions::ThemeId).is_not_null())
        .group_by_col(RecentSetAdditions::ThemeId)
        .to_owned();
    let rows = sqlx::query(&backend.query(&select))
        .fetch_all(conn)
        .await
        .map_err(StoreError::statement("count_recent_additions"))?;

    let mut counts = HashMap::with_capacity(rows.len());
    for row in &rows {
        let theme_id: i64 = row
            .try_get("theme_id")
            .map_err(StoreError::statement("count_recent_additions"))?;
        let count: i64 = row
            .try_get("row_count")
            .map_err(StoreError::statement("count_recent_additions"))?;
        counts.insert(theme_id, usize::try_from(count).unwrap_or(0));
    }
    Ok(counts)
}

async fn insert_recent_addition(
    conn: &mut AnyConnection,
    backend: Backend,
    item: &Item,
    stamp: &str,
) -> Result<u64, StoreError> {
    let insert = Query::insert()
        .into_table(RecentSetAdditions::Table)
        .columns([
            RecentSetAdditions::SetNum,
            RecentSetAdditions::ThemeId,
            RecentSetAdditions::AddedDate,
        ])
        .values([
            item.set_num.as_str().into(),
            item.theme_id.into(),
            stamp.into(),
        ])
        .map_err(StoreError::build("insert_recent_addition"))?
        .to_owned();
    sqlx::query(&backend.query(&insert))
        .execute(conn)
        .await
        .map(|done| done.rows_affected())
        .map_err(StoreError::statement("insert_recent_addition"))
}

async fn prune_popularity(
    conn: &mut AnyConnection,
    backend: Backend,
    cutoff: &str,
) -> Result<u64, StoreError> {
    let delete = Query::delete()
        .from_table(PopularThemes::Table)
        .and_where(Expr::col(PopularThemes::SnapshotDate).lt(cutoff))
        .to_owned();
    sqlx::query(&backend.query(&delete))
        .execute(conn)
        .await
        .map(|done| done.rows_affected())
        .map_err(StoreError::statement("prune_popularity"))
}
