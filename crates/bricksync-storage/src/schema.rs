//! Table and column identifiers for the catalog tables the rollup touches,
//! and the derived-table definitions.

use sea_query::{ColumnDef, Expr, ForeignKey, Iden, Table, TableCreateStatement};

#[derive(Iden)]
pub enum Themes {
    Table,
    Id,
    Name,
}

#[derive(Iden)]
pub enum Sets {
    Table,
    SetNum,
    ThemeId,
    Year,
}

/// Session-scoped copy of `sets.set_num` taken before the reload.
#[derive(Iden)]
pub enum ExistingSets {
    Table,
    SetNum,
}

#[derive(Iden)]
pub enum RecentSetAdditions {
    Table,
    Id,
    SetNum,
    ThemeId,
    AddedDate,
}

#[derive(Iden)]
pub enum PopularThemes {
    Table,
    Id,
    ThemeId,
    CollectionCount,
    SnapshotDate,
}

/// Columns every collection-tracking table must carry. The table name itself
/// is configurable.
#[derive(Iden)]
pub enum Collections {
    SetNum,
    CollectionCount,
}

/// `CREATE TABLE IF NOT EXISTS` for the two derived tables, keyed by step name.
pub fn derived_tables() -> Vec<(&'static str, TableCreateStatement)> {
    vec![
        (
            "create_recent_set_additions",
            Table::create()
                .table(RecentSetAdditions::Table)
                .if_not_exists()
                .col(
                    ColumnDef::new(RecentSetAdditions::Id)
                        .integer()
                        .not_null()
                        .auto_increment()
                        .primary_key(),
                )
                .col(ColumnDef::new(RecentSetAdditions::SetNum).string_len(20))
                .col(ColumnDef::new(RecentSetAdditions::ThemeId).integer())
                .col(
                    ColumnDef::new(RecentSetAdditions::AddedDate)
                        .timestamp()
                        .default(Expr::current_timestamp()),
                )
                .foreign_key(
                    ForeignKey::create()
                        .name("fk_recent_set_additions_set_num")
                        .from(RecentSetAdditions::Table, RecentSetAdditions::SetNum)
                        .to(Sets::Table, Sets::SetNum),
                )
                .foreign_key(
                    ForeignKey::create()
                        .name("fk_recent_set_additions_theme_id")
                        .from(RecentSetAdditions::Table, RecentSetAdditions::ThemeId)
                        .to(Themes::Table, Themes::Id),
                )
                .to_owned(),
        ),
        (
            "create_popular_themes",
            Table::create()
                .table(PopularThemes::Table)
                .if_not_exists()
                .col(
                    ColumnDef::new(PopularThemes::Id)
                        .integer()
                        .not_null()
                        .auto_increment()
                        .primary_key(),
                )
                .col(ColumnDef::new(PopularThemes::ThemeId).integer())
                .col(ColumnDef::new(PopularThemes::CollectionCount).integer())
                .col(
                    ColumnDef::new(PopularThemes::SnapshotDate)
                        .timestamp()
                        .default(Expr::current_timestamp()),
                )
                .foreign_key(
                    ForeignKey::create()
                        .name("fk_popular_themes_theme_id")
                        .from(PopularThemes::Table, PopularThemes::ThemeId)
                        .to(Themes::Table, Themes::Id),
                )
                .to_owned(),
        ),
    ]
}
