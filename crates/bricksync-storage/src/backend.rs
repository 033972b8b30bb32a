//! Backend selection. Statements are built with sea-query and rendered by the
//! query builder matching the connection url.

use chrono::{DateTime, NaiveDateTime, Utc};
use sea_query::{
    Alias, Expr, Func, IntoColumnRef, MysqlQueryBuilder, PostgresQueryBuilder,
    QueryStatementWriter, SchemaStatementBuilder, SimpleExpr, SqliteQueryBuilder, Table,
};

use crate::schema::ExistingSets;
use crate::{StoreError, PRE_RELOAD_TABLE};

/// Timestamp text layout shared by every backend.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    MySql,
    Postgres,
    Sqlite,
}

impl Backend {
    pub fn from_url(url: &str) -> Result<Self, StoreError> {
        let scheme = url.split(':').next().unwrap_or_default().to_ascii_lowercase();
        match scheme.as_str() {
            "mysql" | "mariadb" => Ok(Backend::MySql),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            "sqlite" => Ok(Backend::Sqlite),
            _ => Err(StoreError::UnsupportedUrl(redact_url(url))),
        }
    }

    /// Render a select/insert/delete statement with values inlined.
    pub fn query<S: QueryStatementWriter>(self, stmt: &S) -> String {
        match self {
            Backend::MySql => stmt.to_string(MysqlQueryBuilder),
            Backend::Postgres => stmt.to_string(PostgresQueryBuilder),
            Backend::Sqlite => stmt.to_string(SqliteQueryBuilder),
        }
    }

    pub fn schema<S: SchemaStatementBuilder>(self, stmt: &S) -> String {
        match self {
            Backend::MySql => stmt.to_string(MysqlQueryBuilder),
            Backend::Postgres => stmt.to_string(PostgresQueryBuilder),
            Backend::Sqlite => stmt.to_string(SqliteQueryBuilder),
        }
    }

    /// Expression rendering a timestamp column as [`TIMESTAMP_FORMAT`] text.
    pub fn timestamp_text<C: IntoColumnRef>(self, column: C) -> SimpleExpr {
        match self {
            Backend::MySql => Func::cust(Alias::new("DATE_FORMAT"))
                .arg(Expr::col(column))
                .arg("%Y-%m-%d %H:%i:%s")
                .into(),
            Backend::Postgres => Func::cust(Alias::new("TO_CHAR"))
                .arg(Expr::col(column))
                .arg("YYYY-MM-DD HH24:MI:SS")
                .into(),
            Backend::Sqlite => Expr::col(column).cast_as(Alias::new("TEXT")),
        }
    }

    /// Drop the session's pre-reload snapshot. Never touches a permanent
    /// table of the same name.
    pub fn drop_pre_reload_table(self) -> String {
        let temp_schema = match self {
            // mysql has no temp schema; TEMPORARY restricts the drop instead
            Backend::MySql => return format!("DROP TEMPORARY TABLE IF EXISTS {PRE_RELOAD_TABLE}"),
            Backend::Postgres => "pg_temp",
            Backend::Sqlite => "temp",
        };
        self.schema(
            &Table::drop()
                .table((Alias::new(temp_schema), ExistingSets::Table))
                .if_exists()
                .to_owned(),
        )
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    let trimmed = text.trim();
    // sqlite keeps fractional seconds when a caller wrote them explicitly
    let head = trimmed.split('.').next().unwrap_or(trimmed);
    NaiveDateTime::parse_from_str(head, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| StoreError::Timestamp(text.to_string()))
}

/// Accept only plain identifiers so table names from configuration stay
/// ordinary single-part names once quoted by the query builder.
pub fn validate_identifier(name: &str) -> Result<&str, StoreError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_head && name.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Hide the password component of a connection url for logs and errors.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let Some(at) = rest.rfind('@') else {
        return url.to_string();
    };
    let userinfo = &rest[..at];
    match userinfo.find(':') {
        Some(colon) => format!(
            "{}://{}:***{}",
            &url[..scheme_end],
            &userinfo[..colon],
            &rest[at..]
        ),
        None => url.to_string(),
    }
}
