//! Applies the externally generated `<table>_inserts.sql` files to the base
//! tables. Each statement runs on its own; failures are logged and skipped.

use std::path::Path;

use bricksync_core::{LoadReport, LoadedFile};
use sha2::{Digest, Sha256};
use sqlx::AnyConnection;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};

use crate::StoreError;

pub fn statement_file_name(table: &str) -> String {
    format!("{table}_inserts.sql")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Execute the statement file of every table in `order` that exists in `dir`.
pub async fn load_statement_files(
    conn: &mut AnyConnection,
    dir: &Path,
    order: &[String],
) -> Result<LoadReport, StoreError> {
    let mut report = LoadReport::default();

    for table in order {
        let path = dir.join(statement_file_name(table));
        if !fs::try_exists(&path).await? {
            info!(table = %table, path = %path.display(), "no statement file; skipping table");
            report.skipped_tables.push(table.clone());
            continue;
        }

        let bytes = fs::read(&path).await?;
        let sha256 = sha256_hex(&bytes);
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    table = %table,
                    path = %path.display(),
                    error = %err,
                    "statement file is not valid utf-8; skipping file"
                );
                report.files.push(LoadedFile {
                    table: table.clone(),
                    path: path.display().to_string(),
                    sha256,
                    executed: 0,
                    failed: 1,
                    error: Some(format!("invalid utf-8: {err}")),
                });
                continue;
            }
        };
        let statements = split_statements(&text);

        let span = info_span!("load_table", table = %table, statements = statements.len());
        let (executed, failed) = execute_each(conn, table, &statements)
            .instrument(span)
            .await;

        info!(table = %table, executed, failed, "statement file applied");
        report.files.push(LoadedFile {
            table: table.clone(),
            path: path.display().to_string(),
            sha256,
            executed,
            failed,
            error: None,
        });
    }

    Ok(report)
}

async fn execute_each(
    conn: &mut AnyConnection,
    table: &str,
    statements: &[String],
) -> (usize, usize) {
    let mut executed = 0usize;
    let mut failed = 0usize;
    for (index, statement) in statements.iter().enumerate() {
        match sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(statement)).await {
            Ok(_) => executed += 1,
            Err(err) => {
                failed += 1;
                warn!(table, index, error = %err, "statement failed; continuing");
            }
        }
    }
    (executed, failed)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SplitState {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Split a SQL script on `;` terminators that sit outside quotes and comments.
/// Comments are dropped; empty statements are skipped.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = SplitState::Code;
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            SplitState::Code => match c {
                ';' => {
                    push_statement(&mut statements, &mut current);
                }
                '\'' | '"' | '`' => {
                    state = SplitState::Quoted(c);
                    current.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = SplitState::LineComment;
                }
                '#' => state = SplitState::LineComment,
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = SplitState::BlockComment;
                }
                _ => current.push(c),
            },
            SplitState::Quoted(quote) => {
                current.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                } else if c == quote {
                    // doubled quote is an escaped quote, not a terminator
                    if chars.peek() == Some(&quote) {
                        if let Some(next) = chars.next() {
                            current.push(next);
                        }
                    } else {
                        state = SplitState::Code;
                    }
                }
            }
            SplitState::LineComment => {
                if c == '\n' {
                    current.push('\n');
                    state = SplitState::Code;
                }
            }
            SplitState::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    current.push(' ');
                    state = SplitState::Code;
                }
            }
        }
    }
    push_statement(&mut statements, &mut current);
    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    current.clear();
}
