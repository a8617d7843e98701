use rusqlite::{Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::value_to_json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    /// More rows were available than the row cap allowed
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Syntax,
    MissingIdentifier,
    TypeMismatch,
    ReadOnlyViolation,
    Timeout,
    Interrupted,
    Engine,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success(ResultSet),
    Failure { message: String, class: ErrorClass },
}

impl ExecutionOutcome {
    fn failure(err: rusqlite::Error) -> Self {
        let class = classify(&err);
        ExecutionOutcome::Failure {
            message: err.to_string(),
            class,
        }
    }
}

pub(crate) fn classify(err: &rusqlite::Error) -> ErrorClass {
    match err.sqlite_error_code() {
        Some(ErrorCode::OperationInterrupted) => return ErrorClass::Interrupted,
        Some(ErrorCode::ReadOnly) => return ErrorClass::ReadOnlyViolation,
        Some(ErrorCode::TypeMismatch) => return ErrorClass::TypeMismatch,
        _ => {}
    }
    if matches!(err, rusqlite::Error::MultipleStatement) {
        return ErrorClass::Syntax;
    }

    let message = err.to_string().to_ascii_lowercase();
    let mentions = |needles: &[&str]| needles.iter().any(|n| message.contains(n));
    if mentions(&["no such table", "no such column", "no such function"]) {
        ErrorClass::MissingIdentifier
    } else if mentions(&["syntax error", "incomplete input", "unrecognized token"]) {
        ErrorClass::Syntax
    } else if mentions(&["readonly", "read-only"]) {
        ErrorClass::ReadOnlyViolation
    } else if message.contains("mismatch") {
        ErrorClass::TypeMismatch
    } else {
        ErrorClass::Engine
    }
}

/// Runs one statement that cannot persist anything.
///
/// Besides the read-only connection, the statement runs inside a transaction that is always
/// rolled back, and SQLite's own verdict on whether the compiled statement writes is checked
/// before a single step is taken. At most `row_cap` rows are materialised.
pub fn execute_read_only(
    conn: &mut Connection,
    statement: &str,
    row_cap: usize,
) -> ExecutionOutcome {
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => return ExecutionOutcome::failure(e),
    };

    let outcome = {
        let mut stmt = match tx.prepare(statement) {
            Ok(stmt) => stmt,
            Err(e) => return ExecutionOutcome::failure(e),
        };

        if !stmt.readonly() {
            return ExecutionOutcome::Failure {
                message: "statement would modify the database".to_string(),
                class: ErrorClass::ReadOnlyViolation,
            };
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let column_count = columns.len();

        match collect_rows(&mut stmt, column_count, row_cap) {
            Ok((rows, truncated)) => ExecutionOutcome::Success(ResultSet {
                columns,
                row_count: rows.len(),
                rows,
                truncated,
            }),
            Err(e) => ExecutionOutcome::failure(e),
        }
    };

    if let Err(e) = tx.rollback() {
        debug!("Rollback after read-only execution failed: {}", e);
    }
    outcome
}

fn collect_rows(
    stmt: &mut rusqlite::Statement<'_>,
    column_count: usize,
    row_cap: usize,
) -> Result<(Vec<Vec<serde_json::Value>>, bool), rusqlite::Error> {
    let mut rows = stmt.query([])?;
    let mut collected = Vec::new();
    while let Some(row) = rows.next()? {
        if collected.len() == row_cap {
            return Ok((collected, true));
        }
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(value_to_json(row.get_ref(i)?));
        }
        collected.push(values);
    }
    Ok((collected, false))
}
