use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{visit_expressions, visit_relations, Expr, Statement};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;
use std::fmt;
use std::ops::ControlFlow;
use tracing::{debug, warn};

use crate::db::executor::{classify, ErrorClass};
use crate::db::schema::SchemaDescriptor;
use crate::sql::lexer::{split_statements, tokenize, Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MultiStatement,
    WriteOperation,
    Unparseable,
    DisallowedKeyword,
    UnknownIdentifier,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RejectReason::MultiStatement => "multiple statements",
            RejectReason::WriteOperation => "write operation",
            RejectReason::Unparseable => "unparseable statement",
            RejectReason::DisallowedKeyword => "disallowed keyword",
            RejectReason::UnknownIdentifier => "unknown identifier",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ValidationVerdict {
    /// Trimmed, leading comments and trailing terminator removed
    Accepted { statement: String },
    Rejected { reason: RejectReason, detail: String },
}

impl ValidationVerdict {
    fn reject(reason: RejectReason, detail: impl Into<String>) -> Self {
        ValidationVerdict::Rejected {
            reason,
            detail: detail.into(),
        }
    }

    #[cfg(test)]
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationVerdict::Accepted { .. })
    }
}

/// Statements that change the database or its connection when they lead.
const WRITE_LEADING: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "REPLACE", "UPSERT", "DROP", "ALTER", "CREATE", "ATTACH",
    "DETACH", "PRAGMA", "VACUUM", "REINDEX", "ANALYZE",
];

/// Real statements that are still not plain queries.
const OTHER_LEADING: &[&str] = &[
    "EXPLAIN", "VALUES", "BEGIN", "COMMIT", "END", "ROLLBACK", "SAVEPOINT", "RELEASE",
];

/// Data-changing keywords that must not appear anywhere in a query,
/// e.g. `WITH x AS (...) DELETE`.
const DML_ANYWHERE: &[&str] = &["INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE"];

const DISALLOWED_ANYWHERE: &[&str] = &[
    "ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX", "COMMIT", "ROLLBACK", "SAVEPOINT",
    "RELEASE", "LOAD_EXTENSION",
];

/// Table-valued functions that show up as relations.
const TABLE_FUNCTIONS: &[&str] = &["json_each", "json_tree", "generate_series"];

const ROWID_ALIASES: &[&str] = &["rowid", "oid", "_rowid_"];

/// The safety boundary in front of the executor. Pure and deterministic.
pub struct SqlValidator<'a> {
    schema: &'a SchemaDescriptor,
    strict_identifiers: bool,
}

impl<'a> SqlValidator<'a> {
    pub fn new(schema: &'a SchemaDescriptor, strict_identifiers: bool) -> Self {
        Self {
            schema,
            strict_identifiers,
        }
    }

    pub fn validate(&self, sql: &str) -> ValidationVerdict {
        let tokens = match tokenize(sql) {
            Ok(tokens) => tokens,
            Err(e) => {
                return ValidationVerdict::reject(RejectReason::Unparseable, e.to_string())
            }
        };

        // 1. exactly one statement
        let statements = split_statements(&tokens);
        let body = match statements.as_slice() {
            [] => {
                return ValidationVerdict::reject(RejectReason::Unparseable, "no statement found")
            }
            [single] => *single,
            many => {
                return ValidationVerdict::reject(
                    RejectReason::MultiStatement,
                    format!("{} statements found; submit exactly one query", many.len()),
                )
            }
        };

        // 2. read-only form only
        if let Some(verdict) = check_keywords(sql, body) {
            return verdict;
        }

        let normalized = &sql[body[0].span.start..body[body.len() - 1].span.end];
        let parsed = match Parser::parse_sql(&SQLiteDialect {}, normalized) {
            Ok(parsed) => parsed,
            Err(e) => {
                // the parser lags the engine's grammar (GLOB, IS 'x', INDEXED BY, ...)
                if let Some(message) = engine_syntax_error(normalized) {
                    return ValidationVerdict::reject(RejectReason::Unparseable, message);
                }
                debug!("Statement accepted by SQLite but not by sqlparser: {}", e);
                return ValidationVerdict::Accepted {
                    statement: normalized.to_string(),
                };
            }
        };
        let statement = match parsed.as_slice() {
            [statement @ Statement::Query(_)] => statement,
            [_] => {
                return ValidationVerdict::reject(
                    RejectReason::WriteOperation,
                    "only SELECT queries may run",
                )
            }
            _ => {
                return ValidationVerdict::reject(
                    RejectReason::MultiStatement,
                    "submit exactly one query",
                )
            }
        };

        // 3. identifiers must exist
        if self.strict_identifiers {
            if let Some(detail) = find_unknown_identifier(statement, self.schema, body, sql) {
                return ValidationVerdict::reject(RejectReason::UnknownIdentifier, detail);
            }
        }

        // 4.
        ValidationVerdict::Accepted {
            statement: normalized.to_string(),
        }
    }
}

/// Compiles the statement against an empty in-memory database. Only grammar errors count;
/// missing tables are expected there.
fn engine_syntax_error(statement: &str) -> Option<String> {
    let conn = match Connection::open_in_memory() {
        Ok(conn) => conn,
        Err(e) => {
            warn!("Could not open a scratch connection for syntax checks: {}", e);
            return None;
        }
    };
    match conn.prepare(statement) {
        Err(e) if classify(&e) == ErrorClass::Syntax => Some(e.to_string()),
        _ => None,
    }
}

fn check_keywords(sql: &str, body: &[Token]) -> Option<ValidationVerdict> {
    let first = &body[0];
    if first.kind != TokenKind::Word {
        return Some(ValidationVerdict::reject(
            RejectReason::Unparseable,
            format!("`{}` does not start a SQL statement", first.text(sql)),
        ));
    }

    let leading = first.text(sql).to_ascii_uppercase();
    match leading.as_str() {
        "SELECT" | "WITH" => {}
        kw if WRITE_LEADING.contains(&kw) => {
            return Some(ValidationVerdict::reject(
                RejectReason::WriteOperation,
                format!("{} statements are not allowed; only SELECT queries may run", kw),
            ))
        }
        kw if OTHER_LEADING.contains(&kw) => {
            return Some(ValidationVerdict::reject(
                RejectReason::DisallowedKeyword,
                format!("{} statements are not allowed; only SELECT queries may run", kw),
            ))
        }
        _ => {
            return Some(ValidationVerdict::reject(
                RejectReason::Unparseable,
                format!("`{}` does not start a SQL statement", first.text(sql)),
            ))
        }
    }

    for (i, token) in body.iter().enumerate().skip(1) {
        if token.kind != TokenKind::Word {
            continue;
        }
        let word = token.text(sql).to_ascii_uppercase();
        let replace_into =
            word == "REPLACE" && body.get(i + 1).is_some_and(|next| next.is_word(sql, "INTO"));
        if DML_ANYWHERE.contains(&word.as_str()) || replace_into {
            return Some(ValidationVerdict::reject(
                RejectReason::WriteOperation,
                format!("{} is not allowed inside a query", word),
            ));
        }
        if DISALLOWED_ANYWHERE.contains(&word.as_str()) {
            return Some(ValidationVerdict::reject(
                RejectReason::DisallowedKeyword,
                format!("{} is not allowed inside a query", word),
            ));
        }
    }
    None
}

/// Names a query introduces itself: CTE names, CTE column lists and `AS` aliases.
fn local_names(tokens: &[Token], sql: &str) -> HashSet<String> {
    let mut names = HashSet::new();
    for (i, token) in tokens.iter().enumerate() {
        if !token.is_word(sql, "AS") {
            continue;
        }
        match tokens.get(i + 1) {
            Some(next)
                if next.kind == TokenKind::LParen
                    || next.is_word(sql, "MATERIALIZED")
                    || next.is_word(sql, "NOT") =>
            {
                // name AS (  |  name(col, ...) AS (
                let mut j = i;
                if j > 0 && tokens[j - 1].kind == TokenKind::RParen {
                    let mut depth = 0usize;
                    while j > 0 {
                        j -= 1;
                        match tokens[j].kind {
                            TokenKind::RParen => depth += 1,
                            TokenKind::LParen => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {
                                if let Some(column) = tokens[j].ident_name(sql) {
                                    names.insert(column.to_ascii_lowercase());
                                }
                            }
                        }
                    }
                }
                if let Some(name) = j.checked_sub(1).and_then(|k| tokens[k].ident_name(sql)) {
                    names.insert(name.to_ascii_lowercase());
                }
            }
            Some(next) => {
                if let Some(alias) = next.ident_name(sql) {
                    names.insert(alias.to_ascii_lowercase());
                }
            }
            None => {}
        }
    }
    names
}

fn find_unknown_identifier(
    statement: &Statement,
    schema: &SchemaDescriptor,
    tokens: &[Token],
    sql: &str,
) -> Option<String> {
    let local = local_names(tokens, sql);
    let is_local = |name: &str| local.contains(&name.to_ascii_lowercase());

    let tables = visit_relations(statement, |relation| {
        let name = relation.0.last().map(|ident| ident.value.as_str()).unwrap_or_default();
        let lower = name.to_ascii_lowercase();
        let known = schema.table(name).is_some()
            || is_local(name)
            || TABLE_FUNCTIONS.contains(&lower.as_str());
        if known {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(format!("unknown table `{}`", name))
        }
    });
    if let ControlFlow::Break(detail) = tables {
        return Some(detail);
    }

    let known_column = |name: &str| {
        schema.has_column(name)
            || is_local(name)
            || ROWID_ALIASES.contains(&name.to_ascii_lowercase().as_str())
    };

    let columns = visit_expressions(statement, |expr| match expr {
        Expr::Identifier(ident) if !known_column(&ident.value) => {
            ControlFlow::Break(format!("unknown column `{}`", ident.value))
        }
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
            let qualifier = &parts[parts.len() - 2].value;
            let column = &parts[parts.len() - 1].value;
            match schema.table(qualifier) {
                Some(table)
                    if !is_local(qualifier)
                        && table.column(column).is_none()
                        && !ROWID_ALIASES.contains(&column.to_ascii_lowercase().as_str()) =>
                {
                    ControlFlow::Break(format!("unknown column `{}.{}`", qualifier, column))
                }
                _ => ControlFlow::Continue(()),
            }
        }
        _ => ControlFlow::Continue(()),
    });
    match columns {
        ControlFlow::Break(detail) => Some(detail),
        ControlFlow::Continue(()) => None,
    }
}
