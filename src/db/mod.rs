pub mod db_pool;
pub mod executor;
pub mod handle;
pub mod inspector;
pub mod registry;
pub mod schema;

use rusqlite::types::ValueRef;
use std::error::Error;
use std::fmt;

/// The database cannot be used for answering questions at all.
#[derive(Debug)]
pub enum SchemaReadError {
    NoUserTables,
    QueryError(String),
    Unavailable(String),
}

impl fmt::Display for SchemaReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaReadError::NoUserTables => write!(f, "Database contains no user tables"),
            SchemaReadError::QueryError(msg) => {
                write!(f, "Failed to read database schema: {}", msg)
            }
            SchemaReadError::Unavailable(msg) => write!(f, "Database unavailable: {}", msg),
        }
    }
}

impl Error for SchemaReadError {}

impl From<rusqlite::Error> for SchemaReadError {
    fn from(err: rusqlite::Error) -> Self {
        SchemaReadError::QueryError(err.to_string())
    }
}

impl From<r2d2::Error> for SchemaReadError {
    fn from(err: r2d2::Error) -> Self {
        SchemaReadError::Unavailable(err.to_string())
    }
}

pub fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Blob(bytes) => {
            serde_json::Value::String(format!("<blob: {} bytes>", bytes.len()))
        }
    }
}
