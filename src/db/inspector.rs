use rusqlite::Connection;
use tracing::{debug, warn};

use crate::db::schema::{
    quote_identifier, ColumnDescriptor, SchemaDescriptor, TableDescriptor, TypeAffinity,
};
use crate::db::{value_to_json, SchemaReadError};

/// Lists user tables, skipping SQLite's internal `sqlite_*` tables. Views are not included.
pub fn list_tables(conn: &Connection) -> Result<Vec<String>, SchemaReadError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' ORDER BY name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tables)
}

pub fn describe_columns(
    conn: &Connection,
    table: &str,
) -> Result<Vec<ColumnDescriptor>, SchemaReadError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
    let columns = stmt
        .query_map([], |row| {
            // cid, name, type, notnull, dflt_value, pk
            let declared_type: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
            Ok(ColumnDescriptor {
                name: row.get(1)?,
                affinity: TypeAffinity::from_declared(&declared_type),
                declared_type,
                nullable: row.get::<_, i64>(3)? == 0,
                primary_key: row.get::<_, i64>(5)? > 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// First `limit` rows in natural row order.
pub fn sample_rows(
    conn: &Connection,
    table: &str,
    limit: usize,
) -> Result<Vec<Vec<serde_json::Value>>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {} LIMIT ?1", quote_identifier(table)))?;
    let column_count = stmt.column_count();
    let mut rows = stmt.query([limit as i64])?;

    let mut sample = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(value_to_json(row.get_ref(i)?));
        }
        sample.push(values);
    }
    Ok(sample)
}

/// Builds the schema descriptor for every user table.
///
/// Enumerating tables or columns failing is fatal. A table whose rows cannot be sampled
/// (a virtual table with a missing module, say) keeps its columns and gets an empty sample.
pub fn inspect(conn: &Connection, sample_size: usize) -> Result<SchemaDescriptor, SchemaReadError> {
    let names = list_tables(conn)?;
    if names.is_empty() {
        return Err(SchemaReadError::NoUserTables);
    }

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let columns = describe_columns(conn, &name)?;
        let sample_rows = match sample_rows(conn, &name, sample_size) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Could not sample rows from {}: {}", name, e);
                Vec::new()
            }
        };
        debug!(
            "Inspected table {} ({} columns, {} sample rows)",
            name,
            columns.len(),
            sample_rows.len()
        );
        tables.push(TableDescriptor {
            name,
            columns,
            sample_rows,
        });
    }

    Ok(SchemaDescriptor { tables })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{employees_db, open_read_only};

    #[test]
    fn inspect_matches_user_tables_exactly() {
        let (_dir, path) = employees_db();
        let writer = Connection::open(&path).unwrap();
        writer
            .execute_batch(
                "CREATE TABLE departments (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     title TEXT NOT NULL
                 );
                 INSERT INTO departments (title) VALUES ('Engineering');
                 CREATE VIEW rich AS SELECT * FROM employees WHERE salary > 100000;",
            )
            .unwrap();
        drop(writer);

        let conn = open_read_only(&path);
        let schema = inspect(&conn, 3).unwrap();

        // AUTOINCREMENT creates sqlite_sequence; the view is not a table
        assert_eq!(schema.table_names(), vec!["departments", "employees"]);
    }

    #[test]
    fn columns_carry_types_and_constraints() {
        let (_dir, path) = employees_db();
        let conn = open_read_only(&path);

        let columns = describe_columns(&conn, "employees").unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "salary"]);
        assert!(columns[0].primary_key);
        assert_eq!(columns[1].declared_type, "TEXT");
        assert!(!columns[1].nullable);
        assert_eq!(columns[2].affinity, TypeAffinity::Integer);
    }

    #[test]
    fn sample_is_bounded_and_in_row_order() {
        let (_dir, path) = employees_db();
        let conn = open_read_only(&path);

        let schema = inspect(&conn, 2).unwrap();
        let employees = schema.table("employees").unwrap();
        assert_eq!(employees.sample_rows.len(), 2);
        assert_eq!(employees.sample_rows[0][1], serde_json::json!("Alice"));
        assert_eq!(employees.sample_rows[1][1], serde_json::json!("Bob"));
    }

    #[test]
    fn empty_database_is_a_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.db");
        Connection::open(&path).unwrap().execute_batch("PRAGMA user_version = 1;").unwrap();

        let conn = open_read_only(&path);
        assert!(matches!(inspect(&conn, 3), Err(SchemaReadError::NoUserTables)));
    }
}
