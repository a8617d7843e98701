use serde::{Deserialize, Serialize};

/// Column type classified by SQLite's affinity rules on the declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeAffinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

impl TypeAffinity {
    /// Section 3.1 of the SQLite datatype docs, applied in order.
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            TypeAffinity::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            TypeAffinity::Text
        } else if upper.is_empty() || upper.contains("BLOB") {
            TypeAffinity::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            TypeAffinity::Real
        } else {
            TypeAffinity::Numeric
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Declared type exactly as written in the table definition; may be empty
    pub declared_type: String,
    pub affinity: TypeAffinity,
    pub nullable: bool,
    pub primary_key: bool,
}

impl ColumnDescriptor {
    pub fn to_sql_definition(&self) -> String {
        let mut definition = quote_identifier(&self.name);
        if !self.declared_type.is_empty() {
            definition.push(' ');
            definition.push_str(&self.declared_type);
        }
        if self.primary_key {
            definition.push_str(" PRIMARY KEY");
        }
        if !self.nullable {
            definition.push_str(" NOT NULL");
        }
        definition
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    /// First rows in natural row order, one JSON value per column
    pub sample_rows: Vec<Vec<serde_json::Value>>,
}

impl TableDescriptor {
    pub fn to_create_table_sql(&self) -> String {
        let columns_sql: Vec<String> = self
            .columns
            .iter()
            .map(|col| col.to_sql_definition())
            .collect();

        format!(
            "CREATE TABLE {} (\n    {}\n);",
            quote_identifier(&self.name),
            columns_sql.join(",\n    ")
        )
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|col| col.name.eq_ignore_ascii_case(name))
    }
}

/// Every user table of one database. Built per request and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub tables: Vec<TableDescriptor>,
}

impl SchemaDescriptor {
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables
            .iter()
            .find(|table| table.name.eq_ignore_ascii_case(name))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// True when any table declares a column with this name (SQLite identifiers are
    /// case-insensitive).
    pub fn has_column(&self, name: &str) -> bool {
        self.tables.iter().any(|table| table.column(name).is_some())
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
