//! Storage for uploaded SQLite files.
//!
//! Each upload lands in its own directory under the data dir so it can be removed in one go.

use rusqlite::{Connection, OpenFlags};
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::db::registry::database_path;

pub const ALLOWED_EXTENSIONS: &[&str] = &["db", "sqlite", "sqlite3"];
const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";
const MAX_NAME_LEN: usize = 64;

#[derive(Debug)]
pub enum IngestError {
    IoError(std::io::Error),
    UnsupportedFileType(String),
    NotSqlite(String),
    InvalidName(String),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::IoError(err) => write!(f, "IO error: {}", err),
            IngestError::UnsupportedFileType(ext) => write!(
                f,
                "Unsupported file type: {} (expected one of .{})",
                ext,
                ALLOWED_EXTENSIONS.join(", .")
            ),
            IngestError::NotSqlite(msg) => write!(f, "Not a SQLite database: {}", msg),
            IngestError::InvalidName(name) => write!(f, "Invalid database name: {}", name),
        }
    }
}

impl Error for IngestError {}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::IoError(err)
    }
}

pub struct IngestManager {
    data_dir: PathBuf,
}

impl IngestManager {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Validates an uploaded file and stores it, returning the name it was registered under.
    ///
    /// The name comes from the file stem; a taken name gets a numeric suffix. The file is
    /// written under a temporary name and only renamed into place once SQLite can read it.
    pub fn store(&self, file_name: &str, bytes: &[u8]) -> Result<String, IngestError> {
        let path = Path::new(file_name);
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .ok_or_else(|| IngestError::UnsupportedFileType("no extension".to_string()))?;
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(IngestError::UnsupportedFileType(extension));
        }
        if !bytes.starts_with(SQLITE_HEADER) {
            return Err(IngestError::NotSqlite(format!(
                "{} lacks the SQLite file header",
                file_name
            )));
        }

        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let base = sanitize_name(stem).ok_or_else(|| IngestError::InvalidName(stem.to_string()))?;

        fs::create_dir_all(&self.data_dir)?;
        let name = self.reserve_directory(&base)?;
        let target = database_path(&self.data_dir, &name);
        let partial = target.with_extension("db.part");

        let written = fs::write(&partial, bytes)
            .map_err(IngestError::from)
            .and_then(|_| check_readable(&partial))
            .and_then(|_| fs::rename(&partial, &target).map_err(IngestError::from));
        if let Err(e) = written {
            warn!("Discarding upload {}: {}", file_name, e);
            if let Err(cleanup) = fs::remove_dir_all(self.data_dir.join(&name)) {
                warn!("Failed to clean up {}: {}", name, cleanup);
            }
            return Err(e);
        }

        info!("Stored database {} ({} bytes) at {}", name, bytes.len(), target.display());
        Ok(name)
    }

    /// Deletes an uploaded database. Returns false when there was nothing to delete.
    pub fn remove(&self, name: &str) -> Result<bool, IngestError> {
        if sanitize_name(name).as_deref() != Some(name) {
            return Err(IngestError::InvalidName(name.to_string()));
        }
        match fs::remove_dir_all(self.data_dir.join(name)) {
            Ok(()) => {
                info!("Removed database {}", name);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the database directory, picking `base`, `base_2`, `base_3`, ... whichever is free.
    fn reserve_directory(&self, base: &str) -> Result<String, IngestError> {
        let mut suffix = 1;
        loop {
            let candidate = if suffix == 1 {
                base.to_string()
            } else {
                format!("{}_{}", base, suffix)
            };
            match fs::create_dir(self.data_dir.join(&candidate)) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("Database name {} is taken", candidate);
                    suffix += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn check_readable(path: &Path) -> Result<(), IngestError> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| IngestError::NotSqlite(e.to_string()))?;
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .map_err(|e| IngestError::NotSqlite(e.to_string()))?;
    Ok(())
}

/// Lowercase ASCII letters, digits, `_` and `-`; anything else becomes `_`.
pub fn sanitize_name(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let trimmed: String = cleaned.trim_matches('_').chars().take(MAX_NAME_LEN).collect();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::employees_db;

    fn sqlite_bytes() -> Vec<u8> {
        let (_dir, path) = employees_db();
        fs::read(path).unwrap()
    }

    #[test]
    fn stores_upload_under_its_own_directory() {
        let data = tempfile::tempdir().unwrap();
        let ingest = IngestManager::new(data.path().to_path_buf());

        let name = ingest.store("Company Data.sqlite", &sqlite_bytes()).unwrap();

        assert_eq!(name, "company_data");
        let stored = database_path(data.path(), &name);
        assert!(stored.exists());
        assert!(!stored.with_extension("db.part").exists());
    }

    #[test]
    fn taken_names_get_a_suffix() {
        let data = tempfile::tempdir().unwrap();
        let ingest = IngestManager::new(data.path().to_path_buf());
        let bytes = sqlite_bytes();

        assert_eq!(ingest.store("shop.db", &bytes).unwrap(), "shop");
        assert_eq!(ingest.store("shop.db", &bytes).unwrap(), "shop_2");
        assert_eq!(ingest.store("SHOP.sqlite3", &bytes).unwrap(), "shop_3");
    }

    #[test]
    fn rejects_wrong_extension_and_foreign_content() {
        let data = tempfile::tempdir().unwrap();
        let ingest = IngestManager::new(data.path().to_path_buf());

        assert!(matches!(
            ingest.store("sales.csv", &sqlite_bytes()),
            Err(IngestError::UnsupportedFileType(ext)) if ext == "csv"
        ));
        assert!(matches!(
            ingest.store("sales.db", b"id,amount\n1,2\n"),
            Err(IngestError::NotSqlite(_))
        ));
        assert!(fs::read_dir(data.path()).unwrap().next().is_none());
    }

    #[test]
    fn corrupt_body_is_cleaned_up() {
        let data = tempfile::tempdir().unwrap();
        let ingest = IngestManager::new(data.path().to_path_buf());
        let mut bytes = SQLITE_HEADER.to_vec();
        bytes.extend(std::iter::repeat_n(0xAB, 200));

        assert!(matches!(ingest.store("broken.db", &bytes), Err(IngestError::NotSqlite(_))));
        assert!(!data.path().join("broken").exists());
    }

    #[test]
    fn remove_deletes_directory() {
        let data = tempfile::tempdir().unwrap();
        let ingest = IngestManager::new(data.path().to_path_buf());
        let name = ingest.store("shop.db", &sqlite_bytes()).unwrap();

        assert!(ingest.remove(&name).unwrap());
        assert!(!ingest.remove(&name).unwrap());
        assert!(matches!(ingest.remove("../etc"), Err(IngestError::InvalidName(_))));
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize_name("Q3 Report (final)").as_deref(), Some("q3_report__final"));
        assert_eq!(sanitize_name("..").as_deref(), None);
        assert_eq!(sanitize_name("___").as_deref(), None);
    }
}
