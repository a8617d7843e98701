use r2d2::{ManageConnection, Pool};
use rusqlite::{Connection, OpenFlags};
use std::path::PathBuf;
use std::time::Duration;

/// Hands out read-only connections to one SQLite file.
///
/// The connection cannot write regardless of what statement it is given: the file is opened
/// with `SQLITE_OPEN_READ_ONLY` and `query_only` is switched on for good measure.
pub struct SqliteConnectionManager {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteConnectionManager {
    pub fn new(path: PathBuf, busy_timeout: Duration) -> Self {
        Self { path, busy_timeout }
    }
}

impl ManageConnection for SqliteConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA query_only = ON;")?;
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.query_row("SELECT 1", [], |_| Ok(()))
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

pub fn build_pool(
    path: PathBuf,
    pool_size: usize,
    busy_timeout: Duration,
) -> Result<Pool<SqliteConnectionManager>, r2d2::Error> {
    Pool::builder()
        .max_size(pool_size.max(1) as u32)
        .min_idle(Some(0))
        .connection_timeout(Duration::from_secs(5))
        .build(SqliteConnectionManager::new(path, busy_timeout))
}
