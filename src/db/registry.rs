use r2d2::Pool;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::db::db_pool::{build_pool, SqliteConnectionManager};
use crate::db::SchemaReadError;

/// Uploaded databases live at `<data_dir>/<name>/<name>.db`, each with its own pool.
pub struct DatabaseRegistry {
    data_dir: PathBuf,
    pool_size: usize,
    busy_timeout: Duration,
    pools: RwLock<BTreeMap<String, Pool<SqliteConnectionManager>>>,
}

impl DatabaseRegistry {
    pub fn new(data_dir: PathBuf, pool_size: usize, busy_timeout: Duration) -> Self {
        Self {
            data_dir,
            pool_size,
            busy_timeout,
            pools: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn database_path(&self, name: &str) -> PathBuf {
        database_path(&self.data_dir, name)
    }

    /// Registers every database already present in the data directory.
    pub async fn scan(&self) -> Result<usize, std::io::Error> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if self.database_path(name).exists() {
                    found.push(name.to_string());
                }
            }
        }

        for name in &found {
            if let Err(e) = self.register(name).await {
                warn!("Skipping database {}: {}", name, e);
            }
        }
        info!("Registered {} existing databases from {}", found.len(), self.data_dir.display());
        Ok(found.len())
    }

    pub async fn register(&self, name: &str) -> Result<(), SchemaReadError> {
        let pool = build_pool(self.database_path(name), self.pool_size, self.busy_timeout)?;
        self.pools.write().await.insert(name.to_string(), pool);
        debug!("Registered database: {}", name);
        Ok(())
    }

    pub async fn pool(&self, name: &str) -> Option<Pool<SqliteConnectionManager>> {
        self.pools.read().await.get(name).cloned()
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.pools.write().await.remove(name).is_some()
    }

    pub async fn names(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }
}

pub fn database_path(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(name).join(format!("{}.db", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handle::DatabaseHandle;

    #[tokio::test]
    async fn scan_registers_existing_databases() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = database_path(dir.path(), "shop");
        std::fs::create_dir_all(db_path.parent().unwrap()).unwrap();
        rusqlite::Connection::open(&db_path)
            .unwrap()
            .execute_batch("CREATE TABLE orders (id INTEGER PRIMARY KEY);")
            .unwrap();
        // A directory without a database file is ignored
        std::fs::create_dir_all(dir.path().join("stray")).unwrap();

        let registry =
            DatabaseRegistry::new(dir.path().to_path_buf(), 2, Duration::from_millis(50));
        assert_eq!(registry.scan().await.unwrap(), 1);
        assert_eq!(registry.names().await, vec!["shop"]);

        let pool = registry.pool("shop").await.unwrap();
        let handle = DatabaseHandle::checkout("shop", &pool).await.unwrap();
        assert_eq!(handle.inspect_schema(3).await.unwrap().table_names(), vec!["orders"]);

        assert!(registry.remove("shop").await);
        assert!(registry.pool("shop").await.is_none());
    }
}
