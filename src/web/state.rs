use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::AppConfig;
use crate::db::registry::DatabaseRegistry;
use crate::ingest::IngestManager;
use crate::pipeline::Pipeline;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub registry: DatabaseRegistry,
    pub ingest: IngestManager,
    pub pipeline: Pipeline,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: Pipeline) -> Self {
        let data_dir = PathBuf::from(&config.data_dir);
        let registry = DatabaseRegistry::new(
            data_dir.clone(),
            config.database.pool_size,
            Duration::from_millis(config.database.busy_timeout_ms),
        );

        Self {
            registry,
            ingest: IngestManager::new(data_dir),
            pipeline,
            startup_time: Utc::now(),
            config,
        }
    }
}
