use clap::{Parser, Subcommand};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Connections kept per uploaded database
    pub pool_size: usize,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_mb: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub backend: String, // "remote" or "ollama"
    pub model: String,   // Model name
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f32,
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Logs a warning for a key that doesn't look like a Groq key. Never fatal.
    pub fn check_api_key(&self) {
        if let Some(key) = &self.api_key {
            if self.backend == "remote" && !key.starts_with("gsk_") {
                warn!(
                    "The configured API key doesn't start with 'gsk_', \
                     which is the expected Groq format"
                );
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    /// Retries after the first attempt; a question runs at most `max_retries + 1` attempts
    pub max_retries: u32,
    /// Rows sampled per table by the schema inspector
    pub sample_rows: usize,
    /// Rows per table rendered into the generation prompt
    pub prompt_sample_rows: usize,
    /// Rendered schema size above which sample rows are elided
    pub prompt_char_budget: usize,
    pub row_cap: usize,
    pub execution_timeout_secs: u64,
    pub strict_identifiers: bool,
    /// Ask the model to phrase the answer; off means tabular rendering only
    pub summarize: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub query: QueryConfig,
    pub data_dir: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Directory for uploaded databases
    #[arg(long, global = true)]
    pub data_dir: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Answer a single question against a local SQLite file
    Ask {
        /// SQLite database file to query
        #[arg(long, value_name = "FILE")]
        database: PathBuf,

        /// Override the configured retry bound
        #[arg(long)]
        max_retries: Option<u32>,

        /// The question, in plain language
        question: String,
    },
}

const DEFAULT_GROQ_URL: &str = "https://api.groq.com/openai/v1/chat/completions";

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        // Start with default configuration
        let mut config_builder = Self::with_defaults(Config::builder())?;

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/nl-sql/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // NL_SQL__LLM__API_KEY -> llm.api_key
        config_builder = config_builder.add_source(
            Environment::with_prefix("NL_SQL")
                .separator("__")
                .try_parsing(true),
        );

        // Build the config
        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(data_dir) = &args.data_dir {
            config.data_dir = data_dir.clone();
        }

        if config.llm.api_key.is_none() {
            config.llm.api_key = std::env::var("GROQ_API_KEY").ok();
        }

        Ok(config)
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let defaults = Self::default();
        builder
            .set_default("database.pool_size", defaults.database.pool_size as i64)?
            .set_default("database.busy_timeout_ms", defaults.database.busy_timeout_ms as i64)?
            .set_default("web.host", defaults.web.host)?
            .set_default("web.port", defaults.web.port as i64)?
            .set_default("web.max_upload_mb", defaults.web.max_upload_mb as i64)?
            .set_default("llm.backend", defaults.llm.backend)?
            .set_default("llm.model", defaults.llm.model)?
            .set_default("llm.api_url", defaults.llm.api_url)?
            .set_default("llm.timeout_secs", defaults.llm.timeout_secs as i64)?
            .set_default("llm.temperature", defaults.llm.temperature as f64)?
            .set_default("query.max_retries", defaults.query.max_retries as i64)?
            .set_default("query.sample_rows", defaults.query.sample_rows as i64)?
            .set_default("query.prompt_sample_rows", defaults.query.prompt_sample_rows as i64)?
            .set_default("query.prompt_char_budget", defaults.query.prompt_char_budget as i64)?
            .set_default("query.row_cap", defaults.query.row_cap as i64)?
            .set_default(
                "query.execution_timeout_secs",
                defaults.query.execution_timeout_secs as i64,
            )?
            .set_default("query.strict_identifiers", defaults.query.strict_identifiers)?
            .set_default("query.summarize", defaults.query.summarize)?
            .set_default("data_dir", defaults.data_dir)?
            .set_default("log_format", "text")
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            sample_rows: 3,
            prompt_sample_rows: 3,
            prompt_char_budget: 12_000,
            row_cap: 1_000,
            execution_timeout_secs: 10,
            strict_identifiers: false,
            summarize: true,
        }
    }
}

// Default implementation
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                pool_size: 4,
                busy_timeout_ms: 5_000,
            },
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
                max_upload_mb: 100,
            },
            llm: LlmConfig {
                backend: "remote".to_string(),
                model: "llama3-70b-8192".to_string(),
                api_key: None,
                api_url: Some(DEFAULT_GROQ_URL.to_string()),
                timeout_secs: 60,
                temperature: 0.0,
            },
            query: QueryConfig::default(),
            data_dir: "data".to_string(),
            log_format: LogFormat::Text,
        }
    }
}
