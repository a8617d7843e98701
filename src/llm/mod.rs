pub mod extract;
pub mod generator;
pub mod models;
pub mod prompt;
pub mod providers;

#[cfg(test)]
pub mod scripted;

use crate::config::LlmConfig;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tracing::warn;

#[derive(Debug)]
pub enum LlmError {
    ConnectionError(String),
    Timeout(Duration),
    ResponseError(String),
    ConfigError(String),
    TemplateError(String),
    /// The response held no SQL statement that could be isolated
    Unextractable(String),
}

impl LlmError {
    /// Only a response we could not pull SQL out of is worth asking for again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Unextractable(_))
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::ConnectionError(msg) => write!(f, "LLM connection error: {}", msg),
            LlmError::Timeout(after) => {
                write!(f, "LLM call timed out after {} s", after.as_secs_f32())
            }
            LlmError::ResponseError(msg) => write!(f, "LLM response error: {}", msg),
            LlmError::ConfigError(msg) => write!(f, "LLM configuration error: {}", msg),
            LlmError::TemplateError(msg) => write!(f, "Prompt template error: {}", msg),
            LlmError::Unextractable(msg) => {
                write!(f, "No SQL statement found in LLM response: {}", msg)
            }
        }
    }
}

impl Error for LlmError {}

/// Plain text in, plain text out. Implementations must not retry on their own.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Calls the generator once, failing with `LlmError::Timeout` if it takes longer than `timeout`.
pub async fn generate_with_timeout(
    generator: &dyn TextGenerator,
    prompt: &str,
    timeout: Duration,
) -> Result<String, LlmError> {
    match tokio::time::timeout(timeout, generator.generate(prompt)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Text generation exceeded {:?}", timeout);
            Err(LlmError::Timeout(timeout))
        }
    }
}

pub struct LlmManager {
    generator: Box<dyn TextGenerator>,
}

impl LlmManager {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let generator: Box<dyn TextGenerator> = match config.backend.as_str() {
            "remote" => Box::new(providers::remote::RemoteLlmProvider::new(config)?),
            "ollama" => Box::new(providers::ollama::OllamaProvider::new(config)?),
            _ => {
                return Err(LlmError::ConfigError(format!(
                    "Unsupported LLM backend: {}",
                    config.backend
                )))
            }
        };

        Ok(Self { generator })
    }
}

#[async_trait]
impl TextGenerator for LlmManager {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.generator.generate(prompt).await
    }
}
