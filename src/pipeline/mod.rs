//! The correction loop: generate, validate, execute, and feed failures back until a
//! statement runs or the retry bound is reached.

pub mod formatter;


use chrono::{DateTime, Utc};
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::QueryConfig;
use crate::db::executor::{ErrorClass, ExecutionOutcome, ResultSet};
use crate::db::handle::DatabaseHandle;
use crate::db::SchemaReadError;
use crate::llm::generator::SqlGenerator;
use crate::llm::models::{CandidateStatement, Feedback, FeedbackKind, GenerationRequest};
use crate::llm::prompt::PromptBuilder;
use crate::llm::{LlmError, TextGenerator};
use crate::sql::{SqlValidator, ValidationVerdict};
use formatter::ResultFormatter;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_retries: u32,
    pub sample_rows: usize,
    pub row_cap: usize,
    pub execution_timeout: Duration,
    pub strict_identifiers: bool,
}

impl From<&QueryConfig> for PipelineConfig {
    fn from(query: &QueryConfig) -> Self {
        Self {
            max_retries: query.max_retries,
            sample_rows: query.sample_rows,
            row_cap: query.row_cap,
            execution_timeout: Duration::from_secs(query.execution_timeout_secs),
            strict_identifiers: query.strict_identifiers,
        }
    }
}

/// What one execution produced, without the rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionSummary {
    Success { row_count: usize, truncated: bool },
    Failure { message: String, class: ErrorClass },
}

/// One generate/validate/execute cycle.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub raw_response: Option<String>,
    pub statement: Option<String>,
    pub verdict: Option<ValidationVerdict>,
    pub execution: Option<ExecutionSummary>,
    pub generation_error: Option<String>,
}

impl AttemptRecord {
    fn new(attempt: u32) -> Self {
        Self {
            attempt,
            started_at: Utc::now(),
            raw_response: None,
            statement: None,
            verdict: None,
            execution: None,
            generation_error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionAnswered {
    pub answer_text: String,
    pub sql_used: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub history: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SchemaRead,
    Generation,
    RetriesExhausted,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionFailed {
    pub error_kind: FailureKind,
    pub error_message: String,
    pub attempt_history: Vec<AttemptRecord>,
}

/// The caller-facing outcome, tagged by `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryResponse {
    Success(QuestionAnswered),
    Error(QuestionFailed),
}

impl From<Result<QuestionAnswered, QuestionFailed>> for QueryResponse {
    fn from(result: Result<QuestionAnswered, QuestionFailed>) -> Self {
        match result {
            Ok(answered) => QueryResponse::Success(answered),
            Err(failed) => QueryResponse::Error(failed),
        }
    }
}

/// Terminal failures of the loop. Recoverable errors never leave it.
#[derive(Debug)]
pub enum PipelineError {
    SchemaRead(SchemaReadError),
    Generation(LlmError),
    RetriesExhausted { attempts: usize, last: Feedback },
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::SchemaRead(_) => FailureKind::SchemaRead,
            PipelineError::Generation(_) => FailureKind::Generation,
            PipelineError::RetriesExhausted { .. } => FailureKind::RetriesExhausted,
            PipelineError::Cancelled => FailureKind::Cancelled,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::SchemaRead(e) => write!(f, "Could not read the database schema: {}", e),
            PipelineError::Generation(e) => write!(f, "SQL generation failed: {}", e),
            PipelineError::RetriesExhausted { attempts, last } => write!(
                f,
                "No working query after {} attempts. Last statement: {}. Last error: {}",
                attempts, last.statement, last.message
            ),
            PipelineError::Cancelled => write!(f, "The question was cancelled"),
        }
    }
}

impl Error for PipelineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PipelineError::SchemaRead(e) => Some(e),
            PipelineError::Generation(e) => Some(e),
            _ => None,
        }
    }
}

impl QuestionFailed {
    fn new(error: PipelineError, attempt_history: Vec<AttemptRecord>) -> Self {
        error!("Question failed: {}", error);
        Self {
            error_kind: error.kind(),
            error_message: error.to_string(),
            attempt_history,
        }
    }
}

enum LoopState {
    Generating { feedback: Option<Feedback> },
    Validating { candidate: CandidateStatement },
    Executing { statement: String },
    Retrying { feedback: Feedback },
    Succeeded { statement: String, result: ResultSet },
    Failed(PipelineError),
}

/// Shared by all requests; every call to `answer_question` owns its own state.
pub struct Pipeline {
    generator: SqlGenerator,
    formatter: ResultFormatter,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        backend: Arc<dyn TextGenerator>,
        llm_timeout: Duration,
        query: &QueryConfig,
    ) -> Result<Self, LlmError> {
        let prompts = Arc::new(PromptBuilder::new(
            query.prompt_sample_rows,
            query.prompt_char_budget,
        )?);
        Ok(Self {
            generator: SqlGenerator::new(Arc::clone(&backend), Arc::clone(&prompts), llm_timeout),
            formatter: ResultFormatter::new(backend, prompts, llm_timeout, query.summarize),
            config: PipelineConfig::from(query),
        })
    }

    pub fn default_max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Answers one question against one checked-out database.
    ///
    /// Runs at most `max_retries + 1` generation attempts. Cancelling `cancel` stops the loop
    /// at its next suspension point.
    pub async fn answer_question(
        &self,
        handle: &DatabaseHandle,
        question: &str,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<QuestionAnswered, QuestionFailed> {
        let span = info_span!("answer_question", database = handle.name(), max_retries);
        self.run(handle, question, max_retries, cancel).instrument(span).await
    }

    async fn run(
        &self,
        handle: &DatabaseHandle,
        question: &str,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<QuestionAnswered, QuestionFailed> {
        info!("Answering question: {}", question);

        let inspection = handle.inspect_schema(self.config.sample_rows);
        let schema = match or_cancelled(cancel, inspection).await {
            Some(Ok(schema)) => schema,
            Some(Err(e)) => {
                return Err(QuestionFailed::new(PipelineError::SchemaRead(e), Vec::new()))
            }
            None => return Err(QuestionFailed::new(PipelineError::Cancelled, Vec::new())),
        };
        let validator = SqlValidator::new(&schema, self.config.strict_identifiers);

        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut state = LoopState::Generating { feedback: None };

        let (statement, result) = loop {
            state = match state {
                LoopState::Generating { feedback } => {
                    let attempt = history.len() as u32 + 1;
                    info!(attempt, "Generating SQL");
                    let request = GenerationRequest {
                        question,
                        schema: &schema,
                        prior: feedback.as_ref(),
                    };
                    let mut record = AttemptRecord::new(attempt);

                    match or_cancelled(cancel, self.generator.generate(&request)).await {
                        None => LoopState::Failed(PipelineError::Cancelled),
                        Some(Ok(candidate)) => {
                            record.raw_response = Some(candidate.raw_response.clone());
                            record.statement = Some(candidate.sql.clone());
                            history.push(record);
                            LoopState::Validating { candidate }
                        }
                        Some(Err(failure)) => {
                            record.raw_response = failure.raw_response.clone();
                            record.generation_error = Some(failure.error.to_string());
                            history.push(record);

                            if failure.error.is_retryable() {
                                warn!(attempt, "Response held no SQL: {}", failure.error);
                                LoopState::Retrying {
                                    feedback: Feedback {
                                        kind: FeedbackKind::Unextractable,
                                        statement: failure.raw_response.unwrap_or_default(),
                                        message: failure.error.to_string(),
                                    },
                                }
                            } else {
                                LoopState::Failed(PipelineError::Generation(failure.error))
                            }
                        }
                    }
                }

                LoopState::Validating { candidate } => {
                    let verdict = validator.validate(&candidate.sql);
                    if let Some(record) = history.last_mut() {
                        record.verdict = Some(verdict.clone());
                    }
                    match verdict {
                        ValidationVerdict::Accepted { statement } => {
                            LoopState::Executing { statement }
                        }
                        ValidationVerdict::Rejected { reason, detail } => {
                            warn!(%reason, "Statement rejected: {}", detail);
                            LoopState::Retrying {
                                feedback: Feedback {
                                    kind: FeedbackKind::Rejected { reason },
                                    statement: candidate.sql,
                                    message: format!("Rejected ({}): {}", reason, detail),
                                },
                            }
                        }
                    }
                }

                LoopState::Executing { statement } => {
                    let execution = handle.execute(
                        &statement,
                        self.config.execution_timeout,
                        self.config.row_cap,
                    );
                    match or_cancelled(cancel, execution).await {
                        None => LoopState::Failed(PipelineError::Cancelled),
                        Some(ExecutionOutcome::Success(result)) => {
                            if let Some(record) = history.last_mut() {
                                record.execution = Some(ExecutionSummary::Success {
                                    row_count: result.row_count,
                                    truncated: result.truncated,
                                });
                            }
                            LoopState::Succeeded { statement, result }
                        }
                        Some(ExecutionOutcome::Failure { message, class }) => {
                            warn!(?class, "Execution failed: {}", message);
                            if let Some(record) = history.last_mut() {
                                record.execution = Some(ExecutionSummary::Failure {
                                    message: message.clone(),
                                    class,
                                });
                            }
                            LoopState::Retrying {
                                feedback: Feedback {
                                    kind: FeedbackKind::ExecutionFailed { class },
                                    statement,
                                    message,
                                },
                            }
                        }
                    }
                }

                LoopState::Retrying { feedback } => {
                    if history.len() as u32 > max_retries {
                        LoopState::Failed(PipelineError::RetriesExhausted {
                            attempts: history.len(),
                            last: feedback,
                        })
                    } else {
                        LoopState::Generating {
                            feedback: Some(feedback),
                        }
                    }
                }

                LoopState::Succeeded { statement, result } => break (statement, result),
                LoopState::Failed(error) => return Err(QuestionFailed::new(error, history)),
            };
        };

        info!(attempts = history.len(), rows = result.row_count, "Query succeeded");
        let formatting = self.formatter.format(question, &statement, &result);
        let answer_text = match or_cancelled(cancel, formatting).await {
            Some(text) => text,
            None => return Err(QuestionFailed::new(PipelineError::Cancelled, history)),
        };

        Ok(QuestionAnswered {
            answer_text,
            sql_used: statement,
            columns: result.columns,
            rows: result.rows,
            row_count: result.row_count,
            truncated: result.truncated,
            history,
        })
    }
}

/// Resolves to `None` as soon as `cancel` fires, dropping `fut`.
async fn or_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = fut => Some(output),
    }
}
