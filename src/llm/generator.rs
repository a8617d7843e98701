use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::llm::extract::extract_sql;
use crate::llm::models::{CandidateStatement, GenerationRequest};
use crate::llm::prompt::PromptBuilder;
use crate::llm::{generate_with_timeout, LlmError, TextGenerator};

/// Turns a generation request into a candidate statement with exactly one model call.
pub struct SqlGenerator {
    backend: Arc<dyn TextGenerator>,
    prompts: Arc<PromptBuilder>,
    timeout: Duration,
}

/// A failed generation, keeping whatever the model did say.
#[derive(Debug)]
pub struct GenerationFailure {
    pub error: LlmError,
    pub raw_response: Option<String>,
}

impl SqlGenerator {
    pub fn new(
        backend: Arc<dyn TextGenerator>,
        prompts: Arc<PromptBuilder>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            prompts,
            timeout,
        }
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest<'_>,
    ) -> Result<CandidateStatement, GenerationFailure> {
        let prompt = self.prompts.sql_prompt(request).map_err(|error| GenerationFailure {
            error,
            raw_response: None,
        })?;
        debug!("SQL prompt: {}", prompt);

        let raw_response = generate_with_timeout(self.backend.as_ref(), &prompt, self.timeout)
            .await
            .map_err(|error| GenerationFailure {
                error,
                raw_response: None,
            })?;

        match extract_sql(&raw_response) {
            Ok(sql) => {
                info!("Generated SQL: {}", sql);
                Ok(CandidateStatement { raw_response, sql })
            }
            Err(error) => Err(GenerationFailure {
                error,
                raw_response: Some(raw_response),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::SchemaDescriptor;
    use crate::llm::scripted::ScriptedGenerator;

    fn generator(script: Arc<ScriptedGenerator>) -> SqlGenerator {
        let prompts = Arc::new(PromptBuilder::new(3, 10_000).unwrap());
        SqlGenerator::new(script, prompts, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn extracts_statement_from_fenced_reply() {
        let script = Arc::new(ScriptedGenerator::new(["Sure:\n```sql\nSELECT 1;\n```"]));
        let schema = SchemaDescriptor { tables: vec![] };
        let request = GenerationRequest { question: "one?", schema: &schema, prior: None };

        let candidate = generator(script.clone()).generate(&request).await.unwrap();
        assert_eq!(candidate.sql, "SELECT 1;");
        assert!(candidate.raw_response.starts_with("Sure:"));
        assert_eq!(script.prompts().len(), 1);
    }

    #[tokio::test]
    async fn prose_reply_keeps_raw_response() {
        let script = Arc::new(ScriptedGenerator::new(["I am not sure what you mean."]));
        let schema = SchemaDescriptor { tables: vec![] };
        let request = GenerationRequest { question: "?", schema: &schema, prior: None };

        let failure = generator(script).generate(&request).await.unwrap_err();
        assert!(failure.error.is_retryable());
        assert_eq!(failure.raw_response.as_deref(), Some("I am not sure what you mean."));
    }

    #[tokio::test]
    async fn service_errors_are_not_retried_internally() {
        let script = Arc::new(ScriptedGenerator::from_results(vec![
            Err(LlmError::ConnectionError("refused".to_string())),
            Ok("SELECT 1".to_string()),
        ]));
        let schema = SchemaDescriptor { tables: vec![] };
        let request = GenerationRequest { question: "?", schema: &schema, prior: None };

        let failure = generator(script.clone()).generate(&request).await.unwrap_err();
        assert!(matches!(failure.error, LlmError::ConnectionError(_)));
        assert_eq!(script.prompts().len(), 1);
    }
}
