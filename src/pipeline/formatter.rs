use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::db::executor::ResultSet;
use crate::llm::prompt::PromptBuilder;
use crate::llm::{generate_with_timeout, TextGenerator};
use crate::util::table::render_rows_full;

const FALLBACK_ROWS: usize = 20;
const NO_ROWS: &str = "The query returned no rows.";

/// Phrases a successful result. Best-effort: any failure falls back to a plain table.
pub struct ResultFormatter {
    backend: Arc<dyn TextGenerator>,
    prompts: Arc<PromptBuilder>,
    timeout: Duration,
    summarize: bool,
}

impl ResultFormatter {
    pub fn new(
        backend: Arc<dyn TextGenerator>,
        prompts: Arc<PromptBuilder>,
        timeout: Duration,
        summarize: bool,
    ) -> Self {
        Self {
            backend,
            prompts,
            timeout,
            summarize,
        }
    }

    pub async fn format(&self, question: &str, sql: &str, result: &ResultSet) -> String {
        if !self.summarize {
            return tabular(result);
        }

        let prompt = match self.prompts.answer_prompt(question, sql, result) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!("Could not build answer prompt, using table: {}", e);
                return tabular(result);
            }
        };

        match generate_with_timeout(self.backend.as_ref(), &prompt, self.timeout).await {
            Ok(text) if !text.trim().is_empty() => {
                debug!("Answer summary: {}", text);
                text.trim().to_string()
            }
            Ok(_) => {
                warn!("Answer summary was empty, using table");
                tabular(result)
            }
            Err(e) => {
                warn!("Answer summary failed, using table: {}", e);
                tabular(result)
            }
        }
    }
}

/// Deterministic rendering used when no summary is available.
pub fn tabular(result: &ResultSet) -> String {
    if result.rows.is_empty() {
        return NO_ROWS.to_string();
    }
    render_rows_full(&result.columns, &result.rows, FALLBACK_ROWS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::ScriptedGenerator;
    use crate::llm::LlmError;
    use serde_json::json;

    fn result(rows: Vec<Vec<serde_json::Value>>) -> ResultSet {
        ResultSet {
            columns: vec!["name".to_string(), "salary".to_string()],
            row_count: rows.len(),
            rows,
            truncated: false,
        }
    }

    fn formatter(script: Arc<ScriptedGenerator>, summarize: bool) -> ResultFormatter {
        ResultFormatter::new(
            script,
            Arc::new(PromptBuilder::new(3, 10_000).unwrap()),
            Duration::from_secs(5),
            summarize,
        )
    }

    #[tokio::test]
    async fn uses_model_summary_when_available() {
        let script = Arc::new(ScriptedGenerator::new(["  Alice earns the most.\n"]));
        let answer = formatter(script.clone(), true)
            .format(
                "who earns most?",
                "SELECT name, salary FROM employees",
                &result(vec![vec![json!("Alice"), json!(75000)]]),
            )
            .await;

        assert_eq!(answer, "Alice earns the most.");
        let prompts = script.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("who earns most?"));
        assert!(prompts[0].contains("Alice"));
    }

    #[tokio::test]
    async fn failed_summary_falls_back_to_table() {
        let script = Arc::new(ScriptedGenerator::from_results(vec![Err(LlmError::ConnectionError(
            "refused".to_string(),
        ))]));
        let answer = formatter(script, true)
            .format("q", "SELECT 1", &result(vec![vec![json!("Alice"), json!(75000)]]))
            .await;

        assert_eq!(answer, "name\tsalary\nAlice\t75000\n");
    }

    #[tokio::test]
    async fn summarize_off_never_calls_the_model() {
        let script = Arc::new(ScriptedGenerator::new(["unused"]));
        let answer = formatter(script.clone(), false)
            .format("q", "SELECT 1", &result(vec![]))
            .await;

        assert_eq!(answer, NO_ROWS);
        assert!(script.prompts().is_empty());
    }

    #[tokio::test]
    async fn fallback_table_shows_long_values_in_full() {
        let script = Arc::new(ScriptedGenerator::from_results(vec![Err(
            LlmError::ConnectionError("refused".to_string()),
        )]));
        let address = format!("{} Main Street, Springfield", "1".repeat(90));
        let rows = vec![vec![json!(address.clone()), json!(1)]];
        let answer = formatter(script.clone(), true)
            .format("where?", "SELECT name, salary FROM employees", &result(rows))
            .await;

        assert_eq!(answer, format!("name\tsalary\n{}\t1\n", address));
        // the prompt that failed still carried the shortened cell
        assert!(script.prompts()[0].contains('…'));
    }

    #[test]
    fn long_results_are_cut_with_a_count() {
        let rows = (0..25).map(|i| vec![json!(format!("e{}", i)), json!(i)]).collect();
        let text = tabular(&result(rows));
        assert!(text.ends_with("... and 5 more rows\n"));
        assert_eq!(text.lines().count(), 1 + FALLBACK_ROWS + 1);
    }
}
