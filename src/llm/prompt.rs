use minijinja::{context, AutoEscape, Environment};
use rust_embed::RustEmbed;
use tracing::debug;

use crate::db::executor::ResultSet;
use crate::db::schema::{SchemaDescriptor, TableDescriptor};
use crate::llm::models::GenerationRequest;
use crate::llm::LlmError;
use crate::util::table::render_rows;

#[derive(RustEmbed)]
#[folder = "templates/"]
struct PromptTemplates;

const SQL_PROMPT: &str = "sql_prompt.jinja";
const ANSWER_PROMPT: &str = "answer_prompt.jinja";
const ELIDED_MARKER: &str = "/* sample rows elided */";
/// Rows of a result shown to the model when phrasing the answer
const ANSWER_ROWS: usize = 20;

/// Renders generation and answer prompts. Pure: no I/O after construction.
pub struct PromptBuilder {
    env: Environment<'static>,
    sample_rows: usize,
    char_budget: usize,
}

impl PromptBuilder {
    pub fn new(sample_rows: usize, char_budget: usize) -> Result<Self, LlmError> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_auto_escape_callback(|_| AutoEscape::None);

        for name in [SQL_PROMPT, ANSWER_PROMPT] {
            let file = PromptTemplates::get(name)
                .ok_or_else(|| LlmError::TemplateError(format!("missing template {}", name)))?;
            let source = String::from_utf8(file.data.into_owned())
                .map_err(|e| LlmError::TemplateError(format!("{}: {}", name, e)))?;
            env.add_template_owned(name, source)
                .map_err(|e| LlmError::TemplateError(e.to_string()))?;
        }

        Ok(Self {
            env,
            sample_rows,
            char_budget,
        })
    }

    pub fn sql_prompt(&self, request: &GenerationRequest<'_>) -> Result<String, LlmError> {
        let schema = render_schema(request.schema, self.sample_rows, self.char_budget);
        let prompt = self.render(
            SQL_PROMPT,
            context! {
                schema => schema,
                question => request.question,
                prior => request.prior,
            },
        )?;
        debug!("Prepared SQL prompt ({} chars)", prompt.len());
        Ok(prompt)
    }

    pub fn answer_prompt(
        &self,
        question: &str,
        sql: &str,
        result: &ResultSet,
    ) -> Result<String, LlmError> {
        self.render(
            ANSWER_PROMPT,
            context! {
                question => question,
                sql => sql,
                row_count => result.row_count,
                truncated => result.truncated,
                table => render_rows(&result.columns, &result.rows, ANSWER_ROWS),
            },
        )
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String, LlmError> {
        self.env
            .get_template(name)
            .and_then(|tmpl| tmpl.render(ctx))
            .map_err(|e| LlmError::TemplateError(e.to_string()))
    }
}

/// One `CREATE TABLE` per table, each followed by a few sample rows.
///
/// When the whole thing is longer than `char_budget`, sample blocks are dropped, biggest
/// first, until it fits. Table and column definitions are always kept.
pub fn render_schema(schema: &SchemaDescriptor, sample_rows: usize, char_budget: usize) -> String {
    let definitions: Vec<String> = schema.tables.iter().map(|t| t.to_create_table_sql()).collect();
    let mut samples: Vec<Option<String>> = schema
        .tables
        .iter()
        .map(|t| render_sample(t, sample_rows))
        .collect();

    let total = |samples: &[Option<String>]| -> usize {
        definitions.iter().map(|d| d.len() + 2).sum::<usize>()
            + samples
                .iter()
                .map(|s| s.as_ref().map_or(0, |s| s.len() + 1))
                .sum::<usize>()
    };

    let mut elided = vec![false; samples.len()];
    while total(&samples) > char_budget {
        let largest = samples
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s.len())))
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)));
        match largest {
            Some((i, _)) => {
                samples[i] = None;
                elided[i] = true;
            }
            None => break,
        }
    }

    let mut rendered = String::new();
    for (i, definition) in definitions.iter().enumerate() {
        rendered.push_str(definition);
        rendered.push('\n');
        if let Some(sample) = &samples[i] {
            rendered.push_str(sample);
        } else if elided[i] {
            rendered.push_str(ELIDED_MARKER);
            rendered.push('\n');
        }
        rendered.push('\n');
    }
    rendered.trim_end().to_string()
}

fn render_sample(table: &TableDescriptor, sample_rows: usize) -> Option<String> {
    if sample_rows == 0 || table.sample_rows.is_empty() {
        return None;
    }
    let rows = &table.sample_rows[..table.sample_rows.len().min(sample_rows)];
    let columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
    Some(format!(
        "/*\n{} rows from {} table:\n{}*/",
        rows.len(),
        table.name,
        render_rows(&columns, rows, rows.len())
    ))
}
