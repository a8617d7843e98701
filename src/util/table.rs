use serde_json::Value;

const MAX_CELL_CHARS: usize = 80;

/// Tab-separated header plus rows, the layout the model sees for sample data and results.
///
/// At most `max_rows` rows are written; the remainder is summarised in a final line. Long
/// cells are shortened to keep prompts small.
pub fn render_rows(columns: &[String], rows: &[Vec<Value>], max_rows: usize) -> String {
    render(columns, rows, max_rows, Some(MAX_CELL_CHARS))
}

/// Same layout as [`render_rows`] with every cell kept whole, for text shown to users.
pub fn render_rows_full(columns: &[String], rows: &[Vec<Value>], max_rows: usize) -> String {
    render(columns, rows, max_rows, None)
}

fn render(
    columns: &[String],
    rows: &[Vec<Value>],
    max_rows: usize,
    max_cell_chars: Option<usize>,
) -> String {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Never)
        .from_writer(Vec::new());

    let mut write_all = || -> Result<(), csv::Error> {
        writer.write_record(columns)?;
        for row in rows.iter().take(max_rows) {
            writer.write_record(row.iter().map(|value| cell_text(value, max_cell_chars)))?;
        }
        writer.flush()?;
        Ok(())
    };

    let mut text = match write_all() {
        Ok(()) => writer
            .into_inner()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default(),
        // Writing into memory only fails on malformed input; fall back to a plain join
        Err(_) => plain_join(columns, rows, max_rows, max_cell_chars),
    };

    if rows.len() > max_rows {
        text.push_str(&format!("... and {} more rows\n", rows.len() - max_rows));
    }
    text
}

fn cell_text(value: &Value, max_chars: Option<usize>) -> String {
    let text = match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    // Tabs and newlines would break the row layout
    let flat: String = text
        .chars()
        .map(|c| if c == '\t' || c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    match max_chars {
        Some(limit) if flat.chars().count() > limit => {
            let mut cut: String = flat.chars().take(limit).collect();
            cut.push('…');
            cut
        }
        _ => flat,
    }
}

fn plain_join(
    columns: &[String],
    rows: &[Vec<Value>],
    max_rows: usize,
    max_cell_chars: Option<usize>,
) -> String {
    let mut text = columns.join("\t");
    text.push('\n');
    for row in rows.iter().take(max_rows) {
        let cells: Vec<String> = row.iter().map(|v| cell_text(v, max_cell_chars)).collect();
        text.push_str(&cells.join("\t"));
        text.push('\n');
    }
    text
}
