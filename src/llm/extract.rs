use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

use crate::llm::LlmError;

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(.*?)(?:```|\z)").expect("fenced block pattern"));

/// Words a statement may start with. Write forms are included on purpose so that the
/// validator, not the extractor, is the one to turn them down.
const LEADING_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "INSERT", "UPDATE", "DELETE", "REPLACE", "CREATE", "ALTER", "DROP",
    "ATTACH", "DETACH", "PRAGMA", "VACUUM", "EXPLAIN", "VALUES",
];

/// Words that follow "With", "Select", "Update" and friends in English but never in SQL.
const PROSE_FOLLOWERS: &[&str] = &[
    "the", "this", "that", "these", "those", "an", "it", "its", "is", "are", "was", "were",
    "we", "you", "your", "i", "my", "our", "will", "would", "should", "can", "could", "to",
    "of", "following", "below", "above", "here", "respect", "regard",
];

/// Isolates the SQL body of a model response.
///
/// Handles a fenced code block (preferring one tagged `sql`, and tolerating a missing closing
/// fence or a block on a single line), bare SQL, SQL after a lead-in such as "Here you go:",
/// and SQL followed by commentary. Anything else is `Unextractable`.
pub fn extract_sql(content: &str) -> Result<String, LlmError> {
    if let Some(sql) = from_fenced_block(content) {
        debug!("Extracted SQL from fenced block");
        return Ok(sql);
    }

    if let Some(sql) = from_leading_keyword(content) {
        debug!("Extracted SQL by line scanning");
        return Ok(sql);
    }

    let excerpt: String = content.trim().chars().take(120).collect();
    Err(LlmError::Unextractable(if excerpt.is_empty() {
        "empty response".to_string()
    } else {
        excerpt
    }))
}

fn from_fenced_block(content: &str) -> Option<String> {
    let mut fallback = None;
    for captures in FENCED_BLOCK.captures_iter(content) {
        let inner = captures.get(1).map_or("", |m| m.as_str());
        let (language, body) = split_info_string(inner);
        let body = body.trim();
        if body.is_empty() {
            continue;
        }
        if language.eq_ignore_ascii_case("sql") || language.eq_ignore_ascii_case("sqlite") {
            return Some(body.to_string());
        }
        if fallback.is_none() && starts_with_keyword(body) {
            fallback = Some(body.to_string());
        }
    }
    fallback
}

/// Splits the text between two fences into its language tag and its body.
///
/// The tag is the first word of the opening line unless that word is already SQL, so both
/// ```` ```sql SELECT 1``` ```` and ```` ```SELECT 1``` ```` yield `SELECT 1`.
fn split_info_string(inner: &str) -> (&str, String) {
    let (first, rest) = inner.split_once('\n').unwrap_or((inner, ""));
    let first = first.trim();
    if starts_with_keyword(first) {
        return ("", inner.to_string());
    }

    let tag_end = first.find(char::is_whitespace).unwrap_or(first.len());
    let same_line = first[tag_end..].trim();
    let body = if same_line.is_empty() {
        rest.to_string()
    } else {
        format!("{}\n{}", same_line, rest)
    };
    (&first[..tag_end], body)
}

fn from_leading_keyword(content: &str) -> Option<String> {
    let lines: Vec<&str> = content.lines().map(str::trim).collect();
    let (start, first) = lines
        .iter()
        .enumerate()
        .find_map(|(i, line)| statement_start(line).map(|sql| (i, sql)))?;

    let mut sql = String::new();
    for line in std::iter::once(first).chain(lines[start + 1..].iter().copied()) {
        if line.is_empty() || line.starts_with("```") {
            break;
        }
        if !sql.is_empty() {
            sql.push('\n');
        }
        match through_terminator(line) {
            Some(head) => {
                sql.push_str(head);
                break;
            }
            None => sql.push_str(line),
        }
    }
    Some(sql)
}

/// The part of `line` where a statement begins, either the whole line or whatever follows a
/// colon, as in "Here you go: SELECT ...".
fn statement_start(line: &str) -> Option<&str> {
    if is_statement_line(line) {
        return Some(line);
    }
    line.match_indices(':')
        .map(|(i, _)| line[i + 1..].trim_start())
        .find(|rest| is_statement_line(rest))
}

fn is_statement_line(line: &str) -> bool {
    if !starts_with_keyword(line) {
        return false;
    }
    // "With the schema above, this works:" introduces SQL rather than being it
    if !line.contains(';') && (line.ends_with(':') || line.ends_with('.')) {
        return false;
    }
    let next = line
        .split_whitespace()
        .nth(1)
        .map(|word| word.trim_end_matches(|c: char| c.is_ascii_punctuation()));
    !next.is_some_and(|word| PROSE_FOLLOWERS.contains(&word))
}

/// `line` up to and including its first statement terminator outside of quotes.
fn through_terminator(line: &str) -> Option<&str> {
    let mut quote = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, ';') => return Some(&line[..=i]),
            (Some(open), c) if c == open => quote = None,
            _ => {}
        }
    }
    None
}

fn starts_with_keyword(text: &str) -> bool {
    let word: String = text
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    let boundary_ok = text[word.len()..]
        .chars()
        .next()
        .map_or(true, |c| c.is_whitespace() || c == '(' || c == '*' || c == ';');
    boundary_ok && LEADING_KEYWORDS.contains(&word.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_sql_is_returned_as_is() {
        let sql = extract_sql("SELECT COUNT(*) FROM employees WHERE salary > 50000").unwrap();
        assert_eq!(sql, "SELECT COUNT(*) FROM employees WHERE salary > 50000");
    }

    #[test]
    fn fenced_sql_block_is_preferred() {
        let response =
            "Here is the query:\n```sql\nSELECT name\nFROM employees;\n```\nIt lists names.";
        assert_eq!(extract_sql(response).unwrap(), "SELECT name\nFROM employees;");
    }

    #[test]
    fn untagged_fence_with_sql_is_accepted() {
        let response = "```\nSELECT 1;\n```";
        assert_eq!(extract_sql(response).unwrap(), "SELECT 1;");
    }

    #[test]
    fn unclosed_fence_takes_the_rest() {
        let response = "```sql\nSELECT id FROM employees";
        assert_eq!(extract_sql(response).unwrap(), "SELECT id FROM employees");
    }

    #[test]
    fn trailing_commentary_is_dropped() {
        let response = "SELECT name FROM employees\nWHERE salary > 10;\n\
                        This returns everyone paid more than 10.";
        assert_eq!(
            extract_sql(response).unwrap(),
            "SELECT name FROM employees\nWHERE salary > 10;"
        );

        let response =
            "Sure!\nWITH top AS (SELECT 1)\nSELECT * FROM top\n\nLet me know if you need more.";
        assert_eq!(
            extract_sql(response).unwrap(),
            "WITH top AS (SELECT 1)\nSELECT * FROM top"
        );
    }

    #[test]
    fn write_statements_are_extracted_for_the_validator() {
        assert_eq!(extract_sql("DELETE FROM employees").unwrap(), "DELETE FROM employees");
    }

    #[test]
    fn prose_only_is_unextractable() {
        let result = extract_sql("I don't have enough information to answer that question.");
        assert!(matches!(result, Err(LlmError::Unextractable(_))));
        assert!(matches!(extract_sql("   "), Err(LlmError::Unextractable(_))));
    }

    #[test]
    fn single_line_fences_are_opened() {
        assert_eq!(extract_sql("```sql SELECT 1```").unwrap(), "SELECT 1");
        assert_eq!(
            extract_sql("Try ```SELECT name FROM employees``` instead").unwrap(),
            "SELECT name FROM employees"
        );
    }

    #[test]
    fn sql_after_a_colon_on_the_same_line() {
        let response = "Here you go: SELECT COUNT(*) FROM employees; it counts everyone.";
        assert_eq!(extract_sql(response).unwrap(), "SELECT COUNT(*) FROM employees;");
    }

    #[test]
    fn terminator_inside_quotes_does_not_end_the_statement() {
        let response = "SELECT name FROM employees WHERE name = 'a;b'; that's all";
        assert_eq!(
            extract_sql(response).unwrap(),
            "SELECT name FROM employees WHERE name = 'a;b';"
        );
    }

    #[test]
    fn prose_lead_ins_are_not_glued_to_the_query() {
        for lead_in in [
            "With the schema above, this works:",
            "Select the rows you need like this:",
            "Values are stored in cents, so:",
            "Update your query as follows.",
            "With this in mind, here it is",
        ] {
            let response = format!("{}\nSELECT COUNT(*) FROM employees;", lead_in);
            assert_eq!(
                extract_sql(&response).unwrap(),
                "SELECT COUNT(*) FROM employees;",
                "{}",
                lead_in
            );
        }
    }

    #[test]
    fn short_cte_names_are_still_sql() {
        let sql = "WITH a AS (SELECT 1 AS x) SELECT x FROM a";
        assert_eq!(extract_sql(sql).unwrap(), sql);
    }

    #[test]
    fn keyword_needs_a_word_boundary() {
        // "Selection" must not be mistaken for SELECT
        assert!(extract_sql("Selection of rows is not possible").is_err());
    }
}
