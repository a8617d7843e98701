//! Just enough of SQLite's lexical structure to find statement boundaries and keywords
//! without being fooled by string literals, quoted identifiers or comments.

use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare keyword or identifier
    Word,
    /// `"x"`, `` `x` `` or `[x]`
    QuotedIdent,
    StringLit,
    Number,
    Semicolon,
    LParen,
    RParen,
    Comma,
    Dot,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Range<usize>,
}

impl Token {
    pub fn text<'a>(&self, sql: &'a str) -> &'a str {
        &sql[self.span.clone()]
    }

    /// Case-insensitive keyword comparison; quoted identifiers never match.
    pub fn is_word(&self, sql: &str, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text(sql).eq_ignore_ascii_case(keyword)
    }

    /// Identifier name with quoting removed.
    pub fn ident_name(&self, sql: &str) -> Option<String> {
        let text = self.text(sql);
        match self.kind {
            TokenKind::Word => Some(text.to_string()),
            TokenKind::QuotedIdent if text.len() >= 2 => {
                let inner = &text[1..text.len() - 1];
                Some(match text.as_bytes()[0] {
                    b'"' => inner.replace("\"\"", "\""),
                    b'`' => inner.replace("``", "`"),
                    _ => inner.to_string(),
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexError {
    UnterminatedString(usize),
    UnterminatedIdentifier(usize),
    UnterminatedComment(usize),
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LexError::UnterminatedString(at) => {
                write!(f, "unterminated string literal at offset {}", at)
            }
            LexError::UnterminatedIdentifier(at) => {
                write!(f, "unterminated quoted identifier at offset {}", at)
            }
            LexError::UnterminatedComment(at) => {
                write!(f, "unterminated block comment at offset {}", at)
            }
        }
    }
}

pub fn tokenize(sql: &str) -> Result<Vec<Token>, LexError> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let start = i;

        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        // -- line comment
        if b == b'-' && bytes.get(i + 1) == Some(&b'-') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        // /* block comment */
        if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            match sql[i + 2..].find("*/") {
                Some(end) => i = i + 2 + end + 2,
                None => return Err(LexError::UnterminatedComment(start)),
            }
            continue;
        }

        let kind = match b {
            b'\'' => {
                i = skip_quoted(bytes, i, b'\'').ok_or(LexError::UnterminatedString(start))?;
                TokenKind::StringLit
            }
            b'"' | b'`' => {
                i = skip_quoted(bytes, i, b).ok_or(LexError::UnterminatedIdentifier(start))?;
                TokenKind::QuotedIdent
            }
            b'[' => {
                let end = sql[i..].find(']').ok_or(LexError::UnterminatedIdentifier(start))?;
                i += end + 1;
                TokenKind::QuotedIdent
            }
            b';' => {
                i += 1;
                TokenKind::Semicolon
            }
            b'(' => {
                i += 1;
                TokenKind::LParen
            }
            b')' => {
                i += 1;
                TokenKind::RParen
            }
            b',' => {
                i += 1;
                TokenKind::Comma
            }
            b'.' if !bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => {
                i += 1;
                TokenKind::Dot
            }
            b'0'..=b'9' | b'.' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.' || bytes[i] == b'_')
                {
                    i += 1;
                }
                TokenKind::Number
            }
            _ if is_word_byte(b) => {
                while i < bytes.len() && is_word_byte(bytes[i]) {
                    i += 1;
                }
                TokenKind::Word
            }
            _ => {
                // Multi-byte UTF-8 characters outside quotes are passed through whole
                i += sql[i..].chars().next().map_or(1, char::len_utf8);
                TokenKind::Other
            }
        };

        tokens.push(Token { kind, span: start..i });
    }

    Ok(tokens)
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Returns the index just past the closing quote; a doubled quote is an escaped quote.
fn skip_quoted(bytes: &[u8], open: usize, quote: u8) -> Option<usize> {
    let mut i = open + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

/// Splits the token stream at top-level semicolons, dropping empty statements.
pub fn split_statements(tokens: &[Token]) -> Vec<&[Token]> {
    tokens
        .split(|t| t.kind == TokenKind::Semicolon)
        .filter(|statement| !statement.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind> {
        tokenize(sql).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn literals_hide_semicolons() {
        let sql = "SELECT 'a;b', \"c;d\", [e;f] FROM t; -- trailing; comment";
        let tokens = tokenize(sql).unwrap();
        assert_eq!(split_statements(&tokens).len(), 1);
    }

    #[test]
    fn two_statements_are_split() {
        let sql = "SELECT 1; DELETE FROM t";
        let tokens = tokenize(sql).unwrap();
        let statements = split_statements(&tokens);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1][0].text(sql), "DELETE");
    }

    #[test]
    fn doubled_quotes_stay_inside_literal() {
        assert_eq!(
            kinds("'it''s; fine'"),
            vec![TokenKind::StringLit]
        );
    }

    #[test]
    fn comments_are_skipped() {
        let sql = "/* DROP TABLE t; */ SELECT -- DELETE\n 1";
        let tokens = tokenize(sql).unwrap();
        let words: Vec<&str> = tokens.iter().map(|t| t.text(sql)).collect();
        assert_eq!(words, vec!["SELECT", "1"]);
    }

    #[test]
    fn unterminated_literal_is_an_error() {
        assert_eq!(tokenize("SELECT 'oops"), Err(LexError::UnterminatedString(7)));
        assert!(tokenize("SELECT /* never closed").is_err());
    }

    #[test]
    fn quoted_identifier_names_are_unquoted() {
        let sql = "\"full \"\"name\"\"\" [x] `y`";
        let names: Vec<String> = tokenize(sql)
            .unwrap()
            .iter()
            .filter_map(|t| t.ident_name(sql))
            .collect();
        assert_eq!(names, vec!["full \"name\"", "x", "y"]);
    }

    #[test]
    fn numbers_and_qualified_names() {
        assert_eq!(
            kinds("e.salary > 1.5e3"),
            vec![
                TokenKind::Word,
                TokenKind::Dot,
                TokenKind::Word,
                TokenKind::Other,
                TokenKind::Number
            ]
        );
    }
}
