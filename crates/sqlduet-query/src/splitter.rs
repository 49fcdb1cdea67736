//! Dialect-aware statement splitting
//!
//! A script is cut on top-level semicolons. Semicolons inside string literals,
//! quoted identifiers, comments, dollar-quoted bodies (networked dialect) and
//! `CREATE TRIGGER ... BEGIN ... END` bodies do not end a statement.

use sqlduet_core::dialect::strip_leading_comments;
use sqlduet_core::{Dialect, DuetError, Result};

/// Split `sql` into individual statements, without their terminating semicolons.
///
/// Fragments that contain only whitespace or comments are dropped, so an empty
/// script yields an empty list. An unterminated quote, identifier, block comment
/// or dollar quote fails with `DuetError::Parse` carrying the byte offset of the
/// opening delimiter.
pub fn split_statements(sql: &str, dialect: Dialect) -> Result<Vec<String>> {
    let statements = Splitter::new(sql, dialect).run()?;
    tracing::debug!(statement_count = statements.len(), dialect = %dialect, "script split");
    Ok(statements)
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

struct Splitter<'a> {
    sql: &'a str,
    bytes: &'a [u8],
    dialect: Dialect,
    pos: usize,
    statement_start: usize,
    /// First keywords of the current statement, upper-cased
    head: Vec<String>,
    /// BEGIN/CASE nesting inside a compound body
    depth: usize,
    statements: Vec<String>,
}

impl<'a> Splitter<'a> {
    fn new(sql: &'a str, dialect: Dialect) -> Self {
        Self {
            sql,
            bytes: sql.as_bytes(),
            dialect,
            pos: 0,
            statement_start: 0,
            head: Vec::with_capacity(4),
            depth: 0,
            statements: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn run(mut self) -> Result<Vec<String>> {
        while let Some(b) = self.peek(0) {
            match b {
                b'\'' => {
                    let backslash_escapes = self.is_escape_string();
                    self.skip_quoted(b'\'', b'\'', "unterminated string literal", backslash_escapes)?
                }
                b'"' => self.skip_quoted(b'"', b'"', "unterminated quoted identifier", false)?,
                b'`' if self.dialect == Dialect::Embedded => {
                    self.skip_quoted(b'`', b'`', "unterminated quoted identifier", false)?
                }
                b'[' if self.dialect == Dialect::Embedded => {
                    self.skip_quoted(b'[', b']', "unterminated bracketed identifier", false)?
                }
                b'-' if self.peek(1) == Some(b'-') => self.skip_line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.skip_block_comment()?,
                b'$' if self.dialect.supports_dollar_quoting() => match self.dollar_tag_end() {
                    Some(tag_end) => self.skip_dollar_quoted(tag_end)?,
                    None => self.pos += 1,
                },
                b';' => {
                    if self.depth == 0 {
                        self.finish_statement(self.pos);
                        self.statement_start = self.pos + 1;
                    }
                    self.pos += 1;
                }
                b if is_word_byte(b) => self.read_word(),
                _ => self.pos += 1,
            }
        }

        self.finish_statement(self.bytes.len());
        Ok(self.statements)
    }

    fn finish_statement(&mut self, end: usize) {
        let fragment = self.sql[self.statement_start..end].trim();
        if !strip_leading_comments(fragment).is_empty() {
            self.statements.push(fragment.to_string());
        }
        self.head.clear();
        self.depth = 0;
    }

    /// `E'...'` strings on the networked dialect treat backslash as an escape
    fn is_escape_string(&self) -> bool {
        if self.dialect != Dialect::Networked || self.pos == 0 {
            return false;
        }
        let prefix = self.bytes[self.pos - 1];
        (prefix == b'e' || prefix == b'E')
            && (self.pos < 2 || !is_word_byte(self.bytes[self.pos - 2]))
    }

    fn skip_quoted(
        &mut self,
        open: u8,
        close: u8,
        message: &str,
        backslash_escapes: bool,
    ) -> Result<()> {
        debug_assert_eq!(self.peek(0), Some(open));
        let start = self.pos;
        self.pos += 1;
        while let Some(b) = self.peek(0) {
            if backslash_escapes && b == b'\\' {
                self.pos += 2;
                continue;
            }
            if b == close {
                // doubled closing character is an escaped literal one
                if open == close && self.peek(1) == Some(close) {
                    self.pos += 2;
                    continue;
                }
                self.pos += 1;
                return Ok(());
            }
            self.pos += 1;
        }
        Err(DuetError::parse(message, start))
    }

    fn skip_line_comment(&mut self) {
        self.pos = match self.sql[self.pos..].find('\n') {
            Some(newline) => self.pos + newline + 1,
            None => self.bytes.len(),
        };
    }

    /// PostgreSQL block comments nest; SQLite ones do not
    fn skip_block_comment(&mut self) -> Result<()> {
        let start = self.pos;
        let nests = self.dialect == Dialect::Networked;
        let mut depth = 1usize;
        self.pos += 2;
        while self.pos < self.bytes.len() {
            if nests && self.peek(0) == Some(b'/') && self.peek(1) == Some(b'*') {
                depth += 1;
                self.pos += 2;
            } else if self.peek(0) == Some(b'*') && self.peek(1) == Some(b'/') {
                depth -= 1;
                self.pos += 2;
                if depth == 0 {
                    return Ok(());
                }
            } else {
                self.pos += 1;
            }
        }
        Err(DuetError::parse("unterminated block comment", start))
    }

    /// End offset of a `$tag$` opener at the current position, if there is one.
    ///
    /// `$1` placeholders and `$` inside identifiers are not dollar quotes.
    fn dollar_tag_end(&self) -> Option<usize> {
        if self.pos > 0 && is_word_byte(self.bytes[self.pos - 1]) {
            return None;
        }
        let mut end = self.pos + 1;
        match self.bytes.get(end).copied() {
            Some(b'$') => return Some(end + 1),
            Some(b) if b.is_ascii_digit() || !is_word_byte(b) => return None,
            None => return None,
            Some(_) => {}
        }
        while self.bytes.get(end).copied().is_some_and(is_word_byte) {
            end += 1;
        }
        (self.bytes.get(end) == Some(&b'$')).then_some(end + 1)
    }

    fn skip_dollar_quoted(&mut self, tag_end: usize) -> Result<()> {
        let tag = &self.sql[self.pos..tag_end];
        match self.sql[tag_end..].find(tag) {
            Some(offset) => {
                self.pos = tag_end + offset + tag.len();
                Ok(())
            }
            None => Err(DuetError::parse("unterminated dollar-quoted string", self.pos)),
        }
    }

    fn read_word(&mut self) {
        let start = self.pos;
        while self.peek(0).is_some_and(is_word_byte) {
            self.pos += 1;
        }
        let word = self.sql[start..self.pos].to_ascii_uppercase();

        if self.has_compound_body() {
            match word.as_str() {
                "BEGIN" | "CASE" => self.depth += 1,
                "END" => self.depth = self.depth.saturating_sub(1),
                _ => {}
            }
        }

        if self.head.len() < 4 {
            self.head.push(word);
        }
    }

    /// Triggers (and SQL-standard function bodies) carry `BEGIN ... END` blocks
    /// whose inner semicolons belong to the statement
    fn has_compound_body(&self) -> bool {
        self.head.first().is_some_and(|w| w == "CREATE")
            && self.head[1..]
                .iter()
                .any(|w| matches!(w.as_str(), "TRIGGER" | "FUNCTION" | "PROCEDURE"))
    }
}
