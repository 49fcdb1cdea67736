//! SQL dialect rules shared by the splitter, the reconciler and the formatter
//!
//! Only the handful of differences this layer actually depends on live here:
//! identifier quoting, placeholder syntax, and statement classification.

use serde::{Deserialize, Serialize};

/// The two SQL dialects spoken by the supported backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// File-backed engine (SQLite)
    Embedded,
    /// Client-server engine (PostgreSQL)
    Networked,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Embedded => "sqlite",
            Dialect::Networked => "postgresql",
        }
    }

    /// Quote an identifier, doubling any embedded quote character
    pub fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    /// Quote a table name, qualified by its schema when it has one
    pub fn quote_table(&self, schema: Option<&str>, name: &str) -> String {
        match schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(name)
            ),
            None => self.quote_identifier(name),
        }
    }

    /// How a column of `declared_type` can be tested for equality with a bound value
    pub fn column_equality(&self, declared_type: &str) -> ColumnEquality {
        if *self == Dialect::Embedded {
            return ColumnEquality::Direct;
        }
        let t = declared_type.trim().to_lowercase();
        let base = t.trim_start_matches('_').trim_end_matches("[]");
        let is_array = base.len() != t.len();
        match base {
            "json" if !is_array => ColumnEquality::Cast("jsonb"),
            "json" | "xml" => ColumnEquality::Cast("text"),
            "point" | "line" | "lseg" | "box" | "path" | "polygon" | "circle" => {
                ColumnEquality::Unsupported
            }
            _ => ColumnEquality::Direct,
        }
    }

    /// Bind placeholder for the 1-based parameter `position`
    pub fn placeholder(&self, position: usize) -> String {
        match self {
            Dialect::Embedded => "?".to_string(),
            Dialect::Networked => format!("${}", position),
        }
    }

    /// Whether `$tag$ ... $tag$` quoting is part of the lexical grammar
    pub fn supports_dollar_quoting(&self) -> bool {
        matches!(self, Dialect::Networked)
    }

    /// Why a statement cannot take part in an enclosing transaction, if it cannot
    pub fn non_transactional_reason(&self, sql: &str) -> Option<&'static str> {
        let words = leading_words(sql, 4);
        let first = words.first().map(String::as_str)?;
        match (self, first) {
            (_, "VACUUM") => Some("VACUUM cannot run inside a transaction"),
            (Dialect::Embedded, "ATTACH") | (Dialect::Embedded, "DETACH") => {
                Some("ATTACH/DETACH cannot run inside a transaction")
            }
            (Dialect::Networked, "CREATE") | (Dialect::Networked, "DROP") => {
                if words.get(1).is_some_and(|w| w == "DATABASE" || w == "TABLESPACE") {
                    Some("CREATE/DROP DATABASE or TABLESPACE cannot run inside a transaction")
                } else if words.iter().any(|w| w == "CONCURRENTLY") {
                    Some("CONCURRENTLY index operations cannot run inside a transaction")
                } else {
                    None
                }
            }
            (Dialect::Networked, "REINDEX") if words.iter().any(|w| w == "CONCURRENTLY") => {
                Some("REINDEX CONCURRENTLY cannot run inside a transaction")
            }
            (Dialect::Networked, "ALTER") if words.get(1).is_some_and(|w| w == "SYSTEM") => {
                Some("ALTER SYSTEM cannot run inside a transaction")
            }
            _ => None,
        }
    }

    /// Clause/feature hints rendered into the schema context preamble
    pub fn syntax_hints(&self) -> &'static [&'static str] {
        match self {
            Dialect::Embedded => &[
                "Quote identifiers with double quotes; string literals use single quotes",
                "Bind parameters are written as ?",
                "LIMIT n OFFSET m is supported; FETCH FIRST is not",
                "No RIGHT/FULL OUTER JOIN before SQLite 3.39; no ILIKE (use LIKE, which is case-insensitive for ASCII)",
                "Column types are affinities; booleans are stored as 0/1 integers",
                "Date/time values are text; use date(), datetime(), strftime()",
                "RETURNING is supported on INSERT/UPDATE/DELETE",
            ],
            Dialect::Networked => &[
                "Quote identifiers with double quotes; string literals use single quotes",
                "Bind parameters are written as $1, $2, ...",
                "LIMIT/OFFSET and FETCH FIRST n ROWS ONLY are supported",
                "ILIKE performs case-insensitive matching; ~ performs regex matching",
                "Native boolean, timestamp/timestamptz, json/jsonb, uuid and array types",
                "Use ::type for casts; string concatenation with ||",
                "RETURNING and ON CONFLICT ... DO UPDATE are supported",
            ],
        }
    }
}

/// Equality support of a column type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnEquality {
    /// `column = value` works as written
    Direct,
    /// Both sides must be cast to this type first
    Cast(&'static str),
    /// No usable equality operator; leave the column out of row matching
    Unsupported,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Skip leading whitespace and comments, returning the remaining text
pub fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        let trimmed = rest.trim_start();
        if let Some(after) = trimmed.strip_prefix("--") {
            rest = match after.find('\n') {
                Some(pos) => &after[pos + 1..],
                None => "",
            };
        } else if let Some(after) = trimmed.strip_prefix("/*") {
            rest = match after.find("*/") {
                Some(pos) => &after[pos + 2..],
                None => "",
            };
        } else {
            return trimmed;
        }
    }
}

/// First `n` upper-cased keywords of a statement, ignoring leading comments
pub fn leading_words(sql: &str, n: usize) -> Vec<String> {
    strip_leading_comments(sql)
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .take(n)
        .map(|w| w.to_uppercase())
        .collect()
}

/// Whether the statement produces a result set
pub fn returns_rows(sql: &str) -> bool {
    let words = keywords(sql);
    let Some((position, verb)) = main_verb_at(&words) else {
        // a WITH whose body could not be classified still reads like a query
        return words.first().is_some_and(|w| w.word == "WITH");
    };
    match verb {
        "SELECT" | "VALUES" | "SHOW" | "EXPLAIN" | "PRAGMA" | "TABLE" => true,
        // `PRAGMA x = y` assignments return nothing on most pragmas but a row on
        // some; running them through the row path is harmless either way
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "MERGE" => words[position + 1..]
            .iter()
            .any(|w| w.depth == 0 && w.word == "RETURNING"),
        _ => false,
    }
}

/// Leading keyword of the statement's body, looking past a `WITH` clause
pub fn main_verb(sql: &str) -> Option<String> {
    let words = keywords(sql);
    main_verb_at(&words).map(|(_, verb)| verb.to_string())
}

/// Whether the statement inserts, updates or deletes rows
pub fn modifies_data(sql: &str) -> bool {
    matches!(
        main_verb(sql).as_deref(),
        Some("INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "MERGE")
    )
}

/// Whether the statement opens, ends or aborts a transaction.
/// Savepoint statements work inside one and are not counted.
pub fn is_transaction_control(sql: &str) -> bool {
    let words = keywords(sql);
    let word = |i: usize| words.get(i).map(|w| w.word.as_str());
    match word(0) {
        Some("BEGIN" | "COMMIT" | "END" | "ABORT") => true,
        Some("START") => word(1) == Some("TRANSACTION"),
        Some("PREPARE") => word(1) == Some("TRANSACTION"),
        Some("ROLLBACK") => {
            let next = match word(1) {
                Some("TRANSACTION" | "WORK") => word(2),
                other => other,
            };
            next != Some("TO")
        }
        _ => false,
    }
}

/// Whether the statement changes schema
pub fn is_ddl(sql: &str) -> bool {
    let words = leading_words(sql, 1);
    matches!(
        words.first().map(String::as_str),
        Some("CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME" | "COMMENT")
    )
}

const BODY_VERBS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "REPLACE", "MERGE", "VALUES", "TABLE",
];

fn main_verb_at(words: &[Keyword]) -> Option<(usize, &str)> {
    let first = words.first()?;
    if first.word != "WITH" {
        return Some((0, first.word.as_str()));
    }
    words
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, w)| w.depth == 0 && BODY_VERBS.contains(&w.word.as_str()))
        .map(|(i, w)| (i, w.word.as_str()))
}

/// A bare word of SQL text with its parenthesis depth
#[derive(Debug)]
struct Keyword {
    word: String,
    depth: usize,
}

/// Upper-cased bare words of `sql`, skipping string literals, quoted
/// identifiers, comments and dollar-quoted bodies
fn keywords(sql: &str) -> Vec<Keyword> {
    let bytes = sql.as_bytes();
    let mut words = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\'' => {
                // E'...' strings accept backslash escapes
                let escapes = words.last().is_some_and(|w: &Keyword| w.word == "E")
                    && i > 0
                    && bytes[i - 1].eq_ignore_ascii_case(&b'e');
                if escapes {
                    words.pop();
                }
                i = skip_quoted(bytes, i, b'\'', escapes);
            }
            b'"' | b'`' => i = skip_quoted(bytes, i, b, false),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = match sql[i..].find('\n') {
                    Some(pos) => i + pos + 1,
                    None => bytes.len(),
                };
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let mut nesting = 1;
                i += 2;
                while i < bytes.len() && nesting > 0 {
                    if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
                        nesting += 1;
                        i += 2;
                    } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                        nesting -= 1;
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
            }
            b'$' => match dollar_tag(bytes, i) {
                Some(tag) => {
                    let body = i + tag.len();
                    i = match sql[body..].find(tag) {
                        Some(pos) => body + pos + tag.len(),
                        None => bytes.len(),
                    };
                }
                None => i += 1,
            },
            b'(' => {
                depth += 1;
                i += 1;
            }
            b')' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            _ if b.is_ascii_alphabetic() || b == b'_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
                {
                    i += 1;
                }
                words.push(Keyword {
                    word: sql[start..i].to_ascii_uppercase(),
                    depth,
                });
            }
            _ if b.is_ascii_digit() => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    words
}

/// Index just past the closing `quote` of the literal opening at `start`
fn skip_quoted(bytes: &[u8], start: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if backslash_escapes && bytes[i] == b'\\' {
            i += 2;
        } else if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
            } else {
                return i + 1;
            }
        } else {
            i += 1;
        }
    }
    bytes.len()
}

/// The `$tag$` opening a dollar-quoted body at `start`, if one does
fn dollar_tag(bytes: &[u8], start: usize) -> Option<&str> {
    let mut end = start + 1;
    while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
        end += 1;
    }
    let tag_body = &bytes[start + 1..end];
    if bytes.get(end) != Some(&b'$') || tag_body.first().is_some_and(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(&bytes[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier_escapes_quotes() {
        assert_eq!(Dialect::Embedded.quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(
            Dialect::Networked.quote_table(Some("billing"), "invoices"),
            "\"billing\".\"invoices\""
        );
        assert_eq!(Dialect::Networked.quote_table(None, "a.b"), "\"a.b\"");
    }

    #[test]
    fn test_column_equality() {
        use ColumnEquality::*;
        let pg = Dialect::Networked;
        assert_eq!(pg.column_equality("json"), Cast("jsonb"));
        assert_eq!(pg.column_equality("XML"), Cast("text"));
        assert_eq!(pg.column_equality("_json"), Cast("text"));
        assert_eq!(pg.column_equality("point"), Unsupported);
        assert_eq!(pg.column_equality("polygon[]"), Unsupported);
        assert_eq!(pg.column_equality("jsonb"), Direct);
        assert_eq!(pg.column_equality("integer"), Direct);
        assert_eq!(Dialect::Embedded.column_equality("json"), Direct);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Embedded.placeholder(3), "?");
        assert_eq!(Dialect::Networked.placeholder(3), "$3");
    }

    #[test]
    fn test_strip_leading_comments() {
        let sql = "-- note\n/* block */  UPDATE t SET a = 1";
        assert_eq!(strip_leading_comments(sql), "UPDATE t SET a = 1");
        assert_eq!(strip_leading_comments("-- only a comment"), "");
    }

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows("select * from t"));
        assert!(returns_rows("/* x */ WITH a AS (SELECT 1) SELECT * FROM a"));
        assert!(returns_rows("DELETE FROM t WHERE id = 1 RETURNING id"));
        assert!(!returns_rows("UPDATE t SET returning_flag = 1"));
        assert!(!returns_rows("INSERT INTO t VALUES (1)"));
        assert!(!returns_rows("INSERT INTO t (body) VALUES ('returning customer')"));
        assert!(!returns_rows("UPDATE t SET \"returning\" = 1 -- returning"));
        assert!(!returns_rows("WITH old AS (SELECT 1) DELETE FROM t WHERE id = 1"));
        assert!(returns_rows("WITH old AS (SELECT 1) DELETE FROM t RETURNING id"));
        assert!(returns_rows(
            "WITH gone AS (DELETE FROM t RETURNING id) SELECT count(*) FROM gone"
        ));
        assert!(!returns_rows(
            "INSERT INTO t (body) VALUES ($$ RETURNING $$), (E'it\\'s RETURNING')"
        ));
    }

    #[test]
    fn test_main_verb_and_modifies_data() {
        assert_eq!(
            main_verb("WITH RECURSIVE c(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM c) SELECT n FROM c")
                .as_deref(),
            Some("SELECT")
        );
        assert_eq!(
            main_verb("/* c */ with old as (select 1) delete from notes").as_deref(),
            Some("DELETE")
        );
        assert!(modifies_data("WITH old AS (SELECT 1) DELETE FROM notes WHERE id = 1"));
        assert!(modifies_data("insert into t values ('select')"));
        assert!(!modifies_data("WITH x AS (DELETE FROM t RETURNING 1) SELECT * FROM x"));
        assert!(!modifies_data("CREATE TABLE t (id int)"));
    }

    #[test]
    fn test_is_transaction_control() {
        for sql in [
            "BEGIN",
            "begin transaction",
            "COMMIT",
            "END",
            "ROLLBACK",
            "rollback work",
            "START TRANSACTION ISOLATION LEVEL SERIALIZABLE",
            "ABORT",
            "PREPARE TRANSACTION 'x'",
        ] {
            assert!(is_transaction_control(sql), "{sql}");
        }
        for sql in [
            "SAVEPOINT s1",
            "ROLLBACK TO s1",
            "ROLLBACK TRANSACTION TO SAVEPOINT s1",
            "RELEASE s1",
            "CREATE TRIGGER t AFTER INSERT ON a BEGIN SELECT 1; END",
            "SELECT 'COMMIT'",
        ] {
            assert!(!is_transaction_control(sql), "{sql}");
        }
    }

    #[test]
    fn test_is_ddl() {
        assert!(is_ddl("create table x (id int)"));
        assert!(is_ddl("-- c\nDROP INDEX i"));
        assert!(!is_ddl("INSERT INTO t VALUES (1)"));
    }

    #[test]
    fn test_non_transactional_reason() {
        assert!(Dialect::Embedded.non_transactional_reason("VACUUM").is_some());
        assert!(Dialect::Networked
            .non_transactional_reason("CREATE INDEX CONCURRENTLY i ON t (a)")
            .is_some());
        assert!(Dialect::Networked
            .non_transactional_reason("create database shop")
            .is_some());
        assert!(Dialect::Networked
            .non_transactional_reason("CREATE TABLE t (id int)")
            .is_none());
        assert!(Dialect::Embedded
            .non_transactional_reason("CREATE INDEX CONCURRENTLY i ON t (a)")
            .is_none());
    }
}
