//! Schema context formatting for natural-language-to-SQL prompts
//!
//! The output is a pure function of the snapshot's tables, the dialect and the
//! size bound, so it can be cached on the snapshot version.

use parking_lot::Mutex;
use sqlduet_core::{ColumnDescriptor, Dialect, TableDescriptor};
use std::collections::HashMap;
use std::sync::Arc;

use crate::CatalogSnapshot;

/// Default bound on the formatted text, in characters
pub const DEFAULT_MAX_CHARS: usize = 16_000;

/// Render `snapshot` as prompt context for `dialect`.
///
/// The text opens with a dialect preamble, followed by one line per table in
/// name order. It never exceeds `max_chars` characters: when the tables do not
/// all fit, a trailing marker states how many were left out.
pub fn format_schema_context(snapshot: &CatalogSnapshot, dialect: Dialect, max_chars: usize) -> String {
    let preamble = preamble(dialect);
    let lines: Vec<String> = snapshot.iter().map(table_line).collect();

    let preamble_len = preamble.chars().count();
    let line_lens: Vec<usize> = lines.iter().map(|l| l.chars().count()).collect();
    let total = preamble_len + line_lens.iter().sum::<usize>();

    if total <= max_chars {
        let mut out = preamble;
        out.extend(lines);
        return out;
    }

    if preamble_len >= max_chars {
        tracing::warn!(max_chars, "schema context bound is smaller than the dialect preamble");
        return preamble.chars().take(max_chars).collect();
    }

    // largest prefix of tables that still leaves room for the marker
    let mut used = preamble_len;
    let mut kept = 0;
    for (i, len) in line_lens.iter().enumerate() {
        let marker_len = omitted_marker(lines.len() - i - 1).chars().count();
        if used + len + marker_len > max_chars {
            break;
        }
        used += len;
        kept += 1;
    }

    let marker = omitted_marker(lines.len() - kept);
    let mut out = preamble;
    if used + marker.chars().count() <= max_chars {
        out.extend(lines.into_iter().take(kept));
        out.push_str(&marker);
    }
    tracing::debug!(
        kept,
        omitted = snapshot.len() - kept,
        max_chars,
        "schema context truncated"
    );
    out
}

fn preamble(dialect: Dialect) -> String {
    let engine = match dialect {
        Dialect::Embedded => "SQLite (embedded file database)",
        Dialect::Networked => "PostgreSQL (server database)",
    };
    let mut out = format!("Dialect: {}\nSyntax notes:\n", engine);
    for hint in dialect.syntax_hints() {
        out.push_str("- ");
        out.push_str(hint);
        out.push('\n');
    }
    out.push_str("\nDatabase schema:\n");
    out
}

fn omitted_marker(omitted: usize) -> String {
    if omitted == 1 {
        "... 1 more table omitted\n".to_string()
    } else {
        format!("... {} more tables omitted\n", omitted)
    }
}

fn table_line(table: &TableDescriptor) -> String {
    let columns: Vec<String> = table.columns.iter().map(|c| column_entry(table, c)).collect();
    format!("- {} ({})\n", table.catalog_name(), columns.join(", "))
}

fn column_entry(table: &TableDescriptor, column: &ColumnDescriptor) -> String {
    let mut entry = column.name.clone();
    if !column.declared_type.is_empty() {
        entry.push_str(": ");
        entry.push_str(&column.declared_type);
    }

    let composite_pk = table.primary_key().len() > 1;
    if column.primary_key {
        entry.push_str(if composite_pk { " PK(part)" } else { " PK" });
    } else {
        if !column.nullable {
            entry.push_str(" NOT NULL");
        }
        if table.is_unique_column(&column.name) {
            entry.push_str(" UNIQUE");
        }
    }
    if let Some(fk) = table.foreign_key_for(&column.name) {
        entry.push_str(&format!(" FK -> {}.{}", fk.referenced_table, fk.referenced_column));
    }
    entry
}

/// Formatted context keyed on `(snapshot version, dialect, bound)`.
///
/// Entries from older snapshot versions are dropped as soon as a newer version
/// is requested.
#[derive(Default)]
pub struct SchemaContextCache {
    entries: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    version: u64,
    formatted: HashMap<(Dialect, usize), Arc<str>>,
}

impl SchemaContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached text for this snapshot, formatting it on a miss
    pub fn get_or_format(&self, snapshot: &CatalogSnapshot, dialect: Dialect, max_chars: usize) -> Arc<str> {
        let mut state = self.entries.lock();
        if state.version != snapshot.version {
            tracing::debug!(
                old_version = state.version,
                new_version = snapshot.version,
                "schema context cache invalidated"
            );
            state.version = snapshot.version;
            state.formatted.clear();
        }

        if let Some(text) = state.formatted.get(&(dialect, max_chars)) {
            tracing::trace!(version = snapshot.version, %dialect, "schema context cache hit");
            return Arc::clone(text);
        }

        tracing::trace!(version = snapshot.version, %dialect, "schema context cache miss");
        let text: Arc<str> = format_schema_context(snapshot, dialect, max_chars).into();
        state.formatted.insert((dialect, max_chars), Arc::clone(&text));
        text
    }

    pub fn clear(&self) {
        let mut state = self.entries.lock();
        state.version = 0;
        state.formatted.clear();
    }
}
