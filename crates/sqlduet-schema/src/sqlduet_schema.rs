//! sqlduet schema - catalog snapshots and what is derived from them
//!
//! This crate provides:
//! - `SchemaCatalog`: versioned, last-good snapshots of a session's tables
//! - `ForeignKeyGraph`: reference traversal that tolerates cycles
//! - `format_schema_context` / `SchemaContextCache`: deterministic, size-bounded
//!   schema text for natural-language-to-SQL prompts

mod catalog;
mod context;
pub mod graph;

pub use catalog::{CatalogSnapshot, SchemaCatalog};
pub use context::{DEFAULT_MAX_CHARS, SchemaContextCache, format_schema_context};
pub use graph::ForeignKeyGraph;

// Re-export core schema types that callers will look up
pub use sqlduet_core::{ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, TableDescriptor};
