//! Tree-to-text compiler
//!
//! Renders a canonical query tree into parameterized SQL with `?`
//! placeholders and the values to bind, in placeholder order.

use cqn_ir::{Query, Value};
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

mod compiler;
pub mod options;

pub use cqn_ir::escape_like;
pub use options::{BooleanLiteral, CompileOptions, Dialect, QuotingStyle};

#[derive(Debug, Error, PartialEq)]
pub enum CompileError {
    #[error("Invalid query tree: {0}")]
    InvalidTree(String),

    #[error("Duplicate column names in projection: {}", .aliases.join(", "))]
    DuplicateAlias { aliases: Vec<String> },
}

/// Query text plus the values for its placeholders
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub text: String,
    pub values: Vec<Value>,
}

impl CompiledQuery {
    /// Number of `?` placeholders in the text
    pub fn placeholders(&self) -> usize {
        self.text.matches('?').count()
    }
}

pub fn compile(query: &Query, options: &CompileOptions) -> Result<CompiledQuery, CompileError> {
    let mut writer = compiler::Writer::new(options);
    match query {
        Query::Select(select) => writer.select(select)?,
        Query::Insert(insert) => writer.insert(insert)?,
        Query::Update(update) => writer.update(update)?,
        Query::Delete(delete) => writer.delete(delete)?,
    }
    let (text, values) = writer.finish();

    trace!(kind = query.kind(), text = %text, values = values.len(), "Compiled query");
    Ok(CompiledQuery { text, values })
}

/// Compiles a tree received in its JSON form
pub fn compile_json(json: &str, options: &CompileOptions) -> Result<CompiledQuery, CompileError> {
    let query: Query = serde_json::from_str(json).map_err(|e| CompileError::InvalidTree(e.to_string()))?;
    compile(&query, options)
}
