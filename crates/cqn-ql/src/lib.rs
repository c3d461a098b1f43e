//! Fluent construction of canonical query trees
//!
//! ```text
//! SelectBuilder::from("CatalogService.Books")?
//!     .columns(["ID", "title", "count(1) as total"])?
//!     .where_(args!["stock", ">", 0])?
//!     .order_by_with("title", "desc")?
//!     .build()
//! ```

pub mod arg;
mod condition;
pub mod delete;
pub mod insert;
pub mod parser;
pub mod select;
pub mod update;

use thiserror::Error;

pub use arg::Arg;
pub use delete::DeleteBuilder;
pub use insert::InsertBuilder;
pub use parser::{parse_column, parse_condition, parse_operand, parse_order_item, parse_path, ParseError};
pub use select::{Column, SelectBuilder};
pub use update::UpdateBuilder;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid argument: {message} (chain: {})", .chain.join("."))]
    InvalidArgument { message: String, chain: Vec<String> },

    #[error("Unexpected call: {method} cannot follow {conflicting} (chain: {})", .chain.join("."))]
    UnexpectedCall {
        method: String,
        conflicting: String,
        chain: Vec<String>,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl BuildError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        BuildError::InvalidArgument { message: message.into(), chain: Vec::new() }
    }

    pub(crate) fn unexpected(method: &str, conflicting: &str) -> Self {
        BuildError::UnexpectedCall {
            method: method.to_string(),
            conflicting: conflicting.to_string(),
            chain: Vec::new(),
        }
    }

    /// Attach the recorded call chain
    pub(crate) fn in_chain(self, calls: &[String]) -> Self {
        match self {
            BuildError::InvalidArgument { message, .. } => BuildError::InvalidArgument { message, chain: calls.to_vec() },
            BuildError::UnexpectedCall { method, conflicting, .. } => BuildError::UnexpectedCall {
                method,
                conflicting,
                chain: calls.to_vec(),
            },
            parse => parse,
        }
    }

    pub fn chain(&self) -> &[String] {
        match self {
            BuildError::InvalidArgument { chain, .. } | BuildError::UnexpectedCall { chain, .. } => chain,
            BuildError::Parse(_) => &[],
        }
    }
}

/// Arguments of a predicate method: a single shape or a fluid/positional list
#[derive(Debug, Clone, PartialEq)]
pub struct Args(pub Vec<Arg>);

impl From<Vec<Arg>> for Args {
    fn from(args: Vec<Arg>) -> Self {
        Args(args)
    }
}

impl From<Arg> for Args {
    fn from(arg: Arg) -> Self {
        Args(vec![arg])
    }
}

impl From<&str> for Args {
    fn from(text: &str) -> Self {
        Args(vec![Arg::from(text)])
    }
}

impl From<String> for Args {
    fn from(text: String) -> Self {
        Args(vec![Arg::Str(text)])
    }
}

impl From<Vec<cqn_ir::Expr>> for Args {
    fn from(tokens: Vec<cqn_ir::Expr>) -> Self {
        Args(vec![Arg::Tokens(tokens)])
    }
}
