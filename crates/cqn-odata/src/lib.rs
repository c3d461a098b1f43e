//! Translation of parsed protocol requests into canonical query trees
//!
//! The protocol library hands over a [`Request`]: resolved URL segments, the
//! parsed system query options and an optional payload. [`assemble`] turns it
//! into a [`cqn_ir::Query`] for the SQL compiler, plus the existence check
//! that navigation reads need before their result can be trusted.

pub mod apply;
pub mod assemble;
pub mod expand;
pub mod expression;
pub mod navigation;
pub mod request;
pub mod search;

use cqn_model::ModelError;
use cqn_ql::BuildError;
use thiserror::Error;

pub use assemble::{assemble, convert_url_path, AssembleOptions, Assembled, Assembler, ValidationQuery};
pub use expression::Translator;
pub use navigation::{addressed_entity, lower_member_paths, lower_navigation, lower_write, validation_query};
pub use request::{Intent, Request, Segment, SegmentKind};

#[derive(Debug, Error)]
pub enum TranslateError {
    /// The request is valid but uses a construct that is not translated
    #[error("Feature not supported: {construct}")]
    FeatureNotSupported { construct: String },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl TranslateError {
    pub(crate) fn unsupported(construct: impl Into<String>) -> Self {
        TranslateError::FeatureNotSupported { construct: construct.into() }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        TranslateError::Build(BuildError::InvalidArgument { message: message.into(), chain: Vec::new() })
    }
}
