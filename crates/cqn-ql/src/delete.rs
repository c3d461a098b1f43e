use cqn_ir::{Delete, Query};
use cqn_model::Model;

use crate::arg::Context;
use crate::condition;
use crate::parser;
use crate::{Args, BuildError};

/// Chainable builder for `DELETE` trees
#[derive(Debug, Clone)]
pub struct DeleteBuilder<'m> {
    delete: Delete,
    model: Option<&'m Model>,
    calls: Vec<String>,
}

impl<'m> DeleteBuilder<'m> {
    pub fn from(target: &str) -> Result<Self, BuildError> {
        let calls = vec!["from".to_string()];
        let from = parser::parse_path(target).map_err(|e| BuildError::from(e).in_chain(&calls))?;
        Ok(Self { delete: Delete::new(from), model: None, calls })
    }

    pub fn with_model(mut self, model: &'m Model) -> Self {
        self.model = Some(model);
        self
    }

    pub fn where_(self, args: impl Into<Args>) -> Result<Self, BuildError> {
        self.conjoin("where", "and", args.into())
    }

    pub fn and(self, args: impl Into<Args>) -> Result<Self, BuildError> {
        self.conjoin("and", "and", args.into())
    }

    pub fn or(self, args: impl Into<Args>) -> Result<Self, BuildError> {
        self.conjoin("or", "or", args.into())
    }

    pub fn build(self) -> Query {
        Query::Delete(self.delete)
    }

    fn conjoin(mut self, method: &str, op: &str, args: Args) -> Result<Self, BuildError> {
        self.calls.push(method.to_string());
        let ctx = Context::for_ref(&self.delete.from, self.model);
        match condition::predicate(args, &ctx) {
            Ok(predicate) => {
                condition::append(&mut self.delete.where_, op, predicate, false);
                Ok(self)
            }
            Err(e) => Err(e.in_chain(&self.calls)),
        }
    }
}
