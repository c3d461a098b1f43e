//! Appending predicates to `where`, `having` and `on` clauses

use cqn_ir::Expr;

use crate::arg::{self, Context};
use crate::{Args, BuildError};

/// Tokens of one predicate call plus whether they need parentheses when appended
pub(crate) struct Predicate {
    pub tokens: Vec<Expr>,
    pub wraps: bool,
}

pub(crate) fn predicate(args: Args, ctx: &Context) -> Result<Predicate, BuildError> {
    let shape = arg::classify(args.0)?;
    let wraps = shape.wraps();
    let tokens = arg::reduce(shape, ctx)?;
    Ok(Predicate { tokens, wraps })
}

/// Append `predicate` to `clause` joined by `op`
pub(crate) fn append(clause: &mut Vec<Expr>, op: &str, predicate: Predicate, force_wrap: bool) {
    if clause.is_empty() {
        clause.extend(predicate.tokens);
        return;
    }

    if op == "and" && has_top_level_or(clause) {
        clause.insert(0, Expr::token("("));
        clause.push(Expr::token(")"));
    }
    clause.push(Expr::token(op));

    if predicate.wraps || force_wrap {
        clause.push(Expr::token("("));
        clause.extend(predicate.tokens);
        clause.push(Expr::token(")"));
    } else {
        clause.extend(predicate.tokens);
    }
}

/// `or` outside of any parentheses
fn has_top_level_or(tokens: &[Expr]) -> bool {
    let mut depth = 0usize;
    for token in tokens {
        match token.as_token() {
            Some("(") => depth += 1,
            Some(")") => depth = depth.saturating_sub(1),
            Some(t) if depth == 0 && t.eq_ignore_ascii_case("or") => return true,
            _ => {}
        }
    }
    false
}
