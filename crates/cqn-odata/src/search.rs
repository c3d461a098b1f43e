//! `$search` to `contains` predicates

use cqn_ir::Expr;
use cqn_model::Entity;

use crate::request::SearchExpression;
use crate::TranslateError;

/// Parentheses outside double-quoted phrases
pub fn has_grouping(text: &str) -> bool {
    let mut quoted = false;
    let mut escaped = false;
    for c in text.chars() {
        match c {
            '\\' if quoted && !escaped => {
                escaped = true;
                continue;
            }
            '"' if !escaped => quoted = !quoted,
            '(' | ')' if !quoted => return true,
            _ => {}
        }
        escaped = false;
    }
    false
}

/// Columns searched for `entity`; under `$apply` only projected columns and aggregates.
pub fn search_columns(entity: &Entity, projected: Option<&[Expr]>) -> Vec<String> {
    let Some(projected) = projected else {
        return entity.searchable_columns();
    };

    let mut plain = Vec::new();
    let mut aggregates = Vec::new();
    for column in projected {
        match column {
            Expr::Func(f) => aggregates.push(f.alias.clone().unwrap_or_else(|| f.func.clone())),
            Expr::Ref(r) if r.is_expand() => {}
            Expr::Ref(r) => match (r.last(), r.alias.as_deref()) {
                (Some(name), None) if entity.element(name).is_some() => plain.push(name.to_string()),
                (Some(name), alias) => aggregates.push(alias.unwrap_or(name).to_string()),
                (None, _) => {}
            },
            _ => {}
        }
    }

    let searchable = entity.searchable_columns();
    let mut columns: Vec<String> = plain.into_iter().filter(|c| searchable.contains(c)).collect();
    columns.extend(aggregates);
    columns
}

/// `contains(columns, terms)`; a top-level `NOT term` becomes `not contains`.
///
/// Names found among `aggregates` (by function name or alias) resolve to the
/// aggregate call so the predicate fits a `having` clause.
pub fn translate_search(
    search: &SearchExpression,
    columns: &[String],
    aggregates: &[Expr],
) -> Result<Vec<Expr>, TranslateError> {
    let list = Expr::list(columns.iter().map(|c| column(c, aggregates)).collect());
    let (name, terms) = match search {
        SearchExpression::Not { operand } => match operand.as_ref() {
            SearchExpression::Term { text } => ("not contains", vec![Expr::val(text.as_str())]),
            _ => return Err(TranslateError::unsupported("NOT on a group in query option $search")),
        },
        other => {
            let mut terms = Vec::new();
            flatten(other, &mut terms)?;
            ("contains", terms)
        }
    };

    let mut args = vec![list];
    args.extend(terms);
    Ok(vec![Expr::func(name, args)])
}

fn column(name: &str, aggregates: &[Expr]) -> Expr {
    aggregates
        .iter()
        .find_map(|a| match a {
            Expr::Func(f) if f.func == name || f.alias.as_deref() == Some(name) => {
                let mut f = f.clone();
                f.alias = None;
                Some(Expr::Func(f))
            }
            _ => None,
        })
        .unwrap_or_else(|| Expr::column(name))
}

fn flatten(search: &SearchExpression, terms: &mut Vec<Expr>) -> Result<(), TranslateError> {
    match search {
        SearchExpression::Term { text } => terms.push(Expr::val(text.as_str())),
        SearchExpression::Not { operand } => match operand.as_ref() {
            SearchExpression::Term { text } => {
                terms.push(Expr::token("not"));
                terms.push(Expr::val(text.as_str()));
            }
            _ => return Err(TranslateError::unsupported("NOT on a group in query option $search")),
        },
        SearchExpression::And { left, right } => {
            flatten(left, terms)?;
            terms.push(Expr::token("and"));
            flatten(right, terms)?;
        }
        SearchExpression::Or { left, right } => {
            flatten(left, terms)?;
            terms.push(Expr::token("or"));
            flatten(right, terms)?;
        }
    }
    Ok(())
}
