//! Join conditions between an entity and an association target

use cqn_ir::{Expr, Segment};

use crate::{Entity, ForeignKey, Model, ModelError};

/// One `source.column = target.column` pair of an on-condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinKey {
    pub source: String,
    pub target: String,
}

/// Builds the parenthesized on-condition of `entity.assoc`.
///
/// `target_alias` qualifies columns of the association target and
/// `source_alias` those of `entity`. A `$self` backlink is resolved through the
/// target's backing association with the two roles swapped.
pub fn on_condition(
    model: &Model,
    entity: &Entity,
    assoc: &str,
    target_alias: Option<&str>,
    source_alias: Option<&str>,
) -> Result<Vec<Expr>, ModelError> {
    let element = entity.association(assoc)?;
    let mut tokens = vec![Expr::token("(")];

    if let Some(on) = &element.on {
        if let Some(backlink) = self_backlink(on, assoc) {
            let target = model.target(entity, assoc)?;
            return on_condition(model, target, backlink, source_alias, target_alias);
        }
        tokens.extend(on.iter().map(|t| remap(t, assoc, target_alias, source_alias)));
    } else {
        let keys = match &element.keys {
            Some(keys) => keys.clone(),
            None => model
                .target(entity, assoc)?
                .key_columns()
                .into_iter()
                .map(|k| ForeignKey { path: vec![k], alias: None })
                .collect(),
        };
        for (i, fk) in keys.iter().enumerate() {
            if i > 0 {
                tokens.push(Expr::token("and"));
            }
            tokens.push(qualified(target_alias, &[fk.target_element()]));
            tokens.push(Expr::token("="));
            tokens.push(qualified(source_alias, &[format!("{}_{}", assoc, fk.name())]));
        }
    }

    tokens.push(Expr::token(")"));
    Ok(tokens)
}

/// Column pairs correlating `entity` with the target of `assoc`
pub fn join_keys(model: &Model, entity: &Entity, assoc: &str) -> Result<Vec<JoinKey>, ModelError> {
    const SOURCE: &str = "parent";
    const TARGET: &str = "foreign";

    let tokens = on_condition(model, entity, assoc, Some(TARGET), Some(SOURCE))?;
    let side = |expr: &Expr| {
        let r = expr.as_reference()?;
        match (r.first(), r.last()) {
            (Some(alias), Some(col)) if r.path.len() > 1 => Some((alias.to_string(), col.to_string())),
            _ => None,
        }
    };

    let mut keys = Vec::new();
    for window in tokens.windows(3) {
        if !window[1].is_token("=") {
            continue;
        }
        if let (Some(left), Some(right)) = (side(&window[0]), side(&window[2])) {
            match (left.0.as_str(), right.0.as_str()) {
                (SOURCE, TARGET) => keys.push(JoinKey { source: left.1, target: right.1 }),
                (TARGET, SOURCE) => keys.push(JoinKey { source: right.1, target: left.1 }),
                _ => {}
            }
        }
    }
    Ok(keys)
}

/// `assoc.back = $self` yields `back`
fn self_backlink<'a>(on: &'a [Expr], assoc: &str) -> Option<&'a str> {
    if on.len() != 3 || !on[1].is_token("=") {
        return None;
    }
    let is_self = |e: &Expr| e.as_reference().map(|r| r.path.len() == 1 && r.first() == Some("$self")).unwrap_or(false);
    let back = |e: &'a Expr| {
        let r = e.as_reference()?;
        match r.path.as_slice() {
            [Segment::Name(first), Segment::Name(back)] if first == assoc => Some(back.as_str()),
            _ => None,
        }
    };
    if is_self(&on[2]) {
        back(&on[0])
    } else if is_self(&on[0]) {
        back(&on[2])
    } else {
        None
    }
}

fn remap(token: &Expr, assoc: &str, target_alias: Option<&str>, source_alias: Option<&str>) -> Expr {
    match token {
        Expr::Ref(r) if r.first() == Some(assoc) && r.path.len() > 1 => {
            let rest: Vec<String> = r.path[1..].iter().map(|s| s.name().to_string()).collect();
            qualified(target_alias, &rest)
        }
        Expr::Ref(r) => {
            let path: Vec<String> = r.path.iter().map(|s| s.name().to_string()).collect();
            qualified(source_alias, &path)
        }
        Expr::Xpr(x) => Expr::xpr(x.xpr.iter().map(|t| remap(t, assoc, target_alias, source_alias)).collect()),
        other => other.clone(),
    }
}

fn qualified(alias: Option<&str>, path: &[String]) -> Expr {
    Expr::reference(alias.map(str::to_string).into_iter().chain(path.iter().cloned()))
}
