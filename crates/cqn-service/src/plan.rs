//! Expand columns as separate child queries
//!
//! The compiler renders flat statements only, so every `{ref:[nav], expand:[...]}`
//! column of a read is cut out of the projection and planned as its own select
//! over the navigation target, correlated with the parent rows through
//! `(fk...) IN (SELECT parent keys ...)`.

use cqn_ir::{Expr, Limit, Ref, Segment, Select, Source, Value};
use cqn_model::{join_keys, Entity, Model};
use serde::Serialize;
use tracing::debug;

use crate::ServiceError;

/// Expand columns cut out of a projection, in projection order
pub(crate) fn split_expands(columns: Vec<Expr>) -> (Vec<Expr>, Vec<Ref>) {
    let mut plain = Vec::with_capacity(columns.len());
    let mut expands = Vec::new();
    for column in columns {
        match column {
            Expr::Ref(r) if r.is_expand() => expands.push(r),
            other => plain.push(other),
        }
    }
    (plain, expands)
}

/// Under grouping every expand column is projected as plain paths such as
/// `author.name`, which path lowering turns into scalar sub-selects
pub(crate) fn flatten_expands(columns: Vec<Expr>) -> Vec<Expr> {
    let mut flat = Vec::with_capacity(columns.len());
    for column in columns {
        match column {
            Expr::Ref(r) if r.is_expand() => flatten_into(&[], r, &mut flat),
            other => flat.push(other),
        }
    }
    flat
}

fn flatten_into(prefix: &[Segment], r: Ref, out: &mut Vec<Expr>) {
    let mut path = prefix.to_vec();
    path.extend(r.path);
    for column in r.expand.unwrap_or_default() {
        match column {
            Expr::Ref(inner) if inner.is_expand() => flatten_into(&path, inner, out),
            Expr::Ref(inner) => {
                let mut leaf = path.clone();
                leaf.extend(inner.path);
                out.push(Expr::Ref(Ref::new(leaf)));
            }
            _ => {}
        }
    }
}

/// One child query of a read, to be stitched into the parent rows by the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpandPlan {
    /// Navigation names from the root entity, e.g. `["books", "reviews"]`
    pub path: Vec<String>,

    pub to_many: bool,

    /// Parent columns matched pairwise against `child_columns`
    pub parent_columns: Vec<String>,
    pub child_columns: Vec<String>,

    /// `$top`/`$skip` of the expand; they apply per parent row
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<i64>,

    #[serde(skip)]
    pub(crate) select: Select,
}

impl ExpandPlan {
    pub fn select(&self) -> &Select {
        &self.select
    }
}

pub(crate) struct Planner<'m> {
    model: &'m Model,
}

impl<'m> Planner<'m> {
    pub fn new(model: &'m Model) -> Self {
        Self { model }
    }

    /// Adds the parent side of every expand's join keys to `columns` so the
    /// caller can match child rows
    pub fn link_columns(&self, entity: &Entity, expands: &[Ref], columns: &mut Vec<Expr>) -> Result<(), ServiceError> {
        if columns.is_empty() {
            return Ok(());
        }
        for expand in expands {
            let name = navigation(expand)?;
            for key in join_keys(self.model, entity, name).map_err(cqn_odata::TranslateError::from)? {
                push_column(columns, &key.source);
            }
        }
        Ok(())
    }

    /// Child plans for `expands` under `parent`, depth first
    pub fn plan(
        &self,
        parent: &Select,
        entity: &Entity,
        expands: Vec<Ref>,
        prefix: &[String],
        out: &mut Vec<ExpandPlan>,
    ) -> Result<(), ServiceError> {
        for expand in expands {
            let name = navigation(&expand)?.to_string();
            let element = entity.association(&name).map_err(cqn_odata::TranslateError::from)?;
            let target = self.model.target(entity, &name).map_err(cqn_odata::TranslateError::from)?;
            let keys = join_keys(self.model, entity, &name).map_err(cqn_odata::TranslateError::from)?;
            if keys.is_empty() {
                return Err(ServiceError::Unsupported(format!(
                    "Expand of \"{}\" without column pairs in its on-condition",
                    name
                )));
            }

            let mut path = prefix.to_vec();
            path.push(name);

            let parent_columns: Vec<String> = keys.iter().map(|k| k.source.clone()).collect();
            let child_columns: Vec<String> = keys.iter().map(|k| k.target.clone()).collect();

            let mut parent_keys = parent.clone();
            parent_keys.columns = parent_columns.iter().map(Expr::column).collect();
            if parent_keys.limit.is_none() {
                parent_keys.order_by.clear();
            }

            let (mut columns, nested) = split_expands(expand.expand.unwrap_or_default());
            for column in &child_columns {
                push_column(&mut columns, column);
            }
            self.link_columns(target, &nested, &mut columns)?;

            let mut select = Select::new(Source::entity(target.name.clone()));
            select.columns = columns;
            select.where_ = vec![
                Expr::list(child_columns.iter().map(Expr::column).collect()),
                Expr::token("="),
                Expr::func("any", vec![Expr::select(parent_keys)]),
            ];
            if !expand.where_.is_empty() {
                select.where_.push(Expr::token("and"));
                select.where_.push(Expr::xpr(expand.where_));
            }
            select.order_by = expand.order_by;

            let (top, skip) = paging(expand.limit.as_deref());
            debug!(path = %path.join("/"), to_many = element.is_to_many(), "Planned expand");

            let plan = ExpandPlan {
                path: path.clone(),
                to_many: element.is_to_many(),
                parent_columns,
                child_columns,
                top,
                skip,
                select,
            };
            let child = plan.select.clone();
            out.push(plan);
            self.plan(&child, target, nested, &path, out)?;
        }
        Ok(())
    }
}

fn navigation(expand: &Ref) -> Result<&str, ServiceError> {
    match expand.path.as_slice() {
        [step] => Ok(step.name()),
        _ => Err(ServiceError::Unsupported(format!(
            "Expand path of {} steps",
            expand.path.len()
        ))),
    }
}

fn push_column(columns: &mut Vec<Expr>, name: &str) {
    let present = columns
        .iter()
        .any(|c| matches!(c, Expr::Ref(r) if r.alias.is_none() && r.path.len() == 1 && r.last() == Some(name)));
    if !present {
        columns.push(Expr::column(name));
    }
}

/// Row count and offset of an expand, `None` when unbounded
fn paging(limit: Option<&Limit>) -> (Option<i64>, Option<i64>) {
    let Some(limit) = limit else {
        return (None, None);
    };
    let int = |e: &Expr| match e.as_val() {
        Some(Value::Int(n)) => Some(*n),
        _ => None,
    };
    let top = int(&limit.rows).filter(|n| *n != cqn_ir::MAX_ROWS);
    let skip = limit.offset.as_ref().and_then(int);
    (top, skip)
}
