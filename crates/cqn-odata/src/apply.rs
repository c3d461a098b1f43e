//! `$apply`: groupby, aggregate and filter transformations

use cqn_ir::Expr;
use cqn_ql::{parse_column, BuildError};
use tracing::warn;

use crate::expression::Translator;
use crate::request::{AggregateExpression, AggregateMethod, Expression, MemberSegment, Transformation};
use crate::TranslateError;

/// One aggregated column: expression text such as `sum(stock)` and its alias
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub expression: String,
    pub alias: Option<String>,
}

impl Aggregation {
    /// The projected column, aliased when an alias was given
    pub fn to_expr(&self) -> Result<Expr, TranslateError> {
        let column = parse_column(&self.expression).map_err(BuildError::from)?;
        Ok(match &self.alias {
            Some(alias) => column.with_alias(alias.as_str()),
            None => column,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyResult {
    /// Grouping paths; navigation paths have more than one step
    pub group_by: Vec<Vec<String>>,
    pub aggregations: Vec<Aggregation>,
    pub filter: Option<Vec<Expr>>,
}

impl ApplyResult {
    /// Group-by paths as builder text: `title`, `author.name`
    pub fn group_by_text(&self) -> Vec<String> {
        self.group_by.iter().map(|path| path.join(".")).collect()
    }
}

pub fn translate_apply(transformations: &[Transformation], translator: &Translator<'_>) -> Result<ApplyResult, TranslateError> {
    let mut result = ApplyResult::default();
    for transformation in transformations {
        match transformation {
            Transformation::GroupBy { items, transformations } => {
                result.group_by = items.iter().map(|item| group_path(item)).collect::<Result<_, _>>()?;
                if let Some(first) = transformations.first() {
                    let Transformation::Aggregate { expressions } = first else {
                        return Err(rejected(first));
                    };
                    aggregate(expressions, &mut result)?;
                }
            }
            Transformation::Aggregate { expressions } => aggregate(expressions, &mut result)?,
            Transformation::Filter { filter } => result.filter = Some(translator.translate(filter)?),
            other => return Err(rejected(other)),
        }
    }
    Ok(result)
}

fn rejected(transformation: &Transformation) -> TranslateError {
    warn!(kind = transformation.kind_name(), "Rejected $apply transformation");
    TranslateError::unsupported(format!(
        "Transformation \"{}\" with query option $apply",
        transformation.kind_name()
    ))
}

fn group_path(item: &[MemberSegment]) -> Result<Vec<String>, TranslateError> {
    match item.first() {
        Some(MemberSegment::Property { name }) => Ok(vec![name.clone()]),
        Some(MemberSegment::NavigationToOne { .. } | MemberSegment::NavigationToMany { .. }) => {
            Ok(item.iter().filter_map(|s| s.name().map(str::to_string)).collect())
        }
        Some(other) => Err(TranslateError::unsupported(format!(
            "Segment kind \"{}\" in groupby of query option $apply",
            other.kind_name()
        ))),
        None => Err(TranslateError::unsupported("Empty groupby path in query option $apply")),
    }
}

fn aggregate(expressions: &[AggregateExpression], result: &mut ApplyResult) -> Result<(), TranslateError> {
    for aggregate in expressions {
        let counted = matches!(aggregate.path.first(), None | Some(MemberSegment::Count));
        if aggregate.inline.is_some() || !aggregate.from.is_empty() || !counted {
            return Err(TranslateError::unsupported(
                "Only simple aggregate expressions are supported with query option $apply",
            ));
        }

        let expression = match (&aggregate.expression, aggregate.method) {
            (Some(expression), Some(method)) => {
                let column = column_name(expression)?;
                match method {
                    AggregateMethod::Sum => format!("sum({})", column),
                    AggregateMethod::Min => format!("min({})", column),
                    AggregateMethod::Max => format!("max({})", column),
                    AggregateMethod::Average => format!("avg({})", column),
                    AggregateMethod::CountDistinct => format!("count(distinct {})", column),
                }
            }
            _ => "count(1)".to_string(),
        };
        result.aggregations.push(Aggregation { expression, alias: aggregate.alias.clone() });
    }
    Ok(())
}

fn column_name(expression: &Expression) -> Result<String, TranslateError> {
    let Expression::Member { path } = expression else {
        return Err(TranslateError::unsupported(format!(
            "Expression \"{}\" in aggregate of query option $apply",
            expression.kind_name()
        )));
    };
    match path.as_slice() {
        [MemberSegment::Property { name }] => Ok(name.clone()),
        [MemberSegment::NavigationToOne { name } | MemberSegment::NavigationToMany { name }, rest @ ..] => {
            let mut path = vec![name.as_str()];
            path.extend(rest.iter().filter_map(MemberSegment::name));
            Ok(path.join("."))
        }
        _ => Err(TranslateError::unsupported("Member path in aggregate of query option $apply")),
    }
}
