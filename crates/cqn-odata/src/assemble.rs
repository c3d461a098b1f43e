//! Request to query tree assembly

use chrono::{DateTime, Utc};
use cqn_ir::{Expr, Query, Select, Value, MAX_ROWS};
use cqn_model::{Entity, Model};
use cqn_ql::select::expand;
use cqn_ql::{DeleteBuilder, InsertBuilder, SelectBuilder, UpdateBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::apply::{translate_apply, ApplyResult};
use crate::expand::expand_columns;
use crate::expression::Translator;
use crate::navigation::{addressed_entity, validation_query};
use crate::request::{EdmType, Intent, KeyPredicate, Request, Segment, SegmentKind, SelectItem};
use crate::search::{has_grouping, search_columns, translate_search};
use crate::TranslateError;

const READ_KINDS: &[SegmentKind] = &[
    SegmentKind::Entity,
    SegmentKind::EntityCollection,
    SegmentKind::NavigationToOne,
    SegmentKind::NavigationToMany,
    SegmentKind::PrimitiveProperty,
    SegmentKind::Singleton,
    SegmentKind::Count,
    SegmentKind::Value,
];

const INVOKE_KINDS: &[SegmentKind] = &[
    SegmentKind::BoundAction,
    SegmentKind::BoundFunction,
    SegmentKind::Entity,
    SegmentKind::EntityCollection,
    SegmentKind::NavigationToOne,
    SegmentKind::NavigationToMany,
    SegmentKind::PrimitiveProperty,
    SegmentKind::Count,
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssembleOptions {
    /// Upper bound for the rows of one collection read
    pub max_page_size: Option<i64>,
}

/// Existence check that has to find a row before a navigation result is trusted
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationQuery {
    pub select: Select,
    /// An empty result is a valid empty collection, not a missing entity
    pub nav_to_many: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assembled {
    pub query: Query,
    pub validation: Option<ValidationQuery>,
}

/// Translate `request` with default options
pub fn assemble(request: &Request, model: &Model) -> Result<Assembled, TranslateError> {
    Assembler::new(model).assemble(request)
}

#[derive(Debug, Clone)]
pub struct Assembler<'m> {
    model: &'m Model,
    options: AssembleOptions,
    now: Option<DateTime<Utc>>,
}

impl<'m> Assembler<'m> {
    pub fn new(model: &'m Model) -> Self {
        Self { model, options: AssembleOptions::default(), now: None }
    }

    pub fn with_options(mut self, options: AssembleOptions) -> Self {
        self.options = options;
        self
    }

    /// Pin the clock `now()` reads
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn assemble(&self, request: &Request) -> Result<Assembled, TranslateError> {
        if request.segments.is_empty() {
            return Err(TranslateError::unsupported("Request without path segments"));
        }
        let result = match request.intent {
            Intent::Read => self.read(request),
            Intent::Create => self.create(request).map(without_validation),
            Intent::Update => self.update(request).map(without_validation),
            Intent::Delete => self.delete(request).map(without_validation),
            Intent::Invoke => self.invoke(request).map(without_validation),
        };
        match &result {
            Ok(assembled) => debug!(
                intent = ?request.intent,
                kind = assembled.query.kind(),
                fingerprint = %assembled.query.fingerprint(),
                "Assembled request"
            ),
            Err(TranslateError::FeatureNotSupported { construct }) => {
                warn!(intent = ?request.intent, %construct, "Unsupported request")
            }
            Err(e) => debug!(intent = ?request.intent, error = %e, "Request assembly failed"),
        }
        result
    }

    fn translator<'a>(&self, entity: &'a Entity) -> Translator<'a>
    where
        'm: 'a,
    {
        let translator = Translator::new(self.model, entity);
        match self.now {
            Some(now) => translator.at(now),
            None => translator,
        }
    }

    fn target(&self, segments: &[Segment]) -> Result<&'m Entity, TranslateError> {
        addressed_entity(segments, self.model)
    }

    fn read(&self, request: &Request) -> Result<Assembled, TranslateError> {
        let segments = &request.segments;
        check_kinds(segments, READ_KINDS, "READ")?;
        let entity = self.target(segments)?;
        let translator = self.translator(entity);
        let options = &request.options;
        let kind = last_kind(segments);

        let apply: Option<ApplyResult> = if options.apply.is_empty() {
            None
        } else {
            Some(translate_apply(&options.apply, &translator)?)
        };
        let streaming = is_streaming(segments, entity);

        let mut columns = selected(entity, &options.select, streaming);
        if let Some(apply) = &apply {
            for aggregation in &apply.aggregations {
                columns.push(aggregation.to_expr()?);
            }
            for path in &apply.group_by {
                push_unique(&mut columns, Expr::reference(path.iter().cloned()));
            }
        }
        if let Some(property) = property(segments) {
            push_unique(&mut columns, Expr::column(&property.name));
            if !streaming {
                for key in entity.key_columns() {
                    push_unique(&mut columns, Expr::column(key));
                }
            }
        }

        if kind == SegmentKind::Count {
            columns = vec![Expr::func("count", vec![Expr::val(1)]).with_alias("$count")];
        } else {
            if columns.is_empty() {
                columns = entity.column_names().into_iter().map(Expr::column).collect();
            }
            columns.extend(expand_columns(&translator, &options.expand)?);
        }
        if apply.is_some() {
            columns = nest_navigation_columns(columns, entity);
        }

        let path = convert_url_path(segments);
        let mut builder = SelectBuilder::from(&path)?.with_model(self.model).columns(columns.clone())?;
        if entity.is_singleton() {
            builder = builder.one()?;
        }

        if let Some(apply) = &apply {
            if !apply.group_by.is_empty() {
                builder = builder.group_by(apply.group_by_text())?;
            }
            if let Some(filter) = &apply.filter {
                builder = builder.where_(filter.clone())?;
            }
        }

        let many = matches!(kind, SegmentKind::EntityCollection | SegmentKind::NavigationToMany);
        if many || kind == SegmentKind::Count {
            if let Some(filter) = &options.filter {
                builder = match &apply {
                    Some(_) => builder.having(translator.clone().with_aggregates(&columns).translate(filter)?)?,
                    None => builder.where_(translator.translate(filter)?)?,
                };
            }
            if let Some(search) = &options.search {
                if options.search_text.as_deref().map(has_grouping).unwrap_or(false) {
                    return Err(TranslateError::unsupported("Parenthesis operator in query option $search"));
                }
                builder = match &apply {
                    Some(_) => {
                        let searched = search_columns(entity, Some(&columns));
                        builder.having(translate_search(search, &searched, &columns)?)?
                    }
                    None => builder.where_(translate_search(search, &search_columns(entity, None), &[])?)?,
                };
            }
        }

        if many {
            for item in &options.orderby {
                builder = builder.order_by_expr(translator.order_item(item)?)?;
            }
            let mut rows = match (options.top, options.skip) {
                (None, None) => None,
                (top, _) => Some(top.unwrap_or(MAX_ROWS)),
            };
            if let Some(max) = self.options.max_page_size {
                rows = Some(rows.map_or(max, |r| r.min(max)));
            }
            if let Some(rows) = rows {
                builder = builder.limit(rows, options.skip.unwrap_or(0))?;
            }
        }

        let mut select = builder.into_select();
        if apply.is_some() {
            let names: Vec<&str> = columns.iter().filter_map(Expr::output_name).collect();
            select.order_by.retain(|item| match item {
                Expr::Ref(r) => r.last().map(|n| names.contains(&n)).unwrap_or(false),
                Expr::Func(f) => f.alias.as_deref().map(|n| names.contains(&n)).unwrap_or(false),
                _ => false,
            });
        }

        let validation = if segments.len() > 1 && segments[1].kind.is_navigation() && kind.is_navigation() {
            let last = &segments[segments.len() - 1];
            Some(ValidationQuery {
                select: validation_query(&segments[..segments.len() - 1], self.model)?,
                nav_to_many: !(kind == SegmentKind::NavigationToOne && last.keys.is_empty()),
            })
        } else {
            None
        };

        Ok(Assembled { query: Query::Select(select), validation })
    }

    fn create(&self, request: &Request) -> Result<Query, TranslateError> {
        let segments = &request.segments;
        let last = terminal(segments);
        let entries = payload(request)?;
        let into = match last.kind {
            SegmentKind::EntityCollection => self.target(segments)?.name.clone(),
            SegmentKind::NavigationToMany if last.keys.is_empty() => convert_url_path(segments),
            kind => return Err(write_rejected("CREATE", kind)),
        };
        Ok(InsertBuilder::into(&into)?.entries(entries)?.build())
    }

    fn update(&self, request: &Request) -> Result<Query, TranslateError> {
        let segments = &request.segments;
        let entity = self.target(segments)?;
        let last = terminal(segments);
        if !(addresses_one(last) || is_streaming(segments, entity)) {
            return Err(write_rejected("UPDATE", last.kind));
        }
        let mut entries = payload(request)?;
        if entries.len() != 1 {
            return Err(TranslateError::invalid("UPDATE expects exactly one entry"));
        }
        let data = entries.remove(0);
        Ok(UpdateBuilder::entity(&convert_url_path(segments))?
            .with_model(self.model)
            .data(data)?
            .build())
    }

    fn delete(&self, request: &Request) -> Result<Query, TranslateError> {
        let segments = &request.segments;
        let last = terminal(segments);
        if addresses_one(last) {
            return Ok(DeleteBuilder::from(&convert_url_path(segments))?
                .with_model(self.model)
                .build());
        }
        if last.kind == SegmentKind::PrimitiveProperty {
            // Deleting a property value nulls the column
            return Ok(UpdateBuilder::entity(&convert_url_path(segments))?
                .with_model(self.model)
                .data([(last.name.clone(), Value::Null)])?
                .build());
        }
        Err(write_rejected("DELETE", last.kind))
    }

    fn invoke(&self, request: &Request) -> Result<Query, TranslateError> {
        let segments = &request.segments;
        check_kinds(segments, INVOKE_KINDS, "ACTION")?;
        let last = terminal(segments);
        if !matches!(last.kind, SegmentKind::BoundAction | SegmentKind::BoundFunction) {
            return Err(write_rejected("ACTION", last.kind));
        }
        let bound = &segments[..segments.len() - 1];
        if bound.is_empty() {
            return Err(TranslateError::unsupported("Unbound action or function"));
        }
        Ok(SelectBuilder::from(&convert_url_path(bound))?.with_model(self.model).build())
    }
}

fn without_validation(query: Query) -> Assembled {
    Assembled { query, validation: None }
}

fn terminal(segments: &[Segment]) -> &Segment {
    &segments[segments.len() - 1]
}

fn last_kind(segments: &[Segment]) -> SegmentKind {
    terminal(segments).kind
}

fn check_kinds(segments: &[Segment], allowed: &[SegmentKind], intent: &str) -> Result<(), TranslateError> {
    match segments.iter().find(|s| !allowed.contains(&s.kind)) {
        Some(segment) => {
            warn!(kind = %segment.kind, intent, "Rejected path segment");
            Err(TranslateError::unsupported(format!(
                "Request parameter \"{}\" with {} requests",
                segment.kind, intent
            )))
        }
        None => Ok(()),
    }
}

fn write_rejected(intent: &str, kind: SegmentKind) -> TranslateError {
    TranslateError::unsupported(format!("{} of kind \"{}\"", intent, kind))
}

/// Entity, singleton or keyed navigation
fn addresses_one(segment: &Segment) -> bool {
    match segment.kind {
        SegmentKind::Entity | SegmentKind::Singleton | SegmentKind::NavigationToOne => true,
        SegmentKind::NavigationToMany => !segment.keys.is_empty(),
        _ => false,
    }
}

fn payload(request: &Request) -> Result<Vec<cqn_ir::Entry>, TranslateError> {
    request
        .data
        .as_ref()
        .map(|p| p.entries())
        .ok_or_else(|| TranslateError::invalid(format!("{:?} request without payload", request.intent)))
}

/// The addressed primitive property, also when followed by `$value`
fn property(segments: &[Segment]) -> Option<&Segment> {
    let mut rev = segments.iter().rev();
    let last = rev.next()?;
    let candidate = if last.kind == SegmentKind::Value { rev.next()? } else { last };
    (candidate.kind == SegmentKind::PrimitiveProperty).then_some(candidate)
}

fn is_streaming(segments: &[Segment], entity: &Entity) -> bool {
    property(segments)
        .map(|p| {
            p.property_type == Some(EdmType::Stream)
                || entity.element(&p.name).map(|e| e.is_stream()).unwrap_or(false)
        })
        .unwrap_or(false)
}

/// `$select` columns plus keys; associations are left to `$expand`
fn selected(entity: &Entity, select: &[SelectItem], streaming: bool) -> Vec<Expr> {
    if select.is_empty() {
        return Vec::new();
    }
    if select.iter().any(|s| s.all) {
        return entity.column_names().into_iter().map(Expr::column).collect();
    }
    let mut columns = Vec::new();
    for name in select.iter().filter_map(|s| s.path.first()) {
        if !entity.is_association(name) {
            push_unique(&mut columns, Expr::column(name));
        }
    }
    if !streaming {
        for key in entity.key_columns() {
            push_unique(&mut columns, Expr::column(key));
        }
    }
    columns
}

fn push_unique(columns: &mut Vec<Expr>, column: Expr) {
    let name = column.output_name().map(str::to_string);
    let present = columns.iter().any(|c| match (&name, c.output_name()) {
        (Some(n), Some(other)) => n == other && !c.as_reference().map(|r| r.is_expand()).unwrap_or(false),
        _ => c == &column,
    });
    if !present {
        columns.push(column);
    }
}

/// Multi-step references whose first step is an association become nested expand columns
fn nest_navigation_columns(columns: Vec<Expr>, entity: &Entity) -> Vec<Expr> {
    let mut nested = Vec::with_capacity(columns.len());
    for column in columns {
        match &column {
            Expr::Ref(r) if r.path.len() > 1 && !r.is_expand() && r.first().map(|f| entity.is_association(f)).unwrap_or(false) => {
                let path: Vec<String> = r.path.iter().map(|s| s.name().to_string()).collect();
                merge_expand(&path, &mut nested);
            }
            _ => nested.push(column),
        }
    }
    nested
}

fn merge_expand(path: &[String], columns: &mut Vec<Expr>) {
    match path {
        [] => {}
        [leaf] => push_unique(columns, Expr::column(leaf)),
        [head, rest @ ..] => {
            let position = columns
                .iter()
                .position(|c| matches!(c, Expr::Ref(r) if r.is_expand() && r.first() == Some(head.as_str())));
            let index = match position {
                Some(index) => index,
                None => {
                    columns.push(expand(head, Vec::new()));
                    columns.len() - 1
                }
            };
            if let Expr::Ref(r) = &mut columns[index] {
                if let Some(inner) = r.expand.as_mut() {
                    merge_expand(rest, inner);
                }
            }
        }
    }
}

/// Builder path text of `segments`: `CatalogService.Authors[ID=1]:books[ID=2]`.
///
/// `$count`, primitive properties and `$value` do not address entities and are
/// dropped.
pub fn convert_url_path(segments: &[Segment]) -> String {
    let mut path = String::new();
    let mut hop = 0;
    for segment in segments {
        match segment.kind {
            SegmentKind::Entity | SegmentKind::EntityCollection | SegmentKind::Singleton => {
                path.push_str(segment.entity_type.as_deref().unwrap_or(&segment.name));
            }
            SegmentKind::NavigationToOne | SegmentKind::NavigationToMany => {
                path.push(if hop == 1 { ':' } else { '.' });
                path.push_str(&segment.name);
            }
            _ => continue,
        }
        path.push_str(&key_filter(&segment.keys));
        hop += 1;
    }
    path
}

fn key_filter(keys: &[KeyPredicate]) -> String {
    if keys.is_empty() {
        return String::new();
    }
    let conditions: Vec<String> = keys
        .iter()
        .map(|k| {
            if k.type_.is_unquoted() {
                format!("{}={}", k.name, k.text)
            } else {
                format!("{}='{}'", k.name, k.text.replace('\'', "''"))
            }
        })
        .collect();
    format!("[{}]", conditions.join(" and "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SegmentKind as K;

    #[test]
    fn test_convert_url_path() {
        let segments = vec![
            Segment::new(K::Entity, "Authors")
                .entity_type("CatalogService.Authors")
                .key("ID", "1", EdmType::Int32),
            Segment::new(K::NavigationToMany, "books").key("ID", "2", EdmType::Int32),
            Segment::new(K::NavigationToOne, "author"),
            Segment::new(K::PrimitiveProperty, "name"),
        ];
        assert_eq!(convert_url_path(&segments), "CatalogService.Authors[ID=1]:books[ID=2].author");
    }

    #[test]
    fn test_string_keys_are_quoted() {
        let segments = vec![Segment::new(K::Entity, "CatalogService.Reviews")
            .key("ID", "it's", EdmType::Guid)
            .key("pos", "2", EdmType::Int64)];
        assert_eq!(convert_url_path(&segments), "CatalogService.Reviews[ID='it''s' and pos=2]");
    }

    #[test]
    fn test_count_segment_is_dropped() {
        let segments = vec![
            Segment::new(K::EntityCollection, "CatalogService.Books"),
            Segment::new(K::Count, "$count"),
        ];
        assert_eq!(convert_url_path(&segments), "CatalogService.Books");
    }

    #[test]
    fn test_property_lookup() {
        let segments = vec![
            Segment::new(K::Entity, "CatalogService.Books").key("ID", "1", EdmType::Int32),
            Segment::new(K::PrimitiveProperty, "image").property_type(EdmType::Stream),
            Segment::new(K::Value, "$value"),
        ];
        assert_eq!(property(&segments).map(|p| p.name.as_str()), Some("image"));
        assert_eq!(property(&segments[..1]).map(|p| p.name.as_str()), None);
    }

    #[test]
    fn test_merge_expand_shares_navigation() {
        let mut columns = Vec::new();
        merge_expand(&["author".into(), "name".into()], &mut columns);
        merge_expand(&["author".into(), "ID".into()], &mut columns);
        assert_eq!(columns, vec![expand("author", vec![Expr::column("name"), Expr::column("ID")])]);
    }
}
