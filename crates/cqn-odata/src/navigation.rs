//! Navigation paths as correlated `EXISTS` chains
//!
//! `Authors(1)/books(2)` addresses the book only if it belongs to author 1.
//! Every entity hop `i` becomes a select aliased `T<i>`; each hop is correlated
//! with its predecessor through the association's on-condition inside an
//! `EXISTS` sub-select:
//!
//! ```text
//! SELECT * FROM Books AS T1 WHERE T1.ID = 2 AND EXISTS (
//!   SELECT 1 FROM Authors AS T0 WHERE T0.ID = 1 AND ( T1.author_ID = T0.ID ))
//! ```

use cqn_ir::{Delete, Expr, Insert, Query, Ref, Segment as CqnSegment, Select, Source, SubSelect, Update};
use cqn_model::{join_keys, on_condition, Entity, Model};
use tracing::debug;

use crate::expression::typed_value;
use crate::request::{KeyPredicate, Segment};
use crate::TranslateError;

/// Segments addressing entities, properties and `$count` dropped
pub(crate) fn hops(segments: &[Segment]) -> Vec<&Segment> {
    segments.iter().filter(|s| s.addresses_entity()).collect()
}

/// Entities of the given hops: the root by qualified name, then association targets
pub(crate) fn resolve<'m>(hops: &[&Segment], model: &'m Model) -> Result<Vec<&'m Entity>, TranslateError> {
    let mut entities: Vec<&'m Entity> = Vec::with_capacity(hops.len());
    for hop in hops {
        let entity = match entities.last() {
            None => model.entity(hop.entity_type.as_deref().unwrap_or(&hop.name))?,
            Some(previous) => model.target(previous, &hop.name)?,
        };
        entities.push(entity);
    }
    Ok(entities)
}

/// Entity addressed by the last entity hop of `segments`
pub fn addressed_entity<'m>(segments: &[Segment], model: &'m Model) -> Result<&'m Entity, TranslateError> {
    resolve(&hops(segments), model)?
        .pop()
        .ok_or_else(|| TranslateError::unsupported("Request without entity segments"))
}

pub(crate) fn key_value(key: &KeyPredicate) -> Result<cqn_ir::Value, TranslateError> {
    typed_value(key.type_, &key.text)
}

/// Existence check for the entity addressed by `segments`: the last hop selects
/// `*`, earlier hops are nested `SELECT 1` sub-selects.
pub fn validation_query(segments: &[Segment], model: &Model) -> Result<Select, TranslateError> {
    let hops = hops(segments);
    let entities = resolve(&hops, model)?;
    walk(&hops, &entities, model)
}

fn walk(hops: &[&Segment], entities: &[&Entity], model: &Model) -> Result<Select, TranslateError> {
    let mut previous: Option<(Select, &Entity)> = None;
    for (i, (hop, entity)) in hops.iter().zip(entities).enumerate() {
        let alias = format!("T{}", i);
        let mut source = Ref::new([entity.name.clone()]);
        source.alias = Some(alias.clone());

        let mut select = Select::new(Source::Ref(source));
        if i + 1 < hops.len() {
            select.columns = vec![Expr::val(1)];
        }
        for key in &hop.keys {
            conjoin(
                &mut select.where_,
                vec![
                    Expr::reference([alias.clone(), key.name.clone()]),
                    Expr::token("="),
                    Expr::val(key_value(key)?),
                ],
            );
        }

        if let Some((mut outer, outer_entity)) = previous.take() {
            let outer_alias = format!("T{}", i - 1);
            let on = on_condition(model, outer_entity, &hop.name, Some(&alias), Some(&outer_alias))?;
            conjoin(&mut outer.where_, on);
            conjoin(&mut select.where_, vec![Expr::token("exists"), Expr::select(outer)]);
        }
        previous = Some((select, entity));
    }

    previous
        .map(|(select, _)| select)
        .ok_or_else(|| TranslateError::unsupported("Request without entity segments"))
}

/// Rewrites a read over a multi-hop path into the `EXISTS` chain, keeping the
/// projection, grouping, ordering and paging of `select`.
pub fn lower_navigation(select: Select, segments: &[Segment], model: &Model) -> Result<Select, TranslateError> {
    let hops = hops(segments);
    if hops.len() < 2 {
        return Ok(select);
    }
    let entities = resolve(&hops, model)?;
    let mut lowered = walk(&hops, &entities, model)?;
    debug!(hops = hops.len(), "Lowered navigation read");

    conjoin(&mut lowered.where_, select.where_);
    lowered.columns = select.columns;
    lowered.group_by = select.group_by;
    lowered.having = select.having;
    lowered.order_by = select.order_by;
    lowered.distinct = select.distinct;
    lowered.one = select.one;
    lowered.limit = select.limit;
    lowered.for_update = select.for_update;
    Ok(lowered)
}

/// Rewrites references through to-one associations, such as `author.name` on
/// Books, into correlated scalar sub-selects over the association target:
///
/// ```text
/// SELECT (SELECT author.name FROM Authors AS author WHERE ( author.ID = Books.author_ID )) AS author_name FROM Books
/// ```
///
/// Projected paths without an alias are named by their steps joined with `_`.
/// Expand columns and references into nested sub-selects are left alone.
pub fn lower_member_paths(mut select: Select, entity: &Entity, model: &Model) -> Result<Select, TranslateError> {
    let outer = match &select.from {
        Source::Ref(r) => r.alias.clone().or_else(|| r.first().map(str::to_string)),
        _ => None,
    };
    let Some(outer) = outer else {
        return Ok(select);
    };
    let paths = MemberPaths { model, entity, outer: &outer, tables: select.from.table_names() };

    select.columns = select.columns.into_iter().map(|c| paths.column(c)).collect::<Result<_, _>>()?;
    for clause in [&mut select.where_, &mut select.group_by, &mut select.having, &mut select.order_by] {
        let tokens = std::mem::take(clause);
        *clause = tokens.into_iter().map(|t| paths.expr(t)).collect::<Result<_, _>>()?;
    }
    Ok(select)
}

struct MemberPaths<'a> {
    model: &'a Model,
    entity: &'a Entity,
    /// Qualifier of the correlated side
    outer: &'a str,
    tables: Vec<String>,
}

impl MemberPaths<'_> {
    fn column(&self, column: Expr) -> Result<Expr, TranslateError> {
        match column {
            Expr::Ref(r) if self.is_member_path(&r) => {
                let alias = r
                    .alias
                    .clone()
                    .unwrap_or_else(|| r.path.iter().map(CqnSegment::name).collect::<Vec<_>>().join("_"));
                Ok(self.lowered(r)?.with_alias(alias))
            }
            other => self.expr(other),
        }
    }

    fn expr(&self, expr: Expr) -> Result<Expr, TranslateError> {
        let lower_all = |items: Vec<Expr>| items.into_iter().map(|e| self.expr(e)).collect::<Result<Vec<_>, _>>();
        Ok(match expr {
            Expr::Ref(r) if self.is_member_path(&r) => self.lowered(r)?,
            Expr::Func(mut f) => {
                f.args = lower_all(f.args)?;
                Expr::Func(f)
            }
            Expr::Xpr(mut x) => {
                x.xpr = lower_all(x.xpr)?;
                Expr::Xpr(x)
            }
            Expr::List(mut l) => {
                l.list = lower_all(l.list)?;
                Expr::List(l)
            }
            other => other,
        })
    }

    fn is_member_path(&self, r: &Ref) -> bool {
        if r.path.len() < 2 || r.is_expand() || r.path.iter().any(CqnSegment::is_filtered) {
            return false;
        }
        match r.first() {
            Some(first) => !self.tables.iter().any(|t| t == first) && self.is_to_one(first),
            None => false,
        }
    }

    fn is_to_one(&self, name: &str) -> bool {
        self.entity.element(name).map(|e| e.is_to_one()).unwrap_or(false)
    }

    fn lowered(&self, r: Ref) -> Result<Expr, TranslateError> {
        let mut lowered = SubSelect::new(self.scalar(&r.path, None)?);
        lowered.sort = r.sort;
        Ok(Expr::Select(lowered))
    }

    /// `path[0]` is a to-one association of `self.entity`; `prefix` keeps
    /// aliases of nested hops distinct
    fn scalar(&self, path: &[CqnSegment], prefix: Option<&str>) -> Result<Select, TranslateError> {
        let assoc = path[0].name();
        let target = self.model.target(self.entity, assoc)?;
        let alias = match prefix {
            Some(prefix) => format!("{}_{}", prefix, assoc),
            None => assoc.to_string(),
        };

        let mut source = Ref::new([target.name.clone()]);
        source.alias = Some(alias.clone());
        let mut select = Select::new(Source::Ref(source));
        select.where_ = on_condition(self.model, self.entity, assoc, Some(&alias), Some(self.outer))?;

        let column = match &path[1..] {
            [] => return Err(TranslateError::invalid(format!("association \"{}\" without a member", assoc))),
            [leaf] => Expr::reference([alias.clone(), leaf.name().to_string()]),
            rest => {
                let nested = MemberPaths { model: self.model, entity: target, outer: &alias, tables: Vec::new() };
                if !nested.is_to_one(rest[0].name()) {
                    return Err(TranslateError::unsupported(format!(
                        "Path \"{}\" through \"{}\", which is not a to-one association",
                        path.iter().map(CqnSegment::name).collect::<Vec<_>>().join("/"),
                        rest[0].name()
                    )));
                }
                Expr::select(nested.scalar(rest, Some(&alias))?)
            }
        };
        select.columns = vec![column];
        Ok(select)
    }
}

/// Rewrites writes addressed through navigation paths.
///
/// Updates and deletes target the last entity aliased `T<n>` and keep only rows
/// reachable through the path. Inserts into a to-many navigation fill the
/// foreign key columns from the parent's key predicates.
pub fn lower_write(query: Query, segments: &[Segment], model: &Model) -> Result<Query, TranslateError> {
    let hops = hops(segments);
    if hops.len() < 2 {
        return Ok(query);
    }
    let entities = resolve(&hops, model)?;

    match query {
        Query::Insert(insert) => lower_insert(insert, &hops, &entities, model).map(Query::Insert),
        Query::Update(update) => {
            let walked = walk(&hops, &entities, model)?;
            let mut lowered = Update::new(aliased_target(&walked)?);
            lowered.data = update.data;
            lowered.with = update.with;
            lowered.where_ = walked.where_;
            conjoin(&mut lowered.where_, update.where_);
            Ok(Query::Update(lowered))
        }
        Query::Delete(delete) => {
            let walked = walk(&hops, &entities, model)?;
            let mut lowered = Delete::new(aliased_target(&walked)?);
            lowered.where_ = walked.where_;
            conjoin(&mut lowered.where_, delete.where_);
            Ok(Query::Delete(lowered))
        }
        select @ Query::Select(_) => Ok(select),
    }
}

fn aliased_target(walked: &Select) -> Result<Ref, TranslateError> {
    match &walked.from {
        Source::Ref(r) => Ok(r.clone()),
        _ => Err(TranslateError::invalid("navigation target is not an entity")),
    }
}

fn lower_insert(insert: Insert, hops: &[&Segment], entities: &[&Entity], model: &Model) -> Result<Insert, TranslateError> {
    let (parent, navigation) = match hops {
        [.., parent, navigation] => (*parent, *navigation),
        _ => return Ok(insert),
    };
    let (parent_entity, target) = match entities {
        [.., parent, target] => (*parent, *target),
        _ => return Ok(insert),
    };
    if insert.as_select.is_some() || !insert.rows.is_empty() || !insert.values.is_empty() {
        return Err(TranslateError::unsupported(format!(
            "INSERT without entries through navigation \"{}\"",
            navigation.name
        )));
    }

    let keys = join_keys(model, parent_entity, &navigation.name)?;
    if keys.is_empty() || parent.keys.is_empty() {
        return Err(TranslateError::unsupported(format!(
            "INSERT through navigation \"{}\" without parent keys",
            navigation.name
        )));
    }

    let mut filled = Vec::with_capacity(keys.len());
    for key in keys {
        let predicate = parent.keys.iter().find(|p| p.name == key.source).ok_or_else(|| {
            TranslateError::unsupported(format!(
                "INSERT through navigation \"{}\": no key predicate for \"{}\"",
                navigation.name, key.source
            ))
        })?;
        filled.push((key.target, key_value(predicate)?));
    }

    let mut lowered = Insert::new(Ref::new([target.name.clone()]));
    lowered.entries = insert
        .entries
        .into_iter()
        .map(|mut entry| {
            entry.extend(filled.iter().cloned());
            entry
        })
        .collect();
    Ok(lowered)
}

/// `where AND tokens`, bracketing either side when it has a top-level `or`
pub(crate) fn conjoin(where_: &mut Vec<Expr>, tokens: Vec<Expr>) {
    if tokens.is_empty() {
        return;
    }
    if where_.is_empty() {
        *where_ = tokens;
        return;
    }
    if has_top_level_or(where_) {
        let inner = std::mem::take(where_);
        where_.push(Expr::token("("));
        where_.extend(inner);
        where_.push(Expr::token(")"));
    }
    where_.push(Expr::token("and"));
    if has_top_level_or(&tokens) {
        where_.push(Expr::token("("));
        where_.extend(tokens);
        where_.push(Expr::token(")"));
    } else {
        where_.extend(tokens);
    }
}

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{EdmType, SegmentKind};
    use cqn_ir::{Entry, Sort};

    fn bookshop() -> Model {
        Model::from_json_str(include_str!("../../cqn-model/fixtures/bookshop.json")).unwrap()
    }

    fn author_books() -> Vec<Segment> {
        vec![
            Segment::new(SegmentKind::Entity, "Authors")
                .entity_type("CatalogService.Authors")
                .key("ID", "1", EdmType::Int32),
            Segment::new(SegmentKind::NavigationToMany, "books").key("ID", "2", EdmType::Int32),
        ]
    }

    fn t(token: &str) -> Expr {
        Expr::token(token)
    }

    #[test]
    fn test_validation_query_chain() {
        let model = bookshop();
        let select = validation_query(&author_books(), &model).unwrap();

        let Source::Ref(from) = &select.from else { panic!("expected ref") };
        assert_eq!(from.first(), Some("CatalogService.Books"));
        assert_eq!(from.alias.as_deref(), Some("T1"));
        assert!(select.columns.is_empty());
        assert_eq!(&select.where_[..4], &[Expr::reference(["T1", "ID"]), t("="), Expr::val(2), t("and")]);
        assert_eq!(select.where_[4], t("exists"));

        let Expr::Select(inner) = &select.where_[5] else { panic!("expected subselect") };
        assert_eq!(inner.select.columns, vec![Expr::val(1)]);
        assert_eq!(
            inner.select.where_,
            vec![
                Expr::reference(["T0", "ID"]),
                t("="),
                Expr::val(1),
                t("and"),
                t("("),
                Expr::reference(["T0", "ID"]),
                t("="),
                Expr::reference(["T1", "author_ID"]),
                t(")"),
            ]
        );
    }

    #[test]
    fn test_single_hop_is_unchanged() {
        let model = bookshop();
        let segments = vec![Segment::new(SegmentKind::EntityCollection, "CatalogService.Books")];
        let select = Select::new(Source::entity("CatalogService.Books"));
        assert_eq!(lower_navigation(select.clone(), &segments, &model).unwrap(), select);
    }

    #[test]
    fn test_lowered_read_keeps_filter() {
        let model = bookshop();
        let mut select = Select::new(Source::entity("ignored"));
        select.columns = vec![Expr::column("title")];
        select.where_ = vec![Expr::column("stock"), t(">"), Expr::val(0), t("or"), Expr::column("price"), t("<"), Expr::val(5)];
        let lowered = lower_navigation(select, &author_books(), &model).unwrap();
        assert_eq!(lowered.columns, vec![Expr::column("title")]);
        assert_eq!(lowered.where_[6], t("and"));
        assert_eq!(lowered.where_[7], t("("));
        assert_eq!(lowered.where_.last(), Some(&t(")")));
    }

    #[test]
    fn test_insert_through_navigation_fills_foreign_key() {
        let model = bookshop();
        let segments = vec![
            Segment::new(SegmentKind::Entity, "Authors")
                .entity_type("CatalogService.Authors")
                .key("ID", "7", EdmType::Int32),
            Segment::new(SegmentKind::NavigationToMany, "books"),
        ];
        let mut entry = Entry::new();
        entry.insert("title".into(), "Eureka".into());
        let mut insert = Insert::new(Ref::new(["ignored"]));
        insert.entries = vec![entry];

        let Query::Insert(lowered) = lower_write(Query::Insert(insert), &segments, &model).unwrap() else {
            panic!("expected insert")
        };
        assert_eq!(lowered.into.first(), Some("CatalogService.Books"));
        assert_eq!(lowered.entries[0].get("author_ID"), Some(&cqn_ir::Value::Int(7)));
        assert_eq!(lowered.entries[0].get("title"), Some(&cqn_ir::Value::from("Eureka")));
    }

    #[test]
    fn test_delete_through_navigation() {
        let model = bookshop();
        let delete = Delete::new(Ref::new(["ignored"]));
        let Query::Delete(lowered) = lower_write(Query::Delete(delete), &author_books(), &model).unwrap() else {
            panic!("expected delete")
        };
        assert_eq!(lowered.from.alias.as_deref(), Some("T1"));
        assert!(lowered.where_.iter().any(|t| t.is_token("exists")));
    }

    fn scalar(expr: &Expr) -> &Select {
        match expr {
            Expr::Select(sub) => &sub.select,
            other => panic!("expected subselect, got {:?}", other),
        }
    }

    #[test]
    fn test_to_one_member_in_filter_becomes_scalar_subselect() {
        let model = bookshop();
        let books = model.entity("CatalogService.Books").unwrap();
        let mut select = Select::new(Source::entity("CatalogService.Books"));
        select.columns = vec![Expr::column("title")];
        select.where_ = vec![Expr::reference(["author", "name"]), t("="), Expr::val("Poe")];

        let lowered = lower_member_paths(select, books, &model).unwrap();
        assert_eq!(lowered.columns, vec![Expr::column("title")]);
        assert_eq!(&lowered.where_[1..], &[t("="), Expr::val("Poe")]);

        let author = scalar(&lowered.where_[0]);
        let Source::Ref(from) = &author.from else { panic!("expected ref") };
        assert_eq!(from.first(), Some("CatalogService.Authors"));
        assert_eq!(from.alias.as_deref(), Some("author"));
        assert_eq!(author.columns, vec![Expr::reference(["author", "name"])]);
        assert_eq!(
            author.where_,
            vec![
                t("("),
                Expr::reference(["author", "ID"]),
                t("="),
                Expr::reference(["CatalogService.Books", "author_ID"]),
                t(")"),
            ]
        );
    }

    #[test]
    fn test_member_paths_in_columns_and_order_by() {
        let model = bookshop();
        let reviews = model.entity("CatalogService.Reviews").unwrap();
        let mut select = Select::new(Source::entity("CatalogService.Reviews"));
        select.columns = vec![Expr::reference(["book", "author", "name"]), Expr::reference(["book", "title"]).with_alias("t")];
        select.order_by = vec![Expr::reference(["book", "title"]).with_sort(Sort::Desc)];

        let lowered = lower_member_paths(select, reviews, &model).unwrap();
        assert_eq!(lowered.columns[0].alias(), Some("book_author_name"));
        assert_eq!(lowered.columns[1].alias(), Some("t"));
        assert!(matches!(&lowered.order_by[0], Expr::Select(s) if s.sort == Some(Sort::Desc)));

        let book = scalar(&lowered.columns[0]);
        let author = scalar(&book.columns[0]);
        let Source::Ref(from) = &author.from else { panic!("expected ref") };
        assert_eq!(from.alias.as_deref(), Some("book_author"));
        assert_eq!(author.columns, vec![Expr::reference(["book_author", "name"])]);
        assert_eq!(author.where_[3], Expr::reference(["book", "author_ID"]));
    }

    #[test]
    fn test_member_paths_leave_qualified_and_plain_refs() {
        let model = bookshop();
        let books = model.entity("CatalogService.Books").unwrap();
        let mut select = Select::new(Source::Ref(Ref { alias: Some("T1".into()), ..Ref::new(["CatalogService.Books"]) }));
        select.where_ = vec![Expr::reference(["T1", "stock"]), t(">"), Expr::column("price")];
        let lowered = lower_member_paths(select.clone(), books, &model).unwrap();
        assert_eq!(lowered, select);
    }

    #[test]
    fn test_member_path_through_to_many_is_rejected() {
        let model = bookshop();
        let reviews = model.entity("CatalogService.Reviews").unwrap();
        let mut select = Select::new(Source::entity("CatalogService.Reviews"));
        select.where_ = vec![Expr::reference(["book", "reviews", "rating"]), t(">"), Expr::val(3)];
        let err = lower_member_paths(select, reviews, &model).unwrap_err();
        assert!(matches!(err, TranslateError::FeatureNotSupported { .. }));
    }

    #[test]
    fn test_conjoin_brackets_or() {
        let mut where_ = vec![Expr::column("a"), t("or"), Expr::column("b")];
        conjoin(&mut where_, vec![Expr::column("c")]);
        assert_eq!(where_, vec![t("("), Expr::column("a"), t("or"), Expr::column("b"), t(")"), t("and"), Expr::column("c")]);
    }
}
