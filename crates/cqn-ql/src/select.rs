use cqn_ir::{
    Expr, ForUpdate, Join, JoinKind, Limit, Query, Ref, Select, SetBody, SetOp, SetQuery, Sort, Source, SubSelect,
};
use cqn_model::{Entity, Model};
use tracing::trace;

use crate::arg::Context;
use crate::condition::{self, Predicate};
use crate::parser;
use crate::{Args, BuildError};

/// A projected column as given to [`SelectBuilder::columns`]
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// `title`, `count(1) as total`, `author.{name}`
    Text(String),
    /// Expression text with a separate alias
    Aliased(String, String),
    Expr(Expr),
}

impl From<&str> for Column {
    fn from(text: &str) -> Self {
        Column::Text(text.to_string())
    }
}

impl From<String> for Column {
    fn from(text: String) -> Self {
        Column::Text(text)
    }
}

impl From<&String> for Column {
    fn from(text: &String) -> Self {
        Column::Text(text.clone())
    }
}

impl From<(&str, &str)> for Column {
    fn from((text, alias): (&str, &str)) -> Self {
        Column::Aliased(text.to_string(), alias.to_string())
    }
}

impl From<Expr> for Column {
    fn from(expr: Expr) -> Self {
        Column::Expr(expr)
    }
}

impl From<(Expr, &str)> for Column {
    fn from((expr, alias): (Expr, &str)) -> Self {
        Column::Expr(expr.with_alias(alias))
    }
}

/// An expand column `{ref: [nav], expand: [...]}`
pub fn expand(navigation: &str, columns: Vec<Expr>) -> Expr {
    let mut r = Ref::new([navigation]);
    r.expand = Some(columns);
    Expr::Ref(r)
}

/// Which clause a bare `and`/`or` continues
enum Target {
    Having,
    Where,
    On,
}

/// Chainable builder for `SELECT` trees
#[derive(Debug, Clone)]
pub struct SelectBuilder<'m> {
    select: Select,
    model: Option<&'m Model>,
    entity: Option<&'m Entity>,
    calls: Vec<String>,
}

impl<'m> SelectBuilder<'m> {
    fn new(from: Source) -> Self {
        Self {
            select: Select::new(from),
            model: None,
            entity: None,
            calls: vec!["from".to_string()],
        }
    }

    /// `Books`, `Books as B` or a path such as `Authors[ID=1]:books`
    pub fn from(source: &str) -> Result<Self, BuildError> {
        let target = parser::parse_path(source).map_err(|e| BuildError::from(e).in_chain(&["from".to_string()]))?;
        Ok(Self::new(Source::Ref(target)))
    }

    pub fn from_source(source: Source) -> Self {
        Self::new(source)
    }

    /// All plain columns of `entity`, in declaration order
    pub fn from_entity(entity: &'m Entity) -> Self {
        let mut builder = Self::new(Source::entity(entity.name.clone()));
        builder.select.columns = entity.column_names().into_iter().map(Expr::column).collect();
        builder.entity = Some(entity);
        builder
    }

    /// Continue building on an existing select
    pub fn from_select(select: Select) -> Self {
        Self {
            select,
            model: None,
            entity: None,
            calls: vec!["from".to_string()],
        }
    }

    /// `SELECT * FROM (<query>) AS alias`
    pub fn from_query(query: Select, alias: &str) -> Self {
        Self::new(Source::Select(SubSelect {
            alias: Some(alias.to_string()),
            ..SubSelect::new(query)
        }))
    }

    pub fn union(queries: Vec<Select>, alias: &str) -> Result<Self, BuildError> {
        Self::set(queries, false, alias)
    }

    pub fn union_all(queries: Vec<Select>, alias: &str) -> Result<Self, BuildError> {
        Self::set(queries, true, alias)
    }

    fn set(queries: Vec<Select>, all: bool, alias: &str) -> Result<Self, BuildError> {
        if queries.len() < 2 {
            return Err(BuildError::invalid("union needs at least two queries").in_chain(&["union".to_string()]));
        }
        let args = queries.into_iter().map(SubSelect::new).collect();
        let mut builder = Self::new(Source::Set(SetQuery {
            set: SetBody { op: SetOp::Union, all, args },
            alias: Some(alias.to_string()),
        }));
        builder.calls = vec!["union".to_string()];
        Ok(builder)
    }

    /// Resolve dotted references against `model`
    pub fn with_model(mut self, model: &'m Model) -> Self {
        self.model = Some(model);
        self
    }

    pub fn columns<I, C>(self, columns: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = C>,
        C: Into<Column>,
    {
        self.step("columns", |b| {
            let ctx = b.context();
            for column in columns {
                let expr = match column.into() {
                    Column::Text(text) => parser::parse_column(&text)?,
                    Column::Aliased(text, alias) => parser::parse_column(&text)?.with_alias(alias),
                    Column::Expr(expr) => expr,
                };
                b.select.columns.push(resolve(expr, &ctx));
            }
            Ok(())
        })
    }

    pub fn distinct(self) -> Result<Self, BuildError> {
        self.step("distinct", |b| {
            if b.select.distinct {
                return Err(BuildError::unexpected("distinct", "distinct"));
            }
            b.select.distinct = true;
            Ok(())
        })
    }

    pub fn one(self) -> Result<Self, BuildError> {
        self.step("one", |b| {
            b.select.one = true;
            Ok(())
        })
    }

    pub fn where_(self, args: impl Into<Args>) -> Result<Self, BuildError> {
        let args = args.into();
        self.step("where", |b| {
            b.reject_after("where", "having")?;
            let predicate = b.predicate(args)?;
            condition::append(&mut b.select.where_, "and", predicate, false);
            Ok(())
        })
    }

    /// Continues `having`, `where` or the join condition, whichever came last
    pub fn and(self, args: impl Into<Args>) -> Result<Self, BuildError> {
        let args = args.into();
        self.step("and", |b| {
            let predicate = b.predicate(args)?;
            match b.continued() {
                Target::Having => condition::append(&mut b.select.having, "and", predicate, false),
                Target::Where => condition::append(&mut b.select.where_, "and", predicate, false),
                Target::On => condition::append(b.join_on()?, "and", predicate, true),
            }
            Ok(())
        })
    }

    pub fn or(self, args: impl Into<Args>) -> Result<Self, BuildError> {
        let args = args.into();
        self.step("or", |b| {
            let predicate = b.predicate(args)?;
            match b.continued() {
                Target::Having => condition::append(&mut b.select.having, "or", predicate, false),
                Target::Where => condition::append(&mut b.select.where_, "or", predicate, false),
                Target::On => condition::append(b.join_on()?, "or", predicate, false),
            }
            Ok(())
        })
    }

    pub fn having(self, args: impl Into<Args>) -> Result<Self, BuildError> {
        let args = args.into();
        self.step("having", |b| {
            let predicate = b.predicate(args)?;
            condition::append(&mut b.select.having, "and", predicate, false);
            Ok(())
        })
    }

    pub fn group_by<I, S>(self, columns: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.step("groupBy", |b| {
            let ctx = b.context();
            for column in columns {
                let expr = parser::parse_operand(column.as_ref())?;
                b.select.group_by.push(resolve(expr, &ctx));
            }
            Ok(())
        })
    }

    /// Items such as `title`, `title desc` or `lower(title) asc`
    pub fn order_by<I, S>(self, items: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.step("orderBy", |b| {
            let ctx = b.context();
            for item in items {
                let (expr, sort) = parser::parse_order_item(item.as_ref())?;
                let expr = resolve(expr, &ctx);
                b.select.order_by.push(match sort {
                    Some(sort) => expr.with_sort(sort),
                    None => expr,
                });
            }
            Ok(())
        })
    }

    /// `order_by_with("title", "desc")`
    pub fn order_by_with(self, column: &str, direction: &str) -> Result<Self, BuildError> {
        self.step("orderBy", |b| {
            let sort = match direction.to_lowercase().as_str() {
                "asc" => Sort::Asc,
                "desc" => Sort::Desc,
                other => return Err(BuildError::invalid(format!("unknown sort order {}", other))),
            };
            let expr = resolve(parser::parse_operand(column)?, &b.context());
            b.select.order_by.push(expr.with_sort(sort));
            Ok(())
        })
    }

    pub fn order_by_expr(self, expr: Expr) -> Result<Self, BuildError> {
        self.step("orderBy", |b| {
            b.select.order_by.push(expr);
            Ok(())
        })
    }

    pub fn join(self, target: &str) -> Result<Self, BuildError> {
        self.join_kind(JoinKind::Inner, target)
    }

    pub fn left_join(self, target: &str) -> Result<Self, BuildError> {
        self.join_kind(JoinKind::Left, target)
    }

    pub fn right_join(self, target: &str) -> Result<Self, BuildError> {
        self.join_kind(JoinKind::Right, target)
    }

    pub fn full_join(self, target: &str) -> Result<Self, BuildError> {
        self.join_kind(JoinKind::Full, target)
    }

    fn join_kind(self, kind: JoinKind, target: &str) -> Result<Self, BuildError> {
        self.step("join", |b| {
            b.reject_after("join", "where")?;
            b.reject_after("join", "having")?;
            let target = parser::parse_path(target)?;
            let left = std::mem::replace(&mut b.select.from, Source::entity(""));
            b.select.from = Source::Join(Join {
                join: kind,
                args: vec![left, Source::Ref(target)],
                on: Vec::new(),
            });
            Ok(())
        })
    }

    pub fn on(self, args: impl Into<Args>) -> Result<Self, BuildError> {
        let args = args.into();
        self.step("on", |b| {
            let predicate = b.predicate(args)?;
            condition::append(b.join_on()?, "and", predicate, false);
            Ok(())
        })
    }

    /// `offset` is only recorded when positive
    pub fn limit(self, rows: i64, offset: i64) -> Result<Self, BuildError> {
        self.step("limit", |b| {
            if b.select.limit.is_some() {
                return Err(BuildError::unexpected("limit", "limit"));
            }
            if rows < 0 {
                return Err(BuildError::invalid(format!("negative row count {}", rows)));
            }
            b.select.limit = Some(Limit {
                rows: Expr::val(rows),
                offset: (offset > 0).then(|| Expr::val(offset)),
            });
            Ok(())
        })
    }

    pub fn for_update<I, S>(self, of: I, wait: Option<u64>) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.step("forUpdate", |b| {
            let ctx = b.context();
            let of = of
                .into_iter()
                .map(|c| parser::parse_operand(c.as_ref()).map(|e| resolve(e, &ctx)))
                .collect::<Result<Vec<_>, _>>()?;
            b.select.for_update = Some(ForUpdate { of, wait });
            Ok(())
        })
    }

    pub fn into_select(self) -> Select {
        self.select
    }

    pub fn build(self) -> Query {
        trace!(calls = %self.calls.join("."), "select built");
        Query::Select(self.select)
    }

    /// Methods called so far
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    fn step<F>(mut self, method: &str, f: F) -> Result<Self, BuildError>
    where
        F: FnOnce(&mut Self) -> Result<(), BuildError>,
    {
        self.calls.push(method.to_string());
        match f(&mut self) {
            Ok(()) => Ok(self),
            Err(e) => Err(e.in_chain(&self.calls)),
        }
    }

    fn reject_after(&self, method: &str, earlier: &str) -> Result<(), BuildError> {
        let previous = &self.calls[..self.calls.len().saturating_sub(1)];
        if previous.iter().any(|c| c == earlier) {
            return Err(BuildError::unexpected(method, earlier));
        }
        Ok(())
    }

    fn context(&self) -> Context<'m> {
        let mut ctx = Context::new(&self.select.from, self.model);
        if self.entity.is_some() {
            ctx.entity = self.entity;
        }
        ctx
    }

    fn predicate(&self, args: Args) -> Result<Predicate, BuildError> {
        condition::predicate(args, &self.context())
    }

    fn continued(&self) -> Target {
        if !self.select.having.is_empty() {
            Target::Having
        } else if !self.select.where_.is_empty() {
            Target::Where
        } else if matches!(self.select.from, Source::Join(_)) {
            Target::On
        } else {
            Target::Where
        }
    }

    fn join_on(&mut self) -> Result<&mut Vec<Expr>, BuildError> {
        match &mut self.select.from {
            Source::Join(join) => Ok(&mut join.on),
            _ => Err(BuildError::unexpected("on", "from")),
        }
    }
}

fn resolve(expr: Expr, ctx: &Context) -> Expr {
    match expr {
        Expr::Ref(r) if !r.is_expand() => Expr::Ref(ctx.resolve(r)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{args, obj};
    use cqn_ir::Segment;

    #[test]
    fn test_simple_where() {
        let select = SelectBuilder::from("Books").unwrap().where_(args!["stock", ">", 0]).unwrap().into_select();
        assert_eq!(select.where_, vec![Expr::column("stock"), Expr::token(">"), Expr::val(0)]);
        assert_eq!(select.from, Source::entity("Books"));
    }

    #[test]
    fn test_from_with_alias_and_key_filter() {
        let select = SelectBuilder::from("Books[ID=1] as B").unwrap().into_select();
        let Source::Ref(r) = select.from else { panic!("expected ref") };
        assert_eq!(r.alias.as_deref(), Some("B"));
        assert!(matches!(&r.path[0], Segment::Filtered { id, .. } if id == "Books"));
    }

    #[test]
    fn test_columns_forms() {
        let select = SelectBuilder::from("Books")
            .unwrap()
            .columns(["ID", "count(1) as total"])
            .unwrap()
            .columns([("price * 2", "doubled")])
            .unwrap()
            .columns([expand("author", vec![Expr::column("name")])])
            .unwrap()
            .into_select();
        assert_eq!(select.columns.len(), 4);
        assert_eq!(select.columns[1].alias(), Some("total"));
        assert_eq!(select.columns[2].alias(), Some("doubled"));
        assert!(select.columns[3].as_reference().map(Ref::is_expand).unwrap_or(false));
    }

    #[test]
    fn test_order_by_direction() {
        let select = SelectBuilder::from("Books")
            .unwrap()
            .order_by(["title desc", "ID"])
            .unwrap()
            .order_by_with("price", "ASC")
            .unwrap()
            .into_select();
        assert_eq!(select.order_by[0], Expr::column("title").with_sort(Sort::Desc));
        assert_eq!(select.order_by[1], Expr::column("ID"));
        assert_eq!(select.order_by[2], Expr::column("price").with_sort(Sort::Asc));

        let err = SelectBuilder::from("Books").unwrap().order_by_with("title", "sideways").unwrap_err();
        assert!(matches!(err, BuildError::InvalidArgument { .. }));
    }

    #[test]
    fn test_and_after_join_goes_to_on() {
        let select = SelectBuilder::from("Books as B")
            .unwrap()
            .join("Authors as A")
            .unwrap()
            .on(args!["A.ID", "=", "B.author_ID"])
            .unwrap()
            .and(args!["A.name", "=", "Poe"])
            .unwrap()
            .into_select();
        let Source::Join(join) = select.from else { panic!("expected join") };
        assert_eq!(join.on[0], Expr::reference(["A", "ID"]));
        assert_eq!(join.on[2], Expr::reference(["B", "author_ID"]));
        assert_eq!(join.on[3], Expr::token("and"));
        assert_eq!(join.on[4], Expr::token("("));
        assert_eq!(join.on.last(), Some(&Expr::token(")")));
        assert!(select.where_.is_empty());
    }

    #[test]
    fn test_or_without_clause_acts_as_where() {
        let select = SelectBuilder::from("Books").unwrap().or(obj! {"ID" => 1}).unwrap().into_select();
        assert_eq!(select.where_.len(), 3);
    }

    #[test]
    fn test_call_order_violations() {
        let err = SelectBuilder::from("Books")
            .unwrap()
            .having("count(1) > 1")
            .unwrap()
            .where_("ID = 1")
            .unwrap_err();
        match err {
            BuildError::UnexpectedCall { method, conflicting, chain } => {
                assert_eq!(method, "where");
                assert_eq!(conflicting, "having");
                assert_eq!(chain, vec!["from", "having", "where"]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let err = SelectBuilder::from("Books").unwrap().where_("ID = 1").unwrap().join("Authors").unwrap_err();
        assert!(matches!(err, BuildError::UnexpectedCall { ref conflicting, .. } if conflicting == "where"));
    }

    #[test]
    fn test_limit_and_distinct_once() {
        let select = SelectBuilder::from("Books").unwrap().limit(10, 0).unwrap().into_select();
        assert_eq!(select.limit.as_ref().map(|l| l.offset.is_none()), Some(true));

        assert!(SelectBuilder::from("Books").unwrap().limit(1, 0).unwrap().limit(2, 0).is_err());
        assert!(SelectBuilder::from("Books").unwrap().distinct().unwrap().distinct().is_err());
    }

    #[test]
    fn test_union_source() {
        let a = SelectBuilder::from("Books").unwrap().into_select();
        let b = SelectBuilder::from("Magazines").unwrap().into_select();
        let select = SelectBuilder::union_all(vec![a, b], "U").unwrap().into_select();
        assert!(matches!(select.from, Source::Set(ref s) if s.set.all && s.set.args.len() == 2));
        assert!(SelectBuilder::union(vec![], "U").is_err());
    }
}
