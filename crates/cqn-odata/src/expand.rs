//! `$expand` items to expand columns

use cqn_ir::{Expr, Limit, Ref, MAX_ROWS};
use cqn_model::Entity;

use crate::expression::Translator;
use crate::request::ExpandItem;
use crate::TranslateError;

/// Expand columns of the translator's entity, in association declaration order.
///
/// `$expand=*` expands every association with default options and wins over
/// explicit items.
pub fn expand_columns(translator: &Translator<'_>, items: &[ExpandItem]) -> Result<Vec<Expr>, TranslateError> {
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let entity = translator.entity();
    let all = items.iter().any(|i| i.all);

    for item in items.iter().filter(|i| !i.all) {
        match item.path.as_slice() {
            [name] => {
                entity.association(name)?;
            }
            path => {
                return Err(TranslateError::unsupported(format!(
                    "Expand path \"{}\" with query option $expand",
                    path.join("/")
                )))
            }
        }
    }

    let mut columns = Vec::new();
    for association in entity.associations().filter(|a| !a.is_ignored()) {
        if all {
            columns.push(expand_one(translator, &association.name, None)?);
            continue;
        }
        let item = items.iter().find(|i| i.path.first() == Some(&association.name));
        if let Some(item) = item {
            columns.push(expand_one(translator, &association.name, Some(item))?);
        }
    }
    Ok(columns)
}

fn expand_one(translator: &Translator<'_>, name: &str, item: Option<&ExpandItem>) -> Result<Expr, TranslateError> {
    if let Some(item) = item {
        if item.options.count {
            return Err(TranslateError::unsupported("Query option $count inside $expand"));
        }
        if item.options.search.is_some() || item.options.search_text.is_some() {
            return Err(TranslateError::unsupported("Query option $search inside $expand"));
        }
    }

    let target = translator.model().target(translator.entity(), name)?;
    let nested = translator.rebase(target);

    let mut reference = Ref::new([name]);
    let mut columns = projected(target, item);
    let Some(item) = item else {
        reference.expand = Some(columns);
        return Ok(Expr::Ref(reference));
    };

    columns.extend(expand_columns(&nested, &item.options.expand)?);
    reference.expand = Some(columns);

    let options = &item.options;
    reference.order_by = options
        .orderby
        .iter()
        .map(|o| nested.order_item(o))
        .collect::<Result<_, _>>()?;
    reference.limit = Some(Box::new(Limit {
        rows: Expr::val(options.top.unwrap_or(MAX_ROWS)),
        offset: options.skip.filter(|s| *s > 0).map(Expr::val),
    }));
    if let Some(filter) = &options.filter {
        reference.where_ = nested.translate(filter)?;
    }
    Ok(Expr::Ref(reference))
}

/// Selected columns of an expanded entity, keys always included
fn projected(target: &Entity, item: Option<&ExpandItem>) -> Vec<Expr> {
    let select = item.map(|i| i.options.select.as_slice()).unwrap_or(&[]);
    if select.is_empty() || select.iter().any(|s| s.all) {
        return target.column_names().into_iter().map(Expr::column).collect();
    }

    let mut names = target.key_columns();
    for name in select.iter().filter_map(|s| s.path.first()) {
        if !names.contains(name) && !target.is_association(name) {
            names.push(name.clone());
        }
    }
    names.into_iter().map(Expr::column).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{BinaryOperator, EdmType, Expression, OrderByItem, QueryOptions, SelectItem};
    use cqn_ir::Sort;
    use cqn_model::{Model, ModelError};

    fn bookshop() -> Model {
        Model::from_json_str(include_str!("../../cqn-model/fixtures/bookshop.json")).unwrap()
    }

    fn expand(entity: &str, items: &[ExpandItem]) -> Result<Vec<Expr>, TranslateError> {
        let model = bookshop();
        let entity = model.entity(entity).unwrap();
        expand_columns(&Translator::new(&model, entity), items)
    }

    #[test]
    fn test_plain_expand_uses_all_columns() {
        let columns = expand("CatalogService.Books", &[ExpandItem::navigation("author")]).unwrap();
        let Expr::Ref(r) = &columns[0] else { panic!("expected ref") };
        assert_eq!(r.first(), Some("author"));
        assert_eq!(
            r.expand.as_deref(),
            Some(&[Expr::column("ID"), Expr::column("name"), Expr::column("dateOfBirth")][..])
        );
        assert_eq!(r.limit.as_ref().map(|l| l.rows.clone()), Some(Expr::val(MAX_ROWS)));
    }

    #[test]
    fn test_star_expands_every_association() {
        let columns = expand("CatalogService.Books", &[ExpandItem::star()]).unwrap();
        let names: Vec<_> = columns.iter().filter_map(|c| c.as_reference()?.first()).collect();
        assert_eq!(names, vec!["author", "reviews"]);
        assert!(columns.iter().all(|c| c.as_reference().map(|r| r.limit.is_none()).unwrap_or(false)));
    }

    #[test]
    fn test_options_inside_expand() {
        let item = ExpandItem {
            path: vec!["books".into()],
            all: false,
            options: QueryOptions {
                select: vec![SelectItem::column("title")],
                filter: Some(Expression::binary(
                    BinaryOperator::Gt,
                    Expression::property("stock"),
                    Expression::literal(EdmType::Int32, "0"),
                )),
                orderby: vec![OrderByItem { expression: Expression::property("title"), descending: true }],
                top: Some(2),
                skip: Some(1),
                ..QueryOptions::default()
            },
        };
        let columns = expand("CatalogService.Authors", &[item]).unwrap();
        let Expr::Ref(r) = &columns[0] else { panic!("expected ref") };
        assert_eq!(r.expand.as_deref(), Some(&[Expr::column("ID"), Expr::column("title")][..]));
        assert_eq!(r.where_, vec![Expr::column("stock"), Expr::token(">"), Expr::val(0)]);
        assert_eq!(r.order_by, vec![Expr::column("title").with_sort(Sort::Desc)]);
        assert_eq!(r.limit.as_deref(), Some(&Limit { rows: Expr::val(2), offset: Some(Expr::val(1)) }));
    }

    #[test]
    fn test_nested_expand() {
        let item = ExpandItem {
            path: vec!["books".into()],
            all: false,
            options: QueryOptions { expand: vec![ExpandItem::navigation("reviews")], ..QueryOptions::default() },
        };
        let columns = expand("CatalogService.Authors", &[item]).unwrap();
        let Expr::Ref(r) = &columns[0] else { panic!("expected ref") };
        let inner = r.expand.as_ref().unwrap();
        assert!(matches!(inner.last(), Some(Expr::Ref(n)) if n.first() == Some("reviews") && n.is_expand()));
    }

    #[test]
    fn test_rejections() {
        let unknown = expand("CatalogService.Books", &[ExpandItem::navigation("title")]).unwrap_err();
        assert!(matches!(unknown, TranslateError::Model(ModelError::NotAnAssociation { .. })));

        let deep = ExpandItem { path: vec!["author".into(), "books".into()], ..ExpandItem::default() };
        assert!(matches!(
            expand("CatalogService.Books", &[deep]),
            Err(TranslateError::FeatureNotSupported { .. })
        ));

        let counted = ExpandItem {
            options: QueryOptions { count: true, ..QueryOptions::default() },
            ..ExpandItem::navigation("author")
        };
        assert!(expand("CatalogService.Books", &[counted]).is_err());
    }
}
