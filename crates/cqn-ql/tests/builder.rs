//! Builder behaviour across call shapes, checked on the produced trees

use cqn_ir::{Expr, Query, Segment, Sort};
use cqn_model::Model;
use cqn_ql::{args, obj, Arg, BuildError, SelectBuilder};
use proptest::prelude::*;
use serde_json::json;
use test_case::test_case;

fn bookshop() -> Model {
    Model::from_json_str(include_str!("../../cqn-model/fixtures/bookshop.json")).unwrap()
}

fn where_of(query: Query) -> Vec<Expr> {
    match query {
        Query::Select(select) => select.where_,
        other => panic!("expected select, got {:?}", other),
    }
}

#[test]
fn test_object_where_and_order_by_tree() {
    let query = SelectBuilder::from("Books")
        .unwrap()
        .where_(obj! {"stock" => obj! {">" => 0}})
        .unwrap()
        .order_by_with("title", "desc")
        .unwrap()
        .build();

    assert_eq!(
        serde_json::to_value(&query).unwrap(),
        json!({
            "SELECT": {
                "from": {"ref": ["Books"]},
                "where": [{"ref": ["stock"]}, ">", {"val": 0}],
                "orderBy": [{"ref": ["title"], "sort": "desc"}]
            }
        })
    );
}

#[test_case(args!["stock", ">", 0] ; "positional")]
#[test_case(args!["stock >", 0] ; "fluid")]
#[test_case(vec![obj! {"stock" => obj! {">" => 0}}] ; "object")]
#[test_case(args!["stock > 0"] ; "text")]
#[test_case(vec![Arg::Tokens(vec![Expr::column("stock"), Expr::token(">"), Expr::val(0)])] ; "tokens")]
fn test_call_shapes_agree(args: Vec<Arg>) {
    let tokens = where_of(SelectBuilder::from("Books").unwrap().where_(args).unwrap().build());
    assert_eq!(tokens, vec![Expr::column("stock"), Expr::token(">"), Expr::val(0)]);
}

#[test_case("=", "=" ; "equals")]
#[test_case("<>", "<>" ; "not equals")]
#[test_case("like", "like" ; "like")]
#[test_case("NOT LIKE", "not like" ; "negated like upper case")]
fn test_positional_operators(op: &str, token: &str) {
    let tokens = where_of(SelectBuilder::from("Books").unwrap().where_(args!["title", op, "x"]).unwrap().build());
    assert_eq!(tokens, vec![Expr::column("title"), Expr::token(token), Expr::val("x")]);
}

#[test]
fn test_nested_or_object() {
    let tokens = where_of(
        SelectBuilder::from("Books")
            .unwrap()
            .where_(obj! {"ID" => 1, "or" => obj! {"title" => "x"}})
            .unwrap()
            .build(),
    );
    assert_eq!(
        tokens,
        vec![
            Expr::column("ID"),
            Expr::token("="),
            Expr::val(1),
            Expr::token("or"),
            Expr::column("title"),
            Expr::token("="),
            Expr::val("x"),
        ]
    );
}

#[test]
fn test_exists_subquery_in_object() {
    let sub = SelectBuilder::from("Authors").unwrap().where_("ID = 1").unwrap().into_select();
    let tokens = where_of(
        SelectBuilder::from("Books")
            .unwrap()
            .where_(obj! {"exists" => sub.clone()})
            .unwrap()
            .build(),
    );
    assert_eq!(tokens, vec![Expr::token("exists"), Expr::select(sub)]);
}

#[test]
fn test_association_paths_with_model() {
    let model = bookshop();
    let tokens = where_of(
        SelectBuilder::from("CatalogService.Books")
            .unwrap()
            .with_model(&model)
            .where_(args!["author.name", "=", "Poe"])
            .unwrap()
            .build(),
    );
    assert_eq!(tokens[0], Expr::reference(["author", "name"]));

    let tokens = where_of(
        SelectBuilder::from("CatalogService.Books")
            .unwrap()
            .with_model(&model)
            .where_(args!["currency.code", "=", "EUR"])
            .unwrap()
            .build(),
    );
    assert_eq!(tokens[0], Expr::column("currency.code"));
}

#[test]
fn test_from_entity_uses_plain_columns() {
    let model = bookshop();
    let books = model.entity("CatalogService.Books").unwrap();
    let select = SelectBuilder::from_entity(books).into_select();
    let names: Vec<&str> = select.columns.iter().filter_map(Expr::output_name).collect();
    assert!(names.contains(&"title"));
    assert!(names.contains(&"author_ID"));
    assert!(!names.contains(&"author"));
    assert!(!names.contains(&"secret"));
}

#[test]
fn test_path_source_keeps_filters() {
    let query = SelectBuilder::from("Authors[ID=1]:books").unwrap().build();
    let Query::Select(select) = query else { panic!("expected select") };
    let cqn_ir::Source::Ref(r) = select.from else { panic!("expected ref") };
    assert!(matches!(&r.path[0], Segment::Filtered { id, .. } if id == "Authors"));
    assert_eq!(r.path[1], Segment::Name("books".into()));
}

#[test]
fn test_group_by_having() {
    let query = SelectBuilder::from("Books")
        .unwrap()
        .columns(["author_ID", "count(1) as books"])
        .unwrap()
        .group_by(["author_ID"])
        .unwrap()
        .having(args!["count(1) >", 2])
        .unwrap()
        .and("sum(stock) > 10")
        .unwrap()
        .order_by(["books desc"])
        .unwrap()
        .build();
    let Query::Select(select) = query else { panic!("expected select") };
    assert_eq!(select.group_by, vec![Expr::column("author_ID")]);
    assert_eq!(select.having[0], Expr::func("count", vec![Expr::val(1)]));
    assert_eq!(select.having[3], Expr::token("and"));
    assert_eq!(select.order_by, vec![Expr::column("books").with_sort(Sort::Desc)]);
}

#[test]
fn test_unknown_named_parameter_rejected() {
    let err = SelectBuilder::from("Books").unwrap().where_("ID = :id").unwrap_err();
    assert!(matches!(err, BuildError::InvalidArgument { .. }));
}

#[test]
fn test_invalid_column_text() {
    let err = SelectBuilder::from("Books").unwrap().columns(["title as"]).unwrap_err();
    assert!(matches!(err, BuildError::Parse(_)));
}

proptest! {
    #[test]
    fn prop_in_list_keeps_order(values in prop::collection::vec(any::<i64>(), 1..20)) {
        let tokens = where_of(
            SelectBuilder::from("Books").unwrap().where_(args!["ID", "in", values.clone()]).unwrap().build(),
        );
        let expected: Vec<Expr> = values.iter().map(|v| Expr::val(*v)).collect();
        prop_assert_eq!(tokens.len(), 3);
        prop_assert_eq!(&tokens[2], &Expr::list(expected));
    }

    #[test]
    fn prop_string_values_bind_verbatim(text in "[a-zA-Z0-9 %_^']{0,24}") {
        let tokens = where_of(
            SelectBuilder::from("Books").unwrap().where_(args!["title", "=", text.clone()]).unwrap().build(),
        );
        prop_assert_eq!(&tokens[2], &Expr::val(text));
    }
}
