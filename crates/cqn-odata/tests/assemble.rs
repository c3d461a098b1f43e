//! Requests through assembly and SQL compilation

use cqn_ir::{Expr, Query, Value};
use cqn_model::Model;
use cqn_odata::request::{
    AggregateExpression, AggregateMethod, BinaryOperator, EdmType, Expression, ExpandItem, MemberSegment, Payload,
    QueryOptions, SearchExpression, Transformation,
};
use cqn_odata::{
    assemble, lower_navigation, lower_write, AssembleOptions, Assembler, Intent, Request, Segment, SegmentKind,
    TranslateError,
};
use cqn_ql::{args, SelectBuilder};
use cqn_sql::{compile, CompileOptions};
use test_case::test_case;

fn bookshop() -> Model {
    Model::from_json_str(include_str!("../../cqn-model/fixtures/bookshop.json")).unwrap()
}

fn books() -> Segment {
    Segment::new(SegmentKind::EntityCollection, "Books").entity_type("CatalogService.Books")
}

fn book(id: &str) -> Segment {
    Segment::new(SegmentKind::Entity, "Books")
        .entity_type("CatalogService.Books")
        .key("ID", id, EdmType::Int32)
}

fn author(id: &str) -> Segment {
    Segment::new(SegmentKind::Entity, "Authors")
        .entity_type("CatalogService.Authors")
        .key("ID", id, EdmType::Int32)
}

fn sql(query: &Query) -> (String, Vec<Value>) {
    let compiled = compile(query, &CompileOptions::default()).unwrap();
    (compiled.text, compiled.values)
}

fn gt(property: &str, value: &str) -> Expression {
    Expression::binary(
        BinaryOperator::Gt,
        Expression::property(property),
        Expression::literal(EdmType::Int32, value),
    )
}

#[test]
fn test_filter_matches_fluent_builder() {
    let model = bookshop();
    let entity = model.entity("CatalogService.Books").unwrap();
    let built = SelectBuilder::from_entity(entity).where_(args!["stock", ">", 0]).unwrap().build();

    let request = Request::read(vec![books()], QueryOptions { filter: Some(gt("stock", "0")), ..QueryOptions::default() });
    let assembled = assemble(&request, &model).unwrap();

    assert!(assembled.validation.is_none());
    assert_eq!(sql(&assembled.query), sql(&built));
    assert_eq!(assembled.query.fingerprint(), built.fingerprint());
}

#[test]
fn test_keyed_read_merges_key_into_where() {
    let model = bookshop();
    let request = Request::read(vec![book("201")], QueryOptions::default());
    let (text, values) = sql(&assemble(&request, &model).unwrap().query);
    assert!(text.starts_with(r#"SELECT "ID", "title""#));
    assert!(text.ends_with(r#"FROM "CatalogService.Books" WHERE "ID" = ?"#));
    assert_eq!(values, vec![Value::Int(201)]);
}

#[test]
fn test_select_adds_keys() {
    let model = bookshop();
    let request: Request = serde_json::from_str(
        r#"{"intent": "read",
            "segments": [{"kind": "entity-collection", "name": "Books", "entityType": "CatalogService.Books"}],
            "options": {"select": [{"path": ["title"]}, {"path": ["author"]}]}}"#,
    )
    .unwrap();
    let (text, _) = sql(&assemble(&request, &model).unwrap().query);
    assert_eq!(text, r#"SELECT "title", "ID" FROM "CatalogService.Books""#);
}

#[test]
fn test_count_segment() {
    let model = bookshop();
    let request = Request::read(
        vec![books(), Segment::new(SegmentKind::Count, "$count")],
        QueryOptions { filter: Some(gt("stock", "5")), ..QueryOptions::default() },
    );
    let (text, values) = sql(&assemble(&request, &model).unwrap().query);
    assert_eq!(
        text,
        r#"SELECT count(?) AS "$count" FROM "CatalogService.Books" WHERE "stock" > ?"#
    );
    assert_eq!(values, vec![Value::Int(1), Value::Int(5)]);
}

#[test_case(Some(5), Some(10), None, vec![Value::Int(5), Value::Int(10)] ; "top and skip")]
#[test_case(None, Some(10), None, vec![Value::Int(cqn_ir::MAX_ROWS), Value::Int(10)] ; "skip only")]
#[test_case(Some(500), None, Some(100), vec![Value::Int(100)] ; "capped by page size")]
#[test_case(None, None, Some(50), vec![Value::Int(50)] ; "page size without top")]
fn test_paging(top: Option<i64>, skip: Option<i64>, max_page_size: Option<i64>, expected: Vec<Value>) {
    let model = bookshop();
    let request = Request::read(vec![books()], QueryOptions { top, skip, ..QueryOptions::default() });
    let assembled = Assembler::new(&model)
        .with_options(AssembleOptions { max_page_size })
        .assemble(&request)
        .unwrap();
    let (text, values) = sql(&assembled.query);
    assert!(text.contains("LIMIT ?"));
    assert_eq!(values, expected);
}

#[test]
fn test_singleton_reads_one_row() {
    let model = bookshop();
    let request = Request::read(
        vec![Segment::new(SegmentKind::Singleton, "Settings").entity_type("CatalogService.Settings")],
        QueryOptions::default(),
    );
    let (text, values) = sql(&assemble(&request, &model).unwrap().query);
    assert_eq!(text, r#"SELECT "ID", "currency" FROM "CatalogService.Settings" LIMIT ?"#);
    assert_eq!(values, vec![Value::Int(1)]);
}

#[test]
fn test_navigation_read_is_validated_and_lowered() {
    let model = bookshop();
    let segments = vec![author("1"), Segment::new(SegmentKind::NavigationToMany, "books")];
    let request = Request::read(
        segments.clone(),
        QueryOptions { filter: Some(gt("stock", "0")), ..QueryOptions::default() },
    );
    let assembled = assemble(&request, &model).unwrap();

    let validation = assembled.validation.unwrap();
    assert!(validation.nav_to_many);
    let (check, values) = sql(&Query::Select(validation.select));
    assert_eq!(check, r#"SELECT * FROM "CatalogService.Authors" AS "T0" WHERE "T0"."ID" = ?"#);
    assert_eq!(values, vec![Value::Int(1)]);

    let Query::Select(select) = assembled.query else { panic!("expected select") };
    let lowered = lower_navigation(select, &segments, &model).unwrap();
    let (text, values) = sql(&Query::Select(lowered));
    assert!(text.contains(r#"FROM "CatalogService.Books" AS "T1" WHERE EXISTS ( SELECT 1 FROM "CatalogService.Authors" AS "T0""#));
    assert!(text.ends_with(r#"AND "stock" > ?"#));
    assert_eq!(values, vec![Value::Int(1), Value::Int(0)]);
}

#[test]
fn test_navigation_to_one_without_keys_is_not_to_many() {
    let model = bookshop();
    let segments = vec![book("1"), Segment::new(SegmentKind::NavigationToOne, "author")];
    let assembled = assemble(&Request::read(segments, QueryOptions::default()), &model).unwrap();
    assert!(!assembled.validation.unwrap().nav_to_many);
}

#[test]
fn test_lambda_any_becomes_in() {
    let model = bookshop();
    let filter = Expression::Member {
        path: vec![
            MemberSegment::NavigationToMany { name: "books".into() },
            MemberSegment::Any {
                expression: Some(Box::new(Expression::binary(
                    BinaryOperator::Gt,
                    Expression::Member {
                        path: vec![
                            MemberSegment::Variable { name: "b".into() },
                            MemberSegment::Property { name: "stock".into() },
                        ],
                    },
                    Expression::literal(EdmType::Int32, "0"),
                ))),
            },
        ],
    };
    let request = Request::read(
        vec![Segment::new(SegmentKind::EntityCollection, "CatalogService.Authors")],
        QueryOptions { filter: Some(filter), ..QueryOptions::default() },
    );
    let (text, values) = sql(&assemble(&request, &model).unwrap().query);
    assert!(text.ends_with(
        r#"WHERE ("ID") IN ( SELECT "author_ID" FROM "CatalogService.Books" WHERE "stock" > ? )"#
    ));
    assert_eq!(values, vec![Value::Int(0)]);
}

#[test]
fn test_search_uses_annotated_columns() {
    let model = bookshop();
    let request = Request::read(
        vec![books()],
        QueryOptions {
            search: Some(SearchExpression::term("Raven")),
            search_text: Some("Raven".into()),
            ..QueryOptions::default()
        },
    );
    let (text, values) = sql(&assemble(&request, &model).unwrap().query);
    assert!(text.ends_with(r#"WHERE ( lower("title") LIKE ? ESCAPE '^' )"#), "{}", text);
    assert_eq!(values, vec![Value::from("%raven%")]);
}

#[test]
fn test_search_grouping_is_rejected() {
    let model = bookshop();
    let request = Request::read(
        vec![books()],
        QueryOptions {
            search: Some(SearchExpression::term("a")),
            search_text: Some("(a OR b)".into()),
            ..QueryOptions::default()
        },
    );
    let err = assemble(&request, &model).unwrap_err();
    assert_eq!(err.to_string(), "Feature not supported: Parenthesis operator in query option $search");
}

#[test]
fn test_apply_groups_and_filters_in_having() {
    let model = bookshop();
    let apply = vec![Transformation::GroupBy {
        items: vec![vec![MemberSegment::Property { name: "author_ID".into() }]],
        transformations: vec![Transformation::Aggregate {
            expressions: vec![AggregateExpression {
                expression: Some(Expression::property("stock")),
                method: Some(AggregateMethod::Sum),
                alias: Some("total".into()),
                path: Vec::new(),
                from: Vec::new(),
                inline: None,
            }],
        }],
    }];
    let request = Request::read(
        vec![books()],
        QueryOptions { apply, filter: Some(gt("total", "10")), ..QueryOptions::default() },
    );
    let (text, values) = sql(&assemble(&request, &model).unwrap().query);
    assert_eq!(
        text,
        r#"SELECT sum("stock") AS "total", "author_ID" FROM "CatalogService.Books" GROUP BY "author_ID" HAVING sum("stock") > ?"#
    );
    assert_eq!(values, vec![Value::Int(10)]);
}

#[test]
fn test_expand_column_is_attached() {
    let model = bookshop();
    let request = Request::read(
        vec![books()],
        QueryOptions { expand: vec![ExpandItem::navigation("author")], ..QueryOptions::default() },
    );
    let Query::Select(select) = assemble(&request, &model).unwrap().query else { panic!("expected select") };
    let expand = select.columns.last().and_then(Expr::as_reference).unwrap();
    assert_eq!(expand.first(), Some("author"));
    assert!(expand.is_expand());
}

#[test_case(SegmentKind::ComplexProperty, "Request parameter \"complex-property\" with READ requests" ; "complex")]
#[test_case(SegmentKind::BoundFunction, "Request parameter \"bound-function\" with READ requests" ; "function")]
fn test_read_allow_list(kind: SegmentKind, message: &str) {
    let model = bookshop();
    let request = Request::read(vec![book("1"), Segment::new(kind, "x")], QueryOptions::default());
    match assemble(&request, &model) {
        Err(TranslateError::FeatureNotSupported { construct }) => assert_eq!(construct, message),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_create_through_navigation() {
    let model = bookshop();
    let segments = vec![author("7"), Segment::new(SegmentKind::NavigationToMany, "books")];
    let mut entry = cqn_ir::Entry::new();
    entry.insert("ID".into(), Value::Int(300));
    entry.insert("title".into(), Value::from("Eureka"));
    let request = Request::write(Intent::Create, segments.clone(), Some(Payload::One(entry)));

    let assembled = assemble(&request, &model).unwrap();
    let lowered = lower_write(assembled.query, &segments, &model).unwrap();
    let (text, values) = sql(&lowered);
    assert_eq!(text, r#"INSERT INTO "CatalogService.Books" ("ID", "author_ID", "title") VALUES (?, ?, ?)"#);
    assert_eq!(values, vec![Value::Int(300), Value::Int(7), Value::from("Eureka")]);
}

#[test]
fn test_update_entity() {
    let model = bookshop();
    let mut entry = cqn_ir::Entry::new();
    entry.insert("stock".into(), Value::Int(3));
    let request = Request::write(Intent::Update, vec![book("1")], Some(Payload::One(entry)));
    let (text, values) = sql(&assemble(&request, &model).unwrap().query);
    assert_eq!(text, r#"UPDATE "CatalogService.Books" SET "stock" = ? WHERE "ID" = ?"#);
    assert_eq!(values, vec![Value::Int(3), Value::Int(1)]);
}

#[test]
fn test_delete_property_nulls_column() {
    let model = bookshop();
    let request = Request::write(
        Intent::Delete,
        vec![book("1"), Segment::new(SegmentKind::PrimitiveProperty, "descr")],
        None,
    );
    let Query::Update(update) = assemble(&request, &model).unwrap().query else { panic!("expected update") };
    assert_eq!(update.data.get("descr"), Some(&Value::Null));
}

#[test]
fn test_delete_collection_is_rejected() {
    let model = bookshop();
    let request = Request::write(Intent::Delete, vec![books()], None);
    let err = assemble(&request, &model).unwrap_err();
    assert_eq!(err.to_string(), "Feature not supported: DELETE of kind \"entity-collection\"");
}

#[test]
fn test_bound_action_selects_binding() {
    let model = bookshop();
    let request = Request::write(
        Intent::Invoke,
        vec![book("1"), Segment::new(SegmentKind::BoundAction, "CatalogService.order")],
        None,
    );
    let (text, values) = sql(&assemble(&request, &model).unwrap().query);
    assert_eq!(text, r#"SELECT * FROM "CatalogService.Books" WHERE "ID" = ?"#);
    assert_eq!(values, vec![Value::Int(1)]);
}
