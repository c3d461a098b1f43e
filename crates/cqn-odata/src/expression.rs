//! `$filter` and `$orderby` expressions to canonical tokens

use chrono::{DateTime, SecondsFormat, Utc};
use cqn_ir::{escape_like, Expr, Select, Sort, Source, Value};
use cqn_model::{join_keys, Entity, Model};
use tracing::warn;

use crate::request::{BinaryOperator, EdmType, Expression, MemberSegment, Method, OrderByItem, UnaryOperator};
use crate::TranslateError;

/// Date parts that come back as text and are compared against padded literals
const PADDED_PARTS: &[&str] = &["year", "month", "dayofmonth", "second", "hour", "minute"];

/// A translated node: one operand or a token run
#[derive(Debug)]
enum Fragment {
    One(Expr),
    Many(Vec<Expr>),
}

impl Fragment {
    fn into_tokens(self) -> Vec<Expr> {
        match self {
            Fragment::One(expr) => vec![expr],
            Fragment::Many(tokens) => tokens,
        }
    }

    /// Operand position: token runs are wrapped as `{xpr}`
    fn into_operand(self) -> Expr {
        match self {
            Fragment::One(expr) => expr,
            Fragment::Many(mut tokens) if tokens.len() == 1 => tokens.remove(0),
            Fragment::Many(tokens) => Expr::xpr(tokens),
        }
    }

    fn negated(self, negated: bool) -> Fragment {
        if !negated {
            return self;
        }
        let mut tokens = vec![Expr::token("not")];
        tokens.extend(self.into_tokens());
        Fragment::Many(tokens)
    }
}

/// Translates expression trees in the context of one entity.
///
/// Lambda predicates (`books/any(...)`) are translated by a second translator
/// rebased on the association target.
#[derive(Debug, Clone)]
pub struct Translator<'a> {
    model: &'a Model,
    entity: &'a Entity,
    aggregates: Vec<Expr>,
    now: DateTime<Utc>,
}

impl<'a> Translator<'a> {
    pub fn new(model: &'a Model, entity: &'a Entity) -> Self {
        Self {
            model,
            entity,
            aggregates: Vec::new(),
            now: Utc::now(),
        }
    }

    /// Pin the value `now()` translates to
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Members named like one of these aggregate columns (function name or
    /// alias) resolve to the aggregate call, as needed in `having`.
    pub fn with_aggregates(mut self, columns: &[Expr]) -> Self {
        self.aggregates = columns.iter().filter(|c| matches!(c, Expr::Func(_))).cloned().collect();
        self
    }

    pub fn model(&self) -> &'a Model {
        self.model
    }

    pub fn entity(&self) -> &'a Entity {
        self.entity
    }

    /// Same model and clock, other entity
    pub fn rebase(&self, entity: &'a Entity) -> Translator<'a> {
        Translator {
            model: self.model,
            entity,
            aggregates: Vec::new(),
            now: self.now,
        }
    }

    /// Predicate tokens for a `where` or `having` clause
    pub fn translate(&self, expression: &Expression) -> Result<Vec<Expr>, TranslateError> {
        self.node(expression, false).map(Fragment::into_tokens)
    }

    /// A single operand; token runs come back as `{xpr}`
    pub fn operand(&self, expression: &Expression) -> Result<Expr, TranslateError> {
        self.node(expression, false).map(Fragment::into_operand)
    }

    /// One `$orderby` item: a sorted reference or function call
    pub fn order_item(&self, item: &OrderByItem) -> Result<Expr, TranslateError> {
        let sort = if item.descending { Sort::Desc } else { Sort::Asc };
        match self.operand(&item.expression)? {
            expr @ (Expr::Ref(_) | Expr::Func(_)) => Ok(expr.with_sort(sort)),
            _ => Err(TranslateError::unsupported(format!(
                "Expression \"{}\" in $orderby query option",
                item.expression.kind_name()
            ))),
        }
    }

    fn node(&self, expression: &Expression, negated: bool) -> Result<Fragment, TranslateError> {
        match expression {
            Expression::Alias { expression } => self.node(expression, negated),
            Expression::Literal { type_, text } => {
                let value = match (type_, text) {
                    (Some(type_), Some(text)) => typed_value(*type_, text)?,
                    _ => Value::Null,
                };
                Ok(Fragment::One(Expr::val(value)).negated(negated))
            }
            Expression::Member { path } => Ok(self.member(path)?.negated(negated)),
            Expression::Unary { operator: UnaryOperator::Not, operand } => self.node(operand, !negated),
            Expression::Unary { operator: UnaryOperator::Minus, .. } => {
                Err(TranslateError::unsupported("Unary operator \"minus\" in $filter query option"))
            }
            Expression::Binary { operator, left, right } => self.binary(*operator, left, right, negated),
            Expression::Method { method, parameters } => self.method(*method, parameters, negated),
        }
    }

    fn binary(
        &self,
        operator: BinaryOperator,
        left: &Expression,
        right: &Expression,
        negated: bool,
    ) -> Result<Fragment, TranslateError> {
        let comparison = match operator {
            BinaryOperator::Eq => Some("="),
            BinaryOperator::Gt => Some(">"),
            BinaryOperator::Ge => Some(">="),
            BinaryOperator::Lt => Some("<"),
            BinaryOperator::Le => Some("<="),
            _ => None,
        };
        if !matches!(operator, BinaryOperator::And | BinaryOperator::Or | BinaryOperator::Ne) && comparison.is_none() {
            warn!(%operator, "Rejected binary operator");
            return Err(TranslateError::unsupported(format!(
                "Binary operator \"{}\" in $filter query option",
                operator
            )));
        }

        let left = self.node(left, false)?;
        let right = self.node(right, false)?;
        let mut tokens = Vec::new();
        if negated {
            tokens.push(Expr::token("not"));
        }

        match operator {
            BinaryOperator::And => {
                if negated {
                    tokens.push(Expr::token("("));
                }
                tokens.extend(left.into_tokens());
                tokens.push(Expr::token("and"));
                tokens.extend(right.into_tokens());
                if negated {
                    tokens.push(Expr::token(")"));
                }
            }
            BinaryOperator::Or => {
                tokens.push(Expr::token("("));
                tokens.extend(left.into_tokens());
                tokens.push(Expr::token("or"));
                tokens.extend(right.into_tokens());
                tokens.push(Expr::token(")"));
            }
            BinaryOperator::Ne => {
                let left = left.into_operand();
                let right = right.into_operand();
                if right.as_val().map(Value::is_null).unwrap_or(false) {
                    // `not (x ne null)` is `x is null`
                    let test = if negated { "is null" } else { "is not null" };
                    return Ok(Fragment::Many(vec![left, Expr::token(test)]));
                }
                tokens.extend([
                    Expr::token("("),
                    left.clone(),
                    Expr::token("!="),
                    right,
                    Expr::token("or"),
                    left,
                    Expr::token("is null"),
                    Expr::token(")"),
                ]);
            }
            _ => {
                let mut left = left.into_operand();
                let mut right = right.into_operand();
                shift_locate(&left, &mut right);
                shift_locate(&right, &mut left);
                pad_date_part(&left, &mut right);
                pad_date_part(&right, &mut left);
                tokens.extend([left, Expr::token(comparison.unwrap_or("=")), right]);
            }
        }
        Ok(Fragment::Many(tokens))
    }

    fn method(&self, method: Method, parameters: &[Expression], negated: bool) -> Result<Fragment, TranslateError> {
        let mut args = parameters.iter().map(|p| self.operand(p)).collect::<Result<Vec<_>, _>>()?;

        let renamed = |name: &str, args: Vec<Expr>| Fragment::One(Expr::func(name, args));
        let fragment = match method {
            Method::Contains => return like(method, args, true, true, negated),
            Method::StartsWith => return like(method, args, false, true, negated),
            Method::EndsWith => return like(method, args, true, false, negated),
            Method::Now => Fragment::One(Expr::val(self.now.to_rfc3339_opts(SecondsFormat::Millis, true))),
            Method::ToUpper => renamed("upper", args),
            Method::ToLower => renamed("lower", args),
            Method::IndexOf => renamed("locate", args),
            Method::Day => renamed("dayofmonth", args),
            Method::Date => renamed("to_date", args),
            Method::Time => renamed("to_time", args),
            Method::Ceiling => renamed("ceil", args),
            Method::Substring => {
                // 0-based offsets become 1-based
                let start = args.get_mut(1).ok_or_else(|| {
                    TranslateError::unsupported("Method \"substring\" without start position")
                })?;
                plus_one(start);
                renamed("substring", args)
            }
            Method::Trim
            | Method::Length
            | Method::Concat
            | Method::Hour
            | Method::Minute
            | Method::Second
            | Method::Month
            | Method::Year
            | Method::Floor
            | Method::Round => renamed(&method.to_string(), args),
            other => {
                warn!(method = %other, "Rejected method");
                return Err(TranslateError::unsupported(format!(
                    "Method \"{}\" in $filter or $orderby query options",
                    other
                )));
            }
        };
        Ok(fragment.negated(negated))
    }

    fn member(&self, path: &[MemberSegment]) -> Result<Fragment, TranslateError> {
        if path.iter().any(|s| matches!(s, MemberSegment::NavigationToMany { .. })) {
            return self.lambda(path);
        }

        let mut names = Vec::new();
        for segment in path {
            match segment {
                MemberSegment::NavigationToOne { name } => names.push(name.clone()),
                MemberSegment::Variable { .. } => {}
                MemberSegment::Property { name } => {
                    names.push(name.clone());
                    break;
                }
                other => {
                    return Err(TranslateError::unsupported(format!(
                        "Segment kind \"{}\" in $filter query option",
                        other.kind_name()
                    )))
                }
            }
        }

        let Some(first) = names.first() else {
            return Err(TranslateError::unsupported("Empty member path in $filter query option"));
        };
        if let Some(aggregate) = self.aggregate(first) {
            return Ok(Fragment::One(aggregate));
        }
        Ok(Fragment::One(Expr::reference(names)))
    }

    fn aggregate(&self, name: &str) -> Option<Expr> {
        self.aggregates.iter().find_map(|column| match column {
            Expr::Func(f) if f.func == name || f.alias.as_deref() == Some(name) => {
                let mut f = f.clone();
                f.alias = None;
                Some(Expr::Func(f))
            }
            _ => None,
        })
    }

    /// `books/any(b: ...)` becomes `(parent keys) = any(SELECT foreign keys FROM target WHERE ...)`
    fn lambda(&self, path: &[MemberSegment]) -> Result<Fragment, TranslateError> {
        let path: Vec<&MemberSegment> = path
            .iter()
            .skip_while(|s| matches!(s, MemberSegment::Variable { .. }))
            .collect();

        let navigation = match path.first() {
            Some(MemberSegment::NavigationToMany { name }) => name,
            _ => {
                return Err(TranslateError::unsupported(
                    "Navigation to many after other segments in $filter query option",
                ))
            }
        };
        let (op, condition) = match path.get(1) {
            Some(MemberSegment::Any { expression }) => ("any", expression),
            Some(MemberSegment::All { expression }) => ("all", expression),
            Some(other) => {
                return Err(TranslateError::unsupported(format!(
                    "Segment kind \"{}\" after navigation \"{}\" in $filter query option",
                    other.kind_name(),
                    navigation
                )))
            }
            None => {
                return Err(TranslateError::unsupported(format!(
                    "Navigation \"{}\" without lambda in $filter query option",
                    navigation
                )))
            }
        };

        let target = self.model.target(self.entity, navigation)?;
        let keys = join_keys(self.model, self.entity, navigation)?;
        if keys.is_empty() {
            return Err(TranslateError::unsupported(format!(
                "Lambda over \"{}\" without equality on-condition",
                navigation
            )));
        }

        let mut sub = Select::new(Source::entity(target.name.clone()));
        sub.columns = keys.iter().map(|k| Expr::column(k.target.clone())).collect();
        if let Some(condition) = condition {
            sub.where_ = self.rebase(target).translate(condition)?;
        }

        let parents = keys.iter().map(|k| Expr::column(k.source.clone())).collect();
        Ok(Fragment::Many(vec![
            Expr::list(parents),
            Expr::token("="),
            Expr::func(op, vec![Expr::select(sub)]),
        ]))
    }
}

/// `[column, like, concat('%', value, '%'), escape, '^']`
fn like(method: Method, args: Vec<Expr>, leading: bool, trailing: bool, negated: bool) -> Result<Fragment, TranslateError> {
    let [column, value]: [Expr; 2] = args.try_into().map_err(|args: Vec<Expr>| {
        TranslateError::unsupported(format!("Method \"{}\" with {} parameters", method, args.len()))
    })?;

    let mut pattern = Vec::new();
    if leading {
        pattern.push(Expr::token("'%'"));
    }
    pattern.push(escape_parameter(value));
    if trailing {
        pattern.push(Expr::token("'%'"));
    }

    Ok(Fragment::Many(vec![
        column,
        Expr::token(if negated { "not like" } else { "like" }),
        Expr::func("concat", pattern),
        Expr::token("escape"),
        Expr::token("'^'"),
    ]))
}

fn escape_parameter(expr: Expr) -> Expr {
    match expr {
        Expr::Val(mut v) => {
            if let Value::String(s) = &v.val {
                v.val = Value::String(escape_like(s));
            }
            Expr::Val(v)
        }
        Expr::Func(mut f) => {
            f.args = f.args.into_iter().map(escape_parameter).collect();
            Expr::Func(f)
        }
        other => other,
    }
}

/// Literal text typed by its declared primitive type
pub fn typed_value(type_: EdmType, text: &str) -> Result<Value, TranslateError> {
    let invalid = || TranslateError::unsupported(format!("Literal \"{}\" of type {:?}", text, type_));
    if type_ == EdmType::Boolean {
        Ok(Value::Bool(text == "true"))
    } else if type_.is_integer() {
        text.trim().parse::<i64>().map(Value::Int).map_err(|_| invalid())
    } else if type_.is_fractional() {
        text.trim().parse::<f64>().map(Value::Float).map_err(|_| invalid())
    } else {
        Ok(Value::String(text.to_string()))
    }
}

/// Literal bumped in place; false leaves it untouched
fn increment(value: &mut Value) -> bool {
    let bumped = match value {
        Value::Int(i) => i.checked_add(1).map(Value::Int),
        Value::Float(x) => Some(Value::Float(*x + 1.0)),
        Value::String(s) => s.parse::<i64>().ok().and_then(|i| i.checked_add(1)).map(Value::Int),
        Value::Null | Value::Bool(_) => None,
    };
    match bumped {
        Some(v) => {
            *value = v;
            true
        }
        None => false,
    }
}

/// Add one to an offset, folding it into a literal where possible
fn plus_one(expr: &mut Expr) {
    *expr = match std::mem::replace(expr, Expr::null()) {
        Expr::Val(mut v) => {
            if increment(&mut v.val) {
                Expr::Val(v)
            } else {
                Expr::xpr(vec![Expr::Val(v), Expr::token("+"), Expr::val(1)])
            }
        }
        other => Expr::xpr(vec![other, Expr::token("+"), Expr::val(1)]),
    };
}

/// `locate` counts from 1 where `indexof` counts from 0
fn shift_locate(func: &Expr, other: &mut Expr) {
    let numeric = matches!(other, Expr::Val(v) if matches!(v.val, Value::Int(_) | Value::Float(_)));
    if matches!(func, Expr::Func(f) if f.func == "locate") && numeric {
        plus_one(other);
    }
}

fn pad_date_part(func: &Expr, other: &mut Expr) {
    let (Expr::Func(f), Expr::Val(v)) = (func, other) else {
        return;
    };
    if !PADDED_PARTS.contains(&f.func.as_str()) || f.args.is_empty() {
        return;
    }
    let number = match &v.val {
        Value::Int(i) => *i as f64,
        Value::Float(x) => *x,
        Value::String(s) => match s.parse::<f64>() {
            Ok(x) => x,
            Err(_) => return,
        },
        Value::Null | Value::Bool(_) => return,
    };
    let mut text = format!("{}{}", if number < 10.0 { "0" } else { "" }, v.val);
    if f.func == "second" {
        text = pad_fraction(&text);
    }
    v.val = Value::String(text);
}

fn pad_fraction(text: &str) -> String {
    let (whole, fraction) = text.split_once('.').unwrap_or((text, ""));
    format!("{}.{:0<3}", whole, fraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::MemberSegment as M;
    use chrono::TimeZone;
    use test_case::test_case;

    fn bookshop() -> Model {
        Model::from_json_str(include_str!("../../cqn-model/fixtures/bookshop.json")).unwrap()
    }

    fn prop(name: &str) -> Expression {
        Expression::property(name)
    }

    fn int(text: &str) -> Expression {
        Expression::literal(EdmType::Int32, text)
    }

    fn string(text: &str) -> Expression {
        Expression::literal(EdmType::String, text)
    }

    fn translate(expression: Expression) -> Result<Vec<Expr>, TranslateError> {
        let model = bookshop();
        let books = model.entity("CatalogService.Books").unwrap();
        Translator::new(&model, books).translate(&expression)
    }

    fn t(token: &str) -> Expr {
        Expr::token(token)
    }

    #[test]
    fn test_negated_conjunction() {
        let tokens = translate(Expression::not(Expression::binary(
            BinaryOperator::And,
            Expression::binary(BinaryOperator::Eq, prop("a"), int("1")),
            Expression::binary(BinaryOperator::Eq, prop("b"), int("2")),
        )))
        .unwrap();
        assert_eq!(
            tokens,
            vec![
                t("not"),
                t("("),
                Expr::column("a"),
                t("="),
                Expr::val(1),
                t("and"),
                Expr::column("b"),
                t("="),
                Expr::val(2),
                t(")"),
            ]
        );
    }

    #[test]
    fn test_or_is_bracketed() {
        let tokens = translate(Expression::binary(
            BinaryOperator::Or,
            Expression::binary(BinaryOperator::Gt, prop("stock"), int("1")),
            Expression::binary(BinaryOperator::Lt, prop("stock"), int("0")),
        ))
        .unwrap();
        assert_eq!(tokens.first(), Some(&t("(")));
        assert_eq!(tokens[4], t("or"));
        assert_eq!(tokens.last(), Some(&t(")")));
    }

    #[test_case(false, vec![Expr::column("title"), Expr::token("is not null")] ; "plain")]
    #[test_case(true, vec![Expr::column("title"), Expr::token("is null")] ; "negated")]
    fn test_ne_null(negated: bool, expected: Vec<Expr>) {
        let ne = Expression::binary(BinaryOperator::Ne, prop("title"), Expression::null());
        let expression = if negated { Expression::not(ne) } else { ne };
        assert_eq!(translate(expression).unwrap(), expected);
    }

    #[test]
    fn test_ne_value_keeps_nulls() {
        let tokens = translate(Expression::binary(BinaryOperator::Ne, prop("stock"), int("5"))).unwrap();
        assert_eq!(
            tokens,
            vec![
                t("("),
                Expr::column("stock"),
                t("!="),
                Expr::val(5),
                t("or"),
                Expr::column("stock"),
                t("is null"),
                t(")"),
            ]
        );
    }

    #[test_case(EdmType::Boolean, "true", Value::Bool(true) ; "boolean")]
    #[test_case(EdmType::Int64, "42", Value::Int(42) ; "int64")]
    #[test_case(EdmType::Decimal, "4.5", Value::Float(4.5) ; "decimal")]
    #[test_case(EdmType::Guid, "abc", Value::String("abc".into()) ; "guid stays text")]
    #[test_case(EdmType::Date, "2020-01-01", Value::String("2020-01-01".into()) ; "date stays text")]
    fn test_literal_typing(type_: EdmType, text: &str, expected: Value) {
        assert_eq!(typed_value(type_, text).unwrap(), expected);
    }

    #[test]
    fn test_bad_integer_literal() {
        assert!(matches!(typed_value(EdmType::Int32, "x1"), Err(TranslateError::FeatureNotSupported { .. })));
    }

    #[test_case(Method::ToUpper, "upper" ; "toupper")]
    #[test_case(Method::ToLower, "lower" ; "tolower")]
    #[test_case(Method::Ceiling, "ceil" ; "ceiling")]
    #[test_case(Method::Day, "dayofmonth" ; "day")]
    #[test_case(Method::Date, "to_date" ; "date")]
    #[test_case(Method::Time, "to_time" ; "time")]
    #[test_case(Method::Trim, "trim" ; "trim")]
    #[test_case(Method::Round, "round" ; "round")]
    fn test_method_renames(method: Method, name: &str) {
        let tokens = translate(Expression::method(method, vec![prop("title")])).unwrap();
        assert_eq!(tokens, vec![Expr::func(name, vec![Expr::column("title")])]);
    }

    #[test_case(Method::Cast ; "cast")]
    #[test_case(Method::IsOf ; "isof")]
    #[test_case(Method::MatchesPattern ; "matchespattern")]
    fn test_unsupported_methods(method: Method) {
        let err = translate(Expression::method(method, vec![prop("title")])).unwrap_err();
        assert!(matches!(err, TranslateError::FeatureNotSupported { construct } if construct.contains(&method.to_string())));
    }

    #[test]
    fn test_contains_escapes_value() {
        let tokens = translate(Expression::method(Method::Contains, vec![prop("title"), string("50%_off^")])).unwrap();
        assert_eq!(
            tokens,
            vec![
                Expr::column("title"),
                t("like"),
                Expr::func("concat", vec![t("'%'"), Expr::val("50^%^_off^^"), t("'%'")]),
                t("escape"),
                t("'^'"),
            ]
        );
    }

    #[test]
    fn test_negated_startswith_uses_not_like() {
        let tokens = translate(Expression::not(Expression::method(
            Method::StartsWith,
            vec![prop("title"), string("The")],
        )))
        .unwrap();
        assert_eq!(tokens[1], t("not like"));
        assert_eq!(tokens[2], Expr::func("concat", vec![Expr::val("The"), t("'%'")]));
    }

    #[test]
    fn test_negated_member_is_prefixed() {
        let tokens = translate(Expression::not(prop("active"))).unwrap();
        assert_eq!(tokens, vec![t("not"), Expr::column("active")]);
    }

    #[test]
    fn test_double_negation_cancels() {
        let tokens = translate(Expression::not(Expression::not(Expression::binary(
            BinaryOperator::Eq,
            prop("ID"),
            int("1"),
        ))))
        .unwrap();
        assert_eq!(tokens, vec![Expr::column("ID"), t("="), Expr::val(1)]);
    }

    #[test]
    fn test_indexof_shifts_compared_value() {
        let indexof = Expression::method(Method::IndexOf, vec![prop("title"), string("a")]);
        let tokens = translate(Expression::binary(BinaryOperator::Eq, int("2"), indexof)).unwrap();
        assert_eq!(tokens[0], Expr::val(3));
        assert!(matches!(&tokens[2], Expr::Func(f) if f.func == "locate"));
    }

    #[test_case(Method::Month, "5", "05" ; "month padded")]
    #[test_case(Method::Year, "2020", "2020" ; "year unchanged")]
    #[test_case(Method::Second, "7", "07.000" ; "second fraction")]
    #[test_case(Method::Hour, "11", "11" ; "hour")]
    fn test_date_parts_padded(method: Method, literal: &str, expected: &str) {
        let part = Expression::method(method, vec![prop("createdAt")]);
        let tokens = translate(Expression::binary(BinaryOperator::Eq, part, int(literal))).unwrap();
        assert_eq!(tokens[2], Expr::val(expected));
    }

    #[test]
    fn test_substring_start_is_one_based() {
        let tokens = translate(Expression::method(Method::Substring, vec![prop("title"), int("0"), int("3")])).unwrap();
        assert_eq!(
            tokens,
            vec![Expr::func("substring", vec![Expr::column("title"), Expr::val(1), Expr::val(3)])]
        );
    }

    #[test]
    fn test_substring_start_at_int64_max_stays_an_expression() {
        let start = Expression::literal(EdmType::Int64, "9223372036854775807");
        let tokens = translate(Expression::method(Method::Substring, vec![prop("title"), start])).unwrap();
        let shifted = Expr::xpr(vec![Expr::val(i64::MAX), t("+"), Expr::val(1)]);
        assert_eq!(tokens, vec![Expr::func("substring", vec![Expr::column("title"), shifted])]);
    }

    #[test]
    fn test_indexof_at_int64_max_does_not_overflow() {
        let indexof = Expression::method(Method::IndexOf, vec![prop("title"), string("a")]);
        let max = Expression::literal(EdmType::Int64, "9223372036854775807");
        let tokens = translate(Expression::binary(BinaryOperator::Eq, indexof, max)).unwrap();
        assert_eq!(tokens[2], Expr::xpr(vec![Expr::val(i64::MAX), t("+"), Expr::val(1)]));
    }

    #[test]
    fn test_now_is_pinned() {
        let model = bookshop();
        let books = model.entity("CatalogService.Books").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let tokens = Translator::new(&model, books)
            .at(now)
            .translate(&Expression::method(Method::Now, vec![]))
            .unwrap();
        assert_eq!(tokens, vec![Expr::val("2024-03-01T12:30:00.000Z")]);
    }

    #[test]
    fn test_to_one_path_folds() {
        let member = Expression::Member {
            path: vec![
                M::NavigationToOne { name: "author".into() },
                M::Property { name: "name".into() },
            ],
        };
        let tokens = translate(Expression::binary(BinaryOperator::Eq, member, string("Poe"))).unwrap();
        assert_eq!(tokens[0], Expr::reference(["author", "name"]));
    }

    #[test]
    fn test_any_lambda_through_backlink() {
        let model = bookshop();
        let authors = model.entity("CatalogService.Authors").unwrap();
        let inner = Expression::binary(
            BinaryOperator::Gt,
            Expression::Member {
                path: vec![M::Variable { name: "b".into() }, M::Property { name: "stock".into() }],
            },
            int("0"),
        );
        let member = Expression::Member {
            path: vec![
                M::NavigationToMany { name: "books".into() },
                M::Any { expression: Some(Box::new(inner)) },
            ],
        };
        let tokens = Translator::new(&model, authors).translate(&member).unwrap();

        let mut sub = Select::new(Source::entity("CatalogService.Books"));
        sub.columns = vec![Expr::column("author_ID")];
        sub.where_ = vec![Expr::column("stock"), t(">"), Expr::val(0)];
        assert_eq!(
            tokens,
            vec![
                Expr::list(vec![Expr::column("ID")]),
                t("="),
                Expr::func("any", vec![Expr::select(sub)]),
            ]
        );
    }

    #[test]
    fn test_all_lambda_without_condition() {
        let model = bookshop();
        let authors = model.entity("CatalogService.Authors").unwrap();
        let member = Expression::Member {
            path: vec![M::NavigationToMany { name: "books".into() }, M::All { expression: None }],
        };
        let tokens = Translator::new(&model, authors).translate(&member).unwrap();
        let Expr::Func(f) = &tokens[2] else { panic!("expected func") };
        assert_eq!(f.func, "all");
        let Expr::Select(sub) = &f.args[0] else { panic!("expected subselect") };
        assert!(sub.select.where_.is_empty());
    }

    #[test]
    fn test_having_lookup_by_alias() {
        let model = bookshop();
        let books = model.entity("CatalogService.Books").unwrap();
        let columns = vec![
            Expr::column("author_ID"),
            Expr::func("sum", vec![Expr::column("stock")]).with_alias("total"),
        ];
        let tokens = Translator::new(&model, books)
            .with_aggregates(&columns)
            .translate(&Expression::binary(BinaryOperator::Gt, prop("total"), int("10")))
            .unwrap();
        assert_eq!(tokens[0], Expr::func("sum", vec![Expr::column("stock")]));
    }

    #[test]
    fn test_unsupported_operators() {
        let err = translate(Expression::binary(BinaryOperator::Add, prop("stock"), int("1"))).unwrap_err();
        assert_eq!(err.to_string(), "Feature not supported: Binary operator \"add\" in $filter query option");
        let minus = Expression::Unary {
            operator: UnaryOperator::Minus,
            operand: Box::new(prop("stock")),
        };
        assert!(matches!(translate(minus), Err(TranslateError::FeatureNotSupported { .. })));
    }

    #[test]
    fn test_order_item_rejects_predicates() {
        let model = bookshop();
        let books = model.entity("CatalogService.Books").unwrap();
        let translator = Translator::new(&model, books);
        let item = OrderByItem { expression: prop("title"), descending: true };
        assert_eq!(translator.order_item(&item).unwrap(), Expr::column("title").with_sort(Sort::Desc));
        let item = OrderByItem {
            expression: Expression::binary(BinaryOperator::Eq, prop("title"), string("x")),
            descending: false,
        };
        assert!(translator.order_item(&item).is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_escape_like_is_reversible(text in "[a-z%_^ ]{0,24}") {
            let escaped = escape_like(&text);
            let mut chars = escaped.chars();
            let mut restored = String::new();
            while let Some(c) = chars.next() {
                if c == '^' {
                    let next = chars.next();
                    proptest::prop_assert!(matches!(next, Some('^' | '_' | '%')));
                    restored.extend(next);
                } else {
                    proptest::prop_assert!(c != '_' && c != '%');
                    restored.push(c);
                }
            }
            proptest::prop_assert_eq!(restored, text);
        }
    }
}
