//! Pest-based parser for CQL expression fragments
//!
//! Every string the builder accepts (fluid predicates, column strings, order
//! items and path expressions) goes through this one grammar and comes out as
//! canonical tree tokens.

use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;
use thiserror::Error;

use cqn_ir::{Expr, Param, Ref, Segment, Sort, Value};

#[derive(Parser)]
#[grammar = "cqn.pest"]
pub struct CqnParser;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Pest error: {0}")]
    Pest(#[from] pest::error::Error<Rule>),
}

/// Parse a predicate into a flat token stream
pub fn parse_condition(source: &str) -> Result<Vec<Expr>, ParseError> {
    let mut pairs = CqnParser::parse(Rule::condition, source)?;
    let condition = next(&mut pairs, "condition")?;
    let mut out = Vec::new();
    for pair in condition.into_inner() {
        if pair.as_rule() == Rule::expr {
            expr_tokens(pair, &mut out)?;
        }
    }
    Ok(out)
}

/// Parse a projected column such as `count(1) as total`
pub fn parse_column(source: &str) -> Result<Expr, ParseError> {
    let normalized = fold_inline(source)?;
    let mut pairs = CqnParser::parse(Rule::column, &normalized)?;
    let column = next(&mut pairs, "column")?;

    let mut expr = None;
    let mut alias = None;
    for pair in column.into_inner() {
        match pair.as_rule() {
            Rule::star => expr = Some(Expr::token("*")),
            Rule::value_expr => expr = Some(single(pair)?),
            Rule::alias => alias = Some(ident_text(inner_first(pair)?)),
            _ => {}
        }
    }

    let expr = expr.ok_or_else(|| ParseError::Syntax(format!("Empty column: {}", source)))?;
    Ok(match alias {
        Some(alias) => expr.with_alias(alias),
        None => expr,
    })
}

/// Parse an order item such as `title desc`
pub fn parse_order_item(source: &str) -> Result<(Expr, Option<Sort>), ParseError> {
    let normalized = fold_inline(source)?;
    let mut pairs = CqnParser::parse(Rule::order_item, &normalized)?;
    let item = next(&mut pairs, "order item")?;

    let mut expr = None;
    let mut sort = None;
    for pair in item.into_inner() {
        match pair.as_rule() {
            Rule::value_expr => expr = Some(single(pair)?),
            Rule::kw_asc => sort = Some(Sort::Asc),
            Rule::kw_desc => sort = Some(Sort::Desc),
            _ => {}
        }
    }
    let expr = expr.ok_or_else(|| ParseError::Syntax(format!("Empty order item: {}", source)))?;
    Ok((expr, sort))
}

/// Parse a single value expression; used to vet references given as plain text
pub fn parse_operand(source: &str) -> Result<Expr, ParseError> {
    let mut pairs = CqnParser::parse(Rule::operand_only, source)?;
    let item = next(&mut pairs, "operand")?;
    let value = item
        .into_inner()
        .find(|p| p.as_rule() == Rule::value_expr)
        .ok_or_else(|| ParseError::Syntax(format!("Empty operand: {}", source)))?;
    single(value)
}

/// Parse a path expression such as `Books[ID=1]:author as A`
pub fn parse_path(source: &str) -> Result<Ref, ParseError> {
    let mut pairs = CqnParser::parse(Rule::path, source)?;
    let path = next(&mut pairs, "path")?;

    let mut r = Ref::default();
    for pair in path.into_inner() {
        match pair.as_rule() {
            Rule::path_head | Rule::path_step => r.path.push(path_segment(pair)?),
            Rule::alias => r.alias = Some(ident_text(inner_first(pair)?)),
            _ => {}
        }
    }
    Ok(r)
}

/// `author.{name}` is shorthand for the path `author.name`; braces inside
/// string literals are left alone
fn fold_inline(source: &str) -> Result<String, ParseError> {
    if !source.contains(".{") {
        return Ok(source.to_string());
    }
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut quoted = false;
    while let Some(c) = chars.next() {
        if c == '\'' {
            quoted = !quoted;
        } else if !quoted && c == '.' && chars.peek() == Some(&'{') {
            chars.next();
            let mut inner = String::new();
            let mut depth = 1;
            loop {
                let next = chars
                    .next()
                    .ok_or_else(|| ParseError::Syntax(format!("Unclosed inline path: {}", source)))?;
                match next {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
                inner.push(next);
            }
            let inner = inner.trim();
            if inner.is_empty() || inner.contains(',') {
                return Err(ParseError::Syntax(format!("Inline path must name one column: {}", source)));
            }
            out.push('.');
            out.push_str(&fold_inline(inner)?);
            continue;
        }
        out.push(c);
    }
    Ok(out)
}

fn path_segment(pair: Pair<Rule>) -> Result<Segment, ParseError> {
    let mut inner = pair.into_inner();
    let id = next(&mut inner, "path segment")?.as_str().to_string();
    match inner.next() {
        Some(filter) => {
            let mut where_ = Vec::new();
            expr_tokens(inner_first(filter)?, &mut where_)?;
            Ok(Segment::Filtered { id, where_ })
        }
        None => Ok(Segment::Name(id)),
    }
}

fn expr_tokens(pair: Pair<Rule>, out: &mut Vec<Expr>) -> Result<(), ParseError> {
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::kw_not => out.push(Expr::token("not")),
            Rule::logic_op => out.push(Expr::token(inner_first(part)?.as_str().to_lowercase())),
            Rule::predicate => predicate_tokens(inner_first(part)?, out)?,
            rule => return Err(ParseError::Syntax(format!("Unexpected {:?} in expression", rule))),
        }
    }
    Ok(())
}

fn predicate_tokens(pair: Pair<Rule>, out: &mut Vec<Expr>) -> Result<(), ParseError> {
    match pair.as_rule() {
        Rule::exists_pred => {
            out.push(Expr::token("exists"));
            for part in pair.into_inner() {
                if part.as_rule() != Rule::kw_exists {
                    out.push(operand(part)?);
                }
            }
            Ok(())
        }
        Rule::comparison => {
            let mut inner = pair.into_inner();
            value_tokens(next(&mut inner, "comparison")?, out)?;
            if let Some(tail) = inner.next() {
                tail_tokens(tail, out)?;
            }
            Ok(())
        }
        rule => Err(ParseError::Syntax(format!("Unexpected {:?} in predicate", rule))),
    }
}

fn tail_tokens(pair: Pair<Rule>, out: &mut Vec<Expr>) -> Result<(), ParseError> {
    let rule = pair.as_rule();
    let parts: Vec<Pair<Rule>> = pair.into_inner().collect();
    let negated = parts.iter().any(|p| p.as_rule() == Rule::kw_not);
    let operator = |keyword: &str| {
        if negated {
            Expr::token(format!("not {}", keyword))
        } else {
            Expr::token(keyword)
        }
    };

    match rule {
        Rule::null_test => {
            out.push(if negated { Expr::token("is not") } else { Expr::token("is") });
            out.push(Expr::null());
        }
        Rule::between_tail => {
            out.push(operator("between"));
            let mut bounds = parts.into_iter().filter(|p| p.as_rule() == Rule::value_expr);
            let lower = bounds.next().ok_or_else(|| ParseError::Syntax("between without bounds".into()))?;
            let upper = bounds.next().ok_or_else(|| ParseError::Syntax("between without upper bound".into()))?;
            value_tokens(lower, out)?;
            out.push(Expr::token("and"));
            value_tokens(upper, out)?;
        }
        Rule::in_tail => {
            out.push(operator("in"));
            for part in parts {
                match part.as_rule() {
                    Rule::kw_not | Rule::kw_in => {}
                    Rule::in_list => {
                        let items = part.into_inner().map(single).collect::<Result<Vec<_>, _>>()?;
                        out.push(Expr::list(items));
                    }
                    _ => out.push(operand(part)?),
                }
            }
        }
        Rule::like_tail => {
            out.push(operator("like"));
            for part in parts {
                match part.as_rule() {
                    Rule::value_expr => value_tokens(part, out)?,
                    Rule::kw_escape => out.push(Expr::token("escape")),
                    _ => {}
                }
            }
        }
        Rule::compare_tail => {
            for part in parts {
                match part.as_rule() {
                    Rule::compare_op => out.push(Expr::token(match part.as_str() {
                        "==" => "=",
                        op => op,
                    })),
                    Rule::value_expr => value_tokens(part, out)?,
                    _ => {}
                }
            }
        }
        rule => return Err(ParseError::Syntax(format!("Unexpected {:?} after operand", rule))),
    }
    Ok(())
}

/// Flat rendering of a value expression; groups keep their parenthesis markers
fn value_tokens(pair: Pair<Rule>, out: &mut Vec<Expr>) -> Result<(), ParseError> {
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::arith_op => out.push(Expr::token(part.as_str())),
            Rule::group => {
                out.push(Expr::token("("));
                expr_tokens(inner_first(part)?, out)?;
                out.push(Expr::token(")"));
            }
            _ => out.push(operand(part)?),
        }
    }
    Ok(())
}

/// A value expression or predicate as one node, wrapping multi-token results in `xpr`
fn single(pair: Pair<Rule>) -> Result<Expr, ParseError> {
    let mut tokens = Vec::new();
    match pair.as_rule() {
        Rule::value_expr => {
            let parts: Vec<Pair<Rule>> = pair.into_inner().collect();
            if let [only] = parts.as_slice() {
                return operand(only.clone());
            }
            for part in parts {
                match part.as_rule() {
                    Rule::arith_op => tokens.push(Expr::token(part.as_str())),
                    _ => tokens.push(operand(part)?),
                }
            }
        }
        Rule::expr => expr_tokens(pair, &mut tokens)?,
        rule => return Err(ParseError::Syntax(format!("Unexpected {:?} as value", rule))),
    }
    if tokens.len() == 1 {
        Ok(tokens.remove(0))
    } else {
        Ok(Expr::xpr(tokens))
    }
}

fn operand(pair: Pair<Rule>) -> Result<Expr, ParseError> {
    match pair.as_rule() {
        Rule::group => {
            let mut tokens = Vec::new();
            expr_tokens(inner_first(pair)?, &mut tokens)?;
            if tokens.len() == 1 {
                Ok(tokens.remove(0))
            } else {
                Ok(Expr::xpr(tokens))
            }
        }
        Rule::func_call => func_call(pair),
        Rule::literal => literal(inner_first(pair)?),
        Rule::param => Ok(Expr::Param(Param::positional())),
        Rule::named_param => Ok(Expr::Param(Param::named(pair.as_str().trim_start_matches(':')))),
        Rule::reference => Ok(Expr::Ref(Ref::new(pair.into_inner().map(ident_text)))),
        rule => Err(ParseError::Syntax(format!("Unexpected {:?} as operand", rule))),
    }
}

fn func_call(pair: Pair<Rule>) -> Result<Expr, ParseError> {
    let mut inner = pair.into_inner();
    let name = next(&mut inner, "function name")?.as_str().to_lowercase();

    let mut args = Vec::new();
    for arg in inner {
        let mut parts = arg.into_inner();
        let first = next(&mut parts, "function argument")?;
        match first.as_rule() {
            Rule::star => args.push(Expr::token("*")),
            Rule::kw_distinct => {
                let mut tokens = vec![Expr::token("distinct")];
                expr_tokens(next(&mut parts, "distinct argument")?, &mut tokens)?;
                args.push(Expr::xpr(tokens));
            }
            _ => args.push(single(first)?),
        }
    }
    Ok(Expr::func(name, args))
}

fn literal(pair: Pair<Rule>) -> Result<Expr, ParseError> {
    let text = pair.as_str();
    let value = match pair.as_rule() {
        Rule::number => {
            if text.contains(['.', 'e', 'E']) {
                text.parse::<f64>()
                    .map(Value::Float)
                    .map_err(|e| ParseError::Syntax(format!("Invalid number {}: {}", text, e)))?
            } else {
                match text.parse::<i64>() {
                    Ok(i) => Value::Int(i),
                    Err(_) => text
                        .parse::<f64>()
                        .map(Value::Float)
                        .map_err(|e| ParseError::Syntax(format!("Invalid number {}: {}", text, e)))?,
                }
            }
        }
        Rule::string => Value::String(text[1..text.len() - 1].replace("''", "'")),
        Rule::kw_true => Value::Bool(true),
        Rule::kw_false => Value::Bool(false),
        Rule::kw_null => Value::Null,
        rule => return Err(ParseError::Syntax(format!("Invalid literal {:?}", rule))),
    };
    Ok(Expr::val(value))
}

fn ident_text(pair: Pair<Rule>) -> String {
    let text = pair.as_str();
    match pair.as_rule() {
        Rule::quoted_ident => text[1..text.len() - 1].replace("\"\"", "\""),
        _ => text.to_string(),
    }
}

fn inner_first(pair: Pair<Rule>) -> Result<Pair<Rule>, ParseError> {
    let rule = pair.as_rule();
    pair.into_inner()
        .next()
        .ok_or_else(|| ParseError::Syntax(format!("Empty {:?}", rule)))
}

fn next<'i>(pairs: &mut Pairs<'i, Rule>, what: &str) -> Result<Pair<'i, Rule>, ParseError> {
    pairs.next().ok_or_else(|| ParseError::Syntax(format!("Missing {}", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str) -> Expr {
        Expr::column(name)
    }

    #[test]
    fn test_simple_comparison() {
        let tokens = parse_condition("ID = 1").unwrap();
        assert_eq!(tokens, vec![col("ID"), Expr::token("="), Expr::val(1)]);
    }

    #[test]
    fn test_keywords_are_lowercased() {
        let tokens = parse_condition("a > 1 AND NOT b LIKE 'x%'").unwrap();
        assert_eq!(
            tokens,
            vec![
                col("a"),
                Expr::token(">"),
                Expr::val(1),
                Expr::token("and"),
                Expr::token("not"),
                col("b"),
                Expr::token("like"),
                Expr::val("x%"),
            ]
        );
    }

    #[test]
    fn test_groups_keep_parentheses() {
        let tokens = parse_condition("name like ? and ( ratio between ? and ? or ratio > ? )").unwrap();
        let rendered: Vec<String> = tokens
            .iter()
            .map(|t| match t {
                Expr::Token(t) => t.clone(),
                Expr::Param(_) => "?".into(),
                Expr::Ref(r) => r.last().unwrap_or_default().to_string(),
                other => format!("{:?}", other),
            })
            .collect();
        assert_eq!(
            rendered.join(" "),
            "name like ? and ( ratio between ? and ? or ratio > ? )"
        );
    }

    #[test]
    fn test_in_list_and_null_tests() {
        let tokens = parse_condition("ID not in (1, 2) or x is not null").unwrap();
        assert_eq!(tokens[1], Expr::token("not in"));
        assert_eq!(tokens[2], Expr::list(vec![Expr::val(1), Expr::val(2)]));
        assert_eq!(&tokens[4..], &[col("x"), Expr::token("is not"), Expr::null()]);
    }

    #[test]
    fn test_named_placeholder_and_exists() {
        let tokens = parse_condition("exists :__subquery_1").unwrap();
        assert_eq!(tokens, vec![Expr::token("exists"), Expr::Param(Param::named("__subquery_1"))]);
    }

    #[test]
    fn test_identifiers_starting_with_keywords() {
        let tokens = parse_condition("order_no = 1 and notes = 'x' and index = 2").unwrap();
        assert_eq!(tokens[0], col("order_no"));
        assert_eq!(tokens[4], col("notes"));
        assert_eq!(tokens[8], col("index"));
    }

    #[test]
    fn test_parse_column_forms() {
        assert_eq!(parse_column("title").unwrap(), col("title"));
        assert_eq!(
            parse_column("count(1) as total").unwrap(),
            Expr::func("count", vec![Expr::val(1)]).with_alias("total")
        );
        assert_eq!(parse_column("author.{name}").unwrap(), Expr::reference(["author", "name"]));
        assert_eq!(parse_column("*").unwrap(), Expr::token("*"));
        assert_eq!(
            parse_column("COUNT(distinct price)").unwrap(),
            Expr::func("count", vec![Expr::xpr(vec![Expr::token("distinct"), col("price")])])
        );
    }

    #[test]
    fn test_inline_path_keeps_braces_in_strings() {
        assert_eq!(
            parse_column("concat(author.{name}, '}')").unwrap(),
            Expr::func("concat", vec![Expr::reference(["author", "name"]), Expr::val("}")])
        );
        assert_eq!(parse_column("author.{ address.{city} }").unwrap(), Expr::reference(["author", "address", "city"]));
    }

    #[test]
    fn test_inline_path_with_several_columns_is_rejected() {
        assert!(matches!(parse_column("author.{name, ID}"), Err(ParseError::Syntax(_))));
        assert!(matches!(parse_column("author.{name"), Err(ParseError::Syntax(_))));
    }

    #[test]
    fn test_parse_order_item() {
        let (expr, sort) = parse_order_item("lower(title) desc").unwrap();
        assert_eq!(expr, Expr::func("lower", vec![col("title")]));
        assert_eq!(sort, Some(Sort::Desc));
    }

    #[test]
    fn test_parse_path_with_filters() {
        let r = parse_path("CatalogService.Authors[ID=1]:books[ID=2 and title='x''y'].reviews as R").unwrap();
        assert_eq!(r.alias.as_deref(), Some("R"));
        assert_eq!(r.path.len(), 3);
        assert_eq!(r.path[0].name(), "CatalogService.Authors");
        let Segment::Filtered { where_, .. } = &r.path[1] else { panic!("expected filter") };
        assert_eq!(where_[6], Expr::val("x'y"));
        assert_eq!(r.path[2], Segment::Name("reviews".into()));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_condition("a = = 1").is_err());
        assert!(parse_condition("(a = 1").is_err());
        assert!(parse_column("title; drop table x").is_err());
    }
}
