//! Predicate arguments and their reduction to tokens
//!
//! Predicate methods accept four call shapes. [`classify`] decides which one a
//! call uses; object and positional shapes are then rewritten into fluid
//! fragments, so every shape ends up in the same grammar via [`reduce`].

use cqn_ir::{Expr, Ref, Segment, Select, Source, Value};
use cqn_model::{Entity, Model};

use crate::parser;
use crate::BuildError;

/// Name prefix of the placeholders standing in for sub-select operands
const SUBQUERY_PREFIX: &str = "__subquery_";

/// Operators accepted by the positional `(ref, op, value[, value2])` shape
const OPERATIONS: &[&str] = &[
    "=", ">", "<", "!=", "<>", ">=", "<=", "like", "not like", "between", "in", "not in",
];

/// A dynamically shaped argument to a predicate method
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Arg>),
    /// Object predicate; keys keep their insertion order
    Object(Vec<(String, Arg)>),
    /// A pre-built tree node such as `{ref}` or `{func}`
    Expr(Expr),
    /// A pre-built token stream
    Tokens(Vec<Expr>),
    Query(Box<Select>),
}

impl Arg {
    fn is_scalar(&self) -> bool {
        matches!(self, Arg::Null | Arg::Bool(_) | Arg::Int(_) | Arg::Float(_) | Arg::Str(_))
    }

    pub fn array<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Arg>,
    {
        Arg::Array(items.into_iter().map(Into::into).collect())
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg::Str(s.clone())
    }
}

impl From<bool> for Arg {
    fn from(b: bool) -> Self {
        Arg::Bool(b)
    }
}

impl From<i32> for Arg {
    fn from(i: i32) -> Self {
        Arg::Int(i as i64)
    }
}

impl From<i64> for Arg {
    fn from(i: i64) -> Self {
        Arg::Int(i)
    }
}

impl From<u64> for Arg {
    fn from(i: u64) -> Self {
        i64::try_from(i).map(Arg::Int).unwrap_or(Arg::Float(i as f64))
    }
}

impl From<f64> for Arg {
    fn from(f: f64) -> Self {
        Arg::Float(f)
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => Arg::Null,
            Value::Bool(b) => Arg::Bool(b),
            Value::Int(i) => Arg::Int(i),
            Value::Float(f) => Arg::Float(f),
            Value::String(s) => Arg::Str(s),
        }
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Arg::Null)
    }
}

impl From<Expr> for Arg {
    fn from(e: Expr) -> Self {
        Arg::Expr(e)
    }
}

impl From<Vec<Expr>> for Arg {
    fn from(tokens: Vec<Expr>) -> Self {
        Arg::Tokens(tokens)
    }
}

impl From<Vec<Arg>> for Arg {
    fn from(items: Vec<Arg>) -> Self {
        Arg::Array(items)
    }
}

impl From<Vec<Value>> for Arg {
    fn from(items: Vec<Value>) -> Self {
        Arg::array(items)
    }
}

impl From<Vec<i64>> for Arg {
    fn from(items: Vec<i64>) -> Self {
        Arg::array(items)
    }
}

impl From<Vec<&str>> for Arg {
    fn from(items: Vec<&str>) -> Self {
        Arg::array(items)
    }
}

impl From<Select> for Arg {
    fn from(s: Select) -> Self {
        Arg::Query(Box::new(s))
    }
}

/// Build a `Vec<Arg>` from heterogeneous values
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::Arg::from($arg)),*]
    };
}

/// Build an object predicate, keys in the given order
#[macro_export]
macro_rules! obj {
    ($($key:expr => $value:expr),* $(,)?) => {
        $crate::Arg::Object(vec![$(($key.to_string(), $crate::Arg::from($value))),*])
    };
}

/// The call shape a predicate method was invoked with
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Predicate {
    Tokens(Vec<Expr>),
    Object(Vec<(String, Arg)>),
    Simple { reference: String, op: String, value: Arg, upper: Option<Arg> },
    Fluid(Vec<Arg>),
}

impl Predicate {
    /// Whether the reduced tokens need parentheses when appended to a non-empty clause
    pub(crate) fn wraps(&self) -> bool {
        match self {
            Predicate::Tokens(_) | Predicate::Fluid(_) => true,
            Predicate::Object(entries) => entries.iter().any(|(k, _)| k.eq_ignore_ascii_case("or")),
            Predicate::Simple { .. } => false,
        }
    }
}

/// Decide the call shape of a predicate argument list
pub(crate) fn classify(mut args: Vec<Arg>) -> Result<Predicate, BuildError> {
    if args.is_empty() {
        return Err(BuildError::invalid("missing predicate arguments"));
    }

    if args.len() == 1 {
        return match args.remove(0) {
            Arg::Tokens(tokens) if tokens.is_empty() => Err(BuildError::invalid("empty token array")),
            Arg::Tokens(tokens) => Ok(Predicate::Tokens(tokens)),
            Arg::Array(items) if items.is_empty() => Err(BuildError::invalid("empty token array")),
            Arg::Array(items) => Ok(Predicate::Tokens(
                items.into_iter().map(token_from_arg).collect::<Result<_, _>>()?,
            )),
            Arg::Object(entries) => Ok(Predicate::Object(entries)),
            Arg::Expr(expr) => Ok(Predicate::Tokens(vec![expr])),
            Arg::Str(text) => Ok(Predicate::Fluid(vec![Arg::Str(text)])),
            other => Err(BuildError::invalid(format!("unsupported predicate {:?}", other))),
        };
    }

    if is_simple(&args) {
        let mut it = args.into_iter();
        if let (Some(Arg::Str(reference)), Some(Arg::Str(op)), Some(value)) = (it.next(), it.next(), it.next()) {
            return Ok(Predicate::Simple { reference, op: op.to_lowercase(), value, upper: it.next() });
        }
        return Err(BuildError::invalid("malformed positional predicate"));
    }

    Ok(Predicate::Fluid(args))
}

fn is_simple(args: &[Arg]) -> bool {
    if args.len() != 3 && args.len() != 4 {
        return false;
    }
    let reference = matches!(&args[0], Arg::Str(s) if !s.contains('('));
    let op = match &args[1] {
        Arg::Str(op) => OPERATIONS.contains(&op.to_lowercase().trim()),
        _ => false,
    };
    let between = matches!(&args[1], Arg::Str(op) if op.eq_ignore_ascii_case("between"));
    let value = args[2].is_scalar() || matches!(args[2], Arg::Array(_) | Arg::Query(_) | Arg::Expr(_));
    let upper = match args.get(3) {
        None => !between,
        Some(upper) => between && (upper.is_scalar() || matches!(upper, Arg::Expr(_))),
    };
    reference && op && value && upper
}

fn token_from_arg(arg: Arg) -> Result<Expr, BuildError> {
    match arg {
        Arg::Str(s) => Ok(Expr::Token(s)),
        Arg::Expr(e) => Ok(e),
        Arg::Query(q) => Ok(Expr::select(*q)),
        Arg::Null => Ok(Expr::null()),
        Arg::Bool(b) => Ok(Expr::val(b)),
        Arg::Int(i) => Ok(Expr::val(i)),
        Arg::Float(f) => Ok(Expr::val(f)),
        other => Err(BuildError::invalid(format!("unsupported token {:?}", other))),
    }
}

/// What references are resolved against
#[derive(Debug, Clone, Default)]
pub(crate) struct Context<'m> {
    pub tables: Vec<String>,
    pub entity: Option<&'m Entity>,
}

impl<'m> Context<'m> {
    pub(crate) fn new(source: &Source, model: Option<&'m Model>) -> Self {
        let entity = match (model, first_entity(source)) {
            (Some(model), Some(name)) => model.find(&name),
            _ => None,
        };
        Self { tables: source.table_names(), entity }
    }

    pub(crate) fn for_ref(target: &Ref, model: Option<&'m Model>) -> Self {
        Self::new(&Source::Ref(target.clone()), model)
    }

    /// `table.column` stays qualified for known tables, `assoc.x` stays a path,
    /// anything else names one flattened element
    pub(crate) fn resolve(&self, mut r: Ref) -> Ref {
        if r.path.len() < 2 || r.path.iter().any(Segment::is_filtered) {
            return r;
        }
        let first = r.path[0].name();
        if self.tables.iter().any(|t| t == first) {
            return r;
        }
        if self.entity.map(|e| e.is_association(first)).unwrap_or(false) {
            return r;
        }
        let joined = r.path.iter().map(Segment::name).collect::<Vec<_>>().join(".");
        r.path = vec![Segment::Name(joined)];
        r
    }

    /// A string value naming `table.column` of a known table becomes a reference
    fn qualified_column(&self, text: &str) -> Option<Expr> {
        let (first, rest) = text.split_once('.')?;
        let is_name = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !is_name(first) || !rest.split('.').all(is_name) {
            return None;
        }
        let known_table = self.tables.iter().any(|t| t == first);
        let association = self.entity.map(|e| e.is_association(first)).unwrap_or(false);
        if known_table || association {
            Some(Expr::reference(text.split('.').map(str::to_string)))
        } else {
            None
        }
    }
}

fn first_entity(source: &Source) -> Option<String> {
    match source {
        Source::Ref(r) => r.last().map(str::to_string),
        Source::Join(j) => j.args.first().and_then(first_entity),
        Source::Select(_) | Source::Set(_) => None,
    }
}

/// A piece of the fluid pseudo-query
#[derive(Debug, Clone, PartialEq)]
enum Part {
    Text(String),
    Bind(Arg),
}

/// Reduce a classified predicate to canonical tokens
pub(crate) fn reduce(predicate: Predicate, ctx: &Context) -> Result<Vec<Expr>, BuildError> {
    let parts = match predicate {
        Predicate::Tokens(tokens) => return Ok(tokens),
        Predicate::Object(entries) => {
            let mut parts = Vec::new();
            object_parts(&entries, false, ctx, &mut parts)?;
            parts
        }
        Predicate::Simple { reference, op, value, upper } => simple_parts(&reference, &op, value, upper, ctx)?,
        Predicate::Fluid(args) => fluid_parts(args)?,
    };
    tokens_from_parts(parts, ctx)
}

fn fluid_parts(args: Vec<Arg>) -> Result<Vec<Part>, BuildError> {
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| match (i % 2, arg) {
            (0, Arg::Str(text)) => Ok(Part::Text(text)),
            (0, other) => Err(BuildError::invalid(format!("expected a query fragment, found {:?}", other))),
            (_, value) => Ok(Part::Bind(value)),
        })
        .collect()
}

fn simple_parts(reference: &str, op: &str, value: Arg, upper: Option<Arg>, ctx: &Context) -> Result<Vec<Part>, BuildError> {
    let reference = checked_reference(reference)?;
    let mut parts = vec![Part::Text(format!("{} {}", reference, op)), Part::Bind(value_arg(value, ctx)?)];
    if op == "between" {
        let upper = upper.ok_or_else(|| BuildError::invalid("between needs two values"))?;
        parts.push(Part::Text("and".into()));
        parts.push(Part::Bind(value_arg(upper, ctx)?));
    }
    Ok(parts)
}

/// Keys of object predicates and positional references must be a single reference or function
fn checked_reference(text: &str) -> Result<&str, BuildError> {
    match parser::parse_operand(text)? {
        Expr::Ref(_) | Expr::Func(_) => Ok(text),
        _ => Err(BuildError::invalid(format!("{} is not a reference", text))),
    }
}

/// Values of the object and positional shapes bind as-is, except `table.column` strings
fn value_arg(value: Arg, ctx: &Context) -> Result<Arg, BuildError> {
    Ok(match value {
        Arg::Str(s) => Arg::Expr(ctx.qualified_column(&s).unwrap_or_else(|| Expr::val(s))),
        Arg::Null => Arg::Expr(Expr::null()),
        Arg::Bool(b) => Arg::Expr(Expr::val(b)),
        Arg::Int(i) => Arg::Expr(Expr::val(i)),
        Arg::Float(f) => Arg::Expr(Expr::val(f)),
        Arg::Array(items) => Arg::Expr(Expr::list(
            items.into_iter().map(|i| list_item(i, false)).collect::<Result<_, _>>()?,
        )),
        Arg::Object(_) => return Err(BuildError::invalid("nested object is not a value")),
        other @ (Arg::Expr(_) | Arg::Tokens(_) | Arg::Query(_)) => other,
    })
}

fn object_parts(entries: &[(String, Arg)], in_and: bool, ctx: &Context, out: &mut Vec<Part>) -> Result<(), BuildError> {
    if entries.is_empty() {
        return Err(BuildError::invalid("empty object predicate"));
    }

    let mut parts = Vec::new();
    let last = entries.len() - 1;
    for (i, (key, value)) in entries.iter().enumerate() {
        let lowered = key.to_lowercase();
        match lowered.as_str() {
            "and" | "or" => match value {
                Arg::Array(items) => connective_array(&lowered, items, entries.len() == 1, ctx, &mut parts)?,
                Arg::Object(inner) => connective_object(&lowered, inner, i == last, ctx, &mut parts)?,
                _ => return Err(BuildError::invalid(format!("{} expects an array or object", key))),
            },
            "exists" | "not exists" => {
                add_logic_operator(&mut parts);
                parts.push(Part::Text(lowered.clone()));
                parts.push(Part::Bind(value.clone()));
            }
            _ => {
                add_logic_operator(&mut parts);
                match value {
                    Arg::Object(ops) => nested_parts(key, ops, ctx, &mut parts)?,
                    Arg::Array(_) | Arg::Query(_) => parts.extend(simple_parts(key, "in", value.clone(), None, ctx)?),
                    _ => parts.extend(simple_parts(key, "=", value.clone(), None, ctx)?),
                }
            }
        }
    }

    let has_or = entries.iter().any(|(k, _)| k.eq_ignore_ascii_case("or"));
    if in_and && has_or {
        out.push(Part::Text("(".into()));
        out.extend(parts);
        out.push(Part::Text(")".into()));
    } else {
        out.extend(parts);
    }
    Ok(())
}

/// `{or: [{a: 1}, {b: 2}]}`
fn connective_array(op: &str, items: &[Arg], is_only: bool, ctx: &Context, out: &mut Vec<Part>) -> Result<(), BuildError> {
    if items.is_empty() {
        return Err(BuildError::invalid(format!("empty {} array", op)));
    }
    add_logic_operator(out);
    let wrap = op == "or" && !is_only;
    if wrap {
        out.push(Part::Text("(".into()));
    }
    for (i, item) in items.iter().enumerate() {
        let Arg::Object(entries) = item else {
            return Err(BuildError::invalid(format!("{} array expects objects", op)));
        };
        if i > 0 {
            out.push(Part::Text(op.to_string()));
        }
        let nested = entries
            .first()
            .map(|(k, _)| k.eq_ignore_ascii_case("and") || k.eq_ignore_ascii_case("or"))
            .unwrap_or(false);
        if i > 0 && nested {
            out.push(Part::Text("(".into()));
            object_parts(entries, false, ctx, out)?;
            out.push(Part::Text(")".into()));
        } else {
            object_parts(entries, false, ctx, out)?;
        }
    }
    if wrap {
        out.push(Part::Text(")".into()));
    }
    Ok(())
}

/// `{a: 1, or: {b: 2}}`
fn connective_object(op: &str, inner: &[(String, Arg)], is_last: bool, ctx: &Context, out: &mut Vec<Part>) -> Result<(), BuildError> {
    if out.is_empty() {
        return object_parts(inner, op == "and", ctx, out);
    }
    if op == "or" && !is_last {
        out.insert(0, Part::Text("(".into()));
        out.push(Part::Text(op.to_string()));
        object_parts(inner, false, ctx, out)?;
        out.push(Part::Text(")".into()));
    } else {
        out.push(Part::Text(op.to_string()));
        object_parts(inner, op == "and", ctx, out)?;
    }
    Ok(())
}

/// `{price: {'>': 10}}` or `{price: {between: 10, and: 20}}`
fn nested_parts(key: &str, ops: &[(String, Arg)], ctx: &Context, out: &mut Vec<Part>) -> Result<(), BuildError> {
    match ops {
        [(op, value)] => {
            let op = op.to_lowercase();
            if !OPERATIONS.contains(&op.as_str()) || op == "between" {
                return Err(BuildError::invalid(format!("unsupported operator {} for {}", op, key)));
            }
            out.extend(simple_parts(key, &op, value.clone(), None, ctx)?);
        }
        [(op, lower), (_, upper)] if op.eq_ignore_ascii_case("between") => {
            out.extend(simple_parts(key, "between", lower.clone(), Some(upper.clone()), ctx)?);
        }
        _ => return Err(BuildError::invalid(format!("cannot build a comparison for {}", key))),
    }
    Ok(())
}

fn add_logic_operator(parts: &mut Vec<Part>) {
    let needs_operator = match parts.last() {
        None => false,
        Some(Part::Text(t)) => !matches!(t.trim().to_lowercase().as_str(), "and" | "or" | "("),
        Some(Part::Bind(_)) => true,
    };
    if needs_operator {
        parts.push(Part::Text("and".into()));
    }
}

/// Concatenate fragments with placeholders, parse once, then substitute by position
fn tokens_from_parts(parts: Vec<Part>, ctx: &Context) -> Result<Vec<Expr>, BuildError> {
    let mut text = String::new();
    let mut binds = Vec::new();
    let mut subqueries = Vec::new();

    for part in parts {
        match part {
            Part::Text(fragment) => text.push_str(&fragment),
            Part::Bind(Arg::Query(select)) => {
                subqueries.push(*select);
                text.push_str(&format!(" :{}{}", SUBQUERY_PREFIX, subqueries.len()));
            }
            Part::Bind(value) => {
                binds.push(value);
                text.push_str(" ?");
            }
        }
        text.push(' ');
    }

    let tokens = parser::parse_condition(text.trim())?;
    let mut substitution = Substitution { binds: binds.into_iter(), subqueries, ctx };
    let tokens = substitution.tokens(tokens)?;
    if substitution.binds.next().is_some() {
        return Err(BuildError::invalid("more values than placeholders"));
    }
    Ok(tokens)
}

struct Substitution<'a, 'm> {
    binds: std::vec::IntoIter<Arg>,
    subqueries: Vec<Select>,
    ctx: &'a Context<'m>,
}

impl Substitution<'_, '_> {
    fn tokens(&mut self, tokens: Vec<Expr>) -> Result<Vec<Expr>, BuildError> {
        tokens.into_iter().map(|t| self.expr(t)).collect()
    }

    fn expr(&mut self, expr: Expr) -> Result<Expr, BuildError> {
        Ok(match expr {
            Expr::Param(param) => match param.name() {
                None => {
                    let value = self.binds.next().ok_or_else(|| BuildError::invalid("fewer values than placeholders"))?;
                    fluid_value(value)?
                }
                Some(name) => {
                    let index = name
                        .strip_prefix(SUBQUERY_PREFIX)
                        .and_then(|n| n.parse::<usize>().ok())
                        .ok_or_else(|| BuildError::invalid(format!("unknown parameter :{}", name)))?;
                    let select = self
                        .subqueries
                        .get(index.wrapping_sub(1))
                        .cloned()
                        .ok_or_else(|| BuildError::invalid(format!("unknown parameter :{}", name)))?;
                    Expr::select(select)
                }
            },
            Expr::Ref(r) => Expr::Ref(self.ctx.resolve(r)),
            Expr::Func(mut f) => {
                f.args = self.tokens(f.args)?;
                Expr::Func(f)
            }
            Expr::Xpr(mut x) => {
                x.xpr = self.tokens(x.xpr)?;
                Expr::Xpr(x)
            }
            Expr::List(l) => {
                let mut items = self.tokens(l.list)?;
                // `in (?)` bound to an array
                if let [Expr::List(_)] = items.as_slice() {
                    return Ok(items.remove(0));
                }
                Expr::list(items)
            }
            other => other,
        })
    }
}

/// A value bound through a fluid placeholder
fn fluid_value(value: Arg) -> Result<Expr, BuildError> {
    match value {
        Arg::Array(items) => Ok(Expr::list(
            items.into_iter().map(|i| list_item(i, true)).collect::<Result<_, _>>()?,
        )),
        Arg::Str(s) => Ok(Expr::val(unquote(s))),
        Arg::Tokens(tokens) => Ok(Expr::xpr(tokens)),
        Arg::Expr(e) => Ok(e),
        Arg::Query(q) => Ok(Expr::select(*q)),
        Arg::Object(_) => Err(BuildError::invalid("an object cannot be bound as a value")),
        scalar => list_item(scalar, true),
    }
}

fn list_item(item: Arg, fluid: bool) -> Result<Expr, BuildError> {
    match item {
        Arg::Null => Ok(Expr::null()),
        Arg::Bool(b) => Ok(Expr::val(b)),
        Arg::Int(i) => Ok(Expr::val(i)),
        Arg::Float(f) => Ok(Expr::val(f)),
        Arg::Str(s) if fluid && s == "true" => Ok(Expr::val(true)),
        Arg::Str(s) if fluid && s == "false" => Ok(Expr::val(false)),
        Arg::Str(s) if fluid => Ok(Expr::val(unquote(s))),
        Arg::Str(s) => Ok(Expr::val(s)),
        Arg::Expr(e) => Ok(e),
        other => Err(BuildError::invalid(format!("unsupported list element {:?}", other))),
    }
}

/// `'abc'` binds as `abc`
fn unquote(s: String) -> String {
    if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        s[1..s.len() - 1].to_string()
    } else {
        s
    }
}
