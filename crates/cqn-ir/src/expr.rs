//! Expression nodes of the canonical query tree

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Limit, Select};

/// Scalar literal carried by `{val: ...}` nodes and bound as a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        i64::try_from(v).map(Value::Int).unwrap_or(Value::Float(v as f64))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sort {
    Asc,
    Desc,
}

impl Sort {
    pub fn keyword(self) -> &'static str {
        match self {
            Sort::Asc => "ASC",
            Sort::Desc => "DESC",
        }
    }
}

/// One step of a reference path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segment {
    Name(String),
    /// A step narrowed by a predicate, e.g. the key filter of `Books[ID=1]`
    Filtered {
        id: String,
        #[serde(rename = "where")]
        where_: Vec<Expr>,
    },
}

impl Segment {
    pub fn name(&self) -> &str {
        match self {
            Segment::Name(name) => name,
            Segment::Filtered { id, .. } => id,
        }
    }

    pub fn is_filtered(&self) -> bool {
        matches!(self, Segment::Filtered { .. })
    }
}

impl From<&str> for Segment {
    fn from(name: &str) -> Self {
        Segment::Name(name.to_string())
    }
}

impl From<String> for Segment {
    fn from(name: String) -> Self {
        Segment::Name(name)
    }
}

/// `{ref: [...]}`; also carries the expand shape `{ref:[nav], expand:[...]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ref {
    #[serde(rename = "ref")]
    pub path: Vec<Segment>,

    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Sort>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand: Option<Vec<Expr>>,

    #[serde(rename = "where", default, skip_serializing_if = "Vec::is_empty")]
    pub where_: Vec<Expr>,

    #[serde(rename = "orderBy", default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<Expr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Box<Limit>>,
}

impl Ref {
    pub fn new<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Segment>,
    {
        Self {
            path: path.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Last path step, which names the projected column
    pub fn last(&self) -> Option<&str> {
        self.path.last().map(Segment::name)
    }

    pub fn first(&self) -> Option<&str> {
        self.path.first().map(Segment::name)
    }

    pub fn is_expand(&self) -> bool {
        self.expand.is_some()
    }
}

/// Unbound placeholder, `{ref: ['?'], param: true}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    #[serde(rename = "ref")]
    pub path: Vec<String>,
    pub param: bool,
}

impl Param {
    pub fn positional() -> Self {
        Self { path: vec!["?".to_string()], param: true }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { path: vec![name.into()], param: true }
    }

    /// Name of a named parameter, `None` for `?`
    pub fn name(&self) -> Option<&str> {
        match self.path.first().map(String::as_str) {
            Some("?") | None => None,
            Some(name) => Some(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Val {
    pub val: Value,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Func {
    pub func: String,
    #[serde(default)]
    pub args: Vec<Expr>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Sort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Xpr {
    pub xpr: Vec<Expr>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List {
    pub list: Vec<Expr>,
}

/// A nested select used as operand or source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubSelect {
    #[serde(rename = "SELECT")]
    pub select: Box<Select>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Direction when the sub-select is an order item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Sort>,
}

impl SubSelect {
    pub fn new(select: Select) -> Self {
        Self { select: Box::new(select), alias: None, sort: None }
    }
}

/// Expression node; variants are told apart by their shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expr {
    Param(Param),
    Ref(Ref),
    Val(Val),
    Func(Func),
    Xpr(Xpr),
    List(List),
    Select(SubSelect),
    /// Operator keyword or parenthesis marker
    Token(String),
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Ref(Ref::new([name.into()]))
    }

    pub fn reference<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Segment>,
    {
        Expr::Ref(Ref::new(path))
    }

    pub fn val(value: impl Into<Value>) -> Self {
        Expr::Val(Val { val: value.into(), alias: None })
    }

    pub fn null() -> Self {
        Expr::val(Value::Null)
    }

    pub fn token(token: impl Into<String>) -> Self {
        Expr::Token(token.into())
    }

    pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Func(Func { func: name.into(), args, alias: None, sort: None })
    }

    pub fn xpr(tokens: Vec<Expr>) -> Self {
        Expr::Xpr(Xpr { xpr: tokens, alias: None })
    }

    pub fn list(items: Vec<Expr>) -> Self {
        Expr::List(List { list: items })
    }

    pub fn select(select: Select) -> Self {
        Expr::Select(SubSelect::new(select))
    }

    pub fn is_token(&self, token: &str) -> bool {
        matches!(self, Expr::Token(t) if t.eq_ignore_ascii_case(token))
    }

    pub fn as_token(&self) -> Option<&str> {
        match self {
            Expr::Token(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Ref> {
        match self {
            Expr::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_val(&self) -> Option<&Value> {
        match self {
            Expr::Val(v) => Some(&v.val),
            _ => None,
        }
    }

    /// Explicit `as` alias, if any
    pub fn alias(&self) -> Option<&str> {
        match self {
            Expr::Ref(r) => r.alias.as_deref(),
            Expr::Val(v) => v.alias.as_deref(),
            Expr::Func(f) => f.alias.as_deref(),
            Expr::Xpr(x) => x.alias.as_deref(),
            Expr::Select(s) => s.alias.as_deref(),
            Expr::Param(_) | Expr::List(_) | Expr::Token(_) => None,
        }
    }

    /// Returns the node with `as` set; nodes without an alias slot are unchanged
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        let alias = Some(alias.into());
        match &mut self {
            Expr::Ref(r) => r.alias = alias,
            Expr::Val(v) => v.alias = alias,
            Expr::Func(f) => f.alias = alias,
            Expr::Xpr(x) => x.alias = alias,
            Expr::Select(s) => s.alias = alias,
            Expr::Param(_) | Expr::List(_) | Expr::Token(_) => {}
        }
        self
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        match &mut self {
            Expr::Ref(r) => r.sort = Some(sort),
            Expr::Func(f) => f.sort = Some(sort),
            Expr::Select(s) => s.sort = Some(sort),
            _ => {}
        }
        self
    }

    /// Name under which a column shows up in a result row
    pub fn output_name(&self) -> Option<&str> {
        self.alias().or_else(|| match self {
            Expr::Ref(r) => r.last(),
            _ => None,
        })
    }
}

impl From<Ref> for Expr {
    fn from(r: Ref) -> Self {
        Expr::Ref(r)
    }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Val(Val { val: v, alias: None })
    }
}
