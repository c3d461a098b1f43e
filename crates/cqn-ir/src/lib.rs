//! Canonical query tree (CQN)
//!
//! Protocol-agnostic representation of SELECT/INSERT/UPDATE/DELETE shared by
//! the OData front-end, the fluent builder and the SQL compiler.
//! All types serialize deterministically so trees can be fingerprinted.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

mod expr;
pub use expr::*;

/// Largest row count the OData layer sends when no `$top` is given
pub const MAX_ROWS: i64 = 9_007_199_254_740_991;

/// Prefix `^`, `_` and `%` with the `^` escape character of LIKE patterns
pub fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '^' | '_' | '%') {
            out.push('^');
        }
        out.push(c);
    }
    out
}

/// Top-level statement; exactly one kind is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Query {
    #[serde(rename = "SELECT")]
    Select(Select),
    #[serde(rename = "INSERT")]
    Insert(Insert),
    #[serde(rename = "UPDATE")]
    Update(Update),
    #[serde(rename = "DELETE")]
    Delete(Delete),
}

impl Query {
    /// SHA-256 over the canonical JSON form
    pub fn fingerprint(&self) -> String {
        // Serializing plain data with string keys cannot fail.
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Query::Select(_) => "SELECT",
            Query::Insert(_) => "INSERT",
            Query::Update(_) => "UPDATE",
            Query::Delete(_) => "DELETE",
        }
    }

    pub fn as_select(&self) -> Option<&Select> {
        match self {
            Query::Select(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Select> for Query {
    fn from(s: Select) -> Self {
        Query::Select(s)
    }
}

impl From<Insert> for Query {
    fn from(i: Insert) -> Self {
        Query::Insert(i)
    }
}

impl From<Update> for Query {
    fn from(u: Update) -> Self {
        Query::Update(u)
    }
}

impl From<Delete> for Query {
    fn from(d: Delete) -> Self {
        Query::Delete(d)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Select {
    pub from: Source,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<Expr>,

    #[serde(rename = "where", default, skip_serializing_if = "Vec::is_empty")]
    pub where_: Vec<Expr>,

    #[serde(rename = "groupBy", default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<Expr>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub having: Vec<Expr>,

    #[serde(rename = "orderBy", default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<Expr>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub distinct: bool,

    /// Single-row result, rendered as `LIMIT 1` when no limit is set
    #[serde(default, skip_serializing_if = "is_false")]
    pub one: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Limit>,

    #[serde(rename = "forUpdate", default, skip_serializing_if = "Option::is_none")]
    pub for_update: Option<ForUpdate>,
}

impl Select {
    pub fn new(from: Source) -> Self {
        Self {
            from,
            columns: Vec::new(),
            where_: Vec::new(),
            group_by: Vec::new(),
            having: Vec::new(),
            order_by: Vec::new(),
            distinct: false,
            one: false,
            limit: None,
            for_update: None,
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    pub rows: Expr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<Expr>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForUpdate {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub of: Vec<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<u64>,
}

/// FROM clause source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Source {
    Join(Join),
    Set(SetQuery),
    Select(SubSelect),
    Ref(Ref),
}

impl Source {
    pub fn entity(name: impl Into<String>) -> Self {
        Source::Ref(Ref::new([name.into()]))
    }

    pub fn alias(&self) -> Option<&str> {
        match self {
            Source::Ref(r) => r.alias.as_deref(),
            Source::Select(s) => s.alias.as_deref(),
            Source::Set(s) => s.alias.as_deref(),
            Source::Join(_) => None,
        }
    }

    /// Names by which columns of this source may be qualified
    pub fn table_names(&self) -> Vec<String> {
        match self {
            Source::Ref(r) => {
                let mut names: Vec<String> = r.first().map(str::to_string).into_iter().collect();
                names.extend(r.alias.clone());
                names
            }
            Source::Join(j) => j.args.iter().flat_map(Source::table_names).collect(),
            Source::Select(_) | Source::Set(_) => self.alias().map(str::to_string).into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    pub fn keyword(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER",
            JoinKind::Left => "LEFT",
            JoinKind::Right => "RIGHT",
            JoinKind::Full => "FULL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub join: JoinKind,
    pub args: Vec<Source>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetOp {
    Union,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetBody {
    pub op: SetOp,
    #[serde(default, skip_serializing_if = "is_false")]
    pub all: bool,
    pub args: Vec<SubSelect>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetQuery {
    #[serde(rename = "SET")]
    pub set: SetBody,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// One inserted row keyed by column name
pub type Entry = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insert {
    pub into: Ref,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<Entry>,

    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_select: Option<SubSelect>,
}

impl Insert {
    pub fn new(into: Ref) -> Self {
        Self {
            into,
            columns: Vec::new(),
            rows: Vec::new(),
            values: Vec::new(),
            entries: Vec::new(),
            as_select: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub entity: Ref,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, Value>,

    /// Computed assignments such as `stock = stock - 1`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, Expr>,

    #[serde(rename = "where", default, skip_serializing_if = "Vec::is_empty")]
    pub where_: Vec<Expr>,
}

impl Update {
    pub fn new(entity: Ref) -> Self {
        Self { entity, data: BTreeMap::new(), with: BTreeMap::new(), where_: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delete {
    pub from: Ref,
    #[serde(rename = "where", default, skip_serializing_if = "Vec::is_empty")]
    pub where_: Vec<Expr>,
}

impl Delete {
    pub fn new(from: Ref) -> Self {
        Self { from, where_: Vec::new() }
    }
}
