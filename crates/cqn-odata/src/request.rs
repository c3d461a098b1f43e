//! Parsed wire requests as handed over by the protocol layer
//!
//! These types carry no parsing logic of their own: the protocol library
//! resolves URL text into segments and expression trees, and this crate only
//! consumes them. All of them deserialize from JSON so requests can be
//! replayed in tests and fed through the service facade.

use cqn_ir::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Read,
    Create,
    Update,
    Delete,
    /// Bound action or function call
    Invoke,
}

/// Kind of one resolved URL path segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SegmentKind {
    Entity,
    EntityCollection,
    NavigationToOne,
    NavigationToMany,
    PrimitiveProperty,
    ComplexProperty,
    Singleton,
    Count,
    Value,
    BoundAction,
    BoundFunction,
}

impl SegmentKind {
    pub fn is_navigation(self) -> bool {
        matches!(self, SegmentKind::NavigationToOne | SegmentKind::NavigationToMany)
    }

    pub fn is_collection(self) -> bool {
        matches!(self, SegmentKind::EntityCollection | SegmentKind::NavigationToMany)
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SegmentKind::Entity => "entity",
            SegmentKind::EntityCollection => "entity-collection",
            SegmentKind::NavigationToOne => "navigation-to-one",
            SegmentKind::NavigationToMany => "navigation-to-many",
            SegmentKind::PrimitiveProperty => "primitive-property",
            SegmentKind::ComplexProperty => "complex-property",
            SegmentKind::Singleton => "singleton",
            SegmentKind::Count => "count",
            SegmentKind::Value => "value",
            SegmentKind::BoundAction => "bound-action",
            SegmentKind::BoundFunction => "bound-function",
        };
        f.write_str(name)
    }
}

/// Declared primitive type of a literal, key or property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdmType {
    #[serde(rename = "Edm.Boolean")]
    Boolean,
    #[serde(rename = "Edm.Byte")]
    Byte,
    #[serde(rename = "Edm.SByte")]
    SByte,
    #[serde(rename = "Edm.Int16")]
    Int16,
    #[serde(rename = "Edm.Int32")]
    Int32,
    #[serde(rename = "Edm.Int64")]
    Int64,
    #[serde(rename = "Edm.Decimal")]
    Decimal,
    #[serde(rename = "Edm.Single")]
    Single,
    #[serde(rename = "Edm.Double")]
    Double,
    #[serde(rename = "Edm.String")]
    String,
    #[serde(rename = "Edm.Guid")]
    Guid,
    #[serde(rename = "Edm.Date")]
    Date,
    #[serde(rename = "Edm.TimeOfDay")]
    TimeOfDay,
    #[serde(rename = "Edm.DateTimeOffset")]
    DateTimeOffset,
    #[serde(rename = "Edm.Binary")]
    Binary,
    #[serde(rename = "Edm.Stream")]
    Stream,
    #[serde(other)]
    Other,
}

impl EdmType {
    pub fn is_integer(self) -> bool {
        matches!(self, EdmType::Byte | EdmType::SByte | EdmType::Int16 | EdmType::Int32 | EdmType::Int64)
    }

    pub fn is_fractional(self) -> bool {
        matches!(self, EdmType::Decimal | EdmType::Single | EdmType::Double)
    }

    /// Key values of these types are written into path text without quotes
    pub fn is_unquoted(self) -> bool {
        self == EdmType::Boolean || self.is_integer() || self.is_fractional()
    }
}

/// `name=text` of a key predicate such as `Books(ID=1)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPredicate {
    pub name: String,
    pub text: String,
    #[serde(rename = "type", default = "default_key_type")]
    pub type_: EdmType,
}

fn default_key_type() -> EdmType {
    EdmType::String
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Entity set, navigation property or property name
    pub name: String,
    /// Qualified entity name the segment resolves to
    #[serde(rename = "entityType", default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<KeyPredicate>,
    #[serde(rename = "propertyType", default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<EdmType>,
}

impl Segment {
    pub fn new(kind: SegmentKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            entity_type: None,
            keys: Vec::new(),
            property_type: None,
        }
    }

    pub fn entity_type(mut self, entity: impl Into<String>) -> Self {
        self.entity_type = Some(entity.into());
        self
    }

    pub fn key(mut self, name: impl Into<String>, text: impl Into<String>, type_: EdmType) -> Self {
        self.keys.push(KeyPredicate { name: name.into(), text: text.into(), type_ });
        self
    }

    pub fn property_type(mut self, type_: EdmType) -> Self {
        self.property_type = Some(type_);
        self
    }

    /// Segments that address entities rather than properties or `$count`
    pub fn addresses_entity(&self) -> bool {
        matches!(
            self.kind,
            SegmentKind::Entity
                | SegmentKind::EntityCollection
                | SegmentKind::NavigationToOne
                | SegmentKind::NavigationToMany
                | SegmentKind::Singleton
        )
    }
}

// ---------------------------------------------------------------------------
// Expressions of $filter, $orderby and $apply

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryOperator {
    And,
    Or,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Has,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BinaryOperator::And => "and",
            BinaryOperator::Or => "or",
            BinaryOperator::Eq => "eq",
            BinaryOperator::Ne => "ne",
            BinaryOperator::Gt => "gt",
            BinaryOperator::Ge => "ge",
            BinaryOperator::Lt => "lt",
            BinaryOperator::Le => "le",
            BinaryOperator::Has => "has",
            BinaryOperator::Add => "add",
            BinaryOperator::Sub => "sub",
            BinaryOperator::Mul => "mul",
            BinaryOperator::Div => "div",
            BinaryOperator::Mod => "mod",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnaryOperator {
    Not,
    Minus,
}

/// Built-in query functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Contains,
    StartsWith,
    EndsWith,
    Length,
    IndexOf,
    Substring,
    ToLower,
    ToUpper,
    Trim,
    Concat,
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    FractionalSeconds,
    TotalSeconds,
    Date,
    Time,
    TotalOffsetMinutes,
    MinDateTime,
    MaxDateTime,
    Now,
    Round,
    Floor,
    Ceiling,
    Cast,
    IsOf,
    MatchesPattern,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Serialized names are the protocol names.
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&name)
    }
}

/// One step of a member path such as `author/name` or `books/any(b: ...)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MemberSegment {
    Property { name: String },
    NavigationToOne { name: String },
    NavigationToMany { name: String },
    /// Lambda variable such as `b` in `books/any(b: b/stock gt 0)`
    Variable { name: String },
    Any {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expression: Option<Box<Expression>>,
    },
    All {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expression: Option<Box<Expression>>,
    },
    Count,
}

impl MemberSegment {
    pub fn name(&self) -> Option<&str> {
        match self {
            MemberSegment::Property { name }
            | MemberSegment::NavigationToOne { name }
            | MemberSegment::NavigationToMany { name }
            | MemberSegment::Variable { name } => Some(name),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            MemberSegment::Property { .. } => "property",
            MemberSegment::NavigationToOne { .. } => "navigation-to-one",
            MemberSegment::NavigationToMany { .. } => "navigation-to-many",
            MemberSegment::Variable { .. } => "variable",
            MemberSegment::Any { .. } => "any",
            MemberSegment::All { .. } => "all",
            MemberSegment::Count => "count",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Expression {
    Literal {
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        type_: Option<EdmType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Member {
        path: Vec<MemberSegment>,
    },
    Unary {
        operator: UnaryOperator,
        operand: Box<Expression>,
    },
    Binary {
        operator: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Method {
        method: Method,
        #[serde(default)]
        parameters: Vec<Expression>,
    },
    Alias {
        expression: Box<Expression>,
    },
}

impl Expression {
    pub fn literal(type_: EdmType, text: impl Into<String>) -> Self {
        Expression::Literal { type_: Some(type_), text: Some(text.into()) }
    }

    pub fn null() -> Self {
        Expression::Literal { type_: None, text: None }
    }

    /// Plain property member
    pub fn property(name: impl Into<String>) -> Self {
        Expression::Member { path: vec![MemberSegment::Property { name: name.into() }] }
    }

    pub fn binary(operator: BinaryOperator, left: Expression, right: Expression) -> Self {
        Expression::Binary { operator, left: Box::new(left), right: Box::new(right) }
    }

    pub fn not(operand: Expression) -> Self {
        Expression::Unary { operator: UnaryOperator::Not, operand: Box::new(operand) }
    }

    pub fn method(method: Method, parameters: Vec<Expression>) -> Self {
        Expression::Method { method, parameters }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Expression::Literal { .. } => "literal",
            Expression::Member { .. } => "member",
            Expression::Unary { .. } => "unary",
            Expression::Binary { .. } => "binary",
            Expression::Method { .. } => "method",
            Expression::Alias { .. } => "alias",
        }
    }
}

// ---------------------------------------------------------------------------
// $apply

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateMethod {
    Sum,
    Min,
    Max,
    Average,
    CountDistinct,
}

/// `price with sum as total`, `$count as n`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpression {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<Expression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<AggregateMethod>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Path of the aggregated value; `[count]` for `$count`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<MemberSegment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<Box<AggregateExpression>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Transformation {
    GroupBy {
        items: Vec<Vec<MemberSegment>>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        transformations: Vec<Transformation>,
    },
    Aggregate {
        expressions: Vec<AggregateExpression>,
    },
    Filter {
        filter: Expression,
    },
    Compute,
    Concat,
    Expand,
    Identity,
    OrderBy,
    Search,
    Skip,
    Top,
    BottomCount,
    TopCount,
}

impl Transformation {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Transformation::GroupBy { .. } => "groupby",
            Transformation::Aggregate { .. } => "aggregate",
            Transformation::Filter { .. } => "filter",
            Transformation::Compute => "compute",
            Transformation::Concat => "concat",
            Transformation::Expand => "expand",
            Transformation::Identity => "identity",
            Transformation::OrderBy => "orderby",
            Transformation::Search => "search",
            Transformation::Skip => "skip",
            Transformation::Top => "top",
            Transformation::BottomCount => "bottomcount",
            Transformation::TopCount => "topcount",
        }
    }
}

// ---------------------------------------------------------------------------
// $search

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SearchExpression {
    Term {
        text: String,
    },
    Not {
        operand: Box<SearchExpression>,
    },
    And {
        left: Box<SearchExpression>,
        right: Box<SearchExpression>,
    },
    Or {
        left: Box<SearchExpression>,
        right: Box<SearchExpression>,
    },
}

impl SearchExpression {
    pub fn term(text: impl Into<String>) -> Self {
        SearchExpression::Term { text: text.into() }
    }
}

// ---------------------------------------------------------------------------
// $select, $orderby, $expand

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectItem {
    #[serde(default)]
    pub path: Vec<String>,
    /// `*`
    #[serde(default)]
    pub all: bool,
}

impl SelectItem {
    pub fn column(name: impl Into<String>) -> Self {
        Self { path: vec![name.into()], all: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderByItem {
    pub expression: Expression,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpandItem {
    /// Navigation property names from the expanding entity
    #[serde(default)]
    pub path: Vec<String>,
    /// `$expand=*`
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub options: QueryOptions,
}

impl ExpandItem {
    pub fn navigation(name: impl Into<String>) -> Self {
        Self { path: vec![name.into()], ..Self::default() }
    }

    pub fn star() -> Self {
        Self { all: true, ..Self::default() }
    }
}

/// System query options of one request or one expand level
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<SelectItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Expression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchExpression>,
    /// Raw `$search` text as sent
    #[serde(rename = "searchText", skip_serializing_if = "Option::is_none")]
    pub search_text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub apply: Vec<Transformation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expand: Vec<ExpandItem>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub orderby: Vec<OrderByItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<i64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub count: bool,
}

/// Request body: one entity or a batch of them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    One(Entry),
    Many(Vec<Entry>),
}

impl Payload {
    pub fn entries(&self) -> Vec<Entry> {
        match self {
            Payload::One(entry) => vec![entry.clone()],
            Payload::Many(entries) => entries.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub intent: Intent,
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub options: QueryOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

impl Request {
    pub fn read(segments: Vec<Segment>, options: QueryOptions) -> Self {
        Self { intent: Intent::Read, segments, options, data: None }
    }

    pub fn write(intent: Intent, segments: Vec<Segment>, data: Option<Payload>) -> Self {
        Self { intent, segments, options: QueryOptions::default(), data }
    }

    pub fn last_kind(&self) -> Option<SegmentKind> {
        self.segments.last().map(|s| s.kind)
    }
}
