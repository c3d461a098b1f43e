//! Dialect knobs of the compiler

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How identifiers are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotingStyle {
    /// `"Name"`
    #[default]
    Quoted,
    /// `Name`, with `.` and `::` slugified to `_` and `__`
    Plain,
    /// `"NAME"`, slugified
    Upper,
    /// `"name"`, slugified
    Lower,
    /// `[Name]`
    Bracketed,
}

impl FromStr for QuotingStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quoted" => Ok(QuotingStyle::Quoted),
            "plain" => Ok(QuotingStyle::Plain),
            "upper" | "all-upper" => Ok(QuotingStyle::Upper),
            "lower" | "all-lower" => Ok(QuotingStyle::Lower),
            "bracketed" => Ok(QuotingStyle::Bracketed),
            _ => Err(format!("Invalid quoting style: {}", s)),
        }
    }
}

/// Rendering of inlined boolean literals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BooleanLiteral {
    /// `true` / `false`
    #[default]
    Keyword,
    /// `1` / `0`
    Numeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Sqlite,
    Postgres,
    Hana,
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Dialect::Sqlite),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "hana" => Ok(Dialect::Hana),
            _ => Err(format!("Invalid SQL dialect: {}", s)),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Sqlite => write!(f, "sqlite"),
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::Hana => write!(f, "hana"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    pub quoting: QuotingStyle,
    pub delimiter: String,
    pub boolean: BooleanLiteral,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            quoting: QuotingStyle::Quoted,
            delimiter: "\"".to_string(),
            boolean: BooleanLiteral::Keyword,
        }
    }
}

impl CompileOptions {
    pub fn for_dialect(dialect: Dialect) -> Self {
        match dialect {
            Dialect::Sqlite => Self { boolean: BooleanLiteral::Numeric, ..Self::default() },
            Dialect::Postgres => Self::default(),
            Dialect::Hana => Self { quoting: QuotingStyle::Upper, ..Self::default() },
        }
    }

    pub fn with_quoting(mut self, quoting: QuotingStyle) -> Self {
        self.quoting = quoting;
        self
    }

    /// Renders one identifier; every table, column and alias goes through here
    pub fn quote(&self, name: &str) -> String {
        let d = &self.delimiter;
        match self.quoting {
            QuotingStyle::Quoted => format!("{d}{}{d}", name.replace(d.as_str(), &format!("{d}{d}"))),
            QuotingStyle::Plain => slugify(name),
            QuotingStyle::Upper => format!("{d}{}{d}", slugify(&name.to_uppercase())),
            QuotingStyle::Lower => format!("{d}{}{d}", slugify(&name.to_lowercase())),
            QuotingStyle::Bracketed => format!("[{}]", name.replace(']', "]]")),
        }
    }

    pub(crate) fn boolean(&self, value: bool) -> &'static str {
        match (self.boolean, value) {
            (BooleanLiteral::Keyword, true) => "true",
            (BooleanLiteral::Keyword, false) => "false",
            (BooleanLiteral::Numeric, true) => "1",
            (BooleanLiteral::Numeric, false) => "0",
        }
    }
}

fn slugify(name: &str) -> String {
    name.replace("::", "__").replace('.', "_")
}
