//! Recursive descent from canonical tree to parameterized SQL
//!
//! One [`Writer`] owns both the text and the bound values, and every nested
//! select writes into the same instance. A value is therefore pushed exactly
//! when its `?` is written, which keeps placeholders and values aligned across
//! sub-select boundaries.

use std::collections::BTreeSet;

use cqn_ir::{escape_like, Delete, Expr, Func, Insert, Join, Ref, Segment, Select, Source, Update, Value};

use crate::options::CompileOptions;
use crate::CompileError;

/// Operator and keyword tokens accepted inside token streams
const TOKENS: &[&str] = &[
    "=", "!=", "<>", "<", ">", "<=", ">=", "+", "-", "*", "/", "||", "(", ")", "and", "or", "not", "like",
    "not like", "in", "not in", "between", "not between", "exists", "not exists", "is", "is not", "is null",
    "is not null", "escape", "distinct",
];

const COMPARISONS: &[&str] = &["=", "!=", "<>", "is", "is not"];

const QUANTIFIABLE: &[&str] = &["=", "!=", "<>", "<", ">", "<=", ">="];

pub(crate) struct Writer<'o> {
    options: &'o CompileOptions,
    sql: String,
    glued: bool,
    pub(crate) values: Vec<Value>,
    /// Table names and aliases visible to references, innermost last
    scopes: Vec<Vec<String>>,
}

impl<'o> Writer<'o> {
    pub(crate) fn new(options: &'o CompileOptions) -> Self {
        Self {
            options,
            sql: String::new(),
            glued: false,
            values: Vec::new(),
            scopes: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> (String, Vec<Value>) {
        (self.sql, self.values)
    }

    // -----------------------------------------------------------------------
    // Statements

    pub(crate) fn select(&mut self, select: &Select) -> Result<(), CompileError> {
        check_duplicate_aliases(&select.columns)?;
        self.scopes.push(select.from.table_names());

        let filter: &[Expr] = match &select.from {
            Source::Ref(r) => target(r)?.1,
            _ => &[],
        };
        let where_ = conjoin(filter, &select.where_);

        self.word("SELECT");
        if select.distinct {
            self.word("DISTINCT");
        }
        self.columns(&select.columns)?;

        self.word("FROM");
        self.source(&select.from, true)?;

        if !where_.is_empty() {
            self.word("WHERE");
            self.tokens(&where_)?;
        }

        if !select.group_by.is_empty() {
            self.word("GROUP BY");
            for (i, expr) in select.group_by.iter().enumerate() {
                if i > 0 {
                    self.comma();
                }
                self.expr(expr)?;
            }
        }

        if !select.having.is_empty() {
            self.word("HAVING");
            self.tokens(&select.having)?;
        }

        if !select.order_by.is_empty() {
            self.word("ORDER BY");
            for (i, item) in select.order_by.iter().enumerate() {
                if i > 0 {
                    self.comma();
                }
                self.expr(item)?;
                let sort = match item {
                    Expr::Ref(r) => r.sort,
                    Expr::Func(f) => f.sort,
                    Expr::Select(s) => s.sort,
                    _ => None,
                };
                if let Some(sort) = sort {
                    self.word(sort.keyword());
                }
            }
        }

        match &select.limit {
            Some(limit) => {
                self.word("LIMIT");
                self.expr(&limit.rows)?;
                if let Some(offset) = &limit.offset {
                    self.word("OFFSET");
                    self.expr(offset)?;
                }
            }
            None if select.one => {
                self.word("LIMIT");
                self.bind(Value::Int(1));
            }
            None => {}
        }

        if let Some(lock) = &select.for_update {
            self.word("FOR UPDATE");
            if !lock.of.is_empty() {
                self.word("OF");
                for (i, column) in lock.of.iter().enumerate() {
                    if i > 0 {
                        self.comma();
                    }
                    self.expr(column)?;
                }
            }
            if let Some(wait) = lock.wait {
                self.word("WAIT");
                self.word(&wait.to_string());
            }
        }

        self.scopes.pop();
        Ok(())
    }

    pub(crate) fn insert(&mut self, insert: &Insert) -> Result<(), CompileError> {
        let (name, filter) = target(&insert.into)?;
        if !filter.is_empty() {
            return Err(CompileError::InvalidTree(format!("INSERT into a filtered path {}", name)));
        }

        self.word("INSERT INTO");
        self.word(&self.options.quote(name));

        if let Some(query) = &insert.as_select {
            if !insert.columns.is_empty() {
                self.column_list(&insert.columns);
            }
            return self.select(&query.select);
        }

        if !insert.entries.is_empty() {
            let columns = if insert.columns.is_empty() {
                let mut seen = BTreeSet::new();
                insert
                    .entries
                    .iter()
                    .flat_map(|e| e.keys())
                    .filter(|k| seen.insert(k.as_str()))
                    .cloned()
                    .collect()
            } else {
                insert.columns.clone()
            };
            self.column_list(&columns);
            self.word("VALUES");
            for (i, entry) in insert.entries.iter().enumerate() {
                if i > 0 {
                    self.comma();
                }
                let row: Vec<Value> = columns.iter().map(|c| entry.get(c).cloned().unwrap_or(Value::Null)).collect();
                self.row(&row);
            }
            return Ok(());
        }

        let rows: Vec<&[Value]> = if !insert.rows.is_empty() {
            insert.rows.iter().map(Vec::as_slice).collect()
        } else if !insert.values.is_empty() {
            vec![insert.values.as_slice()]
        } else {
            return Err(CompileError::InvalidTree(format!("INSERT into {} without data", name)));
        };

        if !insert.columns.is_empty() {
            self.column_list(&insert.columns);
        }
        self.word("VALUES");
        for (i, row) in rows.into_iter().enumerate() {
            if i > 0 {
                self.comma();
            }
            self.row(row);
        }
        Ok(())
    }

    pub(crate) fn update(&mut self, update: &Update) -> Result<(), CompileError> {
        let (name, filter) = target(&update.entity)?;
        if update.data.is_empty() && update.with.is_empty() {
            return Err(CompileError::InvalidTree(format!("UPDATE of {} without assignments", name)));
        }
        self.scopes.push(Source::Ref(update.entity.clone()).table_names());

        self.word("UPDATE");
        self.word(&self.options.quote(name));
        self.alias(update.entity.alias.as_deref());

        self.word("SET");
        let mut first = true;
        for (column, value) in update.data.iter().filter(|(c, _)| !update.with.contains_key(*c)) {
            if !first {
                self.comma();
            }
            first = false;
            self.word(&self.options.quote(column));
            self.word("=");
            self.bind(value.clone());
        }
        for (column, expr) in &update.with {
            if !first {
                self.comma();
            }
            first = false;
            self.word(&self.options.quote(column));
            self.word("=");
            match expr {
                Expr::Xpr(x) => self.tokens(&x.xpr)?,
                other => self.expr(other)?,
            }
        }

        self.where_clause(&conjoin(filter, &update.where_))?;
        self.scopes.pop();
        Ok(())
    }

    pub(crate) fn delete(&mut self, delete: &Delete) -> Result<(), CompileError> {
        let (name, filter) = target(&delete.from)?;
        self.scopes.push(Source::Ref(delete.from.clone()).table_names());

        self.word("DELETE FROM");
        self.word(&self.options.quote(name));
        self.alias(delete.from.alias.as_deref());

        self.where_clause(&conjoin(filter, &delete.where_))?;
        self.scopes.pop();
        Ok(())
    }

    fn where_clause(&mut self, tokens: &[Expr]) -> Result<(), CompileError> {
        if !tokens.is_empty() {
            self.word("WHERE");
            self.tokens(tokens)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sources and projections

    fn source(&mut self, source: &Source, top: bool) -> Result<(), CompileError> {
        match source {
            Source::Ref(r) => {
                let (name, filter) = target(r)?;
                if !top && !filter.is_empty() {
                    return Err(CompileError::InvalidTree(format!("filtered join source {}", name)));
                }
                self.word(&self.options.quote(name));
                self.alias(r.alias.as_deref());
            }
            Source::Select(sub) => {
                self.word("(");
                self.select(&sub.select)?;
                self.word(")");
                self.alias(sub.alias.as_deref());
            }
            Source::Set(set) => {
                let op = if set.set.all { "UNION ALL" } else { "UNION" };
                self.word("(");
                for (i, arg) in set.set.args.iter().enumerate() {
                    if i > 0 {
                        self.word(op);
                    }
                    self.select(&arg.select)?;
                }
                self.word(")");
                self.alias(set.alias.as_deref());
            }
            Source::Join(join) => self.join(join)?,
        }
        Ok(())
    }

    fn join(&mut self, join: &Join) -> Result<(), CompileError> {
        let [left, right] = join.args.as_slice() else {
            return Err(CompileError::InvalidTree(format!("join with {} sources", join.args.len())));
        };
        self.source(left, false)?;
        self.word(join.join.keyword());
        self.word("JOIN");
        self.source(right, false)?;
        if !join.on.is_empty() {
            self.word("ON");
            self.tokens(&join.on)?;
        }
        Ok(())
    }

    fn columns(&mut self, columns: &[Expr]) -> Result<(), CompileError> {
        if columns.is_empty() {
            self.word("*");
            return Ok(());
        }
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                self.comma();
            }
            match column {
                Expr::Token(t) if t == "*" => self.word("*"),
                Expr::Ref(r) if r.is_expand() => {
                    return Err(CompileError::InvalidTree(format!(
                        "unresolved expand column {}",
                        path_text(r)
                    )))
                }
                Expr::Val(v) => {
                    let literal = self.literal(&v.val);
                    self.word(&literal);
                }
                Expr::Ref(_) | Expr::Func(_) | Expr::Xpr(_) | Expr::Select(_) => self.expr(column)?,
                other => return Err(invalid(other)),
            }
            self.alias(column.alias());
        }
        Ok(())
    }

    fn column_list(&mut self, columns: &[String]) {
        self.open("(");
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                self.comma();
            }
            self.word(&self.options.quote(column));
        }
        self.close();
    }

    fn row(&mut self, row: &[Value]) {
        self.open("(");
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                self.comma();
            }
            self.bind(value.clone());
        }
        self.close();
    }

    fn alias(&mut self, alias: Option<&str>) {
        if let Some(alias) = alias {
            self.word("AS");
            self.word(&self.options.quote(alias));
        }
    }

    // -----------------------------------------------------------------------
    // Expressions

    fn tokens(&mut self, tokens: &[Expr]) -> Result<(), CompileError> {
        let mut i = 0;
        while i < tokens.len() {
            if let (Some(left), Some(Expr::Token(op)), Some(right)) = (tokens.get(i), tokens.get(i + 1), tokens.get(i + 2)) {
                if !matches!(left, Expr::Token(_)) && self.triple(left, op, right)? {
                    i += 3;
                    continue;
                }
            }
            self.expr(&tokens[i])?;
            i += 1;
        }
        Ok(())
    }

    /// Null tests, `IN` operands and quantified sub-selects; false if the triple is not special
    fn triple(&mut self, left: &Expr, op: &str, right: &Expr) -> Result<bool, CompileError> {
        let op = op.to_lowercase();

        if right.as_val().map(Value::is_null).unwrap_or(false) && COMPARISONS.contains(&op.as_str()) {
            self.expr(left)?;
            self.word(if op == "=" || op == "is" { "IS NULL" } else { "IS NOT NULL" });
            return Ok(true);
        }

        if op == "in" || op == "not in" {
            self.expr(left)?;
            self.word(&op.to_uppercase());
            match right {
                Expr::List(list) if list.list.is_empty() => {
                    return Err(CompileError::InvalidTree("empty IN list".into()));
                }
                Expr::List(list) => self.list(&list.list)?,
                other => self.expr(other)?,
            }
            return Ok(true);
        }

        if let Expr::Func(f) = right {
            let quantifier = f.func.to_lowercase();
            if let ("any" | "all", [Expr::Select(sub)]) = (quantifier.as_str(), f.args.as_slice()) {
                if !QUANTIFIABLE.contains(&op.as_str()) {
                    return Ok(false);
                }
                self.expr(left)?;
                if op == "=" && quantifier == "any" {
                    self.word("IN");
                } else {
                    self.word(&op);
                    self.word(&quantifier.to_uppercase());
                }
                self.word("(");
                self.select(&sub.select)?;
                self.word(")");
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Ref(r) if r.is_expand() => Err(CompileError::InvalidTree(format!(
                "expand {} outside of a projection",
                path_text(r)
            ))),
            Expr::Ref(r) => self.reference(r),
            Expr::Val(v) => {
                self.bind(v.val.clone());
                Ok(())
            }
            Expr::Func(f) => self.func(f),
            Expr::Xpr(x) => {
                self.word("(");
                self.tokens(&x.xpr)?;
                self.word(")");
                Ok(())
            }
            Expr::List(list) => self.list(&list.list),
            Expr::Select(sub) => {
                self.word("(");
                self.select(&sub.select)?;
                self.word(")");
                Ok(())
            }
            Expr::Token(token) => self.token(token),
            Expr::Param(_) => Err(invalid(expr)),
        }
    }

    fn reference(&mut self, r: &Ref) -> Result<(), CompileError> {
        let names = r
            .path
            .iter()
            .map(|segment| match segment {
                Segment::Name(name) => Ok(name.as_str()),
                Segment::Filtered { id, .. } => {
                    Err(CompileError::InvalidTree(format!("filtered path step {} in expression", id)))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        match names.as_slice() {
            [column] => {
                let quoted = self.options.quote(column);
                self.word(&quoted);
            }
            [table, column] if self.in_scope(table) => {
                let quoted = format!("{}.{}", self.options.quote(table), self.options.quote(column));
                self.word(&quoted);
            }
            _ => return Err(CompileError::InvalidTree(format!("unresolved path {}", path_text(r)))),
        }
        Ok(())
    }

    fn in_scope(&self, table: &str) -> bool {
        self.scopes.iter().rev().any(|scope| scope.iter().any(|t| t == table))
    }

    fn list(&mut self, items: &[Expr]) -> Result<(), CompileError> {
        self.open("(");
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.comma();
            }
            self.expr(item)?;
        }
        self.close();
        Ok(())
    }

    fn func(&mut self, f: &Func) -> Result<(), CompileError> {
        let name = f.func.to_lowercase();
        if name == "contains" || name == "not contains" {
            return self.contains(f, name == "contains");
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') || name.is_empty() {
            return Err(CompileError::InvalidTree(format!("function name {:?}", f.func)));
        }
        if name == "concat" {
            self.word("(");
            for (i, arg) in f.args.iter().enumerate() {
                if i > 0 {
                    self.word("||");
                }
                self.expr(arg)?;
            }
            self.word(")");
            return Ok(());
        }

        self.open(&format!("{}(", name));
        for (i, arg) in f.args.iter().enumerate() {
            if i > 0 {
                self.comma();
            }
            match arg {
                Expr::Xpr(x) if x.xpr.first().map(|t| t.is_token("distinct")).unwrap_or(false) => {
                    self.tokens(&x.xpr)?
                }
                other => self.expr(other)?,
            }
        }
        self.close();
        Ok(())
    }

    /// `( lower(a) LIKE ? ESCAPE '^' OR lower(b) LIKE ? ESCAPE '^' )` per search term
    fn contains(&mut self, f: &Func, positive: bool) -> Result<(), CompileError> {
        let (first, terms) = f
            .args
            .split_first()
            .ok_or_else(|| CompileError::InvalidTree("contains without columns".into()))?;
        let columns: Vec<&Expr> = match first {
            Expr::List(list) => list.list.iter().collect(),
            Expr::Xpr(x) => x.xpr.iter().collect(),
            single => vec![single],
        };
        if columns.is_empty() {
            return Err(CompileError::InvalidTree("contains without columns".into()));
        }

        for term in terms {
            match term {
                Expr::Token(t) if matches!(t.to_lowercase().as_str(), "and" | "or" | "not") => {
                    self.word(&t.to_uppercase())
                }
                Expr::Val(v) => {
                    let text = match &v.val {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let pattern = format!("%{}%", escape_like(&text.to_lowercase()));
                    self.word("(");
                    for (i, column) in columns.iter().enumerate() {
                        if i > 0 {
                            self.word(if positive { "OR" } else { "AND" });
                        }
                        self.like(column, positive, pattern.clone())?;
                    }
                    self.word(")");
                }
                other => return Err(invalid(other)),
            }
        }
        Ok(())
    }

    fn like(&mut self, column: &Expr, positive: bool, pattern: String) -> Result<(), CompileError> {
        if !positive {
            self.word("(");
            self.expr(column)?;
            self.word("IS NULL");
            self.word("OR");
        }
        self.open("lower(");
        self.expr(column)?;
        self.close();
        self.word(if positive { "LIKE" } else { "NOT LIKE" });
        self.bind(Value::String(pattern));
        self.word("ESCAPE");
        self.word("'^'");
        if !positive {
            self.word(")");
        }
        Ok(())
    }

    fn token(&mut self, token: &str) -> Result<(), CompileError> {
        let lowered = token.to_lowercase();
        if TOKENS.contains(&lowered.as_str()) {
            self.word(&lowered.to_uppercase());
            return Ok(());
        }
        if is_quoted_literal(token) {
            self.word(token);
            return Ok(());
        }
        Err(CompileError::InvalidTree(format!("unknown token {:?}", token)))
    }

    fn literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => self.options.boolean(*b).to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    // -----------------------------------------------------------------------
    // Output

    fn word(&mut self, word: &str) {
        if !self.sql.is_empty() && !self.glued {
            self.sql.push(' ');
        }
        self.sql.push_str(word);
        self.glued = false;
    }

    /// Writes `text` and attaches the next word without a space
    fn open(&mut self, text: &str) {
        self.word(text);
        self.glued = true;
    }

    fn close(&mut self) {
        self.sql.push(')');
        self.glued = false;
    }

    fn comma(&mut self) {
        self.sql.push(',');
        self.glued = false;
    }

    fn bind(&mut self, value: Value) {
        self.word("?");
        self.values.push(value);
    }
}

/// Entity name and key filter of a statement target
fn target(r: &Ref) -> Result<(&str, &[Expr]), CompileError> {
    match r.path.as_slice() {
        [Segment::Name(name)] => Ok((name.as_str(), &[])),
        [Segment::Filtered { id, where_ }] => Ok((id.as_str(), where_.as_slice())),
        _ => Err(CompileError::InvalidTree(format!("unresolved path {}", path_text(r)))),
    }
}

/// `a and b`, parenthesizing sides with a top-level `or`
fn conjoin(a: &[Expr], b: &[Expr]) -> Vec<Expr> {
    if a.is_empty() {
        return b.to_vec();
    }
    if b.is_empty() {
        return a.to_vec();
    }
    let mut out = Vec::with_capacity(a.len() + b.len() + 5);
    for (i, side) in [a, b].into_iter().enumerate() {
        if i > 0 {
            out.push(Expr::token("and"));
        }
        if has_top_level_or(side) {
            out.push(Expr::token("("));
            out.extend_from_slice(side);
            out.push(Expr::token(")"));
        } else {
            out.extend_from_slice(side);
        }
    }
    out
}

fn has_top_level_or(tokens: &[Expr]) -> bool {
    let mut depth = 0i32;
    tokens.iter().any(|t| {
        match t.as_token() {
            Some("(") => depth += 1,
            Some(")") => depth -= 1,
            Some(op) => return depth == 0 && op.eq_ignore_ascii_case("or"),
            None => {}
        }
        false
    })
}

fn check_duplicate_aliases(columns: &[Expr]) -> Result<(), CompileError> {
    let mut seen = BTreeSet::new();
    let mut duplicates = Vec::new();
    for name in columns.iter().filter_map(Expr::output_name) {
        if !seen.insert(name) && !duplicates.iter().any(|d: &String| d == name) {
            duplicates.push(name.to_string());
        }
    }
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(CompileError::DuplicateAlias { aliases: duplicates })
    }
}

fn is_quoted_literal(token: &str) -> bool {
    token.len() >= 2
        && token.starts_with('\'')
        && token.ends_with('\'')
        && !token[1..token.len() - 1].replace("''", "").contains('\'')
}

fn path_text(r: &Ref) -> String {
    r.path.iter().map(Segment::name).collect::<Vec<_>>().join(".")
}

fn invalid(expr: &Expr) -> CompileError {
    CompileError::InvalidTree(serde_json::to_string(expr).unwrap_or_else(|_| format!("{:?}", expr)))
}
