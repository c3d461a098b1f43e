use cqn_ir::{Expr, Query, Update, Value};
use cqn_model::Model;

use crate::arg::{Arg, Context};
use crate::condition;
use crate::parser;
use crate::{Args, BuildError};

/// Compound assignment operators accepted by [`UpdateBuilder::set`]
const ASSIGNMENTS: &[(&str, &str)] = &[("+=", "+"), ("-=", "-"), ("*=", "*"), ("/=", "/")];

/// Chainable builder for `UPDATE` trees
#[derive(Debug, Clone)]
pub struct UpdateBuilder<'m> {
    update: Update,
    model: Option<&'m Model>,
    calls: Vec<String>,
}

impl<'m> UpdateBuilder<'m> {
    pub fn entity(target: &str) -> Result<Self, BuildError> {
        let calls = vec!["entity".to_string()];
        let entity = parser::parse_path(target).map_err(|e| BuildError::from(e).in_chain(&calls))?;
        Ok(Self { update: Update::new(entity), model: None, calls })
    }

    pub fn with_model(mut self, model: &'m Model) -> Self {
        self.model = Some(model);
        self
    }

    /// Plain values, bound as parameters
    pub fn data<I, K, V>(self, data: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.step("data", |b| {
            for (column, value) in data {
                b.update.data.insert(column.into(), value.into());
            }
            Ok(())
        })
    }

    /// Assignments given as an object or as `column = expression` text.
    ///
    /// `{stock: {'-=': 1}}` becomes `stock = stock - 1`, `{price: {'=': 'cost'}}`
    /// copies another column; scalar values land in `data`.
    pub fn set(self, assignments: Arg) -> Result<Self, BuildError> {
        self.step("set", |b| {
            match assignments {
                Arg::Object(entries) => {
                    for (column, value) in entries {
                        b.assign(column, value)?;
                    }
                }
                Arg::Str(text) => b.assign_text(&text)?,
                other => return Err(BuildError::invalid(format!("cannot set {:?}", other))),
            }
            Ok(())
        })
    }

    pub fn where_(self, args: impl Into<Args>) -> Result<Self, BuildError> {
        self.conjoin("where", "and", args.into())
    }

    pub fn and(self, args: impl Into<Args>) -> Result<Self, BuildError> {
        self.conjoin("and", "and", args.into())
    }

    pub fn or(self, args: impl Into<Args>) -> Result<Self, BuildError> {
        self.conjoin("or", "or", args.into())
    }

    pub fn build(self) -> Query {
        Query::Update(self.update)
    }

    fn conjoin(self, method: &str, op: &'static str, args: Args) -> Result<Self, BuildError> {
        self.step(method, |b| {
            let ctx = Context::for_ref(&b.update.entity, b.model);
            let predicate = condition::predicate(args, &ctx)?;
            condition::append(&mut b.update.where_, op, predicate, false);
            Ok(())
        })
    }

    fn assign(&mut self, column: String, value: Arg) -> Result<(), BuildError> {
        match value {
            Arg::Object(ops) => {
                let [(op, operand)] = ops.as_slice() else {
                    return Err(BuildError::invalid(format!("one operator expected for {}", column)));
                };
                let expr = if op == "=" {
                    match operand {
                        Arg::Str(other) => parser::parse_operand(other)?,
                        _ => return Err(BuildError::invalid(format!("{} = expects a column", column))),
                    }
                } else {
                    let arithmetic = ASSIGNMENTS
                        .iter()
                        .find(|(assign, _)| assign == op)
                        .map(|(_, arithmetic)| *arithmetic)
                        .ok_or_else(|| BuildError::invalid(format!("unknown assignment {}", op)))?;
                    Expr::xpr(vec![Expr::column(column.clone()), Expr::token(arithmetic), operand_expr(operand)?])
                };
                self.update.with.insert(column, expr);
            }
            Arg::Expr(expr) => {
                self.update.with.insert(column, expr);
            }
            Arg::Tokens(tokens) => {
                self.update.with.insert(column, Expr::xpr(tokens));
            }
            Arg::Null => {
                self.update.data.insert(column, Value::Null);
            }
            Arg::Bool(v) => {
                self.update.data.insert(column, Value::Bool(v));
            }
            Arg::Int(v) => {
                self.update.data.insert(column, Value::Int(v));
            }
            Arg::Float(v) => {
                self.update.data.insert(column, Value::Float(v));
            }
            Arg::Str(v) => {
                self.update.data.insert(column, Value::String(v));
            }
            other => return Err(BuildError::invalid(format!("cannot assign {:?} to {}", other, column))),
        }
        Ok(())
    }

    /// `stock = stock - 1`
    fn assign_text(&mut self, text: &str) -> Result<(), BuildError> {
        let mut tokens = parser::parse_condition(text)?;
        if tokens.len() < 3 || !tokens[1].is_token("=") {
            return Err(BuildError::invalid(format!("expected an assignment: {}", text)));
        }
        let column = match tokens[0].as_reference().and_then(|r| r.last()) {
            Some(column) => column.to_string(),
            None => return Err(BuildError::invalid(format!("expected a column: {}", text))),
        };
        let mut value: Vec<Expr> = tokens.drain(2..).collect();
        let expr = if value.len() == 1 { value.remove(0) } else { Expr::xpr(value) };
        self.update.with.insert(column, expr);
        Ok(())
    }

    fn step<F>(mut self, method: &str, f: F) -> Result<Self, BuildError>
    where
        F: FnOnce(&mut Self) -> Result<(), BuildError>,
    {
        self.calls.push(method.to_string());
        match f(&mut self) {
            Ok(()) => Ok(self),
            Err(e) => Err(e.in_chain(&self.calls)),
        }
    }
}

fn operand_expr(arg: &Arg) -> Result<Expr, BuildError> {
    match arg {
        Arg::Int(v) => Ok(Expr::val(*v)),
        Arg::Float(v) => Ok(Expr::val(*v)),
        Arg::Str(v) => Ok(Expr::val(v.clone())),
        Arg::Expr(e) => Ok(e.clone()),
        other => Err(BuildError::invalid(format!("unsupported operand {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{args, obj};

    #[test]
    fn test_compound_assignment() {
        let query = UpdateBuilder::entity("Books")
            .unwrap()
            .set(obj! {"stock" => obj! {"-=" => 1}, "title" => "New"})
            .unwrap()
            .where_(args!["ID", "=", 201])
            .unwrap()
            .build();
        let Query::Update(update) = query else { panic!("expected update") };
        assert_eq!(
            update.with.get("stock"),
            Some(&Expr::xpr(vec![Expr::column("stock"), Expr::token("-"), Expr::val(1)]))
        );
        assert_eq!(update.data.get("title"), Some(&Value::from("New")));
        assert_eq!(update.where_.len(), 3);
    }

    #[test]
    fn test_copy_column() {
        let query = UpdateBuilder::entity("Books").unwrap().set(obj! {"price" => obj! {"=" => "cost"}}).unwrap().build();
        let Query::Update(update) = query else { panic!("expected update") };
        assert_eq!(update.with.get("price"), Some(&Expr::column("cost")));
    }

    #[test]
    fn test_assignment_text() {
        let query = UpdateBuilder::entity("Books").unwrap().set(Arg::from("stock = stock * 2")).unwrap().build();
        let Query::Update(update) = query else { panic!("expected update") };
        assert_eq!(
            update.with.get("stock"),
            Some(&Expr::xpr(vec![Expr::column("stock"), Expr::token("*"), Expr::val(2)]))
        );
    }

    #[test]
    fn test_unknown_assignment_operator() {
        let err = UpdateBuilder::entity("Books").unwrap().set(obj! {"stock" => obj! {"%=" => 2}}).unwrap_err();
        assert!(matches!(err, BuildError::InvalidArgument { .. }));
    }
}
