use cqn_ir::{Entry, Insert, Query, Select, SubSelect, Value};

use crate::parser;
use crate::BuildError;

/// Chainable builder for `INSERT` trees
#[derive(Debug, Clone)]
pub struct InsertBuilder {
    insert: Insert,
    calls: Vec<String>,
}

impl InsertBuilder {
    pub fn into(target: &str) -> Result<Self, BuildError> {
        let calls = vec!["into".to_string()];
        let into = parser::parse_path(target).map_err(|e| BuildError::from(e).in_chain(&calls))?;
        Ok(Self { insert: Insert::new(into), calls })
    }

    pub fn columns<I, S>(self, columns: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step("columns", |i| {
            i.columns.extend(columns.into_iter().map(Into::into));
            Ok(())
        })
    }

    /// One row of values positionally matching `columns`
    pub fn values<I, V>(self, values: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.step("values", |i| {
            reject_with_entries(i, "values")?;
            i.values.extend(values.into_iter().map(Into::into));
            Ok(())
        })
    }

    pub fn rows<I, R, V>(self, rows: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.step("rows", |i| {
            reject_with_entries(i, "rows")?;
            for row in rows {
                let row: Vec<Value> = row.into_iter().map(Into::into).collect();
                if !i.columns.is_empty() && row.len() != i.columns.len() {
                    return Err(BuildError::invalid(format!(
                        "row has {} values for {} columns",
                        row.len(),
                        i.columns.len()
                    )));
                }
                i.rows.push(row);
            }
            Ok(())
        })
    }

    pub fn entries<I>(self, entries: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = Entry>,
    {
        self.step("entries", |i| {
            if !i.rows.is_empty() || !i.values.is_empty() {
                return Err(BuildError::unexpected("entries", "rows"));
            }
            i.entries.extend(entries);
            Ok(())
        })
    }

    /// `INSERT INTO t (...) SELECT ...`
    pub fn as_(self, query: Select) -> Result<Self, BuildError> {
        self.step("as", |i| {
            if !i.entries.is_empty() || !i.rows.is_empty() || !i.values.is_empty() {
                return Err(BuildError::unexpected("as", "entries"));
            }
            i.as_select = Some(SubSelect::new(query));
            Ok(())
        })
    }

    pub fn build(self) -> Query {
        Query::Insert(self.insert)
    }

    fn step<F>(mut self, method: &str, f: F) -> Result<Self, BuildError>
    where
        F: FnOnce(&mut Insert) -> Result<(), BuildError>,
    {
        self.calls.push(method.to_string());
        match f(&mut self.insert) {
            Ok(()) => Ok(self),
            Err(e) => Err(e.in_chain(&self.calls)),
        }
    }
}

fn reject_with_entries(insert: &Insert, method: &str) -> Result<(), BuildError> {
    if insert.entries.is_empty() {
        Ok(())
    } else {
        Err(BuildError::unexpected(method, "entries"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries() {
        let mut entry = Entry::new();
        entry.insert("ID".into(), Value::Int(1));
        entry.insert("title".into(), Value::from("Dracula"));
        let query = InsertBuilder::into("Books").unwrap().entries([entry]).unwrap().build();
        let Query::Insert(insert) = query else { panic!("expected insert") };
        assert_eq!(insert.entries.len(), 1);
        assert_eq!(insert.into.first(), Some("Books"));
    }

    #[test]
    fn test_rows_must_match_columns() {
        let err = InsertBuilder::into("Books")
            .unwrap()
            .columns(["ID", "title"])
            .unwrap()
            .rows([vec![Value::Int(1)]])
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidArgument { .. }));
        assert_eq!(err.chain(), ["into", "columns", "rows"]);
    }

    #[test]
    fn test_entries_conflict_with_rows() {
        let err = InsertBuilder::into("Books")
            .unwrap()
            .columns(["ID"])
            .unwrap()
            .rows([[1i64]])
            .unwrap()
            .entries([Entry::new()])
            .unwrap_err();
        assert!(matches!(err, BuildError::UnexpectedCall { .. }));
    }
}
