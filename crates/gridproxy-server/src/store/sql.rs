//! Predicate combinator over [`sqlx::QueryBuilder`].
//!
//! Every method takes an optional value and appends nothing when it is
//! `None`, so filter translation is a flat list of calls instead of a chain
//! of `if let` branches. Values are always bound, never interpolated.

use sqlx::{Encode, Postgres, QueryBuilder, Type};

pub type Builder = QueryBuilder<'static, Postgres>;

/// Comparators usable with a single bound value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ge,
    Lt,
}

impl Cmp {
    fn operator(self) -> &'static str {
        match self {
            Cmp::Eq => " = ",
            Cmp::Ge => " >= ",
            Cmp::Lt => " < ",
        }
    }
}

/// Appends `AND ...` clauses to a query that already ends in a `WHERE`.
pub struct Predicates<'b> {
    qb: &'b mut Builder,
}

impl<'b> Predicates<'b> {
    /// Opens the clause list with `WHERE TRUE`.
    pub fn open(qb: &'b mut Builder) -> Self {
        qb.push(" WHERE TRUE");
        Self { qb }
    }

    /// `column <cmp> value`
    pub fn cmp<T>(&mut self, column: &str, cmp: Cmp, value: Option<T>) -> &mut Self
    where
        T: for<'q> Encode<'q, Postgres> + Type<Postgres> + Send + 'static,
    {
        if let Some(value) = value {
            self.qb
                .push(" AND ")
                .push(column)
                .push(cmp.operator())
                .push_bind(value);
        }
        self
    }

    /// Case-insensitive equality.
    pub fn eq_ci(&mut self, column: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.qb
                .push(" AND LOWER(")
                .push(column)
                .push(") = LOWER(")
                .push_bind(value.to_string())
                .push(")");
        }
        self
    }

    /// Case-insensitive substring match; `%` and `_` in the needle are literal.
    pub fn contains(&mut self, column: &str, needle: Option<&str>) -> &mut Self {
        if let Some(needle) = needle {
            self.qb
                .push(" AND ")
                .push(column)
                .push(" ILIKE ")
                .push_bind(format!("%{}%", escape_like(needle)))
                .push(" ESCAPE '\\'");
        }
        self
    }

    /// `column = ANY(values)`, skipped for an empty list.
    pub fn any_of(&mut self, column: &str, values: &[i64]) -> &mut Self {
        if !values.is_empty() {
            self.qb
                .push(" AND ")
                .push(column)
                .push(" = ANY(")
                .push_bind(values.to_vec())
                .push(")");
        }
        self
    }

    /// Free-form clause where every `?` is replaced by a binding of `value`.
    pub fn template<T>(&mut self, sql: &str, value: Option<T>) -> &mut Self
    where
        T: for<'q> Encode<'q, Postgres> + Type<Postgres> + Send + Clone + 'static,
    {
        if let Some(value) = value {
            self.qb.push(" AND ");
            let mut parts = sql.split('?');
            if let Some(first) = parts.next() {
                self.qb.push(first);
            }
            for part in parts {
                self.qb.push_bind(value.clone()).push(part);
            }
        }
        self
    }

    /// Picks `when_true` or `when_false` for a tri-state flag.
    pub fn flag(&mut self, flag: Option<bool>, when_true: &str, when_false: &str) -> &mut Self {
        if let Some(flag) = flag {
            self.qb
                .push(" AND ")
                .push(if flag { when_true } else { when_false });
        }
        self
    }
}

/// Escapes LIKE wildcards with a backslash.
pub fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Unsigned filter values are bound as BIGINT.
pub fn int(value: Option<u64>) -> Option<i64> {
    value.map(|v| i64::try_from(v).unwrap_or(i64::MAX))
}

pub fn ints(values: &[u64]) -> Vec<i64> {
    values
        .iter()
        .map(|v| i64::try_from(*v).unwrap_or(i64::MAX))
        .collect()
}

/// Columns are read as BIGINT and may be negative only on corrupt rows.
pub fn unsigned(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub fn narrow(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}
