//! Persisted resource contract
//!
//! A [`Resource`] knows its table, its key column and how to turn itself
//! into column values. The generic reader and writer build SQL from that.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;

/// A value bound into a dynamically built statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(Option<String>),
    Int(i64),
    Blob(Vec<u8>),
    Time(DateTime<Utc>),
}

impl SqlValue {
    /// Empty strings are stored as NULL so unique indexes ignore them.
    pub fn nullable_text(value: &str) -> Self {
        if value.is_empty() {
            SqlValue::Text(None)
        } else {
            SqlValue::Text(Some(value.to_string()))
        }
    }

    pub fn optional_text(value: &Option<String>) -> Self {
        Self::nullable_text(value.as_deref().unwrap_or_default())
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(Some(v.to_string()))
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(Some(v))
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(Some(v.clone()))
    }
}

impl From<Option<String>> for SqlValue {
    fn from(v: Option<String>) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Time(v)
    }
}

/// Bind a sequence of [`SqlValue`]s onto a sqlx query builder.
macro_rules! bind_values {
    ($query:expr, $values:expr) => {{
        let mut query = $query;
        for value in $values {
            query = match value {
                $crate::store::SqlValue::Text(v) => query.bind(v),
                $crate::store::SqlValue::Int(v) => query.bind(v),
                $crate::store::SqlValue::Blob(v) => query.bind(v),
                $crate::store::SqlValue::Time(v) => query.bind(v),
            };
        }
        query
    }};
}
pub(crate) use bind_values;

/// Row count cap for search operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Unbounded,
    Max(i64),
}

impl Limit {
    /// `None` takes the repository default; zero or negative is unbounded.
    pub fn resolve(requested: Option<i64>, default_limit: i64) -> Limit {
        match requested.unwrap_or(default_limit) {
            n if n <= 0 => Limit::Unbounded,
            n => Limit::Max(n),
        }
    }

    /// SQLite treats a negative LIMIT as no limit.
    pub(crate) fn as_sql(&self) -> i64 {
        match self {
            Limit::Unbounded => -1,
            Limit::Max(n) => *n,
        }
    }
}

pub trait Resource: for<'r> sqlx::FromRow<'r, SqliteRow> + Send + Unpin {
    const TABLE: &'static str;
    const KEY_COLUMN: &'static str = "public_id";
    /// Name recorded in oplog entries
    const RESOURCE_TYPE: &'static str;
    /// Rows carry a `version` column bumped on every update
    const VERSIONED: bool = false;

    fn public_id(&self) -> &str;

    /// Column/value pairs written on insert.
    fn columns(&self) -> Vec<(&'static str, SqlValue)>;

    /// Column and new value for a field-mask path; `None` when the path is
    /// unknown or immutable.
    fn mutable_column(&self, field: &str) -> Option<(&'static str, SqlValue)>;
}
