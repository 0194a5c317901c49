//! Record trait and query filters

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// A value stored in the index table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for IndexValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Comparison operator for a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOp {
    pub(crate) fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// A filter over one indexed field
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    /// Equality filter shorthand
    pub fn eq(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }
}

/// A persistable entity
///
/// `collection_name` doubles as the SQLite table name, so it must be a plain
/// lowercase identifier.
pub trait Record: Serialize + DeserializeOwned + Send + 'static {
    /// Primary key
    fn id(&self) -> &str;

    /// Last modification time (Unix ms)
    fn updated_at(&self) -> i64;

    /// Table the record lives in
    fn collection_name() -> &'static str;

    /// Fields mirrored into the index table for filtering
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}
