//! Bindable values and the named value store.
//!
//! `SqlValue` is the only value type that travels through the buffers: every
//! backend knows how to bind it, every dump knows how to print it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A single positional value bound to an insert placeholder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum SqlValue {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            SqlValue::Real(v) => Some(*v as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Null => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Integer(v) => Some(*v as f64),
            SqlValue::Real(v) => Some(*v),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Null => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Render as one RFC-4180 CSV field.
    pub fn to_csv_field(&self) -> String {
        match self {
            SqlValue::Null => String::new(),
            SqlValue::Integer(v) => v.to_string(),
            SqlValue::Real(v) => v.to_string(),
            SqlValue::Text(s) => csv_escape(s),
        }
    }
}

pub(crate) fn csv_escape(s: &str) -> String {
    if s.contains(&[',', '"', '\n', '\r'][..]) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(v) => write!(f, "{}", v),
            SqlValue::Real(v) => write!(f, "{}", v),
            SqlValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value, ValueRef};
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl From<rusqlite::types::ValueRef<'_>> for SqlValue {
    fn from(v: rusqlite::types::ValueRef<'_>) -> Self {
        use rusqlite::types::ValueRef;
        match v {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(r) => SqlValue::Real(r),
            ValueRef::Text(t) | ValueRef::Blob(t) => {
                SqlValue::Text(String::from_utf8_lossy(t).into_owned())
            }
        }
    }
}

/// Named value lookup used by bound-value inserts.
///
/// Absence is meaningful: the column's default applies, or the row aborts.
pub trait ValueStore: Send + Sync {
    fn value(&self, name: &str) -> Option<SqlValue>;
}

/// Thread-safe in-memory value store
#[derive(Debug, Default)]
pub struct InMemoryValueStore {
    values: RwLock<HashMap<String, SqlValue>>,
}

impl InMemoryValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<SqlValue>) {
        self.values.write().insert(name.into(), value.into());
    }

    pub fn remove(&self, name: &str) -> Option<SqlValue> {
        self.values.write().remove(name)
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl ValueStore for InMemoryValueStore {
    fn value(&self, name: &str) -> Option<SqlValue> {
        self.values.read().get(name).cloned()
    }
}

impl<F> ValueStore for F
where
    F: Fn(&str) -> Option<SqlValue> + Send + Sync,
{
    fn value(&self, name: &str) -> Option<SqlValue> {
        self(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(SqlValue::Null.to_csv_field(), "");
        assert_eq!(SqlValue::Integer(-4).to_csv_field(), "-4");
        assert_eq!(SqlValue::from("plain").to_csv_field(), "plain");
        assert_eq!(SqlValue::from("a,b").to_csv_field(), "\"a,b\"");
        assert_eq!(SqlValue::from("say \"hi\"").to_csv_field(), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(SqlValue::Real(3.9).as_i64(), Some(3));
        assert_eq!(SqlValue::from(" 12 ").as_i64(), Some(12));
        assert_eq!(SqlValue::Integer(2).as_f64(), Some(2.0));
        assert_eq!(SqlValue::Null.as_f64(), None);
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryValueStore::new();
        assert!(store.value("temp").is_none());
        store.set("temp", 21.5);
        assert_eq!(store.value("temp"), Some(SqlValue::Real(21.5)));
        store.remove("temp");
        assert!(store.is_empty());
    }

    #[test]
    fn test_closure_store() {
        let lookup = |name: &str| (name == "x").then_some(SqlValue::Integer(1));
        assert_eq!(lookup.value("x"), Some(SqlValue::Integer(1)));
        assert_eq!(lookup.value("y"), None);
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some("v")), SqlValue::Text("v".into()));
    }
}
