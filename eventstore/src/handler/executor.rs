//! The transactional executor statements run against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StatementError;
use crate::types::{AggregateId, AggregateType, EventType, InstanceId, ResourceOwner};

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// `BOOLEAN`
    Bool(bool),
    /// `BIGINT`
    Int(i64),
    /// `DOUBLE PRECISION`
    Float(f64),
    /// `TEXT`
    Text(String),
    /// `TEXT[]`
    TextArray(Vec<String>),
    /// `BYTEA`
    Bytes(Vec<u8>),
    /// `TIMESTAMPTZ`
    Timestamp(DateTime<Utc>),
    /// `JSONB`
    Json(serde_json::Value),
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u64> for SqlValue {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<String>> for SqlValue {
    fn from(value: Vec<String>) -> Self {
        Self::TextArray(value)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

macro_rules! identifier_values {
    ($($name:ident),+ $(,)?) => {
        $(
            impl From<$name> for SqlValue {
                fn from(value: $name) -> Self {
                    Self::Text(value.as_str().to_string())
                }
            }

            impl From<&$name> for SqlValue {
                fn from(value: &$name) -> Self {
                    Self::Text(value.as_str().to_string())
                }
            }
        )+
    };
}

identifier_values!(AggregateId, AggregateType, EventType, InstanceId, ResourceOwner);

/// Runs parameterized SQL. Implemented by projection store transactions.
#[async_trait]
pub trait Executor: Send {
    /// Executes `sql` with positional `args` (`$1`, `$2`, ...) and returns the
    /// number of affected rows.
    async fn exec(&mut self, sql: &str, args: &[SqlValue]) -> Result<u64, StatementError>;
}
