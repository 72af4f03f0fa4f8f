//! Typed column extraction.
//!
//! # Architecture
//!
//! Column reads use a two-phase approach, the same way for every driver:
//! 1. `Dialect::get_type` classifies a mapping type name ("long", "string", ...)
//!    into a `ValueType`
//! 2. The row implementation decodes the column at a resolved index as that type
//!
//! Result cursors are abstracted by [`ResultRow`], which only knows how to find
//! a column by alias and decode a column by index.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row};
use std::collections::HashMap;
use std::fmt;

// =============================================================================
// Values
// =============================================================================

/// Logical type a column is decoded as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Integer,
    Float,
    Text,
    Boolean,
    Binary,
}

impl ValueType {
    /// Decode the column at `index` of `row` as this type.
    pub fn get<R: ResultRow + ?Sized>(self, row: &R, index: usize) -> DbResult<Value> {
        row.get_value(index, self)
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ValueType::Integer | ValueType::Float)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Integer => "Integer",
            ValueType::Float => "Float",
            ValueType::Text => "Text",
            ValueType::Boolean => "Boolean",
            ValueType::Binary => "Binary",
        };
        f.write_str(name)
    }
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

// =============================================================================
// Dialect type table
// =============================================================================

/// Maps mapping type names to the logical type used for extraction.
#[derive(Debug, Clone)]
pub struct Dialect {
    name: &'static str,
    types: HashMap<String, ValueType>,
}

impl Dialect {
    /// Dialect with the standard mapping type names.
    pub fn new(name: &'static str) -> Self {
        let mut types = HashMap::new();
        for alias in ["integer", "int", "long", "short", "byte", "bigint", "smallint"] {
            types.insert(alias.to_string(), ValueType::Integer);
        }
        for alias in ["float", "double", "real", "decimal", "numeric"] {
            types.insert(alias.to_string(), ValueType::Float);
        }
        for alias in [
            "string",
            "text",
            "character",
            "varchar",
            "char",
            "date",
            "time",
            "timestamp",
        ] {
            types.insert(alias.to_string(), ValueType::Text);
        }
        for alias in ["boolean", "bool"] {
            types.insert(alias.to_string(), ValueType::Boolean);
        }
        for alias in ["binary", "blob", "bytes"] {
            types.insert(alias.to_string(), ValueType::Binary);
        }
        Self { name, types }
    }

    pub fn sqlite() -> Self {
        Self::new("sqlite")
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register an additional type name, replacing any previous binding.
    pub fn register_type(&mut self, type_name: impl Into<String>, value_type: ValueType) {
        self.types
            .insert(type_name.into().to_lowercase(), value_type);
    }

    /// Resolve a mapping type name.
    pub fn get_type(&self, type_name: &str) -> DbResult<ValueType> {
        self.types
            .get(&type_name.to_lowercase())
            .copied()
            .ok_or_else(|| {
                DbError::invalid_input(format!(
                    "Unknown column type '{}' for dialect {}",
                    type_name, self.name
                ))
            })
    }
}

// =============================================================================
// Result rows
// =============================================================================

/// One row of a tabular result cursor.
pub trait ResultRow {
    /// Resolve a column alias to its index.
    fn find_column(&self, alias: &str) -> DbResult<usize>;

    /// Decode the column at `index` as `value_type`. SQL NULL decodes to `Value::Null`.
    fn get_value(&self, index: usize, value_type: ValueType) -> DbResult<Value>;
}

impl ResultRow for SqliteRow {
    fn find_column(&self, alias: &str) -> DbResult<usize> {
        self.columns()
            .iter()
            .position(|col| col.name() == alias)
            .ok_or_else(|| DbError::unknown_column_alias(alias))
    }

    fn get_value(&self, index: usize, value_type: ValueType) -> DbResult<Value> {
        sqlite::decode_column(self, index, value_type)
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, value_type: ValueType) -> DbResult<Value> {
        let value = match value_type {
            ValueType::Integer => row.try_get::<Option<i64>, _>(idx)?.map(Value::Integer),
            ValueType::Float => row.try_get::<Option<f64>, _>(idx)?.map(Value::Float),
            ValueType::Text => row.try_get::<Option<String>, _>(idx)?.map(Value::Text),
            ValueType::Boolean => row.try_get::<Option<bool>, _>(idx)?.map(Value::Boolean),
            ValueType::Binary => row.try_get::<Option<Vec<u8>>, _>(idx)?.map(Value::Bytes),
        };
        Ok(value.unwrap_or(Value::Null))
    }
}
