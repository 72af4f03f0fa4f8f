//! Entity keys and hydrated entity representations.

use crate::db::types::Value;
use crate::error::{DbError, DbResult};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Primary key value. Only integer and text keys are supported.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum KeyValue {
    Integer(i64),
    Text(String),
}

impl TryFrom<Value> for KeyValue {
    type Error = DbError;

    fn try_from(value: Value) -> DbResult<Self> {
        match value {
            Value::Integer(v) => Ok(KeyValue::Integer(v)),
            Value::Text(s) => Ok(KeyValue::Text(s)),
            other => Err(DbError::invalid_input(format!(
                "Unsupported primary key value: {:?}",
                other
            ))),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Integer(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Text(v)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Integer(v) => write!(f, "{}", v),
            KeyValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Logical identity of an entity: `(type name, primary key)`, compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    type_name: Arc<str>,
    id: KeyValue,
}

impl CacheKey {
    pub fn new(type_name: impl Into<Arc<str>>, id: impl Into<KeyValue>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn id(&self) -> &KeyValue {
        &self.id
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_name, self.id)
    }
}

/// Property bag of a hydrated entity, in mapping order.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityData {
    key: CacheKey,
    values: Vec<(String, Value)>,
}

impl EntityData {
    pub fn new(key: CacheKey, values: Vec<(String, Value)>) -> Self {
        Self { key, values }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == property)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::with_capacity(self.values.len());
        for (name, value) in &self.values {
            map.insert(
                name.clone(),
                serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
            );
        }
        serde_json::Value::Object(map)
    }
}

/// An entity produced by result materialization.
///
/// Loaded entities share their property bag with the entity cache; a lazy
/// stub carries only its key and is resolved by the entity layer.
#[derive(Debug, Clone)]
pub struct Entity {
    key: CacheKey,
    data: Option<Arc<EntityData>>,
}

impl Entity {
    pub fn loaded(data: Arc<EntityData>) -> Self {
        Self {
            key: data.key().clone(),
            data: Some(data),
        }
    }

    pub fn stub(key: CacheKey) -> Self {
        Self { key, data: None }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn type_name(&self) -> &str {
        self.key.type_name()
    }

    pub fn id(&self) -> &KeyValue {
        self.key.id()
    }

    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&Arc<EntityData>> {
        self.data.as_ref()
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|data| data.get(property))
    }

    /// True if both entities share the same property bag instance.
    pub fn same_representation(&self, other: &Entity) -> bool {
        match (&self.data, &other.data) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
