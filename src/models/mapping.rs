//! Entity mapping metadata.
//!
//! A mapping binds a logical entity type name to a table, an id column and an
//! ordered list of typed property columns. Mappings are read-only once
//! registered with a store.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ID_PROPERTY: &str = "id";
pub const DEFAULT_ID_TYPE: &str = "long";

/// Primary key descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// Property name the id is exposed under (default: "id").
    pub name: String,
    pub column: String,
    /// Mapping type name resolved through the dialect (default: "long").
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,
}

impl IdMapping {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            name: DEFAULT_ID_PROPERTY.to_string(),
            column: column.into(),
            type_name: DEFAULT_ID_TYPE.to_string(),
            sequence: None,
        }
    }

    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }

    pub fn with_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }
}

/// A mapped property column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyMapping {
    pub name: String,
    pub column: String,
    pub type_name: String,
    pub nullable: bool,
}

impl PropertyMapping {
    pub fn new(
        name: impl Into<String>,
        column: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            type_name: type_name.into(),
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMapping {
    pub type_name: String,
    pub table_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub id: IdMapping,
    pub properties: Vec<PropertyMapping>,
}

#[derive(Deserialize)]
struct MappingDefinition {
    table: String,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    id: Option<IdDefinition>,
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct IdDefinition {
    #[serde(default)]
    column: Option<String>,
    #[serde(default, rename = "type")]
    type_name: Option<String>,
    #[serde(default)]
    sequence: Option<String>,
}

#[derive(Deserialize)]
struct PropertyDefinition {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    column: Option<String>,
    #[serde(default)]
    nullable: Option<bool>,
}

impl EntityMapping {
    pub fn new(
        type_name: impl Into<String>,
        table_name: impl Into<String>,
        id: IdMapping,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            table_name: table_name.into(),
            schema_name: None,
            id,
            properties: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = Some(schema_name.into());
        self
    }

    pub fn with_property(mut self, property: PropertyMapping) -> Self {
        self.properties.push(property);
        self
    }

    /// Build a mapping from its JSON definition.
    ///
    /// ```text
    /// {
    ///   "table": "author",
    ///   "id": {"column": "author_id", "sequence": "author_id"},
    ///   "properties": {
    ///     "name": {"type": "string", "column": "author_name", "nullable": false}
    ///   }
    /// }
    /// ```
    ///
    /// Property order follows the definition. A missing column defaults to the
    /// property name, a missing id to column "id" of type "long".
    pub fn from_definition(
        type_name: impl Into<String>,
        definition: &serde_json::Value,
    ) -> DbResult<Self> {
        let type_name = type_name.into();
        let def: MappingDefinition = serde_json::from_value(definition.clone()).map_err(|e| {
            DbError::mapping(format!("Invalid mapping definition: {}", e), &type_name)
        })?;

        let id = match def.id {
            Some(id) => IdMapping {
                name: DEFAULT_ID_PROPERTY.to_string(),
                column: id.column.unwrap_or_else(|| DEFAULT_ID_PROPERTY.to_string()),
                type_name: id.type_name.unwrap_or_else(|| DEFAULT_ID_TYPE.to_string()),
                sequence: id.sequence,
            },
            None => IdMapping::new(DEFAULT_ID_PROPERTY),
        };

        let mut properties = Vec::with_capacity(def.properties.len());
        for (name, value) in def.properties {
            if name == id.name {
                return Err(DbError::mapping(
                    format!("Property '{}' collides with the id property", name),
                    &type_name,
                ));
            }
            let prop: PropertyDefinition = serde_json::from_value(value).map_err(|e| {
                DbError::mapping(
                    format!("Invalid definition for property '{}': {}", name, e),
                    &type_name,
                )
            })?;
            properties.push(PropertyMapping {
                column: prop.column.unwrap_or_else(|| name.clone()),
                name,
                type_name: prop.type_name,
                nullable: prop.nullable.unwrap_or(true),
            });
        }

        Ok(Self {
            type_name,
            table_name: def.table,
            schema_name: def.schema,
            id,
            properties,
        })
    }

    pub fn property(&self, name: &str) -> Option<&PropertyMapping> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Declared type name of a property, including the id property.
    pub fn property_type(&self, name: &str) -> Option<&str> {
        if name == self.id.name {
            return Some(&self.id.type_name);
        }
        self.property(name).map(|p| p.type_name.as_str())
    }

    /// Like [`property_type`](Self::property_type) but fails with a mapping error.
    pub fn require_property_type(&self, name: &str) -> DbResult<&str> {
        self.property_type(name).ok_or_else(|| {
            DbError::mapping(format!("Unknown property '{}'", name), &self.type_name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn author_definition() -> serde_json::Value {
        json!({
            "table": "author",
            "id": {"column": "author_id", "sequence": "author_id"},
            "properties": {
                "name": {"type": "string", "column": "author_name", "nullable": false},
                "age": {"type": "integer"},
                "bio": {"type": "text", "column": "author_bio"}
            }
        })
    }

    #[test]
    fn test_from_definition() {
        let mapping = EntityMapping::from_definition("Author", &author_definition()).unwrap();
        assert_eq!(mapping.type_name, "Author");
        assert_eq!(mapping.table_name, "author");
        assert_eq!(mapping.id.column, "author_id");
        assert_eq!(mapping.id.type_name, "long");
        assert_eq!(mapping.id.sequence.as_deref(), Some("author_id"));

        let names: Vec<_> = mapping.properties.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["name", "age", "bio"]);

        let name = mapping.property("name").unwrap();
        assert_eq!(name.column, "author_name");
        assert!(!name.nullable);
        let age = mapping.property("age").unwrap();
        assert_eq!(age.column, "age");
        assert!(age.nullable);
    }

    #[test]
    fn test_default_id() {
        let mapping =
            EntityMapping::from_definition("Book", &json!({"table": "book"})).unwrap();
        assert_eq!(mapping.id.column, "id");
        assert!(mapping.properties.is_empty());
    }

    #[test]
    fn test_property_type_includes_id() {
        let mapping = EntityMapping::from_definition("Author", &author_definition()).unwrap();
        assert_eq!(mapping.property_type("id"), Some("long"));
        assert_eq!(mapping.property_type("name"), Some("string"));
        assert_eq!(mapping.property_type("missing"), None);
        assert!(matches!(
            mapping.require_property_type("missing"),
            Err(DbError::Mapping { .. })
        ));
    }

    #[test]
    fn test_invalid_definition() {
        let err = EntityMapping::from_definition("Bad", &json!({"properties": {}})).unwrap_err();
        assert!(matches!(err, DbError::Mapping { ref entity, .. } if entity == "Bad"));

        let err = EntityMapping::from_definition(
            "Bad",
            &json!({"table": "bad", "properties": {"name": {"column": "n"}}}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_id_collision_rejected() {
        let err = EntityMapping::from_definition(
            "Bad",
            &json!({"table": "bad", "properties": {"id": {"type": "long"}}}),
        )
        .unwrap_err();
        assert!(matches!(err, DbError::Mapping { .. }));
    }

    #[test]
    fn test_builder() {
        let mapping = EntityMapping::new("Author", "author", IdMapping::new("author_id"))
            .with_schema("main")
            .with_property(PropertyMapping::new("name", "author_name", "string").not_null());
        assert_eq!(mapping.schema_name.as_deref(), Some("main"));
        assert!(!mapping.properties[0].nullable);
    }
}
