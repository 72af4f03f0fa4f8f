//! Parsed select-clause nodes.
//!
//! The query parser lives outside this crate; it hands over a [`SelectClause`]
//! whose items are one of three node kinds. Each node knows its result label
//! and the column alias the generated SQL selects it under.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregationFunction {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregationFunction::Count => "count",
            AggregationFunction::Sum => "sum",
            AggregationFunction::Avg => "avg",
            AggregationFunction::Min => "min",
            AggregationFunction::Max => "max",
        }
    }
}

impl fmt::Display for AggregationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Select a whole entity, e.g. `select a from Author a`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityNode {
    /// Entity type name or query alias.
    pub entity: String,
    /// Read every property column from the row instead of producing a stub.
    #[serde(default)]
    pub load_aggressive: bool,
}

impl EntityNode {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            load_aggressive: false,
        }
    }

    pub fn eager(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            load_aggressive: true,
        }
    }

    pub fn id_alias(&self, id_property: &str) -> String {
        format!("{}_{}", self.entity, id_property)
    }

    pub fn property_alias(&self, property: &str) -> String {
        format!("{}_{}", self.entity, property)
    }
}

/// Select one property, e.g. `select a.name from Author a`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyNode {
    pub entity: String,
    pub property: String,
}

impl PropertyNode {
    pub fn new(entity: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            property: property.into(),
        }
    }
}

/// Select an aggregate, e.g. `select max(a.age) from Author a`.
///
/// `property` is `None` for `count(a)`, which counts the entity's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationNode {
    pub function: AggregationFunction,
    pub entity: String,
    #[serde(default)]
    pub property: Option<String>,
}

impl AggregationNode {
    pub fn new(
        function: AggregationFunction,
        entity: impl Into<String>,
        property: impl Into<String>,
    ) -> Self {
        Self {
            function,
            entity: entity.into(),
            property: Some(property.into()),
        }
    }

    pub fn count(entity: impl Into<String>) -> Self {
        Self {
            function: AggregationFunction::Count,
            entity: entity.into(),
            property: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SelectItem {
    Aggregation(AggregationNode),
    Property(PropertyNode),
    Entity(EntityNode),
}

impl SelectItem {
    /// Label the item's value is reported under in a multi-item result.
    pub fn result_label(&self) -> String {
        match self {
            SelectItem::Entity(node) => node.entity.clone(),
            SelectItem::Property(node) => format!("{}.{}", node.entity, node.property),
            SelectItem::Aggregation(node) => match &node.property {
                Some(property) => format!("{}({}.{})", node.function, node.entity, property),
                None => format!("{}({})", node.function, node.entity),
            },
        }
    }

    /// Column alias for property and aggregation nodes.
    ///
    /// Entity nodes select several columns; their aliases are derived from the
    /// mapping, see [`EntityNode::id_alias`]. `id_property` names the property
    /// an aggregation without explicit property runs over.
    pub fn column_alias(&self, id_property: &str) -> String {
        match self {
            SelectItem::Entity(node) => node.id_alias(id_property),
            SelectItem::Property(node) => format!("{}_{}", node.entity, node.property),
            SelectItem::Aggregation(node) => format!(
                "{}_{}_{}",
                node.function,
                node.entity,
                node.property.as_deref().unwrap_or(id_property)
            ),
        }
    }

    /// Entity name or alias the node targets.
    pub fn target(&self) -> &str {
        match self {
            SelectItem::Entity(node) => &node.entity,
            SelectItem::Property(node) => &node.entity,
            SelectItem::Aggregation(node) => &node.entity,
        }
    }
}

impl From<EntityNode> for SelectItem {
    fn from(node: EntityNode) -> Self {
        SelectItem::Entity(node)
    }
}

impl From<PropertyNode> for SelectItem {
    fn from(node: PropertyNode) -> Self {
        SelectItem::Property(node)
    }
}

impl From<AggregationNode> for SelectItem {
    fn from(node: AggregationNode) -> Self {
        SelectItem::Aggregation(node)
    }
}

/// Ordered select-clause items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectClause {
    pub items: Vec<SelectItem>,
}

impl SelectClause {
    pub fn new(items: Vec<SelectItem>) -> Self {
        Self { items }
    }

    pub fn single(item: impl Into<SelectItem>) -> Self {
        Self {
            items: vec![item.into()],
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
