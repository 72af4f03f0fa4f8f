//! Select-clause compilation and row materialization.
//!
//! [`CollectorGenerator`] turns a [`SelectClause`] into a [`CompiledSelect`]:
//! one immutable [`Collector`] per item, bound to the column alias and value
//! type it extracts. Compiled selects hold no reference to the store, so they
//! are `Send + Sync` and can be shared by tasks materializing different rows.

use crate::cache::EntityCache;
use crate::db::types::{Dialect, ResultRow, Value, ValueType};
use crate::error::{DbError, DbResult};
use crate::models::{CacheKey, Entity, EntityData, EntityMapping, KeyValue};
use crate::query::ast::{
    AggregationFunction, AggregationNode, EntityNode, PropertyNode, SelectClause, SelectItem,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// What collectors need from the store that runs them.
pub trait StoreContext: Send + Sync {
    fn dialect(&self) -> &Dialect;

    /// The identity map, `None` when caching is disabled.
    fn cache(&self) -> Option<&EntityCache>;

    fn entity_mapping(&self, name: &str) -> DbResult<Arc<EntityMapping>>;

    /// Produce the entity for `key`, registering `data` in the cache when
    /// caching is enabled. Without data the result is a lazy stub.
    fn create(
        &self,
        type_name: &str,
        key: CacheKey,
        data: Option<Arc<EntityData>>,
    ) -> DbResult<Entity>;
}

/// One materialized select item.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultValue {
    Entity(Entity),
    Value(Value),
    /// A multi-item row, in select-clause order.
    Record(Vec<(String, ResultValue)>),
}

impl ResultValue {
    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            ResultValue::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ResultValue::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Field of a record by result label.
    pub fn field(&self, label: &str) -> Option<&ResultValue> {
        match self {
            ResultValue::Record(fields) => fields
                .iter()
                .find(|(name, _)| name == label)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ResultValue::Entity(entity) => match entity.data() {
                Some(data) => data.to_json(),
                None => serde_json::json!({
                    "type": entity.type_name(),
                    "id": entity.id(),
                }),
            },
            ResultValue::Value(value) => {
                serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
            }
            ResultValue::Record(fields) => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (label, value) in fields {
                    map.insert(label.clone(), value.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

/// Materializes a whole entity from its id column and, when eager, its
/// property columns.
#[derive(Debug, Clone)]
pub struct EntityCollector {
    mapping: Arc<EntityMapping>,
    id_alias: String,
    id_type: ValueType,
    eager: bool,
    /// (property name, column alias, type) in mapping order.
    properties: Vec<(String, String, ValueType)>,
}

impl EntityCollector {
    pub fn type_name(&self) -> &str {
        &self.mapping.type_name
    }

    pub fn id_alias(&self) -> &str {
        &self.id_alias
    }

    pub fn is_eager(&self) -> bool {
        self.eager
    }

    fn collect<R, S>(&self, row: &R, ctx: &S) -> DbResult<ResultValue>
    where
        R: ResultRow + ?Sized,
        S: StoreContext + ?Sized,
    {
        let index = row.find_column(&self.id_alias)?;
        let id = self.id_type.get(row, index)?;
        if id.is_null() {
            // Outer joins yield rows without the entity.
            return Ok(ResultValue::Value(Value::Null));
        }
        let key = CacheKey::new(self.type_name(), KeyValue::try_from(id)?);

        if let Some(cache) = ctx.cache() {
            if let Some(data) = cache.get(&key)? {
                trace!(key = %key, "Entity served from cache");
                return ctx
                    .create(self.type_name(), key, Some(data))
                    .map(ResultValue::Entity);
            }
        }

        let data = if self.eager {
            let mut values = Vec::with_capacity(self.properties.len());
            for (name, alias, value_type) in &self.properties {
                let index = row.find_column(alias)?;
                values.push((name.clone(), value_type.get(row, index)?));
            }
            Some(Arc::new(EntityData::new(key.clone(), values)))
        } else {
            None
        };

        ctx.create(self.type_name(), key, data)
            .map(ResultValue::Entity)
    }
}

/// Reads one typed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueCollector {
    alias: String,
    value_type: ValueType,
}

impl ValueCollector {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    fn collect<R: ResultRow + ?Sized>(&self, row: &R) -> DbResult<ResultValue> {
        let index = row.find_column(&self.alias)?;
        self.value_type.get(row, index).map(ResultValue::Value)
    }
}

/// Compiled extraction unit for one select item.
#[derive(Debug, Clone)]
pub enum Collector {
    Entity(EntityCollector),
    Property(ValueCollector),
    Aggregation(ValueCollector),
}

impl Collector {
    pub fn collect<R, S>(&self, row: &R, ctx: &S) -> DbResult<ResultValue>
    where
        R: ResultRow + ?Sized,
        S: StoreContext + ?Sized,
    {
        match self {
            Collector::Entity(collector) => collector.collect(row, ctx),
            Collector::Property(collector) | Collector::Aggregation(collector) => {
                collector.collect(row)
            }
        }
    }

    /// Value type for property and aggregation collectors.
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Collector::Entity(_) => None,
            Collector::Property(c) | Collector::Aggregation(c) => Some(c.value_type),
        }
    }
}

/// Compiled select clause.
#[derive(Debug, Clone)]
pub enum CompiledSelect {
    /// Single-item clause: each row materializes to the item's value.
    Single(Collector),
    /// Multi-item clause: each row materializes to a record.
    Multiple(Vec<(String, Collector)>),
}

impl CompiledSelect {
    pub fn collect<R, S>(&self, row: &R, ctx: &S) -> DbResult<ResultValue>
    where
        R: ResultRow + ?Sized,
        S: StoreContext + ?Sized,
    {
        match self {
            CompiledSelect::Single(collector) => collector.collect(row, ctx),
            CompiledSelect::Multiple(collectors) => {
                let mut fields = Vec::with_capacity(collectors.len());
                for (label, collector) in collectors {
                    fields.push((label.clone(), collector.collect(row, ctx)?));
                }
                Ok(ResultValue::Record(fields))
            }
        }
    }

    /// Materialize rows in cursor order. The first failing row aborts the
    /// whole result.
    pub fn collect_all<R, S>(&self, rows: &[R], ctx: &S) -> DbResult<Vec<ResultValue>>
    where
        R: ResultRow,
        S: StoreContext + ?Sized,
    {
        let mut results = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            let value = self.collect(row, ctx).inspect_err(|e| {
                debug!(row = index, error = %e, "Row materialization failed");
            })?;
            results.push(value);
        }
        Ok(results)
    }

    pub fn len(&self) -> usize {
        match self {
            CompiledSelect::Single(_) => 1,
            CompiledSelect::Multiple(collectors) => collectors.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compiles select clauses against a store's mappings and dialect.
pub struct CollectorGenerator<'a, S: StoreContext + ?Sized> {
    ctx: &'a S,
    aliases: HashMap<String, String>,
}

impl<'a, S: StoreContext + ?Sized> CollectorGenerator<'a, S> {
    pub fn new(ctx: &'a S) -> Self {
        Self {
            ctx,
            aliases: HashMap::new(),
        }
    }

    /// Resolve query aliases (`a` in `from Author a`) to entity type names.
    pub fn with_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>, entity: impl Into<String>) -> Self {
        self.aliases.insert(alias.into(), entity.into());
        self
    }

    pub fn compile(&self, clause: &SelectClause) -> DbResult<CompiledSelect> {
        match clause.items.as_slice() {
            [] => Err(DbError::invalid_input("select clause has no items")),
            [item] => self.compile_item(item).map(CompiledSelect::Single),
            items => {
                let mut collectors = Vec::with_capacity(items.len());
                for item in items {
                    collectors.push((item.result_label(), self.compile_item(item)?));
                }
                Ok(CompiledSelect::Multiple(collectors))
            }
        }
    }

    fn mapping_for(&self, name: &str) -> DbResult<Arc<EntityMapping>> {
        let resolved = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        self.ctx.entity_mapping(resolved)
    }

    fn resolve_type(&self, mapping: &EntityMapping, property: &str) -> DbResult<ValueType> {
        let type_name = mapping.require_property_type(property)?;
        self.ctx.dialect().get_type(type_name)
    }

    fn compile_item(&self, item: &SelectItem) -> DbResult<Collector> {
        match item {
            SelectItem::Entity(node) => self.compile_entity(node),
            SelectItem::Property(node) => self.compile_property(node, item),
            SelectItem::Aggregation(node) => self.compile_aggregation(node, item),
        }
    }

    fn compile_entity(&self, node: &EntityNode) -> DbResult<Collector> {
        let mapping = self.mapping_for(&node.entity)?;
        let id_type = self.ctx.dialect().get_type(&mapping.id.type_name)?;
        let mut properties = Vec::with_capacity(mapping.properties.len());
        if node.load_aggressive {
            for property in &mapping.properties {
                properties.push((
                    property.name.clone(),
                    node.property_alias(&property.name),
                    self.ctx.dialect().get_type(&property.type_name)?,
                ));
            }
        }
        Ok(Collector::Entity(EntityCollector {
            id_alias: node.id_alias(&mapping.id.name),
            id_type,
            eager: node.load_aggressive,
            properties,
            mapping,
        }))
    }

    fn compile_property(&self, node: &PropertyNode, item: &SelectItem) -> DbResult<Collector> {
        let mapping = self.mapping_for(&node.entity)?;
        let value_type = self.resolve_type(&mapping, &node.property)?;
        Ok(Collector::Property(ValueCollector {
            alias: item.column_alias(&mapping.id.name),
            value_type,
        }))
    }

    fn compile_aggregation(
        &self,
        node: &AggregationNode,
        item: &SelectItem,
    ) -> DbResult<Collector> {
        let mapping = self.mapping_for(&node.entity)?;
        let property = node.property.as_deref().unwrap_or(&mapping.id.name);
        let property_type = self.resolve_type(&mapping, property)?;
        let value_type = aggregation_type(node.function, property_type)?;
        Ok(Collector::Aggregation(ValueCollector {
            alias: item.column_alias(&mapping.id.name),
            value_type,
        }))
    }
}

/// Value type an aggregate produces over a property of `property_type`.
///
/// `count` is always Integer and `avg` always Float. `sum`, `min` and `max`
/// keep the property's type, which must be numeric.
pub fn aggregation_type(
    function: AggregationFunction,
    property_type: ValueType,
) -> DbResult<ValueType> {
    match function {
        AggregationFunction::Count => Ok(ValueType::Integer),
        AggregationFunction::Avg => Ok(ValueType::Float),
        AggregationFunction::Sum | AggregationFunction::Min | AggregationFunction::Max => {
            if property_type.is_numeric() {
                Ok(property_type)
            } else {
                Err(DbError::unsupported_aggregation(
                    function.as_str(),
                    property_type.to_string(),
                ))
            }
        }
    }
}
