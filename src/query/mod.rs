//! Select-clause nodes and the collectors compiled from them.

pub mod ast;
pub mod collector;

pub use ast::{
    AggregationFunction, AggregationNode, EntityNode, PropertyNode, SelectClause, SelectItem,
};
pub use collector::{
    Collector, CollectorGenerator, CompiledSelect, EntityCollector, ResultValue, StoreContext,
    ValueCollector, aggregation_type,
};
