//! Data models for the store.
//!
//! This module re-exports the mapping metadata and entity types used
//! throughout the crate.

pub mod entity;
pub mod mapping;

pub use entity::{CacheKey, Entity, EntityData, KeyValue};
pub use mapping::{
    DEFAULT_ID_PROPERTY, DEFAULT_ID_TYPE, EntityMapping, IdMapping, PropertyMapping,
};
