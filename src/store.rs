//! Store façade.
//!
//! A [`Store`] owns one connection pool, one optional entity cache, the
//! dialect type table and the registry of entity mappings. Queries borrow a
//! pooled connection, fetch the full result set, hand the connection back and
//! then run the compiled collectors over the rows in cursor order.
//!
//! Share a store between tasks by wrapping it in an `Arc`.

use crate::cache::{CacheStats, EntityCache};
use crate::config::{CacheOptions, PoolOptions, StoreConfig};
use crate::db::driver::{Driver, SqliteDriver};
use crate::db::pool::{Connection, ConnectionPool};
use crate::db::types::Dialect;
use crate::error::{DbError, DbResult};
use crate::models::{CacheKey, Entity, EntityData, EntityMapping};
use crate::query::{CollectorGenerator, ResultValue, SelectClause, StoreContext};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

pub struct Store<D: Driver> {
    pool: ConnectionPool<D>,
    cache: Option<EntityCache>,
    dialect: Dialect,
    mappings: RwLock<HashMap<String, Arc<EntityMapping>>>,
}

impl<D: Driver> std::fmt::Debug for Store<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("pool", &self.pool)
            .field("cache", &self.cache)
            .field("dialect", &self.dialect.name())
            .finish_non_exhaustive()
    }
}

impl Store<SqliteDriver> {
    /// Open a SQLite-backed store from configuration and start the idle
    /// connection reaper.
    pub async fn connect_sqlite(config: &StoreConfig) -> DbResult<Self> {
        config.validate().map_err(DbError::invalid_input)?;
        let driver = SqliteDriver::new(&config.database_url)?;
        let store = Self::new(
            driver,
            config.pool_options(),
            config.cache_options(),
            Dialect::sqlite(),
        )?;
        store.pool.start_reaper();
        Ok(store)
    }
}

impl<D: Driver> Store<D> {
    pub fn new(
        driver: D,
        pool_options: PoolOptions,
        cache_options: CacheOptions,
        dialect: Dialect,
    ) -> DbResult<Self> {
        cache_options.validate().map_err(DbError::invalid_input)?;
        let pool = ConnectionPool::new(driver, pool_options)?;
        let cache = if cache_options.enabled {
            Some(EntityCache::new(cache_options.capacity)?)
        } else {
            None
        };
        info!(
            dialect = dialect.name(),
            cache_enabled = cache.is_some(),
            cache_capacity = cache_options.capacity,
            "Store created"
        );
        Ok(Self {
            pool,
            cache,
            dialect,
            mappings: RwLock::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &ConnectionPool<D> {
        &self.pool
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(EntityCache::stats)
    }

    /// Drop one entity from the identity map.
    pub fn evict(&self, key: &CacheKey) -> DbResult<bool> {
        match &self.cache {
            Some(cache) => cache.invalidate(key),
            None => Ok(false),
        }
    }

    /// Register an entity mapping.
    ///
    /// Every declared type must resolve through the dialect. A type name can
    /// only be defined once.
    pub fn define_entity(&self, mapping: EntityMapping) -> DbResult<()> {
        self.dialect.get_type(&mapping.id.type_name)?;
        for property in &mapping.properties {
            self.dialect.get_type(&property.type_name).map_err(|e| {
                DbError::mapping(
                    format!("Property '{}': {}", property.name, e),
                    &mapping.type_name,
                )
            })?;
        }

        let mut mappings = self
            .mappings
            .write()
            .map_err(|_| DbError::internal("Mapping registry lock poisoned"))?;
        if mappings.contains_key(&mapping.type_name) {
            return Err(DbError::mapping(
                "Entity is already defined",
                &mapping.type_name,
            ));
        }
        debug!(
            entity = %mapping.type_name,
            table = %mapping.table_name,
            properties = mapping.properties.len(),
            "Entity defined"
        );
        mappings.insert(mapping.type_name.clone(), Arc::new(mapping));
        Ok(())
    }

    /// Register an entity mapping from its JSON definition.
    pub fn define_entity_json(
        &self,
        type_name: &str,
        definition: &serde_json::Value,
    ) -> DbResult<()> {
        self.define_entity(EntityMapping::from_definition(type_name, definition)?)
    }

    pub fn mapping_names(&self) -> Vec<String> {
        self.mappings
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Borrow a pooled connection. Dropping it unreleased returns it to the pool.
    pub async fn get_connection(&self) -> DbResult<Connection<D>> {
        self.pool.get_connection().await
    }

    /// Run `sql` and materialize each row through the compiled `clause`.
    pub async fn query(&self, sql: &str, clause: &SelectClause) -> DbResult<Vec<ResultValue>> {
        self.query_with_aliases(sql, clause, HashMap::new()).await
    }

    /// Like [`query`](Self::query), resolving query aliases to entity names.
    pub async fn query_with_aliases(
        &self,
        sql: &str,
        clause: &SelectClause,
        aliases: HashMap<String, String>,
    ) -> DbResult<Vec<ResultValue>> {
        let compiled = CollectorGenerator::new(self)
            .with_aliases(aliases)
            .compile(clause)?;

        let conn = self.pool.get_connection().await?;
        let fetched = conn.fetch_all(sql).await;
        let released = conn.release();
        let rows = fetched?;
        released?;

        let results = compiled.collect_all(&rows, self)?;
        debug!(rows = results.len(), "Query materialized");
        Ok(results)
    }

    /// Run a statement on a pooled connection.
    pub async fn execute(&self, sql: &str) -> DbResult<u64> {
        let conn = self.pool.get_connection().await?;
        let result = conn.execute(sql).await;
        let released = conn.release();
        let affected = result?;
        released?;
        Ok(affected)
    }

    /// Close the pool and empty the cache.
    pub async fn close(&self) {
        self.pool.close().await;
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.clear() {
                warn!(error = %e, "Failed to clear entity cache on close");
            }
        }
        info!("Store closed");
    }
}

impl<D: Driver> StoreContext for Store<D> {
    fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    fn cache(&self) -> Option<&EntityCache> {
        self.cache.as_ref()
    }

    fn entity_mapping(&self, name: &str) -> DbResult<Arc<EntityMapping>> {
        let mappings = self
            .mappings
            .read()
            .map_err(|_| DbError::internal("Mapping registry lock poisoned"))?;
        mappings
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::mapping("Entity is not defined", name))
    }

    fn create(
        &self,
        type_name: &str,
        key: CacheKey,
        data: Option<Arc<EntityData>>,
    ) -> DbResult<Entity> {
        if key.type_name() != type_name {
            return Err(DbError::internal(format!(
                "Key {} does not belong to entity {}",
                key, type_name
            )));
        }
        match (data, &self.cache) {
            (Some(data), Some(cache)) => cache.put_if_absent(key, data).map(Entity::loaded),
            (Some(data), None) => Ok(Entity::loaded(data)),
            (None, _) => Ok(Entity::stub(key)),
        }
    }
}
