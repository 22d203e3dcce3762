use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::schema::IndexSpec;

/// A document store able to run aggregation pipelines.
///
/// Stage documents are passed verbatim in aggregation-stage grammar
/// (`{"$match": {...}}`, `{"$limit": 1}`, ...).
pub trait DataSource: Send + Sync {
    fn ping(&self) -> Result<()>;

    fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: &[Value],
        ctx: &Context,
    ) -> Result<Vec<Value>>;

    fn insert_many(
        &self,
        database: &str,
        collection: &str,
        docs: Vec<Value>,
        ctx: &Context,
    ) -> Result<()>;

    fn create_collection(&self, database: &str, collection: &str) -> Result<()>;

    fn drop_indexes(&self, database: &str, collection: &str) -> Result<()>;

    fn create_index(&self, database: &str, collection: &str, index: &IndexSpec) -> Result<()>;

    fn drop_database(&self, database: &str) -> Result<()>;
}

/// Named data sources plus the defaults used to resolve them.
pub struct Connections {
    config: Config,
    sources: RwLock<HashMap<String, Arc<dyn DataSource>>>,
}

impl Connections {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with `source` registered under the configured default alias.
    pub fn with_default(config: Config, source: Arc<dyn DataSource>) -> Self {
        let connections = Self::new(config);
        connections.register(&connections.config.default_connection.clone(), source);
        connections
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register (or replace) the source for `alias`.
    pub fn register(&self, alias: &str, source: Arc<dyn DataSource>) {
        tracing::debug!(alias, "registering data source");
        self.sources
            .write()
            .unwrap()
            .insert(alias.to_string(), source);
    }

    pub fn get(&self, alias: Option<&str>) -> Result<Arc<dyn DataSource>> {
        let alias = alias.unwrap_or(&self.config.default_connection);
        self.sources
            .read()
            .unwrap()
            .get(alias)
            .cloned()
            .ok_or_else(|| Error::ConnectionNotFound(alias.to_string()))
    }

    /// Resolve `(database, alias)` to a handle on `collection`, falling back to
    /// the configured default database and connection.
    pub fn collection(
        &self,
        database: Option<&str>,
        alias: Option<&str>,
        collection: &str,
    ) -> Result<CollectionHandle> {
        Ok(CollectionHandle {
            source: self.get(alias)?,
            database: database.unwrap_or(&self.config.default_database).to_string(),
            name: collection.to_string(),
        })
    }

    /// Drop `database` (the default one when `None`) on the given connection.
    pub fn drop_database(&self, database: Option<&str>, alias: Option<&str>) -> Result<()> {
        let database = database.unwrap_or(&self.config.default_database);
        self.get(alias)?.drop_database(database)
    }
}

/// A collection on a specific database of a specific source.
#[derive(Clone)]
pub struct CollectionHandle {
    source: Arc<dyn DataSource>,
    database: String,
    name: String,
}

impl std::fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("database", &self.database)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl CollectionHandle {
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ping(&self) -> Result<()> {
        self.source.ping()
    }

    pub fn aggregate(&self, pipeline: &[Value], ctx: &Context) -> Result<Vec<Value>> {
        ctx.check()?;
        tracing::debug!(
            database = %self.database,
            collection = %self.name,
            stages = pipeline.len(),
            "running pipeline"
        );
        self.source
            .aggregate(&self.database, &self.name, pipeline, ctx)
    }

    pub fn insert_many(&self, docs: Vec<Value>, ctx: &Context) -> Result<()> {
        ctx.check()?;
        self.source
            .insert_many(&self.database, &self.name, docs, ctx)
    }

    pub fn create(&self) -> Result<()> {
        self.source.create_collection(&self.database, &self.name)
    }

    pub fn drop_indexes(&self) -> Result<()> {
        self.source.drop_indexes(&self.database, &self.name)
    }

    pub fn create_index(&self, index: &IndexSpec) -> Result<()> {
        self.source.create_index(&self.database, &self.name, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn resolves_defaults() {
        let connections = Connections::with_default(Config::default(), Arc::new(MemoryStore::new()));
        let handle = connections.collection(None, None, "users").unwrap();
        assert_eq!(handle.database(), Config::default().default_database);
        assert_eq!(handle.name(), "users");

        let secondary = connections
            .collection(Some("elemental_secondary"), None, "users")
            .unwrap();
        assert_eq!(secondary.database(), "elemental_secondary");
    }

    #[test]
    fn unknown_alias_is_an_error() {
        let connections = Connections::new(Config::default());
        assert!(matches!(
            connections.collection(None, Some("replica"), "users"),
            Err(Error::ConnectionNotFound(alias)) if alias == "replica"
        ));
    }
}
