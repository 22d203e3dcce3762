use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::aggregate::Plan;
use crate::connection::DataSource;
use crate::context::Context;
use crate::document::get_field;
use crate::error::{Error, Result};
use crate::filter;
use crate::schema::IndexSpec;
use crate::value::Comparable;

/// Documents of one collection plus the indexes defined on it.
#[derive(Debug, Default)]
pub struct Collection {
    name: String,
    docs: Vec<Arc<Value>>,
    indexes: Vec<IndexSpec>,
    unique_keys: HashMap<String, HashSet<Comparable>>,
}

impl Collection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    /// Insert all documents or none: every unique index is checked against the
    /// stored keys and against the batch itself before anything is written.
    pub fn insert_many(&mut self, docs: Vec<Value>) -> Result<usize> {
        let mut pending: HashMap<&str, HashSet<Comparable>> = HashMap::new();
        for doc in &docs {
            if !doc.is_object() {
                return Err(Error::NotAnObject);
            }
            for index in self.indexes.iter().filter(|i| i.unique) {
                let Some(key) = get_field(doc, &index.field).map(Comparable::from_json) else {
                    continue;
                };
                let taken = self
                    .unique_keys
                    .get(&index.field)
                    .is_some_and(|keys| keys.contains(&key));
                if taken || !pending.entry(&index.field).or_default().insert(key) {
                    return Err(Error::UniqueViolation {
                        field: index.field.clone(),
                    });
                }
            }
        }

        for (field, keys) in pending {
            self.unique_keys
                .entry(field.to_string())
                .or_default()
                .extend(keys);
        }
        let count = docs.len();
        self.docs.extend(docs.into_iter().map(Arc::new));
        Ok(count)
    }

    /// Define an index; unique indexes are backfilled and fail on duplicates.
    pub fn create_index(&mut self, index: &IndexSpec) -> Result<()> {
        if self.indexes.iter().any(|i| i.name == index.name) {
            return Err(Error::IndexAlreadyExists(index.name.clone()));
        }
        if index.unique {
            let mut keys = HashSet::new();
            for doc in &self.docs {
                if let Some(v) = get_field(doc, &index.field) {
                    if !keys.insert(Comparable::from_json(v)) {
                        return Err(Error::UniqueViolation {
                            field: index.field.clone(),
                        });
                    }
                }
            }
            self.unique_keys.insert(index.field.clone(), keys);
        }
        self.indexes.push(index.clone());
        Ok(())
    }

    pub fn drop_indexes(&mut self) {
        self.indexes.clear();
        self.unique_keys.clear();
    }

    pub fn aggregate(&self, plan: &Plan, ctx: &Context) -> Result<Vec<Value>> {
        let (leading, start) = plan.leading_filter();
        let initial = self
            .docs
            .iter()
            .filter(|doc| leading.is_none_or(|f| filter::matches(f, doc)))
            .map(|doc| Value::clone(doc))
            .collect();
        plan.execute_from(start, initial, ctx)
    }
}

type CollectionMap = HashMap<(String, String), Arc<RwLock<Collection>>>;

/// Embedded in-memory document store.
///
/// Thread-safe: a `RwLock` on the collection map plus one per collection, so
/// reads on different collections never block each other.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<CollectionMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, database: &str, name: &str) -> Option<Arc<RwLock<Collection>>> {
        let cols = self.collections.read().unwrap();
        cols.get(&(database.to_string(), name.to_string()))
            .map(Arc::clone)
    }

    /// Return a collection, auto-creating it if needed.
    fn get_or_create(&self, database: &str, name: &str) -> Arc<RwLock<Collection>> {
        if let Some(col) = self.get(database, name) {
            return col;
        }
        let mut cols = self.collections.write().unwrap();
        Arc::clone(
            cols.entry((database.to_string(), name.to_string()))
                .or_insert_with(|| Arc::new(RwLock::new(Collection::new(name)))),
        )
    }

    pub fn list_collections(&self, database: &str) -> Vec<String> {
        let cols = self.collections.read().unwrap();
        let mut names: Vec<_> = cols
            .keys()
            .filter(|(db, _)| db == database)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn count(&self, database: &str, collection: &str) -> usize {
        self.get(database, collection)
            .map_or(0, |col| col.read().unwrap().len())
    }

    pub fn list_indexes(&self, database: &str, collection: &str) -> Vec<IndexSpec> {
        self.get(database, collection)
            .map(|col| col.read().unwrap().indexes().to_vec())
            .unwrap_or_default()
    }
}

impl DataSource for MemoryStore {
    fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: &[Value],
        ctx: &Context,
    ) -> Result<Vec<Value>> {
        let plan = Plan::parse(pipeline)?;
        match self.get(database, collection) {
            Some(col) => col.read().unwrap().aggregate(&plan, ctx),
            None => plan.execute(Vec::new(), ctx),
        }
    }

    fn insert_many(
        &self,
        database: &str,
        collection: &str,
        docs: Vec<Value>,
        ctx: &Context,
    ) -> Result<()> {
        ctx.check()?;
        let col = self.get_or_create(database, collection);
        let inserted = col.write().unwrap().insert_many(docs)?;
        tracing::debug!(database, collection, inserted, "inserted documents");
        Ok(())
    }

    fn create_collection(&self, database: &str, collection: &str) -> Result<()> {
        self.get_or_create(database, collection);
        Ok(())
    }

    fn drop_indexes(&self, database: &str, collection: &str) -> Result<()> {
        if let Some(col) = self.get(database, collection) {
            col.write().unwrap().drop_indexes();
        }
        Ok(())
    }

    fn create_index(&self, database: &str, collection: &str, index: &IndexSpec) -> Result<()> {
        self.get_or_create(database, collection)
            .write()
            .unwrap()
            .create_index(index)
    }

    fn drop_database(&self, database: &str) -> Result<()> {
        self.collections
            .write()
            .unwrap()
            .retain(|(db, _), _| db != database);
        Ok(())
    }
}
