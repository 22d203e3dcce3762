use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::connection::{CollectionHandle, Connections};
use crate::context::Context;
use crate::document::ObjectId;
use crate::error::{Error, Result};
use crate::executor::{Count, Distinct, One};
use crate::query::Query;
use crate::schema::Schema;

struct ModelInner {
    name: String,
    schema: Schema,
    collection: CollectionHandle,
    query_timeout: Duration,
}

/// A named schema bound to a collection, producing queries over documents of
/// type `T`.
pub struct Model<T> {
    inner: Arc<ModelInner>,
    _doc: PhantomData<fn() -> T>,
}

impl<T> Clone for Model<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _doc: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Model<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.inner.name)
            .field("collection", &self.inner.collection)
            .finish_non_exhaustive()
    }
}

impl<T> Model<T> {
    /// Bind `schema` to its collection and, if the data source is reachable,
    /// create the collection and sync its indexes.
    pub fn new(name: &str, schema: Schema, connections: &Connections) -> Result<Self> {
        let collection = connections.collection(
            schema.options.database.as_deref(),
            schema.options.connection.as_deref(),
            &schema.collection_name(name),
        )?;
        let model = Self {
            inner: Arc::new(ModelInner {
                name: name.to_string(),
                schema,
                collection,
                query_timeout: connections.config().query_timeout(),
            }),
            _doc: PhantomData,
        };

        match model.inner.collection.ping() {
            Ok(()) => {
                model.inner.collection.create()?;
                model.sync_indexes()?;
            }
            Err(e) => tracing::warn!(
                model = name,
                error = %e,
                "data source unreachable, skipping collection setup"
            ),
        }
        Ok(model)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn collection(&self) -> &CollectionHandle {
        &self.inner.collection
    }

    pub(crate) fn query_timeout(&self) -> Duration {
        self.inner.query_timeout
    }

    /// Drop every index on the collection and recreate the schema's.
    pub fn sync_indexes(&self) -> Result<()> {
        let collection = &self.inner.collection;
        collection.drop_indexes()?;
        let specs = self.inner.schema.index_specs();
        for spec in &specs {
            collection.create_index(spec)?;
        }
        tracing::info!(
            model = %self.inner.name,
            collection = collection.name(),
            indexes = specs.len(),
            "synced indexes"
        );
        Ok(())
    }

    /// An empty query over this model's collection.
    pub fn query(&self) -> Query<T> {
        Query::new(self.clone())
    }

    pub fn find(&self, conditions: Value) -> Query<T> {
        self.query().filter(conditions)
    }

    pub fn find_one(&self, conditions: Value) -> Query<T, One> {
        self.query().find_one(conditions)
    }

    pub fn find_by_id(&self, id: ObjectId) -> Query<T, One> {
        self.query().find_by_id(id)
    }

    pub fn count_documents(&self, conditions: Value) -> Query<T, Count> {
        self.query().count_documents(conditions)
    }

    pub fn distinct(&self, field: &str, conditions: Value) -> Query<T, Distinct> {
        self.query().distinct(field, conditions)
    }

    pub fn where_field(&self, field: &str) -> Query<T> {
        self.query().where_field(field)
    }
}

impl<T> Model<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Insert one document and return it as stored.
    pub fn create(&self, doc: T) -> Result<T> {
        let ctx = Context::with_timeout(self.query_timeout());
        self.create_with(doc, &ctx)
    }

    pub fn create_with(&self, doc: T, ctx: &Context) -> Result<T> {
        self.insert_many_with(vec![doc], ctx)?
            .pop()
            .ok_or_else(|| Error::Custom("insert returned no document".into()))
    }

    pub fn insert_many(&self, docs: impl IntoIterator<Item = T>) -> Result<Vec<T>> {
        let ctx = Context::with_timeout(self.query_timeout());
        self.insert_many_with(docs, &ctx)
    }

    /// Apply schema defaults, ids and timestamps, then insert all documents
    /// in one call.
    pub fn insert_many_with(
        &self,
        docs: impl IntoIterator<Item = T>,
        ctx: &Context,
    ) -> Result<Vec<T>> {
        let prepared = docs
            .into_iter()
            .map(|doc| self.inner.schema.enforce(serde_json::to_value(doc)?))
            .collect::<Result<Vec<_>>>()?;
        self.inner.collection.insert_many(prepared.clone(), ctx)?;
        prepared
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::schema::{Field, FieldType, SchemaOptions};
    use crate::store::MemoryStore;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Monster {
        #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
        id: Option<ObjectId>,
        name: String,
        #[serde(default)]
        weakness: Option<String>,
    }

    fn setup() -> (Arc<MemoryStore>, Connections) {
        let store = Arc::new(MemoryStore::new());
        let connections = Connections::with_default(Config::default(), store.clone());
        (store, connections)
    }

    fn bestiary(connections: &Connections) -> Model<Monster> {
        let schema = Schema::new(
            [
                ("name", Field::new(FieldType::String).unique()),
                ("weakness", Field::new(FieldType::String).default_value("silver")),
            ],
            SchemaOptions::default(),
        );
        Model::new("Monster", schema, connections).unwrap()
    }

    #[test]
    fn new_creates_collection_and_indexes() {
        let (store, connections) = setup();
        let model = bestiary(&connections);
        assert_eq!(model.collection().name(), "monsters");
        assert_eq!(store.list_collections("elemental"), vec!["monsters"]);
        assert_eq!(store.list_indexes("elemental", "monsters").len(), 1);
    }

    #[test]
    fn create_applies_defaults_and_id() {
        let (_, connections) = setup();
        let model = bestiary(&connections);
        let griffin = model
            .create(Monster {
                id: None,
                name: "Griffin".into(),
                weakness: None,
            })
            .unwrap();
        assert!(griffin.id.is_some());
        assert_eq!(griffin.weakness.as_deref(), Some("silver"));

        let found = model.find_by_id(griffin.id.unwrap()).exec().unwrap();
        assert_eq!(found, Some(griffin));
    }

    #[test]
    fn unique_index_is_enforced() {
        let (_, connections) = setup();
        let model = bestiary(&connections);
        let leshen = || Monster {
            id: None,
            name: "Leshen".into(),
            weakness: None,
        };
        model.create(leshen()).unwrap();
        assert!(matches!(
            model.create(leshen()),
            Err(Error::UniqueViolation { .. })
        ));
    }

    #[test]
    fn unknown_connection_fails() {
        let (_, connections) = setup();
        let schema = Schema::new(
            Vec::<(String, Field)>::new(),
            SchemaOptions {
                connection: Some("replica".into()),
                ..SchemaOptions::default()
            },
        );
        assert!(matches!(
            Model::<Value>::new("Monster", schema, &connections),
            Err(Error::ConnectionNotFound(_))
        ));
    }

    #[test]
    fn model_shortcuts_build_queries() {
        let (_, connections) = setup();
        let model = bestiary(&connections);
        assert_eq!(
            model.find(json!({"weakness": "igni"})).to_documents(),
            vec![json!({"$match": {"weakness": "igni"}})]
        );
        assert_eq!(
            model.where_field("name").equals("Katakan").to_documents(),
            vec![json!({"$match": {"name": {"$eq": "Katakan"}}})]
        );
    }
}
