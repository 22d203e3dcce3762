use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::connection::Connections;
use crate::error::{Error, Result};
use crate::model::Model;
use crate::schema::Schema;

/// Name → model map shared by the parts of an application that look models
/// up by name.
///
/// Registration is insert-if-absent: the first call for a name builds the
/// model (creating its collection and indexes); later calls return that same
/// model without touching the data source again.
pub struct ModelRegistry {
    connections: Arc<Connections>,
    models: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ModelRegistry {
    pub fn new(connections: Arc<Connections>) -> Self {
        Self {
            connections,
            models: Mutex::new(HashMap::new()),
        }
    }

    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    /// Register `name`, or return the model already registered under it.
    ///
    /// Fails with [`Error::ModelTypeMismatch`] if the existing model was
    /// registered for a different document type.
    pub fn register<T: 'static>(&self, name: &str, schema: Schema) -> Result<Model<T>> {
        let mut models = self.models.lock().unwrap();
        if let Some(existing) = models.get(name) {
            return downcast(name, existing);
        }
        let model = Model::<T>::new(name, schema, &self.connections)?;
        models.insert(name.to_string(), Arc::new(model.clone()));
        tracing::info!(model = name, collection = model.collection().name(), "registered model");
        Ok(model)
    }

    pub fn get<T: 'static>(&self, name: &str) -> Result<Option<Model<T>>> {
        let models = self.models.lock().unwrap();
        models
            .get(name)
            .map(|existing| downcast(name, existing))
            .transpose()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.lock().unwrap().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.models.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

fn downcast<T: 'static>(name: &str, model: &Arc<dyn Any + Send + Sync>) -> Result<Model<T>> {
    model
        .downcast_ref::<Model<T>>()
        .cloned()
        .ok_or_else(|| Error::ModelTypeMismatch(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::MemoryStore;
    use serde_json::Value;

    fn registry() -> ModelRegistry {
        let connections = Connections::with_default(Config::default(), Arc::new(MemoryStore::new()));
        ModelRegistry::new(Arc::new(connections))
    }

    #[test]
    fn register_is_insert_if_absent() {
        let registry = registry();
        let first = registry.register::<Value>("Witcher", Schema::default()).unwrap();
        let second = registry.register::<Value>("Witcher", Schema::default()).unwrap();
        assert_eq!(first.collection().name(), second.collection().name());
        assert_eq!(registry.names(), vec!["Witcher"]);
    }

    #[test]
    fn mismatched_type_is_rejected() {
        let registry = registry();
        registry.register::<Value>("Witcher", Schema::default()).unwrap();
        assert!(matches!(
            registry.register::<String>("Witcher", Schema::default()),
            Err(Error::ModelTypeMismatch(name)) if name == "Witcher"
        ));
        assert!(registry.get::<String>("Witcher").is_err());
    }

    #[test]
    fn get_unknown_is_none() {
        let registry = registry();
        assert!(registry.get::<Value>("Sorceress").unwrap().is_none());
        assert!(!registry.contains("Sorceress"));
    }
}
