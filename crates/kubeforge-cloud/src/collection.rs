//! Generic CRUD wrapper over the entity store

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::Result;
use crate::model::Model;
use crate::store::{EntityStore, key_id};

/// Typed access to the records of one model namespace
pub struct Collection<M> {
    store: Arc<dyn EntityStore>,
    _model: PhantomData<fn() -> M>,
}

impl<M> Clone for Collection<M> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _model: PhantomData,
        }
    }
}

impl<M: Model> Collection<M> {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            _model: PhantomData,
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    fn decode(key: &str, value: serde_json::Value) -> Result<M> {
        let mut model: M = serde_json::from_value(value)?;
        model.set_id(key_id(key).to_string());
        Ok(model)
    }

    /// Insert the model and assign its id
    pub async fn create(&self, model: &mut M) -> Result<()> {
        let key = self
            .store
            .create_in_order(M::NAMESPACE, serde_json::to_value(&*model)?)
            .await?;
        model.set_id(key_id(&key).to_string());
        tracing::debug!("Created {}", key);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<M> {
        let key = format!("{}/{}", M::NAMESPACE, id);
        let value = self.store.get(&key).await?;
        Self::decode(&key, value)
    }

    pub async fn list(&self) -> Result<Vec<M>> {
        self.store
            .list_in_order(M::NAMESPACE)
            .await?
            .into_iter()
            .map(|(key, value)| Self::decode(&key, value))
            .collect()
    }

    pub async fn find(&self, predicate: impl Fn(&M) -> bool) -> Result<Vec<M>> {
        Ok(self.list().await?.into_iter().filter(predicate).collect())
    }

    pub async fn save(&self, model: &M) -> Result<()> {
        save_model(self.store.as_ref(), model).await
    }

    pub async fn delete(&self, model: &M) -> Result<()> {
        self.store.delete(&model.key()).await?;
        tracing::debug!("Deleted {}", model.key());
        Ok(())
    }
}

/// Persist a model's current in-memory state
pub async fn save_model<M: Model>(store: &dyn EntityStore, model: &M) -> Result<()> {
    store.update(&model.key(), serde_json::to_value(model)?).await
}
