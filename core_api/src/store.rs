//! Generic persisted entity store.

use {
    crate::{
        storage::{storage_key, KeyValueStorage, KeyValueStorageExt},
        Error,
        Result,
    },
    serde::{de::DeserializeOwned, Serialize},
    std::{
        collections::BTreeMap,
        fmt::{Debug, Display},
        sync::Arc,
    },
    tokio::sync::Mutex,
    tracing::debug,
};

/// An entity kept in a [`Store`].
///
/// `Patch` holds one `Option` per mergeable field. Storing a value under an
/// existing key merges `value.to_patch()` into the stored one, so only the
/// fields that differ from their default overwrite.
pub trait StoreValue: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Key: Clone + Ord + Debug + Display + Send + Sync;
    type Patch: Default + Send;

    fn key(&self) -> Self::Key;

    fn to_patch(&self) -> Self::Patch;

    fn apply_patch(&mut self, patch: Self::Patch);
}

#[derive(Debug)]
struct State<V: StoreValue> {
    values: BTreeMap<V::Key, V>,
    initialized: bool,
}

/// Keyed entity cache persisted as a full value list under
/// `wc@2:<context>//<name>` after every mutation.
#[derive(Debug)]
pub struct Store<V: StoreValue> {
    name: String,
    storage_key: String,
    storage: Arc<dyn KeyValueStorage>,
    state: Mutex<State<V>>,
}

impl<V: StoreValue> Store<V> {
    pub fn new(context: &str, name: &str, storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            name: name.to_owned(),
            storage_key: storage_key(context, name),
            storage,
            state: Mutex::new(State {
                values: BTreeMap::new(),
                initialized: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Restores the persisted values. Runs once, restoring over values set
    /// before initialization is refused.
    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.initialized {
            return Ok(());
        }

        let persisted: Vec<V> = self
            .storage
            .get_typed(&self.storage_key)
            .await?
            .unwrap_or_default();

        if !persisted.is_empty() {
            if !state.values.is_empty() {
                return Err(Error::RestoreWillOverride(self.name.clone()));
            }

            state.values = persisted.into_iter().map(|v| (v.key(), v)).collect();
        }

        state.initialized = true;
        debug!(store = %self.name, len = state.values.len(), "store restored");
        Ok(())
    }

    /// Inserts `value`, or merges its non-default fields into the value
    /// already stored under the same key.
    pub async fn set(&self, value: V) -> Result<V> {
        let mut state = self.state.lock().await;
        let key = value.key();
        let stored = match state.values.get_mut(&key) {
            Some(existing) => {
                existing.apply_patch(value.to_patch());
                existing.clone()
            }
            None => {
                state.values.insert(key.clone(), value.clone());
                value
            }
        };

        self.persist(&state).await?;
        debug!(store = %self.name, %key, "value set");
        Ok(stored)
    }

    pub async fn get(&self, key: &V::Key) -> Result<V> {
        self.state
            .lock()
            .await
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(&self.name, key))
    }

    /// Merges `patch` into the stored value. Fails with `NotFound` when there
    /// is nothing to merge into.
    pub async fn update(&self, key: &V::Key, patch: V::Patch) -> Result<V> {
        let mut state = self.state.lock().await;
        let existing = state
            .values
            .get_mut(key)
            .ok_or_else(|| Error::not_found(&self.name, key))?;
        existing.apply_patch(patch);
        let updated = existing.clone();

        self.persist(&state).await?;
        debug!(store = %self.name, %key, "value updated");
        Ok(updated)
    }

    /// Removes the value if present.
    pub async fn delete(&self, key: &V::Key, reason: &str) -> Result<Option<V>> {
        let mut state = self.state.lock().await;
        let Some(removed) = state.values.remove(key) else {
            debug!(store = %self.name, %key, reason, "nothing to delete");
            return Ok(None);
        };

        self.persist(&state).await?;
        debug!(store = %self.name, %key, reason, "value deleted");
        Ok(Some(removed))
    }

    pub async fn contains(&self, key: &V::Key) -> bool {
        self.state.lock().await.values.contains_key(key)
    }

    pub async fn keys(&self) -> Vec<V::Key> {
        self.state.lock().await.values.keys().cloned().collect()
    }

    pub async fn values(&self) -> Vec<V> {
        self.state.lock().await.values.values().cloned().collect()
    }

    pub async fn get_all<F>(&self, filter: F) -> Vec<V>
    where
        F: Fn(&V) -> bool + Send,
    {
        self.state
            .lock()
            .await
            .values
            .values()
            .filter(|value| filter(value))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.values.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self, state: &State<V>) -> Result<()> {
        let values = state.values.values().collect::<Vec<_>>();
        self.storage.set_typed(&self.storage_key, &values).await
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::storage::MemoryStorage,
        anyhow::Result,
        serde::Deserialize,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
    struct Entity {
        id: u64,
        name: String,
        active: bool,
        expiry: u64,
    }

    #[derive(Debug, Default)]
    struct EntityPatch {
        name: Option<String>,
        active: Option<bool>,
        expiry: Option<u64>,
    }

    impl StoreValue for Entity {
        type Key = u64;
        type Patch = EntityPatch;

        fn key(&self) -> u64 {
            self.id
        }

        fn to_patch(&self) -> EntityPatch {
            EntityPatch {
                name: Some(self.name.clone()).filter(|n| !n.is_empty()),
                active: Some(self.active).filter(|a| *a),
                expiry: Some(self.expiry).filter(|e| *e != 0),
            }
        }

        fn apply_patch(&mut self, patch: EntityPatch) {
            if let Some(name) = patch.name {
                self.name = name;
            }
            if let Some(active) = patch.active {
                self.active = active;
            }
            if let Some(expiry) = patch.expiry {
                self.expiry = expiry;
            }
        }
    }

    fn store(storage: Arc<dyn KeyValueStorage>) -> Store<Entity> {
        Store::new("test", "entities", storage)
    }

    #[tokio::test]
    async fn set_merges_non_default_fields() -> Result<()> {
        let store = store(Arc::new(MemoryStorage::new()));
        store.init().await?;

        store
            .set(Entity {
                id: 1,
                name: "first".to_owned(),
                active: false,
                expiry: 100,
            })
            .await?;
        let merged = store
            .set(Entity {
                id: 1,
                active: true,
                ..Default::default()
            })
            .await?;

        assert_eq!(merged, Entity {
            id: 1,
            name: "first".to_owned(),
            active: true,
            expiry: 100,
        });

        let unchanged = store.update(&1, EntityPatch::default()).await?;
        assert_eq!(unchanged, merged);
        Ok(())
    }

    #[tokio::test]
    async fn missing_values() -> Result<()> {
        let store = store(Arc::new(MemoryStorage::new()));
        store.init().await?;

        assert!(store.get(&7).await.is_err_and(|e| e.is_not_found()));
        assert!(store
            .update(&7, EntityPatch::default())
            .await
            .is_err_and(|e| e.is_not_found()));
        assert_eq!(store.delete(&7, "test").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn restores_persisted_values() -> Result<()> {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        let first = store(storage.clone());
        first.init().await?;
        first
            .set(Entity {
                id: 1,
                name: "kept".to_owned(),
                ..Default::default()
            })
            .await?;
        first
            .set(Entity {
                id: 2,
                ..Default::default()
            })
            .await?;
        first.delete(&2, "test").await?;

        let second = store(storage.clone());
        second.init().await?;
        second.init().await?;
        assert_eq!(second.keys().await, vec![1]);
        assert_eq!(second.get(&1).await?.name, "kept");

        let third = store(storage);
        third
            .set(Entity {
                id: 3,
                ..Default::default()
            })
            .await?;
        assert!(matches!(
            third.init().await,
            Err(Error::RestoreWillOverride(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn filters_values() -> Result<()> {
        let store = store(Arc::new(MemoryStorage::new()));
        for id in 0..4 {
            store
                .set(Entity {
                    id,
                    active: id % 2 == 0,
                    ..Default::default()
                })
                .await?;
        }

        assert_eq!(store.len().await, 4);
        assert_eq!(store.get_all(|e| e.active).await.len(), 2);
        assert!(store.contains(&3).await);
        Ok(())
    }
}
