//! Durable key-value storage used to persist every store-like component.

use {
    crate::{Error, Result},
    async_trait::async_trait,
    serde::{de::DeserializeOwned, Serialize},
    serde_json::Value,
    std::{
        collections::BTreeMap,
        fmt::Debug,
        path::{Path, PathBuf},
    },
    tokio::sync::Mutex,
    tracing::debug,
};

pub const STORAGE_PROTOCOL: &str = "wc";
pub const STORAGE_VERSION: &str = "2";
pub const CORE_CONTEXT: &str = "core";

/// Storage key of a component: `wc@2:<context>//<name>`.
pub fn storage_key(context: &str, name: &str) -> String {
    format!("{STORAGE_PROTOCOL}@{STORAGE_VERSION}:{context}//{name}")
}

#[async_trait]
pub trait KeyValueStorage: Debug + Send + Sync {
    async fn keys(&self) -> Result<Vec<String>>;

    async fn has_item(&self, key: &str) -> Result<bool>;

    async fn get_item(&self, key: &str) -> Result<Option<Value>>;

    async fn set_item(&self, key: &str, value: Value) -> Result<()>;

    async fn remove_item(&self, key: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// Typed helpers over [`KeyValueStorage`].
#[async_trait]
pub trait KeyValueStorageExt: KeyValueStorage {
    async fn get_typed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get_item(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set_typed<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        self.set_item(key, serde_json::to_value(value)?).await
    }
}

impl<S: KeyValueStorage + ?Sized> KeyValueStorageExt for S {}

/// Volatile storage, lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.items.lock().await.keys().cloned().collect())
    }

    async fn has_item(&self, key: &str) -> Result<bool> {
        Ok(self.items.lock().await.contains_key(key))
    }

    async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.items.lock().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<()> {
        self.items.lock().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.items.lock().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.items.lock().await.clear();
        Ok(())
    }
}

/// Storage kept in a single JSON document on disk. The document is loaded on
/// first access and rewritten on every mutation.
#[derive(Debug)]
pub struct FileSystemStorage {
    path: PathBuf,
    items: Mutex<Option<BTreeMap<String, Value>>>,
}

impl FileSystemStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            items: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, Value>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "storage file not found, starting empty");
                Ok(BTreeMap::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, items: &BTreeMap<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec(items)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| Error::Storage(format!("{}: {err}", self.path.display())))
    }

    async fn with_items<F, T>(&self, mutate: bool, f: F) -> Result<T>
    where
        F: FnOnce(&mut BTreeMap<String, Value>) -> T + Send,
        T: Send,
    {
        let mut guard = self.items.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }

        let items = guard.get_or_insert_with(BTreeMap::new);
        let result = f(items);
        if mutate {
            self.write(items).await?;
        }

        Ok(result)
    }
}

#[async_trait]
impl KeyValueStorage for FileSystemStorage {
    async fn keys(&self) -> Result<Vec<String>> {
        self.with_items(false, |items| items.keys().cloned().collect())
            .await
    }

    async fn has_item(&self, key: &str) -> Result<bool> {
        self.with_items(false, |items| items.contains_key(key)).await
    }

    async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        self.with_items(false, |items| items.get(key).cloned()).await
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<()> {
        self.with_items(true, |items| {
            items.insert(key.to_owned(), value);
        })
        .await
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.with_items(true, |items| {
            items.remove(key);
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.with_items(true, BTreeMap::clear).await
    }
}

#[cfg(test)]
mod tests {
    use {super::*, anyhow::Result, serde::Deserialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Item {
        name: String,
    }

    #[test]
    fn key_format() {
        assert_eq!(storage_key("core", "expirer"), "wc@2:core//expirer");
    }

    #[tokio::test]
    async fn memory_storage() -> Result<()> {
        let storage = MemoryStorage::new();
        let item = Item {
            name: "first".to_owned(),
        };

        storage.set_typed("key", &item).await?;
        assert!(storage.has_item("key").await?);
        assert_eq!(storage.get_typed::<Item>("key").await?, Some(item));
        assert_eq!(storage.keys().await?, vec!["key".to_owned()]);

        storage.remove_item("key").await?;
        assert_eq!(storage.get_typed::<Item>("key").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn file_storage_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("storage.json");

        let storage = FileSystemStorage::new(&path);
        storage
            .set_typed("key", &Item {
                name: "persisted".to_owned(),
            })
            .await?;
        storage.set_item("other", Value::Bool(true)).await?;
        storage.remove_item("other").await?;

        let reopened = FileSystemStorage::new(&path);
        assert_eq!(
            reopened.get_typed::<Item>("key").await?,
            Some(Item {
                name: "persisted".to_owned()
            })
        );
        assert!(!reopened.has_item("other").await?);

        reopened.clear().await?;
        assert!(FileSystemStorage::new(&path).keys().await?.is_empty());
        Ok(())
    }
}
