//! Ledger of JSON-RPC requests and their responses.

use {
    crate::{
        storage::{storage_key, KeyValueStorage, KeyValueStorageExt},
        Error,
        Result,
    },
    relay_rpc::{
        domain::{MessageId, Topic},
        rpc::{ErrorData, JsonRpcRequest},
    },
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    std::{collections::BTreeMap, sync::Arc},
    tokio::sync::Mutex,
    tracing::debug,
};

/// Outcome recorded for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordResponse<R> {
    Result(R),
    Error(ErrorData),
}

impl<R> From<std::result::Result<R, ErrorData>> for RecordResponse<R> {
    fn from(value: std::result::Result<R, ErrorData>) -> Self {
        match value {
            Ok(result) => Self::Result(result),
            Err(error) => Self::Error(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcRecord<T, R> {
    pub id: MessageId,
    pub topic: Topic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub request: JsonRpcRequest<T>,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub response: Option<RecordResponse<R>>,
}

impl<T, R> JsonRpcRecord<T, R> {
    pub fn is_pending(&self) -> bool {
        self.response.is_none()
    }
}

#[derive(Debug)]
struct State<T, R> {
    records: BTreeMap<MessageId, JsonRpcRecord<T, R>>,
    initialized: bool,
}

/// History of one request type. Records are written once per id and resolved
/// once; later writes for the same id are ignored.
#[derive(Debug)]
pub struct JsonRpcHistory<T, R> {
    name: String,
    storage_key: String,
    storage: Arc<dyn KeyValueStorage>,
    state: Mutex<State<T, R>>,
}

impl<T, R> JsonRpcHistory<T, R>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// History of `method` requests, persisted under
    /// `wc@2:<context>//history-<method>`.
    pub fn new(context: &str, method: &str, storage: Arc<dyn KeyValueStorage>) -> Self {
        let name = format!("history-{method}");
        Self {
            storage_key: storage_key(context, &name),
            name,
            storage,
            state: Mutex::new(State {
                records: BTreeMap::new(),
                initialized: false,
            }),
        }
    }

    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.initialized {
            return Ok(());
        }

        let persisted: Vec<JsonRpcRecord<T, R>> = self
            .storage
            .get_typed(&self.storage_key)
            .await?
            .unwrap_or_default();
        if !persisted.is_empty() {
            if !state.records.is_empty() {
                return Err(Error::RestoreWillOverride(self.name.clone()));
            }
            state.records = persisted
                .into_iter()
                .map(|record| (record.id, record))
                .collect();
        }

        state.initialized = true;
        Ok(())
    }

    /// Records `request` as pending. Returns `false`, recording nothing, when
    /// its id is already known.
    pub async fn set(
        &self,
        topic: &Topic,
        request: JsonRpcRequest<T>,
        chain_id: Option<String>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let id = request.id;
        if state.records.contains_key(&id) {
            debug!(history = %self.name, %id, "record already exists");
            return Ok(false);
        }

        state.records.insert(id, JsonRpcRecord {
            id,
            topic: topic.clone(),
            chain_id,
            request,
            response: None,
        });
        if let Err(err) = self.persist(&state).await {
            state.records.remove(&id);
            return Err(err);
        }
        Ok(true)
    }

    /// Attaches the response to a pending record. Returns `false` when there
    /// is no such record or it has already been resolved.
    pub async fn resolve(
        &self,
        id: MessageId,
        response: impl Into<RecordResponse<R>>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(record) = state.records.get_mut(&id) else {
            return Ok(false);
        };
        if record.response.is_some() {
            debug!(history = %self.name, %id, "record already resolved");
            return Ok(false);
        }

        record.response = Some(response.into());
        self.persist(&state).await?;
        Ok(true)
    }

    pub async fn get(&self, topic: &Topic, id: MessageId) -> Result<JsonRpcRecord<T, R>> {
        let state = self.state.lock().await;
        let record = state
            .records
            .get(&id)
            .ok_or_else(|| Error::not_found(&self.name, id))?;

        if &record.topic != topic {
            return Err(Error::MismatchedTopic {
                id: id.value(),
                expected: record.topic.to_string(),
                received: topic.to_string(),
            });
        }

        Ok(record.clone())
    }

    /// `true` when `id` is recorded on `topic`.
    pub async fn exists(&self, topic: &Topic, id: MessageId) -> bool {
        self.state
            .lock()
            .await
            .records
            .get(&id)
            .map(|record| &record.topic == topic)
            .unwrap_or(false)
    }

    /// Deletes the record `id`, or every record on `topic` when no id is
    /// given.
    pub async fn delete(&self, topic: &Topic, id: Option<MessageId>) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.records.len();
        state
            .records
            .retain(|record_id, record| match id {
                Some(id) => *record_id != id || &record.topic != topic,
                None => &record.topic != topic,
            });

        if state.records.len() == before {
            return Ok(());
        }
        self.persist(&state).await
    }

    pub async fn pending(&self) -> Vec<JsonRpcRecord<T, R>> {
        self.state
            .lock()
            .await
            .records
            .values()
            .filter(|record| record.is_pending())
            .cloned()
            .collect()
    }

    pub async fn records(&self) -> Vec<JsonRpcRecord<T, R>> {
        self.state.lock().await.records.values().cloned().collect()
    }

    async fn persist(&self, state: &State<T, R>) -> Result<()> {
        let records = state.records.values().collect::<Vec<_>>();
        self.storage.set_typed(&self.storage_key, &records).await
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::storage::MemoryStorage,
        anyhow::Result,
        serde_json::{json, Value},
    };

    type History = JsonRpcHistory<Value, u64>;

    fn request(id: u64) -> JsonRpcRequest<Value> {
        JsonRpcRequest::new(MessageId::new(id), "multiply", json!({"a": 3, "b": 4}))
    }

    #[tokio::test]
    async fn set_is_first_write_wins() -> Result<()> {
        let history = History::new("test", "multiply", Arc::new(MemoryStorage::new()));
        let topic = Topic::from("topic");
        assert!(history.set(&topic, request(1), Some("eip155:1".to_owned())).await?);

        let mut overwrite = request(1);
        overwrite.params = json!({});
        assert!(!history.set(&topic, overwrite, None).await?);

        let record = history.get(&topic, MessageId::new(1)).await?;
        assert_eq!(record.request.params, json!({"a": 3, "b": 4}));
        assert_eq!(record.chain_id.as_deref(), Some("eip155:1"));
        Ok(())
    }

    #[tokio::test]
    async fn resolves_once() -> Result<()> {
        let history = History::new("test", "multiply", Arc::new(MemoryStorage::new()));
        let topic = Topic::from("topic");
        let id = MessageId::new(1);
        history.set(&topic, request(1), None).await?;
        assert_eq!(history.pending().await.len(), 1);

        assert!(history.resolve(id, Ok::<_, ErrorData>(12)).await?);
        assert!(!history.resolve(id, Ok::<_, ErrorData>(13)).await?);
        assert!(!history.resolve(MessageId::new(2), Ok::<_, ErrorData>(1)).await?);

        let record = history.get(&topic, id).await?;
        assert_eq!(record.response, Some(RecordResponse::Result(12)));
        assert!(history.pending().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn lookups_check_topic() -> Result<()> {
        let history = History::new("test", "multiply", Arc::new(MemoryStorage::new()));
        let topic = Topic::from("topic");
        let other = Topic::from("other");
        let id = MessageId::new(1);
        history.set(&topic, request(1), None).await?;

        assert!(history.exists(&topic, id).await);
        assert!(!history.exists(&other, id).await);
        assert!(!history.exists(&topic, MessageId::new(2)).await);
        assert!(matches!(
            history.get(&other, id).await,
            Err(Error::MismatchedTopic { .. })
        ));
        assert!(history
            .get(&topic, MessageId::new(2))
            .await
            .is_err_and(|e| e.is_not_found()));
        Ok(())
    }

    #[tokio::test]
    async fn delete_and_restore() -> Result<()> {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        let history = History::new("test", "multiply", storage.clone());
        let topic = Topic::from("topic");
        for id in 1..=3 {
            history.set(&topic, request(id), None).await?;
        }
        history.set(&Topic::from("other"), request(4), None).await?;

        history.delete(&topic, Some(MessageId::new(1))).await?;
        assert_eq!(history.records().await.len(), 3);

        let restored = History::new("test", "multiply", storage);
        restored.init().await?;
        assert_eq!(restored.records().await.len(), 3);

        restored.delete(&topic, None).await?;
        assert_eq!(restored.records().await.len(), 1);
        Ok(())
    }
}
