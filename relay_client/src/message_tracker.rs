use {
    core_api::{
        storage::{storage_key, KeyValueStorage, KeyValueStorageExt, CORE_CONTEXT},
        Error,
        Result,
    },
    relay_rpc::domain::{sha256_hex, Topic},
    std::{collections::BTreeMap, sync::Arc},
    tokio::sync::Mutex,
};

const STORAGE_NAME: &str = "messages";

type Messages = BTreeMap<Topic, BTreeMap<String, String>>;

#[derive(Debug, Default)]
struct State {
    messages: Messages,
    initialized: bool,
}

/// Remembers the messages received per topic, keyed by their SHA-256 hash,
/// so that relay redeliveries are dropped.
#[derive(Debug)]
pub struct MessageTracker {
    storage_key: String,
    storage: Arc<dyn KeyValueStorage>,
    state: Mutex<State>,
}

impl MessageTracker {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            storage_key: storage_key(CORE_CONTEXT, STORAGE_NAME),
            storage,
            state: Mutex::default(),
        }
    }

    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.initialized {
            return Ok(());
        }

        let persisted: Messages = self
            .storage
            .get_typed(&self.storage_key)
            .await?
            .unwrap_or_default();
        if !persisted.is_empty() {
            if !state.messages.is_empty() {
                return Err(Error::RestoreWillOverride(STORAGE_NAME.to_owned()));
            }
            state.messages = persisted;
        }

        state.initialized = true;
        Ok(())
    }

    /// Records `message` and returns its hash. Recording the same message
    /// again changes nothing.
    pub async fn set(&self, topic: &Topic, message: &str) -> Result<String> {
        let hash = sha256_hex(message);
        let mut state = self.state.lock().await;
        let messages = state.messages.entry(topic.clone()).or_default();
        if messages.contains_key(&hash) {
            return Ok(hash);
        }

        messages.insert(hash.clone(), message.to_owned());
        if let Err(err) = self.persist(&state).await {
            // Not recorded: a redelivery must not be taken for a duplicate.
            if let Some(messages) = state.messages.get_mut(topic) {
                messages.remove(&hash);
            }
            return Err(err);
        }
        Ok(hash)
    }

    pub async fn has(&self, topic: &Topic, message: &str) -> bool {
        let hash = sha256_hex(message);
        self.state
            .lock()
            .await
            .messages
            .get(topic)
            .is_some_and(|messages| messages.contains_key(&hash))
    }

    /// Messages recorded on `topic`, by hash.
    pub async fn get(&self, topic: &Topic) -> BTreeMap<String, String> {
        self.state
            .lock()
            .await
            .messages
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn delete(&self, topic: &Topic) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.messages.remove(topic).is_none() {
            return Ok(());
        }
        self.persist(&state).await
    }

    async fn persist(&self, state: &State) -> Result<()> {
        self.storage
            .set_typed(&self.storage_key, &state.messages)
            .await
    }
}
