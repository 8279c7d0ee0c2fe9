//! Expiration tracking for topics and request ids.

use {
    crate::{
        heartbeat::Pulse,
        storage::{storage_key, KeyValueStorage, KeyValueStorageExt, CORE_CONTEXT},
        time,
        Error,
        Result,
    },
    relay_rpc::domain::{MessageId, Topic},
    serde::{Deserialize, Serialize},
    std::{
        collections::BTreeMap,
        fmt,
        str::FromStr,
        sync::{Arc, Weak},
    },
    tokio::sync::{broadcast, Mutex},
    tracing::{debug, warn},
};

const STORAGE_NAME: &str = "expirer";
const TOPIC_PREFIX: &str = "topic:";
const ID_PREFIX: &str = "id:";

/// What an expiration is attached to. Encoded as `topic:<topic>` or
/// `id:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ExpirerTarget {
    Topic(Topic),
    Id(MessageId),
}

impl fmt::Display for ExpirerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic(topic) => write!(f, "{TOPIC_PREFIX}{topic}"),
            Self::Id(id) => write!(f, "{ID_PREFIX}{id}"),
        }
    }
}

impl FromStr for ExpirerTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(topic) = s.strip_prefix(TOPIC_PREFIX).filter(|t| !t.is_empty()) {
            return Ok(Self::Topic(Topic::from(topic)));
        }

        s.strip_prefix(ID_PREFIX)
            .and_then(|id| id.parse::<MessageId>().ok())
            .map(Self::Id)
            .ok_or_else(|| Error::InvalidTarget(s.to_owned()))
    }
}

impl From<ExpirerTarget> for String {
    fn from(target: ExpirerTarget) -> Self {
        target.to_string()
    }
}

impl TryFrom<String> for ExpirerTarget {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Topic> for ExpirerTarget {
    fn from(topic: Topic) -> Self {
        Self::Topic(topic)
    }
}

impl From<MessageId> for ExpirerTarget {
    fn from(id: MessageId) -> Self {
        Self::Id(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expiration {
    pub target: ExpirerTarget,
    pub expiry: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpirerEvent {
    Created(Expiration),
    Deleted(ExpirerTarget),
    Expired(Expiration),
}

#[derive(Debug, Default)]
struct State {
    expirations: BTreeMap<ExpirerTarget, u64>,
    initialized: bool,
}

/// Tracks one expiry per target and emits [`ExpirerEvent::Expired`] once the
/// deadline passes, either when set or on the next heartbeat pulse.
#[derive(Debug)]
pub struct Expirer {
    storage_key: String,
    storage: Arc<dyn KeyValueStorage>,
    state: Mutex<State>,
    events: broadcast::Sender<ExpirerEvent>,
}

impl Expirer {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            storage_key: storage_key(CORE_CONTEXT, STORAGE_NAME),
            storage,
            state: Mutex::default(),
            events,
        }
    }

    /// Restores persisted expirations and starts checking them on every
    /// heartbeat pulse.
    pub async fn init(self: &Arc<Self>, pulses: broadcast::Receiver<Pulse>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.initialized {
                return Ok(());
            }

            let persisted: Vec<Expiration> = self
                .storage
                .get_typed(&self.storage_key)
                .await?
                .unwrap_or_default();
            if !persisted.is_empty() {
                if !state.expirations.is_empty() {
                    return Err(Error::RestoreWillOverride(STORAGE_NAME.to_owned()));
                }
                state.expirations = persisted
                    .into_iter()
                    .map(|expiration| (expiration.target, expiration.expiry))
                    .collect();
            }
            state.initialized = true;
        }

        tokio::spawn(watch_pulses(Arc::downgrade(self), pulses));
        self.check_expirations().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExpirerEvent> {
        self.events.subscribe()
    }

    /// Sets or replaces the expiry of `target`. An expiry already in the past
    /// expires immediately.
    pub async fn set(&self, target: impl Into<ExpirerTarget>, expiry: u64) -> Result<()> {
        let target = target.into();
        let mut state = self.state.lock().await;
        state.expirations.insert(target.clone(), expiry);
        self.emit(ExpirerEvent::Created(Expiration {
            target: target.clone(),
            expiry,
        }));

        if time::is_expired(expiry) {
            state.expirations.remove(&target);
            self.emit(ExpirerEvent::Expired(Expiration { target, expiry }));
        }

        self.persist(&state).await
    }

    pub async fn has(&self, target: &ExpirerTarget) -> bool {
        self.state.lock().await.expirations.contains_key(target)
    }

    pub async fn get(&self, target: &ExpirerTarget) -> Result<Expiration> {
        self.state
            .lock()
            .await
            .expirations
            .get(target)
            .map(|expiry| Expiration {
                target: target.clone(),
                expiry: *expiry,
            })
            .ok_or_else(|| Error::not_found(STORAGE_NAME, target))
    }

    /// Removes the expiry of `target` if there is one.
    pub async fn delete(&self, target: &ExpirerTarget) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.expirations.remove(target).is_none() {
            debug!(expiration = %target, "no expiration to delete");
            return Ok(());
        }

        self.emit(ExpirerEvent::Deleted(target.clone()));
        self.persist(&state).await
    }

    pub async fn keys(&self) -> Vec<ExpirerTarget> {
        self.state.lock().await.expirations.keys().cloned().collect()
    }

    pub async fn values(&self) -> Vec<Expiration> {
        self.state
            .lock()
            .await
            .expirations
            .iter()
            .map(|(target, expiry)| Expiration {
                target: target.clone(),
                expiry: *expiry,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.expirations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Expires every entry whose deadline has passed.
    pub async fn check_expirations(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let expired = state
            .expirations
            .iter()
            .filter(|(_, expiry)| time::is_expired(**expiry))
            .map(|(target, expiry)| Expiration {
                target: target.clone(),
                expiry: *expiry,
            })
            .collect::<Vec<_>>();

        if expired.is_empty() {
            return Ok(());
        }

        for expiration in expired {
            state.expirations.remove(&expiration.target);
            debug!(expiration = %expiration.target, "expired");
            self.emit(ExpirerEvent::Expired(expiration));
        }

        self.persist(&state).await
    }

    fn emit(&self, event: ExpirerEvent) {
        // Nobody listening is not an error.
        let _ = self.events.send(event);
    }

    async fn persist(&self, state: &State) -> Result<()> {
        let values = state
            .expirations
            .iter()
            .map(|(target, expiry)| Expiration {
                target: target.clone(),
                expiry: *expiry,
            })
            .collect::<Vec<_>>();
        self.storage.set_typed(&self.storage_key, &values).await
    }
}

async fn watch_pulses(expirer: Weak<Expirer>, mut pulses: broadcast::Receiver<Pulse>) {
    loop {
        match pulses.recv().await {
            Ok(Pulse) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }

        let Some(expirer) = expirer.upgrade() else {
            break;
        };
        if let Err(err) = expirer.check_expirations().await {
            warn!(?err, "failed to check expirations");
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{heartbeat::HeartBeat, storage::MemoryStorage},
        anyhow::Result,
        std::time::Duration,
    };

    #[test]
    fn target_encoding() -> Result<()> {
        let topic = ExpirerTarget::Topic(Topic::from("abc"));
        assert_eq!(topic.to_string(), "topic:abc");
        assert_eq!("topic:abc".parse::<ExpirerTarget>()?, topic);

        let id = ExpirerTarget::Id(MessageId::new(42));
        assert_eq!(id.to_string(), "id:42");
        assert_eq!("id:42".parse::<ExpirerTarget>()?, id);

        for malformed in ["abc", "topic:", "id:abc", "session:1"] {
            assert!(matches!(
                malformed.parse::<ExpirerTarget>(),
                Err(Error::InvalidTarget(_))
            ));
        }

        assert_eq!(serde_json::to_string(&id)?, r#""id:42""#);
        Ok(())
    }

    #[tokio::test]
    async fn set_replaces_and_past_expiry_fires_immediately() -> Result<()> {
        let expirer = Expirer::new(Arc::new(MemoryStorage::new()));
        let mut events = expirer.subscribe();
        let target = ExpirerTarget::from(Topic::from("abc"));

        expirer.set(target.clone(), time::expiry_from_now(60)).await?;
        expirer.set(target.clone(), time::expiry_from_now(120)).await?;
        assert_eq!(expirer.len().await, 1);
        assert!(expirer.get(&target).await?.expiry > time::expiry_from_now(60));

        let id = ExpirerTarget::from(MessageId::new(1));
        let past = time::now() - 1;
        expirer.set(id.clone(), past).await?;
        assert!(!expirer.has(&id).await);

        assert!(matches!(events.recv().await?, ExpirerEvent::Created(_)));
        assert!(matches!(events.recv().await?, ExpirerEvent::Created(_)));
        assert!(matches!(events.recv().await?, ExpirerEvent::Created(_)));
        assert_eq!(
            events.recv().await?,
            ExpirerEvent::Expired(Expiration {
                target: id,
                expiry: past,
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn delete_emits_once() -> Result<()> {
        let expirer = Expirer::new(Arc::new(MemoryStorage::new()));
        let target = ExpirerTarget::from(Topic::from("abc"));
        expirer.set(target.clone(), time::expiry_from_now(60)).await?;

        let mut events = expirer.subscribe();
        expirer.delete(&target).await?;
        expirer.delete(&target).await?;
        assert_eq!(events.recv().await?, ExpirerEvent::Deleted(target.clone()));
        assert!(events.try_recv().is_err());
        assert!(expirer.get(&target).await.is_err_and(|e| e.is_not_found()));
        Ok(())
    }

    #[tokio::test]
    async fn pulse_expires_passed_deadlines() -> Result<()> {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        let heartbeat = HeartBeat::new(Duration::from_millis(50));
        let expirer = Arc::new(Expirer::new(storage.clone()));
        expirer.init(heartbeat.subscribe()).await?;
        heartbeat.start();

        let target = ExpirerTarget::from(MessageId::new(7));
        expirer.set(target.clone(), time::expiry_from_now(1)).await?;
        let mut events = expirer.subscribe();

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let ExpirerEvent::Expired(expiration) = events.recv().await? {
                    return anyhow::Ok(expiration);
                }
            }
        })
        .await??;
        assert_eq!(event.target, target);
        assert!(!expirer.has(&target).await);

        let restored = Arc::new(Expirer::new(storage));
        restored.init(heartbeat.subscribe()).await?;
        assert!(restored.is_empty().await);
        Ok(())
    }
}
