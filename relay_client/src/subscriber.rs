use {
    crate::{
        connection::RelayConnection,
        relayer::RelayerEvent,
        topic_map::TopicMap,
        Error,
        Result,
    },
    core_api::{
        heartbeat::Pulse,
        storage::{storage_key, KeyValueStorage, KeyValueStorageExt, CORE_CONTEXT},
    },
    relay_rpc::{
        domain::{SubscriptionId, Topic},
        rpc::{
            params::Relay,
            BatchSubscribe,
            Params,
            Subscribe,
            Unsubscribe,
            MAX_SUBSCRIPTION_BATCH_SIZE,
        },
    },
    serde::{Deserialize, Serialize},
    std::{
        collections::BTreeMap,
        sync::{Arc, Weak},
        time::Duration,
    },
    tokio::sync::{broadcast, watch, Mutex},
    tracing::{debug, info, warn},
};

const STORAGE_NAME: &str = "subscription";

/// Per-attempt timeouts of a single subscribe request.
const SUBSCRIBE_ATTEMPT_TIMEOUTS: [Duration; 2] = [Duration::from_secs(10), Duration::from_secs(20)];
const BATCH_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long [`Subscriber::is_subscribed`] waits for a pending subscription.
const PENDING_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(5);
const PENDING_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSubscription {
    pub id: SubscriptionId,
    pub topic: Topic,
    pub relay: Relay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubscription {
    pub topic: Topic,
    pub relay: Relay,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub relay: Relay,
}

#[derive(Debug, Clone, Default)]
pub struct UnsubscribeOptions {
    /// Only this subscription instead of every subscription of the topic.
    pub id: Option<SubscriptionId>,
    pub relay: Relay,
}

#[derive(Debug, Default)]
struct State {
    subscriptions: BTreeMap<SubscriptionId, ActiveSubscription>,
    topic_map: TopicMap,
    pending: BTreeMap<Topic, PendingSubscription>,
    /// Restored subscriptions, resubscribed on the first connect.
    cached: Vec<ActiveSubscription>,
    initialized: bool,
}

/// Keeps the set of relay subscriptions alive across reconnects.
#[derive(Debug)]
pub struct Subscriber {
    connection: Arc<RelayConnection>,
    storage_key: String,
    storage: Arc<dyn KeyValueStorage>,
    state: Mutex<State>,
    restarting: watch::Sender<bool>,
    events: broadcast::Sender<RelayerEvent>,
}

impl Subscriber {
    pub(crate) fn new(
        connection: Arc<RelayConnection>,
        storage: Arc<dyn KeyValueStorage>,
        events: broadcast::Sender<RelayerEvent>,
    ) -> Self {
        let (restarting, _) = watch::channel(false);
        Self {
            connection,
            storage_key: storage_key(CORE_CONTEXT, STORAGE_NAME),
            storage,
            state: Mutex::default(),
            restarting,
            events,
        }
    }

    /// Restores persisted subscriptions for the first restart and starts
    /// retrying pending subscriptions on every pulse.
    pub async fn init(self: &Arc<Self>, pulses: broadcast::Receiver<Pulse>) -> core_api::Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.initialized {
                return Ok(());
            }

            let persisted: Vec<ActiveSubscription> = self
                .storage
                .get_typed(&self.storage_key)
                .await?
                .unwrap_or_default();
            if !persisted.is_empty() {
                if !state.subscriptions.is_empty() {
                    return Err(core_api::Error::RestoreWillOverride(STORAGE_NAME.to_owned()));
                }
                debug!(len = persisted.len(), "restored subscriptions");
                state.cached = persisted;
            }
            state.initialized = true;
        }

        tokio::spawn(watch_pulses(Arc::downgrade(self), pulses));
        Ok(())
    }

    /// Subscribes to `topic`. A topic that is already subscribed returns its
    /// existing id without contacting the relay.
    pub async fn subscribe(&self, topic: &Topic, options: SubscribeOptions) -> Result<SubscriptionId> {
        self.restart_complete().await;

        {
            let mut state = self.state.lock().await;
            if let Some(id) = state.topic_map.get(topic).into_iter().next() {
                return Ok(id);
            }
            state.pending.insert(topic.clone(), PendingSubscription {
                topic: topic.clone(),
                relay: options.relay.clone(),
            });
        }

        let id = self.rpc_subscribe(topic).await?;
        let mut state = self.state.lock().await;
        self.on_subscribe(&mut state, ActiveSubscription {
            id: id.clone(),
            topic: topic.clone(),
            relay: options.relay,
        });
        self.persist(&state).await?;
        Ok(id)
    }

    /// Unsubscribes every subscription of `topic`, or only `options.id`.
    pub async fn unsubscribe(&self, topic: &Topic, options: UnsubscribeOptions) -> Result<()> {
        self.restart_complete().await;

        let whole_topic = options.id.is_none();
        let ids = match options.id {
            Some(id) => vec![id],
            None => self.state.lock().await.topic_map.get(topic),
        };

        for id in ids {
            self.connection
                .request(Params::Unsubscribe(Unsubscribe {
                    topic: topic.clone(),
                    id: Some(id.clone()),
                }))
                .await?;

            let mut state = self.state.lock().await;
            state.subscriptions.remove(&id);
            state.topic_map.delete(topic, Some(&id));
        }

        let mut state = self.state.lock().await;
        if whole_topic {
            state.pending.remove(topic);
        }
        self.persist(&state).await?;
        debug!(%topic, "unsubscribed");
        Ok(())
    }

    /// Whether `topic` is subscribed. A subscription still in flight is
    /// awaited for a short while.
    pub async fn is_subscribed(&self, topic: &Topic) -> bool {
        let wait = async {
            loop {
                {
                    let state = self.state.lock().await;
                    if state.topic_map.has_topic(topic) {
                        return true;
                    }
                    if !state.pending.contains_key(topic) {
                        return false;
                    }
                }
                tokio::time::sleep(PENDING_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(PENDING_RESOLUTION_TIMEOUT, wait)
            .await
            .unwrap_or(false)
    }

    pub async fn topics(&self) -> Vec<Topic> {
        self.state.lock().await.topic_map.topics()
    }

    pub async fn ids(&self) -> Vec<SubscriptionId> {
        self.state.lock().await.subscriptions.keys().cloned().collect()
    }

    pub async fn subscriptions(&self) -> Vec<ActiveSubscription> {
        self.state.lock().await.subscriptions.values().cloned().collect()
    }

    pub async fn pending(&self) -> Vec<PendingSubscription> {
        self.state.lock().await.pending.values().cloned().collect()
    }

    pub fn is_restarting(&self) -> bool {
        *self.restarting.borrow()
    }

    /// Resubscribes everything after a (re)connect. Other subscriber calls
    /// wait until it finishes.
    pub async fn restart(&self) -> Result<()> {
        self.restarting.send_replace(true);

        let pending = {
            let mut state = self.state.lock().await;
            let mut resubscribe = std::mem::take(&mut state.cached);
            if resubscribe.is_empty() {
                resubscribe = state.subscriptions.values().cloned().collect();
            }
            state.subscriptions.clear();
            state.topic_map.clear();

            for subscription in resubscribe {
                state.pending.insert(subscription.topic.clone(), PendingSubscription {
                    topic: subscription.topic,
                    relay: subscription.relay,
                });
            }
            state.pending.values().cloned().collect::<Vec<_>>()
        };

        info!(len = pending.len(), "resubscribing");
        let result = self.batch_subscribe(pending).await;
        self.restarting.send_replace(false);

        if let Err(err) = &result {
            warn!(?err, "resubscribe failed");
            let _ = self.events.send(RelayerEvent::ConnectionStalled);
        }
        result
    }

    /// Retries the pending subscriptions in one batch. A failed batch signals
    /// a stalled connection instead of failing.
    pub async fn check_pending(&self) {
        if self.is_restarting() || !self.connection.is_connected() {
            return;
        }

        let pending = self.pending().await;
        if pending.is_empty() {
            return;
        }

        if let Err(err) = self.batch_subscribe(pending).await {
            warn!(?err, "pending subscriptions failed");
            let _ = self.events.send(RelayerEvent::ConnectionStalled);
        }
    }

    async fn restart_complete(&self) {
        let mut restarting = self.restarting.subscribe();
        let _ = restarting.wait_for(|restarting| !restarting).await;
    }

    async fn rpc_subscribe(&self, topic: &Topic) -> Result<SubscriptionId> {
        let params = Params::Subscribe(Subscribe {
            topic: topic.clone(),
        });

        let mut last_error = Error::Timeout("subscribe");
        for (attempt, timeout) in SUBSCRIBE_ATTEMPT_TIMEOUTS.into_iter().enumerate() {
            match tokio::time::timeout(timeout, self.connection.request(params.clone())).await {
                Ok(Ok(result)) => {
                    return serde_json::from_value(result)
                        .map_err(|err| Error::InvalidResponse(err.to_string()));
                }
                Ok(Err(err)) => {
                    warn!(?err, %topic, attempt, "subscribe attempt failed");
                    last_error = err;
                }
                Err(_) => {
                    warn!(%topic, attempt, "subscribe attempt timed out");
                    last_error = Error::Timeout("subscribe");
                }
            }
        }

        Err(last_error)
    }

    async fn batch_subscribe(&self, subscriptions: Vec<PendingSubscription>) -> Result<()> {
        let mut by_protocol = BTreeMap::<String, Vec<PendingSubscription>>::new();
        for subscription in subscriptions {
            by_protocol
                .entry(subscription.relay.protocol.clone())
                .or_default()
                .push(subscription);
        }

        for subscriptions in by_protocol.values() {
            for batch in subscriptions.chunks(MAX_SUBSCRIPTION_BATCH_SIZE) {
                let topics = batch.iter().map(|s| s.topic.clone()).collect::<Vec<_>>();
                let result = tokio::time::timeout(
                    BATCH_SUBSCRIBE_TIMEOUT,
                    self.connection
                        .request(Params::BatchSubscribe(BatchSubscribe { topics })),
                )
                .await
                .map_err(|_| Error::Timeout("batch subscribe"))??;

                let ids: Vec<SubscriptionId> = serde_json::from_value(result)
                    .map_err(|err| Error::InvalidResponse(err.to_string()))?;
                if ids.len() != batch.len() {
                    return Err(Error::InvalidResponse(format!(
                        "expected {} subscription ids, received {}",
                        batch.len(),
                        ids.len()
                    )));
                }

                let mut state = self.state.lock().await;
                for (subscription, id) in batch.iter().zip(ids) {
                    self.on_subscribe(&mut state, ActiveSubscription {
                        id,
                        topic: subscription.topic.clone(),
                        relay: subscription.relay.clone(),
                    });
                }
                self.persist(&state).await?;
            }
        }

        Ok(())
    }

    fn on_subscribe(&self, state: &mut State, subscription: ActiveSubscription) {
        state.pending.remove(&subscription.topic);
        state
            .topic_map
            .set(subscription.topic.clone(), subscription.id.clone());
        state
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    async fn persist(&self, state: &State) -> Result<()> {
        let subscriptions = state.subscriptions.values().collect::<Vec<_>>();
        self.storage
            .set_typed(&self.storage_key, &subscriptions)
            .await?;
        Ok(())
    }
}

async fn watch_pulses(subscriber: Weak<Subscriber>, mut pulses: broadcast::Receiver<Pulse>) {
    loop {
        match pulses.recv().await {
            Ok(Pulse) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }

        let Some(subscriber) = subscriber.upgrade() else {
            break;
        };
        subscriber.check_pending().await;
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            connection::RelayerOptions,
            memory::MemoryRelay,
            testing::RecordingTransport,
            transport::Transport,
        },
        anyhow::Result,
        core_api::{crypto::KeyChainCrypto, storage::MemoryStorage},
        std::sync::PoisonError,
        tokio::{sync::mpsc, time::Instant},
    };

    fn subscriber(
        transport: impl Transport + 'static,
    ) -> (Arc<Subscriber>, broadcast::Receiver<RelayerEvent>) {
        let (events, events_rx) = broadcast::channel(64);
        let (inbound, _) = mpsc::unbounded_channel();
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        let connection = RelayConnection::new(
            RelayerOptions::new("project"),
            Arc::new(KeyChainCrypto::new(storage.clone())),
            Arc::new(transport),
            events.clone(),
            inbound,
        );
        let subscriber = Subscriber::new(Arc::new(connection), storage, events);
        (Arc::new(subscriber), events_rx)
    }

    async fn add_pending(subscriber: &Subscriber, topic: &Topic) {
        subscriber
            .state
            .lock()
            .await
            .pending
            .insert(topic.clone(), PendingSubscription {
                topic: topic.clone(),
                relay: Relay::default(),
            });
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_gives_up_after_two_attempts() -> Result<()> {
        let transport = RecordingTransport::silent();
        let requests = transport.requests();
        let (subscriber, _events) = subscriber(transport);
        let topic = Topic::generate();

        let started = Instant::now();
        let result = subscriber.subscribe(&topic, SubscribeOptions::default()).await;
        assert!(matches!(result, Err(Error::Timeout("subscribe"))));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31));

        let attempts = requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|params| matches!(params, Params::Subscribe(_)))
            .count();
        assert_eq!(attempts, SUBSCRIBE_ATTEMPT_TIMEOUTS.len());

        // Left for the pending retries.
        let pending = subscriber.pending().await;
        assert_eq!(pending.len(), 1);
        assert!(pending.iter().all(|pending| pending.topic == topic));
        assert!(subscriber.topics().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn restart_resubscribes_in_batches() -> Result<()> {
        let relay = MemoryRelay::new();
        let transport = RecordingTransport::forwarding(relay.transport().await);
        let requests = transport.requests();
        let (subscriber, _events) = subscriber(transport);

        let topics = (0..=MAX_SUBSCRIPTION_BATCH_SIZE)
            .map(|_| Topic::generate())
            .collect::<Vec<_>>();
        subscriber.state.lock().await.cached = topics
            .iter()
            .map(|topic| ActiveSubscription {
                id: SubscriptionId::derive(topic, "restored"),
                topic: topic.clone(),
                relay: Relay::default(),
            })
            .collect();

        subscriber.restart().await?;

        let batches = requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|params| match params {
                Params::BatchSubscribe(batch) => Some(batch.topics.len()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(batches, vec![MAX_SUBSCRIPTION_BATCH_SIZE, 1]);
        assert_eq!(subscriber.topics().await.len(), topics.len());
        assert!(subscriber.pending().await.is_empty());
        assert!(!subscriber.is_restarting());
        for topic in topics.iter().take(3) {
            assert_eq!(relay.subscriber_count(topic).await, 1);
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_batch_reports_a_stalled_connection() -> Result<()> {
        let (subscriber, mut events) = subscriber(RecordingTransport::silent());
        subscriber.connection.transport_open().await?;
        assert_eq!(events.recv().await?, RelayerEvent::Connect);

        let topic = Topic::generate();
        add_pending(&subscriber, &topic).await;

        let started = Instant::now();
        subscriber.check_pending().await;
        assert!(started.elapsed() >= BATCH_SUBSCRIBE_TIMEOUT);
        assert_eq!(events.recv().await?, RelayerEvent::ConnectionStalled);
        assert_eq!(subscriber.pending().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn calls_wait_for_a_restart_in_progress() -> Result<()> {
        let relay = MemoryRelay::new();
        let (subscriber, _events) = subscriber(relay.transport().await);
        let topic = Topic::generate();

        subscriber.restarting.send_replace(true);
        let subscribing = tokio::spawn({
            let subscriber = subscriber.clone();
            let topic = topic.clone();
            async move { subscriber.subscribe(&topic, SubscribeOptions::default()).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!subscribing.is_finished());
        assert_eq!(relay.subscriber_count(&topic).await, 0);

        subscriber.restarting.send_replace(false);
        tokio::time::timeout(Duration::from_secs(5), subscribing).await???;
        assert_eq!(subscriber.topics().await, vec![topic.clone()]);
        assert_eq!(relay.subscriber_count(&topic).await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn unsubscribe_forgets_pending_topic() -> Result<()> {
        let relay = MemoryRelay::new();
        let (subscriber, _events) = subscriber(relay.transport().await);
        let topic = Topic::generate();
        add_pending(&subscriber, &topic).await;

        // A single subscription leaves the topic's pending subscribe alone.
        subscriber
            .unsubscribe(&topic, UnsubscribeOptions {
                id: Some(SubscriptionId::derive(&topic, "other")),
                relay: Relay::default(),
            })
            .await?;
        assert_eq!(subscriber.pending().await.len(), 1);

        subscriber
            .unsubscribe(&topic, UnsubscribeOptions::default())
            .await?;
        assert!(subscriber.pending().await.is_empty());
        assert!(!subscriber.is_subscribed(&topic).await);
        Ok(())
    }
}
