use {
    crate::{
        connection::{ConnectionStatus, RelayConnection},
        message_tracker::MessageTracker,
        publisher::{PublishOptions, Publisher},
        subscriber::{SubscribeOptions, Subscriber, UnsubscribeOptions},
        transport::Transport,
        Result,
    },
    core_api::{crypto::Crypto, heartbeat::Pulse, storage::KeyValueStorage},
    relay_rpc::{
        domain::{SubscriptionId, Topic},
        rpc::{Params, Request, SubscriptionData},
    },
    serde_json::Value,
    std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
    tokio::sync::{broadcast, mpsc},
    tracing::{debug, warn},
};

pub use crate::connection::RelayerOptions;

const EVENTS_CAPACITY: usize = 64;

/// Connection level events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayerEvent {
    Connect,
    Disconnect,
    Error(String),
    /// Pending subscriptions could not be confirmed; the transport is
    /// restarted.
    ConnectionStalled,
    TransportClosed,
}

/// Relay client: one connection plus the subscriber and publisher on top of
/// it. Inbound messages for subscribed topics are delivered once.
#[derive(Debug)]
pub struct Relayer {
    connection: Arc<RelayConnection>,
    subscriber: Arc<Subscriber>,
    publisher: Publisher,
    message_tracker: MessageTracker,
    events: broadcast::Sender<RelayerEvent>,
    messages: mpsc::UnboundedSender<SubscriptionData>,
    messages_rx: StdMutex<Option<mpsc::UnboundedReceiver<SubscriptionData>>>,
    inbound: StdMutex<Option<mpsc::UnboundedReceiver<Request>>>,
}

impl Relayer {
    pub fn new(
        options: RelayerOptions,
        crypto: Arc<dyn Crypto>,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let (messages, messages_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(RelayConnection::new(
            options,
            crypto,
            transport,
            events.clone(),
            inbound_tx,
        ));

        Arc::new(Self {
            subscriber: Arc::new(Subscriber::new(
                connection.clone(),
                storage.clone(),
                events.clone(),
            )),
            publisher: Publisher::new(connection.clone()),
            message_tracker: MessageTracker::new(storage),
            connection,
            events,
            messages,
            messages_rx: StdMutex::new(Some(messages_rx)),
            inbound: StdMutex::new(Some(inbound_rx)),
        })
    }

    /// Restores persisted state, starts the background tasks and opens the
    /// connection.
    pub async fn init(self: &Arc<Self>, pulses: broadcast::Receiver<Pulse>) -> Result<()> {
        self.message_tracker.init().await?;
        self.subscriber.init(pulses).await?;

        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(inbound) = inbound {
            tokio::spawn(process_inbound(Arc::downgrade(self), inbound));
            tokio::spawn(watch_events(Arc::downgrade(self), self.events.subscribe()));
        }

        self.connection.transport_open().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayerEvent> {
        self.events.subscribe()
    }

    /// Inbound messages of subscribed topics, deduplicated. There is a single
    /// receiver: messages queue up until it is taken, later calls return
    /// `None`.
    pub fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<SubscriptionData>> {
        self.messages_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn connection(&self) -> &Arc<RelayConnection> {
        &self.connection
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    pub fn message_tracker(&self) -> &MessageTracker {
        &self.message_tracker
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub async fn publish(
        &self,
        topic: &Topic,
        message: impl Into<Arc<str>>,
        options: PublishOptions,
    ) -> Result<()> {
        self.publisher.publish(topic, message, options).await
    }

    pub async fn subscribe(&self, topic: &Topic, options: SubscribeOptions) -> Result<SubscriptionId> {
        self.subscriber.subscribe(topic, options).await
    }

    pub async fn unsubscribe(&self, topic: &Topic, options: UnsubscribeOptions) -> Result<()> {
        self.subscriber.unsubscribe(topic, options).await
    }

    pub async fn transport_open(&self) -> Result<()> {
        self.connection.transport_open().await
    }

    pub async fn transport_close(&self) {
        self.connection.transport_close().await
    }

    pub async fn restart_transport(&self) -> Result<()> {
        self.connection.restart_transport().await
    }

    async fn on_request(&self, request: Request) {
        let Params::Subscription(subscription) = request.params else {
            debug!(id = %request.id, "ignoring unexpected relay request");
            return;
        };

        let data = subscription.data;
        let deliver = if !self.subscriber.is_subscribed(&data.topic).await {
            debug!(topic = %data.topic, "ignoring message for unsubscribed topic");
            false
        } else if self.message_tracker.has(&data.topic, &data.message).await {
            debug!(topic = %data.topic, "ignoring duplicate message");
            false
        } else {
            true
        };

        // Unrecorded messages stay unacknowledged so that the relay delivers
        // them again.
        if deliver {
            if let Err(err) = self.message_tracker.set(&data.topic, &data.message).await {
                warn!(?err, topic = %data.topic, "failed to record message, leaving it unacknowledged");
                return;
            }
        }

        if let Err(err) = self.connection.respond(request.id, Value::Bool(true)) {
            warn!(?err, "failed to acknowledge subscription message");
        }
        if deliver && self.messages.send(data).is_err() {
            debug!("inbound message dropped, message handler is gone");
        }
    }
}

async fn process_inbound(relayer: Weak<Relayer>, mut inbound: mpsc::UnboundedReceiver<Request>) {
    while let Some(request) = inbound.recv().await {
        let Some(relayer) = relayer.upgrade() else {
            break;
        };
        relayer.on_request(request).await;
    }
}

async fn watch_events(relayer: Weak<Relayer>, mut events: broadcast::Receiver<RelayerEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "relayer events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(relayer) = relayer.upgrade() else {
            break;
        };
        match event {
            RelayerEvent::Connect => {
                let subscriber = relayer.subscriber.clone();
                tokio::spawn(async move {
                    if let Err(err) = subscriber.restart().await {
                        warn!(?err, "subscriber restart failed");
                    }
                });
            }
            RelayerEvent::ConnectionStalled => {
                let connection = relayer.connection.clone();
                tokio::spawn(async move {
                    if let Err(err) = connection.restart_transport().await {
                        warn!(?err, "failed to restart stalled transport");
                    }
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{memory::MemoryRelay, testing::FlakyStorage},
        anyhow::{Context, Result},
        core_api::{crypto::KeyChainCrypto, heartbeat::HeartBeat, storage::MemoryStorage},
        std::time::Duration,
    };

    struct Client {
        relayer: Arc<Relayer>,
        _heartbeat: HeartBeat,
    }

    async fn client(relay: &MemoryRelay, storage: Arc<dyn KeyValueStorage>) -> Result<Client> {
        let heartbeat = HeartBeat::new(Duration::from_millis(100));
        let relayer = Relayer::new(
            RelayerOptions::new("project").with_reconnect_delay(Duration::from_millis(10)),
            Arc::new(KeyChainCrypto::new(storage.clone())),
            Arc::new(relay.transport().await),
            storage,
        );
        relayer.init(heartbeat.subscribe()).await?;
        heartbeat.start();
        Ok(Client {
            relayer,
            _heartbeat: heartbeat,
        })
    }

    fn take_messages(client: &Client) -> Result<mpsc::UnboundedReceiver<SubscriptionData>> {
        client.relayer.take_messages().context("messages already taken")
    }

    async fn next_message(
        messages: &mut mpsc::UnboundedReceiver<SubscriptionData>,
    ) -> Result<SubscriptionData> {
        tokio::time::timeout(Duration::from_secs(5), messages.recv())
            .await?
            .context("relayer is gone")
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() -> Result<()> {
        let relay = MemoryRelay::new();
        let alice = client(&relay, Arc::new(MemoryStorage::new())).await?;
        let topic = Topic::generate();

        let id = alice.relayer.subscribe(&topic, SubscribeOptions::default()).await?;
        let again = alice.relayer.subscribe(&topic, SubscribeOptions::default()).await?;
        assert_eq!(id, again);
        assert_eq!(alice.relayer.subscriber().ids().await, vec![id]);
        assert_eq!(relay.subscriber_count(&topic).await, 1);

        alice
            .relayer
            .unsubscribe(&topic, UnsubscribeOptions::default())
            .await?;
        assert!(!alice.relayer.subscriber().is_subscribed(&topic).await);
        assert_eq!(relay.subscriber_count(&topic).await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn delivers_messages_once() -> Result<()> {
        let relay = MemoryRelay::new();
        let alice = client(&relay, Arc::new(MemoryStorage::new())).await?;
        let bob = client(&relay, Arc::new(MemoryStorage::new())).await?;
        let topic = Topic::generate();

        let mut messages = take_messages(&bob)?;
        bob.relayer.subscribe(&topic, SubscribeOptions::default()).await?;

        alice
            .relayer
            .publish(&topic, "first", PublishOptions::default())
            .await?;
        alice
            .relayer
            .publish(&topic, "first", PublishOptions::default())
            .await?;
        alice
            .relayer
            .publish(&topic, "second", PublishOptions::default())
            .await?;

        assert_eq!(next_message(&mut messages).await?.message.as_ref(), "first");
        assert_eq!(next_message(&mut messages).await?.message.as_ref(), "second");
        assert!(bob.relayer.message_tracker().has(&topic, "first").await);
        assert!(bob.relayer.take_messages().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unrecorded_message_is_left_for_redelivery() -> Result<()> {
        let relay = MemoryRelay::new();
        let alice = client(&relay, Arc::new(MemoryStorage::new())).await?;
        let storage = Arc::new(FlakyStorage::default());
        let bob = client(&relay, storage.clone()).await?;
        let topic = Topic::generate();
        let mut messages = take_messages(&bob)?;
        bob.relayer.subscribe(&topic, SubscribeOptions::default()).await?;

        storage.fail_writes_to(Some("messages"));
        alice
            .relayer
            .publish(&topic, "first", PublishOptions::default())
            .await?;
        assert!(
            tokio::time::timeout(Duration::from_millis(300), messages.recv())
                .await
                .is_err()
        );
        assert!(!bob.relayer.message_tracker().has(&topic, "first").await);
        assert_eq!(relay.unacknowledged(&topic).await, 1);

        storage.fail_writes_to(None);
        relay.redeliver().await;
        assert_eq!(next_message(&mut messages).await?.message.as_ref(), "first");
        assert!(bob.relayer.message_tracker().has(&topic, "first").await);
        tokio::time::timeout(Duration::from_secs(5), async {
            while relay.unacknowledged(&topic).await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn resubscribes_after_connection_drop() -> Result<()> {
        let relay = MemoryRelay::new();
        let alice = client(&relay, Arc::new(MemoryStorage::new())).await?;
        let bob = client(&relay, Arc::new(MemoryStorage::new())).await?;
        let topic = Topic::generate();
        let mut messages = take_messages(&bob)?;
        bob.relayer.subscribe(&topic, SubscribeOptions::default()).await?;

        let mut events = bob.relayer.subscribe_events();
        relay.drop_connections().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if events.recv().await? == RelayerEvent::Connect {
                    return anyhow::Ok(());
                }
            }
        })
        .await??;

        tokio::time::timeout(Duration::from_secs(5), async {
            while relay.subscriber_count(&topic).await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;

        alice
            .relayer
            .publish(&topic, "after reconnect", PublishOptions::default())
            .await?;
        assert_eq!(
            next_message(&mut messages).await?.message.as_ref(),
            "after reconnect"
        );
        Ok(())
    }

    #[tokio::test]
    async fn restores_subscriptions() -> Result<()> {
        let relay = MemoryRelay::new();
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        let topic = Topic::generate();
        {
            let first = client(&relay, storage.clone()).await?;
            first.relayer.subscribe(&topic, SubscribeOptions::default()).await?;
            first.relayer.transport_close().await;
        }

        let second = client(&relay, storage).await?;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !second.relayer.subscriber().is_subscribed(&topic).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        assert_eq!(second.relayer.subscriber().topics().await, vec![topic]);
        Ok(())
    }
}
