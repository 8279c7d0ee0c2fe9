//! In-process relay broker and its transport. Clients connected to the same
//! [`MemoryRelay`] exchange messages the way they would through a real relay:
//! published messages are kept per topic and delivered once to every other
//! client that subscribes to it.

use {
    crate::{
        transport::{Connection, Transport, TransportEvent},
        ConnectionOptions,
        Error,
        MessageIdGenerator,
        Result,
    },
    async_trait::async_trait,
    relay_rpc::{
        auth::verify_jwt,
        domain::{MessageId, SubscriptionId, Topic},
        rpc::{
            ErrorData,
            ErrorResponse,
            Params,
            Payload,
            Request,
            Response,
            Subscription,
            SubscriptionData,
            SuccessfulResponse,
        },
    },
    serde_json::Value,
    std::{
        collections::{BTreeSet, HashMap, HashSet},
        sync::Arc,
    },
    tokio::sync::{mpsc, Mutex},
    tracing::debug,
};

#[derive(Debug)]
struct Peer {
    client: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Debug)]
struct Stored {
    data: SubscriptionData,
    publisher: u64,
    delivered: HashSet<u64>,
}

#[derive(Debug, Default)]
struct RelayState {
    next_client: u64,
    next_connection: u64,
    connections: HashMap<u64, Peer>,
    subscriptions: HashMap<Topic, BTreeSet<u64>>,
    mailbox: HashMap<Topic, Vec<Stored>>,
    /// Deliveries the recipient has not acknowledged yet: topic, mailbox
    /// index and recipient client, by subscription request id.
    awaiting_ack: HashMap<MessageId, (Topic, usize, u64)>,
    refuse_connections: bool,
}

impl RelayState {
    fn subscription_id(topic: &Topic, client: u64) -> SubscriptionId {
        SubscriptionId::derive(topic, &client.to_string())
    }

    fn subscribe(&mut self, connection: u64, topic: &Topic) -> SubscriptionId {
        self.subscriptions
            .entry(topic.clone())
            .or_default()
            .insert(connection);

        Self::subscription_id(topic, self.client_of(connection))
    }

    fn client_of(&self, connection: u64) -> u64 {
        self.connections
            .get(&connection)
            .map(|peer| peer.client)
            .unwrap_or_default()
    }

    fn deliver_pending(&mut self, connection: u64, topic: &Topic, ids: &MessageIdGenerator) {
        let Some(peer) = self.connections.get(&connection) else {
            return;
        };
        let Some(stored) = self.mailbox.get_mut(topic) else {
            return;
        };

        for (index, message) in stored.iter_mut().enumerate() {
            if message.publisher == peer.client || message.delivered.contains(&peer.client) {
                continue;
            }
            if let Some(id) = send_subscription(peer, &message.data, ids) {
                message.delivered.insert(peer.client);
                self.awaiting_ack
                    .insert(id, (topic.clone(), index, peer.client));
            }
        }
    }

    fn publish(&mut self, connection: u64, data: SubscriptionData, ids: &MessageIdGenerator) {
        let publisher = self.client_of(connection);
        let index = self.mailbox.get(&data.topic).map_or(0, Vec::len);
        let mut stored = Stored {
            data,
            publisher,
            delivered: HashSet::new(),
        };

        let subscribers = self
            .subscriptions
            .get(&stored.data.topic)
            .cloned()
            .unwrap_or_default();
        for subscriber in subscribers {
            let Some(peer) = self.connections.get(&subscriber) else {
                continue;
            };
            if peer.client == publisher || stored.delivered.contains(&peer.client) {
                continue;
            }
            if let Some(id) = send_subscription(peer, &stored.data, ids) {
                stored.delivered.insert(peer.client);
                self.awaiting_ack
                    .insert(id, (stored.data.topic.clone(), index, peer.client));
            }
        }

        self.mailbox
            .entry(stored.data.topic.clone())
            .or_default()
            .push(stored);
    }

    fn disconnect(&mut self, connection: u64) -> Option<Peer> {
        for subscribers in self.subscriptions.values_mut() {
            subscribers.remove(&connection);
        }
        self.connections.remove(&connection)
    }
}

/// Sends `data` to `peer`, returning the id of the subscription request.
fn send_subscription(
    peer: &Peer,
    data: &SubscriptionData,
    ids: &MessageIdGenerator,
) -> Option<MessageId> {
    let id = ids.next();
    let request = Request::new(
        id,
        Params::Subscription(Subscription {
            id: RelayState::subscription_id(&data.topic, peer.client),
            data: data.clone(),
        }),
    );

    let text = serde_json::to_string(&request).ok()?;
    peer.events
        .send(TransportEvent::Message(text))
        .is_ok()
        .then_some(id)
}

/// In-process relay broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
    ids: MessageIdGenerator,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport of a new client. Every connection opened through it belongs
    /// to the same client, so messages are not delivered twice across
    /// reconnects.
    pub async fn transport(&self) -> MemoryTransport {
        let mut state = self.state.lock().await;
        state.next_client += 1;
        MemoryTransport {
            relay: self.clone(),
            client: state.next_client,
        }
    }

    /// Closes every open connection. Subscriptions of closed connections are
    /// lost, stored messages are kept.
    pub async fn drop_connections(&self) {
        let mut state = self.state.lock().await;
        let connections = state.connections.keys().copied().collect::<Vec<_>>();
        for connection in connections {
            if let Some(peer) = state.disconnect(connection) {
                let _ = peer
                    .events
                    .send(TransportEvent::Closed(Some("dropped by relay".to_owned())));
            }
        }
    }

    /// While set, new connections are refused.
    pub async fn refuse_connections(&self, refuse: bool) {
        self.state.lock().await.refuse_connections = refuse;
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Number of open connections subscribed to `topic`.
    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.state
            .lock()
            .await
            .subscriptions
            .get(topic)
            .map(BTreeSet::len)
            .unwrap_or_default()
    }

    /// Every message published on `topic`, oldest first.
    pub async fn published(&self, topic: &Topic) -> Vec<SubscriptionData> {
        self.state
            .lock()
            .await
            .mailbox
            .get(topic)
            .map(|stored| stored.iter().map(|s| s.data.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of deliveries on `topic` their recipient has not acknowledged.
    pub async fn unacknowledged(&self, topic: &Topic) -> usize {
        self.state
            .lock()
            .await
            .awaiting_ack
            .values()
            .filter(|(awaiting, ..)| awaiting == topic)
            .count()
    }

    /// Sends every unacknowledged delivery again, to an open connection of
    /// its recipient subscribed to the topic.
    pub async fn redeliver(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let awaiting = state.awaiting_ack.drain().collect::<Vec<_>>();
        for (id, (topic, index, client)) in awaiting {
            let data = state
                .mailbox
                .get(&topic)
                .and_then(|stored| stored.get(index))
                .map(|stored| stored.data.clone());
            let connections = state.subscriptions.get(&topic).cloned().unwrap_or_default();

            let resent = data.and_then(|data| {
                connections
                    .iter()
                    .filter_map(|connection| state.connections.get(connection))
                    .filter(|peer| peer.client == client)
                    .find_map(|peer| send_subscription(peer, &data, &self.ids))
            });
            state
                .awaiting_ack
                .insert(resent.unwrap_or(id), (topic, index, client));
        }
    }

    async fn connect(&self, client: u64) -> Result<Connection> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let connection = {
            let mut state = self.state.lock().await;
            if state.refuse_connections {
                return Err(Error::ConnectionFailed("connection refused".to_owned()));
            }

            state.next_connection += 1;
            let connection = state.next_connection;
            state.connections.insert(connection, Peer {
                client,
                events: events_tx,
            });
            connection
        };

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                relay.handle_frame(connection, &frame).await;
            }

            debug!(connection, "client closed connection");
            if let Some(peer) = relay.state.lock().await.disconnect(connection) {
                let _ = peer.events.send(TransportEvent::Closed(None));
            }
        });

        Ok(Connection {
            outbound: outbound_tx,
            inbound: events_rx,
        })
    }

    async fn handle_frame(&self, connection: u64, frame: &str) {
        let request = match serde_json::from_str::<Payload>(frame) {
            Ok(Payload::Request(request)) => request,
            Ok(Payload::Response(Response::Success(ack))) => {
                self.state.lock().await.awaiting_ack.remove(&ack.id);
                return;
            }
            Ok(Payload::Response(Response::Error(_))) => return,
            Err(err) => {
                debug!(?err, "ignoring malformed frame");
                return;
            }
        };

        let mut state = self.state.lock().await;
        let mut subscribed = Vec::new();
        let result = match request.params {
            Params::Subscribe(params) => {
                let id = state.subscribe(connection, &params.topic);
                subscribed.push(params.topic);
                Ok(Value::String(id.to_string()))
            }
            Params::BatchSubscribe(params) => {
                let ids = params
                    .topics
                    .iter()
                    .map(|topic| Value::String(state.subscribe(connection, topic).to_string()))
                    .collect();
                subscribed = params.topics;
                Ok(Value::Array(ids))
            }
            Params::Unsubscribe(params) => {
                if let Some(subscribers) = state.subscriptions.get_mut(&params.topic) {
                    subscribers.remove(&connection);
                }
                Ok(Value::Bool(true))
            }
            Params::Publish(params) => {
                state.publish(
                    connection,
                    SubscriptionData {
                        topic: params.topic,
                        message: params.message,
                        published_at: chrono::Utc::now().timestamp_millis(),
                        tag: params.tag,
                    },
                    &self.ids,
                );
                Ok(Value::Bool(true))
            }
            Params::Subscription(_) => Err(ErrorData::method_not_found("irn_subscription")),
        };

        let response = match result {
            Ok(result) => Response::Success(SuccessfulResponse::new(request.id, result)),
            Err(error) => Response::Error(ErrorResponse::new(request.id, error)),
        };

        if let (Some(peer), Ok(text)) = (
            state.connections.get(&connection),
            serde_json::to_string(&response),
        ) {
            let _ = peer.events.send(TransportEvent::Message(text));
        }

        // Stored messages follow the subscription acknowledgement.
        for topic in &subscribed {
            state.deliver_pending(connection, topic, &self.ids);
        }
    }
}

/// Transport of one client of a [`MemoryRelay`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    relay: MemoryRelay,
    client: u64,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Connection> {
        verify_jwt(options.auth.token().as_str())
            .map_err(|err| Error::ConnectionFailed(err.to_string()))?;

        self.relay.connect(self.client).await
    }
}
