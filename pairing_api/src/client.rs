use {
    crate::{
        pairing::{PairingPatch, PairingStruct},
        uri::{Methods, PairingUri, PAIRING_VERSION},
        PairingClientError,
        Result,
    },
    core_api::{
        crypto::generate_random_bytes32,
        expirer::{Expirer, ExpirerEvent, ExpirerTarget},
        storage::{KeyValueStorage, CORE_CONTEXT},
        store::Store,
        time::{self, FIVE_MINUTES, THIRTY_DAYS},
    },
    relay_client::{
        messaging::{InboundRequest, MessageHandler},
        subscriber::{SubscribeOptions, UnsubscribeOptions},
    },
    relay_rpc::{
        domain::{MessageId, Topic},
        rpc::params::{
            pairing_delete::PairingDeleteRequest,
            pairing_extend::PairingExtendRequest,
            pairing_ping::PairingPingRequest,
            Metadata,
            Relay,
            RpcMethod,
            SdkErrorKind,
        },
    },
    std::{
        collections::BTreeSet,
        sync::{Arc, Weak},
    },
    tokio::sync::{broadcast, Mutex},
    tracing::{debug, info, warn},
};

const STORE_NAME: &str = "pairing";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// The peer pinged the pairing.
    Ping { id: MessageId, topic: Topic },
    /// The peer deleted the pairing.
    Deleted { id: MessageId, topic: Topic },
    Expired { topic: Topic },
}

/// Creates, restores and maintains pairings: the long lived channels over
/// which sessions are proposed.
#[derive(Debug)]
pub struct PairingClient {
    handler: Arc<MessageHandler>,
    pairings: Store<PairingStruct>,
    expirer: Arc<Expirer>,
    registered_methods: Mutex<BTreeSet<String>>,
    events: broadcast::Sender<PairingEvent>,
}

impl PairingClient {
    pub fn new(
        handler: Arc<MessageHandler>,
        expirer: Arc<Expirer>,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            handler,
            pairings: Store::new(CORE_CONTEXT, STORE_NAME, storage),
            expirer,
            registered_methods: Mutex::default(),
            events,
        })
    }

    /// Restores the pairings, registers the pairing methods and starts
    /// tearing down expired pairings. Must run before the relayer delivers
    /// messages.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        self.pairings.init().await?;

        self.handler.register::<PairingPingRequest>().await?;
        self.handler.register::<PairingDeleteRequest>().await?;
        self.handler.register::<PairingExtendRequest>().await?;

        let client = Arc::downgrade(self);
        self.handler.on_request::<PairingPingRequest, _, _>(move |request| {
            let client = client.clone();
            async move {
                if let Some(client) = client.upgrade() {
                    client.on_ping(request).await;
                }
            }
        })?;
        let client = Arc::downgrade(self);
        self.handler.on_request::<PairingDeleteRequest, _, _>(move |request| {
            let client = client.clone();
            async move {
                if let Some(client) = client.upgrade() {
                    client.on_delete(request).await;
                }
            }
        })?;
        let client = Arc::downgrade(self);
        self.handler.on_request::<PairingExtendRequest, _, _>(move |request| {
            let client = client.clone();
            async move {
                if let Some(client) = client.upgrade() {
                    client.on_extend(request).await;
                }
            }
        })?;

        tokio::spawn(watch_expirations(Arc::downgrade(self), self.expirer.subscribe()));

        for pairing in self.pairings.values().await {
            if time::is_expired(pairing.expiry) {
                self.on_expired(&pairing.topic).await;
            }
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    /// Methods advertised by pairings created without explicit methods.
    pub async fn register(&self, methods: &[&str]) {
        self.registered_methods
            .lock()
            .await
            .extend(methods.iter().map(|m| (*m).to_owned()));
    }

    /// Creates an inactive pairing valid for five minutes and returns its
    /// topic and URI.
    pub async fn create(&self, methods: Option<Methods>) -> Result<(Topic, PairingUri)> {
        let methods = match methods {
            Some(methods) => Some(methods),
            None => {
                let registered = self.registered_methods.lock().await;
                (!registered.is_empty())
                    .then(|| Methods(vec![registered.iter().cloned().collect()]))
            }
        };

        let sym_key = generate_random_bytes32();
        let topic = self.handler.crypto().set_sym_key(&sym_key, None).await?;
        let expiry = time::expiry_from_now(FIVE_MINUTES);
        let relay = Relay::default();

        self.pairings
            .set(PairingStruct {
                topic: topic.clone(),
                relay: relay.clone(),
                expiry,
                active: false,
                methods: methods.clone(),
                peer_metadata: None,
            })
            .await?;
        self.handler
            .relayer()
            .subscribe(&topic, SubscribeOptions {
                relay: relay.clone(),
            })
            .await?;
        self.expirer.set(topic.clone(), expiry).await?;

        info!(%topic, "pairing created");
        Ok((topic.clone(), PairingUri {
            topic,
            version: PAIRING_VERSION.to_owned(),
            sym_key,
            relay,
            methods,
            expiry_timestamp: Some(expiry),
        }))
    }

    /// Pairs with the peer that shared `uri`.
    pub async fn pair(&self, uri: &str, activate: bool) -> Result<PairingStruct> {
        let uri = uri.parse::<PairingUri>()?;
        let topic = uri.topic.clone();
        if self.pairings.contains(&topic).await {
            return Err(PairingClientError::PairingAlreadyExists(topic));
        }
        if self.handler.crypto().has_keys(topic.as_str()).await {
            return Err(PairingClientError::KeysAlreadyExist(topic));
        }

        let expiry = uri
            .expiry_timestamp
            .unwrap_or_else(|| time::expiry_from_now(FIVE_MINUTES));
        let mut pairing = self
            .pairings
            .set(PairingStruct {
                topic: topic.clone(),
                relay: uri.relay.clone(),
                expiry,
                active: false,
                methods: uri.methods,
                peer_metadata: None,
            })
            .await?;
        self.handler
            .crypto()
            .set_sym_key(&uri.sym_key, Some(topic.clone()))
            .await?;

        if activate {
            pairing = self.activate(&topic).await?;
        }
        self.handler
            .relayer()
            .subscribe(&topic, SubscribeOptions { relay: uri.relay })
            .await?;
        self.expirer.set(topic.clone(), pairing.expiry).await?;

        info!(%topic, activate, "paired");
        Ok(pairing)
    }

    /// Marks the pairing active and extends it to thirty days.
    pub async fn activate(&self, topic: &Topic) -> Result<PairingStruct> {
        let expiry = time::expiry_from_now(THIRTY_DAYS);
        let pairing = self
            .update(topic, PairingPatch {
                active: Some(true),
                expiry: Some(expiry),
                ..Default::default()
            })
            .await?;
        self.expirer.set(topic.clone(), expiry).await?;
        Ok(pairing)
    }

    pub async fn update_expiry(&self, topic: &Topic, expiry: u64) -> Result<PairingStruct> {
        let pairing = self
            .update(topic, PairingPatch {
                expiry: Some(expiry),
                ..Default::default()
            })
            .await?;
        self.expirer.set(topic.clone(), expiry).await?;
        Ok(pairing)
    }

    pub async fn update_metadata(&self, topic: &Topic, metadata: Metadata) -> Result<PairingStruct> {
        self.update(topic, PairingPatch {
            peer_metadata: Some(metadata),
            ..Default::default()
        })
        .await
    }

    /// Asks the peer to extend the pairing by `ttl` seconds and extends it
    /// locally.
    pub async fn extend(&self, topic: &Topic, ttl: u64) -> Result<PairingStruct> {
        self.is_valid_pairing_topic(topic).await?;
        let expiry = time::expiry_from_now(ttl.min(THIRTY_DAYS));
        self.handler
            .send_request(topic, PairingExtendRequest { expiry })
            .await?;
        self.update_expiry(topic, expiry).await
    }

    pub async fn pairings(&self) -> Vec<PairingStruct> {
        self.pairings.values().await
    }

    pub async fn get_pairing(&self, topic: &Topic) -> Result<PairingStruct> {
        self.pairings
            .get(topic)
            .await
            .map_err(|_| PairingClientError::PairingNotFound(topic.clone()))
    }

    /// Checks that the peer is online. Resolves once the peer answers.
    pub async fn ping(&self, topic: &Topic) -> Result<()> {
        self.is_valid_pairing_topic(topic).await?;
        self.handler
            .send_request_and_wait(topic, PairingPingRequest {})
            .await?;
        Ok(())
    }

    /// Tells the peer the pairing is gone and deletes it.
    pub async fn disconnect(&self, topic: &Topic) -> Result<()> {
        self.is_valid_pairing_topic(topic).await?;
        let reason = SdkErrorKind::UserDisconnected.error_data();
        self.handler
            .send_request(topic, PairingDeleteRequest {
                code: reason.code.into(),
                message: reason.message,
            })
            .await?;
        self.delete_pairing(topic).await
    }

    /// Unsubscribes and forgets the pairing with its key and expiry. Each
    /// step is skipped when there is nothing left to remove.
    pub async fn delete_pairing(&self, topic: &Topic) -> Result<()> {
        let relayer = self.handler.relayer();
        if relayer.subscriber().topics().await.contains(topic) {
            relayer
                .unsubscribe(topic, UnsubscribeOptions::default())
                .await?;
        }

        self.pairings.delete(topic, "pairing deleted").await?;
        let target = ExpirerTarget::Topic(topic.clone());
        if self.expirer.has(&target).await {
            self.expirer.delete(&target).await?;
        }

        let crypto = self.handler.crypto();
        if crypto.has_keys(topic.as_str()).await {
            crypto.delete_sym_key(topic).await?;
        }
        relayer.message_tracker().delete(topic).await?;

        debug!(%topic, "pairing deleted");
        Ok(())
    }

    /// The pairing of `topic`. An expired pairing is deleted first.
    pub async fn is_valid_pairing_topic(&self, topic: &Topic) -> Result<PairingStruct> {
        let pairing = self.get_pairing(topic).await?;
        if time::is_expired(pairing.expiry) {
            self.delete_pairing(topic).await?;
            return Err(PairingClientError::PairingExpired(topic.clone()));
        }
        Ok(pairing)
    }

    async fn update(&self, topic: &Topic, patch: PairingPatch) -> Result<PairingStruct> {
        self.pairings
            .update(topic, patch)
            .await
            .map_err(|err| match err {
                err if err.is_not_found() => PairingClientError::PairingNotFound(topic.clone()),
                err => err.into(),
            })
    }

    async fn on_ping(&self, request: InboundRequest<PairingPingRequest>) {
        let InboundRequest { topic, id, .. } = request;
        if let Err(err) = self.is_valid_pairing_topic(&topic).await {
            self.reject::<PairingPingRequest>(&topic, id, err).await;
            return;
        }

        if let Err(err) = self
            .handler
            .send_result::<PairingPingRequest>(&topic, id, true)
            .await
        {
            warn!(?err, %topic, "failed to answer pairing ping");
        }
        let _ = self.events.send(PairingEvent::Ping { id, topic });
    }

    async fn on_delete(&self, request: InboundRequest<PairingDeleteRequest>) {
        let InboundRequest { topic, id, params } = request;
        if let Err(err) = self.is_valid_pairing_topic(&topic).await {
            self.reject::<PairingDeleteRequest>(&topic, id, err).await;
            return;
        }

        debug!(%topic, code = params.code, reason = %params.message, "peer deleted pairing");
        if let Err(err) = self
            .handler
            .send_result::<PairingDeleteRequest>(&topic, id, true)
            .await
        {
            warn!(?err, %topic, "failed to answer pairing delete");
        }
        if let Err(err) = self.delete_pairing(&topic).await {
            warn!(?err, %topic, "failed to delete pairing");
        }
        let _ = self.events.send(PairingEvent::Deleted { id, topic });
    }

    async fn on_extend(&self, request: InboundRequest<PairingExtendRequest>) {
        let InboundRequest { topic, id, params } = request;
        let pairing = match self.is_valid_pairing_topic(&topic).await {
            Ok(pairing) => pairing,
            Err(err) => {
                self.reject::<PairingExtendRequest>(&topic, id, err).await;
                return;
            }
        };

        let max_expiry = time::expiry_from_now(THIRTY_DAYS);
        if params.expiry < pairing.expiry || params.expiry > max_expiry {
            let error = SdkErrorKind::InvalidExtendRequest
                .with_context(format!("pairing topic: {topic}"));
            if let Err(err) = self
                .handler
                .send_error::<PairingExtendRequest>(&topic, id, error)
                .await
            {
                warn!(?err, %topic, "failed to reject pairing extend");
            }
            return;
        }

        let result = async {
            self.update_expiry(&topic, params.expiry).await?;
            self.handler
                .send_result::<PairingExtendRequest>(&topic, id, true)
                .await?;
            Result::Ok(())
        }
        .await;
        if let Err(err) = result {
            warn!(?err, %topic, "failed to extend pairing");
        }
    }

    async fn reject<T: RpcMethod>(&self, topic: &Topic, id: MessageId, err: PairingClientError) {
        debug!(?err, %topic, method = T::METHOD, "rejecting request on invalid pairing");
        let error = SdkErrorKind::NoMatchingKey.with_context(format!("pairing topic: {topic}"));
        if let Err(err) = self.handler.send_error::<T>(topic, id, error).await {
            warn!(?err, %topic, "failed to send error response");
        }
    }

    async fn on_expired(&self, topic: &Topic) {
        if !self.pairings.contains(topic).await {
            return;
        }

        if let Err(err) = self.delete_pairing(topic).await {
            warn!(?err, %topic, "failed to delete expired pairing");
        }
        let _ = self.events.send(PairingEvent::Expired {
            topic: topic.clone(),
        });
    }
}

async fn watch_expirations(
    client: Weak<PairingClient>,
    mut events: broadcast::Receiver<ExpirerEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "expirer events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let ExpirerEvent::Expired(expiration) = event else {
            continue;
        };
        let ExpirerTarget::Topic(topic) = expiration.target else {
            continue;
        };
        let Some(client) = client.upgrade() else {
            break;
        };
        client.on_expired(&topic).await;
    }
}
