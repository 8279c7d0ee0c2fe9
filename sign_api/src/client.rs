use {
    crate::{
        auth::{self, AuthenticateParams},
        engine::{
            Acknowledgement,
            ApproveParams,
            ApprovedData,
            AuthenticateData,
            ConnectData,
            ConnectParams,
            Engine,
            SessionRequestEvent,
        },
        error::Result,
        events::SignEvent,
        types::{AuthPendingRequest, PendingRequestStruct, ProposalStruct, SessionMethod, SessionStruct},
    },
    core_api::{
        crypto::KeyChainCrypto,
        expirer::Expirer,
        heartbeat::{HeartBeat, DEFAULT_HEARTBEAT_INTERVAL},
        storage::{KeyValueStorage, MemoryStorage, CORE_CONTEXT},
    },
    pairing_api::{PairingClient, PairingStruct},
    relay_client::{
        messaging::MessageHandler,
        relayer::{Relayer, RelayerOptions},
        transport::Transport,
        websocket::WebsocketTransport,
    },
    relay_rpc::{
        auth::{cacao::Cacao, RELAY_WEBSOCKET_ADDRESS},
        domain::{MessageId, ProjectId, Topic},
        rpc::{
            params::{
                namespaces::{ProposeNamespaces, SettleNamespaces},
                session_authenticate::AuthPayload,
                session_event::Event,
                session_extend::SessionExtendRequest,
                session_request::Request,
                session_update::SessionUpdateRequest,
                Metadata,
            },
            ErrorData,
        },
    },
    serde_json::Value,
    std::{future::Future, sync::Arc, time::Duration},
    tokio::sync::broadcast,
    tracing::info,
};

/// Configuration of a [`SignClient`].
#[derive(Debug, Clone)]
pub struct SignClientOptions {
    pub project_id: ProjectId,
    pub relay_address: String,
    /// Describes this client to its peers.
    pub metadata: Metadata,
    /// In-memory storage when `None`.
    pub storage: Option<Arc<dyn KeyValueStorage>>,
    /// WebSocket transport when `None`.
    pub transport: Option<Arc<dyn Transport>>,
    pub heartbeat_interval: Duration,
    pub connection_timeout: Option<Duration>,
    pub reconnect_delay: Option<Duration>,
}

impl SignClientOptions {
    pub fn new(project_id: impl Into<ProjectId>, metadata: Metadata) -> Self {
        Self {
            project_id: project_id.into(),
            relay_address: RELAY_WEBSOCKET_ADDRESS.to_owned(),
            metadata,
            storage: None,
            transport: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connection_timeout: None,
            reconnect_delay: None,
        }
    }

    pub fn with_relay_address(mut self, address: impl Into<String>) -> Self {
        self.relay_address = address.into();
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.connection_timeout = timeout.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    fn relayer_options(&self) -> RelayerOptions {
        let options = RelayerOptions::new(self.project_id.clone())
            .with_relay_address(self.relay_address.clone())
            .with_connection_timeout(self.connection_timeout);
        match self.reconnect_delay {
            Some(delay) => options.with_reconnect_delay(delay),
            None => options,
        }
    }
}

/// WalletConnect Sign client: pairs with peers and opens, maintains and uses
/// sessions with them.
#[derive(Debug)]
pub struct SignClient {
    relayer: Arc<Relayer>,
    pairing: Arc<PairingClient>,
    engine: Arc<Engine>,
    heartbeat: HeartBeat,
}

impl SignClient {
    /// Builds the client, restores its persisted state and connects to the
    /// relay.
    pub async fn init(options: SignClientOptions) -> Result<Self> {
        let storage: Arc<dyn KeyValueStorage> = match &options.storage {
            Some(storage) => storage.clone(),
            None => Arc::new(MemoryStorage::new()),
        };
        let transport: Arc<dyn Transport> = match &options.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(WebsocketTransport::new()),
        };

        let crypto = Arc::new(KeyChainCrypto::new(storage.clone()));
        crypto.init().await?;
        let heartbeat = HeartBeat::new(options.heartbeat_interval);
        let relayer = Relayer::new(
            options.relayer_options(),
            crypto.clone(),
            transport,
            storage.clone(),
        );
        let handler = MessageHandler::new(CORE_CONTEXT, relayer.clone(), crypto, storage.clone());
        let expirer = Arc::new(Expirer::new(storage.clone()));
        let pairing = PairingClient::new(handler.clone(), expirer.clone(), storage.clone());
        let engine = Engine::new(
            handler.clone(),
            pairing.clone(),
            expirer.clone(),
            storage,
            options.metadata,
        );

        // Callbacks must be in place before the relayer delivers anything.
        pairing.init().await?;
        engine.init().await?;
        handler.start();
        expirer.init(heartbeat.subscribe()).await?;
        relayer.init(heartbeat.subscribe()).await?;
        heartbeat.start();
        engine.delete_expired().await?;

        info!(project_id = %options.project_id, "sign client initialized");
        Ok(Self {
            relayer,
            pairing,
            engine,
            heartbeat,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignEvent> {
        self.engine.subscribe()
    }

    pub fn metadata(&self) -> &Metadata {
        self.engine.metadata()
    }

    pub fn pairing(&self) -> &Arc<PairingClient> {
        &self.pairing
    }

    pub fn relayer(&self) -> &Arc<Relayer> {
        &self.relayer
    }

    /// Proposes a session, on a new pairing unless `params` names one.
    pub async fn connect(&self, params: ConnectParams) -> Result<ConnectData> {
        self.engine.connect(params).await
    }

    /// Pairs with the peer that shared `uri`. Its proposal arrives as
    /// [`SignEvent::SessionProposal`].
    pub async fn pair(&self, uri: &str) -> Result<PairingStruct> {
        Ok(self.pairing.pair(uri, false).await?)
    }

    pub async fn approve(&self, params: ApproveParams) -> Result<ApprovedData> {
        self.engine.approve(params).await
    }

    pub async fn reject(&self, id: MessageId, reason: ErrorData) -> Result<()> {
        self.engine.reject(id, reason).await
    }

    pub async fn update(
        &self,
        topic: &Topic,
        namespaces: SettleNamespaces,
    ) -> Result<Acknowledgement<SessionUpdateRequest>> {
        self.engine.update(topic, namespaces).await
    }

    pub async fn extend(&self, topic: &Topic) -> Result<Acknowledgement<SessionExtendRequest>> {
        self.engine.extend(topic).await
    }

    pub async fn request<T: SessionMethod>(
        &self,
        topic: &Topic,
        chain_id: &str,
        params: T,
    ) -> Result<T::Response> {
        self.engine.request(topic, chain_id, params).await
    }

    pub async fn request_raw(&self, topic: &Topic, chain_id: &str, request: Request) -> Result<Value> {
        self.engine.request_raw(topic, chain_id, request).await
    }

    pub async fn respond(
        &self,
        topic: &Topic,
        id: MessageId,
        response: std::result::Result<Value, ErrorData>,
    ) -> Result<()> {
        self.engine.respond(topic, id, response).await
    }

    /// See [`Engine::on_session_request`].
    pub fn on_session_request<T, F, Fut>(&self, handler: F)
    where
        T: SessionMethod,
        F: Fn(SessionRequestEvent<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T::Response, ErrorData>> + Send + 'static,
    {
        self.engine.on_session_request(handler)
    }

    /// Pings a session or a pairing.
    pub async fn ping(&self, topic: &Topic) -> Result<()> {
        self.engine.ping(topic).await
    }

    pub async fn emit(&self, topic: &Topic, chain_id: &str, event: Event) -> Result<()> {
        self.engine.emit(topic, chain_id, event).await
    }

    /// Deletes a session or a pairing.
    pub async fn disconnect(&self, topic: &Topic) -> Result<()> {
        self.engine.disconnect(topic).await
    }

    pub async fn authenticate(&self, params: AuthenticateParams) -> Result<AuthenticateData> {
        self.engine.authenticate(params).await
    }

    pub async fn approve_session_authenticate(
        &self,
        id: MessageId,
        cacaos: Vec<Cacao>,
    ) -> Result<Option<SessionStruct>> {
        self.engine.approve_session_authenticate(id, cacaos).await
    }

    pub async fn reject_session_authenticate(&self, id: MessageId, reason: ErrorData) -> Result<()> {
        self.engine.reject_session_authenticate(id, reason).await
    }

    /// SIWE message a wallet signs for `payload` as `iss`.
    pub fn format_auth_message(&self, payload: &AuthPayload, iss: &str) -> Result<String> {
        auth::format_auth_message(payload, iss)
    }

    pub async fn sessions(&self) -> Vec<SessionStruct> {
        self.engine.sessions().await
    }

    pub async fn get_session(&self, topic: &Topic) -> Result<SessionStruct> {
        self.engine.get_session(topic).await
    }

    /// Live sessions whose namespaces satisfy `required`.
    pub async fn find(&self, required: &ProposeNamespaces) -> Vec<SessionStruct> {
        self.engine.find(required).await
    }

    pub async fn proposals(&self) -> Vec<ProposalStruct> {
        self.engine.proposals().await
    }

    pub async fn pending_session_requests(&self) -> Vec<PendingRequestStruct> {
        self.engine.pending_session_requests().await
    }

    pub async fn pending_authenticate_requests(&self) -> Vec<AuthPendingRequest> {
        self.engine.pending_authenticate_requests().await
    }

    /// Stops the heartbeat and closes the relay connection. Persisted state
    /// is kept for the next [`init`](Self::init).
    pub async fn close(&self) {
        self.heartbeat.stop();
        self.relayer.transport_close().await;
        info!("sign client closed");
    }
}
