//! The session engine: proposals and settlement, session maintenance, typed
//! session requests and one-click authentication, on top of the pairing
//! client.
//!
//! https://specs.walletconnect.com/2.0/specs/clients/sign

mod authenticate;
mod expiry;
mod flow;
mod propose;
mod session;

pub use {
    authenticate::AuthenticateData,
    flow::{Approval, FlowOutcome},
    propose::{ApproveParams, ApprovedData, ConnectData, ConnectParams},
    session::{Acknowledgement, SessionRequestEvent},
};

use {
    crate::{
        error::{Result, SignError},
        events::SignEvent,
        types::{
            AuthPendingRequest,
            AuthRequestRecord,
            PendingRequestStruct,
            ProposalStruct,
            SessionStruct,
        },
    },
    core_api::{
        expirer::{Expirer, ExpirerTarget},
        storage::KeyValueStorage,
        store::Store,
        time,
    },
    flow::Flows,
    futures_util::future::BoxFuture,
    pairing_api::PairingClient,
    relay_client::{
        messaging::{InboundRequest, InboundResponse, MessageHandler},
        subscriber::UnsubscribeOptions,
    },
    relay_rpc::{
        domain::{MessageId, Topic},
        rpc::{
            params::{
                namespaces::ProposeNamespaces,
                session_authenticate::SessionAuthenticateRequest,
                session_delete::SessionDeleteRequest,
                session_event::SessionEventRequest,
                session_extend::SessionExtendRequest,
                session_ping::SessionPingRequest,
                session_propose::SessionProposeRequest,
                session_request::SessionRequestRequest,
                session_settle::SessionSettleRequest,
                session_update::SessionUpdateRequest,
                Metadata,
                RpcMethod,
            },
            ErrorData,
        },
    },
    serde_json::Value,
    std::{
        collections::HashMap,
        fmt,
        future::Future,
        sync::{Arc, Mutex as StdMutex, PoisonError},
    },
    tokio::sync::broadcast,
    tracing::{debug, warn},
};

/// Storage context of the sign client stores.
pub const SIGN_CONTEXT: &str = "client";

type RequestHandler = Arc<
    dyn Fn(SessionRequestEvent<Value>) -> BoxFuture<'static, std::result::Result<Value, ErrorData>>
        + Send
        + Sync,
>;

pub struct Engine {
    handler: Arc<MessageHandler>,
    pairing: Arc<PairingClient>,
    expirer: Arc<Expirer>,
    metadata: Metadata,
    sessions: Store<SessionStruct>,
    proposals: Store<ProposalStruct>,
    pending_requests: Store<PendingRequestStruct>,
    /// Inbound `wc_sessionAuthenticate` requests.
    auth_requests: Store<AuthPendingRequest>,
    /// `wc_sessionAuthenticate` requests sent by this client.
    sent_auth_requests: Store<AuthRequestRecord>,
    flows: Arc<Flows>,
    request_handlers: StdMutex<HashMap<String, RequestHandler>>,
    events: broadcast::Sender<SignEvent>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods = self
            .request_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        f.debug_struct("Engine")
            .field("metadata", &self.metadata)
            .field("request_handlers", &methods)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        handler: Arc<MessageHandler>,
        pairing: Arc<PairingClient>,
        expirer: Arc<Expirer>,
        storage: Arc<dyn KeyValueStorage>,
        metadata: Metadata,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(128);
        Arc::new(Self {
            handler,
            pairing,
            expirer,
            metadata,
            sessions: Store::new(SIGN_CONTEXT, "session", storage.clone()),
            proposals: Store::new(SIGN_CONTEXT, "proposal", storage.clone()),
            pending_requests: Store::new(SIGN_CONTEXT, "pendingRequest", storage.clone()),
            auth_requests: Store::new(SIGN_CONTEXT, "authRequest", storage.clone()),
            sent_auth_requests: Store::new(SIGN_CONTEXT, "requestedAuth", storage),
            flows: Arc::default(),
            request_handlers: StdMutex::default(),
            events,
        })
    }

    /// Restores the stores, registers the sign methods and starts following
    /// expirations and pairing events. Must run before the message handler
    /// starts.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        self.sessions.init().await?;
        self.proposals.init().await?;
        self.pending_requests.init().await?;
        self.auth_requests.init().await?;
        self.sent_auth_requests.init().await?;

        self.handler.register::<SessionProposeRequest>().await?;
        self.handler.register::<SessionSettleRequest>().await?;
        self.handler.register::<SessionUpdateRequest>().await?;
        self.handler.register::<SessionExtendRequest>().await?;
        self.handler.register::<SessionRequestRequest>().await?;
        self.handler.register::<SessionEventRequest>().await?;
        self.handler.register::<SessionDeleteRequest>().await?;
        self.handler.register::<SessionPingRequest>().await?;
        self.handler.register::<SessionAuthenticateRequest>().await?;

        self.on_request::<SessionProposeRequest, _, _>(|engine, request| async move {
            engine.on_session_propose(request).await
        })?;
        self.on_request::<SessionSettleRequest, _, _>(|engine, request| async move {
            engine.on_session_settle(request).await
        })?;
        self.on_request::<SessionUpdateRequest, _, _>(|engine, request| async move {
            engine.on_session_update(request).await
        })?;
        self.on_request::<SessionExtendRequest, _, _>(|engine, request| async move {
            engine.on_session_extend(request).await
        })?;
        self.on_request::<SessionRequestRequest, _, _>(|engine, request| async move {
            engine.on_session_request_inbound(request).await
        })?;
        self.on_request::<SessionEventRequest, _, _>(|engine, request| async move {
            engine.on_session_event(request).await
        })?;
        self.on_request::<SessionDeleteRequest, _, _>(|engine, request| async move {
            engine.on_session_delete(request).await
        })?;
        self.on_request::<SessionPingRequest, _, _>(|engine, request| async move {
            engine.on_session_ping(request).await
        })?;
        self.on_request::<SessionAuthenticateRequest, _, _>(|engine, request| async move {
            engine.on_session_authenticate(request).await
        })?;

        self.on_response::<SessionProposeRequest, _, _>(|engine, response| async move {
            engine.on_propose_response(response).await
        })?;
        self.on_response::<SessionSettleRequest, _, _>(|engine, response| async move {
            engine.on_settle_response(response).await
        })?;
        self.on_response::<SessionAuthenticateRequest, _, _>(|engine, response| async move {
            engine.on_authenticate_response(response).await
        })?;

        self.pairing
            .register(&[SessionProposeRequest::METHOD, SessionAuthenticateRequest::METHOD])
            .await;

        tokio::spawn(expiry::watch_expirations(
            Arc::downgrade(self),
            self.expirer.subscribe(),
        ));
        tokio::spawn(expiry::watch_pairing(
            Arc::downgrade(self),
            self.pairing.subscribe(),
        ));
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignEvent> {
        self.events.subscribe()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub async fn sessions(&self) -> Vec<SessionStruct> {
        self.sessions.values().await
    }

    pub async fn get_session(&self, topic: &Topic) -> Result<SessionStruct> {
        self.sessions
            .get(topic)
            .await
            .map_err(|_| SignError::SessionNotFound(topic.clone()))
    }

    /// Live sessions whose approved namespaces satisfy `required`.
    pub async fn find(&self, required: &ProposeNamespaces) -> Vec<SessionStruct> {
        self.sessions
            .get_all(|session| {
                !time::is_expired(session.expiry) && session.namespaces.conforms_to(required).is_ok()
            })
            .await
    }

    pub async fn proposals(&self) -> Vec<ProposalStruct> {
        self.proposals.values().await
    }

    pub async fn pending_session_requests(&self) -> Vec<PendingRequestStruct> {
        self.pending_requests.values().await
    }

    pub async fn pending_authenticate_requests(&self) -> Vec<AuthPendingRequest> {
        self.auth_requests.values().await
    }

    /// Tears down what expired while the client was not running.
    pub async fn delete_expired(&self) -> Result<()> {
        for session in self.sessions.values().await {
            if time::is_expired(session.expiry) {
                self.delete_session(&session.topic).await?;
                self.notify(SignEvent::SessionExpired {
                    topic: session.topic,
                });
            }
        }
        for proposal in self.proposals.values().await {
            if time::is_expired(proposal.expiry) {
                self.delete_proposal(proposal.id).await?;
            }
        }
        for request in self.pending_requests.values().await {
            if time::is_expired(request.expiry) {
                self.delete_pending_request(request.id).await?;
            }
        }
        for request in self.auth_requests.values().await {
            if time::is_expired(request.expiry_timestamp) {
                self.delete_auth_request(request.id).await?;
            }
        }
        for record in self.sent_auth_requests.values().await {
            if time::is_expired(record.expiry_timestamp) {
                self.forget_sent_auth(&record, true).await?;
            }
        }
        Ok(())
    }

    fn notify(&self, event: SignEvent) {
        let _ = self.events.send(event);
    }

    fn on_request<T, F, Fut>(self: &Arc<Self>, callback: F) -> Result<()>
    where
        T: RpcMethod,
        F: Fn(Arc<Self>, InboundRequest<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let engine = Arc::downgrade(self);
        self.handler.on_request::<T, _, _>(move |request| {
            let handling = engine.upgrade().map(|engine| callback(engine, request));
            async move {
                if let Some(handling) = handling {
                    handling.await;
                }
            }
        })?;
        Ok(())
    }

    fn on_response<T, F, Fut>(self: &Arc<Self>, callback: F) -> Result<()>
    where
        T: RpcMethod,
        F: Fn(Arc<Self>, InboundResponse<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let engine = Arc::downgrade(self);
        self.handler.on_response::<T, _, _>(move |response| {
            let handling = engine.upgrade().map(|engine| callback(engine, response));
            async move {
                if let Some(handling) = handling {
                    handling.await;
                }
            }
        })?;
        Ok(())
    }

    /// Answers a request this client could not serve.
    async fn reject_request<T: RpcMethod>(&self, topic: &Topic, id: MessageId, err: &SignError) {
        debug!(?err, %topic, %id, method = T::METHOD, "rejecting request");
        if let Err(err) = self.handler.send_error::<T>(topic, id, err.error_data()).await {
            warn!(?err, %topic, %id, "failed to send error response");
        }
    }

    /// The session of `topic`. An expired session is deleted first.
    async fn valid_session(&self, topic: &Topic) -> Result<SessionStruct> {
        let session = self.get_session(topic).await?;
        if time::is_expired(session.expiry) {
            self.delete_session(topic).await?;
            self.notify(SignEvent::SessionExpired {
                topic: topic.clone(),
            });
            return Err(SignError::SessionExpired(topic.clone()));
        }
        Ok(session)
    }

    async fn valid_proposal(&self, id: MessageId) -> Result<ProposalStruct> {
        let proposal = self
            .proposals
            .get(&id)
            .await
            .map_err(|_| SignError::ProposalNotFound(id))?;
        if time::is_expired(proposal.expiry) {
            self.delete_proposal(id).await?;
            return Err(SignError::ProposalExpired(id));
        }
        Ok(proposal)
    }

    async fn delete_expiry(&self, target: impl Into<ExpirerTarget>) -> Result<()> {
        let target = target.into();
        if self.expirer.has(&target).await {
            self.expirer.delete(&target).await?;
        }
        Ok(())
    }

    /// Unsubscribes and forgets the session with its keys, expiry and
    /// pending requests. Each step is skipped when there is nothing left to
    /// remove.
    async fn delete_session(&self, topic: &Topic) -> Result<()> {
        let relayer = self.handler.relayer();
        if relayer.subscriber().topics().await.contains(topic) {
            if let Err(err) = relayer
                .unsubscribe(topic, UnsubscribeOptions::default())
                .await
            {
                warn!(?err, %topic, "failed to unsubscribe from session");
            }
        }

        let session = self.sessions.delete(topic, "session deleted").await?;
        self.delete_expiry(topic.clone()).await?;

        let crypto = self.handler.crypto();
        if crypto.has_keys(topic.as_str()).await {
            crypto.delete_sym_key(topic).await?;
        }
        if let Some(session) = session {
            if crypto.has_keys(&session.self_.public_key).await {
                crypto.delete_key_pair(&session.self_.public_key).await?;
            }
        }
        relayer.message_tracker().delete(topic).await?;

        for request in self
            .pending_requests
            .get_all(|request| request.topic == *topic)
            .await
        {
            self.delete_pending_request(request.id).await?;
        }
        debug!(%topic, "session deleted");
        Ok(())
    }

    async fn delete_proposal(&self, id: MessageId) -> Result<()> {
        self.proposals.delete(&id, "proposal deleted").await?;
        self.delete_expiry(id).await
    }

    async fn delete_pending_request(&self, id: MessageId) -> Result<()> {
        self.pending_requests.delete(&id, "request answered").await?;
        self.delete_expiry(id).await
    }

    async fn delete_auth_request(&self, id: MessageId) -> Result<()> {
        self.auth_requests.delete(&id, "authentication answered").await?;
        self.delete_expiry(id).await
    }

    /// Marks the pairing with the peer active and records who the peer is.
    async fn activate_pairing(&self, topic: &Topic, metadata: Metadata) -> Result<()> {
        self.pairing.update_metadata(topic, metadata).await?;
        self.pairing.activate(topic).await?;
        Ok(())
    }
}
