use {
    super::{Engine, RequestHandler},
    crate::{
        error::{Result, SignError},
        events::SignEvent,
        types::{PendingRequestStruct, SessionMethod, SessionPatch},
        validation::{validate_event, validate_extend_expiry, validate_method, validate_update},
    },
    core_api::{
        crypto::EncodeOptions,
        time::{self, FIVE_MINUTES, SEVEN_DAYS},
    },
    futures_util::FutureExt,
    relay_client::messaging::{InboundRequest, ResponseWaiter},
    relay_rpc::{
        domain::{MessageId, Topic},
        rpc::{
            params::{
                namespaces::SettleNamespaces,
                session_delete::SessionDeleteRequest,
                session_event::{Event, SessionEventRequest},
                session_extend::SessionExtendRequest,
                session_ping::SessionPingRequest,
                session_request::{Request, SessionRequestRequest},
                session_update::SessionUpdateRequest,
                RpcMethod,
                SdkErrorKind,
            },
            ErrorData,
        },
    },
    serde_json::Value,
    std::{
        future::Future,
        sync::{Arc, PoisonError},
    },
    tracing::{debug, info, warn},
};

/// A change applied locally and sent to the peer. Resolves once the peer
/// confirmed it.
#[derive(Debug)]
pub struct Acknowledgement<T: RpcMethod<Response = bool>> {
    waiter: ResponseWaiter<T>,
}

impl<T: RpcMethod<Response = bool>> Acknowledgement<T> {
    pub fn id(&self) -> MessageId {
        self.waiter.id()
    }

    pub async fn acknowledged(self) -> Result<()> {
        if self.waiter.wait().await? {
            Ok(())
        } else {
            Err(SignError::Rejected(
                SdkErrorKind::MissingOrInvalid.with_context(format!("{} not acknowledged", T::METHOD)),
            ))
        }
    }
}

/// An inbound `wc_sessionRequest` handed to a typed handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequestEvent<T> {
    pub id: MessageId,
    pub topic: Topic,
    pub chain_id: String,
    pub params: T,
}

impl Engine {
    /// Replaces the namespaces of a session this client controls.
    pub async fn update(
        &self,
        topic: &Topic,
        namespaces: SettleNamespaces,
    ) -> Result<Acknowledgement<SessionUpdateRequest>> {
        let session = self.valid_session(topic).await?;
        if !session.is_controller() {
            return Err(SignError::UnauthorizedUpdate(topic.clone()));
        }
        validate_update(&session, &namespaces)?;

        let waiter = self
            .handler
            .send_request_with_waiter(topic, SessionUpdateRequest {
                namespaces: namespaces.clone(),
            })
            .await?;
        self.sessions
            .update(topic, SessionPatch {
                namespaces: Some(namespaces),
                ..Default::default()
            })
            .await?;

        info!(%topic, "session updated");
        Ok(Acknowledgement { waiter })
    }

    /// Extends the session to seven days from now.
    pub async fn extend(&self, topic: &Topic) -> Result<Acknowledgement<SessionExtendRequest>> {
        self.valid_session(topic).await?;
        let expiry = time::expiry_from_now(SEVEN_DAYS);

        let waiter = self
            .handler
            .send_request_with_waiter(topic, SessionExtendRequest { expiry })
            .await?;
        self.set_session_expiry(topic, expiry).await?;

        info!(%topic, expiry, "session extended");
        Ok(Acknowledgement { waiter })
    }

    /// Pings the peer of a session or, for a pairing topic, of the pairing.
    /// Resolves once the peer answered.
    pub async fn ping(&self, topic: &Topic) -> Result<()> {
        if self.sessions.contains(topic).await {
            self.valid_session(topic).await?;
            self.handler
                .send_request_and_wait(topic, SessionPingRequest {})
                .await?;
            return Ok(());
        }
        if self.pairing.get_pairing(topic).await.is_ok() {
            self.pairing.ping(topic).await?;
            return Ok(());
        }
        Err(SignError::SessionNotFound(topic.clone()))
    }

    /// Emits `event` on `chain_id` to the peer.
    pub async fn emit(&self, topic: &Topic, chain_id: &str, event: Event) -> Result<()> {
        let session = self.valid_session(topic).await?;
        validate_event(&session, chain_id, &event.name)?;

        self.handler
            .send_request_and_wait(topic, SessionEventRequest {
                event,
                chain_id: chain_id.to_owned(),
            })
            .await?;
        Ok(())
    }

    /// Ends a session, or a pairing when `topic` is a pairing topic.
    pub async fn disconnect(&self, topic: &Topic) -> Result<()> {
        if self.sessions.contains(topic).await {
            self.valid_session(topic).await?;
            self.handler
                .send_request(topic, SessionDeleteRequest::from(SdkErrorKind::UserDisconnected))
                .await?;
            self.delete_session(topic).await?;
            info!(%topic, "session disconnected");
            return Ok(());
        }
        if self.pairing.get_pairing(topic).await.is_ok() {
            self.pairing.disconnect(topic).await?;
            return Ok(());
        }
        Err(SignError::SessionNotFound(topic.clone()))
    }

    /// Sends `params` as a `T` request on `chain_id` and waits for the typed
    /// result.
    pub async fn request<T: SessionMethod>(
        &self,
        topic: &Topic,
        chain_id: &str,
        params: T,
    ) -> Result<T::Response> {
        let result = self
            .request_raw(topic, chain_id, Request {
                method: T::METHOD.to_owned(),
                params: serde_json::to_value(params)?,
                expiry_timestamp: None,
            })
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn request_raw(&self, topic: &Topic, chain_id: &str, request: Request) -> Result<Value> {
        let session = self.valid_session(topic).await?;
        validate_method(&session, chain_id, &request.method)?;
        if let Some(expiry) = request.expiry_timestamp {
            if time::is_expired(expiry) || expiry > time::expiry_from_now(SEVEN_DAYS) {
                return Err(SignError::InvalidExpiry(expiry));
            }
        }

        Ok(self
            .handler
            .send_request_and_wait(topic, SessionRequestRequest {
                request,
                chain_id: chain_id.to_owned(),
            })
            .await?)
    }

    /// Answers the pending request `id` received on `topic`.
    pub async fn respond(
        &self,
        topic: &Topic,
        id: MessageId,
        response: std::result::Result<Value, ErrorData>,
    ) -> Result<()> {
        self.valid_session(topic).await?;
        let pending = self
            .pending_requests
            .get(&id)
            .await
            .ok()
            .filter(|pending| pending.topic == *topic)
            .ok_or(SignError::RequestNotFound(id))?;
        if time::is_expired(pending.expiry) {
            self.delete_pending_request(id).await?;
            return Err(SignError::RequestExpired(id));
        }

        self.handler
            .send_response::<SessionRequestRequest>(topic, id, response, &EncodeOptions::default())
            .await?;
        self.delete_pending_request(id).await
    }

    /// Answers inbound `T` requests with `handler`. Requests of methods
    /// without a handler surface as [`SignEvent::SessionRequest`].
    ///
    /// Handlers run on the inbound message worker and must not wait for
    /// messages from the peer.
    pub fn on_session_request<T, F, Fut>(&self, handler: F)
    where
        T: SessionMethod,
        F: Fn(SessionRequestEvent<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T::Response, ErrorData>> + Send + 'static,
    {
        let erased: RequestHandler = Arc::new(move |event: SessionRequestEvent<Value>| {
            let SessionRequestEvent {
                id,
                topic,
                chain_id,
                params,
            } = event;
            match serde_json::from_value::<T>(params) {
                Ok(params) => {
                    let handling = handler(SessionRequestEvent {
                        id,
                        topic,
                        chain_id,
                        params,
                    });
                    async move {
                        handling.await.and_then(|response| {
                            serde_json::to_value(response).map_err(|err| {
                                SdkErrorKind::MissingOrInvalid.with_context(err.to_string())
                            })
                        })
                    }
                    .boxed()
                }
                Err(err) => {
                    let error = SdkErrorKind::MissingOrInvalid
                        .with_context(format!("{} params: {err}", T::METHOD));
                    async move { Err::<Value, _>(error) }.boxed()
                }
            }
        });

        self.request_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(T::METHOD.to_owned(), erased);
    }

    async fn set_session_expiry(&self, topic: &Topic, expiry: u64) -> Result<()> {
        self.sessions
            .update(topic, SessionPatch {
                expiry: Some(expiry),
                ..Default::default()
            })
            .await?;
        self.expirer.set(topic.clone(), expiry).await?;
        Ok(())
    }

    async fn acknowledge<T: RpcMethod<Response = bool>>(&self, topic: &Topic, id: MessageId) {
        if let Err(err) = self.handler.send_result::<T>(topic, id, true).await {
            warn!(?err, %topic, %id, method = T::METHOD, "failed to acknowledge request");
        }
    }

    pub(super) async fn on_session_update(&self, request: InboundRequest<SessionUpdateRequest>) {
        let InboundRequest { topic, id, params } = request;
        let updated = async {
            let session = self.valid_session(&topic).await?;
            if session.controller != session.peer.public_key {
                return Err(SignError::UnauthorizedUpdate(topic.clone()));
            }
            validate_update(&session, &params.namespaces)?;
            self.sessions
                .update(&topic, SessionPatch {
                    namespaces: Some(params.namespaces.clone()),
                    ..Default::default()
                })
                .await?;
            Result::Ok(())
        }
        .await;

        match updated {
            Ok(()) => {
                self.acknowledge::<SessionUpdateRequest>(&topic, id).await;
                self.notify(SignEvent::SessionUpdate {
                    id,
                    topic,
                    namespaces: params.namespaces,
                });
            }
            Err(err) => {
                self.reject_request::<SessionUpdateRequest>(&topic, id, &err)
                    .await
            }
        }
    }

    pub(super) async fn on_session_extend(&self, request: InboundRequest<SessionExtendRequest>) {
        let InboundRequest { topic, id, params } = request;
        let extended = async {
            let session = self.valid_session(&topic).await?;
            validate_extend_expiry(session.expiry, params.expiry)?;
            self.set_session_expiry(&topic, params.expiry).await
        }
        .await;

        match extended {
            Ok(()) => {
                self.acknowledge::<SessionExtendRequest>(&topic, id).await;
                self.notify(SignEvent::SessionExtend {
                    id,
                    topic,
                    expiry: params.expiry,
                });
            }
            Err(err) => {
                self.reject_request::<SessionExtendRequest>(&topic, id, &err)
                    .await
            }
        }
    }

    pub(super) async fn on_session_ping(&self, request: InboundRequest<SessionPingRequest>) {
        let InboundRequest { topic, id, .. } = request;
        match self.valid_session(&topic).await {
            Ok(_) => {
                self.acknowledge::<SessionPingRequest>(&topic, id).await;
                self.notify(SignEvent::SessionPing { id, topic });
            }
            Err(err) => {
                self.reject_request::<SessionPingRequest>(&topic, id, &err)
                    .await
            }
        }
    }

    pub(super) async fn on_session_delete(&self, request: InboundRequest<SessionDeleteRequest>) {
        let InboundRequest { topic, id, params } = request;
        if let Err(err) = self.valid_session(&topic).await {
            self.reject_request::<SessionDeleteRequest>(&topic, id, &err)
                .await;
            return;
        }

        debug!(%topic, code = params.code, reason = %params.message, "peer deleted session");
        self.acknowledge::<SessionDeleteRequest>(&topic, id).await;
        if let Err(err) = self.delete_session(&topic).await {
            warn!(?err, %topic, "failed to delete session");
        }
        self.notify(SignEvent::SessionDelete { id, topic });
    }

    pub(super) async fn on_session_event(&self, request: InboundRequest<SessionEventRequest>) {
        let InboundRequest { topic, id, params } = request;
        let valid = async {
            let session = self.valid_session(&topic).await?;
            validate_event(&session, &params.chain_id, &params.event.name)
        }
        .await;

        match valid {
            Ok(()) => {
                self.acknowledge::<SessionEventRequest>(&topic, id).await;
                self.notify(SignEvent::SessionEvent {
                    id,
                    topic,
                    chain_id: params.chain_id,
                    event: params.event,
                });
            }
            Err(err) => {
                self.reject_request::<SessionEventRequest>(&topic, id, &err)
                    .await
            }
        }
    }

    pub(super) async fn on_session_request_inbound(&self, request: InboundRequest<SessionRequestRequest>) {
        let InboundRequest { topic, id, params } = request;
        let stored = async {
            let session = self.valid_session(&topic).await?;
            validate_method(&session, &params.chain_id, &params.request.method)?;

            let expiry = params
                .request
                .expiry_timestamp
                .unwrap_or_else(|| time::expiry_from_now(FIVE_MINUTES));
            if time::is_expired(expiry) {
                return Err(SignError::RequestExpired(id));
            }
            self.pending_requests
                .set(PendingRequestStruct {
                    id,
                    topic: topic.clone(),
                    params: params.clone(),
                    expiry,
                })
                .await?;
            self.expirer.set(id, expiry).await?;
            Result::Ok(())
        }
        .await;
        if let Err(err) = stored {
            self.reject_request::<SessionRequestRequest>(&topic, id, &err)
                .await;
            return;
        }

        let handler = self
            .request_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&params.request.method)
            .cloned();
        let Some(handler) = handler else {
            self.notify(SignEvent::SessionRequest {
                id,
                topic,
                chain_id: params.chain_id,
                request: params.request,
            });
            return;
        };

        let response = handler(SessionRequestEvent {
            id,
            topic: topic.clone(),
            chain_id: params.chain_id,
            params: params.request.params,
        })
        .await;
        if let Err(err) = self.respond(&topic, id, response).await {
            warn!(?err, %topic, %id, "failed to answer session request");
        }
    }
}
