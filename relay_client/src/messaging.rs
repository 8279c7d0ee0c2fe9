//! Typed JSON-RPC over encrypted relay topics.
//!
//! Every Sign/Pairing method is registered once with its [`RpcMethod`] type.
//! Registration builds the request history of the method and the table of
//! callers waiting for its responses. Inbound envelopes are decrypted, routed
//! by method (requests) or by the history that knows their id (responses) and
//! handled strictly one after another.

use {
    crate::{publisher::PublishOptions, relayer::Relayer, Error, MessageIdGenerator, Result},
    async_trait::async_trait,
    core_api::{
        crypto::{Crypto, DecodeOptions, EncodeOptions},
        history::{JsonRpcHistory, JsonRpcRecord},
        storage::KeyValueStorage,
    },
    futures_util::{future::BoxFuture, FutureExt},
    relay_rpc::{
        domain::{MessageId, Topic},
        rpc::{
            params::RpcMethod,
            ErrorData,
            JsonRpcRequest,
            JsonRpcResponse,
            RawMessage,
            SubscriptionData,
        },
    },
    serde_json::Value,
    std::{
        any::Any,
        collections::HashMap,
        future::Future,
        sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
    },
    tokio::sync::{mpsc, oneshot},
    tracing::{debug, warn},
};

/// A decoded inbound request.
#[derive(Debug, Clone)]
pub struct InboundRequest<T> {
    pub topic: Topic,
    pub id: MessageId,
    pub params: T,
}

/// A decoded inbound response to a request sent through the handler.
#[derive(Debug, Clone)]
pub struct InboundResponse<T: RpcMethod> {
    pub topic: Topic,
    pub id: MessageId,
    pub result: std::result::Result<T::Response, ErrorData>,
}

type RequestCallback<T> = Arc<dyn Fn(InboundRequest<T>) -> BoxFuture<'static, ()> + Send + Sync>;
type ResponseCallback<T> =
    Arc<dyn Fn(InboundResponse<T>) -> BoxFuture<'static, ()> + Send + Sync>;
type Waiters<R> = HashMap<MessageId, oneshot::Sender<Result<R>>>;

struct Registration<T: RpcMethod> {
    history: JsonRpcHistory<T, T::Response>,
    waiters: StdMutex<Waiters<T::Response>>,
    on_request: StdMutex<Option<RequestCallback<T>>>,
    on_response: StdMutex<Option<ResponseCallback<T>>>,
}

impl<T: RpcMethod> Registration<T> {
    fn remove_waiter(&self, id: MessageId) -> Option<oneshot::Sender<Result<T::Response>>> {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    fn request_callback(&self) -> Option<RequestCallback<T>> {
        self.on_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn response_callback(&self) -> Option<ResponseCallback<T>> {
        self.on_response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Method independent view of a [`Registration`].
#[async_trait]
trait Registered: Send + Sync {
    /// Records and dispatches a request of this method. The error, if any, is
    /// the answer owed to the peer.
    async fn handle_request(
        &self,
        topic: &Topic,
        message: &RawMessage,
    ) -> std::result::Result<(), ErrorData>;

    fn response_options(&self) -> PublishOptions;

    /// Handles `message` if it answers a request of this method. Returns
    /// whether it did.
    async fn handle_response(&self, topic: &Topic, message: &RawMessage) -> bool;
}

#[async_trait]
impl<T: RpcMethod> Registered for Registration<T> {
    async fn handle_request(
        &self,
        topic: &Topic,
        message: &RawMessage,
    ) -> std::result::Result<(), ErrorData> {
        let params = message.request_params::<T>().map_err(|err| {
            warn!(?err, method = T::METHOD, id = %message.id, "malformed request params");
            ErrorData::invalid_params(err)
        })?;

        let request = JsonRpcRequest::new(message.id, T::METHOD, params.clone());
        match self
            .history
            .set(topic, request, chain_id(message.params.as_ref()))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(method = T::METHOD, id = %message.id, "request already handled");
                return Ok(());
            }
            Err(err) => {
                warn!(?err, method = T::METHOD, id = %message.id, "failed to record inbound request");
                return Err(ErrorData::internal(err));
            }
        }

        match self.request_callback() {
            Some(callback) => {
                callback(InboundRequest {
                    topic: topic.clone(),
                    id: message.id,
                    params,
                })
                .await
            }
            None => debug!(method = T::METHOD, %topic, "no request handler"),
        }
        Ok(())
    }

    fn response_options(&self) -> PublishOptions {
        PublishOptions::from(T::IRN_RESPONSE)
    }

    async fn handle_response(&self, topic: &Topic, message: &RawMessage) -> bool {
        if !self.history.exists(topic, message.id).await {
            return false;
        }

        let result = match message.response::<T::Response>() {
            Ok(result) => result,
            Err(err) => {
                warn!(?err, method = T::METHOD, id = %message.id, "malformed response");
                if let Some(waiter) = self.remove_waiter(message.id) {
                    let _ = waiter.send(Err(Error::Decode(err.to_string())));
                }
                return true;
            }
        };

        match self.history.resolve(message.id, result.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(method = T::METHOD, id = %message.id, "response already handled");
                return true;
            }
            Err(err) => warn!(?err, method = T::METHOD, "failed to resolve history"),
        }

        if let Some(waiter) = self.remove_waiter(message.id) {
            let _ = waiter.send(result.clone().map_err(Error::Rpc));
        }
        if let Some(callback) = self.response_callback() {
            callback(InboundResponse {
                topic: topic.clone(),
                id: message.id,
                result,
            })
            .await;
        }
        true
    }
}

struct Entry {
    handler: Arc<dyn Registered>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// A caller waiting for the response to one request. Dropping it stops the
/// wait and forgets the waiter.
pub struct ResponseWaiter<T: RpcMethod> {
    id: MessageId,
    receiver: oneshot::Receiver<Result<T::Response>>,
    registration: Arc<Registration<T>>,
}

impl<T: RpcMethod> std::fmt::Debug for ResponseWaiter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWaiter")
            .field("method", &T::METHOD)
            .field("id", &self.id)
            .finish()
    }
}

impl<T: RpcMethod> ResponseWaiter<T> {
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Waits for the response. A remote error surfaces as [`Error::Rpc`].
    pub async fn wait(mut self) -> Result<T::Response> {
        (&mut self.receiver).await.map_err(|_| Error::Cancelled)?
    }
}

impl<T: RpcMethod> Drop for ResponseWaiter<T> {
    fn drop(&mut self) {
        self.registration.remove_waiter(self.id);
    }
}

/// Sends and receives typed Sign/Pairing JSON-RPC messages.
pub struct MessageHandler {
    context: String,
    relayer: Arc<Relayer>,
    crypto: Arc<dyn Crypto>,
    storage: Arc<dyn KeyValueStorage>,
    ids: MessageIdGenerator,
    registrations: StdMutex<HashMap<&'static str, Entry>>,
    decode_options: StdMutex<HashMap<Topic, DecodeOptions>>,
    /// Topics answering requests published on another topic.
    response_routes: StdMutex<HashMap<Topic, Topic>>,
    messages: StdMutex<Option<mpsc::UnboundedReceiver<SubscriptionData>>>,
}

impl std::fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let methods = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect::<Vec<_>>();
        f.debug_struct("MessageHandler")
            .field("context", &self.context)
            .field("methods", &methods)
            .finish_non_exhaustive()
    }
}

impl MessageHandler {
    /// Creates a handler for the messages of `relayer`, taking its inbound
    /// message queue. Histories are persisted under `context`. Queued messages
    /// are processed once [`start`](Self::start) is called.
    pub fn new(
        context: impl Into<String>,
        relayer: Arc<Relayer>,
        crypto: Arc<dyn Crypto>,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Arc<Self> {
        let messages = relayer.take_messages();
        if messages.is_none() {
            warn!("relayer messages are already taken, inbound messages will not be handled");
        }
        Arc::new(Self {
            context: context.into(),
            relayer,
            crypto,
            storage,
            ids: MessageIdGenerator::new(),
            registrations: StdMutex::default(),
            decode_options: StdMutex::default(),
            response_routes: StdMutex::default(),
            messages: StdMutex::new(messages),
        })
    }

    /// Starts the worker draining inbound messages.
    pub fn start(self: &Arc<Self>) {
        let messages = self
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(messages) = messages {
            tokio::spawn(process_messages(Arc::downgrade(self), messages));
        }
    }

    pub fn relayer(&self) -> &Arc<Relayer> {
        &self.relayer
    }

    pub fn crypto(&self) -> &Arc<dyn Crypto> {
        &self.crypto
    }

    /// Registers `T`, restoring its history. Registering twice is a no-op.
    pub async fn register<T: RpcMethod>(&self) -> Result<()> {
        if self.registration::<T>().is_ok() {
            return Ok(());
        }

        let history = JsonRpcHistory::new(&self.context, T::METHOD, self.storage.clone());
        history.init().await?;

        let registration = Arc::new(Registration::<T> {
            history,
            waiters: StdMutex::default(),
            on_request: StdMutex::new(None),
            on_response: StdMutex::new(None),
        });
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(T::METHOD)
            .or_insert(Entry {
                handler: registration.clone(),
                typed: registration,
            });
        debug!(method = T::METHOD, "method registered");
        Ok(())
    }

    /// Sets the callback of inbound `T` requests. The request is recorded in
    /// the history before the callback runs. Callbacks run one at a time, so
    /// they must not wait for responses of the peer.
    pub fn on_request<T, F, Fut>(&self, callback: F) -> Result<()>
    where
        T: RpcMethod,
        F: Fn(InboundRequest<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let registration = self.registration::<T>()?;
        let callback: RequestCallback<T> = Arc::new(move |request| callback(request).boxed());
        *registration
            .on_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
        Ok(())
    }

    /// Sets the callback of responses to `T` requests sent by this handler.
    pub fn on_response<T, F, Fut>(&self, callback: F) -> Result<()>
    where
        T: RpcMethod,
        F: Fn(InboundResponse<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let registration = self.registration::<T>()?;
        let callback: ResponseCallback<T> = Arc::new(move |response| callback(response).boxed());
        *registration
            .on_response
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
        Ok(())
    }

    /// Decodes messages on `topic` with `options`, e.g. type 1 envelopes
    /// addressed to one of our public keys.
    pub fn set_decode_options(&self, topic: Topic, options: DecodeOptions) {
        self.decode_options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic, options);
    }

    pub fn remove_decode_options(&self, topic: &Topic) {
        self.decode_options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
    }

    /// Matches responses arriving on `response_topic` against the requests
    /// sent on `request_topic`.
    pub fn route_responses(&self, response_topic: Topic, request_topic: Topic) {
        self.response_routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(response_topic, request_topic);
    }

    pub fn remove_response_route(&self, response_topic: &Topic) {
        self.response_routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(response_topic);
    }

    /// Reserves the id of a request sent later with
    /// [`send_request_with_id`](Self::send_request_with_id).
    pub fn next_id(&self) -> MessageId {
        self.ids.next()
    }

    /// Sends a `T` request without waiting for the response.
    pub async fn send_request<T: RpcMethod>(&self, topic: &Topic, params: T) -> Result<MessageId> {
        self.send_request_with_id(topic, self.ids.next(), params)
            .await
    }

    pub async fn send_request_with_id<T: RpcMethod>(
        &self,
        topic: &Topic,
        id: MessageId,
        params: T,
    ) -> Result<MessageId> {
        let registration = self.registration::<T>()?;
        self.publish_request(&registration, id, topic, params).await
    }

    /// Sends a `T` request and returns the waiter of its response. The waiter
    /// is in place before the request leaves.
    pub async fn send_request_with_waiter<T: RpcMethod>(
        &self,
        topic: &Topic,
        params: T,
    ) -> Result<ResponseWaiter<T>> {
        let registration = self.registration::<T>()?;
        let id = self.ids.next();
        let (tx, receiver) = oneshot::channel();
        registration
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        let waiter = ResponseWaiter {
            id,
            receiver,
            registration: registration.clone(),
        };
        self.publish_request(&registration, id, topic, params).await?;
        Ok(waiter)
    }

    pub async fn send_request_and_wait<T: RpcMethod>(
        &self,
        topic: &Topic,
        params: T,
    ) -> Result<T::Response> {
        self.send_request_with_waiter(topic, params)
            .await?
            .wait()
            .await
    }

    pub async fn send_result<T: RpcMethod>(
        &self,
        topic: &Topic,
        id: MessageId,
        result: T::Response,
    ) -> Result<()> {
        self.send_response::<T>(topic, id, Ok(result), &EncodeOptions::default())
            .await
    }

    pub async fn send_error<T: RpcMethod>(
        &self,
        topic: &Topic,
        id: MessageId,
        error: ErrorData,
    ) -> Result<()> {
        self.send_response::<T>(topic, id, Err(error), &EncodeOptions::default())
            .await
    }

    /// Answers the `T` request `id` and resolves its history record.
    pub async fn send_response<T: RpcMethod>(
        &self,
        topic: &Topic,
        id: MessageId,
        response: std::result::Result<T::Response, ErrorData>,
        options: &EncodeOptions,
    ) -> Result<()> {
        let registration = self.registration::<T>()?;
        let payload = match response.clone() {
            Ok(result) => serde_json::to_string(&JsonRpcResponse::result(id, result))?,
            Err(error) => serde_json::to_string(&JsonRpcResponse::<T::Response>::error(id, error))?,
        };

        let message = self.crypto.encode(topic, &payload, options).await?;
        self.relayer
            .publish(topic, message, PublishOptions::from(T::IRN_RESPONSE))
            .await?;

        registration.history.resolve(id, response).await?;
        debug!(method = T::METHOD, %topic, %id, "response sent");
        Ok(())
    }

    /// History of `T` requests.
    pub async fn history<T: RpcMethod>(&self) -> Result<Vec<JsonRpcRecord<T, T::Response>>> {
        Ok(self.registration::<T>()?.history.records().await)
    }

    /// Forgets every `T` request recorded on `topic`.
    pub async fn delete_history<T: RpcMethod>(&self, topic: &Topic) -> Result<()> {
        self.registration::<T>()?.history.delete(topic, None).await?;
        Ok(())
    }

    async fn publish_request<T: RpcMethod>(
        &self,
        registration: &Registration<T>,
        id: MessageId,
        topic: &Topic,
        params: T,
    ) -> Result<MessageId> {
        let request = JsonRpcRequest::new(id, T::METHOD, params);
        let payload = serde_json::to_value(&request)?;
        registration
            .history
            .set(topic, request, chain_id(payload.get("params")))
            .await?;

        let message = self
            .crypto
            .encode(topic, &payload.to_string(), &EncodeOptions::default())
            .await?;
        self.relayer
            .publish(topic, message, PublishOptions::from(T::IRN_REQUEST))
            .await?;

        debug!(method = T::METHOD, %topic, %id, "request sent");
        Ok(id)
    }

    /// Answers request `id` with `error` without touching any history.
    async fn publish_error(
        &self,
        topic: &Topic,
        id: MessageId,
        error: ErrorData,
        options: PublishOptions,
    ) -> Result<()> {
        let payload = serde_json::to_string(&JsonRpcResponse::<Value>::error(id, error))?;
        let message = self
            .crypto
            .encode(topic, &payload, &EncodeOptions::default())
            .await?;
        self.relayer.publish(topic, message, options).await
    }

    fn registration<T: RpcMethod>(&self) -> Result<Arc<Registration<T>>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(T::METHOD)
            .and_then(|entry| entry.typed.clone().downcast::<Registration<T>>().ok())
            .ok_or(Error::NotRegistered(T::METHOD))
    }

    fn handlers(&self) -> Vec<Arc<dyn Registered>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.handler.clone())
            .collect()
    }

    async fn on_message(&self, data: SubscriptionData) {
        let options = self
            .decode_options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&data.topic)
            .cloned()
            .unwrap_or_default();

        let payload = match self.crypto.decode(&data.topic, &data.message, &options).await {
            Ok(payload) => payload,
            Err(err) => {
                debug!(?err, topic = %data.topic, "ignoring undecodable message");
                return;
            }
        };
        let message: RawMessage = match serde_json::from_str(&payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(?err, topic = %data.topic, "ignoring non JSON-RPC message");
                return;
            }
        };

        if let Some(method) = message.method.as_deref() {
            let handler = self
                .registrations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(method)
                .map(|entry| entry.handler.clone());
            let (error, options) = match handler {
                Some(handler) => match handler.handle_request(&data.topic, &message).await {
                    Ok(()) => return,
                    Err(error) => (error, handler.response_options()),
                },
                None => {
                    warn!(method, topic = %data.topic, "unsupported method");
                    (ErrorData::method_not_found(method), PublishOptions::default())
                }
            };
            if let Err(err) = self
                .publish_error(&data.topic, message.id, error, options)
                .await
            {
                warn!(?err, id = %message.id, topic = %data.topic, "failed to reject request");
            }
            return;
        }

        let request_topic = self
            .response_routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&data.topic)
            .cloned()
            .unwrap_or_else(|| data.topic.clone());
        for handler in self.handlers() {
            if handler.handle_response(&request_topic, &message).await {
                return;
            }
        }
        debug!(id = %message.id, topic = %data.topic, "unclaimed response");
    }
}

/// `chainId` of request params, recorded with the request.
fn chain_id(params: Option<&Value>) -> Option<String> {
    params?
        .get("chainId")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

async fn process_messages(
    handler: Weak<MessageHandler>,
    mut messages: mpsc::UnboundedReceiver<SubscriptionData>,
) {
    while let Some(data) = messages.recv().await {
        let Some(handler) = handler.upgrade() else {
            break;
        };
        handler.on_message(data).await;
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            memory::MemoryRelay,
            relayer::RelayerOptions,
            subscriber::SubscribeOptions,
            testing::FlakyStorage,
        },
        anyhow::Result,
        core_api::{
            crypto::{generate_random_bytes32, KeyChainCrypto},
            heartbeat::HeartBeat,
            storage::MemoryStorage,
        },
        relay_rpc::rpc::params::{
            session_delete::SessionDeleteRequest,
            session_ping::SessionPingRequest,
            session_request::{Request as SessionRequestPayload, SessionRequestRequest},
            SdkErrorKind,
        },
        std::{
            sync::atomic::{AtomicUsize, Ordering},
            time::Duration,
        },
    };

    struct Peer {
        handler: Arc<MessageHandler>,
        _heartbeat: HeartBeat,
    }

    async fn peer(relay: &MemoryRelay, topic: &Topic, sym_key: &str) -> Result<Peer> {
        peer_with_storage(relay, topic, sym_key, Arc::new(MemoryStorage::new())).await
    }

    async fn peer_with_storage(
        relay: &MemoryRelay,
        topic: &Topic,
        sym_key: &str,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Result<Peer> {
        let crypto: Arc<dyn Crypto> = Arc::new(KeyChainCrypto::new(storage.clone()));
        let heartbeat = HeartBeat::new(Duration::from_millis(100));
        let relayer = Relayer::new(
            RelayerOptions::new("project"),
            crypto.clone(),
            Arc::new(relay.transport().await),
            storage.clone(),
        );

        let handler = MessageHandler::new("test", relayer.clone(), crypto.clone(), storage);
        handler.register::<SessionPingRequest>().await?;
        handler.register::<SessionRequestRequest>().await?;
        handler.start();

        relayer.init(heartbeat.subscribe()).await?;
        crypto.set_sym_key(sym_key, None).await?;
        relayer.subscribe(topic, SubscribeOptions::default()).await?;
        Ok(Peer {
            handler,
            _heartbeat: heartbeat,
        })
    }

    /// Answers every ping on `peer` and returns the number of pings seen.
    fn answer_pings(peer: &Peer) -> Result<Arc<AtomicUsize>> {
        let pings = Arc::new(AtomicUsize::new(0));
        let counter = pings.clone();
        let responder = Arc::downgrade(&peer.handler);
        peer.handler.on_request::<SessionPingRequest, _, _>(move |request| {
            counter.fetch_add(1, Ordering::SeqCst);
            let responder = responder.clone();
            async move {
                if let Some(responder) = responder.upgrade() {
                    let _ = responder
                        .send_result::<SessionPingRequest>(&request.topic, request.id, true)
                        .await;
                }
            }
        })?;
        Ok(pings)
    }

    async fn pair(relay: &MemoryRelay) -> Result<(Topic, Peer, Peer)> {
        let sym_key = generate_random_bytes32();
        let topic = Topic::from_key(&hex::decode(&sym_key)?);
        let alice = peer(relay, &topic, &sym_key).await?;
        let bob = peer(relay, &topic, &sym_key).await?;
        Ok((topic, alice, bob))
    }

    #[tokio::test]
    async fn request_is_answered() -> Result<()> {
        let relay = MemoryRelay::new();
        let (topic, alice, bob) = pair(&relay).await?;

        let responder = Arc::downgrade(&bob.handler);
        bob.handler.on_request::<SessionPingRequest, _, _>(move |request| {
            let responder = responder.clone();
            async move {
                if let Some(responder) = responder.upgrade() {
                    let _ = responder
                        .send_result::<SessionPingRequest>(&request.topic, request.id, true)
                        .await;
                }
            }
        })?;

        let response = tokio::time::timeout(
            Duration::from_secs(5),
            alice
                .handler
                .send_request_and_wait(&topic, SessionPingRequest {}),
        )
        .await??;
        assert!(response);

        let records = alice.handler.history::<SessionPingRequest>().await?;
        assert_eq!(records.len(), 1);
        assert!(records.iter().all(|record| !record.is_pending()));

        let published = relay.published(&topic).await;
        assert_eq!(
            published.iter().map(|data| data.tag).collect::<Vec<_>>(),
            vec![1114, 1115]
        );
        Ok(())
    }

    #[tokio::test]
    async fn remote_error_is_returned() -> Result<()> {
        let relay = MemoryRelay::new();
        let (topic, alice, bob) = pair(&relay).await?;

        let responder = Arc::downgrade(&bob.handler);
        bob.handler.on_request::<SessionRequestRequest, _, _>(move |request| {
            let responder = responder.clone();
            async move {
                assert_eq!(request.params.chain_id, "eip155:1");
                if let Some(responder) = responder.upgrade() {
                    let _ = responder
                        .send_error::<SessionRequestRequest>(
                            &request.topic,
                            request.id,
                            SdkErrorKind::UserRejected.error_data(),
                        )
                        .await;
                }
            }
        })?;

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            alice.handler.send_request_and_wait(&topic, SessionRequestRequest {
                request: SessionRequestPayload {
                    method: "personal_sign".to_owned(),
                    params: serde_json::json!(["0xdeadbeef"]),
                    expiry_timestamp: None,
                },
                chain_id: "eip155:1".to_owned(),
            }),
        )
        .await?;
        assert!(matches!(result, Err(Error::Rpc(error)) if error.code == 5000));

        let records = bob.handler.history::<SessionRequestRequest>().await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records.first().and_then(|r| r.chain_id.as_deref()), Some("eip155:1"));
        Ok(())
    }

    #[tokio::test]
    async fn dropped_waiter_is_forgotten() -> Result<()> {
        let relay = MemoryRelay::new();
        let (topic, alice, _bob) = pair(&relay).await?;

        let waiter = alice
            .handler
            .send_request_with_waiter(&topic, SessionPingRequest {})
            .await?;
        let registration = alice.handler.registration::<SessionPingRequest>()?;
        assert_eq!(registration.waiters.lock().map(|w| w.len()).unwrap_or_default(), 1);

        drop(waiter);
        assert_eq!(registration.waiters.lock().map(|w| w.len()).unwrap_or_default(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unregistered_method_is_rejected() -> Result<()> {
        let relay = MemoryRelay::new();
        let (topic, alice, _bob) = pair(&relay).await?;

        let result = alice
            .handler
            .send_request(&topic, relay_rpc::rpc::params::session_delete::SessionDeleteRequest {
                code: 6000,
                message: "User disconnected.".to_owned(),
            })
            .await;
        assert!(matches!(result, Err(Error::NotRegistered("wc_sessionDelete"))));
        Ok(())
    }

    #[tokio::test]
    async fn repeated_request_id_is_handled_once() -> Result<()> {
        let relay = MemoryRelay::new();
        let (topic, alice, bob) = pair(&relay).await?;
        let pings = answer_pings(&bob)?;

        let id = alice.handler.next_id();
        alice
            .handler
            .send_request_with_id(&topic, id, SessionPingRequest {})
            .await?;
        alice
            .handler
            .send_request_with_id(&topic, id, SessionPingRequest {})
            .await?;
        // Requests are handled in order: once this one is answered, the
        // earlier ones have been seen.
        tokio::time::timeout(
            Duration::from_secs(5),
            alice
                .handler
                .send_request_and_wait(&topic, SessionPingRequest {}),
        )
        .await??;

        assert_eq!(pings.load(Ordering::SeqCst), 2);
        assert_eq!(bob.handler.history::<SessionPingRequest>().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn unrecorded_request_is_rejected() -> Result<()> {
        let relay = MemoryRelay::new();
        let sym_key = generate_random_bytes32();
        let topic = Topic::from_key(&hex::decode(&sym_key)?);
        let alice = peer(&relay, &topic, &sym_key).await?;
        let storage = Arc::new(FlakyStorage::default());
        let bob = peer_with_storage(&relay, &topic, &sym_key, storage.clone()).await?;
        let pings = answer_pings(&bob)?;

        storage.fail_writes_to(Some("history-wc_sessionPing"));
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            alice
                .handler
                .send_request_and_wait(&topic, SessionPingRequest {}),
        )
        .await?;
        assert!(
            matches!(result, Err(Error::Rpc(error)) if error.code == ErrorData::INTERNAL_ERROR)
        );
        assert_eq!(pings.load(Ordering::SeqCst), 0);
        assert!(bob.handler.history::<SessionPingRequest>().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_method_is_answered_with_an_error() -> Result<()> {
        let relay = MemoryRelay::new();
        let (topic, alice, _bob) = pair(&relay).await?;
        alice.handler.register::<SessionDeleteRequest>().await?;

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            alice.handler.send_request_and_wait(&topic, SessionDeleteRequest {
                code: 6000,
                message: "User disconnected.".to_owned(),
            }),
        )
        .await?;
        assert!(
            matches!(result, Err(Error::Rpc(error)) if error.code == ErrorData::METHOD_NOT_FOUND)
        );

        let records = alice.handler.history::<SessionDeleteRequest>().await?;
        assert!(records.iter().all(|record| !record.is_pending()));
        Ok(())
    }
}
