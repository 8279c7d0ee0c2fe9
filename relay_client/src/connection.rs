//! Relay connection: owns the socket, correlates relay JSON-RPC responses and
//! restarts the transport when the socket drops.

use {
    crate::{
        relayer::RelayerEvent,
        transport::{Transport, TransportEvent},
        ConnectionOptions,
        Error,
        MessageIdGenerator,
        Result,
    },
    core_api::crypto::Crypto,
    relay_rpc::{
        domain::{MessageId, ProjectId},
        rpc::{Params, Payload, Request, Response, SuccessfulResponse},
    },
    serde_json::Value,
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
            Mutex as StdMutex,
            PoisonError,
            Weak,
        },
        time::Duration,
    },
    tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex},
    tracing::{debug, info, warn},
};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for a request to wait until the socket is open.
const CONNECTED_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Settings of the relay connection.
#[derive(Debug, Clone)]
pub struct RelayerOptions {
    pub project_id: ProjectId,
    pub relay_address: String,
    pub origin: Option<String>,
    /// Bound on opening the socket. Unbounded when `None`.
    pub connection_timeout: Option<Duration>,
    /// Delay before reopening a socket that closed on its own.
    pub reconnect_delay: Duration,
}

impl RelayerOptions {
    pub fn new(project_id: impl Into<ProjectId>) -> Self {
        Self {
            project_id: project_id.into(),
            relay_address: relay_rpc::auth::RELAY_WEBSOCKET_ADDRESS.to_owned(),
            origin: None,
            connection_timeout: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_relay_address(mut self, address: impl Into<String>) -> Self {
        self.relay_address = address.into();
        self
    }

    pub fn with_origin(mut self, origin: impl Into<Option<String>>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_connection_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.connection_timeout = timeout.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

type PendingRequests = HashMap<MessageId, oneshot::Sender<Response>>;

#[derive(Debug)]
struct Socket {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
}

/// Connection to the relay shared by the subscriber, the publisher and the
/// relayer.
#[derive(Debug)]
pub struct RelayConnection {
    options: RelayerOptions,
    crypto: Arc<dyn Crypto>,
    transport: Arc<dyn Transport>,
    ids: MessageIdGenerator,
    socket: StdMutex<Option<Socket>>,
    pending: Arc<StdMutex<PendingRequests>>,
    generation: AtomicU64,
    explicitly_closed: AtomicBool,
    connect_lock: Mutex<()>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<RelayerEvent>,
    inbound: mpsc::UnboundedSender<Request>,
}

impl RelayConnection {
    pub(crate) fn new(
        options: RelayerOptions,
        crypto: Arc<dyn Crypto>,
        transport: Arc<dyn Transport>,
        events: broadcast::Sender<RelayerEvent>,
        inbound: mpsc::UnboundedSender<Request>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            options,
            crypto,
            transport,
            ids: MessageIdGenerator::new(),
            socket: StdMutex::new(None),
            pending: Arc::default(),
            generation: AtomicU64::new(0),
            explicitly_closed: AtomicBool::new(false),
            connect_lock: Mutex::new(()),
            status,
            events,
            inbound,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_explicitly_closed(&self) -> bool {
        self.explicitly_closed.load(Ordering::SeqCst)
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Opens the socket unless it is already open, and clears an explicit
    /// close.
    pub async fn transport_open(self: &Arc<Self>) -> Result<()> {
        self.explicitly_closed.store(false, Ordering::SeqCst);
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.open_socket().await
    }

    /// Closes the socket and keeps it closed until the next
    /// [`transport_open`](Self::transport_open).
    pub async fn transport_close(&self) {
        self.explicitly_closed.store(true, Ordering::SeqCst);
        let _guard = self.connect_lock.lock().await;
        self.close_socket();
        let _ = self.events.send(RelayerEvent::TransportClosed);
    }

    /// Replaces the socket with a new one. Concurrent restarts collapse into
    /// one; nothing happens after an explicit close.
    pub async fn restart_transport(self: &Arc<Self>) -> Result<()> {
        if self.is_explicitly_closed() {
            return Ok(());
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let _guard = self.connect_lock.lock().await;
        if self.is_explicitly_closed()
            || (self.generation.load(Ordering::SeqCst) != generation && self.is_connected())
        {
            return Ok(());
        }

        info!("restarting transport");
        self.close_socket();
        self.open_socket().await
    }

    /// Sends a relay request and returns its result. A transport failure
    /// restarts the transport and retries once.
    pub async fn request(self: &Arc<Self>, params: Params) -> Result<Value> {
        let request = Request::new(self.ids.next(), params);
        match self.try_request(&request).await {
            Err(err) if err.is_transport() => {
                warn!(?err, id = %request.id, "request failed, restarting transport");
                self.restart_transport().await?;
                self.try_request(&request).await
            }
            result => result,
        }
    }

    /// Acknowledges an inbound relay request.
    pub(crate) fn respond(&self, id: MessageId, result: Value) -> Result<()> {
        let response = Response::Success(SuccessfulResponse::new(id, result));
        self.send(serde_json::to_string(&response)?)
    }

    async fn try_request(self: &Arc<Self>, request: &Request) -> Result<Value> {
        self.ensure_connected().await?;

        let (tx, rx) = oneshot::channel();
        let guard = PendingGuard {
            pending: self.pending.clone(),
            id: request.id,
        };
        guard.insert(tx);

        self.send(serde_json::to_string(&Payload::Request(request.clone()))?)?;
        let response = rx.await.map_err(|_| Error::ConnectionClosed)?;
        drop(guard);

        match response {
            Response::Success(response) => Ok(response.result),
            Response::Error(response) => Err(Error::Rpc(response.error)),
        }
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        if self.status() == ConnectionStatus::Disconnected {
            return self.transport_open().await;
        }

        // Another caller is connecting: its outcome is ours.
        let mut status = self.watch_status();
        let settled = tokio::time::timeout(
            CONNECTED_WAIT,
            status.wait_for(|status| *status != ConnectionStatus::Connecting),
        )
        .await
        .map_err(|_| Error::Timeout("waiting for connection"))?
        .map_err(|_| Error::ConnectionClosed)?;

        match *settled {
            ConnectionStatus::Connected => Ok(()),
            _ => Err(Error::ConnectionClosed),
        }
    }

    fn send(&self, text: String) -> Result<()> {
        let socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        let socket = socket.as_ref().ok_or(Error::ConnectionClosed)?;
        socket
            .outbound
            .send(text)
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn open_socket(self: &Arc<Self>) -> Result<()> {
        self.status.send_replace(ConnectionStatus::Connecting);

        let result = async {
            let auth = self.crypto.sign_jwt(&self.options.relay_address).await?;
            let options = ConnectionOptions::new(self.options.project_id.clone(), auth)
                .with_address(self.options.relay_address.clone())
                .with_origin(self.options.origin.clone());

            match self.options.connection_timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.transport.connect(&options))
                    .await
                    .map_err(|_| Error::Timeout("opening connection"))?,
                None => self.transport.connect(&options).await,
            }
        }
        .await;

        let connection = match result {
            Ok(connection) => connection,
            Err(err) => {
                self.status.send_replace(ConnectionStatus::Disconnected);
                let _ = self.events.send(RelayerEvent::Error(err.to_string()));
                return Err(err);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.socket.lock().unwrap_or_else(PoisonError::into_inner) = Some(Socket {
            generation,
            outbound: connection.outbound,
        });
        tokio::spawn(read_socket(Arc::downgrade(self), generation, connection.inbound));

        self.status.send_replace(ConnectionStatus::Connected);
        info!(generation, "relay connected");
        let _ = self.events.send(RelayerEvent::Connect);
        Ok(())
    }

    fn close_socket(&self) {
        let closed = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if closed.is_some() {
            self.fail_pending();
            self.status.send_replace(ConnectionStatus::Disconnected);
            let _ = self.events.send(RelayerEvent::Disconnect);
        }
    }

    fn fail_pending(&self) {
        // Dropping the senders wakes every waiting request with a closed
        // connection error.
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn complete(&self, response: Response) {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&response.id());
        match sender {
            Some(sender) => {
                let _ = sender.send(response);
            }
            None => debug!(id = %response.id(), "response to unknown request"),
        }
    }

    /// Handles the end of the socket of `generation`. Sockets replaced in the
    /// meantime are ignored.
    fn on_socket_closed(self: &Arc<Self>, generation: u64, reason: Option<String>) {
        {
            let mut socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
            if socket.as_ref().map(|s| s.generation) != Some(generation) {
                return;
            }
            socket.take();
        }

        self.fail_pending();
        self.status.send_replace(ConnectionStatus::Disconnected);
        warn!(?reason, "relay connection closed");
        let _ = self.events.send(RelayerEvent::Disconnect);

        if self.is_explicitly_closed() {
            return;
        }

        let connection = Arc::downgrade(self);
        let delay = self.options.reconnect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(connection) = connection.upgrade() else {
                return;
            };
            if let Err(err) = connection.restart_transport().await {
                warn!(?err, "failed to reconnect");
            }
        });
    }
}

struct PendingGuard {
    pending: Arc<StdMutex<PendingRequests>>,
    id: MessageId,
}

impl PendingGuard {
    fn insert(&self, sender: oneshot::Sender<Response>) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.id, sender);
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

async fn read_socket(
    connection: Weak<RelayConnection>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let reason = loop {
        let Some(event) = inbound.recv().await else {
            break None;
        };
        let Some(connection) = connection.upgrade() else {
            return;
        };

        match event {
            TransportEvent::Message(text) => match serde_json::from_str::<Payload>(&text) {
                Ok(Payload::Response(response)) => connection.complete(response),
                Ok(Payload::Request(request)) => {
                    if connection.inbound.send(request).is_err() {
                        debug!("inbound request dropped, relayer is gone");
                    }
                }
                Err(err) => debug!(?err, "ignoring malformed relay payload"),
            },
            TransportEvent::Error(err) => {
                warn!(%err, "transport error");
                let _ = connection.events.send(RelayerEvent::Error(err));
            }
            TransportEvent::Closed(reason) => break reason,
        }
    };

    if let Some(connection) = connection.upgrade() {
        connection.on_socket_closed(generation, reason);
    }
}
