use {
    crate::{ConnectionOptions, Result},
    async_trait::async_trait,
    std::fmt::Debug,
    tokio::sync::mpsc,
};

/// Something that happened on an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Text frame received from the relay.
    Message(String),
    /// Non-fatal socket error.
    Error(String),
    /// The socket is gone. Always the last event of a connection.
    Closed(Option<String>),
}

/// An open socket. Dropping `outbound` closes it.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens sockets to the relay.
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Connection>;
}
