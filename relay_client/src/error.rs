use relay_rpc::rpc::ErrorData;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors generated while building the connection request.
#[derive(Debug, thiserror::Error)]
pub enum RequestBuildError {
    #[error("Invalid URL: {0}")]
    Url(String),

    #[error("Failed to add request headers")]
    Headers,
}

/// Errors raised by the relay client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to build connection request: {0}")]
    RequestBuilder(#[from] RequestBuildError),

    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport was explicitly closed")]
    TransportClosed,

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    #[error("Relay rejected the request: {0}")]
    Rpc(ErrorData),

    #[error("Invalid relay response: {0}")]
    InvalidResponse(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Method is not registered: {0}")]
    NotRegistered(&'static str),

    #[error("Response waiter was dropped before a response arrived")]
    Cancelled,

    #[error("Serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] core_api::Error),
}

impl Error {
    /// Failures of the socket itself, which a transport restart may fix.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::ConnectionClosed | Self::Timeout(_)
        )
    }
}
