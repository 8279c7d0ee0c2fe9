//! Relay client: keeps one connection to the relay alive, manages topic
//! subscriptions across reconnects, publishes messages and routes inbound
//! JSON-RPC traffic to typed handlers.

use {
    crate::error::RequestBuildError,
    ::http::{HeaderMap, Uri},
    relay_rpc::{
        auth::{SerializedAuthToken, RELAY_WEBSOCKET_ADDRESS},
        domain::{MessageId, ProjectId},
    },
    std::sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    url::Url,
};

pub mod connection;
pub mod error;
pub mod memory;
pub mod message_tracker;
pub mod messaging;
pub mod publisher;
pub mod relayer;
pub mod subscriber;
#[cfg(test)]
mod testing;
pub mod topic_map;
pub mod transport;
pub mod websocket;

pub use error::{Error, Result};

pub type HttpRequest<T> = ::http::Request<T>;

/// Relay authorization method. A wrapper around [`SerializedAuthToken`].
#[derive(Debug, Clone)]
pub enum Authorization {
    /// Uses query string to pass the auth token, e.g. `?auth=<token>`.
    Query(SerializedAuthToken),

    /// Uses the `Authorization: Bearer <token>` HTTP header.
    Header(SerializedAuthToken),
}

impl Authorization {
    pub fn token(&self) -> &SerializedAuthToken {
        match self {
            Self::Query(token) | Self::Header(token) => token,
        }
    }
}

/// Relay connection options.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// The Relay websocket address. The default address is
    /// `wss://relay.walletconnect.com`.
    pub address: String,

    /// The project-specific secret key. Can be generated in the Cloud Dashboard
    /// at the following URL: <https://cloud.walletconnect.com/app>
    pub project_id: ProjectId,

    /// The authorization method and auth token to use.
    pub auth: Authorization,

    /// Optional origin of the request. Subject to allow-list validation.
    pub origin: Option<String>,
}

impl ConnectionOptions {
    pub fn new(project_id: impl Into<ProjectId>, auth: SerializedAuthToken) -> Self {
        Self {
            address: RELAY_WEBSOCKET_ADDRESS.into(),
            project_id: project_id.into(),
            auth: Authorization::Query(auth),
            origin: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_origin(mut self, origin: impl Into<Option<String>>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_auth(mut self, auth: Authorization) -> Self {
        self.auth = auth;
        self
    }

    /// Relay URL carrying the project id and, for query authorization, the
    /// auth token.
    pub fn as_url(&self) -> std::result::Result<Url, RequestBuildError> {
        let mut url =
            Url::parse(&self.address).map_err(|err| RequestBuildError::Url(err.to_string()))?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("projectId", self.project_id.as_str());
            if let Authorization::Query(auth) = &self.auth {
                query.append_pair("auth", auth.as_str());
            }
        }

        Ok(url)
    }

    pub fn as_ws_request(&self) -> std::result::Result<HttpRequest<()>, RequestBuildError> {
        let url = self.as_url()?;
        let mut request = into_client_request(url.as_str())?;
        self.update_request_headers(request.headers_mut())?;

        Ok(request)
    }

    fn update_request_headers(
        &self,
        headers: &mut HeaderMap,
    ) -> std::result::Result<(), RequestBuildError> {
        if let Authorization::Header(token) = &self.auth {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| RequestBuildError::Headers)?;

            headers.append("Authorization", value);
        }

        if let Some(origin) = &self.origin {
            let value = origin.parse().map_err(|_| RequestBuildError::Headers)?;

            headers.append("Origin", value);
        }

        Ok(())
    }
}

/// Generates unique message IDs for use in RPC requests. Uses 56 bits for the
/// timestamp with millisecond precision, with the last 8 bits from a monotonic
/// counter. Capable of producing up to `256000` unique values per second.
#[derive(Debug, Clone)]
pub struct MessageIdGenerator {
    next: Arc<AtomicU8>,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a [`MessageId`].
    pub fn next(&self) -> MessageId {
        let next = self.next.fetch_add(1, Ordering::Relaxed) as u64;
        let timestamp = chrono::Utc::now().timestamp_millis() as u64;
        let id = timestamp << 8 | next;

        MessageId::new(id)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self {
            next: Arc::new(AtomicU8::new(0)),
        }
    }
}

/// Generate a random key for the `Sec-WebSocket-Key` header.
pub fn generate_websocket_key() -> String {
    // a base64-encoded (see Section 4 of [RFC4648]) value that,
    // when decoded, is 16 bytes in length (RFC 6455)
    let r: [u8; 16] = rand::random();
    data_encoding::BASE64.encode(&r)
}

/// Converts a URL string into an HTTP request for initiating a WebSocket
/// connection.
fn into_client_request(url: &str) -> std::result::Result<HttpRequest<()>, RequestBuildError> {
    let uri: Uri = url
        .parse()
        .map_err(|_| RequestBuildError::Url("Invalid url".to_owned()))?;
    let authority = uri
        .authority()
        .ok_or(RequestBuildError::Url("Url has no authority".to_owned()))?
        .as_str();
    let host = authority
        .rsplit_once('@')
        .map(|(_, host)| host)
        .unwrap_or(authority);

    // Check if the host is empty (excluding the port)
    if host.split(':').next().unwrap_or("").is_empty() {
        return Err(RequestBuildError::Url("EmptyHostName".to_owned()));
    }

    HttpRequest::builder()
        .method("GET")
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_websocket_key())
        .uri(uri)
        .body(())
        .map_err(|err| RequestBuildError::Url(err.to_string()))
}
