//! Sign and Pairing API request parameters carried inside encrypted
//! envelopes.
//!
//! https://specs.walletconnect.com/2.0/specs/clients/sign/rpc-methods
//! https://specs.walletconnect.com/2.0/specs/clients/core/pairing/rpc-methods

use {
    super::ErrorData,
    paste::paste,
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    serde_json::Value,
};

pub mod namespaces;
pub mod pairing_delete;
pub mod pairing_extend;
pub mod pairing_ping;
pub mod session_authenticate;
pub mod session_delete;
pub mod session_event;
pub mod session_extend;
pub mod session_ping;
pub mod session_propose;
pub mod session_request;
pub mod session_settle;
pub mod session_update;

pub const RELAY_PROTOCOL: &str = "irn";

/// Metadata describing a peer application.
#[derive(Debug, Serialize, PartialEq, Eq, Hash, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    pub description: String,
    pub url: String,
    pub icons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<Redirect>,
}

#[derive(Debug, Serialize, PartialEq, Eq, Hash, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Redirect {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub universal: Option<String>,
}

/// Information about the relay used for communication.
#[derive(Debug, Serialize, PartialEq, Eq, Hash, Deserialize, Clone)]
pub struct Relay {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub data: Option<String>,
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            protocol: RELAY_PROTOCOL.to_owned(),
            data: None,
        }
    }
}

/// A session participant: its key agreement public key (hex) and metadata.
#[derive(Debug, Serialize, PartialEq, Eq, Hash, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub public_key: String,
    pub metadata: Metadata,
}

/// Relay IRN protocol metadata.
///
/// https://specs.walletconnect.com/2.0/specs/servers/relay/relay-server-rpc
/// #definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrnMetadata {
    pub tag: u32,
    pub ttl: u64,
    pub prompt: bool,
}

/// A Sign/Pairing API method: the request params type, its wire name, its
/// response type and the IRN metadata for publishing both directions.
pub trait RpcMethod: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Response: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    const METHOD: &'static str;
    const IRN_REQUEST: IrnMetadata;
    const IRN_RESPONSE: IrnMetadata;
}

// Every method module declares `<Module>Request` plus the request/response
// IRN metadata constants.
macro_rules! impl_rpc_method {
    ($module:ident, $method:literal, $response:ty) => {
        paste! {
            impl RpcMethod for $module::[<$module:camel Request>] {
                type Response = $response;

                const METHOD: &'static str = $method;
                const IRN_REQUEST: IrnMetadata = $module::IRN_REQUEST_METADATA;
                const IRN_RESPONSE: IrnMetadata = $module::IRN_RESPONSE_METADATA;
            }
        }
    };
}

impl_rpc_method!(pairing_delete, "wc_pairingDelete", bool);
impl_rpc_method!(pairing_extend, "wc_pairingExtend", bool);
impl_rpc_method!(pairing_ping, "wc_pairingPing", bool);
impl_rpc_method!(
    session_propose,
    "wc_sessionPropose",
    session_propose::SessionProposeResponse
);
impl_rpc_method!(session_settle, "wc_sessionSettle", bool);
impl_rpc_method!(session_update, "wc_sessionUpdate", bool);
impl_rpc_method!(session_extend, "wc_sessionExtend", bool);
impl_rpc_method!(session_request, "wc_sessionRequest", Value);
impl_rpc_method!(session_event, "wc_sessionEvent", bool);
impl_rpc_method!(session_delete, "wc_sessionDelete", bool);
impl_rpc_method!(session_ping, "wc_sessionPing", bool);
impl_rpc_method!(
    session_authenticate,
    "wc_sessionAuthenticate",
    session_authenticate::SessionAuthenticateResponse
);

/// Errors covering API payload parameter conversion issues.
#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("Failure serializing/deserializing Sign API parameters: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Response tag={0} does not match any of the Sign API methods")]
    ResponseTag(u32),
    #[error("Request tag={0} does not match any of the Sign API methods")]
    RequestTag(u32),
}

const METHOD_TAGS: [(&str, u32, u32); 12] = [
    ("wc_pairingDelete", 1000, 1001),
    ("wc_pairingPing", 1002, 1003),
    ("wc_pairingExtend", 1004, 1005),
    ("wc_sessionPropose", 1100, 1101),
    ("wc_sessionSettle", 1102, 1103),
    ("wc_sessionUpdate", 1104, 1105),
    ("wc_sessionExtend", 1106, 1107),
    ("wc_sessionRequest", 1108, 1109),
    ("wc_sessionEvent", 1110, 1111),
    ("wc_sessionDelete", 1112, 1113),
    ("wc_sessionPing", 1114, 1115),
    ("wc_sessionAuthenticate", 1116, 1117),
];

/// Resolves the method a published request tag belongs to.
pub fn method_from_request_tag(tag: u32) -> Result<&'static str, ParamsError> {
    METHOD_TAGS
        .iter()
        .find(|(_, request, _)| *request == tag)
        .map(|(method, ..)| *method)
        .ok_or(ParamsError::RequestTag(tag))
}

/// Resolves the method a published response tag answers.
///
/// Success and error responses do not name their method, the tag is the
/// only way to tell them apart on the wire.
pub fn method_from_response_tag(tag: u32) -> Result<&'static str, ParamsError> {
    METHOD_TAGS
        .iter()
        .find(|(_, _, response)| *response == tag)
        .map(|(method, ..)| *method)
        .ok_or(ParamsError::ResponseTag(tag))
}

/// SDK error kinds exchanged as JSON-RPC error responses.
///
/// https://specs.walletconnect.com/2.0/specs/clients/sign/error-codes
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SdkErrorKind {
    // Internal
    NotInitialized,
    NoMatchingKey,
    RestoreWillOverride,
    ResubscribeFailed,
    MissingOrInvalid,
    Expired,
    UnknownType,
    MismatchedTopic,
    NonConformingNamespaces,

    // Invalid
    InvalidMethod,
    InvalidEvent,
    InvalidUpdateRequest,
    InvalidExtendRequest,
    InvalidSessionSettleRequest,

    // Unauthorized
    UnauthorizedMethod,
    UnauthorizedEvent,
    UnauthorizedUpdateRequest,
    UnauthorizedExtendRequest,

    // Rejected
    UserRejected,
    UserRejectedChains,
    UserRejectedMethods,
    UserRejectedEvents,

    // Unsupported
    UnsupportedChains,
    UnsupportedMethods,
    UnsupportedEvents,
    UnsupportedAccounts,
    UnsupportedNamespaceKey,

    // Reason
    UserDisconnected,

    // Failure
    SessionSettlementFailed,
    SessionRequestExpired,

    // Generic
    WcMethodUnsupported,
}

impl SdkErrorKind {
    pub fn code(&self) -> i32 {
        match self {
            Self::NotInitialized => 1,
            Self::NoMatchingKey => 2,
            Self::RestoreWillOverride => 3,
            Self::ResubscribeFailed => 4,
            Self::MissingOrInvalid => 5,
            Self::Expired => 6,
            Self::UnknownType => 7,
            Self::MismatchedTopic => 8,
            Self::NonConformingNamespaces => 9,
            Self::InvalidMethod => 1001,
            Self::InvalidEvent => 1002,
            Self::InvalidUpdateRequest => 1003,
            Self::InvalidExtendRequest => 1004,
            Self::InvalidSessionSettleRequest => 1005,
            Self::UnauthorizedMethod => 3001,
            Self::UnauthorizedEvent => 3002,
            Self::UnauthorizedUpdateRequest => 3003,
            Self::UnauthorizedExtendRequest => 3004,
            Self::UserRejected => 5000,
            Self::UserRejectedChains => 5001,
            Self::UserRejectedMethods => 5002,
            Self::UserRejectedEvents => 5003,
            Self::UnsupportedChains => 5100,
            Self::UnsupportedMethods => 5101,
            Self::UnsupportedEvents => 5102,
            Self::UnsupportedAccounts => 5103,
            Self::UnsupportedNamespaceKey => 5104,
            Self::UserDisconnected => 6000,
            Self::SessionSettlementFailed => 7000,
            Self::SessionRequestExpired => 8000,
            Self::WcMethodUnsupported => 10001,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::NotInitialized => "Not initialized.",
            Self::NoMatchingKey => "No matching key.",
            Self::RestoreWillOverride => "Restore will override.",
            Self::ResubscribeFailed => "Resubscribe failed.",
            Self::MissingOrInvalid => "Missing or invalid.",
            Self::Expired => "Expired.",
            Self::UnknownType => "Unknown type.",
            Self::MismatchedTopic => "Mismatched topic.",
            Self::NonConformingNamespaces => "Non conforming namespaces.",
            Self::InvalidMethod => "Invalid method.",
            Self::InvalidEvent => "Invalid event.",
            Self::InvalidUpdateRequest => "Invalid update request.",
            Self::InvalidExtendRequest => "Invalid extend request.",
            Self::InvalidSessionSettleRequest => "Invalid session settle request.",
            Self::UnauthorizedMethod => "Unauthorized method.",
            Self::UnauthorizedEvent => "Unauthorized event.",
            Self::UnauthorizedUpdateRequest => "Unauthorized update request.",
            Self::UnauthorizedExtendRequest => "Unauthorized extend request.",
            Self::UserRejected => "User rejected.",
            Self::UserRejectedChains => "User rejected chains.",
            Self::UserRejectedMethods => "User rejected methods.",
            Self::UserRejectedEvents => "User rejected events.",
            Self::UnsupportedChains => "Unsupported chains.",
            Self::UnsupportedMethods => "Unsupported methods.",
            Self::UnsupportedEvents => "Unsupported events.",
            Self::UnsupportedAccounts => "Unsupported accounts.",
            Self::UnsupportedNamespaceKey => "Unsupported namespace key.",
            Self::UserDisconnected => "User disconnected.",
            Self::SessionSettlementFailed => "Session settlement failed.",
            Self::SessionRequestExpired => "Session request expired.",
            Self::WcMethodUnsupported => "Unsupported wc_ method.",
        }
    }

    pub fn error_data(&self) -> ErrorData {
        ErrorData {
            code: self.code(),
            message: self.message().to_owned(),
            data: None,
        }
    }

    /// Error data whose message carries additional context, e.g.
    /// `"No matching key. session topic doesn't exist: <topic>"`.
    pub fn with_context(&self, context: impl AsRef<str>) -> ErrorData {
        ErrorData {
            code: self.code(),
            message: format!("{} {}", self.message(), context.as_ref()),
            data: None,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        use strum::IntoEnumIterator;

        Self::iter().find(|kind| kind.code() == code)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::{session_ping::SessionPingRequest, session_propose::SessionProposeRequest, *},
        anyhow::Result,
    };

    /// Deserializes `json` as `T`, serializes it back and checks that nothing
    /// was lost on the way.
    pub(crate) fn param_serde_test<T>(json: &str) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let expected: Value = serde_json::from_str(json)?;
        let deserialized: T = serde_json::from_str(json)?;
        let actual = serde_json::to_value(&deserialized)?;

        assert_eq!(expected, actual);
        Ok(())
    }

    #[test]
    fn method_metadata() {
        assert_eq!(SessionProposeRequest::METHOD, "wc_sessionPropose");
        assert_eq!(SessionProposeRequest::IRN_REQUEST.tag, 1100);
        assert!(SessionProposeRequest::IRN_REQUEST.prompt);
        assert_eq!(SessionProposeRequest::IRN_RESPONSE.tag, 1101);
        assert_eq!(SessionPingRequest::IRN_REQUEST.ttl, 30);
    }

    #[test]
    fn tags_resolve_methods() {
        assert_eq!(method_from_response_tag(1109).ok(), Some("wc_sessionRequest"));
        assert_eq!(method_from_request_tag(1000).ok(), Some("wc_pairingDelete"));
        assert!(matches!(
            method_from_response_tag(42),
            Err(ParamsError::ResponseTag(42))
        ));
    }

    #[test]
    fn sdk_errors() -> Result<()> {
        assert_eq!(SdkErrorKind::UserDisconnected.code(), 6000);
        assert_eq!(SdkErrorKind::UserRejected.to_string(), "USER_REJECTED");
        assert_eq!(
            "UNSUPPORTED_NAMESPACE_KEY".parse::<SdkErrorKind>()?,
            SdkErrorKind::UnsupportedNamespaceKey
        );
        assert_eq!(
            SdkErrorKind::from_code(7000),
            Some(SdkErrorKind::SessionSettlementFailed)
        );

        let data = SdkErrorKind::NoMatchingKey.with_context("topic: abc");
        assert_eq!(data.message, "No matching key. topic: abc");
        Ok(())
    }

    #[test]
    fn metadata_serde() -> Result<()> {
        let metadata: Metadata = serde_json::from_str(
            r#"{"name":"dapp","description":"d","url":"https://example.com","icons":[]}"#,
        )?;
        assert!(metadata.redirect.is_none());
        assert_eq!(Relay::default().protocol, RELAY_PROTOCOL);
        Ok(())
    }
}
