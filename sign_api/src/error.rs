use {
    pairing_api::PairingClientError,
    relay_rpc::{
        auth::cacao::CacaoError,
        domain::{MessageId, Topic},
        rpc::{
            params::{namespaces::NamespaceError, SdkErrorKind},
            ErrorData,
        },
    },
};

pub type Result<T> = std::result::Result<T, SignError>;

/// Errors raised by the sign client.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("No matching key. session topic doesn't exist: {0}")]
    SessionNotFound(Topic),

    #[error("Expired. session topic: {0}")]
    SessionExpired(Topic),

    #[error("No matching key. proposal id doesn't exist: {0}")]
    ProposalNotFound(MessageId),

    #[error("Expired. proposal id: {0}")]
    ProposalExpired(MessageId),

    #[error("No matching key. session request id doesn't exist: {0}")]
    RequestNotFound(MessageId),

    #[error("Expired. session request id: {0}")]
    RequestExpired(MessageId),

    #[error("No matching key. authenticate request id doesn't exist: {0}")]
    AuthRequestNotFound(MessageId),

    #[error("Expired. authenticate request id: {0}")]
    AuthRequestExpired(MessageId),

    #[error(transparent)]
    Namespaces(#[from] NamespaceError),

    #[error("Unsupported chain {chain_id} on session {topic}")]
    UnsupportedChain { topic: Topic, chain_id: String },

    #[error("Unsupported method {method} on chain {chain_id}")]
    UnsupportedMethod { chain_id: String, method: String },

    #[error("Unsupported event {event} on chain {chain_id}")]
    UnsupportedEvent { chain_id: String, event: String },

    #[error("Only the controller may update session {0}")]
    UnauthorizedUpdate(Topic),

    #[error("Invalid expiry: {0}")]
    InvalidExpiry(u64),

    #[error("Missing or invalid. {0}")]
    InvalidParams(String),

    #[error("Invalid cacao: {0}")]
    Cacao(#[from] CacaoError),

    #[error("Peer rejected the request: {0}")]
    Rejected(ErrorData),

    #[error("Approval was cancelled")]
    Cancelled,

    #[error(transparent)]
    Pairing(#[from] PairingClientError),

    #[error(transparent)]
    Relay(relay_client::Error),

    #[error(transparent)]
    Core(#[from] core_api::Error),

    #[error("Serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<relay_client::Error> for SignError {
    fn from(err: relay_client::Error) -> Self {
        match err {
            relay_client::Error::Rpc(error) => Self::Rejected(error),
            err => Self::Relay(err),
        }
    }
}

impl SignError {
    /// SDK error kind reported to a peer whose request failed with `self`.
    pub fn kind(&self) -> SdkErrorKind {
        match self {
            Self::SessionNotFound(_)
            | Self::ProposalNotFound(_)
            | Self::RequestNotFound(_)
            | Self::AuthRequestNotFound(_) => SdkErrorKind::NoMatchingKey,
            Self::SessionExpired(_)
            | Self::ProposalExpired(_)
            | Self::AuthRequestExpired(_) => SdkErrorKind::Expired,
            Self::RequestExpired(_) => SdkErrorKind::SessionRequestExpired,
            Self::Namespaces(err) => err.kind(),
            Self::UnsupportedChain { .. } => SdkErrorKind::UnsupportedChains,
            Self::UnsupportedMethod { .. } => SdkErrorKind::UnauthorizedMethod,
            Self::UnsupportedEvent { .. } => SdkErrorKind::UnauthorizedEvent,
            Self::UnauthorizedUpdate(_) => SdkErrorKind::UnauthorizedUpdateRequest,
            Self::InvalidExpiry(_) => SdkErrorKind::InvalidExtendRequest,
            Self::Pairing(PairingClientError::PairingNotFound(_)) => SdkErrorKind::NoMatchingKey,
            Self::Pairing(PairingClientError::PairingExpired(_)) => SdkErrorKind::Expired,
            _ => SdkErrorKind::MissingOrInvalid,
        }
    }

    /// Error data sent to the peer.
    pub fn error_data(&self) -> ErrorData {
        match self {
            Self::Rejected(error) => error.clone(),
            Self::Namespaces(err) => err.into(),
            err => ErrorData {
                code: err.kind().code(),
                message: err.to_string(),
                data: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_become_rejections() {
        let remote = SdkErrorKind::UserRejected.error_data();
        let err = SignError::from(relay_client::Error::Rpc(remote.clone()));
        assert!(matches!(&err, SignError::Rejected(error) if *error == remote));
        assert_eq!(err.error_data(), remote);

        let err = SignError::from(relay_client::Error::ConnectionClosed);
        assert!(matches!(err, SignError::Relay(_)));
    }

    #[test]
    fn errors_map_to_sdk_codes() {
        let topic = Topic::from("topic");
        assert_eq!(SignError::SessionNotFound(topic.clone()).kind().code(), 2);
        assert_eq!(
            SignError::UnsupportedChain {
                topic,
                chain_id: "eip155:5".to_owned()
            }
            .error_data()
            .code,
            5100
        );
        assert_eq!(
            SignError::Namespaces(NamespaceError::UnsupportedAccounts("eip155".to_owned()))
                .error_data()
                .code,
            5103
        );
        assert_eq!(
            SignError::RequestExpired(MessageId::new(1)).kind(),
            SdkErrorKind::SessionRequestExpired
        );
    }
}
