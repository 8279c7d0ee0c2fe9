//! Pairing API: the URI format and the controller that creates, restores,
//! pings and deletes pairings.
//!
//! https://specs.walletconnect.com/2.0/specs/clients/core/pairing

use relay_rpc::domain::Topic;

pub mod client;
pub mod pairing;
pub mod uri;

pub use {
    client::{PairingClient, PairingEvent},
    pairing::{PairingPatch, PairingStruct},
    uri::{Methods, PairingUri, ParseError},
};

pub type Result<T> = std::result::Result<T, PairingClientError>;

/// Errors that can occur during pairing operations.
#[derive(Debug, thiserror::Error)]
pub enum PairingClientError {
    #[error("Invalid pairing URI: {0}")]
    Uri(#[from] ParseError),

    #[error("Pairing with topic already exists: {0}")]
    PairingAlreadyExists(Topic),

    #[error("Keychain already contains a key for topic: {0}")]
    KeysAlreadyExist(Topic),

    #[error("No matching key. pairing topic doesn't exist: {0}")]
    PairingNotFound(Topic),

    #[error("Pairing expired: {0}")]
    PairingExpired(Topic),

    #[error(transparent)]
    Relay(#[from] relay_client::Error),

    #[error(transparent)]
    Core(#[from] core_api::Error),
}
