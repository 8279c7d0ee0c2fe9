use {
    derive_more::{AsRef, Display, From},
    rand::{rngs::OsRng, RngCore},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    std::{str::FromStr, sync::Arc},
};

/// Length of a generated topic, in bytes, before hex encoding.
pub const TOPIC_LENGTH: usize = 32;

macro_rules! impl_str_newtype {
    ($name:ident) => {
        impl $name {
            pub fn new(value: Arc<str>) -> Self {
                Self(value)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn value(&self) -> &Arc<str> {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(Arc::from(value))
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(Arc::from(value))
            }
        }

        impl From<&String> for $name {
            fn from(value: &String) -> Self {
                Self(Arc::from(value.as_str()))
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self::from(s))
            }
        }
    };
}

/// Opaque identifier of an encrypted relay channel.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    AsRef,
)]
#[serde(transparent)]
#[as_ref(forward)]
pub struct Topic(Arc<str>);

impl_str_newtype!(Topic);

impl Topic {
    /// Generates a random topic.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOPIC_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self::from(hex::encode(bytes))
    }

    /// Topic addressing the channel encrypted with `key`: `hex(sha256(key))`.
    pub fn from_key(key: &[u8]) -> Self {
        Self::from(sha256_hex(key))
    }
}

/// Relay subscription identifier.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    AsRef,
)]
#[serde(transparent)]
#[as_ref(forward)]
pub struct SubscriptionId(Arc<str>);

impl_str_newtype!(SubscriptionId);

impl SubscriptionId {
    /// Deterministic subscription id of `topic` for the given client.
    pub fn derive(topic: &Topic, client_id: &str) -> Self {
        Self::from(sha256_hex(format!("{topic}{client_id}")))
    }
}

/// WalletConnect Cloud project identifier.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    AsRef,
)]
#[serde(transparent)]
#[as_ref(forward)]
pub struct ProjectId(Arc<str>);

impl_str_newtype!(ProjectId);

/// JSON-RPC message identifier.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

/// Lowercase hex encoded SHA-256 digest.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}
