//! Pairing URI
//!
//! `wc:<topic>@<version>?symKey=<hex>&relay-protocol=<name>` followed by the
//! optional `relay-data`, `methods` and `expiryTimestamp` parameters.
//!
//! https://specs.walletconnect.com/2.0/specs/clients/core/pairing/pairing-uri

use {
    once_cell::sync::Lazy,
    regex::Regex,
    relay_rpc::{domain::Topic, rpc::params::Relay},
    serde::{Deserialize, Serialize},
    std::{collections::HashMap, fmt, str::FromStr},
    thiserror::Error,
    url::Url,
};

pub const PAIRING_VERSION: &str = "2";

static TOPIC_VERSION_REGEX: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^(?P<topic>[[:word:]-]+)@(?P<version>\d+)$").ok());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Expecting protocol \"wc\" but \"{0}\" is found.")]
    UnexpectedProtocol(String),
    #[error("Failed to parse topic and version")]
    InvalidTopicAndVersion,
    #[error("Relay protocol not found")]
    RelayProtocolNotFound,
    #[error("Symmetric key not found")]
    KeyNotFound,
    #[error("Invalid symmetric key: {0}")]
    InvalidSymKey(String),
    #[error("Invalid expiry timestamp: {0}")]
    InvalidExpiryTimestamp(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Duplicate parameter: {0}")]
    DuplicateParameter(String),
}

/// Methods a pairing supports, grouped by protocol:
/// `[wc_sessionPropose],[wc_authRequest,wc_authBatchRequest]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Methods(pub Vec<Vec<String>>);

impl Methods {
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Vec::is_empty)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.0.iter().flatten().any(|m| m == method)
    }
}

impl fmt::Display for Methods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups = self
            .0
            .iter()
            .map(|group| format!("[{}]", group.join(",")))
            .collect::<Vec<_>>();
        f.write_str(&groups.join(","))
    }
}

impl FromStr for Methods {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('[').trim_end_matches(']');
        if trimmed.is_empty() {
            return Ok(Self::default());
        }

        let groups = trimmed
            .split("],[")
            .map(|group| {
                group
                    .split(',')
                    .map(str::trim)
                    .filter(|method| !method.is_empty())
                    .map(ToOwned::to_owned)
                    .collect::<Vec<_>>()
            })
            .collect();
        Ok(Self(groups))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct PairingUri {
    pub topic: Topic,
    pub version: String,
    /// Hex encoded symmetric key of the pairing topic.
    pub sym_key: String,
    pub relay: Relay,
    pub methods: Option<Methods>,
    pub expiry_timestamp: Option<u64>,
}

impl fmt::Debug for PairingUri {
    /// Debug with key masked.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingUri")
            .field("topic", &self.topic)
            .field("version", &self.version)
            .field("relay-protocol", &self.relay.protocol)
            .field("key", &"***")
            .field("relay-data", &self.relay.data.as_deref().unwrap_or(""))
            .field("methods", &self.methods)
            .field("expiry-timestamp", &self.expiry_timestamp)
            .finish()
    }
}

impl fmt::Display for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wc:{}@{}?symKey={}&relay-protocol={}",
            self.topic, self.version, self.sym_key, self.relay.protocol
        )?;
        if let Some(data) = &self.relay.data {
            let data = url::form_urlencoded::byte_serialize(data.as_bytes()).collect::<String>();
            write!(f, "&relay-data={data}")?;
        }
        if let Some(methods) = self.methods.as_ref().filter(|m| !m.is_empty()) {
            write!(f, "&methods={methods}")?;
        }
        if let Some(expiry) = self.expiry_timestamp {
            write!(f, "&expiryTimestamp={expiry}")?;
        }
        Ok(())
    }
}

impl FromStr for PairingUri {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::from_str(s).map_err(|err| ParseError::InvalidData(err.to_string()))?;
        if url.scheme() != "wc" {
            return Err(ParseError::UnexpectedProtocol(url.scheme().to_owned()));
        }

        let (topic, version) = parse_topic_and_version(url.path())?;
        let mut params = parse_params(&url)?;

        let protocol = params
            .remove("relay-protocol")
            .ok_or(ParseError::RelayProtocolNotFound)?;
        let sym_key = params.remove("symKey").ok_or(ParseError::KeyNotFound)?;
        match hex::decode(&sym_key) {
            Ok(key) if key.len() == 32 => {}
            Ok(key) => {
                return Err(ParseError::InvalidSymKey(format!(
                    "expected 32 bytes, got {}",
                    key.len()
                )))
            }
            Err(err) => return Err(ParseError::InvalidSymKey(err.to_string())),
        }

        let methods = params
            .remove("methods")
            .map(|methods| methods.parse::<Methods>())
            .transpose()?;
        let expiry_timestamp = params
            .remove("expiryTimestamp")
            .map(|expiry| {
                expiry
                    .parse::<u64>()
                    .map_err(|_| ParseError::InvalidExpiryTimestamp(expiry))
            })
            .transpose()?;

        Ok(Self {
            topic,
            version,
            sym_key,
            relay: Relay {
                protocol,
                data: params.remove("relay-data"),
            },
            methods,
            expiry_timestamp,
        })
    }
}

fn parse_topic_and_version(path: &str) -> Result<(Topic, String), ParseError> {
    let caps = TOPIC_VERSION_REGEX
        .as_ref()
        .and_then(|regex| regex.captures(path))
        .ok_or(ParseError::InvalidTopicAndVersion)?;

    let topic = caps
        .name("topic")
        .ok_or(ParseError::InvalidTopicAndVersion)?
        .as_str();
    let version = caps
        .name("version")
        .ok_or(ParseError::InvalidTopicAndVersion)?
        .as_str();

    Ok((Topic::from(topic), version.to_owned()))
}

/// Query parameters by name. Unknown parameters are kept so newer URIs still
/// parse.
fn parse_params(url: &Url) -> Result<HashMap<String, String>, ParseError> {
    let mut params = HashMap::new();
    for (key, value) in url.query_pairs() {
        let sanitized_key: String = key
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-')
            .collect();
        if params.insert(sanitized_key, value.into_owned()).is_some() {
            return Err(ParseError::DuplicateParameter(key.into_owned()));
        }
    }
    Ok(params)
}
