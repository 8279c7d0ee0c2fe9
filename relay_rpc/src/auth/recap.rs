//! ReCap capability resources (`urn:recap:<base64url json>`) carried in SIWE
//! resources to request Sign API methods together with authentication.
//!
//! https://eips.ethereum.org/EIPS/eip-5573

use {
    data_encoding::BASE64URL_NOPAD,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    std::collections::BTreeMap,
};

pub const RECAP_PREFIX: &str = "urn:recap:";
pub const REQUEST_ABILITY_PREFIX: &str = "request/";

#[derive(Debug, thiserror::Error)]
pub enum RecapError {
    #[error("Resource is not a recap URN")]
    NotRecap,
    #[error("Recap is not base64url encoded")]
    Encoding,
    #[error("Recap payload is invalid: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("Recap has no attenuations")]
    Empty,
}

/// Attenuations keyed by resource (e.g. `eip155`), then by ability
/// (e.g. `request/personal_sign`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Recap {
    pub att: BTreeMap<String, BTreeMap<String, Vec<Value>>>,
}

impl Recap {
    /// Builds a recap granting `request/<method>` on `resource`.
    pub fn from_methods<I, S>(resource: &str, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let abilities = methods
            .into_iter()
            .map(|method| {
                (
                    format!("{REQUEST_ABILITY_PREFIX}{}", method.as_ref()),
                    vec![Value::Object(Default::default())],
                )
            })
            .collect::<BTreeMap<_, _>>();

        let mut att = BTreeMap::new();
        if !abilities.is_empty() {
            att.insert(resource.to_owned(), abilities);
        }

        Self { att }
    }

    pub fn is_recap(resource: &str) -> bool {
        resource.starts_with(RECAP_PREFIX)
    }

    pub fn from_uri(resource: &str) -> Result<Self, RecapError> {
        let encoded = resource
            .strip_prefix(RECAP_PREFIX)
            .ok_or(RecapError::NotRecap)?
            .trim_end_matches('=');
        let decoded = BASE64URL_NOPAD
            .decode(encoded.as_bytes())
            .map_err(|_| RecapError::Encoding)?;
        let recap: Self = serde_json::from_slice(&decoded)?;

        if recap.att.is_empty() {
            return Err(RecapError::Empty);
        }

        Ok(recap)
    }

    pub fn to_uri(&self) -> Result<String, RecapError> {
        let json = serde_json::to_vec(self)?;
        Ok(format!("{RECAP_PREFIX}{}", BASE64URL_NOPAD.encode(&json)))
    }

    /// Methods granted through `request/*` abilities on `resource`.
    pub fn methods(&self, resource: &str) -> Vec<String> {
        self.att
            .get(resource)
            .map(|abilities| {
                abilities
                    .keys()
                    .filter_map(|ability| ability.strip_prefix(REQUEST_ABILITY_PREFIX))
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Merges another recap's attenuations into this one.
    pub fn merge(mut self, other: Recap) -> Self {
        for (resource, abilities) in other.att {
            self.att.entry(resource).or_default().extend(abilities);
        }
        self
    }

    /// Human readable statement appended to the SIWE message.
    pub fn statement(&self) -> String {
        let actions = self
            .att
            .iter()
            .enumerate()
            .map(|(index, (resource, abilities))| {
                let mut by_namespace: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
                for ability in abilities.keys() {
                    let (namespace, name) = ability.split_once('/').unwrap_or(("", ability.as_str()));
                    by_namespace.entry(namespace).or_default().push(name);
                }

                let abilities = by_namespace
                    .iter()
                    .map(|(namespace, names)| {
                        let names = names
                            .iter()
                            .map(|name| format!("'{name}'"))
                            .collect::<Vec<_>>()
                            .join(", ");
                        format!("'{namespace}': {names}")
                    })
                    .collect::<Vec<_>>()
                    .join(", ");

                format!("({}) {abilities} for '{resource}'", index + 1)
            })
            .collect::<Vec<_>>()
            .join(". ");

        format!(
            "I further authorize the stated URI to perform the following actions on my behalf: \
             {actions}."
        )
    }
}

/// Merges every recap found in `resources`.
pub fn merged_recap(resources: &[String]) -> Option<Recap> {
    resources
        .iter()
        .filter(|resource| Recap::is_recap(resource))
        .filter_map(|resource| Recap::from_uri(resource).ok())
        .reduce(Recap::merge)
}
