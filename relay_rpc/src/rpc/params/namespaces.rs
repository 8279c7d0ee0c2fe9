//! Proposal and settlement namespaces with CAIP-2/CAIP-10 validation.
//!
//! https://specs.walletconnect.com/2.0/specs/clients/sign/namespaces

use {
    super::SdkErrorKind,
    crate::rpc::ErrorData,
    once_cell::sync::Lazy,
    regex::Regex,
    serde::{Deserialize, Serialize},
    std::{
        collections::{BTreeMap, BTreeSet},
        ops::{Deref, DerefMut},
    },
};

static NAMESPACE_REGEX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[-a-z0-9]{3,8}$").ok());

static CHAIN_ID_REGEX: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[-a-z0-9]{3,8}:[-_a-zA-Z0-9]{1,32}$").ok());

static ACCOUNT_ID_REGEX: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^[-a-z0-9]{3,8}:[-_a-zA-Z0-9]{1,32}:[-.%a-zA-Z0-9]{1,128}$").ok()
});

fn matches(regex: &Lazy<Option<Regex>>, value: &str) -> bool {
    regex
        .as_ref()
        .map(|regex| regex.is_match(value))
        .unwrap_or(false)
}

/// `true` for a bare chain namespace such as `eip155`.
pub fn is_valid_namespace(value: &str) -> bool {
    matches(&NAMESPACE_REGEX, value)
}

/// `true` for a CAIP-2 chain id such as `eip155:1`.
pub fn is_valid_chain_id(value: &str) -> bool {
    matches(&CHAIN_ID_REGEX, value)
}

/// `true` for a CAIP-10 account id such as `eip155:1:0xab16...`.
pub fn is_valid_account_id(value: &str) -> bool {
    matches(&ACCOUNT_ID_REGEX, value)
}

/// Namespace part of a chain id, account id or namespace key.
pub fn namespace_of(value: &str) -> &str {
    value.split(':').next().unwrap_or(value)
}

/// CAIP-2 chain of a CAIP-10 account.
pub fn chain_of_account(account: &str) -> Option<String> {
    let mut parts = account.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(namespace), Some(reference), Some(_)) => Some(format!("{namespace}:{reference}")),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NamespaceError {
    #[error("Unsupported namespace key: {0}")]
    UnsupportedNamespaceKey(String),
    #[error("Unsupported chains: {0}")]
    UnsupportedChains(String),
    #[error("Unsupported accounts: {0}")]
    UnsupportedAccounts(String),
    #[error("Unsupported methods: {0}")]
    UnsupportedMethods(String),
    #[error("Unsupported events: {0}")]
    UnsupportedEvents(String),
}

impl NamespaceError {
    pub fn kind(&self) -> SdkErrorKind {
        match self {
            Self::UnsupportedNamespaceKey(_) => SdkErrorKind::UnsupportedNamespaceKey,
            Self::UnsupportedChains(_) => SdkErrorKind::UnsupportedChains,
            Self::UnsupportedAccounts(_) => SdkErrorKind::UnsupportedAccounts,
            Self::UnsupportedMethods(_) => SdkErrorKind::UnsupportedMethods,
            Self::UnsupportedEvents(_) => SdkErrorKind::UnsupportedEvents,
        }
    }
}

impl From<&NamespaceError> for ErrorData {
    fn from(err: &NamespaceError) -> Self {
        let context = match err {
            NamespaceError::UnsupportedNamespaceKey(context)
            | NamespaceError::UnsupportedChains(context)
            | NamespaceError::UnsupportedAccounts(context)
            | NamespaceError::UnsupportedMethods(context)
            | NamespaceError::UnsupportedEvents(context) => context,
        };
        err.kind().with_context(context)
    }
}

/// Namespace requested in a session proposal. When the key is itself a
/// CAIP-2 chain id, `chains` may be omitted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProposeNamespace {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub chains: BTreeSet<String>,
    #[serde(default)]
    pub methods: BTreeSet<String>,
    #[serde(default)]
    pub events: BTreeSet<String>,
}

impl ProposeNamespace {
    /// Effective chains of the namespace registered under `key`.
    pub fn chains_for(&self, key: &str) -> BTreeSet<String> {
        if self.chains.is_empty() && is_valid_chain_id(key) {
            BTreeSet::from([key.to_owned()])
        } else {
            self.chains.clone()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct ProposeNamespaces(pub BTreeMap<String, ProposeNamespace>);

impl Deref for ProposeNamespaces {
    type Target = BTreeMap<String, ProposeNamespace>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ProposeNamespaces {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<K: Into<String>> FromIterator<(K, ProposeNamespace)> for ProposeNamespaces {
    fn from_iter<I: IntoIterator<Item = (K, ProposeNamespace)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl ProposeNamespaces {
    /// Checks keys and chains are well formed CAIP-2 and consistent with the
    /// namespace they are listed under.
    pub fn validate(&self) -> Result<(), NamespaceError> {
        for (key, namespace) in self.iter() {
            if !is_valid_namespace(key) && !is_valid_chain_id(key) {
                return Err(NamespaceError::UnsupportedNamespaceKey(key.clone()));
            }

            let chains = namespace.chains_for(key);
            if chains.is_empty() {
                return Err(NamespaceError::UnsupportedChains(format!(
                    "{key} has no chains"
                )));
            }

            if let Some(chain) = chains
                .iter()
                .find(|chain| !is_valid_chain_id(chain) || namespace_of(chain) != namespace_of(key))
            {
                return Err(NamespaceError::UnsupportedChains(chain.clone()));
            }
        }

        Ok(())
    }
}

/// Namespace approved for a settled session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SettleNamespace {
    pub accounts: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chains: Option<BTreeSet<String>>,
    #[serde(default)]
    pub methods: BTreeSet<String>,
    #[serde(default)]
    pub events: BTreeSet<String>,
}

impl SettleNamespace {
    /// Explicit chains plus the chains of every account.
    pub fn all_chains(&self) -> BTreeSet<String> {
        self.accounts
            .iter()
            .filter_map(|account| chain_of_account(account))
            .chain(self.chains.iter().flatten().cloned())
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct SettleNamespaces(pub BTreeMap<String, SettleNamespace>);

impl Deref for SettleNamespaces {
    type Target = BTreeMap<String, SettleNamespace>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SettleNamespaces {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<K: Into<String>> FromIterator<(K, SettleNamespace)> for SettleNamespaces {
    fn from_iter<I: IntoIterator<Item = (K, SettleNamespace)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl SettleNamespaces {
    /// Checks every account is CAIP-10 and every chain CAIP-2, both within
    /// the namespace they are listed under.
    pub fn validate(&self) -> Result<(), NamespaceError> {
        for (key, namespace) in self.iter() {
            if !is_valid_namespace(key) && !is_valid_chain_id(key) {
                return Err(NamespaceError::UnsupportedNamespaceKey(key.clone()));
            }

            if namespace.accounts.is_empty() {
                return Err(NamespaceError::UnsupportedAccounts(format!(
                    "{key} has no accounts"
                )));
            }

            if let Some(account) = namespace.accounts.iter().find(|account| {
                !is_valid_account_id(account) || namespace_of(account) != namespace_of(key)
            }) {
                return Err(NamespaceError::UnsupportedAccounts(account.clone()));
            }

            if let Some(chain) = namespace.chains.iter().flatten().find(|chain| {
                !is_valid_chain_id(chain) || namespace_of(chain) != namespace_of(key)
            }) {
                return Err(NamespaceError::UnsupportedChains(chain.clone()));
            }
        }

        Ok(())
    }

    /// Namespace entry covering `chain_id`.
    pub fn for_chain(&self, chain_id: &str) -> Option<&SettleNamespace> {
        self.get(chain_id).or_else(|| {
            self.get(namespace_of(chain_id))
                .filter(|namespace| namespace.all_chains().contains(chain_id))
        })
    }

    pub fn supports_chain(&self, chain_id: &str) -> bool {
        self.for_chain(chain_id).is_some()
    }

    pub fn supports_method(&self, chain_id: &str, method: &str) -> bool {
        self.for_chain(chain_id)
            .map(|namespace| namespace.methods.contains(method))
            .unwrap_or(false)
    }

    pub fn supports_event(&self, chain_id: &str, event: &str) -> bool {
        self.for_chain(chain_id)
            .map(|namespace| namespace.events.contains(event))
            .unwrap_or(false)
    }

    pub fn accounts(&self) -> BTreeSet<String> {
        self.values()
            .flat_map(|namespace| namespace.accounts.iter().cloned())
            .collect()
    }

    /// Checks the approved namespaces satisfy `required`: for every required
    /// key there must be an approved entry overlapping it on chains,
    /// accounts, methods and events. Empty required methods or events are
    /// satisfied trivially.
    pub fn conforms_to(&self, required: &ProposeNamespaces) -> Result<(), NamespaceError> {
        for (key, wanted) in required.iter() {
            let approved = self
                .get(key)
                .or_else(|| self.get(namespace_of(key)))
                .ok_or_else(|| NamespaceError::UnsupportedNamespaceKey(key.clone()))?;

            let wanted_chains = wanted.chains_for(key);
            let approved_chains = approved.all_chains();
            if !wanted_chains.is_empty() && wanted_chains.is_disjoint(&approved_chains) {
                return Err(NamespaceError::UnsupportedChains(format!(
                    "{key} requires one of {wanted_chains:?}"
                )));
            }

            let has_account = approved.accounts.iter().any(|account| {
                chain_of_account(account)
                    .map(|chain| wanted_chains.is_empty() || wanted_chains.contains(&chain))
                    .unwrap_or(false)
            });
            if !has_account {
                return Err(NamespaceError::UnsupportedAccounts(format!(
                    "{key} has no account on a required chain"
                )));
            }

            if !wanted.methods.is_empty() && wanted.methods.is_disjoint(&approved.methods) {
                return Err(NamespaceError::UnsupportedMethods(format!(
                    "{key} requires one of {:?}",
                    wanted.methods
                )));
            }

            if !wanted.events.is_empty() && wanted.events.is_disjoint(&approved.events) {
                return Err(NamespaceError::UnsupportedEvents(format!(
                    "{key} requires one of {:?}",
                    wanted.events
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, anyhow::Result};

    fn set<const N: usize>(items: [&str; N]) -> BTreeSet<String> {
        items.into_iter().map(ToOwned::to_owned).collect()
    }

    fn required() -> ProposeNamespaces {
        [("eip155", ProposeNamespace {
            chains: set(["eip155:1"]),
            methods: set(["personal_sign"]),
            events: set(["accountsChanged"]),
        })]
        .into_iter()
        .collect()
    }

    fn approved() -> SettleNamespaces {
        [("eip155", SettleNamespace {
            accounts: set(["eip155:1:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb"]),
            chains: None,
            methods: set(["personal_sign", "eth_sendTransaction"]),
            events: set(["accountsChanged"]),
        })]
        .into_iter()
        .collect()
    }

    #[test]
    fn caip_formats() {
        assert!(is_valid_chain_id("eip155:1"));
        assert!(is_valid_chain_id("cosmos:cosmoshub-4"));
        assert!(!is_valid_chain_id("eip155"));
        assert!(is_valid_account_id(
            "eip155:1:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb"
        ));
        assert!(!is_valid_account_id("0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb"));
        assert_eq!(
            chain_of_account("eip155:137:0xabc").as_deref(),
            Some("eip155:137")
        );
    }

    #[test]
    fn propose_validation() {
        assert!(required().validate().is_ok());

        let caip2_key: ProposeNamespaces = [("eip155:10", ProposeNamespace::default())]
            .into_iter()
            .collect();
        assert!(caip2_key.validate().is_ok());

        let mismatched: ProposeNamespaces = [("eip155", ProposeNamespace {
            chains: set(["solana:mainnet"]),
            ..Default::default()
        })]
        .into_iter()
        .collect();
        assert!(matches!(
            mismatched.validate(),
            Err(NamespaceError::UnsupportedChains(_))
        ));
    }

    #[test]
    fn settle_validation() {
        assert!(approved().validate().is_ok());

        let mut bad = approved();
        if let Some(namespace) = bad.get_mut("eip155") {
            namespace.accounts = set(["0xabc"]);
        }
        assert!(matches!(
            bad.validate(),
            Err(NamespaceError::UnsupportedAccounts(_))
        ));
    }

    #[test]
    fn conformance() {
        assert!(approved().conforms_to(&required()).is_ok());
        assert!(approved().conforms_to(&ProposeNamespaces::default()).is_ok());

        let mut wrong_chain = approved();
        if let Some(namespace) = wrong_chain.get_mut("eip155") {
            namespace.accounts = set(["eip155:5:0xabc"]);
        }
        assert!(matches!(
            wrong_chain.conforms_to(&required()),
            Err(NamespaceError::UnsupportedChains(_))
        ));

        let mut no_methods = approved();
        if let Some(namespace) = no_methods.get_mut("eip155") {
            namespace.methods = set(["eth_sign"]);
        }
        let err = no_methods.conforms_to(&required()).unwrap_err();
        assert_eq!(err.kind(), SdkErrorKind::UnsupportedMethods);

        let mut no_events = approved();
        if let Some(namespace) = no_events.get_mut("eip155") {
            namespace.events.clear();
        }
        assert!(matches!(
            no_events.conforms_to(&required()),
            Err(NamespaceError::UnsupportedEvents(_))
        ));

        let missing: SettleNamespaces = [("solana", SettleNamespace {
            accounts: set(["solana:mainnet:abc"]),
            ..Default::default()
        })]
        .into_iter()
        .collect();
        assert!(matches!(
            missing.conforms_to(&required()),
            Err(NamespaceError::UnsupportedNamespaceKey(_))
        ));
    }

    #[test]
    fn chain_lookup() {
        let namespaces = approved();
        assert!(namespaces.supports_chain("eip155:1"));
        assert!(!namespaces.supports_chain("eip155:5"));
        assert!(namespaces.supports_method("eip155:1", "personal_sign"));
        assert!(!namespaces.supports_method("eip155:1", "eth_sign"));
        assert!(namespaces.supports_event("eip155:1", "accountsChanged"));
    }

    #[test]
    fn serde_shape() -> Result<()> {
        let json = serde_json::to_value(required())?;
        assert_eq!(json["eip155"]["chains"][0], "eip155:1");

        let parsed: ProposeNamespaces = serde_json::from_str(
            r#"{"eip155:1":{"methods":["personal_sign"],"events":[]}}"#,
        )?;
        assert_eq!(
            parsed.get("eip155:1").map(|ns| ns.chains_for("eip155:1")),
            Some(set(["eip155:1"]))
        );
        Ok(())
    }
}
