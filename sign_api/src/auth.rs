//! One-click authentication: SIWE payloads with recap resources, CACAO
//! verification and the namespaces a verified CACAO grants.
//!
//! https://specs.walletconnect.com/2.0/specs/clients/sign/session-authenticate

use {
    crate::error::{Result, SignError},
    chrono::{SecondsFormat, Utc},
    relay_rpc::{
        auth::{
            cacao::{Cacao, CacaoPayload},
            recap::Recap,
        },
        domain::Topic,
        rpc::params::{
            namespaces::{is_valid_chain_id, namespace_of, SettleNamespace, SettleNamespaces},
            session_authenticate::AuthPayload,
        },
    },
};

/// Events granted with every authenticated session.
pub const DEFAULT_EVENTS: &[&str] = &["chainChanged", "accountsChanged"];

const SIWE_VERSION: &str = "1";

/// What the requester asks the wallet to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateParams {
    /// CAIP-2 chains, all of one namespace.
    pub chains: Vec<String>,
    pub domain: String,
    pub uri: String,
    pub nonce: String,
    pub statement: Option<String>,
    pub request_id: Option<String>,
    pub resources: Vec<String>,
    /// Methods requested through a recap resource.
    pub methods: Vec<String>,
    pub nbf: Option<String>,
    pub exp: Option<String>,
    /// Seconds the request stays valid. One hour when `None`.
    pub expiry: Option<u64>,
    /// Existing pairing to send the request on. A new pairing is created when
    /// `None`.
    pub pairing_topic: Option<Topic>,
}

impl AuthenticateParams {
    pub fn new(
        chains: impl IntoIterator<Item = impl Into<String>>,
        domain: impl Into<String>,
        uri: impl Into<String>,
        nonce: impl Into<String>,
    ) -> Self {
        Self {
            chains: chains.into_iter().map(Into::into).collect(),
            domain: domain.into(),
            uri: uri.into(),
            nonce: nonce.into(),
            statement: None,
            request_id: None,
            resources: Vec::new(),
            methods: Vec::new(),
            nbf: None,
            exp: None,
            expiry: None,
            pairing_topic: None,
        }
    }

    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = Some(statement.into());
        self
    }

    pub fn with_methods(mut self, methods: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resources(mut self, resources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_expiry(mut self, ttl: u64) -> Self {
        self.expiry = Some(ttl);
        self
    }

    pub fn with_pairing_topic(mut self, topic: Topic) -> Self {
        self.pairing_topic = Some(topic);
        self
    }

    /// Namespace of the requested chains.
    pub fn namespace(&self) -> Result<&str> {
        self.chains
            .first()
            .map(|chain| namespace_of(chain))
            .ok_or_else(|| SignError::InvalidParams("no chains requested".to_owned()))
    }

    pub fn validate(&self) -> Result<()> {
        let namespace = self.namespace()?;
        if let Some(chain) = self
            .chains
            .iter()
            .find(|chain| !is_valid_chain_id(chain) || namespace_of(chain) != namespace)
        {
            return Err(SignError::InvalidParams(format!("chain: {chain}")));
        }

        for (name, value) in [
            ("domain", &self.domain),
            ("uri", &self.uri),
            ("nonce", &self.nonce),
        ] {
            if value.trim().is_empty() {
                return Err(SignError::InvalidParams(format!("{name} is empty")));
            }
        }
        Ok(())
    }

    /// The payload sent to the wallet. Requested methods travel as a recap
    /// resource on the chains' namespace.
    pub fn to_payload(&self) -> Result<AuthPayload> {
        let mut resources = self.resources.clone();
        if !self.methods.is_empty() {
            let recap = Recap::from_methods(self.namespace()?, &self.methods)
                .to_uri()
                .map_err(|err| SignError::InvalidParams(err.to_string()))?;
            resources.push(recap);
        }

        Ok(AuthPayload {
            type_: AuthPayload::TYPE_EIP4361.to_owned(),
            chains: self.chains.clone(),
            domain: self.domain.clone(),
            aud: self.uri.clone(),
            nonce: self.nonce.clone(),
            version: SIWE_VERSION.to_owned(),
            iat: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            nbf: self.nbf.clone(),
            exp: self.exp.clone(),
            statement: self.statement.clone(),
            request_id: self.request_id.clone(),
            resources: (!resources.is_empty()).then_some(resources),
        })
    }
}

/// The CACAO payload `iss` (`did:pkh:<account>`) signs for `payload`.
pub fn cacao_payload(payload: &AuthPayload, iss: &str) -> CacaoPayload {
    CacaoPayload {
        domain: payload.domain.clone(),
        iss: iss.to_owned(),
        statement: payload.statement.clone(),
        aud: payload.aud.clone(),
        version: payload.version.clone(),
        nonce: payload.nonce.clone(),
        iat: payload.iat.clone(),
        exp: payload.exp.clone(),
        nbf: payload.nbf.clone(),
        request_id: payload.request_id.clone(),
        resources: payload.resources.clone(),
    }
}

/// The SIWE message `iss` signs to answer `payload`.
pub fn format_auth_message(payload: &AuthPayload, iss: &str) -> Result<String> {
    Ok(cacao_payload(payload, iss).siwe_message()?)
}

/// Checks that every CACAO answers `payload` and carries a valid signature.
pub fn verify_cacaos(cacaos: &[Cacao], payload: &AuthPayload) -> Result<()> {
    if cacaos.is_empty() {
        return Err(SignError::InvalidParams("no cacaos".to_owned()));
    }

    for cacao in cacaos {
        if cacao.p.domain != payload.domain || cacao.p.nonce != payload.nonce {
            return Err(SignError::InvalidParams(format!(
                "cacao of {} does not answer the request",
                cacao.p.iss
            )));
        }
        cacao.verify()?;
    }
    Ok(())
}

/// Namespaces granted by verified CACAOs: their accounts and chains, the recap
/// methods and the default events.
pub fn namespaces_from_cacaos(cacaos: &[Cacao]) -> Result<SettleNamespaces> {
    let mut namespaces = SettleNamespaces::default();
    for cacao in cacaos {
        let account = cacao.p.account()?;
        let chain_id = cacao.p.chain_id()?;
        let key = namespace_of(&account).to_owned();
        let methods = cacao.p.recap_methods(&key);

        let namespace = namespaces.entry(key).or_insert_with(|| SettleNamespace {
            events: DEFAULT_EVENTS.iter().map(|e| (*e).to_owned()).collect(),
            ..Default::default()
        });
        namespace.accounts.insert(account);
        namespace.chains.get_or_insert_with(Default::default).insert(chain_id);
        namespace.methods.extend(methods);
    }
    Ok(namespaces)
}

/// Topic the responder publishes its answer on: `sha256` of the requester's
/// public key.
pub fn response_topic(public_key: &str) -> Result<Topic> {
    let key = hex::decode(public_key)
        .map_err(|err| SignError::InvalidParams(format!("public key: {err}")))?;
    Ok(Topic::from_key(&key))
}

/// Whether the namespaces grant anything a session could be used for.
pub fn grants_methods(namespaces: &SettleNamespaces) -> bool {
    namespaces.values().any(|namespace| !namespace.methods.is_empty())
}
