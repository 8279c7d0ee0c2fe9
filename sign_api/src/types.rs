//! Entities persisted by the sign client.

use {
    core_api::store::StoreValue,
    relay_rpc::{
        domain::{MessageId, Topic},
        rpc::params::{
            namespaces::{ProposeNamespaces, SettleNamespaces},
            session_authenticate::AuthPayload,
            session_request::SessionRequestRequest,
            Participant,
            Relay,
        },
    },
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    serde_json::Value,
};

/// A settled session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStruct {
    pub topic: Topic,
    pub pairing_topic: Topic,
    pub relay: Relay,
    /// Unix time in seconds.
    pub expiry: u64,
    /// Whether the peer confirmed the settlement.
    pub acknowledged: bool,
    /// Public key of the participant allowed to update the session.
    pub controller: String,
    pub namespaces: SettleNamespaces,
    #[serde(default)]
    pub required_namespaces: ProposeNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional_namespaces: Option<ProposeNamespaces>,
    #[serde(rename = "self")]
    pub self_: Participant,
    pub peer: Participant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<Value>,
}

impl SessionStruct {
    pub fn is_controller(&self) -> bool {
        self.controller == self.self_.public_key
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub expiry: Option<u64>,
    pub acknowledged: Option<bool>,
    pub namespaces: Option<SettleNamespaces>,
    pub session_properties: Option<Value>,
}

impl StoreValue for SessionStruct {
    type Key = Topic;
    type Patch = SessionPatch;

    fn key(&self) -> Topic {
        self.topic.clone()
    }

    fn to_patch(&self) -> SessionPatch {
        SessionPatch {
            expiry: (self.expiry != 0).then_some(self.expiry),
            acknowledged: self.acknowledged.then_some(true),
            namespaces: (!self.namespaces.is_empty()).then(|| self.namespaces.clone()),
            session_properties: self.session_properties.clone(),
        }
    }

    fn apply_patch(&mut self, patch: SessionPatch) {
        if let Some(expiry) = patch.expiry {
            self.expiry = expiry;
        }
        if let Some(acknowledged) = patch.acknowledged {
            self.acknowledged = acknowledged;
        }
        if let Some(namespaces) = patch.namespaces {
            self.namespaces = namespaces;
        }
        if let Some(properties) = patch.session_properties {
            self.session_properties = Some(properties);
        }
    }
}

/// A session proposal, sent or received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalStruct {
    pub id: MessageId,
    pub expiry: u64,
    pub relays: Vec<Relay>,
    pub proposer: Participant,
    pub required_namespaces: ProposeNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional_namespaces: Option<ProposeNamespaces>,
    pub pairing_topic: Topic,
    /// Set on the proposer once the responder answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_topic: Option<Topic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProposalPatch {
    pub expiry: Option<u64>,
    pub session_topic: Option<Topic>,
}

impl StoreValue for ProposalStruct {
    type Key = MessageId;
    type Patch = ProposalPatch;

    fn key(&self) -> MessageId {
        self.id
    }

    fn to_patch(&self) -> ProposalPatch {
        ProposalPatch {
            expiry: (self.expiry != 0).then_some(self.expiry),
            session_topic: self.session_topic.clone(),
        }
    }

    fn apply_patch(&mut self, patch: ProposalPatch) {
        if let Some(expiry) = patch.expiry {
            self.expiry = expiry;
        }
        if let Some(topic) = patch.session_topic {
            self.session_topic = Some(topic);
        }
    }
}

/// An inbound `wc_sessionRequest` waiting for its answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequestStruct {
    pub id: MessageId,
    pub topic: Topic,
    pub params: SessionRequestRequest,
    pub expiry: u64,
}

impl StoreValue for PendingRequestStruct {
    type Key = MessageId;
    type Patch = ();

    fn key(&self) -> MessageId {
        self.id
    }

    fn to_patch(&self) {}

    fn apply_patch(&mut self, _patch: ()) {}
}

/// An inbound `wc_sessionAuthenticate` waiting for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPendingRequest {
    pub id: MessageId,
    pub pairing_topic: Topic,
    pub requester: Participant,
    pub auth_payload: AuthPayload,
    pub expiry_timestamp: u64,
}

impl StoreValue for AuthPendingRequest {
    type Key = MessageId;
    type Patch = ();

    fn key(&self) -> MessageId {
        self.id
    }

    fn to_patch(&self) {}

    fn apply_patch(&mut self, _patch: ()) {}
}

/// A `wc_sessionAuthenticate` sent by this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequestRecord {
    pub id: MessageId,
    pub pairing_topic: Topic,
    /// Topic the responder answers on, derived from `public_key`.
    pub response_topic: Topic,
    pub public_key: String,
    pub fallback_proposal_id: MessageId,
    pub auth_payload: AuthPayload,
    pub expiry_timestamp: u64,
}

impl StoreValue for AuthRequestRecord {
    type Key = MessageId;
    type Patch = ();

    fn key(&self) -> MessageId {
        self.id
    }

    fn to_patch(&self) {}

    fn apply_patch(&mut self, _patch: ()) {}
}

/// A method carried inside `wc_sessionRequest`, e.g. `personal_sign`, with its
/// typed params and result.
pub trait SessionMethod: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Response: Serialize + DeserializeOwned + Send + Sync + 'static;

    const METHOD: &'static str;
}
