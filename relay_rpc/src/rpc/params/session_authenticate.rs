//! https://specs.walletconnect.com/2.0/specs/clients/sign/rpc-methods
//! #wc_sessionauthenticate

use {
    super::{IrnMetadata, Participant},
    crate::auth::cacao::Cacao,
    serde::{Deserialize, Serialize},
};

pub(crate) const IRN_REQUEST_METADATA: IrnMetadata = IrnMetadata {
    tag: 1116,
    ttl: 3600,
    prompt: true,
};

pub(crate) const IRN_RESPONSE_METADATA: IrnMetadata = IrnMetadata {
    tag: 1117,
    ttl: 3600,
    prompt: false,
};

/// SIWE request parameters the responder signs, one CACAO per chain.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    #[serde(rename = "type", default = "AuthPayload::default_type")]
    pub type_: String,
    pub chains: Vec<String>,
    pub domain: String,
    pub aud: String,
    pub nonce: String,
    pub version: String,
    pub iat: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
}

impl AuthPayload {
    pub const TYPE_EIP4361: &'static str = "eip4361";

    fn default_type() -> String {
        Self::TYPE_EIP4361.to_owned()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionAuthenticateRequest {
    pub requester: Participant,
    pub auth_payload: AuthPayload,
    pub expiry_timestamp: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionAuthenticateResponse {
    pub cacaos: Vec<Cacao>,
    pub responder: Participant,
}
