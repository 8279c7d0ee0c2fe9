//! https://specs.walletconnect.com/2.0/specs/clients/sign/rpc-methods
//! #wc_sessionpropose

use {
    super::{
        namespaces::ProposeNamespaces,
        IrnMetadata,
        Participant,
        Relay,
    },
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

pub(crate) const IRN_REQUEST_METADATA: IrnMetadata = IrnMetadata {
    tag: 1100,
    ttl: 300,
    prompt: true,
};

pub(crate) const IRN_RESPONSE_METADATA: IrnMetadata = IrnMetadata {
    tag: 1101,
    ttl: 300,
    prompt: false,
};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposeRequest {
    pub relays: Vec<Relay>,
    pub proposer: Participant,
    pub required_namespaces: ProposeNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional_namespaces: Option<ProposeNamespaces>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_timestamp: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposeResponse {
    pub relay: Relay,
    pub responder_public_key: String,
}

#[cfg(test)]
mod tests {
    use {super::*, crate::rpc::params::tests::param_serde_test, anyhow::Result};

    #[test]
    fn test_serde_session_propose_request() -> Result<()> {
        let json = r#"
        {
            "relays": [
                {
                    "protocol": "irn"
                }
            ],
            "proposer": {
                "publicKey": "a3ad5e26070ddb2809200c6f56e739333512015bceeadbb8ea1731c4c7ddb207",
                "metadata": {
                    "name": "React App",
                    "description": "React App for WalletConnect",
                    "url": "http://localhost:3000",
                    "icons": [
                        "https://avatars.githubusercontent.com/u/37784886"
                    ]
                }
            },
            "requiredNamespaces": {
                "eip155": {
                    "chains": [
                        "eip155:5"
                    ],
                    "methods": [
                        "eth_sendTransaction",
                        "personal_sign"
                    ],
                    "events": [
                        "accountsChanged",
                        "chainChanged"
                    ]
                }
            },
            "expiryTimestamp": 1675758272
        }
        "#;

        param_serde_test::<SessionProposeRequest>(json)
    }

    #[test]
    fn test_serde_session_propose_response() -> Result<()> {
        let json = r#"
        {
            "relay": {
                "protocol": "irn"
            },
            "responderPublicKey": "7ff3e362f825ab868e20e767fe580d0311181632707e7c878cbeca0238d45b8b"
        }
        "#;

        param_serde_test::<SessionProposeResponse>(json)
    }
}
