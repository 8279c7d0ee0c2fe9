//! https://specs.walletconnect.com/2.0/specs/clients/sign/rpc-methods
//! #wc_sessionsettle

use {
    super::{
        namespaces::{ProposeNamespaces, SettleNamespaces},
        IrnMetadata,
        Participant,
        Relay,
    },
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

pub(crate) const IRN_REQUEST_METADATA: IrnMetadata = IrnMetadata {
    tag: 1102,
    ttl: 300,
    prompt: false,
};

pub(crate) const IRN_RESPONSE_METADATA: IrnMetadata = IrnMetadata {
    tag: 1103,
    ttl: 300,
    prompt: false,
};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettleRequest {
    pub relay: Relay,
    pub controller: Participant,
    pub namespaces: SettleNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_namespaces: Option<ProposeNamespaces>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<Value>,
    /// Unix timestamp.
    ///
    /// Expiry should be between .now() + TTL.
    pub expiry: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_topic: Option<String>,
}

#[cfg(test)]
mod tests {
    use {super::*, crate::rpc::params::tests::param_serde_test, anyhow::Result};

    #[test]
    fn test_serde_session_settle_request() -> Result<()> {
        let json = r#"
        {
            "relay": {
                "protocol": "irn"
            },
            "controller": {
                "publicKey": "a3ad5e26070ddb2809200c6f56e739333512015bceeadbb8ea1731c4c7ddb207",
                "metadata": {
                    "name": "Wallet",
                    "description": "Wallet",
                    "url": "https://example.com",
                    "icons": []
                }
            },
            "namespaces": {
                "eip155": {
                    "accounts": [
                        "eip155:5:0xBA5BA3955463ADcc7aa3E33bbdfb8A68e0933dD8"
                    ],
                    "methods": [
                        "eth_sendTransaction",
                        "personal_sign"
                    ],
                    "events": [
                        "accountsChanged"
                    ]
                }
            },
            "expiry": 1675734962
        }
        "#;

        param_serde_test::<SessionSettleRequest>(json)
    }
}
