//! https://specs.walletconnect.com/2.0/specs/clients/sign/rpc-methods
//! #wc_sessionevent

use {
    super::IrnMetadata,
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

pub(crate) const IRN_REQUEST_METADATA: IrnMetadata = IrnMetadata {
    tag: 1110,
    ttl: 300,
    prompt: true,
};

pub(crate) const IRN_RESPONSE_METADATA: IrnMetadata = IrnMetadata {
    tag: 1111,
    ttl: 300,
    prompt: false,
};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub name: String,
    pub data: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEventRequest {
    pub event: Event,
    pub chain_id: String,
}

#[cfg(test)]
mod tests {
    use {super::*, crate::rpc::params::tests::param_serde_test, anyhow::Result};

    #[test]
    fn test_serde_accounts_changed_event() -> Result<()> {
        let json = r#"
        {
            "event": {
                "name": "accountsChanged",
                "data": ["0xab16a96D359eC26a11e2C2b3d8f8B8942d5Bfcdb"]
            },
            "chainId": "eip155:5"
        }
        "#;

        param_serde_test::<SessionEventRequest>(json)
    }
}
