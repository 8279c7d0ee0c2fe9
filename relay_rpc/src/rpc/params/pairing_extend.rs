//! https://specs.walletconnect.com/2.0/specs/clients/core/pairing/rpc-methods
//! #wc_pairingextend

use {
    super::IrnMetadata,
    serde::{Deserialize, Serialize},
};

pub(crate) const IRN_REQUEST_METADATA: IrnMetadata = IrnMetadata {
    tag: 1004,
    ttl: 86400,
    prompt: false,
};

pub(crate) const IRN_RESPONSE_METADATA: IrnMetadata = IrnMetadata {
    tag: 1005,
    ttl: 86400,
    prompt: false,
};

#[derive(Debug, Serialize, PartialEq, Eq, Hash, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PairingExtendRequest {
    /// New expiry of the pairing, unix seconds.
    pub expiry: u64,
}

#[cfg(test)]
mod tests {
    use {super::*, crate::rpc::params::tests::param_serde_test, anyhow::Result};

    #[test]
    fn test_serde_pairing_extend_request() -> Result<()> {
        let json = r#"
        {
            "expiry": 1700000000
        }
        "#;

        param_serde_test::<PairingExtendRequest>(json)
    }
}
