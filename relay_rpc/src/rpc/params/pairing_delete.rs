//! https://specs.walletconnect.com/2.0/specs/clients/core/pairing/rpc-methods
//! #wc_pairingdelete

use {
    super::{IrnMetadata, SdkErrorKind},
    serde::{Deserialize, Serialize},
};

pub(crate) const IRN_REQUEST_METADATA: IrnMetadata = IrnMetadata {
    tag: 1000,
    ttl: 86400,
    prompt: false,
};

pub(crate) const IRN_RESPONSE_METADATA: IrnMetadata = IrnMetadata {
    tag: 1001,
    ttl: 86400,
    prompt: false,
};

#[derive(Debug, Serialize, PartialEq, Eq, Hash, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PairingDeleteRequest {
    pub code: i64,
    pub message: String,
}

impl From<SdkErrorKind> for PairingDeleteRequest {
    fn from(kind: SdkErrorKind) -> Self {
        Self {
            code: kind.code() as i64,
            message: kind.message().to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::rpc::params::tests::param_serde_test, anyhow::Result};

    #[test]
    fn test_serde_pairing_delete_request() -> Result<()> {
        let json = r#"
        {
            "code": 6000,
            "message": "User disconnected."
        }
        "#;

        param_serde_test::<PairingDeleteRequest>(json)
    }

    #[test]
    fn disconnect_reason() {
        let request = PairingDeleteRequest::from(SdkErrorKind::UserDisconnected);
        assert_eq!(request.code, 6000);
    }
}
