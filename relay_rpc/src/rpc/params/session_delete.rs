//! https://specs.walletconnect.com/2.0/specs/clients/sign/rpc-methods
//! #wc_sessiondelete

use {
    super::{IrnMetadata, SdkErrorKind},
    serde::{Deserialize, Serialize},
};

pub(crate) const IRN_REQUEST_METADATA: IrnMetadata = IrnMetadata {
    tag: 1112,
    ttl: 86400,
    prompt: false,
};

pub(crate) const IRN_RESPONSE_METADATA: IrnMetadata = IrnMetadata {
    tag: 1113,
    ttl: 86400,
    prompt: false,
};

#[derive(Debug, Serialize, PartialEq, Eq, Hash, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionDeleteRequest {
    pub code: i64,
    pub message: String,
}

impl From<SdkErrorKind> for SessionDeleteRequest {
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
    fn test_serde_session_delete_request() -> Result<()> {
        let json = r#"
        {
            "code": 6000,
            "message": "User disconnected."
        }
        "#;

        param_serde_test::<SessionDeleteRequest>(json)?;

        let request: SessionDeleteRequest = serde_json::from_str(json)?;
        assert_eq!(request, SdkErrorKind::UserDisconnected.into());
        Ok(())
    }
}
