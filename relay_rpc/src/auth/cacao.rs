//! Chain Agnostic CApability Object (CACAO) returned by wallets for
//! `wc_sessionAuthenticate`.
//!
//! https://github.com/ChainAgnostic/CAIPs/blob/main/CAIPs/caip-74.md

use {
    super::recap::merged_recap,
    serde::{Deserialize, Serialize},
};

pub const CACAO_HEADER_CAIP122: &str = "caip122";
pub const CACAO_HEADER_EIP4361: &str = "eip4361";
pub const SIGNATURE_EIP191: &str = "eip191";
pub const SIGNATURE_EIP1271: &str = "eip1271";
pub const DID_PKH_PREFIX: &str = "did:pkh:";

#[derive(Debug, thiserror::Error)]
pub enum CacaoError {
    #[error("Invalid issuer: {0}")]
    Issuer(String),
    #[error("Unsupported header type: {0}")]
    HeaderType(String),
    #[error("Unsupported signature type: {0}")]
    SignatureType(String),
    #[error("Invalid signature encoding")]
    SignatureEncoding,
    #[error("Signature does not match the issuer address")]
    Verification,
    #[error("Signature verification is not available")]
    VerificationUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacaoHeader {
    pub t: String,
}

impl Default for CacaoHeader {
    fn default() -> Self {
        Self {
            t: CACAO_HEADER_CAIP122.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CacaoPayload {
    pub domain: String,
    pub iss: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    pub aud: String,
    pub version: String,
    pub nonce: String,
    pub iat: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacaoSignature {
    pub t: String,
    pub s: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cacao {
    pub h: CacaoHeader,
    pub p: CacaoPayload,
    pub s: CacaoSignature,
}

impl CacaoPayload {
    /// `did:pkh:<namespace>:<reference>:<address>` split into its parts.
    fn issuer_parts(&self) -> Result<(&str, &str, &str), CacaoError> {
        let issuer = || CacaoError::Issuer(self.iss.clone());
        let mut parts = self
            .iss
            .strip_prefix(DID_PKH_PREFIX)
            .ok_or_else(issuer)?
            .splitn(3, ':');

        match (parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(reference), Some(address))
                if !namespace.is_empty() && !reference.is_empty() && !address.is_empty() =>
            {
                Ok((namespace, reference, address))
            }
            _ => Err(issuer()),
        }
    }

    pub fn address(&self) -> Result<&str, CacaoError> {
        self.issuer_parts().map(|(_, _, address)| address)
    }

    /// CAIP-2 chain of the issuer, e.g. `eip155:1`.
    pub fn chain_id(&self) -> Result<String, CacaoError> {
        self.issuer_parts()
            .map(|(namespace, reference, _)| format!("{namespace}:{reference}"))
    }

    /// CAIP-10 account of the issuer, e.g. `eip155:1:0xabc`.
    pub fn account(&self) -> Result<String, CacaoError> {
        self.issuer_parts()
            .map(|(namespace, reference, address)| format!("{namespace}:{reference}:{address}"))
    }

    /// Methods granted by the recap resources of this payload.
    pub fn recap_methods(&self, namespace: &str) -> Vec<String> {
        self.resources
            .as_deref()
            .and_then(merged_recap)
            .map(|recap| recap.methods(namespace))
            .unwrap_or_default()
    }

    /// EIP-4361 (SIWE) message the issuer signs.
    pub fn siwe_message(&self) -> Result<String, CacaoError> {
        let (_, reference, address) = self.issuer_parts()?;
        let recap_statement = self
            .resources
            .as_deref()
            .and_then(merged_recap)
            .map(|recap| recap.statement());
        let statement = match (&self.statement, recap_statement) {
            (Some(statement), Some(recap)) => Some(format!("{statement} {recap}")),
            (Some(statement), None) => Some(statement.clone()),
            (None, Some(recap)) => Some(recap),
            (None, None) => None,
        };

        let mut lines = vec![
            format!(
                "{} wants you to sign in with your Ethereum account:",
                self.domain
            ),
            address.to_owned(),
            String::new(),
        ];
        if let Some(statement) = statement {
            lines.push(statement);
            lines.push(String::new());
        }
        lines.push(format!("URI: {}", self.aud));
        lines.push(format!("Version: {}", self.version));
        lines.push(format!("Chain ID: {reference}"));
        lines.push(format!("Nonce: {}", self.nonce));
        lines.push(format!("Issued At: {}", self.iat));
        if let Some(exp) = &self.exp {
            lines.push(format!("Expiration Time: {exp}"));
        }
        if let Some(nbf) = &self.nbf {
            lines.push(format!("Not Before: {nbf}"));
        }
        if let Some(request_id) = &self.request_id {
            lines.push(format!("Request ID: {request_id}"));
        }
        if let Some(resources) = self.resources.as_ref().filter(|r| !r.is_empty()) {
            lines.push("Resources:".to_owned());
            lines.extend(resources.iter().map(|resource| format!("- {resource}")));
        }

        Ok(lines.join("\n"))
    }
}

impl Cacao {
    /// Verifies the signature against the issuer address.
    ///
    /// Only EIP-191 signatures are verified locally, EIP-1271 requires an
    /// on-chain call and is reported as unsupported.
    pub fn verify(&self) -> Result<(), CacaoError> {
        if self.h.t != CACAO_HEADER_CAIP122 && self.h.t != CACAO_HEADER_EIP4361 {
            return Err(CacaoError::HeaderType(self.h.t.clone()));
        }

        match self.s.t.as_str() {
            SIGNATURE_EIP191 => {
                let message = self.p.siwe_message()?;
                let signature = hex::decode(self.s.s.trim_start_matches("0x"))
                    .map_err(|_| CacaoError::SignatureEncoding)?;
                eip191::verify(&message, self.p.address()?, &signature)
            }
            other => Err(CacaoError::SignatureType(other.to_owned())),
        }
    }
}

#[cfg(feature = "cacao")]
pub mod eip191 {
    use {
        super::CacaoError,
        k256::{
            ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey},
            elliptic_curve::sec1::ToEncodedPoint,
        },
        sha3::{Digest, Keccak256},
    };

    const SIGNATURE_LENGTH: usize = 65;

    /// Keccak-256 of the EIP-191 personal message prefix and `message`.
    pub fn message_hash(message: &str) -> [u8; 32] {
        let prefixed = format!("\x19Ethereum Signed Message:\n{}{message}", message.len());
        Keccak256::digest(prefixed.as_bytes()).into()
    }

    /// `0x` prefixed lowercase address of the public key.
    pub fn address(key: &VerifyingKey) -> String {
        let encoded = key.as_affine().to_encoded_point(false);
        let hash = Keccak256::digest(encoded.as_bytes().get(1..).unwrap_or_default());
        format!("0x{}", hex::encode(hash.get(12..).unwrap_or_default()))
    }

    pub fn verify(message: &str, address: &str, signature: &[u8]) -> Result<(), CacaoError> {
        if signature.len() != SIGNATURE_LENGTH {
            return Err(CacaoError::SignatureEncoding);
        }
        let (rs, v) = signature.split_at(SIGNATURE_LENGTH - 1);
        let v = v.first().copied().ok_or(CacaoError::SignatureEncoding)?;
        let signature = Signature::try_from(rs).map_err(|_| CacaoError::SignatureEncoding)?;
        let recovery_id = RecoveryId::try_from(if v >= 27 { v - 27 } else { v })
            .map_err(|_| CacaoError::SignatureEncoding)?;

        let key =
            VerifyingKey::recover_from_prehash(&message_hash(message), &signature, recovery_id)
                .map_err(|_| CacaoError::Verification)?;

        if self::address(&key).eq_ignore_ascii_case(address) {
            Ok(())
        } else {
            Err(CacaoError::Verification)
        }
    }

    /// Produces a 65 byte `r || s || v` signature of `message`.
    pub fn sign(message: &str, key: &SigningKey) -> Result<Vec<u8>, CacaoError> {
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(&message_hash(message))
            .map_err(|_| CacaoError::SignatureEncoding)?;
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte() + 27);
        Ok(bytes)
    }
}

#[cfg(not(feature = "cacao"))]
pub mod eip191 {
    use super::CacaoError;

    pub fn verify(_message: &str, _address: &str, _signature: &[u8]) -> Result<(), CacaoError> {
        Err(CacaoError::VerificationUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::auth::recap::Recap};

    fn payload(iss: &str) -> CacaoPayload {
        CacaoPayload {
            domain: "app.example.com".to_owned(),
            iss: iss.to_owned(),
            statement: Some("Sign in to the app".to_owned()),
            aud: "https://app.example.com/login".to_owned(),
            version: "1".to_owned(),
            nonce: "32891756".to_owned(),
            iat: "2024-01-01T00:00:00Z".to_owned(),
            resources: Some(vec![Recap::from_methods("eip155", ["personal_sign"])
                .to_uri()
                .unwrap()]),
            ..Default::default()
        }
    }

    #[test]
    fn issuer_parts() {
        let payload = payload("did:pkh:eip155:1:0xABC");
        assert_eq!(payload.address().unwrap(), "0xABC");
        assert_eq!(payload.chain_id().unwrap(), "eip155:1");
        assert_eq!(payload.account().unwrap(), "eip155:1:0xABC");
        assert_eq!(payload.recap_methods("eip155"), vec!["personal_sign".to_owned()]);

        assert!(CacaoPayload {
            iss: "did:key:z6Mk".to_owned(),
            ..Default::default()
        }
        .address()
        .is_err());
    }

    #[test]
    fn siwe_message_layout() {
        let message = payload("did:pkh:eip155:1:0xABC").siwe_message().unwrap();
        let lines = message.lines().collect::<Vec<_>>();

        assert_eq!(
            lines.first().copied(),
            Some("app.example.com wants you to sign in with your Ethereum account:")
        );
        assert_eq!(lines.get(1).copied(), Some("0xABC"));
        assert!(lines
            .get(3)
            .unwrap()
            .starts_with("Sign in to the app I further authorize"));
        assert!(message.contains("\nChain ID: 1\n"));
        assert!(message.contains("\nResources:\n- urn:recap:"));
    }

    #[cfg(feature = "cacao")]
    #[test]
    fn eip191_signature_round_trip() {
        use k256::ecdsa::SigningKey;

        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let address = eip191::address(key.verifying_key());
        let payload = payload(&format!("did:pkh:eip155:1:{address}"));
        let signature = eip191::sign(&payload.siwe_message().unwrap(), &key).unwrap();

        let cacao = Cacao {
            h: CacaoHeader::default(),
            p: payload,
            s: CacaoSignature {
                t: SIGNATURE_EIP191.to_owned(),
                s: format!("0x{}", hex::encode(&signature)),
                m: None,
            },
        };
        cacao.verify().unwrap();

        let mut tampered = cacao.clone();
        tampered.p.nonce = "other".to_owned();
        assert!(matches!(tampered.verify(), Err(CacaoError::Verification)));
    }
}
