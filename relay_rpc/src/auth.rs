//! Relay client authentication: Ed25519 `did:key` identities and the JWT the
//! relay expects in the `auth` query parameter.
//!
//! https://specs.walletconnect.com/2.0/specs/clients/core/relay/relay-client-auth

use {
    chrono::{DateTime, Utc},
    data_encoding::BASE64URL_NOPAD,
    derive_more::{AsRef, Display, From},
    ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey},
    serde::{Deserialize, Serialize},
    std::time::Duration,
};

pub use ed25519_dalek;

pub mod cacao;
pub mod recap;

pub const RELAY_WEBSOCKET_ADDRESS: &str = "wss://relay.walletconnect.com";
pub const DEFAULT_TOKEN_AUD: &str = RELAY_WEBSOCKET_ADDRESS;
pub const DID_DELIMITER: &str = ":";
pub const DID_PREFIX: &str = "did";
pub const DID_METHOD_KEY: &str = "key";
pub const MULTICODEC_ED25519_BASE: &str = "z";
pub const MULTICODEC_ED25519_HEADER: [u8; 2] = [0xed, 0x01];
pub const MULTICODEC_ED25519_LENGTH: usize = 32;
pub const JWT_DELIMITER: &str = ".";
pub const JWT_HEADER_TYP: &str = "JWT";
pub const JWT_HEADER_ALG: &str = "EdDSA";

/// Default token lifetime when none is set on the builder.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid JWT format")]
    Format,
    #[error("Invalid JWT encoding")]
    Encoding,
    #[error("Invalid JWT header")]
    Header,
    #[error("JWT token expired")]
    Expired,
    #[error("Invalid signature")]
    Signature,
    #[error("Invalid issuer DID prefix")]
    IssuerPrefix,
    #[error("Invalid issuer DID method")]
    IssuerMethod,
    #[error("Invalid issuer format")]
    IssuerFormat,
    #[error("Invalid issuer public key length")]
    IssuerPublicKeyLength,
    #[error("Invalid issuer public key")]
    IssuerPublicKey,
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Serialized JWT, ready to be sent to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, AsRef)]
#[serde(transparent)]
#[as_ref(forward)]
pub struct SerializedAuthToken(String);

impl SerializedAuthToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtHeader {
    pub typ: String,
    pub alg: String,
}

impl Default for JwtHeader {
    fn default() -> Self {
        Self {
            typ: JWT_HEADER_TYP.to_owned(),
            alg: JWT_HEADER_ALG.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Relay auth token builder.
#[derive(Debug, Clone)]
pub struct AuthToken {
    sub: String,
    aud: Option<String>,
    iat: Option<DateTime<Utc>>,
    ttl: Option<Duration>,
}

impl AuthToken {
    pub fn new(sub: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            aud: None,
            iat: None,
            ttl: None,
        }
    }

    pub fn aud(mut self, aud: impl Into<String>) -> Self {
        self.aud = Some(aud.into());
        self
    }

    pub fn iat(mut self, iat: impl Into<Option<DateTime<Utc>>>) -> Self {
        self.iat = iat.into();
        self
    }

    pub fn ttl(mut self, ttl: impl Into<Option<Duration>>) -> Self {
        self.ttl = ttl.into();
        self
    }

    pub fn as_jwt(&self, key: &SigningKey) -> Result<SerializedAuthToken, AuthError> {
        let iat = self.iat.unwrap_or_else(Utc::now).timestamp();
        let ttl = self.ttl.unwrap_or(DEFAULT_TOKEN_TTL).as_secs() as i64;
        let claims = JwtClaims {
            iss: encode_did_key(&key.verifying_key()),
            sub: self.sub.clone(),
            aud: self
                .aud
                .clone()
                .unwrap_or_else(|| DEFAULT_TOKEN_AUD.to_owned()),
            iat,
            exp: iat + ttl,
        };

        encode_jwt(&claims, key)
    }
}

fn encode_jwt(claims: &JwtClaims, key: &SigningKey) -> Result<SerializedAuthToken, AuthError> {
    let header = BASE64URL_NOPAD.encode(serde_json::to_string(&JwtHeader::default())?.as_bytes());
    let claims = BASE64URL_NOPAD.encode(serde_json::to_string(claims)?.as_bytes());
    let message = format!("{header}{JWT_DELIMITER}{claims}");
    let signature = BASE64URL_NOPAD.encode(&key.sign(message.as_bytes()).to_bytes());

    Ok(SerializedAuthToken(format!(
        "{message}{JWT_DELIMITER}{signature}"
    )))
}

/// Decodes the JWT, checks the signature against the issuer `did:key` and the
/// expiration, returning the claims.
pub fn verify_jwt(token: &str) -> Result<JwtClaims, AuthError> {
    let mut parts = token.splitn(3, JWT_DELIMITER);
    let (Some(header), Some(claims), Some(signature)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::Format);
    };

    let decoded_header: JwtHeader = serde_json::from_slice(
        &BASE64URL_NOPAD
            .decode(header.as_bytes())
            .map_err(|_| AuthError::Encoding)?,
    )?;
    if decoded_header.alg != JWT_HEADER_ALG || decoded_header.typ != JWT_HEADER_TYP {
        return Err(AuthError::Header);
    }

    let decoded_claims: JwtClaims = serde_json::from_slice(
        &BASE64URL_NOPAD
            .decode(claims.as_bytes())
            .map_err(|_| AuthError::Encoding)?,
    )?;

    let signature = BASE64URL_NOPAD
        .decode(signature.as_bytes())
        .map_err(|_| AuthError::Encoding)?;
    let signature = Signature::from_slice(&signature).map_err(|_| AuthError::Signature)?;
    let public_key = decode_did_key(&decoded_claims.iss)?;
    public_key
        .verify(format!("{header}{JWT_DELIMITER}{claims}").as_bytes(), &signature)
        .map_err(|_| AuthError::Signature)?;

    if decoded_claims.exp <= Utc::now().timestamp() {
        return Err(AuthError::Expired);
    }

    Ok(decoded_claims)
}

/// Encodes the Ed25519 public key as `did:key:z<base58(multicodec || key)>`.
pub fn encode_did_key(public_key: &VerifyingKey) -> String {
    let mut data = Vec::with_capacity(MULTICODEC_ED25519_HEADER.len() + MULTICODEC_ED25519_LENGTH);
    data.extend_from_slice(&MULTICODEC_ED25519_HEADER);
    data.extend_from_slice(public_key.as_bytes());

    format!(
        "{DID_PREFIX}{DID_DELIMITER}{DID_METHOD_KEY}{DID_DELIMITER}{MULTICODEC_ED25519_BASE}{}",
        bs58::encode(data).into_string()
    )
}

pub fn decode_did_key(did: &str) -> Result<VerifyingKey, AuthError> {
    let mut parts = did.splitn(3, DID_DELIMITER);

    if parts.next() != Some(DID_PREFIX) {
        return Err(AuthError::IssuerPrefix);
    }
    if parts.next() != Some(DID_METHOD_KEY) {
        return Err(AuthError::IssuerMethod);
    }

    let encoded = parts
        .next()
        .and_then(|key| key.strip_prefix(MULTICODEC_ED25519_BASE))
        .ok_or(AuthError::IssuerFormat)?;
    let decoded = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| AuthError::IssuerFormat)?;
    let key = decoded
        .strip_prefix(&MULTICODEC_ED25519_HEADER)
        .ok_or(AuthError::IssuerFormat)?;
    let key: [u8; MULTICODEC_ED25519_LENGTH] = key
        .try_into()
        .map_err(|_| AuthError::IssuerPublicKeyLength)?;

    VerifyingKey::from_bytes(&key).map_err(|_| AuthError::IssuerPublicKey)
}

#[cfg(test)]
mod tests {
    use {super::*, rand::rngs::OsRng};

    #[test]
    fn did_key_round_trip() {
        let key = SigningKey::generate(&mut OsRng);
        let did = encode_did_key(&key.verifying_key());
        assert!(did.starts_with("did:key:z"));
        assert_eq!(decode_did_key(&did).unwrap(), key.verifying_key());
    }

    #[test]
    fn jwt_is_verifiable() {
        let key = SigningKey::generate(&mut OsRng);
        let jwt = AuthToken::new("http://example.com")
            .aud(RELAY_WEBSOCKET_ADDRESS)
            .ttl(Duration::from_secs(60 * 60))
            .as_jwt(&key)
            .unwrap();

        let claims = verify_jwt(jwt.as_str()).unwrap();
        assert_eq!(claims.sub, "http://example.com");
        assert_eq!(claims.aud, RELAY_WEBSOCKET_ADDRESS);
        assert_eq!(claims.iss, encode_did_key(&key.verifying_key()));
    }

    #[test]
    fn expired_jwt_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let jwt = AuthToken::new("http://example.com")
            .iat(Utc::now() - chrono::Duration::hours(2))
            .ttl(Duration::from_secs(60))
            .as_jwt(&key)
            .unwrap();

        assert!(matches!(
            verify_jwt(jwt.as_str()),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn tampered_jwt_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let jwt = AuthToken::new("sub").as_jwt(&key).unwrap();
        let forged = AuthToken::new("sub").as_jwt(&other).unwrap();

        let (head, _) = jwt.as_str().rsplit_once('.').unwrap();
        let (_, sig) = forged.as_str().rsplit_once('.').unwrap();
        assert!(verify_jwt(&format!("{head}.{sig}")).is_err());
    }
}
