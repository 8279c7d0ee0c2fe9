//! Keychain backed crypto: X25519 key agreement, symmetric keys addressed by
//! topic, ChaCha20-Poly1305 envelopes and the relay JWT identity.

use {
    crate::{
        storage::{storage_key, KeyValueStorage, KeyValueStorageExt, CORE_CONTEXT},
        Error,
        Result,
    },
    async_trait::async_trait,
    base64::{prelude::BASE64_STANDARD, DecodeError, Engine},
    chacha20poly1305::{
        aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
        ChaCha20Poly1305,
        Nonce,
    },
    hkdf::Hkdf,
    rand::RngCore,
    relay_rpc::{
        auth::{
            ed25519_dalek::SigningKey,
            encode_did_key,
            AuthToken,
            SerializedAuthToken,
            DEFAULT_TOKEN_TTL,
        },
        domain::Topic,
    },
    serde::{Deserialize, Serialize},
    sha2::Sha256,
    std::{collections::BTreeMap, fmt::Debug, string::FromUtf8Error, sync::Arc},
    tokio::sync::{Mutex, MutexGuard},
    tracing::debug,
    x25519_dalek::{PublicKey, StaticSecret},
};

// https://specs.walletconnect.com/2.0/specs/clients/core/crypto/
// crypto-envelopes
const TYPE_0: u8 = 0;
const TYPE_1: u8 = 1;
const TYPE_LENGTH: usize = 1;
const INIT_VEC_LEN: usize = 12;
const PUB_KEY_LENGTH: usize = 32;
const SYM_KEY_LENGTH: usize = 32;

const STORAGE_NAME: &str = "keychain";

pub type InitVec = [u8; INIT_VEC_LEN];
pub type SymKey = [u8; SYM_KEY_LENGTH];
pub type PubKey = [u8; PUB_KEY_LENGTH];

/// Payload encoding, decoding, encryption and decryption errors.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Payload is not base64 encoded")]
    Base64Decode(#[from] DecodeError),
    #[error("Payload decryption failure: {0}")]
    Decryption(String),
    #[error("Payload encryption failure: {0}")]
    Encryption(String),
    #[error("Invalid Initialization Vector length={0}")]
    InitVecLen(usize),
    #[error("Invalid symmetrical key length={0}")]
    SymKeyLen(usize),
    #[error("Payload does not fit initialization vector (index: {0}..{1})")]
    ParseInitVecLen(usize, usize),
    #[error("Payload does not fit sender public key (index: {0}..{1})")]
    ParseSenderPublicKeyLen(usize, usize),
    #[error("Payload is not a valid JSON encoding")]
    PayloadJson(#[from] FromUtf8Error),
    #[error("Empty payload")]
    Empty,
    #[error("Unsupported envelope type={0}")]
    UnsupportedEnvelopeType(u8),
    #[error("Missing receiver public key for a type 1 envelope")]
    MissingReceiverKey,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvelopeType<'a> {
    Type0,
    Type1 { sender_public_key: &'a PubKey },
}

/// Non-owning view of a base64-decoded envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub envelope_type: EnvelopeType<'a>,
    pub init_vec: &'a InitVec,
    /// Encrypted payload.
    pub sealed: &'a [u8],
}

impl<'a> Envelope<'a> {
    pub fn parse(data: &'a [u8]) -> std::result::Result<Self, PayloadError> {
        let (&envelope_type, rest) = data.split_first().ok_or(PayloadError::Empty)?;
        let (envelope_type, rest, init_vec_start) = match envelope_type {
            TYPE_0 => (EnvelopeType::Type0, rest, TYPE_LENGTH),
            TYPE_1 => {
                let key_end = TYPE_LENGTH + PUB_KEY_LENGTH;
                let sender_public_key = rest
                    .get(..PUB_KEY_LENGTH)
                    .and_then(|key| key.try_into().ok())
                    .ok_or(PayloadError::ParseSenderPublicKeyLen(TYPE_LENGTH, key_end))?;
                let rest = rest.get(PUB_KEY_LENGTH..).unwrap_or_default();
                (EnvelopeType::Type1 { sender_public_key }, rest, key_end)
            }
            other => return Err(PayloadError::UnsupportedEnvelopeType(other)),
        };

        let init_vec_end = init_vec_start + INIT_VEC_LEN;
        let init_vec = rest
            .get(..INIT_VEC_LEN)
            .and_then(|iv| iv.try_into().ok())
            .ok_or(PayloadError::ParseInitVecLen(init_vec_start, init_vec_end))?;

        Ok(Self {
            envelope_type,
            init_vec,
            sealed: rest.get(INIT_VEC_LEN..).unwrap_or_default(),
        })
    }
}

/// Encrypts and encodes the plain-text payload.
pub fn encrypt_and_encode<T>(
    envelope_type: EnvelopeType,
    msg: T,
    key: &SymKey,
) -> std::result::Result<String, PayloadError>
where
    T: AsRef<[u8]>,
{
    let payload = Payload {
        msg: msg.as_ref(),
        aad: &[],
    };
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

    let cipher = ChaCha20Poly1305::new(key.into());
    let sealed = cipher
        .encrypt(&nonce, payload)
        .map_err(|e| PayloadError::Encryption(e.to_string()))?;

    let init_vec: &InitVec = nonce
        .as_slice()
        .try_into()
        .map_err(|_| PayloadError::InitVecLen(nonce.len()))?;

    Ok(match envelope_type {
        EnvelopeType::Type0 => {
            BASE64_STANDARD.encode([&[TYPE_0], init_vec.as_slice(), &sealed].concat())
        }
        EnvelopeType::Type1 { sender_public_key } => BASE64_STANDARD
            .encode([&[TYPE_1], sender_public_key.as_slice(), init_vec, &sealed].concat()),
    })
}

/// Decrypts the payload of a parsed envelope.
pub fn decrypt(envelope: &Envelope<'_>, key: &SymKey) -> std::result::Result<String, PayloadError> {
    let payload = Payload {
        msg: envelope.sealed,
        aad: &[],
    };
    let cipher = ChaCha20Poly1305::new(key.into());
    let unsealed = cipher
        .decrypt(Nonce::from_slice(envelope.init_vec), payload)
        .map_err(|e| PayloadError::Decryption(e.to_string()))?;

    Ok(String::from_utf8(unsealed)?)
}

/// Hex encoded 32 random bytes, used for symmetric keys and JWT subjects.
pub fn generate_random_bytes32() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Public keys of a type 1 envelope. The payload is encrypted with the key
/// shared between the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type1Keys {
    pub sender_public_key: String,
    pub receiver_public_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    pub type1: Option<Type1Keys>,
}

impl EncodeOptions {
    pub fn type1(sender_public_key: impl Into<String>, receiver_public_key: impl Into<String>) -> Self {
        Self {
            type1: Some(Type1Keys {
                sender_public_key: sender_public_key.into(),
                receiver_public_key: receiver_public_key.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Own public key a type 1 envelope is addressed to.
    pub receiver_public_key: Option<String>,
}

/// Key management and payload encryption used by every client component.
#[async_trait]
pub trait Crypto: Debug + Send + Sync {
    /// `did:key` of the client identity.
    async fn client_id(&self) -> Result<String>;

    /// Whether a symmetric key is stored for `tag` (a topic) or a key pair for
    /// `tag` (a public key).
    async fn has_keys(&self, tag: &str) -> bool;

    /// Stores the hex encoded symmetric key, under `override_topic` or the
    /// topic derived from the key.
    async fn set_sym_key(&self, sym_key: &str, override_topic: Option<Topic>) -> Result<Topic>;

    /// Generates an X25519 key pair and returns its hex encoded public key.
    async fn generate_key_pair(&self) -> Result<String>;

    /// Derives and stores the key shared between our `self_public_key` and
    /// `peer_public_key`.
    async fn generate_shared_key(
        &self,
        self_public_key: &str,
        peer_public_key: &str,
        override_topic: Option<Topic>,
    ) -> Result<Topic>;

    async fn encode(&self, topic: &Topic, payload: &str, options: &EncodeOptions) -> Result<String>;

    async fn decode(&self, topic: &Topic, message: &str, options: &DecodeOptions) -> Result<String>;

    async fn sign_jwt(&self, aud: &str) -> Result<SerializedAuthToken>;

    async fn delete_sym_key(&self, topic: &Topic) -> Result<()>;

    async fn delete_key_pair(&self, public_key: &str) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyChain {
    #[serde(default)]
    sym_keys: BTreeMap<Topic, String>,
    /// Public key hex to private key hex.
    #[serde(default)]
    key_pairs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identity: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    keychain: KeyChain,
    loaded: bool,
}

/// [`Crypto`] implementation keeping its keys in a persisted keychain.
#[derive(Debug)]
pub struct KeyChainCrypto {
    storage_key: String,
    storage: Arc<dyn KeyValueStorage>,
    state: Mutex<State>,
}

impl KeyChainCrypto {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            storage_key: storage_key(CORE_CONTEXT, STORAGE_NAME),
            storage,
            state: Mutex::default(),
        }
    }

    /// Restores the keychain and creates the client identity on first use.
    pub async fn init(&self) -> Result<()> {
        self.state().await.map(|_| ())
    }

    async fn state(&self) -> Result<MutexGuard<'_, State>> {
        let mut state = self.state.lock().await;
        if state.loaded {
            return Ok(state);
        }

        let mut keychain: KeyChain = self
            .storage
            .get_typed(&self.storage_key)
            .await?
            .unwrap_or_default();
        if keychain.identity.is_none() {
            keychain.identity = Some(generate_random_bytes32());
            self.storage.set_typed(&self.storage_key, &keychain).await?;
        }

        state.keychain = keychain;
        state.loaded = true;
        Ok(state)
    }

    async fn with_keychain<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&KeyChain) -> Result<T> + Send,
    {
        f(&self.state().await?.keychain)
    }

    async fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut KeyChain) + Send,
    {
        let mut state = self.state().await?;
        f(&mut state.keychain);
        self.storage
            .set_typed(&self.storage_key, &state.keychain)
            .await
    }

    async fn signing_key(&self) -> Result<SigningKey> {
        self.with_keychain(|keychain| {
            let seed = keychain
                .identity
                .as_deref()
                .ok_or_else(|| Error::InvalidKey("missing identity".to_owned()))?;
            Ok(SigningKey::from_bytes(&decode_key(seed)?))
        })
        .await
    }

    async fn sym_key(&self, topic: &Topic) -> Result<SymKey> {
        self.with_keychain(|keychain| {
            keychain
                .sym_keys
                .get(topic)
                .ok_or_else(|| Error::not_found("sym key", topic))
                .and_then(|key| decode_key(key))
        })
        .await
    }
}

#[async_trait]
impl Crypto for KeyChainCrypto {
    async fn client_id(&self) -> Result<String> {
        Ok(encode_did_key(&self.signing_key().await?.verifying_key()))
    }

    async fn has_keys(&self, tag: &str) -> bool {
        self.with_keychain(|keychain| {
            Ok(keychain.sym_keys.contains_key(&Topic::from(tag))
                || keychain.key_pairs.contains_key(tag))
        })
        .await
        .unwrap_or(false)
    }

    async fn set_sym_key(&self, sym_key: &str, override_topic: Option<Topic>) -> Result<Topic> {
        let key = decode_key(sym_key)?;
        let topic = override_topic.unwrap_or_else(|| Topic::from_key(&key));
        let stored = topic.clone();
        self.mutate(move |keychain| {
            keychain.sym_keys.insert(stored, hex::encode(key));
        })
        .await?;

        debug!(%topic, "sym key set");
        Ok(topic)
    }

    async fn generate_key_pair(&self) -> Result<String> {
        let mut private = [0u8; 32];
        OsRng.fill_bytes(&mut private);
        let secret = StaticSecret::from(private);
        let public_key = hex::encode(PublicKey::from(&secret).as_bytes());

        let stored = public_key.clone();
        let private = hex::encode(secret.to_bytes());
        self.mutate(move |keychain| {
            keychain.key_pairs.insert(stored, private);
        })
        .await?;

        Ok(public_key)
    }

    async fn generate_shared_key(
        &self,
        self_public_key: &str,
        peer_public_key: &str,
        override_topic: Option<Topic>,
    ) -> Result<Topic> {
        let private = self
            .with_keychain(|keychain| {
                keychain
                    .key_pairs
                    .get(self_public_key)
                    .ok_or_else(|| Error::not_found("key pair", self_public_key))
                    .and_then(|key| decode_key(key))
            })
            .await?;

        let peer = PublicKey::from(decode_key(peer_public_key)?);
        let shared = StaticSecret::from(private).diffie_hellman(&peer);

        let mut sym_key = [0u8; SYM_KEY_LENGTH];
        Hkdf::<Sha256>::new(None, shared.as_bytes())
            .expand(&[], &mut sym_key)
            .map_err(|e| Error::InvalidKey(e.to_string()))?;

        self.set_sym_key(&hex::encode(sym_key), override_topic).await
    }

    async fn encode(&self, topic: &Topic, payload: &str, options: &EncodeOptions) -> Result<String> {
        match &options.type1 {
            None => {
                let key = self.sym_key(topic).await?;
                Ok(encrypt_and_encode(EnvelopeType::Type0, payload, &key)?)
            }
            Some(keys) => {
                let shared_topic = self
                    .generate_shared_key(&keys.sender_public_key, &keys.receiver_public_key, None)
                    .await?;
                let key = self.sym_key(&shared_topic).await?;
                let sender_public_key: PubKey = decode_key(&keys.sender_public_key)?;
                Ok(encrypt_and_encode(
                    EnvelopeType::Type1 {
                        sender_public_key: &sender_public_key,
                    },
                    payload,
                    &key,
                )?)
            }
        }
    }

    async fn decode(&self, topic: &Topic, message: &str, options: &DecodeOptions) -> Result<String> {
        let data = BASE64_STANDARD
            .decode(message)
            .map_err(PayloadError::from)?;
        let envelope = Envelope::parse(&data)?;

        let key = match envelope.envelope_type {
            EnvelopeType::Type0 => self.sym_key(topic).await?,
            EnvelopeType::Type1 { sender_public_key } => {
                let receiver_public_key = options
                    .receiver_public_key
                    .as_deref()
                    .ok_or(PayloadError::MissingReceiverKey)?;
                let shared_topic = self
                    .generate_shared_key(receiver_public_key, &hex::encode(sender_public_key), None)
                    .await?;
                self.sym_key(&shared_topic).await?
            }
        };

        Ok(decrypt(&envelope, &key)?)
    }

    async fn sign_jwt(&self, aud: &str) -> Result<SerializedAuthToken> {
        let key = self.signing_key().await?;
        Ok(AuthToken::new(generate_random_bytes32())
            .aud(aud)
            .ttl(DEFAULT_TOKEN_TTL)
            .as_jwt(&key)?)
    }

    async fn delete_sym_key(&self, topic: &Topic) -> Result<()> {
        self.mutate(|keychain| {
            keychain.sym_keys.remove(topic);
        })
        .await
    }

    async fn delete_key_pair(&self, public_key: &str) -> Result<()> {
        self.mutate(|keychain| {
            keychain.key_pairs.remove(public_key);
        })
        .await
    }
}

fn decode_key(key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(key).map_err(|e| Error::InvalidKey(e.to_string()))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| Error::InvalidKey(PayloadError::SymKeyLen(len).to_string()))
}
