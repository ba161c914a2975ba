//! Credential protection for managed bot instances.
//!
//! Tokens are sealed with ChaCha20-Poly1305 AEAD. The owning instance id is
//! fed in as associated data, so a ciphertext copied onto another instance
//! fails authentication instead of decrypting. At `Standard` and `High`
//! levels the metadata also carries an HMAC-SHA256 integrity tag computed
//! with a separate derived key; it can be checked without attempting a full
//! decrypt. `High` seals each token with its own data key, which is wrapped
//! by an external [`KeyWrapper`].
//!
//! Keys and plaintext tokens are zeroed from memory on drop via `zeroize`.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, CHACHA20_POLY1305,
};
use ring::error::Unspecified;
use ring::rand::{SecureRandom, SystemRandom};
use ring::{hkdf, hmac};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::FleetError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Size of ChaCha20-Poly1305 key in bytes (256 bits)
const KEY_LEN: usize = 32;

/// Size of nonce in bytes (96 bits)
const NONCE_LEN: usize = 12;

/// Size of authentication tag appended to ciphertext (128 bits)
const TAG_LEN: usize = 16;

const KDF_SALT: &[u8] = b"subfleet/token-security";
const CIPHER_KEY_INFO: &[u8] = b"subfleet/credential-cipher/v1";
const MAC_KEY_INFO: &[u8] = b"subfleet/credential-integrity/v1";
const TAG_DOMAIN: &[u8] = b"subfleet-tag-v1";

// ---------------------------------------------------------------------------
// Error Types
// ---------------------------------------------------------------------------

/// Errors that can occur during credential protection.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Failed to generate random bytes from system entropy.
    #[error("failed to generate random bytes")]
    RandomGeneration,

    /// Sealing or key derivation failed.
    #[error("encryption failed")]
    Encryption,

    /// The credential was issued for a different instance.
    #[error("credential is bound to instance {bound}, not {requested}")]
    BindingMismatch { bound: Uuid, requested: Uuid },

    /// The metadata integrity tag does not match the stored ciphertext.
    #[error("integrity tag mismatch")]
    TagMismatch,

    /// The AEAD authentication tag did not verify.
    #[error("authentication tag verification failed")]
    Authentication,

    /// Invalid input format (e.g., ciphertext too short).
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// The key-management collaborator failed or is missing.
    #[error("key wrapping failed: {0}")]
    KeyWrap(String),
}

impl CryptoError {
    /// Whether this failure means the credential was tampered with or
    /// replayed against the wrong instance.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            CryptoError::BindingMismatch { .. }
                | CryptoError::TagMismatch
                | CryptoError::Authentication
        )
    }
}

impl From<Unspecified> for CryptoError {
    fn from(_: Unspecified) -> Self {
        CryptoError::Encryption
    }
}

impl From<CryptoError> for FleetError {
    fn from(err: CryptoError) -> Self {
        if err.is_integrity_failure() {
            return FleetError::Integrity(err.to_string());
        }
        match err {
            CryptoError::RandomGeneration | CryptoError::Encryption => {
                FleetError::Unknown(err.to_string())
            }
            other => FleetError::Decrypt(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Key Management
// ---------------------------------------------------------------------------

/// A cryptographic key that is automatically zeroed from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_LEN],
}

impl EncryptionKey {
    /// Generate a new random encryption key using system entropy.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; KEY_LEN];
        rng.fill(&mut bytes)
            .map_err(|_| CryptoError::RandomGeneration)?;
        Ok(Self { bytes })
    }

    /// Create an encryption key from existing bytes (exactly 32).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_LEN];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Parse a hex-encoded 32-byte key.
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let mut raw = hex::decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidFormat(format!("key is not valid hex: {e}")))?;
        let key = Self::from_bytes(&raw);
        raw.zeroize();
        key
    }

    /// Hex encoding of the raw key, for writing key files.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Use with caution - the returned slice exposes the raw key material.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Derive an independent subkey with HKDF-SHA256.
    fn derive(&self, info: &'static [u8]) -> Result<EncryptionKey, CryptoError> {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, KDF_SALT);
        let prk = salt.extract(&self.bytes);
        let info = [info];
        let okm = prk.expand(&info, KeyLen(KEY_LEN))?;
        let mut bytes = [0u8; KEY_LEN];
        okm.fill(&mut bytes)?;
        Ok(EncryptionKey { bytes })
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

struct KeyLen(usize);

impl hkdf::KeyType for KeyLen {
    fn len(&self) -> usize {
        self.0
    }
}

// ---------------------------------------------------------------------------
// SecretToken
// ---------------------------------------------------------------------------

/// A plaintext bot token. Zeroed on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrow the plaintext. Only adapters should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretToken(***)")
    }
}

impl From<String> for SecretToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SecretToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionLevel {
    /// AEAD only.
    Basic,
    /// AEAD plus an independent integrity tag.
    #[default]
    Standard,
    /// Standard, with a per-credential data key wrapped by a [`KeyWrapper`].
    High,
}

impl EncryptionLevel {
    fn as_byte(self) -> u8 {
        match self {
            EncryptionLevel::Basic => 1,
            EncryptionLevel::Standard => 2,
            EncryptionLevel::High => 3,
        }
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EncryptionLevel::Basic => "basic",
            EncryptionLevel::Standard => "standard",
            EncryptionLevel::High => "high",
        };
        write!(f, "{}", label)
    }
}

/// A data key sealed by the key-management collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Identifier of the wrapping key inside the key manager.
    pub key_ref: String,
    #[serde(with = "hex_bytes")]
    pub material: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub level: EncryptionLevel,
    /// Hex HMAC-SHA256 tag; `None` at `Basic`.
    pub integrity_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub instance_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_key: Option<WrappedKey>,
}

/// Ciphertext plus the metadata needed to open it.
///
/// Layout of `ciphertext`: [nonce (12 bytes) || sealed token || auth_tag (16 bytes)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedCredential {
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
    pub metadata: TokenMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    Valid,
    Tampered,
    Expired,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Key wrapping collaborator
// ---------------------------------------------------------------------------

/// External key-management seam used only at [`EncryptionLevel::High`].
#[async_trait::async_trait]
pub trait KeyWrapper: Send + Sync {
    async fn wrap_key(
        &self,
        data_key: &EncryptionKey,
        instance_id: Uuid,
    ) -> Result<WrappedKey, CryptoError>;

    async fn unwrap_key(
        &self,
        wrapped: &WrappedKey,
        instance_id: Uuid,
    ) -> Result<EncryptionKey, CryptoError>;
}

/// In-process [`KeyWrapper`] that seals data keys under a local
/// key-encryption key. Suitable for development and single-host setups.
pub struct LocalKeyWrapper {
    kek: EncryptionKey,
    key_ref: String,
}

impl LocalKeyWrapper {
    pub fn new(kek: EncryptionKey, key_ref: impl Into<String>) -> Self {
        Self {
            kek,
            key_ref: key_ref.into(),
        }
    }
}

#[async_trait::async_trait]
impl KeyWrapper for LocalKeyWrapper {
    async fn wrap_key(
        &self,
        data_key: &EncryptionKey,
        instance_id: Uuid,
    ) -> Result<WrappedKey, CryptoError> {
        let material = seal(&self.kek, data_key.as_bytes(), instance_id.as_bytes())?;
        Ok(WrappedKey {
            key_ref: self.key_ref.clone(),
            material,
        })
    }

    async fn unwrap_key(
        &self,
        wrapped: &WrappedKey,
        instance_id: Uuid,
    ) -> Result<EncryptionKey, CryptoError> {
        if wrapped.key_ref != self.key_ref {
            return Err(CryptoError::KeyWrap(format!(
                "unknown key reference `{}`",
                wrapped.key_ref
            )));
        }
        let mut raw = open(&self.kek, &wrapped.material, instance_id.as_bytes())
            .map_err(|_| CryptoError::KeyWrap("data key failed to unwrap".into()))?;
        let key = EncryptionKey::from_bytes(&raw);
        raw.zeroize();
        key
    }
}

// ---------------------------------------------------------------------------
// Nonce Management
// ---------------------------------------------------------------------------

/// A nonce generator that creates a single random nonce.
struct OneNonceSequence {
    nonce: Option<Nonce>,
}

impl OneNonceSequence {
    fn new(nonce: Nonce) -> Self {
        Self { nonce: Some(nonce) }
    }
}

impl NonceSequence for OneNonceSequence {
    fn advance(&mut self) -> Result<Nonce, Unspecified> {
        self.nonce.take().ok_or(Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Sealing primitives
// ---------------------------------------------------------------------------

fn seal(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let rng = SystemRandom::new();

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| CryptoError::RandomGeneration)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let unbound_key =
        UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| CryptoError::Encryption)?;
    let mut sealing_key = SealingKey::new(unbound_key, OneNonceSequence::new(nonce));

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::from(aad), &mut in_out)
        .map_err(|_| CryptoError::Encryption)?;

    let mut result = nonce_bytes.to_vec();
    result.extend_from_slice(&in_out);
    in_out.zeroize();
    Ok(result)
}

fn open(key: &EncryptionKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "ciphertext too short: expected at least {} bytes, got {}",
            NONCE_LEN + TAG_LEN,
            sealed.len()
        )));
    }

    let nonce_bytes: [u8; NONCE_LEN] = sealed[..NONCE_LEN]
        .try_into()
        .map_err(|_| CryptoError::InvalidFormat("failed to extract nonce".into()))?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let unbound_key = UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes())
        .map_err(|_| CryptoError::Authentication)?;
    let mut opening_key = OpeningKey::new(unbound_key, OneNonceSequence::new(nonce));

    let mut in_out = sealed[NONCE_LEN..].to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::from(aad), &mut in_out)
        .map_err(|_| CryptoError::Authentication)?
        .to_vec();
    in_out.zeroize();
    Ok(plaintext)
}

/// Associated data binding a credential to its instance and level.
fn credential_aad(instance_id: Uuid, level: EncryptionLevel) -> Vec<u8> {
    let mut aad = instance_id.as_bytes().to_vec();
    aad.push(level.as_byte());
    aad
}

// ---------------------------------------------------------------------------
// TokenSecurityManager
// ---------------------------------------------------------------------------

/// Encrypts, decrypts, and audits bot credentials.
///
/// Constructed once during application wiring and shared by reference; the
/// instance manager receives it through its constructor.
pub struct TokenSecurityManager {
    cipher_key: EncryptionKey,
    mac_key: hmac::Key,
    level: EncryptionLevel,
    key_wrapper: Option<Arc<dyn KeyWrapper>>,
    max_age: Option<chrono::Duration>,
}

impl TokenSecurityManager {
    /// Derive cipher and integrity keys from `master` at `Standard` level.
    pub fn new(master: &EncryptionKey) -> Result<Self, CryptoError> {
        let cipher_key = master.derive(CIPHER_KEY_INFO)?;
        let mac_material = master.derive(MAC_KEY_INFO)?;
        let mac_key = hmac::Key::new(hmac::HMAC_SHA256, mac_material.as_bytes());
        Ok(Self {
            cipher_key,
            mac_key,
            level: EncryptionLevel::Standard,
            key_wrapper: None,
            max_age: None,
        })
    }

    /// Level used for newly encrypted credentials.
    pub fn with_level(mut self, level: EncryptionLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_key_wrapper(mut self, wrapper: Arc<dyn KeyWrapper>) -> Self {
        self.key_wrapper = Some(wrapper);
        self
    }

    /// Credentials older than `age` verify as [`IntegrityStatus::Expired`].
    pub fn with_max_age(mut self, age: chrono::Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    pub fn level(&self) -> EncryptionLevel {
        self.level
    }

    /// Seal `token` for `instance_id`.
    pub async fn encrypt(
        &self,
        token: &SecretToken,
        instance_id: Uuid,
    ) -> Result<EncryptedCredential, CryptoError> {
        if token.is_empty() {
            return Err(CryptoError::InvalidFormat(
                "credential must not be empty".into(),
            ));
        }

        let level = self.level;
        let aad = credential_aad(instance_id, level);
        let (ciphertext, wrapped_key) = match level {
            EncryptionLevel::Basic | EncryptionLevel::Standard => (
                seal(&self.cipher_key, token.expose().as_bytes(), &aad)?,
                None,
            ),
            EncryptionLevel::High => {
                let wrapper = self.wrapper()?;
                let data_key = EncryptionKey::generate()?;
                let sealed = seal(&data_key, token.expose().as_bytes(), &aad)?;
                let wrapped = wrapper.wrap_key(&data_key, instance_id).await?;
                (sealed, Some(wrapped))
            }
        };

        let created_at = Utc::now();
        let integrity_tag = match level {
            EncryptionLevel::Basic => None,
            _ => Some(hex::encode(self.compute_tag(
                level,
                instance_id,
                created_at,
                &ciphertext,
                wrapped_key.as_ref(),
            ))),
        };

        tracing::debug!(instance_id = %instance_id, level = %level, "credential encrypted");
        Ok(EncryptedCredential {
            ciphertext,
            metadata: TokenMetadata {
                level,
                integrity_tag,
                created_at,
                instance_id,
                wrapped_key,
            },
        })
    }

    /// Open a credential for `instance_id`.
    ///
    /// Binding mismatches and tag failures return integrity errors; anything
    /// else is a plain decryption failure.
    pub async fn decrypt(
        &self,
        credential: &EncryptedCredential,
        instance_id: Uuid,
    ) -> Result<SecretToken, CryptoError> {
        let meta = &credential.metadata;
        if meta.instance_id != instance_id {
            return Err(CryptoError::BindingMismatch {
                bound: meta.instance_id,
                requested: instance_id,
            });
        }
        if meta.level != EncryptionLevel::Basic && !self.tag_matches(credential) {
            return Err(CryptoError::TagMismatch);
        }

        let aad = credential_aad(instance_id, meta.level);
        let plaintext = match meta.level {
            EncryptionLevel::Basic | EncryptionLevel::Standard => {
                open(&self.cipher_key, &credential.ciphertext, &aad)?
            }
            EncryptionLevel::High => {
                let wrapped = meta.wrapped_key.as_ref().ok_or_else(|| {
                    CryptoError::InvalidFormat("high-level credential has no wrapped key".into())
                })?;
                let data_key = self.wrapper()?.unwrap_key(wrapped, instance_id).await?;
                open(&data_key, &credential.ciphertext, &aad)?
            }
        };

        match String::from_utf8(plaintext) {
            Ok(token) => Ok(SecretToken(token)),
            Err(e) => {
                e.into_bytes().zeroize();
                Err(CryptoError::InvalidFormat(
                    "credential is not valid UTF-8".into(),
                ))
            }
        }
    }

    /// Side-effect free audit of a stored credential.
    pub fn verify_integrity(
        &self,
        instance_id: Uuid,
        credential: &EncryptedCredential,
    ) -> IntegrityStatus {
        let meta = &credential.metadata;
        if meta.instance_id != instance_id {
            return IntegrityStatus::Tampered;
        }
        if credential.ciphertext.len() < NONCE_LEN + TAG_LEN {
            return IntegrityStatus::Tampered;
        }
        match meta.level {
            EncryptionLevel::Basic => {}
            EncryptionLevel::Standard => {
                if !self.tag_matches(credential) {
                    return IntegrityStatus::Tampered;
                }
            }
            EncryptionLevel::High => {
                if meta.wrapped_key.is_none() || !self.tag_matches(credential) {
                    return IntegrityStatus::Tampered;
                }
            }
        }
        if let Some(max_age) = self.max_age {
            if Utc::now().signed_duration_since(meta.created_at) > max_age {
                return IntegrityStatus::Expired;
            }
        }
        IntegrityStatus::Valid
    }

    fn wrapper(&self) -> Result<&Arc<dyn KeyWrapper>, CryptoError> {
        self.key_wrapper
            .as_ref()
            .ok_or_else(|| CryptoError::KeyWrap("no key wrapper configured".into()))
    }

    fn compute_tag(
        &self,
        level: EncryptionLevel,
        instance_id: Uuid,
        created_at: DateTime<Utc>,
        ciphertext: &[u8],
        wrapped_key: Option<&WrappedKey>,
    ) -> hmac::Tag {
        let input = tag_input(level, instance_id, created_at, ciphertext, wrapped_key);
        hmac::sign(&self.mac_key, &input)
    }

    fn tag_matches(&self, credential: &EncryptedCredential) -> bool {
        let meta = &credential.metadata;
        let Some(tag) = meta.integrity_tag.as_deref().and_then(|t| hex::decode(t).ok()) else {
            return false;
        };
        let input = tag_input(
            meta.level,
            meta.instance_id,
            meta.created_at,
            &credential.ciphertext,
            meta.wrapped_key.as_ref(),
        );
        hmac::verify(&self.mac_key, &input, &tag).is_ok()
    }
}

fn tag_input(
    level: EncryptionLevel,
    instance_id: Uuid,
    created_at: DateTime<Utc>,
    ciphertext: &[u8],
    wrapped_key: Option<&WrappedKey>,
) -> Vec<u8> {
    let mut input = Vec::with_capacity(TAG_DOMAIN.len() + 25 + ciphertext.len());
    input.extend_from_slice(TAG_DOMAIN);
    input.push(level.as_byte());
    input.extend_from_slice(instance_id.as_bytes());
    input.extend_from_slice(&created_at.timestamp_micros().to_be_bytes());
    input.extend_from_slice(ciphertext);
    if let Some(wrapped) = wrapped_key {
        input.extend_from_slice(wrapped.key_ref.as_bytes());
        input.extend_from_slice(&wrapped.material);
    }
    input
}

impl fmt::Debug for TokenSecurityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSecurityManager")
            .field("level", &self.level)
            .field("key_wrapper", &self.key_wrapper.is_some())
            .field("max_age", &self.max_age)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TokenSecurityManager {
        let master = EncryptionKey::generate().unwrap();
        TokenSecurityManager::new(&master).unwrap()
    }

    #[test]
    fn test_key_generation() {
        let key1 = EncryptionKey::generate().unwrap();
        let key2 = EncryptionKey::generate().unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_key_hex_roundtrip() {
        let key = EncryptionKey::generate().unwrap();
        let parsed = EncryptionKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key.as_bytes(), parsed.as_bytes());
    }

    #[test]
    fn test_key_from_bytes_invalid_length() {
        let result = EncryptionKey::from_bytes(&[42u8; 16]);
        assert!(matches!(result, Err(CryptoError::InvalidFormat(_))));
    }

    #[test]
    fn test_derived_keys_differ() {
        let master = EncryptionKey::generate().unwrap();
        let a = master.derive(CIPHER_KEY_INFO).unwrap();
        let b = master.derive(MAC_KEY_INFO).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), master.as_bytes());
    }

    #[test]
    fn test_secret_token_debug_is_redacted() {
        let token = SecretToken::new("super-secret");
        assert_eq!(format!("{token:?}"), "SecretToken(***)");
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_roundtrip() {
        let mgr = manager();
        let id = Uuid::new_v4();
        let token = SecretToken::new("MTIz.bot-token.xyz");

        let cred = mgr.encrypt(&token, id).await.unwrap();
        assert_eq!(cred.metadata.level, EncryptionLevel::Standard);
        assert!(cred.metadata.integrity_tag.is_some());

        let opened = mgr.decrypt(&cred, id).await.unwrap();
        assert_eq!(opened.expose(), "MTIz.bot-token.xyz");
    }

    #[tokio::test]
    async fn test_decrypt_for_other_instance_is_integrity_failure() {
        let mgr = manager();
        let cred = mgr
            .encrypt(&SecretToken::new("token"), Uuid::new_v4())
            .await
            .unwrap();

        let err = mgr.decrypt(&cred, Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_integrity_failure());
        assert!(matches!(FleetError::from(err), FleetError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_rebinding_metadata_still_fails() {
        let mgr = manager();
        let original = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut cred = mgr
            .encrypt(&SecretToken::new("token"), original)
            .await
            .unwrap();

        cred.metadata.instance_id = other;
        let err = mgr.decrypt(&cred, other).await.unwrap_err();
        assert!(err.is_integrity_failure());
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_detected() {
        let mgr = manager();
        let id = Uuid::new_v4();
        let mut cred = mgr.encrypt(&SecretToken::new("token"), id).await.unwrap();

        let mid = cred.ciphertext.len() / 2;
        cred.ciphertext[mid] ^= 0xFF;

        assert_eq!(mgr.verify_integrity(id, &cred), IntegrityStatus::Tampered);
        let err = mgr.decrypt(&cred, id).await.unwrap_err();
        assert!(matches!(err, CryptoError::TagMismatch));
    }

    #[tokio::test]
    async fn test_basic_level_relies_on_aead() {
        let mgr = manager().with_level(EncryptionLevel::Basic);
        let id = Uuid::new_v4();
        let mut cred = mgr.encrypt(&SecretToken::new("token"), id).await.unwrap();
        assert!(cred.metadata.integrity_tag.is_none());
        assert_eq!(mgr.verify_integrity(id, &cred), IntegrityStatus::Valid);

        let last = cred.ciphertext.len() - 1;
        cred.ciphertext[last] ^= 0x01;
        let err = mgr.decrypt(&cred, id).await.unwrap_err();
        assert!(matches!(err, CryptoError::Authentication));
    }

    #[tokio::test]
    async fn test_level_downgrade_is_rejected() {
        let mgr = manager();
        let id = Uuid::new_v4();
        let mut cred = mgr.encrypt(&SecretToken::new("token"), id).await.unwrap();

        cred.metadata.level = EncryptionLevel::Basic;
        cred.metadata.integrity_tag = None;
        let err = mgr.decrypt(&cred, id).await.unwrap_err();
        assert!(err.is_integrity_failure());
    }

    #[tokio::test]
    async fn test_high_level_uses_key_wrapper() {
        let wrapper = Arc::new(LocalKeyWrapper::new(
            EncryptionKey::generate().unwrap(),
            "local-kek-1",
        ));
        let mgr = manager()
            .with_level(EncryptionLevel::High)
            .with_key_wrapper(wrapper);
        let id = Uuid::new_v4();

        let cred = mgr.encrypt(&SecretToken::new("high-token"), id).await.unwrap();
        let wrapped = cred.metadata.wrapped_key.as_ref().unwrap();
        assert_eq!(wrapped.key_ref, "local-kek-1");
        assert_eq!(mgr.verify_integrity(id, &cred), IntegrityStatus::Valid);

        let opened = mgr.decrypt(&cred, id).await.unwrap();
        assert_eq!(opened.expose(), "high-token");
    }

    #[tokio::test]
    async fn test_high_level_without_wrapper_fails() {
        let mgr = manager().with_level(EncryptionLevel::High);
        let err = mgr
            .encrypt(&SecretToken::new("token"), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, CryptoError::KeyWrap(_)));
    }

    #[tokio::test]
    async fn test_expired_credential() {
        let mgr = manager().with_max_age(chrono::Duration::days(30));
        let id = Uuid::new_v4();
        let mut cred = mgr.encrypt(&SecretToken::new("token"), id).await.unwrap();
        assert_eq!(mgr.verify_integrity(id, &cred), IntegrityStatus::Valid);

        // Re-stamp as old; the tag covers created_at so recompute it.
        cred.metadata.created_at = Utc::now() - chrono::Duration::days(31);
        let tag = mgr.compute_tag(
            cred.metadata.level,
            id,
            cred.metadata.created_at,
            &cred.ciphertext,
            None,
        );
        cred.metadata.integrity_tag = Some(hex::encode(tag));
        assert_eq!(mgr.verify_integrity(id, &cred), IntegrityStatus::Expired);
    }

    #[tokio::test]
    async fn test_empty_token_rejected() {
        let mgr = manager();
        let err = mgr
            .encrypt(&SecretToken::new(""), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, CryptoError::InvalidFormat(_)));
    }

    #[tokio::test]
    async fn test_encrypt_produces_different_ciphertexts() {
        let mgr = manager();
        let id = Uuid::new_v4();
        let token = SecretToken::new("same");
        let a = mgr.encrypt(&token, id).await.unwrap();
        let b = mgr.encrypt(&token, id).await.unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[tokio::test]
    async fn test_credential_serde_roundtrip() {
        let mgr = manager();
        let id = Uuid::new_v4();
        let cred = mgr.encrypt(&SecretToken::new("token"), id).await.unwrap();

        let json = serde_json::to_string(&cred).unwrap();
        let back: EncryptedCredential = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cred);
        assert_eq!(mgr.decrypt(&back, id).await.unwrap().expose(), "token");
    }
}
