//! Client-side encryption keys and the metadata that travels with a blob
//!
//! Content is encrypted with a random AES-256 content key and IV. The content
//! key is wrapped by a key-encryption key (KEK) and stored, with the IV, as
//! JSON under the `encryptiondata` metadata entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use aes_kw::KekAes256;
use async_trait::async_trait;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{TransferError, TransferResult};

/// Metadata entry holding the serialized `EncryptionData`
pub const ENCRYPTION_DATA_KEY: &str = "encryptiondata";
pub const AGENT_PROTOCOL: &str = "1.0";
pub const CONTENT_ALGORITHM: &str = "AES_CBC_256";
pub const KEY_WRAP_ALGORITHM: &str = "A256KW";
/// Cipher block size in bytes
pub const CIPHER_BLOCK: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WrappedContentKey {
    pub key_id: String,
    /// Base64 of the wrapped content key
    pub encrypted_key: String,
    pub algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptionAgent {
    pub protocol: String,
    pub encryption_algorithm: String,
}

impl Default for EncryptionAgent {
    fn default() -> Self {
        Self {
            protocol: AGENT_PROTOCOL.to_string(),
            encryption_algorithm: CONTENT_ALGORITHM.to_string(),
        }
    }
}

/// Everything a reader needs, besides the KEK, to decrypt a blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptionData {
    pub wrapped_content_key: WrappedContentKey,
    pub encryption_agent: EncryptionAgent,
    #[serde(rename = "ContentEncryptionIV")]
    pub content_encryption_iv: String,
    #[serde(default)]
    pub key_wrapping_metadata: BTreeMap<String, String>,
}

impl EncryptionData {
    pub fn new(key_id: &str, algorithm: &str, wrapped_key: &[u8], iv: &[u8; CIPHER_BLOCK]) -> Self {
        let engine = base64::engine::general_purpose::STANDARD;
        let mut key_wrapping_metadata = BTreeMap::new();
        key_wrapping_metadata.insert("EncryptionLibrary".to_string(), format!("Rust {}", env!("CARGO_PKG_NAME")));
        Self {
            wrapped_content_key: WrappedContentKey {
                key_id: key_id.to_string(),
                encrypted_key: engine.encode(wrapped_key),
                algorithm: algorithm.to_string(),
            },
            encryption_agent: EncryptionAgent::default(),
            content_encryption_iv: engine.encode(iv),
            key_wrapping_metadata,
        }
    }

    /// Read and validate the entry from blob metadata, if present
    pub fn from_metadata(metadata: &BTreeMap<String, String>) -> TransferResult<Option<Self>> {
        let Some(raw) = metadata.get(ENCRYPTION_DATA_KEY) else {
            return Ok(None);
        };
        let data: Self = serde_json::from_str(raw)?;
        data.validate()?;
        Ok(Some(data))
    }

    pub fn to_metadata_value(&self) -> TransferResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(&self) -> TransferResult<()> {
        if self.encryption_agent.protocol != AGENT_PROTOCOL {
            return Err(TransferError::unsupported(format!(
                "Encryption protocol {} is not supported",
                self.encryption_agent.protocol
            )));
        }
        if self.encryption_agent.encryption_algorithm != CONTENT_ALGORITHM {
            return Err(TransferError::unsupported(format!(
                "Content encryption algorithm {} is not supported",
                self.encryption_agent.encryption_algorithm
            )));
        }
        self.iv().map(|_| ())
    }

    pub fn iv(&self) -> TransferResult<[u8; CIPHER_BLOCK]> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&self.content_encryption_iv)
            .map_err(|e| TransferError::encryption(format!("Invalid IV encoding: {}", e)))?;
        raw.try_into()
            .map_err(|_| TransferError::encryption("IV must be 16 bytes"))
    }

    pub fn wrapped_key(&self) -> TransferResult<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.wrapped_content_key.encrypted_key)
            .map_err(|e| TransferError::encryption(format!("Invalid wrapped key encoding: {}", e)))
    }
}

/// Content encryption key and IV for one blob
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey {
    pub key: [u8; 32],
    pub iv: [u8; CIPHER_BLOCK],
}

impl ContentKey {
    /// Fresh random key and IV
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut key = [0u8; 32];
        let mut iv = [0u8; CIPHER_BLOCK];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);
        Self { key, iv }
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey").finish_non_exhaustive()
    }
}

/// Wraps and unwraps content keys
#[async_trait]
pub trait KeyEncryptionKey: Send + Sync {
    fn key_id(&self) -> &str;

    fn algorithm(&self) -> &str {
        KEY_WRAP_ALGORITHM
    }

    async fn wrap_key(&self, content_key: &[u8]) -> TransferResult<Vec<u8>>;

    async fn unwrap_key(&self, wrapped: &[u8], algorithm: &str) -> TransferResult<Vec<u8>>;
}

/// Finds the KEK named by a blob's metadata
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, key_id: &str) -> TransferResult<Option<Arc<dyn KeyEncryptionKey>>>;
}

/// Local AES-256 key-wrap KEK (RFC 3394)
#[derive(Clone)]
pub struct SymmetricKey {
    id: String,
    key: [u8; 32],
}

impl SymmetricKey {
    pub fn new(id: impl Into<String>, key: [u8; 32]) -> Self {
        Self { id: id.into(), key }
    }

    pub fn generate(id: impl Into<String>) -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(id, key)
    }

    fn kek(&self) -> KekAes256 {
        KekAes256::from(self.key)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey").field("id", &self.id).finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyEncryptionKey for SymmetricKey {
    fn key_id(&self) -> &str {
        &self.id
    }

    async fn wrap_key(&self, content_key: &[u8]) -> TransferResult<Vec<u8>> {
        self.kek()
            .wrap_vec(content_key)
            .map_err(|e| TransferError::encryption(format!("Key wrap failed: {}", e)))
    }

    async fn unwrap_key(&self, wrapped: &[u8], algorithm: &str) -> TransferResult<Vec<u8>> {
        if algorithm != KEY_WRAP_ALGORITHM {
            return Err(TransferError::unsupported(format!("Key wrap algorithm {} is not supported", algorithm)));
        }
        self.kek()
            .unwrap_vec(wrapped)
            .map_err(|e| TransferError::encryption(format!("Key unwrap failed: {}", e)))
    }
}

/// Resolver over a fixed set of keys
#[derive(Default, Clone)]
pub struct StaticKeyResolver {
    keys: HashMap<String, Arc<dyn KeyEncryptionKey>>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: Arc<dyn KeyEncryptionKey>) -> Self {
        self.keys.insert(key.key_id().to_string(), key);
        self
    }
}

#[async_trait]
impl KeyResolver for StaticKeyResolver {
    async fn resolve(&self, key_id: &str) -> TransferResult<Option<Arc<dyn KeyEncryptionKey>>> {
        Ok(self.keys.get(key_id).cloned())
    }
}

/// Keys used to encrypt uploads and decrypt downloads
#[derive(Clone, Default)]
pub struct EncryptionPolicy {
    key: Option<Arc<dyn KeyEncryptionKey>>,
    resolver: Option<Arc<dyn KeyResolver>>,
}

impl EncryptionPolicy {
    pub fn with_key(key: Arc<dyn KeyEncryptionKey>) -> Self {
        Self {
            key: Some(key),
            resolver: None,
        }
    }

    pub fn with_resolver(resolver: Arc<dyn KeyResolver>) -> Self {
        Self {
            key: None,
            resolver: Some(resolver),
        }
    }

    pub fn and_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn key(&self) -> Option<&Arc<dyn KeyEncryptionKey>> {
        self.key.as_ref()
    }

    /// Generate a content key and wrap it for storage in blob metadata
    pub async fn seal_new_content_key(&self) -> TransferResult<(ContentKey, EncryptionData)> {
        let kek = self
            .key
            .as_ref()
            .ok_or_else(|| TransferError::encryption("Uploads require a key-encryption key"))?;
        let content_key = ContentKey::generate();
        let wrapped = kek.wrap_key(&content_key.key).await?;
        let data = EncryptionData::new(kek.key_id(), kek.algorithm(), &wrapped, &content_key.iv);
        Ok((content_key, data))
    }

    /// Unwrap the content key described by `data`
    pub async fn open_content_key(&self, data: &EncryptionData) -> TransferResult<ContentKey> {
        let key_id = &data.wrapped_content_key.key_id;
        let kek = self.resolve(key_id).await?;
        let raw = kek
            .unwrap_key(&data.wrapped_key()?, &data.wrapped_content_key.algorithm)
            .await?;
        let key: [u8; 32] = raw
            .try_into()
            .map_err(|_| TransferError::encryption("Unwrapped content key must be 32 bytes"))?;
        Ok(ContentKey { key, iv: data.iv()? })
    }

    async fn resolve(&self, key_id: &str) -> TransferResult<Arc<dyn KeyEncryptionKey>> {
        if let Some(key) = self.key.as_ref().filter(|k| k.key_id() == key_id) {
            return Ok(key.clone());
        }
        if let Some(resolver) = &self.resolver {
            if let Some(key) = resolver.resolve(key_id).await? {
                return Ok(key);
            }
        }
        Err(TransferError::encryption(format!("No key available for key id {}", key_id)))
    }
}

impl std::fmt::Debug for EncryptionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionPolicy")
            .field("key_id", &self.key.as_ref().map(|k| k.key_id().to_string()))
            .field("has_resolver", &self.resolver.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn content_key_survives_wrap_and_metadata() {
        let kek: Arc<dyn KeyEncryptionKey> = Arc::new(SymmetricKey::generate("kek-1"));
        let policy = EncryptionPolicy::with_key(kek);
        let (content_key, data) = policy.seal_new_content_key().await.unwrap();

        let mut metadata = BTreeMap::new();
        metadata.insert(ENCRYPTION_DATA_KEY.to_string(), data.to_metadata_value().unwrap());
        let parsed = EncryptionData::from_metadata(&metadata).unwrap().unwrap();
        assert_eq!(parsed.wrapped_content_key.algorithm, KEY_WRAP_ALGORITHM);

        let opened = policy.open_content_key(&parsed).await.unwrap();
        assert_eq!(opened, content_key);
    }

    #[tokio::test]
    async fn resolver_supplies_unknown_keys() {
        let kek: Arc<dyn KeyEncryptionKey> = Arc::new(SymmetricKey::new("kek-2", [9u8; 32]));
        let (content_key, data) = EncryptionPolicy::with_key(kek.clone())
            .seal_new_content_key()
            .await
            .unwrap();

        let reader = EncryptionPolicy::with_resolver(Arc::new(StaticKeyResolver::new().with_key(kek)));
        assert_eq!(reader.open_content_key(&data).await.unwrap(), content_key);

        let stranger = EncryptionPolicy::with_key(Arc::new(SymmetricKey::generate("other")));
        assert!(matches!(
            stranger.open_content_key(&data).await,
            Err(TransferError::Encryption { .. })
        ));
    }

    #[test]
    fn metadata_uses_service_field_names() {
        let data = EncryptionData::new("k", KEY_WRAP_ALGORITHM, &[1u8; 40], &[2u8; 16]);
        let json = data.to_metadata_value().unwrap();
        assert!(json.contains("\"WrappedContentKey\""));
        assert!(json.contains("\"ContentEncryptionIV\""));
        assert!(json.contains("\"EncryptionAlgorithm\":\"AES_CBC_256\""));
    }

    #[test]
    fn unknown_agent_is_rejected() {
        let mut data = EncryptionData::new("k", KEY_WRAP_ALGORITHM, &[1u8; 40], &[2u8; 16]);
        data.encryption_agent.protocol = "2.0".into();
        let mut metadata = BTreeMap::new();
        metadata.insert(ENCRYPTION_DATA_KEY.to_string(), data.to_metadata_value().unwrap());
        assert!(matches!(
            EncryptionData::from_metadata(&metadata),
            Err(TransferError::Unsupported { .. })
        ));
    }
}
