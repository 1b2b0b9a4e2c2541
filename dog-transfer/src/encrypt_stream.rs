use crate::cipher::CbcEncryptor;
use crate::encryption::{ContentKey, EncryptionData, ENCRYPTION_DATA_KEY};
use crate::{
    BlobKind, ChunkedWriteStream, StreamPhase, StreamState, TransferError, TransferReceipt, TransferResult,
};

/// Encrypts plaintext before it reaches a block write stream
///
/// The encryption metadata is attached at construction, before any chunk can
/// be dispatched. `commit` emits the padded final block and then commits the
/// block list.
pub struct EncryptingWriteStream {
    inner: ChunkedWriteStream,
    encryptor: CbcEncryptor,
    plaintext_accepted: u64,
}

impl EncryptingWriteStream {
    pub(crate) fn new(
        mut inner: ChunkedWriteStream,
        content_key: &ContentKey,
        data: &EncryptionData,
    ) -> TransferResult<Self> {
        if inner.kind() != BlobKind::Block {
            return Err(TransferError::unsupported(format!(
                "Client-side encryption is only available for block blobs, not {:?}",
                inner.kind()
            )));
        }
        inner.set_metadata(ENCRYPTION_DATA_KEY, data.to_metadata_value()?)?;
        Ok(Self {
            inner,
            encryptor: CbcEncryptor::new(content_key),
            plaintext_accepted: 0,
        })
    }

    /// Attach user metadata; the encryption entry is reserved
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) -> TransferResult<()> {
        let key = key.into();
        if key == ENCRYPTION_DATA_KEY {
            return Err(TransferError::invalid(format!("Metadata key {} is reserved", ENCRYPTION_DATA_KEY)));
        }
        self.inner.set_metadata(key, value)
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) -> TransferResult<()> {
        self.inner.set_content_type(content_type)
    }

    pub async fn write(&mut self, data: &[u8]) -> TransferResult<()> {
        if self.inner.phase() != StreamPhase::Buffering {
            // Surfaces the stream's own state error
            return self.inner.write(&[]).await;
        }
        let ciphertext = self.encryptor.update(data)?;
        self.plaintext_accepted += data.len() as u64;
        self.inner.write(&ciphertext).await
    }

    /// Pad and write the last cipher block; must precede the commit
    pub async fn flush_final_block(&mut self) -> TransferResult<()> {
        if self.inner.phase() != StreamPhase::Buffering {
            return self.inner.write(&[]).await;
        }
        let tail = self.encryptor.finish()?;
        self.inner.write(&tail).await
    }

    pub async fn commit(&mut self) -> TransferResult<TransferReceipt> {
        if !self.encryptor.is_finished() {
            self.flush_final_block().await?;
        }
        self.inner.commit().await
    }

    pub fn phase(&self) -> StreamPhase {
        self.inner.phase()
    }

    /// Accounting of the underlying ciphertext stream
    pub fn state(&self) -> &StreamState {
        self.inner.state()
    }

    pub fn plaintext_accepted(&self) -> u64 {
        self.plaintext_accepted
    }
}

impl std::fmt::Debug for EncryptingWriteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptingWriteStream")
            .field("inner", &self.inner)
            .field("plaintext_accepted", &self.plaintext_accepted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::ciphertext_length;
    use crate::encryption::{EncryptionPolicy, SymmetricKey};
    use crate::{BlobClient, MemoryBlobService, TransferConfig};
    use std::sync::Arc;

    #[tokio::test]
    async fn uploads_ciphertext_with_metadata() {
        let service = Arc::new(MemoryBlobService::new());
        let client = BlobClient::new(
            service.clone(),
            service.uri("c/secret"),
            TransferConfig::default().with_chunk_size(16),
        );
        let policy = EncryptionPolicy::with_key(Arc::new(SymmetricKey::generate("kek")));
        let mut stream = client.open_encrypted_writer(&policy).await.unwrap();

        stream.write(b"attack at dawn, bring snacks").await.unwrap();
        let receipt = stream.commit().await.unwrap();

        assert_eq!(receipt.size_bytes, ciphertext_length(28));
        let stored = service.blob_bytes("c/secret").unwrap();
        assert_eq!(stored.len() as u64, ciphertext_length(28));
        assert!(!stored.windows(6).any(|w| w == b"attack"));
        assert!(service.blob_metadata("c/secret").unwrap().contains_key(ENCRYPTION_DATA_KEY));
    }

    #[tokio::test]
    async fn final_block_is_emitted_once() {
        let service = Arc::new(MemoryBlobService::new());
        let client = BlobClient::new(service.clone(), service.uri("c/once"), TransferConfig::default());
        let policy = EncryptionPolicy::with_key(Arc::new(SymmetricKey::generate("kek")));
        let mut stream = client.open_encrypted_writer(&policy).await.unwrap();

        stream.write(b"abc").await.unwrap();
        stream.flush_final_block().await.unwrap();
        assert!(matches!(stream.flush_final_block().await, Err(TransferError::State { .. })));
        assert!(matches!(stream.write(b"more").await, Err(TransferError::State { .. })));
        stream.commit().await.unwrap();
        assert_eq!(service.blob_bytes("c/once").unwrap().len(), 16);
    }

    #[tokio::test]
    async fn reserved_metadata_key_is_rejected() {
        let service = Arc::new(MemoryBlobService::new());
        let client = BlobClient::new(service.clone(), service.uri("c/meta"), TransferConfig::default());
        let policy = EncryptionPolicy::with_key(Arc::new(SymmetricKey::generate("kek")));
        let mut stream = client.open_encrypted_writer(&policy).await.unwrap();
        assert!(stream.set_metadata(ENCRYPTION_DATA_KEY, "x").is_err());
        assert!(stream.set_metadata("owner", "ops").is_ok());
    }
}
