//! AES-256-CBC streaming and cipher-block range realignment
//!
//! Plaintext block `i` maps to ciphertext block `i`, and block `i` decrypts
//! with ciphertext block `i - 1` as its IV. A plaintext range therefore reads
//! a ciphertext range widened to 16-byte boundaries plus one leading block,
//! unless it starts in the first block where the IV comes from metadata.

use aes::Aes256;
use async_trait::async_trait;
use bytes::Bytes;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::encryption::{ContentKey, CIPHER_BLOCK};
use crate::{ByteRange, DownloadSink, TransferError, TransferResult};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const BLOCK: u64 = CIPHER_BLOCK as u64;

/// Ciphertext length for a plaintext of `plaintext_len` bytes (PKCS#7 always pads)
pub fn ciphertext_length(plaintext_len: u64) -> u64 {
    (plaintext_len / BLOCK + 1) * BLOCK
}

/// Incremental CBC encryption with PKCS#7 padding on the final block
pub struct CbcEncryptor {
    cipher: Aes256CbcEnc,
    pending: Vec<u8>,
    finished: bool,
}

impl CbcEncryptor {
    pub fn new(content_key: &ContentKey) -> Self {
        Self {
            cipher: Aes256CbcEnc::new(&content_key.key.into(), &content_key.iv.into()),
            pending: Vec::with_capacity(CIPHER_BLOCK),
            finished: false,
        }
    }

    /// Encrypt every complete block available, keeping the remainder
    pub fn update(&mut self, data: &[u8]) -> TransferResult<Vec<u8>> {
        if self.finished {
            return Err(TransferError::state("Final cipher block already emitted"));
        }
        self.pending.extend_from_slice(data);
        let full = self.pending.len() / CIPHER_BLOCK * CIPHER_BLOCK;
        let mut out: Vec<u8> = self.pending.drain(..full).collect();
        self.encrypt_in_place(&mut out);
        Ok(out)
    }

    /// Pad and encrypt the remainder; no further input is accepted
    pub fn finish(&mut self) -> TransferResult<Vec<u8>> {
        if self.finished {
            return Err(TransferError::state("Final cipher block already emitted"));
        }
        let pad = CIPHER_BLOCK - self.pending.len();
        let mut out = std::mem::take(&mut self.pending);
        out.resize(CIPHER_BLOCK, pad as u8);
        self.encrypt_in_place(&mut out);
        self.finished = true;
        Ok(out)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn encrypt_in_place(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(CIPHER_BLOCK) {
            self.cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

/// How a plaintext range request maps onto the ciphertext
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherRangeMapping {
    /// Plaintext range the caller asked for; `None` is the whole blob
    pub requested: Option<ByteRange>,
    /// Ciphertext range to fetch
    pub expanded: Option<ByteRange>,
    /// Leading decrypted bytes that precede the requested offset
    pub discard_first: u64,
    /// The first fetched block is only the IV for the next one
    pub iv_in_stream: bool,
    /// The fetched range ends with the padded final block
    pub reaches_end: bool,
    /// The backend can decrypt a range that stops short of the final block
    pub supports_unpadded_final_block: bool,
}

impl CipherRangeMapping {
    /// Map a plaintext range onto a blob holding `ciphertext_len` bytes
    pub fn compute(
        requested: Option<ByteRange>,
        ciphertext_len: u64,
        supports_unpadded_final_block: bool,
    ) -> TransferResult<Self> {
        let Some(range) = requested else {
            return Ok(Self {
                requested,
                expanded: None,
                discard_first: 0,
                iv_in_stream: false,
                reaches_end: true,
                supports_unpadded_final_block,
            });
        };
        if range.is_empty() {
            return Err(TransferError::invalid("Range length must be positive"));
        }
        if ciphertext_len == 0 || ciphertext_len % BLOCK != 0 {
            return Err(TransferError::encryption(format!(
                "Encrypted blob length {} is not a positive multiple of {}",
                ciphertext_len, BLOCK
            )));
        }

        let discard_first = range.offset % BLOCK;
        let aligned = range.offset - discard_first;
        if aligned >= ciphertext_len {
            return Err(TransferError::invalid(format!(
                "Range offset {} is beyond the end of the blob",
                range.offset
            )));
        }
        let iv_in_stream = aligned > 0;
        let start = if iv_in_stream { aligned - BLOCK } else { 0 };

        let (expanded, reaches_end) = match range.length {
            None => (ByteRange::from_offset(start), true),
            Some(length) => {
                let end = round_up(range.offset + length).min(ciphertext_len);
                (ByteRange::new(start, Some(end - start)), end == ciphertext_len)
            }
        };

        if !reaches_end && !supports_unpadded_final_block {
            return Err(TransferError::unsupported(
                "Cipher backend cannot decrypt a closed range that ends before the final block",
            ));
        }

        Ok(Self {
            requested,
            expanded: Some(expanded),
            discard_first,
            iv_in_stream,
            reaches_end,
            supports_unpadded_final_block,
        })
    }

    /// Plaintext bytes the caller wants, if bounded
    pub fn output_limit(&self) -> Option<u64> {
        self.requested.and_then(|r| r.length)
    }
}

fn round_up(value: u64) -> u64 {
    value.div_ceil(BLOCK) * BLOCK
}

/// Decrypts ciphertext on its way into another sink
///
/// Strips the IV block, leading discard and padding, and stops after the
/// requested length.
pub struct DecryptingSink<'s> {
    inner: &'s mut dyn DownloadSink,
    key: [u8; 32],
    cipher: Option<Aes256CbcDec>,
    iv: Vec<u8>,
    pending: Vec<u8>,
    held: Option<Vec<u8>>,
    unpad: bool,
    discard: u64,
    remaining: Option<u64>,
    written: u64,
}

impl<'s> DecryptingSink<'s> {
    pub fn new(inner: &'s mut dyn DownloadSink, content_key: &ContentKey, mapping: &CipherRangeMapping) -> Self {
        let cipher = (!mapping.iv_in_stream)
            .then(|| Aes256CbcDec::new(&content_key.key.into(), &content_key.iv.into()));
        Self {
            inner,
            key: content_key.key,
            cipher,
            iv: Vec::with_capacity(CIPHER_BLOCK),
            pending: Vec::with_capacity(CIPHER_BLOCK),
            held: None,
            unpad: mapping.reaches_end,
            discard: mapping.discard_first,
            remaining: mapping.output_limit(),
            written: 0,
        }
    }

    /// Plaintext bytes delivered to the inner sink
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    async fn emit(&mut self, plain: &[u8]) -> std::io::Result<()> {
        let skip = self.discard.min(plain.len() as u64) as usize;
        self.discard -= skip as u64;
        let mut out = &plain[skip..];
        if let Some(remaining) = self.remaining.as_mut() {
            let take = (*remaining).min(out.len() as u64) as usize;
            *remaining -= take as u64;
            out = &out[..take];
        }
        if out.is_empty() {
            return Ok(());
        }
        self.written += out.len() as u64;
        self.inner.write_chunk(Bytes::copy_from_slice(out)).await
    }
}

fn invalid_data(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string())
}

#[async_trait]
impl DownloadSink for DecryptingSink<'_> {
    async fn write_chunk(&mut self, chunk: Bytes) -> std::io::Result<()> {
        let mut data = &chunk[..];
        if self.cipher.is_none() {
            let take = (CIPHER_BLOCK - self.iv.len()).min(data.len());
            self.iv.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.iv.len() < CIPHER_BLOCK {
                return Ok(());
            }
            self.cipher = Some(
                Aes256CbcDec::new_from_slices(&self.key, &self.iv)
                    .map_err(|_| invalid_data("Invalid cipher key or IV length"))?,
            );
        }

        self.pending.extend_from_slice(data);
        let full = self.pending.len() / CIPHER_BLOCK * CIPHER_BLOCK;
        if full == 0 {
            return Ok(());
        }
        let mut blocks: Vec<u8> = self.pending.drain(..full).collect();
        if let Some(cipher) = self.cipher.as_mut() {
            for block in blocks.chunks_exact_mut(CIPHER_BLOCK) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }

        if self.unpad {
            // The final block can only be unpadded once we know it is final
            let last = blocks.split_off(blocks.len() - CIPHER_BLOCK);
            if let Some(previous) = self.held.replace(last) {
                self.emit(&previous).await?;
            }
            self.emit(&blocks).await
        } else {
            self.emit(&blocks).await
        }
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        if !self.pending.is_empty() || self.cipher.is_none() {
            return Err(invalid_data("Ciphertext ended inside a cipher block"));
        }
        if self.unpad {
            let last = self
                .held
                .take()
                .ok_or_else(|| invalid_data("Ciphertext is missing its final block"))?;
            let pad = last[CIPHER_BLOCK - 1] as usize;
            if pad == 0 || pad > CIPHER_BLOCK || last[CIPHER_BLOCK - pad..].iter().any(|&b| b as usize != pad) {
                return Err(invalid_data("Invalid padding on the final cipher block"));
            }
            self.emit(&last[..CIPHER_BLOCK - pad]).await?;
        }
        self.inner.finish().await
    }
}
