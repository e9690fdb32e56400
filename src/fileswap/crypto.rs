//! Chunked AES-256-GCM encoding of swap files.
//!
//! Layout:
//!
//! ```text
//! nonce prefix (8 bytes)
//! frame*: flag (1 byte) | ciphertext length (u32 BE) | ciphertext
//! ```
//!
//! Each frame seals up to [`CHUNK_SIZE`] plaintext bytes with nonce
//! `prefix || counter (u32 BE)`. The flag byte is authenticated as
//! associated data and is `1` only on the final frame, so truncation and
//! reordering are detected.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{FileSwapError, Result};

/// Plaintext bytes per frame.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Length of the random per-file nonce prefix.
pub const NONCE_PREFIX_LEN: usize = 8;

const TAG_LEN: usize = 16;
const FLAG_MORE: u8 = 0;
const FLAG_LAST: u8 = 1;

fn nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn cipher(secret: &[u8; 32]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(secret))
}

/// Buffers plaintext and emits sealed frames.
pub struct ChunkEncryptor {
    cipher: Aes256Gcm,
    prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    pending: Vec<u8>,
    finished: bool,
}

impl ChunkEncryptor {
    /// New encryptor with a random nonce prefix.
    pub fn new(secret: &[u8; 32]) -> Self {
        Self {
            cipher: cipher(secret),
            prefix: rand::random(),
            counter: 0,
            pending: Vec::with_capacity(CHUNK_SIZE),
            finished: false,
        }
    }

    /// Bytes that must be written before the first frame.
    pub fn header(&self) -> [u8; NONCE_PREFIX_LEN] {
        self.prefix
    }

    /// Accept plaintext; returns complete frames ready to be written.
    pub fn update(&mut self, mut data: &[u8]) -> Result<Vec<u8>> {
        if self.finished {
            return Err(FileSwapError::Closed);
        }
        let mut out = Vec::new();
        while !data.is_empty() {
            let room = CHUNK_SIZE - self.pending.len();
            let take = room.min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == CHUNK_SIZE {
                let chunk = std::mem::take(&mut self.pending);
                self.seal(&chunk, FLAG_MORE, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Seal the remaining plaintext as the final frame.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        if self.finished {
            return Err(FileSwapError::Closed);
        }
        self.finished = true;
        let chunk = std::mem::take(&mut self.pending);
        let mut out = Vec::with_capacity(chunk.len() + TAG_LEN + 5);
        self.seal(&chunk, FLAG_LAST, &mut out)?;
        Ok(out)
    }

    fn seal(&mut self, chunk: &[u8], flag: u8, out: &mut Vec<u8>) -> Result<()> {
        let nonce = nonce(&self.prefix, self.counter);
        let aad = [flag];
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: chunk, aad: &aad })
            .map_err(|_| FileSwapError::Crypto("encryption failed".to_string()))?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| FileSwapError::Crypto("too many chunks".to_string()))?;
        out.push(flag);
        out.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        out.extend_from_slice(&sealed);
        Ok(())
    }
}

/// Reads and opens frames produced by [`ChunkEncryptor`].
pub struct ChunkDecryptor {
    cipher: Aes256Gcm,
    prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    finished: bool,
}

impl ChunkDecryptor {
    /// Read the header from `reader`.
    pub async fn start<R: AsyncRead + Unpin>(secret: &[u8; 32], reader: &mut R) -> Result<Self> {
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        reader.read_exact(&mut prefix).await?;
        Ok(Self {
            cipher: cipher(secret),
            prefix,
            counter: 0,
            finished: false,
        })
    }

    /// Next plaintext chunk, `None` after the final frame.
    pub async fn next_chunk<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        let flag = match reader.read_u8().await {
            Ok(flag) => flag,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FileSwapError::Crypto("swap file is truncated".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if flag != FLAG_MORE && flag != FLAG_LAST {
            return Err(FileSwapError::Crypto("corrupt frame flag".to_string()));
        }
        let len = reader.read_u32().await? as usize;
        if len < TAG_LEN || len > CHUNK_SIZE + TAG_LEN {
            return Err(FileSwapError::Crypto("corrupt frame length".to_string()));
        }
        let mut sealed = vec![0u8; len];
        reader.read_exact(&mut sealed).await?;

        let nonce = nonce(&self.prefix, self.counter);
        let aad = [flag];
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: &sealed, aad: &aad })
            .map_err(|_| FileSwapError::Crypto("decryption failed".to_string()))?;
        self.counter = self.counter.wrapping_add(1);
        if flag == FLAG_LAST {
            self.finished = true;
        }
        Ok(Some(plain))
    }
}
