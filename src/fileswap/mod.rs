//! One-shot encrypted file downloads.
//!
//! Large exports are written through a [`FileWriter`] into an encrypted temp
//! file. Closing the writer yields a signed, expiring token; presenting the
//! token to the download endpoint streams the decrypted content once and
//! deletes the file.
//!
//! A single random 256-bit secret per [`FileSwap`] signs tokens (HS256) and
//! encrypts file contents (AES-256-GCM).

pub mod crypto;
mod handler;


pub use handler::{download_handler, DownloadQuery};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::FileSwapSettings;
use crypto::{ChunkDecryptor, ChunkEncryptor};

pub const FILE_NOT_FOUND_MESSAGE: &str = "Download file not found";
pub const TOKEN_EXPIRED_MESSAGE: &str = "download token is expired";
pub const TOKEN_INVALID_MESSAGE: &str = "invalid download token";

/// Errors from the file-swap handler.
#[derive(Debug, Error)]
pub enum FileSwapError {
    /// Caller-facing rejection (bad token, file already downloaded).
    #[error("{0}")]
    BadRequest(String),

    #[error("file swap io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file swap crypto error: {0}")]
    Crypto(String),

    #[error("failed to sign download token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("file writer is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, FileSwapError>;

/// Claims carried by a download token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadClaims {
    /// File name of the encrypted temp file inside the swap directory.
    pub temp_file_name: String,
    /// Name offered to the browser.
    pub download_file_name: String,
    /// Expiry, unix seconds.
    pub exp: u64,
}

struct Inner {
    secret: [u8; 32],
    dir: PathBuf,
}

/// Owns the secret and the directory of swap files.
#[derive(Clone)]
pub struct FileSwap {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FileSwap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSwap")
            .field("dir", &self.inner.dir)
            .finish_non_exhaustive()
    }
}

impl Default for FileSwap {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl FileSwap {
    /// Handler writing swap files into `dir`, with a fresh random secret.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                secret: rand::random(),
                dir: dir.into(),
            }),
        }
    }

    pub fn from_settings(settings: &FileSwapSettings) -> Self {
        match &settings.temp_dir {
            Some(dir) => Self::new(dir.clone()),
            None => Self::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Create an encrypting writer backed by a new temp file.
    ///
    /// `pattern` follows the `prefix*suffix` convention; the `*` is replaced
    /// by random characters. Without a `*` the pattern is used as prefix.
    pub fn new_file_writer(&self, pattern: &str) -> Result<FileWriter> {
        let (prefix, suffix) = pattern.split_once('*').unwrap_or((pattern, ""));
        let temp = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(&self.inner.dir)?;
        let (file, path) = temp.keep().map_err(|e| FileSwapError::Io(e.error))?;
        let encryptor = ChunkEncryptor::new(&self.inner.secret);
        debug!(path = %path.display(), "swap file created");
        Ok(FileWriter {
            swap: self.clone(),
            file: Some(File::from_std(file)),
            path,
            encryptor,
            header_written: false,
            closed: false,
        })
    }

    fn sign(&self, claims: &DownloadClaims) -> Result<String> {
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(&self.inner.secret),
        )?)
    }

    /// Verify a token and return its claims.
    pub fn verify_token(&self, token: &str) -> Result<DownloadClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = jsonwebtoken::decode::<DownloadClaims>(
            token,
            &DecodingKey::from_secret(&self.inner.secret),
            &validation,
        )
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => {
                FileSwapError::BadRequest(TOKEN_EXPIRED_MESSAGE.to_string())
            }
            _ => FileSwapError::BadRequest(TOKEN_INVALID_MESSAGE.to_string()),
        })?;
        let claims = data.claims;
        if !is_plain_file_name(&claims.temp_file_name) {
            return Err(FileSwapError::BadRequest(TOKEN_INVALID_MESSAGE.to_string()));
        }
        Ok(claims)
    }

    /// Claim the file behind `token` for a single download.
    ///
    /// The file is moved to a private name first; of two concurrent
    /// redemptions only one can win the rename.
    pub async fn redeem(&self, token: &str) -> Result<Download> {
        let claims = self.verify_token(token)?;
        let source = self.inner.dir.join(&claims.temp_file_name);
        let claimed_path = self.inner.dir.join(format!(
            "{}.claimed-{}",
            claims.temp_file_name,
            hex::encode(rand::random::<[u8; 8]>())
        ));

        match tokio::fs::rename(&source, &claimed_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileSwapError::BadRequest(FILE_NOT_FOUND_MESSAGE.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        let claimed = ClaimedFile { path: claimed_path };

        let mut file = File::open(&claimed.path).await?;
        let decryptor = ChunkDecryptor::start(&self.inner.secret, &mut file).await?;
        Ok(Download {
            file_name: claims.download_file_name,
            reader: DownloadReader {
                file,
                decryptor,
                _claimed: claimed,
            },
        })
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

/// Removes a claimed swap file when dropped.
struct ClaimedFile {
    path: PathBuf,
}

impl Drop for ClaimedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove swap file");
            }
        }
    }
}

/// A redeemed download.
pub struct Download {
    pub file_name: String,
    pub reader: DownloadReader,
}

/// Decrypting reader over a claimed swap file. The file is deleted on drop.
pub struct DownloadReader {
    file: File,
    decryptor: ChunkDecryptor,
    _claimed: ClaimedFile,
}

impl DownloadReader {
    /// Next plaintext chunk, `None` at the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        self.decryptor.next_chunk(&mut self.file).await
    }

    /// Decrypt everything into memory.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

/// Write-through encrypting writer.
pub struct FileWriter {
    swap: FileSwap,
    file: Option<File>,
    path: PathBuf,
    encryptor: ChunkEncryptor,
    header_written: bool,
    closed: bool,
}

impl FileWriter {
    /// Path of the encrypted temp file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(FileSwapError::Closed)
    }

    async fn ensure_header(&mut self) -> Result<()> {
        if !self.header_written {
            let header = self.encryptor.header();
            self.file_mut()?.write_all(&header).await?;
            self.header_written = true;
        }
        Ok(())
    }

    /// Encrypt and append `data`.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(FileSwapError::Closed);
        }
        self.ensure_header().await?;
        let frames = self.encryptor.update(data)?;
        if !frames.is_empty() {
            self.file_mut()?.write_all(&frames).await?;
        }
        Ok(())
    }

    /// Flush and finalize the ciphertext. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.ensure_header().await?;
        let last = self.encryptor.finish()?;
        let mut file = self.file.take().ok_or(FileSwapError::Closed)?;
        file.write_all(&last).await?;
        file.flush().await?;
        file.sync_all().await?;
        self.closed = true;
        Ok(())
    }

    /// Close the writer and mint a download token valid for `expire_in`.
    pub async fn download_token(
        &mut self,
        download_file_name: &str,
        expire_in: Duration,
    ) -> Result<String> {
        self.close().await?;
        let temp_file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FileSwapError::Crypto("swap file name is not utf-8".to_string()))?
            .to_string();
        let exp = chrono::Utc::now().timestamp().max(0) as u64 + expire_in.as_secs();
        self.swap.sign(&DownloadClaims {
            temp_file_name,
            download_file_name: download_file_name.to_string(),
            exp,
        })
    }

    /// Close and delete the temp file regardless of state.
    pub async fn remove(mut self) -> Result<()> {
        self.file.take();
        self.closed = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
