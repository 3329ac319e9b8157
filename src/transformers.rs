//! Built-in [`DataTransformer`] implementations.
//!
//! Register them on a service (or client) and they run on every whole-value
//! write in ascending priority order:
//!
//! ```
//! use cache_engine::hooks::TransformerManager;
//! use cache_engine::transformers::{CompressionTransformer, EncryptionTransformer};
//! use std::sync::Arc;
//!
//! let manager = TransformerManager::new();
//! manager.add(Arc::new(CompressionTransformer::new()));
//! manager.add(Arc::new(EncryptionTransformer::new([7u8; 32])));
//! assert_eq!(manager.names(), vec!["compression", "encryption"]);
//! ```

use crate::error::{Error, Result};
use crate::hooks::DataTransformer;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use std::io::Read;
use std::sync::Arc;

/// Payloads smaller than this are not worth compressing.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

const NONCE_LEN: usize = 12;

/// Gzip compression above a size threshold.
#[derive(Debug, Clone)]
pub struct CompressionTransformer {
    level: u32,
    min_size: usize,
    priority: i32,
}

impl Default for CompressionTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionTransformer {
    /// Level 6, 1 KiB threshold, priority 10.
    pub fn new() -> Self {
        CompressionTransformer {
            level: 6,
            min_size: DEFAULT_COMPRESSION_THRESHOLD,
            priority: 10,
        }
    }

    /// Gzip level, clamped to 0-9.
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self
    }

    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl DataTransformer for CompressionTransformer {
    fn name(&self) -> &str {
        "compression"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn should_transform(&self, _key: &str, data: &[u8]) -> bool {
        data.len() >= self.min_size
    }

    fn transform(&self, _key: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(data.as_slice(), Compression::new(self.level));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| Error::SerializationError(format!("gzip compression failed: {}", e)))?;
        Ok(compressed)
    }

    fn restore(&self, _key: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| Error::DeserializationError(format!("gzip decompression failed: {}", e)))?;
        Ok(decompressed)
    }
}

/// AES-256-GCM encryption. A fresh 96-bit nonce is prepended to every
/// ciphertext.
#[derive(Clone)]
pub struct EncryptionTransformer {
    cipher: Aes256Gcm,
    priority: i32,
}

impl std::fmt::Debug for EncryptionTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionTransformer")
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl EncryptionTransformer {
    /// Priority 20, so it runs after compression.
    pub fn new(key: [u8; 32]) -> Self {
        EncryptionTransformer {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            priority: 20,
        }
    }

    /// Build from a key slice; must be exactly 32 bytes.
    pub fn from_slice(key: &[u8]) -> Result<Self> {
        let key: [u8; 32] = key.try_into().map_err(|_| {
            Error::ConfigError(format!("encryption key must be 32 bytes, got {}", key.len()))
        })?;
        Ok(Self::new(key))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl DataTransformer for EncryptionTransformer {
    fn name(&self) -> &str {
        "encryption"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn transform(&self, _key: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, data.as_slice())
            .map_err(|e| Error::SerializationError(format!("encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn restore(&self, _key: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(Error::DeserializationError(
                "ciphertext shorter than nonce".to_string(),
            ));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::DeserializationError(format!("decryption failed: {}", e)))
    }
}

type BytePredicate = Arc<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

/// Rejects payloads before they reach the cache.
///
/// Data passes through unchanged; a rejected payload fails the write with
/// [`Error::ValidationError`].
#[derive(Clone)]
pub struct ValidationTransformer {
    max_size: Option<usize>,
    predicate: Option<BytePredicate>,
    priority: i32,
}

impl Default for ValidationTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationTransformer {
    /// Accepts everything until a limit or predicate is set. Priority -10.
    pub fn new() -> Self {
        ValidationTransformer {
            max_size: None,
            predicate: None,
            priority: -10,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Payload is accepted only when `predicate` returns true.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str, &[u8]) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl DataTransformer for ValidationTransformer {
    fn name(&self) -> &str {
        "validation"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn transform(&self, key: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        if let Some(max) = self.max_size {
            if data.len() > max {
                return Err(Error::ValidationError(format!(
                    "value for {} is {} bytes, limit is {}",
                    key,
                    data.len(),
                    max
                )));
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(key, &data) {
                return Err(Error::ValidationError(format!(
                    "value for {} rejected by predicate",
                    key
                )));
            }
        }
        Ok(data)
    }
}

/// Runs the wrapped transformer only when a predicate matches.
///
/// Takes the inner transformer's name, so stored values restore through
/// the inner transformer even after the predicate changes.
pub struct ConditionalTransformer {
    inner: Arc<dyn DataTransformer>,
    predicate: BytePredicate,
}

impl ConditionalTransformer {
    pub fn new<F>(inner: Arc<dyn DataTransformer>, predicate: F) -> Self
    where
        F: Fn(&str, &[u8]) -> bool + Send + Sync + 'static,
    {
        ConditionalTransformer {
            inner,
            predicate: Arc::new(predicate),
        }
    }

    /// Only transform keys starting with `prefix`.
    pub fn for_prefix(inner: Arc<dyn DataTransformer>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::new(inner, move |key, _| key.starts_with(&prefix))
    }
}

impl DataTransformer for ConditionalTransformer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn priority(&self) -> i32 {
        self.inner.priority()
    }

    fn should_transform(&self, key: &str, data: &[u8]) -> bool {
        (self.predicate)(key, data) && self.inner.should_transform(key, data)
    }

    fn transform(&self, key: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        self.inner.transform(key, data)
    }

    fn restore(&self, key: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        self.inner.restore(key, data)
    }
}
