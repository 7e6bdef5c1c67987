use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

use crate::config::CacheConfig;
use crate::domain::product::Product;

type HmacSha256 = Hmac<Sha256>;

const SIGNED_MAGIC: &[u8] = b"PKC1";
const TAG_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("could not read cache file `{path}`: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("could not write cache file `{path}`: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("could not encode cached catalog: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("could not decode cached catalog: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("cache file failed integrity check: {0}")]
    Integrity(String),
}

impl CacheError {
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Read { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Storage-layer transform applied between the JSON document and the bytes on
/// disk.
pub trait StorageTransform: Send + Sync {
    fn encode(&self, plain: &[u8]) -> Vec<u8>;
    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, CacheError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PlainTransform;

impl StorageTransform for PlainTransform {
    fn encode(&self, plain: &[u8]) -> Vec<u8> {
        plain.to_vec()
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, CacheError> {
        Ok(stored.to_vec())
    }
}

/// Prefixes the payload with an HMAC-SHA256 tag so hand-edited ownership
/// flags are detected on load.
///
/// Layout: `PKC1` || tag (32 bytes) || payload.
pub struct SignedTransform {
    key: SecretString,
}

impl SignedTransform {
    pub fn new(key: SecretString) -> Self {
        Self { key }
    }

    fn mac(&self) -> Result<HmacSha256, CacheError> {
        HmacSha256::new_from_slice(self.key.expose_secret().as_bytes())
            .map_err(|error| CacheError::Integrity(format!("invalid signing key: {error}")))
    }
}

impl std::fmt::Debug for SignedTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedTransform").field("key", &"<redacted>").finish()
    }
}

impl StorageTransform for SignedTransform {
    fn encode(&self, plain: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(SIGNED_MAGIC.len() + TAG_LEN + plain.len());
        output.extend_from_slice(SIGNED_MAGIC);
        match self.mac() {
            Ok(mut mac) => {
                mac.update(plain);
                output.extend_from_slice(mac.finalize().into_bytes().as_slice());
            }
            // HMAC accepts keys of any length; a zero tag simply fails to verify.
            Err(_) => output.extend_from_slice(&[0u8; TAG_LEN]),
        }
        output.extend_from_slice(plain);
        output
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, CacheError> {
        let header_len = SIGNED_MAGIC.len() + TAG_LEN;
        if stored.len() < header_len || !stored.starts_with(SIGNED_MAGIC) {
            return Err(CacheError::Integrity("missing signed cache header".to_string()));
        }

        let (tag, payload) = stored[SIGNED_MAGIC.len()..].split_at(TAG_LEN);
        let mut mac = self.mac()?;
        mac.update(payload);
        mac.verify_slice(tag)
            .map_err(|_| CacheError::Integrity("signature mismatch".to_string()))?;

        Ok(payload.to_vec())
    }
}

/// The persisted catalog file.
#[derive(Clone)]
pub struct CatalogCache {
    path: PathBuf,
    transform: Arc<dyn StorageTransform>,
}

impl CatalogCache {
    pub fn new(path: impl Into<PathBuf>, transform: Arc<dyn StorageTransform>) -> Self {
        Self { path: path.into(), transform }
    }

    pub fn plain(path: impl Into<PathBuf>) -> Self {
        Self::new(path, Arc::new(PlainTransform))
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let path = default_directory(config.directory.as_deref()).join(&config.file_name);
        let transform: Arc<dyn StorageTransform> = match &config.signing_key {
            Some(key) => Arc::new(SignedTransform::new(key.clone())),
            None => Arc::new(PlainTransform),
        };
        Self::new(path, transform)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<Product>, CacheError> {
        let stored = fs::read(&self.path)
            .map_err(|source| CacheError::Read { path: self.path.clone(), source })?;
        let plain = self.transform.decode(&stored)?;
        serde_json::from_slice(&plain).map_err(CacheError::Decode)
    }

    pub fn store(&self, products: &[Product]) -> Result<(), CacheError> {
        let plain = serde_json::to_vec(products).map_err(CacheError::Encode)?;
        let encoded = self.transform.encode(&plain);

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|source| CacheError::Write { path: self.path.clone(), source })?;
        }
        fs::write(&self.path, encoded)
            .map_err(|source| CacheError::Write { path: self.path.clone(), source })
    }

    /// Returns `false` when there was no file to remove.
    pub fn clear(&self) -> Result<bool, CacheError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(source) if source.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CacheError::Write { path: self.path.clone(), source }),
        }
    }
}

impl std::fmt::Debug for CatalogCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogCache").field("path", &self.path).finish()
    }
}

fn default_directory(explicit: Option<&Path>) -> PathBuf {
    if let Some(directory) = explicit {
        return directory.to_path_buf();
    }

    dirs::cache_dir()
        .map(|base| base.join("purchasekit"))
        .unwrap_or_else(|| std::env::temp_dir().join("purchasekit"))
}
