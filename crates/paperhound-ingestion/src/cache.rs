//! On-disk artifact cache.
//!
//! Layout:
//!   <dir>/<sha256(url)>.pdf
//!   <dir>/manifest.json   key -> { url, verified, size, content_hash, fetched_at }
//!
//! Only verified artifacts are ever recorded. The manifest is rewritten
//! through a temp file + rename so a crash never leaves it half-written.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::models::DownloadedArtifact;

const MANIFEST_FILE: &str = "manifest.json";

/// Cache key for a source URL.
pub fn cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.trim().as_bytes()))
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    pub verified: bool,
    pub size: u64,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

pub struct ArtifactCache {
    dir: PathBuf,
    manifest: Mutex<HashMap<String, ManifestEntry>>,
    /// One lock per key so concurrent downloads of the same URL serialize.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArtifactCache {
    /// Open (or create) a cache directory and load its manifest.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = match std::fs::read(&manifest_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %manifest_path.display(), error = %e, "Unreadable cache manifest, starting empty");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };

        Ok(Self { dir, manifest: Mutex::new(manifest), locks: Mutex::new(HashMap::new()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.pdf"))
    }

    /// Per-key async lock. The map entry goes away once the last holder
    /// of the returned handle drops it.
    pub fn key_lock(&self, key: &str) -> KeyLock<'_> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        let mutex = locks.entry(key.to_string()).or_default().clone();
        KeyLock { cache: self, key: key.to_string(), mutex }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// A verified artifact for `url`, if the manifest has one and the file
    /// on disk still matches it.
    pub fn lookup(&self, paper: &str, url: &str) -> Option<DownloadedArtifact> {
        let key = cache_key(url);
        let entry = {
            let manifest = self.manifest.lock().unwrap_or_else(|p| p.into_inner());
            manifest.get(&key).cloned()?
        };
        if !entry.verified {
            return None;
        }
        let path = self.path_for(&key);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.len() == entry.size => {
                debug!(%key, "Cache hit");
                Some(DownloadedArtifact {
                    paper: paper.to_string(),
                    url: entry.url,
                    cache_key: key,
                    path,
                    content_hash: entry.content_hash,
                    size: entry.size,
                    verified: true,
                    fetched_at: entry.fetched_at,
                })
            }
            _ => {
                warn!(%key, "Manifest entry without matching file, ignoring");
                None
            }
        }
    }

    /// Record a verified artifact and persist the manifest.
    ///
    /// The manifest lock is held through the rename so an older snapshot
    /// can never replace a newer one on disk.
    pub fn record(&self, artifact: &DownloadedArtifact) -> std::io::Result<()> {
        let mut manifest = self.manifest.lock().unwrap_or_else(|p| p.into_inner());
        manifest.insert(
            artifact.cache_key.clone(),
            ManifestEntry {
                url: artifact.url.clone(),
                verified: artifact.verified,
                size: artifact.size,
                content_hash: artifact.content_hash.clone(),
                fetched_at: artifact.fetched_at,
            },
        );
        let snapshot = serde_json::to_vec_pretty(&*manifest)?;
        self.write_atomic(MANIFEST_FILE, &snapshot)
    }

    /// Write `bytes` to `<dir>/<name>` via a temp file in the same directory.
    pub fn write_atomic(&self, name: &str, bytes: &[u8]) -> std::io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.dir.join(name)).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.manifest.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle on one key's lock; see [`ArtifactCache::key_lock`].
pub struct KeyLock<'a> {
    cache: &'a ArtifactCache,
    key: String,
    mutex: Arc<tokio::sync::Mutex<()>>,
}

impl KeyLock<'_> {
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.mutex.lock().await
    }
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.cache.locks.lock().unwrap_or_else(|p| p.into_inner());
        // The map's copy plus ours: nobody else is waiting.
        if Arc::strong_count(&self.mutex) == 2 {
            locks.remove(&self.key);
        }
    }
}
