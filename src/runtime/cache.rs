//! On-disk response cache.
//!
//! Each entry is one file under the cache root, `<hash>.entry`, named by the
//! blake3 hash of the cache id. The file holds the header metadata as one
//! line of JSON, a newline, then the body bytes. Entries are replaced with a
//! single rename, so a reader sees either the old entry or the new one. The
//! file's modification time is the entry's age.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use super::storage::Storage;

/// A stored response: uncompressed body plus the header lines sent with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Header lines, without content coding.
    pub headers: Vec<String>,
    /// Uncompressed body.
    #[serde(skip)]
    pub body: Vec<u8>,
    /// Whether the original response permitted compression.
    #[serde(default)]
    pub compress: bool,
}

/// Response cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    storage: Storage,
}

impl ResponseCache {
    /// Cache storing entries under `root`.
    pub fn new(root: PathBuf) -> Self {
        Self {
            storage: Storage::new(root),
        }
    }

    /// Cache directory.
    pub fn root(&self) -> &Path {
        self.storage.root()
    }

    fn path(&self, id: &str) -> PathBuf {
        let key = blake3::hash(id.as_bytes()).to_hex();
        self.storage.root().join(format!("{key}.entry"))
    }

    /// Entry for `id` if one exists and is younger than `max_age`.
    ///
    /// Unreadable entries count as misses.
    pub fn probe(&self, id: &str, max_age: Duration) -> Option<CachedResponse> {
        match self.read_fresh(id, max_age) {
            Ok(hit) => hit,
            Err(err) => {
                warn!(id, error = %err, "ignoring unreadable cache entry");
                None
            }
        }
    }

    fn read_fresh(&self, id: &str, max_age: Duration) -> Result<Option<CachedResponse>> {
        let Some((data, modified)) = self.storage.read_stamped(&self.path(id))? else {
            return Ok(None);
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age >= max_age {
            debug!(id, ?age, "cache entry expired");
            return Ok(None);
        }
        let split = data
            .iter()
            .position(|&byte| byte == b'\n')
            .ok_or_else(|| anyhow!("cache entry has no header line"))?;
        let mut cached: CachedResponse = serde_json::from_slice(&data[..split])
            .context("Failed to deserialize cache headers")?;
        cached.body = data[split + 1..].to_vec();
        Ok(Some(cached))
    }

    /// Persist an entry, replacing any previous one.
    pub fn store(&self, id: &str, response: &CachedResponse) -> Result<()> {
        self.storage.create_dir_all(self.storage.root())?;
        // Compact JSON escapes newlines, so the first newline ends the header line.
        let mut data = serde_json::to_vec(response).context("Failed to serialize cache headers")?;
        data.push(b'\n');
        data.extend_from_slice(&response.body);
        self.storage.write_atomic(&self.path(id), &data)?;
        debug!(id, bytes = response.body.len(), "stored cached response");
        Ok(())
    }
}
