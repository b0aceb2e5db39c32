use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::{payload_digest, CacheEntry, CacheStore, StoreError, StoreResult};
use crate::fingerprint::Fingerprint;

const PAYLOAD_FILE: &str = "payload";
const ENTRY_FILE: &str = "entry.json";

/// On-disk entry metadata. Written after the payload, so its presence marks a
/// complete entry.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    key: Fingerprint,
    payload_digest: String,
    created_at: DateTime<Utc>,
}

/// Filesystem-backed cache store with git-style 2-char sharding.
///
/// Layout: `<root>/<first 2 hex chars>/<remaining hex chars>/{payload,entry.json}`
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    /// Create a new `FsCacheStore` rooted at `root`, creating it if needed.
    pub fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn entry_dir(&self, key: &Fingerprint) -> PathBuf {
        let hex = key.as_str();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    fn read_meta(dir: &Path) -> StoreResult<Option<EntryMeta>> {
        match fs::read(dir.join(ENTRY_FILE)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomic write: write to temp file in the same directory, then rename.
    fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> StoreResult<()> {
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(name)).map_err(|e| e.error)?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn lookup(&self, key: &Fingerprint) -> StoreResult<Option<CacheEntry>> {
        let dir = self.entry_dir(key);
        let Some(meta) = Self::read_meta(&dir)? else {
            return Ok(None);
        };
        let payload = match fs::read(dir.join(PAYLOAD_FILE)) {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Corrupted {
                    key: key.to_string(),
                    expected: meta.payload_digest,
                    actual: "<missing payload>".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let entry = CacheEntry {
            key: meta.key,
            payload,
            payload_digest: meta.payload_digest,
            created_at: meta.created_at,
        };
        if &entry.key != key {
            return Err(StoreError::Corrupted {
                key: key.to_string(),
                expected: key.to_string(),
                actual: entry.key.to_string(),
            });
        }
        entry.verify()?;
        Ok(Some(entry))
    }

    async fn store(&self, key: &Fingerprint, payload: &[u8]) -> StoreResult<()> {
        let dir = self.entry_dir(key);
        let digest = payload_digest(payload);

        if let Some(existing) = Self::read_meta(&dir)? {
            if existing.payload_digest == digest {
                return Ok(());
            }
            return Err(StoreError::Conflict(key.to_string()));
        }

        fs::create_dir_all(&dir)?;
        Self::write_atomic(&dir, PAYLOAD_FILE, payload)?;
        let meta = EntryMeta {
            key: key.clone(),
            payload_digest: digest,
            created_at: Utc::now(),
        };
        Self::write_atomic(&dir, ENTRY_FILE, &serde_json::to_vec_pretty(&meta)?)?;
        Ok(())
    }

    async fn invalidate(&self, key: &Fingerprint) -> StoreResult<()> {
        match fs::remove_dir_all(self.entry_dir(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
