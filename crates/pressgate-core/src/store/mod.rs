//! Storage abstractions for the pipeline:
//! - `CacheStore`: fingerprint-keyed resolved-dependency blobs
//! - `ArtifactStore`: immutable, run-keyed build outputs
//!
//! Both stores are append-only. Filesystem backends live in `fs_cache` and
//! `fs_artifacts`; in-memory fakes live in [`crate::fakes`].

pub mod fs_artifacts;
pub mod fs_cache;
pub mod tree;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::builder::BuildResult;
use crate::domain::{PublishError, RunId};
use crate::fingerprint::Fingerprint;

pub use fs_artifacts::FsArtifactStore;
pub use fs_cache::FsCacheStore;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("cache entry {key} is corrupted: expected digest {expected}, got {actual}")]
    Corrupted {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("conflicting payload for cache key {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// SHA-256 hex of a payload.
pub fn payload_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// ---------------------------------------------------------------------------
// Cache Store
// ---------------------------------------------------------------------------

/// A cached resolved-dependency blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: Fingerprint,
    pub payload: Vec<u8>,
    /// SHA-256 of `payload`, recorded at store time and checked on lookup.
    pub payload_digest: String,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: Fingerprint, payload: Vec<u8>) -> Self {
        let payload_digest = payload_digest(&payload);
        Self {
            key,
            payload,
            payload_digest,
            created_at: Utc::now(),
        }
    }

    /// Re-hash the payload and compare against the recorded digest.
    pub fn verify(&self) -> StoreResult<()> {
        let actual = payload_digest(&self.payload);
        if actual != self.payload_digest {
            return Err(StoreError::Corrupted {
                key: self.key.to_string(),
                expected: self.payload_digest.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Fingerprint-keyed cache of resolved dependency state.
///
/// Guarantees:
/// - `store` is idempotent for an identical `(key, payload)` pair.
/// - `store` with a different payload under an existing key returns
///   `StoreError::Conflict` and leaves the existing entry alone.
/// - `lookup` verifies the payload digest and returns `StoreError::Corrupted`
///   on mismatch.
/// - A successful `store` is visible to every later `lookup`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn lookup(&self, key: &Fingerprint) -> StoreResult<Option<CacheEntry>>;

    async fn store(&self, key: &Fingerprint, payload: &[u8]) -> StoreResult<()>;

    /// Remove an entry. No-op if absent.
    async fn invalidate(&self, key: &Fingerprint) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// Artifact Store
// ---------------------------------------------------------------------------

/// Artifact identifier, derived from the producing run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub String);

impl ArtifactId {
    pub fn for_run(run_id: &RunId) -> Self {
        ArtifactId(format!("run-{}", run_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A published build output. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub producing_run: RunId,
    /// Root of the stored output tree.
    pub content_root: PathBuf,
    /// See [`tree::tree_digest`].
    pub content_digest: String,
    pub file_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Durable, versioned build outputs.
///
/// Guarantees:
/// - `publish` rejects failed builds with `PublishError::InvalidArgument`.
/// - An artifact is never overwritten: a second publish for the same run
///   returns `PublishError::AlreadyExists`.
/// - Concurrent publishes for distinct runs never collide.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn publish(&self, run_id: &RunId, result: &BuildResult) -> Result<Artifact, PublishError>;

    /// Returns `StoreError::NotFound` if absent.
    async fn retrieve(&self, id: &ArtifactId) -> StoreResult<Artifact>;

    /// All artifacts, oldest first.
    async fn list(&self) -> StoreResult<Vec<Artifact>>;
}
