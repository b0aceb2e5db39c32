use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;

use super::tree::{copy_tree, tree_digest};
use super::{Artifact, ArtifactId, ArtifactStore, StoreError, StoreResult};
use crate::builder::BuildResult;
use crate::domain::{PublishError, RunId};

const META_FILE: &str = "artifact.json";
const CONTENT_DIR: &str = "content";
const STAGING_PREFIX: &str = ".staging-";

/// Filesystem-backed artifact store.
///
/// Layout: `<root>/<artifact id>/{artifact.json,content/...}`. Each artifact is
/// assembled in a `.staging-*` directory and renamed into place, so a reader
/// never sees a partially written artifact.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn artifact_dir(&self, id: &ArtifactId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn publish_blocking(root: PathBuf, id: ArtifactId, run_id: RunId, source: PathBuf) -> StoreResult<Artifact> {
        let final_dir = root.join(id.as_str());
        if final_dir.exists() {
            return Err(StoreError::AlreadyExists(id.0));
        }

        let staging = root.join(format!("{STAGING_PREFIX}{}", uuid::Uuid::new_v4()));
        let result = Self::assemble(&staging, &final_dir, &id, &run_id, &source);
        if result.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        let artifact = result?;

        match fs::rename(&staging, &final_dir) {
            Ok(()) => Ok(artifact),
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                if final_dir.exists() {
                    Err(StoreError::AlreadyExists(id.0))
                } else {
                    Err(e.into())
                }
            }
        }
    }

    fn assemble(
        staging: &Path,
        final_dir: &Path,
        id: &ArtifactId,
        run_id: &RunId,
        source: &Path,
    ) -> StoreResult<Artifact> {
        let staged_content = staging.join(CONTENT_DIR);
        copy_tree(source, &staged_content)?;
        let (content_digest, file_count) = tree_digest(&staged_content)?;

        let artifact = Artifact {
            id: id.clone(),
            producing_run: run_id.clone(),
            content_root: final_dir.join(CONTENT_DIR),
            content_digest,
            file_count,
            created_at: Utc::now(),
        };
        fs::write(staging.join(META_FILE), serde_json::to_vec_pretty(&artifact)?)?;
        Ok(artifact)
    }

    fn read_meta(dir: &Path) -> StoreResult<Artifact> {
        let bytes = fs::read(dir.join(META_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn publish(&self, run_id: &RunId, result: &BuildResult) -> Result<Artifact, PublishError> {
        let source = result
            .output_root()
            .ok_or_else(|| PublishError::InvalidArgument("cannot publish a failed build".to_string()))?
            .to_path_buf();

        let root = self.root.clone();
        let id = ArtifactId::for_run(run_id);
        let run_id = run_id.clone();
        let artifact = tokio::task::spawn_blocking(move || Self::publish_blocking(root, id, run_id, source))
            .await
            .map_err(|e| PublishError::Unavailable(format!("publish task failed: {e}")))??;
        Ok(artifact)
    }

    async fn retrieve(&self, id: &ArtifactId) -> StoreResult<Artifact> {
        let dir = self.artifact_dir(id);
        if !dir.join(META_FILE).exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Self::read_meta(&dir)
    }

    async fn list(&self) -> StoreResult<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(STAGING_PREFIX) || !entry.path().is_dir() {
                continue;
            }
            match Self::read_meta(&entry.path()) {
                Ok(artifact) => artifacts.push(artifact),
                Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
        artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BuildError;

    fn built_site(dir: &Path) -> BuildResult {
        let out = dir.join("site");
        fs::create_dir_all(out.join("ch1")).unwrap();
        fs::write(out.join("index.html"), "<h1>Book</h1>").unwrap();
        fs::write(out.join("ch1/intro.html"), "intro").unwrap();
        BuildResult::success(out, String::new(), 5)
    }

    #[tokio::test]
    async fn publish_then_retrieve() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(tmp.path().join("artifacts")).unwrap();
        let run = RunId::new();

        let artifact = store.publish(&run, &built_site(tmp.path())).await.unwrap();
        assert_eq!(artifact.producing_run, run);
        assert_eq!(artifact.file_count, 2);
        assert_eq!(
            fs::read_to_string(artifact.content_root.join("index.html")).unwrap(),
            "<h1>Book</h1>"
        );

        let fetched = store.retrieve(&artifact.id).await.unwrap();
        assert_eq!(fetched, artifact);
        assert_eq!(tree_digest(&fetched.content_root).unwrap().0, artifact.content_digest);
    }

    #[tokio::test]
    async fn failed_build_is_invalid_argument() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(tmp.path()).unwrap();
        let failed = BuildResult::failure(BuildError::InvalidOutput("none".into()), String::new(), 1);
        assert!(matches!(
            store.publish(&RunId::new(), &failed).await,
            Err(PublishError::InvalidArgument(_))
        ));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn republish_same_run_never_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(tmp.path().join("artifacts")).unwrap();
        let run = RunId::new();
        let first = store.publish(&run, &built_site(tmp.path())).await.unwrap();

        assert!(matches!(
            store.publish(&run, &built_site(tmp.path())).await,
            Err(PublishError::AlreadyExists(_))
        ));
        assert_eq!(store.retrieve(&first.id).await.unwrap(), first);
    }

    #[tokio::test]
    async fn retrieve_unknown_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(tmp.path()).unwrap();
        assert!(matches!(
            store.retrieve(&ArtifactId("run-missing".into())).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_publishes_for_distinct_runs_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FsArtifactStore::new(tmp.path().join("artifacts")).unwrap());
        let site = tmp.path().to_path_buf();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let src = site.join(format!("src-{i}"));
            handles.push(tokio::spawn(async move {
                let result = built_site(&src);
                store.publish(&RunId::new(), &result).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 8);
        let leftovers: Vec<_> = fs::read_dir(tmp.path().join("artifacts"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(STAGING_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }
}
