//! Dependency manifests and the fingerprint used as the cache key.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::ResolveError;

/// SHA-256 over the dependency manifests, hex encoded.
///
/// Pure function of manifest names and contents: identical manifests always
/// produce the identical fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Digest an ordered list of `(name, contents)` pairs.
    pub fn compute<'a, I>(files: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut hasher = Sha256::new();
        for (name, contents) in files {
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            hasher.update(contents);
            hasher.update(b"\0");
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Parse a 64-char hex fingerprint.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Fingerprint(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One manifest file as read from disk.
#[derive(Debug, Clone)]
pub struct ManifestFile {
    /// File name only, so relocating the checkout keeps the fingerprint stable.
    pub name: String,
    pub path: PathBuf,
    pub contents: Vec<u8>,
}

/// The declared dependency manifests, in configured order.
#[derive(Debug, Clone)]
pub struct DependencyManifest {
    files: Vec<ManifestFile>,
}

impl DependencyManifest {
    /// Read every manifest in `paths`.
    pub fn load(paths: &[PathBuf]) -> Result<Self, ResolveError> {
        if paths.is_empty() {
            return Err(ResolveError::NoManifests);
        }
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let contents = std::fs::read(path).map_err(|source| ResolveError::ManifestRead {
                path: path.clone(),
                source,
            })?;
            files.push(ManifestFile {
                name: manifest_name(path),
                path: path.clone(),
                contents,
            });
        }
        Ok(Self { files })
    }

    pub fn from_files(files: Vec<ManifestFile>) -> Self {
        Self { files }
    }

    pub fn files(&self) -> &[ManifestFile] {
        &self.files
    }

    pub fn paths(&self) -> Vec<&Path> {
        self.files.iter().map(|f| f.path.as_path()).collect()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(
            self.files
                .iter()
                .map(|f| (f.name.as_str(), f.contents.as_slice())),
        )
    }

    /// Collect pinned `name = version` entries from every `[dependencies]` table.
    ///
    /// Accepts both `name = "1.2.3"` and `name = { version = "1.2.3" }`. Later
    /// manifests override earlier ones for the same name.
    pub fn pins(&self) -> Result<BTreeMap<String, String>, ResolveError> {
        let mut pins = BTreeMap::new();
        for file in &self.files {
            let invalid = |reason: String| ResolveError::InvalidManifest {
                path: file.path.clone(),
                reason,
            };
            let text = std::str::from_utf8(&file.contents).map_err(|e| invalid(e.to_string()))?;
            let doc: toml::Table = text.parse().map_err(|e: toml::de::Error| invalid(e.to_string()))?;

            let Some(deps) = doc.get("dependencies") else {
                continue;
            };
            let deps = deps
                .as_table()
                .ok_or_else(|| invalid("`dependencies` is not a table".to_string()))?;

            for (name, spec) in deps {
                let version = match spec {
                    toml::Value::String(v) => v.clone(),
                    toml::Value::Table(t) => t
                        .get("version")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .ok_or_else(|| invalid(format!("dependency `{name}` has no version")))?,
                    _ => return Err(invalid(format!("dependency `{name}` is not pinned"))),
                };
                pins.insert(name.clone(), version);
            }
        }
        Ok(pins)
    }
}

fn manifest_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
