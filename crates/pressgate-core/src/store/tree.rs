//! Directory-tree helpers shared by the artifact store and hosting endpoint.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Deterministic digest of a directory tree and its regular-file count.
///
/// Hashes each file's `/`-separated relative path and bytes, in sorted path
/// order. Symlinks are followed.
pub fn tree_digest(root: &Path) -> io::Result<(String, u64)> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for rel in &files {
        let bytes = fs::read(root.join(rel))?;
        hasher.update(rel.as_bytes());
        hasher.update(b"\0");
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok((hex::encode(hasher.finalize()), files.len() as u64))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let meta = fs::metadata(&path)?;
        if meta.is_dir() {
            collect_files(root, &path, out)?;
        } else if meta.is_file() {
            out.push(relative_key(root, &path));
        }
    }
    Ok(())
}

fn relative_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Recursively copy `src` into `dst`, creating `dst`.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to: PathBuf = dst.join(entry.file_name());
        if fs::metadata(&from)?.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

/// Whether `dir` exists and contains at least one entry.
pub fn is_non_empty_dir(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn digest_stable_across_copies() {
        let a = tempfile::tempdir().unwrap();
        write(a.path(), "index.html", "<h1>hi</h1>");
        write(a.path(), "ch1/intro.html", "intro");

        let b = tempfile::tempdir().unwrap();
        copy_tree(a.path(), &b.path().join("copy")).unwrap();

        let (da, na) = tree_digest(a.path()).unwrap();
        let (db, nb) = tree_digest(&b.path().join("copy")).unwrap();
        assert_eq!(da, db);
        assert_eq!(na, 2);
        assert_eq!(nb, 2);
    }

    #[test]
    fn digest_sensitive_to_path_and_content() {
        let a = tempfile::tempdir().unwrap();
        write(a.path(), "a.html", "x");
        let b = tempfile::tempdir().unwrap();
        write(b.path(), "b.html", "x");
        let c = tempfile::tempdir().unwrap();
        write(c.path(), "a.html", "y");

        let da = tree_digest(a.path()).unwrap().0;
        assert_ne!(da, tree_digest(b.path()).unwrap().0);
        assert_ne!(da, tree_digest(c.path()).unwrap().0);
    }

    #[test]
    fn non_empty_dir_checks() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_non_empty_dir(dir.path()));
        assert!(!is_non_empty_dir(&dir.path().join("missing")));
        write(dir.path(), "f", "1");
        assert!(is_non_empty_dir(dir.path()));
    }
}
