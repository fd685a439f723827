//! Directory-based object backend for persistent storage.

use crate::backend::ObjectBackend;
use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Suffix of in-progress writes; such files are never listed.
const TEMP_SUFFIX: &str = ".partial";

/// A directory-based object backend.
///
/// Each object is a file under the root directory, with `/`-separated key
/// components mapped to nested directories. Data survives process restarts.
///
/// # Durability
///
/// `put` writes to a temporary sibling file, syncs it with `File::sync_all()`
/// and renames it over the destination, so readers observe either the old
/// object or the complete new one.
///
/// # Example
///
/// ```no_run
/// use tessera_storage::{ObjectBackend, FileBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("store")).unwrap();
/// backend.put("collections/c1/versions/1", b"persistent data").unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    temp_counter: AtomicU64,
}

impl FileBackend {
    /// Opens or creates a store rooted at the given directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        tracing::debug!(root = %root.display(), "opened file backend");
        Ok(Self {
            root: root.to_path_buf(),
            temp_counter: AtomicU64::new(0),
        })
    }

    /// Returns the root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves an object key to a file path, rejecting keys that would
    /// escape the root directory.
    fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.ends_with(TEMP_SUFFIX) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        let mut path = self.root.clone();
        for component in key.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(StorageError::InvalidKey(key.to_string()));
            }
            path.push(component);
        }
        Ok(path)
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> io::Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.collect_keys(&path, keys)?;
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !key.ends_with(TEMP_SUFFIX) {
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl ObjectBackend for FileBackend {
    fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let mut temp = path.clone().into_os_string();
        temp.push(format!(".{}.{n}{TEMP_SUFFIX}", std::process::id()));
        let temp = PathBuf::from(temp);

        {
            let mut file = File::create(&temp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::not_found(key)),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        // Walk from the deepest directory fully named by the prefix.
        let dir_part = prefix.rsplit_once('/').map_or("", |(dir, _)| dir);
        let mut start = self.root.clone();
        for component in dir_part.split('/').filter(|c| !c.is_empty()) {
            if component == "." || component == ".." {
                return Err(StorageError::InvalidKey(prefix.to_string()));
            }
            start.push(component);
        }

        let mut keys = Vec::new();
        self.collect_keys(&start, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_put_get() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();

        backend.put("a/b/c", b"hello").unwrap();
        assert_eq!(&backend.get("a/b/c").unwrap()[..], b"hello");
        assert!(dir.path().join("a").join("b").join("c").exists());
    }

    #[test]
    fn file_get_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        assert!(backend.get("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();

        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend.put("x/1", b"persistent data").unwrap();
        }

        {
            let backend = FileBackend::open(dir.path()).unwrap();
            assert_eq!(&backend.get("x/1").unwrap()[..], b"persistent data");
        }
    }

    #[test]
    fn file_list_is_sorted_and_skips_partial_writes() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend.put("c/m/2", b"").unwrap();
        backend.put("c/m/10", b"").unwrap();
        backend.put("c/n/1", b"").unwrap();
        fs::write(dir.path().join("c").join("m").join("3.0.0.partial"), b"").unwrap();

        assert_eq!(backend.list("c/m/").unwrap(), vec!["c/m/10", "c/m/2"]);
        assert_eq!(backend.list("c/").unwrap().len(), 3);
        assert_eq!(backend.list("c/m/1").unwrap(), vec!["c/m/10"]);
        assert!(backend.list("missing/").unwrap().is_empty());
    }

    #[test]
    fn file_delete() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend.put("a", b"x").unwrap();
        backend.delete("a").unwrap();
        backend.delete("a").unwrap();
        assert!(!backend.exists("a").unwrap());
    }

    #[test]
    fn file_rejects_escaping_keys() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        assert!(matches!(
            backend.put("../outside", b"x"),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            backend.get("/abs"),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            backend.get("a//b"),
            Err(StorageError::InvalidKey(_))
        ));
    }
}
