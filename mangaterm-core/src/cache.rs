use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Storage address of a page: lowercase hex SHA-256 of its resource identifier.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_resource(resource: &str) -> Self {
        Self(format!("{:x}", Sha256::digest(resource.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content-addressed byte store shared by prefetch workers and the reader.
///
/// Implementations must never expose a partially written entry: once `has`
/// returns true for a key, `get` yields the complete payload. Writing the
/// same key twice is allowed and leaves a complete entry in place.
pub trait ContentCache: Send + Sync {
    fn has(&self, key: &CacheKey) -> bool;
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;
    fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUsage {
    pub entries: usize,
    pub bytes: u64,
}

/// One file per key under a single directory.
///
/// Writes land in a temporary file inside the cache directory and are renamed
/// into place, so lookups only ever see complete files.
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| CacheError::io(&root, err))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    /// Removes every entry, including temporaries left behind by interrupted writes.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        let entries = fs::read_dir(&self.root).map_err(|err| CacheError::io(&self.root, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| CacheError::io(&self.root, err))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(CacheError::io(&path, err)),
            }
        }
        debug!(removed, root = %self.root.display(), "cleared page cache");
        Ok(removed)
    }

    pub fn usage(&self) -> Result<CacheUsage, CacheError> {
        let mut usage = CacheUsage::default();
        let entries = fs::read_dir(&self.root).map_err(|err| CacheError::io(&self.root, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| CacheError::io(&self.root, err))?;
            if is_temporary(&entry.file_name().to_string_lossy()) {
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|err| CacheError::io(&entry.path(), err))?;
            if metadata.is_file() {
                usage.entries += 1;
                usage.bytes += metadata.len();
            }
        }
        Ok(usage)
    }
}

fn is_temporary(name: &str) -> bool {
    name.starts_with('.')
}

impl ContentCache for DiskCache {
    fn has(&self, key: &CacheKey) -> bool {
        self.entry_path(key).is_file()
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.entry_path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CacheError::io(&path, err)),
        }
    }

    fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        let mut tmp =
            NamedTempFile::new_in(&self.root).map_err(|err| CacheError::io(&self.root, err))?;
        if let Err(err) = tmp.write_all(bytes).and_then(|()| tmp.flush()) {
            return Err(CacheError::io(tmp.path(), err));
        }
        tmp.persist(&path).map_err(|err| {
            warn!(key = %key, "failed to move cache entry into place");
            CacheError::io(&path, err.error)
        })?;
        Ok(())
    }
}

/// In-process cache used by tests and embedders that do not want disk state.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl ContentCache for MemoryCache {
    fn has(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), CacheError> {
        self.entries.lock().insert(key.clone(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cache_key_is_stable_sha256_hex() {
        let key = CacheKey::for_resource("https://example.com/a.jpg");
        assert_eq!(key, CacheKey::for_resource("https://example.com/a.jpg"));
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(key, CacheKey::for_resource("https://example.com/b.jpg"));
    }

    #[test]
    fn cache_key_of_empty_resource_matches_known_digest() {
        assert_eq!(
            CacheKey::for_resource("").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn disk_cache_round_trips_and_overwrites() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path().join("pages")).unwrap();
        let key = CacheKey::for_resource("page-1");

        assert!(!cache.has(&key));
        assert!(cache.get(&key).unwrap().is_none());

        cache.put(&key, b"first").unwrap();
        assert!(cache.has(&key));
        cache.put(&key, b"second").unwrap();
        assert_eq!(cache.get(&key).unwrap().as_deref(), Some(&b"second"[..]));
    }

    #[test]
    fn disk_cache_ignores_temporaries_and_clears_everything() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();
        cache.put(&CacheKey::for_resource("a"), b"1234").unwrap();
        cache.put(&CacheKey::for_resource("b"), b"56").unwrap();
        fs::write(dir.path().join(".tmpdangling"), b"partial").unwrap();

        let usage = cache.usage().unwrap();
        assert_eq!(usage.entries, 2);
        assert_eq!(usage.bytes, 6);

        assert_eq!(cache.clear().unwrap(), 3);
        assert_eq!(cache.usage().unwrap(), CacheUsage::default());
        assert!(!cache.has(&CacheKey::for_resource("a")));
    }

    #[test]
    fn memory_cache_tracks_entries() {
        let cache = MemoryCache::new();
        let key = CacheKey::for_resource("x");
        assert!(cache.is_empty());
        cache.put(&key, b"data").unwrap();
        cache.put(&key, b"data").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.has(&key));
    }
}
