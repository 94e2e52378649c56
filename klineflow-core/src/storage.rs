//! Object storage collaborator.
//!
//! Storage is a flat key space with prefix listing. No versioning or
//! directory semantics are assumed. Puts are create-or-overwrite with atomic
//! visibility: a reader sees the whole object or nothing.

use crate::error::StorageError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Suffix of in-flight local writes; never listed.
const PARTIAL_SUFFIX: &str = ".partial";

/// Trait for object stores (local directory, in-memory, cloud bucket).
///
/// A store is bound to one bucket. Keys use `/` separators.
pub trait ObjectStore: Send + Sync {
    /// Name of the bucket this store serves.
    fn bucket(&self) -> &str;

    /// All keys starting with `prefix`, in ascending key order.
    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    fn object_exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Create or overwrite `path` with `bytes`.
    fn put_object(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    fn get_object(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Delete `path`. Deleting a missing object is not an error; the return
    /// value says whether anything was removed.
    fn delete_object(&self, path: &str) -> Result<bool, StorageError>;
}

/// Fully-qualified reference to an object, as handed to warehouse load jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUri {
    pub bucket: String,
    pub path: String,
}

impl ObjectUri {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.path)
    }
}

// ── Local directory store ──

/// Bucket backed by a local directory: `{root}/{bucket}/{key}`.
///
/// Writes go to a `.partial` sibling and are renamed into place.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    bucket: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    /// Directory holding the bucket's objects.
    pub fn bucket_dir(&self) -> PathBuf {
        self.root.join(&self.bucket)
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
            return Err(StorageError::io(
                key,
                io::Error::new(io::ErrorKind::InvalidInput, "invalid object key"),
            ));
        }
        Ok(key
            .split('/')
            .fold(self.bucket_dir(), |acc, segment| acc.join(segment)))
    }

    fn collect_keys(
        &self,
        dir: &Path,
        prefix: &str,
        out: &mut Vec<String>,
    ) -> Result<(), StorageError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::io(dir.display().to_string(), e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(dir.display().to_string(), e))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|e| StorageError::io(path.display().to_string(), e))?;

            if file_type.is_dir() {
                self.collect_keys(&path, prefix, out)?;
                continue;
            }

            let Some(key) = self.key_for(&path) else {
                continue;
            };
            if key.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            if key.starts_with(prefix) {
                out.push(key);
            }
        }
        Ok(())
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(self.bucket_dir()).ok()?;
        let segments: Option<Vec<&str>> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect();
        Some(segments?.join("/"))
    }
}

impl ObjectStore for LocalObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        self.collect_keys(&self.bucket_dir(), prefix, &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn object_exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.object_path(path)?.is_file())
    }

    fn put_object(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.object_path(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(path, e))?;
        }

        let mut partial = target.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        fs::write(&partial, bytes).map_err(|e| {
            let _ = fs::remove_file(&partial);
            StorageError::io(path, e)
        })?;

        // Atomic rename
        fs::rename(&partial, &target).map_err(|e| {
            let _ = fs::remove_file(&partial);
            StorageError::io(path, e)
        })
    }

    fn get_object(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.object_path(path)?;
        fs::read(&target).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound {
                path: path.to_string(),
            },
            _ => StorageError::io(path, e),
        })
    }

    fn delete_object(&self, path: &str) -> Result<bool, StorageError> {
        let target = self.object_path(path)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }
}

// ── In-memory store ──

/// Bucket held in memory. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .objects
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn object_exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().contains_key(path))
    }

    fn put_object(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.objects.lock().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get_object(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                path: path.to_string(),
            })
    }

    fn delete_object(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().remove(path).is_some())
    }
}
