use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rate store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid rate store key: {0}")]
    InvalidKey(String),
}

// store_atomic must never leave a half-written value visible to load
pub trait RateStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn store_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

// Directory of `<key>.json` files
pub struct FsStore {
    dir: PathBuf,
    tmp_seq: AtomicU64,
}

impl FsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tmp_seq: AtomicU64::new(0),
        }
    }

    // Creates the directory if missing
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::new(dir);
        fs::create_dir_all(&store.dir).map_err(|source| StoreError::Io {
            path: store.dir.clone(),
            source,
        })?;
        Ok(store)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        // keys are hex digests; anything else could escape the directory
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl RateStore for FsStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn store_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;

        // unique temp name so concurrent writers never share a temp file
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self
            .dir
            .join(format!("{}.json.tmp.{}.{}", key, std::process::id(), seq));

        let io_err = |source| StoreError::Io {
            path: tmp_path.clone(),
            source,
        };

        let write_tmp = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()
        };

        if let Err(e) = write_tmp() {
            let _ = fs::remove_file(&tmp_path);
            return Err(io_err(e));
        }

        if let Err(source) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(StoreError::Io { path, source });
        }

        #[cfg(unix)]
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        Ok(())
    }
}

// In-process store, nothing survives a restart
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryStore {
    pub fn insert_raw(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), bytes.into());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl RateStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn store_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}
