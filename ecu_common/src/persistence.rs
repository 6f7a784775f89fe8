//! Key/value persistence for calibration tables and configuration blobs.
//!
//! The core depends only on [`KvStore`] — the actual storage medium is an
//! external collaborator. [`FileKvStore`] is the
//! reference implementation used by tests and the standalone binary: one
//! file per key, written via a temp-file-plus-rename so a crash mid-write
//! never corrupts a previously-good calibration.
//!
//! Every record on the wire is `[u32 length][payload][u32 crc32]`, the CRC
//! computed with the CRC-32/Ethernet polynomial (`crc32fast`) over the
//! payload bytes only. This is the outer integrity check; `Table16x16`'s own
//! sum-of-values checksum is nested inside the payload and independently
//! guards against in-memory corruption of the cell contents.

use std::io::Write;
use std::path::PathBuf;

/// Error surfaced by a [`KvStore`] operation.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Underlying I/O failure (open, read, write, rename).
    #[error("persistence I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The stored record's CRC-32 trailer did not match its payload.
    #[error("persistence record for key '{0}' failed CRC check")]
    CrcMismatch(String),
    /// The stored record was shorter than its own length prefix.
    #[error("persistence record for key '{0}' is truncated")]
    Truncated(String),
    /// No record exists for the requested key.
    #[error("no persisted record for key '{0}'")]
    NotFound(String),
}

/// Minimal key/value blob store contract the core depends on.
pub trait KvStore {
    /// Fetch the raw bytes for `key`, or `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
    /// Store raw bytes for `key`, overwriting any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError>;
}

/// Frame a payload as `[u32 len][payload][u32 crc32/ethernet]`.
pub fn frame_record(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    let crc = crc32fast::hash(payload);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Parse a framed record produced by [`frame_record`], verifying length and CRC.
pub fn parse_record(key: &str, framed: &[u8]) -> Result<Vec<u8>, PersistenceError> {
    if framed.len() < 8 {
        return Err(PersistenceError::Truncated(key.to_string()));
    }
    let len = u32::from_le_bytes(framed[0..4].try_into().unwrap()) as usize;
    if framed.len() < 4 + len + 4 {
        return Err(PersistenceError::Truncated(key.to_string()));
    }
    let payload = &framed[4..4 + len];
    let stored_crc = u32::from_le_bytes(framed[4 + len..4 + len + 4].try_into().unwrap());
    let actual_crc = crc32fast::hash(payload);
    if stored_crc != actual_crc {
        return Err(PersistenceError::CrcMismatch(key.to_string()));
    }
    Ok(payload.to_vec())
}

/// Serialize `value` to JSON, frame it, and write it through `store` under `key`.
pub fn put_json<T: serde::Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), PersistenceError> {
    let payload = serde_json::to_vec(value).map_err(|e| {
        PersistenceError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    store.put(key, &frame_record(&payload))
}

/// Read, CRC-check, and JSON-decode the record under `key`.
pub fn get_json<T: serde::de::DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<T, PersistenceError> {
    let framed = store
        .get(key)?
        .ok_or_else(|| PersistenceError::NotFound(key.to_string()))?;
    let payload = parse_record(key, &framed)?;
    serde_json::from_slice(&payload)
        .map_err(|e| PersistenceError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

/// One file per key under `dir`, written atomically via a sibling temp file and rename.
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    /// Open (creating if necessary) a file-backed store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        let final_path = self.path_for(key);
        let tmp_path = self.dir.join(format!(".{key}.tmp"));
        {
            let mut f = std::fs::File::create(&tmp_path)?;
            f.write_all(value)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

/// In-memory [`KvStore`] used by unit tests that don't need a real filesystem.
#[derive(Default)]
pub struct MemKvStore {
    inner: std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl KvStore for MemKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        self.inner
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
