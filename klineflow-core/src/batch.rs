//! Batch writer — commits one page of klines as one immutable object.
//!
//! Features:
//! - Deterministic object path from the batch's bucket timestamp
//! - Skip-on-exists, so overlapping runs never write the same object twice
//! - Local staging file removed on every exit path
//! - Discard of the trailing undersized page

use crate::columnar;
use crate::domain::{Batch, Kline};
use crate::error::{ExtractError, StorageError};
use crate::path::PathCodec;
use crate::storage::ObjectStore;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// What happened to a batch handed to [`BatchWriter::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    /// An object already existed at the path; nothing was written.
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub path: String,
    pub status: WriteStatus,
    pub rows: usize,
}

/// Serializes batches to Parquet and commits them to object storage.
#[derive(Clone)]
pub struct BatchWriter {
    store: Arc<dyn ObjectStore>,
    codec: PathCodec,
    staging_dir: PathBuf,
}

impl BatchWriter {
    /// Stages files in the system temp directory.
    pub fn new(store: Arc<dyn ObjectStore>, codec: PathCodec) -> Self {
        Self {
            store,
            codec,
            staging_dir: std::env::temp_dir(),
        }
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn codec(&self) -> &PathCodec {
        &self.codec
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Object path the batch will be (or was) written under.
    pub fn path_for(&self, batch: &Batch) -> Result<String, ExtractError> {
        Ok(self.codec.encode(batch.symbol(), batch.bucket_timestamp())?)
    }

    /// Write `batch` unless an object already exists at its path.
    pub fn write(&self, batch: &Batch) -> Result<WriteOutcome, ExtractError> {
        let path = self.path_for(batch)?;
        let write_err = |source: StorageError| ExtractError::StorageWrite {
            path: path.clone(),
            source,
        };

        if self.store.object_exists(&path).map_err(write_err)? {
            debug!(symbol = batch.symbol(), %path, "object exists, skipping write");
            return Ok(WriteOutcome {
                path,
                status: WriteStatus::AlreadyPresent,
                rows: batch.len(),
            });
        }

        let bytes = self.stage(batch.klines()).map_err(write_err)?;
        self.store.put_object(&path, &bytes).map_err(write_err)?;

        info!(symbol = batch.symbol(), %path, rows = batch.len(), "batch written");
        Ok(WriteOutcome {
            path,
            status: WriteStatus::Written,
            rows: batch.len(),
        })
    }

    /// Delete the object at `path` if present.
    ///
    /// Returns whether an object was removed. Afterwards the path never
    /// exists, regardless of its prior state.
    pub fn discard_undersized(&self, path: &str) -> Result<bool, ExtractError> {
        let removed = self
            .store
            .delete_object(path)
            .map_err(|source| ExtractError::StorageWrite {
                path: path.to_string(),
                source,
            })?;
        if removed {
            info!(%path, "undersized batch discarded");
        }
        Ok(removed)
    }

    /// Read a previously written batch back.
    pub fn read_batch(&self, path: &str) -> Result<Vec<Kline>, StorageError> {
        let bytes = self.store.get_object(path)?;
        columnar::decode_klines(bytes)
    }

    /// Serialize into a staging file and return its bytes.
    ///
    /// The staging file is a `NamedTempFile`, so it is deleted when it goes
    /// out of scope, whether serialization succeeded or not.
    fn stage(&self, klines: &[Kline]) -> Result<Vec<u8>, StorageError> {
        let staging_err =
            |e: std::io::Error| StorageError::io(self.staging_dir.display().to_string(), e);

        fs::create_dir_all(&self.staging_dir).map_err(staging_err)?;
        let staged = tempfile::Builder::new()
            .prefix("klineflow-")
            .suffix(".parquet")
            .tempfile_in(&self.staging_dir)
            .map_err(staging_err)?;

        {
            let mut writer = BufWriter::new(staged.as_file());
            columnar::write_klines(klines, &mut writer)?;
            writer.flush().map_err(staging_err)?;
        }

        fs::read(staged.path()).map_err(staging_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::kline::sample_kline;
    use crate::storage::MemoryObjectStore;

    const T0: i64 = 1_710_505_800_000;

    fn batch(open_times: &[i64]) -> Batch {
        Batch::new(
            "BTCUSDT",
            open_times.iter().map(|&t| sample_kline("BTCUSDT", t)).collect(),
        )
        .unwrap()
    }

    fn writer_with_staging() -> (BatchWriter, Arc<MemoryObjectStore>, tempfile::TempDir) {
        let store = Arc::new(MemoryObjectStore::new("test"));
        let staging = tempfile::tempdir().unwrap();
        let writer = BatchWriter::new(store.clone(), PathCodec::default())
            .with_staging_dir(staging.path());
        (writer, store, staging)
    }

    #[test]
    fn write_commits_under_bucket_path() {
        let (writer, store, _staging) = writer_with_staging();
        let outcome = writer.write(&batch(&[T0, T0 + 60_000])).unwrap();

        assert_eq!(outcome.status, WriteStatus::Written);
        assert_eq!(
            outcome.path,
            "binance_klines/BTCUSDT/2024/M03/BTCUSDT_klines_2024-03-15-1230.parquet"
        );
        assert_eq!(outcome.rows, 2);
        assert!(store.object_exists(&outcome.path).unwrap());
        assert_eq!(writer.read_batch(&outcome.path).unwrap().len(), 2);
    }

    #[test]
    fn second_write_to_same_path_is_skipped() {
        let (writer, store, _staging) = writer_with_staging();
        let first = writer.write(&batch(&[T0, T0 + 60_000])).unwrap();
        let second = writer.write(&batch(&[T0])).unwrap();

        assert_eq!(second.status, WriteStatus::AlreadyPresent);
        assert_eq!(first.path, second.path);
        assert_eq!(store.len(), 1);
        // the original two-row object is untouched
        assert_eq!(writer.read_batch(&first.path).unwrap().len(), 2);
    }

    #[test]
    fn discard_leaves_no_object_either_way() {
        let (writer, store, _staging) = writer_with_staging();
        let outcome = writer.write(&batch(&[T0])).unwrap();

        assert!(writer.discard_undersized(&outcome.path).unwrap());
        assert!(!store.object_exists(&outcome.path).unwrap());

        assert!(!writer.discard_undersized(&outcome.path).unwrap());
        assert!(!store.object_exists(&outcome.path).unwrap());
    }

    #[test]
    fn staging_directory_is_left_clean() {
        let (writer, _store, staging) = writer_with_staging();
        writer.write(&batch(&[T0])).unwrap();
        writer.write(&batch(&[T0 + 3_600_000])).unwrap();

        let leftovers = fs::read_dir(staging.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
