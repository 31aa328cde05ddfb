//! Key-value backend.
//!
//! A RocksDB database where every bucket is a column family. The `meta`
//! bucket holds the consistent index, its term and the storage version.

mod schema;

pub use schema::{update_storage_version, validate, storage_version};

use crate::error::{Result, TesseraError};
use crate::types::{LogIndex, Term};
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{IteratorMode, Options, DB};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONSISTENT_INDEX_KEY: &[u8] = b"consistent_index";
const TERM_KEY: &[u8] = b"term";
const DEFAULT_CF: &str = "default";
const LIVE_DATA_SIZE_PROPERTY: &str = "rocksdb.estimate-live-data-size";

/// Internal buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Meta,
    Members,
    MembersRemoved,
    Cluster,
}

impl Bucket {
    pub const ALL: [Bucket; 4] = [
        Bucket::Meta,
        Bucket::Members,
        Bucket::MembersRemoved,
        Bucket::Cluster,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Meta => "meta",
            Bucket::Members => "members",
            Bucket::MembersRemoved => "members_removed",
            Bucket::Cluster => "cluster",
        }
    }
}

/// An open backend.
pub struct Backend {
    db: DB,
    path: PathBuf,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("path", &self.path).finish()
    }
}

impl Backend {
    /// Open or create the backend at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cfs = DB::list_cf(&opts, path).unwrap_or_else(|_| vec![DEFAULT_CF.to_string()]);
        let db = DB::open_cf(&opts, path, &cfs)?;

        debug!(path = %path.display(), buckets = cfs.len(), "Opened backend");
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make sure the `meta` bucket exists.
    pub fn create_meta_bucket(&mut self) -> Result<()> {
        self.ensure_bucket(Bucket::Meta)
    }

    pub fn ensure_bucket(&mut self, bucket: Bucket) -> Result<()> {
        if self.db.cf_handle(bucket.name()).is_none() {
            self.db.create_cf(bucket.name(), &Options::default())?;
            debug!(bucket = bucket.name(), "Created bucket");
        }
        Ok(())
    }

    pub fn has_bucket(&self, bucket: Bucket) -> bool {
        self.db.cf_handle(bucket.name()).is_some()
    }

    pub fn put(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf(bucket)?;
        self.db.put_cf(cf, key, value)?;
        Ok(())
    }

    pub fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(cf) = self.db.cf_handle(bucket.name()) else {
            return Ok(None);
        };
        Ok(self.db.get_cf(cf, key)?)
    }

    pub fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<()> {
        let cf = self.cf(bucket)?;
        self.db.delete_cf(cf, key)?;
        Ok(())
    }

    /// All key-value pairs in `bucket`, in key order.
    pub fn scan(&self, bucket: Bucket) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let Some(cf) = self.db.cf_handle(bucket.name()) else {
            return Ok(Vec::new());
        };
        let mut pairs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            pairs.push((key.to_vec(), value.to_vec()));
        }
        Ok(pairs)
    }

    /// The last applied log index, or `None` if it was never recorded.
    pub fn consistent_index(&self) -> Result<Option<LogIndex>> {
        self.get(Bucket::Meta, CONSISTENT_INDEX_KEY)?
            .map(|bytes| decode_u64(&bytes, "consistent index"))
            .transpose()
    }

    /// Term of the entry at the consistent index.
    pub fn consistent_term(&self) -> Result<Option<Term>> {
        self.get(Bucket::Meta, TERM_KEY)?
            .map(|bytes| decode_u64(&bytes, "consistent term"))
            .transpose()
    }

    /// Record the applied position. The index never moves backwards.
    pub fn set_consistent_index(&self, index: LogIndex, term: Term) -> Result<()> {
        if let Some(current) = self.consistent_index()? {
            if index < current {
                return Err(TesseraError::DataCorruption(format!(
                    "consistent index cannot move from {} back to {}",
                    current, index
                )));
            }
        }
        self.put(Bucket::Meta, CONSISTENT_INDEX_KEY, &index.to_be_bytes())?;
        self.put(Bucket::Meta, TERM_KEY, &term.to_be_bytes())?;
        Ok(())
    }

    /// Bytes allocated on disk.
    pub fn size(&self) -> Result<u64> {
        dir_size(&self.path)
    }

    /// Estimated bytes holding live data.
    pub fn size_in_use(&self) -> Result<u64> {
        let mut total = 0;
        for name in self.bucket_names() {
            if let Some(cf) = self.db.cf_handle(&name) {
                total += self
                    .db
                    .property_int_value_cf(cf, LIVE_DATA_SIZE_PROPERTY)?
                    .unwrap_or(0);
            }
        }
        Ok(total)
    }

    /// Compact every bucket over its full key range.
    pub fn defrag(&self) -> Result<()> {
        for name in self.bucket_names() {
            if let Some(cf) = self.db.cf_handle(&name) {
                self.db.flush_cf(cf)?;
                self.db.compact_range_cf::<&[u8], &[u8]>(cf, None, None);
            }
        }
        info!(path = %self.path.display(), "Defragmented backend");
        Ok(())
    }

    /// Write a consistent copy of the database to `dest`.
    pub fn checkpoint(&self, dest: &Path) -> Result<()> {
        self.db.flush()?;
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(dest)?;
        Ok(())
    }

    /// Flush and release the database.
    pub fn close(self) -> Result<()> {
        self.db.flush()?;
        debug!(path = %self.path.display(), "Closed backend");
        Ok(())
    }

    fn cf(&self, bucket: Bucket) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(bucket.name())
            .ok_or_else(|| TesseraError::Storage(format!("bucket {} does not exist", bucket.name())))
    }

    fn bucket_names(&self) -> Vec<String> {
        let mut names = vec![DEFAULT_CF.to_string()];
        names.extend(Bucket::ALL.iter().map(|b| b.name().to_string()));
        names
    }
}

/// Whether reclaiming `size - in_use` bytes meets a threshold given in MiB.
pub fn should_defrag(size: u64, in_use: u64, threshold_mb: u64) -> bool {
    threshold_mb > 0 && size.saturating_sub(in_use) >= threshold_mb.saturating_mul(1024 * 1024)
}

fn decode_u64(bytes: &[u8], what: &str) -> Result<u64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| {
        TesseraError::DataCorruption(format!("{} has {} bytes, expected 8", what, bytes.len()))
    })?;
    Ok(u64::from_be_bytes(arr))
}

fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        total += if meta.is_dir() {
            dir_size(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}
