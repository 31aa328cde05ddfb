//! Storage version kept in the `meta` bucket.

use super::{Backend, Bucket};
use crate::error::{Result, TesseraError};
use crate::version::Version;
use tracing::{debug, info};

const STORAGE_VERSION_KEY: &[u8] = b"storageVersion";

/// Oldest storage version this build can open.
const MIN_STORAGE_VERSION: Version = Version::new(3, 5, 0);
/// Storage version written by this build.
const CURRENT_STORAGE_VERSION: Version = Version::new(3, 6, 0);

/// Storage version recorded in the backend, if any.
pub fn storage_version(backend: &Backend) -> Result<Option<Version>> {
    let Some(raw) = backend.get(Bucket::Meta, STORAGE_VERSION_KEY)? else {
        return Ok(None);
    };
    let text = String::from_utf8(raw).map_err(|e| {
        TesseraError::DataCorruption(format!("storage version is not utf-8: {}", e))
    })?;
    text.parse()
        .map(Some)
        .map_err(|e| TesseraError::DataCorruption(format!("storage version {:?}: {}", text, e)))
}

/// Check that the backend's storage version can be served by this build.
///
/// Backends written before versions were recorded carry none and are accepted.
pub fn validate(backend: &Backend) -> Result<()> {
    match storage_version(backend)? {
        None => {
            debug!(path = %backend.path().display(), "Backend has no storage version");
            Ok(())
        }
        Some(v) => {
            let line = v.release_line();
            if line < MIN_STORAGE_VERSION || line > CURRENT_STORAGE_VERSION {
                return Err(TesseraError::Incompatible(format!(
                    "cannot validate storage version {} of {}, supported range is [{}, {}]",
                    v,
                    backend.path().display(),
                    MIN_STORAGE_VERSION,
                    CURRENT_STORAGE_VERSION
                )));
            }
            Ok(())
        }
    }
}

/// Record the current storage version when none is recorded yet.
pub fn update_storage_version(backend: &Backend) -> Result<()> {
    if storage_version(backend)?.is_some() {
        return Ok(());
    }
    let v = CURRENT_STORAGE_VERSION.release_line();
    backend.put(Bucket::Meta, STORAGE_VERSION_KEY, v.to_string().as_bytes())?;
    info!(version = %v, "Recorded storage version");
    Ok(())
}
