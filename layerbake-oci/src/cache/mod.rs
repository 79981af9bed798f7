//! Local layer cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! metadata.json
//! <digest-hex>.tar.gz      base-image layers
//! dependencies.tar.gz      application layers
//! resources.tar.gz
//! classes.tar.gz
//! ```

mod checker;
mod metadata;
mod reader;
mod writer;

pub use checker::CacheChecker;
pub use metadata::{CacheMetadata, TimestampedCachedLayer};
pub use reader::CacheReader;
pub use writer::CacheWriter;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::{OciError, Result};
use metadata::CacheMetadataTemplate;

const METADATA_FILENAME: &str = "metadata.json";
const LAYER_FILE_EXTENSION: &str = ".tar.gz";

// ---------------------------------------------------------------------------
// ApplicationLayerType
// ---------------------------------------------------------------------------

/// The three independently cached parts of an application's own output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ApplicationLayerType {
    Dependencies,
    Resources,
    Classes,
}

impl ApplicationLayerType {
    pub const ALL: [ApplicationLayerType; 3] = [
        ApplicationLayerType::Dependencies,
        ApplicationLayerType::Resources,
        ApplicationLayerType::Classes,
    ];

    /// File stem of the category's layer inside the cache.
    pub fn name(self) -> &'static str {
        match self {
            ApplicationLayerType::Dependencies => "dependencies",
            ApplicationLayerType::Resources => "resources",
            ApplicationLayerType::Classes => "classes",
        }
    }
}

impl fmt::Display for ApplicationLayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// One cache root per build.  Metadata is loaded once at [`Cache::init`],
/// mutated by the [`CacheWriter`] and persisted with [`Cache::flush`].
///
/// Share it between collaborators by reference or `Arc`.
pub struct Cache {
    directory: PathBuf,
    metadata: RwLock<CacheMetadata>,
}

impl Cache {
    /// Open the cache at `directory`, which must already exist.  A missing
    /// `metadata.json` means an empty cache.
    pub fn init(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        if !directory.is_dir() {
            return Err(OciError::NotADirectory(directory));
        }

        let metadata_file = directory.join(METADATA_FILENAME);
        let metadata = if metadata_file.exists() {
            let template: CacheMetadataTemplate = serde_json::from_slice(&fs::read(&metadata_file)?)?;
            CacheMetadata::from_template(template, &directory)
        } else {
            CacheMetadata::default()
        };

        info!(
            path = %directory.display(),
            base_layers = metadata.base_image_layers().len(),
            "opened layer cache"
        );
        Ok(Self {
            directory,
            metadata: RwLock::new(metadata),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn writer(&self) -> CacheWriter<'_> {
        CacheWriter::new(self)
    }

    pub fn reader(&self) -> CacheReader<'_> {
        CacheReader::new(self)
    }

    pub fn checker(&self) -> CacheChecker<'_> {
        CacheChecker::new(self)
    }

    /// Snapshot of the in-memory metadata.
    pub fn metadata(&self) -> Result<CacheMetadata> {
        Ok(self.read_metadata()?.clone())
    }

    /// Persist the in-memory metadata to `metadata.json`.
    pub fn flush(&self) -> Result<()> {
        let template = self.read_metadata()?.to_template();
        let json = serde_json::to_vec_pretty(&template)?;

        let path = self.directory.join(METADATA_FILENAME);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "flushed cache metadata");
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn read_metadata(&self) -> Result<RwLockReadGuard<'_, CacheMetadata>> {
        self.metadata.read().map_err(|_| OciError::LockPoisoned)
    }

    fn write_metadata(&self) -> Result<RwLockWriteGuard<'_, CacheMetadata>> {
        self.metadata.write().map_err(|_| OciError::LockPoisoned)
    }

    fn layer_file(&self, name: &str) -> PathBuf {
        layer_file(&self.directory, name)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn layer_file(directory: &Path, name: &str) -> PathBuf {
    directory.join(format!("{name}{LAYER_FILE_EXTENSION}"))
}

/// Current time in epoch milliseconds, rounded up so the stamp is never
/// earlier than the write it records.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64 + u64::from(d.subsec_nanos() % 1_000_000 != 0))
        .unwrap_or(0)
}

fn time_from_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_rejects_non_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("file");
        fs::write(&file, b"x").unwrap();

        assert!(matches!(Cache::init(&file), Err(OciError::NotADirectory(_))));
        assert!(matches!(
            Cache::init(tmp.path().join("missing")),
            Err(OciError::NotADirectory(_))
        ));
    }

    #[test]
    fn missing_metadata_is_empty_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::init(tmp.path()).unwrap();
        assert_eq!(cache.metadata().unwrap(), CacheMetadata::default());
    }

    #[test]
    fn corrupt_metadata_fails() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(METADATA_FILENAME), b"{not json").unwrap();
        assert!(matches!(Cache::init(tmp.path()), Err(OciError::Json(_))));
    }

    #[test]
    fn layer_file_names() {
        let dir = Path::new("/cache");
        assert_eq!(
            layer_file(dir, ApplicationLayerType::Classes.name()),
            PathBuf::from("/cache/classes.tar.gz")
        );
        assert_eq!(layer_file(dir, "abc"), PathBuf::from("/cache/abc.tar.gz"));
    }

    #[test]
    fn flush_writes_metadata_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::init(tmp.path()).unwrap();
        cache.flush().unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&fs::read(tmp.path().join(METADATA_FILENAME)).unwrap()).unwrap();
        assert_eq!(written["baseImageLayers"], serde_json::json!([]));
        assert!(!tmp.path().join("metadata.json.tmp").exists());
    }
}
