use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;
use walkdir::WalkDir;

use crate::blob::{Blob, CountingDigestWriter};
use crate::digest::{BlobDescriptor, DescriptorDigest};
use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// Layer
// ---------------------------------------------------------------------------

/// Which of the three layer shapes a [`Layer`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerType {
    Unwritten,
    Reference,
    Cached,
}

/// One filesystem changeset of an image.
///
/// | variant   | descriptor | diff ID | local content |
/// |-----------|------------|---------|---------------|
/// | Unwritten | no         | no      | in memory     |
/// | Reference | yes        | yes     | no            |
/// | Cached    | yes        | yes     | file          |
#[derive(Debug, Clone)]
pub enum Layer {
    Unwritten(UnwrittenLayer),
    Reference(ReferenceLayer),
    Cached(CachedLayer),
}

impl Layer {
    pub fn layer_type(&self) -> LayerType {
        match self {
            Layer::Unwritten(_) => LayerType::Unwritten,
            Layer::Reference(_) => LayerType::Reference,
            Layer::Cached(_) => LayerType::Cached,
        }
    }

    /// Descriptor of the compressed blob.
    pub fn blob_descriptor(&self) -> Result<&BlobDescriptor> {
        match self {
            Layer::Unwritten(_) => Err(OciError::LayerPropertyNotFound(
                "blob descriptor not available for unwritten layer",
            )),
            Layer::Reference(l) => Ok(&l.descriptor),
            Layer::Cached(l) => Ok(&l.descriptor),
        }
    }

    /// Digest of the uncompressed tar.
    pub fn diff_id(&self) -> Result<&DescriptorDigest> {
        match self {
            Layer::Unwritten(_) => Err(OciError::LayerPropertyNotFound(
                "diff ID not available for unwritten layer",
            )),
            Layer::Reference(l) => Ok(&l.diff_id),
            Layer::Cached(l) => Ok(&l.diff_id),
        }
    }

    /// On-disk compressed content.
    pub fn content_file(&self) -> Result<&Path> {
        match self {
            Layer::Cached(l) => Ok(&l.content_file),
            Layer::Unwritten(_) => Err(OciError::LayerPropertyNotFound(
                "content file not available for unwritten layer",
            )),
            Layer::Reference(_) => Err(OciError::LayerPropertyNotFound(
                "content file not available for reference layer",
            )),
        }
    }
}

impl From<ReferenceLayer> for Layer {
    fn from(l: ReferenceLayer) -> Self {
        Layer::Reference(l)
    }
}

impl From<CachedLayer> for Layer {
    fn from(l: CachedLayer) -> Self {
        Layer::Cached(l)
    }
}

impl From<UnwrittenLayer> for Layer {
    fn from(l: UnwrittenLayer) -> Self {
        Layer::Unwritten(l)
    }
}

/// A layer that lives only in a remote registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceLayer {
    pub descriptor: BlobDescriptor,
    pub diff_id: DescriptorDigest,
}

impl ReferenceLayer {
    pub fn new(descriptor: BlobDescriptor, diff_id: DescriptorDigest) -> Self {
        Self {
            descriptor,
            diff_id,
        }
    }
}

/// A layer whose compressed content has been written to a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedLayer {
    pub content_file: PathBuf,
    pub descriptor: BlobDescriptor,
    pub diff_id: DescriptorDigest,
}

impl CachedLayer {
    pub fn new(content_file: PathBuf, descriptor: BlobDescriptor, diff_id: DescriptorDigest) -> Self {
        Self {
            content_file,
            descriptor,
            diff_id,
        }
    }

    /// The compressed content as a blob, e.g. for pushing.
    pub fn content_blob(&self) -> Blob {
        Blob::from_file(&self.content_file)
    }
}

// ---------------------------------------------------------------------------
// UnwrittenLayer
// ---------------------------------------------------------------------------

/// Both digests of a layer, known once its content has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenLayer {
    pub descriptor: BlobDescriptor,
    pub diff_id: DescriptorDigest,
}

/// Layer content that has been archived but not yet written anywhere.
#[derive(Clone)]
pub struct UnwrittenLayer {
    tar: Vec<u8>,
}

impl std::fmt::Debug for UnwrittenLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnwrittenLayer")
            .field("tar_len", &self.tar.len())
            .finish()
    }
}

impl UnwrittenLayer {
    pub fn from_tar(tar: Vec<u8>) -> Self {
        Self { tar }
    }

    /// Write the gzip-compressed layer to `out`, hashing the uncompressed and
    /// compressed streams in the same pass.
    pub fn write_to<W: Write>(&self, out: W) -> Result<WrittenLayer> {
        let encoder = GzEncoder::new(CountingDigestWriter::new(out), Compression::default());
        let mut uncompressed = CountingDigestWriter::new(encoder);
        uncompressed.write_all(&self.tar)?;
        let (encoder, uncompressed_descriptor) = uncompressed.finish();
        let (_, descriptor) = encoder.finish()?.finish();
        Ok(WrittenLayer {
            descriptor,
            diff_id: uncompressed_descriptor.digest,
        })
    }

    /// Write only the compressed form and return its descriptor.
    pub fn write_compressed_to<W: Write>(&self, out: W) -> Result<BlobDescriptor> {
        Ok(self.write_to(out)?.descriptor)
    }

    /// Write the raw tar and return its digest, which is the diff ID.
    pub fn write_uncompressed_to<W: Write>(&self, out: W) -> Result<DescriptorDigest> {
        let mut writer = CountingDigestWriter::new(out);
        writer.write_all(&self.tar)?;
        Ok(writer.finish().1.digest)
    }

    /// The compressed content as a lazy blob.
    pub fn into_compressed_blob(self) -> Blob {
        Blob::from_writer(move |w| {
            let mut encoder = GzEncoder::new(w, Compression::default());
            encoder.write_all(&self.tar)?;
            encoder.finish().map(|_| ())
        })
    }
}

// ---------------------------------------------------------------------------
// LayerBuilder
// ---------------------------------------------------------------------------

/// A source file and the path it is extracted to inside the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    pub source: PathBuf,
    pub archive_path: String,
}

/// Builds an [`UnwrittenLayer`] from files, archived in the order they were
/// added.  No sorting or de-duplication happens here; identical ordered input
/// yields identical digests.
#[derive(Debug, Default, Clone)]
pub struct LayerBuilder {
    entries: Vec<LayerEntry>,
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `source` to be archived at `archive_path`.
    pub fn add_file(&mut self, source: impl Into<PathBuf>, archive_path: impl Into<String>) -> &mut Self {
        self.entries.push(LayerEntry {
            source: source.into(),
            archive_path: archive_path.into(),
        });
        self
    }

    /// Queue every regular file under `dir`, in file-name order, rooted at
    /// `archive_root` inside the image.
    pub fn add_directory(&mut self, dir: &Path, archive_root: &str) -> Result<&mut Self> {
        let root = archive_root.trim_matches('/');
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let archive_path = if root.is_empty() {
                relative
            } else {
                format!("{root}/{relative}")
            };
            self.add_file(entry.path(), archive_path);
        }
        Ok(self)
    }

    pub fn entries(&self) -> &[LayerEntry] {
        &self.entries
    }

    /// Archive all entries.  Fails on unreadable sources or paths the tar
    /// format cannot represent.  Tar paths are relative, so a leading `/` is
    /// dropped.
    pub fn build(&self) -> Result<UnwrittenLayer> {
        let mut archive = tar::Builder::new(Vec::new());
        for entry in &self.entries {
            let name = entry.archive_path.trim_start_matches('/');
            archive.append_path_with_name(&entry.source, name)?;
        }
        let tar = archive.into_inner()?;
        debug!(
            entries = self.entries.len(),
            bytes = tar.len(),
            "built layer archive"
        );
        Ok(UnwrittenLayer::from_tar(tar))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
