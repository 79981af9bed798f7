use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use flate2::write::GzDecoder;
use tracing::{debug, warn};

use super::{now_millis, ApplicationLayerType, Cache, TimestampedCachedLayer};
use crate::blob::{Blob, CountingDigestWriter};
use crate::digest::{BlobDescriptor, DescriptorDigest};
use crate::layer::{CachedLayer, UnwrittenLayer};
use crate::{OciError, Result};

/// Writes layer content into the cache and records it in the metadata.
///
/// Returned layers describe what was written; nothing is read back.
pub struct CacheWriter<'a> {
    cache: &'a Cache,
}

impl<'a> CacheWriter<'a> {
    pub(super) fn new(cache: &'a Cache) -> Self {
        Self { cache }
    }

    /// Store a compressed base-image layer pulled from a registry.  The
    /// written bytes must hash to `digest`; the diff ID is computed by
    /// decompressing the stream as it is written.
    pub fn write_base_image_layer(&self, digest: &DescriptorDigest, content: Blob) -> Result<CachedLayer> {
        let path = self.cache.layer_file(digest.hash());
        let (descriptor, diff_id) = match write_decompressing(&path, content) {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };

        if &descriptor.digest != digest {
            warn!(expected = %digest, actual = %descriptor.digest, "base layer digest mismatch");
            let _ = fs::remove_file(&path);
            return Err(OciError::DigestMismatch {
                expected: digest.to_string(),
                actual: descriptor.digest.to_string(),
            });
        }

        let layer = CachedLayer::new(path, descriptor, diff_id);
        self.cache
            .write_metadata()?
            .add_base_image_layer(TimestampedCachedLayer::new(layer.clone(), now_millis()));
        debug!(digest = %digest, diff_id = %layer.diff_id, "cached base image layer");
        Ok(layer)
    }

    /// Drop the recorded base-image layers before caching a different base.
    pub fn reset_base_image_layers(&self) -> Result<()> {
        self.cache.write_metadata()?.clear_base_image_layers();
        Ok(())
    }

    pub fn write_dependencies_layer(&self, layer: &UnwrittenLayer) -> Result<CachedLayer> {
        self.write_application_layer(ApplicationLayerType::Dependencies, layer)
    }

    pub fn write_resources_layer(&self, layer: &UnwrittenLayer) -> Result<CachedLayer> {
        self.write_application_layer(ApplicationLayerType::Resources, layer)
    }

    pub fn write_classes_layer(&self, layer: &UnwrittenLayer) -> Result<CachedLayer> {
        self.write_application_layer(ApplicationLayerType::Classes, layer)
    }

    /// Compress `layer` into the category's file and stamp it fresh.
    pub fn write_application_layer(
        &self,
        layer_type: ApplicationLayerType,
        layer: &UnwrittenLayer,
    ) -> Result<CachedLayer> {
        let path = self.cache.layer_file(layer_type.name());
        let mut out = BufWriter::new(File::create(&path)?);
        let written = layer.write_to(&mut out)?;
        out.flush()?;

        let cached = CachedLayer::new(path, written.descriptor, written.diff_id);
        self.cache.write_metadata()?.set_application_layer(
            layer_type,
            TimestampedCachedLayer::new(cached.clone(), now_millis()),
        );
        debug!(
            layer = %layer_type,
            digest = %cached.descriptor.digest,
            size = cached.descriptor.size,
            "cached application layer"
        );
        Ok(cached)
    }

    /// Persist the metadata.  Same as [`Cache::flush`].
    pub fn flush(&self) -> Result<()> {
        self.cache.flush()
    }
}

/// Stream compressed `content` to `path`, returning the descriptor of the
/// compressed bytes and the digest of their decompressed form.
fn write_decompressing(path: &Path, content: Blob) -> Result<(BlobDescriptor, DescriptorDigest)> {
    let mut tee = Tee {
        a: BufWriter::new(File::create(path)?),
        b: GzDecoder::new(CountingDigestWriter::new(io::sink())),
    };
    let descriptor = content.write_to(&mut tee)?;
    tee.a.flush()?;
    let (_, uncompressed) = tee.b.finish()?.finish();
    Ok((descriptor, uncompressed.digest))
}

/// Writes everything to `a` and mirrors the accepted bytes into `b`.
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.a.write(buf)?;
        self.b.write_all(&buf[..n])?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}
