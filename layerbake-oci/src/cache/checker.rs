use std::io;
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use super::{time_from_millis, ApplicationLayerType, Cache};
use crate::image::ImageLayers;
use crate::Result;

/// Decides whether cached layers are still usable.
pub struct CacheChecker<'a> {
    cache: &'a Cache,
}

impl<'a> CacheChecker<'a> {
    pub(super) fn new(cache: &'a Cache) -> Self {
        Self { cache }
    }

    /// True unless `candidate` lists exactly the cached base-image layer
    /// descriptors, in the same order, and every cached file is still on disk.
    pub fn is_base_image_modified(&self, candidate: &ImageLayers) -> Result<bool> {
        let metadata = self.cache.read_metadata()?;
        let cached = metadata.base_image_layers();
        if cached.len() != candidate.len() {
            return Ok(true);
        }
        for (cached, layer) in cached.iter().zip(candidate) {
            if &cached.layer.descriptor != layer.blob_descriptor()? {
                return Ok(true);
            }
            if !cached.layer.content_file.is_file() {
                debug!(
                    path = %cached.layer.content_file.display(),
                    "cached base layer file is missing"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn is_dependencies_layer_modified<P: AsRef<Path>>(&self, source_dirs: &[P]) -> Result<bool> {
        self.is_application_layer_modified(ApplicationLayerType::Dependencies, source_dirs)
    }

    pub fn is_resources_layer_modified<P: AsRef<Path>>(&self, source_dirs: &[P]) -> Result<bool> {
        self.is_application_layer_modified(ApplicationLayerType::Resources, source_dirs)
    }

    pub fn is_classes_layer_modified<P: AsRef<Path>>(&self, source_dirs: &[P]) -> Result<bool> {
        self.is_application_layer_modified(ApplicationLayerType::Classes, source_dirs)
    }

    /// True if the category was never cached, if its cached file is gone, or
    /// if anything under `source_dirs` was modified after the cached
    /// timestamp.
    pub fn is_application_layer_modified<P: AsRef<Path>>(
        &self,
        layer_type: ApplicationLayerType,
        source_dirs: &[P],
    ) -> Result<bool> {
        let cached_at = match self.cache.read_metadata()?.application_layer(layer_type) {
            Some(cached) if !cached.layer.content_file.is_file() => {
                debug!(
                    layer = %layer_type,
                    path = %cached.layer.content_file.display(),
                    "cached layer file is missing"
                );
                return Ok(true);
            }
            Some(cached) => time_from_millis(cached.last_modified_time),
            None => return Ok(true),
        };

        for dir in source_dirs {
            for entry in WalkDir::new(dir.as_ref()) {
                let entry = entry.map_err(io::Error::from)?;
                let modified = entry.metadata().map_err(io::Error::from)?.modified()?;
                if modified > cached_at {
                    debug!(
                        layer = %layer_type,
                        path = %entry.path().display(),
                        "source modified since cached"
                    );
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}
