use std::path::PathBuf;

use super::{ApplicationLayerType, Cache, TimestampedCachedLayer};
use crate::Result;

/// Read access to previously cached layers.
pub struct CacheReader<'a> {
    cache: &'a Cache,
}

impl<'a> CacheReader<'a> {
    pub(super) fn new(cache: &'a Cache) -> Self {
        Self { cache }
    }

    pub fn dependencies_layer_file(&self) -> Result<Option<PathBuf>> {
        self.layer_file(ApplicationLayerType::Dependencies)
    }

    pub fn resources_layer_file(&self) -> Result<Option<PathBuf>> {
        self.layer_file(ApplicationLayerType::Resources)
    }

    pub fn classes_layer_file(&self) -> Result<Option<PathBuf>> {
        self.layer_file(ApplicationLayerType::Classes)
    }

    /// On-disk file of a cached category, or `None` if it was never written.
    pub fn layer_file(&self, layer_type: ApplicationLayerType) -> Result<Option<PathBuf>> {
        Ok(self
            .application_layer(layer_type)?
            .map(|l| l.layer.content_file))
    }

    pub fn application_layer(&self, layer_type: ApplicationLayerType) -> Result<Option<TimestampedCachedLayer>> {
        Ok(self.cache.read_metadata()?.application_layer(layer_type).cloned())
    }

    pub fn base_image_layers(&self) -> Result<Vec<TimestampedCachedLayer>> {
        Ok(self.cache.read_metadata()?.base_image_layers().to_vec())
    }
}
