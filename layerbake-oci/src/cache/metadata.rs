use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{layer_file, ApplicationLayerType};
use crate::digest::{BlobDescriptor, DescriptorDigest};
use crate::layer::CachedLayer;

/// A cached layer together with the time (milliseconds since the epoch) at
/// which it was last known to be fresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedCachedLayer {
    pub layer: CachedLayer,
    pub last_modified_time: u64,
}

impl TimestampedCachedLayer {
    pub fn new(layer: CachedLayer, last_modified_time: u64) -> Self {
        Self {
            layer,
            last_modified_time,
        }
    }

    fn to_template(&self) -> LayerObjectTemplate {
        LayerObjectTemplate {
            digest: self.layer.descriptor.digest.clone(),
            size: self.layer.descriptor.size,
            diff_id: self.layer.diff_id.clone(),
            last_modified_time: self.last_modified_time,
        }
    }

    fn from_template(template: LayerObjectTemplate, content_file: std::path::PathBuf) -> Self {
        let descriptor = BlobDescriptor::new(template.size, template.digest);
        Self::new(
            CachedLayer::new(content_file, descriptor, template.diff_id),
            template.last_modified_time,
        )
    }
}

/// In-memory view of `metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetadata {
    base_image_layers: Vec<TimestampedCachedLayer>,
    application_layers: BTreeMap<ApplicationLayerType, TimestampedCachedLayer>,
}

impl CacheMetadata {
    pub fn base_image_layers(&self) -> &[TimestampedCachedLayer] {
        &self.base_image_layers
    }

    /// Record a base-image layer, replacing any entry with the same digest.
    pub fn add_base_image_layer(&mut self, layer: TimestampedCachedLayer) {
        let position = self
            .base_image_layers
            .iter()
            .position(|l| l.layer.descriptor.digest == layer.layer.descriptor.digest);
        match position {
            Some(i) => self.base_image_layers[i] = layer,
            None => self.base_image_layers.push(layer),
        }
    }

    /// Forget every recorded base-image layer. Layer files stay on disk.
    pub fn clear_base_image_layers(&mut self) {
        self.base_image_layers.clear();
    }

    pub fn application_layer(&self, layer_type: ApplicationLayerType) -> Option<&TimestampedCachedLayer> {
        self.application_layers.get(&layer_type)
    }

    pub fn set_application_layer(&mut self, layer_type: ApplicationLayerType, layer: TimestampedCachedLayer) {
        self.application_layers.insert(layer_type, layer);
    }

    pub(crate) fn to_template(&self) -> CacheMetadataTemplate {
        let entry = |t: ApplicationLayerType| self.application_layers.get(&t).map(|l| l.to_template());
        CacheMetadataTemplate {
            base_image_layers: self.base_image_layers.iter().map(|l| l.to_template()).collect(),
            dependencies_layer: entry(ApplicationLayerType::Dependencies),
            resources_layer: entry(ApplicationLayerType::Resources),
            classes_layer: entry(ApplicationLayerType::Classes),
        }
    }

    /// Rebuild metadata from its template, resolving content files against
    /// `directory`.
    pub(crate) fn from_template(template: CacheMetadataTemplate, directory: &Path) -> Self {
        let mut metadata = CacheMetadata::default();
        for entry in template.base_image_layers {
            let file = layer_file(directory, entry.digest.hash());
            metadata.add_base_image_layer(TimestampedCachedLayer::from_template(entry, file));
        }
        let categories = [
            (ApplicationLayerType::Dependencies, template.dependencies_layer),
            (ApplicationLayerType::Resources, template.resources_layer),
            (ApplicationLayerType::Classes, template.classes_layer),
        ];
        for (layer_type, entry) in categories {
            if let Some(entry) = entry {
                let file = layer_file(directory, layer_type.name());
                metadata.set_application_layer(layer_type, TimestampedCachedLayer::from_template(entry, file));
            }
        }
        metadata
    }
}

// ---------------------------------------------------------------------------
// JSON templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CacheMetadataTemplate {
    #[serde(rename = "baseImageLayers", default)]
    pub base_image_layers: Vec<LayerObjectTemplate>,

    #[serde(rename = "dependenciesLayer", default, skip_serializing_if = "Option::is_none")]
    pub dependencies_layer: Option<LayerObjectTemplate>,

    #[serde(rename = "resourcesLayer", default, skip_serializing_if = "Option::is_none")]
    pub resources_layer: Option<LayerObjectTemplate>,

    #[serde(rename = "classesLayer", default, skip_serializing_if = "Option::is_none")]
    pub classes_layer: Option<LayerObjectTemplate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LayerObjectTemplate {
    pub digest: DescriptorDigest,

    pub size: u64,

    #[serde(rename = "diffId")]
    pub diff_id: DescriptorDigest,

    #[serde(rename = "lastModifiedTime")]
    pub last_modified_time: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn entry(seed: &[u8], time: u64) -> LayerObjectTemplate {
        LayerObjectTemplate {
            digest: DescriptorDigest::of_bytes(seed),
            size: seed.len() as u64,
            diff_id: DescriptorDigest::of_bytes(&[seed, b"-diff"].concat()),
            last_modified_time: time,
        }
    }

    #[test]
    fn each_category_loads_its_own_entry() {
        let template = CacheMetadataTemplate {
            base_image_layers: vec![entry(b"base", 1)],
            dependencies_layer: Some(entry(b"deps", 2)),
            resources_layer: Some(entry(b"res", 3)),
            classes_layer: None,
        };
        let dir = PathBuf::from("/cache");
        let metadata = CacheMetadata::from_template(template.clone(), &dir);

        let deps = metadata.application_layer(ApplicationLayerType::Dependencies).unwrap();
        assert_eq!(deps.last_modified_time, 2);
        assert_eq!(deps.layer.content_file, dir.join("dependencies.tar.gz"));
        let res = metadata.application_layer(ApplicationLayerType::Resources).unwrap();
        assert_eq!(res.last_modified_time, 3);
        assert_eq!(res.layer.descriptor.digest, DescriptorDigest::of_bytes(b"res"));
        assert!(metadata.application_layer(ApplicationLayerType::Classes).is_none());

        let base = &metadata.base_image_layers()[0];
        assert_eq!(
            base.layer.content_file,
            dir.join(format!("{}.tar.gz", DescriptorDigest::of_bytes(b"base").hash()))
        );

        assert_eq!(metadata.to_template(), template);
    }

    #[test]
    fn template_uses_camel_case_keys() {
        let template = CacheMetadataTemplate {
            base_image_layers: vec![entry(b"base", 7)],
            classes_layer: Some(entry(b"cls", 9)),
            ..Default::default()
        };
        let value = serde_json::to_value(&template).unwrap();
        assert_eq!(value["baseImageLayers"][0]["lastModifiedTime"], 7);
        assert!(value["baseImageLayers"][0]["diffId"].is_string());
        assert_eq!(value["classesLayer"]["size"], 3);
        assert!(value.get("dependenciesLayer").is_none());
    }

    #[test]
    fn base_layer_with_same_digest_is_replaced() {
        let dir = PathBuf::from("/cache");
        let mut metadata = CacheMetadata::default();
        let first = CacheMetadataTemplate {
            base_image_layers: vec![entry(b"base", 1)],
            ..Default::default()
        };
        metadata.add_base_image_layer(CacheMetadata::from_template(first, &dir).base_image_layers[0].clone());
        let mut newer = metadata.base_image_layers()[0].clone();
        newer.last_modified_time = 5;
        metadata.add_base_image_layer(newer);

        assert_eq!(metadata.base_image_layers().len(), 1);
        assert_eq!(metadata.base_image_layers()[0].last_modified_time, 5);
    }
}
