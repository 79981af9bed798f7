use std::collections::{BTreeMap, HashSet};

use crate::digest::DescriptorDigest;
use crate::layer::Layer;
use crate::{OciError, Result};

/// Ordered layers of an image.  Every layer must carry a descriptor, and no
/// digest may appear twice.
#[derive(Debug, Clone, Default)]
pub struct ImageLayers {
    layers: Vec<Layer>,
    digests: HashSet<DescriptorDigest>,
}

impl ImageLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, layer: Layer) -> Result<()> {
        let digest = layer.blob_descriptor()?.digest.clone();
        if !self.digests.insert(digest.clone()) {
            return Err(OciError::DuplicateLayer(digest.to_string()));
        }
        self.layers.push(layer);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Layer> {
        self.layers.iter()
    }

    pub fn as_slice(&self) -> &[Layer] {
        &self.layers
    }
}

impl<'a> IntoIterator for &'a ImageLayers {
    type Item = &'a Layer;
    type IntoIter = std::slice::Iter<'a, Layer>;

    fn into_iter(self) -> Self::IntoIter {
        self.layers.iter()
    }
}

/// In-memory image model consumed by the JSON translator.
#[derive(Debug, Clone, Default)]
pub struct Image {
    layers: ImageLayers,
    environment: BTreeMap<String, String>,
    entrypoint: Vec<String>,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_layer(&mut self, layer: impl Into<Layer>) -> Result<()> {
        self.layers.add(layer.into())
    }

    pub fn set_environment_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.environment.insert(name.into(), value.into());
    }

    pub fn set_entrypoint(&mut self, entrypoint: Vec<String>) {
        self.entrypoint = entrypoint;
    }

    pub fn layers(&self) -> &ImageLayers {
        &self.layers
    }

    /// Environment in key order, so translations are byte-stable.
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn entrypoint(&self) -> &[String] {
        &self.entrypoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::BlobDescriptor;
    use crate::layer::{ReferenceLayer, UnwrittenLayer};

    fn reference(seed: &[u8]) -> ReferenceLayer {
        let digest = DescriptorDigest::of_bytes(seed);
        ReferenceLayer::new(BlobDescriptor::new(10, digest.clone()), digest)
    }

    #[test]
    fn keeps_insertion_order() {
        let mut image = Image::new();
        image.add_layer(reference(b"one")).unwrap();
        image.add_layer(reference(b"two")).unwrap();
        let digests: Vec<_> = image
            .layers()
            .iter()
            .map(|l| l.blob_descriptor().unwrap().digest.clone())
            .collect();
        assert_eq!(
            digests,
            vec![
                DescriptorDigest::of_bytes(b"one"),
                DescriptorDigest::of_bytes(b"two")
            ]
        );
    }

    #[test]
    fn rejects_duplicate_digest() {
        let mut layers = ImageLayers::new();
        layers.add(reference(b"same").into()).unwrap();
        let err = layers.add(reference(b"same").into()).unwrap_err();
        assert!(matches!(err, OciError::DuplicateLayer(_)));
        assert_eq!(layers.len(), 1);
    }

    #[test]
    fn rejects_unwritten_layer() {
        let mut image = Image::new();
        let err = image
            .add_layer(UnwrittenLayer::from_tar(Vec::new()))
            .unwrap_err();
        assert!(matches!(err, OciError::LayerPropertyNotFound(_)));
        assert!(image.layers().is_empty());
    }
}
