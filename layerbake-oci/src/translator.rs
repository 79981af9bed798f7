use serde::Serialize;

use crate::blob::Blob;
use crate::digest::{BlobDescriptor, DescriptorDigest};
use crate::image::Image;
use crate::manifest::{ContainerConfigurationTemplate, V22ManifestTemplate};
use crate::{OciError, Result};

/// A serialized JSON document with the descriptor of its exact bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonBlob {
    pub bytes: Vec<u8>,
    pub descriptor: BlobDescriptor,
}

impl JsonBlob {
    fn from_template<T: Serialize>(template: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(template)?;
        let descriptor = BlobDescriptor::new(bytes.len() as u64, DescriptorDigest::of_bytes(&bytes));
        Ok(Self { bytes, descriptor })
    }

    pub fn to_blob(&self) -> Blob {
        Blob::from_bytes(self.bytes.clone())
    }
}

/// Renders an [`Image`] into its container configuration and V2.2 manifest.
///
/// Both documents are serialized once and memoized.  The manifest embeds the
/// configuration's digest, so the configuration must be built first.
pub struct ImageToJsonTranslator<'a> {
    image: &'a Image,
    container_configuration: Option<JsonBlob>,
    manifest: Option<JsonBlob>,
}

impl<'a> ImageToJsonTranslator<'a> {
    pub fn new(image: &'a Image) -> Self {
        Self {
            image,
            container_configuration: None,
            manifest: None,
        }
    }

    pub fn container_configuration(&mut self) -> Result<&JsonBlob> {
        if self.container_configuration.is_none() {
            let mut template = ContainerConfigurationTemplate::default();
            for layer in self.image.layers() {
                template.add_layer_diff_id(layer.diff_id()?.clone());
            }
            template.config.env = self
                .image
                .environment()
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            template.config.entrypoint = self.image.entrypoint().to_vec();
            self.container_configuration = Some(JsonBlob::from_template(&template)?);
        }
        self.container_configuration
            .as_ref()
            .ok_or(OciError::ConfigurationNotBuilt)
    }

    /// Fails with [`OciError::ConfigurationNotBuilt`] until
    /// [`container_configuration`](Self::container_configuration) has run.
    pub fn manifest(&mut self) -> Result<&JsonBlob> {
        if self.manifest.is_none() {
            let config = self
                .container_configuration
                .as_ref()
                .ok_or(OciError::ConfigurationNotBuilt)?;
            let mut template = V22ManifestTemplate::new(&config.descriptor);
            for layer in self.image.layers() {
                template.add_layer(layer.blob_descriptor()?);
            }
            self.manifest = Some(JsonBlob::from_template(&template)?);
        }
        self.manifest.as_ref().ok_or(OciError::ConfigurationNotBuilt)
    }
}
