use serde::{Deserialize, Serialize};

use crate::digest::{BlobDescriptor, DescriptorDigest};
use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_V1: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIA_TYPE_CONTAINER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A content descriptor inside a V2.2 manifest.  Field order is fixed so the
/// serialized manifest is byte-stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,

    pub digest: DescriptorDigest,

    pub size: u64,
}

impl ContentDescriptor {
    pub fn new(media_type: &str, descriptor: &BlobDescriptor) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: descriptor.digest.clone(),
            size: descriptor.size,
        }
    }

    pub fn blob_descriptor(&self) -> BlobDescriptor {
        BlobDescriptor::new(self.size, self.digest.clone())
    }
}

// ---------------------------------------------------------------------------
// Manifests
// ---------------------------------------------------------------------------

/// Docker Image Manifest Version 2, Schema 2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V22ManifestTemplate {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub config: ContentDescriptor,

    pub layers: Vec<ContentDescriptor>,
}

impl V22ManifestTemplate {
    pub fn new(config: &BlobDescriptor) -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_DOCKER_MANIFEST.to_string(),
            config: ContentDescriptor::new(MEDIA_TYPE_CONTAINER_CONFIG, config),
            layers: Vec::new(),
        }
    }

    pub fn add_layer(&mut self, descriptor: &BlobDescriptor) {
        self.layers
            .push(ContentDescriptor::new(MEDIA_TYPE_LAYER, descriptor));
    }
}

/// Docker Image Manifest Version 2, Schema 1.  Layers are listed newest
/// first and carry no sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V21ManifestTemplate {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub tag: String,

    #[serde(default)]
    pub architecture: String,

    #[serde(rename = "fsLayers", default)]
    pub fs_layers: Vec<FsLayer>,

    #[serde(default)]
    pub history: Vec<V1Compatibility>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: DescriptorDigest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V1Compatibility {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

impl V21ManifestTemplate {
    /// Layer digests in base-first order.
    pub fn layer_digests(&self) -> Vec<DescriptorDigest> {
        self.fs_layers
            .iter()
            .rev()
            .map(|l| l.blob_sum.clone())
            .collect()
    }
}

/// A pulled manifest of either supported schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestTemplate {
    V21(V21ManifestTemplate),
    V22(V22ManifestTemplate),
}

#[derive(Deserialize)]
struct SchemaVersionProbe {
    #[serde(rename = "schemaVersion")]
    schema_version: Option<serde_json::Value>,
}

impl ManifestTemplate {
    /// Inspect `schemaVersion`, then parse as the matching concrete schema.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let probe: SchemaVersionProbe = serde_json::from_slice(body)?;
        match probe.schema_version.as_ref().and_then(|v| v.as_u64()) {
            Some(1) => Ok(ManifestTemplate::V21(serde_json::from_slice(body)?)),
            Some(2) => Ok(ManifestTemplate::V22(serde_json::from_slice(body)?)),
            _ => Err(OciError::UnknownManifestFormat(match probe.schema_version {
                Some(v) => format!("schemaVersion {v}"),
                None => "missing schemaVersion".to_string(),
            })),
        }
    }

    pub fn schema_version(&self) -> u32 {
        match self {
            ManifestTemplate::V21(m) => m.schema_version,
            ManifestTemplate::V22(m) => m.schema_version,
        }
    }
}

// ---------------------------------------------------------------------------
// Container configuration
// ---------------------------------------------------------------------------

/// The container configuration blob referenced by a V2.2 manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfigurationTemplate {
    #[serde(default = "epoch")]
    pub created: String,

    #[serde(default = "amd64")]
    pub architecture: String,

    #[serde(default = "linux")]
    pub os: String,

    #[serde(default)]
    pub config: RuntimeConfig,

    pub rootfs: RootFs,
}

/// Runtime parameters of the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,

    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,

    pub diff_ids: Vec<DescriptorDigest>,
}

fn epoch() -> String {
    "1970-01-01T00:00:00Z".to_string()
}

fn amd64() -> String {
    "amd64".to_string()
}

fn linux() -> String {
    "linux".to_string()
}

impl Default for ContainerConfigurationTemplate {
    fn default() -> Self {
        Self {
            created: epoch(),
            architecture: amd64(),
            os: linux(),
            config: RuntimeConfig::default(),
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: Vec::new(),
            },
        }
    }
}

impl ContainerConfigurationTemplate {
    pub fn add_layer_diff_id(&mut self, diff_id: DescriptorDigest) {
        self.rootfs.diff_ids.push(diff_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
