//! Content and wire formats for building container images: layers with
//! dual digests, a staleness-tracking local cache, manifest/config JSON, and
//! a Docker Registry V2 client.

pub mod blob;
pub mod cache;
pub mod digest;
pub mod error;
pub mod image;
pub mod layer;
pub mod manifest;
pub mod registry;
pub mod translator;

pub use blob::Blob;
pub use digest::{BlobDescriptor, DescriptorDigest};
pub use error::{OciError, Result};
