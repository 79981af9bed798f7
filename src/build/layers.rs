use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::try_join_all;
use layerbake_oci::cache::{ApplicationLayerType, Cache};
use layerbake_oci::image::ImageLayers;
use layerbake_oci::layer::{CachedLayer, LayerBuilder};
use layerbake_oci::registry::RegistryClient;
use layerbake_oci::Blob;
use tracing::{debug, info};

use crate::{Error, Result};

/// Base image layers as stored in the cache, in manifest order.
#[derive(Debug, Clone)]
pub(crate) struct BaseLayers {
    pub layers: Vec<CachedLayer>,
    pub pulled: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ApplicationLayer {
    pub layer_type: ApplicationLayerType,
    pub layer: CachedLayer,
    pub rebuilt: bool,
}

/// Directory inside the image that receives a category's files.
pub(crate) fn archive_root(app_root: &str, layer_type: ApplicationLayerType) -> String {
    let dir = match layer_type {
        ApplicationLayerType::Dependencies => "libs",
        ApplicationLayerType::Resources => "resources",
        ApplicationLayerType::Classes => "classes",
    };
    format!("{}/{}", app_root.trim_end_matches('/'), dir)
}

/// Run file-system work off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Runtime(format!("blocking task failed: {e}")))?
}

/// Reuse the cached base layers when they match `layers`; otherwise pull
/// every layer blob and store it. Downloads run concurrently, cache writes
/// happen in manifest order so the recorded order matches the image.
pub(crate) async fn cache_base_layers(
    cache: Arc<Cache>,
    client: Arc<RegistryClient>,
    layers: Arc<ImageLayers>,
) -> Result<BaseLayers> {
    if !cache.checker().is_base_image_modified(&layers)? {
        let cached: Vec<CachedLayer> = cache
            .reader()
            .base_image_layers()?
            .into_iter()
            .map(|l| l.layer)
            .collect();
        info!(layers = cached.len(), "base image unchanged, reusing cached layers");
        return Ok(BaseLayers {
            layers: cached,
            pulled: false,
        });
    }

    let pulls = layers.iter().map(|layer| {
        let client = Arc::clone(&client);
        let digest = layer.blob_descriptor().map(|d| d.digest.clone());
        async move {
            let digest = digest?;
            let bytes = client.pull_blob(&digest).await?;
            debug!(%digest, bytes = bytes.len(), "pulled base layer");
            Ok::<_, Error>((digest, bytes))
        }
    });
    let blobs = try_join_all(pulls).await?;

    blocking(move || {
        let writer = cache.writer();
        writer.reset_base_image_layers()?;
        let mut cached = Vec::with_capacity(blobs.len());
        for (digest, bytes) in blobs {
            cached.push(writer.write_base_image_layer(&digest, Blob::from_bytes(bytes))?);
        }
        info!(layers = cached.len(), "cached base image layers");
        Ok(BaseLayers {
            layers: cached,
            pulled: true,
        })
    })
    .await
}

/// Reuse the category's cached layer unless something under `sources`
/// changed since it was written; otherwise archive `sources` under
/// `archive_root` and cache the result.
pub(crate) async fn application_layer(
    cache: Arc<Cache>,
    layer_type: ApplicationLayerType,
    sources: Vec<PathBuf>,
    archive_root: String,
) -> Result<ApplicationLayer> {
    blocking(move || {
        if !cache.checker().is_application_layer_modified(layer_type, &sources)? {
            if let Some(cached) = cache.reader().application_layer(layer_type)? {
                info!(
                    layer = %layer_type,
                    digest = %cached.layer.descriptor.digest,
                    "layer unchanged, reusing cache"
                );
                return Ok(ApplicationLayer {
                    layer_type,
                    layer: cached.layer,
                    rebuilt: false,
                });
            }
        }

        let mut builder = LayerBuilder::new();
        for dir in &sources {
            builder.add_directory(dir, &archive_root)?;
        }
        let layer = cache
            .writer()
            .write_application_layer(layer_type, &builder.build()?)?;
        info!(
            layer = %layer_type,
            digest = %layer.descriptor.digest,
            files = builder.entries().len(),
            "built layer"
        );
        Ok(ApplicationLayer {
            layer_type,
            layer,
            rebuilt: true,
        })
    })
    .await
}
