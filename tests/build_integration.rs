//! End-to-end builds against a mock Docker Registry V2 endpoint.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use httpmock::prelude::*;
use httpmock::Mock;

use layerbake::build::ImageBuild;
use layerbake::oci::manifest::{ContainerConfigurationTemplate, V22ManifestTemplate};
use layerbake::oci::{BlobDescriptor, DescriptorDigest, OciError};
use layerbake::spec::{BuildSpec, SourcesSpec};
use layerbake::Error;

const UPLOAD_SESSION: &str = "/v2/test/app/blobs/uploads/session-1";

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn descriptor(bytes: &[u8]) -> BlobDescriptor {
    BlobDescriptor::new(bytes.len() as u64, DescriptorDigest::of_bytes(bytes))
}

/// Base image `test/base:1.0` with a single layer.
struct BaseImage<'a> {
    manifest: Mock<'a>,
    config: Mock<'a>,
    layer: Mock<'a>,
    cache_file: String,
}

fn serve_base_image(server: &MockServer) -> BaseImage<'_> {
    let uncompressed = b"base layer contents".to_vec();
    let layer = gzip(&uncompressed);
    let layer_descriptor = descriptor(&layer);

    let mut config = ContainerConfigurationTemplate::default();
    config.add_layer_diff_id(DescriptorDigest::of_bytes(&uncompressed));
    let config = serde_json::to_vec(&config).unwrap();
    let config_descriptor = descriptor(&config);

    let mut manifest = V22ManifestTemplate::new(&config_descriptor);
    manifest.add_layer(&layer_descriptor);
    let manifest = serde_json::to_vec(&manifest).unwrap();

    let manifest_mock = server.mock(|when, then| {
        when.method(GET).path("/v2/test/base/manifests/1.0");
        then.status(200).body(manifest.clone());
    });
    let config_mock = server.mock(|when, then| {
        when.method(GET)
            .path(format!("/v2/test/base/blobs/{}", config_descriptor.digest));
        then.status(200).body(config.clone());
    });
    let layer_mock = server.mock(|when, then| {
        when.method(GET)
            .path(format!("/v2/test/base/blobs/{}", layer_descriptor.digest));
        then.status(200).body(layer.clone());
    });

    BaseImage {
        manifest: manifest_mock,
        config: config_mock,
        layer: layer_mock,
        cache_file: format!("{}.tar.gz", layer_descriptor.digest.hash()),
    }
}

/// Anonymous registry that accepts every upload and manifest for `test/app`.
fn serve_uploads(server: &MockServer) -> (Mock<'_>, Mock<'_>) {
    server.mock(|when, then| {
        when.method(GET).path("/v2/");
        then.status(200);
    });
    let initiate = server.mock(|when, then| {
        when.method(POST).path("/v2/test/app/blobs/uploads/");
        then.status(202).header("Location", UPLOAD_SESSION);
    });
    server.mock(|when, then| {
        when.method(PATCH).path(UPLOAD_SESSION);
        then.status(202).header("Location", UPLOAD_SESSION);
    });
    server.mock(|when, then| {
        when.method(PUT).path(UPLOAD_SESSION);
        then.status(201);
    });
    let manifest = server.mock(|when, then| {
        when.method(PUT)
            .path("/v2/test/app/manifests/1.0")
            .header("content-type", "application/vnd.docker.distribution.manifest.v2+json");
        then.status(201);
    });
    (initiate, manifest)
}

fn build_spec(server: &MockServer, root: &Path) -> BuildSpec {
    let classes = root.join("build/classes");
    let resources = root.join("build/resources");
    fs::create_dir_all(classes.join("com/example")).unwrap();
    fs::create_dir_all(&resources).unwrap();
    fs::write(classes.join("com/example/Main.class"), b"main class").unwrap();
    fs::write(resources.join("app.properties"), b"greeting=hello").unwrap();

    BuildSpec {
        api_version: "v1".to_string(),
        base_image: format!("{}/test/base:1.0", server.address()),
        target_image: format!("{}/test/app:1.0", server.address()),
        cache_dir: root.join("cache"),
        workers: 2,
        entrypoint: vec!["java".into(), "-cp".into(), "/app/classes".into(), "com.example.Main".into()],
        environment: BTreeMap::from([("JAVA_OPTS".to_string(), "-Xmx256m".to_string())]),
        sources: SourcesSpec {
            dependencies: Vec::new(),
            resources: vec![resources],
            classes: vec![classes],
        },
        app_root: "/app".to_string(),
    }
}

#[test]
fn builds_pushes_and_reuses_cache() {
    let server = MockServer::start();
    let base = serve_base_image(&server);
    let (initiate, manifest_push) = serve_uploads(&server);
    let tmp = tempfile::tempdir().unwrap();
    let spec = build_spec(&server, tmp.path());

    let first = ImageBuild::new(spec.clone()).unwrap().run().unwrap();
    assert_eq!(first.layers, 4);
    assert!(first.base_layers_pulled);
    assert_eq!(first.rebuilt_layers, vec!["dependencies", "resources", "classes"]);
    assert_eq!(first.blobs_pushed, 5);
    assert_eq!(first.blobs_existing, 0);
    assert_eq!(first.manifest_digest.to_string().len(), "sha256:".len() + 64);
    initiate.assert_hits(5);
    manifest_push.assert_hits(1);
    base.layer.assert_hits(1);
    assert!(tmp.path().join("cache/metadata.json").exists());

    let second = ImageBuild::new(spec).unwrap().run().unwrap();
    assert!(!second.base_layers_pulled);
    assert!(second.rebuilt_layers.is_empty());
    assert_eq!(second.manifest_digest, first.manifest_digest);
    base.layer.assert_hits(1);
    base.manifest.assert_hits(2);
    base.config.assert_hits(2);
    manifest_push.assert_hits(2);
}

#[test]
fn missing_base_image_fails_the_build() {
    let server = MockServer::start();
    serve_uploads(&server);
    server.mock(|when, then| {
        when.method(GET).path("/v2/test/base/manifests/1.0");
        then.status(404)
            .body(r#"{"errors":[{"code":"MANIFEST_UNKNOWN","message":"manifest unknown"}]}"#);
    });
    let tmp = tempfile::tempdir().unwrap();
    let spec = build_spec(&server, tmp.path());

    let err = ImageBuild::new(spec).unwrap().run().unwrap_err();
    match &err {
        Error::StepFailed { step, .. } => assert_eq!(step, "pull-base-manifest"),
        other => panic!("unexpected error: {other:?}"),
    }
    match err.root_cause() {
        Error::Oci(OciError::RegistryErrorResponse { errors, .. }) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].code, "MANIFEST_UNKNOWN");
        }
        other => panic!("unexpected root cause: {other:?}"),
    }
}

#[test]
fn deleted_cache_files_are_rebuilt_and_pulled_again() {
    let server = MockServer::start();
    let base = serve_base_image(&server);
    serve_uploads(&server);
    let tmp = tempfile::tempdir().unwrap();
    let spec = build_spec(&server, tmp.path());

    let first = ImageBuild::new(spec.clone()).unwrap().run().unwrap();
    let cache_dir = tmp.path().join("cache");
    fs::remove_file(cache_dir.join("classes.tar.gz")).unwrap();
    fs::remove_file(cache_dir.join(&base.cache_file)).unwrap();

    let second = ImageBuild::new(spec.clone()).unwrap().run().unwrap();
    assert!(second.base_layers_pulled);
    assert_eq!(second.rebuilt_layers, vec!["classes"]);
    assert_eq!(second.manifest_digest, first.manifest_digest);
    assert!(cache_dir.join("classes.tar.gz").exists());
    assert!(cache_dir.join(&base.cache_file).exists());
    base.layer.assert_hits(2);

    let third = ImageBuild::new(spec).unwrap().run().unwrap();
    assert!(!third.base_layers_pulled);
    assert!(third.rebuilt_layers.is_empty());
    base.layer.assert_hits(2);
}
