use std::sync::Arc;

use color_eyre::Result;
use stratum::{
    image::{Backend, Format, WorkingImage},
    registry::RegistryClient,
    Platform,
};

use crate::support::{self, MemoryRegistry};

#[test_log::test(tokio::test)]
async fn push_then_pull_roundtrip() -> Result<()> {
    let registry = MemoryRegistry::new();
    let dir = tempfile::tempdir()?;
    let layer_path = dir.path().join("layer.tar");
    support::fixture_layer(&layer_path, &[("bin/app", b"#!/bin/true")]).await?;

    let name = support::reference("docker.io/testing/pushed:latest");
    let mut image = WorkingImage::builder()
        .name(name.clone())
        .backend(Backend::Registry(Arc::new(registry.clone())))
        .platform(Platform::linux_amd64())
        .build()
        .await?;
    image.add_layer(&layer_path).await?;
    image.set_env("RUNTIME", "stratum");

    let identifier = image.save(&[]).await?;

    // Pulling the manifest back yields the exact bytes that were pushed.
    let (manifest, _) = image.rendered_manifest().await?;
    let rendered = manifest.rendered()?;
    let (stored, descriptor) = registry.get(&name).await?;
    pretty_assertions::assert_eq!(stored, rendered.bytes);
    pretty_assertions::assert_eq!(descriptor.digest.to_string(), identifier);

    // Pulling through the library yields an equal image.
    let pulled = support::source_image(&registry, &name).await?;
    pretty_assertions::assert_eq!(&pulled.config, image.config());
    for layer in pulled.layers()? {
        let stream = layer.uncompressed().await?;
        let (digest, _) = stratum::cfs::hash_stream(stream).await?;
        pretty_assertions::assert_eq!(&digest, layer.diff_id());
    }

    Ok(())
}

#[test_log::test(tokio::test)]
async fn additional_names_each_get_the_manifest() -> Result<()> {
    let registry = MemoryRegistry::new();
    let dir = tempfile::tempdir()?;
    let layer_path = dir.path().join("layer.tar");
    support::fixture_layer(&layer_path, &[("a", b"a")]).await?;

    let mut image = WorkingImage::builder()
        .name(support::reference("docker.io/testing/multi:latest"))
        .backend(Backend::Registry(Arc::new(registry.clone())))
        .platform(Platform::linux_amd64())
        .build()
        .await?;
    image.add_layer(&layer_path).await?;
    image
        .save(&["docker.io/testing/multi:v1", "docker.io/other/copy:latest"])
        .await?;

    for name in [
        "docker.io/testing/multi:latest",
        "docker.io/testing/multi:v1",
        "docker.io/other/copy:latest",
    ] {
        let reference = support::reference(name);
        registry.get(&reference).await.expect("manifest stored");
    }

    Ok(())
}

#[test_log::test(tokio::test)]
async fn partial_failures_are_reported_per_target() -> Result<()> {
    let registry = MemoryRegistry::new();
    registry.fail_writes_to("blocked/repo");

    let dir = tempfile::tempdir()?;
    let layer_path = dir.path().join("layer.tar");
    support::fixture_layer(&layer_path, &[("a", b"a")]).await?;

    let mut image = WorkingImage::builder()
        .name(support::reference("docker.io/testing/partial:latest"))
        .backend(Backend::Registry(Arc::new(registry.clone())))
        .platform(Platform::linux_amd64())
        .build()
        .await?;
    image.add_layer(&layer_path).await?;

    let error = image
        .save(&["docker.io/blocked/repo:latest"])
        .await
        .expect_err("blocked target must fail");

    // Exactly the blocked target is diagnosed; the primary committed.
    assert_eq!(error.errors.len(), 1);
    assert_eq!(error.errors[0].0, "docker.io/blocked/repo:latest");
    registry
        .get(&support::reference("docker.io/testing/partial:latest"))
        .await
        .expect("primary target committed");

    Ok(())
}

#[test_log::test(tokio::test)]
async fn reused_layers_are_not_reuploaded() -> Result<()> {
    let registry = MemoryRegistry::new();
    let platform = Platform::linux_amd64();

    let base_tar = support::tar_bytes(&[("base", b"base")]).await?;
    let app_tar = support::tar_bytes(&[("app", b"app")]).await?;

    let name = support::reference("docker.io/testing/reused:latest");
    registry
        .seed_image(&name, &platform, Format::Oci, &[base_tar.clone(), app_tar.clone()])
        .await?;

    let base_ref = support::reference("docker.io/testing/reused-base:latest");
    registry
        .seed_image(&base_ref, &platform, Format::Oci, &[base_tar])
        .await?;

    let base = support::source_image(&registry, &base_ref).await?;
    let previous = support::source_image(&registry, &name).await?;

    let mut image = WorkingImage::builder()
        .name(name.clone())
        .backend(Backend::Registry(Arc::new(registry.clone())))
        .base(base)
        .previous(previous)
        .build()
        .await?;

    let fetches_before = registry.blob_fetch_count();
    image.reuse_layer(&support::diff_id_of(&app_tar))?;
    image.save(&[]).await?;

    // The reused layer's content was neither fetched nor re-uploaded; only
    // the base layer blob moved.
    assert_eq!(registry.blob_fetch_count(), fetches_before + 1);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn reused_layers_still_upload_to_other_repositories() -> Result<()> {
    let registry = MemoryRegistry::new();
    let platform = Platform::linux_amd64();

    let base_tar = support::tar_bytes(&[("base", b"base")]).await?;
    let app_tar = support::tar_bytes(&[("app", b"app")]).await?;

    let name = support::reference("docker.io/testing/reused:latest");
    registry
        .seed_image(&name, &platform, Format::Oci, &[base_tar.clone(), app_tar.clone()])
        .await?;

    let base_ref = support::reference("docker.io/testing/reused-base:latest");
    registry
        .seed_image(&base_ref, &platform, Format::Oci, &[base_tar])
        .await?;

    let base = support::source_image(&registry, &base_ref).await?;
    let previous = support::source_image(&registry, &name).await?;

    let mut image = WorkingImage::builder()
        .name(name.clone())
        .backend(Backend::Registry(Arc::new(registry.clone())))
        .base(base)
        .previous(previous)
        .build()
        .await?;
    image.reuse_layer(&support::diff_id_of(&app_tar))?;

    // The reuse skip only applies to the previous image's own repository;
    // a target in a different repository still needs every blob.
    image.save(&["docker.io/other/mirror:latest"]).await?;

    let mirror = support::reference("docker.io/other/mirror:latest");
    let pulled = support::source_image(&registry, &mirror).await?;
    assert_eq!(pulled.manifest.layers.len(), 2);
    for layer in pulled.layers()? {
        let stream = layer.uncompressed().await?;
        let (digest, _) = stratum::cfs::hash_stream(stream).await?;
        pretty_assertions::assert_eq!(&digest, layer.diff_id());
    }

    Ok(())
}
