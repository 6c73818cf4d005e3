use std::sync::Arc;

use color_eyre::Result;
use stratum::{
    image::{Backend, Format, WorkingImage},
    Platform,
};

use crate::support::{self, MemoryDaemon, MemoryRegistry};

#[test_log::test(tokio::test)]
async fn reuse_fast_path_emits_empty_layer_slots() -> Result<()> {
    let registry = MemoryRegistry::new();
    let platform = Platform::linux_amd64();

    let a = support::tar_bytes(&[("a.txt", b"layer a")]).await?;
    let b = support::tar_bytes(&[("b.txt", b"layer b")]).await?;
    let c = support::tar_bytes(&[("c.txt", b"layer c")]).await?;
    let x = support::tar_bytes(&[("x.txt", b"layer x")]).await?;
    let y = support::tar_bytes(&[("y.txt", b"layer y")]).await?;

    // The previous build of this image carries the base plus two app layers.
    let app_ref = support::reference("docker.io/testing/app:latest");
    registry
        .seed_image(
            &app_ref,
            &platform,
            Format::Oci,
            &[a.clone(), b.clone(), c.clone(), x.clone(), y.clone()],
        )
        .await?;

    let base_ref = support::reference("docker.io/testing/base:latest");
    registry
        .seed_image(&base_ref, &platform, Format::Oci, &[a, b, c])
        .await?;

    let base = support::source_image(&registry, &base_ref).await?;
    let previous = support::source_image(&registry, &app_ref).await?;
    let daemon = MemoryDaemon::new();

    let mut image = WorkingImage::builder()
        .name(support::reference("docker.io/testing/app:next"))
        .backend(Backend::Daemon(Arc::new(daemon.clone())))
        .base(base)
        .previous(previous)
        .build()
        .await?;

    // Renaming onto the previous image's tag arms the fast path.
    image.rename(app_ref.clone());
    let fetches_before = registry.blob_fetch_count();

    let diff_x = support::diff_id_of(&x);
    let diff_y = support::diff_id_of(&y);
    image.reuse_layer(&diff_x)?;
    image.reuse_layer(&diff_y)?;
    pretty_assertions::assert_eq!(image.top_layer()?, &diff_y);

    // Reusing through the fast path never touched the previous image.
    assert_eq!(registry.blob_fetch_count(), fetches_before);

    let identifier = image.save(&[]).await?;

    // The daemon tarball lists the three base layers by content and the two
    // reused layers as empty slots.
    let manifest = daemon.loaded_manifest().expect("tarball manifest");
    assert_eq!(manifest.layers.len(), 5);
    assert!(manifest.layers[..3].iter().all(|slot| !slot.is_empty()));
    pretty_assertions::assert_eq!(&manifest.layers[3..], &["", ""]);

    // Only the base layers were downloaded to build the tarball.
    assert_eq!(registry.blob_fetch_count(), fetches_before + 3);

    // The returned identifier is the daemon's image ID for the primary tag.
    let (_, config_blob) = image.rendered_manifest().await?;
    pretty_assertions::assert_eq!(identifier, config_blob.digest.to_string());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn tarball_layers_carry_uncompressed_content() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let layer_path = dir.path().join("layer.tar");
    support::fixture_layer(&layer_path, &[("data.txt", b"daemon layer")]).await?;
    let layer_bytes = bytes::Bytes::from(tokio::fs::read(&layer_path).await?);

    let daemon = MemoryDaemon::new();
    let mut image = WorkingImage::builder()
        .name(support::reference("docker.io/testing/daemon:latest"))
        .backend(Backend::Daemon(Arc::new(daemon.clone())))
        .platform(Platform::linux_amd64())
        .build()
        .await?;
    image.add_layer(&layer_path).await?;
    image.save(&[]).await?;

    let manifest = daemon.loaded_manifest().expect("tarball manifest");
    assert_eq!(manifest.layers.len(), 1);
    assert!(manifest.layers[0].ends_with(".tar"));

    // The entry holds the plain tar, not a compressed blob.
    let entry = daemon.entry(&manifest.layers[0]).expect("layer entry");
    pretty_assertions::assert_eq!(entry, layer_bytes);

    // The config entry is named by its own digest.
    let (_, config_blob) = image.rendered_manifest().await?;
    pretty_assertions::assert_eq!(
        manifest.config,
        format!("{}.json", config_blob.digest.as_hex()),
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn additional_names_become_repo_tags() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let layer_path = dir.path().join("layer.tar");
    support::fixture_layer(&layer_path, &[("data.txt", b"tagged")]).await?;

    let daemon = MemoryDaemon::new();
    let mut image = WorkingImage::builder()
        .name(support::reference("docker.io/testing/tags:latest"))
        .backend(Backend::Daemon(Arc::new(daemon.clone())))
        .platform(Platform::linux_amd64())
        .build()
        .await?;
    image.add_layer(&layer_path).await?;
    image.save(&["docker.io/testing/tags:v1"]).await?;

    let manifest = daemon.loaded_manifest().expect("tarball manifest");
    pretty_assertions::assert_eq!(
        manifest.repo_tags,
        vec![
            "docker.io/testing/tags:latest".to_string(),
            "docker.io/testing/tags:v1".to_string(),
        ],
    );

    Ok(())
}
