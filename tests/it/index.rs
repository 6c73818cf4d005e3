use std::sync::Arc;

use color_eyre::Result;
use stratum::{
    image::Format,
    index::{AddOptions, ImageIndex, PushOptions},
    layout::LayoutStore,
    registry::RegistryClient,
    Annotations, Error, MediaType, Platform,
};

use crate::support::{self, MemoryRegistry};

async fn seeded_multiarch_index(
    registry: &MemoryRegistry,
    name: &str,
) -> Result<(stratum::Reference, stratum::Digest, stratum::Digest)> {
    let reference = support::reference(name);

    let amd_tar = support::tar_bytes(&[("bin/sh", b"amd64")]).await?;
    let amd = registry
        .seed_image(&reference, &Platform::linux_amd64(), Format::Oci, &[amd_tar])
        .await?;

    let arm_tar = support::tar_bytes(&[("bin/sh", b"arm64")]).await?;
    let arm = registry
        .seed_image(&reference, &Platform::linux_arm64(), Format::Oci, &[arm_tar])
        .await?;

    registry
        .seed_index(
            &reference,
            Format::Oci,
            &[
                (amd.clone(), Platform::linux_amd64()),
                (arm.clone(), Platform::linux_arm64()),
            ],
        )
        .await?;
    Ok((reference, amd, arm))
}

fn index_for(
    registry: &MemoryRegistry,
    name: &str,
    format: Format,
    root: &std::path::Path,
) -> Result<ImageIndex> {
    Ok(ImageIndex::builder()
        .name(support::reference(name))
        .client(Arc::new(registry.clone()))
        .format(format)
        .layout_root(root.to_path_buf())
        .build()?)
}

#[test_log::test(tokio::test)]
async fn add_with_platform_filter_save_reopen() -> Result<()> {
    let registry = MemoryRegistry::new();
    let dir = tempfile::tempdir()?;
    let (busybox, amd, _) = seeded_multiarch_index(&registry, "docker.io/library/busybox:1.36-musl").await?;

    let mut index = index_for(&registry, "docker.io/testing/multiarch:latest", Format::Oci, dir.path())?;
    index
        .add(
            &busybox,
            AddOptions::builder().platform(Platform::linux_amd64()).build(),
        )
        .await?;
    index.save().await?;

    // Reopening through the layout reader shows exactly one manifest, and
    // its platform is the filtered one.
    let store = LayoutStore::from_path(index.layout_path()).await?;
    let reopened = store.image_index().await?;
    assert_eq!(reopened.manifests.len(), 1);
    pretty_assertions::assert_eq!(reopened.manifests[0].digest, amd);
    let platform = reopened.manifests[0].platform.as_ref().expect("platform");
    assert_eq!(platform.os, "linux");
    assert_eq!(platform.architecture, "amd64");

    Ok(())
}

#[test_log::test(tokio::test)]
async fn add_all_collects_every_leaf() -> Result<()> {
    let registry = MemoryRegistry::new();
    let dir = tempfile::tempdir()?;
    let (busybox, amd, arm) = seeded_multiarch_index(&registry, "docker.io/library/busybox:latest").await?;

    let mut index = index_for(&registry, "docker.io/testing/all:latest", Format::Oci, dir.path())?;
    index
        .add(&busybox, AddOptions::builder().all(true).build())
        .await?;

    let digests = index.digests();
    assert!(digests.contains(&amd));
    assert!(digests.contains(&arm));
    assert_eq!(digests.len(), 2);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn setters_are_visible_before_save() -> Result<()> {
    let registry = MemoryRegistry::new();
    let dir = tempfile::tempdir()?;
    let (busybox, amd, _) = seeded_multiarch_index(&registry, "docker.io/library/busybox:latest").await?;

    let mut index = index_for(&registry, "docker.io/testing/staged:latest", Format::Oci, dir.path())?;
    index
        .add(
            &busybox.with_digest(amd.clone()),
            AddOptions::builder().build(),
        )
        .await?;

    index.set_os(&amd, "windows")?;
    assert_eq!(index.os(&amd)?, "windows");

    index.set_os_version(&amd, "10.0.14393.1066")?;
    assert_eq!(index.os_version(&amd)?, "10.0.14393.1066");

    index.set_urls(&amd, vec!["https://example.com/blob".into()])?;
    assert_eq!(index.urls(&amd)?, vec!["https://example.com/blob".to_string()]);

    // Nothing is reconciled yet.
    assert!(index.needs_save());

    // After save, the same values read back out of the base index.
    index.save().await?;
    assert!(!index.needs_save());
    assert_eq!(index.os(&amd)?, "windows");
    assert_eq!(index.os_version(&amd)?, "10.0.14393.1066");

    Ok(())
}

#[test_log::test(tokio::test)]
async fn removed_digests_vanish_from_every_getter() -> Result<()> {
    let registry = MemoryRegistry::new();
    let dir = tempfile::tempdir()?;
    let (busybox, amd, arm) = seeded_multiarch_index(&registry, "docker.io/library/busybox:latest").await?;

    let mut index = index_for(&registry, "docker.io/testing/removal:latest", Format::Oci, dir.path())?;
    index
        .add(&busybox, AddOptions::builder().all(true).build())
        .await?;
    index.save().await?;

    index.remove(&amd.to_string()).await?;
    index.save().await?;

    for result in [
        index.os(&amd).err(),
        index.architecture(&amd).err(),
        index.variant(&amd).err(),
    ] {
        assert!(
            matches!(result, Some(Error::NoSuchDigest(ref d)) if d == &amd),
            "expected NoSuchDigest, got {result:?}",
        );
    }

    // The sibling is untouched.
    assert_eq!(index.os(&arm)?, "linux");

    let store = LayoutStore::from_path(index.layout_path()).await?;
    assert_eq!(store.image_index().await?.manifests.len(), 1);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn remove_unknown_digest_fails() -> Result<()> {
    let registry = MemoryRegistry::new();
    let dir = tempfile::tempdir()?;

    let mut index = index_for(&registry, "docker.io/testing/empty:latest", Format::Oci, dir.path())?;
    let unknown = stratum::Digest::hash_bytes(b"unknown");
    let error = index.remove(&unknown.to_string()).await.expect_err("must fail");
    assert!(matches!(error, Error::NoSuchDigest(_)));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn annotations_ignored_on_docker_manifest_lists() -> Result<()> {
    let registry = MemoryRegistry::new();
    let dir = tempfile::tempdir()?;

    let reference = support::reference("docker.io/testing/docker-list:latest");
    let tar = support::tar_bytes(&[("bin/sh", b"docker")]).await?;
    let child = registry
        .seed_image(&reference, &Platform::linux_amd64(), Format::Docker, &[tar])
        .await?;

    let mut index = index_for(&registry, "docker.io/testing/docker-list:latest", Format::Docker, dir.path())?;
    index
        .add(
            &reference.with_digest(child.clone()),
            AddOptions::builder().build(),
        )
        .await?;

    // Staging succeeds; the write is dropped at save time.
    index.set_annotations(
        &child,
        Annotations::from([("k".to_string(), "v".to_string())]),
    )?;
    index.save().await?;

    let mut reopened = ImageIndex::from_layout(
        support::reference("docker.io/testing/docker-list:latest"),
        Arc::new(registry.clone()),
        Some(dir.path().to_path_buf()),
    )
    .await?;

    let error = reopened.annotations(&child).expect_err("must be undefined");
    assert!(
        matches!(
            error,
            Error::UndefinedField {
                field: "annotations",
                ..
            }
        ),
        "got {error:?}",
    );

    // The index manifest itself kept the Docker list media type.
    assert_eq!(reopened.media_type(), MediaType::DockerManifestList);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn push_with_pending_changes_fails() -> Result<()> {
    let registry = MemoryRegistry::new();
    let dir = tempfile::tempdir()?;
    let (busybox, amd, _) = seeded_multiarch_index(&registry, "docker.io/library/busybox:latest").await?;

    let mut index = index_for(&registry, "docker.io/testing/pending:latest", Format::Oci, dir.path())?;
    index
        .add(
            &busybox.with_digest(amd.clone()),
            AddOptions::builder()
                .annotations(Annotations::from([("a".to_string(), "b".to_string())]))
                .build(),
        )
        .await?;

    assert!(index.needs_save());
    let error = index
        .push(PushOptions::builder().build())
        .await
        .expect_err("must fail");
    assert!(matches!(error, Error::IndexNeedsSave));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn push_uploads_only_the_index_manifest() -> Result<()> {
    let registry = MemoryRegistry::new();
    let dir = tempfile::tempdir()?;
    let (busybox, amd, _) = seeded_multiarch_index(&registry, "docker.io/library/busybox:latest").await?;

    let name = support::reference("docker.io/testing/pushed-index:latest");
    let mut index = index_for(&registry, "docker.io/testing/pushed-index:latest", Format::Oci, dir.path())?;
    index
        .add(
            &busybox.with_digest(amd.clone()),
            AddOptions::builder().build(),
        )
        .await?;
    index.save().await?;

    let digest = index
        .push(PushOptions::builder().tags(vec!["v1".to_string()]).purge(true).build())
        .await?;

    let (bytes, descriptor) = registry.get(&name).await?;
    pretty_assertions::assert_eq!(descriptor.digest, digest);
    let stored = serde_json::from_slice::<stratum::manifest::Index>(&bytes)?;
    assert_eq!(stored.manifests.len(), 1);

    let tagged = registry.get(&name.with_tag("v1")).await?;
    pretty_assertions::assert_eq!(tagged.1.digest, digest);

    // Purge removed the local layout.
    assert!(!index.layout_path().exists());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn add_without_filter_falls_back_to_host_platform() -> Result<()> {
    let registry = MemoryRegistry::new();
    let dir = tempfile::tempdir()?;

    // Seed children for the host platform and an alternative one, so the
    // fallback has something unambiguous to select.
    let reference = support::reference("docker.io/testing/host:latest");
    let host = Platform::host();
    let other = if host.architecture == "amd64" {
        Platform::linux_arm64()
    } else {
        Platform::linux_amd64()
    };

    let host_tar = support::tar_bytes(&[("host", b"host")]).await?;
    let host_digest = registry
        .seed_image(&reference, &host, Format::Oci, &[host_tar])
        .await?;
    let other_tar = support::tar_bytes(&[("other", b"other")]).await?;
    let other_digest = registry
        .seed_image(&reference, &other, Format::Oci, &[other_tar])
        .await?;

    // The non-host child comes first so selection can't just take the
    // first entry.
    registry
        .seed_index(
            &reference,
            Format::Oci,
            &[(other_digest, other), (host_digest.clone(), host)],
        )
        .await?;

    let mut index = index_for(&registry, "docker.io/testing/host-index:latest", Format::Oci, dir.path())?;
    index.add(&reference, AddOptions::builder().build()).await?;

    assert_eq!(index.digests(), vec![host_digest]);

    Ok(())
}
