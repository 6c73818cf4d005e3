use color_eyre::Result;
use stratum::{
    cfs,
    config::History,
    image::{Backend, Format, WorkingImage},
    layout::LayoutStore,
    MediaType, Platform, NORMALIZED_CREATED,
};

use crate::support::{self, MemoryRegistry};

#[test_log::test(tokio::test)]
async fn streamed_layer_hashes_to_its_diff_id() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let layer_path = dir.path().join("layer.tar");
    support::fixture_layer(&layer_path, &[("file.txt", b"layer bytes")]).await?;

    let mut image = WorkingImage::builder()
        .name(support::reference("docker.io/testing/app:latest"))
        .backend(Backend::Layout(dir.path().join("layout")))
        .platform(Platform::linux_amd64())
        .build()
        .await?;
    image.add_layer(&layer_path).await?;

    let top = image.top_layer()?.clone();
    let stream = image.get_layer(&top).await?;
    let (digest, _) = cfs::hash_stream(stream).await?;
    pretty_assertions::assert_eq!(digest, top);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn base_image_layers_stream_through_get_layer() -> Result<()> {
    let registry = MemoryRegistry::new();
    let base_ref = support::reference("docker.io/testing/base:latest");
    let tar = support::tar_bytes(&[("base.txt", b"base layer")]).await?;
    registry
        .seed_image(&base_ref, &Platform::linux_amd64(), Format::Oci, &[tar.clone()])
        .await?;

    let base = support::source_image(&registry, &base_ref).await?;
    let image = WorkingImage::builder()
        .name(support::reference("docker.io/testing/app:latest"))
        .backend(Backend::Registry(std::sync::Arc::new(registry.clone())))
        .base(base)
        .build()
        .await?;

    let top = image.top_layer()?.clone();
    pretty_assertions::assert_eq!(top, support::diff_id_of(&tar));

    let stream = image.get_layer(&top).await?;
    let (digest, _) = cfs::hash_stream(stream).await?;
    pretty_assertions::assert_eq!(digest, top);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn config_mutations_survive_a_save() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let layout_root = dir.path().join("layout");
    let layer_path = dir.path().join("layer.tar");
    support::fixture_layer(&layer_path, &[("app.txt", b"app")]).await?;

    let mut image = WorkingImage::builder()
        .name(support::reference("docker.io/testing/app:latest"))
        .backend(Backend::Layout(layout_root.clone()))
        .platform(Platform::linux_amd64())
        .build()
        .await?;
    image.add_layer(&layer_path).await?;
    image.set_env("PATH", "/usr/local/bin");
    image.set_label("io.example.stack", "test");
    image.set_entrypoint(["/bin/app"]);
    image.set_cmd(["--help"]);
    image.set_working_dir("/workspace");

    let identifier = image.save(&[]).await?;

    let store = LayoutStore::from_path(&layout_root).await?;
    let reloaded = store.image(&identifier.parse()?).await?;
    assert_eq!(reloaded.config.env("PATH").as_deref(), Some("/usr/local/bin"));
    assert_eq!(reloaded.config.label("io.example.stack").as_deref(), Some("test"));
    assert_eq!(
        reloaded.config.config.entrypoint.as_deref(),
        Some(["/bin/app".to_string()].as_slice()),
    );
    assert_eq!(reloaded.config.config.working_dir.as_deref(), Some("/workspace"));
    assert_eq!(reloaded.config.docker_version, None);
    assert_eq!(reloaded.config.container, None);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn preserved_history_keeps_base_timestamps() -> Result<()> {
    let registry = MemoryRegistry::new();
    let base_ref = support::reference("docker.io/testing/base:latest");
    let tar = support::tar_bytes(&[("base.txt", b"base")]).await?;
    registry
        .seed_image(&base_ref, &Platform::linux_amd64(), Format::Oci, &[tar])
        .await?;

    let mut base = support::source_image(&registry, &base_ref).await?;
    base.config.history[0] = History {
        created: Some("2001-02-03T04:05:06Z".into()),
        created_by: Some("ADD rootfs.tar /".into()),
        ..History::default()
    };

    let dir = tempfile::tempdir()?;
    let layout_root = dir.path().join("layout");
    let mut image = WorkingImage::builder()
        .name(support::reference("docker.io/testing/app:latest"))
        .backend(Backend::Layout(layout_root.clone()))
        .base(base)
        .build()
        .await?;
    let identifier = image.save(&[]).await?;

    // The top-level created is normalized; the inherited history entry
    // keeps its own provenance.
    let store = LayoutStore::from_path(&layout_root).await?;
    let reloaded = store.image(&identifier.parse()?).await?;
    assert_eq!(reloaded.config.created, NORMALIZED_CREATED);
    assert_eq!(
        reloaded.config.history[0].created.as_deref(),
        Some("2001-02-03T04:05:06Z"),
    );
    assert_eq!(
        reloaded.config.history[0].created_by.as_deref(),
        Some("ADD rootfs.tar /"),
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn blanked_history_carries_the_normalized_timestamp() -> Result<()> {
    let registry = MemoryRegistry::new();
    let base_ref = support::reference("docker.io/testing/base:latest");
    let tar = support::tar_bytes(&[("base.txt", b"base")]).await?;
    registry
        .seed_image(&base_ref, &Platform::linux_amd64(), Format::Oci, &[tar])
        .await?;

    let mut base = support::source_image(&registry, &base_ref).await?;
    base.config.history[0] = History {
        created: Some("2001-02-03T04:05:06Z".into()),
        created_by: Some("ADD rootfs.tar /".into()),
        ..History::default()
    };

    let dir = tempfile::tempdir()?;
    let layout_root = dir.path().join("layout");
    let mut image = WorkingImage::builder()
        .name(support::reference("docker.io/testing/app:latest"))
        .backend(Backend::Layout(layout_root.clone()))
        .base(base)
        .preserve_history(false)
        .build()
        .await?;
    let identifier = image.save(&[]).await?;

    let store = LayoutStore::from_path(&layout_root).await?;
    let reloaded = store.image(&identifier.parse()?).await?;
    assert_eq!(reloaded.config.history.len(), 1);
    assert_eq!(
        reloaded.config.history[0].created.as_deref(),
        Some(NORMALIZED_CREATED),
    );
    assert_eq!(reloaded.config.history[0].created_by, None);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn media_type_coercion_rebuilds_every_layer() -> Result<()> {
    let registry = MemoryRegistry::new();
    let base_ref = support::reference("docker.io/testing/base:latest");
    let tars = [
        support::tar_bytes(&[("one.txt", b"one")]).await?,
        support::tar_bytes(&[("two.txt", b"two")]).await?,
    ];
    registry
        .seed_image(&base_ref, &Platform::linux_amd64(), Format::Oci, &tars)
        .await?;

    let base = support::source_image(&registry, &base_ref).await?;
    let image = WorkingImage::builder()
        .name(support::reference("docker.io/testing/app:latest"))
        .backend(Backend::Registry(std::sync::Arc::new(registry.clone())))
        .base(base)
        .format(Format::Docker)
        .build()
        .await?;

    assert_eq!(image.manifest_media_type(), MediaType::DockerManifest);
    assert_eq!(image.layers().len(), 2);
    for layer in image.layers() {
        assert_eq!(layer.media_type(), MediaType::DockerLayer);
    }
    // Diff IDs are untouched when no mutator rewrites the content.
    pretty_assertions::assert_eq!(
        image.config().rootfs.diff_ids,
        tars.iter().map(support::diff_id_of).collect::<Vec<_>>(),
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebase_preserves_application_layers_end_to_end() -> Result<()> {
    let registry = MemoryRegistry::new();

    let old_base_ref = support::reference("docker.io/testing/base:v1");
    let old_tars = [
        support::tar_bytes(&[("os.txt", b"old os")]).await?,
        support::tar_bytes(&[("runtime.txt", b"old runtime")]).await?,
    ];
    registry
        .seed_image(&old_base_ref, &Platform::linux_amd64(), Format::Oci, &old_tars)
        .await?;

    let new_base_ref = support::reference("docker.io/testing/base:v2");
    let new_tars = [
        support::tar_bytes(&[("os.txt", b"new os")]).await?,
        support::tar_bytes(&[("runtime.txt", b"new runtime")]).await?,
        support::tar_bytes(&[("extra.txt", b"new extra")]).await?,
    ];
    registry
        .seed_image(&new_base_ref, &Platform::linux_arm64(), Format::Oci, &new_tars)
        .await?;

    let dir = tempfile::tempdir()?;
    let app_layer = dir.path().join("app.tar");
    let app_diff = support::fixture_layer(&app_layer, &[("app.txt", b"app")]).await?;

    let base = support::source_image(&registry, &old_base_ref).await?;
    let mut image = WorkingImage::builder()
        .name(support::reference("docker.io/testing/app:latest"))
        .backend(Backend::Layout(dir.path().join("layout")))
        .base(base)
        .build()
        .await?;
    image.add_layer(&app_layer).await?;

    let old_top = support::diff_id_of(&old_tars[1]);
    let new_base = support::source_image(&registry, &new_base_ref).await?;
    image.rebase(&old_top, &new_base)?;

    let mut expected = new_tars.iter().map(support::diff_id_of).collect::<Vec<_>>();
    expected.push(app_diff);
    pretty_assertions::assert_eq!(image.config().rootfs.diff_ids, expected);
    assert_eq!(image.top_layer()?, &image.config().rootfs.diff_ids[3]);
    assert_eq!(image.architecture(), "arm64");

    let identifier = image.save(&[]).await?;
    let store = LayoutStore::from_path(&dir.path().join("layout")).await?;
    let reloaded = store.image(&identifier.parse()?).await?;
    assert_eq!(reloaded.config.rootfs.diff_ids.len(), 4);

    Ok(())
}
