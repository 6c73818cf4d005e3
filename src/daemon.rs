//! The daemon capability and the daemon save engine.
//!
//! The save engine streams a Docker-format tarball through an in-memory
//! pipe into the daemon's image-load endpoint, then inspects the daemon for
//! the new image ID. A [`bollard`]-backed adapter is provided so the engine
//! works against a real Docker socket; tests drive it with an in-memory
//! fake instead.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use bollard::Docker;
use bon::Builder;
use futures_lite::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::DuplexStream;
use tokio_tar::{Builder as TarBuilder, Header};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};

use crate::{
    cfs::{self, ByteStream},
    image::WorkingImage,
    manifest::RenderedBlob,
    Digest, Error, Result, StringSet,
};

/// An image as reported by the daemon.
#[derive(Debug, Clone, Builder)]
pub struct DaemonImage {
    /// The daemon's image ID (a sha256 digest).
    #[builder(into)]
    pub id: Digest,

    /// Tags the daemon associates with the image.
    #[builder(into, default)]
    pub repo_tags: Vec<String>,
}

/// One entry of an image's history as reported by the daemon.
#[derive(Debug, Clone, Default, Builder)]
pub struct DaemonHistory {
    /// The command that produced the layer.
    #[builder(into, default)]
    pub created_by: String,

    /// Creation time in seconds since the epoch.
    #[builder(default)]
    pub created: i64,

    /// Free-form comment.
    #[builder(into, default)]
    pub comment: String,

    /// Tags pointing at this point of the history.
    #[builder(into, default)]
    pub tags: Vec<String>,

    /// Layer size in bytes.
    #[builder(default)]
    pub size: i64,
}

/// Capability to talk to a local container daemon.
#[async_trait]
pub trait DaemonClient: std::fmt::Debug + Send + Sync {
    /// Look up an image by name or ID.
    async fn inspect(&self, name: &str) -> Result<DaemonImage>;

    /// Load a Docker-format tarball into the daemon.
    async fn load(&self, tarball: ByteStream) -> Result<()>;

    /// Export an image from the daemon as a Docker-format tarball.
    async fn save(&self, name: &str) -> Result<ByteStream>;

    /// Remove an image from the daemon.
    async fn remove(&self, name: &str) -> Result<()>;

    /// The history of an image in the daemon.
    async fn history(&self, name: &str) -> Result<Vec<DaemonHistory>>;
}

/// [`DaemonClient`] backed by a local Docker daemon.
///
/// Connection setup honors `DOCKER_HOST` through bollard's local defaults.
#[derive(Debug, Clone)]
pub struct DockerDaemon {
    docker: Docker,
}

impl DockerDaemon {
    /// Connect to the local Docker daemon and verify it responds.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(Error::transport)?;
        docker.version().await.map_err(Error::transport)?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl DaemonClient for DockerDaemon {
    #[instrument(skip(self))]
    async fn inspect(&self, name: &str) -> Result<DaemonImage> {
        let inspected = self
            .docker
            .inspect_image(name)
            .await
            .map_err(Error::transport)?;

        let id = inspected
            .id
            .ok_or_else(|| Error::ImageNotLoaded(name.to_string()))?
            .parse::<Digest>()?;
        Ok(DaemonImage {
            id,
            repo_tags: inspected.repo_tags.unwrap_or_default(),
        })
    }

    #[instrument(skip(self, tarball))]
    async fn load(&self, tarball: ByteStream) -> Result<()> {
        // The load endpoint wants the whole archive as one body.
        let body = cfs::collect_buf(tarball).await?;
        let options = bollard::image::ImportImageOptions {
            quiet: true,
            ..Default::default()
        };

        let mut progress = self
            .docker
            .import_image(options, bollard::body_full(body), None);
        while let Some(update) = progress.next().await {
            let update = update.map_err(Error::transport)?;
            debug!(?update, "load progress");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn save(&self, name: &str) -> Result<ByteStream> {
        let stream = self
            .docker
            .export_image(name)
            .map(|chunk| chunk.map_err(std::io::Error::other));
        Ok(cfs::boxed(stream))
    }

    #[instrument(skip(self))]
    async fn remove(&self, name: &str) -> Result<()> {
        self.docker
            .remove_image(name, None::<bollard::query_parameters::RemoveImageOptions>, None)
            .await
            .map_err(Error::transport)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn history(&self, name: &str) -> Result<Vec<DaemonHistory>> {
        let entries = self
            .docker
            .image_history(name)
            .await
            .map_err(Error::transport)?;

        Ok(entries
            .into_iter()
            .map(|entry| DaemonHistory {
                created_by: entry.created_by,
                created: entry.created,
                comment: entry.comment,
                tags: entry.tags,
                size: entry.size,
            })
            .collect())
    }
}

/// The `manifest.json` entry of a Docker load tarball.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TarballManifest {
    /// The config entry name (`<configId>.json`).
    pub config: String,

    /// The tags the daemon applies to the loaded image.
    pub repo_tags: Vec<String>,

    /// Layer entry names, base first. Reused layers appear as `""`.
    pub layers: Vec<String>,
}

/// Stream the image into the daemon as a Docker tarball and report the
/// loaded image's ID.
#[instrument(skip(client, image), fields(primary = %image.name()))]
pub(crate) async fn save(
    client: Arc<dyn DaemonClient>,
    image: &WorkingImage,
    names: &StringSet,
) -> Result<String> {
    let primary = image.name().to_string();
    let config_blob = RenderedBlob::from_json(image.config())?;

    // One task reads the pipe into the load endpoint while this task writes
    // the tarball into it; closing the writer ends the load body.
    let (writer, reader) = tokio::io::duplex(64 * 1024);
    let loader = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.load(cfs::boxed(ReaderStream::new(reader))).await })
    };

    let written = write_tarball(writer, image, &config_blob, names).await;
    let loaded = loader
        .await
        .map_err(|e| Error::transport(format!("join daemon load task: {e}")))?;
    written?;
    loaded?;

    let inspected = client.inspect(&primary).await.map_err(|error| {
        warn!(%error, "image missing from daemon after load");
        Error::ImageNotLoaded(primary.clone())
    })?;
    Ok(inspected.id.to_string())
}

async fn write_tarball(
    writer: DuplexStream,
    image: &WorkingImage,
    config_blob: &RenderedBlob,
    names: &StringSet,
) -> Result<()> {
    let mut builder = TarBuilder::new(writer);

    let config_entry = format!("{}.json", config_blob.digest.as_hex());
    append_bytes(&mut builder, &config_entry, &config_blob.bytes).await?;

    let mut slots = Vec::with_capacity(image.layers().len());
    let mut appended = HashSet::new();
    for layer in image.layers() {
        // Reused layers are already present in the daemon; an empty slot
        // tells it to reuse what it has.
        let source = match layer.source_id() {
            Some(source) if !layer.is_reused() => source,
            _ => {
                slots.push(String::new());
                continue;
            }
        };

        let entry = format!("{}.tar", Digest::hash_bytes(source.as_bytes()).as_hex());
        slots.push(entry.clone());
        if !appended.insert(entry.clone()) {
            continue;
        }

        let staged = cfs::stage_stream(layer.uncompressed().await?, None).await?;
        let mut header = deterministic_header(staged.size as u64);
        let file = tokio::fs::File::open(staged.path()).await?;
        builder.append_data(&mut header, &entry, file).await?;
    }

    let manifest = vec![TarballManifest {
        config: config_entry,
        repo_tags: names.iter().map(String::from).collect(),
        layers: slots,
    }];
    append_bytes(&mut builder, "manifest.json", &serde_json::to_vec(&manifest)?).await?;

    let writer = builder.into_inner().await?;
    drop(writer);
    Ok(())
}

async fn append_bytes(
    builder: &mut TarBuilder<DuplexStream>,
    entry: &str,
    bytes: &[u8],
) -> Result<()> {
    let mut header = deterministic_header(bytes.len() as u64);
    builder.append_data(&mut header, entry, bytes).await?;
    Ok(())
}

fn deterministic_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_mode(0o644);
    header.set_size(size);
    header.set_mtime(0);
    header
}
