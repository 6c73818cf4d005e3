//! On-disk OCI image-layout directories: the store, and the save engine
//! that writes a working image into one.
//!
//! Layout shape:
//! ```text
//! <root>/
//!   oci-layout                 {"imageLayoutVersion":"1.0.0"}
//!   index.json                 index manifest (OCI or Docker list)
//!   blobs/sha256/<64hex>       any blob (manifest, config, layer)
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    cfs::{self, ByteStream},
    image::{SourceImage, WorkingImage},
    layer::BlobFetch,
    manifest::{Descriptor, Index, Manifest},
    mediatype::MediaType,
    Annotations, Digest, Error, Result, StringSet,
};

const LAYOUT_MARKER: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs/sha256";

/// The annotation layouts use to record the reference a manifest was saved
/// under.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutMarker {
    image_layout_version: String,
}

/// An OCI image-layout directory on disk.
///
/// Concurrent writers to the same layout are forbidden by contract; the
/// store performs no locking.
#[derive(Debug, Clone)]
pub struct LayoutStore {
    root: PathBuf,
}

impl LayoutStore {
    /// Open the layout at `root`, initializing the marker, an empty index,
    /// and the blob directory if they do not exist yet.
    #[instrument]
    pub async fn from_path(root: impl Into<PathBuf> + std::fmt::Debug) -> Result<Self> {
        let store = Self { root: root.into() };
        tokio::fs::create_dir_all(store.root.join(BLOBS_DIR)).await?;

        let marker = store.root.join(LAYOUT_MARKER);
        if !marker.exists() {
            let contents = serde_json::to_vec(&LayoutMarker {
                image_layout_version: "1.0.0".to_string(),
            })?;
            tokio::fs::write(&marker, contents).await?;
        }

        let index = store.root.join(INDEX_FILE);
        if !index.exists() {
            store.write_index(&Index::new(MediaType::OciIndex)).await?;
        }

        Ok(store)
    }

    /// The layout's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The filesystem path of a blob.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(BLOBS_DIR).join(digest.as_hex())
    }

    /// Whether the blob is already present.
    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Write a blob from a stream, verifying its digest. Blobs are
    /// content-addressed, so an existing blob is left untouched.
    #[instrument(skip(self, data))]
    pub async fn write(&self, digest: &Digest, data: ByteStream) -> Result<()> {
        if self.has_blob(digest) {
            debug!(%digest, "skip write: blob exists");
            return Ok(());
        }

        let staged = cfs::stage_stream(data, Some(digest)).await?;
        tokio::fs::copy(staged.path(), self.blob_path(digest)).await?;
        Ok(())
    }

    /// Write an in-memory blob, verifying its digest.
    pub async fn write_bytes(&self, digest: &Digest, bytes: impl Into<Bytes>) -> Result<()> {
        self.write(digest, cfs::once(bytes.into())).await
    }

    /// Stream a blob's bytes.
    pub async fn blob(&self, digest: &Digest) -> Result<ByteStream> {
        let path = self.blob_path(digest);
        if !path.exists() {
            return Err(Error::NoSuchDigest(digest.clone()));
        }
        cfs::file_stream(&path).await
    }

    /// Buffer a blob's bytes.
    pub async fn blob_bytes(&self, digest: &Digest) -> Result<Bytes> {
        cfs::collect_buf(self.blob(digest).await?).await
    }

    /// Read the layout's index manifest.
    pub async fn image_index(&self) -> Result<Index> {
        let bytes = tokio::fs::read(self.root.join(INDEX_FILE)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Overwrite the layout's index manifest.
    pub async fn write_index(&self, index: &Index) -> Result<()> {
        let rendered = index.rendered()?;
        tokio::fs::write(self.root.join(INDEX_FILE), &rendered.bytes).await?;
        Ok(())
    }

    /// Append a descriptor to the index, replacing any existing descriptor
    /// with the same digest.
    #[instrument(skip(self, descriptor), fields(digest = %descriptor.digest))]
    pub async fn append_descriptor(&self, descriptor: Descriptor) -> Result<()> {
        let mut index = self.image_index().await?;
        index
            .manifests
            .retain(|existing| existing.digest != descriptor.digest);
        index.manifests.push(descriptor);
        self.write_index(&index).await
    }

    /// Remove every index descriptor whose digest is listed.
    #[instrument(skip(self))]
    pub async fn remove_descriptors(&self, digests: &[Digest]) -> Result<()> {
        let mut index = self.image_index().await?;
        index
            .manifests
            .retain(|existing| !digests.contains(&existing.digest));
        self.write_index(&index).await
    }

    /// Resolve a manifest digest in this layout to a [`SourceImage`].
    pub async fn image(&self, digest: &Digest) -> Result<SourceImage> {
        let manifest_bytes = self.blob_bytes(digest).await?;
        let manifest = serde_json::from_slice::<Manifest>(&manifest_bytes)?;

        let config_bytes = self
            .blob_bytes(&manifest.config.digest)
            .await
            .map_err(|_| Error::ConfigFileUndefined)?;
        let config = serde_json::from_slice(&config_bytes)?;

        Ok(SourceImage {
            name: None,
            manifest,
            config,
            fetch: Arc::new(LayoutBlobs {
                store: self.clone(),
            }),
        })
    }
}

/// Blob-fetch capability over a layout directory.
#[derive(Debug, Clone)]
pub struct LayoutBlobs {
    store: LayoutStore,
}

#[async_trait]
impl BlobFetch for LayoutBlobs {
    async fn fetch_blob(&self, digest: &Digest) -> Result<ByteStream> {
        self.store.blob(digest).await
    }
}

/// Write the image into the layout at `root` and append its manifest
/// descriptor to the layout's index.
#[instrument(skip(image), fields(primary = %image.name()))]
pub(crate) async fn save(
    root: &Path,
    image: &WorkingImage,
    names: &StringSet,
) -> Result<String> {
    let store = LayoutStore::from_path(root).await?;
    let (manifest, config_blob) = image.rendered_manifest().await?;

    for layer in image.layers() {
        let (digest, _) = layer.blob_info().await?;
        if store.has_blob(&digest) {
            continue;
        }
        store.write(&digest, layer.compressed().await?).await?;
    }

    store
        .write_bytes(&config_blob.digest, config_blob.bytes.clone())
        .await?;

    let rendered = manifest.rendered()?;
    store
        .write_bytes(&rendered.digest, rendered.bytes.clone())
        .await?;

    // Docker descriptors have no annotation field on the wire.
    let mut annotations = None;
    if manifest.media_type.supports_annotations() {
        annotations = manifest.annotations.clone();
        if let Some(primary) = names.iter().next() {
            annotations
                .get_or_insert_with(Annotations::new)
                .insert(REF_NAME_ANNOTATION.to_string(), primary.to_string());
        }
    }

    store
        .append_descriptor(Descriptor {
            media_type: manifest.media_type,
            digest: rendered.digest.clone(),
            size: rendered.size,
            urls: None,
            annotations,
            platform: Some(image.config().platform()),
        })
        .await?;

    Ok(rendered.digest.to_string())
}
