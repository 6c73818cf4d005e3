//! The registry capability consumed by the save engines and the index, and
//! the registry save engine itself.
//!
//! The crate does not ship an HTTP client: callers supply an implementation
//! of [`RegistryClient`] (OCI Distribution v2 semantics; blobs are PUT
//! before manifests, `Accept` headers list every supported manifest type).

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, instrument};

use crate::{
    cfs::{self, ByteStream},
    image::{SourceImage, WorkingImage},
    layer::BlobFetch,
    manifest::{Descriptor, Index, Manifest, RenderedBlob},
    mediatype::MediaType,
    Digest, Error, Reference, Result, SaveError, StringSet,
};

/// Capability to talk OCI Distribution v2 to a remote registry.
///
/// Credential resolution, TLS, and retry policy are the implementation's
/// concern; this crate only sequences the calls.
#[async_trait]
pub trait RegistryClient: std::fmt::Debug + Send + Sync {
    /// Cheaply resolve a reference to its manifest descriptor
    /// (`media type`, `digest`, `size` only).
    async fn head(&self, reference: &Reference) -> Result<Descriptor>;

    /// Fetch the raw manifest or index bytes behind a reference, along with
    /// its descriptor.
    async fn get(&self, reference: &Reference) -> Result<(Bytes, Descriptor)>;

    /// Resolve a reference all the way to a single image: manifest, config,
    /// and a blob-fetch capability.
    async fn image(&self, reference: &Reference) -> Result<SourceImage>;

    /// Fetch a reference as an index.
    async fn index(&self, reference: &Reference) -> Result<Index>;

    /// Fetch a blob by digest from a repository.
    async fn blob(&self, repository: &str, digest: &Digest) -> Result<ByteStream>;

    /// Upload a blob by digest. Content-addressed: the registry may already
    /// have it, in which case this is a no-op on the server.
    async fn write_blob(
        &self,
        repository: &str,
        digest: &Digest,
        size: i64,
        data: ByteStream,
    ) -> Result<()>;

    /// Upload manifest or index bytes under a reference. The media type
    /// dictates the `Content-Type`. Returns the digest of the stored bytes.
    async fn write_manifest(
        &self,
        reference: &Reference,
        media_type: MediaType,
        payload: Bytes,
    ) -> Result<Digest>;

    /// Delete the manifest behind a reference.
    async fn delete(&self, reference: &Reference) -> Result<()>;
}

/// Blob-fetch capability scoped to one repository of one registry.
#[derive(Debug, Clone)]
pub struct RepoBlobs {
    client: Arc<dyn RegistryClient>,
    repository: String,
}

impl RepoBlobs {
    /// Scope the given client to a repository.
    pub fn new(client: Arc<dyn RegistryClient>, repository: impl Into<String>) -> Self {
        Self {
            client,
            repository: repository.into(),
        }
    }
}

#[async_trait]
impl BlobFetch for RepoBlobs {
    async fn fetch_blob(&self, digest: &Digest) -> Result<ByteStream> {
        self.client.blob(&self.repository, digest).await
    }
}

/// Resolve a reference to a [`SourceImage`] using only the wire-level
/// methods of the client.
///
/// Useful for [`RegistryClient`] implementations that want the standard
/// manifest-then-config resolution for their `image` method.
#[instrument(skip(client))]
pub async fn resolve_image(
    client: Arc<dyn RegistryClient>,
    reference: &Reference,
) -> Result<SourceImage> {
    let (bytes, descriptor) = client.get(reference).await?;
    if !descriptor.is_image() {
        return Err(Error::Protocol(format!(
            "{reference} resolved to {}, not an image manifest",
            descriptor.media_type
        )));
    }

    let manifest = serde_json::from_slice::<Manifest>(&bytes)?;
    let fetch = RepoBlobs::new(Arc::clone(&client), reference.repository.clone());

    let config_bytes = cfs::collect_buf(
        fetch
            .fetch_blob(&manifest.config.digest)
            .await
            .map_err(|_| Error::ConfigFileUndefined)?,
    )
    .await?;
    let config = serde_json::from_slice(&config_bytes)?;

    Ok(SourceImage {
        name: Some(reference.clone()),
        manifest,
        config,
        fetch: Arc::new(fetch),
    })
}

/// Publish the image to the registry under every name.
///
/// Per name: layer blobs first, then the config blob, then the manifest.
/// Failures are collected per name; successful names stay committed.
#[instrument(skip(client, image), fields(primary = %image.name()))]
pub(crate) async fn save(
    client: &dyn RegistryClient,
    image: &WorkingImage,
    names: &StringSet,
) -> Result<String, SaveError> {
    let primary = image.name().to_string();
    let (manifest, config_blob) = image
        .rendered_manifest()
        .await
        .map_err(|e| SaveError::single(primary.clone(), e))?;
    let rendered = manifest
        .rendered()
        .map_err(|e| SaveError::single(primary, e))?;

    let mut errors = Vec::new();
    for name in names.iter() {
        if let Err(error) = save_one(client, image, name, &manifest, &config_blob, &rendered).await
        {
            errors.push((name.to_string(), error));
        }
    }

    if errors.is_empty() {
        Ok(rendered.digest.to_string())
    } else {
        Err(SaveError { errors })
    }
}

async fn save_one(
    client: &dyn RegistryClient,
    image: &WorkingImage,
    name: &str,
    manifest: &Manifest,
    config_blob: &RenderedBlob,
    rendered: &RenderedBlob,
) -> Result<()> {
    let reference = Reference::from_str(name)?;

    // Reused layers already live in the previous image's repository, so
    // only uploads targeting that same repository may skip them. Any other
    // target still needs every blob.
    let holds_reused_blobs = image.previous_name().is_some_and(|previous| {
        previous.host == reference.host && previous.repository == reference.repository
    });

    for layer in image.layers() {
        if layer.is_reused() && holds_reused_blobs {
            debug!(diff_id = %layer.diff_id(), "skip upload: reused layer");
            continue;
        }
        let (digest, size) = layer.blob_info().await?;
        let data = layer.compressed().await?;
        client
            .write_blob(&reference.repository, &digest, size, data)
            .await?;
    }

    client
        .write_blob(
            &reference.repository,
            &config_blob.digest,
            config_blob.size,
            cfs::once(config_blob.bytes.clone()),
        )
        .await?;

    let written = client
        .write_manifest(&reference, manifest.media_type, rendered.bytes.clone())
        .await?;
    if written != rendered.digest {
        return Err(Error::DigestMismatch {
            expected: rendered.digest.clone(),
            actual: written,
        });
    }
    Ok(())
}
