//! Lazy layer facade keyed by diff ID.
//!
//! A layer may be backed by an on-disk tar, a remote blob behind a fetch
//! capability, or nothing at all (a placeholder for a reused layer). Bytes
//! are only fetched or compressed when materialization demands them.

use std::{path::PathBuf, sync::Arc};

use async_tempfile::TempFile;
use async_trait::async_trait;
use bytes::Bytes;
use derive_more::Debug;
use tokio::sync::OnceCell;
use tokio_tar::{Builder as TarBuilder, EntryType, Header};
use tracing::{debug, instrument};

use crate::{
    cfs::{self, ByteStream, StagedBlob},
    manifest::Descriptor,
    mediatype::MediaType,
    Digest, Error, Result,
};

/// Capability to fetch a blob by digest from wherever an image came from.
///
/// Implemented by registry clients, layout stores, and test fakes. The
/// returned stream carries the blob's stored (compressed) bytes.
#[async_trait]
pub trait BlobFetch: std::fmt::Debug + Send + Sync {
    /// Fetch the raw bytes of the blob with the given digest.
    async fn fetch_blob(&self, digest: &Digest) -> Result<ByteStream>;
}

/// Where a layer's bytes live, if anywhere.
#[derive(Debug, Clone)]
enum LayerSource {
    /// An uncompressed tar on disk. The guard keeps synthesized temp files
    /// alive for as long as any clone of the layer exists.
    File {
        path: PathBuf,
        #[debug(skip)]
        _guard: Option<Arc<TempFile>>,
    },

    /// A blob stored remotely, addressed by its compressed digest.
    Remote {
        digest: Digest,
        size: i64,
        #[debug(skip)]
        fetch: Arc<dyn BlobFetch>,
    },

    /// No bytes at all; only the diff ID (and possibly the blob identity)
    /// is known.
    Placeholder {
        digest: Option<Digest>,
        size: Option<i64>,
    },
}

/// A single image layer: a diff ID, a media type, and a lazily-resolved
/// source of bytes.
#[derive(Debug, Clone)]
pub struct ImageLayer {
    diff_id: Digest,
    media_type: MediaType,
    source: LayerSource,
    reused: bool,
    #[debug(skip)]
    staged: Arc<OnceCell<StagedBlob>>,
}

impl ImageLayer {
    /// Wrap an uncompressed tar file on disk.
    pub fn from_tar_file(path: impl Into<PathBuf>, diff_id: Digest, media_type: MediaType) -> Self {
        Self {
            diff_id,
            media_type,
            source: LayerSource::File {
                path: path.into(),
                _guard: None,
            },
            reused: false,
            staged: Arc::new(OnceCell::new()),
        }
    }

    /// Wrap a remote blob known by its descriptor identity.
    pub fn from_remote(
        diff_id: Digest,
        digest: Digest,
        size: i64,
        media_type: MediaType,
        fetch: Arc<dyn BlobFetch>,
    ) -> Self {
        Self {
            diff_id,
            media_type,
            source: LayerSource::Remote {
                digest,
                size,
                fetch,
            },
            reused: false,
            staged: Arc::new(OnceCell::new()),
        }
    }

    /// A placeholder with no bytes behind it.
    pub fn placeholder(
        diff_id: Digest,
        media_type: MediaType,
        digest: Option<Digest>,
        size: Option<i64>,
    ) -> Self {
        Self {
            diff_id,
            media_type,
            source: LayerSource::Placeholder { digest, size },
            reused: false,
            staged: Arc::new(OnceCell::new()),
        }
    }

    /// A minimal empty layer: a tar with no entries.
    pub async fn empty(media_type: MediaType) -> Result<Self> {
        let bytes = empty_tarball();
        let diff_id = Digest::hash_bytes(&bytes);
        Self::from_synthesized(bytes, diff_id, media_type).await
    }

    /// The synthesized Windows base layer: a tar holding the `Files` and
    /// `Hives` directories every Windows image must start from.
    pub async fn windows_base(media_type: MediaType) -> Result<Self> {
        let bytes = windows_base_tarball().await?;
        let diff_id = Digest::hash_bytes(&bytes);
        Self::from_synthesized(bytes, diff_id, media_type).await
    }

    async fn from_synthesized(bytes: Bytes, diff_id: Digest, media_type: MediaType) -> Result<Self> {
        let staged = cfs::stage_stream(cfs::once(bytes), Some(&diff_id)).await?;
        let (path, guard) = staged.into_parts();
        Ok(Self {
            diff_id,
            media_type,
            source: LayerSource::File {
                path,
                _guard: Some(Arc::new(guard)),
            },
            reused: false,
            staged: Arc::new(OnceCell::new()),
        })
    }

    /// Mark the layer as reused from a previous image.
    ///
    /// The daemon save emits an empty slot for reused layers, and the
    /// registry save skips their upload when the target is the previous
    /// image's own repository.
    pub fn into_reused(mut self) -> Self {
        self.reused = true;
        self
    }

    /// The diff ID (digest of the uncompressed tar).
    pub fn diff_id(&self) -> &Digest {
        &self.diff_id
    }

    /// The layer media type.
    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Whether this layer was reused from a previous image.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Whether this layer has bytes available somewhere.
    pub fn has_content(&self) -> bool {
        !matches!(self.source, LayerSource::Placeholder { .. })
    }

    /// A stable string identifying where the layer's bytes come from: the
    /// file path for on-disk layers, the blob digest for remote layers.
    pub fn source_id(&self) -> Option<String> {
        match &self.source {
            LayerSource::File { path, .. } => Some(path.display().to_string()),
            LayerSource::Remote { digest, .. } => Some(digest.to_string()),
            LayerSource::Placeholder { .. } => None,
        }
    }

    /// Stream the layer as a plain uncompressed tar.
    #[instrument(skip(self), fields(diff_id = %self.diff_id))]
    pub async fn uncompressed(&self) -> Result<ByteStream> {
        match &self.source {
            LayerSource::File { path, .. } => cfs::file_stream(path).await,
            LayerSource::Remote { digest, fetch, .. } => {
                let raw = fetch.fetch_blob(digest).await?;
                Ok(cfs::peel(self.media_type.compression(), raw))
            }
            LayerSource::Placeholder { .. } => Err(Error::LayerNotFound(self.diff_id.clone())),
        }
    }

    /// The blob identity `(digest, size)` of the stored (compressed) form,
    /// materializing the blob if it has not been computed yet.
    pub async fn blob_info(&self) -> Result<(Digest, i64)> {
        match &self.source {
            LayerSource::Remote { digest, size, .. } => Ok((digest.clone(), *size)),
            LayerSource::Placeholder {
                digest: Some(digest),
                size: Some(size),
            } => Ok((digest.clone(), *size)),
            LayerSource::Placeholder { .. } => Err(Error::LayerNotFound(self.diff_id.clone())),
            LayerSource::File { .. } => {
                let staged = self.stage().await?;
                Ok((staged.digest.clone(), staged.size))
            }
        }
    }

    /// Stream the stored (compressed) form of the layer.
    #[instrument(skip(self), fields(diff_id = %self.diff_id))]
    pub async fn compressed(&self) -> Result<ByteStream> {
        match &self.source {
            LayerSource::File { .. } => self.stage().await?.stream().await,
            LayerSource::Remote { digest, fetch, .. } => fetch.fetch_blob(digest).await,
            LayerSource::Placeholder { .. } => Err(Error::LayerNotFound(self.diff_id.clone())),
        }
    }

    /// The descriptor for this layer's stored form.
    pub async fn descriptor(&self) -> Result<Descriptor> {
        let (digest, size) = self.blob_info().await?;
        Ok(Descriptor::builder()
            .media_type(self.media_type)
            .digest(digest)
            .size(size)
            .build())
    }

    /// Relabel the layer with a different media type without touching its
    /// bytes. Only valid when the compression of both types is identical;
    /// use [`ImageLayer::transcode`] otherwise.
    pub fn relabeled(&self, media_type: MediaType) -> ImageLayer {
        if media_type.compression() == self.media_type.compression() {
            ImageLayer {
                media_type,
                staged: Arc::new(OnceCell::new()),
                ..self.clone()
            }
        } else {
            self.clone()
        }
    }

    /// Re-encode the layer under a different media type, optionally passing
    /// the tar through a mutation hook. Returns a file-backed layer; the
    /// diff ID is recomputed when a mutator rewrites the content.
    #[instrument(skip(self, mutate), fields(diff_id = %self.diff_id))]
    pub async fn transcode(
        &self,
        media_type: MediaType,
        mutate: Option<&LayerMutator>,
    ) -> Result<ImageLayer> {
        if media_type == self.media_type && mutate.is_none() {
            return Ok(self.clone());
        }

        // Hold the plain tar on disk so the new layer can stage its own
        // compressed form on demand.
        let tar = self.uncompressed().await?;
        let (staged, diff_id) = match mutate {
            Some(mutate) => {
                let staged = cfs::stage_stream(mutate(tar), None).await?;
                let diff_id = staged.digest.clone();
                (staged, diff_id)
            }
            None => {
                let staged = cfs::stage_stream(tar, Some(&self.diff_id)).await?;
                (staged, self.diff_id.clone())
            }
        };
        debug!(%diff_id, %media_type, "transcoded layer");
        let (path, guard) = staged.into_parts();
        Ok(ImageLayer {
            diff_id,
            media_type,
            source: LayerSource::File {
                path,
                _guard: Some(Arc::new(guard)),
            },
            reused: self.reused,
            staged: Arc::new(OnceCell::new()),
        })
    }

    /// Stage the compressed blob for a file-backed layer exactly once.
    async fn stage(&self) -> Result<&StagedBlob> {
        let LayerSource::File { path, .. } = &self.source else {
            return Err(Error::LayerNotFound(self.diff_id.clone()));
        };
        self.staged
            .get_or_try_init(|| cfs::stage_compressed(path, self.media_type.compression()))
            .await
    }
}

/// Mutation hook applied to a layer's uncompressed tar during media type
/// coercion.
pub type LayerMutator = Arc<dyn Fn(ByteStream) -> ByteStream + Send + Sync>;

/// The bytes of a tar archive with no entries: two zero blocks.
pub fn empty_tarball() -> Bytes {
    Bytes::from_static(&[0u8; 1024])
}

/// Synthesize the uncompressed Windows base layer tarball.
async fn windows_base_tarball() -> Result<Bytes> {
    let file = TempFile::new()
        .await
        .map_err(|e| Error::transport(format!("create temp file: {e}")))?;
    let path = file.file_path().clone();

    let mut builder = TarBuilder::new(file);
    for dir in ["Files/", "Hives/"] {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::dir());
        header.set_mode(0o755);
        header.set_size(0);
        header.set_mtime(0);
        builder
            .append_data(&mut header, dir, tokio::io::empty())
            .await?;
    }

    // The temp file deletes itself on drop; read before letting go of it.
    let file = builder.into_inner().await?;
    let bytes = tokio::fs::read(&path).await?;
    drop(file);
    Ok(Bytes::from(bytes))
}
