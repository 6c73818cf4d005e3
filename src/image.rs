//! The working image: an image under construction.
//!
//! Mutations accumulate in memory; nothing touches a backend until [`save`]
//! commits the image to the daemon, an OCI layout directory, or a registry.
//!
//! [`save`]: WorkingImage::save

use std::{collections::VecDeque, path::PathBuf, sync::Arc};

use derive_more::Debug;
use tracing::{debug, instrument, warn};

use crate::{
    cfs::{self, ByteStream},
    config::{ConfigFile, History},
    daemon::DaemonClient,
    layer::{BlobFetch, ImageLayer, LayerMutator},
    layout,
    manifest::{Descriptor, Manifest, RenderedBlob},
    mediatype::MediaType,
    registry::{self, RegistryClient},
    Annotations, Digest, Error, Platform, Reference, Result, SaveError, StringSet,
    NORMALIZED_CREATED,
};

/// The family of media types an image is written with.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Format {
    /// OCI image manifest, config, and layers.
    Oci,

    /// Docker schema2 manifest, config, and layers.
    Docker,
}

impl Format {
    /// The manifest media type for this format.
    pub const fn manifest_type(&self) -> MediaType {
        match self {
            Self::Oci => MediaType::OciManifest,
            Self::Docker => MediaType::DockerManifest,
        }
    }

    /// The index media type for this format.
    pub const fn index_type(&self) -> MediaType {
        match self {
            Self::Oci => MediaType::OciIndex,
            Self::Docker => MediaType::DockerManifestList,
        }
    }

    /// The format a manifest media type belongs to.
    pub const fn of(media_type: MediaType) -> Format {
        if media_type.is_oci() {
            Self::Oci
        } else {
            Self::Docker
        }
    }
}

/// A fully-resolved, immutable image: manifest, config, and a capability to
/// fetch its blobs. Used as the base image a build starts from, the previous
/// image layers are reused out of, and the replacement base in a rebase.
#[derive(Debug, Clone)]
pub struct SourceImage {
    /// The name the image was resolved from, when known.
    pub name: Option<Reference>,

    /// The image manifest.
    pub manifest: Manifest,

    /// The image config.
    pub config: ConfigFile,

    /// Capability to fetch the image's blobs by digest.
    #[debug(skip)]
    pub fetch: Arc<dyn BlobFetch>,
}

impl SourceImage {
    /// The digest of the image's manifest.
    pub fn digest(&self) -> Result<Digest> {
        Ok(self.manifest.rendered()?.digest)
    }

    /// The image's layers, base first, as remote-sourced facades.
    pub fn layers(&self) -> Result<Vec<ImageLayer>> {
        let diff_ids = &self.config.rootfs.diff_ids;
        if diff_ids.len() != self.manifest.layers.len() {
            return Err(Error::Protocol(format!(
                "config lists {} diff ids but manifest lists {} layers",
                diff_ids.len(),
                self.manifest.layers.len()
            )));
        }

        Ok(diff_ids
            .iter()
            .zip(&self.manifest.layers)
            .map(|(diff_id, desc)| self.layer_from(diff_id, desc))
            .collect())
    }

    /// Look up a single layer by its diff ID.
    pub fn layer_by_diff_id(&self, diff_id: &Digest) -> Option<ImageLayer> {
        let position = self
            .config
            .rootfs
            .diff_ids
            .iter()
            .position(|d| d == diff_id)?;
        let desc = self.manifest.layers.get(position)?;
        Some(self.layer_from(diff_id, desc))
    }

    fn layer_from(&self, diff_id: &Digest, desc: &Descriptor) -> ImageLayer {
        ImageLayer::from_remote(
            diff_id.clone(),
            desc.digest.clone(),
            desc.size,
            desc.media_type,
            Arc::clone(&self.fetch),
        )
    }
}

/// Where a save commits the image.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Stream a Docker tarball into a local daemon.
    Daemon(#[debug(skip)] Arc<dyn DaemonClient>),

    /// Write an OCI image-layout directory at the given root.
    Layout(PathBuf),

    /// Publish blobs and manifest to a remote registry.
    Registry(#[debug(skip)] Arc<dyn RegistryClient>),
}

/// An image under construction.
///
/// Invariants, maintained by every mutation:
/// - `config.rootfs.diff_ids` and the layer list stay equal in length and
///   order;
/// - history is either one entry per layer or normalized to that at save;
/// - media types stay within one family unless inherited from a base and
///   never mutated.
#[derive(Debug)]
pub struct WorkingImage {
    name: Reference,
    backend: Backend,
    manifest_media_type: MediaType,
    annotations: Option<Annotations>,
    config: ConfigFile,
    layers: Vec<ImageLayer>,
    previous: Option<SourceImage>,
    reuse_queue: Option<VecDeque<Digest>>,
    preserve_history: bool,
    add_empty_layer_on_save: bool,
    created_at: String,
    saved: Option<Digest>,
}

#[bon::bon]
impl WorkingImage {
    /// Create a new working image.
    ///
    /// With a `base`, the image inherits the base's config, layers, and
    /// media types; otherwise it starts empty on the given `platform`
    /// (linux/amd64 when unspecified). A `previous` image makes its layers
    /// available to [`WorkingImage::reuse_layer`].
    #[builder]
    pub async fn new(
        /// The primary name the image will be saved under.
        name: Reference,

        /// The backend the image will be saved to.
        backend: Backend,

        /// The base image to start from.
        base: Option<SourceImage>,

        /// A previous build whose layers may be reused by diff ID.
        previous: Option<SourceImage>,

        /// The platform for images built from scratch.
        platform: Option<Platform>,

        /// The preferred media type family. When it differs from the base
        /// image's, every inherited layer is re-encoded to match.
        format: Option<Format>,

        /// Rewrites layer content during media type coercion.
        layer_mutator: Option<LayerMutator>,

        /// Keep base image history entries instead of blanking them at save.
        #[builder(default = true)]
        preserve_history: bool,

        /// Append a minimal empty layer at save time when the image would
        /// otherwise have none.
        #[builder(default = false)]
        add_empty_layer_on_save: bool,

        /// Override the normalized creation timestamp.
        created_at: Option<String>,
    ) -> Result<Self> {
        let platform = platform.unwrap_or_else(Platform::linux_amd64);
        platform.validate()?;

        let (manifest_media_type, annotations, config, layers) = match &base {
            Some(base) => (
                base.manifest.media_type,
                base.manifest.annotations.clone(),
                base.config.clone(),
                base.layers()?,
            ),
            None => {
                let format = format.unwrap_or(Format::Oci);
                (
                    format.manifest_type(),
                    None,
                    ConfigFile::for_platform(&platform),
                    Vec::new(),
                )
            }
        };

        let mut image = Self {
            name,
            backend,
            manifest_media_type,
            annotations,
            config,
            layers,
            previous,
            reuse_queue: None,
            preserve_history,
            add_empty_layer_on_save,
            created_at: created_at.unwrap_or_else(|| NORMALIZED_CREATED.to_string()),
            saved: None,
        };

        // A requested format that differs from the inherited one rebuilds
        // the image in the requested family.
        if let Some(format) = format {
            if format != Format::of(image.manifest_media_type) {
                image
                    .coerce_media_types(format, layer_mutator.as_ref())
                    .await?;
            }
        }

        image.detect_reuse_fast_path();
        Ok(image)
    }
}

impl WorkingImage {
    /// The primary name the image will be saved under.
    pub fn name(&self) -> &Reference {
        &self.name
    }

    /// The manifest media type the image will be saved with.
    pub fn manifest_media_type(&self) -> MediaType {
        self.manifest_media_type
    }

    /// The media type new layers are appended with.
    pub fn layer_media_type(&self) -> MediaType {
        self.manifest_media_type
            .layer_type()
            .unwrap_or(MediaType::OciLayerGzip)
    }

    /// The image's config file.
    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// The image's layers, base first.
    pub fn layers(&self) -> &[ImageLayer] {
        &self.layers
    }

    /// The manifest digest recorded by the most recent save.
    pub fn digest(&self) -> Option<&Digest> {
        self.saved.as_ref()
    }

    /// The name of the previous image layers are reused out of, when known.
    pub fn previous_name(&self) -> Option<&Reference> {
        self.previous.as_ref().and_then(|previous| previous.name.as_ref())
    }

    /// The configured creation timestamp.
    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    /// Operating system from the config.
    pub fn os(&self) -> &str {
        &self.config.os
    }

    /// CPU architecture from the config.
    pub fn architecture(&self) -> &str {
        &self.config.architecture
    }

    /// CPU variant from the config.
    pub fn variant(&self) -> Option<&str> {
        self.config.variant.as_deref()
    }

    /// OS version from the config.
    pub fn os_version(&self) -> Option<&str> {
        self.config.os_version.as_deref()
    }

    /// Entrypoint from the config.
    pub fn entrypoint(&self) -> Option<&[String]> {
        self.config.config.entrypoint.as_deref()
    }

    /// Default command from the config.
    pub fn cmd(&self) -> Option<&[String]> {
        self.config.config.cmd.as_deref()
    }

    /// Working directory from the config.
    pub fn working_dir(&self) -> Option<&str> {
        self.config.config.working_dir.as_deref()
    }

    /// All labels on the config.
    pub fn labels(&self) -> Option<&Annotations> {
        self.config.config.labels.as_ref()
    }

    /// Look up a label value.
    pub fn label(&self, key: &str) -> Option<String> {
        self.config.label(key)
    }

    /// Look up an environment variable. Case-insensitive on Windows.
    pub fn env(&self, key: &str) -> Option<String> {
        self.config.env(key)
    }

    /// History entries from the config.
    pub fn history(&self) -> &[History] {
        &self.config.history
    }

    /// Set a label.
    pub fn set_label(&mut self, key: &str, value: &str) {
        self.config.set_label(key, value);
    }

    /// Set an environment variable. Case-insensitive on Windows.
    pub fn set_env(&mut self, key: &str, value: &str) {
        self.config.set_env(key, value);
    }

    /// Set the entrypoint.
    pub fn set_entrypoint(&mut self, entrypoint: impl IntoIterator<Item = impl Into<String>>) {
        self.config.config.entrypoint = Some(entrypoint.into_iter().map(Into::into).collect());
    }

    /// Set the default command.
    pub fn set_cmd(&mut self, cmd: impl IntoIterator<Item = impl Into<String>>) {
        self.config.config.cmd = Some(cmd.into_iter().map(Into::into).collect());
    }

    /// Set the working directory.
    pub fn set_working_dir(&mut self, dir: &str) {
        self.config.config.working_dir = Some(dir.to_string());
    }

    /// Set the operating system.
    pub fn set_os(&mut self, os: &str) {
        self.config.os = os.to_string();
    }

    /// Set the CPU architecture.
    pub fn set_architecture(&mut self, architecture: &str) {
        self.config.architecture = architecture.to_string();
    }

    /// Set the CPU variant.
    pub fn set_variant(&mut self, variant: &str) {
        self.config.variant = Some(variant.to_string());
    }

    /// Set the OS version.
    pub fn set_os_version(&mut self, os_version: &str) {
        self.config.os_version = Some(os_version.to_string());
    }

    /// Replace the history entries. They are normalized to one entry per
    /// layer at save time.
    pub fn set_history(&mut self, history: Vec<History>) {
        self.config.history = history;
    }

    /// Set manifest-level annotations. Silently dropped at save time when
    /// the manifest media type does not support them.
    pub fn set_annotations(&mut self, annotations: Annotations) {
        self.annotations = Some(annotations);
    }

    /// Override the creation timestamp written at save time.
    pub fn set_created_at(&mut self, created_at: &str) {
        self.created_at = created_at.to_string();
    }

    /// Retarget the image's primary name.
    ///
    /// When the new name matches the previous image and the previous image's
    /// layer stack extends the current one, subsequent [`reuse_layer`] calls
    /// take the fast path and never touch the previous image's bytes.
    ///
    /// [`reuse_layer`]: WorkingImage::reuse_layer
    pub fn rename(&mut self, name: Reference) {
        self.name = name;
        self.detect_reuse_fast_path();
    }

    fn detect_reuse_fast_path(&mut self) {
        self.reuse_queue = None;
        let Some(previous) = &self.previous else {
            return;
        };
        if previous.name.as_ref() != Some(&self.name) {
            return;
        }

        let current = &self.config.rootfs.diff_ids;
        let expected = &previous.config.rootfs.diff_ids;
        if expected.len() > current.len() && expected.starts_with(current) {
            let queue = expected[current.len()..].iter().cloned().collect();
            debug!(?queue, "detected same-base previous image; expecting reuse");
            self.reuse_queue = Some(queue);
        }
    }

    /// Append a layer from an uncompressed tar file on disk, hashing it to
    /// compute the diff ID.
    #[instrument(skip(self))]
    pub async fn add_layer(&mut self, path: impl Into<PathBuf> + std::fmt::Debug) -> Result<()> {
        let path = path.into();
        let diff_id = cfs::file_digest(&path).await?;
        self.add_layer_with_diff_id(path, diff_id)
    }

    /// Append a layer from an uncompressed tar file on disk, trusting the
    /// caller for the diff ID.
    pub fn add_layer_with_diff_id(
        &mut self,
        path: impl Into<PathBuf>,
        diff_id: Digest,
    ) -> Result<()> {
        let layer = ImageLayer::from_tar_file(path, diff_id, self.layer_media_type());
        self.append_layer(layer);

        // An explicit layer breaks the expectation that this image repeats
        // the previous build's stack.
        if self.reuse_queue.take().is_some() {
            debug!("added layer; reuse fast path invalidated");
        }
        Ok(())
    }

    /// Append a layer from the previous image by diff ID, without
    /// re-uploading its content.
    #[instrument(skip(self))]
    pub fn reuse_layer(&mut self, diff_id: &Digest) -> Result<()> {
        // Fast path: the next expected diff ID can be appended without
        // consulting the previous image's bytes at all.
        if let Some(queue) = &mut self.reuse_queue {
            if queue.front() == Some(diff_id) {
                queue.pop_front();
                let layer = match self.previous.as_ref().and_then(|p| p.layer_by_diff_id(diff_id))
                {
                    Some(layer) => layer.into_reused(),
                    None => {
                        ImageLayer::placeholder(diff_id.clone(), self.layer_media_type(), None, None)
                            .into_reused()
                    }
                };
                self.append_layer(layer);
                return Ok(());
            }

            warn!("reuse out of expected order; falling back to previous image lookup");
            self.reuse_queue = None;
        }

        let previous = self.previous.as_ref().ok_or(Error::NoPreviousImage)?;
        let layer = previous
            .layer_by_diff_id(diff_id)
            .ok_or_else(|| Error::DiffIdNotFound(diff_id.clone()))?;
        self.append_layer(layer);
        Ok(())
    }

    fn append_layer(&mut self, layer: ImageLayer) {
        self.config.rootfs.diff_ids.push(layer.diff_id().clone());
        self.config.history.push(History::default());
        self.layers.push(layer);
    }

    /// The diff ID of the image's top (most recently applied) layer.
    pub fn top_layer(&self) -> Result<&Digest> {
        self.layers
            .last()
            .map(ImageLayer::diff_id)
            .ok_or(Error::NoLayers)
    }

    /// Stream the uncompressed tar of the layer with the given diff ID.
    ///
    /// Placeholder layers resolve through the previous image on demand.
    #[instrument(skip(self))]
    pub async fn get_layer(&self, diff_id: &Digest) -> Result<ByteStream> {
        let layer = self
            .layers
            .iter()
            .find(|layer| layer.diff_id() == diff_id)
            .ok_or_else(|| Error::LayerNotFound(diff_id.clone()))?;

        if layer.has_content() {
            return layer.uncompressed().await;
        }
        match self.previous.as_ref().and_then(|p| p.layer_by_diff_id(diff_id)) {
            Some(layer) => layer.uncompressed().await,
            None => Err(Error::LayerNotFound(diff_id.clone())),
        }
    }

    /// Splice a new base image under the application layers.
    ///
    /// `base_top_diff_id` anchors the split: everything above it is kept,
    /// everything at or below it is replaced by `new_base`'s layers. The
    /// platform fields are realigned to the new base.
    #[instrument(skip(self, new_base))]
    pub fn rebase(&mut self, base_top_diff_id: &Digest, new_base: &SourceImage) -> Result<()> {
        let incoming = new_base.manifest.media_type;
        if incoming.is_oci() != self.manifest_media_type.is_oci() {
            return Err(Error::MediaTypeMismatch {
                expected: self.manifest_media_type,
                actual: incoming,
            });
        }

        let anchor = self
            .layers
            .iter()
            .position(|layer| layer.diff_id() == base_top_diff_id)
            .ok_or_else(|| Error::AnchorNotFound(base_top_diff_id.clone()))?;

        let layer_type = incoming.layer_type()?;
        let kept = self.layers.split_off(anchor + 1);
        let kept_history = self.config.history.split_off((anchor + 1).min(self.config.history.len()));

        let mut layers = new_base.layers()?;
        layers.extend(kept.into_iter().map(|layer| layer.relabeled(layer_type)));

        let mut history = new_base.config.history.clone();
        history.extend(kept_history);

        self.config.rootfs.diff_ids = layers.iter().map(|l| l.diff_id().clone()).collect();
        self.config.history = history;
        self.config.apply_platform_of(&new_base.config);
        self.layers = layers;
        Ok(())
    }

    /// Rebuild the image in a different media type family.
    async fn coerce_media_types(
        &mut self,
        format: Format,
        mutate: Option<&LayerMutator>,
    ) -> Result<()> {
        let before = self.layers.len();
        let manifest_media_type = format.manifest_type();
        let layer_type = manifest_media_type.layer_type()?;

        let mut config = self.config.clone();
        config.rootfs.diff_ids = Vec::new();

        let mut layers = Vec::with_capacity(before);
        for layer in &self.layers {
            let layer = layer.transcode(layer_type, mutate).await?;
            config.rootfs.diff_ids.push(layer.diff_id().clone());
            layers.push(layer);
        }

        if layers.len() != before {
            return Err(Error::Protocol(format!(
                "media type coercion changed the layer count: {before} != {}",
                layers.len()
            )));
        }

        self.manifest_media_type = manifest_media_type;
        self.config = config;
        self.layers = layers;
        Ok(())
    }

    /// Produce the manifest and the rendered config blob for this image as
    /// it stands.
    pub async fn rendered_manifest(&self) -> Result<(Manifest, RenderedBlob)> {
        let config_blob = RenderedBlob::from_json(&self.config)?;
        let config_descriptor = Descriptor::builder()
            .media_type(self.manifest_media_type.config_type()?)
            .digest(config_blob.digest.clone())
            .size(config_blob.size)
            .build();

        let mut manifest = Manifest::new(self.manifest_media_type, config_descriptor);
        manifest.annotations = self.annotations.clone();
        for layer in &self.layers {
            manifest.layers.push(layer.descriptor().await?);
        }
        Ok((manifest, config_blob))
    }

    /// Normalization applied by every save engine before serialization.
    async fn normalize_for_save(&mut self) -> Result<()> {
        self.config.created = self.created_at.clone();
        self.config.docker_version = None;
        self.config.container = None;

        if self.layers.is_empty() {
            if self.config.os == Platform::WINDOWS {
                let layer = ImageLayer::windows_base(self.layer_media_type()).await?;
                self.append_layer(layer);
            } else if self.add_empty_layer_on_save {
                let layer = ImageLayer::empty(self.layer_media_type()).await?;
                self.append_layer(layer);
            }
        }

        if self.preserve_history {
            self.config.normalize_history(self.layers.len());
        } else {
            let blank = History {
                created: Some(self.created_at.clone()),
                ..History::default()
            };
            self.config.history = vec![blank; self.layers.len()];
        }
        Ok(())
    }

    /// Commit the image to its backend under its primary name and any
    /// additional names.
    ///
    /// Returns the backend-specific identifier of the saved image: the
    /// daemon image ID, or the manifest digest for layout and registry
    /// saves. Partial failures are reported per target name.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn save(&mut self, additional_names: &[&str]) -> Result<String, SaveError> {
        let primary = self.name.to_string();
        let mut names = StringSet::new();
        names.insert(primary.clone());
        for name in additional_names {
            names.insert(*name);
        }

        self.normalize_for_save()
            .await
            .map_err(|e| SaveError::single(primary.clone(), e))?;

        let identifier = match self.backend.clone() {
            Backend::Daemon(client) => crate::daemon::save(client, self, &names)
                .await
                .map_err(|e| SaveError::single(primary.clone(), e))?,
            Backend::Layout(path) => layout::save(&path, self, &names)
                .await
                .map_err(|e| SaveError::single(primary.clone(), e))?,
            Backend::Registry(client) => registry::save(client.as_ref(), self, &names).await?,
        };

        // Best-effort: daemon images whose reused layers have no blob
        // identity cannot render a manifest, but the save still succeeded.
        if let Ok((manifest, _)) = self.rendered_manifest().await {
            if let Ok(rendered) = manifest.rendered() {
                self.saved = Some(rendered.digest);
            }
        }

        Ok(identifier)
    }

    /// The descriptor of the saved manifest, with the config's platform.
    ///
    /// Only meaningful after [`WorkingImage::save`] has run.
    pub async fn saved_descriptor(&self) -> Result<Descriptor> {
        let digest = self.saved.clone().ok_or(Error::ManifestUndefined)?;
        let (manifest, _) = self.rendered_manifest().await?;
        let rendered = manifest.rendered()?;
        Ok(Descriptor {
            media_type: self.manifest_media_type,
            digest,
            size: rendered.size,
            urls: None,
            annotations: self.annotations.clone(),
            platform: Some(self.config.platform()),
        })
    }
}
