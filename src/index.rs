//! The working index: a multi-platform image index under mutation.
//!
//! The index wraps an immutable base index and stages every mutation in a
//! change log: an `annotate` map of descriptor deltas and a `removed` set of
//! digests. Reads observe pending writes; base manifests are only rewritten
//! when [`ImageIndex::save`] reconciles the log into the on-disk layout.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use bon::Builder;
use bytes::Bytes;
use derive_more::Debug;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, instrument, warn};

use crate::{
    image::Format,
    layout::LayoutStore,
    manifest::{Descriptor, Index},
    mediatype::MediaType,
    registry::RegistryClient,
    safe_name, Annotations, Digest, Error, Platform, Reference, Result, Version,
};

/// Upper bound on concurrent manifest fetches during an add-all traversal.
const ADD_ALL_CONCURRENCY: usize = 8;

/// An image added to the index in the current session, not yet merged into
/// the base index.
#[derive(Debug, Clone)]
struct AddedImage {
    descriptor: Descriptor,

    /// The child's manifest bytes, kept so the layout can store the blob.
    manifest: Option<Bytes>,
}

/// A staged edit to one child descriptor. Fields left `None` are untouched.
#[derive(Debug, Clone, Default)]
struct DescriptorDelta {
    os: Option<String>,
    architecture: Option<String>,
    variant: Option<String>,
    os_version: Option<String>,
    features: Option<Vec<String>>,
    os_features: Option<Vec<String>>,
    urls: Option<Vec<String>>,
    annotations: Option<Annotations>,

    /// The child's media type, recorded at staging time so save knows when
    /// annotation writes must be dropped.
    media_type: Option<MediaType>,
}

impl DescriptorDelta {
    fn apply_to(&self, descriptor: &mut Descriptor) {
        let set_platform_field = self.os.is_some()
            || self.architecture.is_some()
            || self.variant.is_some()
            || self.os_version.is_some()
            || self.features.is_some()
            || self.os_features.is_some();
        if set_platform_field {
            let platform = descriptor.platform.get_or_insert_with(|| Platform {
                os: String::new(),
                architecture: String::new(),
                variant: None,
                os_version: None,
                features: Vec::new(),
                os_features: Vec::new(),
            });
            if let Some(os) = &self.os {
                platform.os = os.clone();
            }
            if let Some(architecture) = &self.architecture {
                platform.architecture = architecture.clone();
            }
            if let Some(variant) = &self.variant {
                platform.variant = Some(variant.clone());
            }
            if let Some(os_version) = &self.os_version {
                platform.os_version = Some(os_version.clone());
            }
            if let Some(features) = &self.features {
                platform.features = features.clone();
            }
            if let Some(os_features) = &self.os_features {
                platform.os_features = os_features.clone();
            }
        }

        if let Some(urls) = &self.urls {
            descriptor.urls = Some(urls.clone());
        }
        if let Some(annotations) = &self.annotations {
            descriptor
                .annotations
                .get_or_insert_with(Annotations::new)
                .extend(annotations.clone());
        }
    }

    /// Whether applying this delta to a Docker child would be a no-op.
    fn only_annotations(&self) -> bool {
        self.os.is_none()
            && self.architecture.is_none()
            && self.variant.is_none()
            && self.os_version.is_none()
            && self.features.is_none()
            && self.os_features.is_none()
            && self.urls.is_none()
    }
}

/// Options for [`ImageIndex::add`].
#[derive(Debug, Clone, Default, Builder)]
pub struct AddOptions {
    /// Add every leaf image of a referenced index.
    #[builder(default)]
    pub all: bool,

    /// Select a single image out of a referenced index by platform.
    pub platform: Option<Platform>,

    /// Annotations to stage for the added image(s). Ignored for children
    /// whose media type does not support annotations.
    pub annotations: Option<Annotations>,

    /// An already-materialized local image descriptor to append instead of
    /// fetching anything from the registry.
    pub local_image: Option<Descriptor>,
}

/// Options for [`ImageIndex::push`].
#[derive(Debug, Clone, Default, Builder)]
pub struct PushOptions {
    /// Transcode the index manifest to this format before pushing.
    pub format: Option<Format>,

    /// Additional tags to push the index under.
    #[builder(into, default)]
    pub tags: Vec<String>,

    /// Delete the local layout after a successful push.
    #[builder(default)]
    pub purge: bool,
}

/// A multi-platform index under mutation.
#[derive(Debug)]
pub struct ImageIndex {
    name: Reference,
    media_type: MediaType,
    base: Index,
    images: BTreeMap<Digest, AddedImage>,
    annotate: BTreeMap<Digest, DescriptorDelta>,
    removed: BTreeSet<Digest>,
    layout_root: PathBuf,
    #[debug(skip)]
    client: Arc<dyn RegistryClient>,
}

#[bon::bon]
impl ImageIndex {
    /// Create a new, empty index.
    #[builder]
    pub fn new(
        /// The name the index will be pushed under.
        name: Reference,

        /// Registry capability used by add, remove, and push.
        client: Arc<dyn RegistryClient>,

        /// The media type family of the index manifest.
        #[builder(default = Format::Oci)]
        format: Format,

        /// Root directory for the index's local layout. Defaults to the
        /// XDG-derived root.
        layout_root: Option<PathBuf>,
    ) -> Result<Self> {
        let media_type = format.index_type();
        Ok(Self {
            name,
            media_type,
            base: Index::new(media_type),
            images: BTreeMap::new(),
            annotate: BTreeMap::new(),
            removed: BTreeSet::new(),
            layout_root: match layout_root {
                Some(root) => root,
                None => crate::default_layout_root()?,
            },
            client,
        })
    }
}

impl ImageIndex {
    /// Open an index that exists in the registry, wrapping it as the base.
    #[instrument(skip(client))]
    pub async fn from_registry(
        name: Reference,
        client: Arc<dyn RegistryClient>,
        layout_root: Option<PathBuf>,
    ) -> Result<Self> {
        let base = client.index(&name).await?;
        Ok(Self {
            media_type: base.media_type,
            base,
            images: BTreeMap::new(),
            annotate: BTreeMap::new(),
            removed: BTreeSet::new(),
            layout_root: match layout_root {
                Some(root) => root,
                None => crate::default_layout_root()?,
            },
            name,
            client,
        })
    }

    /// Reopen an index previously saved to its local layout.
    #[instrument(skip(client))]
    pub async fn from_layout(
        name: Reference,
        client: Arc<dyn RegistryClient>,
        layout_root: Option<PathBuf>,
    ) -> Result<Self> {
        let layout_root = match layout_root {
            Some(root) => root,
            None => crate::default_layout_root()?,
        };
        let store = LayoutStore::from_path(layout_root.join(safe_name(&name.to_string()))).await?;
        let base = store.image_index().await?;
        Ok(Self {
            media_type: base.media_type,
            base,
            images: BTreeMap::new(),
            annotate: BTreeMap::new(),
            removed: BTreeSet::new(),
            layout_root,
            name,
            client,
        })
    }

    /// The name the index will be pushed under.
    pub fn name(&self) -> &Reference {
        &self.name
    }

    /// The index manifest's media type.
    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// The directory holding this index's local layout.
    pub fn layout_path(&self) -> PathBuf {
        self.layout_root.join(safe_name(&self.name.to_string()))
    }

    /// Whether there are staged changes that a save would reconcile.
    pub fn needs_save(&self) -> bool {
        !self.annotate.is_empty() || !self.removed.is_empty()
    }

    /// Open this index's layout, aligning the stored index media type with
    /// the working index's.
    async fn store(&self) -> Result<LayoutStore> {
        let store = LayoutStore::from_path(self.layout_path()).await?;
        let mut index = store.image_index().await?;
        if index.media_type != self.media_type {
            index.media_type = self.media_type;
            store.write_index(&index).await?;
        }
        Ok(store)
    }

    /// Digests of every child visible to getters: session adds plus base
    /// manifests, minus staged removals.
    pub fn digests(&self) -> Vec<Digest> {
        let mut digests = self.images.keys().cloned().collect::<BTreeSet<_>>();
        digests.extend(self.base.manifests.iter().map(|m| m.digest.clone()));
        digests
            .into_iter()
            .filter(|digest| !self.removed.contains(digest))
            .collect()
    }

    /// Look up the child descriptor for a digest: session adds first, then
    /// the base index. Staged removals hide the digest entirely.
    fn descriptor(&self, digest: &Digest) -> Result<&Descriptor> {
        if self.removed.contains(digest) {
            return Err(Error::NoSuchDigest(digest.clone()));
        }
        self.images
            .get(digest)
            .map(|added| &added.descriptor)
            .or_else(|| self.base.descriptor_for(digest))
            .ok_or_else(|| Error::NoSuchDigest(digest.clone()))
    }

    fn child_media_type(&self, digest: &Digest) -> Result<MediaType> {
        Ok(self.descriptor(digest)?.media_type)
    }

    fn delta(&self, digest: &Digest) -> Option<&DescriptorDelta> {
        self.annotate.get(digest)
    }

    fn stage(&mut self, digest: &Digest) -> Result<&mut DescriptorDelta> {
        let media_type = self.child_media_type(digest)?;
        let delta = self.annotate.entry(digest.clone()).or_default();
        delta.media_type = Some(media_type);
        Ok(delta)
    }

    fn undefined(&self, field: &'static str, digest: &Digest) -> Error {
        Error::UndefinedField {
            field,
            media_type: self
                .child_media_type(digest)
                .unwrap_or(MediaType::OciManifest),
            digest: digest.clone(),
        }
    }

    /// The OS of the child with the given digest.
    pub fn os(&self, digest: &Digest) -> Result<String> {
        if let Some(os) = self.delta(digest).and_then(|d| d.os.clone()) {
            if !self.removed.contains(digest) {
                return Ok(os);
            }
        }
        self.descriptor(digest)?
            .platform
            .as_ref()
            .map(|p| p.os.clone())
            .filter(|os| !os.is_empty())
            .ok_or_else(|| self.undefined("os", digest))
    }

    /// Stage a new OS for the child with the given digest.
    pub fn set_os(&mut self, digest: &Digest, os: &str) -> Result<()> {
        self.stage(digest)?.os = Some(os.to_string());
        Ok(())
    }

    /// The architecture of the child with the given digest.
    pub fn architecture(&self, digest: &Digest) -> Result<String> {
        if let Some(architecture) = self.delta(digest).and_then(|d| d.architecture.clone()) {
            if !self.removed.contains(digest) {
                return Ok(architecture);
            }
        }
        self.descriptor(digest)?
            .platform
            .as_ref()
            .map(|p| p.architecture.clone())
            .filter(|architecture| !architecture.is_empty())
            .ok_or_else(|| self.undefined("architecture", digest))
    }

    /// Stage a new architecture for the child with the given digest.
    pub fn set_architecture(&mut self, digest: &Digest, architecture: &str) -> Result<()> {
        self.stage(digest)?.architecture = Some(architecture.to_string());
        Ok(())
    }

    /// The CPU variant of the child with the given digest.
    pub fn variant(&self, digest: &Digest) -> Result<String> {
        if let Some(variant) = self.delta(digest).and_then(|d| d.variant.clone()) {
            if !self.removed.contains(digest) {
                return Ok(variant);
            }
        }
        self.descriptor(digest)?
            .platform
            .as_ref()
            .and_then(|p| p.variant.clone())
            .ok_or_else(|| self.undefined("variant", digest))
    }

    /// Stage a new CPU variant for the child with the given digest.
    pub fn set_variant(&mut self, digest: &Digest, variant: &str) -> Result<()> {
        self.stage(digest)?.variant = Some(variant.to_string());
        Ok(())
    }

    /// The OS version of the child with the given digest.
    pub fn os_version(&self, digest: &Digest) -> Result<String> {
        if let Some(os_version) = self.delta(digest).and_then(|d| d.os_version.clone()) {
            if !self.removed.contains(digest) {
                return Ok(os_version);
            }
        }
        self.descriptor(digest)?
            .platform
            .as_ref()
            .and_then(|p| p.os_version.clone())
            .ok_or_else(|| self.undefined("os.version", digest))
    }

    /// Stage a new OS version for the child with the given digest.
    pub fn set_os_version(&mut self, digest: &Digest, os_version: &str) -> Result<()> {
        self.stage(digest)?.os_version = Some(os_version.to_string());
        Ok(())
    }

    /// The CPU features of the child with the given digest.
    pub fn features(&self, digest: &Digest) -> Result<Vec<String>> {
        if let Some(features) = self.delta(digest).and_then(|d| d.features.clone()) {
            if !self.removed.contains(digest) {
                return Ok(features);
            }
        }
        self.descriptor(digest)?
            .platform
            .as_ref()
            .map(|p| p.features.clone())
            .filter(|features| !features.is_empty())
            .ok_or_else(|| self.undefined("features", digest))
    }

    /// Stage new CPU features for the child with the given digest.
    pub fn set_features(&mut self, digest: &Digest, features: Vec<String>) -> Result<()> {
        self.stage(digest)?.features = Some(features);
        Ok(())
    }

    /// The OS features of the child with the given digest.
    pub fn os_features(&self, digest: &Digest) -> Result<Vec<String>> {
        if let Some(os_features) = self.delta(digest).and_then(|d| d.os_features.clone()) {
            if !self.removed.contains(digest) {
                return Ok(os_features);
            }
        }
        self.descriptor(digest)?
            .platform
            .as_ref()
            .map(|p| p.os_features.clone())
            .filter(|os_features| !os_features.is_empty())
            .ok_or_else(|| self.undefined("os.features", digest))
    }

    /// Stage new OS features for the child with the given digest.
    pub fn set_os_features(&mut self, digest: &Digest, os_features: Vec<String>) -> Result<()> {
        self.stage(digest)?.os_features = Some(os_features);
        Ok(())
    }

    /// The URLs of the child with the given digest.
    pub fn urls(&self, digest: &Digest) -> Result<Vec<String>> {
        if let Some(urls) = self.delta(digest).and_then(|d| d.urls.clone()) {
            if !self.removed.contains(digest) {
                return Ok(urls);
            }
        }
        self.descriptor(digest)?
            .urls
            .clone()
            .filter(|urls| !urls.is_empty())
            .ok_or_else(|| self.undefined("urls", digest))
    }

    /// Stage new URLs for the child with the given digest.
    pub fn set_urls(&mut self, digest: &Digest, urls: Vec<String>) -> Result<()> {
        self.stage(digest)?.urls = Some(urls);
        Ok(())
    }

    /// The annotations of the child with the given digest.
    ///
    /// Children whose media type cannot carry annotations (Docker) fail
    /// with [`Error::UndefinedField`].
    pub fn annotations(&self, digest: &Digest) -> Result<Annotations> {
        let media_type = self.child_media_type(digest)?;
        if !media_type.supports_annotations() {
            return Err(Error::UndefinedField {
                field: "annotations",
                media_type,
                digest: digest.clone(),
            });
        }

        if let Some(annotations) = self.delta(digest).and_then(|d| d.annotations.clone()) {
            return Ok(annotations);
        }
        self.descriptor(digest)?
            .annotations
            .clone()
            .filter(|annotations| !annotations.is_empty())
            .ok_or_else(|| self.undefined("annotations", digest))
    }

    /// Stage annotations for the child with the given digest.
    ///
    /// Staging always succeeds for known digests; at save time the write is
    /// silently dropped when the child's media type cannot carry it.
    pub fn set_annotations(&mut self, digest: &Digest, annotations: Annotations) -> Result<()> {
        self.stage(digest)?.annotations = Some(annotations);
        Ok(())
    }

    /// Add a referenced image (or images) to the index.
    #[instrument(skip(self, options))]
    pub async fn add(&mut self, reference: &Reference, options: AddOptions) -> Result<()> {
        // A local image handle is already materialized; nothing to fetch.
        if let Some(descriptor) = options.local_image {
            let digest = descriptor.digest.clone();
            self.insert_added(
                AddedImage {
                    descriptor,
                    manifest: None,
                },
                options.annotations.as_ref(),
            )
            .await?;
            debug!(%digest, "added local image");
            return Ok(());
        }

        let head = self.client.head(reference).await?;
        if head.is_image() {
            let added = self.fetch_image(&reference.with_digest(head.digest.clone())).await?;
            return self.insert_added(added, options.annotations.as_ref()).await;
        }

        if options.all {
            return self.add_all(reference, options.annotations.as_ref()).await;
        }

        // Resolve a single image out of the index, preferring the caller's
        // platform filter and falling back to the host platform.
        let platform = options.platform.unwrap_or_else(Platform::host);
        platform.validate()?;

        let index = self.client.index(reference).await?;
        let child = index
            .manifests
            .iter()
            .filter(|desc| desc.is_image())
            .find(|desc| {
                desc.platform
                    .as_ref()
                    .is_some_and(|candidate| platform.satisfies(candidate))
            })
            .ok_or(Error::PlatformUndefined(head.digest.clone()))?;

        let added = self
            .fetch_image(&reference.with_digest(child.digest.clone()))
            .await?;
        self.insert_added(added, options.annotations.as_ref()).await
    }

    /// Walk a referenced index recursively and add every leaf image.
    ///
    /// Leaf fetches run in a bounded work group; the group is joined before
    /// anything is appended.
    async fn add_all(&mut self, reference: &Reference, annotations: Option<&Annotations>) -> Result<()> {
        // Collect leaf image descriptors breadth-first through any nested
        // indexes.
        let mut leaves = Vec::new();
        let mut pending = vec![reference.clone()];
        while let Some(next) = pending.pop() {
            let index = self.client.index(&next).await?;
            for child in index.manifests {
                if child.is_index() {
                    pending.push(reference.with_digest(child.digest.clone()));
                } else if child.is_image() {
                    leaves.push(child);
                } else {
                    warn!(digest = %child.digest, media_type = %child.media_type, "skip: not an image or index");
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(ADD_ALL_CONCURRENCY.min(leaves.len().max(1))));
        let mut group = JoinSet::new();
        for leaf in leaves {
            let client = Arc::clone(&self.client);
            let semaphore = Arc::clone(&semaphore);
            let reference = reference.with_digest(leaf.digest.clone());
            group.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::transport(format!("acquire fetch permit: {e}")))?;
                fetch_image_with(client, &reference).await
            });
        }

        let mut fetched = Vec::new();
        while let Some(joined) = group.join_next().await {
            let added =
                joined.map_err(|e| Error::transport(format!("join fetch task: {e}")))??;
            fetched.push(added);
        }

        for added in fetched {
            self.insert_added(added, annotations).await?;
        }
        Ok(())
    }

    async fn fetch_image(&self, reference: &Reference) -> Result<AddedImage> {
        fetch_image_with(Arc::clone(&self.client), reference).await
    }

    /// Record a session image and append it to the local layout.
    async fn insert_added(
        &mut self,
        added: AddedImage,
        annotations: Option<&Annotations>,
    ) -> Result<()> {
        let digest = added.descriptor.digest.clone();
        let media_type = added.descriptor.media_type;

        let store = self.store().await?;
        if let Some(manifest) = &added.manifest {
            store.write_bytes(&digest, manifest.clone()).await?;
        }
        store.append_descriptor(added.descriptor.clone()).await?;

        self.removed.remove(&digest);
        self.images.insert(digest.clone(), added);

        match annotations {
            Some(annotations) if media_type.supports_annotations() => {
                let delta = self.annotate.entry(digest).or_default();
                delta.media_type = Some(media_type);
                delta
                    .annotations
                    .get_or_insert_with(Annotations::new)
                    .extend(annotations.clone());
            }
            Some(_) => debug!(%digest, "annotations ignored for media type {media_type}"),
            None => {}
        }
        Ok(())
    }

    /// Stage the removal of a child, by tag or digest.
    ///
    /// Tags are resolved to digests through the registry. The digest must be
    /// known to the index.
    #[instrument(skip(self))]
    pub async fn remove(&mut self, name_or_digest: &str) -> Result<()> {
        let digest = match Digest::from_str(name_or_digest) {
            Ok(digest) => digest,
            Err(_) => {
                let reference = Reference {
                    host: self.name.host.clone(),
                    repository: self.name.repository.clone(),
                    version: Version::tag(name_or_digest),
                };
                self.client.head(&reference).await?.digest
            }
        };

        if self.images.contains_key(&digest) || self.base.descriptor_for(&digest).is_some() {
            self.annotate.remove(&digest);
            self.removed.insert(digest);
            Ok(())
        } else {
            Err(Error::NoSuchDigest(digest))
        }
    }

    /// Reconcile the change log into the local layout.
    ///
    /// Descriptors staged in `annotate` are rewritten; digests staged in
    /// `removed` disappear from the layout. Afterwards the reconciled layout
    /// index becomes the new base and the change log is empty.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn save(&mut self) -> Result<()> {
        let store = self.store().await?;

        // Annotated descriptors are re-appended below; drop them first so
        // the layout never holds duplicates.
        let annotated = self.annotate.keys().cloned().collect::<Vec<_>>();
        store.remove_descriptors(&annotated).await?;

        for (digest, delta) in std::mem::take(&mut self.annotate) {
            if self.removed.contains(&digest) {
                continue;
            }

            let mut descriptor = match self.images.get(&digest) {
                Some(added) => added.descriptor.clone(),
                None => self
                    .base
                    .descriptor_for(&digest)
                    .cloned()
                    .ok_or_else(|| Error::NoSuchDigest(digest.clone()))?,
            };

            // Docker children cannot carry annotations; the staged write is
            // dropped silently. The child's media type was recorded when the
            // delta was staged.
            let mut delta = delta;
            let child_type = delta.media_type.unwrap_or(descriptor.media_type);
            if !child_type.supports_annotations() && delta.annotations.take().is_some() {
                debug!(%digest, "dropped staged annotations for docker child");
                if delta.only_annotations() {
                    store.append_descriptor(descriptor).await?;
                    continue;
                }
            }

            delta.apply_to(&mut descriptor);
            store.append_descriptor(descriptor).await?;
        }

        let removed = std::mem::take(&mut self.removed);
        if !removed.is_empty() {
            let digests = removed.iter().cloned().collect::<Vec<_>>();
            store.remove_descriptors(&digests).await?;
            for digest in &digests {
                self.images.remove(digest);
            }
        }

        // The reconciled layout is the new base.
        self.base = store.image_index().await?;
        self.images.clear();
        Ok(())
    }

    /// Push the index manifest to the registry.
    ///
    /// Only the index manifest is uploaded; the referenced image manifests
    /// and blobs are assumed to exist on the registry already. Fails with
    /// [`Error::IndexNeedsSave`] while changes are staged.
    #[instrument(skip(self, options), fields(name = %self.name))]
    pub async fn push(&mut self, options: PushOptions) -> Result<Digest> {
        if self.needs_save() {
            return Err(Error::IndexNeedsSave);
        }

        let store = self.store().await?;
        let mut index = store.image_index().await?;

        if let Some(format) = options.format {
            let target = format.index_type();
            if target != index.media_type {
                index.media_type = target;
                store.write_index(&index).await?;
                self.media_type = target;
                self.base = index.clone();
            }
        }

        let rendered = index.rendered()?;
        let digest = rendered.digest.clone();

        self.client
            .write_manifest(&self.name, index.media_type, rendered.bytes.clone())
            .await?;
        for tag in &options.tags {
            self.client
                .write_manifest(&self.name.with_tag(tag), index.media_type, rendered.bytes.clone())
                .await?;
        }

        if options.purge {
            tokio::fs::remove_dir_all(self.layout_path()).await?;
        }
        Ok(digest)
    }
}

async fn fetch_image_with(
    client: Arc<dyn RegistryClient>,
    reference: &Reference,
) -> Result<AddedImage> {
    let (bytes, mut descriptor) = client.get(reference).await?;
    if !descriptor.is_image() {
        return Err(Error::Protocol(format!(
            "{reference} resolved to {}, not an image manifest",
            descriptor.media_type
        )));
    }

    let image = client.image(reference).await?;
    descriptor.platform = Some(image.config.platform());
    Ok(AddedImage {
        descriptor,
        manifest: Some(bytes),
    })
}
