//! Wire types for manifests, indexes, and descriptors.

use bon::Builder;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{mediatype::MediaType, Annotations, Digest, Platform, Result};

/// A reference to a blob: its media type, digest, size, and optional
/// platform/annotation/URL metadata.
///
/// Spec reference: https://github.com/opencontainers/image-spec/blob/main/descriptor.md
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The media type of the referenced content.
    pub media_type: MediaType,

    /// The digest of the referenced content.
    #[builder(into)]
    pub digest: Digest,

    /// The size of the referenced content in bytes.
    pub size: i64,

    /// Alternate source URLs for the referenced content.
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,

    /// Arbitrary metadata. Only meaningful on OCI media types.
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,

    /// The platform of the referenced image, when part of an index.
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// Whether this descriptor points at a single-platform image.
    pub fn is_image(&self) -> bool {
        self.media_type.is_image()
    }

    /// Whether this descriptor points at an index.
    pub fn is_index(&self) -> bool {
        self.media_type.is_index()
    }
}

/// A single-platform image manifest: config descriptor plus layer
/// descriptors, in application order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Always 2 for both OCI and Docker schema2.
    pub schema_version: u32,

    /// The manifest media type; dictates the wire `Content-Type`.
    pub media_type: MediaType,

    /// Descriptor for the image config blob.
    pub config: Descriptor,

    /// Layer descriptors, base layer first.
    pub layers: Vec<Descriptor>,

    /// Manifest-level annotations. Dropped on Docker manifests at render
    /// time; Docker has no field for them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl Manifest {
    /// Create an empty manifest of the given media type.
    pub fn new(media_type: MediaType, config: Descriptor) -> Self {
        Self {
            schema_version: 2,
            media_type,
            config,
            layers: Vec::new(),
            annotations: None,
        }
    }

    /// Serialize to the exact bytes that are written and digested.
    pub fn rendered(&self) -> Result<RenderedBlob> {
        let mut manifest = self.clone();
        if !manifest.media_type.supports_annotations() {
            manifest.annotations = None;
        }
        RenderedBlob::from_json(&manifest)
    }

    /// The descriptor for this manifest, with an optional platform record.
    pub fn descriptor(&self, platform: Option<Platform>) -> Result<Descriptor> {
        let rendered = self.rendered()?;
        Ok(Descriptor {
            media_type: self.media_type,
            digest: rendered.digest,
            size: rendered.size,
            urls: None,
            annotations: self.annotations.clone(),
            platform,
        })
    }
}

/// A multi-platform index (OCI index or Docker manifest list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    /// Always 2 for both OCI and Docker schema2.
    pub schema_version: u32,

    /// The index media type; dictates the wire `Content-Type`.
    pub media_type: MediaType,

    /// Child manifest descriptors.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,

    /// Index-level annotations. Dropped on Docker manifest lists at render
    /// time; Docker has no field for them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl Index {
    /// Create an empty index of the given media type.
    pub fn new(media_type: MediaType) -> Self {
        Self {
            schema_version: 2,
            media_type,
            manifests: Vec::new(),
            annotations: None,
        }
    }

    /// Find the child descriptor with the given digest.
    pub fn descriptor_for(&self, digest: &Digest) -> Option<&Descriptor> {
        self.manifests.iter().find(|desc| &desc.digest == digest)
    }

    /// Serialize to the exact bytes that are written and digested.
    pub fn rendered(&self) -> Result<RenderedBlob> {
        let mut index = self.clone();
        if !index.media_type.supports_annotations() {
            index.annotations = None;
        }
        RenderedBlob::from_json(&index)
    }
}

/// A serialized blob plus the digest and size of those exact bytes.
///
/// All JSON that gets digested funnels through here so that the digest
/// always matches the bytes that land on disk or on the wire.
#[derive(Debug, Clone)]
pub struct RenderedBlob {
    /// The serialized bytes.
    pub bytes: Bytes,

    /// SHA-256 of `bytes`.
    pub digest: Digest,

    /// Length of `bytes`.
    pub size: i64,
}

impl RenderedBlob {
    /// Serialize a value as JSON and digest the result.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::from_bytes(bytes))
    }

    /// Wrap raw bytes, digesting them.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let digest = Digest::hash_bytes(&bytes);
        let size = bytes.len() as i64;
        Self {
            bytes,
            digest,
            size,
        }
    }
}
