//! Wire formats for manifests, indexes, configs, and layers.

use std::str::FromStr;

use enum_assoc::Assoc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{AsRefStr, EnumIter, IntoEnumIterator};
use tracing::debug;

use crate::{Error, Result};

/// What a descriptor with a given media type points at.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Kind {
    /// A single-platform image manifest.
    Manifest,

    /// A multi-platform index (OCI index or Docker manifest list).
    Index,

    /// An image config blob.
    Config,

    /// A filesystem layer blob.
    Layer,
}

/// How a layer blob is compressed on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Compression {
    /// The blob is a plain tarball.
    None,

    /// The blob is gzip-compressed.
    Gzip,

    /// The blob is zstd-compressed.
    Zstd,
}

/// Media types for OCI and Docker container image objects.
///
/// Spec reference: https://github.com/opencontainers/image-spec/blob/main/media-types.md
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, AsRefStr, EnumIter, Assoc)]
#[func(pub const fn kind(&self) -> Kind)]
#[func(pub const fn is_oci(&self) -> bool)]
#[func(pub const fn supports_annotations(&self) -> bool)]
#[func(pub const fn supports_urls(&self) -> bool)]
#[func(pub const fn compression(&self) -> Compression)]
pub enum MediaType {
    /// An OCI image manifest.
    #[strum(serialize = "application/vnd.oci.image.manifest.v1+json")]
    #[assoc(
        kind = Kind::Manifest,
        is_oci = true,
        supports_annotations = true,
        supports_urls = true,
        compression = Compression::None
    )]
    OciManifest,

    /// An OCI image index.
    #[strum(serialize = "application/vnd.oci.image.index.v1+json")]
    #[assoc(
        kind = Kind::Index,
        is_oci = true,
        supports_annotations = true,
        supports_urls = true,
        compression = Compression::None
    )]
    OciIndex,

    /// An OCI image config blob.
    #[strum(serialize = "application/vnd.oci.image.config.v1+json")]
    #[assoc(
        kind = Kind::Config,
        is_oci = true,
        supports_annotations = false,
        supports_urls = false,
        compression = Compression::None
    )]
    OciConfig,

    /// An uncompressed OCI layer.
    #[strum(serialize = "application/vnd.oci.image.layer.v1.tar")]
    #[assoc(
        kind = Kind::Layer,
        is_oci = true,
        supports_annotations = false,
        supports_urls = true,
        compression = Compression::None
    )]
    OciLayer,

    /// A gzip-compressed OCI layer.
    #[strum(serialize = "application/vnd.oci.image.layer.v1.tar+gzip")]
    #[assoc(
        kind = Kind::Layer,
        is_oci = true,
        supports_annotations = false,
        supports_urls = true,
        compression = Compression::Gzip
    )]
    OciLayerGzip,

    /// A zstd-compressed OCI layer.
    #[strum(serialize = "application/vnd.oci.image.layer.v1.tar+zstd")]
    #[assoc(
        kind = Kind::Layer,
        is_oci = true,
        supports_annotations = false,
        supports_urls = true,
        compression = Compression::Zstd
    )]
    OciLayerZstd,

    /// A Docker schema2 image manifest. Does not carry annotations.
    #[strum(serialize = "application/vnd.docker.distribution.manifest.v2+json")]
    #[assoc(
        kind = Kind::Manifest,
        is_oci = false,
        supports_annotations = false,
        supports_urls = true,
        compression = Compression::None
    )]
    DockerManifest,

    /// A Docker schema2 manifest list. Does not carry annotations.
    #[strum(serialize = "application/vnd.docker.distribution.manifest.list.v2+json")]
    #[assoc(
        kind = Kind::Index,
        is_oci = false,
        supports_annotations = false,
        supports_urls = true,
        compression = Compression::None
    )]
    DockerManifestList,

    /// A Docker image config blob.
    #[strum(serialize = "application/vnd.docker.container.image.v1+json")]
    #[assoc(
        kind = Kind::Config,
        is_oci = false,
        supports_annotations = false,
        supports_urls = false,
        compression = Compression::None
    )]
    DockerConfig,

    /// A gzip-compressed Docker layer.
    #[strum(serialize = "application/vnd.docker.image.rootfs.diff.tar.gzip")]
    #[assoc(
        kind = Kind::Layer,
        is_oci = false,
        supports_annotations = false,
        supports_urls = true,
        compression = Compression::Gzip
    )]
    DockerLayer,

    /// A gzip-compressed Docker foreign layer, fetched through its URLs.
    #[strum(serialize = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip")]
    #[assoc(
        kind = Kind::Layer,
        is_oci = false,
        supports_annotations = false,
        supports_urls = true,
        compression = Compression::Gzip
    )]
    DockerForeignLayer,
}

impl MediaType {
    /// Whether a descriptor with this media type points at a single image.
    pub const fn is_image(&self) -> bool {
        matches!(self.kind(), Kind::Manifest)
    }

    /// Whether a descriptor with this media type points at an index.
    pub const fn is_index(&self) -> bool {
        matches!(self.kind(), Kind::Index)
    }

    /// The equivalent media type in the OCI family.
    pub const fn oci_counterpart(&self) -> MediaType {
        match self {
            Self::DockerManifest => Self::OciManifest,
            Self::DockerManifestList => Self::OciIndex,
            Self::DockerConfig => Self::OciConfig,
            Self::DockerLayer | Self::DockerForeignLayer => Self::OciLayerGzip,
            other => *other,
        }
    }

    /// The equivalent media type in the Docker family.
    ///
    /// Docker has no uncompressed or zstd layer format; those map onto the
    /// standard gzip layer, so callers must recompress the bytes to match.
    pub const fn docker_counterpart(&self) -> MediaType {
        match self {
            Self::OciManifest => Self::DockerManifest,
            Self::OciIndex => Self::DockerManifestList,
            Self::OciConfig => Self::DockerConfig,
            Self::OciLayer | Self::OciLayerGzip | Self::OciLayerZstd => Self::DockerLayer,
            other => *other,
        }
    }

    /// The config media type paired with this manifest media type.
    pub fn config_type(&self) -> Result<MediaType> {
        match self {
            Self::OciManifest => Ok(Self::OciConfig),
            Self::DockerManifest => Ok(Self::DockerConfig),
            other => Err(Error::UnknownMediaType(format!(
                "{other} does not pair with a config media type"
            ))),
        }
    }

    /// The default layer media type paired with this manifest media type.
    pub fn layer_type(&self) -> Result<MediaType> {
        match self {
            Self::OciManifest => Ok(Self::OciLayerGzip),
            Self::DockerManifest => Ok(Self::DockerLayer),
            other => Err(Error::UnknownMediaType(format!(
                "{other} does not pair with a layer media type"
            ))),
        }
    }

    /// Parse deprecated aliases into their modern equivalents.
    ///
    /// Non-distributable layers are officially deprecated in the OCI spec
    /// with the directive that clients treat them as ordinary layers:
    /// https://github.com/opencontainers/image-spec/blob/main/layer.md#non-distributable-layers
    fn compatibility_matrix(s: &str) -> Option<Self> {
        match s {
            "application/vnd.oci.image.layer.nondistributable.v1.tar" => Some(Self::OciLayer),
            "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip" => {
                Some(Self::OciLayerGzip)
            }
            "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd" => {
                Some(Self::OciLayerZstd)
            }
            _ => None,
        }
    }
}

impl FromStr for MediaType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(mt) = Self::compatibility_matrix(s) {
            debug!("translating media type from '{s}' to '{mt}' with compatibility matrix");
            return Ok(mt);
        }

        Self::iter()
            .find(|mt| mt.as_ref() == s)
            .ok_or_else(|| Error::UnknownMediaType(s.to_string()))
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl Serialize for MediaType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(serde::de::Error::custom)
    }
}
