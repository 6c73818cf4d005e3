#![deny(clippy::uninlined_format_args)]
#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

//! Builds, rebases, and publishes OCI and Docker container images and
//! multi-platform image indexes without invoking a container runtime.
//!
//! The crate is organized around a [`image::WorkingImage`] that accumulates
//! mutations in memory and commits them in a single save to one of three
//! backends (daemon, OCI layout directory, remote registry), and an
//! [`index::ImageIndex`] that stages annotation edits and removals until its
//! own save reconciles them into an on-disk layout.

use bon::Builder;
use derive_more::derive::{Debug, Display};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{collections::BTreeMap, path::PathBuf, str::FromStr};
use tracing::debug;

pub mod cfs;
pub mod config;
pub mod daemon;
mod error;
mod ext;
pub mod image;
pub mod index;
pub mod layer;
pub mod layout;
pub mod manifest;
pub mod mediatype;
pub mod registry;

pub use error::{Error, Result, SaveError};
pub use ext::StringSet;
pub use mediatype::MediaType;

/// Users can set this environment variable to specify the layout root.
/// If not set, the default falls back to the user data directory.
pub const XDG_RUNTIME_DIR_VAR: &str = "XDG_RUNTIME_DIR";

/// The timestamp written into saved configs and histories unless overridden.
///
/// Builds are reproducible: identical inputs must produce identical bytes,
/// so saved images never carry a wall-clock creation time.
pub const NORMALIZED_CREATED: &str = "1980-01-01T00:00:01Z";

/// The default registry host, used when references omit one.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// The default repository namespace, used when references omit one.
pub const DEFAULT_NAMESPACE: &str = "library";

/// Mangle a reference into a string that is safe to use as a directory name.
///
/// Every `:` becomes `-` and every `/` becomes `_`:
/// ```
/// assert_eq!(stratum::safe_name("cnbs/sample:hello"), "cnbs_sample-hello");
/// ```
pub fn safe_name(reference: &str) -> String {
    reference.replace(':', "-").replace('/', "_")
}

/// The root directory under which image indexes store their layouts.
///
/// Resolution order: `XDG_RUNTIME_DIR`, then `$HOME/.local/share/stratum`.
/// Index factories accept an explicit path that bypasses this entirely.
pub fn default_layout_root() -> Result<PathBuf> {
    if let Ok(runtime) = std::env::var(XDG_RUNTIME_DIR_VAR) {
        return Ok(PathBuf::from(runtime));
    }
    homedir()
        .map(|home| home.join(".local").join("share").join("stratum"))
        .map_err(|_| Error::transport("unable to determine home directory"))
}

/// Create a [`Digest`] from a hex string at compile time.
/// ```
/// let digest = stratum::digest!("sha256", "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// assert_eq!(digest.algorithm, "sha256");
/// assert_eq!(digest.as_hex(), "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// ```
///
/// If algorithm is not provided, it defaults to [`Digest::SHA256`].
/// ```
/// let digest = stratum::digest!("a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// assert_eq!(digest.algorithm, "sha256");
/// ```
///
/// This macro assumes that the hash is 32 bytes long; provide the size as a
/// third argument to work with other lengths.
#[macro_export]
macro_rules! digest {
    ($hex:expr) => {{
        $crate::digest!($crate::Digest::SHA256, $hex, 32)
    }};
    ($algorithm:expr, $hex:expr) => {{
        $crate::digest!($algorithm, $hex, 32)
    }};
    ($algorithm:expr, $hex:expr, $size:expr) => {{
        const HASH: [u8; $size] = hex_magic::hex!($hex);
        static_assertions::const_assert_ne!(HASH.len(), 0);
        static_assertions::const_assert_ne!($algorithm.len(), 0);
        $crate::Digest {
            algorithm: $algorithm.to_string(),
            hash: HASH.to_vec(),
        }
    }};
}

/// A content-addressable digest in the format `algorithm:hash`.
///
/// ```
/// # use std::str::FromStr;
/// let digest = stratum::Digest::from_str("sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4").expect("parse digest");
/// assert_eq!(digest.algorithm, "sha256");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[debug("{}", self.to_string())]
pub struct Digest {
    /// The hashing algorithm used (e.g. "sha256")
    pub algorithm: String,

    /// The raw hash bytes
    pub hash: Vec<u8>,
}

impl Digest {
    /// The SHA256 algorithm
    pub const SHA256: &'static str = "sha256";

    /// Returns the hash as a hex string
    pub fn as_hex(&self) -> String {
        hex::encode(&self.hash)
    }

    /// Parse the provided string as a SHA256 hex digest.
    pub fn from_sha256(s: &str) -> Result<Self> {
        Ok(Self {
            algorithm: Self::SHA256.to_string(),
            hash: hex::decode(s).map_err(|e| Error::InvalidDigest(e.to_string()))?,
        })
    }

    /// Create a new instance assuming it is sha256 encoded.
    pub fn from_hash(hash: impl Into<Vec<u8>>) -> Self {
        Self {
            algorithm: Self::SHA256.to_string(),
            hash: hash.into(),
        }
    }

    /// Hash a byte slice into a SHA256 digest.
    pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> Self {
        use sha2::{Digest as _, Sha256};
        Self::from_hash(Sha256::digest(bytes.as_ref()).to_vec())
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidDigest(format!("missing ':' separator in {s:?}")))?;

        if algorithm.is_empty() {
            return Err(Error::InvalidDigest(format!("empty algorithm in {s:?}")));
        }
        if hex.is_empty() {
            return Err(Error::InvalidDigest(format!("empty hash in {s:?}")));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hash: hex::decode(hex).map_err(|e| Error::InvalidDigest(e.to_string()))?,
        })
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.as_hex())
    }
}

impl From<&Digest> for Digest {
    fn from(digest: &Digest) -> Self {
        digest.clone()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Version identifier for a container image: a named tag or a digest.
///
/// ```
/// # use stratum::Version;
/// assert_eq!(Version::latest().to_string(), "latest");
/// assert_eq!(Version::tag("other").to_string(), "other");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Version {
    /// A named tag (e.g. "latest", "1.0.0")
    Tag(String),

    /// A SHA256 digest (e.g. "sha256:123abc...")
    Digest(Digest),
}

impl Version {
    /// Returns the tag for "latest".
    pub fn latest() -> Self {
        Self::Tag(String::from("latest"))
    }

    /// Create a tagged instance.
    pub fn tag(tag: &str) -> Self {
        Self::Tag(tag.to_string())
    }

    /// Create a digest instance.
    pub fn digest(digest: Digest) -> Self {
        Self::Digest(digest)
    }
}

/// A container image reference provided by a user.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize)]
pub struct Reference {
    /// Registry host (e.g. "docker.io", "ghcr.io")
    #[builder(into)]
    pub host: String,

    /// Repository within the registry (e.g. "library/ubuntu")
    #[builder(into)]
    pub repository: String,

    /// Version identifier, either a tag or SHA digest
    #[builder(into, default = Version::latest())]
    pub version: Version,
}

impl Reference {
    /// Clone the reference, replacing the version with the given digest.
    pub fn with_digest(&self, digest: impl Into<Digest>) -> Self {
        Self {
            host: self.host.clone(),
            repository: self.repository.clone(),
            version: Version::Digest(digest.into()),
        }
    }

    /// Clone the reference, replacing the version with the given tag.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            host: self.host.clone(),
            repository: self.repository.clone(),
            version: Version::tag(tag),
        }
    }

    /// The reference mangled into a filesystem-safe directory name.
    pub fn safe_name(&self) -> String {
        safe_name(&self.to_string())
    }
}

impl<S: reference_builder::State> ReferenceBuilder<S> {
    /// Set the reference to a tag version.
    pub fn tag(self, tag: &str) -> ReferenceBuilder<reference_builder::SetVersion<S>>
    where
        S::Version: reference_builder::IsUnset,
    {
        self.version(Version::tag(tag))
    }

    /// Set the reference to a digest version.
    pub fn digest(
        self,
        digest: impl Into<Digest>,
    ) -> ReferenceBuilder<reference_builder::SetVersion<S>>
    where
        S::Version: reference_builder::IsUnset,
    {
        self.version(Version::Digest(digest.into()))
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Splits `name[:tag|@digest]` into its name and version.
        fn parse_name(name: &str) -> Result<(String, Version)> {
            if let Some((name, digest)) = name.split_once('@') {
                let digest = Digest::from_str(digest)?;
                Ok((name.to_string(), Version::Digest(digest)))
            } else if let Some((name, tag)) = name.split_once(':') {
                Ok((name.to_string(), Version::Tag(tag.to_string())))
            } else {
                Ok((name.to_string(), Version::latest()))
            }
        }

        // The first segment is a registry host only when it could plausibly
        // resolve as one; otherwise the whole string is a repository on the
        // default registry. This recreates `docker pull` shorthand behavior.
        fn is_host(segment: &str) -> bool {
            segment.contains('.') || segment.contains(':') || segment == "localhost"
        }

        if s.is_empty() {
            return Err(Error::InvalidReference(s.to_string()));
        }

        let (host, rest) = match s.split_once('/') {
            Some((first, rest)) if is_host(first) => (first.to_string(), rest.to_string()),
            _ => (DEFAULT_REGISTRY.to_string(), s.to_string()),
        };

        let (repository, version) = parse_name(&rest)?;
        if repository.is_empty()
            || repository.split('/').any(str::is_empty)
            || version.to_string().is_empty()
        {
            return Err(Error::InvalidReference(s.to_string()));
        }

        // `docker pull ubuntu` means `docker.io/library/ubuntu`.
        let repository = if host == DEFAULT_REGISTRY && !repository.contains('/') {
            let expanded = format!("{DEFAULT_NAMESPACE}/{repository}");
            debug!("expanding {repository:?} to {expanded:?}");
            expanded
        } else {
            repository
        };

        Ok(Reference {
            host,
            repository,
            version,
        })
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.host, self.repository)?;
        match &self.version {
            Version::Tag(tag) => write!(f, ":{tag}"),
            Version::Digest(digest) => write!(f, "@{digest}"),
        }
    }
}

impl From<&Reference> for Reference {
    fn from(reference: &Reference) -> Self {
        reference.clone()
    }
}

/// Platform represents the platform a container image is built for.
/// This follows the OCI Image Spec's platform definition while also
/// supporting Docker's platform string format (e.g. "linux/amd64").
///
/// ```
/// # use stratum::Platform;
/// # use std::str::FromStr;
/// let platform = Platform::from_str("linux/amd64").expect("parse platform");
/// assert_eq!(platform.to_string(), "linux/amd64");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system the container runs on (e.g. "linux", "windows").
    ///
    /// Per the OCI spec, OS values must correspond with GOOS.
    #[builder(into)]
    pub os: String,

    /// CPU architecture (e.g. "amd64", "arm64").
    ///
    /// Per the OCI spec, architecture values must correspond with GOARCH.
    #[builder(into)]
    pub architecture: String,

    /// Variant of the CPU (e.g. "v7" for armv7).
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    /// Operating system version (e.g. "10.0.14393.1066" for windows).
    #[builder(into)]
    #[serde(default, rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    /// Additional CPU features required (e.g. "sse4").
    #[builder(into, default)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,

    /// Additional OS features required.
    ///
    /// Per the OCI spec, the only official feature is "win32k", and only then
    /// when the OS is "windows".
    #[builder(into, default)]
    #[serde(default, rename = "os.features", skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
}

impl Platform {
    /// Canonical name for the linux operating system.
    pub const LINUX: &'static str = "linux";

    /// Canonical name for the Windows operating system.
    pub const WINDOWS: &'static str = "windows";

    /// Canonical name for the AMD64 architecture.
    pub const AMD64: &'static str = "amd64";

    /// Canonical name for the ARM64 architecture.
    pub const ARM64: &'static str = "arm64";

    /// Clone the instance with the given variant.
    pub fn with_variant(self, variant: &str) -> Self {
        Self {
            variant: Some(variant.to_string()),
            ..self
        }
    }

    /// Create an instance for Linux AMD64
    pub fn linux_amd64() -> Self {
        Self::builder()
            .os(Self::LINUX)
            .architecture(Self::AMD64)
            .build()
    }

    /// Create an instance for Linux ARM64
    pub fn linux_arm64() -> Self {
        Self::builder()
            .os(Self::LINUX)
            .architecture(Self::ARM64)
            .build()
    }

    /// Create an instance for Windows AMD64
    pub fn windows_amd64() -> Self {
        Self::builder()
            .os(Self::WINDOWS)
            .architecture(Self::AMD64)
            .build()
    }

    /// The platform of the host this process is running on.
    pub fn host() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            os => os,
        };
        let architecture = match std::env::consts::ARCH {
            "x86_64" => Self::AMD64,
            "aarch64" => Self::ARM64,
            arch => arch,
        };
        Self::builder().os(os).architecture(architecture).build()
    }

    /// Fail with [`Error::InvalidPlatform`] when OS or architecture is empty.
    pub fn validate(&self) -> Result<()> {
        if self.os.is_empty() || self.architecture.is_empty() {
            return Err(Error::InvalidPlatform);
        }
        Ok(())
    }

    /// Whether a candidate platform satisfies this platform request.
    ///
    /// Variant and OS version constrain the match only when the request
    /// sets them.
    pub fn satisfies(&self, candidate: &Platform) -> bool {
        if self.os != candidate.os || self.architecture != candidate.architecture {
            return false;
        }
        if let Some(variant) = &self.variant {
            if candidate.variant.as_deref() != Some(variant.as_str()) {
                return false;
            }
        }
        if let Some(os_version) = &self.os_version {
            if candidate.os_version.as_deref() != Some(os_version.as_str()) {
                return false;
            }
        }
        true
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Docker platform strings are of the form: os/arch[/variant]
        let parts = s.split('/').collect::<Vec<_>>();
        if parts.iter().any(|part| part.is_empty()) {
            return Err(Error::InvalidPlatform);
        }

        match parts.as_slice() {
            [os, architecture] => Ok(Self::builder()
                .os(os.to_string())
                .architecture(architecture.to_string())
                .build()),
            [os, architecture, variant] => Ok(Self::builder()
                .os(os.to_string())
                .architecture(architecture.to_string())
                .variant(variant.to_string())
                .build()),
            _ => Err(Error::InvalidPlatform),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

impl From<&Platform> for Platform {
    fn from(platform: &Platform) -> Self {
        platform.clone()
    }
}

/// Free-form key/value annotations attached to OCI manifests and descriptors.
///
/// Stored ordered so serialized output is deterministic.
pub type Annotations = BTreeMap<String, String>;

/// Get the current home directory for the current user.
pub(crate) fn homedir() -> Result<PathBuf, std::env::VarError> {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
}
