//! Typed errors shared across the crate.

use itertools::Itertools;

use crate::{mediatype::MediaType, Digest};

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by image and index operations.
///
/// Variants group into the broad kinds callers dispatch on:
/// caller errors (`Invalid*`, `Undefined*`), missing content (`NoSuch*`,
/// `*NotFound`), transport failures (`Io`, `Transport`), protocol surprises
/// (`UnknownMediaType`, `Serde`), and state errors (`IndexNeedsSave`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The digest is not present in the index or image being queried.
    #[error("no image or manifest with digest {0}")]
    NoSuchDigest(Digest),

    /// The requested field is not defined for the media type of the child.
    #[error("{field} is undefined for media type {media_type} (digest {digest})")]
    UndefinedField {
        /// Name of the field that was requested.
        field: &'static str,

        /// Media type of the child manifest the field was requested from.
        media_type: MediaType,

        /// Digest of the child manifest.
        digest: Digest,
    },

    /// The media type string is not one this crate understands.
    #[error("unknown media type: {0}")]
    UnknownMediaType(String),

    /// The platform is missing its OS or architecture.
    #[error("platform must declare both os and architecture")]
    InvalidPlatform,

    /// The rebase anchor diff ID was not found in the image's layer stack.
    #[error("rebase anchor {0} not found in layer stack")]
    AnchorNotFound(Digest),

    /// The image has no layers.
    #[error("image has no layers")]
    NoLayers,

    /// The operation requires a previous image and none was provided.
    #[error("no previous image configured")]
    NoPreviousImage,

    /// The diff ID was not found in the previous image's layer pool.
    #[error("diff id {0} not found in previous image")]
    DiffIdNotFound(Digest),

    /// The layer's bytes are not available from any source.
    #[error("layer {0} has no retrievable content")]
    LayerNotFound(Digest),

    /// The index has pending changes that must be saved before pushing.
    #[error("index has pending changes; save before pushing")]
    IndexNeedsSave,

    /// The image or index has no manifest.
    #[error("manifest undefined")]
    ManifestUndefined,

    /// The image has no config file blob.
    #[error("config file undefined")]
    ConfigFileUndefined,

    /// The descriptor carries no platform record.
    #[error("platform undefined for digest {0}")]
    PlatformUndefined(Digest),

    /// The digest string failed to parse.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// The reference string failed to parse.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// A base image's format does not match the image it is spliced into.
    #[error("media type mismatch: expected the {expected} family, got {actual}")]
    MediaTypeMismatch {
        /// The manifest media type of the image being mutated.
        expected: MediaType,

        /// The manifest media type of the incoming image.
        actual: MediaType,
    },

    /// The computed digest of a blob does not match the expected digest.
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch {
        /// The digest the content was addressed by.
        expected: Digest,

        /// The digest computed from the actual bytes.
        actual: Digest,
    },

    /// The daemon did not report the image after a load completed.
    #[error("daemon did not report image {0} after load")]
    ImageNotLoaded(String),

    /// A malformed manifest, config, or index on the wire.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Transport failure in a backend client.
    #[error("transport: {0}")]
    Transport(String),

    /// Filesystem or stream failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wire (de)serialization failure.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Create a transport error from any displayable cause.
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        Self::Transport(cause.to_string())
    }
}

/// Aggregate error for saves that target multiple names.
///
/// Each entry pairs the target name with the error raised for it.
/// Targets that are absent from the list were committed successfully.
#[derive(Debug, thiserror::Error)]
#[error("save failed for {} target(s): {}", errors.len(), summarize(errors))]
pub struct SaveError {
    /// Per-target failures, in target order.
    pub errors: Vec<(String, Error)>,
}

impl SaveError {
    /// Wrap a single failure for a single target.
    pub fn single(name: impl Into<String>, error: Error) -> Self {
        Self {
            errors: vec![(name.into(), error)],
        }
    }
}

fn summarize(errors: &[(String, Error)]) -> String {
    errors
        .iter()
        .map(|(name, error)| format!("{name}: {error}"))
        .join("; ")
}
