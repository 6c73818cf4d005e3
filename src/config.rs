//! The image config file: platform record, rootfs, history, and the nested
//! runtime configuration consumed by `docker run`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Annotations, Digest, Platform, NORMALIZED_CREATED};

/// An image config file, shared between the OCI and Docker formats.
///
/// Spec reference: https://github.com/opencontainers/image-spec/blob/main/config.md
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Creation timestamp, RFC 3339. Overwritten with the configured
    /// timestamp at save time so builds are reproducible.
    #[serde(default = "default_created")]
    pub created: String,

    /// Name and/or email of the image author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// CPU architecture the image is built to run on (GOARCH values).
    pub architecture: String,

    /// Operating system the image is built to run on (GOOS values).
    pub os: String,

    /// OS version, meaningful mostly on Windows.
    #[serde(default, rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    /// Mandatory OS features (e.g. "win32k" on Windows).
    #[serde(default, rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,

    /// CPU architecture variant (e.g. "v7" for armv7).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    /// The runtime configuration.
    #[serde(default)]
    pub config: RuntimeConfig,

    /// Layer diff IDs, base layer first.
    pub rootfs: RootFs,

    /// One entry per layer, plus entries flagged `empty_layer` for
    /// config-only changes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,

    /// Daemon-reported field; cleared at save time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_version: Option<String>,

    /// Daemon-reported field; cleared at save time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

fn default_created() -> String {
    NORMALIZED_CREATED.to_string()
}

impl ConfigFile {
    /// Create a config file for the given platform with no layers.
    pub fn for_platform(platform: &Platform) -> Self {
        Self {
            created: default_created(),
            author: None,
            architecture: platform.architecture.clone(),
            os: platform.os.clone(),
            os_version: platform.os_version.clone(),
            os_features: if platform.os_features.is_empty() {
                None
            } else {
                Some(platform.os_features.clone())
            },
            variant: platform.variant.clone(),
            config: RuntimeConfig::default(),
            rootfs: RootFs::default(),
            history: Vec::new(),
            docker_version: None,
            container: None,
        }
    }

    /// The platform record of this config.
    pub fn platform(&self) -> Platform {
        Platform {
            os: self.os.clone(),
            architecture: self.architecture.clone(),
            variant: self.variant.clone(),
            os_version: self.os_version.clone(),
            features: Vec::new(),
            os_features: self.os_features.clone().unwrap_or_default(),
        }
    }

    /// Overwrite the platform fields from another config.
    pub fn apply_platform_of(&mut self, other: &ConfigFile) {
        self.os = other.os.clone();
        self.architecture = other.architecture.clone();
        self.variant = other.variant.clone();
        self.os_version = other.os_version.clone();
        self.os_features = other.os_features.clone();
    }

    /// Whether env keys compare case-insensitively on this config's OS.
    fn env_keys_fold_case(&self) -> bool {
        self.os == Platform::WINDOWS
    }

    /// Look up an environment variable. Last write wins.
    pub fn env(&self, key: &str) -> Option<String> {
        let fold = self.env_keys_fold_case();
        self.config
            .env
            .iter()
            .rev()
            .find_map(|entry| match entry.split_once('=') {
                Some((k, v)) if k == key => Some(v.to_string()),
                Some((k, v)) if fold && k.eq_ignore_ascii_case(key) => Some(v.to_string()),
                _ => None,
            })
    }

    /// Set an environment variable, replacing any existing entry for the key.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let fold = self.env_keys_fold_case();
        self.config.env.retain(|entry| {
            match entry.split_once('=') {
                Some((k, _)) => !(k == key || (fold && k.eq_ignore_ascii_case(key))),
                None => true,
            }
        });
        self.config.env.push(format!("{key}={value}"));
    }

    /// Look up a label.
    pub fn label(&self, key: &str) -> Option<String> {
        self.config
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key).cloned())
    }

    /// Set a label.
    pub fn set_label(&mut self, key: &str, value: &str) {
        self.config
            .labels
            .get_or_insert_with(Annotations::new)
            .insert(key.to_string(), value.to_string());
    }

    /// Resize the history to exactly `layers` entries.
    ///
    /// Extra entries are dropped from the front (oldest first); missing
    /// entries are filled with empty records.
    pub fn normalize_history(&mut self, layers: usize) {
        if self.history.len() > layers {
            let excess = self.history.len() - layers;
            self.history.drain(..excess);
        }
        while self.history.len() < layers {
            self.history.push(History::default());
        }
    }
}

/// The runtime configuration nested inside a config file.
///
/// Field names are PascalCase on the wire for Docker compatibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeConfig {
    /// The user (or uid[:gid]) processes run as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Ports the image expects to expose, as `port[/proto]` keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,

    /// Environment entries in `KEY=VALUE` form. Last write wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// The entrypoint command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    /// Default arguments to the entrypoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    /// The working directory processes start in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Arbitrary image labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Annotations>,
}

/// The rootfs record: the ordered diff IDs of the image's layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Always "layers".
    #[serde(rename = "type")]
    pub kind: String,

    /// Diff IDs (digests of the uncompressed layer tars), base first.
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            kind: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// One history record, describing how a layer (or config edit) came to be.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    /// Creation timestamp, RFC 3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    /// The command that created the layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    /// The author of the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Free-form comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// True when the entry does not correspond to a layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}
