//! Checkpoint artifact format.
//!
//! A checkpoint is stored and distributed as an ordinary image index so that
//! any registry able to hold images can hold it. What makes an index a
//! checkpoint is the presence of a descriptor with the container-info media
//! type.
//!
//! # Format
//!
//! ```text
//! {
//!   "schemaVersion": 2,
//!   "mediaType": "application/vnd.oci.image.index.v1+json",
//!   "annotations": { "io.berth.checkpoint.container": "web", ... },
//!   "manifests": [
//!     { "mediaType": "application/vnd.berth.container.info.v1+json", "digest": "sha256:..", "size": 812,
//!       "platform": { "os": "linux", "architecture": "amd64" } },
//!     { "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", ... },
//!     { "mediaType": "application/vnd.containerd.container.criu.checkpoint.criu.tar", ... }
//!   ]
//! }
//! ```
//!
//! Descriptors are kept in insertion order: container info first, then the
//! filesystem diff, then any live runtime checkpoint blobs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Index and manifest schema version.
pub const SCHEMA_VERSION: u32 = 2;

pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Serialized supervisor container record embedded in a checkpoint.
pub const MEDIA_TYPE_CONTAINER_INFO: &str = "application/vnd.berth.container.info.v1+json";

/// Process state captured by the runtime during a live checkpoint.
pub const MEDIA_TYPE_CHECKPOINT_CRIU: &str =
    "application/vnd.containerd.container.criu.checkpoint.criu.tar";

/// The runtime's own copy of the container config. Never placed in an index.
pub const MEDIA_TYPE_CHECKPOINT_CONFIG: &str =
    "application/vnd.containerd.container.checkpoint.config.v1+proto";

pub const ANNOTATION_CONTAINER_ID: &str = "io.berth.checkpoint.container";
pub const ANNOTATION_IMAGE: &str = "io.berth.checkpoint.image";
pub const ANNOTATION_LIVE: &str = "io.berth.checkpoint.live";
pub const ANNOTATION_NODE: &str = "io.berth.checkpoint.node";
pub const ANNOTATION_CREATED: &str = "org.opencontainers.image.created";

/// Prefix of content labels that keep referenced blobs alive during GC.
pub const GC_REF_CONTENT_PREFIX: &str = "containerd.io/gc.ref.content";

/// Format errors.
#[derive(Debug, Error)]
pub enum FormatError {
    /// Malformed JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema version other than 2.
    #[error("unsupported schema version: {0}")]
    UnsupportedSchemaVersion(u32),

    /// Digest not of the form `sha256:<64 hex>`.
    #[error("invalid digest '{0}'")]
    InvalidDigest(String),

    /// Index does not carry the container-info descriptor.
    #[error("index is not a checkpoint: missing container-info descriptor")]
    MissingContainerInfo,

    /// Content does not have the expected media type.
    #[error("unexpected media type: expected {expected}, got {actual}")]
    UnexpectedMediaType { expected: String, actual: String },
}

// ============================================================================
// Digests
// ============================================================================

/// Compute the canonical `sha256:` digest of some content.
pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Check that a digest is a well-formed sha256 digest.
pub fn validate_digest(digest: &str) -> Result<(), FormatError> {
    let Some(hex_part) = digest.strip_prefix("sha256:") else {
        return Err(FormatError::InvalidDigest(digest.to_string()));
    };

    if hex_part.len() != 64
        || !hex_part
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(FormatError::InvalidDigest(digest.to_string()));
    }

    Ok(())
}

// ============================================================================
// Descriptors
// ============================================================================

/// Target platform of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Platform {
    /// The platform this agent is running on.
    pub fn current() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: architecture.to_string(),
        }
    }
}

/// A content descriptor: what a blob is, where to find it, how big it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Describe a blob from its bytes.
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest_of(data),
            size: data.len() as u64,
            platform: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Attach a platform.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Check the bytes match this descriptor.
    pub fn verify(&self, data: &[u8]) -> Result<(), FormatError> {
        let actual = digest_of(data);
        if actual != self.digest {
            return Err(FormatError::InvalidDigest(actual));
        }
        Ok(())
    }
}

// ============================================================================
// Manifests
// ============================================================================

/// A single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: Some(MEDIA_TYPE_IMAGE_MANIFEST.to_string()),
            config,
            layers,
            annotations: BTreeMap::new(),
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, FormatError> {
        let manifest: Self = serde_json::from_slice(data)?;
        if manifest.schema_version != SCHEMA_VERSION {
            return Err(FormatError::UnsupportedSchemaVersion(manifest.schema_version));
        }
        Ok(manifest)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, FormatError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Config followed by layers.
    pub fn children(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }
}

// ============================================================================
// Checkpoint index
// ============================================================================

/// Image-index shaped manifest bundling the blobs of one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub manifests: Vec<Descriptor>,
}

impl Default for CheckpointIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: Some(MEDIA_TYPE_IMAGE_INDEX.to_string()),
            annotations: BTreeMap::new(),
            manifests: Vec::new(),
        }
    }

    /// Append a descriptor.
    pub fn push(&mut self, descriptor: Descriptor) {
        self.manifests.push(descriptor);
    }

    /// Set an annotation.
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(key.into(), value.into());
    }

    /// Parse any image index. Does not require it to be a checkpoint.
    pub fn from_slice(data: &[u8]) -> Result<Self, FormatError> {
        let index: Self = serde_json::from_slice(data)?;
        if index.schema_version != SCHEMA_VERSION {
            return Err(FormatError::UnsupportedSchemaVersion(index.schema_version));
        }
        for descriptor in &index.manifests {
            validate_digest(&descriptor.digest)?;
        }
        Ok(index)
    }

    /// Parse an index and require it to be a checkpoint.
    pub fn checkpoint_from_slice(data: &[u8]) -> Result<Self, FormatError> {
        let index = Self::from_slice(data)?;
        if !index.is_checkpoint() {
            return Err(FormatError::MissingContainerInfo);
        }
        Ok(index)
    }

    /// Serialize to JSON.
    pub fn to_vec(&self) -> Result<Vec<u8>, FormatError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Descriptor of this index document itself.
    pub fn descriptor(&self) -> Result<(Descriptor, Vec<u8>), FormatError> {
        let data = self.to_vec()?;
        Ok((Descriptor::for_bytes(MEDIA_TYPE_IMAGE_INDEX, &data), data))
    }

    /// Whether this index carries an embedded container record.
    pub fn is_checkpoint(&self) -> bool {
        self.container_info().is_some()
    }

    /// The serialized container record.
    pub fn container_info(&self) -> Option<&Descriptor> {
        self.find(MEDIA_TYPE_CONTAINER_INFO)
    }

    /// The filesystem-diff layer.
    pub fn diff_layer(&self) -> Option<&Descriptor> {
        self.find(MEDIA_TYPE_LAYER_GZIP)
    }

    /// Live runtime checkpoint blobs, if any.
    pub fn runtime_checkpoints(&self) -> impl Iterator<Item = &Descriptor> {
        self.manifests
            .iter()
            .filter(|d| d.media_type == MEDIA_TYPE_CHECKPOINT_CRIU)
    }

    /// Whether a live process checkpoint is included.
    pub fn is_live(&self) -> bool {
        self.runtime_checkpoints().next().is_some()
    }

    fn find(&self, media_type: &str) -> Option<&Descriptor> {
        self.manifests.iter().find(|d| d.media_type == media_type)
    }
}

/// Content labels that root every descriptor against garbage collection.
pub fn gc_labels<'a, I>(children: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a Descriptor>,
{
    children
        .into_iter()
        .enumerate()
        .map(|(i, d)| (format!("{GC_REF_CONTENT_PREFIX}.{i}"), d.digest.clone()))
        .collect()
}
