use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::UploadResult;

/// Caller-supplied asset metadata; only the `path` key is touched by the engine
pub type AssetMetadata = serde_json::Map<String, serde_json::Value>;

/// Lazily produced upload events. Dropping the stream cancels the upload.
pub type EventStream = Pin<Box<dyn Stream<Item = UploadResult<UploadEvent>> + Send>>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new<S: Into<String>>(id: S) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Durable identifier of a validated blob
    BlobId
);
string_id!(
    /// Identifier of a Zarr store on the archive
    ZarrId
);
string_id!(
    /// Identifier of an open multipart upload session
    UploadId
);
string_id!(
    /// Identifier of an asset within a Dandiset version
    AssetId
);

/// Server-issued description of one chunk of a blob upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPart {
    pub part_number: u32,
    pub size: u64,
    /// Derived from the shared partitioning scheme when the server omits it
    #[serde(default)]
    pub offset: u64,
    pub upload_url: String,
}

/// An open multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub upload_id: UploadId,
    pub parts: Vec<UploadPart>,
    pub dandiset_id: String,
}

/// Part checksum returned by storage, echoed back on completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub size: u64,
    pub etag: String,
}

/// What an asset's content points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetBlobRef {
    Blob(BlobId),
    Zarr(ZarrId),
}

/// An asset that already exists and is being replaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingAsset {
    pub asset_id: AssetId,
    pub blob: AssetBlobRef,
}

/// Where an upload lands
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub dandiset_id: String,
    pub version: String,
    /// Path of the asset inside the Dandiset; written into the metadata
    pub asset_path: String,
    pub replacing: Option<ExistingAsset>,
}

impl UploadTarget {
    pub fn new<D: Into<String>, P: Into<String>>(dandiset_id: D, asset_path: P) -> Self {
        Self {
            dandiset_id: dandiset_id.into(),
            version: "draft".to_string(),
            asset_path: asset_path.into(),
            replacing: None,
        }
    }

    pub fn with_version<S: Into<String>>(mut self, version: S) -> Self {
        self.version = version.into();
        self
    }

    pub fn replacing(mut self, existing: ExistingAsset) -> Self {
        self.replacing = Some(existing);
        self
    }

    /// Metadata with `path` set to this target's asset path
    pub fn prepare_metadata(&self, mut metadata: AssetMetadata) -> AssetMetadata {
        metadata.insert(
            "path".to_string(),
            serde_json::Value::String(self.asset_path.clone()),
        );
        metadata
    }
}

/// Handle to an asset stored by the archive
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAsset {
    pub asset_id: AssetId,
    pub path: String,
    pub blob: AssetBlobRef,
    pub metadata: AssetMetadata,
}

/// Coarse stage of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPhase {
    Digesting,
    Initializing,
    /// The archive already holds identical content; nothing is transferred
    Deduplicated,
    Uploading,
    Completing,
    Validating,
    DeletingEntries { count: usize },
    Ingesting,
    ProducingAsset,
}

/// Cumulative transfer progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            self.uploaded_bytes as f64 / self.total_bytes as f64 * 100.0
        }
    }
}

/// Status record emitted by an upload
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Status(UploadPhase),
    Progress(UploadProgress),
    Done(RemoteAsset),
}

impl UploadEvent {
    pub fn progress(uploaded_bytes: u64, total_bytes: u64) -> Self {
        Self::Progress(UploadProgress {
            uploaded_bytes,
            total_bytes,
        })
    }
}
