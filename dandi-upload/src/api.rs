use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    AssetBlobRef, AssetId, AssetMetadata, BlobId, CompletedPart, Digest, PendingSession,
    RemoteAsset, UploadId, UploadPart, UploadResult, UploadSession, UploadTarget, ZarrId,
};

/// Remote archive operations the upload engine depends on.
///
/// [`crate::HttpArchiveClient`] talks to a real archive; tests plug in an
/// in-memory implementation.
#[async_trait]
pub trait ArchiveApi: Send + Sync {
    /// Open a multipart session, or learn that identical content is already stored
    async fn initialize_upload(
        &self,
        dandiset_id: &str,
        content_size: u64,
        digest: &Digest,
    ) -> UploadResult<InitializeOutcome>;

    /// PUT one part to its presigned URL; returns the storage ETag (unquoted)
    async fn upload_part(&self, part: &UploadPart, data: Bytes) -> UploadResult<String>;

    async fn complete_upload(
        &self,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> UploadResult<CompletedUpload>;

    /// POST the completion body to storage; returns the whole-object ETag (unquoted)
    async fn finalize_upload(&self, completed: &CompletedUpload) -> UploadResult<String>;

    async fn validate_upload(&self, upload_id: &UploadId) -> UploadResult<BlobId>;

    /// How to cancel an open blob upload session
    fn upload_cancellation(&self, upload_id: &UploadId) -> PendingSession;

    /// Create a Zarr, or find the one already registered under that name
    async fn create_zarr(&self, name: &str, dandiset_id: &str) -> UploadResult<CreatedZarr>;

    async fn list_zarr_files(&self, zarr_id: &ZarrId) -> UploadResult<Vec<RemoteFile>>;

    /// Register a batch of entries; returns one presigned URL per entry
    async fn begin_zarr_batch(
        &self,
        zarr_id: &ZarrId,
        entries: &[ZarrEntryUpload],
    ) -> UploadResult<Vec<SignedEntryUrl>>;

    async fn upload_zarr_entry(&self, upload_url: &str, data: Bytes, md5_hex: &str) -> UploadResult<()>;

    async fn complete_zarr_batch(&self, zarr_id: &ZarrId) -> UploadResult<()>;

    async fn abort_zarr_batch(&self, zarr_id: &ZarrId) -> UploadResult<()>;

    /// How to cancel an in-flight Zarr batch
    fn zarr_batch_cancellation(&self, zarr_id: &ZarrId) -> PendingSession;

    async fn delete_zarr_files(&self, zarr_id: &ZarrId, paths: &[String]) -> UploadResult<()>;

    /// Start server-side checksum computation
    async fn ingest_zarr(&self, zarr_id: &ZarrId) -> UploadResult<()>;

    async fn zarr_status(&self, zarr_id: &ZarrId) -> UploadResult<ZarrStatusReport>;

    async fn create_asset(
        &self,
        target: &UploadTarget,
        blob: &AssetBlobRef,
        metadata: &AssetMetadata,
    ) -> UploadResult<RemoteAsset>;

    async fn update_asset(
        &self,
        target: &UploadTarget,
        asset_id: &AssetId,
        blob: &AssetBlobRef,
        metadata: &AssetMetadata,
    ) -> UploadResult<RemoteAsset>;

    /// Best-effort cancellation used by the registry
    async fn cancel_session(&self, session: &PendingSession) -> UploadResult<()>;
}

/// Result of asking the archive to start a blob upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitializeOutcome {
    Started(UploadSession),
    /// Content with the same digest is already stored
    Existing(BlobId),
}

/// Storage completion request handed back by the archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedUpload {
    pub complete_url: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreatedZarr {
    Created(ZarrId),
    /// A Zarr with that name already existed and is reused
    Existing(ZarrId),
}

impl CreatedZarr {
    pub fn zarr_id(&self) -> &ZarrId {
        match self {
            CreatedZarr::Created(id) | CreatedZarr::Existing(id) => id,
        }
    }
}

/// A file already stored in a Zarr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub size: u64,
    pub digest: Digest,
}

/// Entry registration item; `etag` is the md5 hex of the content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZarrEntryUpload {
    pub path: String,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntryUrl {
    pub path: String,
    pub upload_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum IngestStatus {
    Pending,
    Ingesting,
    Complete,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ZarrStatusReport {
    pub status: IngestStatus,
    #[serde(default)]
    pub checksum: Option<String>,
}
