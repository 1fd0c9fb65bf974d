//! # dandi-upload: client-side upload engine for the DANDI archive
//!
//! `dandi-upload` moves local data into a DANDI archive. A single file is
//! stored as a content-addressed blob through a multipart upload session; a
//! directory tree is synchronized into a Zarr store, sending only what
//! changed. Either way the result is attached to an asset in a Dandiset.
//!
//! ## Key Features
//!
//! - **Deduplication**: content the archive already holds is never sent twice
//! - **Parallel transfer**: parts and Zarr entries go through bounded worker pools
//! - **Incremental Zarr sync**: local and remote trees are diffed by checksum
//! - **Integrity checks**: every part, blob and Zarr is verified against local digests
//! - **Clean cancellation**: dropping an upload stream stops it; open sessions
//!   are tracked so they can be cancelled remotely on shutdown
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dandi_upload::prelude::*;
//! use futures::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() -> UploadResult<()> {
//! let client = HttpArchiveClient::from_env()?;
//! let uploader = ArchiveUploader::new(client, UploadConfig::from_env()?);
//!
//! let target = UploadTarget::new("000123", "sub-01/sub-01_ecephys.nwb");
//! let mut events = uploader.upload_path("data/sub-01.nwb", AssetMetadata::new(), target);
//! while let Some(event) = events.next().await {
//!     if let UploadEvent::Done(asset) = event? {
//!         println!("created asset {}", asset.asset_id);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             ArchiveUploader              │  ← dispatch on file / directory
//! ├──────────────────┬───────────────────────┤
//! │   BlobUploader   │     ZarrUploader      │  ← event streams
//! │                  │ TreeDiffer, Tracker,  │
//! │                  │ BatchUploadCoordinator│
//! ├──────────────────┴───────────────────────┤
//! │   ArchiveApi  (HttpArchiveClient)        │  ← remote protocol
//! └──────────────────────────────────────────┘
//! ```

mod api;
mod batch;
mod blob;
pub mod checksum;
mod config;
mod diff;
mod digest;
mod error;
pub mod etag;
mod http;
mod ingest;
mod registry;
mod tracker;
mod tree;
mod types;
mod uploader;
mod zarr;

// Re-export main types for clean API
pub use api::{
    ArchiveApi, CompletedUpload, CreatedZarr, IngestStatus, InitializeOutcome, RemoteFile,
    SignedEntryUrl, ZarrEntryUpload, ZarrStatusReport,
};
pub use batch::BatchUploadCoordinator;
pub use blob::BlobUploader;
pub use config::{RetryPolicy, UploadConfig, DEFAULT_ZARR_BATCH_SIZE};
pub use diff::{PendingEntry, TreeDiff, TreeDiffer};
pub use digest::{Digest, DigestRequest, DigestType};
pub use error::{UploadError, UploadResult};
pub use http::HttpArchiveClient;
pub use ingest::IngestionWaiter;
pub use registry::{CancellationRegistry, PendingSession};
pub use tracker::{EntryUploadTracker, UploadItem};
pub use tree::{LocalEntry, RemoteEntry, TreeEntry};
pub use types::{
    AssetBlobRef, AssetId, AssetMetadata, BlobId, CompletedPart, EventStream, ExistingAsset,
    RemoteAsset, UploadEvent, UploadId, UploadPart, UploadPhase, UploadProgress, UploadSession,
    UploadTarget, ZarrId,
};
pub use uploader::ArchiveUploader;
pub use zarr::ZarrUploader;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ArchiveApi, ArchiveUploader, AssetMetadata, CancellationRegistry, HttpArchiveClient,
        UploadConfig, UploadError, UploadEvent, UploadPhase, UploadResult, UploadTarget,
    };
}
