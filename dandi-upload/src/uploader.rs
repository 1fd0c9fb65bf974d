use async_stream::try_stream;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::{
    ArchiveApi, AssetMetadata, BlobUploader, CancellationRegistry, EventStream, LocalEntry,
    TreeEntry, UploadConfig, UploadTarget, ZarrUploader,
};

/// Entry point for uploading local content to the archive.
///
/// Files become blob-backed assets and directories become Zarr assets.
/// Open sessions are tracked in a [`CancellationRegistry`] (the process-wide
/// one unless another is supplied) so they can be cancelled on shutdown.
#[derive(Clone)]
pub struct ArchiveUploader {
    api: Arc<dyn ArchiveApi>,
    registry: Arc<CancellationRegistry>,
    config: UploadConfig,
}

impl ArchiveUploader {
    pub fn new<A: ArchiveApi + 'static>(api: A, config: UploadConfig) -> Self {
        Self::from_shared(Arc::new(api), config)
    }

    pub fn from_shared(api: Arc<dyn ArchiveApi>, config: UploadConfig) -> Self {
        Self {
            api,
            registry: CancellationRegistry::global(),
            config,
        }
    }

    /// Track sessions in `registry` instead of the process-wide one
    pub fn with_registry(mut self, registry: Arc<CancellationRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn api(&self) -> &Arc<dyn ArchiveApi> {
        &self.api
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn blobs(&self) -> BlobUploader {
        BlobUploader::new(self.api.clone(), self.registry.clone(), self.config.clone())
    }

    pub fn zarrs(&self) -> ZarrUploader {
        ZarrUploader::new(self.api.clone(), self.registry.clone(), self.config.clone())
    }

    /// Upload an already scanned entry
    pub fn upload(&self, entry: Arc<LocalEntry>, metadata: AssetMetadata, target: UploadTarget) -> EventStream {
        if entry.is_file() {
            self.blobs().upload(entry, metadata, target)
        } else {
            self.zarrs().upload(entry, metadata, target)
        }
    }

    /// Scan `path`, then upload it
    pub fn upload_path<P: Into<PathBuf>>(&self, path: P, metadata: AssetMetadata, target: UploadTarget) -> EventStream {
        let path = path.into();
        let uploader = self.clone();
        Box::pin(try_stream! {
            let entry = LocalEntry::scan(path).await?;
            let mut events = uploader.upload(entry, metadata, target);
            while let Some(event) = events.next().await {
                yield event?;
            }
        })
    }

    /// Cancel every session still open in this uploader's registry
    pub async fn cancel_pending(&self) -> usize {
        self.registry.drain_and_cancel_all(self.api.as_ref()).await
    }
}
