use async_stream::try_stream;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::info;

use crate::{
    ArchiveApi, AssetBlobRef, AssetMetadata, BatchUploadCoordinator, CancellationRegistry,
    CreatedZarr, EntryUploadTracker, EventStream, ExistingAsset, IngestionWaiter, LocalEntry,
    RemoteEntry, TreeDiffer, TreeEntry, UploadConfig, UploadError, UploadEvent, UploadPhase,
    UploadTarget, ZarrId,
};

/// Synchronizes a local directory tree into a Zarr on the archive.
///
/// Only entries whose content differs from what the Zarr already holds are
/// sent, and remote entries with no local counterpart are removed. When
/// anything changed, the archive's recomputed checksum must match the local
/// tree before the asset is produced.
pub struct ZarrUploader {
    api: Arc<dyn ArchiveApi>,
    registry: Arc<CancellationRegistry>,
    config: UploadConfig,
}

impl ZarrUploader {
    pub fn new(api: Arc<dyn ArchiveApi>, registry: Arc<CancellationRegistry>, config: UploadConfig) -> Self {
        Self { api, registry, config }
    }

    pub fn upload(&self, root: Arc<LocalEntry>, metadata: AssetMetadata, target: UploadTarget) -> EventStream {
        let api = self.api.clone();
        let registry = self.registry.clone();
        let config = self.config.clone();

        Box::pin(try_stream! {
            if root.is_file() {
                Err::<(), UploadError>(UploadError::invalid(format!(
                    "{} is not a directory",
                    root.fs_path().display()
                )))?;
            }

            yield UploadEvent::Status(UploadPhase::Initializing);
            let (zarr_id, preexisting) = resolve_zarr(api.as_ref(), &target).await?;
            let remote = if preexisting {
                let files = api.list_zarr_files(&zarr_id).await?;
                info!(zarr_id = %zarr_id, files = files.len(), "Reusing existing Zarr");
                if files.is_empty() {
                    None
                } else {
                    Some(RemoteEntry::from_files(files)?)
                }
            } else {
                None
            };

            yield UploadEvent::Status(UploadPhase::Digesting);
            let diff = TreeDiffer::new(config.jobs).diff(&root, remote.as_ref()).await?;
            info!(
                zarr_id = %zarr_id,
                upload = diff.to_upload.len(),
                delete = diff.to_delete.len(),
                unchanged = diff.unchanged,
                "Compared local tree with Zarr"
            );

            let coordinator = BatchUploadCoordinator::new(api.clone(), registry.clone(), &config);
            let mut mutated = false;
            if !diff.to_delete.is_empty() {
                yield UploadEvent::Status(UploadPhase::DeletingEntries { count: diff.to_delete.len() });
                coordinator.delete_entries(&zarr_id, &diff.to_delete).await?;
                mutated = true;
            }

            let mut tracker = EntryUploadTracker::new(config.jobs);
            tracker.extend(diff.to_upload);
            if !tracker.is_empty() {
                mutated = true;
                yield UploadEvent::Status(UploadPhase::Uploading);
                let total = tracker.total_size();
                let mut events = coordinator.upload(zarr_id.clone(), tracker.into_items(), total);
                while let Some(event) = events.next().await {
                    yield event?;
                }
            }

            if mutated {
                yield UploadEvent::Status(UploadPhase::Ingesting);
                let report = IngestionWaiter::new(api.clone(), config.ingest_poll_interval)
                    .wait(&zarr_id)
                    .await?;
                let expected = root.digest().await?;
                let actual = report.checksum.unwrap_or_default();
                if actual != expected.value {
                    Err::<(), UploadError>(UploadError::integrity(
                        format!("Zarr {}", zarr_id),
                        expected.value,
                        actual,
                    ))?;
                }
            }

            yield UploadEvent::Status(UploadPhase::ProducingAsset);
            let blob = AssetBlobRef::Zarr(zarr_id);
            let metadata = target.prepare_metadata(metadata);
            let asset = match &target.replacing {
                Some(existing) => api.update_asset(&target, &existing.asset_id, &blob, &metadata).await?,
                None => api.create_asset(&target, &blob, &metadata).await?,
            };
            yield UploadEvent::Done(asset);
        })
    }
}

/// The Zarr to write into, and whether it already held data
async fn resolve_zarr(api: &dyn ArchiveApi, target: &UploadTarget) -> crate::UploadResult<(ZarrId, bool)> {
    if let Some(ExistingAsset {
        blob: AssetBlobRef::Zarr(zarr_id),
        ..
    }) = &target.replacing
    {
        return Ok((zarr_id.clone(), true));
    }
    match api.create_zarr(&target.asset_path, &target.dandiset_id).await? {
        CreatedZarr::Created(zarr_id) => Ok((zarr_id, false)),
        CreatedZarr::Existing(zarr_id) => Ok((zarr_id, true)),
    }
}
