use async_stream::try_stream;
use bytes::Bytes;
use futures::stream::{BoxStream, FuturesUnordered, StreamExt, TryChunksError, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::etag::md5_hex;
use crate::{
    ArchiveApi, CancellationRegistry, EventStream, UploadConfig, UploadError, UploadEvent,
    UploadItem, UploadResult, ZarrEntryUpload, ZarrId,
};

/// Sends Zarr entries in sequential batches, each transferred through a
/// bounded pool of PUTs
pub struct BatchUploadCoordinator {
    api: Arc<dyn ArchiveApi>,
    registry: Arc<CancellationRegistry>,
    batch_size: usize,
    jobs: usize,
}

impl BatchUploadCoordinator {
    pub fn new(api: Arc<dyn ArchiveApi>, registry: Arc<CancellationRegistry>, config: &UploadConfig) -> Self {
        Self {
            api,
            registry,
            batch_size: config.zarr_batch_size.max(1),
            jobs: config.jobs.max(1),
        }
    }

    /// Delete remote entries in batches; returns how many paths were removed
    #[instrument(skip(self, paths), fields(count = paths.len()))]
    pub async fn delete_entries(&self, zarr_id: &ZarrId, paths: &[String]) -> UploadResult<usize> {
        for chunk in paths.chunks(self.batch_size) {
            debug!(zarr_id = %zarr_id, batch = chunk.len(), "Deleting Zarr entries");
            self.api.delete_zarr_files(zarr_id, chunk).await?;
        }
        Ok(paths.len())
    }

    /// Upload every item, yielding a progress event after each entry lands.
    ///
    /// A failed entry cancels the rest of its batch, aborts the batch remotely
    /// and ends the stream with that error.
    pub fn upload(
        &self,
        zarr_id: ZarrId,
        items: BoxStream<'static, UploadResult<UploadItem>>,
        total_size: u64,
    ) -> EventStream {
        let api = self.api.clone();
        let registry = self.registry.clone();
        let batch_size = self.batch_size;
        let jobs = self.jobs;

        Box::pin(try_stream! {
            let mut batches = items
                .try_chunks(batch_size)
                .map_err(|TryChunksError(_, e)| e);
            let mut uploaded = 0u64;
            let mut batch_number = 0usize;

            while let Some(batch) = batches.next().await {
                let batch = batch?;
                batch_number += 1;
                info!(zarr_id = %zarr_id, batch = batch_number, entries = batch.len(), "Starting Zarr batch");

                let requests: Vec<ZarrEntryUpload> = batch
                    .iter()
                    .map(|item| ZarrEntryUpload {
                        path: item.path.clone(),
                        etag: item.digest.value.clone(),
                    })
                    .collect();
                let signed = api.begin_zarr_batch(&zarr_id, &requests).await?;

                let session = api.zarr_batch_cancellation(&zarr_id);
                let session_id = session.session_id.clone();
                registry.register(session);

                let work = match pair_urls(batch, signed) {
                    Ok(work) => work,
                    Err(e) => {
                        abandon_batch(api.as_ref(), &registry, &zarr_id, &session_id).await;
                        Err(e)?
                    }
                };

                let mut pending = work.into_iter();
                let mut in_flight = FuturesUnordered::new();
                let mut failure = None;
                loop {
                    while in_flight.len() < jobs {
                        match pending.next() {
                            Some((item, url)) => in_flight.push(put_entry(api.clone(), item, url)),
                            None => break,
                        }
                    }
                    match in_flight.next().await {
                        Some(Ok(size)) => {
                            uploaded += size;
                            yield UploadEvent::progress(uploaded, total_size);
                        }
                        Some(Err(e)) => {
                            failure = Some(e);
                            break;
                        }
                        None => break,
                    }
                }
                // Cancel siblings before touching the remote batch
                drop(in_flight);

                let outcome = match failure {
                    Some(e) => Err(e),
                    None => api.complete_zarr_batch(&zarr_id).await,
                };
                if let Err(e) = outcome {
                    abandon_batch(api.as_ref(), &registry, &zarr_id, &session_id).await;
                    Err::<(), UploadError>(e)?;
                }
                registry.unregister(&session_id);
                debug!(zarr_id = %zarr_id, batch = batch_number, "Completed Zarr batch");
            }
        })
    }
}

fn pair_urls(
    batch: Vec<UploadItem>,
    signed: Vec<crate::SignedEntryUrl>,
) -> UploadResult<Vec<(UploadItem, String)>> {
    if signed.len() != batch.len() {
        return Err(UploadError::protocol(format!(
            "requested {} upload URLs, got {}",
            batch.len(),
            signed.len()
        )));
    }
    let mut urls: HashMap<String, String> = signed.into_iter().map(|s| (s.path, s.upload_url)).collect();
    batch
        .into_iter()
        .map(|item| match urls.remove(&item.path) {
            Some(url) => Ok((item, url)),
            None => Err(UploadError::protocol(format!("no upload URL for {}", item.path))),
        })
        .collect()
}

async fn put_entry(api: Arc<dyn ArchiveApi>, item: UploadItem, url: String) -> UploadResult<u64> {
    let data = tokio::fs::read(item.entry.fs_path()).await?;
    if md5_hex(&data) != item.digest.value {
        return Err(UploadError::content_changed(item.entry.fs_path().display().to_string()));
    }
    let size = data.len() as u64;
    api.upload_zarr_entry(&url, Bytes::from(data), &item.digest.value).await?;
    debug!(path = %item.path, size, "Uploaded Zarr entry");
    Ok(size)
}

async fn abandon_batch(api: &dyn ArchiveApi, registry: &CancellationRegistry, zarr_id: &ZarrId, session_id: &str) {
    registry.unregister(session_id);
    if let Err(e) = api.abort_zarr_batch(zarr_id).await {
        warn!(zarr_id = %zarr_id, "Failed to abort Zarr batch: {}", e);
    }
}
