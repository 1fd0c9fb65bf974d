use async_stream::try_stream;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::etag::{compute_file_etag_blocking, md5_hex, LocalETag, PartGenerator};
use crate::{
    ArchiveApi, AssetBlobRef, AssetMetadata, CancellationRegistry, CompletedPart, EventStream,
    InitializeOutcome, LocalEntry, PendingSession, TreeEntry, UploadConfig, UploadError,
    UploadEvent, UploadPart, UploadPhase, UploadResult, UploadSession, UploadTarget,
};

/// Uploads a single file as a content-addressed blob through a multipart session
pub struct BlobUploader {
    api: Arc<dyn ArchiveApi>,
    registry: Arc<CancellationRegistry>,
    config: UploadConfig,
}

impl BlobUploader {
    pub fn new(api: Arc<dyn ArchiveApi>, registry: Arc<CancellationRegistry>, config: UploadConfig) -> Self {
        Self { api, registry, config }
    }

    /// Upload `entry` (a file) and attach it to `target`.
    ///
    /// The stream reports phases and per-part progress and ends with
    /// [`UploadEvent::Done`]. Content the archive already holds is not
    /// transferred again.
    pub fn upload(&self, entry: Arc<LocalEntry>, metadata: AssetMetadata, target: UploadTarget) -> EventStream {
        let api = self.api.clone();
        let registry = self.registry.clone();
        let jobs = self.config.jobs.max(1);
        let part_size = self.config.part_size;

        Box::pin(try_stream! {
            if !entry.is_file() {
                Err::<(), UploadError>(UploadError::invalid(format!(
                    "{} is not a file",
                    entry.fs_path().display()
                )))?;
            }
            let display_path = entry.fs_path().display().to_string();

            yield UploadEvent::Status(UploadPhase::Digesting);
            let local = compute_file_etag_blocking(entry.fs_path().to_path_buf(), part_size).await?;
            if local.generator != PartGenerator::with_part_size(entry.size(), part_size)? {
                Err::<(), UploadError>(UploadError::content_changed(display_path.clone()))?;
            }
            debug!(path = %display_path, etag = %local.digest.value, "Computed local ETag");

            yield UploadEvent::Status(UploadPhase::Initializing);
            let outcome = api.initialize_upload(&target.dandiset_id, entry.size(), &local.digest).await?;
            let blob_id = match outcome {
                InitializeOutcome::Existing(blob_id) => {
                    info!(path = %display_path, blob_id = %blob_id, "Content already stored, skipping transfer");
                    yield UploadEvent::Status(UploadPhase::Deduplicated);
                    blob_id
                }
                InitializeOutcome::Started(session) => {
                    let cancel = api.upload_cancellation(&session.upload_id);
                    registry.register(cancel.clone());
                    info!(
                        path = %display_path,
                        upload_id = %session.upload_id,
                        parts = session.parts.len(),
                        "Started multipart upload"
                    );

                    let planned = match plan_parts(&session, &local) {
                        Ok(planned) => planned,
                        Err(e) => Err(abandon_session(api.as_ref(), &registry, &cancel, e).await)?,
                    };
                    let file = match File::open(entry.fs_path()).await {
                        Ok(file) => Arc::new(Mutex::new(file)),
                        Err(e) => Err(abandon_session(api.as_ref(), &registry, &cancel, e.into()).await)?,
                    };

                    yield UploadEvent::Status(UploadPhase::Uploading);
                    let total = entry.size();
                    let mut uploaded = 0u64;
                    let mut completed = Vec::with_capacity(planned.len());
                    let mut pending = planned.into_iter();
                    let mut in_flight = FuturesUnordered::new();
                    let mut failure = None;
                    loop {
                        while in_flight.len() < jobs {
                            match pending.next() {
                                Some((part, md5)) => in_flight.push(send_part(
                                    api.clone(),
                                    file.clone(),
                                    part,
                                    md5,
                                    display_path.clone(),
                                )),
                                None => break,
                            }
                        }
                        match in_flight.next().await {
                            Some(Ok(part)) => {
                                uploaded += part.size;
                                completed.push(part);
                                yield UploadEvent::progress(uploaded, total);
                            }
                            Some(Err(e)) => {
                                failure = Some(e);
                                break;
                            }
                            None => break,
                        }
                    }
                    drop(in_flight);
                    if let Some(e) = failure {
                        Err::<(), UploadError>(abandon_session(api.as_ref(), &registry, &cancel, e).await)?;
                    }

                    yield UploadEvent::Status(UploadPhase::Completing);
                    completed.sort_by_key(|p| p.part_number);
                    if let Err(e) = finalize_session(api.as_ref(), &session, &completed, &local, &entry).await {
                        Err::<(), UploadError>(abandon_session(api.as_ref(), &registry, &cancel, e).await)?;
                    }

                    yield UploadEvent::Status(UploadPhase::Validating);
                    let blob_id = match api.validate_upload(&session.upload_id).await {
                        Ok(blob_id) => blob_id,
                        Err(e) => Err(abandon_session(api.as_ref(), &registry, &cancel, e).await)?,
                    };
                    registry.unregister(&cancel.session_id);
                    info!(path = %display_path, blob_id = %blob_id, "Blob validated");
                    blob_id
                }
            };

            yield UploadEvent::Status(UploadPhase::ProducingAsset);
            let blob = AssetBlobRef::Blob(blob_id);
            let metadata = target.prepare_metadata(metadata);
            let asset = match &target.replacing {
                Some(existing) => api.update_asset(&target, &existing.asset_id, &blob, &metadata).await?,
                None => api.create_asset(&target, &blob, &metadata).await?,
            };
            yield UploadEvent::Done(asset);
        })
    }
}

/// Check the server's part list against the local plan and pair each part
/// with its expected md5
fn plan_parts(session: &UploadSession, local: &LocalETag) -> UploadResult<Vec<(UploadPart, String)>> {
    let expected = local.generator.part_count() as usize;
    if session.parts.len() != expected {
        return Err(UploadError::protocol(format!(
            "server planned {} parts, expected {}",
            session.parts.len(),
            expected
        )));
    }
    let mut numbers: Vec<u32> = session.parts.iter().map(|part| part.part_number).collect();
    numbers.sort_unstable();
    if numbers.iter().zip(1u32..).any(|(number, wanted)| *number != wanted) {
        return Err(UploadError::protocol(format!(
            "server part numbers {:?} are not 1..={}",
            numbers, expected
        )));
    }

    session
        .parts
        .iter()
        .map(|part| {
            let plan = local.generator.part(part.part_number).ok_or_else(|| {
                UploadError::protocol(format!("server sent unknown part number {}", part.part_number))
            })?;
            if plan.size != part.size {
                return Err(UploadError::protocol(format!(
                    "part {} has size {} on the server, expected {}",
                    part.part_number, part.size, plan.size
                )));
            }
            let md5 = local
                .part_md5(part.part_number)
                .ok_or_else(|| UploadError::protocol(format!("no local digest for part {}", part.part_number)))?
                .to_string();
            Ok((
                UploadPart {
                    offset: plan.offset,
                    ..part.clone()
                },
                md5,
            ))
        })
        .collect()
}

async fn send_part(
    api: Arc<dyn ArchiveApi>,
    file: Arc<Mutex<File>>,
    part: UploadPart,
    expected_md5: String,
    display_path: String,
) -> UploadResult<CompletedPart> {
    let data = {
        let mut file = file.lock().await;
        file.seek(SeekFrom::Start(part.offset)).await?;
        let mut buf = vec![0u8; part.size as usize];
        match file.read_exact(&mut buf).await {
            Ok(_) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(UploadError::content_changed(display_path));
            }
            Err(e) => return Err(e.into()),
        }
    };

    let (data, actual_md5) = tokio::task::spawn_blocking(move || {
        let md5 = md5_hex(&data);
        (data, md5)
    })
    .await?;
    if actual_md5 != expected_md5 {
        return Err(UploadError::content_changed(display_path));
    }

    let etag = api.upload_part(&part, Bytes::from(data)).await?;
    if etag != actual_md5 {
        return Err(UploadError::integrity(
            format!("part {} of {}", part.part_number, display_path),
            actual_md5,
            etag,
        ));
    }
    debug!(part = part.part_number, size = part.size, "Uploaded part");
    Ok(CompletedPart {
        part_number: part.part_number,
        size: part.size,
        etag,
    })
}

async fn finalize_session(
    api: &dyn ArchiveApi,
    session: &UploadSession,
    parts: &[CompletedPart],
    local: &LocalETag,
    entry: &LocalEntry,
) -> UploadResult<()> {
    let completion = api.complete_upload(&session.upload_id, parts).await?;
    let final_etag = api.finalize_upload(&completion).await?;
    if final_etag != local.digest.value {
        return Err(UploadError::integrity(
            format!("completed upload {}", session.upload_id),
            local.digest.value.clone(),
            final_etag,
        ));
    }
    if entry.has_changed_on_disk().await? {
        return Err(UploadError::content_changed(entry.fs_path().display().to_string()));
    }
    Ok(())
}

/// Drop the session from the registry and ask the archive to cancel it
async fn abandon_session(
    api: &dyn ArchiveApi,
    registry: &CancellationRegistry,
    cancel: &PendingSession,
    error: UploadError,
) -> UploadError {
    registry.unregister(&cancel.session_id);
    if let Err(e) = api.cancel_session(cancel).await {
        warn!(session_id = %cancel.session_id, "Failed to cancel upload session: {}", e);
    }
    error
}
