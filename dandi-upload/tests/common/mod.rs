#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dandi_upload::checksum::ZarrChecksumTree;
use dandi_upload::etag::{md5_hex, ETagHasher, PartGenerator};
use dandi_upload::{
    ArchiveApi, ArchiveUploader, AssetBlobRef, AssetId, AssetMetadata, BlobId, CancellationRegistry,
    CompletedPart, CompletedUpload, CreatedZarr, Digest, EventStream, IngestStatus,
    InitializeOutcome, PendingSession, RemoteAsset, RemoteFile, SignedEntryUrl, UploadConfig,
    UploadError, UploadEvent, UploadId, UploadPart, UploadResult, UploadSession, UploadTarget,
    ZarrEntryUpload, ZarrId, ZarrStatusReport,
};

/// Part size small enough to make multi-part uploads out of tiny files
pub const TEST_PART_SIZE: u64 = 16;

/// How many times each operation was invoked
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Calls {
    pub initialize: usize,
    pub part_puts: usize,
    pub complete: usize,
    pub validate: usize,
    pub create_zarr: usize,
    pub begin_batch: usize,
    pub entry_puts: usize,
    pub complete_batch: usize,
    pub abort_batch: usize,
    pub delete_files: usize,
    pub ingest: usize,
    pub status_polls: usize,
    pub create_asset: usize,
    pub update_asset: usize,
    pub cancel: usize,
}

/// Protocol step after which a local file gets rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteAt {
    Initialize,
    Complete,
    BeginBatch,
}

struct Rewrite {
    at: RewriteAt,
    path: PathBuf,
    content: Vec<u8>,
}

struct OpenUpload {
    digest: Digest,
    size: u64,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Default)]
struct ZarrState {
    files: BTreeMap<String, Vec<u8>>,
    batch: Option<Vec<ZarrEntryUpload>>,
    staged: BTreeMap<String, Vec<u8>>,
    polls_left: u32,
}

#[derive(Default)]
struct State {
    calls: Calls,
    blobs: HashMap<String, BlobId>,
    uploads: HashMap<String, OpenUpload>,
    zarrs: BTreeMap<String, ZarrState>,
    zarr_names: HashMap<(String, String), ZarrId>,
    assets: BTreeMap<String, RemoteAsset>,
    cancelled: Vec<String>,
    next_id: u32,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// In-memory archive that follows the remote protocol closely enough to
/// exercise the upload engine end to end
pub struct MemoryArchive {
    part_size: u64,
    state: Mutex<State>,
    failing_entry: Mutex<Option<String>>,
    corrupt_part_etags: Mutex<bool>,
    failing_cancels: Mutex<bool>,
    ingest_polls: Mutex<u32>,
    rewrite: Mutex<Option<Rewrite>>,
}

impl MemoryArchive {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            part_size: TEST_PART_SIZE,
            state: Mutex::new(State::default()),
            failing_entry: Mutex::new(None),
            corrupt_part_etags: Mutex::new(false),
            failing_cancels: Mutex::new(false),
            ingest_polls: Mutex::new(1),
            rewrite: Mutex::new(None),
        })
    }

    /// PUTs of this Zarr entry fail with a server error
    pub fn fail_entry(&self, path: &str) {
        *self.failing_entry.lock().unwrap() = Some(path.to_string());
    }

    /// Storage reports a wrong ETag for every part
    pub fn corrupt_part_etags(&self) {
        *self.corrupt_part_etags.lock().unwrap() = true;
    }

    pub fn fail_cancels(&self) {
        *self.failing_cancels.lock().unwrap() = true;
    }

    /// Status polls answered with `Ingesting` before `Complete`
    pub fn set_ingest_polls(&self, polls: u32) {
        *self.ingest_polls.lock().unwrap() = polls;
    }

    /// Overwrite a local file once `at` has been handled, simulating a
    /// concurrent writer
    pub fn rewrite_file_at(&self, at: RewriteAt, path: impl Into<PathBuf>, content: &[u8]) {
        *self.rewrite.lock().unwrap() = Some(Rewrite {
            at,
            path: path.into(),
            content: content.to_vec(),
        });
    }

    fn apply_rewrite(&self, at: RewriteAt) {
        let mut rewrite = self.rewrite.lock().unwrap();
        if rewrite.as_ref().is_some_and(|r| r.at == at) {
            if let Some(r) = rewrite.take() {
                std::fs::write(&r.path, &r.content).unwrap();
            }
        }
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn open_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    /// Stored files of a Zarr, path to content
    pub fn zarr_files(&self, zarr_id: &ZarrId) -> BTreeMap<String, Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .zarrs
            .get(zarr_id.as_str())
            .map(|z| z.files.clone())
            .unwrap_or_default()
    }

    /// Put a file straight into a Zarr, bypassing the upload protocol
    pub fn seed_zarr_file(&self, zarr_id: &ZarrId, path: &str, content: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state
            .zarrs
            .entry(zarr_id.as_str().to_string())
            .or_default()
            .files
            .insert(path.to_string(), content.to_vec());
    }

    pub fn asset(&self, asset_id: &AssetId) -> Option<RemoteAsset> {
        self.state.lock().unwrap().assets.get(asset_id.as_str()).cloned()
    }

    fn zarr_checksum(files: &BTreeMap<String, Vec<u8>>) -> String {
        let mut tree = ZarrChecksumTree::new();
        for (path, content) in files {
            tree.add_file(path, &md5_hex(content), content.len() as u64);
        }
        tree.checksum().to_string()
    }

    fn store_asset(
        &self,
        asset_id: Option<&AssetId>,
        target: &UploadTarget,
        blob: &AssetBlobRef,
        metadata: &AssetMetadata,
    ) -> RemoteAsset {
        let mut state = self.state.lock().unwrap();
        let asset_id = match asset_id {
            Some(id) => id.clone(),
            None => AssetId::new(state.next_id("asset")),
        };
        let asset = RemoteAsset {
            asset_id: asset_id.clone(),
            path: target.asset_path.clone(),
            blob: blob.clone(),
            metadata: metadata.clone(),
        };
        state.assets.insert(asset_id.as_str().to_string(), asset.clone());
        asset
    }
}

fn segment_after<'a>(url: &'a str, prefix: &str) -> UploadResult<&'a str> {
    url.strip_prefix(prefix)
        .ok_or_else(|| UploadError::invalid(format!("unexpected URL {}", url)))
}

#[async_trait]
impl ArchiveApi for MemoryArchive {
    async fn initialize_upload(
        &self,
        dandiset_id: &str,
        content_size: u64,
        digest: &Digest,
    ) -> UploadResult<InitializeOutcome> {
        self.apply_rewrite(RewriteAt::Initialize);
        let mut state = self.state.lock().unwrap();
        state.calls.initialize += 1;
        if let Some(blob_id) = state.blobs.get(&digest.value) {
            return Ok(InitializeOutcome::Existing(blob_id.clone()));
        }

        let upload_id = state.next_id("upload");
        let generator = PartGenerator::with_part_size(content_size, self.part_size)?;
        let parts = generator
            .parts()
            .map(|part| UploadPart {
                part_number: part.number,
                size: part.size,
                offset: 0,
                upload_url: format!("mem://parts/{}/{}", upload_id, part.number),
            })
            .collect();
        state.uploads.insert(
            upload_id.clone(),
            OpenUpload {
                digest: digest.clone(),
                size: content_size,
                parts: BTreeMap::new(),
            },
        );
        Ok(InitializeOutcome::Started(UploadSession {
            upload_id: UploadId::new(upload_id),
            parts,
            dandiset_id: dandiset_id.to_string(),
        }))
    }

    async fn upload_part(&self, part: &UploadPart, data: Bytes) -> UploadResult<String> {
        let rest = segment_after(&part.upload_url, "mem://parts/")?;
        let upload_id = rest.split('/').next().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        state.calls.part_puts += 1;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| UploadError::api(404, "no such upload"))?;
        upload.parts.insert(part.part_number, data.to_vec());
        if *self.corrupt_part_etags.lock().unwrap() {
            return Ok("0123456789abcdef0123456789abcdef".to_string());
        }
        Ok(md5_hex(&data))
    }

    async fn complete_upload(
        &self,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> UploadResult<CompletedUpload> {
        self.apply_rewrite(RewriteAt::Complete);
        let mut state = self.state.lock().unwrap();
        state.calls.complete += 1;
        if !state.uploads.contains_key(upload_id.as_str()) {
            return Err(UploadError::api(404, "no such upload"));
        }
        Ok(CompletedUpload {
            complete_url: format!("mem://complete/{}", upload_id),
            body: serde_json::to_string(parts)?,
        })
    }

    async fn finalize_upload(&self, completed: &CompletedUpload) -> UploadResult<String> {
        let upload_id = segment_after(&completed.complete_url, "mem://complete/")?;
        let state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| UploadError::api(404, "no such upload"))?;
        let mut hasher = ETagHasher::new();
        for data in upload.parts.values() {
            hasher.update(data);
        }
        Ok(hasher.finalize().value)
    }

    async fn validate_upload(&self, upload_id: &UploadId) -> UploadResult<BlobId> {
        let mut state = self.state.lock().unwrap();
        state.calls.validate += 1;
        let upload = state
            .uploads
            .remove(upload_id.as_str())
            .ok_or_else(|| UploadError::api(404, "no such upload"))?;
        let stored: u64 = upload.parts.values().map(|p| p.len() as u64).sum();
        if stored != upload.size {
            return Err(UploadError::api(400, "size mismatch"));
        }
        let blob_id = BlobId::new(state.next_id("blob"));
        state.blobs.insert(upload.digest.value, blob_id.clone());
        Ok(blob_id)
    }

    fn upload_cancellation(&self, upload_id: &UploadId) -> PendingSession {
        PendingSession {
            session_id: upload_id.as_str().to_string(),
            cancel_url: format!("mem://uploads/{}/", upload_id),
            auth_token: None,
        }
    }

    async fn create_zarr(&self, name: &str, dandiset_id: &str) -> UploadResult<CreatedZarr> {
        let mut state = self.state.lock().unwrap();
        state.calls.create_zarr += 1;
        let key = (dandiset_id.to_string(), name.to_string());
        if let Some(zarr_id) = state.zarr_names.get(&key) {
            return Ok(CreatedZarr::Existing(zarr_id.clone()));
        }
        let zarr_id = ZarrId::new(state.next_id("zarr"));
        state.zarr_names.insert(key, zarr_id.clone());
        state.zarrs.entry(zarr_id.as_str().to_string()).or_default();
        Ok(CreatedZarr::Created(zarr_id))
    }

    async fn list_zarr_files(&self, zarr_id: &ZarrId) -> UploadResult<Vec<RemoteFile>> {
        Ok(self
            .zarr_files(zarr_id)
            .into_iter()
            .map(|(path, content)| RemoteFile {
                path,
                size: content.len() as u64,
                digest: Digest::md5(md5_hex(&content)),
            })
            .collect())
    }

    async fn begin_zarr_batch(
        &self,
        zarr_id: &ZarrId,
        entries: &[ZarrEntryUpload],
    ) -> UploadResult<Vec<SignedEntryUrl>> {
        self.apply_rewrite(RewriteAt::BeginBatch);
        let mut state = self.state.lock().unwrap();
        state.calls.begin_batch += 1;
        let zarr = state
            .zarrs
            .get_mut(zarr_id.as_str())
            .ok_or_else(|| UploadError::api(404, "no such zarr"))?;
        if zarr.batch.is_some() {
            return Err(UploadError::api(400, "upload already in progress"));
        }
        zarr.batch = Some(entries.to_vec());
        Ok(entries
            .iter()
            .map(|entry| SignedEntryUrl {
                path: entry.path.clone(),
                upload_url: format!("mem://zarr/{}/{}", zarr_id, entry.path),
            })
            .collect())
    }

    async fn upload_zarr_entry(&self, upload_url: &str, data: Bytes, md5_hex_value: &str) -> UploadResult<()> {
        let rest = segment_after(upload_url, "mem://zarr/")?;
        let (zarr_id, path) = rest
            .split_once('/')
            .ok_or_else(|| UploadError::invalid(format!("unexpected URL {}", upload_url)))?;

        // Give sibling PUTs a chance to be in flight when one fails
        tokio::time::sleep(Duration::from_millis(1)).await;

        let mut state = self.state.lock().unwrap();
        state.calls.entry_puts += 1;
        if self.failing_entry.lock().unwrap().as_deref() == Some(path) {
            return Err(UploadError::api(500, "injected failure"));
        }
        if md5_hex(&data) != md5_hex_value {
            return Err(UploadError::api(400, "Content-MD5 mismatch"));
        }
        let zarr = state
            .zarrs
            .get_mut(zarr_id)
            .ok_or_else(|| UploadError::api(404, "no such zarr"))?;
        zarr.staged.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn complete_zarr_batch(&self, zarr_id: &ZarrId) -> UploadResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.complete_batch += 1;
        let zarr = state
            .zarrs
            .get_mut(zarr_id.as_str())
            .ok_or_else(|| UploadError::api(404, "no such zarr"))?;
        let batch = zarr
            .batch
            .take()
            .ok_or_else(|| UploadError::api(400, "no upload in progress"))?;
        for entry in batch {
            let data = zarr
                .staged
                .remove(&entry.path)
                .ok_or_else(|| UploadError::api(400, format!("{} was never uploaded", entry.path)))?;
            zarr.files.insert(entry.path, data);
        }
        Ok(())
    }

    async fn abort_zarr_batch(&self, zarr_id: &ZarrId) -> UploadResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.abort_batch += 1;
        if let Some(zarr) = state.zarrs.get_mut(zarr_id.as_str()) {
            zarr.batch = None;
            zarr.staged.clear();
        }
        Ok(())
    }

    fn zarr_batch_cancellation(&self, zarr_id: &ZarrId) -> PendingSession {
        PendingSession {
            session_id: format!("zarr-batch-{}", zarr_id),
            cancel_url: format!("mem://zarr/{}/upload/", zarr_id),
            auth_token: None,
        }
    }

    async fn delete_zarr_files(&self, zarr_id: &ZarrId, paths: &[String]) -> UploadResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.delete_files += 1;
        let zarr = state
            .zarrs
            .get_mut(zarr_id.as_str())
            .ok_or_else(|| UploadError::api(404, "no such zarr"))?;
        for path in paths {
            zarr.files.remove(path);
        }
        Ok(())
    }

    async fn ingest_zarr(&self, zarr_id: &ZarrId) -> UploadResult<()> {
        let polls = *self.ingest_polls.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        state.calls.ingest += 1;
        let zarr = state
            .zarrs
            .get_mut(zarr_id.as_str())
            .ok_or_else(|| UploadError::api(404, "no such zarr"))?;
        zarr.polls_left = polls;
        Ok(())
    }

    async fn zarr_status(&self, zarr_id: &ZarrId) -> UploadResult<ZarrStatusReport> {
        let mut state = self.state.lock().unwrap();
        state.calls.status_polls += 1;
        let zarr = state
            .zarrs
            .get_mut(zarr_id.as_str())
            .ok_or_else(|| UploadError::api(404, "no such zarr"))?;
        if zarr.polls_left > 0 {
            zarr.polls_left -= 1;
            return Ok(ZarrStatusReport {
                status: IngestStatus::Ingesting,
                checksum: None,
            });
        }
        Ok(ZarrStatusReport {
            status: IngestStatus::Complete,
            checksum: Some(Self::zarr_checksum(&zarr.files)),
        })
    }

    async fn create_asset(
        &self,
        target: &UploadTarget,
        blob: &AssetBlobRef,
        metadata: &AssetMetadata,
    ) -> UploadResult<RemoteAsset> {
        self.state.lock().unwrap().calls.create_asset += 1;
        Ok(self.store_asset(None, target, blob, metadata))
    }

    async fn update_asset(
        &self,
        target: &UploadTarget,
        asset_id: &AssetId,
        blob: &AssetBlobRef,
        metadata: &AssetMetadata,
    ) -> UploadResult<RemoteAsset> {
        self.state.lock().unwrap().calls.update_asset += 1;
        Ok(self.store_asset(Some(asset_id), target, blob, metadata))
    }

    async fn cancel_session(&self, session: &PendingSession) -> UploadResult<()> {
        let failing = *self.failing_cancels.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        state.calls.cancel += 1;
        if failing {
            return Err(UploadError::api(503, "cancel unavailable"));
        }
        state.uploads.remove(&session.session_id);
        state.cancelled.push(session.session_id.clone());
        Ok(())
    }
}

/// Config with tiny parts and no ingestion wait
pub fn test_config() -> UploadConfig {
    UploadConfig::default()
        .with_part_size(TEST_PART_SIZE)
        .with_jobs(3)
        .with_ingest_poll_interval(Duration::from_millis(1))
}

/// Uploader over `archive` with its own registry
pub fn uploader(archive: &Arc<MemoryArchive>, config: UploadConfig) -> ArchiveUploader {
    let api: Arc<dyn ArchiveApi> = archive.clone();
    ArchiveUploader::from_shared(api, config).with_registry(Arc::new(CancellationRegistry::new()))
}

/// Drain a stream, returning the events seen and the error that ended it, if any
pub async fn collect(mut events: EventStream) -> (Vec<UploadEvent>, Option<UploadError>) {
    let mut seen = Vec::new();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => seen.push(event),
            Err(e) => return (seen, Some(e)),
        }
    }
    (seen, None)
}

pub fn done_asset(events: &[UploadEvent]) -> Option<&RemoteAsset> {
    events.iter().find_map(|e| match e {
        UploadEvent::Done(asset) => Some(asset),
        _ => None,
    })
}

pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (path, content) in files {
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, content).unwrap();
    }
}
