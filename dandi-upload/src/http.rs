use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::header::{HeaderMap, ETAG, LOCATION};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::env;
use tracing::{debug, warn};

use crate::{
    ArchiveApi, AssetBlobRef, AssetId, AssetMetadata, BlobId, CompletedPart, CompletedUpload,
    CreatedZarr, Digest, InitializeOutcome, PendingSession, RemoteAsset, RemoteFile, RetryPolicy,
    SignedEntryUrl, UploadError, UploadId, UploadPart, UploadResult, UploadSession, UploadTarget,
    ZarrEntryUpload, ZarrId, ZarrStatusReport,
};

/// Storage answers with this when a proxy rewrote the request to chunked encoding
const CHUNKED_TRANSFER_MARKER: &str =
    "A header you provided implies functionality that is not implemented";

/// [`ArchiveApi`] over the archive's REST API
#[derive(Clone)]
pub struct HttpArchiveClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
    retry: RetryPolicy,
}

/// Fully read response, so retry decisions can inspect the body
struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

impl RawResponse {
    fn into_result(self) -> UploadResult<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(UploadError::api(self.status.as_u16(), self.body))
        }
    }
}

/// Whether a completed storage response deserves another attempt
fn retryable_response(policy: &RetryPolicy, status: StatusCode, body: &str, retry_marker: Option<&str>) -> bool {
    if status.is_success() {
        return false;
    }
    policy.should_retry_status(status.as_u16()) || retry_marker.is_some_and(|m| body.contains(m))
}

impl HttpArchiveClient {
    /// `api_url` is the API root, e.g. `https://api.dandiarchive.org/api`
    pub fn new<S: Into<String>>(api_url: S, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
            retry: RetryPolicy::default(),
        }
    }

    /// Build from `DANDI_API_URL` (required) and `DANDI_API_KEY` (optional)
    pub fn from_env() -> UploadResult<Self> {
        let api_url = env::var("DANDI_API_URL")
            .map_err(|_| UploadError::invalid("DANDI_API_URL environment variable required"))?;
        let token = env::var("DANDI_API_KEY").ok().filter(|t| !t.is_empty());
        Ok(Self::new(api_url, token))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path.trim_start_matches('/'))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("token {}", token)),
            None => req,
        }
    }

    async fn send_raw(req: RequestBuilder) -> UploadResult<RawResponse> {
        let response = req.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        Ok(RawResponse { status, headers, body })
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> UploadResult<T> {
        let response = Self::send_raw(self.authed(req)).await?.into_result()?;
        Ok(serde_json::from_str(&response.body)?)
    }

    async fn send_empty(&self, req: RequestBuilder) -> UploadResult<()> {
        Self::send_raw(self.authed(req)).await?.into_result()?;
        Ok(())
    }

    /// Send a storage request, retrying configured statuses, transport
    /// failures, and responses whose body contains `retry_marker`
    async fn send_with_retry<F>(&self, make_request: F, retry_marker: Option<&str>) -> UploadResult<RawResponse>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let outcome = Self::send_raw(make_request()).await;
            let retryable = match &outcome {
                Ok(response) => retryable_response(&self.retry, response.status, &response.body, retry_marker),
                Err(UploadError::Transport { source }) => source.is_connect() || source.is_timeout(),
                Err(_) => false,
            };
            if !retryable || attempt >= self.retry.max_retries {
                return outcome?.into_result();
            }

            attempt += 1;
            let delay = self.retry.delay_for(attempt);
            match &outcome {
                Ok(response) => warn!(
                    status = response.status.as_u16(),
                    attempt,
                    "Storage request failed, retrying in {:?}",
                    delay
                ),
                Err(e) => warn!(attempt, "Storage request error ({}), retrying in {:?}", e, delay),
            }
            tokio::time::sleep(delay).await;
        }
    }

    fn asset_body(blob: &AssetBlobRef, metadata: &AssetMetadata) -> serde_json::Value {
        match blob {
            AssetBlobRef::Blob(id) => json!({ "metadata": metadata, "blob_id": id }),
            AssetBlobRef::Zarr(id) => json!({ "metadata": metadata, "zarr_id": id }),
        }
    }

    fn remote_asset(response: AssetResponse, blob: &AssetBlobRef) -> RemoteAsset {
        RemoteAsset {
            asset_id: response.asset_id,
            path: response.path,
            blob: blob.clone(),
            metadata: response.metadata,
        }
    }
}

#[derive(Deserialize)]
struct InitializeResponse {
    upload_id: UploadId,
    parts: Vec<UploadPart>,
}

#[derive(Deserialize)]
struct ValidateResponse {
    blob_id: BlobId,
}

#[derive(Deserialize)]
struct ZarrRecord {
    zarr_id: ZarrId,
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default)]
    next: Option<String>,
    results: Vec<T>,
}

#[derive(Deserialize)]
struct ZarrFileRecord {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "ETag")]
    etag: String,
}

#[derive(Deserialize)]
struct AssetResponse {
    asset_id: AssetId,
    path: String,
    #[serde(default)]
    metadata: AssetMetadata,
}

#[derive(Deserialize)]
#[serde(rename = "CompleteMultipartUploadResult")]
struct CompleteMultipartUploadResult {
    #[serde(rename = "ETag")]
    etag: String,
}

/// Blob id named by a 409 `Location` header (bare id or URL ending in it)
fn blob_id_from_location(location: &str) -> Option<BlobId> {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(BlobId::new)
}

fn unquote(etag: &str) -> String {
    etag.trim().trim_matches('"').to_string()
}

/// Base64 of the raw digest bytes, as `Content-MD5` expects
fn content_md5(md5_hex: &str) -> UploadResult<String> {
    if md5_hex.len() != 32 {
        return Err(UploadError::invalid(format!("not an md5 digest: {}", md5_hex)));
    }
    let raw = (0..32)
        .step_by(2)
        .map(|i| u8::from_str_radix(&md5_hex[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| UploadError::invalid(format!("not an md5 digest: {}", md5_hex)))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(raw))
}

#[async_trait]
impl ArchiveApi for HttpArchiveClient {
    async fn initialize_upload(
        &self,
        dandiset_id: &str,
        content_size: u64,
        digest: &Digest,
    ) -> UploadResult<InitializeOutcome> {
        let body = json!({
            "contentSize": content_size,
            "digest": digest.as_request(),
            "dandiset": dandiset_id,
        });
        debug!(dandiset_id, content_size, %digest, "Initializing upload");
        let req = self.authed(self.http.post(self.url("uploads/initialize/")).json(&body));
        let response = Self::send_raw(req).await?;

        if response.status == StatusCode::CONFLICT {
            let blob_id = response
                .headers
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(blob_id_from_location)
                .ok_or_else(|| UploadError::protocol("409 from initialize without a Location header"))?;
            return Ok(InitializeOutcome::Existing(blob_id));
        }

        let parsed: InitializeResponse = serde_json::from_str(&response.into_result()?.body)?;
        Ok(InitializeOutcome::Started(UploadSession {
            upload_id: parsed.upload_id,
            parts: parsed.parts,
            dandiset_id: dandiset_id.to_string(),
        }))
    }

    async fn upload_part(&self, part: &UploadPart, data: Bytes) -> UploadResult<String> {
        debug!(part_number = part.part_number, size = data.len(), "Uploading part");
        let response = self
            .send_with_retry(|| self.http.put(&part.upload_url).body(data.clone()), None)
            .await?;
        response
            .headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(unquote)
            .ok_or_else(|| UploadError::protocol(format!("part {} response has no ETag", part.part_number)))
    }

    async fn complete_upload(
        &self,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> UploadResult<CompletedUpload> {
        let url = self.url(&format!("uploads/{}/complete/", upload_id));
        self.send_json(self.http.post(url).json(&json!({ "parts": parts }))).await
    }

    async fn finalize_upload(&self, completed: &CompletedUpload) -> UploadResult<String> {
        let req = self.http.post(&completed.complete_url).body(completed.body.clone());
        let response = Self::send_raw(req).await?.into_result()?;
        let result: CompleteMultipartUploadResult = quick_xml::de::from_str(&response.body)?;
        Ok(unquote(&result.etag))
    }

    async fn validate_upload(&self, upload_id: &UploadId) -> UploadResult<BlobId> {
        let url = self.url(&format!("uploads/{}/validate/", upload_id));
        let response: ValidateResponse = self.send_json(self.http.post(url)).await?;
        Ok(response.blob_id)
    }

    fn upload_cancellation(&self, upload_id: &UploadId) -> PendingSession {
        PendingSession {
            session_id: format!("upload:{}", upload_id),
            cancel_url: self.url(&format!("uploads/{}/", upload_id)),
            auth_token: self.token.clone(),
        }
    }

    async fn create_zarr(&self, name: &str, dandiset_id: &str) -> UploadResult<CreatedZarr> {
        let req = self.authed(
            self.http
                .post(self.url("zarr/"))
                .json(&json!({ "name": name, "dandiset": dandiset_id })),
        );
        let response = Self::send_raw(req).await?;
        if response.status != StatusCode::CONFLICT {
            let record: ZarrRecord = serde_json::from_str(&response.into_result()?.body)?;
            return Ok(CreatedZarr::Created(record.zarr_id));
        }

        debug!(name, dandiset_id, "Zarr already exists, looking it up");
        let lookup = self
            .http
            .get(self.url("zarr/"))
            .query(&[("dandiset", dandiset_id), ("name", name)]);
        let page: Page<ZarrRecord> = self.send_json(lookup).await?;
        page.results
            .into_iter()
            .next()
            .map(|r| CreatedZarr::Existing(r.zarr_id))
            .ok_or_else(|| UploadError::protocol(format!("Zarr {:?} conflicts but cannot be found", name)))
    }

    async fn list_zarr_files(&self, zarr_id: &ZarrId) -> UploadResult<Vec<RemoteFile>> {
        let mut files = Vec::new();
        let mut next = Some(self.url(&format!("zarr/{}/files/", zarr_id)));
        while let Some(url) = next.take() {
            let page: Page<ZarrFileRecord> = self.send_json(self.http.get(url)).await?;
            files.extend(page.results.into_iter().map(|r| RemoteFile {
                path: r.key,
                size: r.size,
                digest: Digest::md5(unquote(&r.etag)),
            }));
            next = page.next;
        }
        Ok(files)
    }

    async fn begin_zarr_batch(
        &self,
        zarr_id: &ZarrId,
        entries: &[ZarrEntryUpload],
    ) -> UploadResult<Vec<SignedEntryUrl>> {
        let url = self.url(&format!("zarr/{}/upload/", zarr_id));
        self.send_json(self.http.post(url).json(entries)).await
    }

    async fn upload_zarr_entry(&self, upload_url: &str, data: Bytes, md5_hex: &str) -> UploadResult<()> {
        let content_md5 = content_md5(md5_hex)?;
        self.send_with_retry(
            || {
                self.http
                    .put(upload_url)
                    .header("X-Amz-ACL", "bucket-owner-full-control")
                    .header("Content-MD5", &content_md5)
                    .body(data.clone())
            },
            Some(CHUNKED_TRANSFER_MARKER),
        )
        .await?;
        Ok(())
    }

    async fn complete_zarr_batch(&self, zarr_id: &ZarrId) -> UploadResult<()> {
        let url = self.url(&format!("zarr/{}/upload/complete/", zarr_id));
        self.send_empty(self.http.post(url)).await
    }

    async fn abort_zarr_batch(&self, zarr_id: &ZarrId) -> UploadResult<()> {
        let url = self.url(&format!("zarr/{}/upload/", zarr_id));
        self.send_empty(self.http.delete(url)).await
    }

    fn zarr_batch_cancellation(&self, zarr_id: &ZarrId) -> PendingSession {
        PendingSession {
            session_id: format!("zarr:{}", zarr_id),
            cancel_url: self.url(&format!("zarr/{}/upload/", zarr_id)),
            auth_token: self.token.clone(),
        }
    }

    async fn delete_zarr_files(&self, zarr_id: &ZarrId, paths: &[String]) -> UploadResult<()> {
        let url = self.url(&format!("zarr/{}/files/", zarr_id));
        let body: Vec<serde_json::Value> = paths.iter().map(|p| json!({ "path": p })).collect();
        self.send_empty(self.http.delete(url).json(&body)).await
    }

    async fn ingest_zarr(&self, zarr_id: &ZarrId) -> UploadResult<()> {
        let url = self.url(&format!("zarr/{}/ingest/", zarr_id));
        self.send_empty(self.http.post(url)).await
    }

    async fn zarr_status(&self, zarr_id: &ZarrId) -> UploadResult<ZarrStatusReport> {
        let url = self.url(&format!("zarr/{}/", zarr_id));
        self.send_json(self.http.get(url)).await
    }

    async fn create_asset(
        &self,
        target: &UploadTarget,
        blob: &AssetBlobRef,
        metadata: &AssetMetadata,
    ) -> UploadResult<RemoteAsset> {
        let url = self.url(&format!(
            "dandisets/{}/versions/{}/assets/",
            target.dandiset_id, target.version
        ));
        let response: AssetResponse = self
            .send_json(self.http.post(url).json(&Self::asset_body(blob, metadata)))
            .await?;
        Ok(Self::remote_asset(response, blob))
    }

    async fn update_asset(
        &self,
        target: &UploadTarget,
        asset_id: &AssetId,
        blob: &AssetBlobRef,
        metadata: &AssetMetadata,
    ) -> UploadResult<RemoteAsset> {
        let url = self.url(&format!(
            "dandisets/{}/versions/{}/assets/{}/",
            target.dandiset_id, target.version, asset_id
        ));
        let response: AssetResponse = self
            .send_json(self.http.put(url).json(&Self::asset_body(blob, metadata)))
            .await?;
        Ok(Self::remote_asset(response, blob))
    }

    async fn cancel_session(&self, session: &PendingSession) -> UploadResult<()> {
        let mut req = self.http.delete(&session.cancel_url);
        if let Some(token) = &session.auth_token {
            req = req.header("Authorization", format!("token {}", token));
        }
        Self::send_raw(req).await?.into_result()?;
        Ok(())
    }
}
