use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::{ArchiveApi, IngestStatus, UploadResult, ZarrId, ZarrStatusReport};

/// Triggers server-side checksum computation for a Zarr and waits for it
pub struct IngestionWaiter {
    api: Arc<dyn ArchiveApi>,
    poll_interval: Duration,
}

impl IngestionWaiter {
    pub fn new(api: Arc<dyn ArchiveApi>, poll_interval: Duration) -> Self {
        Self { api, poll_interval }
    }

    /// Polls until the archive reports `Complete`; there is no timeout
    #[instrument(skip(self), fields(zarr_id = %zarr_id))]
    pub async fn wait(&self, zarr_id: &ZarrId) -> UploadResult<ZarrStatusReport> {
        self.api.ingest_zarr(zarr_id).await?;
        let mut polls = 0u32;
        loop {
            let report = self.api.zarr_status(zarr_id).await?;
            polls += 1;
            if report.status == IngestStatus::Complete {
                info!(polls, checksum = ?report.checksum, "Zarr ingestion complete");
                return Ok(report);
            }
            debug!(status = ?report.status, polls, "Zarr still ingesting");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
