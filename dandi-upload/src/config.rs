use std::env;
use std::time::Duration;

use crate::etag::DEFAULT_PART_SIZE;
use crate::{UploadError, UploadResult};

/// Zarr entries registered per batch request
pub const DEFAULT_ZARR_BATCH_SIZE: usize = 255;

/// Configuration for upload operations
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Worker pool size for part PUTs, entry digests and batch items
    pub jobs: usize,

    /// Default part size of the multipart partitioning scheme.
    /// Must match the archive's own setting.
    pub part_size: u64,

    /// Number of Zarr entries registered per batch
    pub zarr_batch_size: usize,

    /// Delay between ingestion status polls
    pub ingest_poll_interval: Duration,

    /// Retry rules for presigned storage PUTs
    pub retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            jobs: 5,
            part_size: DEFAULT_PART_SIZE,
            zarr_batch_size: DEFAULT_ZARR_BATCH_SIZE,
            ingest_poll_interval: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

/// Retry rules applied by the transport to storage PUTs
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,

    /// Response statuses that trigger another attempt
    pub retry_statuses: Vec<u16>,

    /// Delay before the first retry; doubles on each further attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_statuses: vec![500, 502, 503, 504],
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_retry_statuses(mut self, statuses: Vec<u16>) -> Self {
        self.retry_statuses = statuses;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl UploadConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `DANDI_UPLOAD_*` environment variables
    pub fn from_env() -> UploadResult<Self> {
        fn parse_env<T: std::str::FromStr>(key: &str) -> UploadResult<Option<T>> {
            match env::var(key) {
                Ok(raw) => raw
                    .trim()
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| UploadError::invalid(format!("{} has invalid value {:?}", key, raw))),
                Err(_) => Ok(None),
            }
        }

        let mut config = Self::default();
        if let Some(jobs) = parse_env::<usize>("DANDI_UPLOAD_JOBS")? {
            config = config.with_jobs(jobs);
        }
        if let Some(part_size) = parse_env::<u64>("DANDI_UPLOAD_PART_SIZE")? {
            config = config.with_part_size(part_size);
        }
        if let Some(batch) = parse_env::<usize>("DANDI_UPLOAD_ZARR_BATCH_SIZE")? {
            config = config.with_zarr_batch_size(batch);
        }
        if let Some(secs) = parse_env::<u64>("DANDI_UPLOAD_POLL_INTERVAL_SECS")? {
            config = config.with_ingest_poll_interval(Duration::from_secs(secs));
        }
        if let Some(retries) = parse_env::<u32>("DANDI_UPLOAD_MAX_RETRIES")? {
            config.retry = config.retry.with_max_retries(retries);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_part_size(mut self, bytes: u64) -> Self {
        self.part_size = bytes;
        self
    }

    pub fn with_zarr_batch_size(mut self, size: usize) -> Self {
        self.zarr_batch_size = size;
        self
    }

    pub fn with_ingest_poll_interval(mut self, interval: Duration) -> Self {
        self.ingest_poll_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> UploadResult<()> {
        if self.jobs == 0 {
            return Err(UploadError::invalid("jobs must be at least 1"));
        }
        if self.part_size == 0 {
            return Err(UploadError::invalid("part_size must be at least 1 byte"));
        }
        if self.zarr_batch_size == 0 {
            return Err(UploadError::invalid("zarr_batch_size must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment is process-global
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_protocol_constants() {
        let config = UploadConfig::default();
        assert_eq!(config.jobs, 5);
        assert_eq!(config.part_size, 64 * 1024 * 1024);
        assert_eq!(config.zarr_batch_size, 255);
        assert_eq!(config.ingest_poll_interval, Duration::from_secs(2));
        assert!(config.retry.should_retry_status(500));
        assert!(!config.retry.should_retry_status(404));
    }

    #[test]
    fn retry_delay_doubles() {
        let retry = RetryPolicy::new().with_base_delay(Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn from_env_reads_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("DANDI_UPLOAD_JOBS", "8");
        env::set_var("DANDI_UPLOAD_ZARR_BATCH_SIZE", "10");
        let config = UploadConfig::from_env().unwrap();
        env::remove_var("DANDI_UPLOAD_JOBS");
        env::remove_var("DANDI_UPLOAD_ZARR_BATCH_SIZE");

        assert_eq!(config.jobs, 8);
        assert_eq!(config.zarr_batch_size, 10);
        assert_eq!(config.part_size, DEFAULT_PART_SIZE);
    }

    #[test]
    fn from_env_rejects_garbage() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("DANDI_UPLOAD_JOBS", "many");
        let result = UploadConfig::from_env();
        env::remove_var("DANDI_UPLOAD_JOBS");

        assert!(matches!(result, Err(UploadError::Invalid { .. })));
    }

    #[test]
    fn zero_jobs_is_invalid() {
        let config = UploadConfig::new().with_jobs(0);
        assert!(config.validate().is_err());
    }
}
