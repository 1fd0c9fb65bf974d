use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;

use crate::{Digest, LocalEntry, PendingEntry, TreeEntry, UploadResult};

/// A Zarr entry ready to transfer
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub path: String,
    /// md5 of the content
    pub digest: Digest,
    pub entry: Arc<LocalEntry>,
}

/// Collects the entries a Zarr upload must send.
///
/// Entries whose digest is still unknown get it computed lazily, with at most
/// `jobs` computations running at once, as [`EntryUploadTracker::into_items`]
/// is polled.
#[derive(Debug)]
pub struct EntryUploadTracker {
    jobs: usize,
    entries: Vec<PendingEntry<LocalEntry>>,
    total_size: u64,
}

impl EntryUploadTracker {
    pub fn new(jobs: usize) -> Self {
        Self {
            jobs: jobs.max(1),
            entries: Vec::new(),
            total_size: 0,
        }
    }

    pub fn register(&mut self, entry: Arc<LocalEntry>, digest: Option<Digest>) {
        self.total_size += entry.size();
        self.entries.push(PendingEntry { entry, digest });
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_items(self) -> BoxStream<'static, UploadResult<UploadItem>> {
        stream::iter(self.entries)
            .map(|pending| async move {
                let digest = match pending.digest {
                    Some(digest) => digest,
                    None => pending.entry.digest().await?,
                };
                Ok(UploadItem {
                    path: pending.entry.path().to_string(),
                    digest,
                    entry: pending.entry,
                })
            })
            .buffer_unordered(self.jobs)
            .boxed()
    }
}

impl Extend<PendingEntry<LocalEntry>> for EntryUploadTracker {
    fn extend<T: IntoIterator<Item = PendingEntry<LocalEntry>>>(&mut self, iter: T) {
        for pending in iter {
            self.register(pending.entry, pending.digest);
        }
    }
}
