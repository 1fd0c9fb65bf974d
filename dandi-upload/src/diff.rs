use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::{Digest, TreeEntry, UploadResult};

/// A local file that must be uploaded, with its digest if already known
#[derive(Debug, Clone)]
pub struct PendingEntry<L> {
    pub entry: Arc<L>,
    pub digest: Option<Digest>,
}

/// Outcome of reconciling a local tree against a remote one
#[derive(Debug)]
pub struct TreeDiff<L> {
    pub to_upload: Vec<PendingEntry<L>>,
    /// Remote file paths to delete, sorted
    pub to_delete: Vec<String>,
    /// Local files whose remote copy already has the same digest
    pub unchanged: usize,
}

impl<L> TreeDiff<L> {
    pub fn is_noop(&self) -> bool {
        self.to_upload.is_empty() && self.to_delete.is_empty()
    }
}

/// Classifies local entries against a previously uploaded remote tree
#[derive(Debug, Clone)]
pub struct TreeDiffer {
    jobs: usize,
}

struct Walk<'a, R> {
    remote: HashMap<&'a str, &'a Arc<R>>,
    visited: HashSet<String>,
    to_delete: BTreeSet<String>,
}

impl TreeDiffer {
    pub fn new(jobs: usize) -> Self {
        Self { jobs: jobs.max(1) }
    }

    pub async fn diff<L, R>(&self, local: &Arc<L>, remote: Option<&Arc<R>>) -> UploadResult<TreeDiff<L>>
    where
        L: TreeEntry,
        R: TreeEntry,
    {
        let Some(remote) = remote else {
            let to_upload = local
                .files()
                .into_iter()
                .map(|entry| PendingEntry { entry, digest: None })
                .collect();
            return Ok(TreeDiff {
                to_upload,
                to_delete: Vec::new(),
                unchanged: 0,
            });
        };

        let remote_nodes = remote.descendants();
        let mut walk = Walk {
            remote: remote_nodes.iter().map(|r| (r.path(), r)).collect(),
            visited: HashSet::new(),
            to_delete: BTreeSet::new(),
        };
        let mut to_upload = Vec::new();
        let mut to_compare = Vec::new();
        Self::walk(local, &mut walk, &mut to_upload, &mut to_compare);

        for node in &remote_nodes {
            if node.is_file() && !walk.visited.contains(node.path()) {
                walk.to_delete.insert(node.path().to_string());
            }
        }

        let compared: Vec<(Arc<L>, Digest, Digest)> = stream::iter(to_compare)
            .map(|(local, remote)| async move {
                let local_digest = local.digest().await?;
                let remote_digest = remote.digest().await?;
                Ok::<_, crate::UploadError>((local, local_digest, remote_digest))
            })
            .buffer_unordered(self.jobs)
            .try_collect()
            .await?;

        let mut unchanged = 0;
        for (entry, local_digest, remote_digest) in compared {
            if local_digest == remote_digest {
                unchanged += 1;
            } else {
                debug!(path = entry.path(), "Content differs from remote copy");
                to_upload.push(PendingEntry {
                    entry,
                    digest: Some(local_digest),
                });
            }
        }

        Ok(TreeDiff {
            to_upload,
            to_delete: walk.to_delete.into_iter().collect(),
            unchanged,
        })
    }

    fn walk<L, R>(
        node: &Arc<L>,
        walk: &mut Walk<'_, R>,
        to_upload: &mut Vec<PendingEntry<L>>,
        to_compare: &mut Vec<(Arc<L>, Arc<R>)>,
    ) where
        L: TreeEntry,
        R: TreeEntry,
    {
        for child in node.children() {
            let path = child.path();
            match walk.remote.get(path).copied() {
                None => {
                    Self::delete_file_ancestors(path, walk);
                    if child.is_file() {
                        to_upload.push(PendingEntry {
                            entry: child.clone(),
                            digest: None,
                        });
                    } else {
                        Self::walk(child, walk, to_upload, to_compare);
                    }
                }
                Some(remote) => {
                    walk.visited.insert(path.to_string());
                    match (child.is_file(), remote.is_file()) {
                        (true, true) => to_compare.push((child.clone(), remote.clone())),
                        (true, false) => {
                            // Directory replaced by a file: drop the whole remote subtree
                            for below in remote.descendants() {
                                walk.visited.insert(below.path().to_string());
                                if below.is_file() {
                                    walk.to_delete.insert(below.path().to_string());
                                }
                            }
                            to_upload.push(PendingEntry {
                                entry: child.clone(),
                                digest: None,
                            });
                        }
                        (false, true) => {
                            walk.to_delete.insert(path.to_string());
                            Self::walk(child, walk, to_upload, to_compare);
                        }
                        (false, false) => Self::walk(child, walk, to_upload, to_compare),
                    }
                }
            }
        }
    }

    /// A path cannot be both a file and a directory in storage, so any remote
    /// file sitting where a new entry needs a directory goes first
    fn delete_file_ancestors<R: TreeEntry>(path: &str, walk: &mut Walk<'_, R>) {
        let mut end = 0;
        while let Some(offset) = path[end..].find('/') {
            end += offset;
            let ancestor = &path[..end];
            if let Some(remote) = walk.remote.get(ancestor) {
                if remote.is_file() {
                    walk.visited.insert(ancestor.to_string());
                    walk.to_delete.insert(ancestor.to_string());
                }
            }
            end += 1;
        }
    }
}
