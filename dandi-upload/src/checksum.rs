//! Aggregate checksum of a Zarr directory tree.
//!
//! A directory's checksum is the md5 of a compact JSON listing of its
//! immediate children (name, digest, size), suffixed with the recursive file
//! count and total size: `{md5}-{count}--{size}`.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::{UploadError, UploadResult};

/// Checksum of one directory, with the totals needed by its parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryChecksum {
    pub md5: String,
    pub file_count: u64,
    pub size: u64,
}

impl DirectoryChecksum {
    pub fn empty() -> Self {
        Self::compute(Vec::new(), Vec::new())
    }

    /// `files` are `(name, md5 hex, size)`, `directories` are `(name, checksum)`
    pub fn compute(
        mut files: Vec<(String, String, u64)>,
        mut directories: Vec<(String, DirectoryChecksum)>,
    ) -> Self {
        files.sort_by(|a, b| a.0.cmp(&b.0));
        // The archive stores only files, so a directory holding none does not exist there
        directories.retain(|(_, d)| d.file_count > 0);
        directories.sort_by(|a, b| a.0.cmp(&b.0));

        let file_count =
            files.len() as u64 + directories.iter().map(|(_, d)| d.file_count).sum::<u64>();
        let size = files.iter().map(|f| f.2).sum::<u64>()
            + directories.iter().map(|(_, d)| d.size).sum::<u64>();

        let listing = Listing {
            directories: directories
                .iter()
                .map(|(name, d)| ListingEntry {
                    digest: d.to_string(),
                    name: name.clone(),
                    size: d.size,
                })
                .collect(),
            files: files
                .into_iter()
                .map(|(name, digest, size)| ListingEntry { digest, name, size })
                .collect(),
        };
        // Serializing plain strings and integers cannot fail
        let json = serde_json::to_string(&listing).unwrap_or_default();

        Self {
            md5: format!("{:x}", md5::compute(json.as_bytes())),
            file_count,
            size,
        }
    }

    pub fn parse(value: &str) -> UploadResult<Self> {
        let bad = || UploadError::protocol(format!("malformed zarr checksum {:?}", value));
        let (md5, rest) = value.split_once('-').ok_or_else(bad)?;
        let (count, size) = rest.split_once("--").ok_or_else(bad)?;
        Ok(Self {
            md5: md5.to_string(),
            file_count: count.parse().map_err(|_| bad())?,
            size: size.parse().map_err(|_| bad())?,
        })
    }
}

impl std::fmt::Display for DirectoryChecksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}--{}", self.md5, self.file_count, self.size)
    }
}

#[derive(Serialize)]
struct Listing {
    directories: Vec<ListingEntry>,
    files: Vec<ListingEntry>,
}

#[derive(Serialize)]
struct ListingEntry {
    digest: String,
    name: String,
    size: u64,
}

/// Builds the root checksum from a flat list of file paths
#[derive(Debug, Default)]
pub struct ZarrChecksumTree {
    root: Node,
}

#[derive(Debug, Default)]
struct Node {
    files: BTreeMap<String, (String, u64)>,
    dirs: BTreeMap<String, Node>,
}

impl ZarrChecksumTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file at a `/`-separated path
    pub fn add_file(&mut self, path: &str, md5: &str, size: u64) {
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some(name) = segments.pop() else {
            return;
        };
        let mut node = &mut self.root;
        for segment in segments {
            node = node.dirs.entry(segment.to_string()).or_default();
        }
        node.files.insert(name.to_string(), (md5.to_string(), size));
    }

    pub fn checksum(&self) -> DirectoryChecksum {
        Self::node_checksum(&self.root)
    }

    fn node_checksum(node: &Node) -> DirectoryChecksum {
        let files = node
            .files
            .iter()
            .map(|(name, (md5, size))| (name.clone(), md5.clone(), *size))
            .collect();
        let dirs = node
            .dirs
            .iter()
            .map(|(name, child)| (name.clone(), Self::node_checksum(child)))
            .collect();
        DirectoryChecksum::compute(files, dirs)
    }
}
