//! Uniform view over local and remote Zarr trees.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::checksum::DirectoryChecksum;
use crate::{Digest, DigestType, RemoteFile, UploadError, UploadResult};

/// A node in a hierarchical store, addressed by its `/`-joined path
/// relative to the tree root (the root itself has path `""`).
#[async_trait]
pub trait TreeEntry: Send + Sync + Sized + 'static {
    fn path(&self) -> &str;

    fn is_file(&self) -> bool;

    /// File size, or the total size of all files below a directory
    fn size(&self) -> u64;

    /// Children in name order; empty for files
    fn children(&self) -> &[Arc<Self>];

    /// md5 for files, aggregate Zarr checksum for directories
    async fn digest(&self) -> UploadResult<Digest>;

    fn name(&self) -> &str {
        self.path().rsplit('/').next().unwrap_or("")
    }

    /// Every node below this one, depth-first, parents before children
    fn descendants(&self) -> Vec<Arc<Self>> {
        let mut out = Vec::new();
        let mut stack: Vec<Arc<Self>> = self.children().iter().rev().cloned().collect();
        while let Some(node) = stack.pop() {
            stack.extend(node.children().iter().rev().cloned());
            out.push(node);
        }
        out
    }

    /// Every file below this one
    fn files(&self) -> Vec<Arc<Self>> {
        self.descendants().into_iter().filter(|e| e.is_file()).collect()
    }
}

/// Aggregate checksum over any directory node
async fn directory_checksum<E: TreeEntry>(children: &[Arc<E>]) -> UploadResult<DirectoryChecksum> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for child in children {
        let digest = child.digest().await?;
        if child.is_file() {
            files.push((child.name().to_string(), digest.value, child.size()));
        } else {
            dirs.push((child.name().to_string(), DirectoryChecksum::parse(&digest.value)?));
        }
    }
    Ok(DirectoryChecksum::compute(files, dirs))
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// A file or directory on the local filesystem
#[derive(Debug)]
pub struct LocalEntry {
    path: String,
    fs_path: PathBuf,
    size: u64,
    modified: Option<DateTime<Utc>>,
    children: Vec<Arc<LocalEntry>>,
    is_file: bool,
    digest: OnceCell<Digest>,
}

impl LocalEntry {
    /// Scan `root` (a file or a directory tree)
    pub async fn scan<P: Into<PathBuf>>(root: P) -> UploadResult<Arc<LocalEntry>> {
        let root = root.into();
        tokio::task::spawn_blocking(move || Self::scan_blocking(&root)).await?
    }

    /// Symlinks are followed; one that leads back into a directory being
    /// scanned is rejected
    pub fn scan_blocking(root: &Path) -> UploadResult<Arc<LocalEntry>> {
        Self::scan_node(root, String::new(), &mut Vec::new())
    }

    fn scan_node(fs_path: &Path, path: String, ancestors: &mut Vec<PathBuf>) -> UploadResult<Arc<LocalEntry>> {
        let mut metadata = std::fs::symlink_metadata(fs_path)?;
        if metadata.file_type().is_symlink() {
            metadata = std::fs::metadata(fs_path)?;
        }
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);

        if metadata.is_file() {
            return Ok(Arc::new(LocalEntry {
                path,
                fs_path: fs_path.to_path_buf(),
                size: metadata.len(),
                modified,
                children: Vec::new(),
                is_file: true,
                digest: OnceCell::new(),
            }));
        }
        if !metadata.is_dir() {
            return Err(UploadError::invalid(format!(
                "{} is neither a file nor a directory",
                fs_path.display()
            )));
        }

        let real = std::fs::canonicalize(fs_path)?;
        if ancestors.contains(&real) {
            return Err(UploadError::invalid(format!(
                "{} links back to {}",
                fs_path.display(),
                real.display()
            )));
        }

        let mut names = Vec::new();
        for dirent in std::fs::read_dir(fs_path)? {
            let dirent = dirent?;
            let name = dirent.file_name().into_string().map_err(|raw| {
                UploadError::invalid(format!("non UTF-8 file name {:?}", raw))
            })?;
            names.push((name, dirent.path()));
        }
        names.sort_by(|a, b| a.0.cmp(&b.0));

        ancestors.push(real);
        let children = names
            .into_iter()
            .map(|(name, child_path)| Self::scan_node(&child_path, join_path(&path, &name), ancestors))
            .collect::<UploadResult<Vec<_>>>();
        ancestors.pop();
        let children = children?;

        Ok(Arc::new(LocalEntry {
            path,
            fs_path: fs_path.to_path_buf(),
            size: children.iter().map(|c| c.size).sum(),
            modified,
            children,
            is_file: false,
            digest: OnceCell::new(),
        }))
    }

    pub fn fs_path(&self) -> &Path {
        &self.fs_path
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    /// True if the file on disk no longer has the size and mtime seen at scan time
    pub async fn has_changed_on_disk(&self) -> UploadResult<bool> {
        let metadata = tokio::fs::metadata(&self.fs_path).await?;
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        Ok(metadata.len() != self.size || modified != self.modified)
    }

    async fn compute_digest(&self) -> UploadResult<Digest> {
        if self.is_file {
            let fs_path = self.fs_path.clone();
            let hex = tokio::task::spawn_blocking(move || md5_file(&fs_path)).await??;
            Ok(Digest::md5(hex))
        } else {
            let checksum = directory_checksum(&self.children).await?;
            Ok(Digest::zarr_checksum(checksum.to_string()))
        }
    }
}

fn md5_file(path: &Path) -> UploadResult<String> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

#[async_trait]
impl TreeEntry for LocalEntry {
    fn path(&self) -> &str {
        &self.path
    }

    fn is_file(&self) -> bool {
        self.is_file
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn children(&self) -> &[Arc<Self>] {
        &self.children
    }

    /// Computed once, then cached
    async fn digest(&self) -> UploadResult<Digest> {
        self.digest
            .get_or_try_init(|| self.compute_digest())
            .await
            .cloned()
    }
}

/// A node of a Zarr already stored by the archive
#[derive(Debug)]
pub struct RemoteEntry {
    path: String,
    size: u64,
    digest: Option<Digest>,
    children: Vec<Arc<RemoteEntry>>,
}

#[derive(Default)]
struct RemoteNode {
    file: Option<(u64, Digest)>,
    children: BTreeMap<String, RemoteNode>,
}

impl RemoteEntry {
    /// Build the tree from a flat file listing; directories are inferred
    pub fn from_files(files: Vec<RemoteFile>) -> UploadResult<Arc<RemoteEntry>> {
        let mut root = RemoteNode::default();
        for file in files {
            let segments: Vec<&str> = file.path.split('/').collect();
            if segments.iter().any(|s| s.is_empty()) {
                return Err(UploadError::protocol(format!("invalid remote path {:?}", file.path)));
            }
            let mut node = &mut root;
            for segment in segments {
                node = node.children.entry(segment.to_string()).or_default();
            }
            node.file = Some((file.size, file.digest));
        }
        Self::build(root, String::new())
    }

    fn build(node: RemoteNode, path: String) -> UploadResult<Arc<RemoteEntry>> {
        if let Some((size, digest)) = node.file {
            if !node.children.is_empty() {
                return Err(UploadError::protocol(format!(
                    "remote path {:?} is both a file and a directory",
                    path
                )));
            }
            if digest.algorithm != DigestType::Md5 {
                return Err(UploadError::protocol(format!(
                    "remote file {:?} has a {} digest, expected md5",
                    path, digest.algorithm
                )));
            }
            return Ok(Arc::new(RemoteEntry {
                path,
                size,
                digest: Some(digest),
                children: Vec::new(),
            }));
        }

        let children = node
            .children
            .into_iter()
            .map(|(name, child)| Self::build(child, join_path(&path, &name)))
            .collect::<UploadResult<Vec<_>>>()?;
        Ok(Arc::new(RemoteEntry {
            path,
            size: children.iter().map(|c| c.size).sum(),
            digest: None,
            children,
        }))
    }
}

#[async_trait]
impl TreeEntry for RemoteEntry {
    fn path(&self) -> &str {
        &self.path
    }

    fn is_file(&self) -> bool {
        self.digest.is_some()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn children(&self) -> &[Arc<Self>] {
        &self.children
    }

    async fn digest(&self) -> UploadResult<Digest> {
        match &self.digest {
            Some(digest) => Ok(digest.clone()),
            None => {
                let checksum = directory_checksum(&self.children).await?;
                Ok(Digest::zarr_checksum(checksum.to_string()))
            }
        }
    }
}
