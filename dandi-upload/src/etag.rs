//! Multipart partitioning and the DANDI ETag digest.
//!
//! The archive and this client split a file into parts with the same
//! deterministic, size-based scheme, so each side can compute part
//! boundaries and checksums without negotiating them. The resulting digest
//! is what S3 reports for a multipart object:
//! `hex(md5(md5(part_1) || ... || md5(part_n)))-n`.
//!
//! Changing anything in this module changes the wire contract.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::{Digest, UploadError, UploadResult};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

pub const DEFAULT_PART_SIZE: u64 = 64 * MIB;
pub const MAX_PARTS: u64 = 10_000;
pub const MAX_PART_SIZE: u64 = 5 * GIB;
pub const MAX_FILE_SIZE: u64 = 5 * TIB;

/// One planned part of a multipart upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    /// 1-based
    pub number: u32,
    pub offset: u64,
    pub size: u64,
}

/// Deterministic part layout for a file of a given size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartGenerator {
    part_count: u32,
    part_size: u64,
    final_part_size: u64,
}

impl PartGenerator {
    pub fn for_file_size(file_size: u64) -> UploadResult<Self> {
        Self::with_part_size(file_size, DEFAULT_PART_SIZE)
    }

    pub fn with_part_size(file_size: u64, default_part_size: u64) -> UploadResult<Self> {
        if file_size > MAX_FILE_SIZE {
            return Err(UploadError::invalid(format!(
                "File size {} exceeds maximum {}",
                file_size, MAX_FILE_SIZE
            )));
        }
        if default_part_size == 0 {
            return Err(UploadError::invalid("part size must be non-zero"));
        }
        if file_size == 0 {
            return Ok(Self {
                part_count: 0,
                part_size: 0,
                final_part_size: 0,
            });
        }

        let mut part_size = default_part_size;
        if file_size.div_ceil(part_size) >= MAX_PARTS {
            part_size = file_size.div_ceil(MAX_PARTS);
        }
        if part_size > MAX_PART_SIZE {
            return Err(UploadError::invalid(format!(
                "Part size {} exceeds maximum {}",
                part_size, MAX_PART_SIZE
            )));
        }

        let mut part_count = file_size / part_size;
        let mut final_part_size = file_size % part_size;
        if final_part_size == 0 {
            final_part_size = part_size;
        } else {
            part_count += 1;
        }

        Ok(Self {
            part_count: part_count as u32,
            part_size,
            final_part_size,
        })
    }

    pub fn part_count(&self) -> u32 {
        self.part_count
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn final_part_size(&self) -> u64 {
        self.final_part_size
    }

    /// Part `number` (1-based), if it exists
    pub fn part(&self, number: u32) -> Option<Part> {
        if number == 0 || number > self.part_count {
            return None;
        }
        let size = if number == self.part_count {
            self.final_part_size
        } else {
            self.part_size
        };
        Some(Part {
            number,
            offset: (number as u64 - 1) * self.part_size,
            size,
        })
    }

    pub fn parts(&self) -> impl Iterator<Item = Part> + '_ {
        (1..=self.part_count).filter_map(move |n| self.part(n))
    }
}

/// Accumulates per-part md5s into a DANDI ETag
#[derive(Debug, Default)]
pub struct ETagHasher {
    part_digests: Vec<[u8; 16]>,
}

impl ETagHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash one part's bytes; returns the part md5 as hex
    pub fn update(&mut self, part: &[u8]) -> String {
        let digest = md5::compute(part);
        self.part_digests.push(digest.0);
        format!("{:x}", digest)
    }

    pub fn finalize(self) -> Digest {
        let mut joined = Vec::with_capacity(self.part_digests.len() * 16);
        for d in &self.part_digests {
            joined.extend_from_slice(d);
        }
        Digest::dandi_etag(format!(
            "{:x}-{}",
            md5::compute(&joined),
            self.part_digests.len()
        ))
    }
}

/// Local ETag plus the per-part md5s needed to verify storage responses
#[derive(Debug, Clone)]
pub struct LocalETag {
    pub digest: Digest,
    pub generator: PartGenerator,
    /// Part md5 hex, indexed by `part number - 1`
    pub part_md5s: Vec<String>,
}

impl LocalETag {
    pub fn part_md5(&self, number: u32) -> Option<&str> {
        self.part_md5s
            .get((number as usize).checked_sub(1)?)
            .map(|s| s.as_str())
    }
}

/// Compute the DANDI ETag of a file, reading it part by part
pub fn compute_file_etag(path: &Path, default_part_size: u64) -> UploadResult<LocalETag> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let generator = PartGenerator::with_part_size(size, default_part_size)?;

    let mut hasher = ETagHasher::new();
    let mut part_md5s = Vec::with_capacity(generator.part_count() as usize);
    let mut buf = Vec::new();
    for part in generator.parts() {
        buf.resize(part.size as usize, 0);
        file.seek(SeekFrom::Start(part.offset))?;
        file.read_exact(&mut buf)?;
        part_md5s.push(hasher.update(&buf));
    }

    Ok(LocalETag {
        digest: hasher.finalize(),
        generator,
        part_md5s,
    })
}

/// Off-runtime variant of [`compute_file_etag`]
pub async fn compute_file_etag_blocking(path: PathBuf, default_part_size: u64) -> UploadResult<LocalETag> {
    tokio::task::spawn_blocking(move || compute_file_etag(&path, default_part_size)).await?
}

/// md5 of raw bytes as lowercase hex
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}
