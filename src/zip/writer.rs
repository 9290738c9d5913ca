//! Single-pass zip assembly.
//!
//! [`StreamingZipWriter`] turns an ordered list of members into one zip byte
//! stream without ever holding a whole member or the whole archive. Sizes
//! and CRCs are unknown when a member's local header goes out, so every
//! member uses a data descriptor (general purpose flag bit 3) and ZIP64
//! fields. The central directory is written from what was observed while
//! the data passed through.
//!
//! A `datapackage.json` manifest describing every member is appended after
//! the real members, because only then are all sizes known.

use bytes::Bytes;
use chrono::NaiveDateTime;
use flate2::Crc;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use tracing::debug;

use crate::config::CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::io::ByteStream;

use super::structures::{
    CentralRecord, EndOfCentralDirectory, Zip64EOCD, Zip64EOCDLocator, dos_datetime,
    write_streaming_local_header, write_zip64_data_descriptor,
};

/// Name of the generated manifest member.
pub const MANIFEST_NAME: &str = "datapackage.json";

/// Profile string of the generated manifest.
pub const MANIFEST_PROFILE: &str = "multi-wacz-package";

/// Default permission bits of emitted members.
pub const DEFAULT_PERMISSIONS: u16 = 0o664;

/// One member of the output archive.
pub struct ZipMember {
    pub name: String,
    /// `None` stands for the DOS epoch, 1980-01-01 00:00.
    pub modified_at: Option<NaiveDateTime>,
    pub permissions: u16,
    /// Hash to report in the manifest. Computed (SHA-256) when absent.
    pub hash: Option<String>,
    /// Member data. Not polled before the member's turn comes.
    pub source: ByteStream,
}

impl ZipMember {
    pub fn new(name: impl Into<String>, source: ByteStream) -> Self {
        Self {
            name: name.into(),
            modified_at: None,
            permissions: DEFAULT_PERMISSIONS,
            hash: None,
            source,
        }
    }

    /// Member backed by bytes already in memory.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::new(name, futures::stream::once(async move { Ok(data) }).boxed())
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn with_modified_at(mut self, at: NaiveDateTime) -> Self {
        self.modified_at = Some(at);
        self
    }

    pub fn with_permissions(mut self, permissions: u16) -> Self {
        self.permissions = permissions;
        self
    }
}

/// Manifest document listing every member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub profile: String,
    pub resources: Vec<ManifestResource>,
}

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestResource {
    pub name: String,
    pub path: String,
    pub hash: String,
    pub size: u64,
}

/// Builds zip archives as lazy byte streams.
#[derive(Debug, Clone)]
pub struct StreamingZipWriter {
    chunk_size: usize,
    manifest: bool,
}

impl Default for StreamingZipWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingZipWriter {
    pub fn new() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            manifest: true,
        }
    }

    /// Upper bound for emitted data chunks.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Skip the trailing `datapackage.json` member.
    pub fn without_manifest(mut self) -> Self {
        self.manifest = false;
        self
    }

    /// Stream an archive containing `members` in order, then the manifest.
    ///
    /// Nothing is read from any member source until the returned stream is
    /// polled. If a source fails the stream yields that error and ends
    /// without a central directory, so the partial output is never a valid
    /// archive.
    pub fn stream_zip(self, members: impl IntoIterator<Item = ZipMember>) -> ByteStream {
        let emitter = Emitter {
            queue: members.into_iter().collect(),
            current: None,
            carry: Bytes::new(),
            offset: 0,
            records: Vec::new(),
            resources: Vec::new(),
            manifest_pending: self.manifest,
            finished: false,
            chunk_size: self.chunk_size,
        };
        futures::stream::try_unfold(emitter, |mut emitter| async move {
            let chunk = emitter.next_chunk().await?;
            Ok::<_, Error>(chunk.map(|chunk| (chunk, emitter)))
        })
        .boxed()
    }
}

/// Member whose data is currently flowing.
struct OpenMember {
    name: String,
    dos_time: u16,
    dos_date: u16,
    permissions: u16,
    header_offset: u64,
    hash: Option<String>,
    is_manifest: bool,
    source: ByteStream,
    crc: Crc,
    sha: Sha256,
    size: u64,
}

struct Emitter {
    queue: VecDeque<ZipMember>,
    current: Option<OpenMember>,
    carry: Bytes,
    offset: u64,
    records: Vec<CentralRecord>,
    resources: Vec<ManifestResource>,
    manifest_pending: bool,
    finished: bool,
    chunk_size: usize,
}

impl Emitter {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(mut member) = self.current.take() {
                if self.carry.is_empty() {
                    match member.source.try_next().await? {
                        Some(chunk) => {
                            self.carry = chunk;
                            self.current = Some(member);
                            continue;
                        }
                        None => return self.finish_member(member).map(Some),
                    }
                }

                let take = self.carry.len().min(self.chunk_size);
                let piece = self.carry.split_to(take);
                member.crc.update(&piece);
                member.sha.update(&piece);
                member.size += piece.len() as u64;
                self.offset += piece.len() as u64;
                self.current = Some(member);
                return Ok(Some(piece));
            }

            if let Some(member) = self.queue.pop_front() {
                return self.start_member(member, false).map(Some);
            }

            if self.manifest_pending {
                self.manifest_pending = false;
                let manifest = self.manifest_bytes()?;
                let member = ZipMember::from_bytes(MANIFEST_NAME, manifest);
                return self.start_member(member, true).map(Some);
            }

            if !self.finished {
                self.finished = true;
                return self.central_directory().map(Some);
            }

            return Ok(None);
        }
    }

    fn start_member(&mut self, member: ZipMember, is_manifest: bool) -> Result<Bytes> {
        if member.name.is_empty() || member.name.len() > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "zip member name must be 1..=65535 bytes: {:?}",
                member.name
            )));
        }

        let (dos_time, dos_date) = member
            .modified_at
            .as_ref()
            .map_or((0, (1 << 5) | 1), dos_datetime);

        let mut header = Vec::with_capacity(64 + member.name.len());
        write_streaming_local_header(&member.name, dos_time, dos_date, &mut header)?;
        debug!(name = %member.name, offset = self.offset, "zip member start");

        self.current = Some(OpenMember {
            name: member.name,
            dos_time,
            dos_date,
            permissions: member.permissions,
            header_offset: self.offset,
            hash: member.hash,
            is_manifest,
            source: member.source,
            crc: Crc::new(),
            sha: Sha256::new(),
            size: 0,
        });
        self.offset += header.len() as u64;
        Ok(Bytes::from(header))
    }

    fn finish_member(&mut self, member: OpenMember) -> Result<Bytes> {
        let crc32 = member.crc.sum();
        let mut descriptor = Vec::with_capacity(24);
        write_zip64_data_descriptor(crc32, member.size, &mut descriptor)?;
        self.offset += descriptor.len() as u64;

        if !member.is_manifest {
            let hash = member
                .hash
                .unwrap_or_else(|| hex::encode(member.sha.finalize()));
            self.resources.push(ManifestResource {
                name: member.name.clone(),
                path: member.name.clone(),
                hash,
                size: member.size,
            });
        }

        self.records.push(CentralRecord {
            name: member.name,
            dos_time: member.dos_time,
            dos_date: member.dos_date,
            permissions: member.permissions,
            crc32,
            size: member.size,
            local_header_offset: member.header_offset,
        });
        Ok(Bytes::from(descriptor))
    }

    fn manifest_bytes(&self) -> Result<Bytes> {
        let manifest = PackageManifest {
            profile: MANIFEST_PROFILE.to_string(),
            resources: self.resources.clone(),
        };
        Ok(Bytes::from(serde_json::to_vec(&manifest)?))
    }

    fn central_directory(&mut self) -> Result<Bytes> {
        let cd_offset = self.offset;
        let mut out = Vec::new();
        for record in &self.records {
            record.write(&mut out)?;
        }
        let cd_size = out.len() as u64;
        let entries = self.records.len() as u64;

        let needs_zip64 = entries >= 0xFFFF || cd_size >= 0xFFFFFFFF || cd_offset >= 0xFFFFFFFF;
        if needs_zip64 {
            let eocd64_offset = cd_offset + cd_size;
            Zip64EOCD::write(entries, cd_size, cd_offset, &mut out)?;
            Zip64EOCDLocator::write(eocd64_offset, &mut out)?;
        }
        EndOfCentralDirectory::write(entries, cd_size, cd_offset, &mut out)?;

        debug!(entries, cd_offset, total = cd_offset + out.len() as u64, "zip central directory");
        self.offset += out.len() as u64;
        Ok(Bytes::from(out))
    }
}
