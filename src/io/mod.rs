//! Object store access.
//!
//! Everything above this module talks to remote storage through two traits:
//! [`ObjectStore`] for byte-range reads and plain writes, and
//! [`MultipartStore`] for the three-call multipart upload protocol. The
//! backends are S3-compatible stores ([`S3ObjectStore`]), public buckets
//! reachable over plain HTTP ([`HttpObjectStore`]) and an in-process store
//! ([`MemoryObjectStore`]).

mod http;
mod memory;
mod s3;

pub use http::HttpObjectStore;
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};

use crate::error::{Error, Result};

/// Lazy stream of byte chunks. Dropping it releases the underlying response.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// S3's lower bound for every multipart part except the last.
pub const S3_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Identifies one object in a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub endpoint: String,
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Same endpoint and bucket, different key.
    pub fn with_key(&self, key: impl Into<String>) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            bucket: self.bucket.clone(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Byte interval of an object. `end` is inclusive; `None` reads to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Closed range `start..=end`.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if end < start {
            return Err(Error::InvalidConfig(format!(
                "byte range end {end} precedes start {start}"
            )));
        }
        Ok(Self {
            start,
            end: Some(end),
        })
    }

    /// `len` bytes starting at `start`.
    pub fn with_len(start: u64, len: u64) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidConfig("empty byte range".to_string()));
        }
        let end = start.checked_add(len - 1).ok_or_else(|| {
            Error::InvalidConfig(format!("byte range of {len} bytes at {start} overflows"))
        })?;
        Self::new(start, end)
    }

    /// Everything from `start` to the end of the object.
    pub fn starting_at(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Value for an HTTP `Range` header.
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }

    /// Number of bytes the range covers in an object of `size` bytes.
    pub fn len_within(&self, size: u64) -> u64 {
        let end = self.end.map_or(size, |end| end + 1).min(size);
        end.saturating_sub(self.start)
    }

    /// Fails with [`Error::RangeUnsatisfiable`] if the range does not fit
    /// inside an object of `size` bytes.
    pub fn check_within(&self, key: &str, size: u64) -> Result<()> {
        let fits = match self.end {
            Some(end) => end < size,
            None => self.start < size || (self.start == 0 && size == 0),
        };
        if fits {
            Ok(())
        } else {
            Err(Error::RangeUnsatisfiable {
                key: key.to_string(),
                range: self.header_value(),
                size: Some(size),
            })
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header_value())
    }
}

/// Random access to objects in a store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Total size of the object in bytes.
    async fn object_size(&self, object: &ObjectRef) -> Result<u64>;

    /// Issue one read scoped to `range`. Never retries.
    async fn read_range(&self, object: &ObjectRef, range: ByteRange) -> Result<ByteStream>;

    /// Store `data` as the whole object.
    async fn put_object(&self, object: &ObjectRef, data: Bytes) -> Result<()>;

    /// Remove the object. Deleting a missing object is not an error.
    async fn delete_object(&self, object: &ObjectRef) -> Result<()>;
}

/// Stores that accept the create / upload-part / complete-or-abort protocol.
#[async_trait]
pub trait MultipartStore: Send + Sync {
    /// Start a session, returning its upload id.
    async fn create_multipart_upload(&self, object: &ObjectRef) -> Result<String>;

    /// Upload one numbered part, returning its entity tag.
    async fn upload_part(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String>;

    /// Assemble the listed parts (ascending part numbers) into the object.
    async fn complete_multipart_upload(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;

    /// Discard the session and every part uploaded so far.
    async fn abort_multipart_upload(&self, object: &ObjectRef, upload_id: &str) -> Result<()>;

    /// Smallest size accepted for any part but the last.
    fn min_part_size(&self) -> usize {
        S3_MIN_PART_SIZE
    }
}

/// A successfully uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Read an entire range into memory. Only used for small structural reads.
pub async fn read_range_to_vec<S>(store: &S, object: &ObjectRef, range: ByteRange) -> Result<Vec<u8>>
where
    S: ObjectStore + ?Sized,
{
    let mut stream = store.read_range(object, range).await?;
    let mut buf = Vec::new();
    while let Some(chunk) = stream.try_next().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// Lazy stream over a whole object; the read is issued on first poll.
pub fn lazy_object_stream<S>(store: Arc<S>, object: ObjectRef) -> ByteStream
where
    S: ObjectStore + ?Sized + 'static,
{
    futures::stream::once(open_whole_object(store, object))
        .try_flatten()
        .boxed()
}

async fn open_whole_object<S>(store: Arc<S>, object: ObjectRef) -> Result<ByteStream>
where
    S: ObjectStore + ?Sized,
{
    // "bytes=0-" is unsatisfiable for an empty object
    if store.object_size(&object).await? == 0 {
        return Ok(futures::stream::empty().boxed());
    }
    store.read_range(&object, ByteRange::starting_at(0)).await
}
