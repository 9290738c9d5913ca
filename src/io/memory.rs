use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::{ByteRange, ByteStream, CompletedPart, MultipartStore, ObjectRef, ObjectStore};
use crate::error::{Error, Result};

/// Default size of the chunks handed out by [`MemoryObjectStore::read_range`].
const DEFAULT_RESPONSE_CHUNK: usize = 64 * 1024;

#[derive(Default)]
struct Inner {
    objects: HashMap<(String, String), Bytes>,
    uploads: HashMap<String, PendingUpload>,
}

struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

/// In-process object store with the same range and multipart semantics as
/// the remote backends.
///
/// Range responses are split into chunks of a configurable size so callers
/// see realistic chunk boundaries.
pub struct MemoryObjectStore {
    inner: Mutex<Inner>,
    response_chunk: usize,
    min_part_size: usize,
    range_reads: AtomicU64,
    next_upload: AtomicU64,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            response_chunk: DEFAULT_RESPONSE_CHUNK,
            min_part_size: 1,
            range_reads: AtomicU64::new(0),
            next_upload: AtomicU64::new(1),
        }
    }

    /// Split range responses into chunks of at most `size` bytes.
    pub fn with_response_chunk(mut self, size: usize) -> Self {
        self.response_chunk = size.max(1);
        self
    }

    /// Enforce a minimum size for every part but the last.
    pub fn with_min_part_size(mut self, size: usize) -> Self {
        self.min_part_size = size.max(1);
        self
    }

    /// Store an object directly.
    pub fn insert(&self, object: &ObjectRef, data: impl Into<Bytes>) {
        self.lock()
            .objects
            .insert(Self::id(object), data.into());
    }

    /// Current contents of an object, if present.
    pub fn get(&self, object: &ObjectRef) -> Option<Bytes> {
        self.lock().objects.get(&Self::id(object)).cloned()
    }

    /// Number of range reads served so far.
    pub fn range_reads(&self) -> u64 {
        self.range_reads.load(Ordering::Relaxed)
    }

    /// Number of multipart sessions neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    fn id(object: &ObjectRef) -> (String, String) {
        (object.bucket.clone(), object.key.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn not_found(object: &ObjectRef) -> Error {
        Error::ObjectNotFound {
            bucket: object.bucket.clone(),
            key: object.key.clone(),
        }
    }

    fn unknown_upload(upload_id: &str) -> Error {
        Error::TransientIo {
            message: format!("no such multipart upload: {upload_id}"),
            source: None,
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn object_size(&self, object: &ObjectRef) -> Result<u64> {
        self.lock()
            .objects
            .get(&Self::id(object))
            .map(|data| data.len() as u64)
            .ok_or_else(|| Self::not_found(object))
    }

    async fn read_range(&self, object: &ObjectRef, range: ByteRange) -> Result<ByteStream> {
        let data = self
            .lock()
            .objects
            .get(&Self::id(object))
            .cloned()
            .ok_or_else(|| Self::not_found(object))?;
        range.check_within(&object.key, data.len() as u64)?;
        self.range_reads.fetch_add(1, Ordering::Relaxed);
        debug!(%object, %range, "memory range read");

        let start = range.start as usize;
        let end = start + range.len_within(data.len() as u64) as usize;
        let body = data.slice(start..end);
        let chunks: Vec<Result<Bytes>> = body
            .chunks(self.response_chunk)
            .map(|chunk| Ok(body.slice_ref(chunk)))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn put_object(&self, object: &ObjectRef, data: Bytes) -> Result<()> {
        self.insert(object, data);
        Ok(())
    }

    async fn delete_object(&self, object: &ObjectRef) -> Result<()> {
        self.lock().objects.remove(&Self::id(object));
        Ok(())
    }
}

#[async_trait]
impl MultipartStore for MemoryObjectStore {
    async fn create_multipart_upload(&self, object: &ObjectRef) -> Result<String> {
        let upload_id = format!("mem-upload-{}", self.next_upload.fetch_add(1, Ordering::Relaxed));
        self.lock().uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let mut inner = self.lock();
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| Self::unknown_upload(upload_id))?;
        let etag = format!("\"{upload_id}-{part_number}-{}\"", data.len());
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let mut inner = self.lock();
        let upload = inner
            .uploads
            .remove(upload_id)
            .ok_or_else(|| Self::unknown_upload(upload_id))?;
        if upload.bucket != object.bucket || upload.key != object.key {
            return Err(Error::InvalidConfig(format!(
                "upload {upload_id} belongs to {}/{}",
                upload.bucket, upload.key
            )));
        }

        let mut body = BytesMut::new();
        for (index, part) in parts.iter().enumerate() {
            let (etag, data) = upload.parts.get(&part.part_number).ok_or_else(|| {
                Error::InvalidConfig(format!("part {} was never uploaded", part.part_number))
            })?;
            if *etag != part.etag {
                return Err(Error::InvalidConfig(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            if index + 1 < parts.len() && data.len() < self.min_part_size {
                return Err(Error::InvalidConfig(format!(
                    "part {} is smaller than {} bytes",
                    part.part_number, self.min_part_size
                )));
            }
            body.extend_from_slice(data);
        }
        inner
            .objects
            .insert((upload.bucket, upload.key), body.freeze());
        Ok(())
    }

    async fn abort_multipart_upload(&self, _object: &ObjectRef, upload_id: &str) -> Result<()> {
        self.lock()
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| Self::unknown_upload(upload_id))
    }

    fn min_part_size(&self) -> usize {
        self.min_part_size
    }
}
