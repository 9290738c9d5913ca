//! Chunked multipart upload with all-or-nothing completion.

use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_PART_SIZE;
use crate::error::{Error, Result};
use crate::io::{ByteStream, CompletedPart, MultipartStore, ObjectRef};

/// Lifecycle of one upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Idle,
    Created,
    Uploading,
    Completed,
    Aborted,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadPhase::Idle => "idle",
            UploadPhase::Created => "created",
            UploadPhase::Uploading => "uploading",
            UploadPhase::Completed => "completed",
            UploadPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Remote session state owned by a single upload call.
#[derive(Debug, Clone)]
pub struct MultipartUploadSession {
    pub object: ObjectRef,
    pub upload_id: String,
    /// Parts in upload order; part numbers run 1, 2, 3, ... without gaps.
    pub parts: Vec<CompletedPart>,
    pub phase: UploadPhase,
    pub bytes_uploaded: u64,
}

impl MultipartUploadSession {
    fn new(object: ObjectRef, upload_id: String) -> Self {
        Self {
            object,
            upload_id,
            parts: Vec::new(),
            phase: UploadPhase::Created,
            bytes_uploaded: 0,
        }
    }

    /// Number the next part will carry.
    pub fn next_part_number(&self) -> u32 {
        self.parts.len() as u32 + 1
    }

    fn record_part(&mut self, etag: String, len: usize) {
        let part_number = self.next_part_number();
        self.parts.push(CompletedPart { part_number, etag });
        self.bytes_uploaded += len as u64;
        self.phase = UploadPhase::Uploading;
    }
}

/// Result of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub object: ObjectRef,
    pub upload_id: String,
    pub parts: Vec<CompletedPart>,
    pub size: u64,
}

/// Cuts an arbitrary chunk sequence into parts of exactly `part_size`
/// bytes. Whatever is left at the end becomes the final, smaller part.
#[derive(Debug)]
pub struct PartAccumulator {
    buffer: BytesMut,
    part_size: usize,
}

impl PartAccumulator {
    pub fn new(part_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            part_size: part_size.max(1),
        }
    }

    /// Add a chunk and return every part it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut ready = Vec::new();
        while self.buffer.len() >= self.part_size {
            ready.push(self.buffer.split_to(self.part_size).freeze());
        }
        ready
    }

    /// Flush the remainder. `None` if nothing is buffered.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Aborts the session from a spawned task unless disarmed first. Covers
/// the upload future being dropped half way.
struct AbortOnDrop<M: MultipartStore + ?Sized + 'static> {
    armed: Option<(Arc<M>, ObjectRef, String)>,
}

impl<M: MultipartStore + ?Sized + 'static> AbortOnDrop<M> {
    fn disarm(&mut self) {
        self.armed = None;
    }
}

impl<M: MultipartStore + ?Sized + 'static> Drop for AbortOnDrop<M> {
    fn drop(&mut self) {
        let Some((store, object, upload_id)) = self.armed.take() else {
            return;
        };
        warn!(%object, %upload_id, "upload cancelled, aborting session");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = store.abort_multipart_upload(&object, &upload_id).await {
                        warn!(%object, %upload_id, error = %err, "abort after cancellation failed");
                    }
                });
            }
            Err(_) => warn!(%object, %upload_id, "no runtime left to abort the session"),
        }
    }
}

/// Uploads byte streams through the multipart protocol.
///
/// Any failure after the session exists (a part, the input stream or the
/// completion call) aborts the session before the error is returned, so a
/// partial object never becomes visible. Nothing is retried.
pub struct MultipartUploader<M: MultipartStore + ?Sized> {
    store: Arc<M>,
    part_size: usize,
}

impl<M: MultipartStore + ?Sized + 'static> MultipartUploader<M> {
    /// Uploader using the default part size, raised to the store minimum.
    pub fn new(store: Arc<M>) -> Self {
        let part_size = DEFAULT_PART_SIZE.max(store.min_part_size());
        Self { store, part_size }
    }

    /// Use `part_size` bytes for every part but the last.
    pub fn with_part_size(mut self, part_size: usize) -> Result<Self> {
        let minimum = self.store.min_part_size().max(1);
        if part_size < minimum {
            return Err(Error::InvalidConfig(format!(
                "part size {part_size} is below the store minimum of {minimum} bytes"
            )));
        }
        self.part_size = part_size;
        Ok(self)
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }

    /// Upload `input` as `object`.
    ///
    /// # Errors
    ///
    /// A failed create call is returned as is, there is nothing to roll
    /// back yet. Every later failure comes back as
    /// [`Error::UploadAborted`] carrying the original error and, if the
    /// abort call failed as well, that error too.
    pub async fn upload(&self, object: &ObjectRef, input: ByteStream) -> Result<CompletedUpload> {
        let upload_id = self.store.create_multipart_upload(object).await?;
        info!(%object, %upload_id, part_size = self.part_size, "multipart upload created");

        let mut guard = AbortOnDrop {
            armed: Some((Arc::clone(&self.store), object.clone(), upload_id.clone())),
        };
        let mut session = MultipartUploadSession::new(object.clone(), upload_id);

        match self.run(&mut session, input).await {
            Ok(()) => {
                guard.disarm();
                session.phase = UploadPhase::Completed;
                info!(
                    %object,
                    upload_id = %session.upload_id,
                    parts = session.parts.len(),
                    bytes = session.bytes_uploaded,
                    "multipart upload completed"
                );
                Ok(CompletedUpload {
                    object: session.object,
                    upload_id: session.upload_id,
                    parts: session.parts,
                    size: session.bytes_uploaded,
                })
            }
            Err(err) => {
                let failure = self.abort(&mut session, err).await;
                guard.disarm();
                Err(failure)
            }
        }
    }

    async fn run(&self, session: &mut MultipartUploadSession, mut input: ByteStream) -> Result<()> {
        let mut accumulator = PartAccumulator::new(self.part_size);
        while let Some(chunk) = input.try_next().await? {
            for part in accumulator.push(&chunk) {
                self.send_part(session, part).await?;
            }
        }
        match accumulator.finish() {
            Some(last) => self.send_part(session, last).await?,
            // The protocol needs at least one part, even for empty input
            None if session.parts.is_empty() => self.send_part(session, Bytes::new()).await?,
            None => {}
        }

        self.store
            .complete_multipart_upload(&session.object, &session.upload_id, &session.parts)
            .await
    }

    async fn send_part(&self, session: &mut MultipartUploadSession, part: Bytes) -> Result<()> {
        let part_number = session.next_part_number();
        let len = part.len();
        let etag = self
            .store
            .upload_part(&session.object, &session.upload_id, part_number, part)
            .await?;
        debug!(upload_id = %session.upload_id, part_number, len, %etag, "part uploaded");
        session.record_part(etag, len);
        Ok(())
    }

    async fn abort(&self, session: &mut MultipartUploadSession, err: Error) -> Error {
        warn!(
            object = %session.object,
            upload_id = %session.upload_id,
            phase = %session.phase,
            parts = session.parts.len(),
            error = %err,
            "multipart upload failed, aborting"
        );
        let abort_error = match self
            .store
            .abort_multipart_upload(&session.object, &session.upload_id)
            .await
        {
            Ok(()) => None,
            Err(abort_err) => {
                warn!(upload_id = %session.upload_id, error = %abort_err, "abort failed");
                Some(Box::new(abort_err))
            }
        };
        session.phase = UploadPhase::Aborted;
        Error::UploadAborted {
            upload_id: session.upload_id.clone(),
            source: Box::new(err),
            abort_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_cuts_exact_parts() {
        let mut acc = PartAccumulator::new(4);
        assert!(acc.push(b"ab").is_empty());
        let parts = acc.push(b"cdefghij");
        assert_eq!(parts, vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")]);
        assert_eq!(acc.buffered(), 2);
        assert_eq!(acc.finish(), Some(Bytes::from_static(b"ij")));
        assert_eq!(acc.finish(), None);
    }

    #[test]
    fn exact_multiple_leaves_no_tail() {
        let mut acc = PartAccumulator::new(3);
        assert_eq!(acc.push(b"abcdef").len(), 2);
        assert_eq!(acc.finish(), None);
    }

    #[test]
    fn session_numbers_parts_from_one() {
        let object = ObjectRef::new("http://s3", "b", "k");
        let mut session = MultipartUploadSession::new(object, "id".into());
        assert_eq!(session.next_part_number(), 1);
        session.record_part("e1".into(), 10);
        session.record_part("e2".into(), 3);
        let numbers: Vec<u32> = session.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, [1, 2]);
        assert_eq!(session.bytes_uploaded, 13);
        assert_eq!(session.phase, UploadPhase::Uploading);
    }
}
