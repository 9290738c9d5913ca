#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use futures::{StreamExt, TryStreamExt};
use std::io::Write;
use std::sync::{Arc, Mutex};
use wacz_stream::io::{ByteStream, CompletedPart, MemoryObjectStore, MultipartStore, ObjectRef};
use wacz_stream::{Error, Result};

// Common test constants
pub const TEST_ENDPOINT: &str = "http://store.test";
pub const TEST_BUCKET: &str = "crawls";

/// Reference to `key` in the test bucket
pub fn object(key: &str) -> ObjectRef {
    ObjectRef::new(TEST_ENDPOINT, TEST_BUCKET, key)
}

/// Creates test content of the given size
pub fn create_test_content(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Drains a byte stream into memory
pub async fn collect_bytes(mut stream: ByteStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.try_next().await? {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Byte stream yielding `data` in `chunk`-sized pieces
pub fn chunked_stream(data: Vec<u8>, chunk: usize) -> ByteStream {
    let chunks: Vec<Result<Bytes>> = data
        .chunks(chunk.max(1))
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    futures::stream::iter(chunks).boxed()
}

/// Store holding the given objects
pub fn store_with(objects: &[(&str, Vec<u8>)]) -> Arc<MemoryObjectStore> {
    let store = MemoryObjectStore::new();
    for (key, data) in objects {
        store.insert(&object(key), data.clone());
    }
    Arc::new(store)
}

pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATE: u16 = 8;

/// One member of a hand-built test archive
pub struct TestEntry {
    pub name: String,
    pub data: Vec<u8>,
    pub method: u16,
    pub local_extra: Vec<u8>,
}

/// Builds classic zip archives (sizes in the local headers) for reader tests
#[derive(Default)]
pub struct ZipBuilder {
    entries: Vec<TestEntry>,
    comment: Vec<u8>,
    zip64: bool,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(mut self, name: &str, data: &[u8]) -> Self {
        self.push(name, data, METHOD_STORED);
        self
    }

    pub fn deflated(mut self, name: &str, data: &[u8]) -> Self {
        self.push(name, data, METHOD_DEFLATE);
        self
    }

    pub fn with_method(mut self, name: &str, data: &[u8], method: u16) -> Self {
        self.push(name, data, method);
        self
    }

    pub fn directory(mut self, name: &str) -> Self {
        self.push(name, b"", METHOD_STORED);
        self
    }

    /// Extra field bytes in the last entry's local header only
    pub fn local_extra(mut self, extra: &[u8]) -> Self {
        if let Some(last) = self.entries.last_mut() {
            last.local_extra = extra.to_vec();
        }
        self
    }

    pub fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    /// Route sizes, offsets and counts through ZIP64 records
    pub fn zip64(mut self) -> Self {
        self.zip64 = true;
        self
    }

    fn push(&mut self, name: &str, data: &[u8], method: u16) {
        self.entries.push(TestEntry {
            name: name.to_string(),
            data: data.to_vec(),
            method,
            local_extra: Vec::new(),
        });
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();

        for entry in &self.entries {
            let crc = crc32(&entry.data);
            let payload = match entry.method {
                METHOD_DEFLATE => deflate(&entry.data),
                _ => entry.data.clone(),
            };
            let offset = out.len() as u64;

            out.extend_from_slice(b"PK\x03\x04");
            put16(&mut out, 20);
            put16(&mut out, 0);
            put16(&mut out, entry.method);
            put16(&mut out, 0x6000);
            put16(&mut out, 0x5821);
            put32(&mut out, crc);
            put32(&mut out, payload.len() as u32);
            put32(&mut out, entry.data.len() as u32);
            put16(&mut out, entry.name.len() as u16);
            put16(&mut out, entry.local_extra.len() as u16);
            out.extend_from_slice(entry.name.as_bytes());
            out.extend_from_slice(&entry.local_extra);
            out.extend_from_slice(&payload);

            central.extend_from_slice(b"PK\x01\x02");
            put16(&mut central, 20);
            put16(&mut central, if self.zip64 { 45 } else { 20 });
            put16(&mut central, 0);
            put16(&mut central, entry.method);
            put16(&mut central, 0x6000);
            put16(&mut central, 0x5821);
            put32(&mut central, crc);
            if self.zip64 {
                put32(&mut central, 0xFFFFFFFF);
                put32(&mut central, 0xFFFFFFFF);
            } else {
                put32(&mut central, payload.len() as u32);
                put32(&mut central, entry.data.len() as u32);
            }
            put16(&mut central, entry.name.len() as u16);
            put16(&mut central, if self.zip64 { 28 } else { 0 });
            put16(&mut central, 0);
            put16(&mut central, 0);
            put16(&mut central, 0);
            put32(&mut central, if entry.name.ends_with('/') { 0x10 } else { 0 });
            put32(&mut central, if self.zip64 { 0xFFFFFFFF } else { offset as u32 });
            central.extend_from_slice(entry.name.as_bytes());
            if self.zip64 {
                put16(&mut central, 0x0001);
                put16(&mut central, 24);
                put64(&mut central, entry.data.len() as u64);
                put64(&mut central, payload.len() as u64);
                put64(&mut central, offset);
            }
        }

        let cd_offset = out.len() as u64;
        let cd_size = central.len() as u64;
        let count = self.entries.len() as u64;
        out.extend_from_slice(&central);

        if self.zip64 {
            let eocd64_offset = out.len() as u64;
            out.extend_from_slice(b"PK\x06\x06");
            put64(&mut out, 44);
            put16(&mut out, 45);
            put16(&mut out, 45);
            put32(&mut out, 0);
            put32(&mut out, 0);
            put64(&mut out, count);
            put64(&mut out, count);
            put64(&mut out, cd_size);
            put64(&mut out, cd_offset);

            out.extend_from_slice(b"PK\x06\x07");
            put32(&mut out, 0);
            put64(&mut out, eocd64_offset);
            put32(&mut out, 1);
        }

        out.extend_from_slice(b"PK\x05\x06");
        put16(&mut out, 0);
        put16(&mut out, 0);
        if self.zip64 {
            put16(&mut out, 0xFFFF);
            put16(&mut out, 0xFFFF);
            put32(&mut out, 0xFFFFFFFF);
            put32(&mut out, 0xFFFFFFFF);
        } else {
            put16(&mut out, count as u16);
            put16(&mut out, count as u16);
            put32(&mut out, cd_size as u32);
            put32(&mut out, cd_offset as u32);
        }
        put16(&mut out, self.comment.len() as u16);
        out.extend_from_slice(&self.comment);
        out
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(data);
    crc.sum()
}

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("deflate into memory");
    encoder.finish().expect("finish deflate")
}

fn put16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// NDJSON log line as written by the crawler
pub fn log_line(ts: &str, level: &str, context: &str, message: &str) -> String {
    format!(
        r#"{{"timestamp":"{ts}","logLevel":"{level}","context":"{context}","message":"{message}"}}"#
    )
}

/// Calls seen by [`FailingMultipartStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartCall {
    Create,
    UploadPart { part_number: u32, len: usize },
    Complete { upload_id: String, parts: Vec<CompletedPart> },
    Abort { upload_id: String },
}

/// Memory-backed multipart store that records calls and fails on demand
pub struct FailingMultipartStore {
    pub inner: MemoryObjectStore,
    pub calls: Mutex<Vec<MultipartCall>>,
    pub fail_part: Option<u32>,
    pub fail_complete: bool,
    pub fail_abort: bool,
}

impl FailingMultipartStore {
    pub fn new(min_part_size: usize) -> Self {
        Self {
            inner: MemoryObjectStore::new().with_min_part_size(min_part_size),
            calls: Mutex::new(Vec::new()),
            fail_part: None,
            fail_complete: false,
            fail_abort: false,
        }
    }

    pub fn failing_part(mut self, part_number: u32) -> Self {
        self.fail_part = Some(part_number);
        self
    }

    pub fn failing_complete(mut self) -> Self {
        self.fail_complete = true;
        self
    }

    pub fn failing_abort(mut self) -> Self {
        self.fail_abort = true;
        self
    }

    pub fn calls(&self) -> Vec<MultipartCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: MultipartCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MultipartStore for FailingMultipartStore {
    async fn create_multipart_upload(&self, object: &ObjectRef) -> Result<String> {
        self.record(MultipartCall::Create);
        self.inner.create_multipart_upload(object).await
    }

    async fn upload_part(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        self.record(MultipartCall::UploadPart {
            part_number,
            len: data.len(),
        });
        if self.fail_part == Some(part_number) {
            return Err(Error::transient(
                format!("simulated failure of part {part_number}"),
                "connection reset",
            ));
        }
        self.inner.upload_part(object, upload_id, part_number, data).await
    }

    async fn complete_multipart_upload(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        self.record(MultipartCall::Complete {
            upload_id: upload_id.to_string(),
            parts: parts.to_vec(),
        });
        if self.fail_complete {
            return Err(Error::transient("simulated completion failure", "503"));
        }
        self.inner
            .complete_multipart_upload(object, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, object: &ObjectRef, upload_id: &str) -> Result<()> {
        self.record(MultipartCall::Abort {
            upload_id: upload_id.to_string(),
        });
        if self.fail_abort {
            return Err(Error::transient("simulated abort failure", "503"));
        }
        self.inner.abort_multipart_upload(object, upload_id).await
    }

    fn min_part_size(&self) -> usize {
        self.inner.min_part_size()
    }
}

/// Asserts that an error is the given variant
#[macro_export]
macro_rules! assert_err {
    ($result:expr, $pattern:pat) => {
        match $result {
            Err(err) => assert!(matches!(err, $pattern), "unexpected error: {err:?}"),
            Ok(_) => panic!("expected an error"),
        }
    };
}
