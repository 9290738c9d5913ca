//! Streaming access to the data of one archive member.

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use flate2::{Crc, Decompress, FlushDecompress, Status};
use futures::{StreamExt, TryStreamExt};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::io::{ByteRange, ByteStream, ObjectRef, ObjectStore, read_range_to_vec};

use super::structures::{CompressionMethod, LFH_SIGNATURE, LFH_SIZE, ZipEntryMeta};

/// Upper bound on one chunk of inflated output.
const INFLATE_CHUNK: usize = 64 * 1024;

/// Opens decoded byte streams for entries of a resolved archive.
pub struct ZipEntryStreamer<S: ObjectStore + ?Sized> {
    store: Arc<S>,
}

impl<S: ObjectStore + ?Sized> Clone for ZipEntryStreamer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: ObjectStore + ?Sized> ZipEntryStreamer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Stream the uncompressed bytes of `meta`.
    ///
    /// Reads the entry's local file header first (its name and extra field
    /// lengths can differ from the central directory), then issues one range
    /// read for exactly the compressed payload. The returned stream fails
    /// with [`Error::MalformedArchive`] if the decoded length or CRC-32 does
    /// not match `meta`.
    pub async fn open_entry(
        &self,
        object: &ObjectRef,
        central_directory_offset: u64,
        meta: &ZipEntryMeta,
    ) -> Result<ByteStream> {
        if let CompressionMethod::Unknown(method) = meta.compression_method {
            return Err(Error::UnsupportedCompression {
                name: meta.name.clone(),
                method,
            });
        }

        let data_offset = self
            .data_offset(object, central_directory_offset, meta)
            .await?;
        debug!(%object, entry = %meta.name, data_offset, "opening entry");

        let raw = if meta.compressed_size == 0 {
            futures::stream::empty().boxed()
        } else {
            let range = ByteRange::with_len(data_offset, meta.compressed_size)?;
            self.store.read_range(object, range).await?
        };

        let decoded = match meta.compression_method {
            CompressionMethod::Deflate => inflate(raw, meta.name.clone()),
            _ => raw,
        };
        Ok(verify(decoded, meta))
    }

    /// Offset of the first payload byte, read from the local file header.
    async fn data_offset(
        &self,
        object: &ObjectRef,
        central_directory_offset: u64,
        meta: &ZipEntryMeta,
    ) -> Result<u64> {
        let header_end = meta
            .local_header_offset
            .checked_add(LFH_SIZE as u64)
            .filter(|end| *end <= central_directory_offset);
        let Some(header_end) = header_end else {
            return Err(Error::malformed(format!(
                "local header of {} overlaps the central directory",
                meta.name
            )));
        };

        let range = ByteRange::with_len(meta.local_header_offset, LFH_SIZE as u64)?;
        let lfh_buf = read_range_to_vec(self.store.as_ref(), object, range).await?;

        // Verify LFH signature (PK\x03\x04)
        if lfh_buf.len() < LFH_SIZE || &lfh_buf[0..4] != LFH_SIGNATURE {
            return Err(Error::malformed(format!(
                "invalid local file header for {}",
                meta.name
            )));
        }

        // Read the variable field lengths from fixed positions in LFH
        let mut cursor = Cursor::new(&lfh_buf);
        cursor.set_position(26);
        let file_name_length = cursor.read_u16::<LittleEndian>()? as u64;
        let extra_field_length = cursor.read_u16::<LittleEndian>()? as u64;

        // Data starts after: LFH (30 bytes) + filename + extra field
        let data_offset = header_end.checked_add(file_name_length + extra_field_length);
        let data_end = data_offset.and_then(|offset| offset.checked_add(meta.compressed_size));
        match (data_offset, data_end) {
            (Some(offset), Some(end)) if end <= central_directory_offset => Ok(offset),
            _ => Err(Error::malformed(format!(
                "data of {} runs past the central directory",
                meta.name
            ))),
        }
    }
}

/// Raw DEFLATE decoder fed one input chunk at a time.
struct Inflater {
    input: ByteStream,
    decompress: Decompress,
    pending: Bytes,
    input_done: bool,
    finished: bool,
    name: String,
}

impl Inflater {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if self.pending.is_empty() && !self.input_done {
                match self.input.try_next().await? {
                    Some(chunk) => {
                        self.pending = chunk;
                        continue;
                    }
                    None => self.input_done = true,
                }
            }

            let flush = if self.input_done {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };
            let mut out = vec![0u8; INFLATE_CHUNK];
            let in_before = self.decompress.total_in();
            let out_before = self.decompress.total_out();
            let status = self
                .decompress
                .decompress(&self.pending, &mut out, flush)
                .map_err(|e| Error::malformed(format!("corrupt deflate data in {}: {e}", self.name)))?;
            let consumed = (self.decompress.total_in() - in_before) as usize;
            let produced = (self.decompress.total_out() - out_before) as usize;
            self.pending = self.pending.slice(consumed..);

            if status == Status::StreamEnd {
                self.finished = true;
            }
            if produced > 0 {
                out.truncate(produced);
                return Ok(Some(Bytes::from(out)));
            }
            if self.finished {
                return Ok(None);
            }
            if consumed == 0 && (self.input_done || !self.pending.is_empty()) {
                return Err(Error::malformed(format!(
                    "truncated deflate data in {}",
                    self.name
                )));
            }
        }
    }
}

fn inflate(input: ByteStream, name: String) -> ByteStream {
    let inflater = Inflater {
        input,
        decompress: Decompress::new(false),
        pending: Bytes::new(),
        input_done: false,
        finished: false,
        name,
    };
    futures::stream::try_unfold(inflater, |mut inflater| async move {
        let chunk = inflater.next_chunk().await?;
        Ok::<_, Error>(chunk.map(|chunk| (chunk, inflater)))
    })
    .boxed()
}

/// Running length and CRC-32 check against the central directory.
struct Verifier {
    input: ByteStream,
    crc: Crc,
    seen: u64,
    expected_size: u64,
    expected_crc: u32,
    name: String,
}

fn verify(input: ByteStream, meta: &ZipEntryMeta) -> ByteStream {
    let verifier = Verifier {
        input,
        crc: Crc::new(),
        seen: 0,
        expected_size: meta.uncompressed_size,
        expected_crc: meta.crc32,
        name: meta.name.clone(),
    };
    futures::stream::try_unfold(verifier, |mut v| async move {
        match v.input.try_next().await? {
            Some(chunk) => {
                v.seen += chunk.len() as u64;
                if v.seen > v.expected_size {
                    return Err(Error::malformed(format!(
                        "{} decodes to more than {} bytes",
                        v.name, v.expected_size
                    )));
                }
                v.crc.update(&chunk);
                Ok(Some((chunk, v)))
            }
            None => {
                if v.seen != v.expected_size {
                    return Err(Error::malformed(format!(
                        "{} decoded to {} bytes, expected {}",
                        v.name, v.seen, v.expected_size
                    )));
                }
                if v.crc.sum() != v.expected_crc {
                    return Err(Error::malformed(format!(
                        "CRC-32 mismatch for {}: {:08x} != {:08x}",
                        v.name,
                        v.crc.sum(),
                        v.expected_crc
                    )));
                }
                Ok(None)
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use std::io::Write;

    fn chunked(data: &[u8], size: usize) -> ByteStream {
        let chunks: Vec<Result<Bytes>> = data
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(chunks).boxed()
    }

    async fn collect(mut stream: ByteStream) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.try_next().await? {
            assert!(chunk.len() <= INFLATE_CHUNK);
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn inflates_across_tiny_input_chunks() {
        let original: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = deflate(&original);
        let out = collect(inflate(chunked(&compressed, 7), "t".into()))
            .await
            .unwrap();
        assert_eq!(out, original);
    }

    #[tokio::test]
    async fn offsets_near_u64_max_are_malformed() {
        let store = Arc::new(crate::io::MemoryObjectStore::new());
        let object = ObjectRef::new("mem://", "b", "a.zip");
        let mut data = vec![0u8; 64];
        data[..4].copy_from_slice(b"PK\x03\x04");
        store.insert(&object, data);
        let streamer = ZipEntryStreamer::new(store);

        let mut meta = ZipEntryMeta {
            name: "huge".into(),
            compression_method: CompressionMethod::Stored,
            compressed_size: 10,
            uncompressed_size: 10,
            crc32: 0,
            local_header_offset: u64::MAX - 10,
            last_mod_time: 0,
            last_mod_date: 0,
            is_directory: false,
        };
        let err = streamer.open_entry(&object, u64::MAX, &meta).await.err().unwrap();
        assert!(matches!(err, Error::MalformedArchive(_)));

        meta.local_header_offset = 0;
        meta.compressed_size = u64::MAX;
        let err = streamer.open_entry(&object, 64, &meta).await.err().unwrap();
        assert!(matches!(err, Error::MalformedArchive(_)));
    }

    #[tokio::test]
    async fn truncated_deflate_is_malformed() {
        let compressed = deflate(b"hello hello hello hello");
        let cut = &compressed[..compressed.len() / 2];
        let err = collect(inflate(chunked(cut, 4), "t".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedArchive(_)));
    }
}
