//! Central directory resolution for remote archives.
//!
//! This module locates and parses the zip index of an object that lives in
//! an [`ObjectStore`], using byte-range reads only.
//!
//! ## Resolution Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Read the tail of the object (one range read, [`TAIL_PROBE_SIZE`] bytes)
//! 2. Find the End of Central Directory (EOCD) in that tail, falling back to
//!    a second, larger tail read covering the longest possible comment
//! 3. If ZIP64, read the ZIP64 EOCD for large archive support
//! 4. Parse the Central Directory, usually straight out of the tail bytes
//!
//! For a typical WACZ the whole index arrives with the first request.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::sync::Arc;
use tracing::debug;

use crate::config::TAIL_PROBE_SIZE;
use crate::error::{Error, Result};
use crate::io::{ByteRange, ObjectRef, ObjectStore, read_range_to_vec};

use super::structures::*;

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for EOCD with a comment.
const MAX_COMMENT_SIZE: u64 = 65535;

/// Parsed index of one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipIndex {
    /// Offset of the first central directory header. Every member's data
    /// ends before this point.
    pub central_directory_offset: u64,
    /// Entries in central directory order.
    pub entries: Vec<ZipEntryMeta>,
    /// Total size of the object the index was read from.
    pub object_size: u64,
}

impl ZipIndex {
    /// Look up an entry by exact name.
    pub fn find(&self, name: &str) -> Option<&ZipEntryMeta> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Non-directory entries whose name starts with `prefix`.
    pub fn files_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a ZipEntryMeta> + 'a {
        self.entries
            .iter()
            .filter(move |entry| !entry.is_directory && entry.name.starts_with(prefix))
    }
}

/// Tail bytes fetched from the object, with their position.
struct Tail {
    start: u64,
    data: Vec<u8>,
}

impl Tail {
    /// Slice `[offset, offset + len)` if the tail covers it.
    fn slice(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let begin = offset.checked_sub(self.start)? as usize;
        self.data.get(begin..begin.checked_add(len)?)
    }
}

/// Reads the central directory of remote archives.
///
/// The resolver holds no per-archive state: every call to
/// [`resolve_index`](Self::resolve_index) re-reads the object, so callers
/// that need caching keep the returned [`ZipIndex`] themselves.
///
/// ## Example
///
/// ```ignore
/// let resolver = ZipIndexResolver::new(store.clone());
/// let index = resolver.resolve_index(&object).await?;
/// for entry in &index.entries {
///     println!("{} {}", entry.name, entry.uncompressed_size);
/// }
/// ```
pub struct ZipIndexResolver<S: ObjectStore + ?Sized> {
    /// The store holding the archives
    store: Arc<S>,
    /// Size of the first tail read
    tail_probe: u64,
}

impl<S: ObjectStore + ?Sized> ZipIndexResolver<S> {
    /// Create a resolver reading through `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            tail_probe: TAIL_PROBE_SIZE,
        }
    }

    /// Override the size of the first tail read.
    pub fn with_tail_probe(mut self, bytes: u64) -> Self {
        self.tail_probe = bytes.max(EndOfCentralDirectory::SIZE as u64);
        self
    }

    /// Resolve the central directory of `object`.
    ///
    /// # Returns
    ///
    /// The central directory start offset and every entry, in order.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedArchive`] if no end of central directory record is
    /// found in the probed tail, or if counts and offsets contradict each
    /// other. Store errors are passed through unchanged.
    pub async fn resolve_index(&self, object: &ObjectRef) -> Result<ZipIndex> {
        let size = self.store.object_size(object).await?;
        if size < EndOfCentralDirectory::SIZE as u64 {
            return Err(Error::malformed(format!(
                "{object} is too small to be a zip archive ({size} bytes)"
            )));
        }

        let (tail, eocd, eocd_offset) = self.find_eocd(object, size).await?;

        // Get Central Directory info, using ZIP64 if needed
        let (cd_offset, cd_size, total_entries, cd_limit) = if eocd.is_zip64() {
            let (eocd64, eocd64_offset) = self.read_zip64_eocd(object, &tail, eocd_offset).await?;
            (
                eocd64.cd_offset,
                eocd64.cd_size,
                eocd64.total_entries,
                eocd64_offset,
            )
        } else {
            if eocd.disk_number != 0 || eocd.disk_with_cd != 0 {
                return Err(Error::malformed("multi-disk archives are not supported"));
            }
            (
                eocd.cd_offset as u64,
                eocd.cd_size as u64,
                eocd.total_entries as u64,
                eocd_offset,
            )
        };

        let cd_end = cd_offset
            .checked_add(cd_size)
            .filter(|end| *end <= cd_limit)
            .ok_or_else(|| {
                Error::malformed(format!(
                    "central directory [{cd_offset}, +{cd_size}) overlaps its trailer at {cd_limit}"
                ))
            })?;
        if total_entries.saturating_mul(CDFH_MIN_SIZE as u64) > cd_size {
            return Err(Error::malformed(format!(
                "{total_entries} entries cannot fit in a {cd_size} byte central directory"
            )));
        }

        // Usually the directory is already in the tail; otherwise one more read
        let cd_data = match tail.slice(cd_offset, cd_size as usize) {
            Some(bytes) => bytes.to_vec(),
            None if cd_size == 0 => Vec::new(),
            None => {
                debug!(%object, cd_offset, cd_size, "central directory outside tail probe");
                read_range_to_vec(
                    self.store.as_ref(),
                    object,
                    ByteRange::new(cd_offset, cd_end - 1)?,
                )
                .await?
            }
        };

        // Parse each Central Directory File Header entry
        let mut entries = Vec::with_capacity(total_entries as usize);
        let mut cursor = Cursor::new(cd_data.as_slice());
        for _ in 0..total_entries {
            let entry = parse_cdfh(&mut cursor)?;
            check_entry_bounds(&entry, cd_offset)?;
            entries.push(entry);
        }

        debug!(%object, entries = entries.len(), cd_offset, "resolved zip index");

        Ok(ZipIndex {
            central_directory_offset: cd_offset,
            entries,
            object_size: size,
        })
    }

    /// Find and parse the End of Central Directory record.
    ///
    /// Tries the configured tail probe first, then a read large enough for
    /// the longest possible archive comment.
    async fn find_eocd(
        &self,
        object: &ObjectRef,
        size: u64,
    ) -> Result<(Tail, EndOfCentralDirectory, u64)> {
        let first = self.tail_probe.min(size);
        let tail = self.read_tail(object, size, first).await?;
        if let Some((eocd, offset)) = search_eocd(&tail)? {
            return Ok((tail, eocd, offset));
        }

        // Comment plus record plus a ZIP64 locator in front of it
        let widest = (MAX_COMMENT_SIZE + (EndOfCentralDirectory::SIZE + Zip64EOCDLocator::SIZE) as u64)
            .min(size);
        if widest > first {
            debug!(%object, widest, "EOCD not in first probe, widening");
            let tail = self.read_tail(object, size, widest).await?;
            if let Some((eocd, offset)) = search_eocd(&tail)? {
                return Ok((tail, eocd, offset));
            }
        }

        Err(Error::malformed(format!(
            "{object}: no end of central directory record found"
        )))
    }

    async fn read_tail(&self, object: &ObjectRef, size: u64, len: u64) -> Result<Tail> {
        let start = size - len;
        let data = read_range_to_vec(self.store.as_ref(), object, ByteRange::new(start, size - 1)?).await?;
        if data.len() as u64 != len {
            return Err(Error::TransientIo {
                message: format!("{object}: short tail read ({} of {len} bytes)", data.len()),
                source: None,
            });
        }
        Ok(Tail { start, data })
    }

    /// Read the ZIP64 End of Central Directory record.
    ///
    /// Called when the regular EOCD indicates ZIP64 extensions are needed
    /// (fields set to 0xFFFF or 0xFFFFFFFF). Returns the record and its offset.
    async fn read_zip64_eocd(
        &self,
        object: &ObjectRef,
        tail: &Tail,
        eocd_offset: u64,
    ) -> Result<(Zip64EOCD, u64)> {
        // The ZIP64 EOCD Locator is located immediately before the regular EOCD
        let locator_offset = eocd_offset
            .checked_sub(Zip64EOCDLocator::SIZE as u64)
            .ok_or_else(|| Error::malformed("ZIP64 locator missing"))?;
        let locator_buf = self
            .bytes_at(object, tail, locator_offset, Zip64EOCDLocator::SIZE)
            .await?;
        let locator = Zip64EOCDLocator::from_bytes(&locator_buf)?;
        if locator.eocd64_offset >= locator_offset {
            return Err(Error::malformed("ZIP64 end of central directory out of place"));
        }

        let eocd64_buf = self
            .bytes_at(object, tail, locator.eocd64_offset, Zip64EOCD::MIN_SIZE)
            .await?;
        let eocd64 = Zip64EOCD::from_bytes(&eocd64_buf)?;
        if eocd64.disk_number != 0 || eocd64.disk_with_cd != 0 {
            return Err(Error::malformed("multi-disk archives are not supported"));
        }
        Ok((eocd64, locator.eocd64_offset))
    }

    /// `len` bytes at `offset`, from the tail if it covers them.
    async fn bytes_at(&self, object: &ObjectRef, tail: &Tail, offset: u64, len: usize) -> Result<Vec<u8>> {
        if let Some(bytes) = tail.slice(offset, len) {
            return Ok(bytes.to_vec());
        }
        let range = ByteRange::with_len(offset, len as u64)?;
        read_range_to_vec(self.store.as_ref(), object, range).await
    }
}

/// Search backwards for the EOCD signature (PK\x05\x06).
///
/// A candidate only counts if its comment length matches the bytes that
/// follow it, which rules out the signature appearing inside a comment.
fn search_eocd(tail: &Tail) -> Result<Option<(EndOfCentralDirectory, u64)>> {
    let buf = &tail.data;
    if buf.len() < EndOfCentralDirectory::SIZE {
        return Ok(None);
    }

    for i in (0..=buf.len() - EndOfCentralDirectory::SIZE).rev() {
        if &buf[i..i + 4] == EndOfCentralDirectory::SIGNATURE {
            let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;

            if comment_len == buf.len() - i - EndOfCentralDirectory::SIZE {
                let eocd =
                    EndOfCentralDirectory::from_bytes(&buf[i..i + EndOfCentralDirectory::SIZE])?;
                return Ok(Some((eocd, tail.start + i as u64)));
            }
        }
    }

    Ok(None)
}

/// Every member's header and data must lie before the central directory.
fn check_entry_bounds(entry: &ZipEntryMeta, cd_offset: u64) -> Result<()> {
    let end = entry
        .local_header_offset
        .checked_add(LFH_SIZE as u64)
        .and_then(|end| end.checked_add(entry.compressed_size));
    match end {
        Some(end) if end <= cd_offset => Ok(()),
        _ => Err(Error::malformed(format!(
            "entry {} (offset {}, {} bytes) runs into the central directory at {cd_offset}",
            entry.name, entry.local_header_offset, entry.compressed_size
        ))),
    }
}

/// Parse a Central Directory File Header from a cursor.
///
/// The CDFH contains metadata about a file in the archive, including
/// its name, sizes, and location of the actual file data.
fn parse_cdfh(cursor: &mut Cursor<&[u8]>) -> Result<ZipEntryMeta> {
    // Read and verify the signature (PK\x01\x02)
    let mut sig = [0u8; 4];
    cursor.read_exact(&mut sig)?;
    if sig != CDFH_SIGNATURE {
        return Err(Error::malformed("invalid central directory file header"));
    }

    // Read fixed-size header fields
    let _version_made_by = cursor.read_u16::<LittleEndian>()?;
    let _version_needed = cursor.read_u16::<LittleEndian>()?;
    let _flags = cursor.read_u16::<LittleEndian>()?;
    let compression_method = cursor.read_u16::<LittleEndian>()?;
    let last_mod_time = cursor.read_u16::<LittleEndian>()?;
    let last_mod_date = cursor.read_u16::<LittleEndian>()?;
    let crc32 = cursor.read_u32::<LittleEndian>()?;
    let mut compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let mut uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let file_name_length = cursor.read_u16::<LittleEndian>()?;
    let extra_field_length = cursor.read_u16::<LittleEndian>()?;
    let file_comment_length = cursor.read_u16::<LittleEndian>()?;
    let _disk_number_start = cursor.read_u16::<LittleEndian>()?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
    let _external_attrs = cursor.read_u32::<LittleEndian>()?;
    let mut lfh_offset = cursor.read_u32::<LittleEndian>()? as u64;

    // Read the variable-length file name
    let mut file_name_bytes = vec![0u8; file_name_length as usize];
    cursor.read_exact(&mut file_name_bytes)?;
    // Use lossy conversion to handle non-UTF8 filenames gracefully
    let name = String::from_utf8_lossy(&file_name_bytes).to_string();

    // Directory entries end with '/'
    let is_directory = name.ends_with('/');

    // Parse extra field for ZIP64 extended information
    let extra_field_end = cursor.position() + extra_field_length as u64;
    if extra_field_end > cursor.get_ref().len() as u64 {
        return Err(Error::malformed(format!("extra field of {name} is truncated")));
    }

    while cursor.position() + 4 <= extra_field_end {
        let header_id = cursor.read_u16::<LittleEndian>()?;
        let field_size = cursor.read_u16::<LittleEndian>()?;
        let field_end = cursor.position() + field_size as u64;

        if header_id == ZIP64_EXTRA_ID {
            // Fields are present only if corresponding header field is 0xFFFFFFFF
            if uncompressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                uncompressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if compressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                compressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if lfh_offset == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                lfh_offset = cursor.read_u64::<LittleEndian>()?;
            }
        }
        // Skip unknown extra fields and trailing ZIP64 fields (disk number start)
        cursor.set_position(field_end);
    }

    // Ensure cursor is positioned after extra field, then skip the comment
    cursor.set_position(extra_field_end + file_comment_length as u64);

    Ok(ZipEntryMeta {
        name,
        compression_method: CompressionMethod::from_u16(compression_method),
        compressed_size,
        uncompressed_size,
        crc32,
        local_header_offset: lfh_offset,
        last_mod_time,
        last_mod_date,
        is_directory,
    })
}
