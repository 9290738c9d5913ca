use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{Datelike, NaiveDateTime, Timelike};
use std::io::{self, Cursor, Write};

use crate::error::{Error, Result};

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
#[derive(Debug, Clone)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::malformed("invalid end of central directory record"));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_number: cursor.read_u16::<LittleEndian>()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>()?,
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == 0xFFFFFFFF
            || self.cd_offset == 0xFFFFFFFF
    }

    /// Serialize with no comment, saturating fields that overflow.
    pub fn write<W: Write>(entries: u64, cd_size: u64, cd_offset: u64, out: &mut W) -> io::Result<()> {
        let entries = entries.min(0xFFFF) as u16;
        out.write_all(Self::SIGNATURE)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(entries)?;
        out.write_u16::<LittleEndian>(entries)?;
        out.write_u32::<LittleEndian>(cd_size.min(0xFFFFFFFF) as u32)?;
        out.write_u32::<LittleEndian>(cd_offset.min(0xFFFFFFFF) as u32)?;
        out.write_u16::<LittleEndian>(0)?;
        Ok(())
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
#[derive(Debug, Clone)]
pub struct Zip64EOCDLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::malformed("invalid ZIP64 end of central directory locator"));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_with_eocd64: cursor.read_u32::<LittleEndian>()?,
            eocd64_offset: cursor.read_u64::<LittleEndian>()?,
            total_disks: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write<W: Write>(eocd64_offset: u64, out: &mut W) -> io::Result<()> {
        out.write_all(Self::SIGNATURE)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u64::<LittleEndian>(eocd64_offset)?;
        out.write_u32::<LittleEndian>(1)?;
        Ok(())
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
#[derive(Debug, Clone)]
pub struct Zip64EOCD {
    pub eocd64_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::malformed("invalid ZIP64 end of central directory record"));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            eocd64_size: cursor.read_u64::<LittleEndian>()?,
            version_made_by: cursor.read_u16::<LittleEndian>()?,
            version_needed: cursor.read_u16::<LittleEndian>()?,
            disk_number: cursor.read_u32::<LittleEndian>()?,
            disk_with_cd: cursor.read_u32::<LittleEndian>()?,
            disk_entries: cursor.read_u64::<LittleEndian>()?,
            total_entries: cursor.read_u64::<LittleEndian>()?,
            cd_size: cursor.read_u64::<LittleEndian>()?,
            cd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }

    pub fn write<W: Write>(entries: u64, cd_size: u64, cd_offset: u64, out: &mut W) -> io::Result<()> {
        out.write_all(Self::SIGNATURE)?;
        // size of the remaining record
        out.write_u64::<LittleEndian>(Self::MIN_SIZE as u64 - 12)?;
        out.write_u16::<LittleEndian>(VERSION_MADE_BY)?;
        out.write_u16::<LittleEndian>(VERSION_ZIP64)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u64::<LittleEndian>(entries)?;
        out.write_u64::<LittleEndian>(entries)?;
        out.write_u64::<LittleEndian>(cd_size)?;
        out.write_u64::<LittleEndian>(cd_offset)?;
        Ok(())
    }
}

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// Data descriptor following member data when flag bit 3 is set.
pub const DATA_DESCRIPTOR_SIGNATURE: &[u8] = b"PK\x07\x08";

/// ZIP64 extended information extra field id.
pub const ZIP64_EXTRA_ID: u16 = 0x0001;

/// Sizes and CRC live in the data descriptor.
pub const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
/// File name is UTF-8.
pub const FLAG_UTF8: u16 = 1 << 11;

/// Version 4.5: ZIP64 extensions.
pub const VERSION_ZIP64: u16 = 45;
/// Unix host, zip format version 4.5.
pub const VERSION_MADE_BY: u16 = (3 << 8) | VERSION_ZIP64;

/// Metadata of one archive member, parsed from its central directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipEntryMeta {
    pub name: String,
    pub compression_method: CompressionMethod,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    /// Offset of the member's local file header. The payload starts after
    /// that header, whose length is only known once it has been read.
    pub local_header_offset: u64,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub is_directory: bool,
}

impl ZipEntryMeta {
    /// Parse modification date to (year, month, day)
    pub fn mod_date(&self) -> (u16, u8, u8) {
        let day = (self.last_mod_date & 0x1F) as u8;
        let month = ((self.last_mod_date >> 5) & 0x0F) as u8;
        let year = ((self.last_mod_date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Parse modification time to (hour, minute, second)
    pub fn mod_time(&self) -> (u8, u8, u8) {
        let second = ((self.last_mod_time & 0x1F) * 2) as u8;
        let minute = ((self.last_mod_time >> 5) & 0x3F) as u8;
        let hour = ((self.last_mod_time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }
}

/// Convert a timestamp to MS-DOS (time, date). Years before 1980 clamp to
/// 1980-01-01 00:00.
pub fn dos_datetime(at: &NaiveDateTime) -> (u16, u16) {
    if at.year() < 1980 {
        return (0, (1 << 5) | 1);
    }
    let year = (at.year() - 1980).min(127) as u16;
    let date = (year << 9) | ((at.month() as u16) << 5) | at.day() as u16;
    let time = ((at.hour() as u16) << 11) | ((at.minute() as u16) << 5) | (at.second() as u16 / 2);
    (time, date)
}

/// Local header for a STORED member whose sizes follow in a ZIP64 data
/// descriptor.
pub fn write_streaming_local_header<W: Write>(
    name: &str,
    dos_time: u16,
    dos_date: u16,
    out: &mut W,
) -> io::Result<()> {
    out.write_all(LFH_SIGNATURE)?;
    out.write_u16::<LittleEndian>(VERSION_ZIP64)?;
    out.write_u16::<LittleEndian>(FLAG_DATA_DESCRIPTOR | FLAG_UTF8)?;
    out.write_u16::<LittleEndian>(CompressionMethod::Stored.as_u16())?;
    out.write_u16::<LittleEndian>(dos_time)?;
    out.write_u16::<LittleEndian>(dos_date)?;
    out.write_u32::<LittleEndian>(0)?;
    out.write_u32::<LittleEndian>(0xFFFFFFFF)?;
    out.write_u32::<LittleEndian>(0xFFFFFFFF)?;
    out.write_u16::<LittleEndian>(name_len(name)?)?;
    out.write_u16::<LittleEndian>(20)?;
    out.write_all(name.as_bytes())?;
    // ZIP64 extra: uncompressed and compressed size, both deferred
    out.write_u16::<LittleEndian>(ZIP64_EXTRA_ID)?;
    out.write_u16::<LittleEndian>(16)?;
    out.write_u64::<LittleEndian>(0)?;
    out.write_u64::<LittleEndian>(0)?;
    Ok(())
}

/// ZIP64 data descriptor: signature, CRC and 8-byte sizes.
pub fn write_zip64_data_descriptor<W: Write>(crc32: u32, size: u64, out: &mut W) -> io::Result<()> {
    out.write_all(DATA_DESCRIPTOR_SIGNATURE)?;
    out.write_u32::<LittleEndian>(crc32)?;
    out.write_u64::<LittleEndian>(size)?;
    out.write_u64::<LittleEndian>(size)?;
    Ok(())
}

fn name_len(name: &str) -> io::Result<u16> {
    u16::try_from(name.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "member name too long"))
}

/// What the central directory records about a member written by the
/// streaming writer.
#[derive(Debug, Clone)]
pub struct CentralRecord {
    pub name: String,
    pub dos_time: u16,
    pub dos_date: u16,
    pub permissions: u16,
    pub crc32: u32,
    pub size: u64,
    pub local_header_offset: u64,
}

impl CentralRecord {
    /// Central directory entry for a STORED member with a ZIP64 extra field.
    pub fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        // regular file with the given unix permission bits
        let external_attrs = (0o100000u32 | self.permissions as u32) << 16;

        out.write_all(CDFH_SIGNATURE)?;
        out.write_u16::<LittleEndian>(VERSION_MADE_BY)?;
        out.write_u16::<LittleEndian>(VERSION_ZIP64)?;
        out.write_u16::<LittleEndian>(FLAG_DATA_DESCRIPTOR | FLAG_UTF8)?;
        out.write_u16::<LittleEndian>(CompressionMethod::Stored.as_u16())?;
        out.write_u16::<LittleEndian>(self.dos_time)?;
        out.write_u16::<LittleEndian>(self.dos_date)?;
        out.write_u32::<LittleEndian>(self.crc32)?;
        out.write_u32::<LittleEndian>(0xFFFFFFFF)?;
        out.write_u32::<LittleEndian>(0xFFFFFFFF)?;
        out.write_u16::<LittleEndian>(name_len(&self.name)?)?;
        out.write_u16::<LittleEndian>(28)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u32::<LittleEndian>(external_attrs)?;
        out.write_u32::<LittleEndian>(0xFFFFFFFF)?;
        out.write_all(self.name.as_bytes())?;
        out.write_u16::<LittleEndian>(ZIP64_EXTRA_ID)?;
        out.write_u16::<LittleEndian>(24)?;
        out.write_u64::<LittleEndian>(self.size)?;
        out.write_u64::<LittleEndian>(self.size)?;
        out.write_u64::<LittleEndian>(self.local_header_offset)?;
        Ok(())
    }
}
