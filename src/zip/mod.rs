//! ZIP archive reading and writing over object storage.
//!
//! The read side never downloads a whole archive:
//!
//! - [`parser`]: locates the end-of-central-directory record with a tail
//!   probe, follows ZIP64 records when present and decodes the central
//!   directory into a [`ZipIndex`]
//! - [`streamer`]: turns one [`ZipEntryMeta`] into a decoded byte stream
//!   using a single range read for the compressed payload
//! - [`extractor`]: name based convenience over the two
//!
//! The write side, [`writer`], emits a complete STORED archive in one pass
//! with data descriptors and a trailing `datapackage.json` manifest.
//!
//! ## Supported Features
//!
//! - Standard ZIP format (PKZIP APPNOTE 6.3.x compatible)
//! - ZIP64 extensions for files > 4GB
//! - STORED (no compression) method
//! - DEFLATE compression method on read
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - No BZIP2, LZMA, or other compression methods

mod extractor;
mod parser;
mod streamer;
mod structures;
mod writer;

pub use extractor::ZipExtractor;
pub use parser::{ZipIndex, ZipIndexResolver};
pub use streamer::ZipEntryStreamer;
pub use structures::{CompressionMethod, ZipEntryMeta, dos_datetime};
pub use writer::{
    DEFAULT_PERMISSIONS, MANIFEST_NAME, MANIFEST_PROFILE, ManifestResource, PackageManifest,
    StreamingZipWriter, ZipMember,
};
