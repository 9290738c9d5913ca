//! # wacz-stream
//!
//! Streaming access to WACZ archives kept in S3-compatible object storage.
//!
//! A WACZ is a zip file. This crate treats one as a remote, partially
//! readable resource: the central directory is located with a tail range
//! read, single members are streamed with one more range read, and nothing
//! is downloaded in full.
//!
//! ## Features
//!
//! - Entry index and entry streaming over HTTP range reads ([`zip`])
//! - Chronological merge of crawler logs across archives ([`logs`])
//! - Single-pass zip packaging with a `datapackage.json` manifest
//!   ([`zip::StreamingZipWriter`], [`package`])
//! - Multipart upload that aborts the session on any failure ([`upload`])
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wacz_stream::config::StorageConfig;
//! use wacz_stream::io::S3ObjectStore;
//! use wacz_stream::zip::ZipExtractor;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StorageConfig::new("https://s3.example.com/crawls/org-1/");
//!     let store = Arc::new(S3ObjectStore::connect(&config).await?);
//!
//!     let extractor = ZipExtractor::new(store);
//!     for entry in extractor.list_entries(&config.object("crawl.wacz")?).await? {
//!         println!("{} {}", entry.name, entry.uncompressed_size);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod logs;
pub mod package;
pub mod upload;
pub mod zip;

pub use cli::Cli;
pub use config::StorageConfig;
pub use error::{Error, Result};
pub use io::{ByteRange, ByteStream, MultipartStore, ObjectRef, ObjectStore};
pub use logs::{LogFilter, LogMerger, LogRecord, LogSource, merge_filtered_logs};
pub use package::{PackageFile, package_download};
pub use upload::{MultipartUploader, upload_single, verify_storage_upload};
pub use zip::{StreamingZipWriter, ZipEntryMeta, ZipExtractor, ZipIndexResolver, ZipMember};
