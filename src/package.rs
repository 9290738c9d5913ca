//! Multi-WACZ download packages.
//!
//! A package is a zip stream holding whole objects from the store side by
//! side, followed by a `datapackage.json` manifest listing each of them.

use std::sync::Arc;
use tracing::info;

use crate::io::{ByteStream, ObjectRef, ObjectStore, lazy_object_stream};
use crate::zip::{StreamingZipWriter, ZipMember};

/// One object to include in a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFile {
    /// Member name inside the package.
    pub name: String,
    pub object: ObjectRef,
    /// Hash to publish in the manifest. SHA-256 of the data when absent.
    pub hash: Option<String>,
}

impl PackageFile {
    /// Package `object` under the last segment of its key.
    pub fn new(object: ObjectRef) -> Self {
        let name = object
            .key
            .rsplit('/')
            .next()
            .unwrap_or(object.key.as_str())
            .to_string();
        Self {
            name,
            object,
            hash: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

/// Stream a zip of `files` in order plus the manifest.
///
/// Objects are fetched one after the other, each only when the output
/// reaches it.
pub fn package_download<S>(store: Arc<S>, files: Vec<PackageFile>) -> ByteStream
where
    S: ObjectStore + ?Sized + 'static,
{
    package_with(StreamingZipWriter::new(), store, files)
}

/// [`package_download`] with a custom writer.
pub fn package_with<S>(writer: StreamingZipWriter, store: Arc<S>, files: Vec<PackageFile>) -> ByteStream
where
    S: ObjectStore + ?Sized + 'static,
{
    info!(files = files.len(), "streaming download package");
    let members: Vec<ZipMember> = files
        .into_iter()
        .map(|file| {
            let source = lazy_object_stream(Arc::clone(&store), file.object);
            let member = ZipMember::new(file.name, source);
            match file.hash {
                Some(hash) => member.with_hash(hash),
                None => member,
            }
        })
        .collect();
    writer.stream_zip(members)
}
