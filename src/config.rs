//! Storage configuration and engine tunables.

use percent_encoding::percent_decode_str;
use reqwest::Url;

use crate::error::{Error, Result};
use crate::io::ObjectRef;

/// Largest chunk the streaming writer emits at once.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Size of the first tail read when looking for the end of central directory.
pub const TAIL_PROBE_SIZE: u64 = 64 * 1024;

/// Default part size for multipart uploads.
pub const DEFAULT_PART_SIZE: usize = 10 * 1024 * 1024;

/// Name of the marker object written by storage verification.
pub const VERIFY_MARKER: &str = ".btrix-upload-verify";

/// Credentials and location of one S3-compatible storage.
///
/// `endpoint_url` carries the bucket and an optional key prefix in its path,
/// e.g. `https://s3.example.com/crawls/org-1/`.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub endpoint_url: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: Option<String>,
    /// Public endpoint used in links handed to end users.
    pub access_endpoint_url: Option<String>,
    /// Presign against the access endpoint directly instead of rewriting.
    pub use_access_for_presign: bool,
}

/// `endpoint_url` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    /// Scheme and authority only, e.g. `https://s3.example.com`.
    pub endpoint: String,
    pub bucket: String,
    /// Key prefix, empty or ending with `/`.
    pub prefix: String,
}

impl StorageConfig {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            use_access_for_presign: true,
            ..Default::default()
        }
    }

    /// Split the endpoint URL into endpoint, bucket and key prefix.
    pub fn location(&self) -> Result<StorageLocation> {
        parse_location(&self.endpoint_url)
    }

    /// Location of the public access endpoint, when one is configured.
    pub fn access_location(&self) -> Result<Option<StorageLocation>> {
        self.access_endpoint_url
            .as_deref()
            .map(parse_location)
            .transpose()
    }

    /// Reference to `name` under this storage's prefix.
    pub fn object(&self, name: &str) -> Result<ObjectRef> {
        let location = self.location()?;
        Ok(location.object(name))
    }
}

/// Parse `raw` with a trailing `/` appended, as used for every storage URL.
pub(crate) fn normalized_url(raw: &str) -> Result<Url> {
    let mut raw = raw.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    let url = Url::parse(&raw)
        .map_err(|e| Error::InvalidConfig(format!("endpoint URL {raw:?} cannot be parsed: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidConfig(format!(
            "endpoint URL must use http or https: {url}"
        )));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(Error::InvalidConfig(format!(
            "endpoint URL must not carry a query or fragment: {url}"
        )));
    }
    Ok(url)
}

fn parse_location(raw: &str) -> Result<StorageLocation> {
    let url = normalized_url(raw)?;
    let mut segments = url
        .path_segments()
        .ok_or_else(|| Error::InvalidConfig(format!("endpoint URL without path: {url}")))?
        .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned());

    let bucket = segments.next().unwrap_or_default();
    if bucket.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "endpoint URL does not name a bucket: {url}"
        )));
    }
    // the trailing slash leaves an empty last segment, so the prefix ends with `/`
    let prefix = segments.collect::<Vec<_>>().join("/");

    Ok(StorageLocation {
        endpoint: url.origin().ascii_serialization(),
        bucket,
        prefix,
    })
}

impl StorageLocation {
    pub fn object(&self, name: &str) -> ObjectRef {
        ObjectRef::new(
            self.endpoint.clone(),
            self.bucket.clone(),
            format!("{}{}", self.prefix, name.trim_start_matches('/')),
        )
    }
}
