use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode, Url};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{ByteRange, ByteStream, ObjectRef, ObjectStore};
use crate::error::{Error, Result};

/// Path-style HTTP access to a public (or pre-authorized) bucket.
///
/// Objects are addressed as `{endpoint}/{bucket}/{key}`. Reads use plain
/// `Range` GETs, so this works against any server that honours byte ranges.
pub struct HttpObjectStore {
    client: Client,
    transferred_bytes: Arc<AtomicU64>,
}

impl HttpObjectStore {
    /// Create a store with a 30 second request timeout.
    pub fn new() -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            transferred_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get total bytes transferred from network
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    /// Path-style URL with bucket and key segments percent-encoded.
    fn url(object: &ObjectRef) -> Result<Url> {
        let invalid = || Error::InvalidConfig(format!("endpoint {:?} cannot address objects", object.endpoint));
        let mut url = Url::parse(&object.endpoint).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .push(&object.bucket)
            .extend(object.key.split('/'));
        Ok(url)
    }

    fn status_error(object: &ObjectRef, status: StatusCode, range: Option<ByteRange>) -> Error {
        match status {
            StatusCode::NOT_FOUND => Error::ObjectNotFound {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
            },
            StatusCode::RANGE_NOT_SATISFIABLE => Error::RangeUnsatisfiable {
                key: object.key.clone(),
                range: range.map(|r| r.header_value()).unwrap_or_default(),
                size: None,
            },
            _ => Error::TransientIo {
                message: format!("HTTP request for {object} failed with status: {status}"),
                source: None,
            },
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn object_size(&self, object: &ObjectRef) -> Result<u64> {
        let resp = self.client.head(Self::url(object)?).send().await?;

        if !resp.status().is_success() {
            return Err(Self::status_error(object, resp.status(), None));
        }

        // Get file size from Content-Length
        resp.headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::TransientIo {
                message: format!("{object}: server did not return Content-Length"),
                source: None,
            })
    }

    async fn read_range(&self, object: &ObjectRef, range: ByteRange) -> Result<ByteStream> {
        debug!(%object, %range, "range GET");

        let resp = self
            .client
            .get(Self::url(object)?)
            .header("Range", range.header_value())
            .send()
            .await?;

        // A 200 would mean the server ignored the range and sent everything
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(Self::status_error(object, resp.status(), Some(range)));
        }

        let transferred = Arc::clone(&self.transferred_bytes);
        let stream = resp
            .bytes_stream()
            .map_err(Error::from)
            .inspect_ok(move |chunk| {
                transferred.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            });
        Ok(stream.boxed())
    }

    async fn put_object(&self, object: &ObjectRef, data: Bytes) -> Result<()> {
        debug!(%object, len = data.len(), "PUT");
        let resp = self.client.put(Self::url(object)?).body(data).send().await?;
        if !resp.status().is_success() {
            return Err(Self::status_error(object, resp.status(), None));
        }
        Ok(())
    }

    async fn delete_object(&self, object: &ObjectRef) -> Result<()> {
        let resp = self.client.delete(Self::url(object)?).send().await?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::status_error(object, resp.status(), None))
        }
    }
}
