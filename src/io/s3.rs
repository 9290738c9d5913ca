use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as SdkCompletedPart};
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tracing::debug;

use super::{ByteRange, ByteStream, CompletedPart, MultipartStore, ObjectRef, ObjectStore};
use crate::config::{StorageConfig, StorageLocation, normalized_url};
use crate::error::{BoxError, Error, Result};

/// How presigned links reach end users.
#[derive(Clone)]
enum Presign {
    /// Links point at the storage endpoint itself.
    Direct,
    /// Links are signed by a client on the access endpoint, for the same
    /// object under the access location.
    Access {
        client: aws_sdk_s3::Client,
        location: StorageLocation,
    },
    /// Links are signed for the storage endpoint, then the endpoint URL is
    /// replaced by the access URL.
    Rewrite { from: String, to: String },
}

/// S3-compatible store driven by the AWS SDK, using path-style addressing.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    location: StorageLocation,
    presign: Presign,
}

impl S3ObjectStore {
    /// Build a client for the endpoint and credentials in `config`.
    ///
    /// Without an access key the default AWS provider chain is used.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let location = config.location()?;
        let access = config.access_location()?;
        let region = config
            .region
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "us-east-1".to_string());

        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region));
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "wacz-stream-config",
            ));
        }
        let shared = loader.load().await;
        let client_for = |endpoint: &str| {
            let s3_config = aws_sdk_s3::config::Builder::from(&shared)
                .endpoint_url(endpoint)
                .force_path_style(true)
                .build();
            aws_sdk_s3::Client::from_conf(s3_config)
        };

        let presign = match (access, &config.access_endpoint_url) {
            (Some(access), _) if config.use_access_for_presign => Presign::Access {
                client: client_for(&access.endpoint),
                location: access,
            },
            (Some(_), Some(access_url)) => {
                let from = normalized_url(&config.endpoint_url)?.to_string();
                let to = normalized_url(access_url)?.to_string();
                if from == to {
                    Presign::Direct
                } else {
                    Presign::Rewrite { from, to }
                }
            }
            _ => Presign::Direct,
        };

        Ok(Self {
            client: client_for(&location.endpoint),
            location,
            presign,
        })
    }

    /// Presigned GET URL valid for `expires`.
    ///
    /// With an access endpoint configured the link points there instead of
    /// at the storage endpoint, so it works from outside the cluster.
    pub async fn presign_get(&self, object: &ObjectRef, expires: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(expires)
            .map_err(|e| Error::InvalidConfig(format!("presign duration: {e}")))?;

        let (client, target) = match &self.presign {
            Presign::Access { client, location } => (client, self.relocate(object, location)),
            _ => (&self.client, object.clone()),
        };
        let request = client
            .get_object()
            .bucket(&target.bucket)
            .key(&target.key)
            .presigned(presigning)
            .await
            .map_err(|e| map_sdk_error(e, &target, None))?;

        let url = request.uri().to_string();
        Ok(match &self.presign {
            Presign::Rewrite { from, to } => url.replacen(from.as_str(), to, 1),
            _ => url,
        })
    }

    /// The same object addressed under `location` instead of the storage's
    /// own bucket and prefix.
    fn relocate(&self, object: &ObjectRef, location: &StorageLocation) -> ObjectRef {
        let name = object
            .key
            .strip_prefix(self.location.prefix.as_str())
            .filter(|_| object.bucket == self.location.bucket)
            .unwrap_or(&object.key);
        location.object(name)
    }
}

/// Classify an SDK failure by its HTTP status.
fn map_sdk_error<E>(err: SdkError<E, HttpResponse>, object: &ObjectRef, range: Option<ByteRange>) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|resp| resp.status().as_u16());
    status_error(status, object, range)
        .unwrap_or_else(|| Error::transient(format!("S3 request for {object} failed"), BoxError::from(err)))
}

/// Error for statuses with a meaning of their own. Everything else is
/// transient.
fn status_error(status: Option<u16>, object: &ObjectRef, range: Option<ByteRange>) -> Option<Error> {
    match status? {
        404 => Some(Error::ObjectNotFound {
            bucket: object.bucket.clone(),
            key: object.key.clone(),
        }),
        416 => Some(Error::RangeUnsatisfiable {
            key: object.key.clone(),
            range: range.map(|r| r.header_value()).unwrap_or_default(),
            size: None,
        }),
        _ => None,
    }
}

fn body_stream(body: SdkByteStream) -> ByteStream {
    futures::stream::try_unfold(body, |mut body| async move {
        match body.try_next().await {
            Ok(Some(chunk)) => Ok(Some((chunk, body))),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::transient("S3 body read failed", e)),
        }
    })
    .boxed()
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn object_size(&self, object: &ObjectRef) -> Result<u64> {
        let output = self
            .client
            .head_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, object, None))?;
        let size = output.content_length().unwrap_or(0);
        Ok(size.max(0) as u64)
    }

    async fn read_range(&self, object: &ObjectRef, range: ByteRange) -> Result<ByteStream> {
        debug!(%object, %range, "S3 range GET");
        let output = self
            .client
            .get_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .range(range.header_value())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, object, Some(range)))?;
        Ok(body_stream(output.body))
    }

    async fn put_object(&self, object: &ObjectRef, data: Bytes) -> Result<()> {
        debug!(%object, len = data.len(), "S3 PUT");
        self.client
            .put_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .body(SdkByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, object, None))?;
        Ok(())
    }

    async fn delete_object(&self, object: &ObjectRef) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, object, None))?;
        Ok(())
    }
}

#[async_trait]
impl MultipartStore for S3ObjectStore {
    async fn create_multipart_upload(&self, object: &ObjectRef) -> Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .acl(aws_sdk_s3::types::ObjectCannedAcl::BucketOwnerFullControl)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, object, None))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| Error::TransientIo {
                message: format!("CreateMultipartUpload for {object} returned no upload id"),
                source: None,
            })
    }

    async fn upload_part(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let part_number = i32::try_from(part_number)
            .map_err(|_| Error::InvalidConfig(format!("part number {part_number} out of range")))?;
        let output = self
            .client
            .upload_part()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(SdkByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, object, None))?;
        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    async fn complete_multipart_upload(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let parts = parts
            .iter()
            .map(|part| {
                SdkCompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect();
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, object, None))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, object: &ObjectRef, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, object, None))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str) -> StorageConfig {
        let mut config = StorageConfig::new(endpoint);
        config.access_key = Some("AKIDEXAMPLE".into());
        config.secret_key = Some("secret".into());
        config.region = Some("us-east-1".into());
        config
    }

    #[test]
    fn statuses_map_to_error_kinds() {
        let object = ObjectRef::new("http://minio:9000", "crawls", "a.wacz");
        assert!(matches!(
            status_error(Some(404), &object, None),
            Some(Error::ObjectNotFound { key, .. }) if key == "a.wacz"
        ));
        let range = ByteRange::new(10, 20).unwrap();
        assert!(matches!(
            status_error(Some(416), &object, Some(range)),
            Some(Error::RangeUnsatisfiable { range, .. }) if range == "bytes=10-20"
        ));
        assert!(status_error(Some(500), &object, None).is_none());
        assert!(status_error(Some(403), &object, None).is_none());
        assert!(status_error(None, &object, None).is_none());
    }

    #[tokio::test]
    async fn presign_without_access_endpoint_points_at_storage() {
        let config = config("http://minio:9000/crawls/org/");
        let store = S3ObjectStore::connect(&config).await.unwrap();
        let url = store
            .presign_get(&config.object("a.wacz").unwrap(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("http://minio:9000/crawls/org/a.wacz?"), "{url}");
    }

    #[tokio::test]
    async fn rewrite_replaces_whole_endpoint_url() {
        let mut config = config("http://minio:9000/crawls/org/");
        config.access_endpoint_url = Some("https://files.example.com/crawls/org/".into());
        config.use_access_for_presign = false;
        let store = S3ObjectStore::connect(&config).await.unwrap();

        let url = store
            .presign_get(&config.object("a.wacz").unwrap(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("https://files.example.com/crawls/org/a.wacz?"), "{url}");
        assert!(url.contains("X-Amz-Signature="));
    }

    #[tokio::test]
    async fn access_client_signs_for_access_location() {
        let mut config = config("http://minio:9000/crawls/org/");
        config.access_endpoint_url = Some("https://files.example.com/public/org-1/".into());
        config.use_access_for_presign = true;
        let store = S3ObjectStore::connect(&config).await.unwrap();

        let url = store
            .presign_get(&config.object("a.wacz").unwrap(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("https://files.example.com/public/org-1/a.wacz?"), "{url}");
        assert!(!url.contains("minio"));
    }
}
