//! Writing objects: single PUTs, multipart uploads and credential checks.

mod multipart;

pub use multipart::{
    CompletedUpload, MultipartUploadSession, MultipartUploader, PartAccumulator, UploadPhase,
};

use bytes::Bytes;
use tracing::info;

use crate::config::{StorageLocation, VERIFY_MARKER};
use crate::error::Result;
use crate::io::{ObjectRef, ObjectStore};

/// Store a small payload with one PUT.
pub async fn upload_single<S>(store: &S, object: &ObjectRef, data: Bytes) -> Result<()>
where
    S: ObjectStore + ?Sized,
{
    let len = data.len();
    store.put_object(object, data).await?;
    info!(%object, len, "object uploaded");
    Ok(())
}

/// Check that the credentials can write under `location` by storing an
/// empty marker object there.
pub async fn verify_storage_upload<S>(store: &S, location: &StorageLocation) -> Result<ObjectRef>
where
    S: ObjectStore + ?Sized,
{
    let marker = location.object(VERIFY_MARKER);
    store.put_object(&marker, Bytes::new()).await?;
    info!(object = %marker, "storage upload verified");
    Ok(marker)
}
