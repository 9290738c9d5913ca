use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::io::{ByteStream, ObjectRef, ObjectStore};
use futures::TryStreamExt;

use super::parser::{ZipIndex, ZipIndexResolver};
use super::streamer::ZipEntryStreamer;
use super::structures::ZipEntryMeta;

/// Name-based access to the members of remote archives
pub struct ZipExtractor<S: ObjectStore + ?Sized> {
    resolver: ZipIndexResolver<S>,
    streamer: ZipEntryStreamer<S>,
}

impl<S: ObjectStore + ?Sized> ZipExtractor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            resolver: ZipIndexResolver::new(Arc::clone(&store)),
            streamer: ZipEntryStreamer::new(store),
        }
    }

    /// Resolve the index of an archive
    pub async fn index(&self, object: &ObjectRef) -> Result<ZipIndex> {
        self.resolver.resolve_index(object).await
    }

    /// List all entries in the archive
    pub async fn list_entries(&self, object: &ObjectRef) -> Result<Vec<ZipEntryMeta>> {
        Ok(self.index(object).await?.entries)
    }

    /// Stream one entry of an already resolved archive
    pub async fn open(&self, object: &ObjectRef, index: &ZipIndex, meta: &ZipEntryMeta) -> Result<ByteStream> {
        self.streamer
            .open_entry(object, index.central_directory_offset, meta)
            .await
    }

    /// Resolve the archive and stream the entry called `name`
    pub async fn open_by_name(&self, object: &ObjectRef, name: &str) -> Result<ByteStream> {
        let index = self.index(object).await?;
        let meta = index
            .find(name)
            .ok_or_else(|| Error::EntryNotFound {
                archive: object.to_string(),
                name: name.to_string(),
            })?;
        self.open(object, &index, meta).await
    }

    /// Copy an entry into `writer` chunk by chunk
    pub async fn extract_to_writer<W>(&self, object: &ObjectRef, name: &str, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut stream = self.open_by_name(object, name).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(written)
    }
}
