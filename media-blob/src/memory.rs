use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use media_core::{ChangesetId, ChangesetParticipant, StagedMap};
use tokio::io::AsyncWrite;

use crate::{ByteStream, EntityKey, ProviderResult, StreamHead, StreamKey, StreamStore, WriteStream};

/// A media resource held in memory.
#[derive(Debug, Clone)]
pub struct StoredStream {
    pub bytes: Bytes,
    pub content_type: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

struct MemoryInner {
    streams: StagedMap<StreamKey, StoredStream>,
    versions: AtomicU64,
}

/// In-memory media resource storage with changeset staging.
#[derive(Clone)]
pub struct MemoryStreamStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                streams: StagedMap::new(),
                versions: AtomicU64::new(0),
            }),
        }
    }

    fn next_version(&self) -> u64 {
        self.inner.versions.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn stage(&self, key: StreamKey, bytes: Bytes, content_type: String, changeset: Option<ChangesetId>) {
        let stored = StoredStream {
            bytes,
            content_type,
            version: self.next_version(),
            updated_at: Utc::now(),
        };
        self.inner.streams.put(key, stored, changeset);
    }

    /// Store a committed media resource directly (fixtures).
    pub fn seed(&self, entity_set: &str, key: EntityKey, bytes: impl Into<Bytes>, content_type: &str) {
        self.stage(
            StreamKey::new(entity_set, key),
            bytes.into(),
            content_type.to_string(),
            None,
        );
    }

    pub fn get(&self, key: &StreamKey, changeset: Option<ChangesetId>) -> Option<StoredStream> {
        self.inner.streams.get(key, changeset)
    }

    /// Whether a committed media resource exists.
    pub fn exists(&self, entity_set: &str, key: &EntityKey) -> bool {
        self.get(&StreamKey::new(entity_set, key.clone()), None).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.streams.values(None).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChangesetParticipant for MemoryStreamStore {
    fn participant_name(&self) -> &'static str {
        "memory-streams"
    }

    async fn commit(&self, changeset: ChangesetId) -> Result<()> {
        let applied = self.inner.streams.commit(changeset);
        tracing::debug!(%changeset, applied, "committed staged media resources");
        Ok(())
    }

    async fn rollback(&self, changeset: ChangesetId) {
        let dropped = self.inner.streams.rollback(changeset);
        tracing::debug!(%changeset, dropped, "rolled back staged media resources");
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn open_write(
        &self,
        key: &StreamKey,
        content_type: &str,
        changeset: ChangesetId,
    ) -> ProviderResult<WriteStream> {
        Ok(Box::pin(MemoryWriteStream {
            buffer: Vec::new(),
            store: self.clone(),
            key: Some(key.clone()),
            content_type: content_type.to_string(),
            changeset,
        }))
    }

    async fn open_read(&self, key: &StreamKey, changeset: Option<ChangesetId>) -> ProviderResult<Option<ByteStream>> {
        Ok(self.get(key, changeset).map(|stored| {
            let bytes = stored.bytes;
            let stream: ByteStream = Box::pin(futures_util::stream::once(async move {
                Ok::<Bytes, io::Error>(bytes)
            }));
            stream
        }))
    }

    async fn head(&self, key: &StreamKey, changeset: Option<ChangesetId>) -> ProviderResult<Option<StreamHead>> {
        Ok(self.get(key, changeset).map(|stored| StreamHead {
            size_bytes: stored.bytes.len() as u64,
            content_type: stored.content_type,
            etag: Some(format!("\"{}\"", stored.version)),
            updated_at: stored.updated_at,
        }))
    }

    async fn delete(&self, key: &StreamKey, changeset: Option<ChangesetId>) -> ProviderResult<()> {
        self.inner.streams.remove(key.clone(), changeset);
        Ok(())
    }
}

/// Buffers written bytes and stages them on shutdown.
struct MemoryWriteStream {
    buffer: Vec<u8>,
    store: MemoryStreamStore,
    key: Option<StreamKey>,
    content_type: String,
    changeset: ChangesetId,
}

impl AsyncWrite for MemoryWriteStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.key.is_none() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write stream already shut down",
            )));
        }
        this.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(key) = this.key.take() {
            let bytes = Bytes::from(std::mem::take(&mut this.buffer));
            let content_type = std::mem::take(&mut this.content_type);
            this.store.stage(key, bytes, content_type, Some(this.changeset));
        }
        Poll::Ready(Ok(()))
    }
}
