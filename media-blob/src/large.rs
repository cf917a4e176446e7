//! Storage for very large media resources whose bytes follow a known pattern.
//!
//! Nothing is buffered: writes are verified block by block against the pattern
//! and reads regenerate it, so streams well past 4 GiB can be pushed through
//! the engine while only the length and an integrity flag are kept.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use media_core::{ChangesetId, ChangesetParticipant, StagedMap};
use tokio::io::AsyncWrite;

use crate::{ByteStream, EntityKey, ProviderResult, StreamHead, StreamKey, StreamStore, WriteStream};

/// Period of the byte pattern. Prime, so it never lines up with buffer sizes.
const PERIOD: usize = 251;
const CHUNK: usize = PERIOD * 260;
const BLOCK: usize = PERIOD * 261;

fn pattern_block() -> &'static Bytes {
    static BLOCK_BYTES: OnceLock<Bytes> = OnceLock::new();
    BLOCK_BYTES.get_or_init(|| Bytes::from((0..BLOCK).map(|i| (i % PERIOD) as u8).collect::<Vec<_>>()))
}

/// Byte expected at absolute `position` of a pattern stream.
pub fn pattern_byte(position: u64) -> u8 {
    (position % PERIOD as u64) as u8
}

/// A stream of `length` pattern bytes.
pub fn pattern_stream(length: u64) -> impl Stream<Item = Result<Bytes, io::Error>> + Send {
    async_stream::stream! {
        let block = pattern_block();
        let mut remaining = length;
        while remaining > 0 {
            let n = remaining.min(CHUNK as u64) as usize;
            // every chunk starts on a multiple of PERIOD
            yield Ok::<Bytes, io::Error>(block.slice(..n));
            remaining -= n as u64;
        }
    }
}

/// Whether `buf` holds the pattern starting at absolute `position`.
pub fn matches_pattern(position: u64, buf: &[u8]) -> bool {
    let block = pattern_block();
    let mut position = position;
    let mut rest = buf;
    while !rest.is_empty() {
        let offset = (position % PERIOD as u64) as usize;
        let n = rest.len().min(BLOCK - offset);
        if rest[..n] != block[offset..offset + n] {
            return false;
        }
        position += n as u64;
        rest = &rest[n..];
    }
    true
}

/// What is kept of a large media resource.
#[derive(Debug, Clone)]
pub struct LargeEntry {
    pub length: u64,
    pub content_type: String,
    /// Every received byte matched the pattern.
    pub intact: bool,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

struct LargeInner {
    entries: StagedMap<StreamKey, LargeEntry>,
    versions: AtomicU64,
}

/// Pattern-verifying store for large stream tests and soak runs.
#[derive(Clone)]
pub struct LargeStreamStore {
    inner: Arc<LargeInner>,
}

impl Default for LargeStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LargeStreamStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LargeInner {
                entries: StagedMap::new(),
                versions: AtomicU64::new(0),
            }),
        }
    }

    /// Register committed pattern content of `length` bytes.
    pub fn seed(&self, entity_set: &str, key: EntityKey, length: u64, content_type: &str) {
        let entry = LargeEntry {
            length,
            content_type: content_type.to_string(),
            intact: true,
            version: self.next_version(),
            updated_at: Utc::now(),
        };
        self.inner.entries.put(StreamKey::new(entity_set, key), entry, None);
    }

    pub fn entry(&self, entity_set: &str, key: &EntityKey) -> Option<LargeEntry> {
        self.inner
            .entries
            .get(&StreamKey::new(entity_set, key.clone()), None)
    }

    fn next_version(&self) -> u64 {
        self.inner.versions.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl ChangesetParticipant for LargeStreamStore {
    fn participant_name(&self) -> &'static str {
        "large-streams"
    }

    async fn commit(&self, changeset: ChangesetId) -> Result<()> {
        let applied = self.inner.entries.commit(changeset);
        tracing::debug!(%changeset, applied, "committed large media resources");
        Ok(())
    }

    async fn rollback(&self, changeset: ChangesetId) {
        self.inner.entries.rollback(changeset);
    }
}

#[async_trait]
impl StreamStore for LargeStreamStore {
    async fn open_write(
        &self,
        key: &StreamKey,
        content_type: &str,
        changeset: ChangesetId,
    ) -> ProviderResult<WriteStream> {
        Ok(Box::pin(PatternWriter {
            position: 0,
            intact: true,
            store: self.clone(),
            key: Some(key.clone()),
            content_type: content_type.to_string(),
            changeset,
        }))
    }

    async fn open_read(&self, key: &StreamKey, changeset: Option<ChangesetId>) -> ProviderResult<Option<ByteStream>> {
        Ok(self.inner.entries.get(key, changeset).map(|entry| {
            let stream: ByteStream = Box::pin(pattern_stream(entry.length));
            stream
        }))
    }

    async fn head(&self, key: &StreamKey, changeset: Option<ChangesetId>) -> ProviderResult<Option<StreamHead>> {
        Ok(self.inner.entries.get(key, changeset).map(|entry| StreamHead {
            size_bytes: entry.length,
            content_type: entry.content_type,
            etag: Some(format!("\"L{}\"", entry.version)),
            updated_at: entry.updated_at,
        }))
    }

    async fn delete(&self, key: &StreamKey, changeset: Option<ChangesetId>) -> ProviderResult<()> {
        self.inner.entries.remove(key.clone(), changeset);
        Ok(())
    }
}

/// Counts and verifies bytes without keeping them.
struct PatternWriter {
    position: u64,
    intact: bool,
    store: LargeStreamStore,
    key: Option<StreamKey>,
    content_type: String,
    changeset: ChangesetId,
}

impl AsyncWrite for PatternWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.intact && !matches_pattern(this.position, buf) {
            tracing::warn!(position = this.position, "large stream diverged from pattern");
            this.intact = false;
        }
        this.position += buf.len() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(key) = this.key.take() {
            let entry = LargeEntry {
                length: this.position,
                content_type: std::mem::take(&mut this.content_type),
                intact: this.intact,
                version: this.store.next_version(),
                updated_at: Utc::now(),
            };
            this.store.inner.entries.put(key, entry, Some(this.changeset));
        }
        Poll::Ready(Ok(()))
    }
}
