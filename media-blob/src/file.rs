//! Filesystem-backed media resources.
//!
//! Layout under the root directory:
//!
//! ```text
//! streams/<set>/<stem>.bin     committed bytes
//! streams/<set>/<stem>.json    committed metadata
//! staging/<changeset>/<set>/<stem>.bin
//! replaced/<changeset>/<set>/<stem>.bin   files a committing changeset replaces
//! ```
//!
//! Commit is two-phase. `prepare` writes the metadata of every staged file.
//! `commit` then only renames, moving replaced files aside first so a failed
//! rename can put them back. Both directories of a changeset are removed once
//! it settles either way.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use media_core::{ChangesetId, ChangesetParticipant, StagedMap};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::{ByteStream, EntityKey, ProviderResult, StreamHead, StreamKey, StreamStore, WriteStream};

const READ_CHUNK: usize = 64 * 1024;

/// Sidecar metadata written next to every committed data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileMeta {
    entity_set: String,
    key: EntityKey,
    content_type: String,
    size_bytes: u64,
    version: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct FileEntry {
    data_path: PathBuf,
    content_type: String,
    version: u64,
    updated_at: DateTime<Utc>,
}

struct FileInner {
    root: PathBuf,
    entries: StagedMap<StreamKey, FileEntry>,
    versions: AtomicU64,
}

/// Media resources stored as files under a root directory.
#[derive(Clone)]
pub struct FileStreamStore {
    inner: Arc<FileInner>,
}

impl FileStreamStore {
    /// Open (or create) a store rooted at `root`, indexing committed files.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let streams = root.join("streams");
        tokio::fs::create_dir_all(&streams)
            .await
            .with_context(|| format!("creating {}", streams.display()))?;
        tokio::fs::create_dir_all(root.join("staging")).await?;

        let entries = StagedMap::new();
        let mut max_version = 0;
        let mut sets = tokio::fs::read_dir(&streams).await?;
        while let Some(set_dir) = sets.next_entry().await? {
            if !set_dir.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(set_dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let raw = tokio::fs::read(&path).await?;
                let meta: FileMeta = match serde_json::from_slice(&raw) {
                    Ok(meta) => meta,
                    Err(error) => {
                        tracing::warn!(path = %path.display(), %error, "skipping unreadable stream metadata");
                        continue;
                    }
                };
                max_version = max_version.max(meta.version);
                entries.put(
                    StreamKey::new(meta.entity_set, meta.key),
                    FileEntry {
                        data_path: path.with_extension("bin"),
                        content_type: meta.content_type,
                        version: meta.version,
                        updated_at: meta.updated_at,
                    },
                    None,
                );
            }
        }

        tracing::debug!(root = %root.display(), indexed = entries.values(None).len(), "opened file stream store");
        Ok(Self {
            inner: Arc::new(FileInner {
                root,
                entries,
                versions: AtomicU64::new(max_version),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Where the committed bytes of `key` live.
    pub fn data_path(&self, key: &StreamKey) -> PathBuf {
        self.inner
            .root
            .join("streams")
            .join(&key.entity_set)
            .join(format!("{}.bin", key.file_stem()))
    }

    fn staging_dir(&self, changeset: ChangesetId) -> PathBuf {
        self.inner.root.join("staging").join(changeset.to_string())
    }

    fn staged_path(&self, key: &StreamKey, changeset: ChangesetId) -> PathBuf {
        self.staging_dir(changeset)
            .join(&key.entity_set)
            .join(format!("{}.bin", key.file_stem()))
    }

    /// Whether committed bytes for the entity exist on disk.
    pub async fn exists(&self, entity_set: &str, key: &EntityKey) -> bool {
        let path = self.data_path(&StreamKey::new(entity_set, key.clone()));
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    fn next_version(&self) -> u64 {
        self.inner.versions.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Where files replaced or deleted by `changeset` wait until it settles.
    fn replaced_path(&self, key: &StreamKey, changeset: ChangesetId) -> PathBuf {
        self.inner
            .root
            .join("replaced")
            .join(changeset.to_string())
            .join(&key.entity_set)
            .join(format!("{}.bin", key.file_stem()))
    }

    /// Move the committed files of `key` out of the way.
    async fn set_aside(&self, key: &StreamKey, changeset: ChangesetId) -> Result<()> {
        let target = self.data_path(key);
        let aside = self.replaced_path(key, changeset);
        if let Some(parent) = aside.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        for ext in ["json", "bin"] {
            let from = target.with_extension(ext);
            if is_file(&from).await {
                tokio::fs::rename(&from, aside.with_extension(ext))
                    .await
                    .with_context(|| format!("setting aside {}", from.display()))?;
            }
        }
        Ok(())
    }

    /// Replace the committed files of `key` with its staged ones.
    async fn publish(&self, key: &StreamKey, pending: Option<&FileEntry>, changeset: ChangesetId) -> Result<()> {
        self.set_aside(key, changeset).await?;
        let Some(entry) = pending else {
            return Ok(());
        };
        let target = self.data_path(key);
        tokio::fs::rename(&entry.data_path, &target)
            .await
            .with_context(|| format!("publishing {key}"))?;
        tokio::fs::rename(entry.data_path.with_extension("json"), target.with_extension("json"))
            .await
            .with_context(|| format!("publishing metadata of {key}"))?;
        Ok(())
    }

    /// Put back whatever `publish` changed for `key`.
    async fn restore(&self, key: &StreamKey, changeset: ChangesetId) -> Result<()> {
        let target = self.data_path(key);
        let aside = self.replaced_path(key, changeset);
        for ext in ["json", "bin"] {
            let published = target.with_extension(ext);
            if is_file(&published).await {
                tokio::fs::remove_file(&published).await?;
            }
            let saved = aside.with_extension(ext);
            if is_file(&saved).await {
                tokio::fs::rename(&saved, &published).await?;
            }
        }
        Ok(())
    }

    async fn unpublish(&self, key: &StreamKey) -> Result<()> {
        let target = self.data_path(key);
        for path in [target.with_extension("json"), target] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
            }
        }
        Ok(())
    }

    async fn clear_staging(&self, changeset: ChangesetId) {
        let replaced = self.inner.root.join("replaced").join(changeset.to_string());
        for dir in [self.staging_dir(changeset), replaced] {
            if let Err(error) = tokio::fs::remove_dir_all(&dir).await {
                if error.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(dir = %dir.display(), %error, "failed to clear staging directory");
                }
            }
        }
    }
}

#[async_trait]
impl ChangesetParticipant for FileStreamStore {
    fn participant_name(&self) -> &'static str {
        "file-streams"
    }

    async fn prepare(&self, changeset: ChangesetId) -> Result<()> {
        for (key, pending) in self.inner.entries.staged(changeset) {
            let Some(entry) = pending else {
                continue;
            };
            let size_bytes = tokio::fs::metadata(&entry.data_path)
                .await
                .with_context(|| format!("staged bytes of {key} are missing"))?
                .len();
            let meta = FileMeta {
                entity_set: key.entity_set.clone(),
                key: key.key.clone(),
                content_type: entry.content_type.clone(),
                size_bytes,
                version: entry.version,
                updated_at: entry.updated_at,
            };
            tokio::fs::write(entry.data_path.with_extension("json"), serde_json::to_vec(&meta)?).await?;
            if let Some(parent) = self.data_path(&key).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    async fn commit(&self, changeset: ChangesetId) -> Result<()> {
        // metadata writes are idempotent, so a caller that skipped prepare is fine
        if let Err(error) = self.prepare(changeset).await {
            self.rollback(changeset).await;
            return Err(error);
        }
        let staged = self.inner.entries.staged(changeset);
        let mut touched: Vec<&StreamKey> = Vec::new();
        let mut failure = None;
        for (key, pending) in &staged {
            touched.push(key);
            if let Err(error) = self.publish(key, pending.as_ref(), changeset).await {
                failure = Some(error);
                break;
            }
        }

        if let Some(error) = failure {
            for key in touched.into_iter().rev() {
                if let Err(restore_error) = self.restore(key, changeset).await {
                    tracing::error!(%changeset, %key, error = %restore_error, "failed to restore stream files");
                }
            }
            self.inner.entries.rollback(changeset);
            self.clear_staging(changeset).await;
            return Err(error);
        }

        let applied = staged.len();
        self.inner.entries.rollback(changeset);
        for (key, pending) in staged {
            match pending {
                Some(entry) => {
                    let data_path = self.data_path(&key);
                    self.inner.entries.put(key, FileEntry { data_path, ..entry }, None);
                }
                None => self.inner.entries.remove(key, None),
            }
        }
        self.clear_staging(changeset).await;
        tracing::debug!(%changeset, applied, "committed staged stream files");
        Ok(())
    }

    async fn rollback(&self, changeset: ChangesetId) {
        let dropped = self.inner.entries.rollback(changeset);
        self.clear_staging(changeset).await;
        tracing::debug!(%changeset, dropped, "rolled back staged stream files");
    }
}

#[async_trait]
impl StreamStore for FileStreamStore {
    async fn open_write(
        &self,
        key: &StreamKey,
        content_type: &str,
        changeset: ChangesetId,
    ) -> ProviderResult<WriteStream> {
        let path = self.staged_path(key, changeset);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        self.inner.entries.put(
            key.clone(),
            FileEntry {
                data_path: path,
                content_type: content_type.to_string(),
                version: self.next_version(),
                updated_at: Utc::now(),
            },
            Some(changeset),
        );
        Ok(Box::pin(file))
    }

    async fn open_read(&self, key: &StreamKey, changeset: Option<ChangesetId>) -> ProviderResult<Option<ByteStream>> {
        match self.inner.entries.get(key, changeset) {
            Some(entry) => {
                let file = tokio::fs::File::open(&entry.data_path).await?;
                Ok(Some(Box::pin(read_file(file))))
            }
            None => Ok(None),
        }
    }

    async fn head(&self, key: &StreamKey, changeset: Option<ChangesetId>) -> ProviderResult<Option<StreamHead>> {
        let Some(entry) = self.inner.entries.get(key, changeset) else {
            return Ok(None);
        };
        let size_bytes = match tokio::fs::metadata(&entry.data_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Some(StreamHead {
            size_bytes,
            content_type: entry.content_type,
            etag: Some(format!("\"f{}\"", entry.version)),
            updated_at: entry.updated_at,
        }))
    }

    async fn delete(&self, key: &StreamKey, changeset: Option<ChangesetId>) -> ProviderResult<()> {
        match changeset {
            Some(_) => self.inner.entries.remove(key.clone(), changeset),
            None => {
                self.unpublish(key).await.map_err(|e| io::Error::other(e.to_string()))?;
                self.inner.entries.remove(key.clone(), None);
            }
        }
        Ok(())
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}

fn read_file(mut file: tokio::fs::File) -> impl Stream<Item = Result<Bytes, io::Error>> + Send {
    async_stream::stream! {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => yield Ok::<Bytes, io::Error>(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    }
}
