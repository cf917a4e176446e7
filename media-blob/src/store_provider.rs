//! Stream provider over any [`StreamStore`], with per-scenario overrides.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use media_core::{ChangesetId, ChangesetParticipant};
use parking_lot::RwLock;

use crate::{
    ByteStream, MediaEntity, ProviderCall, ProviderError, ProviderResult, StreamContext, StreamKey,
    StreamProvider, StreamProviderFactory, StreamStore, WriteStream,
};

/// Replacements for provider answers, injected per scenario.
///
/// `Some(None)` forces a hook to answer `None`; `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct StreamOverrides {
    pub etag: Option<Option<String>>,
    pub content_type: Option<Option<String>>,
    pub read_uri: Option<Option<String>>,
    pub resolved_type: Option<Option<String>>,
    pub buffer_size: Option<i32>,
    /// When set, writes with any other content type are rejected.
    pub accepted_content_types: Option<Vec<String>>,
    /// Hook that fails with a backend error.
    pub fail_on: Option<ProviderCall>,
}

impl StreamOverrides {
    fn check(&self, call: ProviderCall) -> ProviderResult<()> {
        if self.fail_on == Some(call) {
            return Err(ProviderError::backend(io::Error::other(format!(
                "injected failure in {call}"
            ))));
        }
        Ok(())
    }
}

fn require_changeset(ctx: &StreamContext) -> ProviderResult<ChangesetId> {
    ctx.changeset
        .ok_or_else(|| ProviderError::invalid("stream writes must run inside a changeset"))
}

/// Provider answering every hook from a [`StreamStore`].
pub struct StoreStreamProvider<S> {
    store: Arc<S>,
    overrides: StreamOverrides,
    types: HashMap<String, String>,
}

impl<S: StreamStore> StoreStreamProvider<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            overrides: StreamOverrides::default(),
            types: HashMap::new(),
        }
    }
}

#[async_trait]
impl<S: StreamStore> StreamProvider for StoreStreamProvider<S> {
    async fn resolve_type(&self, entity_set: &str, _ctx: &StreamContext) -> ProviderResult<Option<String>> {
        self.overrides.check(ProviderCall::ResolveType)?;
        if let Some(forced) = &self.overrides.resolved_type {
            return Ok(forced.clone());
        }
        Ok(self.types.get(entity_set).cloned())
    }

    async fn get_read_stream(
        &self,
        entity: &MediaEntity,
        _accept_types: &[String],
        ctx: &StreamContext,
    ) -> ProviderResult<ByteStream> {
        self.overrides.check(ProviderCall::GetReadStream)?;
        self.store
            .open_read(&StreamKey::of(entity), ctx.changeset)
            .await?
            .ok_or_else(|| ProviderError::not_found(entity.resource_path()))
    }

    async fn get_write_stream(
        &self,
        entity: &MediaEntity,
        content_type: &str,
        _slug: Option<&str>,
        ctx: &StreamContext,
    ) -> ProviderResult<WriteStream> {
        self.overrides.check(ProviderCall::GetWriteStream)?;
        if let Some(accepted) = &self.overrides.accepted_content_types {
            if !accepted.iter().any(|a| a.eq_ignore_ascii_case(content_type)) {
                return Err(ProviderError::content_type_rejected(
                    entity.resource_path(),
                    content_type,
                ));
            }
        }
        let changeset = require_changeset(ctx)?;
        self.store
            .open_write(&StreamKey::of(entity), content_type, changeset)
            .await
    }

    async fn get_stream_content_type(
        &self,
        entity: &MediaEntity,
        ctx: &StreamContext,
    ) -> ProviderResult<Option<String>> {
        self.overrides.check(ProviderCall::GetStreamContentType)?;
        if let Some(forced) = &self.overrides.content_type {
            return Ok(forced.clone());
        }
        let head = self.store.head(&StreamKey::of(entity), ctx.changeset).await?;
        Ok(head.map(|h| h.content_type))
    }

    async fn get_stream_etag(&self, entity: &MediaEntity, ctx: &StreamContext) -> ProviderResult<Option<String>> {
        self.overrides.check(ProviderCall::GetStreamETag)?;
        if let Some(forced) = &self.overrides.etag {
            return Ok(forced.clone());
        }
        let head = self.store.head(&StreamKey::of(entity), ctx.changeset).await?;
        Ok(head.and_then(|h| h.etag))
    }

    async fn get_read_stream_uri(
        &self,
        _entity: &MediaEntity,
        _ctx: &StreamContext,
    ) -> ProviderResult<Option<String>> {
        self.overrides.check(ProviderCall::GetReadStreamUri)?;
        Ok(self.overrides.read_uri.clone().flatten())
    }

    fn stream_buffer_size(&self) -> i32 {
        self.overrides.buffer_size.unwrap_or(0)
    }

    async fn delete_stream(&self, entity: &MediaEntity, ctx: &StreamContext) -> ProviderResult<()> {
        self.overrides.check(ProviderCall::DeleteStream)?;
        self.store.delete(&StreamKey::of(entity), ctx.changeset).await
    }

    fn dispose(&mut self) {
        self.types.clear();
    }
}

/// Factory for [`StoreStreamProvider`]s sharing one store.
pub struct StoreProviderFactory<S> {
    store: Arc<S>,
    overrides: Arc<RwLock<StreamOverrides>>,
    types: Arc<RwLock<HashMap<String, String>>>,
}

impl<S> Clone for StoreProviderFactory<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            overrides: Arc::clone(&self.overrides),
            types: Arc::clone(&self.types),
        }
    }
}

impl<S: StreamStore> StoreProviderFactory<S> {
    pub fn new(store: S) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<S>) -> Self {
        Self {
            store,
            overrides: Arc::new(RwLock::new(StreamOverrides::default())),
            types: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Type name `resolve_type` answers for posts to `entity_set`.
    pub fn with_type(self, entity_set: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.types.write().insert(entity_set.into(), type_name.into());
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn set_overrides(&self, overrides: StreamOverrides) {
        *self.overrides.write() = overrides;
    }

    pub fn update_overrides<F: FnOnce(&mut StreamOverrides)>(&self, f: F) {
        f(&mut self.overrides.write());
    }

    pub fn clear_overrides(&self) {
        self.set_overrides(StreamOverrides::default());
    }
}

impl<S: StreamStore> StreamProviderFactory for StoreProviderFactory<S> {
    fn create(&self) -> Box<dyn StreamProvider> {
        Box::new(StoreStreamProvider {
            store: Arc::clone(&self.store),
            overrides: self.overrides.read().clone(),
            types: self.types.read().clone(),
        })
    }

    fn participant(&self) -> Option<Arc<dyn ChangesetParticipant>> {
        let store: Arc<dyn ChangesetParticipant> = self.store.clone();
        Some(store)
    }
}
