//! The stream provider interface.
//!
//! One provider instance serves one logical HTTP exchange. The engine calls its
//! hooks in a fixed order per operation kind and disposes the instance exactly
//! once on every exit path:
//!
//! | Operation  | Hooks |
//! |------------|-------|
//! | GET `$value` | `get_stream_content_type`, `get_read_stream`, `get_stream_etag`, `stream_buffer_size`, `dispose` |
//! | GET entry    | `get_stream_etag`, `get_read_stream_uri`, `get_stream_content_type`, `dispose` |
//! | POST create  | `resolve_type`, `get_write_stream`, `dispose` |
//! | PUT `$value` | `get_write_stream`, `stream_buffer_size`, `get_stream_etag`, `dispose` |
//! | DELETE entry | `delete_stream`, `dispose` |
//!
//! Downstream interceptors and caches rely on this order, so implementations
//! must not assume any other sequence.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use media_core::ChangesetParticipant;

use crate::{ByteStream, MediaEntity, ProviderResult, StreamContext, WriteStream};

/// Backend contract for reading, writing and describing media resources.
#[async_trait]
pub trait StreamProvider: Send + Sync {
    /// Name of the concrete entity type to create for a media resource posted to `entity_set`.
    async fn resolve_type(&self, entity_set: &str, ctx: &StreamContext) -> ProviderResult<Option<String>>;

    /// Open the media resource for reading.
    async fn get_read_stream(
        &self,
        entity: &MediaEntity,
        accept_types: &[String],
        ctx: &StreamContext,
    ) -> ProviderResult<ByteStream>;

    /// Open a sink for the new bytes of the media resource. Bytes become
    /// visible when the sink is shut down and the changeset commits.
    async fn get_write_stream(
        &self,
        entity: &MediaEntity,
        content_type: &str,
        slug: Option<&str>,
        ctx: &StreamContext,
    ) -> ProviderResult<WriteStream>;

    async fn get_stream_content_type(
        &self,
        entity: &MediaEntity,
        ctx: &StreamContext,
    ) -> ProviderResult<Option<String>>;

    /// Raw entity tag of the media resource. `None` or empty means no tag.
    async fn get_stream_etag(&self, entity: &MediaEntity, ctx: &StreamContext) -> ProviderResult<Option<String>>;

    /// Absolute URI the media resource can be read from. `None` means the
    /// service's own `$value` endpoint.
    async fn get_read_stream_uri(
        &self,
        entity: &MediaEntity,
        ctx: &StreamContext,
    ) -> ProviderResult<Option<String>>;

    /// Preferred copy buffer size. Zero or negative selects the engine default.
    fn stream_buffer_size(&self) -> i32;

    async fn delete_stream(&self, entity: &MediaEntity, ctx: &StreamContext) -> ProviderResult<()>;

    /// Release everything held by this instance.
    fn dispose(&mut self);
}

/// Names of the provider hooks, in the form used by call logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderCall {
    ResolveType,
    GetReadStream,
    GetWriteStream,
    GetStreamContentType,
    GetStreamETag,
    GetReadStreamUri,
    StreamBufferSize,
    DeleteStream,
    Dispose,
}

impl ProviderCall {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderCall::ResolveType => "ResolveType",
            ProviderCall::GetReadStream => "GetReadStream",
            ProviderCall::GetWriteStream => "GetWriteStream",
            ProviderCall::GetStreamContentType => "GetStreamContentType",
            ProviderCall::GetStreamETag => "GetStreamETag",
            ProviderCall::GetReadStreamUri => "GetReadStreamUri",
            ProviderCall::StreamBufferSize => "StreamBufferSize",
            ProviderCall::DeleteStream => "DeleteStream",
            ProviderCall::Dispose => "Dispose",
        }
    }

    /// Method path used in error messages, e.g. `StreamProvider::get_stream_etag`.
    pub fn method_path(&self) -> &'static str {
        match self {
            ProviderCall::ResolveType => "StreamProvider::resolve_type",
            ProviderCall::GetReadStream => "StreamProvider::get_read_stream",
            ProviderCall::GetWriteStream => "StreamProvider::get_write_stream",
            ProviderCall::GetStreamContentType => "StreamProvider::get_stream_content_type",
            ProviderCall::GetStreamETag => "StreamProvider::get_stream_etag",
            ProviderCall::GetReadStreamUri => "StreamProvider::get_read_stream_uri",
            ProviderCall::StreamBufferSize => "StreamProvider::stream_buffer_size",
            ProviderCall::DeleteStream => "StreamProvider::delete_stream",
            ProviderCall::Dispose => "StreamProvider::dispose",
        }
    }
}

impl fmt::Display for ProviderCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Creates one provider instance per request.
pub trait StreamProviderFactory: Send + Sync {
    fn create(&self) -> Box<dyn StreamProvider>;

    /// Store that must take part in changeset commit/rollback, if any.
    fn participant(&self) -> Option<Arc<dyn ChangesetParticipant>> {
        None
    }
}

/// A provider instance that is disposed when the lease is dropped.
pub struct ProviderLease {
    provider: Box<dyn StreamProvider>,
}

impl ProviderLease {
    pub fn new(provider: Box<dyn StreamProvider>) -> Self {
        Self { provider }
    }
}

impl Deref for ProviderLease {
    type Target = dyn StreamProvider;

    fn deref(&self) -> &Self::Target {
        self.provider.as_ref()
    }
}

impl Drop for ProviderLease {
    fn drop(&mut self) {
        self.provider.dispose();
    }
}

/// Creates the provider instance on first use, so requests that never touch a
/// stream never create (or dispose) one.
pub struct LazyProvider<'f> {
    factory: &'f dyn StreamProviderFactory,
    lease: Option<ProviderLease>,
}

impl<'f> LazyProvider<'f> {
    pub fn new(factory: &'f dyn StreamProviderFactory) -> Self {
        Self { factory, lease: None }
    }

    pub fn get(&mut self) -> &ProviderLease {
        let factory = self.factory;
        self.lease
            .get_or_insert_with(|| ProviderLease::new(factory.create()))
    }

    pub fn is_created(&self) -> bool {
        self.lease.is_some()
    }

    /// Dispose now instead of at end of scope.
    pub fn release(&mut self) {
        self.lease = None;
    }
}
