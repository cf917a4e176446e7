//! Call-order recording and leak tracking for stream providers.
//!
//! Wrap any factory in a [`RecordingFactory`] to get a [`CallRecorder`] that
//! logs every hook invocation per provider instance and counts instances that
//! were created but never disposed. The recorder is shared explicitly, so
//! concurrent engines each observe only their own calls.

use std::sync::Arc;

use async_trait::async_trait;
use media_core::ChangesetParticipant;
use parking_lot::Mutex;

use crate::{
    ByteStream, MediaEntity, ProviderCall, ProviderResult, StreamContext, StreamProvider,
    StreamProviderFactory, WriteStream,
};

/// One logged hook invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRecord {
    pub instance: u64,
    pub call: ProviderCall,
}

#[derive(Debug, Default)]
struct RecorderState {
    records: Vec<CallRecord>,
    next_instance: u64,
    created: u64,
    disposed: u64,
}

/// Shared, lock-protected call log.
#[derive(Debug, Clone, Default)]
pub struct CallRecorder {
    state: Arc<Mutex<RecorderState>>,
}

impl CallRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn register_instance(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_instance += 1;
        state.created += 1;
        state.next_instance
    }

    fn record(&self, instance: u64, call: ProviderCall) {
        let mut state = self.state.lock();
        if call == ProviderCall::Dispose {
            state.disposed += 1;
        }
        state.records.push(CallRecord { instance, call });
    }

    /// Every recorded call, in invocation order.
    pub fn records(&self) -> Vec<CallRecord> {
        self.state.lock().records.clone()
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state.lock().records.iter().map(|r| r.call).collect()
    }

    pub fn calls_for(&self, instance: u64) -> Vec<ProviderCall> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|r| r.instance == instance)
            .map(|r| r.call)
            .collect()
    }

    /// Instance ids in order of first appearance in the log.
    pub fn instances(&self) -> Vec<u64> {
        let state = self.state.lock();
        let mut seen = Vec::new();
        for record in &state.records {
            if !seen.contains(&record.instance) {
                seen.push(record.instance);
            }
        }
        seen
    }

    /// Comma-separated log, e.g. `GetStreamETag,GetReadStreamUri,Dispose`.
    pub fn log(&self) -> String {
        self.calls()
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn created(&self) -> u64 {
        self.state.lock().created
    }

    pub fn disposed(&self) -> u64 {
        self.state.lock().disposed
    }

    /// Instances created but not yet disposed.
    pub fn live(&self) -> u64 {
        let state = self.state.lock();
        state.created.saturating_sub(state.disposed)
    }

    /// Forget the call log. Instance accounting is kept.
    pub fn clear(&self) {
        self.state.lock().records.clear();
    }
}

/// Provider wrapper that logs each hook before delegating.
pub struct RecordingProvider {
    inner: Box<dyn StreamProvider>,
    recorder: CallRecorder,
    instance: u64,
    disposed: bool,
}

impl RecordingProvider {
    pub fn new(inner: Box<dyn StreamProvider>, recorder: CallRecorder) -> Self {
        let instance = recorder.register_instance();
        Self {
            inner,
            recorder,
            instance,
            disposed: false,
        }
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    fn note(&self, call: ProviderCall) {
        self.recorder.record(self.instance, call);
    }
}

#[async_trait]
impl StreamProvider for RecordingProvider {
    async fn resolve_type(&self, entity_set: &str, ctx: &StreamContext) -> ProviderResult<Option<String>> {
        self.note(ProviderCall::ResolveType);
        self.inner.resolve_type(entity_set, ctx).await
    }

    async fn get_read_stream(
        &self,
        entity: &MediaEntity,
        accept_types: &[String],
        ctx: &StreamContext,
    ) -> ProviderResult<ByteStream> {
        self.note(ProviderCall::GetReadStream);
        self.inner.get_read_stream(entity, accept_types, ctx).await
    }

    async fn get_write_stream(
        &self,
        entity: &MediaEntity,
        content_type: &str,
        slug: Option<&str>,
        ctx: &StreamContext,
    ) -> ProviderResult<WriteStream> {
        self.note(ProviderCall::GetWriteStream);
        self.inner.get_write_stream(entity, content_type, slug, ctx).await
    }

    async fn get_stream_content_type(
        &self,
        entity: &MediaEntity,
        ctx: &StreamContext,
    ) -> ProviderResult<Option<String>> {
        self.note(ProviderCall::GetStreamContentType);
        self.inner.get_stream_content_type(entity, ctx).await
    }

    async fn get_stream_etag(&self, entity: &MediaEntity, ctx: &StreamContext) -> ProviderResult<Option<String>> {
        self.note(ProviderCall::GetStreamETag);
        self.inner.get_stream_etag(entity, ctx).await
    }

    async fn get_read_stream_uri(
        &self,
        entity: &MediaEntity,
        ctx: &StreamContext,
    ) -> ProviderResult<Option<String>> {
        self.note(ProviderCall::GetReadStreamUri);
        self.inner.get_read_stream_uri(entity, ctx).await
    }

    fn stream_buffer_size(&self) -> i32 {
        self.note(ProviderCall::StreamBufferSize);
        self.inner.stream_buffer_size()
    }

    async fn delete_stream(&self, entity: &MediaEntity, ctx: &StreamContext) -> ProviderResult<()> {
        self.note(ProviderCall::DeleteStream);
        self.inner.delete_stream(entity, ctx).await
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.note(ProviderCall::Dispose);
        self.inner.dispose();
    }
}

/// Factory wrapper producing [`RecordingProvider`]s.
pub struct RecordingFactory<F> {
    inner: F,
    recorder: CallRecorder,
}

impl<F: StreamProviderFactory> RecordingFactory<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            recorder: CallRecorder::new(),
        }
    }

    pub fn with_recorder(inner: F, recorder: CallRecorder) -> Self {
        Self { inner, recorder }
    }

    pub fn recorder(&self) -> CallRecorder {
        self.recorder.clone()
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: StreamProviderFactory> StreamProviderFactory for RecordingFactory<F> {
    fn create(&self) -> Box<dyn StreamProvider> {
        Box::new(RecordingProvider::new(self.inner.create(), self.recorder.clone()))
    }

    fn participant(&self) -> Option<Arc<dyn ChangesetParticipant>> {
        self.inner.participant()
    }
}
