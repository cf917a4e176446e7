//! The media operation state machine.
//!
//! Every request is classified, negotiated, authorized and only then handed to
//! a stream provider. A provider instance is created lazily, at most one per
//! logical exchange (plus one for the refresh after a POST), and disposed on
//! every exit path by its lease.

use std::cmp::Ordering;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use http::header::CONTENT_TYPE;
use http::Method;
use media_blob::{
    ByteStream, EntityKey, LazyProvider, MediaEntity, ProviderCall, ProviderError, StreamContext,
    StreamProviderFactory, WriteStream,
};
use media_core::{
    ChangesetId, ChangesetParticipant, ErrorKind, MediaError, MediaResult, PipelineContext, PipelineHooks, PipelineStage,
};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use crate::classifier::{Classifier, ContentIds, EntityRef, MediaOperation, OperationKind, PathRoot, PathTarget, ResourcePath};
use crate::config::EngineConfig;
use crate::entities::{EntityRecord, EntityStore};
use crate::etag::{parse_provider_etag, EntityTag};
use crate::model::{EntitySetRight, MediaModel, NavigationProperty, ResolvedType};
use crate::negotiation::{negotiate_entry, resolve_provider_content_type, ENTRY_FORMAT};
use crate::payload::{entry_etag, EntryWriter, ExpandTree, StreamInfo};
use crate::request::{MediaRequest, RequestBody};
use crate::response::{MediaResponse, OperationState, ResponseBody};

/// Translate a failed hook into the status the engine answers with.
fn provider_failure(call: ProviderCall) -> impl FnOnce(ProviderError) -> MediaError {
    move |err| {
        tracing::warn!(%call, error = %err, "stream provider hook failed");
        match err.requested_status() {
            Some(code) => MediaError::new(ErrorKind::from_status(code), err.to_string()),
            None => MediaError::general_error(format!("{} failed: {err}", call.method_path()))
                .with_source(anyhow::Error::new(err)),
        }
    }
}

/// Where an MLE's entity tag comes from, for error messages.
fn tokens_origin(ty: &ResolvedType) -> String {
    format!("the concurrency tokens of '{}'", ty.name)
}

fn write_failure(err: io::Error) -> MediaError {
    MediaError::general_error(format!("Failed to write the media resource: {err}"))
}

/// Re-chunk a read stream to `size`-byte pieces.
fn rechunk(mut inner: ByteStream, size: usize) -> ByteStream {
    Box::pin(async_stream::stream! {
        let mut buf = BytesMut::with_capacity(size);
        while let Some(next) = inner.next().await {
            let mut bytes = match next {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            while !bytes.is_empty() {
                if buf.is_empty() && bytes.len() >= size {
                    yield Ok::<Bytes, io::Error>(bytes.split_to(size));
                    continue;
                }
                let take = (size - buf.len()).min(bytes.len());
                buf.extend_from_slice(&bytes.split_to(take));
                if buf.len() == size {
                    yield Ok(buf.split().freeze());
                }
            }
        }
        if !buf.is_empty() {
            yield Ok(buf.freeze());
        }
    })
}

/// Copy a request body into a provider sink and close it.
async fn copy_body(body: RequestBody, mut sink: WriteStream, chunk: usize) -> MediaResult<u64> {
    let mut stream = body.into_stream();
    let mut written: u64 = 0;
    while let Some(next) = stream.next().await {
        let bytes = next.map_err(|e| MediaError::bad_request(format!("Failed to read the request body: {e}")))?;
        for piece in bytes.chunks(chunk.max(1)) {
            sink.write_all(piece).await.map_err(write_failure)?;
        }
        written += bytes.len() as u64;
    }
    sink.shutdown().await.map_err(write_failure)?;
    Ok(written)
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

fn parse_object(bytes: &[u8]) -> MediaResult<Map<String, Value>> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(MediaError::bad_request("The request body must be a JSON object.")),
        Err(e) => Err(MediaError::bad_request(format!("The request body is not valid JSON: {e}"))),
    }
}

/// Records the states one operation passes through.
struct StateMachine {
    kind: Option<OperationKind>,
    states: Vec<OperationState>,
}

impl StateMachine {
    fn new() -> Self {
        Self {
            kind: None,
            states: Vec::new(),
        }
    }

    fn enter(&mut self, state: OperationState) {
        tracing::trace!(kind = ?self.kind, ?state, "operation state");
        self.states.push(state);
    }

    fn finish(mut self, result: MediaResult<MediaResponse>) -> MediaResponse {
        let mut response = match result {
            Ok(response) => response,
            Err(err) => {
                if err.code() >= 500 {
                    tracing::error!(kind = ?self.kind, error = %err, "media operation failed");
                } else {
                    tracing::debug!(kind = ?self.kind, error = %err, "media operation rejected");
                }
                MediaResponse::from_error(&err)
            }
        };
        self.enter(OperationState::Terminal(response.status));
        response.states = self.states;
        response
    }
}

/// A resolved target: its set, stored record and type.
struct Target<'m> {
    set: String,
    record: EntityRecord,
    ty: &'m ResolvedType,
}

impl Target<'_> {
    fn media_entity(&self) -> MediaEntity {
        self.record.to_media_entity(&self.set)
    }

    fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.set.clone(), self.record.key.clone())
    }
}

/// Builder for [`MediaEngine`].
#[derive(Default)]
pub struct MediaEngineBuilder {
    model: Option<MediaModel>,
    entities: Option<Arc<dyn EntityStore>>,
    streams: Option<Arc<dyn StreamProviderFactory>>,
    hooks: PipelineHooks,
    config: EngineConfig,
}

impl MediaEngineBuilder {
    pub fn model(mut self, model: MediaModel) -> Self {
        self.model = Some(model);
        self
    }

    pub fn entities(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.entities = Some(store);
        self
    }

    pub fn streams(mut self, factory: Arc<dyn StreamProviderFactory>) -> Self {
        self.streams = Some(factory);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn media_core::PipelineHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> MediaResult<MediaEngine> {
        let model = self
            .model
            .ok_or_else(|| MediaError::general_error("A media engine needs a model."))?;
        let entities = self
            .entities
            .ok_or_else(|| MediaError::general_error("A media engine needs an entity store."))?;
        let streams = self
            .streams
            .ok_or_else(|| MediaError::general_error("A media engine needs a stream provider factory."))?;
        Ok(MediaEngine {
            model: Arc::new(model),
            entities,
            streams,
            hooks: Arc::new(self.hooks),
            config: Arc::new(self.config),
        })
    }
}

/// Request-handling core between an HTTP front end and the stream providers.
#[derive(Clone)]
pub struct MediaEngine {
    model: Arc<MediaModel>,
    entities: Arc<dyn EntityStore>,
    streams: Arc<dyn StreamProviderFactory>,
    hooks: Arc<PipelineHooks>,
    config: Arc<EngineConfig>,
}

impl MediaEngine {
    pub fn builder() -> MediaEngineBuilder {
        MediaEngineBuilder::default()
    }

    pub fn model(&self) -> &MediaModel {
        &self.model
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn entities(&self) -> &Arc<dyn EntityStore> {
        &self.entities
    }

    pub(crate) fn hooks(&self) -> &PipelineHooks {
        &self.hooks
    }

    /// Path relative to the service root, without a leading `/`.
    pub(crate) fn relative_path<'p>(&self, path: &'p str) -> &'p str {
        let root_path = self
            .config
            .service_root
            .split_once("://")
            .and_then(|(_, rest)| rest.find('/').map(|i| &rest[i..]))
            .unwrap_or("/");
        let path = path
            .strip_prefix(self.config.service_root.as_str())
            .or_else(|| path.strip_prefix(root_path))
            .unwrap_or(path);
        path.trim_start_matches('/')
    }

    /// Whether the generic pipeline should hand this request to the engine.
    pub fn is_media_operation(&self, path: &str, method: &Method) -> bool {
        let path = path.split_once('?').map_or(path, |(p, _)| p);
        Classifier::new(&self.model).is_media_operation(method, self.relative_path(path))
    }

    /// Answer one request. Failures become error responses; this never fails.
    pub async fn dispatch(&self, request: MediaRequest) -> MediaResponse {
        let request_id = request
            .header_str("x-request-id")
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let span = tracing::info_span!(
            "media_request",
            method = %request.method,
            target = %request.target,
            request_id = %request_id
        );
        async move {
            let relative = self.relative_path(request.path()).to_string();
            if relative == "$batch" {
                return self.dispatch_batch_http(request, &request_id).await;
            }

            let ctx = PipelineContext::new(request_id.clone(), request.method.as_str(), request.path());
            if let Err(err) = self.hooks.run(PipelineStage::ProcessingRequest, &ctx).await {
                let response = MediaResponse::from_error(&MediaError::normalize(err));
                self.finish_request(&ctx, response.status).await;
                return response;
            }

            let response = if request.method == Method::GET {
                self.execute(request, None, &ContentIds::new(), &request_id).await
            } else {
                self.execute_in_changeset(&ctx, request, &request_id).await
            };
            tracing::info!(status = response.status, "media request completed");
            self.finish_request(&ctx, response.status).await;
            response
        }
        .instrument(span)
        .await
    }

    pub(crate) async fn finish_request(&self, ctx: &PipelineContext, status: u16) {
        let done = ctx.clone().with_status(status);
        if let Err(err) = self.hooks.run(PipelineStage::ProcessedRequest, &done).await {
            tracing::warn!(error = %err, "processed-request hook failed");
        }
    }

    /// A non-batch write runs in its own single-operation changeset.
    async fn execute_in_changeset(&self, ctx: &PipelineContext, request: MediaRequest, request_id: &str) -> MediaResponse {
        let changeset = match self.begin_changeset(ctx).await {
            Ok(cs) => cs,
            Err(err) => return MediaResponse::from_error(&err),
        };
        let response = self
            .execute(request, Some(changeset), &ContentIds::new(), request_id)
            .await;
        match self.end_changeset(ctx, changeset, response.is_success()).await {
            Ok(()) => response,
            Err(err) => MediaResponse::from_error(&err),
        }
    }

    /// Open a changeset and run the changeset-start hooks.
    pub async fn begin_changeset(&self, request: &PipelineContext) -> MediaResult<ChangesetId> {
        let changeset = ChangesetId::next();
        let ctx = request.clone().with_changeset(changeset);
        self.hooks
            .run(PipelineStage::ProcessingChangeset, &ctx)
            .await
            .map_err(MediaError::normalize)?;
        tracing::debug!(%changeset, "changeset opened");
        Ok(changeset)
    }

    /// Commit (or roll back) everything staged under `changeset`, then run the
    /// changeset-end hooks. A failed commit rolls back and reports 500.
    pub async fn end_changeset(&self, request: &PipelineContext, changeset: ChangesetId, success: bool) -> MediaResult<()> {
        let participant = self.streams.participant();
        let mut outcome = Ok(());
        if success {
            if let Err(err) = self.commit_changeset(changeset, participant.as_deref()).await {
                let streams = participant.as_ref().map(|p| p.participant_name()).unwrap_or("none");
                tracing::warn!(%changeset, streams, error = %err, "changeset commit failed, rolling back");
                self.rollback_changeset(changeset, participant.as_deref()).await;
                outcome = Err(MediaError::normalize(err));
            } else {
                tracing::debug!(%changeset, "changeset committed");
            }
        } else {
            self.rollback_changeset(changeset, participant.as_deref()).await;
            tracing::debug!(%changeset, "changeset rolled back");
        }

        let status = match (&outcome, success) {
            (Err(err), _) => err.code(),
            (Ok(()), true) => 200,
            (Ok(()), false) => 500,
        };
        let ctx = request.clone().with_changeset(changeset).with_status(status);
        self.hooks
            .run(PipelineStage::ProcessedChangeset, &ctx)
            .await
            .map_err(MediaError::normalize)?;
        outcome
    }

    /// Both stores prepare before either publishes. Streams publish first
    /// and undo their own partial work on failure, so a stream error leaves
    /// the entity store untouched.
    async fn commit_changeset(
        &self,
        changeset: ChangesetId,
        streams: Option<&dyn ChangesetParticipant>,
    ) -> anyhow::Result<()> {
        self.entities.prepare(changeset).await?;
        if let Some(streams) = streams {
            streams.prepare(changeset).await?;
            streams.commit(changeset).await?;
        }
        self.entities.commit(changeset).await
    }

    async fn rollback_changeset(&self, changeset: ChangesetId, streams: Option<&dyn ChangesetParticipant>) {
        self.entities.rollback(changeset).await;
        if let Some(streams) = streams {
            streams.rollback(changeset).await;
        }
    }

    /// Run one operation without pipeline hooks. Writes need a changeset.
    pub(crate) async fn execute(
        &self,
        request: MediaRequest,
        changeset: Option<ChangesetId>,
        ids: &ContentIds,
        request_id: &str,
    ) -> MediaResponse {
        let mut machine = StateMachine::new();
        let ctx = StreamContext::new(request.method.clone(), self.config.service_root.clone())
            .with_headers(request.headers.clone())
            .with_request_id(request_id)
            .with_changeset(changeset);
        let relative = self.relative_path(request.path()).to_string();

        let op = match Classifier::new(&self.model).classify(request, &relative, ids) {
            Ok(op) => op,
            Err(err) => return machine.finish(Err(err)),
        };
        machine.kind = Some(op.kind);
        machine.enter(OperationState::Classified);

        let result = if op.kind.is_write() && changeset.is_none() {
            Err(MediaError::general_error(format!(
                "{} operations must run inside a changeset.",
                op.kind
            )))
        } else {
            self.run(op, &ctx, ids, &mut machine).await
        };
        machine.finish(result)
    }

    async fn run(
        &self,
        op: MediaOperation,
        ctx: &StreamContext,
        ids: &ContentIds,
        machine: &mut StateMachine,
    ) -> MediaResult<MediaResponse> {
        match op.kind {
            OperationKind::GetMr => self.get_media_resource(op, ctx, machine).await,
            OperationKind::GetMle => self.get_entry(op, ctx, machine).await,
            OperationKind::GetFeed => self.get_feed(op, ctx, machine).await,
            OperationKind::PostCreate => self.post_media_resource(op, ctx, machine).await,
            OperationKind::PostEntry => self.post_entry(op, ctx, ids, machine).await,
            OperationKind::PutMr => self.put_media_resource(op, ctx, machine).await,
            OperationKind::PutMle | OperationKind::PatchMle => self.update_entry(op, ctx, machine).await,
            OperationKind::DeleteMle => self.delete_entry(op, ctx, machine).await,
            OperationKind::LinkRef => self.link_operation(op, ctx, ids, machine).await,
            OperationKind::DeleteMr | OperationKind::Unsupported => Err(MediaError::method_not_allowed(format!(
                "{} is not supported on this resource.",
                op.method
            ))),
        }
    }

    // ---- shared steps ----

    fn authorize(&self, set: &str, right: EntitySetRight) -> MediaResult<()> {
        let allowed = self
            .model
            .entity_set(set)
            .is_some_and(|s| s.rights.allows(right));
        if !allowed {
            return Err(MediaError::forbidden(format!(
                "The entity set '{set}' does not allow {} operations.",
                right.as_str()
            )));
        }
        Ok(())
    }

    fn entity_type(&self, name: &str) -> MediaResult<&ResolvedType> {
        self.model
            .entity_type(name)
            .ok_or_else(|| MediaError::general_error(format!("Entity type '{name}' is not declared in the model.")))
    }

    async fn fetch(&self, set: &str, key: &EntityKey, changeset: Option<ChangesetId>) -> MediaResult<EntityRecord> {
        self.entities
            .get(set, key, changeset)
            .await
            .map_err(MediaError::normalize)?
            .ok_or_else(|| MediaError::not_found(format!("Resource not found for the segment '{set}({key})'.")))
    }

    /// Records a navigation property points at, skipping dangling links.
    async fn linked(
        &self,
        record: &EntityRecord,
        nav: &NavigationProperty,
        changeset: Option<ChangesetId>,
    ) -> MediaResult<Vec<EntityRecord>> {
        let mut out = Vec::new();
        for key in record.links.get(&nav.name).into_iter().flatten() {
            if let Some(found) = self
                .entities
                .get(&nav.target_set, key, changeset)
                .await
                .map_err(MediaError::normalize)?
            {
                out.push(found);
            }
        }
        Ok(out)
    }

    /// The entity the operation addresses, following a single-valued navigation.
    async fn resolve_target(&self, op: &MediaOperation, changeset: Option<ChangesetId>) -> MediaResult<Target<'_>> {
        let key = op
            .key
            .as_ref()
            .ok_or_else(|| MediaError::bad_request("The request does not address a single entity."))?;
        let record = self.fetch(&op.set, key, changeset).await?;
        let (set, record) = match &op.navigation {
            None => (op.set.clone(), record),
            Some(nav) => {
                let target_key = record
                    .links
                    .get(&nav.name)
                    .and_then(|keys| keys.first())
                    .ok_or_else(|| {
                        MediaError::not_found(format!("Resource not found for the segment '{}'.", nav.name))
                    })?;
                let target = self.fetch(&nav.target_set, target_key, changeset).await?;
                (nav.target_set.clone(), target)
            }
        };
        let ty = self.entity_type(&record.type_name)?;
        Ok(Target { set, record, ty })
    }

    /// Set the operation reads from or writes to.
    fn target_set<'o>(&self, op: &'o MediaOperation) -> &'o str {
        op.navigation.as_ref().map_or(op.set.as_str(), |nav| nav.target_set.as_str())
    }

    fn require_stream(&self, target: &Target<'_>) -> MediaResult<()> {
        if !target.ty.is_stream {
            return Err(MediaError::bad_request(format!(
                "The entity '{}' of type '{}' is not a media link entry and has no media resource.",
                target.entity_ref().path(),
                target.ty.name
            )));
        }
        Ok(())
    }

    /// GET MLE hook sequence: etag, read uri, content type.
    async fn describe_stream(
        &self,
        provider: &mut LazyProvider<'_>,
        entity: &MediaEntity,
        ctx: &StreamContext,
    ) -> MediaResult<StreamInfo> {
        let p = provider.get();
        let raw = p
            .get_stream_etag(entity, ctx)
            .await
            .map_err(provider_failure(ProviderCall::GetStreamETag))?;
        let etag = parse_provider_etag(ProviderCall::GetStreamETag, raw.as_deref())?;
        let read_uri = p
            .get_read_stream_uri(entity, ctx)
            .await
            .map_err(provider_failure(ProviderCall::GetReadStreamUri))?;
        if let Some(uri) = &read_uri {
            if !uri.contains("://") {
                return Err(MediaError::general_error(format!(
                    "{} must return an absolute URI; '{uri}' is relative.",
                    ProviderCall::GetReadStreamUri.method_path()
                )));
            }
        }
        let raw = p
            .get_stream_content_type(entity, ctx)
            .await
            .map_err(provider_failure(ProviderCall::GetStreamContentType))?;
        let content_type = resolve_provider_content_type(ProviderCall::GetStreamContentType, raw.as_deref())?;
        Ok(StreamInfo {
            etag,
            read_uri,
            content_type,
        })
    }

    /// One entry with its expansions. Stream-bearing entries run the GET MLE
    /// hook sequence on the shared provider, parent before children.
    fn render_entry<'a, 'f: 'a>(
        &'a self,
        provider: &'a mut LazyProvider<'f>,
        ctx: &'a StreamContext,
        set: &'a str,
        record: &'a EntityRecord,
        select: Option<&'a [String]>,
        expand: &'a ExpandTree,
    ) -> BoxFuture<'a, MediaResult<Value>> {
        Box::pin(async move {
            let ty = self.entity_type(&record.type_name)?;
            let stream = if ty.is_stream {
                let entity = record.to_media_entity(set);
                Some(self.describe_stream(provider, &entity, ctx).await?)
            } else {
                None
            };
            let mut entry = EntryWriter::new(&self.config).entry(set, ty, record, stream.as_ref(), select);

            for (name, child) in expand.children() {
                let Some(nav) = ty.nav(name) else {
                    continue;
                };
                let targets = self.linked(record, nav, ctx.changeset).await?;
                let value = if nav.many {
                    let mut items = Vec::with_capacity(targets.len());
                    for target in &targets {
                        items.push(
                            self.render_entry(provider, ctx, &nav.target_set, target, None, child)
                                .await?,
                        );
                    }
                    EntryWriter::feed(items, None)
                } else {
                    match targets.first() {
                        Some(target) => {
                            self.render_entry(provider, ctx, &nav.target_set, target, None, child)
                                .await?
                        }
                        None => Value::Null,
                    }
                };
                if let Value::Object(map) = &mut entry {
                    map.insert(name.to_string(), value);
                }
            }
            Ok(entry)
        })
    }

    /// Preconditions of an MLE. `Ok(Some(_))` is a terminal response.
    fn check_entry_preconditions(
        &self,
        op: &MediaOperation,
        target: &Target<'_>,
        current: &EntityTag,
    ) -> MediaResult<Option<MediaResponse>> {
        let has_tokens = target.ty.has_concurrency_tokens();
        let write = op.kind.is_write();
        if !has_tokens {
            if op.if_match.is_some() || op.if_none_match.is_some() {
                return Err(MediaError::bad_request(format!(
                    "If-Match or If-None-Match HTTP headers cannot be specified since the entity type '{}' has no concurrency tokens.",
                    target.ty.name
                )));
            }
            return Ok(None);
        }
        if write && op.if_match.is_none() {
            return Err(MediaError::bad_request(format!(
                "An If-Match HTTP header is required to modify '{}' because its type '{}' has concurrency tokens.",
                target.entity_ref().path(),
                target.ty.name
            )));
        }
        if let Some(condition) = &op.if_match {
            let strong_on_write = write && condition.is_strong_tag();
            if strong_on_write || !condition.matches(current) {
                return Ok(Some(Self::precondition_failed(
                    "The entity tag in the If-Match HTTP header does not match the current value of the entity.",
                )));
            }
        }
        if let Some(condition) = &op.if_none_match {
            if condition.matches(current) {
                return Ok(Some(
                    MediaResponse::new(304).with_etag(current, &tokens_origin(target.ty))?,
                ));
            }
        }
        Ok(None)
    }

    fn precondition_failed(message: &str) -> MediaResponse {
        MediaResponse::from_error(&MediaError::precondition_failed(message))
    }

    // ---- operations ----

    async fn get_media_resource(
        &self,
        op: MediaOperation,
        ctx: &StreamContext,
        machine: &mut StateMachine,
    ) -> MediaResult<MediaResponse> {
        machine.enter(OperationState::Negotiating);
        machine.enter(OperationState::Authorizing);
        self.authorize(self.target_set(&op), EntitySetRight::ReadSingle)?;
        let target = self.resolve_target(&op, ctx.changeset).await?;
        self.require_stream(&target)?;
        let entity = target.media_entity();

        machine.enter(OperationState::ProviderInvoking);
        let mut provider = LazyProvider::new(self.streams.as_ref());
        let p = provider.get();
        let raw = p
            .get_stream_content_type(&entity, ctx)
            .await
            .map_err(provider_failure(ProviderCall::GetStreamContentType))?;
        let content_type = resolve_provider_content_type(ProviderCall::GetStreamContentType, raw.as_deref())?;
        if op.accept.negotiate(&content_type).is_none() {
            return Err(MediaError::unsupported_media_type(format!(
                "The media resource of '{}' has content type '{}', which none of the media types in the Accept header allows.",
                target.entity_ref().path(),
                content_type
            )));
        }
        let stream = p
            .get_read_stream(&entity, &op.accept.preferred(), ctx)
            .await
            .map_err(provider_failure(ProviderCall::GetReadStream))?;
        let raw = p
            .get_stream_etag(&entity, ctx)
            .await
            .map_err(provider_failure(ProviderCall::GetStreamETag))?;
        let etag = parse_provider_etag(ProviderCall::GetStreamETag, raw.as_deref())?;

        if let Some(condition) = &op.if_match {
            if !condition.matches(&etag) {
                return Ok(Self::precondition_failed(
                    "The entity tag in the If-Match HTTP header does not match the current value of the media resource.",
                ));
            }
        }
        if let Some(condition) = &op.if_none_match {
            if condition.matches(&etag) {
                return MediaResponse::new(304).with_etag(&etag, ProviderCall::GetStreamETag.method_path());
            }
        }
        let response = MediaResponse::new(200)
            .try_header(
                CONTENT_TYPE,
                &content_type.to_string(),
                ProviderCall::GetStreamContentType.method_path(),
            )?
            .with_etag(&etag, ProviderCall::GetStreamETag.method_path())?;

        let buffer = match p.stream_buffer_size() {
            n if n > 0 => n as usize,
            _ => self.config.buffer_size,
        };
        provider.release();
        Ok(response.with_body(ResponseBody::Stream(rechunk(stream, buffer))))
    }

    async fn get_entry(
        &self,
        op: MediaOperation,
        ctx: &StreamContext,
        machine: &mut StateMachine,
    ) -> MediaResult<MediaResponse> {
        machine.enter(OperationState::Negotiating);
        negotiate_entry(&op.accept)?;
        machine.enter(OperationState::Authorizing);
        self.authorize(self.target_set(&op), EntitySetRight::ReadSingle)?;
        let target = self.resolve_target(&op, ctx.changeset).await?;
        if !target.ty.has_concurrency_tokens() && (op.if_match.is_some() || op.if_none_match.is_some()) {
            // reject before any hook runs
            self.check_entry_preconditions(&op, &target, &EntityTag::Absent)?;
        }

        machine.enter(OperationState::ProviderInvoking);
        let expand = ExpandTree::from_paths(&op.query.expand);
        let mut provider = LazyProvider::new(self.streams.as_ref());
        let entry = self
            .render_entry(
                &mut provider,
                ctx,
                &target.set,
                &target.record,
                op.query.select.as_deref(),
                &expand,
            )
            .await?;
        provider.release();

        let etag = entry_etag(target.ty, &target.record);
        if let Some(terminal) = self.check_entry_preconditions(&op, &target, &etag)? {
            return Ok(terminal);
        }
        MediaResponse::json(200, entry).with_etag(&etag, &tokens_origin(target.ty))
    }

    async fn get_feed(
        &self,
        op: MediaOperation,
        ctx: &StreamContext,
        machine: &mut StateMachine,
    ) -> MediaResult<MediaResponse> {
        machine.enter(OperationState::Negotiating);
        negotiate_entry(&op.accept)?;
        if op.if_match.is_some() || op.if_none_match.is_some() {
            return Err(MediaError::bad_request(
                "If-Match and If-None-Match HTTP headers cannot be specified for a collection.",
            ));
        }
        machine.enter(OperationState::Authorizing);
        let set = self.target_set(&op).to_string();
        self.authorize(&set, EntitySetRight::ReadMultiple)?;

        let mut records = match (&op.key, &op.navigation) {
            (Some(key), Some(nav)) => {
                let parent = self.fetch(&op.set, key, ctx.changeset).await?;
                self.linked(&parent, nav, ctx.changeset).await?
            }
            _ => self
                .entities
                .list(&set, ctx.changeset)
                .await
                .map_err(MediaError::normalize)?,
        };
        if let Some(order) = &op.query.orderby {
            records.sort_by(|a, b| {
                compare_values(a.properties.get(&order.property), b.properties.get(&order.property))
            });
            if order.descending {
                records.reverse();
            }
        }
        let count = op.query.count.then_some(records.len());
        let skip = op.query.skip.unwrap_or(0).min(usize::MAX as u64) as usize;
        let top = op.query.top.map_or(usize::MAX, |t| t.min(usize::MAX as u64) as usize);

        machine.enter(OperationState::ProviderInvoking);
        let expand = ExpandTree::from_paths(&op.query.expand);
        let mut provider = LazyProvider::new(self.streams.as_ref());
        let mut entries = Vec::new();
        for record in records.iter().skip(skip).take(top) {
            entries.push(
                self.render_entry(&mut provider, ctx, &set, record, op.query.select.as_deref(), &expand)
                    .await?,
            );
        }
        provider.release();
        Ok(MediaResponse::json(200, EntryWriter::feed(entries, count)))
    }

    async fn post_media_resource(
        &self,
        op: MediaOperation,
        ctx: &StreamContext,
        machine: &mut StateMachine,
    ) -> MediaResult<MediaResponse> {
        machine.enter(OperationState::Negotiating);
        let content_type = op
            .content_type
            .clone()
            .ok_or_else(|| MediaError::bad_request("Content-Type header value missing."))?;
        if let Some(key) = &op.key {
            return Err(MediaError::general_error(format!(
                "Content-Type '{content_type}' cannot be written to the existing entity '{}({key})'; media link entries are created by posting to an entity set.",
                op.set
            )));
        }
        if !self.model.set_accepts_streams(&op.set) {
            return Err(MediaError::unsupported_media_type(format!(
                "Content-Type '{content_type}' is not supported by the entity set '{}' because it has no media link entry types.",
                op.set
            )));
        }
        negotiate_entry(&op.accept)?;
        machine.enter(OperationState::Authorizing);
        self.authorize(&op.set, EntitySetRight::WriteAppend)?;
        let changeset = ctx.changeset;

        machine.enter(OperationState::ProviderInvoking);
        let mut provider = LazyProvider::new(self.streams.as_ref());
        let resolved = provider
            .get()
            .resolve_type(&op.set, ctx)
            .await
            .map_err(provider_failure(ProviderCall::ResolveType))?;
        let type_name = resolved.filter(|n| !n.is_empty()).ok_or_else(|| {
            MediaError::general_error(format!(
                "{} must not return a null or empty string.",
                ProviderCall::ResolveType.method_path()
            ))
        })?;
        let ty = self.valid_posted_type(&op.set, &type_name)?;

        let key = match op.slug.as_deref().and_then(EntityKey::from_hint) {
            Some(key) => key,
            None => self
                .entities
                .next_key(&op.set)
                .await
                .map_err(MediaError::normalize)?,
        };
        let record = EntityRecord::new(ty.name.clone(), key.clone()).with(ty.key.clone(), key.to_json());
        self.entities
            .insert(&op.set, record.clone(), changeset)
            .await
            .map_err(MediaError::normalize)?;

        let entity = record.to_media_entity(&op.set);
        let sink = provider
            .get()
            .get_write_stream(&entity, &content_type.to_string(), op.slug.as_deref(), ctx)
            .await
            .map_err(provider_failure(ProviderCall::GetWriteStream))?;
        let written = copy_body(op.body, sink, self.config.buffer_size).await?;
        provider.release();
        tracing::debug!(entity = %entity.resource_path(), written, "media resource created");

        machine.enter(OperationState::Committing);
        // fresh instance for the response entry
        let mut refresh = LazyProvider::new(self.streams.as_ref());
        let entry = self
            .render_entry(&mut refresh, ctx, &op.set, &record, None, &ExpandTree::default())
            .await?;
        refresh.release();

        let created = EntityRef::new(op.set.clone(), key);
        let etag = entry_etag(ty, &record);
        Ok(MediaResponse::json(201, entry)
            .with_location(&self.config.absolute(&created.path()))?
            .with_etag(&etag, &tokens_origin(ty))?
            .with_created(created))
    }

    fn valid_posted_type(&self, set: &str, type_name: &str) -> MediaResult<&ResolvedType> {
        let method = ProviderCall::ResolveType.method_path();
        let ty = self.model.entity_type(type_name).ok_or_else(|| {
            MediaError::general_error(format!(
                "{method} returned '{type_name}', which is not a type declared in the model."
            ))
        })?;
        let in_set = self
            .model
            .set_type(set)
            .is_some_and(|base| ty.is_or_derives_from(&base.name));
        if !in_set {
            return Err(MediaError::general_error(format!(
                "{method} returned '{type_name}', which is not a type of the entity set '{set}'."
            )));
        }
        if !ty.is_stream {
            return Err(MediaError::general_error(format!(
                "{method} returned '{type_name}', which is not a media link entry type."
            )));
        }
        Ok(ty)
    }

    async fn put_media_resource(
        &self,
        op: MediaOperation,
        ctx: &StreamContext,
        machine: &mut StateMachine,
    ) -> MediaResult<MediaResponse> {
        machine.enter(OperationState::Negotiating);
        let content_type = op
            .content_type
            .clone()
            .ok_or_else(|| MediaError::bad_request("Content-Type header value missing."))?;
        machine.enter(OperationState::Authorizing);
        self.authorize(self.target_set(&op), EntitySetRight::WriteReplace)?;
        let target = self.resolve_target(&op, ctx.changeset).await?;
        self.require_stream(&target)?;
        let entity = target.media_entity();

        machine.enter(OperationState::ProviderInvoking);
        let mut provider = LazyProvider::new(self.streams.as_ref());
        let p = provider.get();
        if let Some(condition) = &op.if_match {
            let raw = p
                .get_stream_etag(&entity, ctx)
                .await
                .map_err(provider_failure(ProviderCall::GetStreamETag))?;
            let current = parse_provider_etag(ProviderCall::GetStreamETag, raw.as_deref())?;
            if !condition.matches(&current) {
                return Ok(Self::precondition_failed(
                    "The entity tag in the If-Match HTTP header does not match the current value of the media resource.",
                ));
            }
        }
        let sink = p
            .get_write_stream(&entity, &content_type.to_string(), op.slug.as_deref(), ctx)
            .await
            .map_err(provider_failure(ProviderCall::GetWriteStream))?;
        let chunk = match p.stream_buffer_size() {
            n if n > 0 => n as usize,
            _ => self.config.buffer_size,
        };
        let written = copy_body(op.body, sink, chunk).await?;
        let raw = p
            .get_stream_etag(&entity, ctx)
            .await
            .map_err(provider_failure(ProviderCall::GetStreamETag))?;
        let etag = parse_provider_etag(ProviderCall::GetStreamETag, raw.as_deref())?;
        provider.release();
        tracing::debug!(entity = %entity.resource_path(), written, "media resource replaced");

        machine.enter(OperationState::Committing);
        MediaResponse::no_content().with_etag(&etag, ProviderCall::GetStreamETag.method_path())
    }

    async fn update_entry(
        &self,
        op: MediaOperation,
        ctx: &StreamContext,
        machine: &mut StateMachine,
    ) -> MediaResult<MediaResponse> {
        machine.enter(OperationState::Negotiating);
        match &op.content_type {
            Some(ct) if ct.is_entry_format() => {}
            Some(ct) => {
                return Err(MediaError::unsupported_media_type(format!(
                    "Content-Type '{ct}' cannot be used to update an entry; '{ENTRY_FORMAT}' is required."
                )))
            }
            None => return Err(MediaError::bad_request("Content-Type header value missing.")),
        }
        machine.enter(OperationState::Authorizing);
        let right = if op.kind == OperationKind::PatchMle {
            EntitySetRight::WriteMerge
        } else {
            EntitySetRight::WriteReplace
        };
        self.authorize(self.target_set(&op), right)?;
        let target = self.resolve_target(&op, ctx.changeset).await?;
        let current = entry_etag(target.ty, &target.record);
        if let Some(terminal) = self.check_entry_preconditions(&op, &target, &current)? {
            return Ok(terminal);
        }

        let body = parse_object(&op.body.collect(self.config.max_entry_bytes).await?)?;
        let mut record = target.record.clone();
        if op.kind == OperationKind::PutMle {
            record.properties.clear();
        }
        for (name, value) in body {
            if name == "__metadata" || target.ty.nav(&name).is_some() {
                continue;
            }
            record.properties.insert(name, value);
        }
        record
            .properties
            .insert(target.ty.key.clone(), record.key.to_json());

        machine.enter(OperationState::Committing);
        self.entities
            .replace(&target.set, record.clone(), ctx.changeset)
            .await
            .map_err(MediaError::normalize)?;
        MediaResponse::no_content().with_etag(&entry_etag(target.ty, &record), &tokens_origin(target.ty))
    }

    async fn delete_entry(
        &self,
        op: MediaOperation,
        ctx: &StreamContext,
        machine: &mut StateMachine,
    ) -> MediaResult<MediaResponse> {
        machine.enter(OperationState::Negotiating);
        machine.enter(OperationState::Authorizing);
        self.authorize(self.target_set(&op), EntitySetRight::WriteDelete)?;
        let target = self.resolve_target(&op, ctx.changeset).await?;
        let current = entry_etag(target.ty, &target.record);
        if let Some(terminal) = self.check_entry_preconditions(&op, &target, &current)? {
            return Ok(terminal);
        }

        if target.ty.is_stream {
            machine.enter(OperationState::ProviderInvoking);
            let mut provider = LazyProvider::new(self.streams.as_ref());
            provider
                .get()
                .delete_stream(&target.media_entity(), ctx)
                .await
                .map_err(provider_failure(ProviderCall::DeleteStream))?;
            provider.release();
        }

        machine.enter(OperationState::Committing);
        self.entities
            .delete(&target.set, &target.record.key, ctx.changeset)
            .await
            .map_err(MediaError::normalize)?;
        Ok(MediaResponse::no_content())
    }

    async fn post_entry(
        &self,
        op: MediaOperation,
        ctx: &StreamContext,
        ids: &ContentIds,
        machine: &mut StateMachine,
    ) -> MediaResult<MediaResponse> {
        machine.enter(OperationState::Negotiating);
        let base = self
            .model
            .set_type(&op.set)
            .ok_or_else(|| MediaError::not_found(format!("Resource not found for the segment '{}'.", op.set)))?;
        if base.is_stream {
            return Err(MediaError::bad_request(format!(
                "Entries of the entity set '{}' are media link entries; create them by posting the media resource.",
                op.set
            )));
        }
        negotiate_entry(&op.accept)?;
        machine.enter(OperationState::Authorizing);
        self.authorize(&op.set, EntitySetRight::WriteAppend)?;

        let mut body = parse_object(&op.body.collect(self.config.max_entry_bytes).await?)?;
        let type_name = body
            .get("__metadata")
            .and_then(|m| m.get("type"))
            .and_then(Value::as_str)
            .unwrap_or(&base.name)
            .to_string();
        let ty = self
            .model
            .entity_type(&type_name)
            .filter(|t| t.is_or_derives_from(&base.name))
            .ok_or_else(|| {
                MediaError::bad_request(format!(
                    "The type '{type_name}' is not a type of the entity set '{}'.",
                    op.set
                ))
            })?;
        if ty.is_stream {
            return Err(MediaError::bad_request(format!(
                "'{type_name}' is a media link entry type; create it by posting the media resource."
            )));
        }

        let key = match body.get(&ty.key) {
            Some(value) => EntityKey::from_json(value).ok_or_else(|| {
                MediaError::bad_request(format!("The value of the key property '{}' is not a valid key.", ty.key))
            })?,
            None => self
                .entities
                .next_key(&op.set)
                .await
                .map_err(MediaError::normalize)?,
        };
        let mut record = EntityRecord::new(ty.name.clone(), key.clone());
        body.remove("__metadata");
        for nav in &ty.navigation {
            if let Some(bound) = body.remove(&nav.name) {
                let refs: Vec<&Value> = match &bound {
                    Value::Array(items) => items.iter().collect(),
                    other => vec![other],
                };
                for link in refs {
                    let target = self.resolve_link_body(link, nav, ids)?;
                    record = record.with_link(nav.name.clone(), target.key);
                }
            }
        }
        record.properties = body;
        record.properties.insert(ty.key.clone(), key.to_json());

        machine.enter(OperationState::Committing);
        self.entities
            .insert(&op.set, record.clone(), ctx.changeset)
            .await
            .map_err(MediaError::normalize)?;

        let mut provider = LazyProvider::new(self.streams.as_ref());
        let entry = self
            .render_entry(&mut provider, ctx, &op.set, &record, None, &ExpandTree::default())
            .await?;
        provider.release();
        let created = EntityRef::new(op.set.clone(), key);
        Ok(MediaResponse::json(201, entry)
            .with_location(&self.config.absolute(&created.path()))?
            .with_etag(&entry_etag(ty, &record), &tokens_origin(ty))?
            .with_created(created))
    }

    /// Resolve `{"uri": ..}` or `{"__metadata": {"uri": ..}}` to an entity of
    /// the navigation target set.
    fn resolve_link_body(&self, value: &Value, nav: &NavigationProperty, ids: &ContentIds) -> MediaResult<EntityRef> {
        let uri = value
            .get("uri")
            .or_else(|| value.get("__metadata").and_then(|m| m.get("uri")))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MediaError::bad_request(format!("The link for '{}' must carry a 'uri'.", nav.name))
            })?;
        let path = ResourcePath::parse(self.relative_path(uri))?;
        let target = match (&path.root, path.key) {
            (PathRoot::EntitySet(set), Some(key)) if path.navigation.is_none() && path.target == PathTarget::Resource => {
                EntityRef::new(set.clone(), key)
            }
            (PathRoot::ContentId(id), None) if path.navigation.is_none() && path.target == PathTarget::Resource => ids
                .get(id)
                .cloned()
                .ok_or_else(|| MediaError::not_found(format!("Content-ID reference '${id}' was not found in this changeset.")))?,
            _ => {
                return Err(MediaError::bad_request(format!(
                    "The link '{uri}' does not address a single entity."
                )))
            }
        };
        if target.set != nav.target_set {
            return Err(MediaError::bad_request(format!(
                "The link '{uri}' does not address an entity of the set '{}'.",
                nav.target_set
            )));
        }
        Ok(target)
    }

    async fn link_operation(
        &self,
        op: MediaOperation,
        ctx: &StreamContext,
        ids: &ContentIds,
        machine: &mut StateMachine,
    ) -> MediaResult<MediaResponse> {
        let writer = EntryWriter::new(&self.config);
        if op.method == Method::GET {
            machine.enter(OperationState::Negotiating);
            negotiate_entry(&op.accept)?;
            machine.enter(OperationState::Authorizing);
            self.authorize(self.target_set(&op), EntitySetRight::ReadSingle)?;
            let body = match &op.navigation {
                Some(nav) if nav.many => {
                    let key = op
                        .key
                        .as_ref()
                        .ok_or_else(|| MediaError::bad_request("The request does not address a single entity."))?;
                    let parent = self.fetch(&op.set, key, ctx.changeset).await?;
                    let refs: Vec<Value> = self
                        .linked(&parent, nav, ctx.changeset)
                        .await?
                        .iter()
                        .map(|r| writer.reference(&EntryWriter::entity_path(&nav.target_set, r)))
                        .collect();
                    EntryWriter::feed(refs, None)
                }
                _ => {
                    let target = self.resolve_target(&op, ctx.changeset).await?;
                    writer.reference(&target.entity_ref().path())
                }
            };
            return Ok(MediaResponse::json(200, body));
        }

        machine.enter(OperationState::Negotiating);
        let nav = op.navigation.clone().ok_or_else(|| {
            MediaError::bad_request("Links can only be changed through a navigation property, e.g. 'Set(1)/Nav/$ref'.")
        })?;
        machine.enter(OperationState::Authorizing);
        self.authorize(&op.set, EntitySetRight::WriteMerge)?;
        let key = op
            .key
            .clone()
            .ok_or_else(|| MediaError::bad_request("The request does not address a single entity."))?;
        let mut parent = self.fetch(&op.set, &key, ctx.changeset).await?;

        match (op.method.as_str(), nav.many) {
            ("DELETE", false) => {
                parent.links.remove(&nav.name);
            }
            ("DELETE", true) => {
                return Err(MediaError::bad_request(format!(
                    "Removing a link from the collection '{}' requires addressing the linked entity.",
                    nav.name
                )))
            }
            ("PUT", false) | ("POST", true) => {
                let body = parse_object(&op.body.collect(self.config.max_entry_bytes).await?)?;
                let target = self.resolve_link_body(&Value::Object(body), &nav, ids)?;
                self.fetch(&target.set, &target.key, ctx.changeset).await?;
                let links = parent.links.entry(nav.name.clone()).or_default();
                if nav.many {
                    if !links.contains(&target.key) {
                        links.push(target.key);
                    }
                } else {
                    *links = vec![target.key];
                }
            }
            (method, _) => {
                return Err(MediaError::method_not_allowed(format!(
                    "{method} is not supported on the link '{}'.",
                    nav.name
                )))
            }
        }

        machine.enter(OperationState::Committing);
        self.entities
            .replace(&op.set, parent, ctx.changeset)
            .await
            .map_err(MediaError::normalize)?;
        Ok(MediaResponse::no_content())
    }
}
