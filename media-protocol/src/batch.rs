//! Batches and changesets.
//!
//! A batch is one exchange: request hooks fire once for the whole batch.
//! Each changeset is one atomic unit: changeset hooks fire once per changeset
//! and a failing operation rolls back everything staged before it.
//!
//! Over HTTP a batch is a JSON document posted to `$batch`:
//!
//! ```json
//! { "requests": [
//!     { "id": "1", "atomicityGroup": "g1", "method": "POST", "url": "Photos",
//!       "headers": { "content-type": "image/png" }, "body": "..." },
//!     { "id": "2", "atomicityGroup": "g1", "method": "PUT", "url": "$1/$value", "body": "..." },
//!     { "id": "3", "method": "GET", "url": "Photos" }
//! ] }
//! ```
//!
//! Consecutive requests sharing an `atomicityGroup` form one changeset.

use std::collections::BTreeMap;

use http::header::CONTENT_TYPE;
use http::Method;
use media_core::{MediaError, MediaResult, PipelineContext, PipelineStage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classifier::ContentIds;
use crate::engine::MediaEngine;
use crate::request::MediaRequest;
use crate::response::{MediaResponse, ResponseBody};

/// One write inside a changeset.
#[derive(Debug)]
pub struct ChangesetOperation {
    /// Lets later operations address the entity this one creates as `$id`.
    pub content_id: Option<String>,
    pub request: MediaRequest,
}

impl ChangesetOperation {
    pub fn new(request: MediaRequest) -> Self {
        Self {
            content_id: None,
            request,
        }
    }

    pub fn with_content_id(mut self, id: impl Into<String>) -> Self {
        self.content_id = Some(id.into());
        self
    }
}

#[derive(Debug)]
pub enum BatchPart {
    /// A read outside any changeset.
    Query(MediaRequest),
    Changeset(Vec<ChangesetOperation>),
}

#[derive(Debug, Default)]
pub struct BatchRequest {
    pub parts: Vec<BatchPart>,
}

impl BatchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, request: MediaRequest) -> Self {
        self.parts.push(BatchPart::Query(request));
        self
    }

    pub fn changeset(mut self, operations: Vec<ChangesetOperation>) -> Self {
        self.parts.push(BatchPart::Changeset(operations));
        self
    }
}

#[derive(Debug)]
pub enum BatchPartResponse {
    Query(MediaResponse),
    /// Every operation succeeded and the changeset committed.
    Changeset(Vec<(Option<String>, MediaResponse)>),
    /// The changeset rolled back; one response stands for all of it.
    ChangesetFailed(MediaResponse),
}

impl BatchPartResponse {
    pub fn is_success(&self) -> bool {
        match self {
            BatchPartResponse::Query(r) => r.is_success() || r.status == 304,
            BatchPartResponse::Changeset(_) => true,
            BatchPartResponse::ChangesetFailed(_) => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchResponse {
    pub parts: Vec<BatchPartResponse>,
}

impl MediaEngine {
    /// Run a batch. Request hooks fire once; changeset hooks once per changeset.
    pub async fn dispatch_batch(&self, batch: BatchRequest, request_id: &str) -> MediaResult<BatchResponse> {
        let ctx = PipelineContext::new(request_id, "POST", "/$batch").batch();
        self.hooks()
            .run(PipelineStage::ProcessingRequest, &ctx)
            .await
            .map_err(MediaError::normalize)?;
        let result = self.run_batch(&ctx, batch, request_id).await;
        let status = match &result {
            Ok(_) => 200,
            Err(err) => err.code(),
        };
        self.finish_request(&ctx, status).await;
        result
    }

    async fn run_batch(&self, ctx: &PipelineContext, batch: BatchRequest, request_id: &str) -> MediaResult<BatchResponse> {
        let changesets = batch
            .parts
            .iter()
            .filter(|p| matches!(p, BatchPart::Changeset(_)))
            .count();
        if changesets > self.config().max_batch_changesets {
            return Err(MediaError::bad_request(format!(
                "The batch holds {changesets} changesets; at most {} are allowed.",
                self.config().max_batch_changesets
            )));
        }

        let mut out = BatchResponse::default();
        for part in batch.parts {
            let response = match part {
                BatchPart::Query(request) if request.method != Method::GET => {
                    BatchPartResponse::Query(MediaResponse::from_error(&MediaError::bad_request(format!(
                        "{} operations outside a changeset are not supported; only GET is.",
                        request.method
                    ))))
                }
                BatchPart::Query(request) => {
                    BatchPartResponse::Query(self.execute(request, None, &ContentIds::new(), request_id).await)
                }
                BatchPart::Changeset(operations) => self.run_changeset(ctx, operations, request_id).await,
            };
            out.parts.push(response);
        }
        Ok(out)
    }

    async fn run_changeset(
        &self,
        ctx: &PipelineContext,
        operations: Vec<ChangesetOperation>,
        request_id: &str,
    ) -> BatchPartResponse {
        if operations.len() > self.config().max_batch_operations {
            return BatchPartResponse::ChangesetFailed(MediaResponse::from_error(&MediaError::bad_request(format!(
                "The changeset holds {} operations; at most {} are allowed.",
                operations.len(),
                self.config().max_batch_operations
            ))));
        }
        let changeset = match self.begin_changeset(ctx).await {
            Ok(cs) => cs,
            Err(err) => return BatchPartResponse::ChangesetFailed(MediaResponse::from_error(&err)),
        };

        let mut ids = ContentIds::new();
        let mut responses = Vec::with_capacity(operations.len());
        let mut failure = None;
        for operation in operations {
            if operation.request.method == Method::GET {
                failure = Some(MediaResponse::from_error(&MediaError::bad_request(
                    "GET operations cannot be specified in a changeset.",
                )));
                break;
            }
            let response = self
                .execute(operation.request, Some(changeset), &ids, request_id)
                .await;
            if !response.is_success() {
                failure = Some(response);
                break;
            }
            if let (Some(id), Some(created)) = (&operation.content_id, response.created()) {
                ids.insert(id.clone(), created.clone());
            }
            responses.push((operation.content_id, response));
        }

        let success = failure.is_none();
        if let Err(err) = self.end_changeset(ctx, changeset, success).await {
            return BatchPartResponse::ChangesetFailed(MediaResponse::from_error(&err));
        }
        match failure {
            Some(response) => {
                tracing::debug!(%changeset, status = response.status, "changeset failed");
                BatchPartResponse::ChangesetFailed(response)
            }
            None => BatchPartResponse::Changeset(responses),
        }
    }

    /// `POST $batch` with a JSON batch document. The request hooks run once
    /// around the whole exchange, including method and document errors.
    pub(crate) async fn dispatch_batch_http(&self, request: MediaRequest, request_id: &str) -> MediaResponse {
        let ctx = PipelineContext::new(request_id, request.method.as_str(), "/$batch").batch();
        if let Err(err) = self.hooks().run(PipelineStage::ProcessingRequest, &ctx).await {
            let response = MediaResponse::from_error(&MediaError::normalize(err));
            self.finish_request(&ctx, response.status).await;
            return response;
        }

        let response = match self.read_json_batch(request).await {
            Ok((batch, groups)) => match self.run_batch(&ctx, batch, request_id).await {
                Ok(response) => MediaResponse::json(200, render_json_batch(response, groups).await),
                Err(err) => MediaResponse::from_error(&err),
            },
            Err(err) => MediaResponse::from_error(&err),
        };
        tracing::info!(status = response.status, "batch request completed");
        self.finish_request(&ctx, response.status).await;
        response
    }

    async fn read_json_batch(&self, request: MediaRequest) -> MediaResult<(BatchRequest, Groups)> {
        if request.method != Method::POST {
            return Err(MediaError::method_not_allowed("Batches must be sent with POST."));
        }
        let bytes = request.body.collect(self.config().max_entry_bytes).await?;
        parse_json_batch(&bytes)
    }
}

#[derive(Debug, Deserialize)]
struct JsonBatch {
    requests: Vec<JsonBatchRequest>,
}

#[derive(Debug, Deserialize)]
struct JsonBatchRequest {
    id: Option<String>,
    #[serde(rename = "atomicityGroup")]
    atomicity_group: Option<String>,
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    body: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonBatchResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "atomicityGroup", skip_serializing_if = "Option::is_none")]
    atomicity_group: Option<String>,
    status: u16,
    headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

fn to_media_request(item: JsonBatchRequest) -> MediaResult<MediaRequest> {
    let method = Method::from_bytes(item.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| MediaError::bad_request(format!("'{}' is not a valid HTTP method.", item.method)))?;
    let target = if item.url.contains("://") || item.url.starts_with('/') {
        item.url
    } else {
        format!("/{}", item.url)
    };
    let mut request = MediaRequest::new(method, target);
    for (name, value) in &item.headers {
        request = request.header(name, value);
    }
    request = match item.body {
        None | Some(Value::Null) => request,
        // strings are raw content, anything else is a JSON payload
        Some(Value::String(text)) => request.body(text),
        Some(json) => request.body(json.to_string()),
    };
    Ok(request)
}

/// Atomicity group of each part, in order, and the id of each query part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PartLabel {
    group: Option<String>,
    id: Option<String>,
}

type Groups = Vec<PartLabel>;

fn parse_json_batch(bytes: &[u8]) -> MediaResult<(BatchRequest, Groups)> {
    let doc: JsonBatch = serde_json::from_slice(bytes)
        .map_err(|e| MediaError::bad_request(format!("The batch document is not valid: {e}")))?;
    let mut batch = BatchRequest::new();
    let mut groups: Groups = Vec::new();
    for item in doc.requests {
        let group = item.atomicity_group.clone();
        let id = item.id.clone();
        let request = to_media_request(item)?;
        match group {
            None => {
                batch.parts.push(BatchPart::Query(request));
                groups.push(PartLabel { group: None, id });
            }
            Some(name) => {
                let continues = groups
                    .last()
                    .is_some_and(|label| label.group.as_deref() == Some(name.as_str()));
                let mut operation = ChangesetOperation::new(request);
                operation.content_id = id;
                match batch.parts.last_mut() {
                    Some(BatchPart::Changeset(ops)) if continues => ops.push(operation),
                    _ => {
                        batch.parts.push(BatchPart::Changeset(vec![operation]));
                        groups.push(PartLabel { group: Some(name), id: None });
                    }
                }
            }
        }
    }
    Ok((batch, groups))
}

async fn json_response(id: Option<String>, group: Option<String>, response: MediaResponse) -> JsonBatchResponse {
    let status = response.status;
    let headers: BTreeMap<String, String> = response
        .headers
        .iter()
        .filter_map(|(name, value)| {
            std::str::from_utf8(value.as_bytes())
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();
    let is_json = response
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| std::str::from_utf8(v.as_bytes()).ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    let body = if matches!(response.body, ResponseBody::Stream(_)) {
        let bytes = match response.into_bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                return JsonBatchResponse {
                    id,
                    atomicity_group: group,
                    status: 500,
                    headers: BTreeMap::new(),
                    body: Some(MediaError::general_error(format!("Failed to read the media resource: {e}")).to_json()),
                }
            }
        };
        if is_json {
            serde_json::from_slice(&bytes).ok()
        } else {
            Some(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        }
    } else if let ResponseBody::Json(value) = response.body {
        Some(value)
    } else {
        None
    };
    JsonBatchResponse {
        id,
        atomicity_group: group,
        status,
        headers,
        body,
    }
}

async fn render_json_batch(batch: BatchResponse, groups: Groups) -> Value {
    let mut responses = Vec::new();
    for (part, label) in batch.parts.into_iter().zip(groups) {
        match part {
            BatchPartResponse::Query(response) => responses.push(json_response(label.id, None, response).await),
            BatchPartResponse::Changeset(items) => {
                for (id, response) in items {
                    responses.push(json_response(id, label.group.clone(), response).await);
                }
            }
            BatchPartResponse::ChangesetFailed(response) => {
                responses.push(json_response(None, label.group, response).await)
            }
        }
    }
    serde_json::json!({ "responses": responses })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_become_changesets() {
        let doc = serde_json::json!({
            "requests": [
                { "id": "1", "atomicityGroup": "a", "method": "post", "url": "Photos", "body": "abc",
                  "headers": { "content-type": "text/plain" } },
                { "id": "2", "atomicityGroup": "a", "method": "PUT", "url": "$1/$value", "body": "def" },
                { "method": "GET", "url": "/Photos" },
                { "atomicityGroup": "b", "method": "DELETE", "url": "Photos(1)" }
            ]
        });
        let (batch, groups) = parse_json_batch(doc.to_string().as_bytes()).unwrap();
        let names: Vec<Option<&str>> = groups.iter().map(|l| l.group.as_deref()).collect();
        assert_eq!(names, [Some("a"), None, Some("b")]);
        assert_eq!(groups[1].id, None);
        assert_eq!(batch.parts.len(), 3);
        match &batch.parts[0] {
            BatchPart::Changeset(ops) => {
                assert_eq!(ops.len(), 2);
                assert_eq!(ops[0].content_id.as_deref(), Some("1"));
                assert_eq!(ops[0].request.method, Method::POST);
                assert_eq!(ops[1].request.target, "/$1/$value");
            }
            other => panic!("expected a changeset, got {other:?}"),
        }
        assert!(matches!(&batch.parts[1], BatchPart::Query(r) if r.target == "/Photos"));
    }

    #[test]
    fn broken_documents_are_bad_requests() {
        assert_eq!(parse_json_batch(b"{").unwrap_err().code(), 400);
        let bad_method = serde_json::json!({ "requests": [{ "method": "NOT A METHOD", "url": "x" }] });
        assert_eq!(
            parse_json_batch(bad_method.to_string().as_bytes()).unwrap_err().code(),
            400
        );
    }
}
