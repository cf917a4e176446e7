use std::io;

use axum::body::Body;
use axum::extract::{OriginalUri, Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use futures::TryStreamExt;
use media_protocol::{MediaRequest, MediaResponse, ResponseBody};

use crate::{MediaAxumError, MediaAxumState};

/// Convert an axum request into the engine's request. The body stays streamed.
pub fn media_request(request: Request) -> MediaRequest {
    let (parts, body) = request.into_parts();
    // nested routers strip their prefix from `parts.uri`
    let uri = parts.extensions.get::<OriginalUri>().map_or(&parts.uri, |original| &original.0);
    let target = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());
    let stream = body.into_data_stream().map_err(io::Error::other);
    MediaRequest::new(parts.method, target)
        .with_headers(parts.headers)
        .stream(Box::pin(stream))
}

/// Convert an engine response into an axum response. Media bodies are streamed.
pub fn into_response(response: MediaResponse) -> Result<Response, MediaAxumError> {
    let status = StatusCode::from_u16(response.status)
        .map_err(|e| anyhow::anyhow!("engine answered with an invalid status {}: {e}", response.status))?;
    let body = match response.body {
        ResponseBody::Empty => Body::empty(),
        ResponseBody::Json(value) => Body::from(value.to_string()),
        ResponseBody::Stream(stream) => Body::from_stream(stream),
    };
    let mut out = Response::new(body);
    *out.status_mut() = status;
    *out.headers_mut() = response.headers;
    Ok(out)
}

/// Fallback handler: every request goes to the engine.
pub async fn dispatch(State(state): State<MediaAxumState>, request: Request) -> Result<Response, MediaAxumError> {
    let response = state.engine.dispatch(media_request(request)).await;
    into_response(response)
}
