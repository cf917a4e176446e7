use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, ETAG, LOCATION};
use http::HeaderMap;
use media_blob::ByteStream;
use media_core::{MediaError, MediaResult};
use serde_json::Value;

use crate::classifier::EntityRef;
use crate::etag::EntityTag;

/// States a media operation moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Classified,
    Negotiating,
    Authorizing,
    ProviderInvoking,
    Committing,
    Terminal(u16),
}

pub enum ResponseBody {
    Empty,
    Json(Value),
    Stream(ByteStream),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Json(v) => write!(f, "Json({v})"),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Status, headers and body of one answered operation.
#[derive(Debug)]
pub struct MediaResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    pub(crate) created: Option<EntityRef>,
    pub(crate) states: Vec<OperationState>,
}

impl MediaResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
            created: None,
            states: Vec::new(),
        }
    }

    pub fn no_content() -> Self {
        Self::new(204)
    }

    pub fn json(status: u16, body: Value) -> Self {
        Self::new(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(ResponseBody::Json(body))
    }

    /// Error payload, with the client-safe fields only.
    pub fn from_error(err: &MediaError) -> Self {
        Self::json(err.code(), err.sanitize_for_client().to_json())
    }

    pub fn with_body(mut self, body: ResponseBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set a header from text produced by `origin`. UTF-8 goes out as raw
    /// octets; text HTTP cannot carry at all fails the operation.
    pub fn try_header(self, name: HeaderName, value: &str, origin: &str) -> MediaResult<Self> {
        match HeaderValue::from_bytes(value.as_bytes()) {
            Ok(encoded) => Ok(self.with_header(name, encoded)),
            Err(_) => Err(MediaError::general_error(format!(
                "The value '{}' produced by {origin} cannot be sent in the {name} HTTP header.",
                value.escape_debug()
            ))),
        }
    }

    /// Absent tags leave the header out entirely.
    pub fn with_etag(self, tag: &EntityTag, origin: &str) -> MediaResult<Self> {
        match tag.header_value() {
            Some(value) => self.try_header(ETAG, &value, origin),
            None => Ok(self),
        }
    }

    pub fn with_location(self, uri: &str) -> MediaResult<Self> {
        self.try_header(LOCATION, uri, "the key of the created entity")
    }

    pub(crate) fn with_created(mut self, created: EntityRef) -> Self {
        self.created = Some(created);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| std::str::from_utf8(v.as_bytes()).ok())
    }

    pub fn etag(&self) -> Option<&str> {
        self.header("etag")
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Json(v) => Some(v),
            _ => None,
        }
    }

    /// The states the operation went through, ending with `Terminal`.
    pub fn states(&self) -> &[OperationState] {
        &self.states
    }

    /// Entity created by this operation, if any.
    pub fn created(&self) -> Option<&EntityRef> {
        self.created.as_ref()
    }

    /// Buffer the whole body.
    pub async fn into_bytes(self) -> io::Result<Bytes> {
        match self.body {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Json(v) => Ok(Bytes::from(v.to_string())),
            ResponseBody::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}
