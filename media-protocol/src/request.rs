use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use media_blob::ByteStream;
use media_core::{MediaError, MediaResult};

/// Body of an inbound request.
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    /// Streamed body, never buffered by the engine for media writes.
    Stream(ByteStream),
}

impl RequestBody {
    pub fn is_empty(&self) -> bool {
        match self {
            RequestBody::Empty => true,
            RequestBody::Bytes(b) => b.is_empty(),
            RequestBody::Stream(_) => false,
        }
    }

    pub fn into_stream(self) -> ByteStream {
        match self {
            RequestBody::Empty => Box::pin(futures_util::stream::empty()),
            RequestBody::Bytes(bytes) => Box::pin(futures_util::stream::once(async move {
                Ok::<Bytes, io::Error>(bytes)
            })),
            RequestBody::Stream(stream) => stream,
        }
    }

    /// Buffer the whole body. Only used for structured payloads.
    pub async fn collect(self, limit: usize) -> MediaResult<Bytes> {
        match self {
            RequestBody::Empty => Ok(Bytes::new()),
            RequestBody::Bytes(bytes) => {
                check_entry_size(bytes.len(), limit)?;
                Ok(bytes)
            }
            RequestBody::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| {
                        MediaError::bad_request(format!("Failed to read the request body: {e}"))
                    })?;
                    check_entry_size(buf.len() + chunk.len(), limit)?;
                    buf.extend_from_slice(&chunk);
                }
                Ok(buf.freeze())
            }
        }
    }
}

fn check_entry_size(len: usize, limit: usize) -> MediaResult<()> {
    if len > limit {
        return Err(MediaError::bad_request(format!(
            "The request body exceeds the limit of {limit} bytes for structured payloads."
        )));
    }
    Ok(())
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            RequestBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// An HTTP-shaped request as the engine sees it.
#[derive(Debug)]
pub struct MediaRequest {
    pub method: Method,
    /// Path and query, e.g. `/Photos(1)/$value?$select=Name`.
    pub target: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl MediaRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn put(target: impl Into<String>) -> Self {
        Self::new(Method::PUT, target)
    }

    pub fn patch(target: impl Into<String>) -> Self {
        Self::new(Method::PATCH, target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::DELETE, target)
    }

    /// Add a header. UTF-8 text is kept as raw octets; names or values that
    /// HTTP cannot carry at all (e.g. line breaks) are ignored.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = RequestBody::Bytes(body.into());
        self
    }

    pub fn json(self, value: &serde_json::Value) -> Self {
        self.header("content-type", "application/json")
            .body(value.to_string())
    }

    pub fn stream(mut self, stream: ByteStream) -> Self {
        self.body = RequestBody::Stream(stream);
        self
    }

    pub fn path(&self) -> &str {
        self.target.split_once('?').map_or(self.target.as_str(), |(p, _)| p)
    }

    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    /// Header text, or `None` when the header is missing or not UTF-8.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| std::str::from_utf8(v.as_bytes()).ok())
    }

    /// Header text for headers the engine interprets. A value that is not
    /// UTF-8 is a bad request, never a missing header.
    pub fn header_text(&self, name: &str) -> MediaResult<Option<&str>> {
        match self.headers.get(name) {
            None => Ok(None),
            Some(value) => std::str::from_utf8(value.as_bytes()).map(Some).map_err(|_| {
                MediaError::bad_request(format!(
                    "The value of the {name} HTTP header has an invalid format."
                ))
            }),
        }
    }
}
