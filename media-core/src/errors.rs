//! # Errors
//!
//! Structured protocol errors for the media resource engine.
//! Core goals:
//! - every failure maps to exactly one HTTP status code
//! - can be carried through anyhow::Error (for collaborator traits)
//! - transport-agnostic (the host crate decides how to serialize)
//!
//! Conditional-request outcomes (304 Not Modified, 412 Precondition Failed) are
//! not errors: the engine produces them as ordinary terminal responses. The
//! `PreconditionFailed` kind exists so the status and payload can be rendered the
//! same way as every other failure.

use std::fmt;

use anyhow::Error as AnyError;

/// A convenience result type for the protocol engine.
pub type MediaResult<T> = std::result::Result<T, MediaError>;

/// Error class names + status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,           // 400
    Forbidden,            // 403
    NotFound,             // 404
    MethodNotAllowed,     // 405
    Conflict,             // 409
    PreconditionFailed,   // 412
    UnsupportedMediaType, // 415
    GeneralError,         // 500
    NotImplemented,       // 501
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::MethodNotAllowed => 405,
            ErrorKind::Conflict => 409,
            ErrorKind::PreconditionFailed => 412,
            ErrorKind::UnsupportedMediaType => 415,
            ErrorKind::GeneralError => 500,
            ErrorKind::NotImplemented => 501,
        }
    }

    /// Map a raw status code back to a kind. Unknown codes become `GeneralError`.
    pub fn from_status(code: u16) -> Self {
        match code {
            400 => ErrorKind::BadRequest,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            405 => ErrorKind::MethodNotAllowed,
            409 => ErrorKind::Conflict,
            412 => ErrorKind::PreconditionFailed,
            415 => ErrorKind::UnsupportedMediaType,
            501 => ErrorKind::NotImplemented,
            _ => ErrorKind::GeneralError,
        }
    }

    /// Error `name` (e.g. "NotFound")
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::MethodNotAllowed => "MethodNotAllowed",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::PreconditionFailed => "PreconditionFailed",
            ErrorKind::UnsupportedMediaType => "UnsupportedMediaType",
            ErrorKind::GeneralError => "GeneralError",
            ErrorKind::NotImplemented => "NotImplemented",
        }
    }

    /// Error `className` (kebab-cased)
    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad-request",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not-found",
            ErrorKind::MethodNotAllowed => "method-not-allowed",
            ErrorKind::Conflict => "conflict",
            ErrorKind::PreconditionFailed => "precondition-failed",
            ErrorKind::UnsupportedMediaType => "unsupported-media-type",
            ErrorKind::GeneralError => "general-error",
            ErrorKind::NotImplemented => "not-implemented",
        }
    }
}

/// A structured protocol error that can live inside `anyhow::Error`.
///
/// Fields:
/// - kind (status code + names)
/// - message (asserted verbatim by callers, keep it stable)
/// - data (optional structured detail)
/// - source (never sent to clients)
#[derive(Debug)]
pub struct MediaError {
    pub kind: ErrorKind,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub source: Option<AnyError>,
}

impl MediaError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
            source: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_source(mut self, source: AnyError) -> Self {
        self.source = Some(source);
        self
    }

    pub fn code(&self) -> u16 {
        self.kind.status_code()
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn class_name(&self) -> &'static str {
        self.kind.class_name()
    }

    /// Convert into `anyhow::Error` so it flows through collaborator traits.
    pub fn into_anyhow(self) -> AnyError {
        AnyError::new(self)
    }

    /// Downcast an `anyhow::Error` to a `MediaError` if possible.
    pub fn from_anyhow(err: &AnyError) -> Option<&MediaError> {
        err.downcast_ref::<MediaError>()
    }

    /// Turn any error into a MediaError:
    /// - if it's already a MediaError, keep it (lossless)
    /// - otherwise wrap as GeneralError
    pub fn normalize(err: AnyError) -> MediaError {
        match err.downcast::<MediaError>() {
            Ok(media) => media,
            Err(other) => {
                MediaError::new(ErrorKind::GeneralError, other.to_string()).with_source(other)
            }
        }
    }

    /// A copy suitable for returning to clients (drops the inner `source`).
    pub fn sanitize_for_client(&self) -> MediaError {
        MediaError {
            kind: self.kind,
            message: self.message.clone(),
            data: self.data.clone(),
            source: None,
        }
    }

    /// JSON error payload.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;

        let mut base = json!({
            "name": self.name(),
            "message": self.message,
            "code": self.code(),
            "className": self.class_name(),
        });

        if let Some(d) = &self.data {
            base["data"] = d.clone();
        }
        base
    }

    // ---- Constructors ----

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, msg)
    }
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, msg)
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }
    pub fn method_not_allowed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::MethodNotAllowed, msg)
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, msg)
    }
    pub fn precondition_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionFailed, msg)
    }
    pub fn unsupported_media_type(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedMediaType, msg)
    }
    pub fn general_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::GeneralError, msg)
    }
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotImplemented, msg)
    }
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name(), self.code(), self.message)
    }
}

impl std::error::Error for MediaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience helper for "bail with MediaError".
#[macro_export]
macro_rules! bail_media {
    ($ctor:ident, $msg:expr) => {
        return Err($crate::errors::MediaError::$ctor($msg))
    };
    ($ctor:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::errors::MediaError::$ctor(format!($fmt, $($arg)*)))
    };
}
