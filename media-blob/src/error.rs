use thiserror::Error;

/// Result type for stream provider hooks
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors a stream provider can report from its hooks
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Media resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Content type '{content_type}' is not accepted for {resource}")]
    ContentTypeRejected {
        resource: String,
        content_type: String,
    },

    /// Provider-chosen status, e.g. a 412 raised by a provider that validates
    /// preconditions itself.
    #[error("{message}")]
    Status { code: u16, message: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Storage backend error: {source}")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl ProviderError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Box::new(error),
        }
    }

    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn status<S: Into<String>>(code: u16, message: S) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    pub fn content_type_rejected<R: Into<String>, C: Into<String>>(resource: R, content_type: C) -> Self {
        Self::ContentTypeRejected {
            resource: resource.into(),
            content_type: content_type.into(),
        }
    }

    /// Status code the provider asked for, if any.
    pub fn requested_status(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            Self::NotFound { .. } => Some(404),
            _ => None,
        }
    }
}
