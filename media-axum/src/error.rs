use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use media_core::MediaError;

/// Host-level failure, rendered with the same JSON shape as engine errors.
#[derive(Debug)]
pub struct MediaAxumError(pub anyhow::Error);

impl From<anyhow::Error> for MediaAxumError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl From<MediaError> for MediaAxumError {
    fn from(e: MediaError) -> Self {
        Self(e.into_anyhow())
    }
}

impl IntoResponse for MediaAxumError {
    fn into_response(self) -> Response {
        // keep the status of a MediaError even when wrapped in anyhow contexts
        let err = match self.0.chain().find_map(|e| e.downcast_ref::<MediaError>()) {
            Some(media) => media.sanitize_for_client(),
            None => MediaError::general_error(self.0.to_string()).sanitize_for_client(),
        };
        let status = StatusCode::from_u16(err.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(err.to_json())).into_response()
    }
}
