//! media-axum: Axum host for the media resource protocol engine.
//!
//! Every request reaches [`MediaEngine::dispatch`](media_protocol::MediaEngine::dispatch)
//! through a fallback handler. Request bodies and media responses stay streamed.

pub mod app;
pub mod logging;
pub mod rest;
pub mod state;
mod error;
pub use error::MediaAxumError;
pub use logging::init_tracing;
pub use state::MediaAxumState;

pub use app::{axum, MediaApp};
