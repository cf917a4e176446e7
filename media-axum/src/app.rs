use std::sync::Arc;

use axum::Router;
use media_protocol::MediaEngine;
use tokio::net::{TcpListener, ToSocketAddrs};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::rest;
use crate::MediaAxumState;

pub struct MediaApp {
    pub engine: Arc<MediaEngine>,
    pub router: Router<()>,
}

impl Clone for MediaApp {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            router: self.router.clone(),
        }
    }
}

impl MediaApp {
    pub fn new(engine: MediaEngine) -> Self {
        let state = MediaAxumState::new(engine);
        let engine = Arc::clone(&state.engine);
        Self {
            engine,
            router: Router::new().fallback(rest::dispatch).with_state(state),
        }
    }

    /// Mount extra routes next to the engine; unmatched paths still reach it.
    pub fn use_router(mut self, path: &str, router: Router<()>) -> Self {
        self.router = self.router.nest(path, router);
        self
    }

    /// The router with request-id and trace layers applied.
    pub fn into_router(self) -> Router<()> {
        self.router.layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
    }

    pub async fn listen<A>(self, addr: A) -> anyhow::Result<()>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, root = %self.engine.config().service_root, "media service listening");
        axum::serve(listener, self.into_router()).await?;
        Ok(())
    }
}

pub fn axum(engine: MediaEngine) -> MediaApp {
    MediaApp::new(engine)
}
