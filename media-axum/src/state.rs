use std::sync::Arc;

use media_protocol::MediaEngine;

pub struct MediaAxumState {
    pub engine: Arc<MediaEngine>,
}

impl Clone for MediaAxumState {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl MediaAxumState {
    pub fn new(engine: MediaEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}
