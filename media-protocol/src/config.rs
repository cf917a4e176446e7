use media_core::ConfigSnapshot;

/// Configuration for the media engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Absolute service root, always ending in `/`
    pub service_root: String,

    /// Copy buffer used when the provider answers a non-positive buffer size
    pub buffer_size: usize,

    /// Upper bound on operations in one changeset
    pub max_batch_operations: usize,

    /// Upper bound on changesets in one batch
    pub max_batch_changesets: usize,

    /// Largest structured (JSON) body the engine buffers
    pub max_entry_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_root: "http://localhost/".to_string(),
            buffer_size: 64 * 1024, // 64KB
            max_batch_operations: 1_000,
            max_batch_changesets: 100,
            max_entry_bytes: 4 * 1024 * 1024, // 4MB
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the service root. A trailing `/` is added when missing.
    pub fn with_service_root<S: Into<String>>(mut self, root: S) -> Self {
        let mut root = root.into();
        if !root.ends_with('/') {
            root.push('/');
        }
        self.service_root = root;
        self
    }

    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes.max(1);
        self
    }

    pub fn with_max_batch_operations(mut self, max: usize) -> Self {
        self.max_batch_operations = max;
        self
    }

    pub fn with_max_batch_changesets(mut self, max: usize) -> Self {
        self.max_batch_changesets = max;
        self
    }

    pub fn with_max_entry_bytes(mut self, bytes: usize) -> Self {
        self.max_entry_bytes = bytes;
        self
    }

    /// Read overrides from a config snapshot:
    /// `service.root`, `buffer.size`, `batch.max_operations`, `batch.max_changesets`.
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Self {
        let mut config = Self::default();
        if let Some(root) = snapshot.get_string("service.root") {
            config = config.with_service_root(root);
        }
        if let Some(size) = snapshot.get_usize("buffer.size") {
            config = config.with_buffer_size(size);
        }
        if let Some(max) = snapshot.get_usize("batch.max_operations") {
            config.max_batch_operations = max;
        }
        if let Some(max) = snapshot.get_usize("batch.max_changesets") {
            config.max_batch_changesets = max;
        }
        config
    }

    /// Absolute URI of a service-relative path.
    pub fn absolute(&self, relative: &str) -> String {
        format!("{}{}", self.service_root, relative.trim_start_matches('/'))
    }
}
