//! # Configuration
//!
//! A minimal string key/value store. Typed configuration structs (for example
//! the engine configuration) read from a [`ConfigSnapshot`] so applications can
//! layer values however they like.
//!
//! ```rust
//! use media_core::ConfigStore;
//!
//! let mut config = ConfigStore::new();
//! config.set("buffer.size", "8192");
//! assert_eq!(config.snapshot().get_usize("buffer.size"), Some(8192));
//! ```
//!
//! ## Environment overrides
//! [`ConfigStore::load_env`] maps `PREFIX__A__B=value` to the key `a.b`:
//!
//! ```bash
//! export MEDIA__BUFFER__SIZE=16384
//! ```

use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct ConfigStore {
    values: HashMap<String, String>,
}

impl ConfigStore {
    /// Create an empty config store.
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Set a configuration key to a string value.
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    /// Get a configuration value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Overlay values from environment variables starting with `prefix`.
    ///
    /// Returns how many keys were set.
    pub fn load_env(&mut self, prefix: &str) -> usize {
        self.load_vars(prefix, std::env::vars())
    }

    pub fn load_vars<I>(&mut self, prefix: &str, vars: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut loaded = 0;
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                let normalized = stripped
                    .trim_start_matches('_')
                    .to_lowercase()
                    .replace("__", ".");
                if normalized.is_empty() {
                    continue;
                }
                self.values.insert(normalized, value);
                loaded += 1;
            }
        }
        loaded
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot::new(self.values.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    map: HashMap<String, String>,
}

impl ConfigSnapshot {
    pub(crate) fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.trim().parse::<bool>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_keys_are_normalized() {
        let mut config = ConfigStore::new();
        let loaded = config.load_vars(
            "MEDIA",
            vec![
                ("MEDIA__BUFFER__SIZE".to_string(), "4096".to_string()),
                ("MEDIA__SERVICE__ROOT".to_string(), "http://host/svc".to_string()),
                ("OTHER__KEY".to_string(), "x".to_string()),
            ],
        );
        assert_eq!(loaded, 2);
        let snap = config.snapshot();
        assert_eq!(snap.get_usize("buffer.size"), Some(4096));
        assert_eq!(snap.get("service.root"), Some("http://host/svc"));
        assert!(!config.has("other.key"));
    }

    #[test]
    fn typed_getters_reject_garbage() {
        let mut config = ConfigStore::new();
        config.set("batch.max_operations", "many");
        config.set("trace", "true");
        let snap = config.snapshot();
        assert_eq!(snap.get_usize("batch.max_operations"), None);
        assert_eq!(snap.get_bool("trace"), Some(true));
    }
}
