use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures_core::Stream;
use http::{HeaderMap, Method};
use media_core::ChangesetId;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use uuid::Uuid;

/// Stream of bytes for media resource content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Sink a provider hands out for media resource writes
pub type WriteStream = Pin<Box<dyn AsyncWrite + Send>>;

/// Identity of an entity inside its entity set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityKey {
    Int(i64),
    Str(String),
}

impl EntityKey {
    /// Parse a key literal as it appears between the parentheses of `Set(key)`.
    ///
    /// Integers are bare, strings are single-quoted with `''` as the escaped quote.
    pub fn parse_literal(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Some(inner) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                    } else {
                        return None;
                    }
                }
                out.push(c);
            }
            return Some(EntityKey::Str(out));
        }
        raw.parse::<i64>().ok().map(EntityKey::Int)
    }

    /// Interpret a client hint (e.g. a Slug header) as a key.
    pub fn from_hint(hint: &str) -> Option<Self> {
        let hint = hint.trim();
        if hint.is_empty() {
            return None;
        }
        Some(
            hint.parse::<i64>()
                .map(EntityKey::Int)
                .unwrap_or_else(|_| EntityKey::Str(hint.to_string())),
        )
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            EntityKey::Int(v) => serde_json::Value::from(*v),
            EntityKey::Str(s) => serde_json::Value::from(s.clone()),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(EntityKey::Int),
            serde_json::Value::String(s) => Some(EntityKey::Str(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Int(v) => write!(f, "{v}"),
            EntityKey::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

/// The entity a stream hook operates on.
#[derive(Debug, Clone, Serialize)]
pub struct MediaEntity {
    pub entity_set: String,
    pub type_name: String,
    pub key: EntityKey,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl MediaEntity {
    pub fn new(entity_set: impl Into<String>, type_name: impl Into<String>, key: EntityKey) -> Self {
        Self {
            entity_set: entity_set.into(),
            type_name: type_name.into(),
            key,
            properties: serde_json::Map::new(),
        }
    }

    pub fn with_properties(mut self, properties: serde_json::Map<String, serde_json::Value>) -> Self {
        self.properties = properties;
        self
    }

    /// Resource path relative to the service root, e.g. `Photos(1)`.
    pub fn resource_path(&self) -> String {
        format!("{}({})", self.entity_set, self.key)
    }
}

/// Operation context handed to every stream hook.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub request_id: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub service_root: String,
    /// Set for every hook that runs as part of a write.
    pub changeset: Option<ChangesetId>,
}

impl StreamContext {
    pub fn new(method: Method, service_root: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            method,
            headers: HeaderMap::new(),
            service_root: service_root.into(),
            changeset: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_changeset(mut self, changeset: Option<ChangesetId>) -> Self {
        self.changeset = changeset;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| std::str::from_utf8(v.as_bytes()).ok())
    }

    pub fn slug(&self) -> Option<&str> {
        self.header("slug")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_literals() {
        assert_eq!(EntityKey::parse_literal("42"), Some(EntityKey::Int(42)));
        assert_eq!(
            EntityKey::parse_literal("'O''Hara'"),
            Some(EntityKey::Str("O'Hara".to_string()))
        );
        assert_eq!(EntityKey::parse_literal("'bad'quote'"), None);
        assert_eq!(EntityKey::parse_literal("abc"), None);
        assert_eq!(EntityKey::Str("O'Hara".into()).to_string(), "'O''Hara'");
    }

    #[test]
    fn hints_prefer_integers() {
        assert_eq!(EntityKey::from_hint("7"), Some(EntityKey::Int(7)));
        assert_eq!(EntityKey::from_hint("cat"), Some(EntityKey::Str("cat".into())));
        assert_eq!(EntityKey::from_hint("  "), None);
    }
}
