//! Entity tags.
//!
//! A raw tag is exactly one of:
//!
//! - empty: no tag at all
//! - `"opaque"`: strong
//! - `W/"opaque"`: weak
//!
//! The opaque text may hold anything except a double quote, commas included.
//! A header value is therefore never split on commas.
//!
//! Who produced a malformed tag decides the status: a client header is a bad
//! request (400), a provider answer is a server defect (500).

use std::fmt;

use media_blob::ProviderCall;
use media_core::{MediaError, MediaResult};
use serde_json::Value;
use thiserror::Error;

/// A parsed entity tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EntityTag {
    #[default]
    Absent,
    Strong(String),
    Weak(String),
}

/// The raw value does not follow the entity tag grammar.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("the entity tag '{raw}' has an invalid format")]
pub struct EtagFormatError {
    pub raw: String,
}

impl EntityTag {
    pub fn parse(raw: &str) -> Result<Self, EtagFormatError> {
        if raw.is_empty() {
            return Ok(EntityTag::Absent);
        }
        let (weak, quoted) = match raw.strip_prefix("W/") {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let opaque = quoted
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .filter(|inner| !inner.contains('"'))
            .ok_or_else(|| EtagFormatError { raw: raw.to_string() })?;
        Ok(if weak {
            EntityTag::Weak(opaque.to_string())
        } else {
            EntityTag::Strong(opaque.to_string())
        })
    }

    pub fn strong(opaque: impl Into<String>) -> Self {
        EntityTag::Strong(opaque.into())
    }

    pub fn weak(opaque: impl Into<String>) -> Self {
        EntityTag::Weak(opaque.into())
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, EntityTag::Absent)
    }

    pub fn is_weak(&self) -> bool {
        matches!(self, EntityTag::Weak(_))
    }

    pub fn opaque(&self) -> Option<&str> {
        match self {
            EntityTag::Absent => None,
            EntityTag::Strong(o) | EntityTag::Weak(o) => Some(o),
        }
    }

    /// Equal when both are absent or both carry the same opaque text,
    /// whatever their strength.
    pub fn matches(&self, other: &EntityTag) -> bool {
        self.opaque() == other.opaque()
    }

    /// Header value, or `None` when the header must be omitted.
    pub fn header_value(&self) -> Option<String> {
        match self {
            EntityTag::Absent => None,
            EntityTag::Strong(o) => Some(format!("\"{o}\"")),
            EntityTag::Weak(o) => Some(format!("W/\"{o}\"")),
        }
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header_value().as_deref().unwrap_or(""))
    }
}

/// Precondition carried by `If-Match` or `If-None-Match`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityTagCondition {
    /// `*`
    Any,
    Tag(EntityTag),
}

impl EntityTagCondition {
    /// Parse a request header. An empty value means no condition.
    pub fn parse_header(header: &str, raw: &str) -> MediaResult<Option<Self>> {
        let raw = raw.trim();
        if raw == "*" {
            return Ok(Some(EntityTagCondition::Any));
        }
        match EntityTag::parse(raw) {
            Ok(EntityTag::Absent) => Ok(None),
            Ok(tag) => Ok(Some(EntityTagCondition::Tag(tag))),
            Err(_) => Err(MediaError::bad_request(format!(
                "The value '{raw}' of the {header} HTTP header has an invalid format."
            ))),
        }
    }

    /// Whether the condition holds for an existing resource whose tag is `current`.
    pub fn matches(&self, current: &EntityTag) -> bool {
        match self {
            EntityTagCondition::Any => true,
            EntityTagCondition::Tag(tag) => !current.is_absent() && tag.matches(current),
        }
    }

    pub fn is_strong_tag(&self) -> bool {
        matches!(self, EntityTagCondition::Tag(EntityTag::Strong(_)))
    }
}

/// Parse a tag returned by a provider hook. `None` and `""` both mean absent.
pub fn parse_provider_etag(call: ProviderCall, raw: Option<&str>) -> MediaResult<EntityTag> {
    EntityTag::parse(raw.unwrap_or("")).map_err(|e| {
        MediaError::general_error(format!(
            "The value '{}' returned by {} has an invalid format.",
            e.raw,
            call.method_path()
        ))
    })
}

/// Weak tag over the values of an entity's concurrency tokens, e.g. `W/"1,'abc'"`.
///
/// Types without concurrency tokens have no tag.
pub fn concurrency_etag(values: &[Option<&Value>]) -> EntityTag {
    if values.is_empty() {
        return EntityTag::Absent;
    }
    let rendered: Vec<String> = values
        .iter()
        .map(|v| match v {
            None | Some(Value::Null) => "null".to_string(),
            Some(Value::String(s)) => format!("'{}'", s.replace('\'', "''")),
            Some(other) => other.to_string(),
        })
        .collect();
    // double quotes cannot appear inside the opaque text
    EntityTag::Weak(rendered.join(",").replace('"', "%22"))
}
