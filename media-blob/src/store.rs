use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use media_core::{ChangesetId, ChangesetParticipant};

use crate::{ByteStream, EntityKey, MediaEntity, ProviderResult, WriteStream};

/// Storage primitives behind a stream provider.
///
/// Writes are always staged under a changeset and published by the
/// [`ChangesetParticipant`] half of the store.
#[async_trait]
pub trait StreamStore: ChangesetParticipant + Send + Sync + 'static {
    /// Open a sink for new content. The content is staged when the sink is shut down.
    async fn open_write(
        &self,
        key: &StreamKey,
        content_type: &str,
        changeset: ChangesetId,
    ) -> ProviderResult<WriteStream>;

    /// Open visible content for reading.
    async fn open_read(&self, key: &StreamKey, changeset: Option<ChangesetId>) -> ProviderResult<Option<ByteStream>>;

    /// Metadata of visible content without opening it.
    async fn head(&self, key: &StreamKey, changeset: Option<ChangesetId>) -> ProviderResult<Option<StreamHead>>;

    /// Delete content. Deleting missing content is not an error.
    async fn delete(&self, key: &StreamKey, changeset: Option<ChangesetId>) -> ProviderResult<()>;
}

/// Address of one media resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub entity_set: String,
    pub key: EntityKey,
}

impl StreamKey {
    pub fn new(entity_set: impl Into<String>, key: EntityKey) -> Self {
        Self {
            entity_set: entity_set.into(),
            key,
        }
    }

    pub fn of(entity: &MediaEntity) -> Self {
        Self::new(entity.entity_set.clone(), entity.key.clone())
    }

    /// Filesystem-safe name: `i42` for integer keys, `s` + hex for string keys.
    pub fn file_stem(&self) -> String {
        match &self.key {
            EntityKey::Int(v) => format!("i{v}"),
            EntityKey::Str(s) => {
                let hex: String = s.bytes().map(|b| format!("{b:02x}")).collect();
                format!("s{hex}")
            }
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.entity_set, self.key)
    }
}

/// Metadata about stored content
#[derive(Debug, Clone)]
pub struct StreamHead {
    pub size_bytes: u64,
    pub content_type: String,
    /// Raw entity tag, already quoted.
    pub etag: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stems_are_path_safe() {
        assert_eq!(StreamKey::new("Photos", EntityKey::Int(-3)).file_stem(), "i-3");
        assert_eq!(
            StreamKey::new("Photos", EntityKey::Str("a/b".into())).file_stem(),
            "s612f62"
        );
    }
}
