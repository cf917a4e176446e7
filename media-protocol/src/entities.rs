//! Structured entity storage, the collaborator behind MLE operations.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use media_blob::{EntityKey, MediaEntity};
use media_core::{ChangesetId, ChangesetParticipant, MediaError, StagedMap};
use parking_lot::Mutex;
use serde_json::{Map, Value};

/// Structured half of an entity plus its navigation links.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub type_name: String,
    pub key: EntityKey,
    pub properties: Map<String, Value>,
    /// Navigation property name to target keys.
    pub links: BTreeMap<String, Vec<EntityKey>>,
}

impl EntityRecord {
    pub fn new(type_name: impl Into<String>, key: EntityKey) -> Self {
        Self {
            type_name: type_name.into(),
            key,
            properties: Map::new(),
            links: BTreeMap::new(),
        }
    }

    pub fn with(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(property.into(), value.into());
        self
    }

    pub fn with_link(mut self, nav: impl Into<String>, target: EntityKey) -> Self {
        self.links.entry(nav.into()).or_default().push(target);
        self
    }

    pub fn to_media_entity(&self, entity_set: &str) -> MediaEntity {
        MediaEntity::new(entity_set, self.type_name.clone(), self.key.clone())
            .with_properties(self.properties.clone())
    }
}

/// Entity persistence used by the engine. Writes made with a changeset stay
/// invisible to other readers until that changeset commits.
///
/// Failures are `anyhow` errors; a wrapped `MediaError` keeps its status.
#[async_trait]
pub trait EntityStore: ChangesetParticipant {
    async fn get(&self, set: &str, key: &EntityKey, changeset: Option<ChangesetId>) -> Result<Option<EntityRecord>>;

    /// Every visible entity of the set, in key order.
    async fn list(&self, set: &str, changeset: Option<ChangesetId>) -> Result<Vec<EntityRecord>>;

    /// Fails with a conflict when the key is taken.
    async fn insert(&self, set: &str, record: EntityRecord, changeset: Option<ChangesetId>) -> Result<()>;

    /// Fails with not found when the key is missing.
    async fn replace(&self, set: &str, record: EntityRecord, changeset: Option<ChangesetId>) -> Result<()>;

    async fn delete(&self, set: &str, key: &EntityKey, changeset: Option<ChangesetId>) -> Result<()>;

    /// A key nobody has used yet in `set`.
    async fn next_key(&self, set: &str) -> Result<EntityKey>;
}

type RecordKey = (String, EntityKey);

struct MemoryEntityInner {
    records: StagedMap<RecordKey, EntityRecord>,
    sequences: Mutex<HashMap<String, Arc<AtomicI64>>>,
}

/// In-memory [`EntityStore`].
#[derive(Clone)]
pub struct MemoryEntityStore {
    inner: Arc<MemoryEntityInner>,
}

impl Default for MemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryEntityInner {
                records: StagedMap::new(),
                sequences: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn sequence(&self, set: &str) -> Arc<AtomicI64> {
        self.inner
            .sequences
            .lock()
            .entry(set.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }

    /// Insert a committed record directly (fixtures).
    pub fn seed(&self, set: &str, record: EntityRecord) {
        if let EntityKey::Int(id) = record.key {
            self.sequence(set).fetch_max(id, Ordering::SeqCst);
        }
        self.inner
            .records
            .put((set.to_string(), record.key.clone()), record, None);
    }

    /// Whether a committed entity exists.
    pub fn contains(&self, set: &str, key: &EntityKey) -> bool {
        self.inner.records.contains(&(set.to_string(), key.clone()), None)
    }

    /// Committed keys of a set.
    pub fn keys(&self, set: &str) -> Vec<EntityKey> {
        self.inner
            .records
            .values(None)
            .into_iter()
            .filter(|((s, _), _)| s == set)
            .map(|((_, k), _)| k)
            .collect()
    }
}

#[async_trait]
impl ChangesetParticipant for MemoryEntityStore {
    fn participant_name(&self) -> &'static str {
        "memory-entities"
    }

    async fn commit(&self, changeset: ChangesetId) -> Result<()> {
        let applied = self.inner.records.commit(changeset);
        tracing::debug!(%changeset, applied, "committed staged entities");
        Ok(())
    }

    async fn rollback(&self, changeset: ChangesetId) {
        let dropped = self.inner.records.rollback(changeset);
        tracing::debug!(%changeset, dropped, "rolled back staged entities");
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get(&self, set: &str, key: &EntityKey, changeset: Option<ChangesetId>) -> Result<Option<EntityRecord>> {
        Ok(self.inner.records.get(&(set.to_string(), key.clone()), changeset))
    }

    async fn list(&self, set: &str, changeset: Option<ChangesetId>) -> Result<Vec<EntityRecord>> {
        Ok(self
            .inner
            .records
            .values(changeset)
            .into_iter()
            .filter(|((s, _), _)| s == set)
            .map(|(_, record)| record)
            .collect())
    }

    async fn insert(&self, set: &str, record: EntityRecord, changeset: Option<ChangesetId>) -> Result<()> {
        let id = (set.to_string(), record.key.clone());
        if self.inner.records.contains(&id, changeset) {
            return Err(MediaError::conflict(format!(
                "An entity with key {} already exists in '{set}'.",
                record.key
            ))
            .into_anyhow());
        }
        if let EntityKey::Int(n) = record.key {
            self.sequence(set).fetch_max(n, Ordering::SeqCst);
        }
        self.inner.records.put(id, record, changeset);
        Ok(())
    }

    async fn replace(&self, set: &str, record: EntityRecord, changeset: Option<ChangesetId>) -> Result<()> {
        let id = (set.to_string(), record.key.clone());
        if !self.inner.records.contains(&id, changeset) {
            return Err(MediaError::not_found(format!("No entity with key {} in '{set}'.", record.key)).into_anyhow());
        }
        self.inner.records.put(id, record, changeset);
        Ok(())
    }

    async fn delete(&self, set: &str, key: &EntityKey, changeset: Option<ChangesetId>) -> Result<()> {
        let id = (set.to_string(), key.clone());
        if !self.inner.records.contains(&id, changeset) {
            return Err(MediaError::not_found(format!("No entity with key {key} in '{set}'.")).into_anyhow());
        }
        self.inner.records.remove(id, changeset);
        Ok(())
    }

    async fn next_key(&self, set: &str) -> Result<EntityKey> {
        Ok(EntityKey::Int(self.sequence(set).fetch_add(1, Ordering::SeqCst) + 1))
    }
}
