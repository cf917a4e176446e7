//! Changeset identities, participants, and a staged key/value map that makes
//! writes visible to their own changeset only until commit.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use parking_lot::RwLock;

static NEXT_CHANGESET: AtomicU64 = AtomicU64::new(1);

/// Identity of one atomic unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangesetId(pub u64);

impl ChangesetId {
    /// Allocate a process-unique changeset id.
    pub fn next() -> Self {
        Self(NEXT_CHANGESET.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChangesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cs-{}", self.0)
    }
}

/// A store whose writes are staged per changeset and made visible on commit.
#[async_trait::async_trait]
pub trait ChangesetParticipant: Send + Sync {
    /// Short name used in logs.
    fn participant_name(&self) -> &'static str;

    /// Do every fallible step of publishing `changeset` without making
    /// anything visible. A failure here leaves the committed view untouched and
    /// the caller rolls the changeset back.
    async fn prepare(&self, _changeset: ChangesetId) -> Result<()> {
        Ok(())
    }

    /// Publish everything staged under `changeset`. After a successful
    /// `prepare` this should not fail; when it does, the participant must
    /// leave its committed view as it was before the call.
    async fn commit(&self, changeset: ChangesetId) -> Result<()>;

    /// Drop everything staged under `changeset`. Must not fail.
    async fn rollback(&self, changeset: ChangesetId);
}

/// Pending mutation of a single key. `None` is a staged delete.
type Overlay<K, V> = BTreeMap<K, Option<V>>;

struct StagedState<K, V> {
    committed: BTreeMap<K, V>,
    staged: BTreeMap<ChangesetId, Overlay<K, V>>,
}

/// Ordered map with per-changeset overlays.
///
/// Reads made with a changeset see that changeset's own staged writes first and
/// committed values second. Reads without a changeset only see committed values.
pub struct StagedMap<K, V> {
    state: RwLock<StagedState<K, V>>,
}

impl<K, V> Default for StagedMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> StagedMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StagedState {
                committed: BTreeMap::new(),
                staged: BTreeMap::new(),
            }),
        }
    }

    pub fn get(&self, key: &K, changeset: Option<ChangesetId>) -> Option<V> {
        let state = self.state.read();
        if let Some(overlay) = changeset.and_then(|cs| state.staged.get(&cs)) {
            if let Some(pending) = overlay.get(key) {
                return pending.clone();
            }
        }
        state.committed.get(key).cloned()
    }

    pub fn contains(&self, key: &K, changeset: Option<ChangesetId>) -> bool {
        self.get(key, changeset).is_some()
    }

    /// All visible values in key order.
    pub fn values(&self, changeset: Option<ChangesetId>) -> Vec<(K, V)> {
        let state = self.state.read();
        let mut merged: BTreeMap<K, V> = state.committed.clone();
        if let Some(overlay) = changeset.and_then(|cs| state.staged.get(&cs)) {
            for (key, pending) in overlay {
                match pending {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        merged.into_iter().collect()
    }

    /// Stage a write, or apply it directly when no changeset is given.
    pub fn put(&self, key: K, value: V, changeset: Option<ChangesetId>) {
        let mut state = self.state.write();
        match changeset {
            Some(cs) => {
                state.staged.entry(cs).or_default().insert(key, Some(value));
            }
            None => {
                state.committed.insert(key, value);
            }
        }
    }

    /// Stage a delete, or apply it directly when no changeset is given.
    pub fn remove(&self, key: K, changeset: Option<ChangesetId>) {
        let mut state = self.state.write();
        match changeset {
            Some(cs) => {
                state.staged.entry(cs).or_default().insert(key, None);
            }
            None => {
                state.committed.remove(&key);
            }
        }
    }

    /// Copy of the overlay of `changeset`, leaving it in place.
    pub fn staged(&self, changeset: ChangesetId) -> Vec<(K, Option<V>)> {
        self.state
            .read()
            .staged
            .get(&changeset)
            .map(|overlay| overlay.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Apply the overlay of `changeset` to the committed view.
    pub fn commit(&self, changeset: ChangesetId) -> usize {
        let mut state = self.state.write();
        let Some(overlay) = state.staged.remove(&changeset) else {
            return 0;
        };
        let applied = overlay.len();
        for (key, pending) in overlay {
            match pending {
                Some(value) => {
                    state.committed.insert(key, value);
                }
                None => {
                    state.committed.remove(&key);
                }
            }
        }
        applied
    }

    pub fn rollback(&self, changeset: ChangesetId) -> usize {
        self.state
            .write()
            .staged
            .remove(&changeset)
            .map(|overlay| overlay.len())
            .unwrap_or(0)
    }

    pub fn pending_changesets(&self) -> usize {
        self.state.read().staged.len()
    }
}
