//! Metadata model: entity types, entity sets and their rights.
//!
//! Whether a type is stream-bearing (declared or inherited) is resolved once in
//! [`ModelBuilder::build`] and never re-derived per request.

use std::collections::{BTreeMap, HashMap};

use media_core::{MediaError, MediaResult};

/// A single permission on an entity set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntitySetRight {
    ReadSingle,
    ReadMultiple,
    WriteAppend,
    WriteReplace,
    WriteMerge,
    WriteDelete,
}

impl EntitySetRight {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitySetRight::ReadSingle => "ReadSingle",
            EntitySetRight::ReadMultiple => "ReadMultiple",
            EntitySetRight::WriteAppend => "WriteAppend",
            EntitySetRight::WriteReplace => "WriteReplace",
            EntitySetRight::WriteMerge => "WriteMerge",
            EntitySetRight::WriteDelete => "WriteDelete",
        }
    }
}

/// Rights granted on an entity set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySetRights {
    pub allowed: Vec<EntitySetRight>,
}

impl EntitySetRights {
    pub fn all() -> Self {
        use EntitySetRight::*;
        Self {
            allowed: vec![ReadSingle, ReadMultiple, WriteAppend, WriteReplace, WriteMerge, WriteDelete],
        }
    }

    pub fn read_only() -> Self {
        use EntitySetRight::*;
        Self {
            allowed: vec![ReadSingle, ReadMultiple],
        }
    }

    pub fn none() -> Self {
        Self { allowed: Vec::new() }
    }

    pub fn from_rights(rights: Vec<EntitySetRight>) -> Self {
        Self { allowed: rights }
    }

    pub fn allows(&self, right: EntitySetRight) -> bool {
        self.allowed.contains(&right)
    }
}

impl Default for EntitySetRights {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationProperty {
    pub name: String,
    pub target_set: String,
    /// Collection-valued.
    pub many: bool,
}

impl NavigationProperty {
    pub fn one(name: impl Into<String>, target_set: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_set: target_set.into(),
            many: false,
        }
    }

    pub fn many(name: impl Into<String>, target_set: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_set: target_set.into(),
            many: true,
        }
    }
}

/// An entity type as declared.
#[derive(Debug, Clone)]
pub struct EntityType {
    pub name: String,
    pub base: Option<String>,
    /// Key property; only needed on root types.
    pub key: Option<String>,
    pub has_stream: bool,
    pub concurrency_tokens: Vec<String>,
    pub navigation: Vec<NavigationProperty>,
}

impl EntityType {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            key: Some(key.into()),
            has_stream: false,
            concurrency_tokens: Vec::new(),
            navigation: Vec::new(),
        }
    }

    pub fn derived(name: impl Into<String>, base: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: Some(base.into()),
            key: None,
            has_stream: false,
            concurrency_tokens: Vec::new(),
            navigation: Vec::new(),
        }
    }

    pub fn with_stream(mut self) -> Self {
        self.has_stream = true;
        self
    }

    pub fn concurrency_token(mut self, property: impl Into<String>) -> Self {
        self.concurrency_tokens.push(property.into());
        self
    }

    pub fn navigation(mut self, nav: NavigationProperty) -> Self {
        self.navigation.push(nav);
        self
    }
}

/// An entity type with everything inherited folded in.
#[derive(Debug, Clone)]
pub struct ResolvedType {
    pub name: String,
    pub key: String,
    pub is_stream: bool,
    /// Declared on this type rather than inherited.
    pub declares_stream: bool,
    pub concurrency_tokens: Vec<String>,
    pub navigation: Vec<NavigationProperty>,
    /// Base types, nearest first.
    pub ancestors: Vec<String>,
}

impl ResolvedType {
    pub fn has_concurrency_tokens(&self) -> bool {
        !self.concurrency_tokens.is_empty()
    }

    pub fn nav(&self, name: &str) -> Option<&NavigationProperty> {
        self.navigation.iter().find(|n| n.name == name)
    }

    pub fn is_or_derives_from(&self, type_name: &str) -> bool {
        self.name == type_name || self.ancestors.iter().any(|a| a == type_name)
    }
}

#[derive(Debug, Clone)]
pub struct EntitySet {
    pub name: String,
    pub type_name: String,
    pub rights: EntitySetRights,
}

impl EntitySet {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            rights: EntitySetRights::all(),
        }
    }

    pub fn with_rights(mut self, rights: EntitySetRights) -> Self {
        self.rights = rights;
        self
    }
}

/// Immutable, resolved metadata.
#[derive(Debug, Clone)]
pub struct MediaModel {
    types: HashMap<String, ResolvedType>,
    sets: BTreeMap<String, EntitySet>,
}

impl MediaModel {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    pub fn entity_set(&self, name: &str) -> Option<&EntitySet> {
        self.sets.get(name)
    }

    pub fn entity_type(&self, name: &str) -> Option<&ResolvedType> {
        self.types.get(name)
    }

    /// Base type of an entity set.
    pub fn set_type(&self, set: &str) -> Option<&ResolvedType> {
        self.sets.get(set).and_then(|s| self.types.get(&s.type_name))
    }

    /// The set's base type and every type derived from it.
    pub fn types_in_set(&self, set: &str) -> Vec<&ResolvedType> {
        let Some(base) = self.sets.get(set) else {
            return Vec::new();
        };
        let mut types: Vec<&ResolvedType> = self
            .types
            .values()
            .filter(|t| t.is_or_derives_from(&base.type_name))
            .collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        types
    }

    /// Whether a media resource can be posted to `set`.
    pub fn set_accepts_streams(&self, set: &str) -> bool {
        self.types_in_set(set).iter().any(|t| t.is_stream)
    }

    pub fn entity_sets(&self) -> impl Iterator<Item = &EntitySet> {
        self.sets.values()
    }
}

#[derive(Debug, Default)]
pub struct ModelBuilder {
    types: Vec<EntityType>,
    sets: Vec<EntitySet>,
}

impl ModelBuilder {
    pub fn entity_type(mut self, ty: EntityType) -> Self {
        self.types.push(ty);
        self
    }

    pub fn entity_set(mut self, set: EntitySet) -> Self {
        self.sets.push(set);
        self
    }

    pub fn build(self) -> MediaResult<MediaModel> {
        let declared: HashMap<&str, &EntityType> = self.types.iter().map(|t| (t.name.as_str(), t)).collect();
        if declared.len() != self.types.len() {
            return Err(MediaError::general_error("Entity type names must be unique."));
        }

        let mut types = HashMap::new();
        for ty in &self.types {
            // walk to the root, collecting the chain nearest first
            let mut chain: Vec<&EntityType> = vec![ty];
            let mut current = ty;
            while let Some(base) = current.base.as_deref() {
                if chain.iter().any(|t| t.name == base) {
                    return Err(MediaError::general_error(format!(
                        "Entity type '{}' has a cyclic base type chain.",
                        ty.name
                    )));
                }
                current = declared.get(base).copied().ok_or_else(|| {
                    MediaError::general_error(format!(
                        "Base type '{base}' of entity type '{}' is not declared.",
                        ty.name
                    ))
                })?;
                chain.push(current);
            }

            let key = chain.iter().find_map(|t| t.key.clone()).ok_or_else(|| {
                MediaError::general_error(format!("Entity type '{}' has no key property.", ty.name))
            })?;
            let mut concurrency_tokens = Vec::new();
            let mut navigation = Vec::new();
            for t in chain.iter().rev() {
                concurrency_tokens.extend(t.concurrency_tokens.iter().cloned());
                navigation.extend(t.navigation.iter().cloned());
            }

            types.insert(
                ty.name.clone(),
                ResolvedType {
                    name: ty.name.clone(),
                    key,
                    is_stream: chain.iter().any(|t| t.has_stream),
                    declares_stream: ty.has_stream,
                    concurrency_tokens,
                    navigation,
                    ancestors: chain[1..].iter().map(|t| t.name.clone()).collect(),
                },
            );
        }

        let mut sets = BTreeMap::new();
        for set in self.sets {
            if !types.contains_key(&set.type_name) {
                return Err(MediaError::general_error(format!(
                    "Entity set '{}' refers to undeclared type '{}'.",
                    set.name, set.type_name
                )));
            }
            sets.insert(set.name.clone(), set);
        }
        for ty in types.values() {
            for nav in &ty.navigation {
                if !sets.contains_key(&nav.target_set) {
                    return Err(MediaError::general_error(format!(
                        "Navigation property '{}.{}' targets unknown entity set '{}'.",
                        ty.name, nav.name, nav.target_set
                    )));
                }
            }
        }

        tracing::debug!(types = types.len(), sets = sets.len(), "media model built");
        Ok(MediaModel { types, sets })
    }
}
