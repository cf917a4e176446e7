//! JSON entries and feeds.
//!
//! Stream-bearing entries carry a media block in `__metadata` (`media_src`,
//! `edit_media`, `content_type`, `media_etag`). `$select` never removes it and
//! entries of other types never get one.

use serde_json::{json, Map, Value};

use crate::config::EngineConfig;
use crate::entities::EntityRecord;
use crate::etag::{concurrency_etag, EntityTag};
use crate::model::ResolvedType;
use crate::negotiation::MediaType;

/// What the GET MLE hook sequence reported about a media resource.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub etag: EntityTag,
    /// `None` means the service's own `$value` endpoint.
    pub read_uri: Option<String>,
    pub content_type: MediaType,
}

/// `$expand` paths folded into a tree, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpandTree {
    children: Vec<(String, ExpandTree)>,
}

impl ExpandTree {
    pub fn from_paths(paths: &[Vec<String>]) -> Self {
        let mut root = ExpandTree::default();
        for path in paths {
            let mut node = &mut root;
            for segment in path {
                let idx = match node.children.iter().position(|(name, _)| name == segment) {
                    Some(idx) => idx,
                    None => {
                        node.children.push((segment.clone(), ExpandTree::default()));
                        node.children.len() - 1
                    }
                };
                node = &mut node.children[idx].1;
            }
        }
        root
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &ExpandTree)> {
        self.children.iter().map(|(name, tree)| (name.as_str(), tree))
    }

    pub fn contains(&self, nav: &str) -> bool {
        self.children.iter().any(|(name, _)| name == nav)
    }
}

/// The MLE tag: weak, over the concurrency token values.
pub fn entry_etag(ty: &ResolvedType, record: &EntityRecord) -> EntityTag {
    let values: Vec<Option<&Value>> = ty
        .concurrency_tokens
        .iter()
        .map(|token| record.properties.get(token))
        .collect();
    concurrency_etag(&values)
}

/// Renders entries against one service root.
pub struct EntryWriter<'c> {
    config: &'c EngineConfig,
}

impl<'c> EntryWriter<'c> {
    pub fn new(config: &'c EngineConfig) -> Self {
        Self { config }
    }

    pub fn entity_path(set: &str, record: &EntityRecord) -> String {
        format!("{set}({})", record.key)
    }

    /// One entry. Navigation properties are deferred; the caller replaces the
    /// expanded ones.
    pub fn entry(
        &self,
        set: &str,
        ty: &ResolvedType,
        record: &EntityRecord,
        stream: Option<&StreamInfo>,
        select: Option<&[String]>,
    ) -> Value {
        let path = Self::entity_path(set, record);
        let uri = self.config.absolute(&path);

        let mut metadata = Map::new();
        metadata.insert("uri".into(), Value::String(uri.clone()));
        metadata.insert("type".into(), Value::String(record.type_name.clone()));
        if let Some(etag) = entry_etag(ty, record).header_value() {
            metadata.insert("etag".into(), Value::String(etag));
        }
        if let (true, Some(stream)) = (ty.is_stream, stream) {
            let edit_media = format!("{uri}/$value");
            metadata.insert(
                "media_src".into(),
                Value::String(stream.read_uri.clone().unwrap_or_else(|| edit_media.clone())),
            );
            metadata.insert("edit_media".into(), Value::String(edit_media));
            metadata.insert("content_type".into(), Value::String(stream.content_type.to_string()));
            if let Some(tag) = stream.etag.header_value() {
                metadata.insert("media_etag".into(), Value::String(tag));
            }
        }

        let selected = |name: &str| match select {
            None => true,
            Some(list) => list.iter().any(|s| s == "*" || s == name),
        };

        let mut entry = Map::new();
        entry.insert("__metadata".into(), Value::Object(metadata));
        for (name, value) in &record.properties {
            if selected(name) {
                entry.insert(name.clone(), value.clone());
            }
        }
        for nav in &ty.navigation {
            if selected(&nav.name) {
                entry.insert(
                    nav.name.clone(),
                    json!({ "__deferred": { "uri": format!("{uri}/{}", nav.name) } }),
                );
            }
        }
        Value::Object(entry)
    }

    pub fn feed(entries: Vec<Value>, count: Option<usize>) -> Value {
        let mut feed = json!({ "results": entries });
        if let Some(count) = count {
            feed["__count"] = Value::from(count);
        }
        feed
    }

    pub fn reference(&self, path: &str) -> Value {
        json!({ "uri": self.config.absolute(path) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntitySet, EntityType, MediaModel, NavigationProperty};
    use media_blob::EntityKey;

    fn model() -> MediaModel {
        MediaModel::builder()
            .entity_type(
                EntityType::new("Demo.Photo", "ID")
                    .with_stream()
                    .concurrency_token("Version")
                    .navigation(NavigationProperty::one("Folder", "Folders")),
            )
            .entity_type(EntityType::new("Demo.Folder", "ID"))
            .entity_set(EntitySet::new("Photos", "Demo.Photo"))
            .entity_set(EntitySet::new("Folders", "Demo.Folder"))
            .build()
            .unwrap()
    }

    #[test]
    fn select_keeps_the_media_block() {
        let model = model();
        let config = EngineConfig::default();
        let record = EntityRecord::new("Demo.Photo", EntityKey::Int(1))
            .with("ID", 1)
            .with("Name", "cat")
            .with("Version", 3);
        let stream = StreamInfo {
            etag: EntityTag::strong("v1"),
            read_uri: None,
            content_type: MediaType::parse("image/png").unwrap(),
        };
        let select = vec!["Name".to_string()];
        let entry = EntryWriter::new(&config).entry(
            "Photos",
            model.entity_type("Demo.Photo").unwrap(),
            &record,
            Some(&stream),
            Some(&select),
        );

        let meta = &entry["__metadata"];
        assert_eq!(meta["uri"], "http://localhost/Photos(1)");
        assert_eq!(meta["etag"], "W/\"3\"");
        assert_eq!(meta["edit_media"], "http://localhost/Photos(1)/$value");
        assert_eq!(meta["media_src"], "http://localhost/Photos(1)/$value");
        assert_eq!(meta["content_type"], "image/png");
        assert_eq!(meta["media_etag"], "\"v1\"");
        assert_eq!(entry["Name"], "cat");
        assert!(entry.get("ID").is_none());
        assert!(entry.get("Folder").is_none());
    }

    #[test]
    fn plain_entries_have_no_media_block() {
        let model = model();
        let config = EngineConfig::default();
        let record = EntityRecord::new("Demo.Folder", EntityKey::Str("a".into())).with("ID", "a");
        let entry = EntryWriter::new(&config).entry(
            "Folders",
            model.entity_type("Demo.Folder").unwrap(),
            &record,
            None,
            None,
        );
        let meta = entry["__metadata"].as_object().unwrap();
        assert_eq!(meta["uri"], "http://localhost/Folders('a')");
        assert!(!meta.contains_key("media_src"));
        assert!(!meta.contains_key("etag"));
    }

    #[test]
    fn expand_paths_merge() {
        let tree = ExpandTree::from_paths(&[
            vec!["Folder".into(), "Owner".into()],
            vec!["Folder".into()],
            vec!["Tags".into()],
        ]);
        let names: Vec<&str> = tree.children().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Folder", "Tags"]);
        let (_, folder) = tree.children().next().unwrap();
        assert!(folder.contains("Owner"));
    }
}
