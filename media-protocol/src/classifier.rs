//! Turns a request into a [`MediaOperation`].
//!
//! Every rejection here happens before a provider instance exists, so
//! classification failures never call a hook.

use std::collections::HashMap;
use std::fmt;

use http::Method;
use media_blob::EntityKey;
use media_core::{MediaError, MediaResult};

use crate::etag::EntityTagCondition;
use crate::model::{MediaModel, NavigationProperty};
use crate::negotiation::{resolve_request_content_type, Accept, MediaType};
use crate::request::{MediaRequest, RequestBody};

const SYSTEM_OPTIONS: &[&str] = &[
    "$select", "$expand", "$filter", "$orderby", "$count", "$top", "$skip", "$skiptoken",
];

/// What the request asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    GetMle,
    GetFeed,
    GetMr,
    /// Create an MLE by posting its media resource.
    PostCreate,
    /// Create a structured entity from a JSON body.
    PostEntry,
    PutMr,
    PutMle,
    PatchMle,
    DeleteMr,
    DeleteMle,
    LinkRef,
    Unsupported,
}

impl OperationKind {
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            OperationKind::GetMle | OperationKind::GetFeed | OperationKind::GetMr | OperationKind::Unsupported
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::GetMle => "GetMLE",
            OperationKind::GetFeed => "GetFeed",
            OperationKind::GetMr => "GetMR",
            OperationKind::PostCreate => "PostCreate",
            OperationKind::PostEntry => "PostEntry",
            OperationKind::PutMr => "PutMR",
            OperationKind::PutMle => "PutMLE",
            OperationKind::PatchMle => "PatchMLE",
            OperationKind::DeleteMr => "DeleteMR",
            OperationKind::DeleteMle => "DeleteMLE",
            OperationKind::LinkRef => "LinkRef",
            OperationKind::Unsupported => "Unsupported",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First segment of a resource path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRoot {
    EntitySet(String),
    /// `$N`, an entity created earlier in the same changeset.
    ContentId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathTarget {
    Resource,
    Value,
    Ref,
}

/// Syntactic shape of a resource path, before the model is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    pub root: PathRoot,
    pub key: Option<EntityKey>,
    pub navigation: Option<String>,
    pub target: PathTarget,
}

fn not_found(segment: &str) -> MediaError {
    MediaError::not_found(format!("Resource not found for the segment '{segment}'."))
}

fn split_key(segment: &str) -> MediaResult<(&str, Option<EntityKey>)> {
    match segment.find('(') {
        None => Ok((segment, None)),
        Some(open) => {
            let inner = segment[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| MediaError::bad_request(format!("Bad request - malformed key in segment '{segment}'.")))?;
            let key = EntityKey::parse_literal(inner).ok_or_else(|| {
                MediaError::bad_request(format!("Bad request - error in key literal '{inner}'."))
            })?;
            Ok((&segment[..open], Some(key)))
        }
    }
}

impl ResourcePath {
    /// Parse a path relative to the service root, e.g. `Photos(1)/$value`.
    pub fn parse(path: &str) -> MediaResult<Self> {
        let segments: Vec<String> = path
            .trim_matches('/')
            .split('/')
            .map(|s| {
                urlencoding::decode(s)
                    .map(|d| d.into_owned())
                    .map_err(|_| MediaError::bad_request(format!("The path segment '{s}' is not valid UTF-8.")))
            })
            .collect::<MediaResult<_>>()?;

        let first = segments.first().map(String::as_str).unwrap_or("");
        if first.is_empty() {
            return Err(not_found("/"));
        }
        let (root, key) = match first.strip_prefix('$') {
            Some(id) if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) => {
                (PathRoot::ContentId(id.to_string()), None)
            }
            Some(_) => return Err(not_found(first)),
            None => {
                let (name, key) = split_key(first)?;
                (PathRoot::EntitySet(name.to_string()), key)
            }
        };
        let addresses_entity = key.is_some() || matches!(root, PathRoot::ContentId(_));

        let mut out = ResourcePath {
            root,
            key,
            navigation: None,
            target: PathTarget::Resource,
        };
        let mut rest = segments[1..].iter();
        if let Some(segment) = rest.next() {
            if !addresses_entity {
                return Err(not_found(segment));
            }
            match segment.as_str() {
                "$value" => out.target = PathTarget::Value,
                "$ref" => out.target = PathTarget::Ref,
                nav if !nav.starts_with('$') && !nav.contains('(') => {
                    out.navigation = Some(nav.to_string());
                    if let Some(next) = rest.next() {
                        match next.as_str() {
                            "$value" => out.target = PathTarget::Value,
                            "$ref" => out.target = PathTarget::Ref,
                            other => return Err(not_found(other)),
                        }
                    }
                }
                other => return Err(not_found(other)),
            }
        }
        if let Some(extra) = rest.next() {
            return Err(not_found(extra));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub property: String,
    pub descending: bool,
}

/// Validated system query options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub select: Option<Vec<String>>,
    /// Expansion paths, e.g. `["Folder", "Owner"]` for `Folder/Owner`.
    pub expand: Vec<Vec<String>>,
    pub orderby: Option<OrderBy>,
    pub top: Option<u64>,
    pub skip: Option<u64>,
    pub count: bool,
}

impl QueryOptions {
    pub fn is_empty(&self) -> bool {
        self == &QueryOptions::default()
    }

    fn has_collection_options(&self) -> bool {
        self.orderby.is_some() || self.top.is_some() || self.skip.is_some() || self.count
    }
}

/// Raw `$`-options in request order. Other parameters are ignored.
fn system_options(query: Option<&str>) -> MediaResult<Vec<(String, String)>> {
    let mut out: Vec<(String, String)> = Vec::new();
    for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |raw: &str| {
            urlencoding::decode(raw)
                .map(|d| d.into_owned())
                .map_err(|_| MediaError::bad_request(format!("The query string '{pair}' is not valid UTF-8.")))
        };
        let name = decode(name)?;
        if !name.starts_with('$') {
            continue;
        }
        if !SYSTEM_OPTIONS.contains(&name.as_str()) {
            return Err(MediaError::bad_request(format!(
                "The query parameter '{name}' begins with a system-reserved '$' character but is not recognized."
            )));
        }
        if out.iter().any(|(n, _)| *n == name) {
            return Err(MediaError::bad_request(format!(
                "Query option '{name}' cannot be specified more than once."
            )));
        }
        out.push((name, decode(value)?));
    }
    Ok(out)
}

fn non_negative(option: &str, raw: &str) -> MediaResult<u64> {
    raw.trim().parse::<u64>().map_err(|_| {
        MediaError::bad_request(format!(
            "Invalid value '{raw}' for the {option} query option; a non-negative integer is required."
        ))
    })
}

fn property_list(option: &str, raw: &str) -> MediaResult<Vec<String>> {
    let items: Vec<String> = raw.split(',').map(|s| s.trim().to_string()).collect();
    if items.iter().any(|s| s.is_empty()) {
        return Err(MediaError::bad_request(format!("The {option} query option contains an empty item.")));
    }
    Ok(items)
}

fn parse_options(raw: Vec<(String, String)>) -> MediaResult<QueryOptions> {
    let mut options = QueryOptions::default();
    for (name, value) in raw {
        match name.as_str() {
            "$filter" | "$skiptoken" => {
                return Err(MediaError::not_implemented(format!(
                    "The {name} query option is not supported by this service."
                )))
            }
            "$top" => options.top = Some(non_negative("$top", &value)?),
            "$skip" => options.skip = Some(non_negative("$skip", &value)?),
            "$count" => {
                options.count = match value.as_str() {
                    "true" => true,
                    "false" => false,
                    other => {
                        return Err(MediaError::bad_request(format!(
                            "Invalid value '{other}' for the $count query option; 'true' or 'false' is required."
                        )))
                    }
                }
            }
            "$select" => options.select = Some(property_list("$select", &value)?),
            "$expand" => {
                options.expand = property_list("$expand", &value)?
                    .into_iter()
                    .map(|path| path.split('/').map(str::to_string).collect())
                    .collect()
            }
            "$orderby" => {
                let items = property_list("$orderby", &value)?;
                if items.len() > 1 {
                    return Err(MediaError::not_implemented(
                        "Ordering by more than one property is not supported.",
                    ));
                }
                let mut words = items[0].split_whitespace();
                let property = words.next().unwrap_or_default().to_string();
                let descending = match words.next() {
                    None | Some("asc") => false,
                    Some("desc") => true,
                    Some(other) => {
                        return Err(MediaError::bad_request(format!(
                            "Invalid ordering direction '{other}' in the $orderby query option."
                        )))
                    }
                };
                if words.next().is_some() {
                    return Err(MediaError::bad_request("The $orderby query option is malformed."));
                }
                options.orderby = Some(OrderBy { property, descending });
            }
            _ => {}
        }
    }
    Ok(options)
}

/// An entity addressed by set and key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub set: String,
    pub key: EntityKey,
}

impl EntityRef {
    pub fn new(set: impl Into<String>, key: EntityKey) -> Self {
        Self { set: set.into(), key }
    }

    /// Path relative to the service root, e.g. `Photos(1)`.
    pub fn path(&self) -> String {
        format!("{}({})", self.set, self.key)
    }
}

/// Entities created earlier in a changeset, by Content-ID.
pub type ContentIds = HashMap<String, EntityRef>;

/// One classified unit of work. Immutable once built.
#[derive(Debug)]
pub struct MediaOperation {
    pub kind: OperationKind,
    pub method: Method,
    /// Entity set addressed by the first path segment.
    pub set: String,
    /// Key of the addressed entity (the parent when navigating).
    pub key: Option<EntityKey>,
    pub navigation: Option<NavigationProperty>,
    pub if_match: Option<EntityTagCondition>,
    pub if_none_match: Option<EntityTagCondition>,
    pub content_type: Option<MediaType>,
    pub accept: Accept,
    pub query: QueryOptions,
    pub slug: Option<String>,
    pub body: RequestBody,
}

impl MediaOperation {
    pub fn entity_ref(&self) -> Option<EntityRef> {
        self.key.clone().map(|key| EntityRef::new(self.set.clone(), key))
    }
}

/// Classifies requests against a model.
pub struct Classifier<'m> {
    model: &'m MediaModel,
}

impl<'m> Classifier<'m> {
    pub fn new(model: &'m MediaModel) -> Self {
        Self { model }
    }

    /// Operation kind for a method and path shape.
    pub fn kind_for(method: &Method, path: &ResourcePath, nav: Option<&NavigationProperty>, content_type: Option<&MediaType>) -> OperationKind {
        let has_key = path.key.is_some() || matches!(path.root, PathRoot::ContentId(_));
        let many = nav.is_some_and(|n| n.many);
        match (method.as_str(), path.target) {
            ("GET", PathTarget::Value) => OperationKind::GetMr,
            ("PUT", PathTarget::Value) => OperationKind::PutMr,
            ("DELETE", PathTarget::Value) => OperationKind::DeleteMr,
            (_, PathTarget::Value) => OperationKind::Unsupported,
            ("GET" | "PUT" | "POST" | "DELETE", PathTarget::Ref) => OperationKind::LinkRef,
            (_, PathTarget::Ref) => OperationKind::Unsupported,
            ("GET", PathTarget::Resource) if !has_key || many => OperationKind::GetFeed,
            ("GET", PathTarget::Resource) => OperationKind::GetMle,
            ("POST", PathTarget::Resource) if nav.is_some() => OperationKind::Unsupported,
            ("POST", PathTarget::Resource) if !has_key && content_type.is_some_and(MediaType::is_entry_format) => {
                OperationKind::PostEntry
            }
            ("POST", PathTarget::Resource) => OperationKind::PostCreate,
            (_, PathTarget::Resource) if !has_key || nav.is_some() => OperationKind::Unsupported,
            ("PUT", PathTarget::Resource) => OperationKind::PutMle,
            ("PATCH" | "MERGE", PathTarget::Resource) => OperationKind::PatchMle,
            ("DELETE", PathTarget::Resource) => OperationKind::DeleteMle,
            _ => OperationKind::Unsupported,
        }
    }

    /// Classify a request. `ids` resolves `$N` roots inside a changeset.
    pub fn classify(&self, request: MediaRequest, relative_path: &str, ids: &ContentIds) -> MediaResult<MediaOperation> {
        let path = ResourcePath::parse(relative_path)?;
        let raw_options = system_options(request.query())?;

        let (set, key) = match &path.root {
            PathRoot::EntitySet(name) => (name.clone(), path.key.clone()),
            PathRoot::ContentId(id) => {
                let entity = ids.get(id).ok_or_else(|| {
                    MediaError::not_found(format!("Content-ID reference '${id}' was not found in this changeset."))
                })?;
                (entity.set.clone(), Some(entity.key.clone()))
            }
        };
        let set_type = self
            .model
            .set_type(&set)
            .ok_or_else(|| not_found(&set))?;
        let navigation = match &path.navigation {
            Some(name) => Some(set_type.nav(name).cloned().ok_or_else(|| not_found(name))?),
            None => None,
        };

        let content_type = match request.header_text("Content-Type")? {
            Some(raw) if !raw.trim().is_empty() => Some(resolve_request_content_type(Some(raw))?),
            _ => None,
        };

        let kind = Self::kind_for(&request.method, &path, navigation.as_ref(), content_type.as_ref());
        match kind {
            OperationKind::DeleteMr => {
                return Err(MediaError::method_not_allowed(
                    "DELETE is not supported on a media resource; delete the media link entry instead.",
                ))
            }
            OperationKind::Unsupported => {
                return Err(MediaError::method_not_allowed(format!(
                    "{} is not supported on the resource '{}'.",
                    request.method, relative_path
                )))
            }
            _ => {}
        }

        if !raw_options.is_empty() {
            if path.target == PathTarget::Value {
                return Err(MediaError::bad_request(
                    "Query options $select, $expand, $filter, $orderby, $count, $top, $skip and $skiptoken cannot be applied to a media resource.",
                ));
            }
            if request.method != Method::GET || path.target == PathTarget::Ref {
                return Err(MediaError::bad_request(format!(
                    "Query options cannot be specified for {} requests to '{}'.",
                    request.method, relative_path
                )));
            }
        }
        let query = parse_options(raw_options)?;
        if kind == OperationKind::GetMle && query.has_collection_options() {
            return Err(MediaError::bad_request(
                "Query options $orderby, $count, $top and $skip can only be applied to collections.",
            ));
        }
        let target_type = match &navigation {
            Some(nav) => self.model.set_type(&nav.target_set).ok_or_else(|| not_found(&nav.target_set))?,
            None => set_type,
        };
        self.validate_expand(&target_type.name, &query.expand)?;

        let if_match = match request.header_text("If-Match")? {
            Some(raw) => EntityTagCondition::parse_header("If-Match", raw)?,
            None => None,
        };
        let if_none_match = match request.header_text("If-None-Match")? {
            Some(raw) => EntityTagCondition::parse_header("If-None-Match", raw)?,
            None => None,
        };
        match kind {
            OperationKind::PutMr | OperationKind::PutMle | OperationKind::PatchMle | OperationKind::DeleteMle
                if if_none_match.is_some() =>
            {
                return Err(MediaError::bad_request(
                    "If-None-Match HTTP header cannot be specified for update and delete operations.",
                ));
            }
            OperationKind::PostCreate | OperationKind::PostEntry if if_match.is_some() || if_none_match.is_some() => {
                return Err(MediaError::bad_request(
                    "If-Match and If-None-Match HTTP headers cannot be specified for POST operations.",
                ));
            }
            _ => {}
        }

        let accept = Accept::parse(request.header_text("Accept")?)?;
        let slug = request.header_text("Slug")?.map(str::to_string);

        tracing::debug!(%kind, %set, key = ?key, "classified request");
        Ok(MediaOperation {
            kind,
            method: request.method,
            set,
            key,
            navigation,
            if_match,
            if_none_match,
            content_type,
            accept,
            query,
            slug,
            body: request.body,
        })
    }

    fn validate_expand(&self, type_name: &str, paths: &[Vec<String>]) -> MediaResult<()> {
        for path in paths {
            let mut current = self
                .model
                .entity_type(type_name)
                .ok_or_else(|| not_found(type_name))?;
            for segment in path {
                let nav = current.nav(segment).ok_or_else(|| {
                    MediaError::bad_request(format!(
                        "'{segment}' is not a navigation property of type '{}' and cannot be expanded.",
                        current.name
                    ))
                })?;
                current = self
                    .model
                    .set_type(&nav.target_set)
                    .ok_or_else(|| not_found(&nav.target_set))?;
            }
        }
        Ok(())
    }

    /// Whether the path and method address a media resource or a media link entry.
    pub fn is_media_operation(&self, method: &Method, relative_path: &str) -> bool {
        let Ok(path) = ResourcePath::parse(relative_path) else {
            return false;
        };
        let set = match &path.root {
            PathRoot::EntitySet(set) => set,
            PathRoot::ContentId(_) => return false,
        };
        let Some(set_type) = self.model.set_type(set) else {
            return false;
        };
        let target_set = match &path.navigation {
            Some(name) => match set_type.nav(name) {
                Some(nav) => nav.target_set.as_str(),
                None => return false,
            },
            None => set.as_str(),
        };
        match path.target {
            PathTarget::Value => true,
            PathTarget::Ref => false,
            PathTarget::Resource if path.key.is_none() => *method == Method::POST && self.model.set_accepts_streams(target_set),
            PathTarget::Resource => self.model.set_accepts_streams(target_set),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntitySet, EntityType};

    fn model() -> MediaModel {
        MediaModel::builder()
            .entity_type(
                EntityType::new("Demo.Photo", "ID")
                    .with_stream()
                    .navigation(NavigationProperty::one("Folder", "Folders")),
            )
            .entity_type(EntityType::new("Demo.Folder", "ID").navigation(NavigationProperty::many("Photos", "Photos")))
            .entity_set(EntitySet::new("Photos", "Demo.Photo"))
            .entity_set(EntitySet::new("Folders", "Demo.Folder"))
            .build()
            .unwrap()
    }

    fn classify(req: MediaRequest) -> MediaResult<MediaOperation> {
        let model = model();
        let path = req.path().trim_start_matches('/').to_string();
        Classifier::new(&model).classify(req, &path, &ContentIds::new())
    }

    #[test]
    fn paths() {
        let p = ResourcePath::parse("Photos(1)/$value").unwrap();
        assert_eq!(p.root, PathRoot::EntitySet("Photos".into()));
        assert_eq!(p.key, Some(EntityKey::Int(1)));
        assert_eq!(p.target, PathTarget::Value);

        let p = ResourcePath::parse("Folders('a%20b')/Photos/$ref").unwrap();
        assert_eq!(p.key, Some(EntityKey::Str("a b".into())));
        assert_eq!(p.navigation.as_deref(), Some("Photos"));
        assert_eq!(p.target, PathTarget::Ref);

        assert_eq!(ResourcePath::parse("$2/$value").unwrap().root, PathRoot::ContentId("2".into()));
        assert_eq!(ResourcePath::parse("Photos/$value").unwrap_err().code(), 404);
        assert_eq!(ResourcePath::parse("Photos(x)").unwrap_err().code(), 400);
        assert_eq!(ResourcePath::parse("Photos(1)/$value/more").unwrap_err().code(), 404);
    }

    #[test]
    fn kinds() {
        let cases = [
            (MediaRequest::get("/Photos(1)/$value"), OperationKind::GetMr),
            (MediaRequest::get("/Photos(1)"), OperationKind::GetMle),
            (MediaRequest::get("/Photos"), OperationKind::GetFeed),
            (MediaRequest::get("/Folders(1)/Photos"), OperationKind::GetFeed),
            (MediaRequest::get("/Photos(1)/Folder"), OperationKind::GetMle),
            (MediaRequest::post("/Photos").header("content-type", "image/png"), OperationKind::PostCreate),
            (MediaRequest::post("/Photos(1)").header("content-type", "image/png"), OperationKind::PostCreate),
            (MediaRequest::post("/Folders").header("content-type", "application/json"), OperationKind::PostEntry),
            (MediaRequest::put("/Photos(1)/$value"), OperationKind::PutMr),
            (MediaRequest::put("/Photos(1)"), OperationKind::PutMle),
            (MediaRequest::patch("/Photos(1)"), OperationKind::PatchMle),
            (MediaRequest::delete("/Photos(1)"), OperationKind::DeleteMle),
            (MediaRequest::delete("/Photos(1)/Folder/$ref"), OperationKind::LinkRef),
        ];
        for (req, kind) in cases {
            let target = req.target.clone();
            assert_eq!(classify(req).unwrap().kind, kind, "{target}");
        }
    }

    #[test]
    fn value_rejects_patch_and_delete() {
        assert_eq!(classify(MediaRequest::patch("/Photos(1)/$value")).unwrap_err().code(), 405);
        assert_eq!(classify(MediaRequest::delete("/Photos(1)/$value")).unwrap_err().code(), 405);
        assert_eq!(classify(MediaRequest::post("/Photos(1)/$value")).unwrap_err().code(), 405);
    }

    #[test]
    fn query_option_rules() {
        let err = classify(MediaRequest::get("/Photos(1)/$value?$select=ID")).unwrap_err();
        assert_eq!(err.code(), 400);
        let err = classify(MediaRequest::put("/Photos(1)?$expand=Folder")).unwrap_err();
        assert_eq!(err.code(), 400);
        let err = classify(MediaRequest::get("/Photos?$top=-1")).unwrap_err();
        assert_eq!(err.code(), 400);
        let err = classify(MediaRequest::get("/Photos?$skip=abc")).unwrap_err();
        assert_eq!(err.code(), 400);
        let err = classify(MediaRequest::get("/Photos?$filter=ID%20eq%201")).unwrap_err();
        assert_eq!(err.code(), 501);
        let err = classify(MediaRequest::get("/Photos(1)?$top=1")).unwrap_err();
        assert_eq!(err.code(), 400);
        let err = classify(MediaRequest::get("/Photos(1)?$expand=Nope")).unwrap_err();
        assert_eq!(err.code(), 400);

        let op = classify(MediaRequest::get("/Folders?$top=2&$skip=1&$orderby=Name%20desc&$count=true&$expand=Photos/Folder&custom=1")).unwrap();
        assert_eq!(op.query.top, Some(2));
        assert_eq!(op.query.skip, Some(1));
        assert!(op.query.count);
        assert_eq!(
            op.query.orderby,
            Some(OrderBy {
                property: "Name".into(),
                descending: true
            })
        );
        assert_eq!(op.query.expand, vec![vec!["Photos".to_string(), "Folder".to_string()]]);
    }

    #[test]
    fn conditional_header_rules() {
        let err = classify(MediaRequest::delete("/Photos(1)").header("if-none-match", "W/\"1\"")).unwrap_err();
        assert_eq!(err.code(), 400);
        assert_eq!(
            err.message,
            "If-None-Match HTTP header cannot be specified for update and delete operations."
        );
        let err = classify(MediaRequest::get("/Photos(1)/$value").header("if-match", "W/")).unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn unknown_resources() {
        assert_eq!(classify(MediaRequest::get("/Nope(1)")).unwrap_err().code(), 404);
        assert_eq!(classify(MediaRequest::get("/Photos(1)/Nope")).unwrap_err().code(), 404);
        assert_eq!(classify(MediaRequest::get("/$3")).unwrap_err().code(), 404);
    }

    #[test]
    fn media_operations() {
        let model = model();
        let c = Classifier::new(&model);
        assert!(c.is_media_operation(&Method::GET, "Photos(1)/$value"));
        assert!(c.is_media_operation(&Method::GET, "Photos(1)"));
        assert!(c.is_media_operation(&Method::POST, "Photos"));
        assert!(!c.is_media_operation(&Method::GET, "Photos"));
        assert!(!c.is_media_operation(&Method::GET, "Folders(1)"));
        assert!(c.is_media_operation(&Method::GET, "Folders(1)/Photos"));
    }
}
