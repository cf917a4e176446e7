#![allow(dead_code)]

use std::sync::Arc;

use media_blob::{
    CallRecorder, EntityKey, MemoryStreamStore, RecordingFactory, StoreProviderFactory, StreamOverrides,
    StreamProviderFactory,
};
use media_core::StageCounter;
use media_protocol::prelude::*;
use media_protocol::{MediaEngine, ResponseBody};

pub fn model() -> MediaModel {
    MediaModel::builder()
        .entity_type(
            EntityType::new("Demo.Photo", "ID")
                .with_stream()
                .concurrency_token("Version")
                .navigation(NavigationProperty::one("Folder", "Folders")),
        )
        .entity_type(EntityType::new("Demo.Clip", "ID").with_stream())
        .entity_type(EntityType::new("Demo.Folder", "ID").navigation(NavigationProperty::many("Photos", "Photos")))
        .entity_type(EntityType::new("Demo.Note", "ID"))
        .entity_set(EntitySet::new("Photos", "Demo.Photo"))
        .entity_set(EntitySet::new("Clips", "Demo.Clip"))
        .entity_set(EntitySet::new("Folders", "Demo.Folder"))
        .entity_set(EntitySet::new("Notes", "Demo.Note"))
        .entity_set(EntitySet::new("Archive", "Demo.Photo").with_rights(EntitySetRights::read_only()))
        .build()
        .expect("model")
}

pub fn seeded_entities() -> MemoryEntityStore {
    let entities = MemoryEntityStore::new();
    entities.seed(
        "Photos",
        EntityRecord::new("Demo.Photo", EntityKey::Int(1))
            .with("ID", 1)
            .with("Name", "cat")
            .with("Version", 1)
            .with_link("Folder", EntityKey::Int(10)),
    );
    entities.seed(
        "Folders",
        EntityRecord::new("Demo.Folder", EntityKey::Int(10))
            .with("ID", 10)
            .with("Name", "pets")
            .with_link("Photos", EntityKey::Int(1)),
    );
    entities.seed(
        "Archive",
        EntityRecord::new("Demo.Photo", EntityKey::Int(5)).with("ID", 5).with("Version", 1),
    );
    entities
}

pub fn engine_with(
    entities: &MemoryEntityStore,
    streams: Arc<dyn StreamProviderFactory>,
    stages: &Arc<StageCounter>,
) -> MediaEngine {
    MediaEngine::builder()
        .model(model())
        .entities(Arc::new(entities.clone()))
        .streams(streams)
        .hook(stages.clone())
        .build()
        .expect("engine")
}

/// Engine over in-memory stores with a recording provider factory.
pub struct Fixture {
    pub engine: MediaEngine,
    pub entities: MemoryEntityStore,
    pub streams: MemoryStreamStore,
    pub factory: StoreProviderFactory<MemoryStreamStore>,
    pub recorder: CallRecorder,
    pub stages: Arc<StageCounter>,
}

impl Fixture {
    pub fn new() -> Self {
        let entities = seeded_entities();
        let streams = MemoryStreamStore::new();
        // versions 1 and 2, so Photos(1) answers "1"
        streams.seed("Photos", EntityKey::Int(1), &b"hello world"[..], "text/plain");
        streams.seed("Archive", EntityKey::Int(5), &b"old"[..], "text/plain");

        let factory = StoreProviderFactory::new(streams.clone())
            .with_type("Photos", "Demo.Photo")
            .with_type("Clips", "Demo.Clip");
        let recording = RecordingFactory::new(factory.clone());
        let recorder = recording.recorder();
        let stages = StageCounter::new();
        let engine = engine_with(&entities, Arc::new(recording), &stages);
        Self {
            engine,
            entities,
            streams,
            factory,
            recorder,
            stages,
        }
    }

    pub fn overrides(&self, f: impl FnOnce(&mut StreamOverrides)) {
        self.factory.update_overrides(f);
    }

    pub async fn send(&self, request: MediaRequest) -> MediaResponse {
        self.recorder.clear();
        let response = self.engine.dispatch(request).await;
        self.assert_no_leaks();
        response
    }

    pub fn assert_no_leaks(&self) {
        assert_eq!(
            self.recorder.live(),
            0,
            "provider instances left undisposed: {}",
            self.recorder.log()
        );
    }
}

pub async fn body_text(response: MediaResponse) -> String {
    let bytes = response.into_bytes().await.expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

pub fn json(response: &MediaResponse) -> &serde_json::Value {
    match &response.body {
        ResponseBody::Json(value) => value,
        other => panic!("expected a JSON body, got {other:?}"),
    }
}

pub fn message(response: &MediaResponse) -> String {
    json(response)["message"].as_str().unwrap_or_default().to_string()
}
