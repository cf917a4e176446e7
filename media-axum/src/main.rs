use std::sync::Arc;

use anyhow::Result;
use media_blob::{FileStreamStore, StoreProviderFactory};
use media_core::ConfigStore;
use media_protocol::prelude::*;

/// Assets carry media resources; albums group them.
fn model() -> Result<MediaModel> {
    Ok(MediaModel::builder()
        .entity_type(
            EntityType::new("Media.Asset", "ID")
                .with_stream()
                .navigation(NavigationProperty::one("Album", "Albums")),
        )
        .entity_type(EntityType::new("Media.Album", "ID").navigation(NavigationProperty::many("Assets", "Assets")))
        .entity_set(EntitySet::new("Assets", "Media.Asset"))
        .entity_set(EntitySet::new("Albums", "Media.Album"))
        .build()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    media_axum::init_tracing();

    let mut config = ConfigStore::new();
    config.set("http.host", "127.0.0.1");
    config.set("http.port", "3030");
    config.set("storage.root", "./media-data");
    config.load_env("MEDIA");

    let host = config.get("http.host").unwrap_or("127.0.0.1").to_string();
    let port = config.get("http.port").unwrap_or("3030").to_string();
    let addr = format!("{host}:{port}");
    if !config.has("service.root") {
        config.set("service.root", format!("http://{addr}/"));
    }
    let snapshot = config.snapshot();

    let root = snapshot.get_string("storage.root").unwrap_or_else(|| "./media-data".to_string());
    let store = FileStreamStore::open(root).await?;
    let streams = StoreProviderFactory::new(store).with_type("Assets", "Media.Asset");

    let engine = MediaEngine::builder()
        .model(model()?)
        .config(EngineConfig::from_snapshot(&snapshot))
        .entities(Arc::new(MemoryEntityStore::new()))
        .streams(Arc::new(streams))
        .build()?;

    println!("[media] listening on http://{addr}");
    media_axum::axum(engine).listen(addr).await?;
    Ok(())
}
