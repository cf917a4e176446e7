mod common;

use std::sync::Arc;

use common::{body_text, json, message, Fixture};
use http::{HeaderValue, Method};
use media_blob::{
    EntityKey, FileStreamStore, MemoryStreamStore, ProviderCall, RecordingFactory, StoreProviderFactory, StreamProvider,
    StreamProviderFactory,
};
use media_core::{ChangesetId, ChangesetParticipant, PipelineStage, StageCounter};
use media_protocol::prelude::*;
use media_protocol::OperationState;
use serde_json::json;

const GET_MR: &str = "GetStreamContentType,GetReadStream,GetStreamETag,StreamBufferSize,Dispose";
const GET_MLE: &str = "GetStreamETag,GetReadStreamUri,GetStreamContentType,Dispose";

#[tokio::test]
async fn get_media_resource_runs_hooks_in_order() {
    let fx = Fixture::new();

    let response = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.etag(), Some("\"1\""));
    assert_eq!(fx.recorder.log(), GET_MR);
    assert_eq!(body_text(response).await, "hello world");

    // same request, same sequence
    let again = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(again.status, 200);
    assert_eq!(fx.recorder.log(), GET_MR);
    assert_eq!(fx.recorder.instances().len(), 1);
}

#[tokio::test]
async fn get_entry_carries_media_block() {
    let fx = Fixture::new();

    let response = fx.send(MediaRequest::get("/Photos(1)")).await;
    assert_eq!(response.status, 200);
    assert_eq!(fx.recorder.log(), GET_MLE);
    assert_eq!(response.etag(), Some("W/\"1\""));

    let entry = json(&response);
    let metadata = &entry["__metadata"];
    assert_eq!(metadata["uri"], "http://localhost/Photos(1)");
    assert_eq!(metadata["type"], "Demo.Photo");
    assert_eq!(metadata["etag"], "W/\"1\"");
    assert_eq!(metadata["media_src"], "http://localhost/Photos(1)/$value");
    assert_eq!(metadata["edit_media"], "http://localhost/Photos(1)/$value");
    assert_eq!(metadata["content_type"], "text/plain");
    assert_eq!(metadata["media_etag"], "\"1\"");
    assert_eq!(entry["Name"], "cat");
    assert_eq!(entry["Folder"]["__deferred"]["uri"], "http://localhost/Photos(1)/Folder");
}

#[tokio::test]
async fn entries_without_streams_never_create_a_provider() {
    let fx = Fixture::new();

    let response = fx.send(MediaRequest::get("/Folders(10)")).await;
    assert_eq!(response.status, 200);
    assert_eq!(fx.recorder.created(), 0);
    assert!(json(&response)["__metadata"].get("media_src").is_none());
}

#[tokio::test]
async fn read_uri_from_provider_becomes_media_src() {
    let fx = Fixture::new();
    fx.overrides(|o| o.read_uri = Some(Some("http://cdn.example.com/cat.txt".to_string())));

    let response = fx.send(MediaRequest::get("/Photos(1)")).await;
    let metadata = &json(&response)["__metadata"];
    assert_eq!(metadata["media_src"], "http://cdn.example.com/cat.txt");
    assert_eq!(metadata["edit_media"], "http://localhost/Photos(1)/$value");

    fx.overrides(|o| o.read_uri = Some(Some("cat.txt".to_string())));
    let relative = fx.send(MediaRequest::get("/Photos(1)")).await;
    assert_eq!(relative.status, 500);
}

#[tokio::test]
async fn empty_stream_etag_omits_the_header() {
    let fx = Fixture::new();

    fx.overrides(|o| o.etag = Some(Some(String::new())));
    let response = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.etag(), None);

    fx.overrides(|o| o.etag = Some(None));
    let response = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.etag(), None);

    let entry = fx.send(MediaRequest::get("/Photos(1)")).await;
    assert!(json(&entry)["__metadata"].get("media_etag").is_none());
}

#[tokio::test]
async fn malformed_provider_etag_is_a_server_error() {
    let fx = Fixture::new();

    for raw in ["W/", "abc", "\"open"] {
        fx.overrides(|o| o.etag = Some(Some(raw.to_string())));
        let response = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
        assert_eq!(response.status, 500, "etag {raw:?}");
        assert_eq!(response.etag(), None);
        assert!(message(&response).contains("invalid format"), "etag {raw:?}");
        assert_eq!(fx.recorder.log(), "GetStreamContentType,GetReadStream,GetStreamETag,Dispose");
    }

    // a quoted comma is a valid opaque tag
    fx.overrides(|o| o.etag = Some(Some("\",\"".to_string())));
    let response = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.etag(), Some("\",\""));
}

#[tokio::test]
async fn malformed_client_condition_is_a_bad_request() {
    let fx = Fixture::new();

    let response = fx
        .send(MediaRequest::get("/Photos(1)/$value").header("if-none-match", "W/"))
        .await;
    assert_eq!(response.status, 400);
    assert!(message(&response).contains("invalid format"));
    assert_eq!(fx.recorder.created(), 0);
}

#[tokio::test]
async fn matching_if_none_match_returns_not_modified() {
    let fx = Fixture::new();
    fx.overrides(|o| o.etag = Some(Some("\"X\"".to_string())));

    let first = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(first.etag(), Some("\"X\""));

    let response = fx
        .send(MediaRequest::get("/Photos(1)/$value").header("if-none-match", "\"X\""))
        .await;
    assert_eq!(response.status, 304);
    assert_eq!(response.etag(), Some("\"X\""));
    assert_eq!(fx.recorder.log(), "GetStreamContentType,GetReadStream,GetStreamETag,Dispose");
    assert_eq!(
        response.states(),
        [
            OperationState::Classified,
            OperationState::Negotiating,
            OperationState::Authorizing,
            OperationState::ProviderInvoking,
            OperationState::Terminal(304),
        ]
    );
    assert!(body_text(response).await.is_empty());

    let stale = fx
        .send(MediaRequest::get("/Photos(1)/$value").header("if-match", "\"Y\""))
        .await;
    assert_eq!(stale.status, 412);

    let wildcard = fx
        .send(MediaRequest::get("/Photos(1)/$value").header("if-match", "*"))
        .await;
    assert_eq!(wildcard.status, 200);
}

#[tokio::test]
async fn unsupported_methods_on_value_are_rejected_before_the_provider() {
    let fx = Fixture::new();

    let patch = fx
        .send(
            MediaRequest::patch("/Photos(1)/$value")
                .header("content-type", "text/plain")
                .body("x"),
        )
        .await;
    assert_eq!(patch.status, 405);

    let delete = fx.send(MediaRequest::delete("/Photos(1)/$value")).await;
    assert_eq!(delete.status, 405);
    assert_eq!(fx.recorder.created(), 0);
}

#[tokio::test]
async fn query_options_on_value_are_rejected() {
    let fx = Fixture::new();

    let response = fx.send(MediaRequest::get("/Photos(1)/$value?$select=Name")).await;
    assert_eq!(response.status, 400);
    assert_eq!(fx.recorder.created(), 0);

    let filter = fx.send(MediaRequest::get("/Photos?$filter=Name eq 'cat'")).await;
    assert_eq!(filter.status, 501);

    let negative = fx.send(MediaRequest::get("/Photos?$top=-1")).await;
    assert_eq!(negative.status, 400);
}

#[tokio::test]
async fn value_on_entity_without_stream_is_a_bad_request() {
    let fx = Fixture::new();

    let response = fx.send(MediaRequest::get("/Folders(10)/$value")).await;
    assert_eq!(response.status, 400);
    assert_eq!(fx.recorder.created(), 0);

    let missing = fx.send(MediaRequest::get("/Photos(99)/$value")).await;
    assert_eq!(missing.status, 404);
}

#[tokio::test]
async fn post_put_delete_lifecycle() {
    let fx = Fixture::new();

    let created = fx
        .send(
            MediaRequest::post("/Clips")
                .header("content-type", "text/plain")
                .header("slug", "7")
                .body("first"),
        )
        .await;
    assert_eq!(created.status, 201);
    assert_eq!(created.header("location"), Some("http://localhost/Clips(7)"));
    assert_eq!(
        fx.recorder.log(),
        "ResolveType,GetWriteStream,Dispose,GetStreamETag,GetReadStreamUri,GetStreamContentType,Dispose"
    );
    assert_eq!(fx.recorder.instances().len(), 2);
    let first_tag = json(&created)["__metadata"]["media_etag"].as_str().map(str::to_string);
    assert!(first_tag.is_some());
    assert_eq!(json(&created)["ID"], 7);
    assert!(fx.streams.exists("Clips", &EntityKey::Int(7)));

    let read = fx.send(MediaRequest::get("/Clips(7)/$value")).await;
    assert_eq!(body_text(read).await, "first");

    let replaced = fx
        .send(
            MediaRequest::put("/Clips(7)/$value")
                .header("content-type", "text/plain")
                .body("second"),
        )
        .await;
    assert_eq!(replaced.status, 204);
    assert_eq!(fx.recorder.log(), "GetWriteStream,StreamBufferSize,GetStreamETag,Dispose");
    assert!(replaced.etag().is_some());
    assert_ne!(replaced.etag().map(str::to_string), first_tag);

    let read = fx.send(MediaRequest::get("/Clips(7)/$value")).await;
    assert_eq!(body_text(read).await, "second");

    let deleted = fx.send(MediaRequest::delete("/Clips(7)")).await;
    assert_eq!(deleted.status, 204);
    assert_eq!(fx.recorder.log(), "DeleteStream,Dispose");
    assert!(!fx.streams.exists("Clips", &EntityKey::Int(7)));
    assert!(!fx.entities.contains("Clips", &EntityKey::Int(7)));

    let gone = fx.send(MediaRequest::get("/Clips(7)")).await;
    assert_eq!(gone.status, 404);
}

#[tokio::test]
async fn conditional_put_checks_the_stream_tag_first() {
    let fx = Fixture::new();

    let stale = fx
        .send(
            MediaRequest::put("/Photos(1)/$value")
                .header("content-type", "text/plain")
                .header("if-match", "\"41\"")
                .body("nope"),
        )
        .await;
    assert_eq!(stale.status, 412);
    assert_eq!(fx.recorder.log(), "GetStreamETag,Dispose");

    let fresh = fx
        .send(
            MediaRequest::put("/Photos(1)/$value")
                .header("content-type", "text/plain")
                .header("if-match", "\"1\"")
                .body("dog"),
        )
        .await;
    assert_eq!(fresh.status, 204);
    assert_eq!(
        fx.recorder.log(),
        "GetStreamETag,GetWriteStream,StreamBufferSize,GetStreamETag,Dispose"
    );
    let read = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(body_text(read).await, "dog");
}

#[tokio::test]
async fn non_ascii_conditions_are_still_enforced() {
    let fx = Fixture::new();

    let stale = fx
        .send(
            MediaRequest::put("/Photos(1)/$value")
                .header("content-type", "text/plain")
                .header("if-match", "\"café\"")
                .body("overwritten"),
        )
        .await;
    assert_eq!(stale.status, 412);
    assert_eq!(fx.recorder.log(), "GetStreamETag,Dispose");
    let read = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(body_text(read).await, "hello world");

    // Latin-1 octets are not UTF-8
    let mut latin1 = MediaRequest::put("/Photos(1)/$value")
        .header("content-type", "text/plain")
        .body("overwritten");
    latin1
        .headers
        .insert("if-match", HeaderValue::from_bytes(b"\"caf\xe9\"").unwrap());
    let rejected = fx.send(latin1).await;
    assert_eq!(rejected.status, 400);
    assert_eq!(message(&rejected), "The value of the If-Match HTTP header has an invalid format.");
    assert!(fx.recorder.calls().is_empty());
    let read = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(body_text(read).await, "hello world");
}

#[tokio::test]
async fn non_ascii_tags_round_trip_through_headers() {
    let fx = Fixture::new();
    fx.overrides(|o| o.etag = Some(Some("\"café\"".to_string())));

    let response = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.etag(), Some("\"café\""));
    let cached = fx
        .send(MediaRequest::get("/Photos(1)/$value").header("if-none-match", "\"café\""))
        .await;
    assert_eq!(cached.status, 304);
    assert_eq!(cached.etag(), Some("\"café\""));

    fx.entities.seed(
        "Photos",
        EntityRecord::new("Demo.Photo", EntityKey::Int(3))
            .with("ID", 3)
            .with("Version", "vé"),
    );
    fx.streams.seed("Photos", EntityKey::Int(3), &b"x"[..], "text/plain");
    let entry = fx.send(MediaRequest::get("/Photos(3)")).await;
    assert_eq!(entry.status, 200);
    assert_eq!(entry.etag(), Some("W/\"'vé'\""));
    assert_eq!(json(&entry)["__metadata"]["etag"], "W/\"'vé'\"");

    let created = fx
        .send(
            MediaRequest::post("/Clips")
                .header("content-type", "text/plain")
                .header("slug", "né")
                .body("accent"),
        )
        .await;
    assert_eq!(created.status, 201);
    assert_eq!(created.header("location"), Some("http://localhost/Clips('né')"));
}

#[tokio::test]
async fn tags_http_cannot_carry_are_server_errors() {
    let fx = Fixture::new();
    fx.overrides(|o| o.etag = Some(Some("\"a\rb\"".to_string())));

    let response = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(response.status, 500);
    assert_eq!(response.etag(), None);
    assert!(message(&response).contains("StreamProvider::get_stream_etag"));
    assert_eq!(fx.recorder.log(), "GetStreamContentType,GetReadStream,GetStreamETag,Dispose");

    fx.entities.seed(
        "Photos",
        EntityRecord::new("Demo.Photo", EntityKey::Int(4))
            .with("ID", 4)
            .with("Version", "a\nb"),
    );
    fx.overrides(|o| o.etag = None);
    fx.streams.seed("Photos", EntityKey::Int(4), &b"x"[..], "text/plain");
    let entry = fx.send(MediaRequest::get("/Photos(4)")).await;
    assert_eq!(entry.status, 500);
    assert!(message(&entry).contains("the concurrency tokens of 'Demo.Photo'"));
}

#[tokio::test]
async fn file_store_lifecycle_removes_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStreamStore::open(dir.path()).await.unwrap();
    let factory = StoreProviderFactory::new(store.clone()).with_type("Clips", "Demo.Clip");
    let recording = RecordingFactory::new(factory);
    let recorder = recording.recorder();
    let entities = common::seeded_entities();
    let engine = common::engine_with(&entities, Arc::new(recording), &StageCounter::new());

    let created = engine
        .dispatch(
            MediaRequest::post("/Clips")
                .header("content-type", "application/octet-stream")
                .header("slug", "3")
                .body(vec![1u8, 2, 3, 4]),
        )
        .await;
    assert_eq!(created.status, 201);
    assert!(store.exists("Clips", &EntityKey::Int(3)).await);

    let replaced = engine
        .dispatch(
            MediaRequest::put("/Clips(3)/$value")
                .header("content-type", "application/octet-stream")
                .body(vec![9u8; 1000]),
        )
        .await;
    assert_eq!(replaced.status, 204);
    let read = engine.dispatch(MediaRequest::get("/Clips(3)/$value")).await;
    assert_eq!(read.into_bytes().await.unwrap().len(), 1000);

    let deleted = engine.dispatch(MediaRequest::delete("/Clips(3)")).await;
    assert_eq!(deleted.status, 204);
    assert!(!store.exists("Clips", &EntityKey::Int(3)).await);
    assert!(!entities.contains("Clips", &EntityKey::Int(3)));
    assert_eq!(recorder.live(), 0);
}

#[tokio::test]
async fn resolve_type_must_name_a_stream_type_of_the_set() {
    let fx = Fixture::new();
    let post = || {
        MediaRequest::post("/Clips")
            .header("content-type", "text/plain")
            .body("x")
    };

    fx.overrides(|o| o.resolved_type = Some(None));
    let response = fx.send(post()).await;
    assert_eq!(response.status, 500);
    assert_eq!(
        message(&response),
        "StreamProvider::resolve_type must not return a null or empty string."
    );
    assert_eq!(fx.recorder.log(), "ResolveType,Dispose");

    for bad in ["", "Demo.Nope", "Demo.Note", "Demo.Photo"] {
        fx.overrides(|o| o.resolved_type = Some(Some(bad.to_string())));
        let response = fx.send(post()).await;
        assert_eq!(response.status, 500, "resolved type {bad:?}");
    }
    assert!(fx.entities.keys("Clips").is_empty());
}

#[tokio::test]
async fn post_content_type_rules() {
    let fx = Fixture::new();

    let not_a_stream_set = fx
        .send(MediaRequest::post("/Notes").header("content-type", "text/plain").body("x"))
        .await;
    assert_eq!(not_a_stream_set.status, 415);

    let missing = fx.send(MediaRequest::post("/Clips").body("x")).await;
    assert_eq!(missing.status, 400);
    assert_eq!(message(&missing), "Content-Type header value missing.");

    let no_subtype = fx
        .send(MediaRequest::post("/Clips").header("content-type", "text").body("x"))
        .await;
    assert_eq!(no_subtype.status, 400);
    assert_eq!(message(&no_subtype), "Media type is unspecified.");

    let empty_subtype = fx
        .send(MediaRequest::post("/Clips").header("content-type", "text/").body("x"))
        .await;
    assert_eq!(empty_subtype.status, 400);
    assert_eq!(message(&empty_subtype), "Media type requires a subtype definition.");

    let entry_into_stream_set = fx
        .send(MediaRequest::post("/Clips").json(&json!({ "ID": 4 })))
        .await;
    assert_eq!(entry_into_stream_set.status, 400);

    let to_existing = fx
        .send(MediaRequest::post("/Clips(1)").header("content-type", "text/plain").body("x"))
        .await;
    assert_eq!(to_existing.status, 500);

    assert_eq!(fx.recorder.created(), 0);
}

#[tokio::test]
async fn accept_header_negotiation() {
    let fx = Fixture::new();

    let png_only = fx
        .send(MediaRequest::get("/Photos(1)").header("accept", "image/png"))
        .await;
    assert_eq!(png_only.status, 415);

    let with_json = fx
        .send(MediaRequest::get("/Photos(1)").header("accept", "image/png, application/json"))
        .await;
    assert_eq!(with_json.status, 200);

    let images = fx
        .send(MediaRequest::get("/Photos(1)/$value").header("accept", "image/*"))
        .await;
    assert_eq!(images.status, 415);
    assert_eq!(fx.recorder.log(), "GetStreamContentType,Dispose");

    let text = fx
        .send(MediaRequest::get("/Photos(1)/$value").header("accept", "text/*;q=0.5"))
        .await;
    assert_eq!(text.status, 200);
}

#[tokio::test]
async fn provider_content_type_must_be_usable() {
    let fx = Fixture::new();

    fx.overrides(|o| o.content_type = Some(None));
    let response = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(response.status, 500);
    assert_eq!(
        message(&response),
        "StreamProvider::get_stream_content_type must not return a null or empty string."
    );

    fx.overrides(|o| {
        o.content_type = None;
        o.accepted_content_types = Some(vec!["image/png".to_string()]);
    });
    let rejected = fx
        .send(
            MediaRequest::put("/Photos(1)/$value")
                .header("content-type", "text/plain")
                .body("x"),
        )
        .await;
    assert_eq!(rejected.status, 500);
    assert_eq!(fx.recorder.log(), "GetWriteStream,Dispose");
}

#[tokio::test]
async fn failing_hooks_still_dispose() {
    let fx = Fixture::new();

    fx.overrides(|o| o.fail_on = Some(ProviderCall::GetReadStream));
    let response = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(response.status, 500);
    assert!(message(&response).contains("StreamProvider::get_read_stream"));
    assert_eq!(fx.recorder.log(), "GetStreamContentType,GetReadStream,Dispose");

    fx.overrides(|o| o.fail_on = Some(ProviderCall::GetWriteStream));
    let response = fx
        .send(MediaRequest::post("/Clips").header("content-type", "text/plain").body("x"))
        .await;
    assert_eq!(response.status, 500);
    assert_eq!(fx.recorder.log(), "ResolveType,GetWriteStream,Dispose");
    assert!(fx.entities.keys("Clips").is_empty());
}

#[tokio::test]
async fn entry_concurrency_uses_weak_tags() {
    let fx = Fixture::new();
    let delete = || MediaRequest::delete("/Photos(1)");

    let unconditional = fx.send(delete()).await;
    assert_eq!(unconditional.status, 400);

    let strong = fx.send(delete().header("if-match", "\"1\"")).await;
    assert_eq!(strong.status, 412);

    let stale = fx.send(delete().header("if-match", "W/\"2\"")).await;
    assert_eq!(stale.status, 412);

    let none_match = fx
        .send(delete().header("if-match", "W/\"1\"").header("if-none-match", "*"))
        .await;
    assert_eq!(none_match.status, 400);
    assert_eq!(
        message(&none_match),
        "If-None-Match HTTP header cannot be specified for update and delete operations."
    );
    assert_eq!(fx.recorder.created(), 0);

    let deleted = fx.send(delete().header("if-match", "W/\"1\"")).await;
    assert_eq!(deleted.status, 204);
    assert_eq!(fx.recorder.log(), "DeleteStream,Dispose");
    assert!(!fx.streams.exists("Photos", &EntityKey::Int(1)));
    assert!(!fx.entities.contains("Photos", &EntityKey::Int(1)));
}

#[tokio::test]
async fn entry_concurrency_survives_an_empty_stream_tag() {
    let fx = Fixture::new();
    fx.overrides(|o| o.etag = Some(Some(String::new())));

    let updated = fx
        .send(
            MediaRequest::patch("/Photos(1)")
                .header("if-match", "W/\"1\"")
                .json(&json!({ "Name": "dog", "Version": 2 })),
        )
        .await;
    assert_eq!(updated.status, 204);
    assert_eq!(updated.etag(), Some("W/\"2\""));

    let replay = fx
        .send(
            MediaRequest::patch("/Photos(1)")
                .header("if-match", "W/\"1\"")
                .json(&json!({ "Name": "bird" })),
        )
        .await;
    assert_eq!(replay.status, 412);

    let not_modified = fx
        .send(MediaRequest::get("/Photos(1)").header("if-none-match", "W/\"2\""))
        .await;
    assert_eq!(not_modified.status, 304);
    assert_eq!(not_modified.etag(), Some("W/\"2\""));

    let entry = fx.send(MediaRequest::get("/Photos(1)")).await;
    assert_eq!(json(&entry)["Name"], "dog");
    assert!(json(&entry)["__metadata"].get("media_etag").is_none());
}

#[tokio::test]
async fn conditions_on_types_without_tokens_are_rejected() {
    let fx = Fixture::new();

    let response = fx
        .send(MediaRequest::get("/Folders(10)").header("if-none-match", "*"))
        .await;
    assert_eq!(response.status, 400);

    let put = fx
        .send(
            MediaRequest::put("/Folders(10)")
                .header("if-match", "*")
                .json(&json!({ "Name": "cats" })),
        )
        .await;
    assert_eq!(put.status, 400);
}

#[tokio::test]
async fn read_only_sets_refuse_writes() {
    let fx = Fixture::new();

    let delete = fx
        .send(MediaRequest::delete("/Archive(5)").header("if-match", "W/\"1\""))
        .await;
    assert_eq!(delete.status, 403);

    let put = fx
        .send(
            MediaRequest::put("/Archive(5)/$value")
                .header("content-type", "text/plain")
                .body("new"),
        )
        .await;
    assert_eq!(put.status, 403);
    assert_eq!(fx.recorder.created(), 0);

    let read = fx.send(MediaRequest::get("/Archive(5)/$value")).await;
    assert_eq!(read.status, 200);
    assert_eq!(body_text(read).await, "old");
}

#[tokio::test]
async fn select_keeps_the_media_block() {
    let fx = Fixture::new();

    let response = fx.send(MediaRequest::get("/Photos(1)?$select=Name")).await;
    assert_eq!(response.status, 200);
    let entry = json(&response);
    assert_eq!(entry["Name"], "cat");
    assert!(entry.get("ID").is_none());
    assert!(entry.get("Folder").is_none());
    assert_eq!(entry["__metadata"]["media_src"], "http://localhost/Photos(1)/$value");
}

#[tokio::test]
async fn expansion_describes_parents_before_children_on_one_provider() {
    let fx = Fixture::new();

    let folder = fx.send(MediaRequest::get("/Folders(10)?$expand=Photos")).await;
    assert_eq!(folder.status, 200);
    assert_eq!(fx.recorder.log(), GET_MLE);
    let entry = json(&folder);
    assert!(entry["__metadata"].get("media_src").is_none());
    assert_eq!(entry["Photos"]["results"][0]["__metadata"]["media_etag"], "\"1\"");

    let nested = fx.send(MediaRequest::get("/Photos(1)?$expand=Folder/Photos")).await;
    assert_eq!(nested.status, 200);
    assert_eq!(
        fx.recorder.log(),
        "GetStreamETag,GetReadStreamUri,GetStreamContentType,GetStreamETag,GetReadStreamUri,GetStreamContentType,Dispose"
    );
    assert_eq!(fx.recorder.instances().len(), 1);
    assert_eq!(json(&nested)["Folder"]["Name"], "pets");

    let unknown = fx.send(MediaRequest::get("/Photos(1)?$expand=Owner")).await;
    assert_eq!(unknown.status, 400);
}

#[tokio::test]
async fn feeds_page_and_count() {
    let fx = Fixture::new();
    for (id, name) in [(2, "ant"), (3, "bee")] {
        fx.entities.seed(
            "Folders",
            EntityRecord::new("Demo.Folder", EntityKey::Int(id))
                .with("ID", id)
                .with("Name", name),
        );
    }

    let response = fx
        .send(MediaRequest::get("/Folders?$orderby=Name desc&$top=2&$count=true"))
        .await;
    assert_eq!(response.status, 200);
    let feed = json(&response);
    assert_eq!(feed["__count"], 3);
    let names: Vec<&str> = feed["results"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["Name"].as_str())
        .collect();
    assert_eq!(names, ["pets", "bee"]);

    let photos = fx.send(MediaRequest::get("/Folders(10)/Photos")).await;
    assert_eq!(json(&photos)["results"].as_array().map(Vec::len), Some(1));
    assert_eq!(fx.recorder.log(), GET_MLE);
}

#[tokio::test]
async fn links_can_be_read_and_replaced() {
    let fx = Fixture::new();

    let link = fx.send(MediaRequest::get("/Photos(1)/Folder/$ref")).await;
    assert_eq!(json(&link)["uri"], "http://localhost/Folders(10)");
    assert_eq!(fx.recorder.created(), 0);

    let folder = fx
        .send(MediaRequest::post("/Folders").json(&json!({ "ID": 11, "Name": "new" })))
        .await;
    assert_eq!(folder.status, 201);
    assert_eq!(folder.header("location"), Some("http://localhost/Folders(11)"));

    let moved = fx
        .send(
            MediaRequest::put("/Photos(1)/Folder/$ref")
                .json(&json!({ "uri": "http://localhost/Folders(11)" })),
        )
        .await;
    assert_eq!(moved.status, 204);

    let link = fx.send(MediaRequest::get("/Photos(1)/Folder/$ref")).await;
    assert_eq!(json(&link)["uri"], "http://localhost/Folders(11)");

    let dangling = fx
        .send(
            MediaRequest::put("/Photos(1)/Folder/$ref")
                .json(&json!({ "uri": "http://localhost/Folders(99)" })),
        )
        .await;
    assert_eq!(dangling.status, 404);
}

#[tokio::test]
async fn implicit_changesets_wrap_single_writes() {
    let fx = Fixture::new();

    let read = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(read.status, 200);
    assert_eq!(fx.stages.count(PipelineStage::ProcessingRequest), 1);
    assert_eq!(fx.stages.count(PipelineStage::ProcessingChangeset), 0);

    let write = fx
        .send(
            MediaRequest::put("/Photos(1)/$value")
                .header("content-type", "text/plain")
                .body("x"),
        )
        .await;
    assert_eq!(write.status, 204);
    assert_eq!(fx.stages.count(PipelineStage::ProcessingRequest), 2);
    assert_eq!(fx.stages.count(PipelineStage::ProcessedRequest), 2);
    assert_eq!(fx.stages.count(PipelineStage::ProcessingChangeset), 1);
    assert_eq!(fx.stages.count(PipelineStage::ProcessedChangeset), 1);

    // a failed write rolls its changeset back
    fx.overrides(|o| o.fail_on = Some(ProviderCall::GetStreamETag));
    let rejected = fx
        .send(
            MediaRequest::put("/Photos(1)/$value")
                .header("content-type", "text/plain")
                .body("lost"),
        )
        .await;
    assert_eq!(rejected.status, 500);
    fx.factory.clear_overrides();
    let read = fx.send(MediaRequest::get("/Photos(1)/$value")).await;
    assert_eq!(body_text(read).await, "x");
}

#[tokio::test]
async fn absolute_and_relative_targets_are_media_operations() {
    let fx = Fixture::new();
    let engine = &fx.engine;

    assert!(engine.is_media_operation("/Photos(1)/$value", &Method::GET));
    assert!(engine.is_media_operation("http://localhost/Photos(1)", &Method::GET));
    assert!(engine.is_media_operation("/Photos", &Method::POST));
    assert!(!engine.is_media_operation("/Folders(10)", &Method::GET));
    assert!(!engine.is_media_operation("/Unknown(1)", &Method::GET));

    let absolute = fx.send(MediaRequest::get("http://localhost/Photos(1)/$value")).await;
    assert_eq!(absolute.status, 200);
}

/// Memory streams whose publish step always fails, in `prepare` or `commit`.
struct RefusingStreams {
    store: MemoryStreamStore,
    refuse_prepare: bool,
}

#[async_trait::async_trait]
impl ChangesetParticipant for RefusingStreams {
    fn participant_name(&self) -> &'static str {
        "refusing-streams"
    }

    async fn prepare(&self, _changeset: ChangesetId) -> anyhow::Result<()> {
        if self.refuse_prepare {
            anyhow::bail!("stream volume is full");
        }
        Ok(())
    }

    async fn commit(&self, _changeset: ChangesetId) -> anyhow::Result<()> {
        anyhow::bail!("stream volume is full")
    }

    async fn rollback(&self, changeset: ChangesetId) {
        self.store.rollback(changeset).await;
    }
}

struct RefusingFactory {
    inner: StoreProviderFactory<MemoryStreamStore>,
    participant: Arc<RefusingStreams>,
}

impl StreamProviderFactory for RefusingFactory {
    fn create(&self) -> Box<dyn StreamProvider> {
        self.inner.create()
    }

    fn participant(&self) -> Option<Arc<dyn ChangesetParticipant>> {
        Some(self.participant.clone())
    }
}

#[tokio::test]
async fn a_stream_store_that_cannot_publish_leaves_entities_unchanged() {
    for refuse_prepare in [true, false] {
        let entities = common::seeded_entities();
        let store = MemoryStreamStore::new();
        let factory = RefusingFactory {
            inner: StoreProviderFactory::new(store.clone()).with_type("Clips", "Demo.Clip"),
            participant: Arc::new(RefusingStreams {
                store: store.clone(),
                refuse_prepare,
            }),
        };
        let engine = common::engine_with(&entities, Arc::new(factory), &StageCounter::new());

        let created = engine
            .dispatch(
                MediaRequest::post("/Clips")
                    .header("content-type", "application/octet-stream")
                    .header("slug", "7")
                    .body(vec![1u8, 2, 3]),
            )
            .await;
        assert_eq!(created.status, 500, "refuse_prepare = {refuse_prepare}");
        assert!(message(&created).contains("stream volume is full"));
        assert!(!entities.contains("Clips", &EntityKey::Int(7)));
        assert!(!store.exists("Clips", &EntityKey::Int(7)));
        assert_eq!(engine.dispatch(MediaRequest::get("/Clips(7)")).await.status, 404);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_keep_their_own_provider_instances() {
    let fx = Fixture::new();
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..24 {
        let engine = fx.engine.clone();
        tasks.spawn(async move {
            let response = engine.dispatch(MediaRequest::get("/Photos(1)/$value")).await;
            (i, response.status, body_text(response).await)
        });
    }
    for i in 0..8 {
        let engine = fx.engine.clone();
        tasks.spawn(async move {
            let response = engine
                .dispatch(
                    MediaRequest::post("/Clips")
                        .header("content-type", "application/octet-stream")
                        .header("slug", &(100 + i).to_string())
                        .body(vec![i as u8; 64]),
                )
                .await;
            (100 + i, response.status, String::new())
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let (i, status, body) = joined.unwrap();
        if i < 100 {
            assert_eq!((status, body.as_str()), (200, "hello world"), "read {i}");
        } else {
            assert_eq!(status, 201, "create {i}");
        }
    }

    fx.assert_no_leaks();
    let sequences: Vec<String> = fx
        .recorder
        .instances()
        .into_iter()
        .map(|instance| {
            fx.recorder
                .calls_for(instance)
                .iter()
                .map(|call| call.to_string())
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect();
    let reads = sequences.iter().filter(|seq| seq.as_str() == GET_MR).count();
    let writes = sequences
        .iter()
        .filter(|seq| seq.as_str() == "ResolveType,GetWriteStream,Dispose")
        .count();
    let descriptions = sequences.iter().filter(|seq| seq.as_str() == GET_MLE).count();
    assert_eq!((reads, writes, descriptions), (24, 8, 8), "{sequences:?}");
    for i in 0..8 {
        assert!(fx.entities.contains("Clips", &EntityKey::Int(100 + i)));
        assert!(fx.streams.exists("Clips", &EntityKey::Int(100 + i)));
    }
}

#[tokio::test]
async fn structured_bodies_over_the_entry_limit_are_refused() {
    let entities = common::seeded_entities();
    let engine = MediaEngine::builder()
        .model(common::model())
        .entities(Arc::new(entities.clone()))
        .streams(Arc::new(StoreProviderFactory::new(MemoryStreamStore::new())))
        .config(EngineConfig::default().with_max_entry_bytes(32))
        .build()
        .unwrap();

    let padded = json!({ "ID": 12, "Name": "x".repeat(64) });
    let refused = engine.dispatch(MediaRequest::post("/Folders").json(&padded)).await;
    assert_eq!(refused.status, 400);
    assert_eq!(
        message(&refused),
        "The request body exceeds the limit of 32 bytes for structured payloads."
    );
    assert!(!entities.contains("Folders", &EntityKey::Int(12)));

    let fits = engine
        .dispatch(MediaRequest::post("/Folders").json(&json!({ "ID": 12 })))
        .await;
    assert_eq!(fits.status, 201);
}
