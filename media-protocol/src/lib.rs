//! # media-protocol: the media resource protocol engine
//!
//! Sits between an HTTP front end and a pluggable [`StreamProvider`](media_blob::StreamProvider).
//! One logical entity is exposed twice: its structured entry at `Set(key)` and
//! its media resource at `Set(key)/$value`.
//!
//! ```text
//! MediaRequest ─► Classifier ─► negotiation / preconditions ─► provider hooks ─► MediaResponse
//!                                                                    │
//!                                              changeset commit ◄────┘
//! ```
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use media_blob::{MemoryStreamStore, StoreProviderFactory};
//! use media_protocol::prelude::*;
//!
//! # async fn run() -> media_core::MediaResult<()> {
//! let model = MediaModel::builder()
//!     .entity_type(EntityType::new("Demo.Photo", "ID").with_stream())
//!     .entity_set(EntitySet::new("Photos", "Demo.Photo"))
//!     .build()?;
//! let engine = MediaEngine::builder()
//!     .model(model)
//!     .entities(Arc::new(MemoryEntityStore::new()))
//!     .streams(Arc::new(StoreProviderFactory::new(MemoryStreamStore::new()).with_type("Photos", "Demo.Photo")))
//!     .build()?;
//!
//! let created = engine
//!     .dispatch(MediaRequest::post("/Photos").header("content-type", "text/plain").body("hello"))
//!     .await;
//! assert_eq!(created.status, 201);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod entities;
pub mod etag;
pub mod model;
pub mod negotiation;
pub mod payload;
pub mod request;
pub mod response;

pub use batch::{BatchPart, BatchPartResponse, BatchRequest, BatchResponse, ChangesetOperation};
pub use classifier::{
    Classifier, ContentIds, EntityRef, MediaOperation, OperationKind, OrderBy, PathRoot, PathTarget,
    QueryOptions, ResourcePath,
};
pub use config::EngineConfig;
pub use engine::{MediaEngine, MediaEngineBuilder};
pub use entities::{EntityRecord, EntityStore, MemoryEntityStore};
pub use etag::{concurrency_etag, parse_provider_etag, EntityTag, EntityTagCondition, EtagFormatError};
pub use model::{
    EntitySet, EntitySetRight, EntitySetRights, EntityType, MediaModel, ModelBuilder, NavigationProperty,
    ResolvedType,
};
pub use negotiation::{
    negotiate_entry, resolve_provider_content_type, resolve_request_content_type, Accept, AcceptItem, MediaType,
    ENTRY_FORMAT,
};
pub use payload::{entry_etag, EntryWriter, ExpandTree, StreamInfo};
pub use request::{MediaRequest, RequestBody};
pub use response::{MediaResponse, OperationState, ResponseBody};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BatchRequest, ChangesetOperation, EngineConfig, EntityRecord, EntitySet, EntitySetRights, EntityStore,
        EntityType, MediaEngine, MediaModel, MediaRequest, MediaResponse, MemoryEntityStore, NavigationProperty,
    };
}
