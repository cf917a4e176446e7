//! # media-blob: the stream provider interface and reference stores
//!
//! A media resource is the binary half of a media link entry. The engine never
//! touches bytes itself; it drives a [`StreamProvider`] through a fixed hook
//! sequence per operation and hands the bytes through.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │   media engine       │  ← classification, negotiation, preconditions
//! ├──────────────────────┤
//! │   StreamProvider     │  ← one instance per exchange, disposed exactly once
//! ├──────────────────────┤
//! │   StreamStore        │  ← storage primitives, staged per changeset
//! └──────────────────────┘
//! ```
//!
//! [`StoreProviderFactory`] turns any [`StreamStore`] into a provider factory.
//! Wrap a factory in a [`RecordingFactory`] to observe hook order and leaks.
//!
//! ```rust
//! use media_blob::prelude::*;
//!
//! let store = MemoryStreamStore::new();
//! store.seed("Photos", EntityKey::Int(1), &b"hello"[..], "text/plain");
//!
//! let factory = RecordingFactory::new(StoreProviderFactory::new(store).with_type("Photos", "Demo.Photo"));
//! let recorder = factory.recorder();
//! assert_eq!(recorder.created(), 0);
//! ```

mod error;
pub mod file;
pub mod large;
pub mod memory;
pub mod provider;
pub mod recording;
pub mod store;
mod store_provider;
mod types;

pub use error::{ProviderError, ProviderResult};
pub use file::FileStreamStore;
pub use large::{matches_pattern, pattern_byte, pattern_stream, LargeEntry, LargeStreamStore};
pub use memory::{MemoryStreamStore, StoredStream};
pub use provider::{
    LazyProvider, ProviderCall, ProviderLease, StreamProvider, StreamProviderFactory,
};
pub use recording::{CallRecord, CallRecorder, RecordingFactory, RecordingProvider};
pub use store::{StreamHead, StreamKey, StreamStore};
pub use store_provider::{StoreProviderFactory, StoreStreamProvider, StreamOverrides};
pub use types::{ByteStream, EntityKey, MediaEntity, StreamContext, WriteStream};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ByteStream, CallRecorder, EntityKey, MediaEntity, MemoryStreamStore, ProviderCall,
        ProviderError, ProviderResult, RecordingFactory, StoreProviderFactory, StreamContext,
        StreamProvider, StreamProviderFactory, WriteStream,
    };
}
