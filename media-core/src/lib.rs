//! media-core: transport-agnostic foundations for the media resource engine.
//!
//! - [`errors`]: status-code-bearing error taxonomy
//! - [`hooks`]: request and changeset interceptor pipeline
//! - [`changeset`]: changeset ids, participants, staged storage
//! - [`config`]: key/value configuration with environment overrides

pub mod changeset;
pub mod config;
pub mod errors;
pub mod hooks;

pub use changeset::{ChangesetId, ChangesetParticipant, StagedMap};
pub use config::{ConfigSnapshot, ConfigStore};
pub use errors::{ErrorKind, MediaError, MediaResult};
pub use hooks::{PipelineContext, PipelineHook, PipelineHooks, PipelineStage, StageCounter};
