use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::changeset::ChangesetId;

/// When in the request pipeline a hook is running.
///
/// Request stages fire once per inbound HTTP exchange (a whole batch counts as
/// one exchange). Changeset stages fire once per changeset, including the
/// implicit changeset wrapped around every non-batch write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    ProcessingRequest,
    ProcessedRequest,
    ProcessingChangeset,
    ProcessedChangeset,
}

/// Context passed to pipeline hooks.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub is_batch: bool,
    pub changeset: Option<ChangesetId>,
    /// Final status, only set for the `Processed*` stages.
    pub status: Option<u16>,
}

impl PipelineContext {
    pub fn new(request_id: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            method: method.into(),
            path: path.into(),
            is_batch: false,
            changeset: None,
            status: None,
        }
    }

    pub fn batch(mut self) -> Self {
        self.is_batch = true;
        self
    }

    pub fn with_changeset(mut self, changeset: ChangesetId) -> Self {
        self.changeset = Some(changeset);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Interceptor hook for the processing pipeline.
#[async_trait::async_trait]
pub trait PipelineHook: Send + Sync {
    async fn run(&self, stage: PipelineStage, ctx: &PipelineContext) -> Result<()>;
}

/// Ordered set of pipeline hooks.
#[derive(Clone, Default)]
pub struct PipelineHooks {
    hooks: Vec<Arc<dyn PipelineHook>>,
}

impl PipelineHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Arc<dyn PipelineHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook in registration order, stopping at the first failure.
    pub async fn run(&self, stage: PipelineStage, ctx: &PipelineContext) -> Result<()> {
        for hook in &self.hooks {
            hook.run(stage, ctx).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PipelineHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHooks")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Hook that counts how often each stage fired.
#[derive(Debug, Default)]
pub struct StageCounter {
    processing_request: AtomicUsize,
    processed_request: AtomicUsize,
    processing_changeset: AtomicUsize,
    processed_changeset: AtomicUsize,
}

impl StageCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, stage: PipelineStage) -> usize {
        self.slot(stage).load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        for stage in [
            PipelineStage::ProcessingRequest,
            PipelineStage::ProcessedRequest,
            PipelineStage::ProcessingChangeset,
            PipelineStage::ProcessedChangeset,
        ] {
            self.slot(stage).store(0, Ordering::SeqCst);
        }
    }

    fn slot(&self, stage: PipelineStage) -> &AtomicUsize {
        match stage {
            PipelineStage::ProcessingRequest => &self.processing_request,
            PipelineStage::ProcessedRequest => &self.processed_request,
            PipelineStage::ProcessingChangeset => &self.processing_changeset,
            PipelineStage::ProcessedChangeset => &self.processed_changeset,
        }
    }
}

#[async_trait::async_trait]
impl PipelineHook for StageCounter {
    async fn run(&self, stage: PipelineStage, _ctx: &PipelineContext) -> Result<()> {
        self.slot(stage).fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Refuse;

    #[async_trait::async_trait]
    impl PipelineHook for Refuse {
        async fn run(&self, stage: PipelineStage, _ctx: &PipelineContext) -> Result<()> {
            if stage == PipelineStage::ProcessingChangeset {
                anyhow::bail!("changesets are closed");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn hooks_run_in_order_and_stop_on_failure() {
        let counter = StageCounter::new();
        let late = StageCounter::new();
        let mut hooks = PipelineHooks::new();
        hooks.push(counter.clone());
        hooks.push(Arc::new(Refuse));
        hooks.push(late.clone());

        let ctx = PipelineContext::new("req-1", "POST", "/Photos");
        hooks.run(PipelineStage::ProcessingRequest, &ctx).await.unwrap();
        assert!(hooks.run(PipelineStage::ProcessingChangeset, &ctx).await.is_err());

        assert_eq!(counter.count(PipelineStage::ProcessingRequest), 1);
        assert_eq!(counter.count(PipelineStage::ProcessingChangeset), 1);
        assert_eq!(late.count(PipelineStage::ProcessingRequest), 1);
        assert_eq!(late.count(PipelineStage::ProcessingChangeset), 0);
    }
}
