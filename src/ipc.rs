//! Pipeline IPC context and layered shutdown flags.
//!
//! Shutdown is cooperative and layered: the process-wide flag is shared by
//! every pipeline in the application, the pipeline flag only by the workers of
//! one pipeline, and each worker additionally owns a stop flag. No flag can be
//! cleared once set.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::error::PipelineError;
use crate::topic::{TopicRegistry, DEFAULT_LOG_CAPACITY};
use crate::{validate_id, PipelineId};

/// Shared, set-once shutdown flag.
///
/// `kill()` stores with `Release` and `is_killed()` loads with `Acquire`, so
/// everything a thread wrote before killing is visible to a thread that
/// observes the flag.
#[derive(Clone, Debug, Default)]
pub struct KillFlag(Arc<AtomicBool>);

impl KillFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_killed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Topics and kill flags for one pipeline instance.
pub struct PipelineIpc {
    pipeline_id: PipelineId,
    topics: TopicRegistry,
    process_kill: KillFlag,
    pipeline_kill: KillFlag,
}

impl PipelineIpc {
    pub fn create(
        pipeline_id: impl Into<PipelineId>,
        process_kill: KillFlag,
        log_capacity: usize,
    ) -> anyhow::Result<Arc<Self>> {
        let pipeline_id = pipeline_id.into();
        validate_id("pipeline", &pipeline_id)?;
        log::debug!("creating ipc context for pipeline {}", pipeline_id);
        Ok(Arc::new(Self {
            pipeline_id,
            topics: TopicRegistry::create(log_capacity),
            process_kill,
            pipeline_kill: KillFlag::new(),
        }))
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }

    pub fn process_kill_flag(&self) -> &KillFlag {
        &self.process_kill
    }

    /// Polled by every worker loop. Never blocks.
    pub fn should_continue(&self) -> bool {
        !self.process_kill.is_killed() && !self.pipeline_kill.is_killed()
    }

    /// Stop this pipeline and close its topics. Idempotent.
    pub fn kill_pipeline(&self) {
        if !self.pipeline_kill.is_killed() {
            log::debug!("killing pipeline {}", self.pipeline_id);
        }
        self.pipeline_kill.kill();
        self.topics.close();
    }

    /// Stop this pipeline and every sibling sharing the process flag.
    pub fn kill_everything(&self) {
        log::info!(
            "pipeline {} requested shutdown of all pipelines",
            self.pipeline_id
        );
        self.process_kill.kill();
        self.kill_pipeline();
    }
}

/// Explicit registry of live pipeline contexts, keyed by pipeline id.
///
/// Owned by the orchestrating process; there is no module-level state.
pub struct PipelineRegistry {
    process_kill: KillFlag,
    log_capacity: usize,
    pipelines: Mutex<HashMap<PipelineId, Weak<PipelineIpc>>>,
}

impl PipelineRegistry {
    pub fn new(process_kill: KillFlag) -> Self {
        Self::with_log_capacity(process_kill, DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(process_kill: KillFlag, log_capacity: usize) -> Self {
        Self {
            process_kill,
            log_capacity,
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    pub fn process_kill_flag(&self) -> &KillFlag {
        &self.process_kill
    }

    /// Create the context for `pipeline_id`.
    ///
    /// Fails while another live (not killed, not dropped) context holds the id.
    pub fn create_pipeline(&self, pipeline_id: &str) -> anyhow::Result<Arc<PipelineIpc>> {
        self.create_pipeline_with_log_capacity(pipeline_id, self.log_capacity)
    }

    /// Same as `create_pipeline`, with a per-pipeline topic log capacity.
    pub fn create_pipeline_with_log_capacity(
        &self,
        pipeline_id: &str,
        log_capacity: usize,
    ) -> anyhow::Result<Arc<PipelineIpc>> {
        let mut pipelines = self.pipelines.lock();
        if let Some(existing) = pipelines.get(pipeline_id).and_then(Weak::upgrade) {
            if existing.should_continue() {
                return Err(PipelineError::PipelineIdInUse(pipeline_id.to_string()).into());
            }
        }
        let ipc = PipelineIpc::create(pipeline_id, self.process_kill.clone(), log_capacity)?;
        pipelines.insert(pipeline_id.to_string(), Arc::downgrade(&ipc));
        Ok(ipc)
    }

    pub fn get(&self, pipeline_id: &str) -> Option<Arc<PipelineIpc>> {
        self.pipelines.lock().get(pipeline_id).and_then(Weak::upgrade)
    }

    pub fn live_pipelines(&self) -> Vec<PipelineId> {
        let mut pipelines = self.pipelines.lock();
        pipelines.retain(|_, ipc| ipc.strong_count() > 0);
        let mut ids: Vec<_> = pipelines
            .iter()
            .filter(|(_, ipc)| ipc.upgrade().is_some_and(|ipc| ipc.should_continue()))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Kill every registered pipeline through the process-wide flag.
    pub fn kill_all(&self) {
        self.process_kill.kill();
        for ipc in self.pipelines.lock().values().filter_map(Weak::upgrade) {
            ipc.kill_pipeline();
        }
    }
}
