//! Thread lifecycle shared by the pipeline workers.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::PipelineError;
use crate::ipc::KillFlag;
use crate::message::TopicMessage;
use crate::topic::TopicRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
    Stopped,
    /// The worker ended on an error (typically a contract violation).
    Failed,
}

/// Owns one worker thread plus the worker's own stop flag.
pub(crate) struct WorkerHandle {
    name: String,
    state: Arc<Mutex<WorkerState>>,
    stop: KillFlag,
    join: Option<JoinHandle<Result<()>>>,
}

impl WorkerHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(WorkerState::Idle)),
            stop: KillFlag::new(),
            join: None,
        }
    }

    pub fn stop_flag(&self) -> KillFlag {
        self.stop.clone()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn is_alive(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    pub fn spawn<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if *state != WorkerState::Idle {
                return Err(anyhow!("{} already started ({:?})", self.name, *state));
            }
            *state = WorkerState::Running;
        }
        let state = self.state.clone();
        let name = self.name.clone();
        let join = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(body))
                    .unwrap_or_else(|_| Err(anyhow!("{} panicked", name)));
                match &result {
                    Ok(()) => {
                        *state.lock() = WorkerState::Stopped;
                        log::debug!("{} exited", name);
                    }
                    Err(err) => {
                        *state.lock() = WorkerState::Failed;
                        log::error!("{} terminated: {:#}", name, err);
                    }
                }
                result
            })?;
        self.join = Some(join);
        Ok(())
    }

    /// Set the stop flag and wait for the thread to exit on its own.
    ///
    /// Returns the error the worker ended with, if any.
    pub fn stop(&mut self) -> Result<()> {
        let Some(join) = self.join.take() else {
            let mut state = self.state.lock();
            if *state == WorkerState::Idle {
                *state = WorkerState::Stopped;
            }
            return Ok(());
        };
        {
            let mut state = self.state.lock();
            if *state == WorkerState::Running {
                *state = WorkerState::Stopping;
            }
        }
        self.stop.kill();
        join.join()
            .map_err(|_| anyhow!("{} thread panicked", self.name))?
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            let _ = self.stop();
        }
    }
}

/// Publish, treating a closed topic as "pipeline is shutting down".
///
/// Returns `Ok(false)` when the topic was closed.
pub(crate) fn publish<M: TopicMessage>(topics: &TopicRegistry, message: M) -> Result<bool> {
    match topics.publish_typed(message) {
        Ok(()) => Ok(true),
        Err(PipelineError::TopicClosed(topic)) => {
            log::debug!("topic {} closed, dropping message", topic);
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}
