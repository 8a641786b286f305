//! Multi-camera realtime processing pipeline.
//!
//! This crate coordinates synchronized multi-camera video processing on a
//! single host:
//!
//! 1. **Camera workers** (one per camera) read the requested frame from the
//!    capture ring buffer and run the configured trackers on it.
//! 2. An **aggregation worker** (one per camera group) paces the pipeline by
//!    requesting the newest captured frame, and joins per-camera observations
//!    into one multi-camera record per frame and tracker.
//! 3. A **payload builder** joins raw frames, observations and aggregated
//!    records into a display payload exposed through a latest-value slot.
//!
//! Components only talk through kind-checked broadcast topics (`topic`),
//! polled without blocking. Pacing is drop-to-latest: frames the workers
//! cannot keep up with are never requested.
//!
//! # Module Structure
//!
//! - `topic`, `message`: broadcast channels and the closed message set
//! - `ipc`: per-pipeline context, layered kill flags, pipeline registry
//! - `frame`, `ingest`: ring-buffer contract, in-memory ring, synthetic capture
//! - `tracker`: per-camera tracker contract and built-in trackers
//! - `camera_worker`, `aggregation`, `payload`: the three pipeline stages
//! - `pipeline`: orchestrator wiring one camera group end to end

use anyhow::Result;
use std::sync::OnceLock;

pub mod aggregation;
pub mod camera_worker;
pub mod config;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod ipc;
pub mod message;
pub mod payload;
pub mod pipeline;
pub mod topic;
pub mod tracker;
mod worker;

pub use aggregation::{Accumulator, AggregationSettings, AggregationWorker};
pub use camera_worker::CameraWorker;
pub use config::{CameraConfig, FrameMismatchPolicy, PipelineConfig};
pub use error::PipelineError;
pub use frame::{FrameRing, FrameView, RawFrame, SharedFrameRing};
pub use ingest::{SyntheticCapture, SyntheticConfig};
pub use ipc::{KillFlag, PipelineIpc, PipelineRegistry};
pub use message::{
    AggregatedFrameMessage, CameraObservationMessage, ConfigUpdateMessage, Message, MessageKind,
    Observation, Point2d, Point3d, ProcessFrameNumberMessage, ShouldCalibrateMessage,
    TopicMessage,
};
pub use payload::{Payload, PayloadBuilder};
pub use pipeline::Pipeline;
pub use topic::{Subscription, Topic, TopicRegistry};
pub use tracker::{FrameTracker, TrackerConfig};
pub use worker::WorkerState;

pub type CameraId = String;
pub type CameraGroupId = String;
pub type PipelineId = String;
pub type TrackerName = String;
pub type FrameNumber = u64;

/// Camera, group and pipeline ids are short local identifiers.
///
/// Allowed: "0", "cam_left", "group-a"
/// Disallowed: empty, whitespace, slashes, anything over 64 characters.
pub fn validate_id(kind: &'static str, id: &str) -> Result<()> {
    static ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static id pattern compiles")
    });
    if !re.is_match(id) {
        return Err(PipelineError::InvalidId {
            kind,
            id: id.to_string(),
        }
        .into());
    }
    Ok(())
}
