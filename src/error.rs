//! Typed contract violations.
//!
//! Most fallible paths in the crate return `anyhow::Result`. The variants here
//! are the ones callers need to tell apart: contract violations that end a
//! worker, and the topic/registry failures tests assert on.

use thiserror::Error;

use crate::message::MessageKind;
use crate::{CameraId, FrameNumber, PipelineId, TrackerName};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("conformance: topic {topic} accepts {expected:?} messages, got {actual:?}")]
    TypeMismatch {
        topic: &'static str,
        expected: MessageKind,
        actual: MessageKind,
    },

    #[error("conformance: subscription to {topic} yielded foreign message {actual:?}")]
    UnexpectedMessage {
        topic: &'static str,
        actual: MessageKind,
    },

    #[error("topic {0} is closed")]
    TopicClosed(&'static str),

    #[error("conformance: camera {camera_id} is not a member of group {camera_ids:?}")]
    UnknownCamera {
        camera_id: CameraId,
        camera_ids: Vec<CameraId>,
    },

    #[error("conformance: tracker {tracker_name} slot holds {actual} cameras, group has {expected}")]
    CameraCountMismatch {
        tracker_name: TrackerName,
        expected: usize,
        actual: usize,
    },

    #[error("frame number mismatch for {context}: expected {expected}, got {actual:?}")]
    FrameMismatch {
        context: String,
        expected: FrameNumber,
        actual: Vec<FrameNumber>,
    },

    #[error("pipeline id {0} already has a live context")]
    PipelineIdInUse(PipelineId),

    #[error("frame {frame_number} for camera {camera_id} is not available: {reason}")]
    FrameUnavailable {
        camera_id: CameraId,
        frame_number: FrameNumber,
        reason: &'static str,
    },

    #[error("conformance: {kind} id {id:?} must match ^[A-Za-z0-9_-]{{1,64}}$")]
    InvalidId { kind: &'static str, id: String },
}

impl PipelineError {
    /// Contract violations end the worker that detects them.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            PipelineError::TypeMismatch { .. }
                | PipelineError::UnexpectedMessage { .. }
                | PipelineError::UnknownCamera { .. }
                | PipelineError::CameraCountMismatch { .. }
                | PipelineError::FrameMismatch { .. }
        )
    }
}
