//! Messages carried by pipeline topics.
//!
//! `Message` is a closed set: every topic is bound to exactly one
//! `MessageKind`, and publishing any other variant is a contract violation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::PipelineConfig;
use crate::{CameraGroupId, CameraId, FrameNumber, TrackerName};

pub type PointId = String;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2d {
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Per-camera, per-frame tracker output (image coordinates, pixels).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub points: BTreeMap<PointId, Point2d>,
    pub confidence: Option<f32>,
}

impl Observation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_point(mut self, id: impl Into<PointId>, x: f64, y: f64) -> Self {
        self.points.insert(id.into(), Point2d { x, y });
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessFrameNumberMessage {
    pub frame_number: FrameNumber,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdateMessage {
    pub config: PipelineConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraObservationMessage {
    pub camera_id: CameraId,
    pub frame_number: FrameNumber,
    pub tracker_name: TrackerName,
    pub observation: Observation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregatedFrameMessage {
    pub frame_number: FrameNumber,
    pub camera_group_id: CameraGroupId,
    pub tracker_name: TrackerName,
    pub tracked_points: BTreeMap<PointId, Point3d>,
    /// Observations that formed this join, keyed by camera.
    pub camera_observations: BTreeMap<CameraId, Observation>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShouldCalibrateMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    ProcessFrameNumber,
    ConfigUpdate,
    CameraObservation,
    AggregatedFrame,
    ShouldCalibrate,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::ProcessFrameNumber,
        MessageKind::ConfigUpdate,
        MessageKind::CameraObservation,
        MessageKind::AggregatedFrame,
        MessageKind::ShouldCalibrate,
    ];

    pub fn topic_name(self) -> &'static str {
        match self {
            MessageKind::ProcessFrameNumber => "process_frame_number",
            MessageKind::ConfigUpdate => "config_update",
            MessageKind::CameraObservation => "camera_observation",
            MessageKind::AggregatedFrame => "aggregated_frame",
            MessageKind::ShouldCalibrate => "should_calibrate",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    ProcessFrameNumber(ProcessFrameNumberMessage),
    ConfigUpdate(ConfigUpdateMessage),
    CameraObservation(CameraObservationMessage),
    AggregatedFrame(AggregatedFrameMessage),
    ShouldCalibrate(ShouldCalibrateMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ProcessFrameNumber(_) => MessageKind::ProcessFrameNumber,
            Message::ConfigUpdate(_) => MessageKind::ConfigUpdate,
            Message::CameraObservation(_) => MessageKind::CameraObservation,
            Message::AggregatedFrame(_) => MessageKind::AggregatedFrame,
            Message::ShouldCalibrate(_) => MessageKind::ShouldCalibrate,
        }
    }
}

/// A concrete message type bound to one `Message` variant.
pub trait TopicMessage: Clone + Into<Message> {
    const KIND: MessageKind;

    fn from_message(message: &Message) -> Option<&Self>;
}

macro_rules! topic_message {
    ($ty:ident, $variant:ident) => {
        impl From<$ty> for Message {
            fn from(message: $ty) -> Self {
                Message::$variant(message)
            }
        }

        impl TopicMessage for $ty {
            const KIND: MessageKind = MessageKind::$variant;

            fn from_message(message: &Message) -> Option<&Self> {
                match message {
                    Message::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

topic_message!(ProcessFrameNumberMessage, ProcessFrameNumber);
topic_message!(ConfigUpdateMessage, ConfigUpdate);
topic_message!(CameraObservationMessage, CameraObservation);
topic_message!(AggregatedFrameMessage, AggregatedFrame);
topic_message!(ShouldCalibrateMessage, ShouldCalibrate);
