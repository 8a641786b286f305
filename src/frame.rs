//! Raw frames and the capture ring-buffer contract.
//!
//! - `RawFrame`: one camera's image for one frame number. Pixels are private
//!   and shared immutably; cloning a frame never copies pixel data.
//! - `FrameView`: read-only view handed to trackers. Cannot mutate the frame.
//! - `FrameRing`: what the pipeline needs from the capture subsystem.
//! - `SharedFrameRing`: bounded in-memory ring per camera, written only by the
//!   capture side, read by every pipeline stage.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};

use crate::error::PipelineError;
use crate::{CameraId, FrameNumber};

/// Default number of slots kept per camera.
/// At 30 fps, 300 slots = 10 seconds.
pub const DEFAULT_RING_CAPACITY: usize = 300;

// ----------------------------------------------------------------------------
// RawFrame
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct RawFrame {
    data: Arc<[u8]>,
    pub camera_id: CameraId,
    pub frame_number: FrameNumber,
    pub width: u32,
    pub height: u32,
    /// 1 (gray) or 3 (RGB).
    pub channels: u8,
    captured_at: Instant,
}

impl RawFrame {
    pub fn new(
        camera_id: impl Into<CameraId>,
        frame_number: FrameNumber,
        width: u32,
        height: u32,
        channels: u8,
        data: Vec<u8>,
    ) -> Result<Self> {
        if channels != 1 && channels != 3 {
            return Err(anyhow!("unsupported channel count {}", channels));
        }
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(anyhow!(
                "frame buffer holds {} bytes, {}x{}x{} needs {}",
                data.len(),
                width,
                height,
                channels,
                expected
            ));
        }
        Ok(Self {
            data: data.into(),
            camera_id: camera_id.into(),
            frame_number,
            width,
            height,
            channels,
            captured_at: Instant::now(),
        })
    }

    /// Read-only view for trackers.
    pub fn view(&self) -> FrameView<'_> {
        FrameView { frame: self }
    }

    /// Owned copy of the pixels, for annotation.
    pub fn to_pixels(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn age_ms(&self) -> u128 {
        self.captured_at.elapsed().as_millis()
    }
}

// ----------------------------------------------------------------------------
// FrameView
// ----------------------------------------------------------------------------

/// Restricted view of a frame. Exposes pixels as `&[u8]` only.
pub struct FrameView<'a> {
    frame: &'a RawFrame,
}

impl<'a> FrameView<'a> {
    pub fn camera_id(&self) -> &str {
        &self.frame.camera_id
    }

    pub fn frame_number(&self) -> FrameNumber {
        self.frame.frame_number
    }

    pub fn width(&self) -> u32 {
        self.frame.width
    }

    pub fn height(&self) -> u32 {
        self.frame.height
    }

    pub fn channels(&self) -> u8 {
        self.frame.channels
    }

    pub fn pixels(&self) -> &'a [u8] {
        &self.frame.data
    }

    /// Luma of pixel (x, y); RGB uses the Rec. 601 integer weights.
    pub fn luma(&self, x: u32, y: u32) -> u8 {
        let idx = (y as usize * self.frame.width as usize + x as usize)
            * self.frame.channels as usize;
        let px = &self.frame.data[idx..idx + self.frame.channels as usize];
        match px {
            [gray] => *gray,
            [r, g, b] => ((299 * *r as u32 + 587 * *g as u32 + 114 * *b as u32) / 1000) as u8,
            _ => 0,
        }
    }
}

// ----------------------------------------------------------------------------
// FrameRing contract
// ----------------------------------------------------------------------------

/// Capture ring buffer as seen by the pipeline. Read-only, never blocks.
pub trait FrameRing: Send + Sync {
    fn camera_ids(&self) -> Vec<CameraId>;

    /// Newest frame number written for every camera, `None` before the first.
    fn latest_produced_frame_number(&self) -> Option<FrameNumber>;

    /// Fails if the slot was not written yet or was already overwritten.
    fn read_frame(
        &self,
        camera_id: &str,
        frame_number: FrameNumber,
    ) -> std::result::Result<RawFrame, PipelineError>;
}

// ----------------------------------------------------------------------------
// SharedFrameRing
// ----------------------------------------------------------------------------

pub struct SharedFrameRing {
    capacity: usize,
    cameras: BTreeMap<CameraId, RwLock<Vec<Option<RawFrame>>>>,
    latest: AtomicI64,
}

impl SharedFrameRing {
    pub fn new<I, S>(camera_ids: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CameraId>,
    {
        let capacity = capacity.max(1);
        Self {
            capacity,
            cameras: camera_ids
                .into_iter()
                .map(|id| (id.into(), RwLock::new(vec![None; capacity])))
                .collect(),
            latest: AtomicI64::new(-1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store one synchronized frame for every camera, then publish it as latest.
    ///
    /// This is the only writer path. Frame numbers must increase.
    pub fn write_multiframe(&self, frame_number: FrameNumber, frames: Vec<RawFrame>) -> Result<()> {
        if let Some(latest) = self.latest_produced_frame_number() {
            if frame_number <= latest {
                return Err(anyhow!(
                    "frame {} is not newer than latest {}",
                    frame_number,
                    latest
                ));
            }
        }
        if frames.len() != self.cameras.len() {
            return Err(anyhow!(
                "multiframe {} has {} frames for {} cameras",
                frame_number,
                frames.len(),
                self.cameras.len()
            ));
        }
        let mut seen = BTreeSet::new();
        for frame in &frames {
            if !seen.insert(frame.camera_id.as_str()) {
                return Err(anyhow!(
                    "camera {} appears twice in multiframe {}",
                    frame.camera_id,
                    frame_number
                ));
            }
            if frame.frame_number != frame_number {
                return Err(anyhow!(
                    "camera {} frame number {} inside multiframe {}",
                    frame.camera_id,
                    frame.frame_number,
                    frame_number
                ));
            }
            if !self.cameras.contains_key(&frame.camera_id) {
                return Err(anyhow!(
                    "camera {} is not part of this ring",
                    frame.camera_id
                ));
            }
        }
        let slot = (frame_number % self.capacity as u64) as usize;
        for frame in frames {
            if let Some(ring) = self.cameras.get(&frame.camera_id) {
                ring.write()[slot] = Some(frame);
            }
        }
        self.latest.store(frame_number as i64, Ordering::Release);
        Ok(())
    }
}

impl FrameRing for SharedFrameRing {
    fn camera_ids(&self) -> Vec<CameraId> {
        self.cameras.keys().cloned().collect()
    }

    fn latest_produced_frame_number(&self) -> Option<FrameNumber> {
        let latest = self.latest.load(Ordering::Acquire);
        (latest >= 0).then_some(latest as FrameNumber)
    }

    fn read_frame(
        &self,
        camera_id: &str,
        frame_number: FrameNumber,
    ) -> std::result::Result<RawFrame, PipelineError> {
        let unavailable = |reason| PipelineError::FrameUnavailable {
            camera_id: camera_id.to_string(),
            frame_number,
            reason,
        };
        let ring = self
            .cameras
            .get(camera_id)
            .ok_or_else(|| unavailable("unknown camera"))?;
        match self.latest_produced_frame_number() {
            Some(latest) if frame_number <= latest => {}
            _ => return Err(unavailable("not yet written")),
        }
        let slot = (frame_number % self.capacity as u64) as usize;
        match &ring.read()[slot] {
            Some(frame) if frame.frame_number == frame_number => Ok(frame.clone()),
            _ => Err(unavailable("overwritten")),
        }
    }
}
