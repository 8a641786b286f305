use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::frame::{RawFrame, SharedFrameRing};
use crate::worker::WorkerHandle;
use crate::{CameraId, FrameNumber};

const BACKGROUND: u8 = 32;
const SPOT_VALUE: u8 = 255;
const SPOT_RADIUS: i64 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub camera_ids: Vec<CameraId>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl SyntheticConfig {
    pub fn new<I, S>(camera_ids: I, width: u32, height: u32, fps: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CameraId>,
    {
        Self {
            camera_ids: camera_ids.into_iter().map(Into::into).collect(),
            width,
            height,
            fps,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.camera_ids.is_empty() {
            return Err(anyhow!("synthetic capture needs at least one camera"));
        }
        if self.width < 8 || self.height < 8 {
            return Err(anyhow!(
                "synthetic frames must be at least 8x8, got {}x{}",
                self.width,
                self.height
            ));
        }
        if self.fps == 0 {
            return Err(anyhow!("synthetic capture fps must be greater than zero"));
        }
        Ok(())
    }
}

/// Deterministic scene: one bright spot per camera, drifting across the
/// image, seen from a slightly different offset by each camera.
pub struct SyntheticSource {
    config: SyntheticConfig,
    next_frame: FrameNumber,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            next_frame: 0,
        })
    }

    /// Spot centre for one camera at one frame.
    pub fn spot_position(&self, camera_index: usize, frame_number: FrameNumber) -> (u32, u32) {
        let span_x = u64::from(self.config.width - 8);
        let span_y = u64::from(self.config.height - 8);
        let x = (frame_number * 2 + camera_index as u64 * 3) % span_x + 4;
        let y = (frame_number + camera_index as u64 * 5) % span_y + 4;
        (x as u32, y as u32)
    }

    pub fn next_multiframe(&mut self) -> Result<(FrameNumber, Vec<RawFrame>)> {
        let frame_number = self.next_frame;
        self.next_frame += 1;
        let frames = self
            .config
            .camera_ids
            .iter()
            .enumerate()
            .map(|(index, camera_id)| {
                let (x, y) = self.spot_position(index, frame_number);
                render_spot_frame(
                    camera_id,
                    frame_number,
                    self.config.width,
                    self.config.height,
                    x,
                    y,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((frame_number, frames))
    }
}

/// Dark RGB frame with a bright disc centred at `(x, y)`.
pub fn render_spot_frame(
    camera_id: &str,
    frame_number: FrameNumber,
    width: u32,
    height: u32,
    x: u32,
    y: u32,
) -> Result<RawFrame> {
    let mut pixels = vec![BACKGROUND; width as usize * height as usize * 3];
    for dy in -SPOT_RADIUS..=SPOT_RADIUS {
        for dx in -SPOT_RADIUS..=SPOT_RADIUS {
            if dx * dx + dy * dy > SPOT_RADIUS * SPOT_RADIUS {
                continue;
            }
            let (px, py) = (i64::from(x) + dx, i64::from(y) + dy);
            if px < 0 || py < 0 || px >= i64::from(width) || py >= i64::from(height) {
                continue;
            }
            let offset = (py as usize * width as usize + px as usize) * 3;
            pixels[offset..offset + 3].fill(SPOT_VALUE);
        }
    }
    RawFrame::new(camera_id, frame_number, width, height, 3, pixels)
}

/// Background thread feeding a `SyntheticSource` into a ring at a fixed rate.
pub struct SyntheticCapture {
    handle: WorkerHandle,
    written: Arc<AtomicU64>,
}

impl SyntheticCapture {
    pub fn start(config: SyntheticConfig, ring: Arc<SharedFrameRing>) -> Result<Self> {
        let period = Duration::from_secs(1) / config.fps.max(1);
        let mut source = SyntheticSource::new(config)?;
        let mut handle = WorkerHandle::new("synthetic-capture");
        let stop = handle.stop_flag();
        let written = Arc::new(AtomicU64::new(0));
        let counter = written.clone();
        handle.spawn(move || {
            log::info!("synthetic capture running at one frame every {:?}", period);
            let mut next_tick = Instant::now();
            while !stop.is_killed() {
                let (frame_number, frames) = source.next_multiframe()?;
                ring.write_multiframe(frame_number, frames)?;
                counter.store(frame_number + 1, Ordering::Release);
                next_tick += period;
                let now = Instant::now();
                if next_tick > now {
                    std::thread::sleep(next_tick - now);
                } else {
                    // Fell behind; do not try to catch up.
                    next_tick = now;
                }
            }
            Ok(())
        })?;
        Ok(Self { handle, written })
    }

    pub fn frames_written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) -> Result<()> {
        self.handle.stop()
    }

    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }
}
