use anyhow::{anyhow, Result};

use crate::frame::FrameView;
use crate::message::Observation;
use crate::tracker::backend::FrameTracker;
use crate::FrameNumber;

pub const BRIGHT_SPOT_POINT: &str = "bright_spot";

/// Centroid of all pixels at or above a luma threshold.
pub struct BrightSpotTracker {
    threshold: u8,
}

impl BrightSpotTracker {
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }
}

impl FrameTracker for BrightSpotTracker {
    fn name(&self) -> &'static str {
        "bright_spot"
    }

    fn process(
        &mut self,
        _frame_number: FrameNumber,
        frame: &FrameView<'_>,
    ) -> Result<Option<Observation>> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(anyhow!("camera {} delivered an empty frame", frame.camera_id()));
        }
        let (mut sum_x, mut sum_y, mut count) = (0u64, 0u64, 0u64);
        for y in 0..frame.height() {
            for x in 0..frame.width() {
                if frame.luma(x, y) >= self.threshold {
                    sum_x += x as u64;
                    sum_y += y as u64;
                    count += 1;
                }
            }
        }
        if count == 0 {
            return Ok(None);
        }
        let coverage = count as f64 / (frame.width() as f64 * frame.height() as f64);
        Ok(Some(
            Observation::new()
                .with_point(
                    BRIGHT_SPOT_POINT,
                    sum_x as f64 / count as f64,
                    sum_y as f64 / count as f64,
                )
                .with_confidence((1.0 - coverage) as f32),
        ))
    }
}
