use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::frame::FrameView;
use crate::message::Observation;
use crate::tracker::backend::FrameTracker;
use crate::FrameNumber;

pub const MOTION_POINT: &str = "motion";

/// Frame differencing via content hash. Reports the frame centre on change.
#[derive(Default)]
pub struct MotionTracker {
    last_hash: Option<[u8; 32]>,
}

impl MotionTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameTracker for MotionTracker {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn process(
        &mut self,
        _frame_number: FrameNumber,
        frame: &FrameView<'_>,
    ) -> Result<Option<Observation>> {
        let current_hash: [u8; 32] = Sha256::digest(frame.pixels()).into();

        let motion = self.last_hash.is_some_and(|prev| prev != current_hash);

        self.last_hash = Some(current_hash);

        if !motion {
            return Ok(None);
        }
        Ok(Some(
            Observation::new()
                .with_point(
                    MOTION_POINT,
                    frame.width() as f64 / 2.0,
                    frame.height() as f64 / 2.0,
                )
                .with_confidence(0.85),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawFrame;

    #[test]
    fn motion_tracker_detects_change() {
        let mut tracker = MotionTracker::new();
        let a = RawFrame::new("0", 0, 2, 2, 1, vec![1, 2, 3, 4]).unwrap();
        let b = RawFrame::new("0", 1, 2, 2, 1, vec![4, 3, 2, 1]).unwrap();

        // First frame: nothing to compare against
        assert!(tracker.process(0, &a.view()).unwrap().is_none());

        // Different content = motion
        let obs = tracker.process(1, &b.view()).unwrap().unwrap();
        assert_eq!(obs.points[MOTION_POINT].x, 1.0);
        assert_eq!(obs.confidence, Some(0.85));

        // Same as previous = no motion
        assert!(tracker.process(2, &b.view()).unwrap().is_none());
    }
}
