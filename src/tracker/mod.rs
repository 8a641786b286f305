//! Per-camera trackers.
//!
//! The tracker algorithm is a black box to the pipeline: camera workers only
//! call `FrameTracker::process` on a read-only frame view. Which trackers run
//! is chosen once per configuration through the closed `TrackerConfig` set.

mod backend;
mod backends;
mod registry;

use serde::{Deserialize, Serialize};

pub use backend::FrameTracker;
pub use backends::bright_spot::BRIGHT_SPOT_POINT;
pub use backends::motion::MOTION_POINT;
pub use backends::{BrightSpotTracker, MotionTracker};
pub use registry::TrackerSet;

const DEFAULT_BRIGHT_SPOT_THRESHOLD: u8 = 200;

fn default_bright_spot_threshold() -> u8 {
    DEFAULT_BRIGHT_SPOT_THRESHOLD
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackerConfig {
    BrightSpot {
        #[serde(default = "default_bright_spot_threshold")]
        threshold: u8,
    },
    Motion,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig::BrightSpot {
            threshold: DEFAULT_BRIGHT_SPOT_THRESHOLD,
        }
    }
}

impl TrackerConfig {
    pub fn build(&self) -> Box<dyn FrameTracker> {
        match self {
            TrackerConfig::BrightSpot { threshold } => Box::new(BrightSpotTracker::new(*threshold)),
            TrackerConfig::Motion => Box::new(MotionTracker::new()),
        }
    }
}
