pub mod bright_spot;
pub mod motion;

pub use bright_spot::BrightSpotTracker;
pub use motion::MotionTracker;
