//! Frame ingestion sources.
//!
//! Sources write synchronized multi-camera frames into a `SharedFrameRing`,
//! the only writer path of the ring. The pipeline itself only ever reads.

mod synthetic;

pub use synthetic::{render_spot_frame, SyntheticCapture, SyntheticConfig, SyntheticSource};
