use anyhow::Result;

use crate::frame::FrameView;
use crate::message::Observation;
use crate::FrameNumber;

/// Per-camera tracker run by a camera worker on each requested frame.
///
/// # Liveness
///
/// Workers only observe shutdown between calls. A `process` call that never
/// returns keeps its worker alive indefinitely; `stop()` on that worker will
/// block. Implementations must return in bounded time.
///
/// A panic inside `process` ends only the worker running this tracker; its
/// handle reports `WorkerState::Failed` and the rest of the pipeline keeps running.
pub trait FrameTracker: Send {
    /// Name carried on every observation this tracker produces.
    fn name(&self) -> &'static str;

    /// Process one frame. `Ok(None)` means nothing was found.
    ///
    /// The frame is read-only. An `Err` is treated as a transient failure for
    /// this frame only.
    fn process(
        &mut self,
        frame_number: FrameNumber,
        frame: &FrameView<'_>,
    ) -> Result<Option<Observation>>;
}
