//! Camera worker: one per camera.
//!
//! Polls for configuration updates and frame requests, reads the requested
//! frame from the ring buffer and publishes one `CameraObservationMessage` per
//! tracker that found something.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CameraConfig, PipelineConfig};
use crate::frame::FrameRing;
use crate::ipc::{KillFlag, PipelineIpc};
use crate::message::{
    CameraObservationMessage, ConfigUpdateMessage, MessageKind, ProcessFrameNumberMessage,
};
use crate::topic::Subscription;
use crate::tracker::TrackerSet;
use crate::worker::{publish, WorkerHandle, WorkerState};
use crate::{CameraId, FrameNumber};

pub struct CameraWorker {
    camera_id: CameraId,
    handle: WorkerHandle,
    runner: Option<CameraLoop>,
}

impl CameraWorker {
    /// Allocate the worker and its subscriptions. Must run before `start()`
    /// of any worker in the pipeline.
    pub fn create(
        camera_id: &str,
        config: &PipelineConfig,
        ring: Arc<dyn FrameRing>,
        ipc: Arc<PipelineIpc>,
    ) -> Result<Self> {
        let camera_config = config
            .cameras
            .get(camera_id)
            .cloned()
            .ok_or_else(|| anyhow!("camera {} is not configured", camera_id))?;
        let handle = WorkerHandle::new(format!("camera-worker-{}", camera_id));
        let topics = ipc.topics();
        let runner = CameraLoop {
            camera_id: camera_id.to_string(),
            trackers: TrackerSet::from_configs(&camera_config.trackers),
            camera_config,
            poll_interval: config.poll_interval(),
            frame_requests: topics.subscribe(MessageKind::ProcessFrameNumber)?,
            config_updates: topics.subscribe(MessageKind::ConfigUpdate)?,
            stop: handle.stop_flag(),
            ring,
            ipc,
        };
        Ok(Self {
            camera_id: camera_id.to_string(),
            handle,
            runner: Some(runner),
        })
    }

    /// Replace the configured trackers before the worker starts.
    pub fn with_trackers(mut self, trackers: TrackerSet) -> Self {
        if let Some(runner) = self.runner.as_mut() {
            runner.trackers = trackers;
        }
        self
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn start(&mut self) -> Result<()> {
        log::debug!("starting camera worker {}", self.camera_id);
        let runner = self
            .runner
            .take()
            .ok_or_else(|| anyhow!("camera worker {} already started", self.camera_id))?;
        self.handle.spawn(move || runner.run())
    }

    /// Set this worker's stop flag and block until its thread has exited.
    pub fn stop(&mut self) -> Result<()> {
        log::debug!("stopping camera worker {}", self.camera_id);
        self.handle.stop()
    }

    pub fn state(&self) -> WorkerState {
        self.handle.state()
    }

    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }
}

struct CameraLoop {
    camera_id: CameraId,
    camera_config: CameraConfig,
    trackers: TrackerSet,
    poll_interval: Duration,
    frame_requests: Subscription,
    config_updates: Subscription,
    stop: KillFlag,
    ring: Arc<dyn FrameRing>,
    ipc: Arc<PipelineIpc>,
}

impl CameraLoop {
    fn run(mut self) -> Result<()> {
        log::debug!(
            "camera worker {} running trackers [{}]",
            self.camera_id,
            self.trackers.names().join(", ")
        );
        while self.ipc.should_continue() && !self.stop.is_killed() {
            std::thread::sleep(self.poll_interval);
            self.poll_once()?;
        }
        log::debug!("shutting down camera worker {}", self.camera_id);
        Ok(())
    }

    fn poll_once(&mut self) -> Result<()> {
        if let Some(update) = self.config_updates.latest_as::<ConfigUpdateMessage>()? {
            self.apply_config(&update.config);
        }
        // Only the newest request matters; older ones are dropped.
        if let Some(request) = self.frame_requests.latest_as::<ProcessFrameNumberMessage>()? {
            self.process_frame(request.frame_number)?;
        }
        Ok(())
    }

    fn apply_config(&mut self, config: &PipelineConfig) {
        let Some(camera_config) = config.cameras.get(&self.camera_id) else {
            log::warn!(
                "camera worker {}: config update has no entry for this camera, keeping current trackers",
                self.camera_id
            );
            return;
        };
        if camera_config == &self.camera_config {
            return;
        }
        self.trackers = TrackerSet::from_configs(&camera_config.trackers);
        self.camera_config = camera_config.clone();
        self.poll_interval = config.poll_interval();
        log::debug!(
            "camera worker {} swapped trackers to [{}]",
            self.camera_id,
            self.trackers.names().join(", ")
        );
    }

    /// Returns the number of observations published.
    fn process_frame(&mut self, frame_number: FrameNumber) -> Result<usize> {
        let frame = match self.ring.read_frame(&self.camera_id, frame_number) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("camera worker {}: {}", self.camera_id, err);
                return Ok(0);
            }
        };
        let view = frame.view();
        let mut messages = Vec::new();
        for tracker in self.trackers.iter_mut() {
            let observation = match tracker.process(frame_number, &view) {
                Ok(Some(observation)) => observation,
                Ok(None) => {
                    log::trace!(
                        "camera {} frame {}: {} found nothing",
                        self.camera_id,
                        frame_number,
                        tracker.name()
                    );
                    continue;
                }
                Err(err) => {
                    log::warn!(
                        "camera {} frame {}: tracker {} failed: {:#}",
                        self.camera_id,
                        frame_number,
                        tracker.name(),
                        err
                    );
                    continue;
                }
            };
            messages.push(CameraObservationMessage {
                camera_id: self.camera_id.clone(),
                frame_number,
                tracker_name: tracker.name().to_string(),
                observation,
            });
        }
        // Every tracker runs before any observation of this frame is published.
        let mut published = 0;
        for message in messages {
            if publish(self.ipc.topics(), message)? {
                published += 1;
            }
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameView, RawFrame, SharedFrameRing};
    use crate::message::Observation;
    use crate::tracker::{FrameTracker, TrackerConfig, BRIGHT_SPOT_POINT};

    fn spot_frame(camera_id: &str, frame_number: FrameNumber, x: usize, y: usize) -> RawFrame {
        let mut data = vec![0u8; 16 * 16];
        data[y * 16 + x] = 255;
        RawFrame::new(camera_id, frame_number, 16, 16, 1, data).unwrap()
    }

    fn setup(frames: u64) -> (Arc<PipelineIpc>, Arc<SharedFrameRing>, PipelineConfig) {
        let ipc = PipelineIpc::create("cam-test", KillFlag::new(), 8).unwrap();
        let ring = Arc::new(SharedFrameRing::new(["0"], 8));
        for n in 0..frames {
            ring.write_multiframe(n, vec![spot_frame("0", n, 3, 5)])
                .unwrap();
        }
        (ipc, ring, PipelineConfig::for_cameras("g", ["0"]))
    }

    /// Fails on even frames, reports a fixed point on odd ones.
    struct FlakyTracker;

    impl FrameTracker for FlakyTracker {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn process(
            &mut self,
            frame_number: FrameNumber,
            _frame: &FrameView<'_>,
        ) -> Result<Option<Observation>> {
            if frame_number % 2 == 0 {
                return Err(anyhow!("transient"));
            }
            Ok(Some(Observation::new().with_point("p", 1.0, 1.0)))
        }
    }

    fn request(ipc: &PipelineIpc, frame_number: FrameNumber) {
        ipc.topics()
            .publish_typed(ProcessFrameNumberMessage { frame_number })
            .unwrap();
    }

    #[test]
    fn publishes_observation_for_requested_frame() {
        let (ipc, ring, config) = setup(3);
        let observations = ipc.topics().subscribe(MessageKind::CameraObservation).unwrap();
        let mut worker = CameraWorker::create("0", &config, ring, ipc.clone()).unwrap();
        worker.start().unwrap();

        request(&ipc, 2);
        let msg = observations
            .recv_timeout_as::<CameraObservationMessage>(Duration::from_secs(2))
            .unwrap()
            .expect("observation");
        assert_eq!(msg.camera_id, "0");
        assert_eq!(msg.frame_number, 2);
        assert_eq!(msg.tracker_name, "bright_spot");
        assert_eq!(msg.observation.points[BRIGHT_SPOT_POINT].x, 3.0);

        worker.stop().unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn tracker_failure_does_not_stop_the_worker() {
        let (ipc, ring, config) = setup(4);
        let observations = ipc.topics().subscribe(MessageKind::CameraObservation).unwrap();
        let mut trackers = TrackerSet::new();
        trackers.push(Box::new(FlakyTracker));
        let mut worker = CameraWorker::create("0", &config, ring, ipc.clone())
            .unwrap()
            .with_trackers(trackers);
        worker.start().unwrap();

        request(&ipc, 2);
        std::thread::sleep(Duration::from_millis(50));
        assert!(worker.is_alive());
        request(&ipc, 3);

        let msg = observations
            .recv_timeout_as::<CameraObservationMessage>(Duration::from_secs(2))
            .unwrap()
            .expect("observation after transient failure");
        assert_eq!(msg.frame_number, 3);
        worker.stop().unwrap();
    }

    #[test]
    fn unavailable_frame_is_skipped() {
        let (ipc, ring, config) = setup(1);
        let observations = ipc.topics().subscribe(MessageKind::CameraObservation).unwrap();
        let mut worker = CameraWorker::create("0", &config, ring, ipc.clone()).unwrap();
        worker.start().unwrap();

        request(&ipc, 40);
        assert!(observations.recv_timeout(Duration::from_millis(100)).is_none());
        assert!(worker.is_alive());
        worker.stop().unwrap();
    }

    #[test]
    fn config_update_swaps_trackers() {
        let (ipc, ring, config) = setup(2);
        let observations = ipc.topics().subscribe(MessageKind::CameraObservation).unwrap();
        let mut worker = CameraWorker::create("0", &config, ring, ipc.clone()).unwrap();
        worker.start().unwrap();

        let mut updated = config.clone();
        updated.cameras.get_mut("0").unwrap().trackers = vec![TrackerConfig::BrightSpot {
            threshold: 255,
        }, TrackerConfig::Motion];
        ipc.topics()
            .publish_typed(ConfigUpdateMessage { config: updated })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        request(&ipc, 0);
        std::thread::sleep(Duration::from_millis(50));
        request(&ipc, 1);

        let mut trackers = Vec::new();
        while let Some(msg) = observations
            .recv_timeout_as::<CameraObservationMessage>(Duration::from_millis(300))
            .unwrap()
        {
            trackers.push(msg.tracker_name);
        }
        // Frames 0 and 1 are identical, so motion never fires.
        assert_eq!(trackers, vec!["bright_spot", "bright_spot"]);
        worker.stop().unwrap();
    }

    #[test]
    fn stops_when_pipeline_is_killed() {
        let (ipc, ring, config) = setup(1);
        let mut worker = CameraWorker::create("0", &config, ring, ipc.clone()).unwrap();
        worker.start().unwrap();
        ipc.kill_pipeline();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_alive());
        worker.stop().unwrap();
    }

    #[test]
    fn unknown_camera_cannot_be_created() {
        let (ipc, ring, config) = setup(0);
        assert!(CameraWorker::create("9", &config, ring, ipc).is_err());
    }
}
