//! Aggregation worker: one per camera group.
//!
//! Paces the whole pipeline by requesting the newest produced frame, collects
//! per-camera observations and emits one `AggregatedFrameMessage` per tracker
//! once every camera of the group has reported.

mod accumulator;
mod join;
mod pacing;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{FrameMismatchPolicy, PipelineConfig};
use crate::frame::FrameRing;
use crate::ipc::{KillFlag, PipelineIpc};
use crate::message::{
    CameraObservationMessage, ConfigUpdateMessage, MessageKind, ProcessFrameNumberMessage,
    ShouldCalibrateMessage,
};
use crate::topic::Subscription;
use crate::worker::{publish, WorkerHandle, WorkerState};
use crate::{CameraGroupId, CameraId};

pub use accumulator::{Accumulator, CompleteJoin};
pub use join::{join_observations, MeanProjection, Triangulator};
pub use pacing::{PaceDecision, Pacer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AggregationSettings {
    pub frame_mismatch_policy: FrameMismatchPolicy,
    pub stall_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for AggregationSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            frame_mismatch_policy: config.frame_mismatch_policy,
            stall_timeout: config.stall_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

pub struct AggregationWorker {
    camera_group_id: CameraGroupId,
    handle: WorkerHandle,
    runner: Option<AggregationLoop>,
}

impl AggregationWorker {
    pub fn create(
        camera_group_id: &str,
        camera_ids: &[CameraId],
        ring: Arc<dyn FrameRing>,
        ipc: Arc<PipelineIpc>,
    ) -> Result<Self> {
        Self::create_with(
            camera_group_id,
            camera_ids,
            ring,
            ipc,
            AggregationSettings::default(),
        )
    }

    pub fn create_with(
        camera_group_id: &str,
        camera_ids: &[CameraId],
        ring: Arc<dyn FrameRing>,
        ipc: Arc<PipelineIpc>,
        settings: AggregationSettings,
    ) -> Result<Self> {
        if camera_ids.is_empty() {
            return Err(anyhow!("camera group {} has no cameras", camera_group_id));
        }
        let handle = WorkerHandle::new(format!("aggregation-worker-{}", camera_group_id));
        let topics = ipc.topics();
        let runner = AggregationLoop {
            camera_group_id: camera_group_id.to_string(),
            accumulator: Accumulator::new(camera_ids.iter().cloned()),
            pacer: Pacer::new(settings.stall_timeout),
            settings,
            triangulator: Box::new(MeanProjection),
            observations: topics.subscribe(MessageKind::CameraObservation)?,
            config_updates: topics.subscribe(MessageKind::ConfigUpdate)?,
            calibration_requests: topics.subscribe(MessageKind::ShouldCalibrate)?,
            stop: handle.stop_flag(),
            ring,
            ipc,
            joined_frames: 0,
            shared_views: 0,
        };
        Ok(Self {
            camera_group_id: camera_group_id.to_string(),
            handle,
            runner: Some(runner),
        })
    }

    pub fn with_triangulator(mut self, triangulator: Box<dyn Triangulator>) -> Self {
        if let Some(runner) = self.runner.as_mut() {
            runner.triangulator = triangulator;
        }
        self
    }

    pub fn camera_group_id(&self) -> &str {
        &self.camera_group_id
    }

    pub fn start(&mut self) -> Result<()> {
        log::debug!("starting aggregation worker {}", self.camera_group_id);
        let runner = self
            .runner
            .take()
            .ok_or_else(|| anyhow!("aggregation worker {} already started", self.camera_group_id))?;
        self.handle.spawn(move || runner.run())
    }

    pub fn stop(&mut self) -> Result<()> {
        log::debug!("stopping aggregation worker {}", self.camera_group_id);
        self.handle.stop()
    }

    pub fn state(&self) -> WorkerState {
        self.handle.state()
    }

    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }
}

struct AggregationLoop {
    camera_group_id: CameraGroupId,
    accumulator: Accumulator,
    pacer: Pacer,
    settings: AggregationSettings,
    triangulator: Box<dyn Triangulator>,
    observations: Subscription,
    config_updates: Subscription,
    calibration_requests: Subscription,
    stop: KillFlag,
    ring: Arc<dyn FrameRing>,
    ipc: Arc<PipelineIpc>,
    joined_frames: u64,
    /// Joins in which at least two cameras reported points.
    shared_views: u64,
}

impl AggregationLoop {
    fn run(mut self) -> Result<()> {
        log::info!(
            "aggregation worker {} running for cameras {:?}",
            self.camera_group_id,
            self.accumulator.camera_ids()
        );
        while self.ipc.should_continue() && !self.stop.is_killed() {
            std::thread::sleep(self.settings.poll_interval);
            self.poll_once(Instant::now())?;
        }
        log::info!(
            "aggregation worker {} exiting after {} joined frames",
            self.camera_group_id,
            self.joined_frames
        );
        Ok(())
    }

    /// One loop iteration. Returns the number of aggregated records emitted.
    fn poll_once(&mut self, now: Instant) -> Result<usize> {
        if let Some(update) = self.config_updates.latest_as::<ConfigUpdateMessage>()? {
            self.apply_config(&update.config);
        }
        self.pace(now)?;
        self.collect()?;
        let emitted = self.join()?;
        if !self
            .calibration_requests
            .drain_as::<ShouldCalibrateMessage>()?
            .is_empty()
        {
            log::info!(
                "calibration requested for group {}: {} of {} joined frames have shared views",
                self.camera_group_id,
                self.shared_views,
                self.joined_frames
            );
        }
        Ok(emitted)
    }

    fn apply_config(&mut self, config: &PipelineConfig) {
        let camera_ids = config.camera_ids();
        if camera_ids != self.accumulator.camera_ids() {
            log::warn!(
                "aggregation worker {}: config update lists cameras {:?}, group stays {:?}",
                self.camera_group_id,
                camera_ids,
                self.accumulator.camera_ids()
            );
        }
        self.settings = AggregationSettings::from(config);
        self.pacer.set_stall_timeout(self.settings.stall_timeout);
        log::debug!(
            "aggregation worker {} settings now {:?}",
            self.camera_group_id,
            self.settings
        );
    }

    fn pace(&mut self, now: Instant) -> Result<()> {
        let latest = self.ring.latest_produced_frame_number();
        let frame_number = match self.pacer.decide(latest, self.accumulator.has_partial(), now) {
            PaceDecision::Wait => return Ok(()),
            PaceDecision::Request(frame_number) => frame_number,
            PaceDecision::RecoverAndRequest(frame_number) => {
                let reset = self.accumulator.reset_partial();
                log::warn!(
                    "aggregation worker {}: frame {:?} stalled, dropped {} partial joins, moving to frame {}",
                    self.camera_group_id,
                    self.pacer.last_requested(),
                    reset,
                    frame_number
                );
                frame_number
            }
        };
        if publish(self.ipc.topics(), ProcessFrameNumberMessage { frame_number })? {
            log::trace!("group {} requested frame {}", self.camera_group_id, frame_number);
            self.pacer.mark_requested(frame_number, now);
        }
        Ok(())
    }

    fn collect(&mut self) -> Result<()> {
        for message in self.observations.drain_as::<CameraObservationMessage>()? {
            self.accumulator.insert(message)?;
        }
        Ok(())
    }

    fn join(&mut self) -> Result<usize> {
        let mut emitted = 0;
        for complete in self.accumulator.take_complete()? {
            let aggregated = join_observations(
                complete,
                self.pacer.last_requested(),
                &self.camera_group_id,
                self.settings.frame_mismatch_policy,
                self.triangulator.as_ref(),
            )?;
            self.pacer.mark_answered(aggregated.frame_number);
            self.joined_frames += 1;
            let seen_by = aggregated
                .camera_observations
                .values()
                .filter(|observation| !observation.is_empty())
                .count();
            if seen_by >= 2 {
                self.shared_views += 1;
            }
            log::trace!(
                "group {} frame {} tracker {}: {} points",
                self.camera_group_id,
                aggregated.frame_number,
                aggregated.tracker_name,
                aggregated.tracked_points.len()
            );
            if publish(self.ipc.topics(), aggregated)? {
                emitted += 1;
            }
        }
        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::frame::{RawFrame, SharedFrameRing};
    use crate::message::{AggregatedFrameMessage, Observation, Point3d};
    use crate::FrameNumber;

    struct Fixture {
        ipc: Arc<PipelineIpc>,
        ring: Arc<SharedFrameRing>,
        requests: Subscription,
        aggregated: Subscription,
    }

    impl Fixture {
        fn new() -> Self {
            let ipc = PipelineIpc::create("agg-test", KillFlag::new(), 16).unwrap();
            let ring = Arc::new(SharedFrameRing::new(["0", "1"], 16));
            let requests = ipc.topics().subscribe(MessageKind::ProcessFrameNumber).unwrap();
            let aggregated = ipc.topics().subscribe(MessageKind::AggregatedFrame).unwrap();
            Self {
                ipc,
                ring,
                requests,
                aggregated,
            }
        }

        fn produce(&self, frame_number: FrameNumber) {
            let frames = ["0", "1"]
                .iter()
                .map(|id| RawFrame::new(*id, frame_number, 2, 2, 1, vec![0; 4]).unwrap())
                .collect();
            self.ring.write_multiframe(frame_number, frames).unwrap();
        }

        fn runner(&self, settings: AggregationSettings) -> AggregationLoop {
            let ids = vec!["0".to_string(), "1".to_string()];
            let mut worker =
                AggregationWorker::create_with("g", &ids, self.ring.clone(), self.ipc.clone(), settings)
                    .unwrap();
            worker.runner.take().unwrap()
        }

        fn observe(&self, camera_id: &str, frame_number: FrameNumber, x: f64) {
            self.ipc
                .topics()
                .publish_typed(CameraObservationMessage {
                    camera_id: camera_id.to_string(),
                    frame_number,
                    tracker_name: "t".to_string(),
                    observation: Observation::new().with_point("p", x, 10.0),
                })
                .unwrap();
        }

        fn emitted(&self) -> Vec<AggregatedFrameMessage> {
            self.aggregated.drain_as().unwrap()
        }

        fn requested(&self) -> Vec<FrameNumber> {
            self.requests
                .drain_as::<ProcessFrameNumberMessage>()
                .unwrap()
                .into_iter()
                .map(|msg| msg.frame_number)
                .collect()
        }
    }

    #[test]
    fn frame_five_joins_once_with_both_arrivals_before_poll() {
        let fx = Fixture::new();
        fx.produce(5);
        let mut runner = fx.runner(AggregationSettings::default());
        let now = Instant::now();

        assert_eq!(runner.poll_once(now).unwrap(), 0);
        assert_eq!(fx.requested(), vec![5]);

        fx.observe("1", 5, 4.0);
        fx.observe("0", 5, 2.0);
        assert_eq!(runner.poll_once(now).unwrap(), 1);
        assert_eq!(runner.poll_once(now).unwrap(), 0);

        let emitted = fx.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].frame_number, 5);
        assert_eq!(emitted[0].tracker_name, "t");
        assert_eq!(emitted[0].camera_group_id, "g");
        assert_eq!(emitted[0].tracked_points["p"], Point3d { x: 3.0, y: 10.0, z: 0.0 });
        assert!(runner.accumulator.is_idle());
    }

    #[test]
    fn frame_five_joins_once_with_arrivals_across_polls() {
        let fx = Fixture::new();
        fx.produce(5);
        let mut runner = fx.runner(AggregationSettings::default());
        let now = Instant::now();
        runner.poll_once(now).unwrap();

        fx.observe("0", 5, 2.0);
        assert_eq!(runner.poll_once(now).unwrap(), 0);
        fx.observe("1", 5, 4.0);
        assert_eq!(runner.poll_once(now).unwrap(), 1);
        assert_eq!(runner.poll_once(now).unwrap(), 0);

        let emitted = fx.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].tracked_points["p"].x, 3.0);
    }

    #[test]
    fn next_frame_waits_for_every_camera() {
        let fx = Fixture::new();
        fx.produce(5);
        let mut runner = fx.runner(AggregationSettings::default());
        let now = Instant::now();
        runner.poll_once(now).unwrap();
        fx.observe("0", 5, 1.0);
        fx.observe("1", 5, 1.0);
        runner.poll_once(now).unwrap();

        fx.produce(6);
        runner.poll_once(now).unwrap();
        assert_eq!(fx.requested(), vec![5, 6]);
        fx.observe("0", 6, 1.0);
        assert_eq!(runner.poll_once(now).unwrap(), 0);
        assert_eq!(fx.emitted().len(), 1);
    }

    #[test]
    fn pacing_drops_frames_produced_while_busy() {
        let fx = Fixture::new();
        fx.produce(1);
        let mut runner = fx.runner(AggregationSettings::default());
        let now = Instant::now();
        runner.poll_once(now).unwrap();
        for n in 2..=9 {
            fx.produce(n);
            runner.poll_once(now).unwrap();
        }
        assert_eq!(fx.requested(), vec![1]);

        fx.observe("0", 1, 1.0);
        fx.observe("1", 1, 1.0);
        runner.poll_once(now).unwrap();
        runner.poll_once(now).unwrap();
        assert_eq!(fx.requested(), vec![9]);
    }

    #[test]
    fn stall_resets_partial_slots_and_moves_on() {
        let fx = Fixture::new();
        fx.produce(3);
        let settings = AggregationSettings {
            stall_timeout: Duration::from_millis(500),
            ..AggregationSettings::default()
        };
        let mut runner = fx.runner(settings);
        let t0 = Instant::now();
        runner.poll_once(t0).unwrap();
        fx.observe("0", 3, 1.0);
        runner.poll_once(t0).unwrap();
        assert!(runner.accumulator.has_partial());

        fx.produce(8);
        runner.poll_once(t0 + Duration::from_millis(100)).unwrap();
        assert_eq!(fx.requested(), vec![3]);

        runner.poll_once(t0 + Duration::from_millis(600)).unwrap();
        assert_eq!(fx.requested(), vec![8]);
        assert!(runner.accumulator.is_idle());
        assert!(fx.emitted().is_empty());
    }

    #[test]
    fn mismatch_warns_by_default() {
        let fx = Fixture::new();
        fx.produce(5);
        let mut runner = fx.runner(AggregationSettings::default());
        let now = Instant::now();
        runner.poll_once(now).unwrap();
        fx.observe("0", 4, 1.0);
        fx.observe("1", 5, 1.0);
        assert_eq!(runner.poll_once(now).unwrap(), 1);
        assert_eq!(fx.emitted()[0].frame_number, 5);
    }

    #[test]
    fn mismatch_is_fatal_when_strict() {
        let fx = Fixture::new();
        fx.produce(5);
        let settings = AggregationSettings {
            frame_mismatch_policy: FrameMismatchPolicy::Strict,
            ..AggregationSettings::default()
        };
        let mut runner = fx.runner(settings);
        let now = Instant::now();
        runner.poll_once(now).unwrap();
        fx.observe("0", 4, 1.0);
        fx.observe("1", 5, 1.0);
        let err = runner.poll_once(now).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::FrameMismatch { expected: 5, .. })
        ));
        assert!(fx.emitted().is_empty());
    }

    #[test]
    fn config_update_switches_mismatch_policy() {
        let fx = Fixture::new();
        fx.produce(5);
        let mut runner = fx.runner(AggregationSettings::default());
        let mut config = PipelineConfig::for_cameras("g", ["0", "1"]);
        config.frame_mismatch_policy = FrameMismatchPolicy::Strict;
        fx.ipc
            .topics()
            .publish_typed(ConfigUpdateMessage { config })
            .unwrap();
        let now = Instant::now();
        runner.poll_once(now).unwrap();
        assert_eq!(runner.settings.frame_mismatch_policy, FrameMismatchPolicy::Strict);
    }

    #[test]
    fn unknown_camera_fails_the_worker_only() {
        let fx = Fixture::new();
        let ids = vec!["0".to_string(), "1".to_string()];
        let mut worker = AggregationWorker::create("g", &ids, fx.ring.clone(), fx.ipc.clone()).unwrap();
        worker.start().unwrap();
        fx.observe("7", 1, 1.0);
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(worker.state(), WorkerState::Failed);
        assert!(fx.ipc.should_continue());
        let err = worker.stop().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::UnknownCamera { .. })
        ));
    }

    #[test]
    fn calibration_request_is_consumed() {
        let fx = Fixture::new();
        let mut runner = fx.runner(AggregationSettings::default());
        fx.ipc
            .topics()
            .publish_typed(ShouldCalibrateMessage)
            .unwrap();
        runner.poll_once(Instant::now()).unwrap();
        assert!(runner.calibration_requests.is_empty());
    }
}
