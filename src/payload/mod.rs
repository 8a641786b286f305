//! Display payload builder.
//!
//! Joins the raw frames of a requested frame number with every camera's
//! observations and the aggregated records into one `Payload`, exposed through
//! a latest-wins slot. Several frames may be in progress at once; publishing one
//! drops every older frame still in progress. Partial payloads are never
//! published.

pub mod encode;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::frame::{FrameRing, RawFrame};
use crate::ipc::{KillFlag, PipelineIpc};
use crate::message::{
    AggregatedFrameMessage, CameraObservationMessage, MessageKind, Observation,
    ProcessFrameNumberMessage,
};
use crate::topic::Subscription;
use crate::worker::{WorkerHandle, WorkerState};
use crate::{CameraId, FrameNumber, TrackerName};

pub use encode::{annotate, decode_frames, encode_frames, TransportFrame, TransportFrames};

#[derive(Clone, Debug, PartialEq)]
pub struct Payload {
    pub frame_number: FrameNumber,
    /// Annotated frames of every camera, see [`encode`].
    pub frames_bytes: Vec<u8>,
    pub camera_observations: BTreeMap<CameraId, BTreeMap<TrackerName, Observation>>,
    pub aggregated: BTreeMap<TrackerName, AggregatedFrameMessage>,
}

pub type PayloadCallback = Box<dyn Fn(&Payload) + Send>;

type LatestSlot = Arc<Mutex<Option<Arc<Payload>>>>;

pub struct PayloadBuilder {
    ipc: Arc<PipelineIpc>,
    latest: LatestSlot,
    handle: WorkerHandle,
    runner: Option<PayloadLoop>,
}

impl PayloadBuilder {
    pub fn create(
        ring: Arc<dyn FrameRing>,
        config: &PipelineConfig,
        ipc: Arc<PipelineIpc>,
    ) -> Result<Self> {
        let latest: LatestSlot = Arc::new(Mutex::new(None));
        let handle = WorkerHandle::new(format!("payload-builder-{}", ipc.pipeline_id()));
        let topics = ipc.topics();
        let runner = PayloadLoop {
            camera_ids: config.camera_ids(),
            timeout: config.payload_timeout(),
            poll_interval: config.poll_interval(),
            requests: topics.subscribe(MessageKind::ProcessFrameNumber)?,
            observations: topics.subscribe(MessageKind::CameraObservation)?,
            aggregated: topics.subscribe(MessageKind::AggregatedFrame)?,
            in_flight: BTreeMap::new(),
            newest_request: None,
            latest: latest.clone(),
            callback: None,
            stop: handle.stop_flag(),
            ring,
            ipc: ipc.clone(),
        };
        Ok(Self {
            ipc,
            latest,
            handle,
            runner: Some(runner),
        })
    }

    /// Also hand every finished payload to `callback`, after the slot is set.
    pub fn with_callback(mut self, callback: PayloadCallback) -> Self {
        if let Some(runner) = self.runner.as_mut() {
            runner.callback = Some(callback);
        }
        self
    }

    pub fn start(&mut self) -> Result<()> {
        let runner = self
            .runner
            .take()
            .ok_or_else(|| anyhow!("payload builder already started"))?;
        self.handle.spawn(move || runner.run())
    }

    /// Kill the pipeline and wait for the builder thread to exit.
    pub fn shutdown(&mut self) -> Result<()> {
        log::debug!("shutting down payload builder {}", self.ipc.pipeline_id());
        self.ipc.kill_pipeline();
        self.handle.stop()
    }

    pub fn latest_payload(&self) -> Option<Arc<Payload>> {
        self.latest.lock().clone()
    }

    pub fn take_latest_payload(&self) -> Option<Arc<Payload>> {
        self.latest.lock().take()
    }

    pub fn state(&self) -> WorkerState {
        self.handle.state()
    }

    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }
}

/// Unfinished frames further than this behind the newest request are dropped.
const MAX_FRAME_LAG: FrameNumber = 10;

/// Work in progress for one requested frame.
struct Pending {
    frame_number: FrameNumber,
    started: Instant,
    frames: Vec<RawFrame>,
    observations: BTreeMap<CameraId, BTreeMap<TrackerName, Observation>>,
    aggregated: BTreeMap<TrackerName, AggregatedFrameMessage>,
}

impl Pending {
    fn all_reported(&self, camera_ids: &[CameraId]) -> bool {
        camera_ids
            .iter()
            .all(|camera_id| self.observations.contains_key(camera_id))
    }

    /// Every camera reported every tracker seen so far, and each of those
    /// trackers has its aggregated record.
    ///
    /// A tracker reported by only some cameras holds the payload back until the
    /// rest arrive or the payload times out.
    fn is_complete(&self, camera_ids: &[CameraId]) -> bool {
        if !self.all_reported(camera_ids) {
            return false;
        }
        let reported: BTreeSet<&TrackerName> = self
            .observations
            .values()
            .flat_map(|by_tracker| by_tracker.keys())
            .collect();
        reported.into_iter().all(|tracker| {
            self.aggregated.contains_key(tracker)
                && camera_ids.iter().all(|camera_id| {
                    self.observations
                        .get(camera_id)
                        .is_some_and(|by_tracker| by_tracker.contains_key(tracker))
                })
        })
    }
}

struct PayloadLoop {
    camera_ids: Vec<CameraId>,
    timeout: Duration,
    poll_interval: Duration,
    requests: Subscription,
    observations: Subscription,
    aggregated: Subscription,
    in_flight: BTreeMap<FrameNumber, Pending>,
    newest_request: Option<FrameNumber>,
    latest: LatestSlot,
    callback: Option<PayloadCallback>,
    stop: KillFlag,
    ring: Arc<dyn FrameRing>,
    ipc: Arc<PipelineIpc>,
}

impl PayloadLoop {
    fn run(mut self) -> Result<()> {
        log::debug!("payload builder {} running", self.ipc.pipeline_id());
        while self.ipc.should_continue() && !self.stop.is_killed() {
            std::thread::sleep(self.poll_interval);
            self.poll_once(Instant::now())?;
        }
        if !self.in_flight.is_empty() {
            log::debug!(
                "{} unfinished payloads aborted by shutdown: {:?}",
                self.in_flight.len(),
                self.in_flight.keys().collect::<Vec<_>>()
            );
        }
        Ok(())
    }

    /// One loop iteration. Returns the frame number of a published payload.
    fn poll_once(&mut self, now: Instant) -> Result<Option<FrameNumber>> {
        if let Some(request) = self.requests.latest_as::<ProcessFrameNumberMessage>()? {
            self.on_request(request.frame_number, now);
        }
        for message in self.observations.drain_as::<CameraObservationMessage>()? {
            self.on_observation(message);
        }
        for message in self.aggregated.drain_as::<AggregatedFrameMessage>()? {
            self.on_aggregated(message);
        }
        self.advance(now)
    }

    fn on_request(&mut self, frame_number: FrameNumber, now: Instant) {
        if self.newest_request.is_some_and(|newest| frame_number <= newest) {
            return;
        }
        self.newest_request = Some(frame_number);
        match self.read_frames(frame_number) {
            Ok(frames) => {
                self.in_flight.insert(
                    frame_number,
                    Pending {
                        frame_number,
                        started: now,
                        frames,
                        observations: BTreeMap::new(),
                        aggregated: BTreeMap::new(),
                    },
                );
            }
            Err(err) => log::warn!("payload for frame {} aborted: {}", frame_number, err),
        }
    }

    fn read_frames(&self, frame_number: FrameNumber) -> Result<Vec<RawFrame>, PipelineError> {
        self.camera_ids
            .iter()
            .map(|camera_id| self.ring.read_frame(camera_id, frame_number))
            .collect()
    }

    fn on_observation(&mut self, message: CameraObservationMessage) {
        if !self.camera_ids.contains(&message.camera_id) {
            log::warn!(
                "payload builder ignoring observation from unknown camera {}",
                message.camera_id
            );
            return;
        }
        if let Some(pending) = self.in_flight.get_mut(&message.frame_number) {
            pending
                .observations
                .entry(message.camera_id)
                .or_default()
                .insert(message.tracker_name, message.observation);
            return;
        }
        let unrequested = self
            .newest_request
            .is_some_and(|newest| message.frame_number > newest);
        if unrequested && !self.in_flight.is_empty() {
            let err = PipelineError::FrameMismatch {
                context: format!("payload observation from camera {}", message.camera_id),
                expected: self.newest_request.unwrap_or_default(),
                actual: vec![message.frame_number],
            };
            log::error!(
                "payloads for frames {:?} aborted: {}",
                self.in_flight.keys().collect::<Vec<_>>(),
                err
            );
            self.in_flight.clear();
            return;
        }
        log::trace!(
            "dropping observation from camera {} for frame {} with no payload in progress",
            message.camera_id,
            message.frame_number
        );
    }

    fn on_aggregated(&mut self, message: AggregatedFrameMessage) {
        match self.in_flight.get_mut(&message.frame_number) {
            Some(pending) => {
                pending
                    .aggregated
                    .insert(message.tracker_name.clone(), message);
            }
            None => log::trace!(
                "dropping aggregated record for frame {} with no payload in progress",
                message.frame_number
            ),
        }
    }

    fn advance(&mut self, now: Instant) -> Result<Option<FrameNumber>> {
        let timeout = self.timeout;
        let newest_request = self.newest_request.unwrap_or_default();
        self.in_flight.retain(|frame_number, pending| {
            if now.saturating_duration_since(pending.started) >= timeout {
                log::warn!("payload for frame {} timed out after {:?}", frame_number, timeout);
                return false;
            }
            if newest_request.saturating_sub(*frame_number) > MAX_FRAME_LAG {
                log::debug!(
                    "payload for frame {} dropped, newest request is {}",
                    frame_number,
                    newest_request
                );
                return false;
            }
            true
        });

        let Some(ready) = self
            .in_flight
            .values()
            .rev()
            .find(|pending| pending.is_complete(&self.camera_ids))
            .map(|pending| pending.frame_number)
        else {
            return Ok(None);
        };

        // Publishing `ready` supersedes everything older still in flight.
        let newer = self.in_flight.split_off(&(ready + 1));
        let mut finished = std::mem::replace(&mut self.in_flight, newer);
        let Some(pending) = finished.remove(&ready) else {
            return Ok(None);
        };
        if !finished.is_empty() {
            log::debug!(
                "payloads for frames {:?} superseded by frame {}",
                finished.keys().collect::<Vec<_>>(),
                ready
            );
        }
        self.set_latest(assemble(pending)?);
        Ok(Some(ready))
    }

    fn set_latest(&self, payload: Payload) {
        log::trace!("payload for frame {} ready", payload.frame_number);
        let payload = Arc::new(payload);
        *self.latest.lock() = Some(payload.clone());
        if let Some(callback) = &self.callback {
            callback(&payload);
        }
    }
}

fn assemble(pending: Pending) -> Result<Payload> {
    let annotated: Vec<TransportFrame> = pending
        .frames
        .iter()
        .map(|frame| {
            let observations: Vec<&Observation> = pending
                .observations
                .get(frame.view().camera_id())
                .map(|by_tracker| by_tracker.values().collect())
                .unwrap_or_default();
            annotate(frame, &observations)
        })
        .collect();
    Ok(Payload {
        frame_number: pending.frame_number,
        frames_bytes: encode_frames(pending.frame_number, &annotated)?,
        camera_observations: pending.observations,
        aggregated: pending.aggregated,
    })
}
