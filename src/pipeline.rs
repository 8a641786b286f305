//! Orchestrator for one camera group.
//!
//! Creates the IPC context and every worker (so all subscriptions exist
//! before any thread starts), starts them in dependency order and tears them
//! down again.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

use crate::aggregation::{AggregationSettings, AggregationWorker};
use crate::camera_worker::CameraWorker;
use crate::config::PipelineConfig;
use crate::frame::FrameRing;
use crate::ipc::{PipelineIpc, PipelineRegistry};
use crate::message::{ConfigUpdateMessage, ShouldCalibrateMessage};
use crate::payload::{Payload, PayloadBuilder, PayloadCallback};
use crate::worker::WorkerState;

pub struct Pipeline {
    ipc: Arc<PipelineIpc>,
    config: PipelineConfig,
    cameras: Vec<CameraWorker>,
    aggregation: AggregationWorker,
    payload: PayloadBuilder,
}

impl Pipeline {
    pub fn create(
        registry: &PipelineRegistry,
        pipeline_id: &str,
        config: PipelineConfig,
        ring: Arc<dyn FrameRing>,
    ) -> Result<Self> {
        config.validate()?;
        let ipc = registry.create_pipeline_with_log_capacity(pipeline_id, config.topic_log_capacity)?;

        let payload = PayloadBuilder::create(ring.clone(), &config, ipc.clone())?;
        let cameras = config
            .camera_ids()
            .iter()
            .map(|camera_id| CameraWorker::create(camera_id, &config, ring.clone(), ipc.clone()))
            .collect::<Result<Vec<_>>>()?;
        let aggregation = AggregationWorker::create_with(
            &config.camera_group_id,
            &config.camera_ids(),
            ring,
            ipc.clone(),
            AggregationSettings::from(&config),
        )?;

        log::info!(
            "pipeline {} created for group {} with cameras {:?}",
            pipeline_id,
            config.camera_group_id,
            config.camera_ids()
        );
        Ok(Self {
            ipc,
            config,
            cameras,
            aggregation,
            payload,
        })
    }

    pub fn with_payload_callback(mut self, callback: PayloadCallback) -> Self {
        self.payload = self.payload.with_callback(callback);
        self
    }

    pub fn start(&mut self) -> Result<()> {
        self.aggregation.start()?;
        for camera in &mut self.cameras {
            camera.start()?;
        }
        self.payload.start()?;
        log::info!("pipeline {} started", self.ipc.pipeline_id());
        Ok(())
    }

    pub fn pipeline_id(&self) -> &str {
        self.ipc.pipeline_id()
    }

    pub fn ipc(&self) -> &Arc<PipelineIpc> {
        &self.ipc
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Broadcast a new configuration to every worker.
    pub fn update_config(&mut self, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        if config.camera_ids() != self.config.camera_ids() {
            return Err(anyhow!(
                "pipeline {} cannot change its camera set at runtime",
                self.pipeline_id()
            ));
        }
        self.ipc.topics().publish_typed(ConfigUpdateMessage {
            config: config.clone(),
        })?;
        self.config = config;
        log::info!("pipeline {} config updated", self.pipeline_id());
        Ok(())
    }

    pub fn request_calibration(&self) -> Result<()> {
        self.ipc.topics().publish_typed(ShouldCalibrateMessage)?;
        Ok(())
    }

    /// True while every worker thread is still running.
    pub fn alive(&self) -> bool {
        self.aggregation.is_alive()
            && self.payload.is_alive()
            && self.cameras.iter().all(CameraWorker::is_alive)
    }

    pub fn worker_states(&self) -> Vec<(String, WorkerState)> {
        let mut states = vec![(
            format!("aggregation-{}", self.aggregation.camera_group_id()),
            self.aggregation.state(),
        )];
        states.extend(
            self.cameras
                .iter()
                .map(|camera| (format!("camera-{}", camera.camera_id()), camera.state())),
        );
        states.push(("payload".to_string(), self.payload.state()));
        states
    }

    pub fn latest_payload(&self) -> Option<Arc<Payload>> {
        self.payload.latest_payload()
    }

    pub fn take_latest_payload(&self) -> Option<Arc<Payload>> {
        self.payload.take_latest_payload()
    }

    /// Kill the pipeline, join every worker and close the topics.
    ///
    /// Returns the first error a worker ended with.
    pub fn shutdown(&mut self) -> Result<()> {
        log::info!("pipeline {} shutting down", self.pipeline_id());
        self.ipc.kill_pipeline();

        let mut results = Vec::new();
        for camera in &mut self.cameras {
            let camera_id = camera.camera_id().to_string();
            results.push(
                camera
                    .stop()
                    .with_context(|| format!("camera worker {}", camera_id)),
            );
        }
        results.push(self.aggregation.stop().context("aggregation worker"));
        results.push(self.payload.shutdown().context("payload builder"));
        self.ipc.topics().close();

        let mut first_error = None;
        for result in results {
            if let Err(err) = result {
                log::warn!("pipeline {}: {:#}", self.pipeline_id(), err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
