//! multicamd - multi-camera pipeline daemon
//!
//! Runs a synthetic multi-camera capture through one pipeline:
//! 1. Synthetic capture writes moving bright-spot frames into the ring buffer
//! 2. Camera workers track the spot in the frames the aggregator requests
//! 3. The aggregation worker joins per-camera observations per frame
//! 4. The payload builder assembles display payloads, logged once a second
//!
//! Stops after `--seconds` or on Ctrl-C.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use multicam_pipeline::frame::DEFAULT_RING_CAPACITY;
use multicam_pipeline::payload::decode_frames;
use multicam_pipeline::{
    KillFlag, Pipeline, PipelineConfig, PipelineRegistry, SharedFrameRing, SyntheticCapture,
    SyntheticConfig,
};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);
/// Seconds of capture kept in the ring.
const RING_SECONDS: usize = 2;

#[derive(Parser, Debug)]
#[command(
    name = "multicamd",
    about = "Run a synthetic multi-camera capture through the realtime pipeline"
)]
struct Args {
    /// Pipeline config file (.toml or JSON)
    #[arg(long, env = "MULTICAM_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Number of synthetic cameras, named 0..N (ignored with --config)
    #[arg(long, default_value_t = 2)]
    cameras: usize,

    /// Capture rate of the synthetic source
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Run time in seconds, 0 = until Ctrl-C
    #[arg(long, default_value_t = 0)]
    seconds: u64,

    #[arg(long, default_value = "main")]
    pipeline_id: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PipelineConfig::load_from_path(path)?,
        None => {
            if args.cameras == 0 {
                return Err(anyhow!("--cameras must be at least 1"));
            }
            let mut config = PipelineConfig::load()?;
            config.cameras = PipelineConfig::for_cameras(
                &config.camera_group_id,
                (0..args.cameras).map(|n| n.to_string()),
            )
            .cameras;
            config.validate()?;
            config
        }
    };
    let camera_ids = config.camera_ids();
    let (width, height) = config
        .cameras
        .values()
        .next()
        .map(|camera| (camera.width, camera.height))
        .ok_or_else(|| anyhow!("no cameras configured"))?;

    let process_kill = KillFlag::new();
    let handler_flag = process_kill.clone();
    ctrlc::set_handler(move || handler_flag.kill())?;
    let registry = PipelineRegistry::new(process_kill.clone());

    let capacity = (args.fps as usize * RING_SECONDS).clamp(8, DEFAULT_RING_CAPACITY);
    let ring = Arc::new(SharedFrameRing::new(camera_ids.clone(), capacity));
    let mut pipeline = Pipeline::create(&registry, &args.pipeline_id, config, ring.clone())?;
    pipeline.start()?;
    let mut capture = SyntheticCapture::start(
        SyntheticConfig::new(camera_ids, width, height, args.fps),
        ring,
    )?;

    log::info!(
        "multicamd running pipeline {} at {} fps{}",
        args.pipeline_id,
        args.fps,
        if args.seconds == 0 {
            " until Ctrl-C".to_string()
        } else {
            format!(" for {}s", args.seconds)
        }
    );

    let started = Instant::now();
    let deadline = (args.seconds > 0).then(|| started + Duration::from_secs(args.seconds));
    let mut last_status = Instant::now();
    let mut last_frame = None;
    let mut payloads = 0u64;

    while pipeline.ipc().should_continue() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));

        if let Some(payload) = pipeline.take_latest_payload() {
            payloads += 1;
            last_frame = Some(payload.frame_number);
            if log::log_enabled!(log::Level::Debug) {
                let frames = decode_frames(&payload.frames_bytes)?;
                for (tracker, record) in &payload.aggregated {
                    log::debug!(
                        "frame {} tracker {}: {:?} ({} camera images)",
                        payload.frame_number,
                        tracker,
                        record.tracked_points,
                        frames.frames.len()
                    );
                }
            }
        }

        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            log::info!(
                "captured={} payloads={} last_payload_frame={:?}",
                capture.frames_written(),
                payloads,
                last_frame
            );
            if !pipeline.alive() {
                log::warn!("pipeline degraded: {:?}", pipeline.worker_states());
            }
        }
    }

    if process_kill.is_killed() {
        log::info!("shutdown signal received, stopping pipeline...");
    }
    capture.stop()?;
    pipeline.shutdown()?;
    log::info!(
        "multicamd stopped after {:.1}s: {} frames captured, {} payloads",
        started.elapsed().as_secs_f64(),
        capture.frames_written(),
        payloads
    );
    Ok(())
}
