use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::tracker::TrackerConfig;
use crate::{validate_id, CameraGroupId, CameraId};

const DEFAULT_CAMERA_GROUP_ID: &str = "group-0";
const DEFAULT_CAMERA_IDS: [&str; 2] = ["0", "1"];
const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 480;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1;
const DEFAULT_STALL_TIMEOUT_MS: u64 = 500;
const DEFAULT_PAYLOAD_TIMEOUT_MS: u64 = 1000;
const DEFAULT_TOPIC_LOG_CAPACITY: usize = crate::topic::DEFAULT_LOG_CAPACITY;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    camera_group_id: Option<String>,
    cameras: Option<BTreeMap<String, CameraConfigFile>>,
    timing: Option<TimingConfigFile>,
    topics: Option<TopicsConfigFile>,
    aggregation: Option<AggregationConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    trackers: Option<Vec<TrackerConfig>>,
}

#[derive(Debug, Deserialize, Default)]
struct TimingConfigFile {
    poll_interval_ms: Option<u64>,
    stall_timeout_ms: Option<u64>,
    payload_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TopicsConfigFile {
    log_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct AggregationConfigFile {
    frame_mismatch_policy: Option<FrameMismatchPolicy>,
}

/// What the aggregation worker does when the observations of a full join
/// disagree on the frame number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameMismatchPolicy {
    /// Log a warning and emit under the requested frame number.
    #[default]
    Warn,
    /// Treat the mismatch as a contract violation.
    Strict,
}

impl FromStr for FrameMismatchPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "warn" => Ok(FrameMismatchPolicy::Warn),
            "strict" => Ok(FrameMismatchPolicy::Strict),
            other => Err(anyhow!(
                "frame mismatch policy must be 'warn' or 'strict', got '{}'",
                other
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub trackers: Vec<TrackerConfig>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_FRAME_WIDTH,
            height: DEFAULT_FRAME_HEIGHT,
            trackers: vec![TrackerConfig::default()],
        }
    }
}

/// Resolved pipeline configuration. Also the payload of `ConfigUpdateMessage`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub camera_group_id: CameraGroupId,
    pub cameras: BTreeMap<CameraId, CameraConfig>,
    pub poll_interval_ms: u64,
    pub stall_timeout_ms: u64,
    pub payload_timeout_ms: u64,
    pub topic_log_capacity: usize,
    pub frame_mismatch_policy: FrameMismatchPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::for_cameras(DEFAULT_CAMERA_GROUP_ID, DEFAULT_CAMERA_IDS)
    }
}

impl PipelineConfig {
    /// Config with default settings for the given cameras.
    pub fn for_cameras<I, S>(camera_group_id: &str, camera_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CameraId>,
    {
        Self {
            camera_group_id: camera_group_id.to_string(),
            cameras: camera_ids
                .into_iter()
                .map(|id| (id.into(), CameraConfig::default()))
                .collect(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT_MS,
            payload_timeout_ms: DEFAULT_PAYLOAD_TIMEOUT_MS,
            topic_log_capacity: DEFAULT_TOPIC_LOG_CAPACITY,
            frame_mismatch_policy: FrameMismatchPolicy::default(),
        }
    }

    /// Load from `MULTICAM_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MULTICAM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let defaults = Self::default();
        let cameras = match file.cameras {
            Some(cameras) => cameras
                .into_iter()
                .map(|(camera_id, camera)| {
                    let resolved = CameraConfig {
                        width: camera.width.unwrap_or(DEFAULT_FRAME_WIDTH),
                        height: camera.height.unwrap_or(DEFAULT_FRAME_HEIGHT),
                        trackers: camera
                            .trackers
                            .unwrap_or_else(|| vec![TrackerConfig::default()]),
                    };
                    (camera_id, resolved)
                })
                .collect(),
            None => defaults.cameras,
        };
        let timing = file.timing.unwrap_or_default();
        Self {
            camera_group_id: file
                .camera_group_id
                .unwrap_or_else(|| DEFAULT_CAMERA_GROUP_ID.to_string()),
            cameras,
            poll_interval_ms: timing.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            stall_timeout_ms: timing.stall_timeout_ms.unwrap_or(DEFAULT_STALL_TIMEOUT_MS),
            payload_timeout_ms: timing
                .payload_timeout_ms
                .unwrap_or(DEFAULT_PAYLOAD_TIMEOUT_MS),
            topic_log_capacity: file
                .topics
                .and_then(|topics| topics.log_capacity)
                .unwrap_or(DEFAULT_TOPIC_LOG_CAPACITY),
            frame_mismatch_policy: file
                .aggregation
                .and_then(|aggregation| aggregation.frame_mismatch_policy)
                .unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(group_id) = std::env::var("MULTICAM_CAMERA_GROUP_ID") {
            if !group_id.trim().is_empty() {
                self.camera_group_id = group_id.trim().to_string();
            }
        }
        if let Some(ms) = env_millis("MULTICAM_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = ms;
        }
        if let Some(ms) = env_millis("MULTICAM_STALL_TIMEOUT_MS")? {
            self.stall_timeout_ms = ms;
        }
        if let Ok(policy) = std::env::var("MULTICAM_FRAME_MISMATCH_POLICY") {
            if !policy.trim().is_empty() {
                self.frame_mismatch_policy = policy.parse()?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_id("camera group", &self.camera_group_id)?;
        if self.cameras.is_empty() {
            return Err(anyhow!("camera group {} has no cameras", self.camera_group_id));
        }
        for (camera_id, camera) in &self.cameras {
            validate_id("camera", camera_id)?;
            if camera.width == 0 || camera.height == 0 {
                return Err(anyhow!("camera {} has an empty frame size", camera_id));
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll interval must be greater than zero"));
        }
        if self.stall_timeout_ms == 0 || self.payload_timeout_ms == 0 {
            return Err(anyhow!("timeouts must be greater than zero"));
        }
        if self.topic_log_capacity == 0 {
            return Err(anyhow!("topic log capacity must be greater than zero"));
        }
        Ok(())
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.cameras.keys().cloned().collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn payload_timeout(&self) -> Duration {
        Duration::from_millis(self.payload_timeout_ms)
    }
}

fn env_millis(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            let ms = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} must be an integer number of milliseconds", key))?;
            Ok(Some(ms))
        }
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg: PipelineConfigFile = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.camera_ids(), vec!["0".to_string(), "1".to_string()]);
        assert_eq!(cfg.frame_mismatch_policy, FrameMismatchPolicy::Warn);
    }

    #[test]
    fn empty_camera_set_is_rejected() {
        let cfg = PipelineConfig::for_cameras("g", Vec::<String>::new());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!(
            "STRICT".parse::<FrameMismatchPolicy>().unwrap(),
            FrameMismatchPolicy::Strict
        );
        assert!("lenient".parse::<FrameMismatchPolicy>().is_err());
    }

    #[test]
    fn missing_camera_fields_take_defaults() {
        let file: PipelineConfigFile =
            serde_json::from_str(r#"{"cameras": {"left": {}, "right": {"width": 320}}}"#).unwrap();
        let cfg = PipelineConfig::from_file(file);
        assert_eq!(cfg.cameras["left"].width, DEFAULT_FRAME_WIDTH);
        assert_eq!(cfg.cameras["right"].width, 320);
        assert_eq!(cfg.cameras["right"].trackers, vec![TrackerConfig::default()]);
    }
}
