use std::collections::BTreeMap;

use crate::aggregation::accumulator::CompleteJoin;
use crate::config::FrameMismatchPolicy;
use crate::error::PipelineError;
use crate::message::{AggregatedFrameMessage, Observation, Point3d, PointId};
use crate::{CameraId, FrameNumber};

/// Turns one frame's per-camera observations into tracked points.
pub trait Triangulator: Send {
    fn triangulate(&self, observations: &BTreeMap<CameraId, Observation>) -> BTreeMap<PointId, Point3d>;
}

/// Placeholder joiner for uncalibrated groups: per point id, the mean image
/// position over the cameras that saw it, with `z = 0`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeanProjection;

impl Triangulator for MeanProjection {
    fn triangulate(&self, observations: &BTreeMap<CameraId, Observation>) -> BTreeMap<PointId, Point3d> {
        let mut sums: BTreeMap<&PointId, (f64, f64, usize)> = BTreeMap::new();
        for observation in observations.values() {
            for (point_id, point) in &observation.points {
                let entry = sums.entry(point_id).or_insert((0.0, 0.0, 0));
                entry.0 += point.x;
                entry.1 += point.y;
                entry.2 += 1;
            }
        }
        sums.into_iter()
            .map(|(point_id, (x, y, n))| {
                let n = n as f64;
                (
                    point_id.clone(),
                    Point3d {
                        x: x / n,
                        y: y / n,
                        z: 0.0,
                    },
                )
            })
            .collect()
    }
}

/// Build the aggregated record for one complete tracker slot.
///
/// `target_frame` is the last requested frame; without one, the first
/// camera's frame number is used.
pub fn join_observations(
    join: CompleteJoin,
    target_frame: Option<FrameNumber>,
    camera_group_id: &str,
    policy: FrameMismatchPolicy,
    triangulator: &dyn Triangulator,
) -> Result<AggregatedFrameMessage, PipelineError> {
    let frames: Vec<FrameNumber> = join.observations.values().map(|obs| obs.frame_number).collect();
    let frame_number = target_frame
        .or_else(|| frames.first().copied())
        .unwrap_or_default();

    if frames.iter().any(|frame| *frame != frame_number) {
        match policy {
            FrameMismatchPolicy::Warn => log::warn!(
                "group {} tracker {}: joining observations from frames {:?} as frame {}",
                camera_group_id,
                join.tracker_name,
                frames,
                frame_number
            ),
            FrameMismatchPolicy::Strict => {
                return Err(PipelineError::FrameMismatch {
                    context: format!("group {} tracker {}", camera_group_id, join.tracker_name),
                    expected: frame_number,
                    actual: frames,
                })
            }
        }
    }

    let camera_observations: BTreeMap<CameraId, Observation> = join
        .observations
        .into_iter()
        .map(|(camera_id, message)| (camera_id, message.observation))
        .collect();
    Ok(AggregatedFrameMessage {
        frame_number,
        camera_group_id: camera_group_id.to_string(),
        tracker_name: join.tracker_name,
        tracked_points: triangulator.triangulate(&camera_observations),
        camera_observations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CameraObservationMessage;

    fn join_of(frames: &[(&str, FrameNumber, Observation)]) -> CompleteJoin {
        CompleteJoin {
            tracker_name: "t".to_string(),
            observations: frames
                .iter()
                .map(|(camera_id, frame_number, observation)| {
                    (
                        camera_id.to_string(),
                        CameraObservationMessage {
                            camera_id: camera_id.to_string(),
                            frame_number: *frame_number,
                            tracker_name: "t".to_string(),
                            observation: observation.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn mean_projection_averages_shared_points() {
        let a = Observation::new().with_point("p", 2.0, 4.0).with_point("q", 1.0, 1.0);
        let b = Observation::new().with_point("p", 4.0, 8.0);
        let msg = join_observations(
            join_of(&[("0", 5, a.clone()), ("1", 5, b.clone())]),
            Some(5),
            "g",
            FrameMismatchPolicy::Strict,
            &MeanProjection,
        )
        .unwrap();

        assert_eq!(msg.frame_number, 5);
        assert_eq!(msg.camera_group_id, "g");
        assert_eq!(msg.tracker_name, "t");
        assert_eq!(msg.tracked_points["p"], Point3d { x: 3.0, y: 6.0, z: 0.0 });
        assert_eq!(msg.tracked_points["q"], Point3d { x: 1.0, y: 1.0, z: 0.0 });
        assert_eq!(msg.camera_observations["0"], a);
        assert_eq!(msg.camera_observations["1"], b);
    }

    #[test]
    fn mismatch_warns_and_uses_target_frame() {
        let obs = Observation::new().with_point("p", 1.0, 1.0);
        let msg = join_observations(
            join_of(&[("0", 5, obs.clone()), ("1", 6, obs)]),
            Some(6),
            "g",
            FrameMismatchPolicy::Warn,
            &MeanProjection,
        )
        .unwrap();
        assert_eq!(msg.frame_number, 6);
    }

    #[test]
    fn mismatch_is_fatal_when_strict() {
        let obs = Observation::new().with_point("p", 1.0, 1.0);
        let err = join_observations(
            join_of(&[("0", 5, obs.clone()), ("1", 6, obs)]),
            Some(6),
            "g",
            FrameMismatchPolicy::Strict,
            &MeanProjection,
        )
        .unwrap_err();
        assert_eq!(
            err,
            PipelineError::FrameMismatch {
                context: "group g tracker t".to_string(),
                expected: 6,
                actual: vec![5, 6],
            }
        );
        assert!(err.is_contract_violation());
    }

    #[test]
    fn target_falls_back_to_first_camera() {
        let obs = Observation::new().with_point("p", 1.0, 1.0);
        let msg = join_observations(
            join_of(&[("0", 9, obs.clone()), ("1", 9, obs)]),
            None,
            "g",
            FrameMismatchPolicy::Strict,
            &MeanProjection,
        )
        .unwrap();
        assert_eq!(msg.frame_number, 9);
    }
}
