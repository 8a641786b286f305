use std::collections::BTreeMap;

use crate::error::PipelineError;
use crate::message::CameraObservationMessage;
use crate::{CameraId, TrackerName};

type Slot = BTreeMap<CameraId, Option<CameraObservationMessage>>;

/// Per-tracker, per-camera observations awaiting a join.
///
/// Every slot always carries every camera id of the group as a key. A slot is
/// reset to all-absent as soon as it is taken for a join.
#[derive(Debug)]
pub struct Accumulator {
    camera_ids: Vec<CameraId>,
    slots: BTreeMap<TrackerName, Slot>,
}

/// One fully populated tracker slot, ready to be joined.
#[derive(Clone, Debug, PartialEq)]
pub struct CompleteJoin {
    pub tracker_name: TrackerName,
    pub observations: BTreeMap<CameraId, CameraObservationMessage>,
}

impl Accumulator {
    pub fn new<I, S>(camera_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CameraId>,
    {
        let mut camera_ids: Vec<CameraId> = camera_ids.into_iter().map(Into::into).collect();
        camera_ids.sort();
        camera_ids.dedup();
        Self {
            camera_ids,
            slots: BTreeMap::new(),
        }
    }

    pub fn camera_ids(&self) -> &[CameraId] {
        &self.camera_ids
    }

    fn empty_slot(&self) -> Slot {
        self.camera_ids.iter().map(|id| (id.clone(), None)).collect()
    }

    /// Store an observation under `(tracker_name, camera_id)`.
    ///
    /// A repeat for the same key overwrites the earlier observation.
    pub fn insert(&mut self, message: CameraObservationMessage) -> Result<(), PipelineError> {
        if !self.camera_ids.contains(&message.camera_id) {
            return Err(PipelineError::UnknownCamera {
                camera_id: message.camera_id,
                camera_ids: self.camera_ids.clone(),
            });
        }
        if !self.slots.contains_key(&message.tracker_name) {
            let slot = self.empty_slot();
            self.slots.insert(message.tracker_name.clone(), slot);
        }
        if let Some(slot) = self.slots.get_mut(&message.tracker_name) {
            if let Some(Some(previous)) = slot.get(&message.camera_id) {
                log::debug!(
                    "camera {} tracker {}: frame {} replaces unjoined frame {}",
                    message.camera_id,
                    message.tracker_name,
                    message.frame_number,
                    previous.frame_number
                );
            }
            slot.insert(message.camera_id.clone(), Some(message));
        }
        Ok(())
    }

    pub fn slot(&self, tracker_name: &str) -> Option<&BTreeMap<CameraId, Option<CameraObservationMessage>>> {
        self.slots.get(tracker_name)
    }

    /// True when some slot holds observations from only part of the group.
    pub fn has_partial(&self) -> bool {
        self.slots.values().any(|slot| {
            let filled = slot.values().filter(|entry| entry.is_some()).count();
            filled > 0 && filled < slot.len()
        })
    }

    /// True when no observation is held at all.
    pub fn is_idle(&self) -> bool {
        self.slots
            .values()
            .all(|slot| slot.values().all(Option::is_none))
    }

    /// Take every fully populated slot, leaving it all-absent.
    pub fn take_complete(&mut self) -> Result<Vec<CompleteJoin>, PipelineError> {
        let mut joins = Vec::new();
        for (tracker_name, slot) in self.slots.iter_mut() {
            if slot.len() != self.camera_ids.len() {
                return Err(PipelineError::CameraCountMismatch {
                    tracker_name: tracker_name.clone(),
                    expected: self.camera_ids.len(),
                    actual: slot.len(),
                });
            }
            if slot.values().any(Option::is_none) {
                continue;
            }
            let observations = slot
                .iter_mut()
                .filter_map(|(camera_id, entry)| entry.take().map(|obs| (camera_id.clone(), obs)))
                .collect();
            joins.push(CompleteJoin {
                tracker_name: tracker_name.clone(),
                observations,
            });
        }
        Ok(joins)
    }

    /// Drop the contents of partially populated slots. Returns how many were reset.
    pub fn reset_partial(&mut self) -> usize {
        let mut reset = 0;
        for slot in self.slots.values_mut() {
            if slot.values().any(Option::is_some) {
                slot.values_mut().for_each(|entry| *entry = None);
                reset += 1;
            }
        }
        reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Observation;
    use crate::FrameNumber;

    fn obs(camera_id: &str, frame_number: FrameNumber, tracker: &str) -> CameraObservationMessage {
        CameraObservationMessage {
            camera_id: camera_id.to_string(),
            frame_number,
            tracker_name: tracker.to_string(),
            observation: Observation::new().with_point("p", 1.0, 2.0),
        }
    }

    #[test]
    fn join_takes_full_slot_and_leaves_it_empty() {
        let mut acc = Accumulator::new(["0", "1", "2"]);
        acc.insert(obs("1", 7, "t")).unwrap();
        acc.insert(obs("0", 7, "t")).unwrap();
        assert!(acc.has_partial());
        assert!(acc.take_complete().unwrap().is_empty());

        acc.insert(obs("2", 7, "t")).unwrap();
        let joins = acc.take_complete().unwrap();
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].tracker_name, "t");
        assert_eq!(
            joins[0].observations.keys().collect::<Vec<_>>(),
            vec!["0", "1", "2"]
        );

        let slot = acc.slot("t").unwrap();
        assert_eq!(slot.len(), 3);
        assert!(slot.values().all(Option::is_none));
        assert!(acc.is_idle());
        assert!(acc.take_complete().unwrap().is_empty());
    }

    #[test]
    fn next_frame_partial_does_not_complete() {
        let mut acc = Accumulator::new(["0", "1"]);
        acc.insert(obs("0", 5, "t")).unwrap();
        acc.insert(obs("1", 5, "t")).unwrap();
        assert_eq!(acc.take_complete().unwrap().len(), 1);

        acc.insert(obs("0", 6, "t")).unwrap();
        assert!(acc.take_complete().unwrap().is_empty());
        assert!(acc.has_partial());
    }

    #[test]
    fn trackers_join_independently() {
        let mut acc = Accumulator::new(["0", "1"]);
        acc.insert(obs("0", 5, "a")).unwrap();
        acc.insert(obs("0", 5, "b")).unwrap();
        acc.insert(obs("1", 5, "b")).unwrap();
        let joins = acc.take_complete().unwrap();
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].tracker_name, "b");
        assert!(acc.slot("a").unwrap()["0"].is_some());
    }

    #[test]
    fn unknown_camera_is_rejected_and_not_stored() {
        let mut acc = Accumulator::new(["0", "1"]);
        let err = acc.insert(obs("7", 5, "t")).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownCamera { ref camera_id, .. } if camera_id == "7"));
        assert!(err.is_contract_violation());
        assert!(acc.slot("t").is_none());
        assert!(acc.is_idle());
    }

    #[test]
    fn repeat_observation_overwrites() {
        let mut acc = Accumulator::new(["0", "1"]);
        acc.insert(obs("0", 5, "t")).unwrap();
        acc.insert(obs("0", 6, "t")).unwrap();
        acc.insert(obs("1", 6, "t")).unwrap();
        let joins = acc.take_complete().unwrap();
        assert_eq!(joins[0].observations["0"].frame_number, 6);
    }

    #[test]
    fn reset_partial_clears_only_populated_slots() {
        let mut acc = Accumulator::new(["0", "1"]);
        acc.insert(obs("0", 5, "a")).unwrap();
        acc.insert(obs("0", 5, "b")).unwrap();
        acc.insert(obs("1", 5, "b")).unwrap();
        acc.take_complete().unwrap();
        assert_eq!(acc.reset_partial(), 1);
        assert!(acc.is_idle());
        assert!(!acc.has_partial());
    }
}
