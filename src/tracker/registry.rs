use crate::tracker::backend::FrameTracker;
use crate::tracker::TrackerConfig;

/// Active trackers of one camera worker, built once per configuration.
#[derive(Default)]
pub struct TrackerSet {
    trackers: Vec<Box<dyn FrameTracker>>,
}

impl TrackerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[TrackerConfig]) -> Self {
        let mut set = Self::new();
        for config in configs {
            set.push(config.build());
        }
        set
    }

    /// Add a tracker. A tracker with a name already present replaces it.
    pub fn push(&mut self, tracker: Box<dyn FrameTracker>) {
        let name = tracker.name();
        self.trackers.retain(|existing| existing.name() != name);
        self.trackers.push(tracker);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.trackers.iter().map(|tracker| tracker.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn FrameTracker>> {
        self.trackers.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_kinds_collapse_to_last_config() {
        let set = TrackerSet::from_configs(&[
            TrackerConfig::BrightSpot { threshold: 100 },
            TrackerConfig::Motion,
            TrackerConfig::BrightSpot { threshold: 250 },
        ]);
        assert_eq!(set.names(), vec!["motion", "bright_spot"]);
    }
}
