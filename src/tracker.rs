use nalgebra::Point3;

use crate::cloud::{CandidateMask, PointCloud};
use crate::config::TrackerConfig;
use crate::skeleton::{JointId, Skeleton, JOINT_COUNT};

/// Which pool a joint was found in this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    High,
    Low,
    /// Nothing qualified; the previous position was kept.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackReport {
    pub sources: [TrackSource; JOINT_COUNT],
}

impl TrackReport {
    pub fn tracked(&self) -> usize {
        self.sources.iter().filter(|s| **s != TrackSource::Stale).count()
    }

    pub fn stale(&self) -> usize {
        JOINT_COUNT - self.tracked()
    }

    pub fn source(&self, joint: JointId) -> TrackSource {
        self.sources[joint.index()]
    }
}

#[derive(Debug, Clone)]
pub struct SkeletonTracker {
    config: TrackerConfig,
}

impl SkeletonTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self { config }
    }

    /// Moves every joint to the nearest qualifying point of this cycle.
    ///
    /// Joints are visited in [`JointId::ALL`] order; each claimed point is
    /// tombstoned so later joints cannot take it. Constraints are checked
    /// against reference positions already updated this cycle.
    pub fn track(&self, skeleton: &mut Skeleton, high: &mut PointCloud, low: &mut PointCloud) -> TrackReport {
        let mut sources = [TrackSource::Stale; JOINT_COUNT];
        for joint in JointId::ALL {
            let previous = skeleton.point(joint);
            let found = self
                .search(skeleton, joint, high, &previous)
                .map(|i| (TrackSource::High, high.position(i), i))
                .or_else(|| self.search(skeleton, joint, low, &previous).map(|i| (TrackSource::Low, low.position(i), i)));

            if let Some((source, position, index)) = found {
                match source {
                    TrackSource::High => high.tombstone(index),
                    _ => low.tombstone(index),
                }
                skeleton.set_point(joint, position);
                sources[joint.index()] = source;
            }
        }
        TrackReport { sources }
    }

    fn search(&self, skeleton: &Skeleton, joint: JointId, cloud: &PointCloud, previous: &Point3<f32>) -> Option<usize> {
        let mut mask = CandidateMask::live(cloud);
        for c in skeleton.constraints(joint) {
            mask = mask.distance_range(cloud, &skeleton.point(c.reference), c.min, c.max);
        }
        mask.nearest(cloud, previous, self.config.max_displacement)
    }
}
