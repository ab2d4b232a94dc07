use crate::config::Config;
use crate::intake::RayFrame;
use crate::matcher::{MatchFailure, SkeletonMatcher};
use crate::protocol::SkeletonUpdate;
use crate::skeleton::Skeleton;
use crate::tracker::{SkeletonTracker, TrackReport};
use crate::triangulation::{Clouds, Triangulator};

/// What the skeleton stage did this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SkeletonStep {
    Matched,
    /// Match attempt failed; pose and constraints are left as they were.
    MatchFailed { reason: MatchFailure },
    Tracked(TrackReport),
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub cycle: u64,
    /// Merged clouds as triangulated, before tracking claimed any points
    pub clouds: Clouds,
    pub step: SkeletonStep,
}

/// Triangulation plus match-or-track over one skeleton owned by the cycle loop.
pub struct Pipeline {
    triangulator: Triangulator,
    matcher: SkeletonMatcher,
    tracker: SkeletonTracker,
    skeleton: Skeleton,
    rematch_pending: bool,
}

impl Pipeline {
    pub fn new(config: &Config) -> Self {
        Self {
            triangulator: Triangulator::new(config.triangulation.clone()),
            matcher: SkeletonMatcher::new(config.matcher.clone()),
            tracker: SkeletonTracker::new(config.tracker.clone()),
            skeleton: Skeleton::new(),
            rematch_pending: false,
        }
    }

    pub fn skeleton(&self) -> &Skeleton {
        &self.skeleton
    }

    /// Re-runs the matcher on every frame until it succeeds once. Tracking is
    /// suspended meanwhile.
    pub fn request_rematch(&mut self) {
        self.rematch_pending = true;
    }

    pub fn process(&mut self, frame: &RayFrame) -> CycleOutcome {
        let clouds = self.triangulator.triangulate(frame);

        let step = if !self.skeleton.is_matched() || self.rematch_pending {
            match self.matcher.match_cloud(&clouds.high) {
                Ok(matched) => {
                    self.skeleton.apply_match(matched);
                    self.rematch_pending = false;
                    SkeletonStep::Matched
                }
                Err(reason) => SkeletonStep::MatchFailed { reason },
            }
        } else {
            SkeletonStep::Tracked(self.track(&clouds))
        };

        CycleOutcome { cycle: frame.cycle, clouds, step }
    }

    fn track(&mut self, clouds: &Clouds) -> TrackReport {
        let mut high = clouds.high.clone();
        let mut low = clouds.low.clone();
        self.tracker.track(&mut self.skeleton, &mut high, &mut low)
    }

    pub fn update(&self, cycle: u64) -> SkeletonUpdate {
        SkeletonUpdate { cycle, matched: self.skeleton.is_matched(), points: *self.skeleton.points() }
    }
}
