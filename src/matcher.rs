//! Labels an unlabeled high-confidence cloud as a skeleton.
//!
//! Greedy: every stage takes the first candidate in elevation order that
//! satisfies its geometric test, so the result depends on that order.

use nalgebra::{Point3, Vector2};
use thiserror::Error;

use crate::cloud::{CandidateMask, PointCloud};
use crate::config::MatcherConfig;
use crate::geometry::{elevation, horizontal, horizontal_axis, midpoint, signed_area};
use crate::skeleton::{DistanceConstraint, JointId, MatchedSkeleton, JOINT_COUNT};

/// The stage at which a match attempt gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MatchFailure {
    #[error("no foot pair at matching height and span")]
    NoFeet,
    #[error("no head inside the body cylinder")]
    NoHead,
    #[error("no knee pair aligned with the feet")]
    NoKnees,
    #[error("no shoulder/elbow/hand combination resolved")]
    NoArms,
    #[error("no chest between knees and shoulders")]
    NoChest,
    #[error("no hip between knees and chest")]
    NoHip,
    #[error("front direction is degenerate")]
    NoFront,
}

/// Cloud indices of a resolved arm pair, first shoulder's chain first.
struct Arms {
    shoulders: [usize; 2],
    elbows: [usize; 2],
    hands: [usize; 2],
}

#[derive(Debug, Clone)]
pub struct SkeletonMatcher {
    config: MatcherConfig,
}

impl SkeletonMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// Works on a private copy; the caller's cloud is left as is.
    pub fn match_cloud(&self, source: &PointCloud) -> Result<MatchedSkeleton, MatchFailure> {
        let c = &self.config;
        let mut cloud = source.compact();
        cloud.sort_by_elevation_desc();

        let (foot1, foot2) = self.find_feet(&cloud)?;
        let foot_axis = horizontal_axis(&cloud.position(foot2), &cloud.position(foot1))
            .ok_or(MatchFailure::NoFeet)?;
        cloud.tombstone(foot1);
        cloud.tombstone(foot2);

        let feet_center = midpoint(&cloud.position(foot1), &cloud.position(foot2));
        let body = CandidateMask::live(&cloud).cylinder(&cloud, &feet_center, c.max_shoulder_span / 2.0);

        let head = body.indices().next().ok_or(MatchFailure::NoHead)?;
        cloud.tombstone(head);

        let (knee1, knee2) = self.find_knees(&cloud, &body, foot1.min(foot2), &foot_axis)?;
        cloud.tombstone(knee1);
        cloud.tombstone(knee2);
        let knee_top = elevation(&cloud.position(knee1)).max(elevation(&cloud.position(knee2)));

        let arms = self.find_arms(&cloud, &body, head, knee_top, &foot_axis)?;
        for i in arms.shoulders.iter().chain(&arms.elbows).chain(&arms.hands) {
            cloud.tombstone(*i);
        }
        let [s1, s2] = arms.shoulders;
        let shoulder_center = midpoint(&cloud.position(s1), &cloud.position(s2));
        let shoulder_low = elevation(&cloud.position(s1)).min(elevation(&cloud.position(s2)));

        let chest = body
            .clone()
            .live_only(&cloud)
            .height_band(&cloud, knee_top + c.hip_knee_offset, shoulder_low)
            .nearest(&cloud, &shoulder_center, f32::INFINITY)
            .ok_or(MatchFailure::NoChest)?;
        cloud.tombstone(chest);

        let hip = body
            .clone()
            .live_only(&cloud)
            .height_band(&cloud, knee_top + c.hip_knee_offset, elevation(&cloud.position(chest)))
            .nearest(&cloud, &cloud.position(chest), f32::INFINITY)
            .ok_or(MatchFailure::NoHip)?;

        let pos = |i: usize| cloud.position(i);
        // front: bisector of both shoulder→chest vectors
        let chest_xy = horizontal(&pos(chest));
        let front = (chest_xy - horizontal(&pos(s1))) + (chest_xy - horizontal(&pos(s2)));
        if front.norm() <= f32::EPSILON {
            return Err(MatchFailure::NoFront);
        }
        let ahead = chest_xy + front.normalize();
        let is_left = |i: usize| signed_area(&chest_xy, &ahead, &horizontal(&pos(i))) > 0.0;

        let (knee_l, knee_r) = if is_left(knee1) { (knee1, knee2) } else { (knee2, knee1) };
        let (foot_l, foot_r) = if is_left(foot1) { (foot1, foot2) } else { (foot2, foot1) };
        let (l, r) = if is_left(s1) { (0, 1) } else { (1, 0) };

        let mut points = [Point3::origin(); JOINT_COUNT];
        let mut assign = |joint: JointId, i: usize| points[joint.index()] = pos(i);
        assign(JointId::Hip, hip);
        assign(JointId::Chest, chest);
        assign(JointId::Head, head);
        assign(JointId::ShoulderL, arms.shoulders[l]);
        assign(JointId::ShoulderR, arms.shoulders[r]);
        assign(JointId::ElbowL, arms.elbows[l]);
        assign(JointId::ElbowR, arms.elbows[r]);
        assign(JointId::HandL, arms.hands[l]);
        assign(JointId::HandR, arms.hands[r]);
        assign(JointId::KneeL, knee_l);
        assign(JointId::KneeR, knee_r);
        assign(JointId::FootL, foot_l);
        assign(JointId::FootR, foot_r);

        let constraints = self.derive_constraints(&points);
        Ok(MatchedSkeleton { points, constraints })
    }

    /// Lowest point with a partner at similar height and a plausible stance width.
    fn find_feet(&self, cloud: &PointCloud) -> Result<(usize, usize), MatchFailure> {
        let c = &self.config;
        let live = CandidateMask::live(cloud);
        for i in (0..cloud.len()).rev() {
            if !live.contains(i) {
                continue;
            }
            let p = cloud.position(i);
            let partner = live
                .clone()
                .exclude(i)
                .height_near(cloud, elevation(&p), c.foot_height_tolerance)
                .horizontal_range(cloud, &p, c.min_shoulder_span, c.max_shoulder_span)
                .nearest(cloud, &p, f32::INFINITY);
            if let Some(j) = partner {
                return Ok((i, j));
            }
        }
        Err(MatchFailure::NoFeet)
    }

    /// First knee-height body point, scanning upward from the feet, with an aligned partner.
    fn find_knees(
        &self,
        cloud: &PointCloud,
        body: &CandidateMask,
        lowest_foot: usize,
        foot_axis: &Vector2<f32>,
    ) -> Result<(usize, usize), MatchFailure> {
        let c = &self.config;
        let knees = body.clone().live_only(cloud).height_band(cloud, 0.0, c.max_knee_elevation);
        for i in (0..lowest_foot).rev() {
            if !knees.contains(i) {
                continue;
            }
            let p = cloud.position(i);
            let partner = knees
                .clone()
                .exclude(i)
                .height_near(cloud, elevation(&p), c.knee_height_tolerance)
                .on_axis(cloud, &p, foot_axis, c.max_knee_foot_angle_deg)
                .nearest(cloud, &p, f32::INFINITY);
            if let Some(j) = partner {
                return Ok((i, j));
            }
        }
        Err(MatchFailure::NoKnees)
    }

    fn find_arms(
        &self,
        cloud: &PointCloud,
        body: &CandidateMask,
        head: usize,
        knee_top: f32,
        foot_axis: &Vector2<f32>,
    ) -> Result<Arms, MatchFailure> {
        let c = &self.config;
        let torso = body.clone().live_only(cloud);
        for i in (head + 1)..cloud.len() {
            if !torso.contains(i) {
                continue;
            }
            let p = cloud.position(i);
            if elevation(&p) <= knee_top {
                break;
            }
            let partners = torso
                .clone()
                .after(i)
                .height_near(cloud, elevation(&p), c.shoulder_height_tolerance)
                .on_axis(cloud, &p, foot_axis, c.max_shoulder_foot_angle_deg);
            for j in partners.indices() {
                if let Some(arms) = self.resolve_arms(cloud, i, j, foot_axis) {
                    return Ok(arms);
                }
            }
        }
        Err(MatchFailure::NoArms)
    }

    /// Elbows and hands for a shoulder pair, searched in the whole cloud.
    fn resolve_arms(&self, cloud: &PointCloud, s1: usize, s2: usize, foot_axis: &Vector2<f32>) -> Option<Arms> {
        let c = &self.config;
        let center = midpoint(&cloud.position(s1), &cloud.position(s2));
        let arm = CandidateMask::live(cloud)
            .exclude(s1)
            .exclude(s2)
            .height_near(cloud, elevation(&center), c.arm_height_tolerance)
            .on_axis(cloud, &center, foot_axis, c.max_arm_foot_angle_deg);

        let e1 = arm.nearest(cloud, &cloud.position(s1), f32::INFINITY)?;
        let arm = arm.exclude(e1);
        let e2 = arm.nearest(cloud, &cloud.position(s2), f32::INFINITY)?;
        let arm = arm.exclude(e2);
        let h1 = arm.nearest(cloud, &cloud.position(e1), f32::INFINITY)?;
        let h2 = arm.exclude(h1).nearest(cloud, &cloud.position(e2), f32::INFINITY)?;
        Some(Arms { shoulders: [s1, s2], elbows: [e1, e2], hands: [h1, h2] })
    }

    /// Each distal limb point is held within its measured length ± slack of the proximal one.
    fn derive_constraints(&self, points: &[Point3<f32>; JOINT_COUNT]) -> [Vec<DistanceConstraint>; JOINT_COUNT] {
        const SEGMENTS: [(JointId, JointId); 6] = [
            (JointId::FootL, JointId::KneeL),
            (JointId::FootR, JointId::KneeR),
            (JointId::ElbowL, JointId::ShoulderL),
            (JointId::ElbowR, JointId::ShoulderR),
            (JointId::HandL, JointId::ElbowL),
            (JointId::HandR, JointId::ElbowR),
        ];
        let mut constraints: [Vec<DistanceConstraint>; JOINT_COUNT] = std::array::from_fn(|_| Vec::new());
        for (distal, proximal) in SEGMENTS {
            let length = (points[distal.index()] - points[proximal.index()]).norm();
            constraints[distal.index()].push(DistanceConstraint::around(proximal, length, self.config.constraint_slack));
        }
        constraints
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geometry::at_elevation;

    /// Upright figure facing +x; left is -y. Two decoys outside the body.
    pub(crate) fn synthetic_figure() -> Vec<(Option<JointId>, Point3<f32>)> {
        vec![
            (Some(JointId::Head), at_elevation(0.0, 0.0, 165.0)),
            (Some(JointId::ShoulderL), at_elevation(0.0, -20.0, 140.0)),
            (Some(JointId::ShoulderR), at_elevation(0.0, 20.0, 139.0)),
            (Some(JointId::ElbowL), at_elevation(0.0, -45.0, 139.5)),
            (Some(JointId::ElbowR), at_elevation(0.0, 45.0, 138.5)),
            (Some(JointId::HandL), at_elevation(0.0, -70.0, 139.2)),
            (Some(JointId::HandR), at_elevation(0.0, 70.0, 138.2)),
            (Some(JointId::Chest), at_elevation(5.0, 0.0, 120.0)),
            (Some(JointId::Hip), at_elevation(0.0, 0.0, 95.0)),
            (Some(JointId::KneeL), at_elevation(0.0, -12.0, 50.0)),
            (Some(JointId::KneeR), at_elevation(0.0, 12.0, 49.0)),
            (Some(JointId::FootL), at_elevation(0.0, -15.0, 2.0)),
            (Some(JointId::FootR), at_elevation(0.0, 15.0, 0.0)),
            (None, at_elevation(60.0, 60.0, 100.0)),
            (None, at_elevation(0.0, 80.0, 10.0)),
        ]
    }

    pub(crate) fn synthetic_cloud() -> PointCloud {
        PointCloud::from_points(synthetic_figure().into_iter().map(|(_, p)| p))
    }

    fn matcher() -> SkeletonMatcher {
        SkeletonMatcher::new(MatcherConfig::default())
    }

    #[test]
    fn test_labels_synthetic_figure() {
        let matched = matcher().match_cloud(&synthetic_cloud()).unwrap();
        for (joint, p) in synthetic_figure() {
            if let Some(joint) = joint {
                assert_eq!(matched.points[joint.index()], p, "{}", joint.name());
            }
        }
    }

    #[test]
    fn test_match_is_deterministic() {
        let m = matcher();
        let first = m.match_cloud(&synthetic_cloud()).unwrap();
        for _ in 0..5 {
            assert_eq!(m.match_cloud(&synthetic_cloud()).unwrap(), first);
        }
    }

    #[test]
    fn test_insertion_order_does_not_change_labels() {
        let mut figure = synthetic_figure();
        figure.reverse();
        let cloud = PointCloud::from_points(figure.iter().map(|(_, p)| *p));
        let matched = matcher().match_cloud(&cloud).unwrap();
        assert_eq!(matched, matcher().match_cloud(&synthetic_cloud()).unwrap());
    }

    #[test]
    fn test_constraints_cover_all_six_segments() {
        let matched = matcher().match_cloud(&synthetic_cloud()).unwrap();
        let expect = [
            (JointId::FootL, JointId::KneeL),
            (JointId::FootR, JointId::KneeR),
            (JointId::ElbowL, JointId::ShoulderL),
            (JointId::ElbowR, JointId::ShoulderR),
            (JointId::HandL, JointId::ElbowL),
            (JointId::HandR, JointId::ElbowR),
        ];
        for (distal, proximal) in expect {
            let list = &matched.constraints[distal.index()];
            assert_eq!(list.len(), 1, "{}", distal.name());
            let length = (matched.points[distal.index()] - matched.points[proximal.index()]).norm();
            assert_eq!(list[0].reference, proximal);
            assert!((list[0].min - (length - 5.0)).abs() < 1e-4);
            assert!((list[0].max - (length + 5.0)).abs() < 1e-4);
        }
        for joint in [JointId::Hip, JointId::Chest, JointId::Head, JointId::ShoulderL, JointId::KneeR] {
            assert!(matched.constraints[joint.index()].is_empty());
        }
    }

    #[test]
    fn test_failure_stages() {
        let m = matcher();
        assert_eq!(m.match_cloud(&PointCloud::new()), Err(MatchFailure::NoFeet));

        let feet = [at_elevation(0.0, -15.0, 2.0), at_elevation(0.0, 15.0, 0.0)];
        assert_eq!(m.match_cloud(&PointCloud::from_points(feet)), Err(MatchFailure::NoHead));

        let mut cloud = PointCloud::from_points(feet);
        cloud.push(at_elevation(0.0, 0.0, 165.0));
        assert_eq!(m.match_cloud(&cloud), Err(MatchFailure::NoKnees));

        cloud.push(at_elevation(0.0, -12.0, 50.0));
        cloud.push(at_elevation(0.0, 12.0, 49.0));
        assert_eq!(m.match_cloud(&cloud), Err(MatchFailure::NoArms));
    }

    #[test]
    fn test_missing_chest_fails() {
        let cloud = PointCloud::from_points(
            synthetic_figure()
                .into_iter()
                .filter(|(j, _)| !matches!(j, Some(JointId::Chest) | Some(JointId::Hip)))
                .map(|(_, p)| p),
        );
        assert_eq!(matcher().match_cloud(&cloud), Err(MatchFailure::NoChest));
    }

    #[test]
    fn test_feet_too_far_apart() {
        let cloud = PointCloud::from_points([at_elevation(0.0, -40.0, 0.0), at_elevation(0.0, 40.0, 0.0)]);
        assert_eq!(matcher().match_cloud(&cloud), Err(MatchFailure::NoFeet));
    }
}
