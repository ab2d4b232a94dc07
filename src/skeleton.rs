use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// Anatomical landmarks, in tracking order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JointId {
    Hip = 0,
    Chest = 1,
    Head = 2,
    ShoulderL = 3,
    ShoulderR = 4,
    ElbowL = 5,
    ElbowR = 6,
    HandL = 7,
    HandR = 8,
    KneeL = 9,
    KneeR = 10,
    FootL = 11,
    FootR = 12,
}

pub const JOINT_COUNT: usize = 13;

impl JointId {
    pub const ALL: [JointId; JOINT_COUNT] = [
        JointId::Hip,
        JointId::Chest,
        JointId::Head,
        JointId::ShoulderL,
        JointId::ShoulderR,
        JointId::ElbowL,
        JointId::ElbowR,
        JointId::HandL,
        JointId::HandR,
        JointId::KneeL,
        JointId::KneeR,
        JointId::FootL,
        JointId::FootR,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            JointId::Hip => "hip",
            JointId::Chest => "chest",
            JointId::Head => "head",
            JointId::ShoulderL => "shoulder_l",
            JointId::ShoulderR => "shoulder_r",
            JointId::ElbowL => "elbow_l",
            JointId::ElbowR => "elbow_r",
            JointId::HandL => "hand_l",
            JointId::HandR => "hand_r",
            JointId::KneeL => "knee_l",
            JointId::KneeR => "knee_r",
            JointId::FootL => "foot_l",
            JointId::FootR => "foot_r",
        }
    }
}

/// The constrained point must stay within `[min, max]` of `reference`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceConstraint {
    pub reference: JointId,
    pub min: f32,
    pub max: f32,
}

impl DistanceConstraint {
    /// `length ± slack`, floored at zero.
    pub fn around(reference: JointId, length: f32, slack: f32) -> Self {
        Self { reference, min: (length - slack).max(0.0), max: length + slack }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkeletonState {
    Unmatched,
    Matched,
}

/// Output of a successful match, applied to a [`Skeleton`] as a whole.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedSkeleton {
    pub points: [Point3<f32>; JOINT_COUNT],
    pub constraints: [Vec<DistanceConstraint>; JOINT_COUNT],
}

#[derive(Debug, Clone, PartialEq)]
pub struct Skeleton {
    points: [Point3<f32>; JOINT_COUNT],
    constraints: [Vec<DistanceConstraint>; JOINT_COUNT],
    state: SkeletonState,
}

impl Default for Skeleton {
    fn default() -> Self {
        Self::new()
    }
}

impl Skeleton {
    pub fn new() -> Self {
        Self {
            points: [Point3::origin(); JOINT_COUNT],
            constraints: std::array::from_fn(|_| Vec::new()),
            state: SkeletonState::Unmatched,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.state == SkeletonState::Matched
    }

    pub fn point(&self, joint: JointId) -> Point3<f32> {
        self.points[joint.index()]
    }

    pub fn points(&self) -> &[Point3<f32>; JOINT_COUNT] {
        &self.points
    }

    pub fn set_point(&mut self, joint: JointId, p: Point3<f32>) {
        self.points[joint.index()] = p;
    }

    pub fn constraints(&self, joint: JointId) -> &[DistanceConstraint] {
        &self.constraints[joint.index()]
    }

    /// Replaces pose and constraints wholesale.
    pub fn apply_match(&mut self, matched: MatchedSkeleton) {
        self.points = matched.points;
        self.constraints = matched.constraints;
        self.state = SkeletonState::Matched;
    }
}
