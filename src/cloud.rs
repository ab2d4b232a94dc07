//! Per-cycle point storage and the candidate filters the matcher and tracker search with.

use nalgebra::{Point3, Vector2};
use serde::{Deserialize, Serialize};

use crate::geometry::{elevation, horizontal};

/// Dense positions with a parallel tombstone flag per point.
///
/// Indices stay stable until [`PointCloud::compact`]; removal only sets the flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    positions: Vec<Point3<f32>>,
    tombstones: Vec<bool>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points<I: IntoIterator<Item = Point3<f32>>>(points: I) -> Self {
        let positions: Vec<_> = points.into_iter().collect();
        let tombstones = vec![false; positions.len()];
        Self { positions, tombstones }
    }

    pub fn push(&mut self, p: Point3<f32>) -> usize {
        self.positions.push(p);
        self.tombstones.push(false);
        self.positions.len() - 1
    }

    /// Slot count, tombstoned points included.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn live_len(&self) -> usize {
        self.tombstones.iter().filter(|t| !**t).count()
    }

    pub fn position(&self, i: usize) -> Point3<f32> {
        self.positions[i]
    }

    pub fn set_position(&mut self, i: usize, p: Point3<f32>) {
        self.positions[i] = p;
    }

    pub fn is_live(&self, i: usize) -> bool {
        i < self.tombstones.len() && !self.tombstones[i]
    }

    pub fn tombstone(&mut self, i: usize) {
        if let Some(t) = self.tombstones.get_mut(i) {
            *t = true;
        }
    }

    pub fn live(&self) -> impl Iterator<Item = (usize, &Point3<f32>)> + '_ {
        self.positions
            .iter()
            .enumerate()
            .filter(move |(i, _)| !self.tombstones[*i])
    }

    pub fn live_points(&self) -> Vec<Point3<f32>> {
        self.live().map(|(_, p)| *p).collect()
    }

    /// Drops tombstoned points, keeping the discovery order of the rest.
    pub fn compact(&self) -> PointCloud {
        PointCloud::from_points(self.live().map(|(_, p)| *p))
    }

    /// Stable sort, highest point first.
    pub fn sort_by_elevation_desc(&mut self) {
        let mut pairs: Vec<(Point3<f32>, bool)> = self
            .positions
            .iter()
            .copied()
            .zip(self.tombstones.iter().copied())
            .collect();
        pairs.sort_by(|a, b| elevation(&b.0).total_cmp(&elevation(&a.0)));
        self.positions = pairs.iter().map(|(p, _)| *p).collect();
        self.tombstones = pairs.iter().map(|(_, t)| *t).collect();
    }
}

/// Boolean mask over a cloud's indices, narrowed by successive filters.
///
/// Bounds are inclusive throughout.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateMask {
    keep: Vec<bool>,
}

impl CandidateMask {
    /// Every live point of `cloud`.
    pub fn live(cloud: &PointCloud) -> Self {
        Self { keep: (0..cloud.len()).map(|i| cloud.is_live(i)).collect() }
    }

    pub fn contains(&self, i: usize) -> bool {
        self.keep.get(i).copied().unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.keep.iter().filter(|k| **k).count()
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.keep.iter().enumerate().filter(|(_, k)| **k).map(|(i, _)| i)
    }

    /// Drops indices tombstoned since the mask was built.
    pub fn live_only(mut self, cloud: &PointCloud) -> Self {
        for (i, k) in self.keep.iter_mut().enumerate() {
            *k = *k && cloud.is_live(i);
        }
        self
    }

    pub fn exclude(mut self, i: usize) -> Self {
        if let Some(k) = self.keep.get_mut(i) {
            *k = false;
        }
        self
    }

    /// Only indices strictly below `end`.
    pub fn before(mut self, end: usize) -> Self {
        for k in self.keep.iter_mut().skip(end) {
            *k = false;
        }
        self
    }

    /// Only indices strictly above `start`.
    pub fn after(mut self, start: usize) -> Self {
        for k in self.keep.iter_mut().take(start.saturating_add(1)) {
            *k = false;
        }
        self
    }

    fn retain(mut self, cloud: &PointCloud, pred: impl Fn(&Point3<f32>) -> bool) -> Self {
        for (i, k) in self.keep.iter_mut().enumerate() {
            if *k && !pred(&cloud.positions[i]) {
                *k = false;
            }
        }
        self
    }

    pub fn height_band(self, cloud: &PointCloud, low: f32, high: f32) -> Self {
        self.retain(cloud, |p| {
            let h = elevation(p);
            h >= low && h <= high
        })
    }

    pub fn height_near(self, cloud: &PointCloud, reference: f32, tolerance: f32) -> Self {
        self.height_band(cloud, reference - tolerance, reference + tolerance)
    }

    /// Horizontal distance to `center` within `radius`; height is ignored.
    pub fn cylinder(self, cloud: &PointCloud, center: &Point3<f32>, radius: f32) -> Self {
        let c = horizontal(center);
        self.retain(cloud, |p| (horizontal(p) - c).norm() <= radius)
    }

    /// Horizontal distance to `reference` within `[min, max]`.
    pub fn horizontal_range(self, cloud: &PointCloud, reference: &Point3<f32>, min: f32, max: f32) -> Self {
        let r = horizontal(reference);
        self.retain(cloud, |p| {
            let d = (horizontal(p) - r).norm();
            d >= min && d <= max
        })
    }

    /// Euclidean distance to `reference` within `[min, max]`.
    pub fn distance_range(self, cloud: &PointCloud, reference: &Point3<f32>, min: f32, max: f32) -> Self {
        self.retain(cloud, |p| {
            let d = (p - reference).norm();
            d >= min && d <= max
        })
    }

    /// Keeps points whose horizontal direction from `reference` lies within
    /// `max_angle_deg` of `axis` in either sense. Points directly above or
    /// below `reference` have no direction and are dropped.
    pub fn on_axis(self, cloud: &PointCloud, reference: &Point3<f32>, axis: &Vector2<f32>, max_angle_deg: f32) -> Self {
        let r = horizontal(reference);
        let limit = 1.0 - max_angle_deg.to_radians().cos();
        self.retain(cloud, |p| {
            let v = r - horizontal(p);
            let n = v.norm();
            if n <= f32::EPSILON {
                return false;
            }
            1.0 - (v / n).dot(axis).abs() <= limit
        })
    }

    /// Closest kept point strictly nearer than `max_distance`.
    ///
    /// Ties go to the lower index.
    pub fn nearest(&self, cloud: &PointCloud, target: &Point3<f32>, max_distance: f32) -> Option<usize> {
        let mut best = None;
        let mut best_dist = max_distance;
        for i in self.indices() {
            let d = (cloud.positions[i] - target).norm();
            if d < best_dist {
                best_dist = d;
                best = Some(i);
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::at_elevation;

    fn sample() -> PointCloud {
        PointCloud::from_points([
            at_elevation(0.0, 0.0, 10.0),
            at_elevation(0.0, 5.0, 50.0),
            at_elevation(20.0, 0.0, 30.0),
            at_elevation(0.0, -3.0, 30.0),
        ])
    }

    #[test]
    fn test_tombstone_and_compact_keep_order() {
        let mut cloud = sample();
        cloud.tombstone(1);
        assert_eq!(cloud.len(), 4);
        assert_eq!(cloud.live_len(), 3);
        let compacted = cloud.compact();
        assert_eq!(compacted.len(), 3);
        assert_eq!(compacted.position(0), cloud.position(0));
        assert_eq!(compacted.position(1), cloud.position(2));
        assert_eq!(compacted.position(2), cloud.position(3));
    }

    #[test]
    fn test_sort_is_stable_and_descending() {
        let mut cloud = sample();
        cloud.sort_by_elevation_desc();
        let heights: Vec<f32> = (0..cloud.len()).map(|i| elevation(&cloud.position(i))).collect();
        assert_eq!(heights, vec![50.0, 30.0, 30.0, 10.0]);
        // equal heights keep insertion order
        assert_eq!(cloud.position(1).x, 20.0);
        assert_eq!(cloud.position(2).y, -3.0);
    }

    #[test]
    fn test_height_band_is_inclusive() {
        let cloud = sample();
        let mask = CandidateMask::live(&cloud).height_band(&cloud, 30.0, 50.0);
        assert_eq!(mask.indices().collect::<Vec<_>>(), vec![1, 2, 3]);
        let mask = CandidateMask::live(&cloud).height_near(&cloud, 25.0, 5.0);
        assert_eq!(mask.indices().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_on_axis_accepts_both_senses() {
        let cloud = PointCloud::from_points([
            at_elevation(0.0, 10.0, 0.0),
            at_elevation(0.0, -10.0, 0.0),
            at_elevation(10.0, 0.0, 0.0),
            at_elevation(0.0, 0.0, 40.0),
        ]);
        let axis = Vector2::new(0.0, 1.0);
        let mask = CandidateMask::live(&cloud).on_axis(&cloud, &Point3::origin(), &axis, 10.0);
        assert_eq!(mask.indices().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_nearest_is_strict_and_skips_tombstones() {
        let mut cloud = sample();
        let target = at_elevation(0.0, 0.0, 30.0);
        let mask = CandidateMask::live(&cloud);
        assert_eq!(mask.nearest(&cloud, &target, 100.0), Some(3));
        assert_eq!(mask.nearest(&cloud, &target, 3.0), None);
        cloud.tombstone(3);
        let mask = CandidateMask::live(&cloud);
        // points 0 and 2 are both 20 away; the lower index wins
        assert_eq!(mask.nearest(&cloud, &target, 100.0), Some(0));
        assert!(!mask.contains(3));
    }

    #[test]
    fn test_before_after_bounds() {
        let cloud = sample();
        let mask = CandidateMask::live(&cloud).after(0).before(3);
        assert_eq!(mask.indices().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(mask.count(), 2);
    }
}
