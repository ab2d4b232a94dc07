use nalgebra::{Matrix3, Point3};

use crate::cloud::PointCloud;
use crate::config::TriangulationConfig;
use crate::geometry::{elevation, midpoint, Ray};
use crate::intake::RayFrame;

/// Closest approach of two rays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// Midpoint of the two closest points
    pub point: Point3<f32>,
    /// Parameter along the first ray
    pub t1: f32,
    /// Parameter along the second ray
    pub t2: f32,
    /// Distance between the two closest points
    pub gap: f32,
}

/// Closest points of two lines. `None` when the lines are parallel within `parallel_epsilon`.
///
/// Returns (t1, t2, p1, p2) without any sign or gap check.
pub fn closest_approach(
    r1: &Ray,
    r2: &Ray,
    parallel_epsilon: f32,
) -> Option<(f32, f32, Point3<f32>, Point3<f32>)> {
    let cross = r1.direction.cross(&r2.direction);
    let den = cross.norm_squared();
    if den <= parallel_epsilon {
        return None;
    }
    let diff = r2.origin - r1.origin;
    let t1 = Matrix3::from_rows(&[diff.transpose(), r2.direction.transpose(), cross.transpose()])
        .determinant()
        / den;
    let t2 = Matrix3::from_rows(&[diff.transpose(), r1.direction.transpose(), cross.transpose()])
        .determinant()
        / den;
    Some((t1, t2, r1.at(t1), r2.at(t2)))
}

/// Both point pools for one cycle, already merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Clouds {
    /// Points seen by three cameras
    pub high: PointCloud,
    /// Points seen by at least two cameras
    pub low: PointCloud,
}

#[derive(Debug, Clone)]
pub struct Triangulator {
    config: TriangulationConfig,
}

impl Triangulator {
    pub fn new(config: TriangulationConfig) -> Self {
        Self { config }
    }

    /// Accepted intersection: both rays forward, gap within `max_gap`, above the floor.
    pub fn intersect(&self, r1: &Ray, r2: &Ray, max_gap: f32) -> Option<RayHit> {
        let (t1, t2, p1, p2) = closest_approach(r1, r2, self.config.parallel_epsilon)?;
        if t1 < 0.0 || t2 < 0.0 {
            return None;
        }
        let gap = (p1 - p2).norm();
        if gap > max_gap {
            return None;
        }
        let point = midpoint(&p1, &p2);
        if elevation(&point) <= self.config.floor_elevation {
            return None;
        }
        Some(RayHit { point, t1, t2, gap })
    }

    /// Every accepted ray pair from every pair of cameras.
    pub fn low_confidence(&self, frame: &RayFrame) -> PointCloud {
        let gap = self.config.low_confidence_gap;
        let mut cloud = PointCloud::new();
        let buckets = &frame.buckets;
        for i in 0..buckets.len() {
            for j in (i + 1)..buckets.len() {
                for r1 in &buckets[i].rays {
                    for r2 in &buckets[j].rays {
                        if let Some(hit) = self.intersect(r1, r2, gap) {
                            cloud.push(hit.point);
                        }
                    }
                }
            }
        }
        cloud
    }

    /// Points that three distinct cameras agree on.
    ///
    /// Each ray of camera `i` is intersected with every ray of the later
    /// cameras. Two of those hits from different cameras that land close
    /// together are confirmed by intersecting the two partner rays as well.
    pub fn high_confidence(&self, frame: &RayFrame) -> PointCloud {
        struct Candidate<'a> {
            t: f32,
            point: Point3<f32>,
            camera: usize,
            ray: &'a Ray,
        }

        let gap = self.config.high_confidence_gap;
        let buckets = &frame.buckets;
        let mut cloud = PointCloud::new();
        let mut candidates: Vec<Candidate> = Vec::new();

        for i in 0..buckets.len().saturating_sub(2) {
            for r in &buckets[i].rays {
                candidates.clear();
                for (j, bucket) in buckets.iter().enumerate().skip(i + 1) {
                    for s in &bucket.rays {
                        if let Some(hit) = self.intersect(r, s, gap) {
                            candidates.push(Candidate { t: hit.t1, point: hit.point, camera: j, ray: s });
                        }
                    }
                }
                candidates.sort_by(|a, b| a.t.total_cmp(&b.t));

                for a in 0..candidates.len() {
                    for b in (a + 1)..candidates.len() {
                        let (ca, cb) = (&candidates[a], &candidates[b]);
                        if ca.camera == cb.camera || (ca.point - cb.point).norm() > gap {
                            continue;
                        }
                        let Some(third) = self.intersect(ca.ray, cb.ray, gap) else {
                            continue;
                        };
                        if (ca.point - third.point).norm() <= gap && (cb.point - third.point).norm() <= gap {
                            cloud.push(midpoint(&midpoint(&ca.point, &cb.point), &third.point));
                        }
                    }
                }
            }
        }
        cloud
    }

    /// Fuses points closer than the merge distance.
    ///
    /// Passes repeat until one absorbs nothing, so merging the result again
    /// changes nothing. Survivors keep discovery order.
    pub fn merge(&self, cloud: &mut PointCloud) -> PointCloud {
        while merge_pass(cloud, self.config.merge_distance) > 0 {}
        cloud.compact()
    }

    pub fn triangulate(&self, frame: &RayFrame) -> Clouds {
        let mut high = self.high_confidence(frame);
        let mut low = self.low_confidence(frame);
        Clouds { high: self.merge(&mut high), low: self.merge(&mut low) }
    }
}

/// One single-linkage pass. Every later live point within `limit` of the
/// earlier point's position at the start of its turn is absorbed; the earlier
/// point moves to the midpoint of that position and the absorbed one.
/// Returns how many points were absorbed.
fn merge_pass(cloud: &mut PointCloud, limit: f32) -> usize {
    let mut absorbed = 0;
    for i in 0..cloud.len() {
        if !cloud.is_live(i) {
            continue;
        }
        let anchor = cloud.position(i);
        for j in (i + 1)..cloud.len() {
            if !cloud.is_live(j) {
                continue;
            }
            let other = cloud.position(j);
            if (anchor - other).norm() < limit {
                cloud.set_position(i, midpoint(&anchor, &other));
                cloud.tombstone(j);
                absorbed += 1;
            }
        }
    }
    absorbed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::CycleBucket;
    use nalgebra::Vector3;
    use proptest::prelude::*;

    fn triangulator() -> Triangulator {
        Triangulator::new(TriangulationConfig::default())
    }

    fn frame(buckets: Vec<Vec<Ray>>) -> RayFrame {
        RayFrame { cycle: 0, buckets: buckets.into_iter().map(|rays| CycleBucket { rays }).collect() }
    }

    /// Three axis-aligned rays meeting at the origin, each 10 units out.
    fn three_axis_rays() -> [Ray; 3] {
        [
            Ray::new(Point3::new(10.0, 0.0, 0.0), Vector3::new(-1.0, 0.0, 0.0)),
            Ray::new(Point3::new(0.0, 10.0, 0.0), Vector3::new(0.0, -1.0, 0.0)),
            Ray::new(Point3::new(0.0, 0.0, -10.0), Vector3::new(0.0, 0.0, 1.0)),
        ]
    }

    #[test]
    fn test_intersect_recovers_point() {
        let target = Point3::new(12.0, -7.0, -95.0);
        let r1 = Ray::towards(Point3::new(200.0, 0.0, -250.0), target);
        let r2 = Ray::towards(Point3::new(-150.0, 180.0, -240.0), target);
        let hit = triangulator().intersect(&r1, &r2, 0.7).unwrap();
        assert!((hit.point - target).norm() < 0.05, "err={}", (hit.point - target).norm());
        assert!(hit.t1 > 0.0 && hit.t2 > 0.0);
        assert!(hit.gap < 0.05);
    }

    #[test]
    fn test_intersect_rejects_behind_origin() {
        let [a, _, _] = three_axis_rays();
        let away = Ray::new(Point3::new(0.0, 10.0, 0.0), Vector3::new(0.0, 1.0, 0.0));
        assert!(triangulator().intersect(&a, &away, 0.7).is_none());
    }

    #[test]
    fn test_intersect_rejects_parallel() {
        let r1 = Ray::new(Point3::new(0.0, 0.0, -10.0), Vector3::new(1.0, 0.0, 0.0));
        let r2 = Ray::new(Point3::new(0.0, 0.5, -10.0), Vector3::new(1.0, 0.0, 0.0));
        assert!(closest_approach(&r1, &r2, 1e-6).is_none());
        assert!(triangulator().intersect(&r1, &r2, 10.0).is_none());
    }

    #[test]
    fn test_intersect_rejects_wide_gap_and_floor() {
        let tri = triangulator();
        // skew lines 2 apart
        let r1 = Ray::new(Point3::new(-10.0, 0.0, -50.0), Vector3::new(1.0, 0.0, 0.0));
        let r2 = Ray::new(Point3::new(0.0, -10.0, -52.0), Vector3::new(0.0, 1.0, 0.0));
        assert!(tri.intersect(&r1, &r2, 1.0).is_none());
        assert!(tri.intersect(&r1, &r2, 2.5).is_some());

        // crossing below the floor
        let r1 = Ray::new(Point3::new(-10.0, 0.0, 5.0), Vector3::new(1.0, 0.0, 0.0));
        let r2 = Ray::new(Point3::new(0.0, -10.0, 5.0), Vector3::new(0.0, 1.0, 0.0));
        assert!(tri.intersect(&r1, &r2, 1.0).is_none());
    }

    #[test]
    fn test_three_cameras_meeting_at_origin() {
        let tri = triangulator();
        let [a, b, c] = three_axis_rays();
        let f = frame(vec![vec![a], vec![b], vec![c]]);

        let low = tri.low_confidence(&f);
        assert_eq!(low.len(), 3);
        let high = tri.high_confidence(&f);
        assert_eq!(high.len(), 1);

        let clouds = tri.triangulate(&f);
        assert_eq!(clouds.high.len(), 1);
        assert_eq!(clouds.low.len(), 1);
        assert!(clouds.high.position(0).coords.norm() < 1e-5);
        assert!(clouds.low.position(0).coords.norm() < 1e-5);
    }

    #[test]
    fn test_two_cameras_give_no_high_confidence_points() {
        let tri = triangulator();
        let [a, b, _] = three_axis_rays();
        let f = frame(vec![vec![a], vec![b]]);
        assert!(tri.high_confidence(&f).is_empty());
        assert_eq!(tri.low_confidence(&f).len(), 1);
    }

    #[test]
    fn test_consensus_needs_distinct_cameras() {
        let tri = triangulator();
        let [a, b, c] = three_axis_rays();
        // b and c both come from camera 1; camera 2 sees nothing near the origin
        let stray = Ray::new(Point3::new(0.0, 0.0, -10.0), Vector3::new(1.0, 0.0, 0.0));
        let f = frame(vec![vec![a], vec![b, c], vec![stray]]);
        assert!(tri.high_confidence(&f).is_empty());
    }

    #[test]
    fn test_merge_keeps_discovery_order() {
        let tri = triangulator();
        let mut cloud = PointCloud::from_points([
            Point3::new(0.0, 0.0, -50.0),
            Point3::new(20.0, 0.0, -50.0),
            Point3::new(1.0, 0.0, -50.0),
            Point3::new(21.0, 0.0, -50.0),
        ]);
        let merged = tri.merge(&mut cloud);
        assert_eq!(merged.len(), 2);
        assert!((merged.position(0).x - 0.5).abs() < 1e-6);
        assert!((merged.position(1).x - 20.5).abs() < 1e-6);
    }

    #[test]
    fn test_empty_frame() {
        let clouds = triangulator().triangulate(&frame(vec![vec![], vec![], vec![]]));
        assert!(clouds.high.is_empty() && clouds.low.is_empty());
    }

    fn on_x_axis(xs: &[f32]) -> PointCloud {
        PointCloud::from_points(xs.iter().map(|x| Point3::new(*x, 0.0, -50.0)))
    }

    fn xs(cloud: &PointCloud) -> Vec<f32> {
        cloud.live_points().iter().map(|p| p.x).collect()
    }

    #[test]
    fn test_points_exactly_merge_distance_apart_stay_separate() {
        let merged = triangulator().merge(&mut on_x_axis(&[0.0, 3.0]));
        assert_eq!(xs(&merged), vec![0.0, 3.0]);
    }

    #[test]
    fn test_merge_pass_measures_from_starting_position() {
        // 3.5 is within reach of the moved point (1.0) but not of the original (0.0)
        let mut cloud = on_x_axis(&[0.0, 2.0, 3.5]);
        assert_eq!(merge_pass(&mut cloud, 3.0), 1);
        assert_eq!(xs(&cloud), vec![1.0, 3.5]);

        // the next pass picks it up
        let merged = triangulator().merge(&mut on_x_axis(&[0.0, 2.0, 3.5]));
        assert_eq!(xs(&merged), vec![2.25]);
    }

    #[test]
    fn test_merged_cloud_is_stable() {
        let tri = triangulator();
        let once = tri.merge(&mut on_x_axis(&[0.0, 3.5, 2.9]));
        assert_eq!(once.len(), 1);
        assert!((once.position(0).x - 2.475).abs() < 1e-5);
        let twice = tri.merge(&mut once.clone());
        assert_eq!(twice.live_points(), once.live_points());
    }

    proptest! {
        #[test]
        fn prop_merge_is_idempotent(
            coords in proptest::collection::vec((-15.0f32..15.0, -15.0f32..15.0, -60.0f32..-40.0), 0..40),
        ) {
            let tri = triangulator();
            let limit = tri.config.merge_distance;
            let mut cloud = PointCloud::from_points(coords.iter().map(|(x, y, z)| Point3::new(*x, *y, *z)));
            let once = tri.merge(&mut cloud);
            let points = once.live_points();
            for (a, p) in points.iter().enumerate() {
                for q in &points[a + 1..] {
                    prop_assert!((p - q).norm() >= limit);
                }
            }
            let twice = tri.merge(&mut once.clone());
            prop_assert_eq!(twice.live_points(), points);
        }
    }
}
