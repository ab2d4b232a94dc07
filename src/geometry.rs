use nalgebra::{Point3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// A ray cast from a camera centre through a detected blob.
///
/// World frame is the calibration frame: x/y horizontal, z pointing down.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ray {
    pub origin: Point3<f32>,
    /// Unit length. Not renormalized on receipt.
    pub direction: Vector3<f32>,
}

impl Ray {
    pub fn new(origin: Point3<f32>, direction: Vector3<f32>) -> Self {
        Self { origin, direction }
    }

    /// Builds a ray towards `target`, normalizing the direction.
    pub fn towards(origin: Point3<f32>, target: Point3<f32>) -> Self {
        Self { origin, direction: (target - origin).normalize() }
    }

    pub fn at(&self, t: f32) -> Point3<f32> {
        self.origin + self.direction * t
    }
}

/// Height above the floor. The world z axis points down.
#[inline]
pub fn elevation(p: &Point3<f32>) -> f32 {
    -p.z
}

/// Inverse of [`elevation`]: a point at horizontal (x, y) and height `h`.
#[inline]
pub fn at_elevation(x: f32, y: f32, h: f32) -> Point3<f32> {
    Point3::new(x, y, -h)
}

/// Horizontal projection.
#[inline]
pub fn horizontal(p: &Point3<f32>) -> Vector2<f32> {
    Vector2::new(p.x, p.y)
}

#[inline]
pub fn horizontal_distance(a: &Point3<f32>, b: &Point3<f32>) -> f32 {
    (horizontal(a) - horizontal(b)).norm()
}

#[inline]
pub fn midpoint(a: &Point3<f32>, b: &Point3<f32>) -> Point3<f32> {
    nalgebra::center(a, b)
}

/// Signed area of the triangle (a, b, c) in the horizontal plane.
///
/// With x forward and y to the right, a positive area puts `c` left of a→b.
pub fn signed_area(a: &Vector2<f32>, b: &Vector2<f32>, c: &Vector2<f32>) -> f32 {
    let ac = a - c;
    let bc = b - c;
    0.5 * (bc.x * ac.y - ac.x * bc.y)
}

/// Unit horizontal direction from `from` to `to`, or `None` when they share x/y.
pub fn horizontal_axis(from: &Point3<f32>, to: &Point3<f32>) -> Option<Vector2<f32>> {
    let v = horizontal(to) - horizontal(from);
    let n = v.norm();
    if n <= f32::EPSILON {
        None
    } else {
        Some(v / n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevation_is_negated_z() {
        let p = at_elevation(1.0, 2.0, 150.0);
        assert_eq!(p.z, -150.0);
        assert!((elevation(&p) - 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_signed_area_orientation() {
        // forward along +x, left is -y
        let a = Vector2::new(0.0, 0.0);
        let b = Vector2::new(1.0, 0.0);
        let left = Vector2::new(0.5, -1.0);
        let right = Vector2::new(0.5, 1.0);
        assert!(signed_area(&a, &b, &left) > 0.0);
        assert!(signed_area(&a, &b, &right) < 0.0);
        assert!(signed_area(&a, &b, &Vector2::new(2.0, 0.0)).abs() < 1e-6);
    }

    #[test]
    fn test_horizontal_axis_degenerate() {
        let p = at_elevation(3.0, 4.0, 10.0);
        let q = at_elevation(3.0, 4.0, 90.0);
        assert!(horizontal_axis(&p, &q).is_none());
        let axis = horizontal_axis(&p, &at_elevation(6.0, 8.0, 0.0)).unwrap();
        assert!((axis.norm() - 1.0).abs() < 1e-6);
        assert!((horizontal_distance(&p, &at_elevation(6.0, 8.0, 0.0)) - 5.0).abs() < 1e-5);
    }
}
