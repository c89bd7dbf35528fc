//! Validated input samples.

use crate::{Error, Real, Result};
use na::{Point3, Vector3};
use parry::bounding_volume::Aabb;

/// An ordered set of sample points, optionally oriented.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PointCloud {
    points: Vec<Point3<Real>>,
    normals: Option<Vec<Vector3<Real>>>,
}

impl PointCloud {
    /// Validates and wraps a set of points and their optional normals.
    ///
    /// Fails with [`Error::InvalidGeometry`] if there is no point, if a
    /// coordinate is not finite, or if every point is at the same location.
    pub fn new(points: Vec<Point3<Real>>, normals: Option<Vec<Vector3<Real>>>) -> Result<Self> {
        if points.is_empty() {
            return Err(Error::InvalidGeometry("the point set is empty".to_string()));
        }

        if let Some(id) = points.iter().position(|pt| !pt.coords.iter().all(|e| e.is_finite())) {
            return Err(Error::InvalidGeometry(format!(
                "point {id} has a non-finite coordinate"
            )));
        }

        if let Some(normals) = &normals {
            if normals.len() != points.len() {
                return Err(Error::LengthMismatch {
                    what: "normals",
                    expected: points.len(),
                    got: normals.len(),
                });
            }

            if let Some(id) = normals.iter().position(|n| !n.iter().all(|e| e.is_finite())) {
                return Err(Error::InvalidGeometry(format!(
                    "normal {id} has a non-finite component"
                )));
            }
        }

        let extent = Aabb::from_points(&points).extents().max();
        if extent <= 0.0 {
            return Err(Error::InvalidGeometry(
                "the point set has a zero spatial extent".to_string(),
            ));
        }

        Ok(Self { points, normals })
    }

    /// Oriented point cloud: one normal per point.
    pub fn with_normals(points: Vec<Point3<Real>>, normals: Vec<Vector3<Real>>) -> Result<Self> {
        Self::new(points, Some(normals))
    }

    /// The sample points.
    pub fn points(&self) -> &[Point3<Real>] {
        &self.points
    }

    /// The normals at the sample points, if any.
    pub fn normals(&self) -> Option<&[Vector3<Real>]> {
        self.normals.as_deref()
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always `false`: a validated point cloud has at least one point.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Bounding box of the sample points.
    pub fn aabb(&self) -> Aabb {
        Aabb::from_points(&self.points)
    }
}

#[cfg(test)]
mod test {
    use super::PointCloud;
    use crate::Error;
    use na::{Point3, Vector3};

    #[test]
    fn rejects_degenerate_inputs() {
        assert!(matches!(
            PointCloud::new(vec![], None),
            Err(Error::InvalidGeometry(_))
        ));
        assert!(matches!(
            PointCloud::new(vec![Point3::new(1.0, 2.0, 3.0); 4], None),
            Err(Error::InvalidGeometry(_))
        ));
        assert!(matches!(
            PointCloud::new(vec![Point3::origin(), Point3::new(f64::NAN, 0.0, 0.0)], None),
            Err(Error::InvalidGeometry(_))
        ));
        assert!(matches!(
            PointCloud::with_normals(
                vec![Point3::origin(), Point3::new(1.0, 0.0, 0.0)],
                vec![Vector3::z()]
            ),
            Err(Error::LengthMismatch { .. })
        ));
    }

    #[test]
    fn planar_patch_is_valid() {
        let points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.1, 0.0, 0.0),
            Point3::new(0.0, 0.1, 0.0),
        ];
        let cloud = PointCloud::with_normals(points, vec![Vector3::z(); 3]).unwrap();
        assert_eq!(cloud.len(), 3);
        assert_eq!(cloud.normals().map(|n| n.len()), Some(3));
    }
}
