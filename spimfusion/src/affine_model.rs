use crate::error::{Error, Result};
use nalgebra::{Matrix4, Vector4};

/// Determinants at or below this magnitude are treated as singular.
const SINGULAR_DETERMINANT: f64 = 1e-12;

/// A 3D affine transformation mapping a view's voxel coordinates into the common
/// (fused) frame. It includes:
/// - A 3×3 linear part (rotation, scale, shear).
/// - A translation.
///
/// The homogeneous 4×4 matrix is kept together with its inverse, which is computed
/// once at construction. Fusion only ever needs the inverse direction (common frame
/// to view voxel space), so a singular model is still representable; it simply fails
/// every inverse mapping with [`Error::NoninvertibleModel`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AffineModel3D {
    matrix: Matrix4<f64>,
    inverse: Option<Matrix4<f64>>,
}

impl Default for AffineModel3D {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineModel3D {
    /// Creates a model from a homogeneous matrix. The bottom row is forced to
    /// `[0, 0, 0, 1]`.
    pub fn from_matrix(mut matrix: Matrix4<f64>) -> Self {
        matrix[(3, 0)] = 0.0;
        matrix[(3, 1)] = 0.0;
        matrix[(3, 2)] = 0.0;
        matrix[(3, 3)] = 1.0;
        let inverse = if matrix.determinant().abs() <= SINGULAR_DETERMINANT {
            None
        } else {
            matrix.try_inverse()
        };
        AffineModel3D { matrix, inverse }
    }

    /// Creates a model from its twelve coefficients in row-major order:
    ///
    /// ```text
    ///   X = m00 * x + m01 * y + m02 * z + m03
    ///   Y = m10 * x + m11 * y + m12 * z + m13
    ///   Z = m20 * x + m21 * y + m22 * z + m23
    /// ```
    ///
    /// # Examples
    /// ```
    /// # use spimfusion::affine_model::AffineModel3D;
    /// let m = AffineModel3D::from_row_major([
    ///     2.0, 0.0, 0.0, 1.0,
    ///     0.0, 1.0, 0.0, 0.0,
    ///     0.0, 0.0, 1.0, -3.0,
    /// ]);
    /// assert_eq!(m.apply([1.0, 2.0, 3.0]), [3.0, 2.0, 0.0]);
    /// assert_eq!(m.apply_inverse([3.0, 2.0, 0.0]).unwrap(), [1.0, 2.0, 3.0]);
    /// ```
    #[rustfmt::skip]
    pub fn from_row_major(m: [f64; 12]) -> Self {
        Self::from_matrix(Matrix4::new(
            m[0], m[1], m[2], m[3],
            m[4], m[5], m[6], m[7],
            m[8], m[9], m[10], m[11],
            0.0, 0.0, 0.0, 1.0,
        ))
    }

    pub fn identity() -> Self {
        Self::from_matrix(Matrix4::identity())
    }

    #[rustfmt::skip]
    pub fn translation(tx: f64, ty: f64, tz: f64) -> Self {
        Self::from_row_major([
            1.0, 0.0, 0.0, tx,
            0.0, 1.0, 0.0, ty,
            0.0, 0.0, 1.0, tz,
        ])
    }

    #[rustfmt::skip]
    pub fn scaling(sx: f64, sy: f64, sz: f64) -> Self {
        Self::from_row_major([
            sx, 0.0, 0.0, 0.0,
            0.0, sy, 0.0, 0.0,
            0.0, 0.0, sz, 0.0,
        ])
    }

    /// Rotation by `angle` radians about the y axis through `center`, the usual
    /// geometry of a sample rotated on a light-sheet stage.
    #[rustfmt::skip]
    pub fn rotation_y(angle: f64, center: [f64; 3]) -> Self {
        let (s, c) = angle.sin_cos();
        let rotation = Self::from_row_major([
            c, 0.0, s, 0.0,
            0.0, 1.0, 0.0, 0.0,
            -s, 0.0, c, 0.0,
        ]);
        Self::translation(-center[0], -center[1], -center[2])
            .then(&rotation)
            .then(&Self::translation(center[0], center[1], center[2]))
    }

    /// Returns the model that applies `self` first and `next` afterwards.
    pub fn then(&self, next: &AffineModel3D) -> AffineModel3D {
        Self::from_matrix(next.matrix * self.matrix)
    }

    /// The homogeneous forward matrix.
    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    pub fn is_invertible(&self) -> bool {
        self.inverse.is_some()
    }

    /// Maps a view voxel coordinate into the common frame.
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let out = self.matrix * Vector4::new(p[0], p[1], p[2], 1.0);
        [out[0], out[1], out[2]]
    }

    /// Maps a common-frame coordinate back into the view's voxel space.
    ///
    /// # Errors
    /// [`Error::NoninvertibleModel`] when the model is singular or the mapped
    /// coordinate is not finite.
    pub fn apply_inverse(&self, p: [f64; 3]) -> Result<[f64; 3]> {
        let inverse = self.inverse.as_ref().ok_or_else(|| {
            Error::NoninvertibleModel(format!("singular matrix {:?}", self.matrix))
        })?;
        let out = inverse * Vector4::new(p[0], p[1], p[2], 1.0);
        if !(out[0].is_finite() && out[1].is_finite() && out[2].is_finite()) {
            return Err(Error::NoninvertibleModel(format!("no finite preimage for {p:?}")));
        }
        Ok([out[0], out[1], out[2]])
    }

    /// Inverse-maps a physical output position and rounds it to the nearest source voxel.
    pub fn source_location(&self, physical: [f32; 3]) -> Result<SourceLocation> {
        let p = self.apply_inverse([physical[0] as f64, physical[1] as f64, physical[2] as f64])?;
        let position = [p[0] as f32, p[1] as f32, p[2] as f32];
        Ok(SourceLocation {
            position,
            voxel: [
                position[0].round() as i64,
                position[1].round() as i64,
                position[2].round() as i64,
            ],
        })
    }
}

/// Where an output voxel lands inside one view: the exact real-valued coordinate
/// used for interpolation and the nearest integer voxel used for bounds tests and
/// weight lookups.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct SourceLocation {
    pub position: [f32; 3],
    pub voxel: [i64; 3],
}

impl SourceLocation {
    /// `true` when the rounded voxel lies inside a volume of the given dimensions.
    pub fn is_inside(&self, dimensions: [usize; 3]) -> bool {
        self.voxel
            .iter()
            .zip(dimensions.iter())
            .all(|(&v, &size)| v >= 0 && (v as u64) < size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: [f64; 3], b: [f64; 3]) {
        for d in 0..3 {
            assert!((a[d] - b[d]).abs() < 1e-9, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn identity_maps_points_to_themselves() {
        let m = AffineModel3D::identity();
        assert_eq!(m.apply_inverse([1.5, -2.0, 7.0]).unwrap(), [1.5, -2.0, 7.0]);
    }

    #[test]
    fn translation_inverse_subtracts_offset() {
        let m = AffineModel3D::translation(2.0, 0.0, -1.0);
        assert_close(m.apply_inverse([2.0, 3.0, 4.0]).unwrap(), [0.0, 3.0, 5.0]);
    }

    #[test]
    fn rotation_round_trips() {
        let m = AffineModel3D::rotation_y(0.7, [10.0, 5.0, 10.0]);
        let p = [3.0, 4.0, 12.0];
        assert_close(m.apply_inverse(m.apply(p)).unwrap(), p);
        // the centre is a fixed point
        assert_close(m.apply([10.0, 5.0, 10.0]), [10.0, 5.0, 10.0]);
    }

    #[test]
    fn singular_model_fails_inverse() {
        let m = AffineModel3D::scaling(1.0, 0.0, 1.0);
        assert!(!m.is_invertible());
        let err = m.apply_inverse([0.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, Error::NoninvertibleModel(_)));
    }

    #[test]
    fn then_applies_left_model_first() {
        let shift = AffineModel3D::translation(1.0, 0.0, 0.0);
        let m = AffineModel3D::scaling(2.0, 2.0, 2.0).then(&shift);
        assert_close(m.apply([1.0, 1.0, 1.0]), [3.0, 2.0, 2.0]);
    }

    #[test]
    fn source_location_rounds_and_checks_bounds() {
        let m = AffineModel3D::translation(-0.4, 0.0, 0.0);
        let loc = m.source_location([3.2, 0.0, 0.0]).unwrap();
        assert!((loc.position[0] - 3.6).abs() < 1e-6);
        assert_eq!(loc.voxel, [4, 0, 0]);
        assert!(loc.is_inside([5, 1, 1]));
        assert!(!loc.is_inside([4, 1, 1]));

        let below = m.source_location([-0.7, 0.0, 0.0]).unwrap();
        assert_eq!(below.voxel[0], 0);
        let outside = m.source_location([-1.2, 0.0, 0.0]).unwrap();
        assert!(!outside.is_inside([5, 1, 1]));
    }
}
