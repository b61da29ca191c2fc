use super::{CombinedWeightener, CombinedWeightenerFactory};
use crate::affine_model::SourceLocation;
use crate::view::View;
use std::f32::consts::PI;

/// Fades every view out towards its image border with a cosine ramp, so seams
/// between overlapping views disappear.
///
/// Along each axis, the distance of a sample to the outside of the view is measured
/// in voxels (the edge voxel has distance `1`). The first `border` voxels get weight
/// zero, the next `blending_range` voxels ramp from 0 to 1 and everything further
/// inside has weight 1. The weight of a view is the product over the three axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blending {
    pub border: [f32; 3],
    pub blending_range: [f32; 3],
}

impl Default for Blending {
    fn default() -> Self {
        Blending {
            border: [0.0; 3],
            blending_range: [40.0; 3],
        }
    }
}

impl Blending {
    pub fn new(border: [f32; 3], blending_range: [f32; 3]) -> Self {
        Blending {
            border,
            blending_range,
        }
    }

    /// Weight of a sample at `position` inside a view of size `dimensions`.
    ///
    /// # Examples
    /// ```
    /// # use spimfusion::weightener::Blending;
    /// let blending = Blending::new([0.0; 3], [4.0; 3]);
    /// // deep inside: full weight
    /// assert_eq!(blending.weight_at([10.0, 10.0, 10.0], [21, 21, 21]), 1.0);
    /// // half way through the ramp along x only
    /// let w = blending.weight_at([1.0, 10.0, 10.0], [21, 21, 21]);
    /// assert!((w - 0.5).abs() < 1e-6);
    /// ```
    pub fn weight_at(&self, position: [f32; 3], dimensions: [usize; 3]) -> f32 {
        let mut weight = 1.0;
        for axis in 0..3 {
            let size = dimensions[axis] as f32;
            let distance = (position[axis] + 1.0).min(size - position[axis]) - self.border[axis];
            let range = self.blending_range[axis];
            let w = if distance <= 0.0 {
                0.0
            } else if range <= 0.0 || distance >= range {
                1.0
            } else {
                0.5 - 0.5 * (PI * distance / range).cos()
            };
            weight *= w;
        }
        weight
    }
}

impl CombinedWeightenerFactory for Blending {
    fn name(&self) -> &str {
        "Blending"
    }

    fn create(&self, views: &[&View]) -> Box<dyn CombinedWeightener> {
        Box::new(BlendingWeightener {
            params: *self,
            dimensions: views.iter().map(|v| v.dimensions()).collect(),
            weights: vec![0.0; views.len()],
        })
    }
}

struct BlendingWeightener {
    params: Blending,
    dimensions: Vec<[usize; 3]>,
    weights: Vec<f32>,
}

impl CombinedWeightener for BlendingWeightener {
    fn update_weights(&mut self, locations: &[SourceLocation], use_view: &[bool]) {
        for (i, weight) in self.weights.iter_mut().enumerate() {
            *weight = if use_view[i] {
                self.params.weight_at(locations[i].position, self.dimensions[i])
            } else {
                0.0
            };
        }
    }

    fn weight(&self, view: usize) -> f32 {
        self.weights[view]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine_model::AffineModel3D;
    use crate::view::{RegistrationStats, ViewId};
    use crate::volume::Volume;

    #[test]
    fn weight_falls_off_towards_border() {
        let b = Blending::new([0.0; 3], [10.0; 3]);
        let dims = [41, 41, 41];
        let centre = b.weight_at([20.0, 20.0, 20.0], dims);
        let near = b.weight_at([3.0, 20.0, 20.0], dims);
        let edge = b.weight_at([0.0, 20.0, 20.0], dims);
        assert_eq!(centre, 1.0);
        assert!(near < centre && edge < near && edge > 0.0);
        assert_eq!(b.weight_at([-1.0, 20.0, 20.0], dims), 0.0);
    }

    #[test]
    fn border_zeroes_outer_voxels() {
        let b = Blending::new([2.0, 0.0, 0.0], [1.0; 3]);
        assert_eq!(b.weight_at([1.0, 5.0, 5.0], [11, 11, 11]), 0.0);
        assert_eq!(b.weight_at([5.0, 5.0, 5.0], [11, 11, 11]), 1.0);
    }

    #[test]
    fn unused_views_get_zero_weight() {
        let views: Vec<View> = (0..2)
            .map(|i| {
                View::in_memory(
                    ViewId::default(),
                    format!("v{i}"),
                    Volume::new([9, 9, 9]).unwrap(),
                    AffineModel3D::identity(),
                    RegistrationStats::default(),
                )
            })
            .collect();
        let refs: Vec<&View> = views.iter().collect();
        let mut w = Blending::new([0.0; 3], [2.0; 3]).create(&refs);
        let loc = SourceLocation {
            position: [4.0, 4.0, 4.0],
            voxel: [4, 4, 4],
        };
        w.update_weights(&[loc, loc], &[true, false]);
        assert_eq!(w.weight(0), 1.0);
        assert_eq!(w.weight(1), 0.0);
    }
}
