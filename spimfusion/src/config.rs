use crate::error::{Error, Result};
use crate::view::View;
use crate::volume::checked_voxel_count;

/// Parallelism and memory settings of a fusion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusionConfig {
    /// Size of the worker pool.
    pub num_threads: usize,
    /// How many views are memory-resident at once.
    pub num_parallel_stacks: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig {
            num_threads: rayon::current_num_threads(),
            num_parallel_stacks: 1,
        }
    }
}

impl FusionConfig {
    pub fn new(num_threads: usize, num_parallel_stacks: usize) -> Self {
        FusionConfig {
            num_threads,
            num_parallel_stacks,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(Error::InvalidConfig("num_threads must be at least 1".into()));
        }
        if self.num_parallel_stacks == 0 {
            return Err(Error::InvalidConfig(
                "num_parallel_stacks must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// The part of the common frame that is rendered into the fused volume.
///
/// Output voxel `(x, y, z)` sits at the physical position
///
/// ```text
///   ((x + crop_offset[0]) * scale + origin[0],
///    (y + crop_offset[1]) * scale + origin[1],
///    (z + crop_offset[2]) * scale + origin[2])
/// ```
///
/// `scale` is the output voxel size in common-frame units, so `scale = 2.0`
/// renders at half resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputRegion {
    pub dimensions: [usize; 3],
    pub crop_offset: [i64; 3],
    pub scale: f32,
    pub origin: [f32; 3],
}

impl OutputRegion {
    /// A region of the given size starting at the frame origin, at unit scale.
    pub fn new(dimensions: [usize; 3]) -> Self {
        OutputRegion {
            dimensions,
            crop_offset: [0; 3],
            scale: 1.0,
            origin: [0.0; 3],
        }
    }

    pub fn with_crop_offset(self, crop_offset: [i64; 3]) -> Self {
        OutputRegion { crop_offset, ..self }
    }

    pub fn with_scale(self, scale: f32) -> Self {
        OutputRegion { scale, ..self }
    }

    pub fn with_origin(self, origin: [f32; 3]) -> Self {
        OutputRegion { origin, ..self }
    }

    /// Smallest region at the given `scale` that covers every view of `views`.
    ///
    /// All eight corners of each view are mapped into the common frame; the region
    /// starts at the minimum corner and is large enough to reach the maximum one.
    ///
    /// # Examples
    /// ```
    /// # use spimfusion::affine_model::AffineModel3D;
    /// # use spimfusion::config::OutputRegion;
    /// # use spimfusion::view::{RegistrationStats, View, ViewId};
    /// # use spimfusion::volume::Volume;
    /// let views = vec![
    ///     View::in_memory(ViewId::default(), "a", Volume::new([4, 4, 4]).unwrap(),
    ///         AffineModel3D::identity(), RegistrationStats::default()),
    ///     View::in_memory(ViewId::default(), "b", Volume::new([4, 4, 4]).unwrap(),
    ///         AffineModel3D::translation(2.0, 0.0, 0.0), RegistrationStats::default()),
    /// ];
    /// let region = OutputRegion::bounding_box(&views, 1.0).unwrap();
    /// assert_eq!(region.dimensions, [6, 4, 4]);
    /// assert_eq!(region.origin, [0.0, 0.0, 0.0]);
    /// ```
    pub fn bounding_box(views: &[View], scale: f32) -> Result<Self> {
        if !(scale > 0.0 && scale.is_finite()) {
            return Err(Error::InvalidConfig(format!("scale must be positive, got {scale}")));
        }
        let mut min = [f64::INFINITY; 3];
        let mut max = [f64::NEG_INFINITY; 3];
        for view in views {
            let [w, h, d] = view.dimensions();
            if w == 0 || h == 0 || d == 0 {
                continue;
            }
            let far = [(w - 1) as f64, (h - 1) as f64, (d - 1) as f64];
            for corner in 0..8 {
                let p = [
                    if corner & 1 == 0 { 0.0 } else { far[0] },
                    if corner & 2 == 0 { 0.0 } else { far[1] },
                    if corner & 4 == 0 { 0.0 } else { far[2] },
                ];
                let q = view.model.apply(p);
                for a in 0..3 {
                    min[a] = min[a].min(q[a]);
                    max[a] = max[a].max(q[a]);
                }
            }
        }
        if min.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidConfig("no non-empty views to bound".into()));
        }
        let scale64 = scale as f64;
        let dimensions = [0, 1, 2].map(|a| ((max[a] - min[a]) / scale64).round() as usize + 1);
        Ok(OutputRegion {
            dimensions,
            crop_offset: [0; 3],
            scale,
            origin: [min[0] as f32, min[1] as f32, min[2] as f32],
        })
    }

    /// Number of output voxels, `None` if the region is too large to count.
    pub fn voxel_count(&self) -> Option<usize> {
        checked_voxel_count(self.dimensions)
    }

    /// Common-frame position of output voxel `(x, y, z)`.
    #[inline]
    pub fn physical_position(&self, x: usize, y: usize, z: usize) -> [f32; 3] {
        [
            (x as i64 + self.crop_offset[0]) as f32 * self.scale + self.origin[0],
            (y as i64 + self.crop_offset[1]) as f32 * self.scale + self.origin[1],
            (z as i64 + self.crop_offset[2]) as f32 * self.scale + self.origin[2],
        ]
    }

    pub fn validate(&self) -> Result<()> {
        match self.voxel_count() {
            Some(0) => {
                return Err(Error::InvalidConfig(format!(
                    "output region {:?} is empty",
                    self.dimensions
                )))
            }
            None => {
                return Err(Error::Allocation {
                    what: "fused image",
                    voxels: usize::MAX,
                })
            }
            Some(_) => {}
        }
        if !(self.scale > 0.0 && self.scale.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "output scale must be positive, got {}",
                self.scale
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values_are_rejected() {
        assert!(FusionConfig::new(0, 1).validate().is_err());
        assert!(FusionConfig::new(1, 0).validate().is_err());
        assert!(FusionConfig::new(4, 2).validate().is_ok());
        assert!(FusionConfig::default().validate().is_ok());
    }

    #[test]
    fn physical_position_applies_crop_scale_and_origin() {
        let region = OutputRegion::new([10, 10, 10])
            .with_crop_offset([1, 0, -2])
            .with_scale(2.0)
            .with_origin([0.5, 0.0, 10.0]);
        assert_eq!(region.physical_position(3, 4, 5), [8.5, 8.0, 16.0]);
    }

    #[test]
    fn oversized_region_is_an_allocation_error() {
        let region = OutputRegion::new([1 << 22; 3]);
        assert_eq!(region.voxel_count(), None);
        assert!(matches!(region.validate(), Err(Error::Allocation { .. })));
        assert_eq!(OutputRegion::new([2, 3, 4]).voxel_count(), Some(24));
    }

    #[test]
    fn empty_region_is_invalid() {
        assert!(OutputRegion::new([0, 4, 4]).validate().is_err());
        assert!(OutputRegion::new([4, 4, 4]).with_scale(0.0).validate().is_err());
    }
}
