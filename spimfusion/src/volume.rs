use crate::error::{Error, Result};

/// A dense 3D grid of `f32` intensities.
///
/// Voxels are stored in a single `Vec<f32>` with `x` varying fastest, then `y`,
/// then `z`, so the voxel `(x, y, z)` lives at `x + width * (y + height * z)`.
/// One z-plane is therefore a contiguous run of `width * height` values.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Vec<f32>,
    width: usize,
    height: usize,
    depth: usize,
}

impl Default for Volume {
    /// Creates an empty `Volume` with zero extent and no voxel data.
    fn default() -> Volume {
        Volume {
            data: Vec::new(),
            width: 0,
            height: 0,
            depth: 0,
        }
    }
}

/// Reserves `voxels` floats set to `value`, reporting failure instead of aborting.
pub(crate) fn allocate(what: &'static str, voxels: usize, value: f32) -> Result<Vec<f32>> {
    let mut data = Vec::new();
    data.try_reserve_exact(voxels)
        .map_err(|_| Error::Allocation { what, voxels })?;
    data.resize(voxels, value);
    Ok(data)
}

/// Number of voxels of a grid, `None` if it does not fit in `usize`.
pub(crate) fn checked_voxel_count(dimensions: [usize; 3]) -> Option<usize> {
    dimensions.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

fn voxel_count(what: &'static str, dimensions: [usize; 3]) -> Result<usize> {
    checked_voxel_count(dimensions).ok_or(Error::Allocation {
        what,
        voxels: usize::MAX,
    })
}

impl Volume {
    /// Allocates a zero-filled volume of the given `[width, height, depth]`.
    ///
    /// # Errors
    /// Returns [`Error::Allocation`] if the buffer cannot be reserved.
    ///
    /// # Examples
    /// ```
    /// # use spimfusion::volume::Volume;
    /// let v = Volume::new([4, 3, 2]).unwrap();
    /// assert_eq!(v.dimensions(), [4, 3, 2]);
    /// assert_eq!(v.len(), 24);
    /// assert_eq!(v.sum(), 0.0);
    /// ```
    pub fn new(dimensions: [usize; 3]) -> Result<Volume> {
        Self::filled(dimensions, 0.0)
    }

    /// Allocates a volume with every voxel set to `value`.
    pub fn filled(dimensions: [usize; 3], value: f32) -> Result<Volume> {
        let data = allocate("volume", voxel_count("volume", dimensions)?, value)?;
        Ok(Volume {
            data,
            width: dimensions[0],
            height: dimensions[1],
            depth: dimensions[2],
        })
    }

    /// Wraps an existing buffer, which must hold exactly `width * height * depth` values.
    ///
    /// # Errors
    /// Returns [`Error::DimensionMismatch`] when the buffer length does not match.
    pub fn from_data(dimensions: [usize; 3], data: Vec<f32>) -> Result<Volume> {
        if data.len() != voxel_count("voxel buffer", dimensions)? {
            return Err(Error::DimensionMismatch {
                what: "voxel buffer",
                expected: dimensions,
                actual: [data.len(), 1, 1],
            });
        }
        Ok(Volume {
            data,
            width: dimensions[0],
            height: dimensions[1],
            depth: dimensions[2],
        })
    }

    /// Builds a volume by evaluating `f(x, y, z)` for every voxel.
    pub fn from_fn<F>(dimensions: [usize; 3], mut f: F) -> Result<Volume>
    where
        F: FnMut(usize, usize, usize) -> f32,
    {
        let mut volume = Self::new(dimensions)?;
        let mut i = 0;
        for z in 0..dimensions[2] {
            for y in 0..dimensions[1] {
                for x in 0..dimensions[0] {
                    volume.data[i] = f(x, y, z);
                    i += 1;
                }
            }
        }
        Ok(volume)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns `[width, height, depth]`.
    pub fn dimensions(&self) -> [usize; 3] {
        [self.width, self.height, self.depth]
    }

    /// Number of voxels.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of voxels in one z-plane.
    pub fn plane_len(&self) -> usize {
        self.width * self.height
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consumes the volume and returns its voxel buffer, x fastest.
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Linear index of voxel `(x, y, z)`.
    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.width * (y + self.height * z)
    }

    /// Returns the value at `(x, y, z)`.
    ///
    /// # Panics
    /// Panics if the coordinate lies outside the volume.
    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[self.index(x, y, z)]
    }

    /// Overwrites one voxel.
    ///
    /// # Parameters
    /// - `x`, `y`, `z`: Voxel coordinate, each below the matching dimension.
    /// - `value`: New intensity.
    ///
    /// # Panics
    /// Panics if the coordinate lies outside the volume.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: f32) {
        let i = self.index(x, y, z);
        self.data[i] = value;
    }

    /// Returns the value at an arbitrary integer coordinate, extending the volume
    /// by repeating its border voxels. An empty volume reads as `0.0`.
    #[inline]
    pub fn get_clamped(&self, x: i64, y: i64, z: i64) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let cx = x.clamp(0, self.width as i64 - 1) as usize;
        let cy = y.clamp(0, self.height as i64 - 1) as usize;
        let cz = z.clamp(0, self.depth as i64 - 1) as usize;
        self.get(cx, cy, cz)
    }

    /// Samples the volume at a real-valued position with trilinear interpolation.
    /// Positions outside the volume see the edge-extended border values.
    ///
    /// # Examples
    /// ```
    /// # use spimfusion::volume::Volume;
    /// let v = Volume::from_fn([2, 1, 1], |x, _, _| x as f32 * 10.0).unwrap();
    /// assert_eq!(v.interpolate_trilinear([0.25, 0.0, 0.0]), 2.5);
    /// // beyond the right border the last voxel repeats
    /// assert_eq!(v.interpolate_trilinear([7.0, 0.0, 0.0]), 10.0);
    /// ```
    pub fn interpolate_trilinear(&self, position: [f32; 3]) -> f32 {
        let fx = position[0].floor();
        let fy = position[1].floor();
        let fz = position[2].floor();
        let (x0, y0, z0) = (fx as i64, fy as i64, fz as i64);
        let (tx, ty, tz) = (position[0] - fx, position[1] - fy, position[2] - fz);

        let c000 = self.get_clamped(x0, y0, z0);
        let c100 = self.get_clamped(x0 + 1, y0, z0);
        let c010 = self.get_clamped(x0, y0 + 1, z0);
        let c110 = self.get_clamped(x0 + 1, y0 + 1, z0);
        let c001 = self.get_clamped(x0, y0, z0 + 1);
        let c101 = self.get_clamped(x0 + 1, y0, z0 + 1);
        let c011 = self.get_clamped(x0, y0 + 1, z0 + 1);
        let c111 = self.get_clamped(x0 + 1, y0 + 1, z0 + 1);

        let c00 = c000 * (1.0 - tx) + c100 * tx;
        let c10 = c010 * (1.0 - tx) + c110 * tx;
        let c01 = c001 * (1.0 - tx) + c101 * tx;
        let c11 = c011 * (1.0 - tx) + c111 * tx;

        let c0 = c00 * (1.0 - ty) + c10 * ty;
        let c1 = c01 * (1.0 - ty) + c11 * ty;

        c0 * (1.0 - tz) + c1 * tz
    }

    /// Sum of all voxels, accumulated in `f64`.
    pub fn sum(&self) -> f64 {
        self.data.iter().map(|&v| v as f64).sum()
    }

    /// Largest voxel value, or `None` for an empty volume.
    pub fn max_value(&self) -> Option<f32> {
        self.data.iter().copied().reduce(f32::max)
    }

    /// Sets every voxel to `value`.
    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    /// Multiplies every voxel by `factor`.
    pub fn scale(&mut self, factor: f32) {
        self.data.iter_mut().for_each(|v| *v *= factor);
    }

    /// Reverses the voxel order along one axis (0 = x, 1 = y, 2 = z).
    ///
    /// # Panics
    /// Panics if `axis > 2`.
    pub fn mirror_axis(&mut self, axis: usize) {
        let [w, h, d] = self.dimensions();
        match axis {
            0 => {
                for row in self.data.chunks_exact_mut(w.max(1)) {
                    row.reverse();
                }
            }
            1 => {
                for z in 0..d {
                    for y in 0..h / 2 {
                        for x in 0..w {
                            let a = self.index(x, y, z);
                            let b = self.index(x, h - 1 - y, z);
                            self.data.swap(a, b);
                        }
                    }
                }
            }
            2 => {
                let plane = w * h;
                for z in 0..d / 2 {
                    let (front, back) = self.data.split_at_mut((d - 1 - z) * plane);
                    front[z * plane..(z + 1) * plane].swap_with_slice(&mut back[..plane]);
                }
            }
            _ => panic!("axis {axis} out of range for a 3D volume"),
        }
    }
}
