//! FFT-based 3D convolution of a volume with a fixed kernel.
//!
//! The kernel spectrum is computed once when the operator is planned. Every call
//! to [`FourierConvolution::convolve`] then costs one forward and one inverse 3D FFT
//! of the padded volume.
//!
//! Geometry: the input is edge-extended by `c = kernel_size / 2` voxels on every
//! side (padded size `n + 2c` per axis), the kernel centre is voxel `c`, and the
//! output has the dimensions of the input:
//!
//! ```text
//!   out(i) = sum_j kernel(j) * in(clamp(i + c - j))
//! ```

use crate::error::{Error, Result};
use crate::volume::{allocate, checked_voxel_count, Volume};
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// One forward and one inverse plan per axis.
#[derive(Clone)]
struct Plans {
    forward: [Arc<dyn Fft<f32>>; 3],
    inverse: [Arc<dyn Fft<f32>>; 3],
}

impl Plans {
    fn new(padded: [usize; 3]) -> Self {
        let mut planner = FftPlanner::new();
        Plans {
            forward: padded.map(|n| planner.plan_fft_forward(n)),
            inverse: padded.map(|n| planner.plan_fft_inverse(n)),
        }
    }
}

/// A convolution operator planned for one image size and one kernel.
///
/// The operator reuses an internal scratch buffer, so `convolve` takes `&mut self`:
/// one operator serves one caller at a time.
#[derive(Clone)]
pub struct FourierConvolution {
    image_dims: [usize; 3],
    kernel_dims: [usize; 3],
    padded_dims: [usize; 3],
    plans: Plans,
    kernel_spectrum: Vec<Complex32>,
    buffer: Vec<Complex32>,
    line: Vec<Complex32>,
}

impl std::fmt::Debug for FourierConvolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FourierConvolution")
            .field("image_dims", &self.image_dims)
            .field("kernel_dims", &self.kernel_dims)
            .field("padded_dims", &self.padded_dims)
            .finish()
    }
}

fn reserve_complex(what: &'static str, voxels: usize) -> Result<Vec<Complex32>> {
    let mut data = Vec::new();
    data.try_reserve_exact(voxels)
        .map_err(|_| Error::Allocation { what, voxels })?;
    data.resize(voxels, Complex32::new(0.0, 0.0));
    Ok(data)
}

impl FourierConvolution {
    /// Plans the convolution of volumes of size `image_dims` with `kernel`.
    ///
    /// # Errors
    /// - [`Error::DimensionMismatch`] for an empty image size or an empty kernel.
    /// - [`Error::Allocation`] when the padded buffers cannot be reserved.
    pub fn new(image_dims: [usize; 3], kernel: &Volume) -> Result<Self> {
        let kernel_dims = kernel.dimensions();
        if image_dims.contains(&0) {
            return Err(Error::DimensionMismatch {
                what: "convolution image",
                expected: [1, 1, 1],
                actual: image_dims,
            });
        }
        if kernel_dims.contains(&0) {
            return Err(Error::DimensionMismatch {
                what: "convolution kernel",
                expected: [1, 1, 1],
                actual: kernel_dims,
            });
        }

        let too_large = || Error::Allocation {
            what: "convolution buffer",
            voxels: usize::MAX,
        };
        let mut padded_dims = [0; 3];
        for a in 0..3 {
            padded_dims[a] = image_dims[a]
                .checked_add(kernel_dims[a] / 2 * 2)
                .ok_or_else(too_large)?;
        }
        let total = checked_voxel_count(padded_dims).ok_or_else(too_large)?;

        // kernel centre goes to the origin, the rest wraps around
        let mut kernel_spectrum = reserve_complex("kernel spectrum", total)?;
        let plans = Plans::new(padded_dims);
        for z in 0..kernel_dims[2] {
            let pz = wrap(z, kernel_dims[2], padded_dims[2]);
            for y in 0..kernel_dims[1] {
                let py = wrap(y, kernel_dims[1], padded_dims[1]);
                for x in 0..kernel_dims[0] {
                    let px = wrap(x, kernel_dims[0], padded_dims[0]);
                    let i = px + padded_dims[0] * (py + padded_dims[1] * pz);
                    kernel_spectrum[i] = Complex32::new(kernel.get(x, y, z), 0.0);
                }
            }
        }

        let max_line = padded_dims.iter().copied().max().unwrap_or(0);
        let mut conv = FourierConvolution {
            image_dims,
            kernel_dims,
            padded_dims,
            plans,
            kernel_spectrum: Vec::new(),
            buffer: reserve_complex("convolution buffer", total)?,
            line: reserve_complex("convolution line", max_line)?,
        };
        conv.fft3d(&mut kernel_spectrum, false)?;

        // fold the inverse FFT normalisation into the spectrum
        let norm = 1.0 / total as f32;
        kernel_spectrum.iter_mut().for_each(|c| *c *= norm);
        conv.kernel_spectrum = kernel_spectrum;
        Ok(conv)
    }

    /// Size of the volumes this operator accepts.
    pub fn image_dimensions(&self) -> [usize; 3] {
        self.image_dims
    }

    pub fn kernel_dimensions(&self) -> [usize; 3] {
        self.kernel_dims
    }

    /// Convolves `input` with the planned kernel into a newly allocated volume.
    /// `input` is not modified.
    ///
    /// # Errors
    /// [`Error::DimensionMismatch`] if `input` does not have the planned image size.
    pub fn convolve(&mut self, input: &Volume) -> Result<Volume> {
        if input.dimensions() != self.image_dims {
            return Err(Error::DimensionMismatch {
                what: "convolution input",
                expected: self.image_dims,
                actual: input.dimensions(),
            });
        }
        let [pw, ph, pd] = self.padded_dims;
        let c = self.kernel_dims.map(|k| (k / 2) as i64);

        let mut buffer = std::mem::take(&mut self.buffer);
        let mut i = 0;
        for z in 0..pd as i64 {
            for y in 0..ph as i64 {
                for x in 0..pw as i64 {
                    let value = input.get_clamped(x - c[0], y - c[1], z - c[2]);
                    buffer[i] = Complex32::new(value, 0.0);
                    i += 1;
                }
            }
        }

        let result = self.fft3d(&mut buffer, false).and_then(|_| {
            buffer
                .iter_mut()
                .zip(&self.kernel_spectrum)
                .for_each(|(b, k)| *b *= k);
            self.fft3d(&mut buffer, true)
        });
        if let Err(e) = result {
            self.buffer = buffer;
            return Err(e);
        }

        let [w, h, d] = self.image_dims;
        let mut out = allocate("convolution result", w * h * d, 0.0)?;
        let mut o = 0;
        for z in 0..d {
            for y in 0..h {
                let row = c[0] as usize + pw * (y + c[1] as usize + ph * (z + c[2] as usize));
                for x in 0..w {
                    out[o] = buffer[row + x].re;
                    o += 1;
                }
            }
        }
        self.buffer = buffer;
        Volume::from_data(self.image_dims, out)
    }

    /// In-place 3D FFT over the padded grid, one axis at a time.
    fn fft3d(&mut self, data: &mut [Complex32], inverse: bool) -> Result<()> {
        let dims = self.padded_dims;
        let total: usize = dims.iter().product();
        if data.len() != total {
            return Err(Error::Fft(format!(
                "buffer holds {} values, plan expects {}",
                data.len(),
                total
            )));
        }
        let plans = if inverse {
            &self.plans.inverse
        } else {
            &self.plans.forward
        };

        // x lines are contiguous and can be processed in one call
        plans[0].process(data);

        let strides = [1, dims[0], dims[0] * dims[1]];
        for axis in 1..3 {
            let n = dims[axis];
            if n == 1 {
                continue;
            }
            let stride = strides[axis];
            let line = &mut self.line[..n];
            // every start offset whose coordinate along `axis` is zero
            let outer = total / (n * stride);
            for o in 0..outer {
                for inner in 0..stride {
                    let start = o * n * stride + inner;
                    for (k, v) in line.iter_mut().enumerate() {
                        *v = data[start + k * stride];
                    }
                    plans[axis].process(line);
                    for (k, v) in line.iter().enumerate() {
                        data[start + k * stride] = *v;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Position of kernel index `i` (of a kernel of length `k`) in a padded axis of
/// length `n` once the kernel centre is moved to index 0.
fn wrap(i: usize, k: usize, n: usize) -> usize {
    (i as i64 - (k / 2) as i64).rem_euclid(n as i64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(input: &Volume, kernel: &Volume) -> Volume {
        let [kw, kh, kd] = kernel.dimensions();
        let c = [kw / 2, kh / 2, kd / 2].map(|v| v as i64);
        Volume::from_fn(input.dimensions(), |x, y, z| {
            let mut acc = 0.0;
            for kz in 0..kd {
                for ky in 0..kh {
                    for kx in 0..kw {
                        acc += kernel.get(kx, ky, kz)
                            * input.get_clamped(
                                x as i64 + c[0] - kx as i64,
                                y as i64 + c[1] - ky as i64,
                                z as i64 + c[2] - kz as i64,
                            );
                    }
                }
            }
            acc
        })
        .unwrap()
    }

    fn pseudo_random(dims: [usize; 3], seed: u32) -> Volume {
        let mut state = seed;
        Volume::from_fn(dims, |_, _, _| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 8) as f32 / (1u32 << 24) as f32
        })
        .unwrap()
    }

    fn assert_close(a: &Volume, b: &Volume, tolerance: f32) {
        assert_eq!(a.dimensions(), b.dimensions());
        for (x, y) in a.data().iter().zip(b.data()) {
            assert!((x - y).abs() < tolerance, "{x} vs {y}");
        }
    }

    #[test]
    fn delta_kernel_is_identity() {
        let input = pseudo_random([6, 5, 4], 7);
        let mut delta = Volume::new([3, 3, 3]).unwrap();
        delta.set(1, 1, 1, 1.0);
        let mut conv = FourierConvolution::new(input.dimensions(), &delta).unwrap();
        assert_close(&conv.convolve(&input).unwrap(), &input, 1e-5);
    }

    #[test]
    fn shifted_delta_shifts_image() {
        let input = pseudo_random([8, 3, 3], 3);
        let mut delta = Volume::new([3, 1, 1]).unwrap();
        delta.set(0, 0, 0, 1.0);
        let mut conv = FourierConvolution::new(input.dimensions(), &delta).unwrap();
        let out = conv.convolve(&input).unwrap();
        // out(x) = in(x + 1)
        for x in 0..7 {
            assert!((out.get(x, 1, 1) - input.get(x + 1, 1, 1)).abs() < 1e-5);
        }
        assert!((out.get(7, 1, 1) - input.get(7, 1, 1)).abs() < 1e-5);
    }

    #[test]
    fn matches_direct_convolution_for_odd_and_even_kernels() {
        let input = pseudo_random([7, 6, 5], 11);
        for kdims in [[3, 3, 3], [4, 2, 3], [1, 5, 2]] {
            let kernel = pseudo_random(kdims, 5);
            let mut conv = FourierConvolution::new(input.dimensions(), &kernel).unwrap();
            assert_close(&conv.convolve(&input).unwrap(), &direct(&input, &kernel), 1e-4);
        }
    }

    #[test]
    fn input_is_left_untouched_and_calls_repeat() {
        let input = pseudo_random([5, 5, 5], 1);
        let copy = input.clone();
        let kernel = pseudo_random([3, 3, 3], 2);
        let mut conv = FourierConvolution::new(input.dimensions(), &kernel).unwrap();
        let first = conv.convolve(&input).unwrap();
        let second = conv.convolve(&input).unwrap();
        assert_eq!(input, copy);
        assert_eq!(first, second);
    }

    #[test]
    fn wrong_input_size_is_rejected() {
        let kernel = Volume::filled([3, 3, 3], 1.0).unwrap();
        let mut conv = FourierConvolution::new([4, 4, 4], &kernel).unwrap();
        let err = conv.convolve(&Volume::new([4, 4, 5]).unwrap()).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn oversized_image_is_an_allocation_error() {
        let kernel = Volume::filled([3, 3, 3], 1.0).unwrap();
        let err = FourierConvolution::new([1 << 22; 3], &kernel).unwrap_err();
        assert!(matches!(err, Error::Allocation { .. }));
        let err = FourierConvolution::new([usize::MAX, 1, 1], &kernel).unwrap_err();
        assert!(matches!(err, Error::Allocation { .. }));
    }

    #[test]
    fn planned_sizes_are_reported() {
        let kernel = Volume::filled([3, 1, 5], 1.0).unwrap();
        let conv = FourierConvolution::new([8, 6, 4], &kernel).unwrap();
        assert_eq!(conv.image_dimensions(), [8, 6, 4]);
        assert_eq!(conv.kernel_dimensions(), [3, 1, 5]);
    }

    #[test]
    fn empty_kernel_is_rejected() {
        let kernel = Volume::new([0, 3, 3]).unwrap();
        assert!(FourierConvolution::new([4, 4, 4], &kernel).is_err());
    }
}
