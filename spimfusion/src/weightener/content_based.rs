use super::IsolatedWeightenerFactory;
use crate::error::WeightenerError;
use crate::view::View;
use crate::volume::Volume;

const NAME: &str = "Content-based";

/// Weights each voxel of a view by its local image content.
///
/// The weight map is the local high-frequency energy
/// `G(sigma2) * (I - G(sigma1) * I)^2`, where `G(s)` is a Gaussian blur, scaled so
/// its maximum is 1 and clamped from below by `min_weight`. Sharp, in-focus parts of
/// a view therefore dominate blurred, scattered parts of another view.
///
/// Building the map needs three volume-sized temporaries. With a `memory_budget`
/// (in voxels) set, views that would exceed it fail with
/// [`WeightenerError::InsufficientMemory`] instead of being computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentBased {
    pub sigma1: f32,
    pub sigma2: f32,
    pub min_weight: f32,
    pub memory_budget: Option<usize>,
}

impl Default for ContentBased {
    fn default() -> Self {
        ContentBased {
            sigma1: 20.0,
            sigma2: 40.0,
            min_weight: 1e-3,
            memory_budget: None,
        }
    }
}

impl ContentBased {
    pub fn new(sigma1: f32, sigma2: f32) -> Self {
        ContentBased {
            sigma1,
            sigma2,
            ..Self::default()
        }
    }

    pub fn with_memory_budget(self, voxels: usize) -> Self {
        ContentBased {
            memory_budget: Some(voxels),
            ..self
        }
    }

    /// Computes the weight map of `image`.
    pub fn weight_map(&self, image: &Volume) -> Result<Volume, WeightenerError> {
        let required = image.len() * 3;
        if let Some(available) = self.memory_budget {
            if required > available {
                return Err(insufficient(required, available));
            }
        }

        let low = gaussian_blur(image, self.sigma1)?;
        let mut energy = reserve(image.len())?;
        energy.extend(
            image
                .data()
                .iter()
                .zip(low.data())
                .map(|(&v, &l)| (v - l) * (v - l)),
        );
        drop(low);
        let energy = Volume::from_data(image.dimensions(), energy).map_err(|e| {
            WeightenerError::Failed {
                name: NAME.into(),
                reason: e.to_string(),
            }
        })?;
        let mut weights = gaussian_blur(&energy, self.sigma2)?;

        // energy this far below the intensity scale is rounding noise of a flat image
        let magnitude = image.data().iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let noise = (magnitude * 1e-5) * (magnitude * 1e-5);
        let max = weights.max_value().unwrap_or(0.0);
        if max > noise && max.is_finite() {
            let floor = self.min_weight;
            weights
                .data_mut()
                .iter_mut()
                .for_each(|w| *w = (*w / max).max(floor));
        } else {
            weights.fill(1.0);
        }
        Ok(weights)
    }
}

impl IsolatedWeightenerFactory for ContentBased {
    fn name(&self) -> &str {
        NAME
    }

    fn create(&self, _view: &View, image: &Volume) -> Result<Volume, WeightenerError> {
        self.weight_map(image)
    }
}

fn insufficient(required: usize, available: usize) -> WeightenerError {
    WeightenerError::InsufficientMemory {
        name: NAME.into(),
        required,
        available,
    }
}

fn reserve(voxels: usize) -> Result<Vec<f32>, WeightenerError> {
    let mut data = Vec::new();
    data.try_reserve_exact(voxels)
        .map_err(|_| insufficient(voxels, 0))?;
    Ok(data)
}

/// Normalised 1D Gaussian of radius `ceil(3 * sigma)`.
fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as i64;
    let kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.into_iter().map(|k| k / sum).collect()
}

/// Separable Gaussian blur with edge-extended borders. `sigma <= 0` copies the input.
fn gaussian_blur(volume: &Volume, sigma: f32) -> Result<Volume, WeightenerError> {
    let mut src = reserve(volume.len())?;
    src.extend_from_slice(volume.data());
    if sigma <= 0.0 || volume.is_empty() {
        return Volume::from_data(volume.dimensions(), src).map_err(|e| WeightenerError::Failed {
            name: NAME.into(),
            reason: e.to_string(),
        });
    }

    let kernel = gaussian_kernel(sigma);
    let mut dst = reserve(volume.len())?;
    dst.resize(volume.len(), 0.0);
    let dims = volume.dimensions();
    for axis in 0..3 {
        blur_axis(&src, &mut dst, dims, axis, &kernel);
        std::mem::swap(&mut src, &mut dst);
    }
    Volume::from_data(dims, src).map_err(|e| WeightenerError::Failed {
        name: NAME.into(),
        reason: e.to_string(),
    })
}

fn blur_axis(src: &[f32], dst: &mut [f32], dims: [usize; 3], axis: usize, kernel: &[f32]) {
    let strides = [1, dims[0], dims[0] * dims[1]];
    let size = dims[axis] as i64;
    let stride = strides[axis];
    let radius = (kernel.len() / 2) as i64;
    let mut i = 0;
    for z in 0..dims[2] {
        for y in 0..dims[1] {
            for x in 0..dims[0] {
                let c = [x, y, z][axis] as i64;
                let base = i - c as usize * stride;
                let mut acc = 0.0;
                for (k, &w) in kernel.iter().enumerate() {
                    let p = (c + k as i64 - radius).clamp(0, size - 1) as usize;
                    acc += w * src[base + p * stride];
                }
                dst[i] = acc;
                i += 1;
            }
        }
    }
}
