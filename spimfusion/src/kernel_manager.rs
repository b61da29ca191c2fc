//! Per-view state of a Richardson-Lucy style deconvolution.
//!
//! A [`ConvolutionKernelManager`] holds the image of one view, its weight map and a
//! pair of kernels derived from the point spread function:
//!
//! - `kernel1`, the PSF normalised to unit sum, used to blur the current estimate,
//! - `kernel2`, `kernel1` mirrored along every axis, used to project the correction
//!   back. With exponential acceleration `kernel2` is instead built from `kernel1`
//!   raised voxel-wise to the number of views.
//!
//! The iteration driver itself lives outside this crate; the manager only stores
//! the marker it uses to tell whether cached convolutions belong to the current
//! iteration.

use crate::error::{Error, Result};
use crate::fourier_convolution::FourierConvolution;
use crate::volume::Volume;
use tracing::{debug, warn};

/// Scales `kernel` so that its voxels sum to one.
///
/// # Errors
/// [`Error::DegenerateKernel`] if the sum is zero or not finite.
///
/// # Examples
/// ```
/// # use spimfusion::kernel_manager::normalize_kernel;
/// # use spimfusion::volume::Volume;
/// let mut k = Volume::filled([2, 2, 1], 3.0).unwrap();
/// normalize_kernel(&mut k).unwrap();
/// assert_eq!(k.get(1, 1, 0), 0.25);
/// ```
pub fn normalize_kernel(kernel: &mut Volume) -> Result<()> {
    let sum = kernel.sum();
    if sum == 0.0 || !sum.is_finite() {
        return Err(Error::DegenerateKernel(format!(
            "kernel of size {:?} sums to {sum}",
            kernel.dimensions()
        )));
    }
    kernel.scale((1.0 / sum) as f32);
    Ok(())
}

/// Raises every voxel of `kernel` to the power `num_views`.
pub fn compute_exponential_kernel(kernel: &Volume, num_views: usize) -> Volume {
    let mut exponential = kernel.clone();
    for v in exponential.data_mut() {
        let base = *v;
        *v = (1..num_views).fold(base, |acc, _| acc * base);
    }
    exponential
}

/// Mirrors `kernel` along all three axes.
pub fn compute_inverted_kernel(kernel: &Volume) -> Volume {
    let mut inverted = kernel.clone();
    for axis in 0..3 {
        inverted.mirror_axis(axis);
    }
    inverted
}

/// Normalises `kernel` and derives its partner. Returns `(kernel1, kernel2)`.
fn derive_kernels(
    mut kernel: Volume,
    num_views: usize,
    use_exponential_kernel: bool,
) -> Result<(Volume, Volume)> {
    normalize_kernel(&mut kernel)?;
    let kernel2 = if use_exponential_kernel {
        let mut exponential = compute_exponential_kernel(&kernel, num_views);
        normalize_kernel(&mut exponential)?;
        compute_inverted_kernel(&exponential)
    } else {
        compute_inverted_kernel(&kernel)
    };
    debug!(
        "Derived kernel pair of size {:?} (exponent {})",
        kernel.dimensions(),
        if use_exponential_kernel { num_views } else { 1 }
    );
    Ok((kernel, kernel2))
}

fn check_dimensions(what: &'static str, expected: [usize; 3], actual: &Volume) -> Result<()> {
    if actual.dimensions() != expected {
        return Err(Error::DimensionMismatch {
            what,
            expected,
            actual: actual.dimensions(),
        });
    }
    Ok(())
}

/// Image, weight and kernel pair of one view, with convolution operators planned
/// for the image size.
///
/// Convolutions reuse internal buffers and take `&mut self`. Deconvolving several
/// views concurrently needs one manager per view.
#[derive(Debug)]
pub struct ConvolutionKernelManager {
    image: Volume,
    weight: Option<Volume>,
    kernel1: Volume,
    kernel2: Volume,
    num_views: usize,
    use_exponential_kernel: bool,
    current_iteration: Option<usize>,
    view_contribution: Option<Volume>,
    convolution1: FourierConvolution,
    convolution2: FourierConvolution,
}

impl ConvolutionKernelManager {
    /// Creates the manager and plans both convolutions.
    ///
    /// # Parameters
    /// - `image`: the acquired view.
    /// - `weight`: per-voxel confidence of `image`; `None` means uniform weight 1.
    /// - `kernel`: the point spread function. It does not need to be normalised.
    /// - `num_views`: number of views of the acquisition, the exponent of the
    ///   exponential kernel. Zero is read as one.
    /// - `use_exponential_kernel`: derive `kernel2` from `kernel1^num_views`.
    ///
    /// # Errors
    /// - [`Error::DimensionMismatch`] if `weight` and `image` differ in size.
    /// - [`Error::DegenerateKernel`] if the kernel cannot be normalised.
    /// - [`Error::Allocation`] if the FFT buffers do not fit in memory.
    pub fn new(
        image: Volume,
        weight: Option<Volume>,
        kernel: Volume,
        num_views: usize,
        use_exponential_kernel: bool,
    ) -> Result<Self> {
        if let Some(weight) = &weight {
            check_dimensions("weight image", image.dimensions(), weight)?;
        }
        let num_views = if use_exponential_kernel && num_views == 0 {
            warn!("Number of views was not set, using 1 for the exponential kernel");
            1
        } else {
            num_views
        };

        let (kernel1, kernel2) = derive_kernels(kernel, num_views, use_exponential_kernel)?;
        let convolution1 = FourierConvolution::new(image.dimensions(), &kernel1)?;
        let convolution2 = FourierConvolution::new(image.dimensions(), &kernel2)?;
        Ok(ConvolutionKernelManager {
            image,
            weight,
            kernel1,
            kernel2,
            num_views,
            use_exponential_kernel,
            current_iteration: None,
            view_contribution: None,
            convolution1,
            convolution2,
        })
    }

    pub fn image(&self) -> &Volume {
        &self.image
    }

    /// The weight map, `None` when every voxel has weight 1.
    pub fn weight(&self) -> Option<&Volume> {
        self.weight.as_ref()
    }

    /// The normalised point spread function.
    pub fn kernel1(&self) -> &Volume {
        &self.kernel1
    }

    /// The mirrored (and possibly exponentiated) partner of `kernel1`.
    pub fn kernel2(&self) -> &Volume {
        &self.kernel2
    }

    pub fn num_views(&self) -> usize {
        self.num_views
    }

    /// Whether `kernel2` is derived from `kernel1^num_views` instead of `kernel1`.
    pub fn uses_exponential_kernel(&self) -> bool {
        self.use_exponential_kernel
    }

    /// Iteration whose convolutions are cached, `None` if none are.
    pub fn current_iteration(&self) -> Option<usize> {
        self.current_iteration
    }

    pub fn set_current_iteration(&mut self, iteration: Option<usize>) {
        self.current_iteration = iteration;
    }

    /// Scratch volume the iteration driver may keep with the view.
    pub fn view_contribution(&self) -> Option<&Volume> {
        self.view_contribution.as_ref()
    }

    pub fn set_view_contribution(&mut self, contribution: Option<Volume>) {
        self.view_contribution = contribution;
    }

    /// Replaces the image and invalidates cached convolutions.
    ///
    /// # Errors
    /// [`Error::DimensionMismatch`] if `image` has a different size than the
    /// planned convolutions; the manager is left unchanged.
    pub fn set_image(&mut self, image: Volume) -> Result<()> {
        check_dimensions("image", self.image.dimensions(), &image)?;
        self.image = image;
        self.current_iteration = None;
        Ok(())
    }

    /// Replaces the weight map.
    pub fn set_weight(&mut self, weight: Option<Volume>) -> Result<()> {
        if let Some(weight) = &weight {
            check_dimensions("weight image", self.image.dimensions(), weight)?;
        }
        self.weight = weight;
        Ok(())
    }

    /// Replaces the point spread function, re-derives both kernels, re-plans the
    /// convolutions and invalidates cached convolutions. On error nothing changes.
    pub fn set_kernel(&mut self, kernel: Volume) -> Result<()> {
        let (kernel1, kernel2) =
            derive_kernels(kernel, self.num_views, self.use_exponential_kernel)?;
        let dims = self.image.dimensions();
        let convolution1 = FourierConvolution::new(dims, &kernel1)?;
        let convolution2 = FourierConvolution::new(dims, &kernel2)?;
        self.convolution1 = convolution1;
        self.convolution2 = convolution2;
        self.kernel1 = kernel1;
        self.kernel2 = kernel2;
        self.current_iteration = None;
        Ok(())
    }

    /// Convolves `input` with `kernel1` into a new volume.
    pub fn convolve1(&mut self, input: &Volume) -> Result<Volume> {
        self.convolution1.convolve(input)
    }

    /// Convolves `input` with `kernel2` into a new volume.
    pub fn convolve2(&mut self, input: &Volume) -> Result<Volume> {
        self.convolution2.convolve(input)
    }

    /// Deep copy with freshly planned convolutions. Nothing is shared with `self`.
    ///
    /// # Errors
    /// [`Error::Allocation`] if the copy does not fit in memory.
    pub fn try_clone(&self) -> Result<Self> {
        let dims = self.image.dimensions();
        Ok(ConvolutionKernelManager {
            image: self.image.clone(),
            weight: self.weight.clone(),
            kernel1: self.kernel1.clone(),
            kernel2: self.kernel2.clone(),
            num_views: self.num_views,
            use_exponential_kernel: self.use_exponential_kernel,
            current_iteration: self.current_iteration,
            view_contribution: self.view_contribution.clone(),
            convolution1: FourierConvolution::new(dims, &self.kernel1)?,
            convolution2: FourierConvolution::new(dims, &self.kernel2)?,
        })
    }
}
