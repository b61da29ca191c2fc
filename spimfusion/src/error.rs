//! Error types for spimfusion
//!
//! Fatal conditions (allocation of output grids, kernel derivation, FFT plans) are
//! surfaced through [`Error`]. The recoverable path of building isolated weighteners
//! under memory pressure has its own [`WeightenerError`], which the fusion engine
//! downgrades to a warning.

use thiserror::Error;

/// Main error type for the fusion and deconvolution kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected configuration values (zero threads, zero batch size, empty region)
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// A dense grid could not be reserved
    #[error("Cannot allocate {what} ({voxels} voxels)")]
    Allocation { what: &'static str, voxels: usize },

    /// Two volumes that must share a shape do not
    #[error("Dimension mismatch for {what}: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        what: &'static str,
        expected: [usize; 3],
        actual: [usize; 3],
    },

    /// The affine model has no inverse at the requested point
    #[error("Model not invertible: {0}")]
    NoninvertibleModel(String),

    /// The pixel source of a view failed to deliver its image
    #[error("Cannot load view {view}: {reason}")]
    ViewLoad { view: String, reason: String },

    /// The worker pool could not be started
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// The run was aborted at a channel boundary
    #[error("Fusion aborted before channel {channel}")]
    Cancelled { channel: usize },

    /// A convolution kernel that cannot be normalised
    #[error("Degenerate kernel: {0}")]
    DegenerateKernel(String),

    /// FFT planning or execution failed
    #[error("FFT error: {0}")]
    Fft(String),
}

/// Convenience Result type using the spimfusion Error
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to build an isolated pixel weightener for one view.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WeightenerError {
    /// Not enough memory for the weight map (or its temporaries)
    #[error("Not enough memory for {name}: {required} voxels required, {available} available")]
    InsufficientMemory {
        name: String,
        required: usize,
        available: usize,
    },

    /// Any other construction failure
    #[error("{name} failed: {reason}")]
    Failed { name: String, reason: String },
}
