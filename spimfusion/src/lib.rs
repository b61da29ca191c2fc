//! # SpimFusion Library
//!
//! The `spimfusion` library reconstructs one volume from several registered
//! light-sheet acquisitions ("views") of the same specimen, and manages the kernel
//! pairs an iterative multi-view deconvolution convolves with.
//!
//! ## Overview of Modules
//!
//! - **`fusion`**: The `FusionEngine` resamples every eligible view of a channel into
//!   a common output grid, blends overlapping views with per-voxel weights and
//!   normalises by the accumulated weight. Views are processed in batches so only a
//!   few images are held in memory at once.
//!
//! - **`weightener`**: Pixel weighting strategies. Isolated weighteners (e.g.
//!   `ContentBased`) build a weight map per view; combined weighteners (e.g.
//!   `Blending`) weigh all views jointly at every output voxel.
//!
//! - **`kernel_manager`**: `ConvolutionKernelManager` keeps a view's image, weight
//!   map and the normalised / mirrored kernel pair, and convolves with either kernel.
//!
//! - **`fourier_convolution`**: FFT-based 3D convolution with a fixed kernel.
//!
//! - **`affine_model`**: `AffineModel3D` maps view voxels into the common frame and
//!   back, and `SourceLocation` is where an output voxel lands inside a view.
//!
//! - **`view`**: `View` records with their identifiers, registration statistics and
//!   lazily loaded image data.
//!
//! - **`volume`**: `Volume`, a dense 3D `f32` grid with edge-extended sampling and
//!   trilinear interpolation.
//!
//! - **`config`**: `FusionConfig` (threads, batch size) and `OutputRegion` (what part
//!   of the common frame is rendered, and at which scale).
//!
//! - **`error`**: The crate's `Error` and `Result` types.

pub mod affine_model;
pub mod config;
pub mod error;
pub mod fourier_convolution;
pub mod fusion;
pub mod kernel_manager;
pub mod view;
pub mod volume;
pub mod weightener;

pub use error::{Error, Result};
pub use fusion::{FusedVolume, FusionEngine};
pub use kernel_manager::ConvolutionKernelManager;

/// Crate version, as reported by the command line tool.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
