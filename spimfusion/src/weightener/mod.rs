//! Per-voxel weights used when blending views.
//!
//! Two kinds of weighteners exist:
//! - *isolated* ones look at a single view and are precomputed once per view as a
//!   weight map in that view's voxel space (e.g. local image content),
//! - *combined* ones see where an output voxel lands in every view at once and are
//!   re-evaluated for each output voxel (e.g. blending across view borders).

pub mod blending;
pub mod content_based;

use crate::affine_model::SourceLocation;
use crate::error::WeightenerError;
use crate::view::View;
use crate::volume::Volume;

pub use blending::Blending;
pub use content_based::ContentBased;

/// Builds a weight map for one view. Construction may fail when memory is short;
/// fusion then continues without content-based weighting.
pub trait IsolatedWeightenerFactory: Send + Sync {
    /// Human-readable name, used in log output.
    fn name(&self) -> &str;

    /// Computes the weight map of `view`, whose loaded pixels are `image`. The map
    /// must have the same dimensions as `image`.
    fn create(&self, view: &View, image: &Volume) -> Result<Volume, WeightenerError>;
}

/// Weights derived from the joint state of all views at one output voxel.
///
/// Each fusion worker owns its own instances, so implementations may keep mutable
/// scratch state between [`update_weights`](CombinedWeightener::update_weights) and
/// [`weight`](CombinedWeightener::weight).
pub trait CombinedWeightener {
    /// Recomputes the weights for the current output voxel. `locations[i]` is where
    /// the voxel lands in view `i`; `use_view[i]` tells whether it lands inside it.
    fn update_weights(&mut self, locations: &[SourceLocation], use_view: &[bool]);

    /// Weight of view `view` for the last update.
    fn weight(&self, view: usize) -> f32;
}

pub trait CombinedWeightenerFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Creates an instance for the full list of views of the channel being fused.
    fn create(&self, views: &[&View]) -> Box<dyn CombinedWeightener>;
}

/// Outcome of precomputing the isolated weight maps of one batch.
#[derive(Debug)]
pub enum IsolatedWeights {
    /// `maps[factory][i]` is the map of the `i`-th view of the batch. An empty list
    /// means no isolated weighting.
    Available(Vec<Vec<Volume>>),
    /// At least one map could not be built.
    Unavailable(WeightenerError),
}

impl IsolatedWeights {
    /// The empty weightener set: every view gets unit isolated weight.
    pub fn disabled() -> Self {
        IsolatedWeights::Available(Vec::new())
    }

    /// Product of all isolated weights of batch view `index` at source voxel `voxel`.
    /// Unavailable weights count as `1.0`.
    pub fn weight_at(&self, index: usize, voxel: [i64; 3]) -> f32 {
        match self {
            IsolatedWeights::Available(maps) => maps
                .iter()
                .map(|per_view| per_view[index].get_clamped(voxel[0], voxel[1], voxel[2]))
                .product(),
            IsolatedWeights::Unavailable(_) => 1.0,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, IsolatedWeights::Available(_))
    }
}

/// Joins factory names for log output, e.g. `"(Blending, Content-based)"`.
pub(crate) fn describe<'a>(names: impl Iterator<Item = &'a str>) -> String {
    format!("({})", names.collect::<Vec<_>>().join(", "))
}
