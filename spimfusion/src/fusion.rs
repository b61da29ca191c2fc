//! Resampling of registered views into one fused volume.
//!
//! Every output voxel is mapped back into each view through the inverse of the
//! view's affine model. Views that contain the mapped point contribute their
//! trilinearly interpolated intensity, weighted by the product of all configured
//! pixel weighteners. The running sums are normalised by the accumulated weight
//! once all views of a channel have been processed.

use crate::affine_model::SourceLocation;
use crate::config::{FusionConfig, OutputRegion};
use crate::error::{Error, Result, WeightenerError};
use crate::view::{eligible_views, View};
use crate::volume::Volume;
use crate::weightener::{
    describe, CombinedWeightener, CombinedWeightenerFactory, IsolatedWeightenerFactory,
    IsolatedWeights,
};
use rayon::prelude::*;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The result of fusing one channel: normalised intensities plus the weight sum
/// every voxel was normalised by.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedVolume {
    intensity: Volume,
    weights: Volume,
    channel: Option<usize>,
}

impl FusedVolume {
    fn new(dimensions: [usize; 3]) -> Result<Self> {
        Ok(FusedVolume {
            intensity: Volume::new(dimensions)?,
            weights: Volume::new(dimensions)?,
            channel: None,
        })
    }

    /// The fused intensities.
    pub fn intensity(&self) -> &Volume {
        &self.intensity
    }

    /// Accumulated weight per voxel. A voxel no view reached has weight `0.0`.
    pub fn weights(&self) -> &Volume {
        &self.weights
    }

    /// Channel of the last fusion, `None` before the first one.
    pub fn channel(&self) -> Option<usize> {
        self.channel
    }

    /// Size of the fused grid.
    ///
    /// # Returns
    /// `[width, height, depth]` of the output region, shared by intensity and weights.
    pub fn dimensions(&self) -> [usize; 3] {
        self.intensity.dimensions()
    }

    /// Hands out the intensity volume, dropping the weights.
    pub fn into_intensity(self) -> Volume {
        self.intensity
    }

    fn clear(&mut self, channel: usize) {
        self.intensity.fill(0.0);
        self.weights.fill(0.0);
        self.channel = Some(channel);
    }
}

/// Fuses the views of a dataset channel by channel.
///
/// The engine owns its worker pool and the output grids, which are allocated once
/// and reused for every channel.
pub struct FusionEngine {
    config: FusionConfig,
    region: OutputRegion,
    isolated: Vec<Box<dyn IsolatedWeightenerFactory>>,
    combined: Vec<Box<dyn CombinedWeightenerFactory>>,
    pool: rayon::ThreadPool,
    output: FusedVolume,
}

impl std::fmt::Debug for FusionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusionEngine")
            .field("config", &self.config)
            .field("region", &self.region)
            .field("isolated", &describe(self.isolated.iter().map(|w| w.name())))
            .field("combined", &describe(self.combined.iter().map(|w| w.name())))
            .finish()
    }
}

/// Everything the workers need to know about one batch.
struct Batch<'a> {
    /// All eligible views of the channel.
    views: &'a [&'a View],
    /// Views whose images are loaded and accumulated in this pass.
    active: Range<usize>,
    /// Views every output voxel is located in.
    considered: Range<usize>,
    images: &'a [Arc<Volume>],
    isolated: &'a IsolatedWeights,
}

impl FusionEngine {
    /// Creates an engine and reserves the output grids.
    ///
    /// # Parameters
    /// - `config`: thread count and batch size.
    /// - `region`: the part of the common frame to render.
    /// - `isolated`: per-view weighteners, precomputed once per batch.
    /// - `combined`: weighteners evaluated across all views per output voxel.
    ///
    /// # Errors
    /// [`Error::InvalidConfig`] for zero threads, a zero batch size or an empty
    /// region, [`Error::Allocation`] when the output grids do not fit in memory and
    /// [`Error::ThreadPool`] when the workers cannot be started.
    pub fn new(
        config: FusionConfig,
        region: OutputRegion,
        isolated: Vec<Box<dyn IsolatedWeightenerFactory>>,
        combined: Vec<Box<dyn CombinedWeightenerFactory>>,
    ) -> Result<Self> {
        config.validate()?;
        region.validate()?;

        info!(
            "Reserving memory for fused image ({} x {} x {} voxels)",
            region.dimensions[0], region.dimensions[1], region.dimensions[2]
        );
        let output = FusedVolume::new(region.dimensions)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .thread_name(|i| format!("fusion-{i}"))
            .build()?;

        Ok(FusionEngine {
            config,
            region,
            isolated,
            combined,
            pool,
            output,
        })
    }

    /// Thread count and batch size the engine was built with.
    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// The output grid every channel is rendered into.
    ///
    /// # Returns
    /// The region given to [`FusionEngine::new`]; its dimensions match
    /// [`FusedVolume::dimensions`] of [`FusionEngine::output`].
    pub fn region(&self) -> &OutputRegion {
        &self.region
    }

    /// The result of the last fusion.
    pub fn output(&self) -> &FusedVolume {
        &self.output
    }

    /// Fuses all eligible views of `channel` into the output grids.
    ///
    /// The grids are cleared first, so nothing of an earlier channel survives. Views
    /// are processed in batches of `num_parallel_stacks`; only the images of the
    /// active batch are loaded at any time.
    ///
    /// # Errors
    /// Fails if a view image cannot be loaded. A failing isolated weightener is not
    /// an error: isolated weighting is switched off for the rest of the channel and
    /// a warning is logged.
    pub fn fuse(&mut self, views: &[View], channel: usize) -> Result<&FusedVolume> {
        self.output.clear(channel);

        let channel_views: Vec<&View> = views.iter().filter(|v| v.id.channel == channel).collect();
        let eligible = eligible_views(&channel_views, views);
        let mut selected: Vec<&View> = Vec::with_capacity(channel_views.len());
        for (view, ok) in channel_views.iter().copied().zip(eligible) {
            if ok {
                selected.push(view);
            } else {
                debug!("Ignoring {} ({}): no registration connections", view.name, view.id);
            }
        }

        if selected.is_empty() {
            warn!("Channel {channel}: no eligible views, fused volume stays empty");
            return Ok(&self.output);
        }
        info!(
            "Channel {channel}: fusing {} of {} views",
            selected.len(),
            channel_views.len()
        );

        let stacks = self.config.num_parallel_stacks;
        let mut isolated_failed = false;
        for start in (0..selected.len()).step_by(stacks) {
            let active = start..(start + stacks).min(selected.len());
            let considered = if self.combined.is_empty() {
                active.clone()
            } else {
                0..selected.len()
            };

            let mut images = Vec::with_capacity(active.len());
            for view in &selected[active.clone()] {
                debug!("Loading {}", view.name);
                images.push(view.load()?);
            }

            let isolated = if isolated_failed {
                IsolatedWeights::disabled()
            } else {
                self.precompute_isolated(&selected[active.clone()], &images)
            };
            if let IsolatedWeights::Unavailable(ref e) = isolated {
                warn!(
                    "Not enough memory for content-based weighting, continuing without it: {e}"
                );
                isolated_failed = true;
            }

            info!(
                "Starting fusion for views {}..{} {}",
                active.start,
                active.end,
                describe(self.combined.iter().map(|w| w.name()))
            );
            let batch = Batch {
                views: &selected,
                active,
                considered,
                images: &images,
                isolated: &isolated,
            };
            fuse_batch(
                &self.pool,
                &self.region,
                &self.combined,
                &mut self.output,
                &batch,
            );

            for view in &selected[batch.active.clone()] {
                debug!("Unloading {}", view.name);
            }
        }

        info!("Computing final output image (channel {channel})");
        let FusedVolume {
            intensity, weights, ..
        } = &mut self.output;
        self.pool.install(|| {
            intensity
                .data_mut()
                .par_iter_mut()
                .zip(weights.data().par_iter())
                .for_each(|(v, &w)| {
                    if w > 0.0 {
                        *v /= w;
                    }
                })
        });
        Ok(&self.output)
    }

    /// Fuses every channel of `channels` in order and hands each result to `sink`.
    ///
    /// `abort` is checked before each channel; once set, the run stops with
    /// [`Error::Cancelled`] naming the channel that was not started. A channel that is
    /// already running always completes.
    pub fn fuse_channels<F>(
        &mut self,
        views: &[View],
        channels: &[usize],
        abort: &AtomicBool,
        mut sink: F,
    ) -> Result<()>
    where
        F: FnMut(usize, &FusedVolume) -> Result<()>,
    {
        for &channel in channels {
            if abort.load(Ordering::Relaxed) {
                info!("Fusion aborted before channel {channel}");
                return Err(Error::Cancelled { channel });
            }
            let fused = self.fuse(views, channel)?;
            sink(channel, fused)?;
        }
        Ok(())
    }

    /// Builds all isolated weight maps of a batch on the worker pool. Returns once
    /// every map is done or one has failed.
    fn precompute_isolated(&self, batch: &[&View], images: &[Arc<Volume>]) -> IsolatedWeights {
        if self.isolated.is_empty() {
            return IsolatedWeights::disabled();
        }
        info!(
            "Initializing {} for {} views",
            describe(self.isolated.iter().map(|w| w.name())),
            batch.len()
        );
        let maps: std::result::Result<Vec<Vec<Volume>>, WeightenerError> = self.pool.install(|| {
            self.isolated
                .par_iter()
                .map(|factory| {
                    batch
                        .par_iter()
                        .zip(images.par_iter())
                        .map(|(view, image)| -> std::result::Result<Volume, WeightenerError> {
                            let map = factory.create(view, image)?;
                            if map.dimensions() != image.dimensions() {
                                return Err(WeightenerError::Failed {
                                    name: factory.name().to_string(),
                                    reason: format!(
                                        "weight map {:?} does not match view {:?}",
                                        map.dimensions(),
                                        image.dimensions()
                                    ),
                                });
                            }
                            Ok(map)
                        })
                        .collect::<std::result::Result<Vec<Volume>, WeightenerError>>()
                })
                .collect()
        });
        match maps {
            Ok(maps) => IsolatedWeights::Available(maps),
            Err(e) => IsolatedWeights::Unavailable(e),
        }
    }
}

/// Accumulates one batch into the output grids.
///
/// Output z-planes are dealt out round-robin to the workers, so each worker owns a
/// disjoint set of planes of both grids.
fn fuse_batch(
    pool: &rayon::ThreadPool,
    region: &OutputRegion,
    combined: &[Box<dyn CombinedWeightenerFactory>],
    output: &mut FusedVolume,
    batch: &Batch<'_>,
) {
    let threads = pool.current_num_threads().max(1);
    let plane = output.intensity.plane_len().max(1);

    let mut workers: Vec<Vec<(usize, &mut [f32], &mut [f32])>> =
        (0..threads).map(|_| Vec::new()).collect();
    let FusedVolume {
        intensity, weights, ..
    } = output;
    let planes = intensity
        .data_mut()
        .chunks_mut(plane)
        .zip(weights.data_mut().chunks_mut(plane));
    for (z, (intensity, weights)) in planes.enumerate() {
        workers[z % threads].push((z, intensity, weights));
    }

    pool.install(|| {
        workers
            .into_par_iter()
            .for_each(|planes| fuse_planes(planes, region, combined, batch));
    });
}

/// Fuses the given output planes. Runs on one worker with private scratch state.
fn fuse_planes(
    planes: Vec<(usize, &mut [f32], &mut [f32])>,
    region: &OutputRegion,
    combined: &[Box<dyn CombinedWeightenerFactory>],
    batch: &Batch<'_>,
) {
    let considered = &batch.views[batch.considered.clone()];
    let mut weighteners: Vec<Box<dyn CombinedWeightener>> =
        combined.iter().map(|f| f.create(considered)).collect();
    let mut locations = vec![SourceLocation::default(); considered.len()];
    let mut use_view = vec![false; considered.len()];
    let [width, height, _] = region.dimensions;

    for (z, intensity, weights) in planes {
        for y in 0..height {
            for x in 0..width {
                let physical = region.physical_position(x, y, z);

                let mut any = false;
                for (slot, view) in considered.iter().enumerate() {
                    use_view[slot] = match view.model.source_location(physical) {
                        Ok(location) if location.is_inside(view.dimensions()) => {
                            locations[slot] = location;
                            true
                        }
                        _ => false,
                    };
                    any |= use_view[slot];
                }
                if !any {
                    continue;
                }

                for w in weighteners.iter_mut() {
                    w.update_weights(&locations, &use_view);
                }

                let i = x + y * width;
                for view in batch.active.clone() {
                    let slot = view - batch.considered.start;
                    if !use_view[slot] {
                        continue;
                    }
                    let local = view - batch.active.start;
                    let location = &locations[slot];

                    let mut weight = batch.isolated.weight_at(local, location.voxel);
                    for w in &weighteners {
                        weight *= w.weight(slot);
                    }
                    let value = batch.images[local].interpolate_trilinear(location.position);
                    intensity[i] += weight * value;
                    weights[i] += weight;
                }
            }
        }
    }
}
