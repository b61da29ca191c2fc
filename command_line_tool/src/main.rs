use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spimfusion::affine_model::AffineModel3D;
use spimfusion::config::{FusionConfig, OutputRegion};
use spimfusion::view::{RegistrationStats, View, ViewId};
use spimfusion::volume::Volume;
use spimfusion::weightener::{
    Blending, CombinedWeightenerFactory, ContentBased, IsolatedWeightenerFactory,
};
use spimfusion::{ConvolutionKernelManager, FusedVolume, FusionEngine};
use std::f64::consts::PI;
use std::sync::atomic::AtomicBool;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments structure.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Simulates a multi-view light-sheet acquisition of a bead phantom and fuses it."
)]
struct Args {
    /// Number of acquisition angles, spread evenly over 180 degrees
    #[arg(long, default_value_t = 4)]
    angles: usize,

    /// Edge length of the (cubic) phantom and of every view, in voxels
    #[arg(long, default_value_t = 64)]
    size: usize,

    /// Number of channels. Only channel 0 carries registration results; the other
    /// channels inherit them from the view with the same angle.
    #[arg(long, default_value_t = 1)]
    channels: usize,

    /// Number of beads in the phantom
    #[arg(long, default_value_t = 40)]
    beads: usize,

    /// Worker threads (default: one per core)
    #[arg(long)]
    threads: Option<usize>,

    /// How many views are held in memory at once
    #[arg(long, default_value_t = 1)]
    parallel_stacks: usize,

    /// Output voxel size relative to the input voxel size
    #[arg(long, default_value_t = 1.0)]
    scale: f32,

    /// Fade views out towards their borders
    #[arg(long)]
    blending: bool,

    /// Weight views by local image content
    #[arg(long)]
    content_based: bool,

    /// Blur each fused channel with a Gaussian PSF of this sigma (in voxels)
    #[arg(long)]
    psf_sigma: Option<f32>,

    /// Derive the mirrored PSF from PSF^angles
    #[arg(long)]
    exponential: bool,

    /// Seed of the phantom and the acquisition noise
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Base filename for the projections (e.g. "fused" -> "fused_c0.png", ...)
    #[arg(long, default_value = "fused")]
    base_filename: String,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spimfusion=info,spimfusion_command_line_tool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    validate_args(&args)?;
    info!("spimfusion {}", spimfusion::VERSION);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let phantom = bead_phantom(&mut rng, args.size, args.beads)?;
    let views = acquire_views(&mut rng, &phantom, &args)?;

    let region = OutputRegion::bounding_box(&views, args.scale)?;
    let config = FusionConfig {
        num_threads: args.threads.unwrap_or_else(|| FusionConfig::default().num_threads),
        num_parallel_stacks: args.parallel_stacks,
    };
    let mut isolated: Vec<Box<dyn IsolatedWeightenerFactory>> = Vec::new();
    if args.content_based {
        isolated.push(Box::new(ContentBased::new(
            args.size as f32 / 16.0,
            args.size as f32 / 8.0,
        )));
    }
    let mut combined: Vec<Box<dyn CombinedWeightenerFactory>> = Vec::new();
    if args.blending {
        combined.push(Box::new(Blending::new(
            [0.0; 3],
            [args.size as f32 / 8.0; 3],
        )));
    }

    let mut engine = FusionEngine::new(config, region, isolated, combined)?;
    let channels: Vec<usize> = (0..args.channels).collect();
    let abort = AtomicBool::new(false);
    let mut fused = Vec::with_capacity(channels.len());
    engine.fuse_channels(&views, &channels, &abort, |channel, volume| {
        fused.push((channel, volume.clone()));
        Ok(())
    })?;

    for (channel, volume) in &fused {
        let filename = format!("{}_c{}.png", args.base_filename, channel);
        save_projection(volume.intensity(), &filename)?;

        if let Some(sigma) = args.psf_sigma {
            let blurred = convolve_with_psf(volume, sigma, args.angles, args.exponential)?;
            let filename = format!("{}_c{}_psf.png", args.base_filename, channel);
            save_projection(&blurred, &filename)?;
        }
    }

    info!("Done.");
    Ok(())
}

/// Rejects argument combinations that cannot produce a fused image.
///
/// Views only take part in fusion when they are connected to another view. A
/// single angle has no partner, and is only fused when it is the sole view.
fn validate_args(args: &Args) -> Result<()> {
    anyhow::ensure!(args.angles > 0, "at least one angle is needed");
    anyhow::ensure!(args.channels > 0, "at least one channel is needed");
    anyhow::ensure!(
        args.angles > 1 || args.channels == 1,
        "{} channels of a single angle cannot be fused: use at least two angles",
        args.channels
    );
    anyhow::ensure!(args.size > 1, "the phantom needs at least 2 voxels per axis");
    Ok(())
}

/// A cube of background noise with Gaussian beads at random positions.
fn bead_phantom(rng: &mut StdRng, size: usize, beads: usize) -> Result<Volume> {
    let margin = (size as f32 * 0.15).max(1.0);
    let centres: Vec<[f32; 3]> = (0..beads)
        .map(|_| {
            [0; 3].map(|_| rng.random_range(margin..(size as f32 - margin).max(margin + 1.0)))
        })
        .collect();
    let radius = (size as f32 / 32.0).max(1.0);

    let phantom = Volume::from_fn([size; 3], |x, y, z| {
        let p = [x as f32, y as f32, z as f32];
        centres
            .iter()
            .map(|c| {
                let d2: f32 = (0..3).map(|a| (p[a] - c[a]) * (p[a] - c[a])).sum();
                100.0 * (-d2 / (2.0 * radius * radius)).exp()
            })
            .sum::<f32>()
    })?;
    Ok(phantom)
}

/// Images the phantom from evenly spaced angles around the y axis. Every view sees
/// the phantom through its own rotation and is attenuated along its detection axis.
fn acquire_views(rng: &mut StdRng, phantom: &Volume, args: &Args) -> Result<Vec<View>> {
    let size = args.size;
    let centre = [(size - 1) as f64 / 2.0; 3];
    let mut views = Vec::with_capacity(args.angles * args.channels);

    for channel in 0..args.channels {
        let brightness = 1.0 / (channel + 1) as f32;
        for a in 0..args.angles {
            let angle_deg = (a * 180 / args.angles) as i32;
            let model = AffineModel3D::rotation_y(a as f64 * PI / args.angles as f64, centre);
            let image = Volume::from_fn([size; 3], |x, y, z| {
                let p = model.apply([x as f64, y as f64, z as f64]);
                let signal = phantom.interpolate_trilinear([p[0] as f32, p[1] as f32, p[2] as f32]);
                let attenuation = (-2.0 * z as f32 / size as f32).exp();
                brightness * signal * attenuation + rng.random_range(0.0f32..1.0)
            })?;
            let registration = if channel == 0 {
                RegistrationStats {
                    connected_views: args.angles - 1,
                    connected_tiles: 0,
                    used_for_registration: true,
                }
            } else {
                RegistrationStats::default()
            };
            let id = ViewId {
                channel,
                angle: angle_deg,
                timepoint: 0,
                illumination: 0,
            };
            info!("Acquired view {id}");
            views.push(View::in_memory(
                id,
                format!("angle {angle_deg} channel {channel}"),
                image,
                model,
                registration,
            ));
        }
    }
    Ok(views)
}

/// Gaussian point spread function, elongated twofold along z.
fn gaussian_psf(sigma: f32) -> Result<Volume> {
    let sigmas = [sigma, sigma, 2.0 * sigma];
    let dims = sigmas.map(|s| 2 * (3.0 * s).ceil().max(1.0) as usize + 1);
    let psf = Volume::from_fn(dims, |x, y, z| {
        let p = [x, y, z];
        (0..3)
            .map(|a| {
                let d = p[a] as f32 - (dims[a] / 2) as f32;
                (-d * d / (2.0 * sigmas[a] * sigmas[a])).exp()
            })
            .product()
    })?;
    Ok(psf)
}

fn convolve_with_psf(
    fused: &FusedVolume,
    sigma: f32,
    num_views: usize,
    exponential: bool,
) -> Result<Volume> {
    let mut manager = ConvolutionKernelManager::new(
        fused.intensity().clone(),
        Some(fused.weights().clone()),
        gaussian_psf(sigma)?,
        num_views,
        exponential,
    )?;
    let blurred = manager.convolve1(fused.intensity())?;
    let back = manager.convolve2(&blurred)?;
    info!(
        "PSF convolution: intensity sum {:.1} -> {:.1} -> {:.1}",
        fused.intensity().sum(),
        blurred.sum(),
        back.sum()
    );
    Ok(blurred)
}

/// Writes the maximum intensity projection along z as an 8-bit grayscale PNG.
fn save_projection(volume: &Volume, filename: &str) -> Result<()> {
    let [w, h, d] = volume.dimensions();
    let mut mip = vec![0.0f32; w * h];
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let m = &mut mip[x + y * w];
                *m = m.max(volume.get(x, y, z));
            }
        }
    }
    let max = mip.iter().copied().fold(0.0f32, f32::max);
    let norm = if max > 0.0 { 255.0 / max } else { 0.0 };
    let pixels: Vec<u8> = mip.iter().map(|&v| (v * norm).clamp(0.0, 255.0) as u8).collect();

    info!("Writing image {filename}");
    let img = image::GrayImage::from_raw(w as u32, h as u32, pixels)
        .context("projection buffer does not match image size")?;
    img.save(filename)
        .with_context(|| format!("cannot write {filename}"))?;
    Ok(())
}
