use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spimfusion::affine_model::AffineModel3D;
use spimfusion::config::{FusionConfig, OutputRegion};
use spimfusion::view::{RegistrationStats, View, ViewId, VolumeSource};
use spimfusion::volume::Volume;
use spimfusion::weightener::{
    Blending, CombinedWeightenerFactory, ContentBased, IsolatedWeightenerFactory,
};
use spimfusion::{Error, FusionEngine};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const CONNECTED: RegistrationStats = RegistrationStats {
    connected_views: 2,
    connected_tiles: 0,
    used_for_registration: true,
};

fn random_volume(rng: &mut StdRng, dims: [usize; 3]) -> Volume {
    Volume::from_fn(dims, |_, _, _| rng.random_range(0.0f32..10.0)).unwrap()
}

fn view(angle: i32, volume: Volume, model: AffineModel3D) -> View {
    let id = ViewId {
        angle,
        ..ViewId::default()
    };
    View::in_memory(id, format!("angle {angle}"), volume, model, CONNECTED)
}

fn fuse(
    views: &[View],
    region: OutputRegion,
    threads: usize,
    stacks: usize,
) -> spimfusion::FusedVolume {
    let mut engine = FusionEngine::new(
        FusionConfig::new(threads, stacks),
        region,
        Vec::new(),
        Vec::new(),
    )
    .unwrap();
    engine.fuse(views, 0).unwrap().clone()
}

#[test]
fn example_two_unit_views() {
    let views = vec![
        view(0, Volume::filled([4, 4, 4], 1.0).unwrap(), AffineModel3D::identity()),
        view(90, Volume::filled([4, 4, 4], 1.0).unwrap(), AffineModel3D::identity()),
    ];
    let fused = fuse(&views, OutputRegion::new([4, 4, 4]), 2, 1);
    assert!(fused.intensity().data().iter().all(|&v| (v - 1.0).abs() < 1e-6));
    assert!(fused.weights().data().iter().all(|&w| w == 2.0));
}

#[test]
fn overlapping_views_are_averaged_and_counted() {
    let mut rng = StdRng::seed_from_u64(42);
    let offsets = [0usize, 3, 6];
    let dims = [8, 5, 5];
    let volumes: Vec<Volume> = offsets.iter().map(|_| random_volume(&mut rng, dims)).collect();
    let views: Vec<View> = offsets
        .iter()
        .zip(&volumes)
        .enumerate()
        .map(|(i, (&o, v))| {
            view(i as i32 * 45, v.clone(), AffineModel3D::translation(o as f64, 0.0, 0.0))
        })
        .collect();
    let region = OutputRegion::bounding_box(&views, 1.0).unwrap();
    assert_eq!(region.dimensions, [14, 5, 5]);

    let fused = fuse(&views, region, 3, 1);
    for z in 0..5 {
        for y in 0..5 {
            for x in 0..14 {
                let samples: Vec<f32> = offsets
                    .iter()
                    .zip(&volumes)
                    .filter(|(o, _)| x >= **o && x - **o < dims[0])
                    .map(|(&o, v)| v.get(x - o, y, z))
                    .collect();
                let mean = samples.iter().sum::<f32>() / samples.len() as f32;
                assert_eq!(fused.weights().get(x, y, z), samples.len() as f32);
                assert!((fused.intensity().get(x, y, z) - mean).abs() < 1e-4);
            }
        }
    }
}

#[test]
fn batch_size_and_thread_count_do_not_matter() {
    let mut rng = StdRng::seed_from_u64(7);
    let views: Vec<View> = (0..4)
        .map(|i| {
            let angle = i as f64 * 0.4;
            let model = AffineModel3D::rotation_y(angle, [6.0, 5.0, 6.0])
                .then(&AffineModel3D::translation(rng.random_range(-1.0..1.0), 0.0, 0.0));
            view(i * 30, random_volume(&mut rng, [12, 10, 12]), model)
        })
        .collect();
    let region = OutputRegion::bounding_box(&views, 1.0).unwrap();

    let reference = fuse(&views, region, 1, 1);
    for (threads, stacks) in [(4, 1), (3, 2), (2, 4)] {
        let other = fuse(&views, region, threads, stacks);
        for (a, b) in reference.intensity().data().iter().zip(other.intensity().data()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b} ({threads} threads, {stacks} stacks)");
        }
        for (a, b) in reference.weights().data().iter().zip(other.weights().data()) {
            assert!((a - b).abs() < 1e-4);
        }
    }
}

#[test]
fn weighted_result_stays_within_input_range() {
    let mut rng = StdRng::seed_from_u64(3);
    let views: Vec<View> = (0..3)
        .map(|i| {
            let model = AffineModel3D::rotation_y(i as f64 * 0.6, [8.0, 4.0, 8.0]);
            view(i * 60, random_volume(&mut rng, [16, 8, 16]), model)
        })
        .collect();
    let region = OutputRegion::bounding_box(&views, 1.0).unwrap();
    let isolated: Vec<Box<dyn IsolatedWeightenerFactory>> =
        vec![Box::new(ContentBased::new(1.0, 2.0))];
    let combined: Vec<Box<dyn CombinedWeightenerFactory>> =
        vec![Box::new(Blending::new([0.0; 3], [4.0; 3]))];
    let mut engine =
        FusionEngine::new(FusionConfig::new(3, 2), region, isolated, combined).unwrap();
    let fused = engine.fuse(&views, 0).unwrap();

    for (&v, &w) in fused.intensity().data().iter().zip(fused.weights().data()) {
        assert!(w >= 0.0 && w <= 3.0 + 1e-5);
        if w > 0.0 {
            assert!((-1e-4..=10.0 + 1e-4).contains(&v), "{v}");
        } else {
            assert_eq!(v, 0.0);
        }
    }
}

#[test]
fn exhausted_memory_budget_degrades_to_unweighted_fusion() {
    let mut rng = StdRng::seed_from_u64(11);
    let views: Vec<View> = (0..2)
        .map(|i| view(i * 90, random_volume(&mut rng, [6, 6, 6]), AffineModel3D::identity()))
        .collect();
    let region = OutputRegion::new([6, 6, 6]);
    let isolated: Vec<Box<dyn IsolatedWeightenerFactory>> =
        vec![Box::new(ContentBased::default().with_memory_budget(10))];
    let mut engine =
        FusionEngine::new(FusionConfig::new(2, 1), region, isolated, Vec::new()).unwrap();
    let degraded = engine.fuse(&views, 0).unwrap().clone();
    let plain = fuse(&views, region, 2, 1);
    assert_eq!(degraded.weights(), plain.weights());
    for (a, b) in degraded.intensity().data().iter().zip(plain.intensity().data()) {
        assert!((a - b).abs() < 1e-5);
    }
}

#[test]
fn scaled_region_samples_every_second_voxel() {
    let ramp = Volume::from_fn([8, 8, 8], |x, _, _| x as f32).unwrap();
    let views = vec![view(0, ramp, AffineModel3D::identity())];
    let region = OutputRegion::bounding_box(&views, 2.0).unwrap();
    assert_eq!(region.dimensions, [5, 5, 5]);
    let fused = fuse(&views, region, 2, 1);
    for x in 0..4 {
        assert!((fused.intensity().get(x, 1, 1) - 2.0 * x as f32).abs() < 1e-5);
    }
    // x = 8 lies outside the view
    assert_eq!(fused.weights().get(4, 1, 1), 0.0);
}

struct CountingSource {
    volume: Arc<Volume>,
    loads: Arc<AtomicUsize>,
}

impl VolumeSource for CountingSource {
    fn load(&self) -> spimfusion::Result<Arc<Volume>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.volume))
    }
}

struct BrokenSource;

impl VolumeSource for BrokenSource {
    fn load(&self) -> spimfusion::Result<Arc<Volume>> {
        Err(Error::InvalidConfig("file vanished".into()))
    }
}

#[test]
fn every_view_is_loaded_once_per_channel() {
    let loads = Arc::new(AtomicUsize::new(0));
    let views: Vec<View> = (0..5)
        .map(|i| {
            View::new(
                ViewId::default(),
                format!("stack {i}"),
                [3, 3, 3],
                AffineModel3D::identity(),
                CONNECTED,
                Box::new(CountingSource {
                    volume: Arc::new(Volume::filled([3, 3, 3], i as f32).unwrap()),
                    loads: Arc::clone(&loads),
                }),
            )
        })
        .collect();
    let fused = fuse(&views, OutputRegion::new([3, 3, 3]), 2, 2);
    assert_eq!(loads.load(Ordering::SeqCst), 5);
    assert!((fused.intensity().get(1, 1, 1) - 2.0).abs() < 1e-6);
}

#[test]
fn failing_source_aborts_the_channel() {
    let views = vec![View::new(
        ViewId::default(),
        "missing",
        [3, 3, 3],
        AffineModel3D::identity(),
        CONNECTED,
        Box::new(BrokenSource),
    )];
    let mut engine = FusionEngine::new(
        FusionConfig::new(1, 1),
        OutputRegion::new([3, 3, 3]),
        Vec::new(),
        Vec::new(),
    )
    .unwrap();
    let err = engine.fuse(&views, 0).unwrap_err();
    assert!(matches!(err, Error::ViewLoad { ref view, .. } if view == "missing"));
}
