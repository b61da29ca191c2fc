use proptest::prelude::*;
use spimfusion::kernel_manager::{
    compute_exponential_kernel, compute_inverted_kernel, normalize_kernel,
};
use spimfusion::volume::Volume;
use spimfusion::ConvolutionKernelManager;

fn kernel() -> impl Strategy<Value = Volume> {
    (1usize..5, 1usize..5, 1usize..5).prop_flat_map(|(w, h, d)| {
        prop::collection::vec(0.01f32..10.0, w * h * d)
            .prop_map(move |data| Volume::from_data([w, h, d], data).unwrap())
    })
}

#[test]
fn normalised_kernel_sums_to_one() {
    proptest!(|(mut k in kernel())| {
        normalize_kernel(&mut k).unwrap();
        prop_assert!((k.sum() - 1.0).abs() < 1e-4);
        prop_assert!(k.data().iter().all(|&v| v > 0.0));
    });
}

#[test]
fn mirroring_twice_is_identity() {
    proptest!(|(k in kernel())| {
        let twice = compute_inverted_kernel(&compute_inverted_kernel(&k));
        prop_assert_eq!(twice, k);
    });
}

#[test]
fn exponent_one_is_identity() {
    proptest!(|(k in kernel())| {
        prop_assert_eq!(compute_exponential_kernel(&k, 1), k);
    });
}

#[test]
fn manager_kernel2_mirrors_kernel1() {
    proptest!(|(k in kernel())| {
        let image = Volume::filled([5, 4, 3], 1.0).unwrap();
        let m = ConvolutionKernelManager::new(image, None, k, 1, false).unwrap();
        prop_assert_eq!(m.kernel2(), &compute_inverted_kernel(m.kernel1()));
        prop_assert!((m.kernel1().sum() - 1.0).abs() < 1e-4);
    });
}

#[test]
fn constant_image_survives_both_convolutions() {
    proptest!(|(k in kernel(), level in 0.5f32..100.0)| {
        let image = Volume::filled([6, 5, 4], level).unwrap();
        let mut m = ConvolutionKernelManager::new(image.clone(), None, k, 2, true).unwrap();
        for out in [m.convolve1(&image).unwrap(), m.convolve2(&image).unwrap()] {
            prop_assert_eq!(out.dimensions(), image.dimensions());
            for &v in out.data() {
                prop_assert!((v - level).abs() < level * 1e-3);
            }
        }
    });
}
