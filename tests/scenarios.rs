//! End-to-end training scenarios.

use approx::assert_abs_diff_eq;
use gaussmix::linalg::IndexedFactor;
use gaussmix::missing::MissingPattern;
use gaussmix::{
    train, Covariance, CovarianceKind, GaussMixConfig, GaussMixTrainer, GaussianComponent,
    MixtureModel, SpanningTraversal,
};
use ndarray::{array, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `n_per` points around each center with unit standard deviation.
fn blobs(centers: &[[f64; 2]], n_per: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let mut data = Array2::zeros((centers.len() * n_per, 2));
    for (c, center) in centers.iter().enumerate() {
        for i in 0..n_per {
            let row = c * n_per + i;
            data[(row, 0)] = center[0] + noise.sample(&mut rng);
            data[(row, 1)] = center[1] + noise.sample(&mut rng);
        }
    }
    data
}

fn nearest_center(mean: &ndarray::Array1<f64>, centers: &[[f64; 2]]) -> (usize, f64) {
    centers
        .iter()
        .enumerate()
        .map(|(k, c)| (k, ((mean[0] - c[0]).powi(2) + (mean[1] - c[1]).powi(2)).sqrt()))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap()
}

#[test]
fn two_spherical_blobs_are_recovered() {
    init_logging();
    let centers = [[0.0, 0.0], [10.0, 10.0]];
    let data = blobs(&centers, 50, 11);
    let config = GaussMixConfig::new(2)
        .with_covariance(CovarianceKind::Spherical)
        .with_stages(20)
        .with_seed(3);
    let (model, stats) = train(&data, &config).unwrap();
    assert_eq!(stats.stages, 20);

    let mut hit = [false; 2];
    for comp in model.components() {
        let (k, dist) = nearest_center(comp.mean(), &centers);
        assert!(dist < 0.5, "mean {:?} is {dist} from center {k}", comp.mean());
        hit[k] = true;
        assert_abs_diff_eq!(comp.weight(), 0.5, epsilon = 0.1);
    }
    assert_eq!(hit, [true, true]);
}

#[test]
fn missing_feature_keeps_density_informative() {
    init_logging();
    let centers = [[0.0, 0.0], [10.0, 10.0]];
    let mut data = blobs(&centers, 50, 12);
    // 20% of the first blob loses its second feature.
    for i in (0..50).step_by(5) {
        data[(i, 1)] = f64::NAN;
    }

    for kind in [
        CovarianceKind::Spherical,
        CovarianceKind::Diagonal,
        CovarianceKind::General,
    ] {
        let config = GaussMixConfig::new(2)
            .with_covariance(kind)
            .with_stages(15)
            .with_k_median(2, 50);
        let (model, _) = train(&data, &config).unwrap();

        let held_out_missing = model.log_density(array![0.3, f64::NAN].view()).unwrap();
        let shifted = model.log_density(array![0.3, 10.0].view()).unwrap();
        assert!(
            held_out_missing > shifted,
            "{kind}: {held_out_missing} <= {shifted}"
        );
        assert!(held_out_missing.is_finite());

        for comp in model.components() {
            let (_, dist) = nearest_center(comp.mean(), &centers);
            assert!(dist < 1.0, "{kind}: mean {:?}", comp.mean());
        }
    }
}

#[test]
fn five_pattern_tree_bounds_live_factors() {
    let p = |bits: &[u8]| MissingPattern::new(bits.iter().map(|&b| b == 1).collect());
    let patterns = vec![
        p(&[0, 0, 0, 0]),
        p(&[1, 0, 0, 0]),
        p(&[0, 0, 1, 0]),
        p(&[0, 0, 0, 1]),
        p(&[1, 1, 0, 0]),
    ];
    let traversal = SpanningTraversal::from_patterns(&patterns);
    assert_eq!(traversal.len(), 5);
    let bound = (5f64).log2().ceil() as usize + 1;
    assert!(traversal.max_live_factors() <= bound);
}

#[test]
fn collapsed_component_is_replaced() {
    init_logging();
    let data = blobs(&[[0.0, 0.0], [10.0, 10.0]], 30, 21);
    let config = GaussMixConfig::new(2)
        .with_covariance(CovarianceKind::Diagonal)
        .with_alpha_min(0.05)
        .with_stages(1);

    let heavy = GaussianComponent::new(
        0.99,
        array![5.0, 5.0],
        Covariance::Diagonal {
            sigma: array![6.0, 6.0],
        },
        config.variance_floor,
    )
    .unwrap();
    let far_away = GaussianComponent::new(
        0.01,
        array![500.0, -500.0],
        Covariance::Diagonal {
            sigma: array![1.0, 1.0],
        },
        config.variance_floor,
    )
    .unwrap();
    let model = MixtureModel::new(vec![heavy, far_away], 0).unwrap();

    let mut trainer = GaussMixTrainer::new(&data, config).unwrap();
    trainer.initialize_from(model).unwrap();
    trainer.step().unwrap();

    let events = trainer.replacements();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].replaced, 1);
    assert_eq!(events[0].donor, 0);
    assert!(events[0].donor_weight_before > 0.99);
    assert_eq!(events[0].split_weight, events[0].donor_weight_before / 2.0);

    let model = trainer.model().unwrap();
    assert!(model.components()[1].mean()[0] < 100.0);
    assert_abs_diff_eq!(model.weights().sum(), 1.0, epsilon = 1e-6);
}

#[test]
fn general_eigenvalues_sorted_and_floored() {
    init_logging();
    let mut rng = StdRng::seed_from_u64(5);
    let noise = Normal::new(0.0, 1.0).unwrap();
    // Nearly flat third dimension so the floor has something to clamp.
    let data = Array2::from_shape_fn((80, 3), |(i, j)| match j {
        0 => noise.sample(&mut rng) * 3.0 + if i < 40 { 0.0 } else { 20.0 },
        1 => noise.sample(&mut rng),
        _ => noise.sample(&mut rng) * 1e-4,
    });
    let floor = 0.05;
    let config = GaussMixConfig::new(2)
        .with_covariance(CovarianceKind::General)
        .with_variance_floor(floor)
        .with_n_eigen(2)
        .with_stages(5);
    let (model, _) = train(&data, &config).unwrap();
    for comp in model.components() {
        let Covariance::General {
            eigenvalues,
            eigenvectors,
        } = comp.covariance()
        else {
            panic!("expected a general covariance");
        };
        assert_eq!(eigenvalues.len(), 2);
        assert_eq!(eigenvectors.dim(), (2, 3));
        assert!(eigenvalues.iter().all(|&e| e >= floor));
        assert!(eigenvalues[0] >= eigenvalues[1]);
    }
}

#[test]
fn complete_data_paths_agree() {
    init_logging();
    let data = blobs(&[[0.0, 0.0], [4.0, 1.0], [1.0, 6.0]], 20, 8);
    let config = GaussMixConfig::new(3)
        .with_covariance(CovarianceKind::General)
        .with_stages(5);
    let (model, _) = train(&data, &config).unwrap();
    for comp in model.components() {
        let factor = IndexedFactor::from_scratch(comp.full_covariance().view(), &[0, 1]).unwrap();
        for row in data.rows() {
            let eigen = comp.log_likelihood(row).unwrap();
            let chol = comp.log_likelihood_with_factor(row, &factor);
            assert_abs_diff_eq!(eigen, chol, epsilon = 1e-6);
        }
    }
}

#[test]
fn seeded_training_is_reproducible() {
    let mut data = blobs(&[[0.0, 0.0], [6.0, 6.0]], 25, 2);
    data[(4, 0)] = f64::NAN;
    data[(30, 1)] = f64::NAN;
    let config = GaussMixConfig::new(2)
        .with_covariance(CovarianceKind::General)
        .with_stages(4)
        .with_seed(99);
    let (a, _) = train(&data, &config).unwrap();
    let (b, _) = train(&data, &config).unwrap();
    assert_eq!(a, b);
}

#[test]
fn conditional_expectation_follows_predictor() {
    let data = blobs(&[[0.0, 0.0], [10.0, 10.0]], 40, 31);
    let config = GaussMixConfig::new(2)
        .with_covariance(CovarianceKind::General)
        .with_predictor_size(1)
        .with_stages(10);
    let (mut model, _) = train(&data, &config).unwrap();

    model.set_predictor(array![10.0].view()).unwrap();
    let y = model.expectation().unwrap();
    assert_eq!(y.len(), 1);
    assert_abs_diff_eq!(y[0], 10.0, epsilon = 1.0);
    assert!(model.variance().unwrap()[(0, 0)] > 0.0);

    model.set_predictor(array![0.0].view()).unwrap();
    assert_abs_diff_eq!(model.expectation().unwrap()[0], 0.0, epsilon = 1.0);

    assert!(model.set_predictor(array![0.0, 1.0].view()).is_err());
}

#[test]
fn imputed_training_tracks_blob_means() {
    init_logging();
    let centers = [[0.0, 0.0], [10.0, 10.0]];
    let mut data = blobs(&centers, 40, 17);
    for i in (0..80).step_by(6) {
        data[(i, i % 2)] = f64::NAN;
    }
    let config = GaussMixConfig::new(2)
        .with_covariance(CovarianceKind::General)
        .with_impute_missing(true)
        .with_stages(10);
    let (model, _) = train(&data, &config).unwrap();
    for comp in model.components() {
        let (_, dist) = nearest_center(comp.mean(), &centers);
        assert!(dist < 0.75, "mean {:?}", comp.mean());
    }
}
