use pref_gp::{
    GpSettings, InputType, ModelError, PredictOptions, PreferenceGp,
};

fn c1(x: f64) -> Vec<f64> {
    vec![x]
}

fn default_model() -> PreferenceGp {
    PreferenceGp::new(1, GpSettings::default())
}

#[test]
fn fit_learns_a_clear_preference() {
    let mut model = default_model();
    let summary = model
        .fit(
            &[c1(0.0)],
            &[c1(2.0)],
            &[1.0],
            None,
            InputType::Binary,
            None,
        )
        .unwrap();
    assert!(summary.iterations > 0);
    assert!(summary.log_likelihood.is_finite());
    assert!(model.is_fitted());

    let pred = model
        .predict_pairs(&[c1(0.0)], &[c1(2.0)], None, &PredictOptions::default())
        .unwrap();
    assert_eq!(pred.prob.len(), 1);
    assert!(pred.prob[0] > 0.5, "prob = {}", pred.prob[0]);
    assert!((pred.prob[0] + pred.not_prob[0] - 1.0).abs() < 1e-9);

    let var = pred.var.expect("variance requested by default");
    assert!(var[0] > 0.0);

    // The reversed query pair is the complement.
    let rev = model
        .predict_pairs(&[c1(2.0)], &[c1(0.0)], None, &PredictOptions::default())
        .unwrap();
    assert!((rev.prob[0] - pred.not_prob[0]).abs() < 1e-9);
}

#[test]
fn zero_centered_labels_match_rescaled_binary() {
    let x0 = [c1(0.0), c1(1.0), c1(0.0)];
    let x1 = [c1(1.0), c1(2.0), c1(2.0)];

    let mut binary = default_model();
    binary
        .fit(&x0, &x1, &[1.0, 0.5, 0.0], None, InputType::Binary, None)
        .unwrap();

    let mut centered = default_model();
    centered
        .fit(&x0, &x1, &[1.0, 0.0, -1.0], None, InputType::ZeroCentered, None)
        .unwrap();

    let opts = PredictOptions {
        with_variance: false,
        ..PredictOptions::default()
    };
    let p_bin = binary.predict_pairs(&[], &[], None, &opts).unwrap();
    let p_cen = centered.predict_pairs(&[], &[], None, &opts).unwrap();
    assert_eq!(p_bin.prob.len(), p_cen.prob.len());
    for (a, b) in p_bin.prob.iter().zip(p_cen.prob.iter()) {
        assert!((a - b).abs() < 1e-12);
    }
}

#[test]
fn labels_outside_the_declared_range_are_rejected() {
    let mut model = default_model();

    let err = model
        .fit(&[c1(0.0)], &[c1(1.0)], &[1.5], None, InputType::Binary, None)
        .unwrap_err();
    assert!(matches!(err, ModelError::LabelOutOfRange { .. }));

    let err = model
        .fit(
            &[c1(0.0)],
            &[c1(1.0)],
            &[-2.0],
            None,
            InputType::ZeroCentered,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, ModelError::LabelOutOfRange { .. }));

    let err = model
        .fit(
            &[c1(0.0)],
            &[c1(1.0)],
            &[f64::NAN],
            None,
            InputType::Binary,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, ModelError::LabelOutOfRange { .. }));

    // A binary label of -1 is only valid under the zero-centered convention.
    let err = model
        .fit(&[c1(0.0)], &[c1(1.0)], &[-1.0], None, InputType::Binary, None)
        .unwrap_err();
    assert!(matches!(err, ModelError::LabelOutOfRange { .. }));

    // Nothing above may have left partial state behind.
    assert!(!model.is_fitted());
}

#[test]
fn nonpositive_totals_are_rejected() {
    let mut model = default_model();
    let err = model
        .fit(
            &[c1(0.0)],
            &[c1(1.0)],
            &[1.0],
            Some(&[0.0]),
            InputType::Binary,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, ModelError::InvalidTotal { .. }));
}

#[test]
fn empty_observations_fail_the_fit() {
    let mut model = default_model();
    let err = model
        .fit(&[], &[], &[], None, InputType::Binary, None)
        .unwrap_err();
    assert!(matches!(err, ModelError::EmptyObservations));
}

#[test]
fn prediction_before_fit_fails() {
    let model = default_model();
    let err = model
        .predict_pairs(&[c1(0.0)], &[c1(1.0)], None, &PredictOptions::default())
        .unwrap_err();
    assert!(matches!(err, ModelError::NotFitted));

    let err = model
        .predict_latent(&[c1(0.0)], None, &PredictOptions::default())
        .unwrap_err();
    assert!(matches!(err, ModelError::NotFitted));
}

#[test]
fn wrong_feature_count_is_rejected() {
    let mut model = PreferenceGp::new(2, GpSettings::default());
    let err = model
        .fit(&[c1(0.0)], &[c1(1.0)], &[1.0], None, InputType::Binary, None)
        .unwrap_err();
    assert!(matches!(err, ModelError::DimensionMismatch { .. }));
}

#[test]
fn mismatched_input_lengths_are_rejected() {
    let mut model = default_model();
    let err = model
        .fit(
            &[c1(0.0), c1(1.0)],
            &[c1(1.0)],
            &[1.0, 1.0],
            None,
            InputType::Binary,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, ModelError::LengthMismatch { .. }));
}

#[test]
fn empty_query_returns_the_training_posterior() {
    let mut model = default_model();
    model
        .fit(
            &[c1(0.0), c1(1.0)],
            &[c1(1.0), c1(2.0)],
            &[1.0, 1.0],
            None,
            InputType::Binary,
            None,
        )
        .unwrap();

    let n_locs = model.training_locations().unwrap().len();
    assert_eq!(n_locs, 3);
    let n_pairs = model.observed_pairs().unwrap().0.len();
    assert_eq!(n_pairs, 2);

    let latent = model
        .predict_latent(&[], None, &PredictOptions::default())
        .unwrap();
    assert_eq!(latent.mean.len(), n_locs);
    assert_eq!(latent.var.len(), n_locs);
    assert!(latent.var.iter().all(|&v| v > 0.0));

    let pairs = model
        .predict_pairs(&[], &[], None, &PredictOptions::default())
        .unwrap();
    assert_eq!(pairs.prob.len(), n_pairs);
    assert!(pairs.var.unwrap().len() == n_pairs);
}

#[test]
fn latent_prediction_agrees_with_stored_posterior_at_training_points() {
    let mut model = default_model();
    model
        .fit(
            &[c1(0.0), c1(1.0)],
            &[c1(1.0), c1(2.0)],
            &[1.0, 1.0],
            Some(&[4.0, 4.0]),
            InputType::Binary,
            None,
        )
        .unwrap();

    let stored = model
        .predict_latent(&[], None, &PredictOptions::default())
        .unwrap();
    let training = model.training_locations().unwrap().to_vec();
    let queried = model
        .predict_latent(&training, None, &PredictOptions::default())
        .unwrap();

    for i in 0..training.len() {
        assert!(
            (stored.mean[i] - queried.mean[i]).abs() < 1e-4,
            "mean mismatch at {i}: {} vs {}",
            stored.mean[i],
            queried.mean[i]
        );
        assert!((stored.var[i] - queried.var[i]).abs() < 1e-4);
    }
}

#[test]
fn block_size_does_not_change_predictions() {
    let mut model = default_model();
    model
        .fit(
            &[c1(0.0), c1(1.0)],
            &[c1(1.0), c1(2.0)],
            &[1.0, 1.0],
            None,
            InputType::Binary,
            None,
        )
        .unwrap();

    let query: Vec<Vec<f64>> = (0..7).map(|i| c1(i as f64 * 0.4)).collect();
    let small = PredictOptions {
        max_block_size: 1,
        ..PredictOptions::default()
    };
    let large = PredictOptions {
        max_block_size: 100,
        ..PredictOptions::default()
    };
    let a = model.predict_latent(&query, None, &small).unwrap();
    let b = model.predict_latent(&query, None, &large).unwrap();
    for i in 0..query.len() {
        assert!((a.mean[i] - b.mean[i]).abs() < 1e-12);
        assert!((a.var[i] - b.var[i]).abs() < 1e-12);
    }
}

#[test]
fn chain_of_preferences_recovers_the_ordering() {
    let mut model = default_model();
    model
        .fit(
            &[c1(0.0), c1(1.0)],
            &[c1(1.0), c1(2.0)],
            &[1.0, 1.0],
            Some(&[5.0, 5.0]),
            InputType::Binary,
            None,
        )
        .unwrap();

    // Training locations come back in canonical (sorted-key) order:
    // 0.0, 1.0, 2.0.
    let latent = model
        .predict_latent(&[], None, &PredictOptions::default())
        .unwrap();
    assert!(latent.mean[0] > latent.mean[1]);
    assert!(latent.mean[1] > latent.mean[2]);
}

#[test]
fn conflicting_observations_cancel_out() {
    let mut model = default_model();
    model
        .fit(
            &[c1(0.0), c1(2.0)],
            &[c1(2.0), c1(0.0)],
            &[1.0, 1.0],
            None,
            InputType::Binary,
            None,
        )
        .unwrap();

    // One win each way merges to z = 0.5 on a single canonical pair.
    assert_eq!(model.observed_pairs().unwrap().0.len(), 1);
    let pred = model
        .predict_pairs(&[c1(0.0)], &[c1(2.0)], None, &PredictOptions::default())
        .unwrap();
    assert!((pred.prob[0] - 0.5).abs() < 0.05, "prob = {}", pred.prob[0]);
}

#[test]
fn expected_log_returns_finite_log_probabilities() {
    let mut model = default_model();
    model
        .fit(&[c1(0.0)], &[c1(2.0)], &[1.0], None, InputType::Binary, None)
        .unwrap();

    let opts = PredictOptions {
        expected_log: true,
        ..PredictOptions::default()
    };
    let pred = model
        .predict_pairs(&[c1(0.0)], &[c1(2.0)], None, &opts)
        .unwrap();
    assert!(pred.prob[0].is_finite());
    assert!(pred.prob[0] < 0.0);
    assert!((pred.prob[0].exp() + pred.not_prob[0].exp() - 1.0).abs() < 1e-9);
}

#[test]
fn pinned_stochastic_fit_is_deterministic_and_directional() {
    let settings = GpSettings {
        use_svi: true,
        max_update_size: 2,
        pinned_sample_idxs: Some(vec![0, 1, 2]),
        ..GpSettings::default()
    };

    let fit_once = || {
        let mut model = PreferenceGp::new(1, settings.clone());
        model
            .fit(
                &[c1(0.0), c1(1.0)],
                &[c1(1.0), c1(2.0)],
                &[1.0, 1.0],
                Some(&[5.0, 5.0]),
                InputType::Binary,
                None,
            )
            .unwrap();
        model
            .predict_latent(&[], None, &PredictOptions::default())
            .unwrap()
    };

    let first = fit_once();
    let second = fit_once();
    assert_eq!(first.mean, second.mean);
    assert!(first.mean[0] > first.mean[2]);
}

#[test]
fn drawn_minibatches_still_learn_the_preference_direction() {
    let settings = GpSettings {
        use_svi: true,
        max_update_size: 2,
        ..GpSettings::default()
    };
    let mut model = PreferenceGp::new(1, settings);
    model
        .fit(
            &[c1(0.0), c1(1.0)],
            &[c1(1.0), c1(2.0)],
            &[1.0, 1.0],
            Some(&[5.0, 5.0]),
            InputType::Binary,
            None,
        )
        .unwrap();

    let latent = model
        .predict_latent(&[], None, &PredictOptions::default())
        .unwrap();
    assert!(latent.mean[0] > latent.mean[2]);
}

#[test]
fn pinned_subset_without_pairs_fails_the_fit() {
    let settings = GpSettings {
        use_svi: true,
        pinned_sample_idxs: Some(vec![0, 3]),
        ..GpSettings::default()
    };
    let mut model = PreferenceGp::new(1, settings);
    let err = model
        .fit(
            &[c1(0.0), c1(2.0)],
            &[c1(1.0), c1(3.0)],
            &[1.0, 1.0],
            None,
            InputType::Binary,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, ModelError::MinibatchExhausted { .. }));
}

#[test]
fn second_coordinate_list_defaults_to_self_pairs() {
    let mut model = default_model();
    model
        .fit(&[c1(0.0)], &[c1(2.0)], &[1.0], None, InputType::Binary, None)
        .unwrap();

    let opts = PredictOptions {
        with_variance: false,
        ..PredictOptions::default()
    };
    let pred = model
        .predict_pairs(&[c1(0.0), c1(2.0)], &[], None, &opts)
        .unwrap();
    assert_eq!(pred.prob.len(), 2);
    for p in &pred.prob {
        assert!((p - 0.5).abs() < 1e-9);
    }
}
