use raccoon_core::{
    perturb,
    Delta,
    DeltaAggregator,
    DenseInitializer,
    ModelInitializer,
    WeightSet,
};

/// Local weights of a client that moved every scalar of the global weights by `step`.
fn local_weights(global: &WeightSet, step: f32) -> WeightSet {
    global.iter().map(|tensor| tensor + step).collect()
}

#[test]
fn test_unperturbed_round_averages_local_models() {
    let global = DenseInitializer::new(vec![4], Some(5)).init_weights(3, 2);

    let deltas = [0.5, 1.5, -0.5]
        .iter()
        .map(|&step| {
            let delta = Delta::between(&local_weights(&global, step), &global).unwrap();
            perturb(delta, 0.).unwrap()
        })
        .collect::<Vec<_>>();

    let new = DeltaAggregator::new().aggregate(&global, &deltas).unwrap();
    assert_eq!(new.shapes(), global.shapes());

    let expected = local_weights(&global, 0.5);
    for (new, expected) in new.iter().zip(expected.iter()) {
        for (a, b) in new.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
