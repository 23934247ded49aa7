use ndarray::{ArrayD, IxDyn};
use tracing_subscriber::*;

use raccoon_core::{Delta, Tensor, WeightSet};

use crate::{
    coordinator::{AggregationCoordinator, GroupRegistry, GroupState},
    settings::CoordinatorSettings,
};

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

/// The shapes of the weights of every test group: a `[2, 2]` kernel and a `[2]` bias.
pub fn shapes() -> Vec<Vec<usize>> {
    vec![vec![2, 2], vec![2]]
}

/// A weight set of the test shapes with every scalar set to `value`.
pub fn filled(value: f32) -> WeightSet {
    shapes()
        .into_iter()
        .map(|shape| Tensor::from_elem(IxDyn(&shape), value))
        .collect()
}

/// A delta of the test shapes with every scalar set to `value`.
pub fn delta(value: f32) -> Delta {
    filled(value).into()
}

/// A delta of the test shapes whose scalars are `offset, offset + 1, ...` in tensor order.
pub fn ramp(offset: f32) -> Delta {
    let mut next = offset;
    shapes()
        .into_iter()
        .map(|shape| {
            ArrayD::from_shape_simple_fn(IxDyn(&shape), || {
                next += 1.;
                next - 1.
            })
        })
        .collect()
}

/// A coordinator with the groups `a` and `b`, both starting from zero weights.
pub fn coordinator() -> AggregationCoordinator {
    coordinator_with(CoordinatorSettings::default())
}

pub fn coordinator_with(settings: CoordinatorSettings) -> AggregationCoordinator {
    let mut registry = GroupRegistry::new();
    registry
        .insert(GroupState::with_weights("a", filled(0.)))
        .unwrap();
    registry
        .insert(GroupState::with_weights("b", filled(0.)))
        .unwrap();
    AggregationCoordinator::new(registry, settings)
}

/// Checks that two weight sets are equal up to a relative tolerance.
pub fn assert_close(actual: &WeightSet, expected: &WeightSet) {
    assert_eq!(actual.shapes(), expected.shapes());
    for (a, e) in actual.iter().zip(expected.iter()) {
        for (a, e) in a.iter().zip(e.iter()) {
            assert!(
                (a - e).abs() <= 1e-5 * e.abs().max(1.),
                "{} is not close to {}",
                a,
                e
            );
        }
    }
}
