//! Averaging of client deltas into a global weight set.
//!
//! The aggregated delta is the plain element-wise arithmetic mean of all submitted deltas: every
//! delta weighs the same, regardless of the size of the client's data partition or of the global
//! weights it was computed against.

use rayon::prelude::*;
use thiserror::Error;

use crate::weights::{Delta, ShapeError, Tensor, WeightSet};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Errors related to the aggregation of deltas.
pub enum AggregationError {
    #[error("there is no delta to aggregate")]
    EmptyBuffer,
    #[error("the delta to aggregate is incompatible: {0}")]
    ShapeMismatch(#[from] ShapeError),
}

#[derive(Debug, Default, Clone, Copy)]
/// Folds a batch of same-shaped deltas into a base weight set.
///
/// Tensor positions are averaged in parallel. Within a position the deltas are summed in the
/// order of the input slice, hence the result is deterministic for a fixed input order and
/// invariant, up to floating point rounding, under any permutation of the input.
pub struct DeltaAggregator;

impl DeltaAggregator {
    /// Creates a delta aggregator.
    pub fn new() -> Self {
        Self
    }

    /// Computes the element-wise mean of the deltas.
    ///
    /// # Errors
    /// Fails if there are no deltas or if they are not all shaped alike.
    pub fn mean(&self, deltas: &[Delta]) -> Result<Delta, AggregationError> {
        let (first, rest) = deltas
            .split_first()
            .ok_or(AggregationError::EmptyBuffer)?;
        for delta in rest {
            first.check_compatible(delta)?;
        }

        let count = deltas.len() as f32;
        let zeros = first.zeros_like();
        let mean = zeros
            .tensors()
            .par_iter()
            .enumerate()
            .map(|(position, zero)| {
                let mut sum = zero.clone();
                for delta in deltas {
                    sum += &delta.tensors()[position];
                }
                sum / count
            })
            .collect::<Vec<Tensor>>();
        Ok(Delta::from(mean))
    }

    /// Averages the deltas and applies the mean to `base`, yielding the new weights.
    ///
    /// # Errors
    /// Fails if there are no deltas or if any delta is not shaped like `base`.
    pub fn aggregate(
        &self,
        base: &WeightSet,
        deltas: &[Delta],
    ) -> Result<WeightSet, AggregationError> {
        if deltas.is_empty() {
            return Err(AggregationError::EmptyBuffer);
        }
        for delta in deltas {
            base.check_compatible(delta)?;
        }
        let mean = self.mean(deltas)?;
        Ok(base.apply(&mean)?)
    }
}
