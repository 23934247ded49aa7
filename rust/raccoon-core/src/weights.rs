//! Weight sets and deltas.
//!
//! A [`WeightSet`] is the full parameter set of a model, stored as an ordered sequence of
//! tensors. Its shape signature is fixed once a group is created, and every value that crosses
//! a boundary of the coordinator is checked against it.
//!
//! Weight sets are never mutated in place: the operations in this module always build a new
//! value, so a reader holding the "current" weights can never observe a partial update.

use std::{iter::FromIterator, slice::Iter};

use derive_more::{AsRef, Deref, From, Into};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single parameter tensor.
pub type Tensor = ArrayD<f32>;

/// The axis lengths of a tensor.
pub type Shape = Vec<usize>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Errors related to weight sets of incompatible shapes.
pub enum ShapeError {
    #[error("expected {expected} tensors, got {actual}")]
    TensorCount { expected: usize, actual: usize },
    #[error("tensor {index} has shape {actual:?}, expected {expected:?}")]
    TensorShape {
        index: usize,
        expected: Shape,
        actual: Shape,
    },
}

#[derive(Debug, Clone, PartialEq, Default, From, Into, Serialize, Deserialize)]
/// The full parameter set of a model.
pub struct WeightSet(Vec<Tensor>);

impl AsRef<WeightSet> for WeightSet {
    fn as_ref(&self) -> &WeightSet {
        self
    }
}

impl WeightSet {
    /// Creates a weight set from an ordered sequence of tensors.
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self(tensors)
    }

    /// Gets the number of tensors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks whether this weight set holds no tensor at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Creates an iterator that yields references to the tensors.
    pub fn iter(&self) -> Iter<Tensor> {
        self.0.iter()
    }

    /// Gets the tensors as a slice.
    pub fn tensors(&self) -> &[Tensor] {
        &self.0
    }

    /// Gets the total number of scalars across all tensors.
    pub fn scalar_count(&self) -> usize {
        self.0.iter().map(|tensor| tensor.len()).sum()
    }

    /// Gets the shape signature, one shape per tensor.
    pub fn shapes(&self) -> Vec<Shape> {
        self.0.iter().map(|tensor| tensor.shape().to_vec()).collect()
    }

    /// Checks that `other` has the same tensor count and per-tensor shapes as `self`.
    ///
    /// # Errors
    /// Fails on the tensor count first, then on the first tensor whose shape differs.
    pub fn check_compatible(&self, other: &WeightSet) -> Result<(), ShapeError> {
        if self.len() != other.len() {
            return Err(ShapeError::TensorCount {
                expected: self.len(),
                actual: other.len(),
            });
        }
        for (index, (expected, actual)) in self.iter().zip(other.iter()).enumerate() {
            if expected.shape() != actual.shape() {
                return Err(ShapeError::TensorShape {
                    index,
                    expected: expected.shape().to_vec(),
                    actual: actual.shape().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Creates a weight set of the same shape filled with zeros.
    pub fn zeros_like(&self) -> Self {
        self.iter()
            .map(|tensor| Tensor::zeros(tensor.raw_dim()))
            .collect()
    }

    /// Checks whether every scalar is finite (neither NaN nor infinite).
    pub fn is_finite(&self) -> bool {
        self.iter()
            .all(|tensor| tensor.iter().all(|scalar| scalar.is_finite()))
    }

    /// Applies a delta, yielding `self + delta` as a new weight set.
    ///
    /// # Errors
    /// Fails if the delta is not shaped like `self`.
    pub fn apply(&self, delta: &Delta) -> Result<WeightSet, ShapeError> {
        self.check_compatible(delta)?;
        Ok(self
            .iter()
            .zip(delta.iter())
            .map(|(weights, update)| weights + update)
            .collect())
    }
}

impl FromIterator<Tensor> for WeightSet {
    fn from_iter<I: IntoIterator<Item = Tensor>>(iter: I) -> Self {
        WeightSet(iter.into_iter().collect())
    }
}

impl IntoIterator for WeightSet {
    type Item = Tensor;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a WeightSet {
    type Item = &'a Tensor;
    type IntoIter = Iter<'a, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Debug, Clone, PartialEq, From, Into, Deref, AsRef, Serialize, Deserialize)]
/// A client's proposed change to the global weights: `local - global`, possibly perturbed.
pub struct Delta(WeightSet);

impl Delta {
    /// Computes the delta `local - global`.
    ///
    /// # Errors
    /// Fails if `local` is not shaped like `global`.
    pub fn between(local: &WeightSet, global: &WeightSet) -> Result<Delta, ShapeError> {
        global.check_compatible(local)?;
        Ok(Delta(
            local
                .iter()
                .zip(global.iter())
                .map(|(local, global)| local - global)
                .collect(),
        ))
    }

    /// Consumes the delta and returns its tensors as a weight set.
    pub fn into_inner(self) -> WeightSet {
        self.0
    }
}

impl From<Vec<Tensor>> for Delta {
    fn from(tensors: Vec<Tensor>) -> Self {
        Delta(WeightSet(tensors))
    }
}

impl FromIterator<Tensor> for Delta {
    fn from_iter<I: IntoIterator<Item = Tensor>>(iter: I) -> Self {
        Delta(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn two_layers() -> WeightSet {
        WeightSet::new(vec![
            array![[0.0, 1.0], [2.0, 3.0]].into_dyn(),
            array![0.5, -0.5].into_dyn(),
        ])
    }

    #[test]
    fn test_shapes() {
        let weights = two_layers();
        assert_eq!(weights.len(), 2);
        assert_eq!(weights.scalar_count(), 6);
        assert_eq!(weights.shapes(), vec![vec![2, 2], vec![2]]);
    }

    #[test]
    fn test_check_compatible_tensor_count() {
        let weights = two_layers();
        let fewer = WeightSet::new(vec![array![[0.0, 1.0], [2.0, 3.0]].into_dyn()]);
        assert_eq!(
            weights.check_compatible(&fewer).unwrap_err(),
            ShapeError::TensorCount {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_check_compatible_tensor_shape() {
        let weights = WeightSet::new(vec![array![[0.0, 0.0]].into_dyn()]);
        let wider = WeightSet::new(vec![array![[1.0, 1.0, 1.0]].into_dyn()]);
        assert_eq!(
            weights.check_compatible(&wider).unwrap_err(),
            ShapeError::TensorShape {
                index: 0,
                expected: vec![1, 2],
                actual: vec![1, 3],
            }
        );
        assert!(weights.check_compatible(&weights.zeros_like()).is_ok());
    }

    #[test]
    fn test_delta_between_and_apply() {
        let global = two_layers();
        let local = WeightSet::new(vec![
            array![[1.0, 1.0], [2.0, 5.0]].into_dyn(),
            array![0.0, 0.0].into_dyn(),
        ]);

        let delta = Delta::between(&local, &global).unwrap();
        assert_eq!(
            delta.clone().into_inner(),
            WeightSet::new(vec![
                array![[1.0, 0.0], [0.0, 2.0]].into_dyn(),
                array![-0.5, 0.5].into_dyn(),
            ])
        );
        assert_eq!(global.apply(&delta).unwrap(), local);
    }

    #[test]
    fn test_delta_between_rejects_mismatch() {
        let global = two_layers();
        let local = WeightSet::new(vec![array![1.0].into_dyn()]);
        assert!(Delta::between(&local, &global).is_err());
    }

    #[test]
    fn test_is_finite() {
        assert!(two_layers().is_finite());
        let nan = WeightSet::new(vec![array![0.0, f32::NAN].into_dyn()]);
        let inf = WeightSet::new(vec![array![f32::INFINITY].into_dyn()]);
        assert!(!nan.is_finite());
        assert!(!inf.is_finite());
    }

    #[test]
    fn test_bincode_keeps_shapes() {
        let weights = two_layers();
        let bytes = bincode::serialize(&weights).unwrap();
        let decoded: WeightSet = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.shapes(), weights.shapes());
        assert_eq!(decoded, weights);
    }
}
