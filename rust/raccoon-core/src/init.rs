//! Model initialization.
//!
//! The coordinator treats the model as an opaque weight set. The only thing it needs from the
//! model is an initial weight set per group, built once at startup by a [`ModelInitializer`].

use rand::{distributions::Uniform, Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::weights::{Tensor, WeightSet};

/// The default hidden layer widths of [`DenseInitializer`].
pub const DEFAULT_HIDDEN_LAYERS: [usize; 2] = [64, 32];

/// Builds the initial weights of a model.
pub trait ModelInitializer {
    /// Creates the initial weights of a model mapping `input_dim` features to `output_dim`
    /// classes.
    fn init_weights(&self, input_dim: usize, output_dim: usize) -> WeightSet;
}

impl<F> ModelInitializer for F
where
    F: Fn(usize, usize) -> WeightSet,
{
    fn init_weights(&self, input_dim: usize, output_dim: usize) -> WeightSet {
        self(input_dim, output_dim)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Initializes a fully connected classifier.
///
/// For every layer the weight set holds a kernel tensor of shape `[fan_in, fan_out]` drawn from
/// a Glorot uniform distribution, followed by a zero bias tensor of shape `[fan_out]`. The last
/// layer maps onto `output_dim` logits.
pub struct DenseInitializer {
    hidden: Vec<usize>,
    seed: Option<u64>,
}

impl Default for DenseInitializer {
    fn default() -> Self {
        Self::new(DEFAULT_HIDDEN_LAYERS.to_vec(), None)
    }
}

impl DenseInitializer {
    /// Creates an initializer for the given hidden layer widths.
    ///
    /// Without a seed, every call draws fresh kernels from system entropy.
    pub fn new(hidden: Vec<usize>, seed: Option<u64>) -> Self {
        Self { hidden, seed }
    }

    /// Gets the hidden layer widths.
    pub fn hidden(&self) -> &[usize] {
        &self.hidden
    }

    fn rng(&self) -> ChaCha20Rng {
        match self.seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        }
    }
}

impl ModelInitializer for DenseInitializer {
    fn init_weights(&self, input_dim: usize, output_dim: usize) -> WeightSet {
        let mut rng = self.rng();
        let mut widths = Vec::with_capacity(self.hidden.len() + 2);
        widths.push(input_dim);
        widths.extend_from_slice(&self.hidden);
        widths.push(output_dim);

        widths
            .windows(2)
            .flat_map(|layer| {
                let (fan_in, fan_out) = (layer[0], layer[1]);
                let kernel = glorot_uniform(fan_in, fan_out, &mut rng);
                let bias = Tensor::zeros(vec![fan_out]);
                vec![kernel, bias]
            })
            .collect()
    }
}

fn glorot_uniform<R: Rng>(fan_in: usize, fan_out: usize, rng: &mut R) -> Tensor {
    let limit = (6. / (fan_in + fan_out).max(1) as f32).sqrt();
    let uniform = Uniform::new_inclusive(-limit, limit);
    Tensor::from_shape_simple_fn(vec![fan_in, fan_out], || rng.sample(&uniform))
}
