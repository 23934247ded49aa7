//! An in-process driver of the client cycle.
//!
//! A [`Simulation`] plays every client of one group against a shared [`AggregationCoordinator`].
//! A round of the simulation looks like this for each client, in ascending client order:
//!
//! 1. fetch the global weights and evaluate them on the shared validation partition;
//! 2. train locally, starting from the global weights;
//! 3. log the local and global evaluation in the group's metrics;
//! 4. submit the perturbed difference between the local and the global weights.
//!
//! Once all clients have submitted, the round is aggregated and the new global weights are
//! evaluated on the validation partition. Submissions and aggregations rejected because the group
//! is busy are retried after a fixed backoff, up to the configured number of retries.
//!
//! The model itself is hidden behind the [`LocalTrainer`] trait.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use ndarray::{s, Array1, Array2};
use thiserror::Error;
use tokio::time::delay_for;
use tracing_futures::Instrument;

use raccoon_core::{
    ClientId,
    Delta,
    GaussianPerturbation,
    GlobalMetric,
    MetricRecord,
    PerturbationError,
    WeightSet,
};

use crate::{
    coordinator::{AggregationCoordinator, AggregationSummary, CoordinatorError},
    settings::ClientSettings,
};

#[derive(Debug, Clone, PartialEq)]
/// The labelled samples held by a single client.
pub struct Partition {
    features: Array2<f32>,
    labels: Array1<u32>,
}

impl Partition {
    /// Creates a partition of `features.nrows()` samples.
    ///
    /// # Errors
    /// Fails if there isn't exactly one label per row of features.
    pub fn new(features: Array2<f32>, labels: Array1<u32>) -> Result<Self, SimulationError> {
        if features.nrows() != labels.len() {
            return Err(SimulationError::InvalidPartition {
                samples: features.nrows(),
                labels: labels.len(),
            });
        }
        Ok(Self { features, labels })
    }

    pub fn features(&self) -> &Array2<f32> {
        &self.features
    }

    pub fn labels(&self) -> &Array1<u32> {
        &self.labels
    }

    /// Gets the number of samples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Splits the samples into `parts` contiguous partitions keyed by client index.
    ///
    /// The sizes of the partitions differ by at most one sample, the first partitions being the
    /// larger ones.
    pub fn split(&self, parts: usize) -> BTreeMap<usize, Partition> {
        let (size, remainder) = if parts == 0 {
            (0, 0)
        } else {
            (self.len() / parts, self.len() % parts)
        };
        let mut start = 0;
        (0..parts)
            .map(|index| {
                let end = start + size + if index < remainder { 1 } else { 0 };
                let partition = Partition {
                    features: self.features.slice(s![start..end, ..]).to_owned(),
                    labels: self.labels.slice(s![start..end]).to_owned(),
                };
                start = end;
                (index, partition)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// The accuracy and loss of a model on a partition.
pub struct Evaluation {
    pub accuracy: f64,
    pub loss: f64,
}

#[derive(Debug, Clone, PartialEq)]
/// The result of a local training pass.
pub struct LocalOutcome {
    /// The locally trained weights, shaped like the global weights.
    pub weights: WeightSet,
    /// The evaluation of the locally trained weights.
    pub accuracy: f64,
    pub loss: f64,
}

/// Trains and evaluates the model of a group on client partitions.
pub trait LocalTrainer {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Trains a model starting from the `global` weights on a partition.
    fn train(
        &mut self,
        global: &WeightSet,
        partition: &Partition,
    ) -> Result<LocalOutcome, Self::Error>;

    /// Evaluates the `weights` on a partition.
    fn evaluate(
        &mut self,
        weights: &WeightSet,
        partition: &Partition,
    ) -> Result<Evaluation, Self::Error>;
}

#[derive(Debug, Error)]
/// Errors of the simulation.
pub enum SimulationError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error("local trainer failed: {0}")]
    Trainer(#[source] anyhow::Error),
    #[error(transparent)]
    Perturbation(#[from] PerturbationError),
    #[error("group {group} still busy after {retries} retries")]
    RetriesExhausted { group: String, retries: u32 },
    #[error("partition has {samples} samples but {labels} labels")]
    InvalidPartition { samples: usize, labels: usize },
}

impl SimulationError {
    fn trainer<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Trainer(anyhow::Error::new(error))
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The outcome of a simulated round.
pub struct RoundReport {
    pub summary: AggregationSummary,
    /// The evaluation of the new global weights on the validation partition.
    pub global: GlobalMetric,
}

/// Runs the clients of a group against a coordinator.
pub struct Simulation<T> {
    coordinator: Arc<AggregationCoordinator>,
    group: String,
    settings: ClientSettings,
    perturbation: GaussianPerturbation,
    trainer: T,
}

impl<T> Simulation<T>
where
    T: LocalTrainer,
{
    /// Creates a simulation of the clients of `group`.
    ///
    /// # Errors
    /// Fails if the configured noise is invalid.
    pub fn new(
        coordinator: Arc<AggregationCoordinator>,
        group: impl Into<String>,
        settings: ClientSettings,
        trainer: T,
    ) -> Result<Self, SimulationError> {
        let perturbation = GaussianPerturbation::new(settings.noise_std)?;
        Ok(Self {
            coordinator,
            group: group.into(),
            settings,
            perturbation,
            trainer,
        })
    }

    /// Replaces the perturbation, e.g. with a seeded one.
    pub fn with_perturbation(mut self, perturbation: GaussianPerturbation) -> Self {
        self.perturbation = perturbation;
        self
    }

    pub fn trainer(&self) -> &T {
        &self.trainer
    }

    /// Runs `rounds` rounds and returns their reports.
    pub async fn run(
        &mut self,
        rounds: usize,
        partitions: &BTreeMap<usize, Partition>,
        validation: &Partition,
    ) -> Result<Vec<RoundReport>, SimulationError> {
        let mut reports = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            reports.push(self.run_round(partitions, validation).await?);
        }
        Ok(reports)
    }

    /// Runs a single round: every client submits once, then the round is aggregated.
    pub async fn run_round(
        &mut self,
        partitions: &BTreeMap<usize, Partition>,
        validation: &Partition,
    ) -> Result<RoundReport, SimulationError> {
        debug!(
            "group {}: running {} clients with noise std {}",
            self.group,
            partitions.len(),
            self.perturbation.noise_std()
        );
        for (index, partition) in partitions {
            let client_id = ClientId::new(*index as u64);
            let span = info_span!("client", group = %self.group, client_id = %client_id);
            self.run_client(client_id, partition, validation)
                .instrument(span)
                .await?;
        }

        let coordinator = self.coordinator.clone();
        let group = self.group.clone();
        let summary = self
            .with_retries(|| coordinator.run_aggregation(&group))
            .await?;

        let weights = self.coordinator.get_weights(&self.group)?;
        let evaluation = self
            .trainer
            .evaluate(&weights, validation)
            .map_err(SimulationError::trainer)?;
        let global = GlobalMetric::new(evaluation.accuracy, evaluation.loss);
        self.coordinator.set_global_metric(&self.group, global)?;
        info!(
            "group {}: round {} global accuracy {:.4}, loss {:.4}",
            self.group, summary.round, global.accuracy, global.loss
        );

        Ok(RoundReport { summary, global })
    }

    async fn run_client(
        &mut self,
        client_id: ClientId,
        partition: &Partition,
        validation: &Partition,
    ) -> Result<(), SimulationError> {
        let global = self.coordinator.get_weights(&self.group)?;
        let before = self
            .trainer
            .evaluate(&global, validation)
            .map_err(SimulationError::trainer)?;
        let outcome = self
            .trainer
            .train(&global, partition)
            .map_err(SimulationError::trainer)?;
        debug!(
            "local accuracy {:.4}, loss {:.4}",
            outcome.accuracy, outcome.loss
        );

        let record = MetricRecord::new(client_id, outcome.accuracy, outcome.loss)
            .with_global(before.accuracy, before.loss);
        self.coordinator.log_metric(&self.group, record)?;

        let delta = Delta::between(&outcome.weights, &global).map_err(CoordinatorError::from)?;
        let delta = self.perturbation.perturb(delta);
        let coordinator = self.coordinator.clone();
        let group = self.group.clone();
        self.with_retries(|| coordinator.submit_delta_from(&group, client_id, delta.clone()))
            .await
    }

    /// Calls `operation` until it succeeds or fails with an error that is not retryable.
    async fn with_retries<F, R>(&self, mut operation: F) -> Result<R, SimulationError>
    where
        F: FnMut() -> Result<R, CoordinatorError>,
    {
        let mut retries = 0;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && retries < self.settings.max_retries => {
                    retries += 1;
                    debug!(
                        "group {} busy, retry {}/{} in {} ms",
                        self.group, retries, self.settings.max_retries, self.settings.retry_backoff_ms
                    );
                    delay_for(Duration::from_millis(self.settings.retry_backoff_ms)).await;
                }
                Err(err) if err.is_retryable() => {
                    warn!("group {} still busy after {} retries", self.group, retries);
                    return Err(SimulationError::RetriesExhausted {
                        group: self.group.clone(),
                        retries,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
