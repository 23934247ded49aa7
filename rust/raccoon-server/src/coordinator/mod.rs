//! The aggregation coordinator.
//!
//! The [`AggregationCoordinator`] is the entry point of every client operation. It resolves the
//! group a request is addressed to in the [`GroupRegistry`] and drives the group's round
//! lifecycle, see the [`group`] module.
//!
//! Operations on different groups never contend with each other. Within a group, reads of the
//! global weights are wait-free, submissions and resets are short critical sections, and an
//! aggregation holds the group exclusively only while it drains the buffer and while it installs
//! the result. The aggregation itself runs outside of any lock, with submissions rejected as
//! [`CoordinatorError::RoundBusy`] in the meantime.

pub mod group;
pub mod registry;

#[cfg(test)]
mod tests;

use std::{collections::BTreeSet, sync::Arc};

use serde::Serialize;
use thiserror::Error;

use raccoon_core::{
    AggregationError,
    ClientId,
    Delta,
    DeltaAggregator,
    GlobalMetric,
    MetricRecord,
    ShapeError,
    WeightSet,
};

pub use self::{
    group::{AggregationGuard, GroupState, Phase},
    registry::{GroupRegistry, RegistryError},
};
use crate::settings::CoordinatorSettings;

#[derive(Debug, Error)]
/// Errors of the coordinator operations.
pub enum CoordinatorError {
    #[error("unknown group {0}")]
    UnknownGroup(String),
    #[error("delta does not match the global weights: {0}")]
    ShapeMismatch(#[from] ShapeError),
    #[error("no pending deltas to aggregate")]
    EmptyBuffer,
    #[error("an aggregation is in progress")]
    RoundBusy,
    #[error("group {0} has no global weights")]
    Uninitialized(String),
    #[error("delta contains NaN or infinite values")]
    InvalidNumeric,
}

impl CoordinatorError {
    /// Checks whether the same request may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RoundBusy)
    }
}

impl From<AggregationError> for CoordinatorError {
    fn from(error: AggregationError) -> Self {
        match error {
            AggregationError::EmptyBuffer => Self::EmptyBuffer,
            AggregationError::ShapeMismatch(error) => Self::ShapeMismatch(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// The outcome of a successful aggregation.
pub struct AggregationSummary {
    pub group: String,
    /// The number of committed aggregations of the group, including this one.
    pub round: u64,
    /// The number of deltas folded into the global weights.
    pub deltas: usize,
}

#[derive(Debug)]
/// Coordinates delta submissions and aggregations across all groups.
pub struct AggregationCoordinator {
    registry: GroupRegistry,
    aggregator: DeltaAggregator,
    settings: CoordinatorSettings,
}

impl AggregationCoordinator {
    /// Creates a coordinator for the groups in `registry`.
    pub fn new(registry: GroupRegistry, settings: CoordinatorSettings) -> Self {
        Self {
            registry,
            aggregator: DeltaAggregator::new(),
            settings,
        }
    }

    /// Gets the names of all groups, in ascending order.
    pub fn group_names(&self) -> BTreeSet<String> {
        self.registry.all_names()
    }

    /// Gets a group by name.
    pub fn group(&self, name: &str) -> Result<&GroupState, CoordinatorError> {
        self.registry.get(name)
    }

    /// Gets a snapshot of the global weights of a group.
    ///
    /// The snapshot is never affected by later aggregations.
    pub fn get_weights(&self, group: &str) -> Result<Arc<WeightSet>, CoordinatorError> {
        self.registry.get(group)?.weights()
    }

    /// Adds an anonymous delta to the pending buffer of a group.
    pub fn submit_delta(&self, group: &str, delta: Delta) -> Result<(), CoordinatorError> {
        self.submit(group, None, delta)
    }

    /// Adds a delta to the pending buffer of a group and registers the submitting client.
    pub fn submit_delta_from(
        &self,
        group: &str,
        client_id: ClientId,
        delta: Delta,
    ) -> Result<(), CoordinatorError> {
        self.submit(group, Some(client_id), delta)
    }

    fn submit(
        &self,
        name: &str,
        client_id: Option<ClientId>,
        delta: Delta,
    ) -> Result<(), CoordinatorError> {
        let group = self.registry.get(name)?;
        match group.submit(client_id, delta, self.settings.reject_non_finite) {
            Ok(pending) => {
                debug!("group {}: accepted delta, {} pending", name, pending);
                Ok(())
            }
            Err(error) => {
                warn!(
                    "group {}: rejected delta in phase {}: {}",
                    name,
                    group.phase(),
                    error
                );
                Err(error)
            }
        }
    }

    /// Folds the pending deltas of a group into its global weights.
    ///
    /// The new global weights are the current ones plus the elementwise mean of the drained
    /// deltas. On failure, the global weights are left unchanged and no delta is lost.
    ///
    /// # Errors
    /// Fails with [`CoordinatorError::RoundBusy`] if another aggregation of the same group is in
    /// flight and with [`CoordinatorError::EmptyBuffer`] if there is nothing to aggregate.
    pub fn run_aggregation(&self, name: &str) -> Result<AggregationSummary, CoordinatorError> {
        let group = self.registry.get(name)?;
        let guard = group.begin_aggregation()?;
        let deltas = guard.deltas().len();
        info!("group {}: aggregating {} deltas", name, deltas);

        let weights = self
            .aggregator
            .aggregate(guard.base(), guard.deltas())
            .map_err(|error| {
                warn!("group {}: aggregation failed: {}", name, error);
                CoordinatorError::from(error)
            })?;
        let round = guard.commit(weights)?;
        info!("group {}: completed round {}", name, round);

        Ok(AggregationSummary {
            group: name.to_string(),
            round,
            deltas,
        })
    }

    /// Appends a record to the metrics log of a group.
    pub fn log_metric(&self, group: &str, record: MetricRecord) -> Result<(), CoordinatorError> {
        self.registry.get(group)?.log_metric(record);
        Ok(())
    }

    /// Gets the metrics log of a group in insertion order.
    pub fn list_metrics(&self, group: &str) -> Result<Vec<MetricRecord>, CoordinatorError> {
        Ok(self.registry.get(group)?.metrics())
    }

    /// Discards the pending deltas of a group and returns how many were discarded.
    ///
    /// The global weights, the metrics and the known clients are kept.
    pub fn reset(&self, name: &str) -> Result<usize, CoordinatorError> {
        let discarded = self.registry.get(name)?.reset()?;
        info!("group {}: discarded {} pending deltas", name, discarded);
        Ok(discarded)
    }

    pub fn register_client(&self, group: &str, client_id: ClientId) -> Result<(), CoordinatorError> {
        self.registry.get(group)?.register_client(client_id);
        Ok(())
    }

    pub fn known_clients(&self, group: &str) -> Result<Vec<ClientId>, CoordinatorError> {
        Ok(self.registry.get(group)?.known_clients())
    }

    pub fn pending_count(&self, group: &str) -> Result<usize, CoordinatorError> {
        Ok(self.registry.get(group)?.pending_count())
    }

    pub fn phase(&self, group: &str) -> Result<Phase, CoordinatorError> {
        Ok(self.registry.get(group)?.phase())
    }

    pub fn round(&self, group: &str) -> Result<u64, CoordinatorError> {
        Ok(self.registry.get(group)?.round())
    }

    /// Records the latest evaluation of the global weights of a group.
    pub fn set_global_metric(
        &self,
        group: &str,
        metric: GlobalMetric,
    ) -> Result<(), CoordinatorError> {
        self.registry.get(group)?.set_global_metric(metric);
        Ok(())
    }

    pub fn global_metric(&self, group: &str) -> Result<Option<GlobalMetric>, CoordinatorError> {
        Ok(self.registry.get(group)?.global_metric())
    }
}
