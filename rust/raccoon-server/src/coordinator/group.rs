//! Per-group state and the round lifecycle.
//!
//! A round is one `Open -> Aggregating -> Open` cycle:
//!
//! - while `Open`, deltas shaped like the global weights are appended to the pending buffer;
//! - [`GroupState::begin_aggregation`] moves to `Aggregating` and drains the buffer in the same
//!   critical section. From then on, submissions, resets and competing aggregations are rejected
//!   as busy;
//! - [`AggregationGuard::commit`] installs the new global weights and reopens the round. If the
//!   guard is dropped without a commit, the drained deltas are put back and the global weights are
//!   left untouched.
//!
//! The global weights are installed once at construction and only ever replaced by a commit of
//! weights shaped like them, so the pending deltas always match the global weights.
//!
//! The global weights are an immutable snapshot behind an [`ArcSwapOption`]: readers never block
//! and see either the weights before or after an aggregation, never a mix of both.

use std::{collections::BTreeSet, mem, sync::Arc};

use arc_swap::ArcSwapOption;
use derive_more::Display;
use parking_lot::{Mutex, RwLock};

use raccoon_core::{ClientId, Delta, GlobalMetric, MetricRecord, WeightSet};

use crate::coordinator::CoordinatorError;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
/// The phase of a group's round.
pub enum Phase {
    /// Accepting reads and delta submissions.
    Open,
    /// Exclusively folding the drained deltas into the global weights.
    Aggregating,
}

/// The mutable part of a round, guarded by the group's mutex.
#[derive(Debug)]
struct Round {
    phase: Phase,
    pending: Vec<Delta>,
    known_clients: BTreeSet<ClientId>,
    /// The number of committed aggregations.
    id: u64,
}

impl Default for Round {
    fn default() -> Self {
        Self {
            phase: Phase::Open,
            pending: Vec::new(),
            known_clients: BTreeSet::new(),
            id: 0,
        }
    }
}

/// The state of a single training group.
#[derive(Debug)]
pub struct GroupState {
    name: String,
    global_weights: ArcSwapOption<WeightSet>,
    round: Mutex<Round>,
    metrics: RwLock<Vec<MetricRecord>>,
    global_metric: RwLock<Option<GlobalMetric>>,
}

impl GroupState {
    /// Creates a group without global weights.
    ///
    /// Such a group rejects every operation on its weights as uninitialized.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            global_weights: ArcSwapOption::from(None),
            round: Mutex::new(Round::default()),
            metrics: RwLock::new(Vec::new()),
            global_metric: RwLock::new(None),
        }
    }

    /// Creates a group with the given initial global weights.
    pub fn with_weights(name: impl Into<String>, weights: WeightSet) -> Self {
        let group = Self::new(name);
        group.initialize(weights);
        group
    }

    fn initialize(&self, weights: WeightSet) {
        let _round = self.round.lock();
        self.global_weights.store(Some(Arc::new(weights)));
    }

    /// Gets the name of the group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets a snapshot of the current global weights.
    ///
    /// # Errors
    /// Fails if the group has not been initialized.
    pub fn weights(&self) -> Result<Arc<WeightSet>, CoordinatorError> {
        self.global_weights
            .load_full()
            .ok_or_else(|| CoordinatorError::Uninitialized(self.name.clone()))
    }

    /// Gets the current phase.
    pub fn phase(&self) -> Phase {
        self.round.lock().phase
    }

    /// Gets the number of committed aggregations.
    pub fn round(&self) -> u64 {
        self.round.lock().id
    }

    /// Gets the number of pending deltas.
    pub fn pending_count(&self) -> usize {
        self.round.lock().pending.len()
    }

    /// Appends a delta to the pending buffer and returns the new buffer length.
    ///
    /// # Errors
    /// Fails if the group is aggregating, is not initialized, if the delta is not shaped like the
    /// global weights or, when `reject_non_finite` is set, if it holds a non-finite scalar. The
    /// buffer is left unchanged on failure.
    pub fn submit(
        &self,
        client_id: Option<ClientId>,
        delta: Delta,
        reject_non_finite: bool,
    ) -> Result<usize, CoordinatorError> {
        if reject_non_finite && !delta.is_finite() {
            return Err(CoordinatorError::InvalidNumeric);
        }

        let mut round = self.round.lock();
        if round.phase == Phase::Aggregating {
            return Err(CoordinatorError::RoundBusy);
        }
        self.weights()?.check_compatible(&delta)?;

        round.pending.push(delta);
        if let Some(client_id) = client_id {
            round.known_clients.insert(client_id);
        }
        Ok(round.pending.len())
    }

    /// Moves the round into the aggregating phase and drains the pending buffer.
    ///
    /// # Errors
    /// Fails if another aggregation is in flight, if the group is not initialized or if there is
    /// nothing to aggregate. The state is left unchanged on failure.
    pub fn begin_aggregation(&self) -> Result<AggregationGuard<'_>, CoordinatorError> {
        let mut round = self.round.lock();
        if round.phase == Phase::Aggregating {
            return Err(CoordinatorError::RoundBusy);
        }
        let base = self.weights()?;
        if round.pending.is_empty() {
            return Err(CoordinatorError::EmptyBuffer);
        }

        round.phase = Phase::Aggregating;
        let deltas = mem::take(&mut round.pending);
        Ok(AggregationGuard {
            group: self,
            base,
            deltas,
            committed: false,
        })
    }

    /// Discards all pending deltas without aggregating them and returns how many were discarded.
    ///
    /// # Errors
    /// Fails if an aggregation is in flight.
    pub fn reset(&self) -> Result<usize, CoordinatorError> {
        let mut round = self.round.lock();
        if round.phase == Phase::Aggregating {
            return Err(CoordinatorError::RoundBusy);
        }
        Ok(mem::take(&mut round.pending).len())
    }

    /// Records a client as a member of this group.
    pub fn register_client(&self, client_id: ClientId) {
        self.round.lock().known_clients.insert(client_id);
    }

    /// Gets the clients known to this group, in ascending order.
    pub fn known_clients(&self) -> Vec<ClientId> {
        self.round.lock().known_clients.iter().copied().collect()
    }

    /// Appends a record to the metrics log and registers its client.
    pub fn log_metric(&self, record: MetricRecord) {
        self.register_client(record.client_id);
        self.metrics.write().push(record);
    }

    /// Gets the metrics log in insertion order.
    pub fn metrics(&self) -> Vec<MetricRecord> {
        self.metrics.read().clone()
    }

    pub fn set_global_metric(&self, metric: GlobalMetric) {
        *self.global_metric.write() = Some(metric);
    }

    pub fn global_metric(&self) -> Option<GlobalMetric> {
        *self.global_metric.read()
    }
}

/// Exclusive access to a group for the duration of an aggregation.
///
/// Holds the drained deltas and the global weights they are folded into. Dropping the guard
/// without committing aborts the aggregation.
#[derive(Debug)]
pub struct AggregationGuard<'a> {
    group: &'a GroupState,
    base: Arc<WeightSet>,
    deltas: Vec<Delta>,
    committed: bool,
}

impl<'a> AggregationGuard<'a> {
    /// Gets the global weights at the beginning of the aggregation.
    pub fn base(&self) -> &WeightSet {
        &self.base
    }

    /// Gets the drained deltas in submission order.
    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }

    /// Installs the new global weights, reopens the round and returns the new round number.
    ///
    /// # Errors
    /// Fails if the new weights are not shaped like the base weights. The aggregation is aborted
    /// then, as if the guard was dropped.
    pub fn commit(mut self, weights: WeightSet) -> Result<u64, CoordinatorError> {
        self.base.check_compatible(&weights)?;
        let mut round = self.group.round.lock();
        self.group.global_weights.store(Some(Arc::new(weights)));
        round.phase = Phase::Open;
        round.id += 1;
        self.committed = true;
        Ok(round.id)
    }
}

impl<'a> Drop for AggregationGuard<'a> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut round = self.group.round.lock();
        let mut restored = mem::take(&mut self.deltas);
        restored.append(&mut round.pending);
        round.pending = restored;
        round.phase = Phase::Open;
    }
}
