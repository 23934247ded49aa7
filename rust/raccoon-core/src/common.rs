use chrono::{DateTime, Utc};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into, Serialize, Deserialize,
)]
#[serde(transparent)]
/// The identifier of a client within a group.
pub struct ClientId(u64);

impl ClientId {
    /// Creates a client identifier.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The evaluation a client reports after a local training pass.
///
/// The global figures are the evaluation of the global weights the client started from, when
/// the client measured them.
pub struct MetricRecord {
    pub client_id: ClientId,
    pub timestamp: DateTime<Utc>,
    pub local_accuracy: f64,
    pub local_loss: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_loss: Option<f64>,
}

impl MetricRecord {
    /// Creates a record of the local figures, timestamped now.
    pub fn new(client_id: ClientId, local_accuracy: f64, local_loss: f64) -> Self {
        Self {
            client_id,
            timestamp: Utc::now(),
            local_accuracy,
            local_loss,
            global_accuracy: None,
            global_loss: None,
        }
    }

    /// Adds the evaluation of the global weights.
    pub fn with_global(mut self, global_accuracy: f64, global_loss: f64) -> Self {
        self.global_accuracy = Some(global_accuracy);
        self.global_loss = Some(global_loss);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// The latest evaluation of a group's global weights.
pub struct GlobalMetric {
    pub accuracy: f64,
    pub loss: f64,
    pub timestamp: DateTime<Utc>,
}

impl GlobalMetric {
    /// Creates a global metric, timestamped now.
    pub fn new(accuracy: f64, loss: f64) -> Self {
        Self {
            accuracy,
            loss,
            timestamp: Utc::now(),
        }
    }
}
