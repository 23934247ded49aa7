#![cfg_attr(docsrs, feature(doc_cfg))]
//! Core building blocks of the Raccoon federated learning coordinator.
//!
//! Clients train a shared model on private partitions of data and only ever exchange weight
//! deltas with the coordinator. This crate holds everything about those exchanges that does not
//! depend on shared state:
//!
//! - [`WeightSet`] and [`Delta`]: ordered sequences of fixed-shape tensors;
//! - [`DeltaAggregator`]: the mean of a batch of deltas, applied to the global weights;
//! - [`perturbation`]: the Gaussian noise a client adds to its delta before submitting it;
//! - [`ModelInitializer`]: the contract for building the initial weights of a group;
//! - [`MetricRecord`]: the evaluation figures clients report.
//!
//! The stateful coordinator lives in the `raccoon-server` crate.

pub mod aggregation;
pub mod common;
pub mod init;
pub mod perturbation;
pub mod weights;

pub use self::{
    aggregation::{AggregationError, DeltaAggregator},
    common::{ClientId, GlobalMetric, MetricRecord},
    init::{DenseInitializer, ModelInitializer},
    perturbation::{perturb, perturb_with, GaussianPerturbation, PerturbationError},
    weights::{Delta, Shape, ShapeError, Tensor, WeightSet},
};
