#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Raccoon: a federated aggregation coordinator
//!
//! Raccoon trains one shared classifier per *group* of clients. Every client holds a private
//! partition of the group's data and never sends it anywhere. Instead it repeats a simple cycle:
//!
//! 1. fetch the global weights of its group;
//! 2. train locally, starting from those weights;
//! 3. submit the difference between its local and the global weights, perturbed with Gaussian
//!    noise, as a *delta*.
//!
//! The coordinator buffers the deltas of each group and, on request, folds their elementwise mean
//! into the group's global weights. Groups are independent of each other: each has its own model
//! shape, its own pending deltas and its own metrics log.
//!
//! ## Crate layout
//! - [`coordinator`]: the group registry, the per-group round lifecycle and the
//!   [`AggregationCoordinator`](coordinator::AggregationCoordinator) facade;
//! - [`rest`]: the HTTP API served by the `coordinator` binary;
//! - [`settings`]: configuration loading and validation;
//! - [`simulation`]: an in-process driver running the client cycle above against a coordinator.
//!
//! The data types and the aggregation arithmetic live in the `raccoon-core` crate.

#[macro_use]
extern crate tracing;

pub mod coordinator;
pub mod rest;
pub mod settings;
pub mod simulation;
