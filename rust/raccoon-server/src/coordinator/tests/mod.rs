//! Coordinator tests.

mod concurrency;
pub mod utils;
