//! # huddle-telemetry
//!
//! Process-wide observability setup: the `tracing` subscriber and the
//! Prometheus metrics recorder, plus the metric names shared across crates.

#![deny(unsafe_code)]

mod logging;
pub mod metrics;

pub use logging::{build_filter, init_logging};
pub use metrics::{install_recorder, render};
