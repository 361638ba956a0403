//! Tracing and metrics initialization shared by the ingestion binaries and tests.

pub mod metrics;
pub mod tracing;
