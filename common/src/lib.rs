//! Provides functions common to the operator and related tooling.
#![deny(missing_docs)]
#[cfg(feature = "telemetry")]
pub mod telemetry;
