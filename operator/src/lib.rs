//! Provides API for the operator and related tooling.
#![warn(missing_docs)]

/// Cluster module for managing search cluster resources.
pub mod cluster;
/// Labels module for managing resource labels.
pub(crate) mod labels;
/// Utils module for shared utility functions.
pub mod utils;

/// A list of constants used in various K8s resources
const CONTROLLER_NAME: &str = "quarry";
