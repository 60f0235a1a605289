//! Error types for the simulator.
//!
//! Only configuration, lifecycle, integrity and I/O failures are errors.
//! Protocol negatives (no capacity, invalid request, unknown sender) are plain
//! `bool`/empty results and never reach this type.

use thiserror::Error;

use crate::sd_interface::NodeIndex;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Illegal engine transition: expected {expected}, engine is {actual}")]
    IllegalState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invariant violated on node {node}: {detail}")]
    InvariantViolation { node: NodeIndex, detail: String },

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize snapshot: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to build worker pool: {0}")]
    Pool(String),

    #[error("Feeder failure: {0}")]
    Feeder(String),
}

pub type Result<T> = std::result::Result<T, SimError>;
