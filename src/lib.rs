//! # sd_sim - Resource Discovery Simulator
//!
//! A discrete-event simulator for resource discovery in a cluster of nodes. A
//! mocked Chord ring gives every node a finger table; on top of it a
//! master-peer ("swarm") discovery backend lets any node find peers with enough
//! free capacity for a workload, reserve it, and release it later.
//!
//! ## Core Components
//!
//! - **RingOverlay**: sorted ring, finger tables, one-hop lookup and routing
//! - **SwarmDiscovery**: per-node backend; the master aggregates peer offers
//! - **Feeder**: produces the run/stop tasks of each tick
//! - **Engine**: tick loop over a bounded worker pool with phase barriers
//! - **MetricsSink**: where request and node statistics are reported
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use sd_sim::{Engine, MetricsCollector, SimulationConfig};
//!
//! let config = SimulationConfig::from_yaml_str("ticks: 20\nnum_nodes: 32\n").unwrap();
//! let metrics = Arc::new(MetricsCollector::new(None));
//!
//! let mut engine = Engine::new(config, metrics.clone()).unwrap();
//! engine.initialize().unwrap();
//! let report = engine.start().unwrap();
//!
//! println!("{} of {} requests placed", report.requests_succeeded, metrics.totals().requests_created);
//! ```
//!
//! ## Scenarios
//!
//! The `scenario_runner` binary in `simulator/` loads YAML scenario files and
//! prints a summary per run.

// Model
pub mod sd_error;
pub mod sd_interface;
pub mod sd_resources;

// Protocol
pub mod sd_discovery;
pub mod sd_overlay;

// Workload and reporting
pub mod sd_feeder;
pub mod sd_generator;
pub mod sd_metrics;

// Execution
pub mod sd_config;
pub mod sd_engine;
pub mod sd_pool;

// Re-export commonly used types
pub use sd_config::{PeriodicConfig, Placement, SimulationConfig};
pub use sd_discovery::{ClusterNodeView, Offer, RemoteClient, Role, SwarmDiscovery};
pub use sd_engine::{Engine, EngineState, RunReport};
pub use sd_error::{Result, SimError};
pub use sd_feeder::{Feeder, FeederConfig, RequestTask, TaskKind};
pub use sd_generator::{GeneratorConfig, ResourceGenerator};
pub use sd_interface::{Guid, IdSpace, NodeAddress, NodeIndex, RequestId, SimTime};
pub use sd_metrics::{MetricsCollector, MetricsSink, NoOpSink, NodeState};
pub use sd_overlay::RingOverlay;
pub use sd_resources::{ClassPolicy, CpuClass, Resources};
