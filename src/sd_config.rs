//! Simulation configuration
//!
//! Every field has a default so scenario files only need to name what they
//! change. Feeder and generator are tagged variants resolved once at engine
//! construction; an unknown `kind` is a parse error.

use serde::Deserialize;
use std::path::PathBuf;

use crate::sd_error::{Result, SimError};
use crate::sd_feeder::FeederConfig;
use crate::sd_generator::GeneratorConfig;
use crate::sd_interface::{Guid, IdSpace, SimTime, DEFAULT_MASTER_GUID};
use crate::sd_overlay::MAX_MOCK_ADDRESSES;
use crate::sd_resources::ClassPolicy;

/// Where the engine injects each task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Always node 0 (centralized backends)
    #[default]
    NodeZero,
    /// Uniformly random node
    Random,
}

/// Schedule of one periodic-action family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PeriodicConfig {
    /// Simulated time between firings
    pub interval_ms: SimTime,

    /// Nodes are split into this many partitions (`index % partitions`); each
    /// firing hits the next partition in turn
    #[serde(default = "default_partitions")]
    pub partitions: usize,
}

fn default_partitions() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Number of ticks to run
    pub ticks: u64,

    /// Simulated time per tick
    pub tick_interval_ms: SimTime,

    pub num_nodes: usize,

    /// Identifier width B of the ring
    pub id_bits: u32,

    /// Identifier that makes a node the master
    pub master_guid: Guid,

    /// Worker threads; 0 = hardware parallelism * worker_multiplier
    pub workers: usize,

    pub worker_multiplier: usize,

    pub placement: Placement,

    pub class_policy: ClassPolicy,

    /// Offer refresh family
    pub refresh: PeriodicConfig,

    /// Offer spread family
    pub spread: PeriodicConfig,

    /// Persist and rotate the metrics window every K ticks, plus once for a
    /// trailing partial window (0 = never)
    pub persist_every_ticks: u64,

    /// Random seed for reproducibility (None = random)
    pub seed: Option<u64>,

    pub feeder: FeederConfig,

    pub generator: GeneratorConfig,

    /// Where persisted snapshots go (None = memory only)
    pub output_dir: Option<PathBuf>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ticks: 100,
            tick_interval_ms: 1000,
            num_nodes: 64,
            id_bits: 32,
            master_guid: DEFAULT_MASTER_GUID,
            workers: 1,
            worker_multiplier: 2,
            placement: Placement::NodeZero,
            class_policy: ClassPolicy::Exact,
            refresh: PeriodicConfig {
                interval_ms: 5_000,
                partitions: 1,
            },
            spread: PeriodicConfig {
                interval_ms: 30_000,
                partitions: 4,
            },
            persist_every_ticks: 50,
            seed: None,
            feeder: FeederConfig::default(),
            generator: GeneratorConfig::default(),
            output_dir: None,
        }
    }
}

impl SimulationConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: SimulationConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn id_space(&self) -> Result<IdSpace> {
        IdSpace::new(self.id_bits)
            .ok_or_else(|| SimError::Config(format!("id_bits {} outside 1..=64", self.id_bits)))
    }

    /// Get or generate seed
    pub fn resolve_seed(&self) -> u64 {
        self.seed.unwrap_or_else(rand::random)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 {
            return Err(SimError::Config("num_nodes must be positive".into()));
        }
        if self.ticks == 0 {
            return Err(SimError::Config("ticks must be positive".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(SimError::Config("tick_interval_ms must be positive".into()));
        }

        let space = self.id_space()?;
        if (self.num_nodes as u128) > space.modulus() {
            return Err(SimError::Config(format!(
                "{} nodes do not fit a {}-bit identifier space",
                self.num_nodes, self.id_bits
            )));
        }
        if self.num_nodes > MAX_MOCK_ADDRESSES {
            return Err(SimError::Config(format!(
                "num_nodes {} exceeds the {} available mock addresses",
                self.num_nodes, MAX_MOCK_ADDRESSES
            )));
        }
        if !space.contains(self.master_guid) {
            return Err(SimError::Config(format!(
                "master_guid {} outside {}-bit identifier space",
                self.master_guid, self.id_bits
            )));
        }

        if self.workers == 0 && self.worker_multiplier == 0 {
            return Err(SimError::Config("worker_multiplier must be positive".into()));
        }

        for (name, periodic) in [("refresh", &self.refresh), ("spread", &self.spread)] {
            if periodic.interval_ms == 0 {
                return Err(SimError::Config(format!("{}.interval_ms must be positive", name)));
            }
            if periodic.partitions == 0 {
                return Err(SimError::Config(format!("{}.partitions must be positive", name)));
            }
        }

        self.feeder.validate()?;
        self.generator.validate()?;
        Ok(())
    }
}
