//! Resource generation
//!
//! Picks node capacities at initialization time and request sizes for the
//! feeders. The generator is chosen once from configuration.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::sd_error::{Result, SimError};
use crate::sd_resources::{CpuClass, Resources};

pub trait ResourceGenerator: Send {
    /// Maximum capacity for one simulated node
    fn generate(&mut self) -> Resources;

    /// Size of one workload request
    fn generate_request(&mut self) -> Resources;
}

/// A resource profile and its relative weight
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WeightedProfile {
    pub resources: Resources,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratorConfig {
    /// Every node and every request gets the same resources
    Fixed { node: Resources, request: Resources },

    /// Weighted pick from profile lists
    Static {
        node_profiles: Vec<WeightedProfile>,
        request_profiles: Vec<WeightedProfile>,
    },
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig::Static {
            node_profiles: vec![
                WeightedProfile {
                    resources: Resources::new(CpuClass::Low, 4, 4096),
                    weight: 3,
                },
                WeightedProfile {
                    resources: Resources::new(CpuClass::High, 8, 8192),
                    weight: 1,
                },
            ],
            request_profiles: vec![
                WeightedProfile {
                    resources: Resources::new(CpuClass::Low, 1, 512),
                    weight: 4,
                },
                WeightedProfile {
                    resources: Resources::new(CpuClass::Low, 2, 1024),
                    weight: 2,
                },
                WeightedProfile {
                    resources: Resources::new(CpuClass::High, 2, 2048),
                    weight: 1,
                },
            ],
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            GeneratorConfig::Fixed { node, request } => {
                if !node.is_valid() || !request.is_valid() {
                    return Err(SimError::Config("fixed generator needs positive resources".into()));
                }
            }
            GeneratorConfig::Static {
                node_profiles,
                request_profiles,
            } => {
                validate_profiles("node_profiles", node_profiles)?;
                validate_profiles("request_profiles", request_profiles)?;
            }
        }
        Ok(())
    }

    pub fn build(&self, seed: u64) -> Result<Box<dyn ResourceGenerator>> {
        self.validate()?;
        Ok(match self {
            GeneratorConfig::Fixed { node, request } => Box::new(FixedGenerator {
                node: *node,
                request: *request,
            }),
            GeneratorConfig::Static {
                node_profiles,
                request_profiles,
            } => Box::new(StaticGenerator::new(
                node_profiles.clone(),
                request_profiles.clone(),
                seed,
            )),
        })
    }
}

fn validate_profiles(name: &str, profiles: &[WeightedProfile]) -> Result<()> {
    if profiles.is_empty() {
        return Err(SimError::Config(format!("{} must not be empty", name)));
    }
    if profiles.iter().all(|p| p.weight == 0) {
        return Err(SimError::Config(format!("{} needs a positive weight", name)));
    }
    if let Some(bad) = profiles.iter().find(|p| !p.resources.is_valid()) {
        return Err(SimError::Config(format!(
            "{} contains degenerate profile {}",
            name, bad.resources
        )));
    }
    Ok(())
}

pub struct FixedGenerator {
    pub node: Resources,
    pub request: Resources,
}

impl ResourceGenerator for FixedGenerator {
    fn generate(&mut self) -> Resources {
        self.node
    }

    fn generate_request(&mut self) -> Resources {
        self.request
    }
}

pub struct StaticGenerator {
    node_profiles: Vec<WeightedProfile>,
    request_profiles: Vec<WeightedProfile>,
    rng: StdRng,
}

impl StaticGenerator {
    pub fn new(node_profiles: Vec<WeightedProfile>, request_profiles: Vec<WeightedProfile>, seed: u64) -> Self {
        Self {
            node_profiles,
            request_profiles,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn pick(profiles: &[WeightedProfile], rng: &mut StdRng) -> Resources {
        let total: u32 = profiles.iter().map(|p| p.weight).sum();
        let mut roll = rng.gen_range(0..total);
        for profile in profiles {
            if roll < profile.weight {
                return profile.resources;
            }
            roll -= profile.weight;
        }
        profiles[profiles.len() - 1].resources
    }
}

impl ResourceGenerator for StaticGenerator {
    fn generate(&mut self) -> Resources {
        Self::pick(&self.node_profiles, &mut self.rng)
    }

    fn generate_request(&mut self) -> Resources {
        Self::pick(&self.request_profiles, &mut self.rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_generator_respects_weights() {
        let profiles = vec![
            WeightedProfile {
                resources: Resources::new(CpuClass::Low, 1, 1),
                weight: 0,
            },
            WeightedProfile {
                resources: Resources::new(CpuClass::High, 2, 2),
                weight: 5,
            },
        ];
        let mut generator = StaticGenerator::new(profiles.clone(), profiles, 1);
        for _ in 0..100 {
            assert_eq!(generator.generate(), Resources::new(CpuClass::High, 2, 2));
        }
    }

    #[test]
    fn test_static_generator_is_seeded() {
        let config = GeneratorConfig::default();
        let mut a = config.build(42).unwrap();
        let mut b = config.build(42).unwrap();
        for _ in 0..50 {
            assert_eq!(a.generate(), b.generate());
            assert_eq!(a.generate_request(), b.generate_request());
        }
    }

    #[test]
    fn test_invalid_profiles_rejected() {
        let empty = GeneratorConfig::Static {
            node_profiles: vec![],
            request_profiles: vec![],
        };
        assert!(matches!(empty.build(0), Err(SimError::Config(_))));

        let degenerate = GeneratorConfig::Fixed {
            node: Resources::new(CpuClass::Low, 0, 10),
            request: Resources::new(CpuClass::Low, 1, 1),
        };
        assert!(degenerate.validate().is_err());
    }

    #[test]
    fn test_yaml_selection() {
        let yaml = "kind: fixed\nnode: {cpus: 4, ram: 4096}\nrequest: {cpus: 1, ram: 256}\n";
        let config: GeneratorConfig = serde_yaml::from_str(yaml).unwrap();
        let mut generator = config.build(0).unwrap();
        assert_eq!(generator.generate(), Resources::new(CpuClass::Low, 4, 4096));

        let unknown = "kind: partition_aware\n";
        assert!(serde_yaml::from_str::<GeneratorConfig>(unknown).is_err());
    }
}
