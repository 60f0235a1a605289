//! Resource Model
//!
//! A node's capacity (maximum or free) is a single `Resources` value. The
//! arithmetic here never fails: callers check `contains` before `sub`, and a
//! violated precondition is a programming error that panics.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuClass {
    #[default]
    Low,
    High,
}

/// How `contains` treats the CPU class dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassPolicy {
    /// Classes must be equal
    #[default]
    Exact,
    /// Class is ignored, only cpus and ram are compared
    Agnostic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu_class: CpuClass,
    pub cpus: u32,
    pub ram: u32,
}

impl Resources {
    pub fn new(cpu_class: CpuClass, cpus: u32, ram: u32) -> Self {
        Self {
            cpu_class,
            cpus,
            ram,
        }
    }

    /// Same class, zero cpus and ram
    pub fn zero(cpu_class: CpuClass) -> Self {
        Self::new(cpu_class, 0, 0)
    }

    /// A request is only meaningful when every quantity is positive
    pub fn is_valid(&self) -> bool {
        self.cpus > 0 && self.ram > 0
    }

    pub fn is_zero(&self) -> bool {
        self.cpus == 0 && self.ram == 0
    }

    pub fn contains(&self, other: &Resources, policy: ClassPolicy) -> bool {
        let class_ok = match policy {
            ClassPolicy::Exact => self.cpu_class == other.cpu_class,
            ClassPolicy::Agnostic => true,
        };
        class_ok && self.cpus >= other.cpus && self.ram >= other.ram
    }

    /// Dimension-wise `contains` ignoring class, used for integrity checks
    pub fn covers(&self, other: &Resources) -> bool {
        self.contains(other, ClassPolicy::Agnostic)
    }

    pub fn add(&mut self, other: &Resources) {
        self.cpus = self
            .cpus
            .checked_add(other.cpus)
            .unwrap_or_else(|| panic!("cpu overflow adding {} to {}", other, self));
        self.ram = self
            .ram
            .checked_add(other.ram)
            .unwrap_or_else(|| panic!("ram overflow adding {} to {}", other, self));
    }

    pub fn sub(&mut self, other: &Resources) {
        assert!(
            self.covers(other),
            "subtracting {} from {} drives a dimension negative",
            other,
            self
        );
        self.cpus -= other.cpus;
        self.ram -= other.ram;
    }

    /// `self - other` clamped at zero per dimension
    pub fn saturating_minus(&self, other: &Resources) -> Resources {
        Resources::new(
            self.cpu_class,
            self.cpus.saturating_sub(other.cpus),
            self.ram.saturating_sub(other.ram),
        )
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{:?}; {} cpus; {} MB>",
            self.cpu_class, self.cpus, self.ram
        )
    }
}
