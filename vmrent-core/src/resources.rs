//! Resource specification of an instance and its validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use vmrent_hypervisor::{InstanceConfig, InstanceKind};

use crate::error::{RentalError, Result};

/// Smallest memory size an instance may have.
pub const MIN_MEMORY_MIB: u64 = 128;

/// CPU, memory and disk of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cores: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
}

impl ResourceSpec {
    pub fn new(cores: u32, memory_mib: u64, disk_gib: u64) -> Self {
        Self {
            cores,
            memory_mib,
            disk_gib,
        }
    }

    /// Conservative defaults used when the live configuration of an
    /// instance cannot be read.
    pub fn fallback_for(kind: InstanceKind) -> Self {
        match kind {
            InstanceKind::Vm => Self::new(1, 1024, 10),
            InstanceKind::Container => Self::new(1, 512, 8),
        }
    }
}

impl ResourceSpec {
    /// Snap every value to the closest standard size.
    pub fn normalized(&self) -> Self {
        const CORES: [u32; 7] = [1, 2, 4, 8, 16, 32, 64];
        const MEMORY: [u64; 8] = [512, 1024, 2048, 4096, 8192, 16_384, 32_768, 65_536];
        const DISK: [u64; 8] = [5, 10, 20, 50, 100, 200, 500, 1000];

        fn closest(steps: &[u64], value: u64) -> u64 {
            steps
                .iter()
                .copied()
                .min_by_key(|s| s.abs_diff(value))
                .unwrap_or(value)
        }

        let cores_steps: Vec<u64> = CORES.iter().map(|c| u64::from(*c)).collect();
        Self {
            cores: u32::try_from(closest(&cores_steps, u64::from(self.cores))).unwrap_or(self.cores),
            memory_mib: closest(&MEMORY, self.memory_mib),
            disk_gib: closest(&DISK, self.disk_gib),
        }
    }
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} CPU, {} MiB RAM, {} GiB Disk", self.cores, self.memory_mib, self.disk_gib)
    }
}

/// Predefined instance sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourcePreset {
    Nano,
    Micro,
    Small,
    Medium,
    Large,
    Xlarge,
}

impl ResourcePreset {
    pub const ALL: [ResourcePreset; 6] = [
        ResourcePreset::Nano,
        ResourcePreset::Micro,
        ResourcePreset::Small,
        ResourcePreset::Medium,
        ResourcePreset::Large,
        ResourcePreset::Xlarge,
    ];

    pub fn spec(&self) -> ResourceSpec {
        match self {
            ResourcePreset::Nano => ResourceSpec::new(1, 512, 5),
            ResourcePreset::Micro => ResourceSpec::new(1, 1024, 10),
            ResourcePreset::Small => ResourceSpec::new(2, 2048, 20),
            ResourcePreset::Medium => ResourceSpec::new(4, 4096, 50),
            ResourcePreset::Large => ResourceSpec::new(8, 8192, 100),
            ResourcePreset::Xlarge => ResourceSpec::new(16, 16_384, 200),
        }
    }

    /// Preset closest to `spec`, weighting one core like 1 GiB of memory or
    /// 10 GiB of disk.
    pub fn closest(spec: &ResourceSpec) -> Self {
        let score = |preset: &ResourcePreset| {
            let p = preset.spec();
            f64::from(spec.cores.abs_diff(p.cores))
                + spec.memory_mib.abs_diff(p.memory_mib) as f64 / 1024.0
                + spec.disk_gib.abs_diff(p.disk_gib) as f64 / 10.0
        };
        Self::ALL
            .iter()
            .copied()
            .min_by(|a, b| score(a).total_cmp(&score(b)))
            .unwrap_or(ResourcePreset::Micro)
    }
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self::fallback_for(InstanceKind::Vm)
    }
}

impl From<InstanceConfig> for ResourceSpec {
    fn from(config: InstanceConfig) -> Self {
        Self::new(config.cores, config.memory_mib, config.disk_gib)
    }
}

/// Configurable ceilings for [`ResourceSpec`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_cores: u32,
    pub max_memory_mib: u64,
    pub max_disk_gib: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cores: 64,
            max_memory_mib: 131_072,
            max_disk_gib: 10_240,
        }
    }
}

impl ResourceLimits {
    /// Check the hard floors and the configured ceilings.
    pub fn validate(&self, spec: &ResourceSpec) -> Result<()> {
        if spec.cores == 0 {
            return Err(RentalError::Validation("CPU cores must be greater than 0".to_string()));
        }
        if spec.memory_mib < MIN_MEMORY_MIB {
            return Err(RentalError::Validation(format!(
                "Memory must be at least {} MiB",
                MIN_MEMORY_MIB
            )));
        }
        if spec.disk_gib == 0 {
            return Err(RentalError::Validation("Disk size must be greater than 0".to_string()));
        }
        if spec.cores > self.max_cores {
            return Err(RentalError::Validation(format!("CPU cores cannot exceed {}", self.max_cores)));
        }
        if spec.memory_mib > self.max_memory_mib {
            return Err(RentalError::Validation(format!(
                "Memory cannot exceed {} MiB",
                self.max_memory_mib
            )));
        }
        if spec.disk_gib > self.max_disk_gib {
            return Err(RentalError::Validation(format!(
                "Disk size cannot exceed {} GiB",
                self.max_disk_gib
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floors() {
        let limits = ResourceLimits::default();
        assert!(limits.validate(&ResourceSpec::new(1, 128, 1)).is_ok());
        assert!(limits.validate(&ResourceSpec::new(0, 1024, 10)).is_err());
        assert!(limits.validate(&ResourceSpec::new(1, 127, 10)).is_err());
        assert!(limits.validate(&ResourceSpec::new(1, 1024, 0)).is_err());
    }

    #[test]
    fn test_ceilings() {
        let limits = ResourceLimits {
            max_cores: 8,
            max_memory_mib: 16_384,
            max_disk_gib: 500,
        };
        assert!(limits.validate(&ResourceSpec::new(8, 16_384, 500)).is_ok());
        assert!(limits.validate(&ResourceSpec::new(9, 1024, 10)).is_err());
        assert!(limits.validate(&ResourceSpec::new(1, 16_385, 10)).is_err());
        assert!(limits.validate(&ResourceSpec::new(1, 1024, 501)).is_err());
    }

    #[test]
    fn test_exhaustive_small_grid() {
        let limits = ResourceLimits {
            max_cores: 4,
            max_memory_mib: 256,
            max_disk_gib: 3,
        };
        for cores in 0..=5 {
            for memory in [0, 127, 128, 200, 256, 257] {
                for disk in 0..=4 {
                    let expected_reject =
                        cores == 0 || memory < 128 || disk == 0 || cores > 4 || memory > 256 || disk > 3;
                    let rejected = limits.validate(&ResourceSpec::new(cores, memory, disk)).is_err();
                    assert_eq!(rejected, expected_reject, "cores={} memory={} disk={}", cores, memory, disk);
                }
            }
        }
    }

    #[test]
    fn test_normalized_snaps_to_standard_sizes() {
        let spec = ResourceSpec::new(3, 3000, 70).normalized();
        assert_eq!(spec, ResourceSpec::new(2, 2048, 50));
        assert_eq!(ResourceSpec::new(100, 100_000, 5000).normalized(), ResourceSpec::new(64, 65_536, 1000));
    }

    #[test]
    fn test_closest_preset() {
        assert_eq!(ResourcePreset::closest(&ResourceSpec::new(2, 2048, 20)), ResourcePreset::Small);
        assert_eq!(ResourcePreset::closest(&ResourceSpec::new(7, 8000, 90)), ResourcePreset::Large);
        assert_eq!(ResourcePreset::closest(&ResourceSpec::new(1, 256, 1)), ResourcePreset::Nano);
    }

    #[test]
    fn test_fallback_specs() {
        assert_eq!(ResourceSpec::fallback_for(InstanceKind::Vm), ResourceSpec::new(1, 1024, 10));
        assert_eq!(ResourceSpec::fallback_for(InstanceKind::Container), ResourceSpec::new(1, 512, 8));
    }
}
