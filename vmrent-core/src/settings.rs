//! Tunables of the rental core.

use serde::{Deserialize, Serialize};

use crate::resources::ResourceLimits;

/// Settings shared by the controller and the sweeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RentalSettings {
    /// Length of a trial rental in days
    pub trial_days: u32,

    /// Length of a regular rental period in months
    pub rental_months: u32,

    /// Ceilings for CPU, memory and disk
    pub limits: ResourceLimits,

    /// Suspend active instances whose rental window has closed
    pub auto_suspend_expired: bool,

    /// Days after the end date before a terminated instance is archived
    pub archive_after_days: u32,

    /// Age in days after which automatic config backups are pruned
    pub backup_retention_days: u32,
}

impl Default for RentalSettings {
    fn default() -> Self {
        Self {
            trial_days: 7,
            rental_months: 1,
            limits: ResourceLimits::default(),
            auto_suspend_expired: true,
            archive_after_days: 30,
            backup_retention_days: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let settings: RentalSettings = serde_yaml::from_str("trial_days: 14\nlimits:\n  max_cores: 16\n").unwrap();
        assert_eq!(settings.trial_days, 14);
        assert_eq!(settings.rental_months, 1);
        assert_eq!(settings.limits.max_cores, 16);
        assert_eq!(settings.limits.max_memory_mib, 131_072);
        assert!(settings.auto_suspend_expired);
    }
}
