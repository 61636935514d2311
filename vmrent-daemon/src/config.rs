//! Configuration management for the daemon.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use vmrent_core::RentalSettings;
use vmrent_hypervisor::ConnectionSettings;

use crate::cli::Args;

/// Location tried when no config file is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmrent/daemon.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Sweep intervals
    pub sweeps: SweepConfig,
    /// Rental rules shared by the controller and the sweeps
    pub rental: RentalSettings,
    /// Hypervisor servers to manage
    pub servers: Vec<ServerDefinition>,
    /// Serve every host from an in-memory mock backend
    pub dev: bool,
}

impl DaemonConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            bail!("Config file not found: {}", path.display());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: DaemonConfig =
            serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Config from the file named on the command line, else from the
    /// default location when it exists, else defaults. CLI overrides are
    /// applied last.
    pub fn resolve(args: &Args) -> Result<Self> {
        let config = match &args.config {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        Ok(config.with_cli_overrides(args))
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if let Some(ref format) = args.log_format {
            self.logging.format = format.clone();
        }

        if args.dev {
            self.dev = true;
        }

        self
    }

    fn validate(&self) -> Result<()> {
        for (name, secs) in self.sweeps.named_intervals() {
            if secs == 0 {
                bail!("sweeps.{} must be at least 1 second", name);
            }
        }
        for server in &self.servers {
            if server.connection.host.trim().is_empty() {
                bail!("server '{}' has no host", server.name);
            }
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// How often each sweep runs, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub inventory_interval_secs: u64,
    pub expiry_interval_secs: u64,
    pub provision_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub health_interval_secs: u64,
    pub backup_interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            inventory_interval_secs: 3600,
            expiry_interval_secs: 3600,
            provision_interval_secs: 300,
            cleanup_interval_secs: 86_400,
            health_interval_secs: 600,
            backup_interval_secs: 86_400,
        }
    }
}

impl SweepConfig {
    fn named_intervals(&self) -> [(&'static str, u64); 6] {
        [
            ("inventory_interval_secs", self.inventory_interval_secs),
            ("expiry_interval_secs", self.expiry_interval_secs),
            ("provision_interval_secs", self.provision_interval_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("health_interval_secs", self.health_interval_secs),
            ("backup_interval_secs", self.backup_interval_secs),
        ]
    }

    pub fn interval(secs: u64) -> Duration {
        Duration::from_secs(secs.max(1))
    }
}

/// One managed hypervisor server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerDefinition {
    /// Display name
    pub name: String,
    #[serde(flatten)]
    pub connection: ConnectionSettings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vmrent_hypervisor::{BackendKind, Credentials};

    const SAMPLE: &str = r#"
logging:
  level: debug
sweeps:
  provision_interval_secs: 60
rental:
  trial_days: 14
servers:
  - name: lab
    kind: proxmox
    host: 10.0.0.5
    verify_tls: false
    credentials:
      type: api_token
      user: root@pam
      token_name: rental
      token_value: secret
  - name: dc1
    kind: vcenter
    host: vcenter.example.com
    credentials:
      type: password
      username: administrator@vsphere.local
      password: secret
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config() {
        let file = write_config(SAMPLE);
        let config = DaemonConfig::load(file.path()).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.sweeps.provision_interval_secs, 60);
        assert_eq!(config.sweeps.expiry_interval_secs, 3600);
        assert_eq!(config.rental.trial_days, 14);
        assert_eq!(config.rental.rental_months, 1);

        assert_eq!(config.servers.len(), 2);
        let lab = &config.servers[0].connection;
        assert_eq!(lab.kind, BackendKind::Proxmox);
        assert!(!lab.verify_tls);
        assert_eq!(lab.effective_port(), 8006);
        assert!(matches!(lab.credentials, Credentials::ApiToken { .. }));
        let dc1 = &config.servers[1].connection;
        assert_eq!(dc1.kind, BackendKind::Vcenter);
        assert!(dc1.verify_tls);
    }

    #[test]
    fn test_missing_file() {
        let err = DaemonConfig::load("/nonexistent/vmrent.yaml").unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let file = write_config("sweeps:\n  expiry_interval_secs: 0\n");
        let err = DaemonConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("expiry_interval_secs"));
    }

    #[test]
    fn test_cli_overrides() {
        let file = write_config(SAMPLE);
        let args = Args {
            config: Some(file.path().display().to_string()),
            log_format: Some("json".to_string()),
            dev: true,
            ..Args::default()
        };

        let config = DaemonConfig::resolve(&args).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert!(config.dev);
    }
}
