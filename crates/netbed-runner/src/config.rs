//! Backend configuration.
//!
//! Each backend has a config struct with defaults and `with_*` builders. A
//! YAML file may supply shared settings; command-line flags override it.

use std::path::Path;

use netbed_link::LinkProfile;
use serde::Deserialize;

use crate::ConfigError;

/// Most nodes a simulation may hold. The broadcast address is excluded.
pub const MAX_SIMULATED_NODES: usize = 254;

/// Default TCP port of the neighbor directory.
pub const DEFAULT_DIRECTORY_PORT: u16 = 8888;

// ============================================================================
// Simulator
// ============================================================================

/// Configuration for [`Simulator`](crate::Simulator).
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Number of nodes; addresses are `0..num_nodes`.
    pub num_nodes: usize,
    /// Wall-clock pacing while waiting for input (1.0 = real time,
    /// 0.0 = as fast as possible).
    pub timescale: f64,
    /// Seed for loss draws.
    pub seed: u64,
    /// Connect every pair of nodes that has no configured link.
    pub all_to_all: bool,
    /// Profile for `edge` lines without options and for implicit links.
    pub default_profile: LinkProfile,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            num_nodes: 2,
            timescale: 1.0,
            seed: 0,
            all_to_all: false,
            default_profile: LinkProfile::default(),
        }
    }
}

impl SimulatorConfig {
    pub fn new(num_nodes: usize) -> Self {
        SimulatorConfig {
            num_nodes,
            ..Self::default()
        }
    }

    pub fn with_timescale(mut self, timescale: f64) -> Self {
        self.timescale = timescale;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_all_to_all(mut self, all_to_all: bool) -> Self {
        self.all_to_all = all_to_all;
        self
    }

    pub fn with_default_profile(mut self, profile: LinkProfile) -> Self {
        self.default_profile = profile;
        self
    }

    /// Fold in settings from a config file.
    pub fn with_file(mut self, file: &FileConfig) -> Self {
        if let Some(profile) = file.default_link {
            self.default_profile = profile;
        }
        if let Some(timescale) = file.timescale {
            self.timescale = timescale;
        }
        if let Some(seed) = file.seed {
            self.seed = seed;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_nodes == 0 || self.num_nodes > MAX_SIMULATED_NODES {
            return Err(ConfigError::NodeCount(self.num_nodes));
        }
        if self.timescale.is_nan() || self.timescale < 0.0 {
            return Err(ConfigError::Timescale(self.timescale));
        }
        self.default_profile.validate()?;
        Ok(())
    }
}

// ============================================================================
// Emulator
// ============================================================================

/// Configuration for [`Emulator`](crate::Emulator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorConfig {
    pub directory_host: String,
    pub directory_port: u16,
    /// Local UDP port; also the identity the directory registers.
    pub local_port: u16,
    pub seed: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        EmulatorConfig {
            directory_host: "localhost".to_string(),
            directory_port: DEFAULT_DIRECTORY_PORT,
            local_port: 10000,
            seed: 0,
        }
    }
}

impl EmulatorConfig {
    pub fn new(directory_host: impl Into<String>, directory_port: u16, local_port: u16) -> Self {
        EmulatorConfig {
            directory_host: directory_host.into(),
            directory_port,
            local_port,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_file(mut self, file: &FileConfig) -> Self {
        if let Some(seed) = file.seed {
            self.seed = seed;
        }
        self
    }
}

// ============================================================================
// Directory
// ============================================================================

/// Configuration for the neighbor directory server.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryConfig {
    pub listen_port: u16,
    /// Announce every registered node to every other. Used when no topology
    /// file is given.
    pub all_to_all: bool,
    pub default_profile: LinkProfile,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig {
            listen_port: DEFAULT_DIRECTORY_PORT,
            all_to_all: true,
            default_profile: LinkProfile::default(),
        }
    }
}

impl DirectoryConfig {
    pub fn new(listen_port: u16) -> Self {
        DirectoryConfig {
            listen_port,
            ..Self::default()
        }
    }

    pub fn with_all_to_all(mut self, all_to_all: bool) -> Self {
        self.all_to_all = all_to_all;
        self
    }

    pub fn with_default_profile(mut self, profile: LinkProfile) -> Self {
        self.default_profile = profile;
        self
    }

    pub fn with_file(mut self, file: &FileConfig) -> Self {
        if let Some(profile) = file.default_link {
            self.default_profile = profile;
        }
        self
    }
}

// ============================================================================
// Config file
// ============================================================================

/// Settings loadable from YAML.
///
/// ```yaml
/// timescale: 0.0
/// seed: 42
/// default_link:
///   loss_rate: 0.01
///   delay_ms: 5
///   bandwidth: 20000
///   buffer_time_ms: 250
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub default_link: Option<LinkProfile>,
    pub timescale: Option<f64>,
    pub seed: Option<u64>,
}

impl FileConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: FileConfig = serde_yaml::from_str(text)?;
        if let Some(profile) = &config.default_link {
            profile.validate()?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_simulator_validation() {
        assert!(SimulatorConfig::new(3).validate().is_ok());
        assert!(matches!(
            SimulatorConfig::new(0).validate(),
            Err(ConfigError::NodeCount(0))
        ));
        assert!(matches!(
            SimulatorConfig::new(255).validate(),
            Err(ConfigError::NodeCount(255))
        ));
        assert!(matches!(
            SimulatorConfig::new(3).with_timescale(-1.0).validate(),
            Err(ConfigError::Timescale(_))
        ));
        assert!(matches!(
            SimulatorConfig::new(3).with_timescale(f64::NAN).validate(),
            Err(ConfigError::Timescale(_))
        ));
    }

    #[test]
    fn test_file_config() {
        let file = FileConfig::from_yaml_str(
            "timescale: 0.0\nseed: 42\ndefault_link:\n  delay_ms: 5\n  bandwidth: 20000\n",
        )
        .unwrap();
        let config = SimulatorConfig::new(4).with_file(&file);
        assert_eq!(config.timescale, 0.0);
        assert_eq!(config.seed, 42);
        assert_eq!(config.default_profile.delay, Duration::from_millis(5));
        assert_eq!(config.default_profile.bandwidth, 20000);
        assert_eq!(config.default_profile.loss_rate, 0.0);
    }

    #[test]
    fn test_file_config_rejects_bad_profile() {
        assert!(matches!(
            FileConfig::from_yaml_str("default_link:\n  loss_rate: 1.5\n"),
            Err(ConfigError::Link(_))
        ));
        assert!(matches!(
            FileConfig::from_yaml_str("speed: 3\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_empty_file_changes_nothing() {
        let file = FileConfig::from_yaml_str("{}").unwrap();
        assert_eq!(SimulatorConfig::new(2).with_file(&file), SimulatorConfig::new(2));
        assert_eq!(
            DirectoryConfig::new(9000).with_file(&file),
            DirectoryConfig::new(9000)
        );
    }
}
