/// Simulation Configuration
///
/// Defaults reproduce the reference bus-off attack experiment; every value can
/// be overridden from the environment or a JSON file.
use crate::attack_controller::ControllerConfig;
use crate::can_bus::{ArbitrationKey, BusConfig};
use crate::error::{Result, SimError};
use crate::error_gate::{BitErrorGate, DEFAULT_BIT_ERROR_PROBABILITY};
use crate::frame::{MAX_PAYLOAD_LEN, MAX_STANDARD_ID};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_ERROR_PROBABILITY: &str = "BUSOFF_ERROR_PROBABILITY";
pub const ENV_SEED: &str = "BUSOFF_SEED";
pub const ENV_MAX_ROUNDS: &str = "BUSOFF_MAX_ROUNDS";
pub const ENV_ROUND_INTERVAL_MS: &str = "BUSOFF_ROUND_INTERVAL_MS";
pub const ENV_COOLDOWN_ROUNDS: &str = "BUSOFF_COOLDOWN_ROUNDS";
pub const ENV_LOG_DIR: &str = "BUSOFF_LOG_DIR";

/// Complete simulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Chance that a clean transmission or reception is treated as a bit error
    pub bit_error_probability: f64,

    /// Base seed for the per-node error gates (None = OS entropy)
    pub seed: Option<u64>,

    /// Identifier shared by victim and attacker
    pub contested_id: u16,

    /// Payload of the contested data frames
    pub payload: Vec<u8>,

    /// Attacker sends a synchronization frame one id below the contested id
    pub preceding_frames: bool,

    /// Rounds before the attack gives up
    pub max_rounds: u64,

    /// Phase2 rounds the attacker pauses after the victim's TEC resets
    /// (3 rounds at 500 ms matches a 1.5 s back-off; 0 disables)
    pub cooldown_rounds: u64,

    /// Delay before the first attack round
    pub start_delay_ms: u64,

    /// Delay between attack rounds
    pub round_interval_ms: u64,

    pub arbitration_key: ArbitrationKey,

    /// Directory for the chained JSONL event log (None = no file log)
    pub log_dir: Option<PathBuf>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            bit_error_probability: DEFAULT_BIT_ERROR_PROBABILITY,
            seed: None,
            contested_id: 0x555,
            payload: vec![0xCA, 0xFE],
            preceding_frames: false,
            max_rounds: 1000,
            cooldown_rounds: 3,
            start_delay_ms: 100,
            round_interval_ms: 500,
            arbitration_key: ArbitrationKey::FrameId,
            log_dir: None,
        }
    }
}

impl SimConfig {
    /// Defaults with random bit errors off and a fixed seed
    pub fn deterministic() -> Self {
        Self {
            bit_error_probability: 0.0,
            seed: Some(0),
            ..Self::default()
        }
    }

    /// Defaults overridden by `BUSOFF_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from a key lookup (environment in production)
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(ENV_ERROR_PROBABILITY) {
            self.bit_error_probability = parse_var(ENV_ERROR_PROBABILITY, &value)?;
        }
        if let Some(value) = lookup(ENV_SEED) {
            self.seed = Some(parse_var(ENV_SEED, &value)?);
        }
        if let Some(value) = lookup(ENV_MAX_ROUNDS) {
            self.max_rounds = parse_var(ENV_MAX_ROUNDS, &value)?;
        }
        if let Some(value) = lookup(ENV_COOLDOWN_ROUNDS) {
            self.cooldown_rounds = parse_var(ENV_COOLDOWN_ROUNDS, &value)?;
        }
        if let Some(value) = lookup(ENV_ROUND_INTERVAL_MS) {
            self.round_interval_ms = parse_var(ENV_ROUND_INTERVAL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_LOG_DIR) {
            self.log_dir = Some(PathBuf::from(value));
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.bit_error_probability) {
            return Err(SimError::InvalidConfig(format!(
                "bit_error_probability {} outside [0, 1]",
                self.bit_error_probability
            )));
        }
        // The guardian sits one id below the contested id
        if self.contested_id == 0 || self.contested_id > MAX_STANDARD_ID {
            return Err(SimError::InvalidConfig(format!(
                "contested_id 0x{:X} must be within 0x001..=0x{:03X}",
                self.contested_id, MAX_STANDARD_ID
            )));
        }
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(SimError::InvalidConfig(format!(
                "payload of {} bytes exceeds {}",
                self.payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        if self.max_rounds == 0 {
            return Err(SimError::InvalidConfig("max_rounds must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            arbitration_key: self.arbitration_key,
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            preceding_frames: self.preceding_frames,
            max_rounds: self.max_rounds,
            cooldown_rounds: self.cooldown_rounds,
            payload: self.payload.clone(),
        }
    }

    /// Gate for the `index`-th node. Seeded configs give each node its own
    /// reproducible stream.
    pub fn error_gate(&self, index: u64) -> Result<BitErrorGate> {
        BitErrorGate::new(
            self.bit_error_probability,
            self.seed.map(|seed| seed.wrapping_add(index)),
        )
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn round_interval(&self) -> Duration {
        Duration::from_millis(self.round_interval_ms)
    }

    /// SHA-256 of the canonical JSON form, recorded in reports and logs so a
    /// run can be matched to its exact parameters.
    pub fn fingerprint(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&json);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SimError::InvalidConfig(format!("{}={:?} is not a valid value", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_reference_experiment() {
        let config = SimConfig::default();
        assert_eq!(config.bit_error_probability, 0.10);
        assert_eq!(config.contested_id, 0x555);
        assert_eq!(config.payload, vec![0xCA, 0xFE]);
        assert_eq!(config.round_interval(), Duration::from_millis(500));
        assert_eq!(config.start_delay(), Duration::from_millis(100));
        assert_eq!(config.cooldown_rounds, 3);
        assert_eq!(config.controller_config().cooldown_rounds, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = SimConfig::default();
        config
            .apply_env(lookup(&[
                (ENV_ERROR_PROBABILITY, "0.25"),
                (ENV_SEED, "42"),
                (ENV_MAX_ROUNDS, "64"),
                (ENV_COOLDOWN_ROUNDS, "0"),
                (ENV_ROUND_INTERVAL_MS, "10"),
                (ENV_LOG_DIR, "/tmp/busoff"),
            ]))
            .unwrap();

        assert_eq!(config.bit_error_probability, 0.25);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.max_rounds, 64);
        assert_eq!(config.cooldown_rounds, 0);
        assert_eq!(config.round_interval_ms, 10);
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/busoff")));
    }

    #[test]
    fn test_bad_env_value_rejected() {
        let mut config = SimConfig::default();
        assert!(config.apply_env(lookup(&[(ENV_SEED, "abc")])).is_err());
        assert!(config.apply_env(lookup(&[(ENV_ERROR_PROBABILITY, "2.0")])).is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = SimConfig::default();
        config.contested_id = 0x800;
        assert!(config.validate().is_err());

        let mut config = SimConfig::default();
        config.payload = vec![0; 9];
        assert!(config.validate().is_err());

        let mut config = SimConfig::default();
        config.max_rounds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sim.json");
        let config = SimConfig {
            seed: Some(7),
            preceding_frames: true,
            ..SimConfig::deterministic()
        };

        config.save_json_file(&path).unwrap();
        let loaded = SimConfig::from_json_file(&path).unwrap();

        assert_eq!(loaded, config);
        assert_eq!(loaded.fingerprint().unwrap(), config.fingerprint().unwrap());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "max_rounds": 12, "arbitration_key": "NodePriority" }"#).unwrap();

        let config = SimConfig::from_json_file(&path).unwrap();

        assert_eq!(config.max_rounds, 12);
        assert_eq!(config.arbitration_key, ArbitrationKey::NodePriority);
        assert_eq!(config.contested_id, 0x555);
    }

    #[test]
    fn test_fingerprint_changes_with_parameters() {
        let a = SimConfig::deterministic();
        let b = SimConfig {
            max_rounds: 10,
            ..SimConfig::deterministic()
        };
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_seeded_gates_are_distinct_per_node() {
        let config = SimConfig {
            bit_error_probability: 0.5,
            seed: Some(1),
            ..SimConfig::default()
        };
        let mut a = config.error_gate(0).unwrap();
        let mut b = config.error_gate(1).unwrap();
        let seq_a: Vec<bool> = (0..64).map(|_| a.trip()).collect();
        let seq_b: Vec<bool> = (0..64).map(|_| b.trip()).collect();
        assert_ne!(seq_a, seq_b);
    }
}
