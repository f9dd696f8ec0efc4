//! Configuration file parsing and structures.
//!
//! thermostatd reads one TOML file. Every section is optional; missing values
//! fall back to the defaults of the reference board wiring (DHT22 on line 91
//! of gpiochip1, relays on lines 93, 6 and 92).

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thermostatd_sensor::BitThreshold;
use thermostatd_sensor::LineId;
use thermostatd_sensor::RetryPolicy;
use tracing_subscriber::filter::LevelFilter;

use crate::actuator::Relays;
use crate::thermostat::Mode;
use crate::thermostat::Target;
use crate::thermostat::ThermostatState;

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub logging: LoggingConfig,
    pub gpio: GpioConfig,
    pub sensor: SensorConfig,
    pub relays: Relays,
    pub thermostat: ThermostatConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: LogLevel,

    /// Per-target levels, e.g. `"thermostatd_sensor" = "debug"`
    pub overrides: HashMap<String, LogLevel>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpioBackendKind {
    /// Character device GPIO (`/dev/gpiochipN`)
    #[default]
    Cdev,
    /// In-memory chip with a simulated sensor
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GpioConfig {
    pub backend: GpioBackendKind,

    /// Consumer label attached to requested lines
    pub consumer: String,

    /// Temperature reported by the simulated sensor, in °C
    pub simulated_temperature: f32,

    /// Humidity reported by the simulated sensor, in %RH
    pub simulated_humidity: f32,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            backend: GpioBackendKind::default(),
            consumer: "thermostatd".to_string(),
            simulated_temperature: 21.0,
            simulated_humidity: 45.0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationKind {
    /// Each read runs in a child process that is killed on timeout
    #[default]
    Process,
    /// Each read runs on its own OS thread, cancelled on timeout
    Thread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BitThresholdConfig {
    FixedUs(u64),
    MeanLowPulse,
}

impl Default for BitThresholdConfig {
    fn default() -> Self {
        BitThresholdConfig::FixedUs(50)
    }
}

impl From<BitThresholdConfig> for BitThreshold {
    fn from(config: BitThresholdConfig) -> Self {
        match config {
            BitThresholdConfig::FixedUs(micros) => BitThreshold::Fixed(Duration::from_micros(micros)),
            BitThresholdConfig::MeanLowPulse => BitThreshold::MeanLowPulse,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensorConfig {
    /// Without a sensor the temperature only changes through manual overrides
    pub enabled: bool,
    pub chip: u32,
    pub line: u32,
    pub isolation: IsolationKind,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub sample_budget: usize,
    pub bit_threshold: BitThresholdConfig,
}

impl Default for SensorConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            enabled: true,
            chip: 1,
            line: 91,
            isolation: IsolationKind::default(),
            timeout_ms: policy.timeout.as_millis() as u64,
            max_attempts: policy.max_attempts,
            backoff_ms: policy.backoff.as_millis() as u64,
            poll_interval_ms: 10_000,
            sample_budget: thermostatd_sensor::protocol::DEFAULT_SAMPLE_BUDGET,
            bit_threshold: BitThresholdConfig::default(),
        }
    }
}

impl SensorConfig {
    pub fn line_id(&self) -> LineId {
        LineId::new(self.chip, self.line)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.backoff_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Initial thermostat state
#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThermostatConfig {
    pub mode: Mode,
    pub target: Option<Target>,
}

impl ThermostatConfig {
    pub fn initial_state(&self) -> ThermostatState {
        ThermostatState {
            mode: self.mode,
            target: self.target,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0".to_string(),
            port: 4201,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let lines = [
            ("sensor", self.sensor.line_id()),
            ("heating relay", self.relays.heating),
            ("cooling relay", self.relays.cooling),
            ("fan relay", self.relays.fan),
        ];
        for (i, (name, line)) in lines.iter().enumerate() {
            // A disabled sensor does not claim its line.
            if i == 0 && !self.sensor.enabled {
                continue;
            }
            if let Some((other, _)) = lines[i + 1..].iter().find(|(_, l)| l == line) {
                return Err(ConfigError::Invalid(format!(
                    "{} and {} share line {}",
                    name, other, line
                )));
            }
        }

        if self.sensor.max_attempts < 1 {
            return Err(ConfigError::Invalid(
                "sensor.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.sensor.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sensor.timeout_ms must be positive".to_string(),
            ));
        }
        if self.sensor.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sensor.poll_interval_ms must be positive".to_string(),
            ));
        }
        if let Some(target) = &self.thermostat.target {
            target
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("thermostat.target: {}", e)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.gpio.backend, GpioBackendKind::Cdev);
        assert_eq!(config.sensor.line_id(), LineId::new(1, 91));
        assert_eq!(config.sensor.retry_policy(), RetryPolicy::default());
        assert_eq!(config.sensor.isolation, IsolationKind::Process);
        assert_eq!(
            BitThreshold::from(config.sensor.bit_threshold),
            BitThreshold::default()
        );
        assert_eq!(config.relays, Relays::default());
        assert_eq!(config.thermostat.initial_state(), ThermostatState::default());
        assert_eq!(config.api.port, 4201);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [logging]
            level = "debug"

            [logging.overrides]
            "thermostatd_sensor" = "trace"

            [gpio]
            backend = "simulated"
            simulated_temperature = 17.5

            [sensor]
            isolation = "thread"
            timeout_ms = 500
            max_attempts = 3
            backoff_ms = 250
            bit_threshold = "mean_low_pulse"

            [relays]
            heating = { chip = 2, line = 1 }
            cooling = { chip = 2, line = 2 }
            fan = { chip = 2, line = 3 }

            [thermostat]
            mode = "heat-cool"
            target = [19.0, 23.0]

            [api]
            enabled = false
        "#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(
            config.logging.overrides.get("thermostatd_sensor"),
            Some(&LogLevel::Trace)
        );
        assert_eq!(config.gpio.backend, GpioBackendKind::Simulated);
        assert_eq!(config.gpio.simulated_temperature, 17.5);
        assert_eq!(config.gpio.simulated_humidity, 45.0);
        assert_eq!(config.sensor.isolation, IsolationKind::Thread);
        assert_eq!(
            config.sensor.retry_policy(),
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(250),
                timeout: Duration::from_millis(500),
            }
        );
        assert_eq!(config.sensor.bit_threshold, BitThresholdConfig::MeanLowPulse);
        assert_eq!(config.relays.fan, LineId::new(2, 3));
        assert_eq!(config.thermostat.mode, Mode::HeatCool);
        assert_eq!(config.thermostat.target, Some(Target::Range([19.0, 23.0])));
        assert!(!config.api.enabled);
    }

    #[test]
    fn test_fixed_threshold() {
        let config = Config::from_toml("[sensor]\nbit_threshold = { fixed_us = 40 }").unwrap();
        assert_eq!(
            BitThreshold::from(config.sensor.bit_threshold),
            BitThreshold::Fixed(Duration::from_micros(40))
        );
    }

    #[test]
    fn test_shared_lines_rejected() {
        let result = Config::from_toml("[relays]\nfan = { chip = 1, line = 93 }");
        let error = result.unwrap_err();
        insta::assert_snapshot!(error.to_string(), @"Invalid configuration: heating relay and fan relay share line gpiochip1:93");

        let result = Config::from_toml("[relays]\ncooling = { chip = 1, line = 91 }");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_disabled_sensor_may_share_line() {
        let toml = "[sensor]\nenabled = false\n[relays]\ncooling = { chip = 1, line = 91 }";
        assert!(Config::from_toml(toml).is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        for toml in [
            "[sensor]\nmax_attempts = 0",
            "[sensor]\ntimeout_ms = 0",
            "[sensor]\npoll_interval_ms = 0",
            "[thermostat]\ntarget = [23.0, 19.0]",
        ] {
            assert!(
                matches!(Config::from_toml(toml), Err(ConfigError::Invalid(_))),
                "accepted: {}",
                toml
            );
        }
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(matches!(
            Config::from_toml("[sensor]\npin = 4"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_toml("[gpio]\nbackend = \"sysfs\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[thermostat]\nmode = \"heat\"\ntarget = 20.5\n").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.thermostat.mode, Mode::Heat);
        assert_eq!(config.thermostat.target, Some(Target::Single(20.5)));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::from_file(dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::Io(..))));
    }
}
