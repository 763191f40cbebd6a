//! Device configuration loaded from the JSON file passed with `--config`.
//!
//! Field names follow the on-disk layout (`deviceThing.thingName`,
//! `settings.brakeServo.onPosition`, ...). Only `certsPath` and `deviceThing`
//! are required; every other section falls back to the defaults below.
//!
//! # Example
//!
//! ```rust
//! use turbine_sync::config::Config;
//!
//! let config = Config::from_json(r#"{
//!     "certsPath": "/home/pi/certs",
//!     "deviceThing": {
//!         "thingName": "turbine-7",
//!         "caPath": "root.ca.pem",
//!         "certPath": "cert.pem",
//!         "keyPath": "private.key",
//!         "endPoint": "example-ats.iot.us-east-1.amazonaws.com"
//!     },
//!     "runtime": { "connection": { "useGreengrass": "no" } }
//! }"#).unwrap();
//!
//! assert_eq!(config.device_thing.thing_name, "turbine-7");
//! assert_eq!(config.device_thing.mqtt_port, 8883);
//! assert!(!config.runtime.connection.use_greengrass);
//! assert_eq!(config.settings.brake_servo.on_position, 6.5);
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::brake::{BrakeCalibration, BrakeSettings, BrakeTiming, DutyBounds};
use crate::shadow::RetryPolicy;
use crate::telemetry::IdleBackoff;
use crate::topics::DeviceIdentity;

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid JSON or is missing a required key.
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is out of range.
    #[error("invalid config value `{field}`: {reason}")]
    Invalid {
        /// Dotted key of the offending field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

// ============================================================================
// Main Config
// ============================================================================

/// Complete device configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Directory holding certificates and the Greengrass host cache.
    pub certs_path: PathBuf,
    /// Identity and broker endpoint.
    pub device_thing: DeviceThingConfig,
    /// Connection, shadow, and telemetry timing.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Actuator and sensor settings.
    #[serde(default)]
    pub settings: SettingsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            certs_path: PathBuf::from("certs"),
            device_thing: DeviceThingConfig::default(),
            runtime: RuntimeConfig::default(),
            settings: SettingsConfig::default(),
        }
    }
}

impl Config {
    /// Parse a configuration from a JSON string and validate it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_thing.thing_name.trim().is_empty() {
            return Err(invalid("deviceThing.thingName", "must not be empty"));
        }
        if self.settings.vibration.data_sample_cnt == 0 {
            return Err(invalid("settings.vibration.dataSampleCnt", "must be positive"));
        }
        if self.settings.vibration.calibration_samples == 0 {
            return Err(invalid(
                "settings.vibration.calibrationSamples",
                "must be positive",
            ));
        }
        let limit = self.settings.vibration.limit;
        if !limit.is_finite() || limit <= 0.0 {
            return Err(invalid("settings.vibration.limit", "must be a positive number"));
        }

        let servo = &self.settings.brake_servo;
        if servo.min_duty.partial_cmp(&servo.max_duty) != Some(std::cmp::Ordering::Less) {
            return Err(invalid("settings.brakeServo.minDuty", "must be below maxDuty"));
        }
        let bounds = servo.min_duty..=servo.max_duty;
        if !bounds.contains(&servo.on_position) {
            return Err(invalid(
                "settings.brakeServo.onPosition",
                format!("{} outside {}..={}", servo.on_position, servo.min_duty, servo.max_duty),
            ));
        }
        if !bounds.contains(&servo.off_position) {
            return Err(invalid(
                "settings.brakeServo.offPosition",
                format!("{} outside {}..={}", servo.off_position, servo.min_duty, servo.max_duty),
            ));
        }

        if self.runtime.telemetry.publish_interval_sec == 0 {
            return Err(invalid("runtime.telemetry.publishIntervalSec", "must be positive"));
        }
        if self.runtime.telemetry.sample_spacing_ms == 0 {
            return Err(invalid("runtime.telemetry.sampleSpacingMs", "must be positive"));
        }
        if self.runtime.connection.timeout_sec == 0 {
            return Err(invalid("runtime.connection.timeoutSec", "must be positive"));
        }
        if self.runtime.connection.use_greengrass && self.device_thing.gg_host.trim().is_empty() {
            return Err(invalid("deviceThing.ggHost", "required when useGreengrass is set"));
        }
        Ok(())
    }

    /// Set the thing name.
    pub fn with_thing_name(mut self, name: &str) -> Self {
        self.device_thing.thing_name = name.into();
        self
    }

    /// Set the certificate directory.
    pub fn with_certs_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.certs_path = path.into();
        self
    }

    /// Set the brake calibration.
    pub fn with_brake_positions(mut self, on_position: f32, off_position: f32) -> Self {
        self.settings.brake_servo.on_position = on_position;
        self.settings.brake_servo.off_position = off_position;
        self
    }

    /// Set the number of vibration samples per publish.
    pub fn with_sample_count(mut self, count: u32) -> Self {
        self.settings.vibration.data_sample_cnt = count;
        self
    }

    /// Set the initial vibration limit.
    pub fn with_vibration_limit(mut self, limit: f32) -> Self {
        self.settings.vibration.limit = limit;
        self
    }

    /// Enable or disable local auto-braking on unsafe vibration.
    pub fn with_auto_brake(mut self, enabled: bool) -> Self {
        self.settings.vibration.auto_brake = enabled;
        self
    }

    /// Set the shadow update retry ceiling.
    pub fn with_shadow_retries(mut self, retries: u32) -> Self {
        self.runtime.shadow.retry_limit = retries;
        self
    }

    /// Route the connection through a Greengrass core at `gg_host`.
    pub fn with_greengrass(mut self, gg_host: &str) -> Self {
        self.runtime.connection.use_greengrass = true;
        self.device_thing.gg_host = gg_host.into();
        self
    }

    // ------------------------------------------------------------------------
    // Derived settings
    // ------------------------------------------------------------------------

    /// Identity used for topics and telemetry.
    pub fn identity(&self) -> DeviceIdentity {
        let thing = &self.device_thing;
        DeviceIdentity {
            thing_name: thing.thing_name.trim().to_string(),
            device_id: thing
                .device_id
                .clone()
                .unwrap_or_else(|| thing.thing_name.trim().to_string()),
            group: thing.group.clone(),
            device_class: thing.device_class.clone(),
        }
    }

    /// Brake calibration, bounds, and settle times.
    pub fn brake_settings(&self) -> BrakeSettings {
        let servo = &self.settings.brake_servo;
        BrakeSettings {
            calibration: BrakeCalibration {
                on_position: servo.on_position,
                off_position: servo.off_position,
            },
            bounds: DutyBounds {
                min: servo.min_duty,
                max: servo.max_duty,
            },
            timing: BrakeTiming {
                on_settle_ms: servo.on_settle_ms,
                off_settle_ms: servo.off_settle_ms,
                return_settle_ms: servo.return_settle_ms,
            },
        }
    }

    /// Shadow update retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.runtime.shadow.retry_limit,
            retry_delay_ms: self.runtime.shadow.retry_delay_ms,
        }
    }

    /// Idle throttling used when the rotor is stationary.
    pub fn idle_backoff(&self) -> IdleBackoff {
        IdleBackoff {
            poll_interval_ms: self.runtime.telemetry.idle_poll_sec * 1000,
            max_polls: self.runtime.telemetry.idle_poll_count,
        }
    }

    /// Absolute path of the root CA file.
    pub fn ca_file(&self) -> PathBuf {
        self.certs_path.join(&self.device_thing.ca_path)
    }

    /// Absolute path of the device certificate.
    pub fn cert_file(&self) -> PathBuf {
        self.certs_path.join(&self.device_thing.cert_path)
    }

    /// Absolute path of the device private key.
    pub fn key_file(&self) -> PathBuf {
        self.certs_path.join(&self.device_thing.key_path)
    }

    /// Where the Greengrass group CA is written after discovery.
    pub fn group_ca_file(&self) -> PathBuf {
        self.certs_path.join("gg-group-ca.pem")
    }

    /// Where the last working Greengrass host is cached.
    pub fn host_cache_file(&self) -> PathBuf {
        self.certs_path.join("gg-last-host.json")
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ============================================================================
// Device Thing
// ============================================================================

/// Thing identity, certificate file names, and broker endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceThingConfig {
    /// Registered thing name.
    pub thing_name: String,
    /// Root CA file, relative to `certsPath`.
    #[serde(default)]
    pub ca_path: String,
    /// Device certificate file, relative to `certsPath`.
    #[serde(default)]
    pub cert_path: String,
    /// Private key file, relative to `certsPath`.
    #[serde(default)]
    pub key_path: String,
    /// Broker hostname.
    #[serde(default)]
    pub end_point: String,
    /// Broker port.
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    /// Greengrass discovery host.
    #[serde(default)]
    pub gg_host: String,
    /// Device ID in telemetry; defaults to the thing name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Topic group segment.
    #[serde(default = "default_group")]
    pub group: String,
    /// Topic device-class segment.
    #[serde(default = "default_device_class")]
    pub device_class: String,
}

impl Default for DeviceThingConfig {
    fn default() -> Self {
        Self {
            thing_name: "turbine-sim".into(),
            ca_path: "root.ca.pem".into(),
            cert_path: "certificate.pem.crt".into(),
            key_path: "private.pem.key".into(),
            end_point: "localhost".into(),
            mqtt_port: default_mqtt_port(),
            gg_host: String::new(),
            device_id: None,
            group: default_group(),
            device_class: default_device_class(),
        }
    }
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_group() -> String {
    "windfarm".into()
}

fn default_device_class() -> String {
    "turbine".into()
}

// ============================================================================
// Runtime
// ============================================================================

/// Timing for connection, shadow updates, and telemetry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Broker connection.
    pub connection: ConnectionSettings,
    /// Shadow update retries.
    pub shadow: ShadowSettings,
    /// Telemetry cadence.
    pub telemetry: TelemetrySettings,
}

/// Broker connection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionSettings {
    /// Per-attempt connect timeout.
    pub timeout_sec: u64,
    /// Connect attempts per `connect` call.
    pub retry_limit: u32,
    /// Connect through a Greengrass core instead of the cloud endpoint.
    #[serde(deserialize_with = "bool_or_yes_no")]
    pub use_greengrass: bool,
    /// MQTT keep-alive.
    pub keep_alive_sec: u64,
    /// First reconnect delay.
    pub reconnect_initial_sec: u64,
    /// Reconnect delay ceiling.
    pub reconnect_max_sec: u64,
    /// Discovery request attempts.
    pub discovery_attempts: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeout_sec: 10,
            retry_limit: 3,
            use_greengrass: false,
            keep_alive_sec: 30,
            reconnect_initial_sec: 1,
            reconnect_max_sec: 20,
            discovery_attempts: 5,
        }
    }
}

/// Shadow update retry settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShadowSettings {
    /// Retries after the first failed attempt.
    pub retry_limit: u32,
    /// Pause between attempts.
    pub retry_delay_ms: u64,
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self {
            retry_limit: 10,
            retry_delay_ms: 1000,
        }
    }
}

/// Telemetry cadence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TelemetrySettings {
    /// Initial `data_fast_interval` (seconds).
    pub publish_interval_sec: u32,
    /// Pause between vibration samples.
    pub sample_spacing_ms: u64,
    /// Pause between idle speed polls.
    pub idle_poll_sec: u64,
    /// Maximum idle speed polls.
    pub idle_poll_count: u32,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            publish_interval_sec: 5,
            sample_spacing_ms: 100,
            idle_poll_sec: 5,
            idle_poll_count: 12,
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Actuator and sensor settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SettingsConfig {
    /// Brake servo calibration.
    pub brake_servo: BrakeServoSettings,
    /// Vibration sampling.
    pub vibration: VibrationSettings,
}

/// Brake servo calibration and settle times.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrakeServoSettings {
    /// Duty cycle for the applied brake.
    pub on_position: f32,
    /// Duty cycle for the released brake.
    pub off_position: f32,
    /// Lowest duty cycle the servo accepts.
    pub min_duty: f32,
    /// Highest duty cycle the servo accepts.
    pub max_duty: f32,
    /// Settle time after moving to `onPosition`.
    pub on_settle_ms: u64,
    /// Settle time after moving to `offPosition`.
    pub off_settle_ms: u64,
    /// Settle time when a timed move returns to off.
    pub return_settle_ms: u64,
}

impl Default for BrakeServoSettings {
    fn default() -> Self {
        Self {
            on_position: 6.5,
            off_position: 7.5,
            min_duty: 2.5,
            max_duty: 12.5,
            on_settle_ms: 3000,
            off_settle_ms: 1000,
            return_settle_ms: 500,
        }
    }
}

/// Vibration sampling and safety settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VibrationSettings {
    /// Samples per publish in Normal and Cheaper mode.
    pub data_sample_cnt: u32,
    /// Initial `vibe_limit`.
    pub limit: f32,
    /// Samples averaged per axis during calibration.
    pub calibration_samples: u32,
    /// Apply the brake locally when vibration is unsafe.
    pub auto_brake: bool,
}

impl Default for VibrationSettings {
    fn default() -> Self {
        Self {
            data_sample_cnt: 50,
            limit: 5.0,
            calibration_samples: 20,
            auto_brake: true,
        }
    }
}

fn bool_or_yes_no<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "yes" | "y" | "true" | "on" | "1" => Ok(true),
            "no" | "n" | "false" | "off" | "0" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected yes/no, got `{other}`"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "certsPath": "/home/pi/certs",
        "deviceThing": {
            "thingName": " turbine-1 ",
            "caPath": "root.ca.pem",
            "certPath": "cert.pem",
            "keyPath": "private.key",
            "endPoint": "abc-ats.iot.us-east-1.amazonaws.com",
            "mqttPort": 8883,
            "ggHost": "greengrass.iot.us-east-1.amazonaws.com"
        },
        "runtime": {
            "connection": { "timeoutSec": 10, "retryLimit": 5, "useGreengrass": "yes" }
        },
        "settings": {
            "brakeServo": { "onPosition": 6.0, "offPosition": 8.0 },
            "vibration": { "dataSampleCnt": 25 }
        }
    }"#;

    // ========================================================================
    // Parsing
    // ========================================================================

    #[test]
    fn parses_device_layout() {
        let config = Config::from_json(MINIMAL).unwrap();
        assert_eq!(config.certs_path, PathBuf::from("/home/pi/certs"));
        assert_eq!(config.runtime.connection.retry_limit, 5);
        assert!(config.runtime.connection.use_greengrass);
        assert_eq!(config.settings.brake_servo.on_position, 6.0);
        assert_eq!(config.settings.brake_servo.off_position, 8.0);
        assert_eq!(config.settings.vibration.data_sample_cnt, 25);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config = Config::from_json(MINIMAL).unwrap();
        assert_eq!(config.runtime.shadow, ShadowSettings::default());
        assert_eq!(config.runtime.telemetry, TelemetrySettings::default());
        assert_eq!(config.settings.vibration.limit, 5.0);
        assert_eq!(config.settings.brake_servo.on_settle_ms, 3000);
        assert_eq!(config.device_thing.group, "windfarm");
    }

    #[test]
    fn use_greengrass_accepts_bool() {
        let json = MINIMAL.replace("\"yes\"", "false");
        let config = Config::from_json(&json).unwrap();
        assert!(!config.runtime.connection.use_greengrass);
    }

    #[test]
    fn use_greengrass_rejects_garbage() {
        let json = MINIMAL.replace("\"yes\"", "\"maybe\"");
        assert!(matches!(Config::from_json(&json), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_device_thing_is_parse_error() {
        let result = Config::from_json(r#"{ "certsPath": "/tmp" }"#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let result = Config::load("/definitely/not/here.json");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn rejects_empty_thing_name() {
        let config = Config::default().with_thing_name("  ");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "deviceThing.thingName", .. })
        ));
    }

    #[test]
    fn rejects_zero_sample_count() {
        let config = Config::default().with_sample_count(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_calibration_outside_bounds() {
        let config = Config::default().with_brake_positions(1.0, 7.5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "settings.brakeServo.onPosition", .. })
        ));
    }

    #[test]
    fn rejects_non_positive_limit() {
        assert!(Config::default().with_vibration_limit(0.0).validate().is_err());
        assert!(Config::default().with_vibration_limit(f32::NAN).validate().is_err());
    }

    #[test]
    fn rejects_zero_connect_timeout() {
        let mut config = Config::default();
        config.runtime.connection.timeout_sec = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "runtime.connection.timeoutSec", .. })
        ));
    }

    #[test]
    fn greengrass_requires_host() {
        let mut config = Config::default();
        config.runtime.connection.use_greengrass = true;
        assert!(config.validate().is_err());
        assert!(Config::default().with_greengrass("gg.local").validate().is_ok());
    }

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    // ========================================================================
    // Derived settings
    // ========================================================================

    #[test]
    fn identity_trims_and_defaults_device_id() {
        let identity = Config::from_json(MINIMAL).unwrap().identity();
        assert_eq!(identity.thing_name, "turbine-1");
        assert_eq!(identity.device_id, "turbine-1");
        assert_eq!(identity.device_class, "turbine");
    }

    #[test]
    fn cert_paths_are_relative_to_certs_path() {
        let config = Config::from_json(MINIMAL).unwrap();
        assert_eq!(config.ca_file(), PathBuf::from("/home/pi/certs/root.ca.pem"));
        assert_eq!(config.key_file(), PathBuf::from("/home/pi/certs/private.key"));
        assert_eq!(
            config.host_cache_file(),
            PathBuf::from("/home/pi/certs/gg-last-host.json")
        );
    }

    #[test]
    fn derived_policies_follow_runtime() {
        let config = Config::default().with_shadow_retries(4);
        assert_eq!(config.retry_policy().max_retries, 4);
        assert_eq!(config.retry_policy().retry_delay_ms, 1000);
        assert_eq!(config.idle_backoff().poll_interval_ms, 5000);
        assert_eq!(config.idle_backoff().max_polls, 12);
    }
}
