//! Static station settings: TOML file loading, environment overrides and
//! validation.
//!
//! These are the values that only change when the station is re-flashed or
//! re-wired (broker, pins, calibration, timings).  The remotely tunable
//! irrigation parameters live in [`crate::store`].

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mqtt: MqttSettings,
    pub time: TimeSettings,
    pub storage: StorageSettings,
    pub pins: PinSettings,
    pub power: PowerSettings,
    pub sensors: SensorSettings,
    pub recovery: RecoverySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub keep_alive_sec: u64,
    pub telemetry_topic: String,
    pub connect_timeout_sec: u64,
    /// A drain pass ends once the broker has been quiet for this long.
    pub drain_quiet_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSourceKind {
    Ntp,
    System,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeSettings {
    pub source: TimeSourceKind,
    pub ntp_server: String,
    pub timeout_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub config_path: PathBuf,
    pub log_path: PathBuf,
}

/// BCM 0/1 carry the HAT ID EEPROM and must never be used, whatever
/// `pins.reserved` says.
pub const ID_EEPROM_PINS: [u8; 2] = [0, 1];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PinSettings {
    pub soil_power: u8,
    pub climate_power: u8,
    pub pump: u8,
    pub status_led: u8,
    /// Relay boards that switch on a LOW input.
    pub pump_active_low: bool,
    /// Communication interfaces (I2C, UART) that must never be reconfigured.
    pub reserved: Vec<u8>,
    /// Sensor data inputs: floated during idle but never driven on wake.
    pub inputs: Vec<u8>,
    pub pin_count: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PowerSettings {
    pub full_clock_hz: u32,
    pub idle_clock_hz: u32,
    /// sysfs `scaling_max_freq` file; when unset the clock is left alone.
    pub cpufreq_path: Option<PathBuf>,
    pub quantum_sec: u64,
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    pub raw_dry: u16,
    pub raw_wet: u16,
    pub battery_samples: u32,
    pub battery_interval_ms: u64,
    pub voltage_divider: f64,
    pub warmup_sec: u64,
    pub i2c_addr: u16,
    pub soil_channel: usize,
    pub battery_channel: usize,
    pub scenario: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub reset_delay_sec: u64,
    pub link_attempts: u32,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "irrigation-station".into(),
            username: None,
            password: None,
            tls: false,
            keep_alive_sec: 30,
            telemetry_topic: "picoW/sensor".into(),
            connect_timeout_sec: 10,
            drain_quiet_ms: 1500,
        }
    }
}

impl Default for TimeSettings {
    fn default() -> Self {
        Self {
            source: TimeSourceKind::Ntp,
            ntp_server: "pool.ntp.org".into(),
            timeout_sec: 5,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("settings.json"),
            log_path: PathBuf::from("logfile.txt"),
        }
    }
}

impl Default for PinSettings {
    fn default() -> Self {
        // BCM numbering; 0/1 are the ID EEPROM, 2/3 carry the ADS1115 I2C
        // bus, 14/15 the UART console.
        Self {
            soil_power: 22,
            climate_power: 23,
            pump: 17,
            status_led: 24,
            pump_active_low: false,
            reserved: vec![0, 1, 2, 3, 14, 15],
            inputs: vec![4],
            pin_count: 28,
        }
    }
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self {
            full_clock_hz: 1_200_000_000,
            idle_clock_hz: 600_000_000,
            cpufreq_path: None,
            quantum_sec: 60,
            settle_ms: 500,
        }
    }
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            raw_dry: 26000,
            raw_wet: 12000,
            battery_samples: 20,
            battery_interval_ms: 500,
            voltage_divider: 1.519,
            warmup_sec: 5,
            i2c_addr: 0x48,
            soil_channel: 0,
            battery_channel: 1,
            scenario: "drying".into(),
        }
    }
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            reset_delay_sec: 5,
            link_attempts: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl PinSettings {
    /// Pins the station drives itself.
    pub fn managed(&self) -> [(&'static str, u8); 4] {
        [
            ("soil_power", self.soil_power),
            ("climate_power", self.climate_power),
            ("pump", self.pump),
            ("status_led", self.status_led),
        ]
    }
}

impl Settings {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_pins(&mut errors);
        self.validate_power(&mut errors);
        self.validate_sensors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }
        if m.telemetry_topic.trim().is_empty() {
            errors.push("mqtt.telemetry_topic is empty".into());
        }
        if m.connect_timeout_sec == 0 {
            errors.push("mqtt.connect_timeout_sec must be positive".into());
        }
        if m.username.is_some() != m.password.is_some() {
            errors.push("mqtt.username and mqtt.password must be set together".into());
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let p = &self.pins;
        let mut seen: HashSet<u8> = HashSet::new();

        for (name, pin) in p.managed() {
            if pin >= p.pin_count {
                errors.push(format!(
                    "pins.{name} {pin} is outside the header (pin_count {})",
                    p.pin_count
                ));
            }
            if ID_EEPROM_PINS.contains(&pin) {
                errors.push(format!("pins.{name} {pin} is reserved for the ID EEPROM"));
            } else if p.reserved.contains(&pin) {
                errors.push(format!("pins.{name} {pin} is listed in pins.reserved"));
            }
            if p.inputs.contains(&pin) {
                errors.push(format!("pins.{name} {pin} is listed in pins.inputs"));
            }
            if !seen.insert(pin) {
                errors.push(format!("pins.{name} {pin} is already used by another output"));
            }
        }

        for pin in p.inputs.iter().filter(|pin| ID_EEPROM_PINS.contains(*pin)) {
            errors.push(format!("pins.inputs {pin} is reserved for the ID EEPROM"));
        }

        for pin in p.reserved.iter().chain(&p.inputs) {
            if *pin >= p.pin_count {
                errors.push(format!(
                    "pin {pin} is outside the header (pin_count {})",
                    p.pin_count
                ));
            }
        }
    }

    fn validate_power(&self, errors: &mut Vec<String>) {
        let p = &self.power;
        if p.quantum_sec == 0 {
            errors.push("power.quantum_sec must be positive".into());
        }
        if p.idle_clock_hz == 0 {
            errors.push("power.idle_clock_hz must be positive".into());
        }
        if p.idle_clock_hz > p.full_clock_hz {
            errors.push(format!(
                "power.idle_clock_hz ({}) exceeds power.full_clock_hz ({})",
                p.idle_clock_hz, p.full_clock_hz
            ));
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let s = &self.sensors;
        if s.raw_dry == s.raw_wet {
            errors.push(format!(
                "sensors.raw_dry and sensors.raw_wet are both {}: calibration range is zero",
                s.raw_dry
            ));
        }
        if s.battery_samples == 0 {
            errors.push("sensors.battery_samples must be positive".into());
        }
        if s.voltage_divider.is_nan() || s.voltage_divider <= 0.0 {
            errors.push(format!(
                "sensors.voltage_divider must be positive, got {}",
                s.voltage_divider
            ));
        }
        if s.soil_channel == s.battery_channel {
            errors.push(format!(
                "sensors.soil_channel and sensors.battery_channel are both {}",
                s.soil_channel
            ));
        }
    }

    /// Apply `MQTT_HOST` / `MQTT_PORT` / `MQTT_CLIENT_ID` on top of the file.
    fn apply_env(&mut self) {
        if let Ok(host) = env::var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Ok(id) = env::var("MQTT_CLIENT_ID") {
            self.mqtt.client_id = id;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML settings file.  A missing file yields the
/// built-in defaults.
pub fn load(path: &Path) -> Result<Settings> {
    let mut settings = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse settings: {}", path.display()))?
    } else {
        tracing::warn!(path = %path.display(), "settings file not found, using defaults");
        Settings::default()
    };

    settings.apply_env();
    settings
        .validate()
        .with_context(|| format!("invalid settings: {}", path.display()))?;
    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================
