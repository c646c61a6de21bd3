//! Sensor acquisition: soil moisture, climate and battery voltage.
//!
//! Backends ([`crate::adc`] on hardware, [`crate::sim`] for development)
//! only deliver raw readings; calibration and averaging happen here.

use std::time::Duration;

use tokio::time::sleep;

use crate::config::SensorSettings;
use crate::error::SensorError;

/// Raw readings from one backend.
pub trait Sensors {
    /// Soil probe reading in ADC counts.
    fn soil_raw(&mut self) -> Result<u16, SensorError>;

    fn climate(&mut self) -> Result<Climate, SensorError>;

    /// Voltage at the battery divider tap (before divider correction).
    fn battery_tap_volts(&mut self) -> Result<f64, SensorError>;

    /// Told after the pump has run; only the simulator cares.
    fn pump_ran(&mut self, _seconds: u32) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Climate {
    pub temperature: f64,
    pub humidity: f64,
}

/// One cycle's worth of readings.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSample {
    pub moisture_percent: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub battery_voltage: f64,
    /// Local ISO-8601 time the sample was taken.
    pub timestamp: String,
}

/// Map a raw probe reading onto 0–100 % using the dry/wet calibration
/// endpoints: `raw_dry` is 0 %, `raw_wet` is 100 %.  Readings beyond either
/// endpoint are clamped.
pub fn moisture_percent(raw: u16, raw_dry: u16, raw_wet: u16) -> f64 {
    let range = f64::from(raw_wet) - f64::from(raw_dry);
    if range == 0.0 {
        return 0.0; // degenerate calibration
    }
    let pct = (f64::from(raw) - f64::from(raw_dry)) * 100.0 / range;
    pct.clamp(0.0, 100.0)
}

/// Calibrated access to a backend.
pub struct SensorSuite<S> {
    backend: S,
    settings: SensorSettings,
}

impl<S: Sensors> SensorSuite<S> {
    pub fn new(backend: S, settings: SensorSettings) -> Self {
        Self { backend, settings }
    }

    /// Time to wait after powering the rails before the first read.
    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.settings.warmup_sec)
    }

    pub fn read_moisture(&mut self) -> Result<f64, SensorError> {
        let raw = self.backend.soil_raw()?;
        let pct = moisture_percent(raw, self.settings.raw_dry, self.settings.raw_wet);
        tracing::debug!(raw, moisture = format!("{pct:.2}"), "soil moisture");
        Ok(pct)
    }

    pub fn read_climate(&mut self) -> Result<Climate, SensorError> {
        self.backend.climate()
    }

    /// Average several tap readings to ride out ADC noise, then undo the
    /// voltage divider.
    pub async fn read_battery(&mut self) -> Result<f64, SensorError> {
        let samples = self.settings.battery_samples.max(1);
        let interval = Duration::from_millis(self.settings.battery_interval_ms);

        let mut total = 0.0;
        for i in 0..samples {
            total += self.backend.battery_tap_volts()?;
            if i + 1 < samples {
                sleep(interval).await;
            }
        }

        let volts = total / f64::from(samples) * self.settings.voltage_divider;
        if !volts.is_finite() || volts < 0.0 {
            return Err(SensorError::Implausible {
                sensor: "battery",
                value: volts,
            });
        }
        tracing::debug!(volts = format!("{volts:.2}"), samples, "battery level");
        Ok(volts)
    }

    /// Read everything in the order the hardware expects.
    pub async fn measure(&mut self, timestamp: String) -> Result<MeasurementSample, SensorError> {
        let moisture_percent = self.read_moisture()?;
        let climate = self.read_climate()?;
        let battery_voltage = self.read_battery().await?;
        Ok(MeasurementSample {
            moisture_percent,
            temperature: climate.temperature,
            humidity: climate.humidity,
            battery_voltage,
            timestamp,
        })
    }

    pub fn pump_ran(&mut self, seconds: u32) {
        self.backend.pump_ran(seconds);
    }

    #[cfg(test)]
    pub(crate) fn backend(&self) -> &S {
        &self.backend
    }
}

// ===========================================================================
// Tests
// ===========================================================================
