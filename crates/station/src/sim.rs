//! Stateful simulator standing in for the soil probe, the climate sensor and
//! the battery divider during development.
//!
//! The soil model follows a capacitive probe:
//! - random walk with mean reversion (readings are temporally coherent)
//! - steady drying drift between cycles
//! - per-reading ADC noise and occasional spikes
//! - closed loop: running the pump moves the reading toward the wet end

use std::fmt;

use crate::error::SensorError;
use crate::sensors::{Climate, Sensors};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6 ≈ N(0,1).
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via `sensors.scenario`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries steadily; the station waters every few
    /// cycles.
    Drying,
    /// Hovers near the centre with little noise.
    Stable,
    /// Heavy noise and frequent spikes.
    Flaky,
    /// Starts near the wet end and barely dries; the pump should stay off.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct StationSim {
    /// "True" soil state in ADC units.
    base: f64,
    raw_dry: f64,
    raw_wet: f64,
    center: f64,

    drift_per_read: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    spike_prob: f32,
    spike_sigma: f64,

    /// ADC units per second of pumping (toward `raw_wet`).
    wet_per_pump_sec: f64,

    /// Battery tap voltage; sags slowly with every read.
    tap_volts: f64,
}

impl StationSim {
    pub fn new(scenario: Scenario, raw_dry: u16, raw_wet: u16) -> Self {
        let (raw_dry, raw_wet) = (f64::from(raw_dry), f64::from(raw_wet));
        let range = raw_dry - raw_wet;

        // start_frac: 0.0 = at raw_wet, 1.0 = at raw_dry
        let (drift, walk_sigma, mean_rev, noise_sigma, spike_prob, spike_sigma, start_frac) =
            match scenario {
                Scenario::Drying => (0.02, 0.01, 0.0, 0.006, 0.03_f32, 0.15, 0.6),
                Scenario::Stable => (0.0, 0.004, 0.05, 0.003, 0.005, 0.07, 0.5),
                Scenario::Flaky => (0.01, 0.02, 0.02, 0.015, 0.10, 0.2, 0.5),
                Scenario::Wet => (0.002, 0.005, 0.02, 0.004, 0.02, 0.1, 0.15),
            };

        tracing::info!(%scenario, "[sim] sensors initialised (no hardware)");

        Self {
            base: raw_wet + start_frac * range,
            raw_dry,
            raw_wet,
            center: raw_wet + 0.5 * range,
            drift_per_read: drift * range,
            walk_sigma: walk_sigma * range,
            mean_reversion: mean_rev,
            noise_sigma: noise_sigma * range,
            spike_prob,
            spike_sigma: spike_sigma * range,
            wet_per_pump_sec: 0.04 * range,
            tap_volts: 2.75,
        }
    }

    /// Bounds of the physically possible reading, whichever way the probe's
    /// calibration runs.
    fn limits(&self) -> (f64, f64) {
        (self.raw_dry.min(self.raw_wet), self.raw_dry.max(self.raw_wet))
    }

    fn next_soil(&mut self) -> u16 {
        let pull = self.mean_reversion * (self.center - self.base);
        let walk = gaussian(0.0, self.walk_sigma);
        let (lo, hi) = self.limits();
        let margin = (hi - lo) * 0.05;
        self.base = (self.base + self.drift_per_read + pull + walk).clamp(lo - margin, hi + margin);

        let noise = gaussian(0.0, self.noise_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        (self.base + noise + spike).round().clamp(0.0, f64::from(u16::MAX)) as u16
    }
}

impl Sensors for StationSim {
    fn soil_raw(&mut self) -> Result<u16, SensorError> {
        Ok(self.next_soil())
    }

    fn climate(&mut self) -> Result<Climate, SensorError> {
        Ok(Climate {
            temperature: (gaussian(21.0, 1.5) * 10.0).round() / 10.0,
            humidity: gaussian(55.0, 5.0).clamp(0.0, 100.0).round(),
        })
    }

    fn battery_tap_volts(&mut self) -> Result<f64, SensorError> {
        self.tap_volts = (self.tap_volts - 0.00005).max(2.0);
        Ok(self.tap_volts + gaussian(0.0, 0.01))
    }

    fn pump_ran(&mut self, seconds: u32) {
        let (lo, hi) = self.limits();
        self.base = (self.base - self.wet_per_pump_sec * f64::from(seconds)).clamp(lo, hi);
        tracing::debug!(base = format!("{:.0}", self.base), "[sim] soil watered");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
