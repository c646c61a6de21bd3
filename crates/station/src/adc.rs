//! ADS1115 16-bit ADC over I2C: soil probe on one single-ended input, the
//! battery divider tap on another.
//!
//! Reads at PGA ±4.096 V, 128 SPS, single-shot mode.  The default soil
//! calibration (`raw_dry ≈ 26000`, `raw_wet ≈ 12000`) matches a capacitive
//! probe powered from 3.3 V at this gain.

use rppal::i2c::I2c;
use std::{thread, time::Duration};

use crate::error::SensorError;
use crate::sensors::{Climate, Sensors};

// ── Registers ───────────────────────────────────────────────────────────────

const REG_CONVERSION: u8 = 0x00;
const REG_CONFIG: u8 = 0x01;

// Config register, MSB first:
//   [15] OS  [14:12] MUX  [11:9] PGA  [8] MODE  [7:5] DR  [4:0] comparator
//
// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot), DR=100 (128 SPS),
// COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

const MAX_CHANNEL: usize = 3;

/// Full-scale voltage for PGA=001.
const FULL_SCALE_VOLTS: f64 = 4.096;

/// ~7.8 ms conversion at 128 SPS, plus margin.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

const OS_READY_BIT: u16 = 1 << 15;

fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

/// Convert a single-ended conversion result to volts at the input pin.
fn counts_to_volts(raw: u16) -> f64 {
    f64::from(raw) * FULL_SCALE_VOLTS / 32768.0
}

// ── Driver ──────────────────────────────────────────────────────────────────

pub struct Ads1115Sensors {
    i2c: I2c,
    soil_channel: usize,
    battery_channel: usize,
}

impl Ads1115Sensors {
    /// Open I2C bus 1 and address the ADS1115 at `addr`.
    pub fn new(addr: u16, soil_channel: usize, battery_channel: usize) -> anyhow::Result<Self> {
        for ch in [soil_channel, battery_channel] {
            anyhow::ensure!(
                ch <= MAX_CHANNEL,
                "ADS1115 channel {ch} out of range (0–{MAX_CHANNEL})"
            );
        }

        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;

        tracing::info!(
            addr = format_args!("0x{addr:02x}"),
            soil_channel,
            battery_channel,
            "ads1115 initialised"
        );

        Ok(Self {
            i2c,
            soil_channel,
            battery_channel,
        })
    }

    /// Single-shot conversion on `channel`, clamped to the single-ended range.
    fn read_channel(&mut self, channel: usize) -> Result<u16, rppal::i2c::Error> {
        self.i2c
            .block_write(REG_CONFIG, &config_for_channel(channel).to_be_bytes())?;
        thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        // Single-ended results are non-negative; bus noise can say otherwise.
        Ok(i16::from_be_bytes(buf).max(0) as u16)
    }

    fn read(&mut self, sensor: &'static str, channel: usize) -> Result<u16, SensorError> {
        self.read_channel(channel).map_err(|e| SensorError::Read {
            sensor,
            detail: format!("ads1115 channel {channel}: {e}"),
        })
    }
}

impl Sensors for Ads1115Sensors {
    fn soil_raw(&mut self) -> Result<u16, SensorError> {
        self.read("soil", self.soil_channel)
    }

    /// No climate sensor is wired on the ADC board; the report carries zeros.
    fn climate(&mut self) -> Result<Climate, SensorError> {
        Ok(Climate::default())
    }

    fn battery_tap_volts(&mut self) -> Result<f64, SensorError> {
        self.read("battery", self.battery_channel)
            .map(counts_to_volts)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_register_per_channel() {
        assert_eq!(config_for_channel(0), 0xC383);
        assert_eq!(config_for_channel(1), 0xD383);
        assert_eq!(config_for_channel(2), 0xE383);
        assert_eq!(config_for_channel(3), 0xF383);
    }

    #[test]
    fn config_base_fields() {
        assert_eq!((CONFIG_BASE >> 15) & 1, 1, "OS starts a conversion");
        assert_eq!((CONFIG_BASE >> 9) & 0b111, 0b001, "PGA ±4.096 V");
        assert_eq!((CONFIG_BASE >> 8) & 1, 1, "single-shot");
        assert_eq!((CONFIG_BASE >> 5) & 0b111, 0b100, "128 SPS");
    }

    #[test]
    fn counts_scale_to_full_range() {
        assert_eq!(counts_to_volts(0), 0.0);
        assert!((counts_to_volts(16384) - 2.048).abs() < 1e-9);
        assert!(counts_to_volts(32767) < FULL_SCALE_VOLTS);
    }
}
