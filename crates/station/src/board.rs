//! GPIO and CPU clock control.  The `gpio` feature gates the real rppal
//! driver; without it, a simulated board keeps pin state in memory and logs
//! changes.

use std::collections::HashMap;

use crate::error::BoardError;

/// Electrical state of a GPIO pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Low,
    High,
    /// Input without pulls: the pin sources no current.
    Floating,
}

/// The hardware capability [`crate::power::PowerCycle`] needs.
pub trait Board {
    /// Configure `pin` as an output and drive it.
    fn drive(&mut self, pin: u8, high: bool) -> Result<(), BoardError>;

    /// Configure `pin` as a floating input.
    fn release(&mut self, pin: u8) -> Result<(), BoardError>;

    fn set_cpu_hz(&mut self, hz: u32) -> Result<(), BoardError>;
}

// ---------------------------------------------------------------------------
// Simulated board (development and tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SimBoard {
    pub(crate) pins: HashMap<u8, PinMode>,
    pub(crate) cpu_hz: u32,
}

impl SimBoard {
    pub fn new() -> Self {
        tracing::info!("[sim-gpio] board initialised (no hardware)");
        Self::default()
    }

    #[cfg(test)]
    pub fn mode(&self, pin: u8) -> Option<PinMode> {
        self.pins.get(&pin).copied()
    }
}

impl Board for SimBoard {
    fn drive(&mut self, pin: u8, high: bool) -> Result<(), BoardError> {
        let mode = if high { PinMode::High } else { PinMode::Low };
        if self.pins.insert(pin, mode) != Some(mode) {
            tracing::trace!(pin, ?mode, "[sim-gpio] drive");
        }
        Ok(())
    }

    fn release(&mut self, pin: u8) -> Result<(), BoardError> {
        self.pins.insert(pin, PinMode::Floating);
        Ok(())
    }

    fn set_cpu_hz(&mut self, hz: u32) -> Result<(), BoardError> {
        tracing::debug!(hz, "[sim-gpio] cpu clock");
        self.cpu_hz = hz;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Real GPIO board (requires rppal on Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub use self::gpio::GpioBoard;

#[cfg(feature = "gpio")]
mod gpio {
    use super::*;
    use rppal::gpio::{Gpio, InputPin, OutputPin};
    use std::path::PathBuf;

    enum Held {
        Output(OutputPin),
        // Held only so rppal keeps the pin configured as an input.
        #[allow(dead_code)]
        Input(InputPin),
    }

    pub struct GpioBoard {
        gpio: Gpio,
        pins: HashMap<u8, Held>,
        cpufreq_path: Option<PathBuf>,
    }

    impl GpioBoard {
        pub fn new(cpufreq_path: Option<PathBuf>) -> anyhow::Result<Self> {
            let gpio = Gpio::new()?;
            tracing::info!(cpufreq = ?cpufreq_path, "gpio board initialised");
            Ok(Self {
                gpio,
                pins: HashMap::new(),
                cpufreq_path,
            })
        }

        fn pin_err(pin: u8, e: impl std::fmt::Display) -> BoardError {
            BoardError::Pin {
                pin,
                detail: e.to_string(),
            }
        }
    }

    impl Board for GpioBoard {
        fn drive(&mut self, pin: u8, high: bool) -> Result<(), BoardError> {
            if let Some(Held::Output(out)) = self.pins.get_mut(&pin) {
                if high {
                    out.set_high();
                } else {
                    out.set_low();
                }
                return Ok(());
            }

            // An input handle has to be dropped before the pin can be
            // re-acquired.
            self.pins.remove(&pin);
            let p = self.gpio.get(pin).map_err(|e| Self::pin_err(pin, e))?;
            let mut out = if high {
                p.into_output_high()
            } else {
                p.into_output_low()
            };
            // Keep the level when the handle goes away.
            out.set_reset_on_drop(false);
            self.pins.insert(pin, Held::Output(out));
            Ok(())
        }

        fn release(&mut self, pin: u8) -> Result<(), BoardError> {
            if matches!(self.pins.get(&pin), Some(Held::Input(_))) {
                return Ok(());
            }
            self.pins.remove(&pin);
            let mut input = self
                .gpio
                .get(pin)
                .map_err(|e| Self::pin_err(pin, e))?
                .into_input();
            input.set_reset_on_drop(false);
            self.pins.insert(pin, Held::Input(input));
            Ok(())
        }

        fn set_cpu_hz(&mut self, hz: u32) -> Result<(), BoardError> {
            let Some(path) = &self.cpufreq_path else {
                return Ok(());
            };
            // cpufreq takes kHz.
            std::fs::write(path, (hz / 1000).to_string())
                .map_err(|e| BoardError::Clock(format!("{}: {e}", path.display())))?;
            tracing::debug!(hz, "cpu clock set");
            Ok(())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
