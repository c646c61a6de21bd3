//! Power gating for the sensor rails and the pump relay, plus the low-power
//! idle that stands in for hardware deep sleep.
//!
//! ## Low-power idle
//!
//! A single long low-power wait intermittently never resumes on the target
//! board, so the idle is built from three parts that are each known to work:
//!
//! 1. throttle the CPU clock,
//! 2. float every GPIO that is not the status LED, the pump relay or a
//!    reserved pin such as the ID EEPROM or a bus (unpowered pins are most
//!    of the saving),
//! 3. wait in short fixed quanta rather than one long sleep.
//!
//! Keep the quantised wait even if it looks redundant.

use std::time::Duration;

use tokio::time::sleep;

use crate::board::Board;
use crate::config::{PinSettings, PowerSettings, ID_EEPROM_PINS};
use crate::error::BoardError;

pub struct PowerCycle<B> {
    board: B,
    pins: PinSettings,
    full_clock_hz: u32,
    idle_clock_hz: u32,
    quantum: Duration,
    settle: Duration,
}

impl<B: Board> PowerCycle<B> {
    pub fn new(board: B, pins: PinSettings, power: &PowerSettings) -> Self {
        Self {
            board,
            pins,
            full_clock_hz: power.full_clock_hz,
            idle_clock_hz: power.idle_clock_hz,
            quantum: Duration::from_secs(power.quantum_sec),
            settle: Duration::from_millis(power.settle_ms),
        }
    }

    /// Fail-safe boot state: relay off, rails off, LED off, full clock.
    pub fn init(&mut self) -> Result<(), BoardError> {
        self.drive_pump(false)?;
        self.board.drive(self.pins.soil_power, false)?;
        self.board.drive(self.pins.climate_power, false)?;
        self.board.drive(self.pins.status_led, false)?;
        self.board.set_cpu_hz(self.full_clock_hz)
    }

    /// Energise the sensor rails at full clock.  Must precede any sensor read
    /// or pump actuation.
    pub fn wake_peripherals(&mut self) -> Result<(), BoardError> {
        self.board.set_cpu_hz(self.full_clock_hz)?;
        self.board.drive(self.pins.soil_power, true)?;
        self.board.drive(self.pins.climate_power, true)?;
        tracing::debug!("peripherals awake");
        Ok(())
    }

    pub fn sleep_peripherals(&mut self) -> Result<(), BoardError> {
        self.board.drive(self.pins.soil_power, false)?;
        self.board.drive(self.pins.climate_power, false)?;
        tracing::debug!("peripherals asleep");
        Ok(())
    }

    pub fn status_led(&mut self, on: bool) -> Result<(), BoardError> {
        self.board.drive(self.pins.status_led, on)
    }

    /// Close the pump relay for `seconds`.
    pub async fn run_pump(&mut self, seconds: u32) -> Result<(), BoardError> {
        tracing::info!(seconds, "pump on");
        self.drive_pump(true)?;
        sleep(Duration::from_secs(seconds.into())).await;
        self.drive_pump(false)?;
        tracing::info!("pump off");
        Ok(())
    }

    fn drive_pump(&mut self, on: bool) -> Result<(), BoardError> {
        self.board.drive(self.pins.pump, on != self.pins.pump_active_low)
    }

    /// Idle for `duration_secs` at minimum power.  Returns the number of
    /// waits performed.  There is no way to cut this short other than a
    /// reset.
    pub async fn enter_low_power_idle(&mut self, duration_secs: u64) -> Result<u64, BoardError> {
        tracing::info!(duration_secs, "entering low-power idle");

        self.board.set_cpu_hz(self.idle_clock_hz)?;
        self.power_down_pins()?;
        sleep(self.settle).await;

        let waits = self.quantised_wait(Duration::from_secs(duration_secs)).await;

        self.restore_pins()?;
        self.board.set_cpu_hz(self.full_clock_hz)?;
        sleep(self.settle).await;

        tracing::info!(waits, "woke from low-power idle");
        Ok(waits)
    }

    async fn quantised_wait(&self, total: Duration) -> u64 {
        let quantum = self.quantum.as_secs().max(1);
        let total_secs = total.as_secs();
        let full = total_secs / quantum;
        let rest = total_secs % quantum;

        for i in 0..full {
            sleep(Duration::from_secs(quantum)).await;
            tracing::trace!(elapsed = (i + 1) * quantum, total = total_secs, "sleeping");
        }
        if rest > 0 {
            sleep(Duration::from_secs(rest)).await;
        }

        full + u64::from(rest > 0)
    }

    /// Pins the idle must leave alone.
    fn kept(&self, pin: u8) -> bool {
        pin == self.pins.status_led
            || pin == self.pins.pump
            || self.pins.reserved.contains(&pin)
            || ID_EEPROM_PINS.contains(&pin)
    }

    fn power_down_pins(&mut self) -> Result<(), BoardError> {
        let mut released = 0;
        for pin in 0..self.pins.pin_count {
            if !self.kept(pin) {
                self.board.release(pin)?;
                released += 1;
            }
        }
        tracing::debug!(released, "gpio powered down");
        Ok(())
    }

    fn restore_pins(&mut self) -> Result<(), BoardError> {
        for pin in 0..self.pins.pin_count {
            if !self.kept(pin) && !self.pins.inputs.contains(&pin) {
                self.board.drive(pin, false)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn board(&self) -> &B {
        &self.board
    }
}

// ===========================================================================
// Tests
// ===========================================================================
