#[cfg(feature = "adc")]
mod adc;
mod board;
mod channel;
mod config;
mod controller;
mod error;
mod event_log;
mod link;
mod power;
mod sensors;
#[cfg(feature = "sim")]
mod sim;
mod store;
mod time_source;

#[cfg(not(any(feature = "sim", feature = "adc")))]
compile_error!("enable the `sim` or `adc` feature to pick a sensor backend");

use anyhow::{Context, Result};
use std::{env, path::PathBuf, time::Duration};
use tracing_subscriber::EnvFilter;

use channel::MqttChannel;
use config::Settings;
use controller::{IrrigationController, Station};
use event_log::EventLog;
use link::HostLink;
use power::PowerCycle;
use sensors::SensorSuite;
use store::ConfigStore;
use time_source::{ConfiguredUtc, TimeSource};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Settings ────────────────────────────────────────────────────
    let settings_path =
        PathBuf::from(env::var("STATION_CONFIG").unwrap_or_else(|_| "station.toml".to_string()));
    let settings = config::load(&settings_path)?;

    tracing::info!(
        broker = %format_args!("{}:{}", settings.mqtt.host, settings.mqtt.port),
        topic = %settings.mqtt.telemetry_topic,
        time_source = ?settings.time.source,
        store = %settings.storage.config_path.display(),
        "station starting"
    );

    // ── Hardware ────────────────────────────────────────────────────
    let power = PowerCycle::new(open_board(&settings)?, settings.pins.clone(), &settings.power);
    let sensors = SensorSuite::new(open_sensors(&settings)?, settings.sensors.clone());

    // ── Controller ──────────────────────────────────────────────────
    let station = Station {
        store: ConfigStore::new(&settings.storage.config_path),
        log: EventLog::new(&settings.storage.log_path),
        power,
        sensors,
        clock: TimeSource::new(ConfiguredUtc::from_settings(&settings.time)),
        link: HostLink::new(
            settings.mqtt.host.clone(),
            settings.mqtt.port,
            settings.recovery.link_attempts,
        ),
        channel: MqttChannel::new(settings.mqtt.clone()),
    };
    let mut controller = IrrigationController::new(
        station,
        settings.mqtt.telemetry_topic.clone(),
        Duration::from_secs(settings.recovery.reset_delay_sec),
    );

    let fatal = controller.run().await;
    Err(anyhow::Error::new(fatal).context("station stopped, device needs a reset"))
}

#[cfg(feature = "gpio")]
fn open_board(settings: &Settings) -> Result<board::GpioBoard> {
    board::GpioBoard::new(settings.power.cpufreq_path.clone()).context("failed to open gpio")
}

#[cfg(not(feature = "gpio"))]
fn open_board(_settings: &Settings) -> Result<board::SimBoard> {
    Ok(board::SimBoard::new())
}

#[cfg(feature = "adc")]
fn open_sensors(settings: &Settings) -> Result<adc::Ads1115Sensors> {
    let s = &settings.sensors;
    adc::Ads1115Sensors::new(s.i2c_addr, s.soil_channel, s.battery_channel)
        .context("failed to open ads1115")
}

#[cfg(all(feature = "sim", not(feature = "adc")))]
fn open_sensors(settings: &Settings) -> Result<sim::StationSim> {
    let s = &settings.sensors;
    Ok(sim::StationSim::new(
        sim::Scenario::from_str_lossy(&s.scenario),
        s.raw_dry,
        s.raw_wet,
    ))
}
