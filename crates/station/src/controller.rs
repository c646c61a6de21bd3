//! The station's control loop.
//!
//! ```text
//! BOOT -> CONNECTING -> MEASURING -> DECIDING -> REPORTING -> PERSISTING -> IDLING
//!              ^                                                              |
//!              +--------------------------------------------------------------+
//! ```
//!
//! Every phase returns `Result<_, Fault>`.  A recoverable fault unwinds to
//! [`IrrigationController::run`], which cleans up, waits the reset delay and
//! starts over from BOOT.  A fatal fault ends `run`.
//!
//! Live configuration is only changed by inbound commands during MEASURING
//! and by an irrigation during DECIDING, and only written to storage during
//! PERSISTING (or while recovering from a fault).

use std::fmt;
use std::time::Duration;

use tokio::time::sleep;

use crate::board::Board;
use crate::channel::{
    Command, CommandMessage, TelemetryChannel, TelemetryReport, COMMAND_TOPICS,
};
use crate::error::{ChannelError, Fault, StationError};
use crate::event_log::EventLog;
use crate::link::NetworkLink;
use crate::power::PowerCycle;
use crate::sensors::{MeasurementSample, SensorSuite, Sensors};
use crate::store::{ConfigStore, StationConfig};
use crate::time_source::{TimeSource, UtcSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Boot,
    Connecting,
    Measuring,
    Deciding,
    Reporting,
    Persisting,
    Idling,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Boot => "BOOT",
            Phase::Connecting => "CONNECTING",
            Phase::Measuring => "MEASURING",
            Phase::Deciding => "DECIDING",
            Phase::Reporting => "REPORTING",
            Phase::Persisting => "PERSISTING",
            Phase::Idling => "IDLING",
        };
        f.write_str(name)
    }
}

/// Per-boot flags, never persisted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RuntimeState {
    pub irrigate_now: bool,
    pub config_dirty: bool,
}

/// Irrigation triggers below the limit or on explicit request.
pub fn should_irrigate(moisture_percent: f64, moisture_limit: u8, irrigate_now: bool) -> bool {
    irrigate_now || moisture_percent < f64::from(moisture_limit)
}

/// Everything the controller drives.
pub struct Station<B, S, U, L, C> {
    pub store: ConfigStore,
    pub log: EventLog,
    pub power: PowerCycle<B>,
    pub sensors: SensorSuite<S>,
    pub clock: TimeSource<U>,
    pub link: L,
    pub channel: C,
}

pub struct IrrigationController<B, S, U, L, C: TelemetryChannel> {
    store: ConfigStore,
    log: EventLog,
    power: PowerCycle<B>,
    sensors: SensorSuite<S>,
    clock: TimeSource<U>,
    link: L,
    channel: C,

    telemetry_topic: String,
    reset_delay: Duration,

    phase: Phase,
    config: StationConfig,
    state: RuntimeState,
    session: Option<C::Session>,
}

impl<B, S, U, L, C> IrrigationController<B, S, U, L, C>
where
    B: Board,
    S: Sensors,
    U: UtcSource,
    L: NetworkLink,
    C: TelemetryChannel,
{
    pub fn new(
        station: Station<B, S, U, L, C>,
        telemetry_topic: impl Into<String>,
        reset_delay: Duration,
    ) -> Self {
        Self {
            store: station.store,
            log: station.log,
            power: station.power,
            sensors: station.sensors,
            clock: station.clock,
            link: station.link,
            channel: station.channel,
            telemetry_topic: telemetry_topic.into(),
            reset_delay,
            phase: Phase::Boot,
            config: StationConfig::default(),
            state: RuntimeState::default(),
            session: None,
        }
    }

    // -----------------------------------------------------------------------
    // Supervisor
    // -----------------------------------------------------------------------

    /// Run until a fatal fault, which is returned.  Recoverable faults
    /// restart the machine from BOOT.
    pub async fn run(&mut self) -> StationError {
        loop {
            let fault = match self.boot() {
                Ok(()) => loop {
                    if let Err(fault) = self.cycle().await {
                        break fault;
                    }
                },
                Err(fault) => fault,
            };

            self.recover(&fault).await;

            match fault {
                Fault::Fatal(e) => {
                    tracing::error!(phase = %self.phase, "fatal fault, stopping: {e}");
                    return e;
                }
                Fault::Recoverable(e) => {
                    tracing::warn!(
                        phase = %self.phase,
                        delay_sec = self.reset_delay.as_secs(),
                        "restarting after fault: {e}"
                    );
                    sleep(self.reset_delay).await;
                }
            }
        }
    }

    /// One pass CONNECTING through IDLING.
    pub async fn cycle(&mut self) -> Result<(), Fault> {
        self.connecting().await?;
        let sample = self.measuring().await?;
        self.deciding(&sample).await?;
        self.reporting(&sample).await;
        self.persisting()?;
        self.idling().await?;
        Ok(())
    }

    /// Best-effort cleanup after a fault.  Nothing here can fail the
    /// recovery itself.
    async fn recover(&mut self, fault: &Fault) {
        tracing::error!(phase = %self.phase, fatal = fault.is_fatal(), "{}", fault.error());
        self.log.error(fault.error());

        if self.state.config_dirty {
            match self.store.save(&self.config) {
                Ok(()) => self.state.config_dirty = false,
                Err(e) => {
                    tracing::error!("could not save config during recovery: {e}");
                    self.log.error(&e);
                }
            }
        }

        self.close_session().await;
        self.link.down().await;

        if let Err(e) = self.power.sleep_peripherals() {
            tracing::warn!("rails not switched off during recovery: {e}");
        }
        if let Err(e) = self.power.status_led(false) {
            tracing::warn!("status led not switched off during recovery: {e}");
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        tracing::debug!(%phase, "phase");
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    pub fn boot(&mut self) -> Result<(), Fault> {
        self.enter(Phase::Boot);
        self.config = self.store.load();
        self.state = RuntimeState::default();
        self.session = None;
        self.power.init()?;
        tracing::info!(
            moisture_limit = self.config.moisture_limit,
            pump_seconds = self.config.pump_active_seconds,
            interval_sec = self.config.measurement_interval_seconds,
            last_irrigation = %self.config.last_irrigation_timestamp,
            "station booted"
        );
        Ok(())
    }

    async fn connecting(&mut self) -> Result<(), Fault> {
        self.enter(Phase::Connecting);
        self.power.status_led(true)?;
        self.power.wake_peripherals()?;

        self.link.up().await?;
        self.clock.synchronize().await?;

        let mut session = self.channel.connect().await?;
        let subscribed = self.channel.subscribe(&mut session, &COMMAND_TOPICS).await;
        // Keep the session even on failure so recovery can close it.
        self.session = Some(session);
        subscribed?;

        sleep(self.sensors.warmup()).await;
        Ok(())
    }

    async fn measuring(&mut self) -> Result<MeasurementSample, Fault> {
        self.enter(Phase::Measuring);

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ChannelError::Lost("no session".into()))?;
        let messages = self.channel.poll_incoming(session).await?;
        for msg in &messages {
            self.apply_command(msg);
        }

        let timestamp = self.clock.local_iso_now();
        self.log.note(&timestamp);
        let sample = self.sensors.measure(timestamp).await?;
        tracing::info!(
            moisture = format!("{:.2}", sample.moisture_percent),
            battery = format!("{:.2}", sample.battery_voltage),
            temperature = sample.temperature,
            humidity = sample.humidity,
            "measured"
        );
        Ok(sample)
    }

    /// Apply one inbound command.  Returns whether the persisted
    /// configuration changed.  Bad payloads are logged and dropped.
    pub fn apply_command(&mut self, msg: &CommandMessage) -> bool {
        let command = match Command::parse(msg) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(topic = %msg.topic, "command ignored: {e}");
                return false;
            }
        };

        let cfg = &mut self.config;
        let changed = match command {
            Command::MoistureLimit(v) => replace(&mut cfg.moisture_limit, v),
            Command::PumpSeconds(v) => replace(&mut cfg.pump_active_seconds, v),
            Command::Interval(v) => replace(&mut cfg.measurement_interval_seconds, v),
            Command::IrrigateNow(v) => {
                self.state.irrigate_now = v;
                false
            }
        };

        if changed {
            self.state.config_dirty = true;
        }
        tracing::info!(?command, changed, "command applied");
        changed
    }

    async fn deciding(&mut self, sample: &MeasurementSample) -> Result<(), Fault> {
        self.enter(Phase::Deciding);

        if !should_irrigate(
            sample.moisture_percent,
            self.config.moisture_limit,
            self.state.irrigate_now,
        ) {
            tracing::info!(
                moisture = format!("{:.1}", sample.moisture_percent),
                limit = self.config.moisture_limit,
                "no irrigation needed"
            );
            return Ok(());
        }

        let seconds = self.config.pump_active_seconds;
        let started = self.clock.local_iso_now();
        tracing::info!(
            requested = self.state.irrigate_now,
            moisture = format!("{:.1}", sample.moisture_percent),
            limit = self.config.moisture_limit,
            seconds,
            "irrigating"
        );
        self.power.run_pump(seconds).await?;
        self.sensors.pump_ran(seconds);

        self.config.last_irrigation_timestamp = started;
        self.state.irrigate_now = false;
        self.state.config_dirty = true;
        Ok(())
    }

    /// Telemetry loss is tolerated: failures are logged, never raised.
    async fn reporting(&mut self, sample: &MeasurementSample) {
        self.enter(Phase::Reporting);

        let payload = match TelemetryReport::new(sample, &self.config).to_json() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("telemetry encode failed: {e}");
                self.log.error(&e);
                return;
            }
        };

        let Some(session) = self.session.as_mut() else {
            tracing::warn!("no session, telemetry dropped");
            return;
        };
        match self
            .channel
            .publish(session, &self.telemetry_topic, &payload)
            .await
        {
            Ok(()) => self.log.note("published"),
            Err(e) => {
                tracing::error!("telemetry lost: {e}");
                self.log.error(&e);
            }
        }
    }

    fn persisting(&mut self) -> Result<(), Fault> {
        self.enter(Phase::Persisting);
        if self.state.config_dirty {
            self.store.save(&self.config)?;
            self.state.config_dirty = false;
            tracing::info!(path = %self.store.path().display(), "config saved");
        }
        Ok(())
    }

    async fn idling(&mut self) -> Result<(), Fault> {
        self.enter(Phase::Idling);
        self.close_session().await;
        self.link.down().await;
        self.power.sleep_peripherals()?;
        self.power.status_led(false)?;

        let interval = u64::from(self.config.measurement_interval_seconds);
        self.power.enter_low_power_idle(interval).await?;
        Ok(())
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.channel.disconnect(session).await;
        }
    }
}

/// Store `value` in `slot`; true if it differed.
fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{PinMode, SimBoard};
    use crate::config::{PinSettings, PowerSettings, SensorSettings};
    use crate::error::{BoardError, ConnError, SensorError, TimeSyncError};
    use crate::sensors::Climate;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use time::macros::datetime;
    use time::OffsetDateTime;

    // -- fakes ----------------------------------------------------------------

    struct FixedSoil {
        raw: u16,
        pumped: u32,
    }

    /// Soil reading that makes `FixedSoil` report a dead sensor.
    const RAW_UNREADABLE: u16 = u16::MAX;

    impl Sensors for FixedSoil {
        fn soil_raw(&mut self) -> Result<u16, SensorError> {
            if self.raw == RAW_UNREADABLE {
                return Err(SensorError::Read {
                    sensor: "soil",
                    detail: "no ack".into(),
                });
            }
            Ok(self.raw)
        }

        fn climate(&mut self) -> Result<Climate, SensorError> {
            Ok(Climate {
                temperature: 22.0,
                humidity: 55.0,
            })
        }

        fn battery_tap_volts(&mut self) -> Result<f64, SensorError> {
            Ok(2.6)
        }

        fn pump_ran(&mut self, seconds: u32) {
            self.pumped += seconds;
        }
    }

    struct FixedUtc;

    impl UtcSource for FixedUtc {
        async fn fetch_utc(&mut self) -> Result<OffsetDateTime, TimeSyncError> {
            Ok(datetime!(2024-07-01 10:00:00 UTC))
        }
    }

    #[derive(Default)]
    struct FakeLink {
        fail: bool,
        ups: u32,
        downs: u32,
    }

    impl NetworkLink for FakeLink {
        async fn up(&mut self) -> Result<(), ConnError> {
            self.ups += 1;
            if self.fail {
                return Err(ConnError::Unreachable {
                    host: "broker".into(),
                    attempts: 1,
                });
            }
            Ok(())
        }

        async fn down(&mut self) {
            self.downs += 1;
        }
    }

    #[derive(Default)]
    struct FakeChannel {
        inbound: VecDeque<CommandMessage>,
        published: Vec<(String, String)>,
        subscribed: Vec<String>,
        fail_connect: bool,
        fail_publish: bool,
        open: u32,
        closed: u32,
    }

    impl TelemetryChannel for FakeChannel {
        type Session = ();

        async fn connect(&mut self) -> Result<(), ChannelError> {
            if self.fail_connect {
                return Err(ChannelError::Connect("refused".into()));
            }
            self.open += 1;
            Ok(())
        }

        async fn subscribe(&mut self, _: &mut (), topics: &[&str]) -> Result<(), ChannelError> {
            self.subscribed = topics.iter().map(|t| t.to_string()).collect();
            Ok(())
        }

        async fn poll_incoming(&mut self, _: &mut ()) -> Result<Vec<CommandMessage>, ChannelError> {
            Ok(self.inbound.drain(..).collect())
        }

        async fn publish(&mut self, _: &mut (), topic: &str, payload: &str) -> Result<(), ChannelError> {
            if self.fail_publish {
                return Err(ChannelError::Publish {
                    topic: topic.into(),
                    detail: "broker gone".into(),
                });
            }
            self.published.push((topic.into(), payload.into()));
            Ok(())
        }

        async fn disconnect(&mut self, _: ()) {
            self.closed += 1;
        }
    }

    /// A board whose clock control is broken.
    struct BrokenBoard;

    impl Board for BrokenBoard {
        fn drive(&mut self, _: u8, _: bool) -> Result<(), BoardError> {
            Ok(())
        }

        fn release(&mut self, _: u8) -> Result<(), BoardError> {
            Ok(())
        }

        fn set_cpu_hz(&mut self, _: u32) -> Result<(), BoardError> {
            Err(BoardError::Clock("cpufreq missing".into()))
        }
    }

    // -- helpers ------------------------------------------------------------

    /// raw 24600 -> 10 %, 23200 -> 20 % with the default calibration.
    const RAW_10_PCT: u16 = 24600;
    const RAW_20_PCT: u16 = 23200;

    fn scratch(name: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir();
        let tag = format!("{}-{name}", std::process::id());
        let cfg = dir.join(format!("station-ctl-{tag}.json"));
        let log = dir.join(format!("station-ctl-{tag}.log"));
        let _ = std::fs::remove_file(&cfg);
        let _ = std::fs::remove_file(&log);
        (cfg, log)
    }

    fn station<B: Board>(
        board: B,
        paths: &(PathBuf, PathBuf),
        soil_raw: u16,
        link: FakeLink,
        channel: FakeChannel,
    ) -> IrrigationController<B, FixedSoil, FixedUtc, FakeLink, FakeChannel> {
        let power = PowerCycle::new(board, PinSettings::default(), &PowerSettings::default());
        let sensors = SensorSuite::new(
            FixedSoil {
                raw: soil_raw,
                pumped: 0,
            },
            SensorSettings {
                battery_samples: 2,
                ..SensorSettings::default()
            },
        );
        IrrigationController::new(
            Station {
                store: ConfigStore::new(&paths.0),
                log: EventLog::new(&paths.1),
                power,
                sensors,
                clock: TimeSource::new(FixedUtc),
                link,
                channel,
            },
            "picoW/sensor",
            Duration::from_secs(5),
        )
    }

    fn cleanup(paths: &(PathBuf, PathBuf)) {
        let _ = std::fs::remove_file(&paths.0);
        let _ = std::fs::remove_file(&paths.1);
    }

    fn msg(topic: &str, payload: &str) -> CommandMessage {
        CommandMessage::new(topic, payload)
    }

    // -- decision -------------------------------------------------------------

    #[test]
    fn below_limit_triggers() {
        assert!(should_irrigate(10.0, 15, false));
    }

    #[test]
    fn above_limit_does_not_trigger() {
        assert!(!should_irrigate(20.0, 15, false));
    }

    #[test]
    fn at_limit_does_not_trigger() {
        assert!(!should_irrigate(15.0, 15, false));
    }

    #[test]
    fn request_overrides_moisture() {
        assert!(should_irrigate(80.0, 15, true));
    }

    // -- commands -------------------------------------------------------------

    #[test]
    fn same_value_does_not_dirty() {
        let paths = scratch("same-value");
        let mut ctl = station(SimBoard::new(), &paths, RAW_20_PCT, FakeLink::default(), FakeChannel::default());
        ctl.boot().unwrap();

        assert!(!ctl.apply_command(&msg("new_moisture_limit", "15")));
        assert!(!ctl.apply_command(&msg("new_active_pump_for", "5")));
        assert!(!ctl.apply_command(&msg("new_misuration_interval", "3600")));
        assert!(!ctl.state.config_dirty);
        cleanup(&paths);
    }

    #[test]
    fn changed_value_dirties() {
        let paths = scratch("changed-value");
        let mut ctl = station(SimBoard::new(), &paths, RAW_20_PCT, FakeLink::default(), FakeChannel::default());
        ctl.boot().unwrap();

        assert!(ctl.apply_command(&msg("new_moisture_limit", "25")));
        assert_eq!(ctl.config.moisture_limit, 25);
        assert!(ctl.state.config_dirty);
        cleanup(&paths);
    }

    #[test]
    fn irrigate_now_sets_flag_without_dirtying() {
        let paths = scratch("irrigate-flag");
        let mut ctl = station(SimBoard::new(), &paths, RAW_20_PCT, FakeLink::default(), FakeChannel::default());
        ctl.boot().unwrap();

        assert!(!ctl.apply_command(&msg("irrigate_now", "true")));
        assert!(ctl.state.irrigate_now);
        assert!(!ctl.state.config_dirty);
        cleanup(&paths);
    }

    #[test]
    fn malformed_command_is_dropped() {
        let paths = scratch("malformed");
        let mut ctl = station(SimBoard::new(), &paths, RAW_20_PCT, FakeLink::default(), FakeChannel::default());
        ctl.boot().unwrap();

        assert!(!ctl.apply_command(&msg("new_moisture_limit", "lots")));
        assert!(!ctl.apply_command(&msg("new_misuration_interval", "0")));
        assert_eq!(ctl.config, StationConfig::default());
        assert!(!ctl.state.config_dirty);
        cleanup(&paths);
    }

    // -- full cycles ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn dry_soil_cycle_irrigates_reports_and_saves() {
        let paths = scratch("dry-cycle");
        let channel = FakeChannel {
            inbound: VecDeque::from(vec![msg("new_active_pump_for", "3")]),
            ..FakeChannel::default()
        };
        let mut ctl = station(SimBoard::new(), &paths, RAW_10_PCT, FakeLink::default(), channel);
        ctl.boot().unwrap();
        ctl.cycle().await.unwrap();

        assert_eq!(ctl.channel.subscribed, COMMAND_TOPICS);
        assert_eq!(ctl.sensors_pumped(), 3);

        assert_eq!(ctl.channel.published.len(), 1);
        let (topic, payload) = &ctl.channel.published[0];
        assert_eq!(topic, "picoW/sensor");
        let report: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(report["soil_moisture"], 10.0);
        assert_eq!(report["activate_pump_for"], 3);
        // synced at 12:00:00 local, then the 5 s sensor warm-up
        assert_eq!(report["irrigation_time"], "2024-07-01T12:00:05");
        assert_eq!(report["timeOfmisuration"], "2024-07-01T12:00:05");

        let saved = ConfigStore::new(&paths.0).load();
        assert_eq!(saved.pump_active_seconds, 3);
        assert_eq!(saved.last_irrigation_timestamp, "2024-07-01T12:00:05");
        assert!(!ctl.state.config_dirty);

        assert_eq!(ctl.channel.closed, 1);
        assert_eq!(ctl.link.downs, 1);
        assert_eq!(ctl.phase, Phase::Idling);

        let pins = PinSettings::default();
        let board = ctl.power.board();
        assert_eq!(board.mode(pins.pump), Some(PinMode::Low));
        assert_eq!(board.mode(pins.status_led), Some(PinMode::Low));

        let log = std::fs::read_to_string(&paths.1).unwrap();
        assert_eq!(log.lines().collect::<Vec<_>>(), ["2024-07-01T12:00:05", "published"]);
        cleanup(&paths);
    }

    #[tokio::test(start_paused = true)]
    async fn wet_soil_cycle_leaves_storage_alone() {
        let paths = scratch("wet-cycle");
        let mut ctl = station(SimBoard::new(), &paths, RAW_20_PCT, FakeLink::default(), FakeChannel::default());
        ctl.boot().unwrap();
        // boot wrote the defaults; a clean cycle must not write again
        std::fs::remove_file(&paths.0).unwrap();

        ctl.cycle().await.unwrap();

        assert_eq!(ctl.sensors_pumped(), 0);
        assert_eq!(ctl.channel.published.len(), 1);
        assert!(!paths.0.exists());
        cleanup(&paths);
    }

    #[tokio::test(start_paused = true)]
    async fn irrigate_now_runs_pump_on_wet_soil_and_clears() {
        let paths = scratch("irrigate-now");
        let channel = FakeChannel {
            inbound: VecDeque::from(vec![msg("irrigate_now", "1")]),
            ..FakeChannel::default()
        };
        let mut ctl = station(SimBoard::new(), &paths, RAW_20_PCT, FakeLink::default(), channel);
        ctl.boot().unwrap();
        ctl.cycle().await.unwrap();

        assert_eq!(ctl.sensors_pumped(), 5);
        assert!(!ctl.state.irrigate_now);
        assert!(!ctl.config.last_irrigation_timestamp.is_empty());
        cleanup(&paths);
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_idles_for_configured_interval() {
        let paths = scratch("idle-interval");
        let channel = FakeChannel {
            inbound: VecDeque::from(vec![msg("new_misuration_interval", "600")]),
            ..FakeChannel::default()
        };
        let mut ctl = station(SimBoard::new(), &paths, RAW_20_PCT, FakeLink::default(), channel);
        ctl.boot().unwrap();

        let start = tokio::time::Instant::now();
        ctl.cycle().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(600));
        assert_eq!(ConfigStore::new(&paths.0).load().measurement_interval_seconds, 600);
        cleanup(&paths);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_does_not_abort_cycle() {
        let paths = scratch("publish-fail");
        let channel = FakeChannel {
            fail_publish: true,
            ..FakeChannel::default()
        };
        let mut ctl = station(SimBoard::new(), &paths, RAW_20_PCT, FakeLink::default(), channel);
        ctl.boot().unwrap();

        assert!(ctl.cycle().await.is_ok());
        let log = std::fs::read_to_string(&paths.1).unwrap();
        assert!(log.contains("Error: mqtt publish to picoW/sensor failed"), "{log}");
        cleanup(&paths);
    }

    // -- faults -----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn connect_failure_is_recoverable_and_saves_dirty_config() {
        let paths = scratch("connect-fail");
        let channel = FakeChannel {
            fail_connect: true,
            ..FakeChannel::default()
        };
        let mut ctl = station(SimBoard::new(), &paths, RAW_20_PCT, FakeLink::default(), channel);
        ctl.boot().unwrap();
        ctl.config.moisture_limit = 40;
        ctl.state.config_dirty = true;

        let fault = ctl.cycle().await.unwrap_err();
        assert!(!fault.is_fatal());
        assert_eq!(ctl.phase, Phase::Connecting);

        ctl.recover(&fault).await;
        assert_eq!(ConfigStore::new(&paths.0).load().moisture_limit, 40);
        assert!(!ctl.state.config_dirty);
        assert_eq!(ctl.link.downs, 1);

        let pins = PinSettings::default();
        assert_eq!(ctl.power.board().mode(pins.status_led), Some(PinMode::Low));
        let log = std::fs::read_to_string(&paths.1).unwrap();
        assert!(log.starts_with("Error: mqtt connect failed"), "{log}");
        cleanup(&paths);
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_failure_after_command_saves_new_value() {
        let paths = scratch("sensor-fail");
        let channel = FakeChannel {
            inbound: VecDeque::from(vec![msg("new_moisture_limit", "30")]),
            ..FakeChannel::default()
        };
        let mut ctl = station(SimBoard::new(), &paths, RAW_UNREADABLE, FakeLink::default(), channel);
        ctl.boot().unwrap();

        let fault = ctl.cycle().await.unwrap_err();
        assert!(!fault.is_fatal());
        assert_eq!(ctl.phase, Phase::Measuring);
        assert_eq!(ctl.config.moisture_limit, 30);
        assert!(ctl.state.config_dirty);
        assert!(ctl.channel.published.is_empty());

        ctl.recover(&fault).await;
        assert_eq!(ConfigStore::new(&paths.0).load().moisture_limit, 30);
        assert!(!ctl.state.config_dirty);
        assert_eq!(ctl.channel.closed, 1);
        assert_eq!(ctl.link.downs, 1);

        let pins = PinSettings::default();
        assert_eq!(ctl.power.board().mode(pins.soil_power), Some(PinMode::Low));
        let log = std::fs::read_to_string(&paths.1).unwrap();
        assert!(log.contains("Error: soil read failed: no ack"), "{log}");
        cleanup(&paths);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_restarts_from_boot_on_recoverable_fault() {
        let paths = scratch("supervisor-restart");
        let link = FakeLink {
            fail: true,
            ..FakeLink::default()
        };
        let mut ctl = station(SimBoard::new(), &paths, RAW_20_PCT, link, FakeChannel::default());

        let outcome = tokio::time::timeout(Duration::from_secs(12), ctl.run()).await;
        assert!(outcome.is_err(), "run never returns on recoverable faults");
        // 5 s reset delay: attempts at t=0, 5 and 10
        assert!(ctl.link.ups >= 3, "{}", ctl.link.ups);
        assert_eq!(ctl.channel.open, 0);
        cleanup(&paths);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_stops_on_fatal_fault() {
        let paths = scratch("supervisor-fatal");
        let mut ctl = station(BrokenBoard, &paths, RAW_20_PCT, FakeLink::default(), FakeChannel::default());

        let err = ctl.run().await;
        assert!(matches!(err, StationError::Board(BoardError::Clock(_))));
        assert_eq!(ctl.link.ups, 0);
        cleanup(&paths);
    }

    impl<B: Board> IrrigationController<B, FixedSoil, FixedUtc, FakeLink, FakeChannel> {
        fn sensors_pumped(&self) -> u32 {
            self.sensors.backend().pumped
        }
    }
}
