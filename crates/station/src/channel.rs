//! Remote pub/sub channel: command topics in, telemetry out.
//!
//! The MQTT event loop is never spawned.  Each session owns its `EventLoop`
//! and only drives it from inside a channel call, so inbound publishes land
//! in the session's inbox and reach the controller only when it asks for
//! them.

use std::collections::VecDeque;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, Transport,
};
use serde::Serialize;
use tokio::time::{timeout, timeout_at, Instant};

use crate::config::MqttSettings;
use crate::error::ChannelError;
use crate::sensors::MeasurementSample;
use crate::store::StationConfig;

// ---------------------------------------------------------------------------
// Topics and commands
// ---------------------------------------------------------------------------

pub const TOPIC_MOISTURE_LIMIT: &str = "new_moisture_limit";
pub const TOPIC_PUMP_SECONDS: &str = "new_active_pump_for";
pub const TOPIC_INTERVAL: &str = "new_misuration_interval";
pub const TOPIC_IRRIGATE_NOW: &str = "irrigate_now";

pub const COMMAND_TOPICS: [&str; 4] = [
    TOPIC_MOISTURE_LIMIT,
    TOPIC_PUMP_SECONDS,
    TOPIC_INTERVAL,
    TOPIC_IRRIGATE_NOW,
];

/// An inbound message as received, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub topic: String,
    pub payload: String,
}

impl CommandMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    MoistureLimit(u8),
    PumpSeconds(u32),
    Interval(u32),
    IrrigateNow(bool),
}

impl Command {
    pub fn parse(msg: &CommandMessage) -> Result<Self, String> {
        let payload = msg.payload.trim();
        match msg.topic.as_str() {
            TOPIC_MOISTURE_LIMIT => {
                let v: u8 = parse_int(payload)?;
                if v > 100 {
                    return Err(format!("moisture limit {v} is not a percentage"));
                }
                Ok(Command::MoistureLimit(v))
            }
            TOPIC_PUMP_SECONDS => parse_int(payload).map(Command::PumpSeconds),
            TOPIC_INTERVAL => {
                let v: u32 = parse_int(payload)?;
                if v == 0 {
                    return Err("measurement interval must be positive".into());
                }
                Ok(Command::Interval(v))
            }
            TOPIC_IRRIGATE_NOW => parse_flag(payload).map(Command::IrrigateNow),
            other => Err(format!("unknown command topic '{other}'")),
        }
    }
}

fn parse_int<T: std::str::FromStr>(s: &str) -> Result<T, String> {
    s.parse()
        .map_err(|_| format!("'{s}' is not a valid non-negative integer"))
}

/// Boolean-ish payload, case-insensitive.  An empty payload clears the flag.
fn parse_flag(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Ok(true),
        "false" | "0" | "off" | "no" | "" => Ok(false),
        _ => Err(format!("'{s}' is not a boolean")),
    }
}

// ---------------------------------------------------------------------------
// Telemetry report
// ---------------------------------------------------------------------------

/// Wire format of the periodic telemetry publish.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryReport {
    pub temperature: f64,
    pub humidity: f64,
    pub soil_moisture: f64,
    pub soil_moisture_limit: u8,
    pub irrigation_time: String,
    #[serde(rename = "timeOfmisuration")]
    pub time_of_misuration: String,
    pub misuration_interval: u32,
    pub activate_pump_for: u32,
    pub battery_level: f64,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

impl TelemetryReport {
    pub fn new(sample: &MeasurementSample, cfg: &StationConfig) -> Self {
        Self {
            temperature: sample.temperature,
            humidity: sample.humidity,
            soil_moisture: round_to(sample.moisture_percent, 1),
            soil_moisture_limit: cfg.moisture_limit,
            irrigation_time: cfg.last_irrigation_timestamp.clone(),
            time_of_misuration: sample.timestamp.clone(),
            misuration_interval: cfg.measurement_interval_seconds,
            activate_pump_for: cfg.pump_active_seconds,
            battery_level: round_to(sample.battery_voltage, 2),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Channel contract
// ---------------------------------------------------------------------------

/// Point-to-point pub/sub operations.  Nothing here retries; every failure
/// goes back to the caller.
pub trait TelemetryChannel {
    type Session;

    async fn connect(&mut self) -> Result<Self::Session, ChannelError>;

    async fn subscribe(
        &mut self,
        session: &mut Self::Session,
        topics: &[&str],
    ) -> Result<(), ChannelError>;

    /// Everything that has arrived since the last call; empty if nothing is
    /// pending.
    async fn poll_incoming(
        &mut self,
        session: &mut Self::Session,
    ) -> Result<Vec<CommandMessage>, ChannelError>;

    /// Hand the payload to the transport.  Does not wait for the broker's
    /// acknowledgement.
    async fn publish(
        &mut self,
        session: &mut Self::Session,
        topic: &str,
        payload: &str,
    ) -> Result<(), ChannelError>;

    async fn disconnect(&mut self, session: Self::Session);
}

// ---------------------------------------------------------------------------
// MQTT implementation
// ---------------------------------------------------------------------------

pub struct MqttChannel {
    settings: MqttSettings,
}

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    inbox: VecDeque<CommandMessage>,
}

impl MqttSession {
    fn enqueue(&mut self, event: &Event) {
        if let Event::Incoming(Packet::Publish(p)) = event {
            let payload = String::from_utf8_lossy(&p.payload).into_owned();
            tracing::debug!(topic = %p.topic, %payload, "command received");
            self.inbox.push_back(CommandMessage::new(p.topic.clone(), payload));
        }
    }

    /// Drive the event loop until `done` accepts an event or `limit` runs
    /// out.  Returns whether `done` fired.
    async fn pump_until<F>(&mut self, limit: Duration, mut done: F) -> Result<bool, ConnectionError>
    where
        F: FnMut(&Event) -> bool,
    {
        let deadline = Instant::now() + limit;
        loop {
            let event = match timeout_at(deadline, self.eventloop.poll()).await {
                Ok(polled) => polled?,
                Err(_) => return Ok(false),
            };
            self.enqueue(&event);
            if done(&event) {
                return Ok(true);
            }
        }
    }
}

impl MqttChannel {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn options(&self) -> MqttOptions {
        let s = &self.settings;
        let mut opts = MqttOptions::new(&s.client_id, &s.host, s.port);
        opts.set_keep_alive(Duration::from_secs(s.keep_alive_sec));
        opts.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&s.username, &s.password) {
            opts.set_credentials(user, pass);
        }
        if s.tls {
            opts.set_transport(Transport::tls_with_default_config());
        }
        opts
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.connect_timeout_sec)
    }
}

impl TelemetryChannel for MqttChannel {
    type Session = MqttSession;

    async fn connect(&mut self) -> Result<MqttSession, ChannelError> {
        let (client, eventloop) = AsyncClient::new(self.options(), 10);
        let mut session = MqttSession {
            client,
            eventloop,
            inbox: VecDeque::new(),
        };

        let mut refused = None;
        let acked = session
            .pump_until(self.op_timeout(), |event| match event {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code != ConnectReturnCode::Success {
                        refused = Some(ack.code);
                    }
                    true
                }
                _ => false,
            })
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        if let Some(code) = refused {
            return Err(ChannelError::Connect(format!("broker refused: {code:?}")));
        }
        if !acked {
            return Err(ChannelError::ConnectTimeout(self.settings.connect_timeout_sec));
        }

        tracing::info!(
            host = %self.settings.host,
            port = self.settings.port,
            client_id = %self.settings.client_id,
            "mqtt connected"
        );
        Ok(session)
    }

    async fn subscribe(
        &mut self,
        session: &mut MqttSession,
        topics: &[&str],
    ) -> Result<(), ChannelError> {
        for topic in topics {
            session
                .client
                .subscribe(*topic, QoS::AtMostOnce)
                .await
                .map_err(|e| ChannelError::Subscribe {
                    topic: topic.to_string(),
                    detail: e.to_string(),
                })?;
        }

        let mut pending = topics.len();
        if pending == 0 {
            return Ok(());
        }
        let all_acked = session
            .pump_until(self.op_timeout(), |event| {
                if matches!(event, Event::Incoming(Packet::SubAck(_))) {
                    pending -= 1;
                }
                pending == 0
            })
            .await
            .map_err(|e| ChannelError::Subscribe {
                topic: topics.join(","),
                detail: e.to_string(),
            })?;

        if !all_acked {
            return Err(ChannelError::Subscribe {
                topic: topics.join(","),
                detail: "no SUBACK before timeout".into(),
            });
        }
        tracing::info!(?topics, "subscribed");
        Ok(())
    }

    async fn poll_incoming(
        &mut self,
        session: &mut MqttSession,
    ) -> Result<Vec<CommandMessage>, ChannelError> {
        // Keep reading until the connection has been quiet for a moment, but
        // never longer than one operation timeout in total.
        let quiet = Duration::from_millis(self.settings.drain_quiet_ms);
        let deadline = Instant::now() + self.op_timeout();
        while Instant::now() < deadline {
            match timeout(quiet, session.eventloop.poll()).await {
                Err(_) => break,
                Ok(Ok(event)) => session.enqueue(&event),
                Ok(Err(e)) => return Err(ChannelError::Lost(e.to_string())),
            }
        }
        Ok(session.inbox.drain(..).collect())
    }

    async fn publish(
        &mut self,
        session: &mut MqttSession,
        topic: &str,
        payload: &str,
    ) -> Result<(), ChannelError> {
        let publish_err = |detail: String| ChannelError::Publish {
            topic: topic.to_string(),
            detail,
        };

        session
            .client
            .publish(topic, QoS::AtLeastOnce, true, payload.as_bytes().to_vec())
            .await
            .map_err(|e| publish_err(e.to_string()))?;

        // Written to the socket is enough; the PUBACK is not awaited.
        let sent = session
            .pump_until(self.op_timeout(), |event| {
                matches!(event, Event::Outgoing(Outgoing::Publish(_)))
            })
            .await
            .map_err(|e| publish_err(e.to_string()))?;
        if !sent {
            return Err(publish_err("not written before timeout".into()));
        }

        tracing::info!(topic, bytes = payload.len(), "telemetry published");
        Ok(())
    }

    async fn disconnect(&mut self, mut session: MqttSession) {
        if session.client.disconnect().await.is_err() {
            return;
        }
        let flushed = session
            .pump_until(self.op_timeout(), |event| {
                matches!(event, Event::Outgoing(Outgoing::Disconnect))
            })
            .await;
        match flushed {
            Ok(true) => tracing::info!("mqtt disconnected"),
            Ok(false) => tracing::warn!("mqtt disconnect not flushed before timeout"),
            Err(e) => tracing::debug!("mqtt closed during disconnect: {e}"),
        }
        if !session.inbox.is_empty() {
            tracing::debug!(dropped = session.inbox.len(), "unread commands discarded");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
