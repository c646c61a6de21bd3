//! Wall-clock time for the station: SNTP synchronisation and conversion to
//! the station's local civil time.
//!
//! Local time is UTC+1 plus one hour of daylight saving.  The DST window is
//! the simplified month/day rule below, not the exact last-Sunday rule; it is
//! off by up to a week at each end and that is accepted.

use std::time::Duration;

use time::{Month, OffsetDateTime};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

use crate::config::{TimeSettings, TimeSourceKind};
use crate::error::TimeSyncError;

/// Standard-time offset from UTC, in hours.
const BASE_OFFSET_HOURS: i64 = 1;

/// Seconds between the NTP era (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const NTP_ERA_SECS: u64 = 1 << 32;

const NTP_PORT: u16 = 123;
const NTP_PACKET_LEN: usize = 48;

// ---------------------------------------------------------------------------
// Civil time
// ---------------------------------------------------------------------------

/// Simplified DST rule, evaluated on the UTC calendar date: April through
/// September, plus March from the 28th and October before the 28th.
pub fn is_dst(utc: OffsetDateTime) -> bool {
    let day = utc.day();
    match utc.month() {
        Month::April | Month::May | Month::June | Month::July | Month::August | Month::September => {
            true
        }
        Month::March => day >= 28,
        Month::October => day < 28,
        _ => false,
    }
}

pub fn to_local(utc: OffsetDateTime) -> OffsetDateTime {
    let hours = BASE_OFFSET_HOURS + i64::from(is_dst(utc));
    utc + time::Duration::hours(hours)
}

/// `YYYY-MM-DDTHH:MM:SS` in local time.
pub fn local_iso(utc: OffsetDateTime) -> String {
    let t = to_local(utc);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
        t.year(),
        t.month() as u8,
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

// ---------------------------------------------------------------------------
// UTC sources
// ---------------------------------------------------------------------------

/// Where the station gets UTC from.
pub trait UtcSource {
    async fn fetch_utc(&mut self) -> Result<OffsetDateTime, TimeSyncError>;
}

/// Minimal SNTP (RFC 4330) client: one request, one reply, no retries.
pub struct SntpClient {
    server: String,
    timeout: Duration,
}

impl SntpClient {
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }
}

/// Client request: LI=0, VN=3, Mode=3.
fn sntp_request() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = 0x1B;
    packet
}

/// Extract the transmit timestamp from a server reply.
fn parse_sntp_reply(buf: &[u8]) -> Result<OffsetDateTime, TimeSyncError> {
    if buf.len() < NTP_PACKET_LEN {
        return Err(TimeSyncError::Malformed("short packet"));
    }
    if buf[0] & 0x07 != 4 {
        return Err(TimeSyncError::Malformed("not a server reply"));
    }
    if buf[1] == 0 {
        return Err(TimeSyncError::Malformed("kiss-of-death"));
    }

    let secs = u64::from(u32::from_be_bytes([buf[40], buf[41], buf[42], buf[43]]));
    let frac = u64::from(u32::from_be_bytes([buf[44], buf[45], buf[46], buf[47]]));
    // The 32-bit seconds field wraps in February 2036. A station clock is
    // never before 1970, so anything smaller belongs to era 1.
    let secs = if secs < NTP_UNIX_OFFSET {
        secs + NTP_ERA_SECS
    } else {
        secs
    };

    let unix = (secs - NTP_UNIX_OFFSET) as i64;
    let nanos = ((frac * 1_000_000_000) >> 32) as i64;
    let base = OffsetDateTime::from_unix_timestamp(unix)
        .map_err(|_| TimeSyncError::Malformed("timestamp out of range"))?;
    Ok(base + time::Duration::nanoseconds(nanos))
}

impl UtcSource for SntpClient {
    async fn fetch_utc(&mut self) -> Result<OffsetDateTime, TimeSyncError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((self.server.as_str(), NTP_PORT)).await?;
        socket.send(&sntp_request()).await?;

        let mut buf = [0u8; NTP_PACKET_LEN];
        let n = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| TimeSyncError::Timeout(self.server.clone()))??;
        parse_sntp_reply(&buf[..n])
    }
}

/// Trust the host clock (already disciplined by the OS).
pub struct SystemUtc;

impl UtcSource for SystemUtc {
    async fn fetch_utc(&mut self) -> Result<OffsetDateTime, TimeSyncError> {
        Ok(OffsetDateTime::now_utc())
    }
}

/// The UTC source picked in the settings file.
pub enum ConfiguredUtc {
    Ntp(SntpClient),
    System(SystemUtc),
}

impl ConfiguredUtc {
    pub fn from_settings(settings: &TimeSettings) -> Self {
        match settings.source {
            TimeSourceKind::Ntp => ConfiguredUtc::Ntp(SntpClient::new(
                settings.ntp_server.clone(),
                Duration::from_secs(settings.timeout_sec),
            )),
            TimeSourceKind::System => ConfiguredUtc::System(SystemUtc),
        }
    }
}

impl UtcSource for ConfiguredUtc {
    async fn fetch_utc(&mut self) -> Result<OffsetDateTime, TimeSyncError> {
        match self {
            ConfiguredUtc::Ntp(c) => c.fetch_utc().await,
            ConfiguredUtc::System(c) => c.fetch_utc().await,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeSource
// ---------------------------------------------------------------------------

pub struct TimeSource<U> {
    source: U,
    /// UTC at the last sync and the monotonic instant it was taken.
    synced: Option<(OffsetDateTime, Instant)>,
}

impl<U: UtcSource> TimeSource<U> {
    pub fn new(source: U) -> Self {
        Self {
            source,
            synced: None,
        }
    }

    pub async fn synchronize(&mut self) -> Result<(), TimeSyncError> {
        let utc = self.source.fetch_utc().await?;
        self.synced = Some((utc, Instant::now()));
        tracing::info!(local = %local_iso(utc), "time synchronised");
        Ok(())
    }

    /// Current UTC, extrapolated from the last sync.  Before the first sync
    /// this is the host clock.
    pub fn now_utc(&self) -> OffsetDateTime {
        match self.synced {
            Some((utc, at)) => utc + at.elapsed(),
            None => OffsetDateTime::now_utc(),
        }
    }

    pub fn local_iso_now(&self) -> String {
        local_iso(self.now_utc())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    // -- DST window ---------------------------------------------------------

    #[test]
    fn summer_is_utc_plus_two() {
        assert_eq!(local_iso(datetime!(2024-07-15 10:00:00 UTC)), "2024-07-15T12:00:00");
    }

    #[test]
    fn winter_is_utc_plus_one() {
        assert_eq!(local_iso(datetime!(2024-01-15 10:00:00 UTC)), "2024-01-15T11:00:00");
        assert_eq!(local_iso(datetime!(2024-12-01 10:00:00 UTC)), "2024-12-01T11:00:00");
    }

    #[test]
    fn march_boundary_follows_day_28() {
        assert!(!is_dst(datetime!(2024-03-27 12:00:00 UTC)));
        assert!(is_dst(datetime!(2024-03-28 00:00:00 UTC)));
        assert!(is_dst(datetime!(2024-03-31 12:00:00 UTC)));
    }

    #[test]
    fn october_boundary_follows_day_28() {
        assert!(is_dst(datetime!(2024-10-27 23:59:59 UTC)));
        assert!(!is_dst(datetime!(2024-10-28 00:00:00 UTC)));
    }

    #[test]
    fn rule_ignores_weekday() {
        // 2024-03-31 is the real changeover Sunday; the simplified rule has
        // already switched on the 28th (a Thursday).
        assert_eq!(local_iso(datetime!(2024-03-28 09:00:00 UTC)), "2024-03-28T11:00:00");
    }

    #[test]
    fn offset_can_roll_the_date() {
        assert_eq!(local_iso(datetime!(2024-07-01 23:30:00 UTC)), "2024-07-02T01:30:00");
        assert_eq!(local_iso(datetime!(2024-12-31 23:15:05 UTC)), "2025-01-01T00:15:05");
    }

    // -- SNTP parsing -------------------------------------------------------

    fn reply(unix: u64, frac: u32) -> [u8; NTP_PACKET_LEN] {
        let mut p = [0u8; NTP_PACKET_LEN];
        p[0] = 0x1C; // LI=0, VN=3, Mode=4
        p[1] = 2;
        p[40..44].copy_from_slice(&((unix + NTP_UNIX_OFFSET) as u32).to_be_bytes());
        p[44..48].copy_from_slice(&frac.to_be_bytes());
        p
    }

    #[test]
    fn request_is_client_mode_v3() {
        let req = sntp_request();
        assert_eq!(req[0] & 0x07, 3, "mode");
        assert_eq!((req[0] >> 3) & 0x07, 3, "version");
    }

    #[test]
    fn parse_valid_reply() {
        let t = parse_sntp_reply(&reply(1_700_000_000, 1 << 31)).unwrap();
        assert_eq!(t.unix_timestamp(), 1_700_000_000);
        assert_eq!(t.millisecond(), 500);
    }

    #[test]
    fn parse_reply_after_era_rollover() {
        // 2036-02-07T06:28:16Z is the first second of NTP era 1.
        let rollover = (NTP_ERA_SECS - NTP_UNIX_OFFSET) as i64;
        let t = parse_sntp_reply(&reply(rollover as u64, 0)).unwrap();
        assert_eq!(t.unix_timestamp(), rollover);
        assert_eq!(t.year(), 2036);

        let t = parse_sntp_reply(&reply(2_200_000_000, 0)).unwrap();
        assert_eq!(t.unix_timestamp(), 2_200_000_000);
    }

    #[test]
    fn parse_rejects_short_packet() {
        assert!(matches!(
            parse_sntp_reply(&[0u8; 12]),
            Err(TimeSyncError::Malformed("short packet"))
        ));
    }

    #[test]
    fn parse_rejects_client_mode() {
        let mut p = reply(1_700_000_000, 0);
        p[0] = 0x1B;
        assert!(parse_sntp_reply(&p).is_err());
    }

    #[test]
    fn parse_rejects_kiss_of_death() {
        let mut p = reply(1_700_000_000, 0);
        p[1] = 0;
        assert!(matches!(
            parse_sntp_reply(&p),
            Err(TimeSyncError::Malformed("kiss-of-death"))
        ));
    }

    // -- TimeSource -----------------------------------------------------------

    struct Fixed(Option<OffsetDateTime>);

    impl UtcSource for Fixed {
        async fn fetch_utc(&mut self) -> Result<OffsetDateTime, TimeSyncError> {
            self.0
                .ok_or_else(|| TimeSyncError::Timeout("test".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn local_time_advances_from_sync_point() {
        let mut ts = TimeSource::new(Fixed(Some(datetime!(2024-07-15 10:00:00 UTC))));
        ts.synchronize().await.unwrap();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(ts.local_iso_now(), "2024-07-15T12:01:30");
    }

    #[test]
    fn configured_source_follows_settings() {
        let mut settings = TimeSettings::default();
        assert!(matches!(ConfiguredUtc::from_settings(&settings), ConfiguredUtc::Ntp(_)));
        settings.source = TimeSourceKind::System;
        assert!(matches!(ConfiguredUtc::from_settings(&settings), ConfiguredUtc::System(_)));
    }

    #[tokio::test]
    async fn sync_failure_is_reported() {
        let mut ts = TimeSource::new(Fixed(None));
        assert!(matches!(
            ts.synchronize().await,
            Err(TimeSyncError::Timeout(_))
        ));
    }
}
