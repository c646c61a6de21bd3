//! Error taxonomy for the station and the recoverable/fatal split the
//! supervisor acts on.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Network link could not be brought up.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("broker host {host:?} not reachable after {attempts} attempt(s)")]
    Unreachable { host: String, attempts: u32 },
}

/// External time source failed.
#[derive(Debug, Error)]
pub enum TimeSyncError {
    #[error("ntp socket error: {0}")]
    Io(#[from] io::Error),

    #[error("ntp server {0} did not answer in time")]
    Timeout(String),

    #[error("malformed ntp response: {0}")]
    Malformed(&'static str),
}

/// Persisted configuration or log file could not be written.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode config: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A sensor produced no reading or an implausible one.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("{sensor} read failed: {detail}")]
    Read { sensor: &'static str, detail: String },

    #[error("{sensor} reading {value} is implausible")]
    Implausible { sensor: &'static str, value: f64 },
}

/// Remote pub/sub channel failure.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("mqtt connect failed: {0}")]
    Connect(String),

    #[error("mqtt connect timed out after {0}s")]
    ConnectTimeout(u64),

    #[error("mqtt subscribe to {topic} failed: {detail}")]
    Subscribe { topic: String, detail: String },

    #[error("mqtt publish to {topic} failed: {detail}")]
    Publish { topic: String, detail: String },

    #[error("mqtt connection lost: {0}")]
    Lost(String),
}

/// GPIO or CPU clock control failure.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("gpio {pin}: {detail}")]
    Pin { pin: u8, detail: String },

    #[error("cpu clock: {0}")]
    Clock(String),
}

#[derive(Debug, Error)]
pub enum StationError {
    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error(transparent)]
    TimeSync(#[from] TimeSyncError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Board(#[from] BoardError),
}

/// What the supervisor should do about a failed phase.
#[derive(Debug)]
pub enum Fault {
    /// Restart the machine from BOOT after the reset delay.
    Recoverable(StationError),
    /// Stop the process; the device has to be reset from outside.
    Fatal(StationError),
}

impl Fault {
    pub fn error(&self) -> &StationError {
        match self {
            Fault::Recoverable(e) | Fault::Fatal(e) => e,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Fault::Fatal(_))
    }
}

impl From<StationError> for Fault {
    fn from(e: StationError) -> Self {
        match e {
            // Losing control of the power rails or the relay is not something
            // a soft restart can fix.
            StationError::Board(_) => Fault::Fatal(e),
            _ => Fault::Recoverable(e),
        }
    }
}

macro_rules! fault_from {
    ($($ty:ty),+) => {
        $(impl From<$ty> for Fault {
            fn from(e: $ty) -> Self {
                Fault::from(StationError::from(e))
            }
        })+
    };
}

fault_from!(ConnError, TimeSyncError, StorageError, SensorError, ChannelError, BoardError);
