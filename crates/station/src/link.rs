//! Network link bring-up.  The station has no radio of its own to manage, so
//! "link up" means the broker host resolves: DHCP, DNS and routing are in
//! place.

use std::time::Duration;

use tokio::net::lookup_host;
use tokio::time::sleep;

use crate::error::ConnError;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub trait NetworkLink {
    async fn up(&mut self) -> Result<(), ConnError>;

    async fn down(&mut self);
}

/// Waits for `host:port` to resolve, polling once a second.
pub struct HostLink {
    host: String,
    port: u16,
    attempts: u32,
}

impl HostLink {
    pub fn new(host: impl Into<String>, port: u16, attempts: u32) -> Self {
        Self {
            host: host.into(),
            port,
            attempts: attempts.max(1),
        }
    }
}

impl NetworkLink for HostLink {
    async fn up(&mut self) -> Result<(), ConnError> {
        for attempt in 1..=self.attempts {
            match lookup_host((self.host.as_str(), self.port)).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        tracing::info!(%addr, attempt, "network link up");
                        return Ok(());
                    }
                }
                Err(e) => tracing::debug!(host = %self.host, attempt, "waiting for link: {e}"),
            }
            if attempt < self.attempts {
                sleep(POLL_INTERVAL).await;
            }
        }

        Err(ConnError::Unreachable {
            host: self.host.clone(),
            attempts: self.attempts,
        })
    }

    async fn down(&mut self) {
        tracing::debug!("network link released");
    }
}
