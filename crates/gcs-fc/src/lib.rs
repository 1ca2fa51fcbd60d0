pub mod decoder;
pub mod doctor;
pub mod error;
pub mod mav;
pub mod message;
pub mod state;

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;

pub use decoder::{run_decoder, LoopTiming, UpdateSink};
pub use error::{DecodeError, LinkError};
pub use mav::{connect, wait_heartbeat, Connected, HeartbeatInfo, Link};
pub use message::RawMessage;
pub use state::{FieldUpdate, TelemetryStore};

pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(1000);
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_IDLE_DELAY: Duration = Duration::from_millis(100);

/// Resolves once shutdown is signalled or the sender side is gone.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// mavlink connection address, e.g. `udpin:0.0.0.0:14550`,
    /// `tcpout:127.0.0.1:5760` or `serial:/dev/ttyUSB0:57600`.
    pub address: String,

    /// Reopen the transport after an I/O error without repeating the
    /// heartbeat handshake. Default true.
    pub autoreconnect: Option<bool>,

    /// Delay between reopen attempts. Default 1000 ms.
    pub reconnect_backoff_ms: Option<u64>,

    /// How long to wait for the first HEARTBEAT. Default 15 s.
    pub heartbeat_timeout_ms: Option<u64>,

    /// Decoder receive timeout per poll. Default 100 ms.
    pub recv_timeout_ms: Option<u64>,

    /// Decoder sleep after an empty poll or an error. Default 100 ms.
    pub idle_delay_ms: Option<u64>,
}

impl LinkConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            autoreconnect: None,
            reconnect_backoff_ms: None,
            heartbeat_timeout_ms: None,
            recv_timeout_ms: None,
            idle_delay_ms: None,
        }
    }

    pub fn autoreconnect(&self) -> bool {
        self.autoreconnect.unwrap_or(true)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        self.reconnect_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RECONNECT_BACKOFF)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT)
    }

    pub fn loop_timing(&self) -> LoopTiming {
        LoopTiming {
            recv_timeout: self.recv_timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_RECV_TIMEOUT),
            idle_delay: self.idle_delay_ms.map(Duration::from_millis).unwrap_or(DEFAULT_IDLE_DELAY),
        }
    }
}
