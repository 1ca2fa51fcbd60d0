pub mod broadcast;
pub mod doctor;
pub mod registry;
pub mod server;

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub use broadcast::{BroadcastReport, Fanout};
pub use registry::{Payload, Registry, Subscriber, SubscriberId};
pub use server::ViewerServer;

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_WS_PATH: &str = "/ws";
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 16;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FanoutError {
    /// The viewer's connection task is gone.
    #[error("subscriber {0} closed")]
    SubscriberClosed(SubscriberId),

    /// The viewer stopped draining its queue.
    #[error("subscriber {id} did not take payload within {timeout:?}")]
    PushTimeout { id: SubscriberId, timeout: Duration },

    #[error("snapshot serialization failed: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ViewerConfig {
    /// Listen address. Default `0.0.0.0:8000`.
    pub bind: Option<String>,

    /// Path that upgrades to the telemetry WebSocket. Default `/ws`.
    pub ws_path: Option<String>,

    /// A viewer that cannot take a payload within this long is dropped.
    /// Default 1000 ms.
    pub push_timeout_ms: Option<u64>,

    /// Payloads queued per viewer. Default 16.
    pub subscriber_buffer: Option<usize>,
}

impl ViewerConfig {
    pub fn bind(&self) -> &str {
        self.bind.as_deref().unwrap_or(DEFAULT_BIND)
    }

    pub fn ws_path(&self) -> &str {
        self.ws_path.as_deref().unwrap_or(DEFAULT_WS_PATH)
    }

    pub fn push_timeout(&self) -> Duration {
        self.push_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PUSH_TIMEOUT)
    }

    pub fn subscriber_buffer(&self) -> usize {
        self.subscriber_buffer.unwrap_or(DEFAULT_SUBSCRIBER_BUFFER).max(1)
    }
}
