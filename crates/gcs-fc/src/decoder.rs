//! Decoder loop: polls the link, turns the recognized messages into field
//! updates and signals the fan-out once per recognized message.
//!
//! | Message | Updates |
//! |---|---|
//! | `GLOBAL_POSITION_INT` | `lat / 1e7`, `lon / 1e7`, `alt / 1e3` |
//! | `VFR_HUD` | ground speed, heading |
//! | `BATTERY_STATUS` | battery remaining |
//! | `HEARTBEAT` | armed flag, custom mode |
//!
//! Everything else is ignored. Per-message errors are logged and the loop
//! keeps going; only shutdown (or a permanently closed link) ends it.

use std::future::Future;
use std::time::Duration;

use gcs_proto::telemetry::FlightMode;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::error::LinkError;
use crate::mav::Link;
use crate::message::RawMessage;
use crate::state::{FieldUpdate, TelemetryStore};
use crate::{shutdown_requested, DEFAULT_IDLE_DELAY, DEFAULT_RECV_TIMEOUT};

/// MAV_MODE_FLAG_SAFETY_ARMED
pub const ARMED_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTiming {
    pub recv_timeout: Duration,
    pub idle_delay: Duration,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self { recv_timeout: DEFAULT_RECV_TIMEOUT, idle_delay: DEFAULT_IDLE_DELAY }
    }
}

/// Told after every recognized message, once its updates are in the store.
pub trait UpdateSink {
    fn state_changed(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Field updates carried by `msg`, or `None` if the type is not one we read.
pub fn decode(msg: &RawMessage) -> Option<Vec<FieldUpdate>> {
    match msg {
        RawMessage::GlobalPosition { lat, lon, alt } => {
            let mut out = Vec::with_capacity(3);
            if let Some(v) = lat {
                out.push(FieldUpdate::Latitude(f64::from(*v) / 1e7));
            }
            if let Some(v) = lon {
                out.push(FieldUpdate::Longitude(f64::from(*v) / 1e7));
            }
            if let Some(v) = alt {
                out.push(FieldUpdate::Altitude(f64::from(*v) / 1e3));
            }
            Some(out)
        }
        RawMessage::FlightData { groundspeed, heading } => {
            let mut out = Vec::with_capacity(2);
            if let Some(v) = groundspeed {
                out.push(FieldUpdate::GroundSpeed(*v));
            }
            if let Some(v) = heading {
                out.push(FieldUpdate::Heading(*v));
            }
            Some(out)
        }
        RawMessage::Battery { battery_remaining } => Some(
            battery_remaining
                // -1 is the autopilot's "unknown"; viewers get null, never -1
                .map(|b| vec![FieldUpdate::BatteryRemaining((b >= 0).then_some(b))])
                .unwrap_or_default(),
        ),
        RawMessage::Heartbeat(hb) => Some(vec![
            FieldUpdate::Armed(hb.base_mode & ARMED_FLAG != 0),
            FieldUpdate::FlightMode(FlightMode::Custom(hb.custom_mode)),
        ]),
        RawMessage::Other { .. } => None,
    }
}

/// Applies one message and signals the sink. Returns whether the message was
/// recognized.
pub async fn process_message<S>(msg: &RawMessage, store: &TelemetryStore, sink: &S) -> bool
where
    S: UpdateSink + Sync,
{
    let Some(updates) = decode(msg) else {
        trace!("decoder: ignoring {}", msg.type_name());
        return false;
    };
    store.apply(&updates);
    if let RawMessage::Heartbeat(hb) = msg {
        debug!("decoder: heartbeat base_mode={:#04x} custom_mode={}", hb.base_mode, hb.custom_mode);
    }
    if let Err(e) = sink.state_changed().await {
        warn!("decoder: broadcast error: {:#}", e);
    }
    true
}

/// Runs until `shutdown` fires. Returns `Err(LinkError::Closed)` only if the
/// link went away for good.
pub async fn run_decoder<S>(
    link: &mut Link,
    store: &TelemetryStore,
    sink: &S,
    timing: LoopTiming,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), LinkError>
where
    S: UpdateSink + Sync,
{
    info!("decoder: started on {}", link.address());
    loop {
        let polled = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            r = link.recv_timeout(timing.recv_timeout) => r,
        };
        match polled {
            Ok(Some(msg)) => {
                process_message(&msg, store, sink).await;
            }
            Ok(None) => {
                if idle(&mut shutdown, timing.idle_delay).await {
                    break;
                }
            }
            Err(e @ LinkError::Closed { .. }) => {
                warn!("decoder: {}", e);
                return Err(e);
            }
            Err(e) => {
                warn!("decoder: parser error: {}", e);
                if idle(&mut shutdown, timing.idle_delay).await {
                    break;
                }
            }
        }
    }
    info!("decoder: stopped");
    Ok(())
}

/// True if shutdown was requested while waiting.
async fn idle(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown_requested(shutdown) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
