use std::sync::{PoisonError, RwLock};

use gcs_proto::telemetry::{FlightMode, TelemetryState};

/// One canonical field with its new value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldUpdate {
    Latitude(f64),
    Longitude(f64),
    Altitude(f64),
    GroundSpeed(f32),
    Heading(i16),
    BatteryRemaining(Option<i8>),
    Armed(bool),
    FlightMode(FlightMode),
}

impl FieldUpdate {
    fn apply_to(self, st: &mut TelemetryState) {
        match self {
            FieldUpdate::Latitude(v) => st.latitude = Some(v),
            FieldUpdate::Longitude(v) => st.longitude = Some(v),
            FieldUpdate::Altitude(v) => st.altitude = Some(v),
            FieldUpdate::GroundSpeed(v) => st.ground_speed = Some(v),
            FieldUpdate::Heading(v) => st.heading = Some(v),
            FieldUpdate::BatteryRemaining(v) => st.battery_remaining = v,
            FieldUpdate::Armed(v) => st.armed = v,
            FieldUpdate::FlightMode(v) => st.flight_mode = v,
        }
    }
}

/// Latest value of every canonical field. One writer (the decoder loop),
/// any number of readers.
#[derive(Debug, Default)]
pub struct TelemetryStore {
    inner: RwLock<TelemetryState>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, u: FieldUpdate) {
        let mut st = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        u.apply_to(&mut st);
    }

    /// Applies all updates under a single write lock, so a snapshot sees
    /// either none or all of them.
    pub fn apply(&self, updates: &[FieldUpdate]) {
        if updates.is_empty() {
            return;
        }
        let mut st = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for u in updates {
            u.apply_to(&mut st);
        }
    }

    pub fn snapshot(&self) -> TelemetryState {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
