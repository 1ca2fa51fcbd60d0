use serde::{Deserialize, Serialize};

/// Snapshot pushed to viewers. Serialized as a flat object with the keys
/// `lat, lon, alt, speed, heading, battery, armed, mode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryState {
    /// Degrees.
    #[serde(rename = "lat")]
    pub latitude: Option<f64>,
    /// Degrees.
    #[serde(rename = "lon")]
    pub longitude: Option<f64>,
    /// Meters (MSL).
    #[serde(rename = "alt")]
    pub altitude: Option<f64>,
    /// Meters per second.
    #[serde(rename = "speed")]
    pub ground_speed: Option<f32>,
    /// Degrees, 0-360.
    pub heading: Option<i16>,
    /// Percent 0-100.
    #[serde(rename = "battery")]
    pub battery_remaining: Option<i8>,
    pub armed: bool,
    #[serde(rename = "mode")]
    pub flight_mode: FlightMode,
}

impl Default for TelemetryState {
    fn default() -> Self {
        Self {
            latitude: None,
            longitude: None,
            altitude: None,
            ground_speed: None,
            heading: None,
            battery_remaining: None,
            armed: false,
            flight_mode: FlightMode::Unknown,
        }
    }
}

/// Autopilot-specific mode identifier. Opaque to this system; viewers map it
/// to a name if they know the autopilot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "ModeRepr", into = "ModeRepr")]
pub enum FlightMode {
    /// No heartbeat seen yet. Serialized as `"UNKNOWN"`.
    #[default]
    Unknown,
    /// `custom_mode` from the last heartbeat. Serialized as a number.
    Custom(u32),
}

pub const UNKNOWN_MODE_LABEL: &str = "UNKNOWN";

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ModeRepr {
    Custom(u32),
    Label(String),
}

impl From<FlightMode> for ModeRepr {
    fn from(m: FlightMode) -> Self {
        match m {
            FlightMode::Unknown => ModeRepr::Label(UNKNOWN_MODE_LABEL.to_string()),
            FlightMode::Custom(n) => ModeRepr::Custom(n),
        }
    }
}

impl From<ModeRepr> for FlightMode {
    fn from(r: ModeRepr) -> Self {
        match r {
            ModeRepr::Custom(n) => FlightMode::Custom(n),
            ModeRepr::Label(_) => FlightMode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn default_state_serializes_with_sentinels() {
        let v = serde_json::to_value(TelemetryState::default()).unwrap();
        assert_eq!(
            v,
            json!({
                "lat": null, "lon": null, "alt": null,
                "speed": null, "heading": null, "battery": null,
                "armed": false, "mode": "UNKNOWN"
            })
        );
    }

    #[test]
    fn wire_keys_are_exact() {
        let st = TelemetryState {
            latitude: Some(47.397742),
            longitude: Some(8.540023),
            altitude: Some(123.456),
            ground_speed: Some(4.5),
            heading: Some(271),
            battery_remaining: Some(87),
            armed: true,
            flight_mode: FlightMode::Custom(65536),
        };
        let v = serde_json::to_value(&st).unwrap();
        let Value::Object(map) = v else { panic!("expected object") };
        let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["alt", "armed", "battery", "heading", "lat", "lon", "mode", "speed"]);
        assert_eq!(map["mode"], json!(65536));
        assert_eq!(map["heading"], json!(271));
    }

    #[test]
    fn mode_parses_back_from_either_form() {
        let m: FlightMode = serde_json::from_str("\"UNKNOWN\"").unwrap();
        assert_eq!(m, FlightMode::Unknown);
        let m: FlightMode = serde_json::from_str("393216").unwrap();
        assert_eq!(m, FlightMode::Custom(393216));
    }
}
