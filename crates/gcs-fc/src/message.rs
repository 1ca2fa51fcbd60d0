use mavlink::common::{MavAutopilot, MavMessage, MavType};
use mavlink::{MavHeader, Message};

/// A received message reduced to the fields the decoder reads.
#[derive(Debug, Clone, PartialEq)]
pub enum RawMessage {
    Heartbeat(Heartbeat),
    /// GLOBAL_POSITION_INT: degE7, degE7, mm.
    GlobalPosition {
        lat: Option<i32>,
        lon: Option<i32>,
        alt: Option<i32>,
    },
    /// VFR_HUD: m/s, degrees.
    FlightData {
        groundspeed: Option<f32>,
        heading: Option<i16>,
    },
    /// BATTERY_STATUS: percent, -1 when the autopilot does not know.
    Battery { battery_remaining: Option<i8> },
    Other { name: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub system_id: u8,
    pub component_id: u8,
    pub mavtype: MavType,
    pub autopilot: MavAutopilot,
    pub base_mode: u8,
    pub custom_mode: u32,
}

impl RawMessage {
    pub fn from_mav(hdr: &MavHeader, msg: &MavMessage) -> Self {
        match msg {
            MavMessage::HEARTBEAT(hb) => RawMessage::Heartbeat(Heartbeat {
                system_id: hdr.system_id,
                component_id: hdr.component_id,
                mavtype: hb.mavtype,
                autopilot: hb.autopilot,
                base_mode: hb.base_mode.bits(),
                custom_mode: hb.custom_mode,
            }),
            MavMessage::GLOBAL_POSITION_INT(p) => RawMessage::GlobalPosition {
                lat: Some(p.lat),
                lon: Some(p.lon),
                alt: Some(p.alt),
            },
            MavMessage::VFR_HUD(v) => RawMessage::FlightData {
                groundspeed: Some(v.groundspeed),
                heading: Some(v.heading),
            },
            MavMessage::BATTERY_STATUS(b) => RawMessage::Battery {
                battery_remaining: Some(b.battery_remaining),
            },
            other => RawMessage::Other { name: other.message_name() },
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RawMessage::Heartbeat(_) => "HEARTBEAT",
            RawMessage::GlobalPosition { .. } => "GLOBAL_POSITION_INT",
            RawMessage::FlightData { .. } => "VFR_HUD",
            RawMessage::Battery { .. } => "BATTERY_STATUS",
            RawMessage::Other { name } => name,
        }
    }
}
