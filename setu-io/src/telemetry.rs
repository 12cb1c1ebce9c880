//! Telemetry state built from decoded messages
//!
//! Only the serial reader mutates the store (`apply`); everything else reads
//! copies via `snapshot`.

use crate::events::EventSink;
use crate::protocol::decoder::{DecodedMessage, MessageBody};
use crate::protocol::DialectLookup;
use mavlink::common::MavModeFlag;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

/// Status-text ring capacity
pub const MESSAGE_LOG_CAPACITY: usize = 20;

/// MAV_SEVERITY names, indexed by code
const SEVERITY_NAMES: [&str; 8] = [
    "EMERGENCY",
    "ALERT",
    "CRITICAL",
    "ERROR",
    "WARNING",
    "NOTICE",
    "INFO",
    "DEBUG",
];

pub fn severity_name(code: u8) -> &'static str {
    SEVERITY_NAMES
        .get(code as usize)
        .copied()
        .unwrap_or("UNKNOWN")
}

fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Radians
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttitudeGroup {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GpsGroup {
    /// Degrees
    pub lat: f64,
    /// Degrees
    pub lon: f64,
    /// Metres above MSL
    pub alt: f64,
    pub satellites: u8,
    pub fix_type: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatteryGroup {
    /// Volts
    pub voltage: f64,
    /// Amps
    pub current: f64,
    /// Percent, -1 when the vehicle doesn't know
    pub remaining: i8,
}

/// m/s
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpeedGroup {
    pub groundspeed: f32,
    pub airspeed: f32,
    pub climb: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemGroup {
    pub armed: bool,
    pub mode: String,
    pub vehicle_type: String,
    pub autopilot: String,
    pub state: String,
    pub system_id: u8,
    pub component_id: u8,
    pub base_mode: u8,
    pub custom_mode: u32,
    pub vehicle_type_raw: u8,
    pub autopilot_raw: u8,
    pub state_raw: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusMessage {
    pub severity: &'static str,
    pub text: String,
    pub timestamp_us: u64,
}

/// Copy of the current telemetry
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub attitude: AttitudeGroup,
    pub gps: GpsGroup,
    pub battery: BatteryGroup,
    pub speed: SpeedGroup,
    pub system: SystemGroup,
    /// Newest first
    pub messages: VecDeque<StatusMessage>,
    pub last_update_us: u64,
}

pub struct TelemetryStore {
    state: Mutex<TelemetrySnapshot>,
    dialect: Arc<dyn DialectLookup>,
    sink: Arc<dyn EventSink>,
}

impl TelemetryStore {
    pub fn new(dialect: Arc<dyn DialectLookup>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            state: Mutex::new(TelemetrySnapshot {
                messages: VecDeque::with_capacity(MESSAGE_LOG_CAPACITY),
                ..Default::default()
            }),
            dialect,
            sink,
        }
    }

    /// Fold one message into the state.
    ///
    /// Returns false for messages that carry no telemetry (parameter
    /// values, unknown ids).
    pub fn apply(&self, msg: &DecodedMessage) -> bool {
        {
            let mut s = self.state.lock();
            match &msg.body {
                MessageBody::Heartbeat(hb) => {
                    let sys = &mut s.system;
                    sys.armed = MavModeFlag::from_bits_truncate(hb.base_mode)
                        .contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
                    sys.mode = self.dialect.mode_name(hb.vehicle_type, hb.custom_mode);
                    sys.vehicle_type = self.dialect.vehicle_type_name(hb.vehicle_type);
                    sys.autopilot = self.dialect.autopilot_name(hb.autopilot);
                    sys.state = self.dialect.state_name(hb.system_status);
                    sys.system_id = msg.system_id;
                    sys.component_id = msg.component_id;
                    sys.base_mode = hb.base_mode;
                    sys.custom_mode = hb.custom_mode;
                    sys.vehicle_type_raw = hb.vehicle_type;
                    sys.autopilot_raw = hb.autopilot;
                    sys.state_raw = hb.system_status;
                }
                MessageBody::Attitude(a) => {
                    s.attitude = AttitudeGroup {
                        roll: a.roll,
                        pitch: a.pitch,
                        yaw: a.yaw,
                    };
                }
                MessageBody::GlobalPosition(p) => {
                    s.gps.lat = p.lat as f64 * 1e-7;
                    s.gps.lon = p.lon as f64 * 1e-7;
                    s.gps.alt = p.alt as f64 * 1e-3;
                }
                MessageBody::SysStatus(st) => {
                    s.battery = BatteryGroup {
                        voltage: st.voltage_battery as f64 * 1e-3,
                        current: st.current_battery as f64 * 1e-2,
                        remaining: st.battery_remaining,
                    };
                }
                MessageBody::StatusText(t) => {
                    if s.messages.len() == MESSAGE_LOG_CAPACITY {
                        s.messages.pop_back();
                    }
                    s.messages.push_front(StatusMessage {
                        severity: severity_name(t.severity),
                        text: t.text.clone(),
                        timestamp_us: now_us(),
                    });
                }
                MessageBody::VfrHud(v) => {
                    s.speed = SpeedGroup {
                        groundspeed: v.groundspeed,
                        airspeed: v.airspeed,
                        climb: v.climb,
                    };
                }
                MessageBody::GpsRaw(g) => {
                    s.gps.satellites = g.satellites_visible;
                    s.gps.fix_type = g.fix_type;
                }
                MessageBody::ParamValue(_) | MessageBody::Unknown { .. } => return false,
            }
            s.last_update_us = now_us();
        }

        if self.sink.has_subscribers() {
            match serde_json::to_value(self.snapshot()) {
                Ok(payload) => self.sink.notify("telemetry", payload),
                Err(e) => log::warn!("Telemetry serialization failed: {}", e),
            }
        }
        true
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.state.lock().clone()
    }
}
