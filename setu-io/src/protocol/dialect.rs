//! Numeric code to human string lookups
//!
//! Heartbeat fields arrive as raw integers; the telemetry store asks a
//! `DialectLookup` for display strings and keeps the raw values alongside.
//! Standard enum names come from the `mavlink` crate; the flight mode
//! tables are ArduPilot's `custom_mode` numbering, which the common dialect
//! does not carry.

use mavlink::common::{MavAutopilot, MavState, MavType};
use num_traits::FromPrimitive;

/// Dialect lookup capability
pub trait DialectLookup: Send + Sync {
    /// Flight mode name for `custom_mode`, interpreted per vehicle type
    fn mode_name(&self, vehicle_type: u8, custom_mode: u32) -> String;
    fn vehicle_type_name(&self, vehicle_type: u8) -> String;
    fn autopilot_name(&self, autopilot: u8) -> String;
    fn state_name(&self, state: u8) -> String;
}

/// Common MAV_* enum names plus ArduPilot custom-mode tables
#[derive(Debug, Default, Clone, Copy)]
pub struct ArduPilotDialect;

const COPTER_MODES: &[(u32, &str)] = &[
    (0, "STABILIZE"),
    (1, "ACRO"),
    (2, "ALT_HOLD"),
    (3, "AUTO"),
    (4, "GUIDED"),
    (5, "LOITER"),
    (6, "RTL"),
    (7, "CIRCLE"),
    (9, "LAND"),
    (11, "DRIFT"),
    (13, "SPORT"),
    (14, "FLIP"),
    (15, "AUTOTUNE"),
    (16, "POSHOLD"),
    (17, "BRAKE"),
    (18, "THROW"),
    (21, "SMART_RTL"),
    (23, "FOLLOW"),
];

const PLANE_MODES: &[(u32, &str)] = &[
    (0, "MANUAL"),
    (1, "CIRCLE"),
    (2, "STABILIZE"),
    (3, "TRAINING"),
    (4, "ACRO"),
    (5, "FBWA"),
    (6, "FBWB"),
    (7, "CRUISE"),
    (8, "AUTOTUNE"),
    (10, "AUTO"),
    (11, "RTL"),
    (12, "LOITER"),
    (15, "GUIDED"),
    (17, "QSTABILIZE"),
    (18, "QHOVER"),
    (19, "QLOITER"),
    (20, "QLAND"),
    (21, "QRTL"),
];

const ROVER_MODES: &[(u32, &str)] = &[
    (0, "MANUAL"),
    (1, "ACRO"),
    (3, "STEERING"),
    (4, "HOLD"),
    (5, "LOITER"),
    (6, "FOLLOW"),
    (7, "SIMPLE"),
    (10, "AUTO"),
    (11, "RTL"),
    (12, "SMART_RTL"),
    (15, "GUIDED"),
];

fn lookup<K: PartialEq + Copy>(table: &[(K, &'static str)], key: K) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, name)| *name)
}

/// Variant name of a dialect enum, or `UNKNOWN(code)` outside its range
fn enum_name<T: FromPrimitive + std::fmt::Debug>(code: u8) -> String {
    match T::from_u8(code) {
        Some(value) => format!("{:?}", value),
        None => format!("UNKNOWN({})", code),
    }
}

impl ArduPilotDialect {
    fn mode_table(vehicle_type: u8) -> Option<&'static [(u32, &'static str)]> {
        match vehicle_type {
            2 | 3 | 4 | 13 | 14 | 15 | 29 => Some(COPTER_MODES),
            1 | 19 | 20 | 21 => Some(PLANE_MODES),
            10 | 11 => Some(ROVER_MODES),
            _ => None,
        }
    }
}

impl DialectLookup for ArduPilotDialect {
    fn mode_name(&self, vehicle_type: u8, custom_mode: u32) -> String {
        Self::mode_table(vehicle_type)
            .and_then(|table| lookup(table, custom_mode))
            .map(str::to_string)
            .unwrap_or_else(|| format!("Mode({})", custom_mode))
    }

    fn vehicle_type_name(&self, vehicle_type: u8) -> String {
        enum_name::<MavType>(vehicle_type)
    }

    fn autopilot_name(&self, autopilot: u8) -> String {
        enum_name::<MavAutopilot>(autopilot)
    }

    fn state_name(&self, state: u8) -> String {
        enum_name::<MavState>(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_depends_on_vehicle_type() {
        let d = ArduPilotDialect;
        assert_eq!(d.mode_name(2, 5), "LOITER");
        assert_eq!(d.mode_name(1, 5), "FBWA");
        assert_eq!(d.mode_name(10, 4), "HOLD");
        assert_eq!(d.mode_name(6, 5), "Mode(5)");
        assert_eq!(d.mode_name(2, 99), "Mode(99)");
    }

    #[test]
    fn test_enum_names_and_fallback() {
        let d = ArduPilotDialect;
        assert_eq!(d.vehicle_type_name(2), "MAV_TYPE_QUADROTOR");
        assert_eq!(d.autopilot_name(3), "MAV_AUTOPILOT_ARDUPILOTMEGA");
        assert_eq!(d.state_name(4), "MAV_STATE_ACTIVE");
        assert_eq!(d.vehicle_type_name(10), "MAV_TYPE_GROUND_ROVER");
        assert_eq!(d.state_name(200), "UNKNOWN(200)");
        assert_eq!(d.autopilot_name(250), "UNKNOWN(250)");
    }
}
