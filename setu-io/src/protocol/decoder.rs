//! Message decoding
//!
//! The bridge only depends on the `MessageDecoder` capability: bytes in,
//! typed messages out, never an error. `MavDecoder` is the built-in
//! implementation. It hands each extracted frame to the `mavlink` crate and
//! flattens the handful of messages the bridge interprets into plain
//! structs; everything else comes back as `MessageBody::Unknown` so the
//! caller can still count it.

use super::frame::{FrameExtractor, extract, raw_header};
use super::{STX_V1, decode_c_string};
use mavlink::common::MavMessage;
use mavlink::peek_reader::PeekReader;
use mavlink::{MavHeader, Message};
use std::io::Cursor;

/// HEARTBEAT fields
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Heartbeat {
    pub custom_mode: u32,
    pub vehicle_type: u8,
    pub autopilot: u8,
    pub base_mode: u8,
    pub system_status: u8,
    pub mavlink_version: u8,
}

/// SYS_STATUS fields used for battery telemetry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SysStatus {
    /// Millivolts
    pub voltage_battery: u16,
    /// Centiamps, -1 when unknown
    pub current_battery: i16,
    /// Percent, -1 when unknown
    pub battery_remaining: i8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsRaw {
    pub fix_type: u8,
    pub satellites_visible: u8,
}

/// ATTITUDE, radians
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attitude {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

/// GLOBAL_POSITION_INT raw integer fields
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalPosition {
    /// degE7
    pub lat: i32,
    /// degE7
    pub lon: i32,
    /// mm above MSL
    pub alt: i32,
    /// mm above home
    pub relative_alt: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VfrHud {
    pub airspeed: f32,
    pub groundspeed: f32,
    pub climb: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusText {
    pub severity: u8,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamValueMsg {
    pub name: String,
    pub value: f32,
    pub param_type: u8,
    pub count: u16,
    pub index: u16,
}

/// Typed message body
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Heartbeat(Heartbeat),
    SysStatus(SysStatus),
    GpsRaw(GpsRaw),
    Attitude(Attitude),
    GlobalPosition(GlobalPosition),
    VfrHud(VfrHud),
    StatusText(StatusText),
    ParamValue(ParamValueMsg),
    Unknown { msg_id: u32 },
}

/// One decoded frame: sender identity plus typed body
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub system_id: u8,
    pub component_id: u8,
    pub sequence: u8,
    pub body: MessageBody,
}

impl DecodedMessage {
    /// Message type tag
    pub fn type_name(&self) -> &'static str {
        match self.body {
            MessageBody::Heartbeat(_) => "HEARTBEAT",
            MessageBody::SysStatus(_) => "SYS_STATUS",
            MessageBody::GpsRaw(_) => "GPS_RAW_INT",
            MessageBody::Attitude(_) => "ATTITUDE",
            MessageBody::GlobalPosition(_) => "GLOBAL_POSITION_INT",
            MessageBody::VfrHud(_) => "VFR_HUD",
            MessageBody::StatusText(_) => "STATUSTEXT",
            MessageBody::ParamValue(_) => "PARAM_VALUE",
            MessageBody::Unknown { .. } => "UNKNOWN",
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.body, MessageBody::Heartbeat(_))
    }
}

/// Decoder capability consumed by the link and bridge.
///
/// Implementations must never panic on malformed input.
pub trait MessageDecoder: Send {
    /// Feed one byte; returns a message when it completes a frame
    fn feed(&mut self, byte: u8) -> Option<DecodedMessage>;

    /// Feed a whole frame; returns the last message it completed
    fn feed_frame(&mut self, frame: &[u8]) -> Option<DecodedMessage> {
        let mut last = None;
        for &b in frame {
            if let Some(msg) = self.feed(b) {
                last = Some(msg);
            }
        }
        last
    }
}

/// Built-in decoder backed by the `mavlink` crate's common dialect
#[derive(Debug, Default)]
pub struct MavDecoder {
    extractor: FrameExtractor,
    parse_failures: u64,
}

impl MavDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames of a known message type that the parser rejected
    /// (checksum mismatch or out-of-range enum field)
    pub fn parse_failures(&self) -> u64 {
        self.parse_failures
    }

    fn decode_counted(&mut self, frame: &[u8]) -> Option<DecodedMessage> {
        let (Some(frame), _) = extract(frame) else {
            return None;
        };
        let raw = raw_header(frame)?;

        // The parser cannot check the CRC of ids outside the dialect; pass them on as-is
        if MavMessage::default_message_from_id(raw.msg_id).is_err() {
            return Some(DecodedMessage {
                system_id: raw.system_id,
                component_id: raw.component_id,
                sequence: raw.sequence,
                body: MessageBody::Unknown { msg_id: raw.msg_id },
            });
        }

        match parse_frame(frame) {
            Some((header, msg)) => Some(DecodedMessage {
                system_id: header.system_id,
                component_id: header.component_id,
                sequence: header.sequence,
                body: MessageBody::from(&msg),
            }),
            None => {
                self.parse_failures += 1;
                log::trace!(
                    "Rejected msg {} from {}:{}",
                    raw.msg_id,
                    raw.system_id,
                    raw.component_id
                );
                None
            }
        }
    }
}

impl MessageDecoder for MavDecoder {
    fn feed(&mut self, byte: u8) -> Option<DecodedMessage> {
        self.extractor.push(&[byte]);
        let frame = self.extractor.next_frame()?;
        self.decode_counted(&frame)
    }

    fn feed_frame(&mut self, frame: &[u8]) -> Option<DecodedMessage> {
        self.decode_counted(frame)
    }
}

/// Parse one complete frame with the version its start marker announces
pub fn parse_frame(frame: &[u8]) -> Option<(MavHeader, MavMessage)> {
    let mut reader = PeekReader::new(Cursor::new(frame));
    let parsed = if frame.first() == Some(&STX_V1) {
        mavlink::read_v1_msg::<MavMessage, _>(&mut reader)
    } else {
        mavlink::read_v2_msg::<MavMessage, _>(&mut reader)
    };
    parsed.ok()
}

impl From<&MavMessage> for MessageBody {
    fn from(msg: &MavMessage) -> Self {
        match msg {
            MavMessage::HEARTBEAT(d) => MessageBody::Heartbeat(Heartbeat {
                custom_mode: d.custom_mode,
                vehicle_type: d.mavtype as u8,
                autopilot: d.autopilot as u8,
                base_mode: d.base_mode.bits(),
                system_status: d.system_status as u8,
                mavlink_version: d.mavlink_version,
            }),
            MavMessage::SYS_STATUS(d) => MessageBody::SysStatus(SysStatus {
                voltage_battery: d.voltage_battery,
                current_battery: d.current_battery,
                battery_remaining: d.battery_remaining,
            }),
            MavMessage::PARAM_VALUE(d) => MessageBody::ParamValue(ParamValueMsg {
                name: decode_c_string(&d.param_id),
                value: d.param_value,
                param_type: d.param_type as u8,
                count: d.param_count,
                index: d.param_index,
            }),
            MavMessage::GPS_RAW_INT(d) => MessageBody::GpsRaw(GpsRaw {
                fix_type: d.fix_type as u8,
                satellites_visible: d.satellites_visible,
            }),
            MavMessage::ATTITUDE(d) => MessageBody::Attitude(Attitude {
                roll: d.roll,
                pitch: d.pitch,
                yaw: d.yaw,
            }),
            MavMessage::GLOBAL_POSITION_INT(d) => MessageBody::GlobalPosition(GlobalPosition {
                lat: d.lat,
                lon: d.lon,
                alt: d.alt,
                relative_alt: d.relative_alt,
            }),
            MavMessage::VFR_HUD(d) => MessageBody::VfrHud(VfrHud {
                airspeed: d.airspeed,
                groundspeed: d.groundspeed,
                climb: d.climb,
            }),
            MavMessage::STATUSTEXT(d) => MessageBody::StatusText(StatusText {
                severity: d.severity as u8,
                text: decode_c_string(&d.text),
            }),
            other => MessageBody::Unknown {
                msg_id: other.message_id(),
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_frames::*;
    use super::*;
    use mavlink::common::{
        GLOBAL_POSITION_INT_DATA, MavSysStatusSensor, MavSysStatusSensorExtended, SYS_STATUS_DATA,
    };

    #[test]
    fn test_decode_heartbeat() {
        let frame = heartbeat(7, 1, 0x81, 5);
        let msg = MavDecoder::new().feed_frame(&frame).unwrap();
        assert_eq!(msg.system_id, 7);
        assert_eq!(msg.component_id, 1);
        assert_eq!(msg.type_name(), "HEARTBEAT");
        let MessageBody::Heartbeat(hb) = msg.body else {
            panic!("expected heartbeat");
        };
        assert_eq!(hb.custom_mode, 5);
        assert_eq!(hb.base_mode, 0x81);
        assert_eq!(hb.vehicle_type, 2);
        assert_eq!(hb.autopilot, 3);
        assert_eq!(hb.system_status, 4);
    }

    #[test]
    fn test_byte_feed_matches_frame_feed() {
        let mut stream = vec![0x00, 0x42];
        stream.extend(status_text(4, "PreArm: Check fence"));
        let mut decoder = MavDecoder::new();
        let decoded: Vec<_> = stream.iter().filter_map(|&b| decoder.feed(b)).collect();
        assert_eq!(decoded.len(), 1);
        assert_eq!(
            decoded[0].body,
            MessageBody::StatusText(StatusText {
                severity: 4,
                text: "PreArm: Check fence".to_string()
            })
        );
    }

    #[test]
    fn test_checksum_mismatch_dropped() {
        let mut frame = heartbeat(1, 1, 0, 0);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let mut decoder = MavDecoder::new();
        assert!(decoder.feed_frame(&frame).is_none());
        assert_eq!(decoder.parse_failures(), 1);
    }

    #[test]
    fn test_truncated_payload_zero_extended() {
        // Only the voltage is set, so v2 truncation drops everything after it
        let msg = MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            onboard_control_sensors_present: MavSysStatusSensor::empty(),
            onboard_control_sensors_enabled: MavSysStatusSensor::empty(),
            onboard_control_sensors_health: MavSysStatusSensor::empty(),
            load: 0,
            voltage_battery: 12_600,
            current_battery: 0,
            battery_remaining: 0,
            drop_rate_comm: 0,
            errors_comm: 0,
            errors_count1: 0,
            errors_count2: 0,
            errors_count3: 0,
            errors_count4: 0,
            onboard_control_sensors_present_extended: MavSysStatusSensorExtended::empty(),
            onboard_control_sensors_enabled_extended: MavSysStatusSensorExtended::empty(),
            onboard_control_sensors_health_extended: MavSysStatusSensorExtended::empty(),
        });
        let frame = encode(&msg, 1, 1);
        assert!((frame[1] as usize) < 31);
        let msg = MavDecoder::new().feed_frame(&frame).unwrap();
        assert_eq!(
            msg.body,
            MessageBody::SysStatus(SysStatus {
                voltage_battery: 12_600,
                current_battery: 0,
                battery_remaining: 0,
            })
        );
    }

    #[test]
    fn test_v1_global_position() {
        let msg = MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            time_boot_ms: 0,
            lat: 473_977_420,
            lon: 85_455_940,
            alt: 488_000,
            relative_alt: 0,
            vx: 0,
            vy: 0,
            vz: 0,
            hdg: 0,
        });
        let mut frame = Vec::new();
        let header = MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: 3,
        };
        mavlink::write_v1_msg(&mut frame, header, &msg).unwrap();
        let decoded = MavDecoder::new().feed_frame(&frame).unwrap();
        assert_eq!(decoded.sequence, 3);
        assert_eq!(
            decoded.body,
            MessageBody::GlobalPosition(GlobalPosition {
                lat: 473_977_420,
                lon: 85_455_940,
                alt: 488_000,
                relative_alt: 0,
            })
        );
    }

    #[test]
    fn test_unknown_message_passes_without_crc_check() {
        let frame = unknown(0x1234, &[1, 2, 3]);
        let mut decoder = MavDecoder::new();
        let msg = decoder.feed_frame(&frame).unwrap();
        assert_eq!(msg.body, MessageBody::Unknown { msg_id: 0x1234 });
        assert_eq!(decoder.parse_failures(), 0);
    }

    #[test]
    fn test_uninterpreted_dialect_message_is_unknown() {
        // SYSTEM_TIME is part of the dialect but not interpreted here
        let msg = MavMessage::default_message_from_id(2).unwrap();
        let frame = encode(&msg, 1, 1);
        let decoded = MavDecoder::new().feed_frame(&frame).unwrap();
        assert_eq!(decoded.body, MessageBody::Unknown { msg_id: 2 });
        assert_eq!(decoded.type_name(), "UNKNOWN");
    }

    #[test]
    fn test_garbage_never_panics() {
        let mut decoder = MavDecoder::new();
        for frame in [&[][..], &[0xFD][..], &[0xFE, 0xFF, 0, 0, 0, 0][..], &[0xFD; 40][..]] {
            let _ = decoder.feed_frame(frame);
            for &b in frame {
                let _ = decoder.feed(b);
            }
        }
    }
}
