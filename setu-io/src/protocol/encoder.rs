//! Outgoing frame construction
//!
//! `FrameBuilder` stamps every frame with the ground station's identity and
//! a wrapping sequence number, then serializes it as v2 through the
//! `mavlink` crate.

use super::encode_param_id;
use crate::error::{Error, Result};
use crate::params::ParamType;
use mavlink::MavHeader;
use mavlink::common::{MavMessage, PARAM_REQUEST_READ_DATA, PARAM_SET_DATA};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Ground station system id used on outgoing frames
pub const GCS_SYSTEM_ID: u8 = 255;
/// Ground station component id (MAV_COMP_ID_MISSIONPLANNER)
pub const GCS_COMPONENT_ID: u8 = 190;

/// (system id, component id) pair identifying one end of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkIdentity {
    pub system_id: u8,
    pub component_id: u8,
}

impl LinkIdentity {
    pub const fn new(system_id: u8, component_id: u8) -> Self {
        Self {
            system_id,
            component_id,
        }
    }

    /// Identity this bridge uses as a sender
    pub const fn ground_station() -> Self {
        Self::new(GCS_SYSTEM_ID, GCS_COMPONENT_ID)
    }
}

/// Builds outgoing frames with a per-link sequence counter
pub struct FrameBuilder {
    source: LinkIdentity,
    seq: AtomicU8,
}

impl FrameBuilder {
    pub fn new(source: LinkIdentity) -> Self {
        Self {
            source,
            seq: AtomicU8::new(0),
        }
    }

    /// Serialize a message as a v2 frame
    pub fn build(&self, msg: &MavMessage) -> Result<Vec<u8>> {
        let header = MavHeader {
            system_id: self.source.system_id,
            component_id: self.source.component_id,
            sequence: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        let mut buf = Vec::with_capacity(280);
        mavlink::write_v2_msg(&mut buf, header, msg).map_err(|e| Error::Encode(format!("{e:?}")))?;
        Ok(buf)
    }

    /// PARAM_REQUEST_READ by name (param_index = -1)
    pub fn param_request_read(&self, target: LinkIdentity, name: &str) -> Result<Vec<u8>> {
        let param_id =
            encode_param_id(name).ok_or_else(|| Error::InvalidParamName(name.to_string()))?;
        self.build(&MavMessage::PARAM_REQUEST_READ(PARAM_REQUEST_READ_DATA {
            param_index: -1,
            target_system: target.system_id,
            target_component: target.component_id,
            param_id,
        }))
    }

    /// PARAM_SET; the value travels as a float regardless of `param_type`
    pub fn param_set(
        &self,
        target: LinkIdentity,
        name: &str,
        value: f64,
        param_type: ParamType,
    ) -> Result<Vec<u8>> {
        let param_id =
            encode_param_id(name).ok_or_else(|| Error::InvalidParamName(name.to_string()))?;
        self.build(&MavMessage::PARAM_SET(PARAM_SET_DATA {
            param_value: value as f32,
            target_system: target.system_id,
            target_component: target.component_id,
            param_id,
            param_type: param_type.into(),
        }))
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new(LinkIdentity::ground_station())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_c_string;
    use crate::protocol::decoder::parse_frame;
    use mavlink::common::MavParamType;

    #[test]
    fn test_sequence_increments_and_wraps() {
        let builder = FrameBuilder::default();
        builder.seq.store(254, Ordering::Relaxed);
        let target = LinkIdentity::new(1, 1);
        let a = builder.param_request_read(target, "A").unwrap();
        let b = builder.param_request_read(target, "A").unwrap();
        let c = builder.param_request_read(target, "A").unwrap();
        assert_eq!((a[4], b[4], c[4]), (254, 255, 0));
    }

    #[test]
    fn test_param_request_read_fields() {
        let builder = FrameBuilder::default();
        let frame = builder
            .param_request_read(LinkIdentity::new(1, 1), "BATT_CAPACITY")
            .unwrap();
        let (header, msg) = parse_frame(&frame).unwrap();
        assert_eq!(header.system_id, GCS_SYSTEM_ID);
        assert_eq!(header.component_id, GCS_COMPONENT_ID);
        let MavMessage::PARAM_REQUEST_READ(data) = msg else {
            panic!("expected PARAM_REQUEST_READ");
        };
        assert_eq!(data.param_index, -1);
        assert_eq!((data.target_system, data.target_component), (1, 1));
        assert_eq!(decode_c_string(&data.param_id), "BATT_CAPACITY");
    }

    #[test]
    fn test_param_set_carries_type() {
        let builder = FrameBuilder::default();
        let frame = builder
            .param_set(LinkIdentity::new(1, 1), "FRAME_CLASS", 2.0, ParamType::Int8)
            .unwrap();
        let Some((_, MavMessage::PARAM_SET(data))) = parse_frame(&frame) else {
            panic!("expected PARAM_SET");
        };
        assert_eq!(data.param_value, 2.0);
        assert_eq!(data.param_type, MavParamType::MAV_PARAM_TYPE_INT8);
        assert_eq!(decode_c_string(&data.param_id), "FRAME_CLASS");
    }

    #[test]
    fn test_param_set_rejects_long_names() {
        let builder = FrameBuilder::default();
        let err = builder
            .param_set(
                LinkIdentity::new(1, 1),
                "THIS_NAME_IS_TOO_LONG",
                1.0,
                ParamType::Real32,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParamName(_)));
    }
}
