//! Flight-controller wire protocol
//!
//! Message parsing and serialization is delegated to the `mavlink` crate
//! (common dialect). This module keeps only what the crate does not offer
//! for a byte-stream bridge: locating frame boundaries in an arbitrary
//! chunk stream so raw frames can be forwarded untouched.
//!
//! Frame formats (all multi-byte fields little-endian):
//!
//! ```text
//! v1: [0xFE] [LEN] [SEQ] [SYS] [COMP] [MSGID]              [PAYLOAD] [CRC_L CRC_H]
//! v2: [0xFD] [LEN] [INCOMPAT] [COMPAT] [SEQ] [SYS] [COMP] [MSGID x3] [PAYLOAD] [CRC_L CRC_H] [SIG x13]?
//! ```
//!
//! The signature block is present only when bit 0 of INCOMPAT is set.
//!
//! - `frame`: start-marker scan and length computation (`FrameExtractor`)
//! - `decoder`: `MessageDecoder` capability and the built-in `MavDecoder`
//! - `encoder`: outgoing frame builder (`FrameBuilder`)
//! - `dialect`: numeric code to human string lookups

pub mod decoder;
pub mod dialect;
pub mod encoder;
pub mod frame;

pub use decoder::{DecodedMessage, MavDecoder, MessageBody, MessageDecoder};
pub use dialect::{ArduPilotDialect, DialectLookup};
pub use encoder::{FrameBuilder, LinkIdentity};
pub use frame::{FrameExtractor, extract};

/// Start marker for protocol v1 frames
pub const STX_V1: u8 = 0xFE;
/// Start marker for protocol v2 frames
pub const STX_V2: u8 = 0xFD;

/// Header bytes before the payload (v1), including the marker
pub const HEADER_LEN_V1: usize = 6;
/// Header bytes before the payload (v2), including the marker
pub const HEADER_LEN_V2: usize = 10;
/// Trailing checksum bytes
pub const CHECKSUM_LEN: usize = 2;
/// Signature block appended to signed v2 frames
pub const SIGNATURE_LEN: usize = 13;
/// INCOMPAT flag bit marking a signed frame
pub const INCOMPAT_FLAG_SIGNED: u8 = 0x01;

/// Length of the fixed param_id char field
pub const PARAM_ID_LEN: usize = 16;

/// Encode a parameter name into the fixed 16-byte wire field (NUL padded)
pub fn encode_param_id(name: &str) -> Option<[u8; PARAM_ID_LEN]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > PARAM_ID_LEN {
        return None;
    }
    let mut id = [0u8; PARAM_ID_LEN];
    id[..bytes.len()].copy_from_slice(bytes);
    Some(id)
}

/// Decode a fixed-width char field, stopping at the first NUL
pub fn decode_c_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).trim_end().to_string()
}
