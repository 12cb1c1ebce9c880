//! Frame extraction from an accumulating byte stream
//!
//! The serial link delivers arbitrary chunks; frames can straddle reads and
//! line noise can precede them. `extract` finds the first start marker,
//! computes the exact frame length from the header and returns the frame
//! only once every byte of it is buffered.

use super::{
    CHECKSUM_LEN, HEADER_LEN_V1, HEADER_LEN_V2, INCOMPAT_FLAG_SIGNED, SIGNATURE_LEN, STX_V1,
    STX_V2,
};

/// Bytes kept when the buffer holds no start marker at all
pub const MAX_GARBAGE_TAIL: usize = 1024;

/// Total frame length for the frame starting at `buf[0]`, if the header is complete
fn frame_len(buf: &[u8]) -> Option<usize> {
    match *buf.first()? {
        STX_V1 if buf.len() >= HEADER_LEN_V1 => {
            Some(HEADER_LEN_V1 + buf[1] as usize + CHECKSUM_LEN)
        }
        STX_V2 if buf.len() >= HEADER_LEN_V2 => {
            let signed = buf[2] & INCOMPAT_FLAG_SIGNED != 0;
            let sig = if signed { SIGNATURE_LEN } else { 0 };
            Some(HEADER_LEN_V2 + buf[1] as usize + CHECKSUM_LEN + sig)
        }
        _ => None,
    }
}

/// Routing fields read straight from a frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    pub msg_id: u32,
    pub sequence: u8,
    pub system_id: u8,
    pub component_id: u8,
}

/// Header fields of a frame starting at `frame[0]`, without checking the CRC
pub fn raw_header(frame: &[u8]) -> Option<RawHeader> {
    match *frame.first()? {
        STX_V1 if frame.len() >= HEADER_LEN_V1 => Some(RawHeader {
            msg_id: frame[5] as u32,
            sequence: frame[2],
            system_id: frame[3],
            component_id: frame[4],
        }),
        STX_V2 if frame.len() >= HEADER_LEN_V2 => Some(RawHeader {
            msg_id: u32::from_le_bytes([frame[7], frame[8], frame[9], 0]),
            sequence: frame[4],
            system_id: frame[5],
            component_id: frame[6],
        }),
        _ => None,
    }
}

/// Pull one complete frame out of `buf`.
///
/// Returns `(Some(frame), remainder)` when a full frame is buffered. Otherwise
/// returns `(None, remainder)`, where the remainder starts at the first start
/// marker (leading noise dropped). When there is no marker at all, the
/// remainder is at most the trailing `MAX_GARBAGE_TAIL` bytes.
///
/// Pure function: calling it again on the same input yields the same result.
pub fn extract(buf: &[u8]) -> (Option<&[u8]>, &[u8]) {
    let Some(start) = buf.iter().position(|&b| b == STX_V1 || b == STX_V2) else {
        let keep = buf.len().min(MAX_GARBAGE_TAIL);
        return (None, &buf[buf.len() - keep..]);
    };

    let candidate = &buf[start..];
    let Some(total) = frame_len(candidate) else {
        return (None, candidate);
    };

    if candidate.len() < total {
        return (None, candidate);
    }

    let (frame, rest) = candidate.split_at(total);
    (Some(frame), rest)
}

/// Stateful wrapper around [`extract`] that owns the accumulating buffer
#[derive(Debug, Default)]
pub struct FrameExtractor {
    buffer: Vec<u8>,
}

impl FrameExtractor {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(2048),
        }
    }

    /// Append freshly read bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if any
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let (frame, rest) = extract(&self.buffer);
        let frame = frame.map(<[u8]>::to_vec);
        let consumed = self.buffer.len() - rest.len();
        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
        frame
    }

    /// Bytes currently buffered (partial frame or noise tail)
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Hand over whatever is buffered, leaving the extractor empty
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}
