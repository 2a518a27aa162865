//! Client frame codec (§4.1): read/write framed messages on client sockets.

mod codec;

pub use codec::{SharedWriter, read_frame, write_frame};

use hyperproxy_protocol::frame::{FrameHeader, FrameType};
use serde::Serialize;

use crate::error::DaemonResult;

/// Build a frame whose payload is a JSON-serialized value (§4.1 convenience).
pub fn json_frame(
    frame_type: FrameType,
    opcode: u8,
    value: &impl Serialize,
) -> DaemonResult<(FrameHeader, Vec<u8>)> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| crate::error::DaemonError::Internal(format!("json encode: {e}")))?;
    let header = FrameHeader::new(frame_type, opcode, payload.len() as u32);
    Ok((header, payload))
}

/// Build a stream frame with an explicit opcode and raw payload (§4.1
/// convenience).
pub fn stream_frame(opcode: u8, payload: Vec<u8>) -> (FrameHeader, Vec<u8>) {
    let header = FrameHeader::new(FrameType::Stream, opcode, payload.len() as u32);
    (header, payload)
}
