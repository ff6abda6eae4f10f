//! Binary wire frame codec
//!
//! Frame format (16-byte header, all fields big-endian):
//! ```text
//! +-------------+-------------+-----------+--------------+-----------+
//! | packet_size | header_size | protocol  | message_type | sequence  |
//! | (4 bytes)   | (2 bytes)   | (2 bytes) | (4 bytes)    | (4 bytes) |
//! +-------------+-------------+-----------+--------------+-----------+
//! ```
//! `packet_size` covers the whole frame including the header, and frames
//! arrive concatenated. A protocol-version-3 payload is a brotli stream
//! holding further concatenated frames; a message-type-5 payload carries
//! one JSON command.

use std::io::Read;

use bytes::{BufMut, BytesMut};
use serde_json::json;
use tracing::warn;

use crate::types::Event;

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Payload is plain JSON
pub const PROTO_PLAIN: u16 = 0;
/// Handshake frame
pub const PROTO_HANDSHAKE: u16 = 1;
/// Control acknowledgement, carries no command
pub const PROTO_ACK: u16 = 2;
/// Payload is a brotli stream of nested frames
pub const PROTO_BROTLI: u16 = 3;

/// Data message carrying a JSON command
pub const MSG_DATA: u32 = 5;
/// Client handshake message
pub const MSG_HANDSHAKE: u32 = 7;

/// Fixed heartbeat frame, sent verbatim every heartbeat interval
pub const HEARTBEAT_FRAME: &[u8] =
    b"\x00\x00\x00\x1f\x00\x10\x00\x01\x00\x00\x00\x02\x00\x00\x00\x01[object Object]";

/// Decode a buffer of concatenated frames into events
///
/// Malformed input never escapes this boundary: a frame whose declared
/// size is impossible stops the loop and returns the events parsed so
/// far, while a payload that fails to decompress or parse skips only
/// that frame.
pub fn decode(data: &[u8]) -> Vec<Event> {
    let mut events = Vec::new();
    decode_into(data, &mut events);
    events
}

fn decode_into(mut data: &[u8], events: &mut Vec<Event>) {
    while data.len() >= HEADER_SIZE {
        let packet_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let header_size = u16::from_be_bytes([data[4], data[5]]) as usize;
        let protocol = u16::from_be_bytes([data[6], data[7]]);
        let message_type = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        if packet_size < HEADER_SIZE || packet_size > data.len() || header_size > packet_size {
            warn!(
                "truncated frame: declared {} bytes, {} remain",
                packet_size,
                data.len()
            );
            return;
        }

        let payload = &data[header_size..packet_size];

        match protocol {
            PROTO_BROTLI => match decompress(payload) {
                Ok(inner) => decode_into(&inner, events),
                Err(e) => warn!("failed to decompress frame payload: {}", e),
            },
            // Heartbeat/handshake acknowledgements carry no command
            PROTO_ACK => {}
            _ if message_type == MSG_DATA => match serde_json::from_slice(payload) {
                Ok(value) => events.push(Event::from_payload(value)),
                Err(e) => warn!("failed to parse command payload: {}", e),
            },
            _ => {}
        }

        data = &data[packet_size..];
    }
}

fn decompress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    brotli::Decompressor::new(payload, 4096).read_to_end(&mut out)?;
    Ok(out)
}

/// Encode one frame with the given protocol version and message type
pub fn encode_frame(protocol: u16, message_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32((HEADER_SIZE + payload.len()) as u32);
    buf.put_u16(HEADER_SIZE as u16);
    buf.put_u16(protocol);
    buf.put_u32(message_type);
    buf.put_u32(1); // sequence
    buf.put_slice(payload);
    buf.to_vec()
}

/// Encode the handshake frame, the first outbound frame on a new socket
pub fn encode_handshake(room_id: u64, uid: u64, token: &str) -> Vec<u8> {
    let body = json!({
        "uid": uid,
        "roomid": room_id,
        "protover": 3,
        "platform": "web",
        "type": 2,
        "key": token,
    })
    .to_string();
    encode_frame(PROTO_HANDSHAKE, MSG_HANDSHAKE, body.as_bytes())
}
