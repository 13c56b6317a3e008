//! Length-prefixed framing for the worker sockets.
//!
//! Wire shape: a 4-byte big-endian length followed by that many bytes of
//! CBOR. Outbound frames hold a `Header` then a `Payload` back to back
//! (CBOR items are self-delimiting, so no inner length is needed);
//! inbound frames hold a single `Response`.

use crate::ipc::message::{Header, Payload, Response, WorkerMessage};
use bytes::{Buf, BufMut, BytesMut};

/// Upper bound on a single frame; larger lengths mean a corrupt stream.
pub const MAX_FRAME_BYTES: usize = 24 * 1024 * 1024;

/// Error type for frame codec operations.
#[derive(Debug)]
pub enum FrameError {
    /// Declared length exceeds [`MAX_FRAME_BYTES`].
    Oversized(usize),
    /// CBOR payload failed to decode.
    Decode(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Oversized(len) => write!(f, "frame of {} bytes exceeds limit", len),
            FrameError::Decode(msg) => write!(f, "frame decode error: {}", msg),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<minicbor::decode::Error> for FrameError {
    fn from(e: minicbor::decode::Error) -> Self {
        FrameError::Decode(e.to_string())
    }
}

/// Append one outbound frame to `buf`.
pub fn encode_message(msg: &WorkerMessage, buf: &mut BytesMut) {
    let mut body = Vec::with_capacity(128);
    // Infallible for Vec writers.
    minicbor::encode(&msg.header, &mut body).expect("cbor encode to vec");
    minicbor::encode(&msg.payload, &mut body).expect("cbor encode to vec");
    buf.reserve(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
}

/// Append one response frame to `buf` (used by worker fakes).
pub fn encode_response(resp: &Response, buf: &mut BytesMut) {
    let mut body = Vec::with_capacity(64);
    minicbor::encode(resp, &mut body).expect("cbor encode to vec");
    buf.reserve(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
}

fn next_frame(buf: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::Oversized(len));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len)))
}

/// Try to decode one complete outbound frame from `buf`; `Ok(None)` means
/// more bytes are needed.
pub fn try_decode_message(buf: &mut BytesMut) -> Result<Option<WorkerMessage>, FrameError> {
    let Some(frame) = next_frame(buf)? else {
        return Ok(None);
    };
    let mut decoder = minicbor::Decoder::new(&frame);
    let header: Header = decoder
        .decode()
        .map_err(|e| FrameError::Decode(e.to_string()))?;
    let payload: Payload = decoder
        .decode()
        .map_err(|e| FrameError::Decode(e.to_string()))?;
    Ok(Some(WorkerMessage { header, payload }))
}

/// Try to decode one complete response frame from `buf`.
pub fn try_decode_response(buf: &mut BytesMut) -> Result<Option<Response>, FrameError> {
    let Some(frame) = next_frame(buf)? else {
        return Ok(None);
    };
    minicbor::decode::<Response>(&frame)
        .map(Some)
        .map_err(|e| FrameError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::{dcp_opcode, event, resp_msg_type};

    #[test]
    fn message_frame_round_trip() {
        let msg = WorkerMessage::dcp_mutation(2, "{\"vb\":5}".to_string(), b"k", b"{\"x\":1}");
        let mut buf = BytesMut::new();
        encode_message(&msg, &mut buf);

        let decoded = try_decode_message(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.header.event, event::DCP);
        assert_eq!(decoded.header.opcode, dcp_opcode::MUTATION);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let msg = WorkerMessage::v8_terminate();
        let mut full = BytesMut::new();
        encode_message(&msg, &mut full);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..full.len() - 3]);
        assert!(try_decode_message(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 3..]);
        assert_eq!(try_decode_message(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let first = WorkerMessage::log_level("INFO");
        let second = WorkerMessage::thread_count(4);
        let mut buf = BytesMut::new();
        encode_message(&first, &mut buf);
        encode_message(&second, &mut buf);

        assert_eq!(try_decode_message(&mut buf).unwrap().unwrap(), first);
        assert_eq!(try_decode_message(&mut buf).unwrap().unwrap(), second);
        assert!(try_decode_message(&mut buf).unwrap().is_none());
    }

    #[test]
    fn response_frame_round_trip() {
        let resp = Response {
            msg_type: resp_msg_type::DOC_TIMER_RESPONSE,
            opcode: 0,
            msg: "2025-01-01T00:00:01Z::cb::doc::o::250".to_string(),
        };
        let mut buf = BytesMut::new();
        encode_response(&resp, &mut buf);
        assert_eq!(try_decode_response(&mut buf).unwrap().unwrap(), resp);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_BYTES + 1) as u32);
        buf.put_slice(&[0u8; 16]);
        assert!(matches!(
            try_decode_message(&mut buf),
            Err(FrameError::Oversized(_))
        ));
    }
}
