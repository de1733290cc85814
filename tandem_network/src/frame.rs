//! Envelope framing for stream transports.
//!
//! Each transported frame is a 4-byte big-endian total length followed by
//! the envelope's binary encoding. Frames are independent; the codec never
//! coalesces or splits them at the application layer.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use tandem_runtime::{ActionMessage, MAX_PAYLOAD_SIZE};

use crate::TransportError;

/// Frames larger than this are rejected outright.
const MAX_FRAME_SIZE: usize = MAX_PAYLOAD_SIZE + 4096;

/// Length-prefixed [`ActionMessage`] codec for `tokio_util` framed streams.
#[derive(Debug, Default)]
pub struct EnvelopeCodec {}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = ActionMessage;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(length));
        }
        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }
        buf.advance(4);
        let message = ActionMessage::from_bytes(&buf[..length])?;
        buf.advance(length);
        Ok(Some(message))
    }
}

impl Encoder<ActionMessage> for EnvelopeCodec {
    type Error = TransportError;

    fn encode(&mut self, item: ActionMessage, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let body = item.to_bytes();
        if body.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(body.len()));
        }
        buf.reserve(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(())
    }
}
