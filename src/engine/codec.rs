use std::io;

use bgp_rs::{Message, Reader};
use byteorder::{NetworkEndian, ReadBytesExt};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const PREAMBLE: [u8; 16] = [0xff; 16];
// Marker + length + type
const MIN_MESSAGE_LENGTH: usize = 19;

/// Frames BGP messages on a byte stream.
///
/// Each message starts with a 16-byte all-ones marker followed by a
/// two-byte length covering the whole message; the payload is decoded
/// with bgp-rs.
#[derive(Debug, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, io::Error> {
        let (start, end) = match message_bounds(buf) {
            Some(bounds) => bounds,
            None => return Ok(None),
        };
        if end < start + MIN_MESSAGE_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message length {} below minimum", end - start),
            ));
        }
        if buf.len() < end {
            // Wait for the rest of the message
            return Ok(None);
        }
        let mut reader = Reader::new(&buf[start..end]);
        let (_header, message) = reader.read()?;
        buf.advance(end);
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), io::Error> {
        message.encode(&mut dst.writer())
    }
}

/// Locate the next message: offset of its marker and one past its last byte.
fn message_bounds(data: &[u8]) -> Option<(usize, usize)> {
    let start = twoway::find_bytes(data, &PREAMBLE)?;
    let mut rest = &data[start + PREAMBLE.len()..];
    if rest.len() < 2 {
        return None;
    }
    let length = rest.read_u16::<NetworkEndian>().ok()? as usize;
    Some((start, start + length))
}
