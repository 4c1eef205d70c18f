//! Wire encoding/decoding
//!
//! Regular (binary) frame:
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ Byte 0:      1 | 0 | operation (6 bits)                       │
//! │ Byte 1:      [7] compressed, [6:0] reserved                   │
//! │ Byte 2-3:    auth length (uint16 big-endian)                  │
//! │ Byte 4-7:    message id (int32 big-endian)                    │
//! │ Byte 8:      reserved                                         │
//! │ Byte 9:      channel id                                       │
//! │ Byte 10-11:  reserved                                         │
//! │ Byte 12-15:  content length (int32 big-endian)                │
//! ├───────────────────────────────────────────────────────────────┤
//! │ auth data (UTF-8), then payload (deflated if compressed)      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The seven-bit frame has the same layout with every integer packed seven
//! bits per byte and the top bit of byte 0 cleared. It carries neither a
//! channel nor compression; bytes 8-11 are zero.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::compression;
use crate::message::{Format, Message, Operation};
use crate::{Error, Result, HEADER_SIZE};

/// Marker bit distinguishing the regular format
const REGULAR_MARKER: u8 = 0x80;

/// Compressed flag in byte 1
const COMPRESSED_FLAG: u8 = 0x80;

/// Largest value a 28-bit seven-bit field can hold
pub const MAX_SEVEN_BIT_VALUE: u32 = (1 << 28) - 1;

/// Write a 28-bit value as four seven-bit groups, most significant first
pub fn put_u28_7bit(buf: &mut impl BufMut, value: u32) {
    buf.put_u8(((value >> 21) & 0x7f) as u8);
    buf.put_u8(((value >> 14) & 0x7f) as u8);
    buf.put_u8(((value >> 7) & 0x7f) as u8);
    buf.put_u8((value & 0x7f) as u8);
}

/// Read four seven-bit groups into a 28-bit value
pub fn get_u28_7bit(bytes: &[u8]) -> u32 {
    ((bytes[0] as u32 & 0x7f) << 21)
        | ((bytes[1] as u32 & 0x7f) << 14)
        | ((bytes[2] as u32 & 0x7f) << 7)
        | (bytes[3] as u32 & 0x7f)
}

/// Encode a message in its own format
pub fn encode(message: &Message) -> Result<Bytes> {
    match message.format() {
        Format::Regular => encode_regular(message),
        Format::SevenBit => encode_seven_bit(message),
    }
}

fn encode_regular(message: &Message) -> Result<Bytes> {
    let auth = message.auth_data().unwrap_or("").as_bytes();
    let payload = message.compressed_payload()?;

    if payload.len() > i32::MAX as usize {
        return Err(Error::OutOfRange {
            field: "content length",
            value: payload.len() as i64,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + auth.len() + payload.len());

    buf.put_u8(REGULAR_MARKER | (message.op().code() & 0x3f));
    buf.put_u8(if message.is_compressed() {
        COMPRESSED_FLAG
    } else {
        0
    });
    buf.put_u16(auth.len() as u16);
    buf.put_u32(message.message_id());
    buf.put_u8(0);
    buf.put_u8(message.channel());
    buf.put_u16(0);
    buf.put_u32(payload.len() as u32);

    buf.extend_from_slice(auth);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

fn encode_seven_bit(message: &Message) -> Result<Bytes> {
    let auth = message.auth_data().unwrap_or("").as_bytes();
    let payload = message.payload();

    if message.message_id() > MAX_SEVEN_BIT_VALUE {
        return Err(Error::OutOfRange {
            field: "message id",
            value: message.message_id() as i64,
        });
    }
    if payload.len() > MAX_SEVEN_BIT_VALUE as usize {
        return Err(Error::OutOfRange {
            field: "content length",
            value: payload.len() as i64,
        });
    }

    let auth_len = auth.len() as u32;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + auth.len() + payload.len());

    buf.put_u8(message.op().code() & 0x3f);
    buf.put_u8(((auth_len >> 14) & 0x03) as u8);
    buf.put_u8(((auth_len >> 7) & 0x7f) as u8);
    buf.put_u8((auth_len & 0x7f) as u8);
    put_u28_7bit(&mut buf, message.message_id());
    buf.put_u32(0);
    put_u28_7bit(&mut buf, payload.len() as u32);

    buf.extend_from_slice(auth);
    buf.extend_from_slice(payload);

    Ok(buf.freeze())
}

/// Parsed header fields
struct Header {
    op: Operation,
    format: Format,
    compressed: bool,
    auth_len: usize,
    message_id: u32,
    channel: u8,
    content_len: usize,
}

fn parse_header(buf: &[u8]) -> Result<Header> {
    let op = Operation::from_code(buf[0] & 0x3f)?;

    if buf[0] & REGULAR_MARKER != 0 {
        let mut header = &buf[1..HEADER_SIZE];
        let flags = header.get_u8();
        let auth_len = header.get_u16() as usize;
        let message_id = header.get_u32();
        header.advance(1);
        let channel = header.get_u8();
        header.advance(2);
        let content_len = header.get_i32();

        if content_len < 0 {
            return Err(Error::InvalidLength(content_len as i64));
        }

        Ok(Header {
            op,
            format: Format::Regular,
            compressed: flags & COMPRESSED_FLAG != 0,
            auth_len,
            message_id,
            channel,
            content_len: content_len as usize,
        })
    } else {
        let auth_len = (((buf[1] & 0x03) as usize) << 14)
            | (((buf[2] & 0x7f) as usize) << 7)
            | (buf[3] & 0x7f) as usize;

        Ok(Header {
            op,
            format: Format::SevenBit,
            compressed: false,
            auth_len,
            message_id: get_u28_7bit(&buf[4..8]),
            channel: 0,
            content_len: get_u28_7bit(&buf[12..16]) as usize,
        })
    }
}

/// Total frame length if `buf` holds at least one complete frame
pub fn check_complete(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let header = parse_header(buf)?;
    let total = HEADER_SIZE + header.auth_len + header.content_len;
    Ok((buf.len() >= total).then_some(total))
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet contain the whole frame,
/// otherwise the message and the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = parse_header(buf)?;
    let total = HEADER_SIZE + header.auth_len + header.content_len;
    if buf.len() < total {
        return Ok(None);
    }

    let auth_end = HEADER_SIZE + header.auth_len;
    let auth = if header.auth_len > 0 {
        Some(String::from_utf8(buf[HEADER_SIZE..auth_end].to_vec())?)
    } else {
        None
    };

    let wire = Bytes::copy_from_slice(&buf[auth_end..total]);

    let mut message = Message::new(header.op)
        .with_format(header.format)
        .with_message_id(header.message_id)
        .with_channel(header.channel)
        .with_auth_data(auth)?;

    if header.compressed {
        let inflated = compression::inflate(&wire)?;
        message = message.with_payload(inflated).with_compressed(true);
        message.cache_wire_payload(wire);
    } else {
        message = message.with_payload(wire);
    }

    Ok(Some((message, total)))
}

/// Incremental frame assembler for stream transports
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
        }
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Direct access for `read_buf` style readers
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame, if any
    pub fn next_frame(&mut self) -> Result<Option<Message>> {
        match decode(&self.buf)? {
            Some((message, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_header_layout() {
        let msg = Message::data(b"abc".as_slice())
            .with_message_id(0x01020304)
            .with_channel(7)
            .with_auth_data(Some("xy".into()))
            .unwrap();
        let encoded = encode(&msg).unwrap();

        assert_eq!(encoded[0], 0x80 | 8);
        assert_eq!(encoded[1], 0);
        assert_eq!(&encoded[2..4], &[0, 2]);
        assert_eq!(&encoded[4..8], &[1, 2, 3, 4]);
        assert_eq!(encoded[9], 7);
        assert_eq!(&encoded[12..16], &[0, 0, 0, 3]);
        assert_eq!(&encoded[16..18], b"xy");
        assert_eq!(&encoded[18..], b"abc");
    }

    #[test]
    fn test_seven_bit_header_layout() {
        let msg = Message::data(vec![0u8; 200])
            .with_format(Format::SevenBit)
            .with_message_id(0x0FFF_FFFF);
        let encoded = encode(&msg).unwrap();

        assert_eq!(encoded[0], 8);
        assert!(encoded[..HEADER_SIZE].iter().all(|b| b & 0x80 == 0));
        assert_eq!(get_u28_7bit(&encoded[4..8]), 0x0FFF_FFFF);
        assert_eq!(&encoded[8..12], &[0, 0, 0, 0]);
        assert_eq!(get_u28_7bit(&encoded[12..16]), 200);
    }

    #[test]
    fn test_partial_frame_needs_more_data() {
        let msg = Message::data(b"partial".as_slice()).with_message_id(3);
        let encoded = encode(&msg).unwrap();

        for cut in 0..encoded.len() {
            assert!(decode(&encoded[..cut]).unwrap().is_none());
        }
        let (decoded, used) = decode(&encoded).unwrap().unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_check_complete() {
        let encoded = encode(&Message::data(b"test".as_slice())).unwrap();
        assert_eq!(check_complete(&encoded).unwrap(), Some(encoded.len()));
        assert_eq!(check_complete(&encoded[..2]).unwrap(), None);
        assert_eq!(check_complete(&encoded[..18]).unwrap(), None);
    }

    #[test]
    fn test_unknown_operation() {
        let mut raw = encode(&Message::new(Operation::Ping)).unwrap().to_vec();
        raw[0] = 0x80 | 7;
        assert!(matches!(decode(&raw), Err(Error::UnknownOperation(7))));
    }

    #[test]
    fn test_frame_decoder_split_reads() {
        let first = encode(&Message::data(b"one".as_slice()).with_message_id(1)).unwrap();
        let second = encode(&Message::data(b"two".as_slice()).with_message_id(2)).unwrap();
        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);

        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for chunk in stream.chunks(5) {
            decoder.extend(chunk);
            while let Some(m) = decoder.next_frame().unwrap() {
                out.push(m);
            }
        }

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].payload().as_ref(), b"one");
        assert_eq!(out[1].payload().as_ref(), b"two");
        assert_eq!(decoder.buffered(), 0);
    }
}
