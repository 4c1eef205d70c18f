//! Codec tests for Trap core
//!
//! Covers both wire formats, compression handling, partial frames and
//! malformed input.

use bytes::Bytes;
use trap_core::{codec, compression, Error, Format, FrameDecoder, Message, Operation, HEADER_SIZE};

fn roundtrip(msg: &Message) -> Message {
    let encoded = codec::encode(msg).expect("encode failed");
    let (decoded, used) = codec::decode(&encoded)
        .expect("decode failed")
        .expect("frame incomplete");
    assert_eq!(used, encoded.len());
    decoded
}

// ============================================================================
// Regular format
// ============================================================================

#[test]
fn test_regular_message_on_channel() {
    let msg = Message::data(b"hello".as_slice())
        .with_message_id(42)
        .with_channel(1);

    let decoded = roundtrip(&msg);

    assert_eq!(decoded.op(), Operation::Message);
    assert_eq!(decoded.message_id(), 42);
    assert_eq!(decoded.channel(), 1);
    assert_eq!(decoded.format(), Format::Regular);
    assert_eq!(decoded.payload().as_ref(), b"hello");
}

#[test]
fn test_regular_every_operation() {
    let ops = [
        Operation::Open,
        Operation::Opened,
        Operation::Close,
        Operation::End,
        Operation::Challenge,
        Operation::Error,
        Operation::Message,
        Operation::Ack,
        Operation::FragmentStart,
        Operation::FragmentEnd,
        Operation::Ok,
        Operation::Ping,
        Operation::Pong,
        Operation::Transport,
    ];

    for op in ops {
        let decoded = roundtrip(&Message::new(op).with_message_id(7));
        assert_eq!(decoded.op(), op);
    }
}

#[test]
fn test_regular_compressed_payload() {
    let payload = Bytes::from("compress me ".repeat(200));
    let msg = Message::data(payload.clone())
        .with_message_id(3)
        .with_channel(2)
        .with_compressed(true);

    let encoded = codec::encode(&msg).unwrap();
    assert_eq!(encoded[1] & 0x80, 0x80);
    assert!(encoded.len() < HEADER_SIZE + payload.len());
    assert_eq!(encoded.len(), msg.length());

    let (decoded, _) = codec::decode(&encoded).unwrap().unwrap();
    assert!(decoded.is_compressed());
    assert_eq!(decoded.payload(), &payload);
    assert_eq!(decoded.length(), encoded.len());
}

#[test]
fn test_compression_flag_drives_decoding() {
    // A payload that happens to be valid zlib data must not be inflated
    // unless the flag says so.
    let zlib = compression::deflate(b"inner").unwrap();
    let msg = Message::data(zlib.clone()).with_message_id(1);

    let decoded = roundtrip(&msg);
    assert!(!decoded.is_compressed());
    assert_eq!(decoded.payload(), &zlib);
}

#[test]
fn test_auth_data_roundtrip() {
    let msg = Message::new(Operation::Open)
        .with_auth_data(Some("digest username=\"bob\"".into()))
        .unwrap();

    let decoded = roundtrip(&msg);
    assert_eq!(decoded.auth_data(), Some("digest username=\"bob\""));
    assert_eq!(decoded.length(), msg.length());
}

#[test]
fn test_length_matches_encoding() {
    let msg = Message::data(vec![9u8; 333])
        .with_auth_data(Some("abc".into()))
        .unwrap();
    assert_eq!(codec::encode(&msg).unwrap().len(), msg.length());
}

// ============================================================================
// Seven-bit format
// ============================================================================

#[test]
fn test_seven_bit_roundtrip() {
    let msg = Message::data(b"seven".as_slice())
        .with_format(Format::SevenBit)
        .with_message_id(0x7ff_ffff)
        .with_auth_data(Some("a".repeat(20000)))
        .unwrap();

    let encoded = codec::encode(&msg).unwrap();
    assert!(encoded[..HEADER_SIZE].iter().all(|b| b & 0x80 == 0));

    let decoded = roundtrip(&msg);
    assert_eq!(decoded.format(), Format::SevenBit);
    assert_eq!(decoded.message_id(), 0x7ff_ffff);
    assert_eq!(decoded.auth_data().map(str::len), Some(20000));
    assert_eq!(decoded.payload().as_ref(), b"seven");
}

#[test]
fn test_seven_bit_drops_channel_and_compression() {
    let msg = Message::data(b"plain".as_slice())
        .with_format(Format::SevenBit)
        .with_channel(9)
        .with_compressed(true);

    let decoded = roundtrip(&msg);
    assert_eq!(decoded.channel(), 0);
    assert!(!decoded.is_compressed());
    assert_eq!(decoded.payload().as_ref(), b"plain");
}

#[test]
fn test_seven_bit_id_out_of_range() {
    let msg = Message::data(b"x".as_slice())
        .with_format(Format::SevenBit)
        .with_message_id(1 << 28);
    assert!(matches!(
        codec::encode(&msg),
        Err(Error::OutOfRange { field: "message id", .. })
    ));
}

// ============================================================================
// Partial and malformed input
// ============================================================================

#[test]
fn test_incomplete_header_and_body() {
    let encoded = codec::encode(&Message::data(vec![1u8; 64]).with_message_id(5)).unwrap();

    assert!(codec::decode(&encoded[..10]).unwrap().is_none());
    assert!(codec::decode(&encoded[..HEADER_SIZE]).unwrap().is_none());
    assert!(codec::decode(&encoded[..encoded.len() - 1]).unwrap().is_none());
}

#[test]
fn test_decode_consumes_only_first_frame() {
    let a = codec::encode(&Message::data(b"a".as_slice()).with_message_id(1)).unwrap();
    let b = codec::encode(&Message::data(b"bb".as_slice()).with_message_id(2)).unwrap();
    let mut joined = a.to_vec();
    joined.extend_from_slice(&b);

    let (first, used) = codec::decode(&joined).unwrap().unwrap();
    assert_eq!(used, a.len());
    assert_eq!(first.message_id(), 1);

    let (second, _) = codec::decode(&joined[used..]).unwrap().unwrap();
    assert_eq!(second.payload().as_ref(), b"bb");
}

#[test]
fn test_negative_content_length_rejected() {
    let mut raw = codec::encode(&Message::new(Operation::Message)).unwrap().to_vec();
    raw[12] = 0xff;
    assert!(matches!(codec::decode(&raw), Err(Error::InvalidLength(_))));
}

#[test]
fn test_corrupt_compressed_payload() {
    let mut raw = codec::encode(&Message::data(b"abc".as_slice())).unwrap().to_vec();
    raw[1] = 0x80;
    assert!(matches!(codec::decode(&raw), Err(Error::Decompression(_))));
}

#[test]
fn test_frame_decoder_byte_by_byte() {
    let msgs: Vec<Message> = (1..=5)
        .map(|i| {
            Message::data(vec![i as u8; i * 10])
                .with_message_id(i as u32)
                .with_compressed(i % 2 == 0)
        })
        .collect();

    let mut stream = Vec::new();
    for m in &msgs {
        stream.extend_from_slice(&codec::encode(m).unwrap());
    }

    let mut decoder = FrameDecoder::new();
    let mut out = Vec::new();
    for byte in stream {
        decoder.extend(&[byte]);
        while let Some(m) = decoder.next_frame().unwrap() {
            out.push(m);
        }
    }

    assert_eq!(out, msgs);
}
