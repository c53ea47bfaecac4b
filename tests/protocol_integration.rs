//! Wire format: envelopes, frames and hostile input

use std::io::Cursor;

use bytes::Bytes;
use pipehub::error::{PipehubError, ProtocolError, TransportError};
use pipehub::message::codec::{decode, encode};
use pipehub::message::frame::{read_frame, write_frame, MAX_PAYLOAD_SIZE};
use pipehub::message::{MessageType, MESSAGE_SIZE};
use pipehub::{Id, MessageFactory, Payload};
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2 * MESSAGE_SIZE)) {
        let _ = decode(&bytes, MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn prop_ping_round_trips(ch in any::<u8>(), sender in 1i32..10_000, rank in 0i32..64) {
        let msg = MessageFactory::new(Id(sender), rank)
            .make(Payload::Ping { ch })
            .with_dest(Id::MASTER_HUB);
        let buf = encode(&msg).unwrap();
        prop_assert_eq!(buf.len(), MESSAGE_SIZE);
        prop_assert_eq!(decode(&buf, MAX_PAYLOAD_SIZE).unwrap(), msg);
    }

    #[test]
    fn prop_unknown_type_rejected(ty in 10_000u32..) {
        let msg = MessageFactory::new(Id(1), 0).make(Payload::Busy);
        let mut buf = encode(&msg).unwrap();
        buf[..4].copy_from_slice(&ty.to_be_bytes());
        prop_assert!(matches!(
            decode(&buf, MAX_PAYLOAD_SIZE),
            Err(ProtocolError::UnknownType(_))
        ));
    }
}

#[test]
fn test_every_type_fits_envelope() {
    assert_eq!(MessageType::ALL.len(), 42);
    let msg = MessageFactory::new(Id(1), 0).make(Payload::Quit);
    assert_eq!(encode(&msg).unwrap().len(), MESSAGE_SIZE);
}

#[test]
fn test_frames_carry_raw_payload_in_order() {
    let f = MessageFactory::new(Id(2), 0);
    let first = f
        .make(Payload::SendObject {
            object_name: "m2id0r0OBJ".into(),
            referrer: String::new(),
            array: false,
        })
        .with_raw_payload(Bytes::from_static(b"object blob"));
    let second = f.make(Payload::Idle);

    let mut wire = Vec::new();
    write_frame(&mut wire, &first).unwrap();
    write_frame(&mut wire, &second).unwrap();

    let mut reader = Cursor::new(wire);
    let a = read_frame(&mut reader, MAX_PAYLOAD_SIZE).unwrap();
    assert_eq!(a.raw_payload.as_deref(), Some(&b"object blob"[..]));
    assert_eq!(a.payload, first.payload);
    let b = read_frame(&mut reader, MAX_PAYLOAD_SIZE).unwrap();
    assert_eq!(b.message_type(), MessageType::Idle);
    assert!(matches!(
        read_frame(&mut reader, MAX_PAYLOAD_SIZE),
        Err(PipehubError::Transport(TransportError::Closed))
    ));
}

#[test]
fn test_oversized_payload_announcement_rejected() {
    let msg = MessageFactory::new(Id(2), 0)
        .make(Payload::Idle)
        .with_raw_payload(Bytes::from(vec![0u8; 64]));
    let mut wire = Vec::new();
    write_frame(&mut wire, &msg).unwrap();
    let res = read_frame(&mut Cursor::new(wire), 16);
    assert!(matches!(
        res,
        Err(PipehubError::Protocol(ProtocolError::PayloadTooLarge { size: 64, max: 16 }))
    ));
}
