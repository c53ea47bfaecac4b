//! Message protocol
//!
//! Every control message is a fixed-size envelope: a common [`Header`]
//! followed by a type-specific [`Payload`] of fixed width. Bulk data never
//! travels inline; it is either referenced by name (object and array
//! messages) or attached as an out-of-band raw payload whose length the
//! header announces.
//!
//! # Architecture
//!
//! ```text
//! MessageFactory ──make()──▶ Message ──codec::encode──▶ [u8; MESSAGE_SIZE]
//!                                │                              │
//!                        raw_payload (Bytes)            frame::write_frame
//!                                                               │
//!                                          len(BE u32) │ envelope │ payload
//! ```

pub mod codec;
pub mod factory;
pub mod frame;
pub mod payload;
pub mod types;

pub use factory::MessageFactory;
pub use payload::{
    ExecuteWhat, Link, ObjectReceivePolicy, Payload, PortInfo, PortKind, ProgressStage,
    ReducePolicy, SchedulingPolicy, TextType,
};
pub use types::{MessageType, PayloadShape};

use bitflags::bitflags;
use bytes::Bytes;
use uuid::Uuid;

use crate::id::Id;

/// Size of every encoded envelope in bytes.
pub const MESSAGE_SIZE: usize = 1024;

/// Bytes taken by the common header.
pub const HEADER_SIZE: usize = 56;

bitflags! {
    /// Per-envelope routing bits set by hubs while forwarding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvelopeFlags: u32 {
        /// The message reached this process as part of a broadcast.
        const WAS_BROADCAST = 1 << 0;
        /// Informational copy; receivers must not act on it.
        const NOTIFICATION = 1 << 1;
    }
}

/// Fields common to all messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub uuid: Uuid,
    pub sender: Id,
    pub rank: i32,
    pub dest: Id,
    /// `-1` addresses every rank of `dest`.
    pub dest_rank: i32,
    /// Length of the raw payload that follows the envelope.
    pub payload_size: u64,
    pub flags: EnvelopeFlags,
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub payload: Payload,
    pub raw_payload: Option<Bytes>,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn uuid(&self) -> Uuid {
        self.header.uuid
    }

    pub fn sender(&self) -> Id {
        self.header.sender
    }

    pub fn rank(&self) -> i32 {
        self.header.rank
    }

    pub fn dest(&self) -> Id {
        self.header.dest
    }

    pub fn set_dest(&mut self, dest: Id) {
        self.header.dest = dest;
    }

    pub fn with_sender(mut self, sender: Id) -> Self {
        self.header.sender = sender;
        self
    }

    pub fn with_dest(mut self, dest: Id) -> Self {
        self.header.dest = dest;
        self
    }

    pub fn with_dest_rank(mut self, rank: i32) -> Self {
        self.header.dest_rank = rank;
        self
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.header.uuid = uuid;
        self
    }

    /// Attach out-of-band data and announce its length in the header.
    pub fn with_raw_payload(mut self, data: Bytes) -> Self {
        self.header.payload_size = data.len() as u64;
        self.raw_payload = Some(data);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.header.dest == Id::BROADCAST || self.header.flags.contains(EnvelopeFlags::WAS_BROADCAST)
    }

    pub fn is_notification(&self) -> bool {
        self.header.flags.contains(EnvelopeFlags::NOTIFICATION)
    }

    pub fn set_notification(&mut self, on: bool) {
        self.header.flags.set(EnvelopeFlags::NOTIFICATION, on);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_payload_sets_size() {
        let msg = MessageFactory::new(Id(2), 0)
            .make(Payload::Barrier)
            .with_raw_payload(Bytes::from_static(b"abc"));
        assert_eq!(msg.header.payload_size, 3);
        assert_eq!(msg.raw_payload.as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_broadcast_detection() {
        let f = MessageFactory::new(Id(2), 0);
        assert!(f.make(Payload::Quit).with_dest(Id::BROADCAST).is_broadcast());
        let mut m = f.make(Payload::Quit);
        assert!(!m.is_broadcast());
        m.header.flags |= EnvelopeFlags::WAS_BROADCAST;
        assert!(m.is_broadcast());
    }
}
