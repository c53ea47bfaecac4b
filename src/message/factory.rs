//! Message construction with an explicit default sender.

use uuid::Uuid;

use super::{EnvelopeFlags, Header, Message, MessageType, Payload};
use crate::id::Id;

/// Stamps uuid, sender id and rank on every message it builds.
///
/// Each process (or each module inside a test) owns one factory; there is no
/// global sender state.
#[derive(Debug, Clone)]
pub struct MessageFactory {
    sender: Id,
    rank: i32,
}

impl MessageFactory {
    pub fn new(sender: Id, rank: i32) -> Self {
        Self { sender, rank }
    }

    pub fn sender(&self) -> Id {
        self.sender
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Change the sender id, e.g. after a hub answered with `SetId`.
    pub fn set_sender(&mut self, sender: Id) {
        self.sender = sender;
    }

    /// New message addressed to the next hop with a fresh uuid.
    pub fn make(&self, payload: Payload) -> Message {
        Message {
            header: Header {
                uuid: Uuid::new_v4(),
                sender: self.sender,
                rank: self.rank,
                dest: Id::NEXT_HOP,
                dest_rank: -1,
                payload_size: 0,
                flags: EnvelopeFlags::empty(),
            },
            payload,
            raw_payload: None,
        }
    }

    /// New message with a nil uuid, used for "any" probes such as the initial
    /// `Identify` request.
    pub fn make_probe(&self, payload: Payload) -> Message {
        self.make(payload).with_uuid(Uuid::nil())
    }

    /// Reply to `request`: copies its uuid and addresses its sender.
    pub fn reply(&self, request: &Message, payload: Payload) -> Message {
        debug_assert!(
            payload.message_type().is_reply() || payload.message_type() == MessageType::SendText,
            "{:?} is not a reply type",
            payload.message_type()
        );
        self.make(payload)
            .with_uuid(request.uuid())
            .with_dest(request.sender())
            .with_dest_rank(request.rank())
    }

    pub fn pong(&self, ping: &Message) -> Message {
        let ch = match ping.payload {
            Payload::Ping { ch } => ch,
            _ => 0,
        };
        self.reply(
            ping,
            Payload::Pong {
                ch,
                module: self.sender,
            },
        )
    }

    pub fn barrier_reached(&self, barrier: &Message) -> Message {
        self.reply(barrier, Payload::BarrierReached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_stamps_sender() {
        let f = MessageFactory::new(Id(7), 2);
        let m = f.make(Payload::Busy);
        assert_eq!(m.sender(), Id(7));
        assert_eq!(m.rank(), 2);
        assert_eq!(m.dest(), Id::NEXT_HOP);
        assert!(!m.uuid().is_nil());
        assert_ne!(m.uuid(), f.make(Payload::Busy).uuid());
    }

    #[test]
    fn test_probe_has_nil_uuid() {
        let f = MessageFactory::new(Id::INVALID, 0);
        assert!(f.make_probe(Payload::Quit).uuid().is_nil());
    }

    #[test]
    fn test_reply_copies_uuid() {
        let ui = MessageFactory::new(Id::UI, 0);
        let module = MessageFactory::new(Id(5), 1);
        let ping = ui.make(Payload::Ping { ch: b'x' }).with_dest(Id(5));
        let pong = module.pong(&ping);
        assert_eq!(pong.uuid(), ping.uuid());
        assert_eq!(pong.dest(), Id::UI);
        assert_eq!(
            pong.payload,
            Payload::Pong {
                ch: b'x',
                module: Id(5)
            }
        );
        assert_eq!(module.barrier_reached(&ping).uuid(), ping.uuid());
    }
}
