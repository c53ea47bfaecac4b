//! Message routing
//!
//! Each message type has a constant set of [`RouteFlags`]. A process asks
//! its [`Router`] which destinations an inbound message must reach; more than
//! one predicate may hold for a message and every matching destination is
//! served.
//!
//! # Architecture
//!
//! ```text
//!               ┌──────────────┐
//!  inbound ───▶ │   Router     │──▶ handle locally (to_handler)
//!               │ identity,    │──▶ StateTracker   (to_tracker)
//!               │ hub id       │──▶ UIs            (to_ui)
//!               └──────────────┘──▶ master / slave hubs, manager, modules
//! ```

use bitflags::bitflags;

use crate::id::{Id, Identity};
use crate::message::{Message, MessageType};

bitflags! {
    /// Routing properties of a message type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RouteFlags: u32 {
        /// Handled by hand in the hub; no generic forwarding.
        const SPECIAL = 1 << 0;
        const BROADCAST = 1 << 1;
        const TRACK = 1 << 2;
        const DEST_UI = 1 << 3;
        const DEST_MANAGER = 1 << 4;
        const DEST_MODULES = 1 << 5;
        const DEST_MASTER_HUB = 1 << 6;
        const DEST_SLAVE_HUB = 1 << 7;
        const DEST_LOCAL_HUB = 1 << 8;
        const DEST_HUB = Self::DEST_MASTER_HUB.bits() | Self::DEST_SLAVE_HUB.bits();
        const DEST_LOCAL_MANAGER = 1 << 9;
        const DEST_MASTER_MANAGER = 1 << 10;
        const DEST_SLAVE_MANAGER = 1 << 11;
        const HANDLE_ON_MASTER = 1 << 12;
        const HANDLE_ON_HUB = 1 << 13;
        const HANDLE_ON_NODE = 1 << 14;
        const HANDLE_ON_DEST = 1 << 15;
        const HANDLE_ON_RANK0 = 1 << 16;
        /// Only rank 0 of a module sends this type.
        const ONLY_RANK0 = 1 << 17;
        /// Successful handling may unblock queued messages.
        const TRIGGER_QUEUE = 1 << 18;
        /// Keep for later if the tracker cannot handle it yet.
        const QUEUE_IF_UNHANDLED = 1 << 19;
    }
}

/// Routing flags of `ty`. Exhaustive: adding a message type without an
/// entry does not compile.
pub const fn routing_flags(ty: MessageType) -> RouteFlags {
    use MessageType as T;
    type F = RouteFlags;

    const MODULE_STATE: u32 = F::TRACK.bits()
        | F::DEST_UI.bits()
        | F::DEST_MANAGER.bits()
        | F::DEST_MODULES.bits()
        | F::ONLY_RANK0.bits();
    const GRAPH_EDGE: u32 = F::TRACK.bits()
        | F::BROADCAST.bits()
        | F::QUEUE_IF_UNHANDLED.bits()
        | F::DEST_MANAGER.bits()
        | F::DEST_MODULES.bits()
        | F::ONLY_RANK0.bits();

    let bits = match ty {
        T::Identify | T::SetId | T::ReplayFinished | T::CloseConnection => F::SPECIAL.bits(),
        T::AddHub | T::RemoveHub => F::BROADCAST.bits() | F::TRACK.bits() | F::DEST_UI.bits(),
        T::Trace => F::BROADCAST.bits() | F::TRACK.bits(),
        T::Spawn => F::TRACK.bits() | F::HANDLE_ON_MASTER.bits(),
        T::SpawnPrepared => F::DEST_LOCAL_HUB.bits() | F::HANDLE_ON_HUB.bits(),
        T::Started | T::ModuleExit => MODULE_STATE,
        T::Kill | T::CancelExecute => F::DEST_MODULES.bits() | F::HANDLE_ON_DEST.bits(),
        T::Quit => {
            F::BROADCAST.bits()
                | F::HANDLE_ON_MASTER.bits()
                | F::HANDLE_ON_HUB.bits()
                | F::HANDLE_ON_NODE.bits()
        }
        T::Execute => F::SPECIAL.bits() | F::HANDLE_ON_MASTER.bits(),
        T::ModuleAvailable => {
            F::TRACK.bits() | F::DEST_HUB.bits() | F::DEST_UI.bits() | F::HANDLE_ON_HUB.bits()
        }
        T::AddPort | T::AddParameter => MODULE_STATE | F::TRIGGER_QUEUE.bits(),
        T::RemovePort | T::RemoveParameter | T::SetParameterChoices => {
            F::TRACK.bits() | F::DEST_UI.bits() | F::DEST_MODULES.bits() | F::ONLY_RANK0.bits()
        }
        T::Connect | T::Disconnect => GRAPH_EDGE,
        T::SetParameter => {
            F::TRACK.bits()
                | F::QUEUE_IF_UNHANDLED.bits()
                | F::DEST_MANAGER.bits()
                | F::DEST_UI.bits()
                | F::DEST_MODULES.bits()
                | F::ONLY_RANK0.bits()
        }
        T::Ping => F::DEST_MANAGER.bits() | F::DEST_MODULES.bits() | F::HANDLE_ON_DEST.bits(),
        T::Pong => F::DEST_UI.bits() | F::HANDLE_ON_DEST.bits(),
        T::Busy | T::Idle => F::SPECIAL.bits(),
        T::LockUi => F::DEST_UI.bits(),
        T::SendText => F::DEST_UI.bits() | F::DEST_MASTER_HUB.bits(),
        T::ObjectReceivePolicy | T::SchedulingPolicy | T::ReducePolicy => {
            F::DEST_LOCAL_MANAGER.bits() | F::TRACK.bits()
        }
        T::ExecutionProgress => F::DEST_MANAGER.bits() | F::HANDLE_ON_RANK0.bits(),
        T::AddObject | T::AddObjectCompleted => {
            F::DEST_MANAGER.bits() | F::HANDLE_ON_NODE.bits()
        }
        T::Barrier | T::BarrierReached => F::HANDLE_ON_DEST.bits(),
        T::ObjectReceived => F::HANDLE_ON_RANK0.bits(),
        T::RequestTunnel => F::HANDLE_ON_NODE.bits() | F::HANDLE_ON_HUB.bits(),
        T::RequestObject | T::SendObject => F::SPECIAL.bits(),
    };
    RouteFlags::from_bits_truncate(bits)
}

/// Every type with an empty entry. Must be empty; checked at hub startup.
pub fn missing_entries() -> Vec<MessageType> {
    MessageType::ALL
        .iter()
        .copied()
        .filter(|t| routing_flags(*t).is_empty())
        .collect()
}

/// Destinations a message must be delivered to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fanout {
    pub handle: bool,
    pub tracker: bool,
    pub ui: bool,
    pub master_hub: bool,
    pub slave_hubs: bool,
    pub manager: bool,
    pub modules: bool,
}

impl Fanout {
    /// Whether the message goes anywhere beyond this process.
    pub fn forwards(&self) -> bool {
        self.ui || self.master_hub || self.slave_hubs || self.manager || self.modules
    }
}

/// Routing decisions for one process.
#[derive(Debug, Clone, Copy)]
pub struct Router {
    identity: Identity,
    hub_id: Id,
}

impl Router {
    pub fn new(identity: Identity, hub_id: Id) -> Self {
        debug_assert!(
            missing_entries().is_empty(),
            "message types without routing entry: {:?}",
            missing_entries()
        );
        Self { identity, hub_id }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn hub_id(&self) -> Id {
        self.hub_id
    }

    pub fn set_hub_id(&mut self, hub_id: Id) {
        self.hub_id = hub_id;
    }

    /// Evaluate every predicate for `msg` arriving from a peer of kind
    /// `sender_kind`. `sender_hub` is the hub the sender belongs to.
    pub fn route(&self, msg: &Message, sender_kind: Identity, sender_hub: Id) -> Fanout {
        Fanout {
            handle: self.to_handler(msg),
            tracker: self.to_tracker(msg, sender_kind),
            ui: self.to_ui(msg),
            master_hub: self.to_master_hub(msg, sender_kind, sender_hub),
            slave_hubs: self.to_slave_hub(msg, sender_kind),
            manager: self.to_manager(msg, sender_kind, sender_hub),
            modules: self.to_module(msg),
        }
    }

    pub fn to_ui(&self, msg: &Message) -> bool {
        let dest = msg.dest();
        if dest == Id::FOR_BROADCAST || dest.is_module() {
            return false;
        }
        if dest == Id::BROADCAST || dest == Id::UI {
            return true;
        }
        routing_flags(msg.message_type()).intersects(RouteFlags::DEST_UI | RouteFlags::BROADCAST)
    }

    pub fn to_master_hub(&self, msg: &Message, sender_kind: Identity, sender_hub: Id) -> bool {
        if self.identity != Identity::SlaveHub || sender_kind == Identity::Hub {
            return false;
        }
        let dest = msg.dest();
        if dest == Id::FOR_BROADCAST || dest == Id::BROADCAST {
            return true;
        }
        let flags = routing_flags(msg.message_type());
        if flags.intersects(RouteFlags::DEST_MASTER_HUB | RouteFlags::DEST_SLAVE_HUB) {
            return true;
        }
        flags.contains(RouteFlags::BROADCAST)
            && (msg.sender() == self.hub_id || sender_hub == self.hub_id)
    }

    pub fn to_slave_hub(&self, msg: &Message, _sender_kind: Identity) -> bool {
        if msg.dest() == Id::FOR_BROADCAST || self.identity != Identity::Hub {
            return false;
        }
        if msg.dest() == Id::BROADCAST {
            return true;
        }
        routing_flags(msg.message_type())
            .intersects(RouteFlags::DEST_SLAVE_HUB | RouteFlags::BROADCAST)
    }

    pub fn to_manager(&self, msg: &Message, sender_kind: Identity, sender_hub: Id) -> bool {
        let dest = msg.dest();
        if dest == Id::FOR_BROADCAST {
            return false;
        }
        if dest == Id::BROADCAST {
            return true;
        }
        let flags = routing_flags(msg.message_type());
        if dest.is_hub() {
            return dest == self.hub_id && flags.contains(RouteFlags::DEST_MANAGER);
        }
        if sender_kind == Identity::Manager && sender_hub == self.hub_id {
            return false;
        }
        flags.intersects(RouteFlags::DEST_MANAGER | RouteFlags::DEST_MODULES | RouteFlags::BROADCAST)
    }

    pub fn to_module(&self, msg: &Message) -> bool {
        if msg.dest() == Id::FOR_BROADCAST {
            return false;
        }
        routing_flags(msg.message_type()).intersects(RouteFlags::DEST_MODULES | RouteFlags::BROADCAST)
    }

    /// Whether the state tracker of this process should see `msg`.
    pub fn to_tracker(&self, msg: &Message, sender_kind: Identity) -> bool {
        if msg.dest() == Id::FOR_BROADCAST {
            return false;
        }
        if !routing_flags(msg.message_type()).contains(RouteFlags::TRACK) {
            return false;
        }
        match self.identity {
            Identity::Hub => matches!(
                sender_kind,
                Identity::SlaveHub | Identity::Manager | Identity::Ui
            ),
            Identity::SlaveHub => {
                matches!(sender_kind, Identity::Hub | Identity::Manager | Identity::Ui)
            }
            _ => false,
        }
    }

    /// Whether this process must act on `msg` itself.
    pub fn to_handler(&self, msg: &Message) -> bool {
        let dest = msg.dest();
        if dest == Id::NEXT_HOP || dest == Id::BROADCAST || dest == self.hub_id {
            return true;
        }
        let flags = routing_flags(msg.message_type());
        match self.identity {
            Identity::Hub => flags.intersects(
                RouteFlags::HANDLE_ON_MASTER
                    | RouteFlags::DEST_MASTER_HUB
                    | RouteFlags::HANDLE_ON_HUB
                    | RouteFlags::DEST_LOCAL_HUB,
            ),
            Identity::SlaveHub => flags.intersects(
                RouteFlags::HANDLE_ON_HUB | RouteFlags::DEST_LOCAL_HUB | RouteFlags::DEST_SLAVE_HUB,
            ),
            Identity::Manager => {
                if self.hub_id == Id::MASTER_HUB {
                    flags.contains(RouteFlags::DEST_MASTER_MANAGER)
                } else {
                    flags.contains(RouteFlags::DEST_SLAVE_MANAGER)
                }
            }
            _ => false,
        }
    }

    /// Whether a non-zero rank may act on `msg`.
    pub fn to_rank0(msg: &Message) -> bool {
        !routing_flags(msg.message_type()).contains(RouteFlags::ONLY_RANK0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageFactory, Payload};

    fn msg(payload: Payload, dest: Id) -> Message {
        MessageFactory::new(Id(3), 0).make(payload).with_dest(dest)
    }

    #[test]
    fn test_every_type_has_an_entry() {
        assert!(missing_entries().is_empty());
    }

    #[test]
    fn test_table_samples() {
        assert_eq!(
            routing_flags(MessageType::Spawn),
            RouteFlags::TRACK | RouteFlags::HANDLE_ON_MASTER
        );
        assert!(routing_flags(MessageType::AddPort).contains(RouteFlags::TRIGGER_QUEUE));
        assert!(routing_flags(MessageType::SetParameter).contains(RouteFlags::QUEUE_IF_UNHANDLED));
        assert!(!routing_flags(MessageType::SetParameter).contains(RouteFlags::BROADCAST));
        assert!(routing_flags(MessageType::ModuleAvailable).contains(RouteFlags::DEST_SLAVE_HUB));
    }

    #[test]
    fn test_for_broadcast_goes_nowhere_downstream() {
        let r = Router::new(Identity::Hub, Id::MASTER_HUB);
        let m = msg(Payload::Quit, Id::FOR_BROADCAST);
        assert!(!r.to_ui(&m));
        assert!(!r.to_manager(&m, Identity::Ui, Id::INVALID));
        assert!(!r.to_module(&m));
        assert!(!r.to_slave_hub(&m, Identity::Ui));
    }

    #[test]
    fn test_broadcast_fans_out() {
        let r = Router::new(Identity::Hub, Id::MASTER_HUB);
        let m = msg(Payload::Quit, Id::BROADCAST);
        let f = r.route(&m, Identity::Ui, Id::MASTER_HUB);
        assert!(f.handle && f.ui && f.slave_hubs && f.manager && f.modules);
        assert!(!f.master_hub);
        assert!(f.forwards());
    }

    #[test]
    fn test_module_addressed_message_skips_ui() {
        let r = Router::new(Identity::Hub, Id::MASTER_HUB);
        let m = msg(Payload::Ping { ch: 1 }, Id(5));
        assert!(!r.to_ui(&m));
        assert!(r.to_module(&m));
    }

    #[test]
    fn test_tracker_accepts_complementary_senders() {
        let master = Router::new(Identity::Hub, Id::MASTER_HUB);
        let slave = Router::new(Identity::SlaveHub, Id::slave_hub(1));
        let m = msg(Payload::Started { name: "Foo".into() }, Id::NEXT_HOP);
        assert!(master.to_tracker(&m, Identity::Manager));
        assert!(master.to_tracker(&m, Identity::SlaveHub));
        assert!(master.to_tracker(&m, Identity::Ui));
        assert!(slave.to_tracker(&m, Identity::Hub));
        assert!(!slave.to_tracker(&m, Identity::SlaveHub));
        assert!(!master.to_tracker(&msg(Payload::Busy, Id::NEXT_HOP), Identity::Manager));
    }

    #[test]
    fn test_slave_forwards_to_master() {
        let slave_id = Id::slave_hub(1);
        let slave = Router::new(Identity::SlaveHub, slave_id);
        let text = msg(Payload::text(crate::message::TextType::Info, "hi"), Id::UI);
        assert!(slave.to_master_hub(&text, Identity::Manager, slave_id));
        assert!(!slave.to_master_hub(&text, Identity::Hub, Id::MASTER_HUB));

        let trace = msg(
            Payload::Trace {
                traced: None,
                module: Id(1),
                on: true,
            },
            Id(4),
        );
        assert!(slave.to_master_hub(&trace, Identity::Manager, slave_id));
        assert!(!slave.to_master_hub(&trace, Identity::Manager, Id::slave_hub(2)));
    }

    #[test]
    fn test_handler_by_role() {
        let master = Router::new(Identity::Hub, Id::MASTER_HUB);
        let slave = Router::new(Identity::SlaveHub, Id::slave_hub(1));
        let spawn = msg(
            Payload::Spawn {
                hub: Id::MASTER_HUB,
                name: "Foo".into(),
                spawn_id: Id::INVALID,
                mpi_size: 1,
                base_rank: 0,
                rank_skip: 0,
            },
            Id(4),
        );
        assert!(master.to_handler(&spawn));
        assert!(!slave.to_handler(&spawn));

        let prepared = msg(
            Payload::SpawnPrepared {
                hub: Id::slave_hub(1),
                name: "Foo".into(),
                spawn_id: Id(1),
            },
            Id(4),
        );
        assert!(slave.to_handler(&prepared));
        assert!(slave.to_handler(&msg(Payload::Busy, Id::slave_hub(1))));
    }

    #[test]
    fn test_manager_sees_hub_addressed_only_if_dest_manager() {
        let mgr = Router::new(Identity::Hub, Id::MASTER_HUB);
        let exec = msg(
            Payload::ExecutionProgress {
                stage: crate::message::ProgressStage::Start,
            },
            Id::MASTER_HUB,
        );
        assert!(mgr.to_manager(&exec, Identity::Ui, Id::INVALID));
        let lock = msg(Payload::LockUi { locked: true }, Id::MASTER_HUB);
        assert!(!mgr.to_manager(&lock, Identity::Ui, Id::INVALID));
    }

    #[test]
    fn test_manager_does_not_echo_own_hub() {
        let r = Router::new(Identity::Hub, Id::MASTER_HUB);
        let m = msg(Payload::connect(Id(1), "out", Id(2), "in"), Id::NEXT_HOP);
        assert!(!r.to_manager(&m, Identity::Manager, Id::MASTER_HUB));
        assert!(r.to_manager(&m, Identity::Ui, Id::INVALID));
    }

    #[test]
    fn test_only_rank0() {
        assert!(!Router::to_rank0(&msg(Payload::Started { name: "a".into() }, Id::NEXT_HOP)));
        assert!(Router::to_rank0(&msg(Payload::Barrier, Id::NEXT_HOP)));
    }
}
