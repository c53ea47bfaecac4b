//! Hub message dispatch
//!
//! The [`HubDispatcher`] is the transport-independent core of a hub process.
//! It is fed every message a peer sent and answers with the list of
//! deliveries to make. Sockets, tasks and framing live with the caller.
//!
//! # Architecture
//!
//! ```text
//!  peer ──msg──▶ dispatch(from, msg)
//!                   │
//!                   ├─ Identify / SetId / CloseConnection   (session setup)
//!                   ├─ master: assign ids to new Spawns
//!                   ├─ Router::route ──▶ Fanout
//!                   ├─ StateTracker::handle                  (if tracked)
//!                   ├─ local handling (Quit, Ping, Spawn, Busy/Idle)
//!                   └─ Dispatch { outgoing: [(peer, msg)], close: [peer] }
//! ```
//!
//! A message is never delivered back to the peer it came from.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::HubSection;
use crate::id::{Id, Identity};
use crate::message::{Message, MessageFactory, MessageType, Payload};
use crate::router::{Fanout, Router};
use crate::tracker::StateTracker;

/// Handle of one attached connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer#{}", self.0)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer {}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub kind: Identity,
    /// Hub the peer belongs to.
    pub hub: Id,
    pub name: String,
}

/// Result of feeding one message to the dispatcher.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub outgoing: Vec<(PeerId, Message)>,
    /// Connections to shut down.
    pub close: Vec<PeerId>,
    /// Whether the message reached the state tracker.
    pub tracked: bool,
}

impl Dispatch {
    /// Messages addressed to `peer`, in delivery order.
    pub fn to(&self, peer: PeerId) -> Vec<&Message> {
        self.outgoing
            .iter()
            .filter(|(p, _)| *p == peer)
            .map(|(_, m)| m)
            .collect()
    }
}

/// Routing core of one hub.
pub struct HubDispatcher {
    name: String,
    section: HubSection,
    router: Router,
    factory: MessageFactory,
    tracker: Arc<StateTracker>,
    peers: BTreeMap<PeerId, Peer>,
    next_peer: u32,
    next_module: i32,
    next_slave: i32,
    quit_requested: bool,
}

impl HubDispatcher {
    pub fn new(section: &HubSection, tracker: Arc<StateTracker>) -> Self {
        let identity = section.role.identity();
        let hub_id = section.initial_id();
        let mut dispatcher = Self {
            name: section.name.clone(),
            section: section.clone(),
            router: Router::new(identity, hub_id),
            factory: MessageFactory::new(hub_id, 0),
            tracker,
            peers: BTreeMap::new(),
            next_peer: 1,
            next_module: Id::MODULE_BASE.0,
            next_slave: 1,
            quit_requested: false,
        };
        if dispatcher.is_master() {
            let add = dispatcher.add_hub_message();
            dispatcher.tracker.handle(&add);
        }
        tracing::info!(hub = %hub_id, role = ?section.role, "hub dispatcher ready");
        dispatcher
    }

    pub fn is_master(&self) -> bool {
        self.router.identity() == Identity::Hub
    }

    pub fn hub_id(&self) -> Id {
        self.router.hub_id()
    }

    pub fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn peers(&self) -> impl Iterator<Item = (PeerId, &Peer)> {
        self.peers.iter().map(|(id, p)| (*id, p))
    }

    pub fn quit_requested(&self) -> bool {
        self.quit_requested
    }

    fn add_hub_message(&self) -> Message {
        self.factory.make(Payload::AddHub {
            id: self.hub_id(),
            name: self.name.clone(),
            port: self.section.port,
            data_port: self.section.data_port,
            address: self.section.listen_address.clone(),
        })
    }

    // ── Peers ──

    /// Register a fresh connection. Its kind is learnt from the `Identify`
    /// answer to the probe returned here.
    pub fn connect_peer(&mut self) -> (PeerId, Dispatch) {
        let id = PeerId(self.next_peer);
        self.next_peer += 1;
        self.peers.insert(
            id,
            Peer {
                kind: Identity::Unknown,
                hub: Id::INVALID,
                name: String::new(),
            },
        );
        let probe = self.factory.make_probe(Payload::Identify {
            identity: Identity::Request,
            name: self.name.clone(),
        });
        tracing::debug!("{} connected", id);
        let out = Dispatch {
            outgoing: vec![(id, probe)],
            ..Default::default()
        };
        (id, out)
    }

    /// Forget a connection and announce what it implies.
    pub fn detach(&mut self, id: PeerId) -> Dispatch {
        let mut out = Dispatch::default();
        let Some(peer) = self.peers.remove(&id) else {
            return out;
        };
        tracing::info!("{} ({:?} {}) detached", id, peer.kind, peer.name);
        match peer.kind {
            Identity::SlaveHub if peer.hub.is_valid() => {
                let remove = self.factory.make(Payload::RemoveHub { id: peer.hub });
                self.tracker.handle(&remove);
                out.tracked = true;
                let targets = self.peers_of(&[Identity::Ui, Identity::SlaveHub]);
                self.deliver(&mut out, targets, &remove);
            }
            Identity::Hub => {
                tracing::warn!("lost connection to master hub");
                self.quit_requested = true;
            }
            _ => {}
        }
        out
    }

    fn peers_of(&self, kinds: &[Identity]) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, p)| kinds.contains(&p.kind))
            .map(|(id, _)| *id)
            .collect()
    }

    fn hub_peer(&self, hub: Id) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|(_, p)| p.hub == hub && matches!(p.kind, Identity::Hub | Identity::SlaveHub))
            .map(|(id, _)| *id)
    }

    fn deliver(&self, out: &mut Dispatch, targets: impl IntoIterator<Item = PeerId>, msg: &Message) {
        for t in targets {
            out.outgoing.push((t, msg.clone()));
        }
    }

    // ── Session setup ──

    fn identify(&mut self, from: PeerId, identity: Identity, name: &str, out: &mut Dispatch) {
        if identity == Identity::Request {
            let reply = self.factory.make(Payload::Identify {
                identity: self.router.identity(),
                name: self.name.clone(),
            });
            out.outgoing.push((from, reply));
            return;
        }

        let is_master = self.is_master();
        let hub_id = self.hub_id();
        let Some(peer) = self.peers.get_mut(&from) else {
            return;
        };
        peer.kind = identity;
        peer.name = name.to_string();
        tracing::info!("{} identified as {:?} {}", from, identity, name);

        match identity {
            Identity::Ui => {
                peer.hub = hub_id;
                for msg in self.tracker.get_state() {
                    out.outgoing.push((from, msg));
                }
            }
            Identity::Manager => peer.hub = hub_id,
            Identity::SlaveHub if is_master => {
                let id = Id::slave_hub(self.next_slave);
                self.next_slave += 1;
                peer.hub = id;
                out.outgoing
                    .push((from, self.factory.make(Payload::SetId { id })));
                for msg in self.tracker.get_state() {
                    out.outgoing.push((from, msg));
                }
            }
            Identity::Hub if !is_master => peer.hub = Id::MASTER_HUB,
            other => {
                tracing::warn!("{} announced unexpected identity {:?}", from, other);
                out.close.push(from);
            }
        }
    }

    /// Slave hub learnt its id from the master.
    fn assume_id(&mut self, id: Id, master: PeerId, out: &mut Dispatch) {
        tracing::info!("got hub id {}", id);
        self.router.set_hub_id(id);
        self.factory.set_sender(id);
        for peer in self.peers.values_mut() {
            if matches!(peer.kind, Identity::Ui | Identity::Manager) {
                peer.hub = id;
            }
        }
        let add = self.add_hub_message();
        self.tracker.handle(&add);
        out.outgoing.push((master, add));
    }

    fn next_module_id(&mut self) -> Id {
        let running = self.tracker.running_modules();
        while running.contains(&Id(self.next_module)) {
            self.next_module += 1;
        }
        let id = Id(self.next_module);
        self.next_module += 1;
        id
    }

    /// Hub responsible for `dest`, if `dest` names a hub or a known module.
    fn hub_of(&self, dest: Id) -> Option<Id> {
        if dest.is_hub() {
            Some(dest)
        } else if dest.is_module() {
            self.tracker.module_hub(dest)
        } else {
            None
        }
    }

    // ── Dispatch ──

    /// Handle one message received from `from`.
    pub fn dispatch(&mut self, from: PeerId, mut msg: Message) -> Dispatch {
        let mut out = Dispatch::default();
        let Some(peer) = self.peers.get(&from).cloned() else {
            tracing::warn!("message from unknown {}", from);
            return out;
        };

        match &msg.payload {
            Payload::Identify { identity, name } => {
                let name = name.clone();
                self.identify(from, *identity, &name, &mut out);
                return out;
            }
            Payload::SetId { id } if peer.kind == Identity::Hub => {
                self.assume_id(*id, from, &mut out);
                return out;
            }
            Payload::CloseConnection { reason } => {
                tracing::info!("{} closes: {}", from, reason);
                out.close.push(from);
                return out;
            }
            _ => {}
        }
        if peer.kind == Identity::Unknown {
            tracing::warn!("dropping {} from unidentified {}", msg.message_type(), from);
            return out;
        }

        if self.is_master() {
            if msg.dest() == Id::FOR_BROADCAST {
                msg.set_dest(Id::BROADCAST);
            }
            if let Payload::Spawn { spawn_id, .. } = &mut msg.payload {
                if !spawn_id.is_valid() {
                    *spawn_id = self.next_module_id();
                    tracing::debug!("assigned module id {}", spawn_id);
                }
            }
        }

        let fanout = self.router.route(&msg, peer.kind, peer.hub);
        if fanout.tracker {
            self.tracker.handle(&msg);
            out.tracked = true;
        }
        if fanout.handle || msg.message_type() == MessageType::Spawn {
            self.handle_locally(from, &peer, &msg, &mut out);
        }
        self.forward(from, &peer, &msg, fanout, &mut out);
        out
    }

    fn handle_locally(&mut self, from: PeerId, peer: &Peer, msg: &Message, out: &mut Dispatch) {
        match &msg.payload {
            Payload::Quit => {
                tracing::info!("quit requested by {}", msg.sender());
                self.quit_requested = true;
            }
            Payload::Ping { .. } if msg.dest() == self.hub_id() => {
                out.outgoing.push((from, self.factory.pong(msg)));
            }
            Payload::Spawn { hub, .. } => {
                let mut targets = Vec::new();
                if self.is_master() || peer.kind == Identity::Hub {
                    targets.extend(self.peers_of(&[Identity::Ui]));
                    if *hub == self.hub_id() {
                        targets.extend(self.peers_of(&[Identity::Manager]));
                    } else if self.is_master() {
                        targets.extend(self.hub_peer(*hub));
                    }
                } else {
                    // module ids are handed out by the master
                    targets.extend(self.peers_of(&[Identity::Hub]));
                }
                targets.retain(|t| *t != from);
                self.deliver(out, targets, msg);
            }
            _ => {}
        }

        match msg.message_type() {
            MessageType::Busy | MessageType::Idle | MessageType::ExecutionProgress => {
                if !out.tracked {
                    self.tracker.handle(msg);
                    out.tracked = true;
                }
                let mut targets = self.peers_of(&[Identity::Ui]);
                if !self.is_master() && peer.kind == Identity::Manager {
                    targets.extend(self.peers_of(&[Identity::Hub]));
                }
                if self.is_master() && peer.kind == Identity::SlaveHub {
                    // other slaves track module state too
                    targets.extend(self.peers_of(&[Identity::SlaveHub]));
                }
                targets.retain(|t| *t != from);
                self.deliver(out, targets, msg);
            }
            _ => {}
        }
    }

    fn forward(&self, from: PeerId, peer: &Peer, msg: &Message, fanout: Fanout, out: &mut Dispatch) {
        let mut targets = BTreeSet::new();
        let dest_hub = self.hub_of(msg.dest());
        let hub_id = self.hub_id();

        let local_module = msg.dest().is_module() && dest_hub == Some(hub_id);
        if fanout.manager || fanout.modules || local_module {
            if !msg.dest().is_module() || local_module {
                targets.extend(self.peers_of(&[Identity::Manager]));
            }
        }
        if fanout.ui {
            targets.extend(self.peers_of(&[Identity::Ui]));
        }
        match dest_hub {
            Some(h) if h != hub_id => {
                if self.is_master() {
                    targets.extend(self.hub_peer(h));
                } else if peer.hub == hub_id {
                    targets.extend(self.peers_of(&[Identity::Hub]));
                }
            }
            Some(_) => {}
            None if msg.dest().is_module() => {
                tracing::warn!("cannot resolve hub of module {}", msg.dest());
            }
            None => {
                if fanout.master_hub {
                    targets.extend(self.peers_of(&[Identity::Hub]));
                }
                if fanout.slave_hubs {
                    targets.extend(self.peers_of(&[Identity::SlaveHub]));
                }
            }
        }

        targets.remove(&from);
        self.deliver(out, targets, msg);
    }
}

impl std::fmt::Debug for HubDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubDispatcher")
            .field("name", &self.name)
            .field("hub_id", &self.hub_id())
            .field("peers", &self.peers.len())
            .finish()
    }
}
