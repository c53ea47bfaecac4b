//! Distributed state tracking
//!
//! A [`StateTracker`] reconstructs the session (hubs, modules, parameters,
//! ports, connections) purely from the messages routed to it, and can
//! serialize that view back into a message sequence that rebuilds it in a
//! fresh tracker.
//!
//! # Architecture
//!
//! ```text
//!  Message ──▶ handle() ──▶ TrackerState (under lock) ──▶ events
//!                 │                │                         │
//!                 │          queue of messages         (lock released)
//!                 │          waiting for state               │
//!                 ▼                                          ▼
//!         reply table (uuid → reply)               StateObserver callbacks
//! ```
//!
//! Observers are notified after the state lock has been released, so an
//! observer may query the tracker from its callback.
//!
//! # Queueing
//!
//! Messages flagged `QUEUE_IF_UNHANDLED` that reference unknown state (a
//! `Connect` naming a port not announced yet, a `SetParameter` for a
//! parameter not added yet) are kept and retried whenever a
//! `TRIGGER_QUEUE` message was handled.

pub mod port;

pub use port::{Connection, Disconnection, Port, PortFlags, PortTracker};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use uuid::Uuid;

use crate::error::ParameterError;
use crate::id::Id;
use crate::message::{
    Link, Message, MessageFactory, MessageType, ObjectReceivePolicy, Payload, PortKind,
    ProgressStage, ReducePolicy, SchedulingPolicy, TextType,
};
use crate::parameter::{ParamValue, Parameter, Presentation, RangeType};
use crate::router::{routing_flags, RouteFlags};

bitflags! {
    /// Lifecycle bits reported by [`StateTracker::module_state`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModuleState: u32 {
        const KNOWN = 1;
        const INITIALIZED = 2;
        const KILLED = 4;
        const QUIT = 8;
        const BUSY = 16;
        const EXECUTING = 32;
    }
}

/// A hub taking part in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubData {
    pub id: Id,
    pub name: String,
    pub port: u16,
    pub data_port: u16,
    pub address: String,
}

/// A module that can be spawned on a hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableModule {
    pub hub: Id,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceSettings {
    /// `None` traces every type.
    pub traced: Option<MessageType>,
    /// Module whose traffic is traced; [`Id::BROADCAST`] for all.
    pub module: Id,
}

/// What the tracker knows about one module.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub id: Id,
    pub hub: Id,
    pub name: String,
    pub spawn_uuid: Uuid,
    pub initialized: bool,
    pub killed: bool,
    pub busy: bool,
    pub executing: bool,
    pub height: i32,
    pub object_policy: ObjectReceivePolicy,
    pub scheduling_policy: SchedulingPolicy,
    pub reduce_policy: ReducePolicy,
    pub changed_at: DateTime<Utc>,
    parameters: HashMap<String, Parameter>,
    param_order: Vec<String>,
}

impl ModuleRecord {
    fn new(id: Id, hub: Id, name: String, spawn_uuid: Uuid) -> Self {
        Self {
            id,
            hub,
            name,
            spawn_uuid,
            initialized: false,
            killed: false,
            busy: false,
            executing: false,
            height: -1,
            object_policy: ObjectReceivePolicy::default(),
            scheduling_policy: SchedulingPolicy::default(),
            reduce_policy: ReducePolicy::default(),
            changed_at: Utc::now(),
            parameters: HashMap::new(),
            param_order: Vec::new(),
        }
    }

    pub fn state(&self) -> ModuleState {
        let mut s = ModuleState::KNOWN;
        s.set(ModuleState::INITIALIZED, self.initialized);
        s.set(ModuleState::KILLED, self.killed);
        s.set(ModuleState::BUSY, self.busy);
        s.set(ModuleState::EXECUTING, self.executing);
        s
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    /// Parameters in the order they were added.
    pub fn parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.param_order.iter().filter_map(|n| self.parameters.get(n))
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.param_order
    }

    fn touch(&mut self) {
        self.changed_at = Utc::now();
    }
}

// ── Observer interface ──────────────────────────────────────────────

/// Receives notifications about changes of the tracked state.
///
/// All methods default to doing nothing.
#[allow(unused_variables)]
pub trait StateObserver: Send + Sync {
    fn new_hub(&self, hub: Id, name: &str) {}
    fn delete_hub(&self, hub: Id) {}
    fn module_available(&self, hub: Id, name: &str, path: &str) {}
    fn new_module(&self, module: Id, spawn_uuid: Uuid, name: &str) {}
    fn delete_module(&self, module: Id) {}
    fn module_state_changed(&self, module: Id, state: ModuleState) {}
    fn new_parameter(&self, module: Id, name: &str) {}
    fn parameter_value_changed(&self, module: Id, name: &str) {}
    fn parameter_choices_changed(&self, module: Id, name: &str) {}
    fn delete_parameter(&self, module: Id, name: &str) {}
    fn new_port(&self, module: Id, name: &str) {}
    fn delete_port(&self, module: Id, name: &str) {}
    fn new_connection(&self, from: Id, from_port: &str, to: Id, to_port: &str) {}
    fn delete_connection(&self, from: Id, from_port: &str, to: Id, to_port: &str) {}
    fn info(&self, text: &str, text_type: TextType, sender: Id, rank: i32) {}
    fn quit_requested(&self) {}
    fn inc_modification_count(&self) {}
    fn reset_modification_count(&self) {}
}

#[derive(Debug, Clone)]
enum Event {
    NewHub(Id, String),
    DeleteHub(Id),
    ModuleAvailable(AvailableModule),
    NewModule(Id, Uuid, String),
    DeleteModule(Id),
    StateChanged(Id, ModuleState),
    NewParameter(Id, String),
    ParameterValueChanged(Id, String),
    ParameterChoicesChanged(Id, String),
    DeleteParameter(Id, String),
    NewPort(Id, String),
    DeletePort(Id, String),
    NewConnection(Link),
    DeleteConnection(Link),
    Info(String, TextType, Id, i32),
    QuitRequested,
    Modified,
    ResetModificationCount,
}

impl Event {
    fn deliver(&self, o: &dyn StateObserver) {
        match self {
            Event::NewHub(id, name) => o.new_hub(*id, name),
            Event::DeleteHub(id) => o.delete_hub(*id),
            Event::ModuleAvailable(m) => o.module_available(m.hub, &m.name, &m.path),
            Event::NewModule(id, uuid, name) => o.new_module(*id, *uuid, name),
            Event::DeleteModule(id) => o.delete_module(*id),
            Event::StateChanged(id, state) => o.module_state_changed(*id, *state),
            Event::NewParameter(id, name) => o.new_parameter(*id, name),
            Event::ParameterValueChanged(id, name) => o.parameter_value_changed(*id, name),
            Event::ParameterChoicesChanged(id, name) => o.parameter_choices_changed(*id, name),
            Event::DeleteParameter(id, name) => o.delete_parameter(*id, name),
            Event::NewPort(id, name) => o.new_port(*id, name),
            Event::DeletePort(id, name) => o.delete_port(*id, name),
            Event::NewConnection(l) => o.new_connection(l.module_a, &l.port_a, l.module_b, &l.port_b),
            Event::DeleteConnection(l) => {
                o.delete_connection(l.module_a, &l.port_a, l.module_b, &l.port_b)
            }
            Event::Info(text, ty, sender, rank) => o.info(text, *ty, *sender, *rank),
            Event::QuitRequested => o.quit_requested(),
            Event::Modified => o.inc_modification_count(),
            Event::ResetModificationCount => o.reset_modification_count(),
        }
    }
}

// ── State ───────────────────────────────────────────────────────────

#[derive(Default)]
struct TrackerState {
    running: BTreeMap<Id, ModuleRecord>,
    quit: BTreeMap<Id, ModuleRecord>,
    busy: HashSet<Id>,
    hubs: Vec<HubData>,
    available: Vec<AvailableModule>,
    ports: PortTracker,
    queue: Vec<Message>,
    processing_queue: bool,
    trace: Option<TraceSettings>,
    graph_change_count: u64,
    num_objects: u64,
    events: Vec<Event>,
}

impl TrackerState {
    fn handle(&mut self, msg: &Message) -> bool {
        self.trace(msg);

        let flags = routing_flags(msg.message_type());
        let handled = self.handle_payload(msg);

        if handled {
            if flags.contains(RouteFlags::TRIGGER_QUEUE) {
                self.process_queue();
            }
        } else if flags.contains(RouteFlags::QUEUE_IF_UNHANDLED) {
            tracing::debug!("queueing {} from {}", msg.message_type(), msg.sender());
            self.queue.push(msg.clone());
        }
        handled
    }

    fn trace(&self, msg: &Message) {
        let Some(t) = self.trace else { return };
        let type_matches = t.traced.map_or(true, |ty| ty == msg.message_type());
        let module_matches =
            t.module == Id::BROADCAST || msg.sender() == t.module || msg.dest() == t.module;
        if type_matches && module_matches {
            tracing::info!(
                "trace: {} {} -> {} {:?}",
                msg.message_type(),
                msg.sender(),
                msg.dest(),
                msg.payload
            );
        }
    }

    fn process_queue(&mut self) {
        if self.processing_queue {
            return;
        }
        self.processing_queue = true;
        let queue = std::mem::take(&mut self.queue);
        for msg in &queue {
            self.handle(msg);
        }
        self.processing_queue = false;
    }

    /// Drop queued messages addressed to or connecting `module`.
    fn clean_queue(&mut self, module: Id) {
        self.queue.retain(|msg| {
            if msg.dest() == module {
                return false;
            }
            match &msg.payload {
                Payload::Connect(l) | Payload::Disconnect(l) => {
                    l.module_a != module && l.module_b != module
                }
                Payload::SetParameter { module: m, .. } => *m != module,
                _ => true,
            }
        });
    }

    fn state_changed(&mut self, id: Id) {
        if let Some(m) = self.running.get_mut(&id) {
            m.touch();
            self.events.push(Event::StateChanged(id, m.state()));
        } else if let Some(m) = self.quit.get_mut(&id) {
            m.touch();
            self.events
                .push(Event::StateChanged(id, m.state() | ModuleState::QUIT));
        }
    }

    fn compute_heights(&mut self) {
        let ids: Vec<Id> = self.running.keys().copied().collect();
        let heights = self.ports.compute_heights(&ids);
        for (id, m) in self.running.iter_mut() {
            m.height = heights.get(id).copied().unwrap_or(-1);
        }
    }

    fn is_executing(&self, id: Id) -> bool {
        self.running.get(&id).is_some_and(|m| m.executing)
    }

    fn handle_payload(&mut self, msg: &Message) -> bool {
        let sender = msg.sender();
        match &msg.payload {
            Payload::AddHub {
                id,
                name,
                port,
                data_port,
                address,
            } => {
                if self.hubs.iter().any(|h| h.id == *id) {
                    return true;
                }
                self.hubs.push(HubData {
                    id: *id,
                    name: name.clone(),
                    port: *port,
                    data_port: *data_port,
                    address: address.clone(),
                });
                self.events.push(Event::NewHub(*id, name.clone()));
                true
            }
            Payload::RemoveHub { id } => {
                self.hubs.retain(|h| h.id != *id);
                self.events.push(Event::DeleteHub(*id));
                true
            }
            Payload::Spawn {
                hub,
                name,
                spawn_id,
                ..
            } => {
                self.graph_change_count += 1;
                if !spawn_id.is_valid() {
                    // not tracked until the master hub assigned an id
                    return true;
                }
                let record = ModuleRecord::new(*spawn_id, *hub, name.clone(), msg.uuid());
                self.running.entry(*spawn_id).or_insert(record);
                self.events.push(Event::Modified);
                self.events
                    .push(Event::NewModule(*spawn_id, msg.uuid(), name.clone()));
                true
            }
            Payload::Started { .. } => {
                self.graph_change_count += 1;
                match self.running.get_mut(&sender) {
                    Some(m) => {
                        m.initialized = true;
                        self.state_changed(sender);
                        true
                    }
                    None => {
                        tracing::warn!("Started from unknown module {}", sender);
                        false
                    }
                }
            }
            Payload::Busy => {
                if !self.busy.insert(sender) {
                    tracing::debug!("module {} sent Busy twice", sender);
                }
                match self.running.get_mut(&sender) {
                    Some(m) => {
                        m.busy = true;
                        self.state_changed(sender);
                        true
                    }
                    None => false,
                }
            }
            Payload::Idle => {
                if !self.busy.remove(&sender) {
                    tracing::debug!("module {} sent Idle, but was not busy", sender);
                }
                match self.running.get_mut(&sender) {
                    Some(m) => {
                        m.busy = false;
                        self.state_changed(sender);
                        true
                    }
                    None => false,
                }
            }
            Payload::Kill { module } => {
                let ids: Vec<Id> = if *module == Id::BROADCAST {
                    self.running.keys().chain(self.quit.keys()).copied().collect()
                } else {
                    vec![*module]
                };
                for id in ids {
                    let record = self
                        .running
                        .get_mut(&id)
                        .or_else(|| self.quit.get_mut(&id));
                    match record {
                        Some(m) => {
                            m.killed = true;
                            self.state_changed(id);
                        }
                        None => tracing::warn!("Kill for unknown module {}", id),
                    }
                }
                true
            }
            Payload::ModuleExit { .. } => {
                self.graph_change_count += 1;
                for link in self.ports.remove_module(sender) {
                    self.events.push(Event::DeleteConnection(link));
                }
                match self.running.remove(&sender) {
                    Some(m) => {
                        self.quit.insert(sender, m);
                    }
                    None if self.quit.contains_key(&sender) => {}
                    None => tracing::warn!("ModuleExit from unknown module {}", sender),
                }
                self.busy.remove(&sender);
                self.clean_queue(sender);
                self.compute_heights();
                self.events.push(Event::Modified);
                self.events.push(Event::DeleteModule(sender));
                true
            }
            Payload::Execute { .. } => true,
            Payload::ExecutionProgress { stage } => match self.running.get_mut(&sender) {
                Some(m) => {
                    m.executing = *stage == ProgressStage::Start;
                    self.state_changed(sender);
                    true
                }
                None => false,
            },
            Payload::AddParameter {
                name,
                description,
                group,
                param_type,
                presentation,
                ..
            } => {
                let Some(m) = self.running.get_mut(&sender) else {
                    tracing::warn!("AddParameter {}: did not find sending module {}", name, sender);
                    return true;
                };
                if m.parameters.contains_key(name) {
                    tracing::warn!("duplicate parameter {}:{}", m.name, name);
                } else {
                    match Parameter::new(sender, name.clone(), *param_type, *presentation) {
                        Some(mut p) => {
                            p.description = description.clone();
                            p.group = group.clone();
                            m.parameters.insert(name.clone(), p);
                            m.param_order.push(name.clone());
                        }
                        None => {
                            tracing::warn!("parameter {}:{} has no value kind", m.name, name);
                            return true;
                        }
                    }
                }
                self.events.push(Event::Modified);
                self.events.push(Event::NewParameter(sender, name.clone()));
                let mut port = Port::new(sender, name.clone(), PortKind::Parameter, PortFlags::empty());
                port.description = description.clone();
                if self.ports.add_port(port) {
                    self.events.push(Event::NewPort(sender, name.clone()));
                }
                true
            }
            Payload::RemoveParameter { name, .. } => {
                let Some(m) = self.running.get_mut(&sender) else {
                    return false;
                };
                if m.parameters.remove(name).is_none() {
                    tracing::warn!("parameter to be removed not found: {}:{}", sender, name);
                    return false;
                }
                m.param_order.retain(|n| n != name);
                if let Some(links) = self.ports.remove_port(sender, name) {
                    self.events.push(Event::DeletePort(sender, name.clone()));
                    self.events
                        .extend(links.into_iter().map(Event::DeleteConnection));
                }
                self.events.push(Event::Modified);
                self.events.push(Event::DeleteParameter(sender, name.clone()));
                true
            }
            Payload::SetParameter {
                module,
                name,
                value,
                range,
                init,
                ..
            } => {
                // only the owning module's own report changes tracked state
                if *module != sender {
                    return false;
                }
                match self.apply_parameter(*module, name, value, *range, *init) {
                    None => false,
                    Some(Ok(())) => true,
                    Some(Err(e)) => {
                        tracing::warn!("SetParameter {}:{} rejected: {}", module, name, e);
                        true
                    }
                }
            }
            Payload::SetParameterChoices { name, choices, .. } => {
                let Some(p) = self
                    .running
                    .get_mut(&sender)
                    .and_then(|m| m.parameters.get_mut(name))
                else {
                    return false;
                };
                match p.set_choices(choices.clone()) {
                    Ok(()) => {
                        self.events.push(Event::Modified);
                        self.events
                            .push(Event::ParameterChoicesChanged(sender, name.clone()));
                    }
                    Err(e) => tracing::warn!("{}", e),
                }
                true
            }
            Payload::AddPort(info) => {
                if !self.ports.add_port(Port::from_info(info)) {
                    return false;
                }
                self.events.push(Event::Modified);
                self.events.push(Event::NewPort(info.module, info.name.clone()));
                true
            }
            Payload::RemovePort(info) => {
                if let Some(links) = self.ports.remove_port(info.module, &info.name) {
                    self.events.push(Event::Modified);
                    self.events
                        .push(Event::DeletePort(info.module, info.name.clone()));
                    self.events
                        .extend(links.into_iter().map(Event::DeleteConnection));
                }
                true
            }
            Payload::Connect(l) => {
                if self.is_executing(l.module_a) || self.is_executing(l.module_b) {
                    return false;
                }
                self.graph_change_count += 1;
                let handled = match self
                    .ports
                    .add_connection(l.module_a, &l.port_a, l.module_b, &l.port_b)
                {
                    Connection::Added => {
                        self.events.push(Event::Modified);
                        self.events.push(Event::NewConnection(l.clone()));
                        true
                    }
                    Connection::Exists | Connection::Rejected => true,
                    Connection::Missing => false,
                };
                self.compute_heights();
                handled
            }
            Payload::Disconnect(l) => {
                if self.is_executing(l.module_a) || self.is_executing(l.module_b) {
                    return false;
                }
                self.graph_change_count += 1;
                let handled = match self
                    .ports
                    .remove_connection(l.module_a, &l.port_a, l.module_b, &l.port_b)
                {
                    Disconnection::Removed => {
                        self.events.push(Event::Modified);
                        self.events.push(Event::DeleteConnection(l.clone()));
                        true
                    }
                    Disconnection::NotConnected => true,
                    Disconnection::Missing => false,
                };
                self.compute_heights();
                handled
            }
            Payload::Quit => {
                self.events.push(Event::QuitRequested);
                true
            }
            Payload::SendText {
                text_type, text, ..
            } => {
                self.events
                    .push(Event::Info(text.clone(), *text_type, sender, msg.rank()));
                true
            }
            Payload::ModuleAvailable { hub, name, path } => {
                let entry = AvailableModule {
                    hub: *hub,
                    name: name.clone(),
                    path: path.clone(),
                };
                if !self.available.contains(&entry) {
                    self.available.push(entry.clone());
                    self.events.push(Event::ModuleAvailable(entry));
                }
                true
            }
            Payload::ObjectReceivePolicy(p) => self.with_module(sender, |m| m.object_policy = *p),
            Payload::SchedulingPolicy(p) => self.with_module(sender, |m| m.scheduling_policy = *p),
            Payload::ReducePolicy(p) => self.with_module(sender, |m| m.reduce_policy = *p),
            Payload::Trace { traced, module, on } => {
                self.trace = on.then_some(TraceSettings {
                    traced: *traced,
                    module: *module,
                });
                true
            }
            Payload::ReplayFinished => {
                self.events.push(Event::ResetModificationCount);
                true
            }
            Payload::AddObject { .. } => {
                self.num_objects += 1;
                true
            }
            Payload::Identify { .. }
            | Payload::CloseConnection { .. }
            | Payload::SetId { .. }
            | Payload::SpawnPrepared { .. }
            | Payload::CancelExecute { .. }
            | Payload::AddObjectCompleted { .. }
            | Payload::ObjectReceived { .. }
            | Payload::Ping { .. }
            | Payload::Pong { .. }
            | Payload::Barrier
            | Payload::BarrierReached
            | Payload::LockUi { .. }
            | Payload::RequestTunnel { .. }
            | Payload::RequestObject { .. }
            | Payload::SendObject { .. } => true,
        }
    }

    fn with_module(&mut self, id: Id, f: impl FnOnce(&mut ModuleRecord)) -> bool {
        match self.running.get_mut(&id) {
            Some(m) => {
                f(m);
                m.touch();
                true
            }
            None => false,
        }
    }

    /// `None` if module or parameter is unknown.
    fn apply_parameter(
        &mut self,
        module: Id,
        name: &str,
        value: &ParamValue,
        range: RangeType,
        init: bool,
    ) -> Option<Result<(), ParameterError>> {
        let p = self.running.get_mut(&module)?.parameters.get_mut(name)?;
        let res = p.apply(value, range, init);
        if res.is_ok() {
            self.events.push(Event::Modified);
            self.events
                .push(Event::ParameterValueChanged(module, name.to_string()));
        }
        Some(res)
    }

    fn get_state(&self, factory: &MessageFactory) -> Vec<Message> {
        let mut out = Vec::new();

        for h in &self.hubs {
            out.push(factory.make(Payload::AddHub {
                id: h.id,
                name: h.name.clone(),
                port: h.port,
                data_port: h.data_port,
                address: h.address.clone(),
            }));
        }

        for a in &self.available {
            out.push(factory.make(Payload::ModuleAvailable {
                hub: a.hub,
                name: a.name.clone(),
                path: a.path.clone(),
            }));
        }

        for (id, m) in &self.running {
            let id = *id;
            out.push(
                factory
                    .make(Payload::Spawn {
                        hub: m.hub,
                        name: m.name.clone(),
                        spawn_id: id,
                        mpi_size: 1,
                        base_rank: 0,
                        rank_skip: 0,
                    })
                    .with_uuid(m.spawn_uuid),
            );
            if m.initialized {
                out.push(
                    factory
                        .make(Payload::Started {
                            name: m.name.clone(),
                        })
                        .with_sender(id),
                );
            }
            if m.busy {
                out.push(factory.make(Payload::Busy).with_sender(id));
            }
            if m.killed {
                out.push(factory.make(Payload::Kill { module: id }));
            }
            for (policy, emit) in [
                (
                    Payload::ObjectReceivePolicy(m.object_policy),
                    m.object_policy != ObjectReceivePolicy::default(),
                ),
                (
                    Payload::SchedulingPolicy(m.scheduling_policy),
                    m.scheduling_policy != SchedulingPolicy::default(),
                ),
                (
                    Payload::ReducePolicy(m.reduce_policy),
                    m.reduce_policy != ReducePolicy::default(),
                ),
            ] {
                if emit {
                    out.push(factory.make(policy).with_sender(id));
                }
            }

            // parameters and ports interleaved as declared; a value goes
            // out before its range so the copy accepts it
            let emit_parameter = |out: &mut Vec<Message>, p: &Parameter| {
                out.push(
                    factory
                        .make(Payload::AddParameter {
                            module: id,
                            name: p.name.clone(),
                            description: p.description.clone(),
                            group: p.group.clone(),
                            param_type: p.param_type(),
                            presentation: p.presentation,
                        })
                        .with_sender(id),
                );
                let set = |value: ParamValue, range: RangeType, init: bool| {
                    factory
                        .make(Payload::SetParameter {
                            module: id,
                            name: p.name.clone(),
                            value,
                            range,
                            init,
                            reply: false,
                        })
                        .with_sender(id)
                };
                out.push(set(p.default_value(), RangeType::Value, true));
                if p.presentation == Presentation::Choice {
                    out.push(
                        factory
                            .make(Payload::SetParameterChoices {
                                module: id,
                                name: p.name.clone(),
                                choices: p.choices.clone(),
                            })
                            .with_sender(id),
                    );
                }
                out.push(set(p.value(), RangeType::Value, false));
                if let Some(min) = p.minimum() {
                    out.push(set(min, RangeType::Minimum, false));
                }
                if let Some(max) = p.maximum() {
                    out.push(set(max, RangeType::Maximum, false));
                }
            };

            let mut emitted = HashSet::new();
            for port in self.ports.ports(id) {
                match m.parameter(&port.name) {
                    Some(p) if port.kind == PortKind::Parameter => {
                        emit_parameter(&mut out, p);
                        emitted.insert(p.name.as_str());
                    }
                    _ => out.push(factory.make(Payload::AddPort(port.info())).with_sender(id)),
                }
            }
            for p in m.parameters().filter(|p| !emitted.contains(p.name.as_str())) {
                emit_parameter(&mut out, p);
            }
        }

        for link in self.ports.connections() {
            out.push(factory.make(Payload::Connect(link)));
        }

        out.extend(self.queue.iter().cloned());
        out.push(factory.make(Payload::ReplayFinished));
        out
    }
}

// ── Tracker ─────────────────────────────────────────────────────────

/// Thread-safe state tracker with a uuid-keyed reply table.
pub struct StateTracker {
    name: String,
    factory: MessageFactory,
    state: Mutex<TrackerState>,
    observers: RwLock<Vec<Arc<dyn StateObserver>>>,
    replies: Mutex<HashMap<Uuid, Option<Message>>>,
    reply_cv: Condvar,
}

impl StateTracker {
    /// `identity` is the sender stamped on replayed messages that have no
    /// natural module sender.
    pub fn new(name: impl Into<String>, identity: Id) -> Self {
        Self {
            name: name.into(),
            factory: MessageFactory::new(identity, 0),
            state: Mutex::new(TrackerState::default()),
            observers: RwLock::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            reply_cv: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_observer(&self, observer: Arc<dyn StateObserver>) {
        self.observers.write().push(observer);
    }

    /// Feed one message. Returns whether it could be applied; unhandled
    /// messages of queueable types are kept for a later retry.
    pub fn handle(&self, msg: &Message) -> bool {
        match msg.message_type() {
            MessageType::Spawn | MessageType::BarrierReached => {
                self.register_reply(msg.uuid(), msg);
            }
            _ => {}
        }

        let (handled, events) = {
            let mut st = self.state.lock();
            let handled = st.handle(msg);
            (handled, std::mem::take(&mut st.events))
        };
        self.dispatch(&events);
        handled
    }

    fn dispatch(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.read().clone();
        for ev in events {
            for o in &observers {
                ev.deliver(o.as_ref());
            }
        }
    }

    /// Apply a parameter update directly and report the outcome.
    pub fn apply_parameter(
        &self,
        module: Id,
        name: &str,
        value: &ParamValue,
        range: RangeType,
    ) -> Result<(), ParameterError> {
        let (res, known, events) = {
            let mut st = self.state.lock();
            let res = st.apply_parameter(module, name, value, range, false);
            let known = st.running.contains_key(&module);
            (res, known, std::mem::take(&mut st.events))
        };
        self.dispatch(&events);
        match res {
            Some(res) => res,
            None if !known => Err(ParameterError::UnknownModule(module)),
            None => Err(ParameterError::NotFound(format!("{module}:{name}"))),
        }
    }

    /// The tracked state as a message sequence ending in `ReplayFinished`.
    pub fn get_state(&self) -> Vec<Message> {
        self.state.lock().get_state(&self.factory)
    }

    // ── Queries ──

    pub fn module_state(&self, id: Id) -> ModuleState {
        let st = self.state.lock();
        if let Some(m) = st.running.get(&id) {
            return m.state();
        }
        if st.quit.contains_key(&id) {
            return ModuleState::QUIT;
        }
        ModuleState::empty()
    }

    pub fn module(&self, id: Id) -> Option<ModuleRecord> {
        self.state.lock().running.get(&id).cloned()
    }

    pub fn running_modules(&self) -> Vec<Id> {
        self.state.lock().running.keys().copied().collect()
    }

    pub fn module_name(&self, id: Id) -> Option<String> {
        let st = self.state.lock();
        st.running
            .get(&id)
            .or_else(|| st.quit.get(&id))
            .map(|m| m.name.clone())
    }

    pub fn module_hub(&self, id: Id) -> Option<Id> {
        self.state.lock().running.get(&id).map(|m| m.hub)
    }

    pub fn parameter(&self, module: Id, name: &str) -> Option<Parameter> {
        self.state
            .lock()
            .running
            .get(&module)
            .and_then(|m| m.parameter(name).cloned())
    }

    pub fn parameter_names(&self, module: Id) -> Vec<String> {
        self.state
            .lock()
            .running
            .get(&module)
            .map(|m| m.param_order.clone())
            .unwrap_or_default()
    }

    pub fn ports(&self, module: Id) -> Vec<Port> {
        self.state.lock().ports.ports(module).to_vec()
    }

    pub fn connections(&self) -> Vec<Link> {
        self.state.lock().ports.connections()
    }

    pub fn downstream_modules(&self, module: Id) -> HashSet<Id> {
        self.state.lock().ports.downstream(module)
    }

    pub fn upstream_modules(&self, module: Id, port: Option<&str>) -> HashSet<Id> {
        self.state.lock().ports.upstream(module, port)
    }

    pub fn hubs(&self) -> Vec<HubData> {
        self.state.lock().hubs.clone()
    }

    pub fn slave_hubs(&self) -> Vec<Id> {
        self.state
            .lock()
            .hubs
            .iter()
            .map(|h| h.id)
            .filter(|id| *id != Id::MASTER_HUB)
            .collect()
    }

    pub fn available_modules(&self) -> Vec<AvailableModule> {
        self.state.lock().available.clone()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn graph_change_count(&self) -> u64 {
        self.state.lock().graph_change_count
    }

    pub fn num_objects(&self) -> u64 {
        self.state.lock().num_objects
    }

    pub fn trace_settings(&self) -> Option<TraceSettings> {
        self.state.lock().trace
    }

    pub fn busy_modules(&self) -> HashSet<Id> {
        self.state.lock().busy.clone()
    }

    pub fn module_height(&self, id: Id) -> Option<i32> {
        self.state.lock().running.get(&id).map(|m| m.height)
    }

    // ── Request/reply table ──

    /// Announce interest in the reply to `uuid`. Returns `false` if a
    /// request for it is already outstanding.
    pub fn register_request(&self, uuid: Uuid) -> bool {
        let mut replies = self.replies.lock();
        if replies.contains_key(&uuid) {
            tracing::warn!("duplicate attempt to wait for reply {}", uuid);
            return false;
        }
        replies.insert(uuid, None);
        true
    }

    /// Store the reply for `uuid`. Returns `false` if nobody asked for it or
    /// a reply was already stored.
    pub fn register_reply(&self, uuid: Uuid, msg: &Message) -> bool {
        let mut replies = self.replies.lock();
        let Some(slot) = replies.get_mut(&uuid) else {
            return false;
        };
        if slot.is_some() {
            tracing::error!("duplicate reply for {}", uuid);
            debug_assert!(slot.is_none(), "duplicate reply for {uuid}");
            return false;
        }
        *slot = Some(msg.clone());
        self.reply_cv.notify_all();
        true
    }

    /// Block until the reply for `uuid` is available and consume it.
    pub fn wait_for_reply(&self, uuid: Uuid) -> Message {
        let mut replies = self.replies.lock();
        loop {
            if let Some(msg) = take_reply(&mut replies, uuid) {
                return msg;
            }
            self.reply_cv.wait(&mut replies);
        }
    }

    /// Like [`wait_for_reply`](Self::wait_for_reply), giving up after
    /// `timeout`. The request stays registered on timeout.
    pub fn wait_for_reply_timeout(&self, uuid: Uuid, timeout: Duration) -> Option<Message> {
        let deadline = std::time::Instant::now() + timeout;
        let mut replies = self.replies.lock();
        loop {
            if let Some(msg) = take_reply(&mut replies, uuid) {
                return Some(msg);
            }
            if self.reply_cv.wait_until(&mut replies, deadline).timed_out() {
                return take_reply(&mut replies, uuid);
            }
        }
    }

    pub fn outstanding_requests(&self) -> usize {
        self.replies.lock().len()
    }
}

fn take_reply(replies: &mut HashMap<Uuid, Option<Message>>, uuid: Uuid) -> Option<Message> {
    if replies.get(&uuid).is_some_and(Option::is_some) {
        replies.remove(&uuid).flatten()
    } else {
        None
    }
}

impl std::fmt::Debug for StateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("StateTracker")
            .field("name", &self.name)
            .field("running", &st.running.len())
            .field("quit", &st.quit.len())
            .field("queued", &st.queue.len())
            .finish()
    }
}
