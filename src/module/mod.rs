//! Module runtime
//!
//! A [`Module`] is the in-process side of one pipeline stage. It owns the
//! connection to its hub, the ports and parameters it announced, and the
//! shared region its objects live in. [`Module::run`] drives the dispatch
//! loop and calls back into a [`Compute`] implementation.
//!
//! # Architecture
//!
//! ```text
//!   hub ──Transport──▶ next_batch() ──▶ handle_message() ──▶ Cycle
//!                          ▲                  │                 │
//!                          │          immediate replies         ▼
//!                          │      (BarrierReached, Pong,   run_cycle():
//!                          │       SendObject, ...)        Busy
//!                          │                               prepare
//!                          └──────── Idle ◀────────────── compute (execute)
//!                                                          compute (per object)
//!                                                          reduce
//! ```
//!
//! # Trigger precedence
//!
//! All messages that are available at once form one dispatch cycle. Within a
//! cycle an explicit `Execute(ComputeExecute)` runs first and sees every
//! object queued on the input ports; object-triggered computes only run for
//! input that is still queued afterwards.
//!
//! # Teardown
//!
//! `ModuleExit` is sent when [`Module::run`] returns and, failing that, when
//! the module is dropped (including during unwinding), so the hub never keeps
//! a stale record.

pub mod collective;

pub use collective::{Collective, SingleRank};

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::archive::{DeepArchiveFetcher, DeepArchiveSaver, Directory};
use crate::error::{PipehubError, Result, TransportError};
use crate::id::Id;
use crate::message::{
    ExecuteWhat, Link, Message, MessageFactory, ObjectReceivePolicy, Payload, PortInfo, PortKind,
    ProgressStage, ReducePolicy, SchedulingPolicy, TextType,
};
use crate::object::{Meta, Object, ObjectType, SharedRegion};
use crate::parameter::{ParamValue, Parameter, Presentation, RangeType};
use crate::tracker::PortFlags;

/// Upper bound of messages folded into one dispatch cycle.
const MAX_BATCH: usize = 256;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why [`Compute::compute`] was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Explicit `Execute` request.
    Execute,
    /// An object is queued on an input port.
    Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub trigger: Trigger,
    pub execution_count: i32,
}

/// Callbacks implemented by a pipeline stage.
///
/// Errors and panics are caught by the dispatch loop and reported as
/// `SendText(Error)`; the loop carries on afterwards.
#[allow(unused_variables)]
pub trait Compute {
    fn prepare(&mut self, module: &mut Module) -> Result<()> {
        Ok(())
    }

    fn compute(&mut self, module: &mut Module, task: &Task) -> Result<()>;

    /// `timestep` is `-1` for a reduction over all timesteps.
    fn reduce(&mut self, module: &mut Module, timestep: i32) -> Result<()> {
        Ok(())
    }

    fn parameter_changed(&mut self, module: &mut Module, name: &str) -> Result<()> {
        Ok(())
    }
}

struct PortState {
    info: PortInfo,
    /// (module, port) on the other end.
    links: BTreeSet<(Id, String)>,
    queue: VecDeque<Object>,
}

/// Object announced via `AddObject` whose data still has to be fetched.
struct Awaited {
    port: String,
    announcement: Message,
}

#[derive(Debug, Default, Clone, Copy)]
struct Cycle {
    prepare: bool,
    execute: bool,
    reduce: bool,
}

/// Runtime state of one module process.
pub struct Module {
    name: String,
    id: Id,
    factory: MessageFactory,
    transport: Box<dyn crate::transport::Transport>,
    region: SharedRegion,
    collective: Box<dyn Collective>,
    fetcher: DeepArchiveFetcher,
    ports: BTreeMap<String, PortState>,
    parameters: HashMap<String, Parameter>,
    param_order: Vec<String>,
    object_policy: ObjectReceivePolicy,
    scheduling_policy: SchedulingPolicy,
    reduce_policy: ReducePolicy,
    running: Arc<AtomicBool>,
    exit_sent: bool,
    execution_count: i32,
    /// Sent objects kept alive until every receiver acknowledged them.
    published: HashMap<String, (Object, usize)>,
    awaited: HashMap<String, Awaited>,
    incomplete: Vec<(Object, Awaited)>,
    timesteps: Vec<i32>,
    poll_interval: Duration,
}

impl Module {
    pub fn new(
        name: impl Into<String>,
        id: Id,
        transport: Box<dyn crate::transport::Transport>,
        region: SharedRegion,
    ) -> Self {
        let rank = region.rank();
        let fetcher = DeepArchiveFetcher::new(region.clone(), Directory::default());
        Self {
            name: name.into(),
            id,
            factory: MessageFactory::new(id, rank),
            transport,
            region,
            collective: Box::new(SingleRank),
            fetcher,
            ports: BTreeMap::new(),
            parameters: HashMap::new(),
            param_order: Vec::new(),
            object_policy: ObjectReceivePolicy::default(),
            scheduling_policy: SchedulingPolicy::default(),
            reduce_policy: ReducePolicy::default(),
            running: Arc::new(AtomicBool::new(true)),
            exit_sent: false,
            execution_count: 0,
            published: HashMap::new(),
            awaited: HashMap::new(),
            incomplete: Vec::new(),
            timesteps: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_collective(mut self, collective: Box<dyn Collective>) -> Self {
        self.collective = collective;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn rank(&self) -> i32 {
        self.factory.rank()
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn execution_count(&self) -> i32 {
        self.execution_count
    }

    /// Flag observed by the dispatch loop; clearing it stops the module.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Outbound ──

    pub fn send(&mut self, msg: Message) -> Result<()> {
        self.transport.send(msg)
    }

    /// Send and only log failures; a dead link is noticed by the next
    /// receive.
    fn post(&mut self, msg: Message) {
        let ty = msg.message_type();
        if let Err(e) = self.transport.send(msg) {
            tracing::warn!(module = %self.name, "sending {} failed: {}", ty, e);
        }
    }

    fn post_payload(&mut self, payload: Payload) {
        let msg = self.factory.make(payload);
        self.post(msg);
    }

    pub fn send_text(&mut self, text_type: TextType, text: impl Into<String>) {
        self.post_payload(Payload::text(text_type, text));
    }

    fn send_exit(&mut self) -> Result<()> {
        if self.exit_sent {
            return Ok(());
        }
        self.exit_sent = true;
        let msg = self.factory.make(Payload::ModuleExit { forwarded: false });
        self.transport.send(msg)
    }

    // ── Ports ──

    pub fn create_input_port(&mut self, name: &str, description: &str) -> Result<()> {
        self.create_port(name, description, PortKind::Input, PortFlags::empty())
    }

    /// Input port that accepts any number of upstream connections.
    pub fn create_combining_input_port(&mut self, name: &str, description: &str) -> Result<()> {
        self.create_port(name, description, PortKind::Input, PortFlags::COMBINE)
    }

    pub fn create_output_port(&mut self, name: &str, description: &str) -> Result<()> {
        self.create_port(name, description, PortKind::Output, PortFlags::empty())
    }

    fn create_port(
        &mut self,
        name: &str,
        description: &str,
        kind: PortKind,
        flags: PortFlags,
    ) -> Result<()> {
        if self.ports.contains_key(name) || self.parameters.contains_key(name) {
            return Err(PipehubError::Consistency(format!(
                "{}: duplicate port {}",
                self.name, name
            )));
        }
        let info = PortInfo {
            module: self.id,
            name: name.to_string(),
            kind,
            flags: flags.bits(),
            description: description.to_string(),
        };
        self.ports.insert(
            name.to_string(),
            PortState {
                info: info.clone(),
                links: BTreeSet::new(),
                queue: VecDeque::new(),
            },
        );
        self.send(self.factory.make(Payload::AddPort(info)))
    }

    pub fn is_connected(&self, port: &str) -> bool {
        self.ports.get(port).is_some_and(|p| !p.links.is_empty())
    }

    pub fn has_input(&self, port: &str) -> bool {
        self.ports.get(port).is_some_and(|p| !p.queue.is_empty())
    }

    /// Take the oldest object queued on input `port`.
    pub fn take_input(&mut self, port: &str) -> Option<Object> {
        self.ports.get_mut(port)?.queue.pop_front()
    }

    fn queued_input(&self) -> usize {
        self.ports.values().map(|p| p.queue.len()).sum()
    }

    fn update_link(&mut self, link: &Link, connect: bool) {
        let mut apply = |own_port: &str, other: Id, other_port: &str| {
            if let Some(p) = self.ports.get_mut(own_port) {
                let key = (other, other_port.to_string());
                if connect {
                    p.links.insert(key);
                } else {
                    p.links.remove(&key);
                }
            }
        };
        if link.module_a == self.id {
            apply(&link.port_a, link.module_b, &link.port_b);
        }
        if link.module_b == self.id {
            apply(&link.port_b, link.module_a, &link.port_a);
        }
    }

    // ── Objects ──

    /// Allocate an object stamped with this module as creator.
    pub fn create_object(&self, object_type: ObjectType) -> Object {
        let meta = Meta::default().with_creator(self.id.0, self.execution_count);
        self.region.create_object(object_type, meta)
    }

    /// Announce `obj` on output `port` to every connected input. The object
    /// stays referenced until each receiver acknowledged it.
    pub fn add_object(&mut self, port: &str, obj: &Object) -> Result<()> {
        let links: Vec<(Id, String)> = match self.ports.get(port) {
            Some(p) if p.info.kind == PortKind::Output => p.links.iter().cloned().collect(),
            _ => {
                return Err(PipehubError::Application(format!(
                    "{}: no output port {}",
                    self.name, port
                )))
            }
        };
        if links.is_empty() {
            tracing::debug!(module = %self.name, "{} not connected, dropping {}", port, obj.name());
            return Ok(());
        }
        for (dest, dest_port) in &links {
            let msg = self
                .factory
                .make(Payload::AddObject {
                    sender_port: port.to_string(),
                    dest_port: dest_port.clone(),
                    object_name: obj.name().to_string(),
                    object_type: obj.object_type(),
                    meta: obj.meta(),
                })
                .with_dest(*dest);
            self.send(msg)?;
        }
        let entry = self
            .published
            .entry(obj.name().to_string())
            .or_insert_with(|| (obj.clone(), 0));
        entry.1 += links.len();
        Ok(())
    }

    /// Number of sent objects still waiting for acknowledgement.
    pub fn unacknowledged(&self) -> usize {
        self.published.len()
    }

    fn object_announced(&mut self, msg: &Message, dest_port: &str, name: &str) {
        if !self.ports.contains_key(dest_port) {
            tracing::warn!(module = %self.name, "object {} for unknown port {}", name, dest_port);
            return;
        }
        let awaited = Awaited {
            port: dest_port.to_string(),
            announcement: msg.clone(),
        };
        match self.region.object(name) {
            Some(obj) => self.deliver(obj, awaited),
            None => {
                tracing::debug!(module = %self.name, "requesting {} from {}", name, msg.sender());
                let request = self
                    .factory
                    .make(Payload::RequestObject {
                        object_name: name.to_string(),
                        referrer: String::new(),
                        array: false,
                    })
                    .with_dest(msg.sender())
                    .with_dest_rank(msg.rank());
                self.awaited.insert(name.to_string(), awaited);
                self.post(request);
            }
        }
    }

    fn deliver(&mut self, obj: Object, awaited: Awaited) {
        let ts = obj.meta().timestep;
        if !self.timesteps.contains(&ts) {
            self.timesteps.push(ts);
        }
        let reply = self.factory.reply(
            &awaited.announcement,
            Payload::AddObjectCompleted {
                object_name: obj.name().to_string(),
                origin: awaited.announcement.sender(),
            },
        );
        if let Some(p) = self.ports.get_mut(&awaited.port) {
            p.queue.push_back(obj);
        }
        self.post(reply);
    }

    fn object_acknowledged(&mut self, name: &str) {
        let done = match self.published.get_mut(name) {
            Some((_, outstanding)) => {
                *outstanding = outstanding.saturating_sub(1);
                *outstanding == 0
            }
            None => {
                tracing::debug!(module = %self.name, "acknowledgement for unknown object {}", name);
                false
            }
        };
        if done {
            self.published.remove(name);
        }
    }

    /// Answer a `RequestObject` with the serialized graph: referenced
    /// blobs first, the requested object last.
    fn serve_object(&mut self, request: &Message, name: &str) {
        let Some(obj) = self.region.object(name) else {
            tracing::warn!(module = %self.name, "requested object {} is not resident", name);
            return;
        };
        let mut saver = DeepArchiveSaver::default();
        let top = match saver.save(&obj) {
            Ok(blob) => blob,
            Err(e) => {
                self.send_text(TextType::Error, format!("serializing {name} failed: {e}"));
                return;
            }
        };
        let to = |f: &MessageFactory, payload: Payload, data: Bytes| {
            f.make(payload)
                .with_dest(request.sender())
                .with_dest_rank(request.rank())
                .with_raw_payload(data)
        };
        for entry in saver.into_directory().entries {
            let msg = to(
                &self.factory,
                Payload::SendObject {
                    object_name: entry.name,
                    referrer: name.to_string(),
                    array: entry.is_array,
                },
                entry.data,
            );
            self.post(msg);
        }
        let msg = to(
            &self.factory,
            Payload::SendObject {
                object_name: name.to_string(),
                referrer: String::new(),
                array: false,
            },
            top,
        );
        self.post(msg);
    }

    fn object_data_received(&mut self, name: &str, referrer: &str, array: bool, data: Bytes) {
        if !referrer.is_empty() {
            if array {
                self.fetcher.add_array_blob(name, data);
            } else {
                self.fetcher.add_object_blob(name, data);
            }
            self.retry_incomplete();
            return;
        }
        let Some(awaited) = self.awaited.remove(name) else {
            tracing::debug!(module = %self.name, "unrequested object data for {}", name);
            return;
        };
        match self.fetcher.load(&data) {
            Ok(obj) if obj.is_complete_deep() => self.deliver(obj, awaited),
            Ok(obj) => self.incomplete.push((obj, awaited)),
            Err(e) => {
                self.send_text(TextType::Error, format!("restoring {name} failed: {e}"));
            }
        }
    }

    fn retry_incomplete(&mut self) {
        if self.incomplete.is_empty() {
            return;
        }
        self.fetcher.retry();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.incomplete)
            .into_iter()
            .partition(|(obj, _)| obj.is_complete_deep());
        self.incomplete = waiting;
        for (obj, awaited) in ready {
            self.deliver(obj, awaited);
        }
    }

    // ── Parameters ──

    /// Declare a parameter with its initial value.
    pub fn add_parameter(
        &mut self,
        name: &str,
        description: &str,
        value: ParamValue,
        presentation: Presentation,
    ) -> Result<()> {
        if self.parameters.contains_key(name) || self.ports.contains_key(name) {
            return Err(PipehubError::Consistency(format!(
                "{}: duplicate parameter {}",
                self.name, name
            )));
        }
        let mut param = Parameter::new(self.id, name, value.param_type(), presentation)
            .ok_or_else(|| PipehubError::Application(format!("{name}: unsupported kind")))?
            .with_description(description);
        param.apply(&value, RangeType::Value, true)?;

        self.send(self.factory.make(Payload::AddParameter {
            module: self.id,
            name: name.to_string(),
            description: description.to_string(),
            group: String::new(),
            param_type: param.param_type(),
            presentation,
        }))?;
        self.parameters.insert(name.to_string(), param);
        self.param_order.push(name.to_string());
        self.send_parameter(name, value, RangeType::Value, true)
    }

    pub fn set_parameter_range(&mut self, name: &str, min: ParamValue, max: ParamValue) -> Result<()> {
        self.update_parameter(name, min, RangeType::Minimum)?;
        self.update_parameter(name, max, RangeType::Maximum)
    }

    pub fn set_parameter(&mut self, name: &str, value: ParamValue) -> Result<()> {
        self.update_parameter(name, value, RangeType::Value)
    }

    pub fn set_parameter_choices(&mut self, name: &str, choices: Vec<String>) -> Result<()> {
        self.parameter_mut(name)?.set_choices(choices.clone())?;
        self.send(self.factory.make(Payload::SetParameterChoices {
            module: self.id,
            name: name.to_string(),
            choices,
        }))
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.param_order
    }

    pub fn int_parameter(&self, name: &str) -> Option<i64> {
        self.parameter(name)?.value().as_int()
    }

    pub fn float_parameter(&self, name: &str) -> Option<f64> {
        self.parameter(name)?.value().as_float()
    }

    pub fn string_parameter(&self, name: &str) -> Option<String> {
        self.parameter(name)?.value().as_str().map(str::to_string)
    }

    fn parameter_mut(&mut self, name: &str) -> Result<&mut Parameter> {
        let module = self.name.clone();
        self.parameters
            .get_mut(name)
            .ok_or_else(|| PipehubError::Application(format!("{module}: no parameter {name}")))
    }

    fn update_parameter(&mut self, name: &str, value: ParamValue, range: RangeType) -> Result<()> {
        self.parameter_mut(name)?.apply(&value, range, false)?;
        self.send_parameter(name, value, range, false)
    }

    fn send_parameter(&mut self, name: &str, value: ParamValue, range: RangeType, init: bool) -> Result<()> {
        self.send(self.factory.make(Payload::SetParameter {
            module: self.id,
            name: name.to_string(),
            value,
            range,
            init,
            reply: false,
        }))
    }

    // ── Policies ──

    pub fn set_object_receive_policy(&mut self, policy: ObjectReceivePolicy) {
        self.object_policy = policy;
        self.post_payload(Payload::ObjectReceivePolicy(policy));
    }

    pub fn set_scheduling_policy(&mut self, policy: SchedulingPolicy) {
        self.scheduling_policy = policy;
        self.post_payload(Payload::SchedulingPolicy(policy));
    }

    pub fn set_reduce_policy(&mut self, policy: ReducePolicy) {
        self.reduce_policy = policy;
        self.post_payload(Payload::ReducePolicy(policy));
    }

    pub fn object_receive_policy(&self) -> ObjectReceivePolicy {
        self.object_policy
    }

    pub fn scheduling_policy(&self) -> SchedulingPolicy {
        self.scheduling_policy
    }

    pub fn reduce_policy(&self) -> ReducePolicy {
        self.reduce_policy
    }

    // ── Dispatch loop ──

    /// Announce the module and process messages until `Quit`, `Kill`, a
    /// cleared shutdown flag or a lost link. Always sends `ModuleExit`.
    pub fn run(&mut self, worker: &mut dyn Compute) -> Result<()> {
        tracing::info!(module = %self.name, id = %self.id, "module started");
        self.send(self.factory.make(Payload::Started {
            name: self.name.clone(),
        }))?;

        let result = self.dispatch_loop(worker);
        if let Err(e) = self.send_exit() {
            tracing::debug!(module = %self.name, "could not announce exit: {}", e);
        }
        tracing::info!(module = %self.name, "module finished");
        result
    }

    fn dispatch_loop(&mut self, worker: &mut dyn Compute) -> Result<()> {
        while self.running.load(Ordering::SeqCst) {
            let batch = match self.next_batch() {
                Ok(batch) => batch,
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    tracing::error!(module = %self.name, "link to hub lost: {}", e);
                    return Err(e);
                }
            };
            self.process_batch(worker, &batch);
        }
        Ok(())
    }

    fn has_pending_work(&self) -> bool {
        self.scheduling_policy != SchedulingPolicy::Ignore && self.queued_input() > 0
    }

    /// Wait for the next messages unless some rank still has queued work.
    fn next_batch(&mut self) -> Result<Vec<Message>> {
        let mut batch = Vec::new();
        let busy = self.collective.all_reduce_or(self.has_pending_work());
        if !busy {
            match self.transport.receive_timeout(self.poll_interval) {
                Ok(msg) => batch.push(msg),
                Err(PipehubError::Transport(TransportError::Timeout(_))) => {}
                Err(e) => return Err(e),
            }
        }
        while batch.len() < MAX_BATCH {
            match self.transport.try_receive()? {
                Some(msg) => batch.push(msg),
                None => break,
            }
        }
        Ok(batch)
    }

    fn process_batch(&mut self, worker: &mut dyn Compute, batch: &[Message]) {
        let mut cycle = Cycle::default();
        for msg in batch {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.handle_message(worker, msg, &mut cycle);
        }
        if self.running.load(Ordering::SeqCst) {
            self.run_cycle(worker, cycle);
        }
    }

    fn addressed_to_me(&self, module: Id) -> bool {
        module == self.id || module == Id::BROADCAST
    }

    fn handle_message(&mut self, worker: &mut dyn Compute, msg: &Message, cycle: &mut Cycle) {
        match &msg.payload {
            Payload::Quit => {
                tracing::info!(module = %self.name, "quit requested");
                self.running.store(false, Ordering::SeqCst);
            }
            Payload::Kill { module } if self.addressed_to_me(*module) => {
                tracing::info!(module = %self.name, "killed");
                self.running.store(false, Ordering::SeqCst);
            }
            Payload::Barrier => {
                let reply = self.factory.barrier_reached(msg);
                self.post(reply);
            }
            Payload::Ping { .. } => {
                let reply = self.factory.pong(msg);
                self.post(reply);
            }
            Payload::Execute {
                what,
                module,
                execution_count,
                ..
            } => {
                if module.is_valid() && !self.addressed_to_me(*module) {
                    return;
                }
                self.execution_count = self.execution_count.max(*execution_count);
                match what {
                    ExecuteWhat::Prepare => cycle.prepare = true,
                    ExecuteWhat::ComputeExecute => cycle.execute = true,
                    // queued objects are picked up by the cycle
                    ExecuteWhat::ComputeObject => {}
                    ExecuteWhat::Reduce => cycle.reduce = true,
                }
            }
            Payload::CancelExecute { module } if self.addressed_to_me(*module) => {
                tracing::info!(module = %self.name, "execution cancelled");
                for p in self.ports.values_mut() {
                    p.queue.clear();
                }
                self.awaited.clear();
                self.incomplete.clear();
                self.timesteps.clear();
                *cycle = Cycle::default();
            }
            Payload::AddObject {
                dest_port,
                object_name,
                ..
            } => self.object_announced(msg, dest_port, object_name),
            Payload::AddObjectCompleted { object_name, .. } => {
                self.object_acknowledged(object_name)
            }
            Payload::RequestObject {
                object_name,
                array: false,
                ..
            } => self.serve_object(msg, object_name),
            Payload::SendObject {
                object_name,
                referrer,
                array,
            } => {
                let data = msg.raw_payload.clone().unwrap_or_default();
                self.object_data_received(object_name, referrer, *array, data);
            }
            Payload::Connect(link) => self.update_link(link, true),
            Payload::Disconnect(link) => self.update_link(link, false),
            Payload::SetParameter {
                module,
                name,
                value,
                range,
                ..
            } if *module == self.id && msg.sender() != self.id => {
                self.remote_parameter_change(worker, name, value, *range);
            }
            _ => {
                tracing::trace!(module = %self.name, "ignoring {}", msg.message_type());
            }
        }
    }

    fn remote_parameter_change(
        &mut self,
        worker: &mut dyn Compute,
        name: &str,
        value: &ParamValue,
        range: RangeType,
    ) {
        let applied = match self.parameters.get_mut(name) {
            Some(p) => p.apply(value, range, false).map_err(PipehubError::from),
            None => Err(PipehubError::Application(format!("no parameter {name}"))),
        };
        match applied {
            Ok(()) => {
                // echo so that trackers record the module's own view
                let echo = self.factory.make(Payload::SetParameter {
                    module: self.id,
                    name: name.to_string(),
                    value: value.clone(),
                    range,
                    init: false,
                    reply: true,
                });
                self.post(echo);
                self.guarded(worker, "parameter_changed", |w, m| {
                    w.parameter_changed(m, name)
                });
            }
            Err(e) => self.send_text(TextType::Warning, format!("{}: {}", self.name, e)),
        }
    }

    fn run_cycle(&mut self, worker: &mut dyn Compute, cycle: Cycle) {
        let objects = self.has_pending_work();
        if !(cycle.prepare || cycle.execute || objects || cycle.reduce) {
            return;
        }

        self.post_payload(Payload::Busy);
        self.post_payload(Payload::ExecutionProgress {
            stage: ProgressStage::Start,
        });

        if cycle.prepare {
            self.guarded(worker, "prepare", |w, m| w.prepare(m));
        }
        if cycle.execute {
            let task = Task {
                trigger: Trigger::Execute,
                execution_count: self.execution_count,
            };
            self.guarded(worker, "compute", |w, m| w.compute(m, &task));
        }
        if self.scheduling_policy != SchedulingPolicy::Ignore {
            self.compute_queued(worker);
        }
        if cycle.reduce {
            self.run_reduce(worker);
        }

        self.post_payload(Payload::ExecutionProgress {
            stage: ProgressStage::Finish,
        });
        self.post_payload(Payload::Idle);
    }

    fn compute_queued(&mut self, worker: &mut dyn Compute) {
        loop {
            let before = self.queued_input();
            if before == 0 {
                break;
            }
            let task = Task {
                trigger: Trigger::Object,
                execution_count: self.execution_count,
            };
            self.guarded(worker, "compute", |w, m| w.compute(m, &task));
            let after = self.queued_input();
            if after >= before {
                tracing::warn!(module = %self.name, "compute left {} queued objects untouched", after);
                break;
            }
        }
    }

    /// Timesteps to reduce, in the order the policy asks for.
    fn reduce_order(&self) -> Vec<i32> {
        match self.reduce_policy {
            ReducePolicy::Never => Vec::new(),
            ReducePolicy::Locally | ReducePolicy::OverAll => vec![-1],
            ReducePolicy::PerTimestep => self.timesteps.clone(),
            ReducePolicy::PerTimestepOrdered => {
                let mut ts = self.timesteps.clone();
                ts.sort_unstable();
                ts
            }
            ReducePolicy::PerTimestepZeroFirst => {
                let mut ts = self.timesteps.clone();
                ts.sort_unstable_by_key(|t| (*t != 0, *t));
                ts
            }
        }
    }

    fn run_reduce(&mut self, worker: &mut dyn Compute) {
        for timestep in self.reduce_order() {
            self.guarded(worker, "reduce", |w, m| w.reduce(m, timestep));
        }
        self.timesteps.clear();
    }

    /// Run a worker callback, turning errors and panics into an error text.
    fn guarded<F>(&mut self, worker: &mut dyn Compute, what: &str, f: F) -> bool
    where
        F: FnOnce(&mut dyn Compute, &mut Module) -> Result<()>,
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(worker, self)));
        let reason = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };
        tracing::error!(module = %self.name, "{} failed: {}", what, reason);
        self.send_text(TextType::Error, format!("{}: {} failed: {}", self.name, what, reason));
        false
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if let Err(e) = self.send_exit() {
            tracing::debug!(module = %self.name, "exit notification lost: {}", e);
        }
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("ports", &self.ports.len())
            .field("parameters", &self.param_order)
            .finish()
    }
}
