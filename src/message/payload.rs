//! Type-specific message bodies.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MessageType;
use crate::id::{Id, Identity};
use crate::object::{Meta, ObjectType};
use crate::parameter::{ParamType, ParamValue, Presentation, RangeType};

/// Maximum number of labels in one `SetParameterChoices`.
pub const MAX_CHOICES: usize = 16;

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_u32(self) -> u32 {
                match self {
                    $($name::$variant => $value),+
                }
            }

            pub fn from_u32(v: u32) -> Option<Self> {
                match v {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum!(
    /// Which stage of execution an `Execute` triggers.
    ExecuteWhat {
        Prepare = 0,
        ComputeExecute = 1,
        ComputeObject = 2,
        Reduce = 3,
    }
);

wire_enum!(
    ProgressStage {
        Start = 0,
        Finish = 1,
    }
);

wire_enum!(
    /// How incoming objects are distributed among a module's ranks.
    ObjectReceivePolicy {
        Local = 0,
        Master = 1,
        NotifyAll = 2,
        Distribute = 3,
    }
);

wire_enum!(
    /// How compute calls are synchronized among ranks.
    SchedulingPolicy {
        Ignore = 0,
        Single = 1,
        Gang = 2,
        LazyGang = 3,
    }
);

wire_enum!(
    /// When `reduce` runs.
    ReducePolicy {
        Never = 0,
        Locally = 1,
        PerTimestep = 2,
        PerTimestepOrdered = 3,
        PerTimestepZeroFirst = 4,
        OverAll = 5,
    }
);

wire_enum!(
    TextType {
        Cout = 0,
        Cerr = 1,
        Clog = 2,
        Info = 3,
        Warning = 4,
        Error = 5,
    }
);

wire_enum!(
    PortKind {
        Input = 0,
        Output = 1,
        Parameter = 2,
        Any = 3,
    }
);

impl Default for ObjectReceivePolicy {
    fn default() -> Self {
        ObjectReceivePolicy::Local
    }
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        SchedulingPolicy::Single
    }
}

impl Default for ReducePolicy {
    fn default() -> Self {
        ReducePolicy::Locally
    }
}

/// Port description as exchanged in `AddPort`/`RemovePort`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub module: Id,
    pub name: String,
    pub kind: PortKind,
    /// See [`crate::tracker::port::PortFlags`].
    pub flags: u32,
    pub description: String,
}

/// One endpoint pair for `Connect`/`Disconnect`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub module_a: Id,
    pub port_a: String,
    pub module_b: Id,
    pub port_b: String,
}

/// Body of a message. The variant determines the [`MessageType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Identify {
        identity: Identity,
        name: String,
    },
    CloseConnection {
        reason: String,
    },
    AddHub {
        id: Id,
        name: String,
        port: u16,
        data_port: u16,
        address: String,
    },
    RemoveHub {
        id: Id,
    },
    SetId {
        id: Id,
    },
    ReplayFinished,
    Trace {
        /// `None` traces every type.
        traced: Option<MessageType>,
        module: Id,
        on: bool,
    },
    Spawn {
        hub: Id,
        name: String,
        spawn_id: Id,
        mpi_size: i32,
        base_rank: i32,
        rank_skip: i32,
    },
    SpawnPrepared {
        hub: Id,
        name: String,
        spawn_id: Id,
    },
    Kill {
        module: Id,
    },
    Quit,
    Started {
        name: String,
    },
    ModuleExit {
        forwarded: bool,
    },
    Busy,
    Idle,
    Execute {
        what: ExecuteWhat,
        module: Id,
        execution_count: i32,
        all_ranks: bool,
        real_time: f64,
        animation_step: f64,
    },
    ExecutionProgress {
        stage: ProgressStage,
    },
    CancelExecute {
        module: Id,
    },
    AddObject {
        sender_port: String,
        dest_port: String,
        object_name: String,
        object_type: ObjectType,
        meta: Meta,
    },
    AddObjectCompleted {
        object_name: String,
        origin: Id,
    },
    ObjectReceived {
        port: String,
        object_name: String,
        object_type: ObjectType,
    },
    AddPort(PortInfo),
    RemovePort(PortInfo),
    Connect(Link),
    Disconnect(Link),
    AddParameter {
        module: Id,
        name: String,
        description: String,
        group: String,
        param_type: ParamType,
        presentation: Presentation,
    },
    RemoveParameter {
        module: Id,
        name: String,
    },
    SetParameter {
        module: Id,
        name: String,
        value: ParamValue,
        range: RangeType,
        init: bool,
        reply: bool,
    },
    SetParameterChoices {
        module: Id,
        name: String,
        choices: Vec<String>,
    },
    Ping {
        ch: u8,
    },
    Pong {
        ch: u8,
        module: Id,
    },
    Barrier,
    BarrierReached,
    SendText {
        text_type: TextType,
        reference_uuid: Uuid,
        reference_type: Option<MessageType>,
        truncated: bool,
        text: String,
    },
    ObjectReceivePolicy(ObjectReceivePolicy),
    SchedulingPolicy(SchedulingPolicy),
    ReducePolicy(ReducePolicy),
    ModuleAvailable {
        hub: Id,
        name: String,
        path: String,
    },
    LockUi {
        locked: bool,
    },
    RequestTunnel {
        src_port: u16,
        dest_host: String,
        dest_port: u16,
        remove: bool,
    },
    RequestObject {
        object_name: String,
        referrer: String,
        array: bool,
    },
    SendObject {
        object_name: String,
        referrer: String,
        array: bool,
    },
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Identify { .. } => MessageType::Identify,
            Payload::CloseConnection { .. } => MessageType::CloseConnection,
            Payload::AddHub { .. } => MessageType::AddHub,
            Payload::RemoveHub { .. } => MessageType::RemoveHub,
            Payload::SetId { .. } => MessageType::SetId,
            Payload::ReplayFinished => MessageType::ReplayFinished,
            Payload::Trace { .. } => MessageType::Trace,
            Payload::Spawn { .. } => MessageType::Spawn,
            Payload::SpawnPrepared { .. } => MessageType::SpawnPrepared,
            Payload::Kill { .. } => MessageType::Kill,
            Payload::Quit => MessageType::Quit,
            Payload::Started { .. } => MessageType::Started,
            Payload::ModuleExit { .. } => MessageType::ModuleExit,
            Payload::Busy => MessageType::Busy,
            Payload::Idle => MessageType::Idle,
            Payload::Execute { .. } => MessageType::Execute,
            Payload::ExecutionProgress { .. } => MessageType::ExecutionProgress,
            Payload::CancelExecute { .. } => MessageType::CancelExecute,
            Payload::AddObject { .. } => MessageType::AddObject,
            Payload::AddObjectCompleted { .. } => MessageType::AddObjectCompleted,
            Payload::ObjectReceived { .. } => MessageType::ObjectReceived,
            Payload::AddPort(_) => MessageType::AddPort,
            Payload::RemovePort(_) => MessageType::RemovePort,
            Payload::Connect(_) => MessageType::Connect,
            Payload::Disconnect(_) => MessageType::Disconnect,
            Payload::AddParameter { .. } => MessageType::AddParameter,
            Payload::RemoveParameter { .. } => MessageType::RemoveParameter,
            Payload::SetParameter { .. } => MessageType::SetParameter,
            Payload::SetParameterChoices { .. } => MessageType::SetParameterChoices,
            Payload::Ping { .. } => MessageType::Ping,
            Payload::Pong { .. } => MessageType::Pong,
            Payload::Barrier => MessageType::Barrier,
            Payload::BarrierReached => MessageType::BarrierReached,
            Payload::SendText { .. } => MessageType::SendText,
            Payload::ObjectReceivePolicy(_) => MessageType::ObjectReceivePolicy,
            Payload::SchedulingPolicy(_) => MessageType::SchedulingPolicy,
            Payload::ReducePolicy(_) => MessageType::ReducePolicy,
            Payload::ModuleAvailable { .. } => MessageType::ModuleAvailable,
            Payload::LockUi { .. } => MessageType::LockUi,
            Payload::RequestTunnel { .. } => MessageType::RequestTunnel,
            Payload::RequestObject { .. } => MessageType::RequestObject,
            Payload::SendObject { .. } => MessageType::SendObject,
        }
    }

    /// Convenience for `SendText` with no reference.
    pub fn text(text_type: TextType, text: impl Into<String>) -> Self {
        Payload::SendText {
            text_type,
            reference_uuid: Uuid::nil(),
            reference_type: None,
            truncated: false,
            text: text.into(),
        }
    }

    pub fn connect(module_a: Id, port_a: &str, module_b: Id, port_b: &str) -> Self {
        Payload::Connect(Link {
            module_a,
            port_a: port_a.to_string(),
            module_b,
            port_b: port_b.to_string(),
        })
    }

    pub fn disconnect(module_a: Id, port_a: &str, module_b: Id, port_b: &str) -> Self {
        Payload::Disconnect(Link {
            module_a,
            port_a: port_a.to_string(),
            module_b,
            port_b: port_b.to_string(),
        })
    }
}
