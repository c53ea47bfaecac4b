//! The closed set of message types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Every message type known to the protocol. Values `0` (invalid) and `1`
/// (any) are reserved and never appear on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageType {
    Identify = 2,
    CloseConnection,
    AddHub,
    RemoveHub,
    SetId,
    ReplayFinished,
    Trace,
    Spawn,
    SpawnPrepared,
    Kill,
    Quit,
    Started,
    ModuleExit,
    Busy,
    Idle,
    Execute,
    ExecutionProgress,
    CancelExecute,
    AddObject,
    AddObjectCompleted,
    ObjectReceived,
    AddPort,
    RemovePort,
    Connect,
    Disconnect,
    AddParameter,
    RemoveParameter,
    SetParameter,
    SetParameterChoices,
    Ping,
    Pong,
    Barrier,
    BarrierReached,
    SendText,
    ObjectReceivePolicy,
    SchedulingPolicy,
    ReducePolicy,
    ModuleAvailable,
    LockUi,
    RequestTunnel,
    RequestObject,
    SendObject,
}

/// How a message carries its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// Everything fits in the fixed envelope.
    Plain,
    /// Only an object/array name travels inline; the data moves through the
    /// archive layer.
    NameReferencing,
}

impl MessageType {
    pub const FIRST: u32 = 2;

    /// All types in wire order.
    pub const ALL: [MessageType; 42] = [
        MessageType::Identify,
        MessageType::CloseConnection,
        MessageType::AddHub,
        MessageType::RemoveHub,
        MessageType::SetId,
        MessageType::ReplayFinished,
        MessageType::Trace,
        MessageType::Spawn,
        MessageType::SpawnPrepared,
        MessageType::Kill,
        MessageType::Quit,
        MessageType::Started,
        MessageType::ModuleExit,
        MessageType::Busy,
        MessageType::Idle,
        MessageType::Execute,
        MessageType::ExecutionProgress,
        MessageType::CancelExecute,
        MessageType::AddObject,
        MessageType::AddObjectCompleted,
        MessageType::ObjectReceived,
        MessageType::AddPort,
        MessageType::RemovePort,
        MessageType::Connect,
        MessageType::Disconnect,
        MessageType::AddParameter,
        MessageType::RemoveParameter,
        MessageType::SetParameter,
        MessageType::SetParameterChoices,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::Barrier,
        MessageType::BarrierReached,
        MessageType::SendText,
        MessageType::ObjectReceivePolicy,
        MessageType::SchedulingPolicy,
        MessageType::ReducePolicy,
        MessageType::ModuleAvailable,
        MessageType::LockUi,
        MessageType::RequestTunnel,
        MessageType::RequestObject,
        MessageType::SendObject,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        let idx = v.checked_sub(Self::FIRST)? as usize;
        Self::ALL.get(idx).copied()
    }

    pub fn shape(self) -> PayloadShape {
        match self {
            MessageType::AddObject
            | MessageType::AddObjectCompleted
            | MessageType::ObjectReceived
            | MessageType::RequestObject
            | MessageType::SendObject => PayloadShape::NameReferencing,
            _ => PayloadShape::Plain,
        }
    }

    /// Replies carry the uuid of the message they answer.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MessageType::Pong
                | MessageType::SpawnPrepared
                | MessageType::BarrierReached
                | MessageType::AddObjectCompleted
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Identify => "IDENTIFY",
            MessageType::CloseConnection => "CLOSECONNECTION",
            MessageType::AddHub => "ADDHUB",
            MessageType::RemoveHub => "REMOVEHUB",
            MessageType::SetId => "SETID",
            MessageType::ReplayFinished => "REPLAYFINISHED",
            MessageType::Trace => "TRACE",
            MessageType::Spawn => "SPAWN",
            MessageType::SpawnPrepared => "SPAWNPREPARED",
            MessageType::Kill => "KILL",
            MessageType::Quit => "QUIT",
            MessageType::Started => "STARTED",
            MessageType::ModuleExit => "MODULEEXIT",
            MessageType::Busy => "BUSY",
            MessageType::Idle => "IDLE",
            MessageType::Execute => "EXECUTE",
            MessageType::ExecutionProgress => "EXECUTIONPROGRESS",
            MessageType::CancelExecute => "CANCELEXECUTE",
            MessageType::AddObject => "ADDOBJECT",
            MessageType::AddObjectCompleted => "ADDOBJECTCOMPLETED",
            MessageType::ObjectReceived => "OBJECTRECEIVED",
            MessageType::AddPort => "ADDPORT",
            MessageType::RemovePort => "REMOVEPORT",
            MessageType::Connect => "CONNECT",
            MessageType::Disconnect => "DISCONNECT",
            MessageType::AddParameter => "ADDPARAMETER",
            MessageType::RemoveParameter => "REMOVEPARAMETER",
            MessageType::SetParameter => "SETPARAMETER",
            MessageType::SetParameterChoices => "SETPARAMETERCHOICES",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::Barrier => "BARRIER",
            MessageType::BarrierReached => "BARRIERREACHED",
            MessageType::SendText => "SENDTEXT",
            MessageType::ObjectReceivePolicy => "OBJECTRECEIVEPOLICY",
            MessageType::SchedulingPolicy => "SCHEDULINGPOLICY",
            MessageType::ReducePolicy => "REDUCEPOLICY",
            MessageType::ModuleAvailable => "MODULEAVAILABLE",
            MessageType::LockUi => "LOCKUI",
            MessageType::RequestTunnel => "REQUESTTUNNEL",
            MessageType::RequestObject => "REQUESTOBJECT",
            MessageType::SendObject => "SENDOBJECT",
        }
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_is_in_wire_order() {
        for (i, ty) in MessageType::ALL.iter().enumerate() {
            assert_eq!(ty.as_u32(), MessageType::FIRST + i as u32);
            assert_eq!(MessageType::from_u32(ty.as_u32()), Some(*ty));
        }
    }

    #[test]
    fn test_reserved_values_are_rejected() {
        assert_eq!(MessageType::from_u32(0), None);
        assert_eq!(MessageType::from_u32(1), None);
        assert_eq!(
            MessageType::from_u32(MessageType::FIRST + MessageType::ALL.len() as u32),
            None
        );
    }

    #[test]
    fn test_name_referencing_types() {
        assert_eq!(MessageType::AddObject.shape(), PayloadShape::NameReferencing);
        assert_eq!(MessageType::SendObject.shape(), PayloadShape::NameReferencing);
        assert_eq!(MessageType::Spawn.shape(), PayloadShape::Plain);
    }
}
