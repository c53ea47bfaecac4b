//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use std::time::Duration;

use pipehub::message::{PortInfo, PortKind};
use pipehub::parameter::{ParamType, ParamValue, Presentation, RangeType};
use pipehub::{Id, Message, MessageFactory, Payload};

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_millis(100)
}

pub fn hub() -> MessageFactory {
    MessageFactory::new(Id::MASTER_HUB, 0)
}

pub fn module(id: i32) -> MessageFactory {
    MessageFactory::new(Id(id), 0)
}

pub fn spawn(id: i32, name: &str) -> Message {
    hub().make(Payload::Spawn {
        hub: Id::MASTER_HUB,
        name: name.into(),
        spawn_id: Id(id),
        mpi_size: 1,
        base_rank: 0,
        rank_skip: 0,
    })
}

pub fn add_port(id: i32, name: &str, kind: PortKind) -> Message {
    module(id).make(Payload::AddPort(PortInfo {
        module: Id(id),
        name: name.into(),
        kind,
        flags: 0,
        description: String::new(),
    }))
}

pub fn add_parameter(id: i32, name: &str, param_type: ParamType) -> Message {
    module(id).make(Payload::AddParameter {
        module: Id(id),
        name: name.into(),
        description: String::new(),
        group: String::new(),
        param_type,
        presentation: Presentation::Generic,
    })
}

pub fn set_parameter(id: i32, name: &str, value: ParamValue) -> Message {
    set_parameter_range(id, name, value, RangeType::Value)
}

pub fn set_parameter_range(id: i32, name: &str, value: ParamValue, range: RangeType) -> Message {
    module(id).make(Payload::SetParameter {
        module: Id(id),
        name: name.into(),
        value,
        range,
        init: false,
        reply: false,
    })
}
