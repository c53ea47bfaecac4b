//! Identity types for processes taking part in a session.
//!
//! Modules are numbered upwards from [`Id::MODULE_BASE`]; every non-positive
//! value is reserved for an addressing role or a hub. Slave hubs count
//! downwards from below [`Id::MASTER_HUB`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sender/destination id carried in every message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Id(pub i32);

impl Id {
    pub const INVALID: Id = Id(0);
    pub const MODULE_BASE: Id = Id(1);
    pub const SESSION: Id = Id(-1);
    pub const BROADCAST: Id = Id(-2);
    pub const FOR_BROADCAST: Id = Id(-3);
    pub const NEXT_HOP: Id = Id(-4);
    pub const UI: Id = Id(-5);
    pub const LOCAL_MANAGER: Id = Id(-6);
    pub const LOCAL_HUB: Id = Id(-7);
    pub const MASTER_HUB: Id = Id(-8);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn is_hub(self) -> bool {
        self <= Self::MASTER_HUB
    }

    #[inline]
    pub fn is_module(self) -> bool {
        self >= Self::MODULE_BASE
    }

    /// The n-th slave hub (n starting at 1).
    pub fn slave_hub(n: i32) -> Self {
        debug_assert!(n >= 1);
        Id(Self::MASTER_HUB.0 - n)
    }

    fn reserved_name(self) -> Option<&'static str> {
        Some(match self {
            Self::INVALID => "INVALID",
            Self::SESSION => "SESSION",
            Self::BROADCAST => "BROADCAST",
            Self::FOR_BROADCAST => "FOR_BROADCAST",
            Self::NEXT_HOP => "NEXT_HOP",
            Self::UI => "UI",
            Self::LOCAL_MANAGER => "LOCAL_MANAGER",
            Self::LOCAL_HUB => "LOCAL_HUB",
            Self::MASTER_HUB => "MASTER_HUB",
            _ => return None,
        })
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reserved_name() {
            Some(name) => write!(f, "Id({})", name),
            None if self.is_hub() => write!(f, "Id(hub {})", self.0),
            None => write!(f, "Id({})", self.0),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<i32> for Id {
    fn from(v: i32) -> Self {
        Id(v)
    }
}

/// What kind of process is on the other end of a connection, or what this
/// process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    #[default]
    Unknown,
    Request,
    Ui,
    Manager,
    /// The master hub.
    Hub,
    SlaveHub,
    LocalBulkData,
    RemoteBulkData,
}

impl Identity {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Identity::Unknown,
            1 => Identity::Request,
            2 => Identity::Ui,
            3 => Identity::Manager,
            4 => Identity::Hub,
            5 => Identity::SlaveHub,
            6 => Identity::LocalBulkData,
            7 => Identity::RemoteBulkData,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_hub(self) -> bool {
        matches!(self, Identity::Hub | Identity::SlaveHub)
    }
}
