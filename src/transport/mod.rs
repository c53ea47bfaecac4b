//! Message transports
//!
//! Two transports sit below the message layer:
//!
//! - [`LocalQueue`]: a bounded in-process queue pair used between a hub-side
//!   manager and a module. Waits are sliced so a dead peer is noticed while
//!   blocking.
//! - [`TcpConnection`]: a framed stream between hubs (or a hub and a UI).
//!   One writer task and one reader task per socket keep sends and receives
//!   in FIFO order with at most one of each in flight.
//!
//! Both distinguish a peer that merely did not answer in time
//! ([`TransportError::Timeout`]) from one that is gone
//! ([`TransportError::PeerGone`]).

pub mod local;
pub mod tcp;

pub use local::LocalQueue;
pub use tcp::TcpConnection;

use std::time::Duration;

use crate::error::{PipehubError, Result, TransportError};
use crate::message::Message;

/// Answers whether the process on the other end of a queue still exists.
pub trait Liveness: Send + Sync {
    fn is_alive(&self) -> bool;
}

/// Liveness for peers whose disappearance is signalled by the channel
/// itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAlive;

impl Liveness for AlwaysAlive {
    fn is_alive(&self) -> bool {
        true
    }
}

/// Counters kept by every transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub sent: u64,
    pub received: u64,
    pub timeouts: u64,
}

/// Synchronous message transport used by the module dispatch loop.
pub trait Transport: Send {
    /// Send one message, waiting up to the configured timeout for space.
    fn send(&mut self, msg: Message) -> Result<()>;

    /// Return a queued message without blocking.
    fn try_receive(&mut self) -> Result<Option<Message>>;

    /// Wait up to `timeout` for a message.
    ///
    /// Fails with [`TransportError::Timeout`] if nothing arrived and the
    /// peer is still alive.
    fn receive_timeout(&mut self, timeout: Duration) -> Result<Message>;

    /// Block until a message arrives or the peer is gone.
    fn receive(&mut self) -> Result<Message> {
        loop {
            match self.receive_timeout(Duration::from_millis(100)) {
                Err(PipehubError::Transport(TransportError::Timeout(_))) => continue,
                other => return other,
            }
        }
    }

    fn is_alive(&self) -> bool;

    fn stats(&self) -> &TransportStats;
}
