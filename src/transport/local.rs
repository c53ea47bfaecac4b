//! In-process bounded queue transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError,
};

use super::{AlwaysAlive, Liveness, Transport, TransportStats};
use crate::error::{Result, TransportError};
use crate::message::Message;

/// Tunables for a [`LocalQueue`].
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub capacity: usize,
    /// Overall limit for a blocking send.
    pub send_timeout: Duration,
    /// Length of each wait slice between liveness checks.
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: crate::config::DEFAULT_QUEUE_CAPACITY,
            send_timeout: Duration::from_millis(crate::config::DEFAULT_SEND_TIMEOUT_MS),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// One endpoint of a bidirectional bounded message queue.
pub struct LocalQueue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    peer: Arc<dyn Liveness>,
    settings: QueueSettings,
    stats: TransportStats,
}

impl LocalQueue {
    /// Create two connected endpoints.
    pub fn pair(settings: QueueSettings) -> (LocalQueue, LocalQueue) {
        Self::pair_with_liveness(settings, Arc::new(AlwaysAlive), Arc::new(AlwaysAlive))
    }

    /// Create two connected endpoints; `a_peer` tells endpoint `a` whether
    /// `b`'s process is alive and vice versa.
    pub fn pair_with_liveness(
        settings: QueueSettings,
        a_peer: Arc<dyn Liveness>,
        b_peer: Arc<dyn Liveness>,
    ) -> (LocalQueue, LocalQueue) {
        let (a_tx, b_rx) = bounded(settings.capacity);
        let (b_tx, a_rx) = bounded(settings.capacity);
        let a = LocalQueue {
            tx: a_tx,
            rx: a_rx,
            peer: a_peer,
            settings,
            stats: TransportStats::default(),
        };
        let b = LocalQueue {
            tx: b_tx,
            rx: b_rx,
            peer: b_peer,
            settings,
            stats: TransportStats::default(),
        };
        (a, b)
    }

    /// Number of messages waiting to be received.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    fn slice(&self, deadline: Instant) -> Duration {
        deadline
            .saturating_duration_since(Instant::now())
            .min(self.settings.poll_interval)
    }
}

impl Transport for LocalQueue {
    fn send(&mut self, msg: Message) -> Result<()> {
        let deadline = Instant::now() + self.settings.send_timeout;
        let mut msg = msg;
        loop {
            match self.tx.send_timeout(msg, self.slice(deadline)) {
                Ok(()) => {
                    self.stats.sent += 1;
                    return Ok(());
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(TransportError::PeerGone.into());
                }
                Err(SendTimeoutError::Timeout(back)) => {
                    if !self.peer.is_alive() {
                        tracing::warn!("send: peer died while queue was full");
                        return Err(TransportError::PeerGone.into());
                    }
                    if Instant::now() >= deadline {
                        self.stats.timeouts += 1;
                        return Err(TransportError::Timeout(self.settings.send_timeout).into());
                    }
                    msg = back;
                }
            }
        }
    }

    fn try_receive(&mut self) -> Result<Option<Message>> {
        match self.rx.try_recv() {
            Ok(msg) => {
                self.stats.received += 1;
                Ok(Some(msg))
            }
            Err(TryRecvError::Empty) => {
                if self.peer.is_alive() {
                    Ok(None)
                } else {
                    Err(TransportError::PeerGone.into())
                }
            }
            Err(TryRecvError::Disconnected) => Err(TransportError::PeerGone.into()),
        }
    }

    fn receive_timeout(&mut self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.rx.recv_timeout(self.slice(deadline)) {
                Ok(msg) => {
                    self.stats.received += 1;
                    return Ok(msg);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::PeerGone.into());
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !self.peer.is_alive() {
                        return Err(TransportError::PeerGone.into());
                    }
                    if Instant::now() >= deadline {
                        self.stats.timeouts += 1;
                        return Err(TransportError::Timeout(timeout).into());
                    }
                }
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.peer.is_alive()
    }

    fn stats(&self) -> &TransportStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipehubError;
    use crate::id::Id;
    use crate::message::{MessageFactory, Payload};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flag(AtomicBool);

    impl Liveness for Flag {
        fn is_alive(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn settings(capacity: usize) -> QueueSettings {
        QueueSettings {
            capacity,
            send_timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_send_and_receive() {
        let (mut a, mut b) = LocalQueue::pair(settings(4));
        let f = MessageFactory::new(Id(1), 0);
        a.send(f.make(Payload::Busy)).unwrap();
        a.send(f.make(Payload::Idle)).unwrap();
        assert_eq!(b.pending(), 2);
        assert_eq!(b.try_receive().unwrap().unwrap().payload, Payload::Busy);
        assert_eq!(
            b.receive_timeout(Duration::from_millis(10)).unwrap().payload,
            Payload::Idle
        );
        assert!(b.try_receive().unwrap().is_none());
        assert_eq!(a.stats().sent, 2);
        assert_eq!(b.stats().received, 2);
    }

    #[test]
    fn test_timeout_when_peer_alive() {
        let (mut a, _b) = LocalQueue::pair(settings(1));
        let f = MessageFactory::new(Id(1), 0);
        a.send(f.make(Payload::Busy)).unwrap();
        let err = a.send(f.make(Payload::Idle)).unwrap_err();
        assert!(matches!(
            err,
            PipehubError::Transport(TransportError::Timeout(_))
        ));
        assert!(!err.is_fatal_for_link());
    }

    #[test]
    fn test_peer_gone_when_liveness_fails() {
        let flag = Arc::new(Flag(AtomicBool::new(true)));
        let (mut a, _b) =
            LocalQueue::pair_with_liveness(settings(1), flag.clone(), Arc::new(AlwaysAlive));
        flag.0.store(false, Ordering::SeqCst);
        let err = a.receive_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, PipehubError::Transport(TransportError::PeerGone)));
    }

    #[test]
    fn test_peer_gone_when_dropped() {
        let (mut a, b) = LocalQueue::pair(settings(2));
        drop(b);
        assert!(matches!(
            a.try_receive(),
            Err(PipehubError::Transport(TransportError::PeerGone))
        ));
        let f = MessageFactory::new(Id(1), 0);
        assert!(a.send(f.make(Payload::Quit)).is_err());
    }
}
