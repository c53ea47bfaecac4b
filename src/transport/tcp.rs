//! Framed TCP connection with per-socket FIFO send and receive queues.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{PipehubError, Result, TransportError};
use crate::message::frame::{read_frame_async, write_frame_async};
use crate::message::Message;

/// Completion callback of [`TcpConnection::async_send`].
pub type SendHandler = Box<dyn FnOnce(Result<()>) + Send>;
/// Completion callback of [`TcpConnection::async_recv`].
pub type RecvHandler = Box<dyn FnOnce(Result<Message>) + Send>;

/// One framed stream. Cloning yields another handle onto the same queues.
#[derive(Clone)]
pub struct TcpConnection {
    send_tx: mpsc::UnboundedSender<(Message, Option<SendHandler>)>,
    recv_tx: mpsc::UnboundedSender<RecvHandler>,
}

/// Tasks driving a [`TcpConnection`]; dropping it does not stop them.
pub struct ConnectionTasks {
    pub writer: JoinHandle<()>,
    pub reader: JoinHandle<()>,
}

impl TcpConnection {
    /// Wrap a connected socket. Must be called inside a tokio runtime.
    pub fn new(stream: TcpStream, max_payload: u64) -> (Self, ConnectionTasks) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        Self::from_halves(read_half, write_half, max_payload)
    }

    /// Build a connection over arbitrary halves (used with in-memory pipes in
    /// tests).
    pub fn from_halves<R, W>(reader: R, writer: W, max_payload: u64) -> (Self, ConnectionTasks)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (recv_tx, recv_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(writer, send_rx));
        let reader = tokio::spawn(read_loop(reader, recv_rx, max_payload));
        (Self { send_tx, recv_tx }, ConnectionTasks { writer, reader })
    }

    /// Connect to `addr`.
    pub async fn connect(addr: &str, max_payload: u64) -> Result<(Self, ConnectionTasks)> {
        let stream = TcpStream::connect(addr).await?;
        tracing::info!("connected to {}", addr);
        Ok(Self::new(stream, max_payload))
    }

    /// Queue `msg` (and its raw payload) for sending and return immediately.
    pub fn async_send(&self, msg: Message, handler: Option<SendHandler>) {
        if let Err(mpsc::error::SendError((_, handler))) = self.send_tx.send((msg, handler)) {
            if let Some(h) = handler {
                h(Err(TransportError::Closed.into()));
            }
        }
    }

    /// Queue a receive; `handler` is called with the next message in order.
    pub fn async_recv(&self, handler: RecvHandler) {
        if let Err(mpsc::error::SendError(handler)) = self.recv_tx.send(handler) {
            handler(Err(TransportError::Closed.into()));
        }
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.async_send(
            msg,
            Some(Box::new(move |res| {
                let _ = tx.send(res);
            })),
        );
        rx.await.map_err(|_| PipehubError::from(TransportError::Closed))?
    }

    pub async fn recv(&self) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.async_recv(Box::new(move |res| {
            let _ = tx.send(res);
        }));
        rx.await.map_err(|_| PipehubError::from(TransportError::Closed))?
    }

    pub fn is_open(&self) -> bool {
        !self.send_tx.is_closed() && !self.recv_tx.is_closed()
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<(Message, Option<SendHandler>)>,
) {
    while let Some((msg, handler)) = queue.recv().await {
        let ty = msg.message_type();
        let res = write_frame_async(&mut writer, &msg).await;
        let failed = res.is_err();
        if let Err(e) = &res {
            tracing::warn!("send of {} failed: {}", ty, e);
        }
        if let Some(h) = handler {
            h(res);
        }
        if failed {
            break;
        }
    }
    queue.close();
    while let Ok((_, handler)) = queue.try_recv() {
        if let Some(h) = handler {
            h(Err(TransportError::Closed.into()));
        }
    }
    tracing::debug!("writer task finished");
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    mut queue: mpsc::UnboundedReceiver<RecvHandler>,
    max_payload: u64,
) {
    while let Some(handler) = queue.recv().await {
        let res = read_frame_async(&mut reader, max_payload).await;
        let failed = res.is_err();
        if let Err(e) = &res {
            tracing::debug!("receive failed: {}", e);
        }
        handler(res);
        if failed {
            break;
        }
    }
    queue.close();
    while let Ok(handler) = queue.try_recv() {
        handler(Err(TransportError::Closed.into()));
    }
    tracing::debug!("reader task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;
    use crate::message::{MessageFactory, Payload};
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    fn pipe() -> (TcpConnection, TcpConnection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let (ca, _) = TcpConnection::from_halves(ar, aw, 1 << 20);
        let (cb, _) = TcpConnection::from_halves(br, bw, 1 << 20);
        (ca, cb)
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (a, b) = pipe();
        let f = MessageFactory::new(Id(1), 0);
        for ch in 0..5u8 {
            a.async_send(f.make(Payload::Ping { ch }), None);
        }
        for ch in 0..5u8 {
            assert_eq!(b.recv().await.unwrap().payload, Payload::Ping { ch });
        }
    }

    #[tokio::test]
    async fn test_handlers_fire_in_fifo_order() {
        let (a, b) = pipe();
        let f = MessageFactory::new(Id(1), 0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        for i in 0..3 {
            let seen = seen.clone();
            let done_tx = done_tx.clone();
            b.async_recv(Box::new(move |res| {
                if let Ok(Message {
                    payload: Payload::Ping { ch },
                    ..
                }) = res
                {
                    seen.lock().unwrap().push((i, ch));
                }
                let _ = done_tx.send(());
            }));
        }
        for ch in [7u8, 8, 9] {
            a.send(f.make(Payload::Ping { ch })).await.unwrap();
        }
        for _ in 0..3 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![(0, 7), (1, 8), (2, 9)]);
    }

    #[tokio::test]
    async fn test_raw_payload_travels() {
        let (a, b) = pipe();
        let msg = MessageFactory::new(Id(2), 0)
            .make(Payload::SendObject {
                object_name: "o".into(),
                referrer: String::new(),
                array: false,
            })
            .with_raw_payload(Bytes::from(vec![42u8; 5000]));
        a.send(msg.clone()).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_closed_peer_reports_closed() {
        let (a, b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (conn, _) = TcpConnection::from_halves(ar, aw, 0);
        drop(b);
        let err = conn.recv().await.unwrap_err();
        assert!(err.is_fatal_for_link());
    }
}
