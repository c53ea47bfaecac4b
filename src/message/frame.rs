//! Length-prefixed framing for stream transports.
//!
//! Frame format:
//! ```text
//! +----------------+-----------------------+------------------------+
//! | length (4 BE)  | envelope (length B)   | raw payload            |
//! +----------------+-----------------------+------------------------+
//! ```
//! The raw payload length is read from the envelope header; there are no
//! delimiters and no escaping.

use std::io::{Read, Write};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{codec, Message, MESSAGE_SIZE};
use crate::error::{PipehubError, ProtocolError, Result, TransportError};

/// Default cap on raw payloads (256 MB).
pub const MAX_PAYLOAD_SIZE: u64 = 256 * 1024 * 1024;

/// Write one framed message.
pub fn write_frame<W: Write>(writer: &mut W, msg: &Message) -> Result<()> {
    let envelope = codec::encode(msg)?;
    writer.write_all(&(envelope.len() as u32).to_be_bytes())?;
    writer.write_all(&envelope)?;
    if let Some(payload) = &msg.raw_payload {
        writer.write_all(payload)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read one framed message.
///
/// A clean end of stream before the length prefix is reported as
/// [`TransportError::Closed`].
pub fn read_frame<R: Read>(reader: &mut R, max_payload: u64) -> Result<Message> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed.into());
        }
        Err(e) => return Err(PipehubError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len != MESSAGE_SIZE {
        return Err(ProtocolError::BadSize {
            size: len,
            min: MESSAGE_SIZE,
            max: MESSAGE_SIZE,
        }
        .into());
    }

    let mut envelope = vec![0u8; len];
    reader.read_exact(&mut envelope)?;
    let mut msg = codec::decode(&envelope, max_payload)?;

    if msg.header.payload_size > 0 {
        let mut payload = vec![0u8; msg.header.payload_size as usize];
        reader.read_exact(&mut payload)?;
        msg.raw_payload = Some(Bytes::from(payload));
    }
    Ok(msg)
}

/// Async counterpart of [`write_frame`].
pub async fn write_frame_async<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let envelope = codec::encode(msg)?;
    writer.write_all(&(envelope.len() as u32).to_be_bytes()).await?;
    writer.write_all(&envelope).await?;
    if let Some(payload) = &msg.raw_payload {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Async counterpart of [`read_frame`].
pub async fn read_frame_async<R: AsyncRead + Unpin>(reader: &mut R, max_payload: u64) -> Result<Message> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed.into());
        }
        Err(e) => return Err(PipehubError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len != MESSAGE_SIZE {
        return Err(ProtocolError::BadSize {
            size: len,
            min: MESSAGE_SIZE,
            max: MESSAGE_SIZE,
        }
        .into());
    }

    let mut envelope = vec![0u8; len];
    reader.read_exact(&mut envelope).await?;
    let mut msg = codec::decode(&envelope, max_payload)?;

    if msg.header.payload_size > 0 {
        let mut payload = vec![0u8; msg.header.payload_size as usize];
        reader.read_exact(&mut payload).await?;
        msg.raw_payload = Some(Bytes::from(payload));
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;
    use crate::message::{MessageFactory, Payload};
    use std::io::Cursor;

    #[test]
    fn test_frame_with_payload() {
        let msg = MessageFactory::new(Id(1), 0)
            .make(Payload::SendObject {
                object_name: "m1id0r0OBJ".into(),
                referrer: String::new(),
                array: false,
            })
            .with_raw_payload(Bytes::from_static(b"archive-bytes"));

        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).unwrap();
        assert_eq!(buf.len(), 4 + MESSAGE_SIZE + 13);
        assert_eq!(&buf[..4], &(MESSAGE_SIZE as u32).to_be_bytes());

        let back = read_frame(&mut Cursor::new(buf), MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_back_to_back_frames() {
        let f = MessageFactory::new(Id(1), 0);
        let mut buf = Vec::new();
        write_frame(&mut buf, &f.make(Payload::Busy)).unwrap();
        write_frame(&mut buf, &f.make(Payload::Idle)).unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_frame(&mut cur, 0).unwrap().payload, Payload::Busy);
        assert_eq!(read_frame(&mut cur, 0).unwrap().payload, Payload::Idle);
        assert!(matches!(
            read_frame(&mut cur, 0),
            Err(PipehubError::Transport(TransportError::Closed))
        ));
    }

    #[test]
    fn test_bad_prefix_is_protocol_error() {
        let mut buf = 17u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 17]);
        let err = read_frame(&mut Cursor::new(buf), 0).unwrap_err();
        assert!(matches!(err, PipehubError::Protocol(ProtocolError::BadSize { .. })));
        assert!(err.is_fatal_for_link());
    }

    #[tokio::test]
    async fn test_async_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4 * MESSAGE_SIZE);
        let msg = MessageFactory::new(Id(9), 0)
            .make(Payload::Ping { ch: b'p' })
            .with_raw_payload(Bytes::from_static(b"xyz"));
        write_frame_async(&mut a, &msg).await.unwrap();
        let back = read_frame_async(&mut b, MAX_PAYLOAD_SIZE).await.unwrap();
        assert_eq!(back, msg);
    }
}
