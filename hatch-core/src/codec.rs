//! Length-prefixed framing for control messages.
//!
//! ```text
//! frame := uint32_be(length) payload[length]
//! ```
//!
//! The payload is a JSON record (see [`ControlMessage`]). Frames longer than
//! the configured maximum are rejected before any payload byte is buffered.

use crate::error::{ErrorCategory, TunnelError};
use crate::protocol::ControlMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Default upper bound for a frame payload.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

/// Wire codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("peer closed the connection")]
    Closed,
    #[error("connection closed in the middle of a frame")]
    Truncated,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("malformed control payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CodecError> for TunnelError {
    fn from(err: CodecError) -> Self {
        let category = match err {
            CodecError::Closed | CodecError::Io(_) => ErrorCategory::Connection,
            CodecError::Truncated | CodecError::FrameTooLarge { .. } | CodecError::Malformed(_) => {
                ErrorCategory::Framing
            }
        };
        TunnelError::new(category, err.to_string()).with_cause(err)
    }
}

/// Encode a message into one complete frame no larger than
/// [`DEFAULT_MAX_FRAME`], the limit a peer applies unless configured
/// otherwise.
pub fn encode(msg: &ControlMessage) -> Result<Bytes, CodecError> {
    encode_limited(msg, DEFAULT_MAX_FRAME)
}

/// Encode a message, refusing payloads longer than `max`.
pub fn encode_limited(msg: &ControlMessage, max: usize) -> Result<Bytes, CodecError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > max {
        return Err(CodecError::FrameTooLarge {
            len: payload.len(),
            max,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    frame.put_u32(len);
    frame.extend_from_slice(&payload);
    Ok(frame.freeze())
}

/// Decode a frame payload (without the length prefix).
pub fn decode(payload: &[u8]) -> Result<ControlMessage, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Try to split one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. The length limit is
/// enforced as soon as the prefix is available.
pub fn decode_frame(buf: &mut BytesMut, max: usize) -> Result<Option<ControlMessage>, CodecError> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max {
        return Err(CodecError::FrameTooLarge { len, max });
    }
    if buf.len() < LENGTH_PREFIX + len {
        buf.reserve(LENGTH_PREFIX + len - buf.len());
        return Ok(None);
    }
    buf.advance(LENGTH_PREFIX);
    let payload = buf.split_to(len);
    decode(&payload).map(Some)
}

/// Write one message as a frame and flush.
pub async fn write_message<W>(writer: &mut W, msg: &ControlMessage) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame, consuming no byte beyond it.
///
/// Used where the frame is followed by unrelated traffic on the same stream,
/// such as the tag at the start of a tunnel socket.
pub async fn read_message<R>(reader: &mut R, max: usize) -> Result<ControlMessage, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                CodecError::Closed
            } else {
                CodecError::Truncated
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max {
        return Err(CodecError::FrameTooLarge { len, max });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::Truncated
        } else {
            CodecError::Io(e)
        }
    })?;
    decode(&payload)
}

/// Buffered frame reader for long-lived control connections.
///
/// [`FrameReader::next`] is cancel safe: partially received frames stay in
/// the internal buffer, so it can be raced against timers in `select!`.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(1024),
            max,
        }
    }

    /// Next message, or `Ok(None)` on a clean close at a frame boundary.
    pub async fn next(&mut self) -> Result<Option<ControlMessage>, CodecError> {
        loop {
            if let Some(msg) = decode_frame(&mut self.buf, self.max)? {
                return Ok(Some(msg));
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(CodecError::Truncated)
                };
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AddStatus, HelloStatus, TunnelId};

    fn samples() -> Vec<ControlMessage> {
        let id = TunnelId::new();
        vec![
            ControlMessage::hello("a.example.com"),
            ControlMessage::hello_ack(HelloStatus::Success),
            ControlMessage::hello_ack(HelloStatus::DomainOccupied),
            ControlMessage::add(id),
            ControlMessage::add_ack(id, AddStatus::Success),
            ControlMessage::add_ack(id, AddStatus::Error),
            ControlMessage::Ping,
        ]
    }

    #[test]
    fn test_length_prefix_matches_payload() {
        for msg in samples() {
            let frame = encode(&msg).unwrap();
            let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
            assert_eq!(len, frame.len() - LENGTH_PREFIX);
            assert_eq!(decode(&frame[LENGTH_PREFIX..]).unwrap(), msg);
        }
    }

    #[test]
    fn test_encode_refuses_frames_a_peer_would_reject() {
        let msg = ControlMessage::hello("a".repeat(DEFAULT_MAX_FRAME));
        let err = encode(&msg).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { max: DEFAULT_MAX_FRAME, .. }));

        let frame = encode_limited(&msg, 2 * DEFAULT_MAX_FRAME).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_FRAME).is_err());
        let mut buf = BytesMut::from(&frame[..]);
        assert_eq!(decode_frame(&mut buf, 2 * DEFAULT_MAX_FRAME).unwrap(), Some(msg));
    }

    #[test]
    fn test_decode_frame_waits_for_full_frame() {
        let frame = encode(&ControlMessage::hello("a.example.com")).unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame[..frame.len() - 1]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().is_none());
        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert_eq!(
            decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap(),
            Some(ControlMessage::hello("a.example.com"))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected_from_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32(1_000_000);
        let err = decode_frame(&mut buf, 1024).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { len: 1_000_000, max: 1024 }));
        let err: TunnelError = err.into();
        assert_eq!(err.category, ErrorCategory::Framing);
    }

    #[test]
    fn test_unknown_discriminant_is_framing_error() {
        let payload = br#"{"type":"TEST"}"#;
        let mut buf = BytesMut::new();
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(payload);
        let err = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_read_message_stops_at_frame_end() {
        let id = TunnelId::new();
        let mut bytes = encode(&ControlMessage::add(id)).unwrap().to_vec();
        bytes.extend_from_slice(b"GET / HTTP/1.1\r\n");

        let mut reader = &bytes[..];
        let msg = read_message(&mut reader, DEFAULT_MAX_FRAME).await.unwrap();
        assert_eq!(msg, ControlMessage::add(id));
        assert_eq!(reader, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_read_message_eof() {
        let mut empty: &[u8] = &[];
        assert!(matches!(
            read_message(&mut empty, DEFAULT_MAX_FRAME).await,
            Err(CodecError::Closed)
        ));

        let mut short: &[u8] = &[0, 0, 0, 9, b'{'];
        assert!(matches!(
            read_message(&mut short, DEFAULT_MAX_FRAME).await,
            Err(CodecError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_frame_reader_over_split_stream() {
        let (mut tx, rx) = tokio::io::duplex(3);
        let messages = samples();
        let expected = messages.clone();

        let writer = tokio::spawn(async move {
            for msg in &messages {
                write_message(&mut tx, msg).await.unwrap();
            }
        });

        let mut reader = FrameReader::new(rx, DEFAULT_MAX_FRAME);
        for msg in expected {
            assert_eq!(reader.next().await.unwrap(), Some(msg));
        }
        writer.await.unwrap();
        assert!(reader.next().await.unwrap().is_none());
    }
}
