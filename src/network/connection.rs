//! Connection handling for Harmony
//!
//! Wraps one byte stream and moves whole messages over it:
//! - 4-byte big-endian length prefix, then exactly that many payload bytes
//! - Short writes and short reads are driven to completion
//! - Optional read timeout on every receive

use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{encode_u32, CodecError, Message};

/// Length prefix width
const PREFIX_SIZE: usize = 4;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Connection closed after {0} of 4 length-prefix bytes")]
    ShortPrefix(usize),

    #[error("Connection closed after {read} of {expected} payload bytes")]
    ShortPayload { read: usize, expected: usize },

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Serialized {written} bytes but message reported size {expected}")]
    SizeMismatch { written: usize, expected: usize },

    #[error("Connection timeout")]
    Timeout,
}

impl ConnectionError {
    /// Errors after which the stream is still positioned at a frame boundary.
    ///
    /// A frame that was read whole but failed to decode leaves the stream
    /// usable, so the server can answer FAIL and keep serving.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ConnectionError::Protocol(_))
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// A framed message connection to a remote peer
pub struct Connection<S = TcpStream> {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// The underlying stream
    stream: S,
    /// Write buffer
    write_buf: BytesMut,
    /// Largest frame accepted from the peer
    max_frame_size: usize,
    /// Timeout applied to each receive
    read_timeout: Option<Duration>,
    /// Statistics
    stats: ConnectionStats,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new connection from an established stream
    pub fn new(stream: S, remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            stream,
            write_buf: BytesMut::with_capacity(4096),
            max_frame_size: super::DEFAULT_MAX_FRAME_SIZE,
            read_timeout: None,
            stats: ConnectionStats::default(),
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Send one message: length prefix followed by the serialized message
    pub async fn send(&mut self, message: &Message) -> ConnectionResult<()> {
        let size = message.size();

        self.write_buf.clear();
        self.write_buf.reserve(PREFIX_SIZE + size);
        encode_u32(&mut self.write_buf, size as u32);
        let written = message.serialize(&mut self.write_buf)?;
        if written != size {
            return Err(ConnectionError::SizeMismatch {
                written,
                expected: size,
            });
        }

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;

        tracing::debug!("-> {} {} ({} bytes)", self.remote_addr, message.kind(), size);
        Ok(())
    }

    /// Receive one message, applying the configured read timeout
    ///
    /// Returns `Closed` when the peer shuts down cleanly between messages.
    pub async fn recv(&mut self) -> ConnectionResult<Message> {
        match self.read_timeout {
            Some(timeout) => self.recv_timeout(timeout).await,
            None => self.recv_frame().await,
        }
    }

    /// Receive one message, failing with `Timeout` if none arrives in time
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ConnectionResult<Message> {
        match tokio::time::timeout(timeout, self.recv_frame()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    async fn recv_frame(&mut self) -> ConnectionResult<Message> {
        let mut prefix = [0u8; PREFIX_SIZE];
        let mut filled = 0;
        while filled < PREFIX_SIZE {
            let n = self.stream.read(&mut prefix[filled..]).await?;
            if n == 0 {
                return Err(if filled == 0 {
                    ConnectionError::Closed
                } else {
                    ConnectionError::ShortPrefix(filled)
                });
            }
            filled += n;
        }

        let length = u32::from_be_bytes(prefix) as usize;
        if length > self.max_frame_size {
            return Err(ConnectionError::FrameTooLarge(length, self.max_frame_size));
        }

        let mut payload = vec![0u8; length];
        let mut read = 0;
        while read < length {
            let n = self.stream.read(&mut payload[read..]).await?;
            if n == 0 {
                return Err(ConnectionError::ShortPayload {
                    read,
                    expected: length,
                });
            }
            read += n;
        }

        self.stats.messages_received += 1;
        self.stats.bytes_received += (PREFIX_SIZE + length) as u64;

        let message = Message::deserialize(&payload)?;
        tracing::debug!("<- {} {} ({} bytes)", self.remote_addr, message.kind(), length);
        Ok(message)
    }

    /// Send a request and wait for its response
    ///
    /// Taking `&mut self` keeps at most one request outstanding per connection.
    pub async fn request(&mut self, message: &Message) -> ConnectionResult<Message> {
        self.send(message).await?;
        self.recv().await
    }

    /// Close the connection
    pub async fn close(&mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageKind, VarDef, MAX_STRING_LEN};
    use tokio_test::io::Builder;

    fn addr() -> SocketAddr {
        "127.0.0.1:1977".parse().unwrap()
    }

    fn frame(message: &Message) -> Vec<u8> {
        let mut buf = BytesMut::new();
        message.serialize(&mut buf).unwrap();
        let mut out = (buf.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(&buf);
        out
    }

    #[tokio::test]
    async fn test_send_writes_length_prefix() {
        let msg = Message::confirm(1, 7);
        let mock = Builder::new().write(&frame(&msg)).build();
        let mut conn = Connection::new(mock, addr());
        conn.send(&msg).await.unwrap();
        assert_eq!(conn.stats().messages_sent, 1);
        assert_eq!(conn.stats().bytes_sent, 20);
    }

    #[tokio::test]
    async fn test_recv_reassembles_partial_reads() {
        let msg = Message::update(MessageKind::VarSet, 4, vec![VarDef::integer("x", 9)]).unwrap();
        let bytes = frame(&msg);
        let mut builder = Builder::new();
        builder.read(&bytes[..2]).read(&bytes[2..7]).read(&bytes[7..]);
        let mut conn = Connection::new(builder.build(), addr());

        assert_eq!(conn.recv().await.unwrap(), msg);
        assert_eq!(conn.stats().messages_received, 1);
    }

    #[tokio::test]
    async fn test_clean_close_at_boundary() {
        let mock = Builder::new().build();
        let mut conn = Connection::new(mock, addr());
        assert!(matches!(conn.recv().await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_short_prefix_is_protocol_error() {
        let mock = Builder::new().read(&[0, 0]).build();
        let mut conn = Connection::new(mock, addr());
        assert!(matches!(conn.recv().await, Err(ConnectionError::ShortPrefix(2))));
    }

    #[tokio::test]
    async fn test_short_payload() {
        let bytes = frame(&Message::fail());
        let mock = Builder::new().read(&bytes[..10]).build();
        let mut conn = Connection::new(mock, addr());
        assert!(matches!(
            conn.recv().await,
            Err(ConnectionError::ShortPayload { read: 6, expected: 16 })
        ));
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let mock = Builder::new().read(&[0, 1, 0, 0]).build();
        let mut conn = Connection::new(mock, addr()).with_max_frame_size(1024);
        assert!(matches!(
            conn.recv().await,
            Err(ConnectionError::FrameTooLarge(65536, 1024))
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_leaves_stream_usable() {
        let mut garbage = vec![0, 0, 0, 8];
        garbage.extend_from_slice(&[0, 0, 0, 99, 0, 0, 0, 2]);
        let good = frame(&Message::fail());
        let mock = Builder::new().read(&garbage).read(&good).build();
        let mut conn = Connection::new(mock, addr());

        let err = conn.recv().await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(
            err,
            ConnectionError::Protocol(CodecError::UnknownKind(99))
        ));
        assert_eq!(conn.recv().await.unwrap().kind(), MessageKind::Fail);
    }

    #[tokio::test]
    async fn test_oversized_string_is_not_sent() {
        let msg = Message::update(
            MessageKind::VarSet,
            0,
            vec![VarDef::string("s", "a".repeat(MAX_STRING_LEN))],
        )
        .unwrap();
        let mock = Builder::new().build();
        let mut conn = Connection::new(mock, addr());
        assert!(matches!(
            conn.send(&msg).await,
            Err(ConnectionError::Protocol(CodecError::StringTooLong { .. }))
        ));
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (client, _server) = tokio::io::duplex(64);
        let mut conn =
            Connection::new(client, addr()).with_read_timeout(Some(Duration::from_millis(50)));
        assert!(matches!(conn.recv().await, Err(ConnectionError::Timeout)));
    }
}
