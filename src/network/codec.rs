use bytes::{BufMut, Bytes, BytesMut};

use crate::network::conn::Conn;
use crate::service::error::{ServerError, ServerResult};

/// Pure transformer between the byte stream and application frames.
///
/// `decode` consumes from the connection's inbound buffer and returns exactly
/// one frame, or an empty frame (no error) when not enough data has arrived.
/// `encode` wraps the bytes a callback produced before they hit the wire.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, conn: &Conn, buf: Bytes) -> ServerResult<Bytes>;
    fn decode(&self, conn: &mut Conn) -> ServerResult<Bytes>;
}

/// The default codec: identity framing, one frame per available chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinCodec;

impl Codec for BuiltinCodec {
    fn encode(&self, _conn: &Conn, buf: Bytes) -> ServerResult<Bytes> {
        Ok(buf)
    }

    fn decode(&self, conn: &mut Conn) -> ServerResult<Bytes> {
        let n = conn.buffer_len();
        Ok(conn.consume(n))
    }
}

const LENGTH_HEADER: usize = 4;

/// Frames carry a big-endian u32 length prefix.
#[derive(Debug, Clone, Copy)]
pub struct LengthFieldCodec {
    max_frame: usize,
}

impl LengthFieldCodec {
    pub fn new(max_frame: usize) -> Self {
        LengthFieldCodec { max_frame }
    }

    /// Ensures a whole frame is buffered and returns its body length.
    fn check(&self, conn: &mut Conn) -> ServerResult<usize> {
        let head = conn.inbound_slice();
        if head.len() < LENGTH_HEADER {
            return Err(ServerError::Incomplete);
        }
        let mut header = [0u8; LENGTH_HEADER];
        header.copy_from_slice(&head[..LENGTH_HEADER]);
        let body = u32::from_be_bytes(header) as usize;
        if body > self.max_frame {
            return Err(ServerError::Codec(format!(
                "frame of length {} is too large",
                body
            )));
        }
        if head.len() < LENGTH_HEADER + body {
            return Err(ServerError::Incomplete);
        }
        Ok(body)
    }
}

impl Default for LengthFieldCodec {
    fn default() -> Self {
        LengthFieldCodec::new(16 * 1024 * 1024)
    }
}

impl Codec for LengthFieldCodec {
    fn encode(&self, _conn: &Conn, buf: Bytes) -> ServerResult<Bytes> {
        if buf.len() > self.max_frame {
            return Err(ServerError::Codec(format!(
                "frame of length {} is too large",
                buf.len()
            )));
        }
        let mut frame = BytesMut::with_capacity(LENGTH_HEADER + buf.len());
        frame.put_u32(buf.len() as u32);
        frame.extend_from_slice(&buf);
        Ok(frame.freeze())
    }

    fn decode(&self, conn: &mut Conn) -> ServerResult<Bytes> {
        match self.check(conn) {
            Ok(body) => {
                conn.consume(LENGTH_HEADER);
                Ok(conn.consume(body))
            }
            Err(ServerError::Incomplete) => Ok(Bytes::new()),
            Err(err) => Err(err),
        }
    }
}

/// Frames of a constant size.
#[derive(Debug, Clone, Copy)]
pub struct FixedLengthCodec {
    size: usize,
}

impl FixedLengthCodec {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "frame size must be non-zero");
        FixedLengthCodec { size }
    }
}

impl Codec for FixedLengthCodec {
    fn encode(&self, _conn: &Conn, buf: Bytes) -> ServerResult<Bytes> {
        if buf.is_empty() || buf.len() % self.size != 0 {
            return Err(ServerError::Codec(format!(
                "output of length {} is not a multiple of the frame size {}",
                buf.len(),
                self.size
            )));
        }
        Ok(buf)
    }

    fn decode(&self, conn: &mut Conn) -> ServerResult<Bytes> {
        if conn.buffer_len() < self.size {
            return Ok(Bytes::new());
        }
        Ok(conn.consume(self.size))
    }
}
