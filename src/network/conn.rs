use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::network::codec::Codec;
use crate::service::command::{Command, ConnSet, TaskFn};
use crate::service::error::{ServerError, ServerResult};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

const OPEN: u8 = 0;
const CLOSING: u8 = 1;

const INBOUND_BUFFER_SIZE: usize = 4 * 1024;

/// Unique identifier for connections.
///
/// Generated atomically when the connection is accepted (TCP) or when its
/// first datagram arrives (UDP), and constant for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub(crate) fn next() -> Self {
        ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

enum Transport {
    Tcp(BufWriter<OwnedWriteHalf>),
    Udp {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

/// One live peer.
///
/// A `Conn` is owned by exactly one event loop from accept until `on_closed`
/// returns, and only that loop touches its buffers, context, and transport.
/// The close flag is the single atomic exception: it tells the reader task
/// that a subsequent read failure was provoked on purpose. Handlers receive
/// `&mut Conn` inside callbacks; anything that needs to reach the connection
/// from outside a callback goes through [`Conn::wake`], [`Conn::async_write`],
/// or a [`ConnHandle`], all of which route over the owning loop's command
/// channel.
pub struct Conn {
    id: ConnId,
    transport: Transport,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    /// Bytes left over from earlier data commands.
    inbound: BytesMut,
    /// The most recent unprocessed fragment.
    cache: Bytes,
    close: Arc<AtomicU8>,
    cancel: CancellationToken,
    context: Option<Box<dyn Any + Send + Sync>>,
    decode_failed: bool,
    codec: Arc<dyn Codec>,
    cmd_tx: mpsc::Sender<Command>,
}

impl Conn {
    pub(crate) fn tcp(
        id: ConnId,
        writer: OwnedWriteHalf,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        cancel: CancellationToken,
        codec: Arc<dyn Codec>,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        Conn {
            id,
            transport: Transport::Tcp(BufWriter::new(writer)),
            local_addr,
            remote_addr,
            inbound: BytesMut::with_capacity(INBOUND_BUFFER_SIZE),
            cache: Bytes::new(),
            close: Arc::new(AtomicU8::new(OPEN)),
            cancel,
            context: None,
            decode_failed: false,
            codec,
            cmd_tx,
        }
    }

    /// A transient connection for one datagram; UDP peers have no lifetime.
    pub(crate) fn udp(
        id: ConnId,
        socket: Arc<UdpSocket>,
        local_addr: SocketAddr,
        peer: SocketAddr,
        cache: Bytes,
        codec: Arc<dyn Codec>,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        Conn {
            id,
            transport: Transport::Udp { socket, peer },
            local_addr,
            remote_addr: peer,
            inbound: BytesMut::new(),
            cache,
            close: Arc::new(AtomicU8::new(OPEN)),
            cancel: CancellationToken::new(),
            context: None,
            decode_failed: false,
            codec,
            cmd_tx,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Decodes and consumes the current frame from the buffered inbound
    /// bytes. Returns an empty frame when not enough data has arrived. A
    /// decode failure stores the error in the context slot and leaves an
    /// empty frame; the loop closes the connection once the react loop ends.
    pub fn read(&mut self) -> Bytes {
        let codec = Arc::clone(&self.codec);
        match codec.decode(self) {
            Ok(frame) => frame,
            Err(err) => {
                self.decode_failed = true;
                self.context = Some(Box::new(err));
                Bytes::new()
            }
        }
    }

    /// Discards everything buffered on the connection.
    pub fn reset_buffer(&mut self) {
        self.inbound.clear();
        self.cache = Bytes::new();
    }

    /// Total number of buffered inbound bytes.
    pub fn buffer_len(&self) -> usize {
        self.inbound.len() + self.cache.len()
    }

    /// Contiguous view of the buffered inbound bytes. Codecs peek here before
    /// deciding whether a whole frame has arrived.
    pub fn inbound_slice(&mut self) -> &[u8] {
        self.coalesce();
        if self.inbound.is_empty() {
            &self.cache
        } else {
            &self.inbound
        }
    }

    /// Consumes up to `n` buffered bytes and returns them.
    pub fn consume(&mut self, n: usize) -> Bytes {
        self.coalesce();
        if self.inbound.is_empty() {
            let n = n.min(self.cache.len());
            self.cache.split_to(n)
        } else {
            let n = n.min(self.inbound.len());
            self.inbound.split_to(n).freeze()
        }
    }

    pub fn set_context<T: Any + Send + Sync>(&mut self, ctx: T) {
        self.context = Some(Box::new(ctx));
    }

    pub fn context<T: Any>(&self) -> Option<&T> {
        self.context.as_ref().and_then(|ctx| ctx.downcast_ref())
    }

    pub fn take_context(&mut self) -> Option<Box<dyn Any + Send + Sync>> {
        self.context.take()
    }

    /// Requests another `react` invocation without new bytes arriving.
    /// Non-blocking; fails if the owning loop's channel is full or gone.
    pub fn wake(&self) -> ServerResult<()> {
        wake_via(&self.cmd_tx, self.id)
    }

    /// Enqueues `buf` to be written by the owning loop after the current
    /// command finishes. Safe to call from any thread.
    pub fn async_write(&self, buf: Bytes) -> ServerResult<()> {
        async_write_via(&self.cmd_tx, self.id, buf)
    }

    /// A cloneable handle for waking or writing to this connection from
    /// outside its callbacks.
    pub fn handle(&self) -> ConnHandle {
        ConnHandle {
            id: self.id,
            close: Arc::clone(&self.close),
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    fn coalesce(&mut self) {
        if !self.inbound.is_empty() && !self.cache.is_empty() {
            self.inbound.extend_from_slice(&self.cache);
            self.cache = Bytes::new();
        }
    }

    pub(crate) fn set_cache(&mut self, buf: Bytes) {
        self.cache = buf;
    }

    /// Moves the residual cache into the inbound buffer once a react loop is
    /// done with it.
    pub(crate) fn stash_cache(&mut self) {
        if !self.cache.is_empty() {
            self.inbound.extend_from_slice(&self.cache);
            self.cache = Bytes::new();
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.close.load(Ordering::Acquire) == CLOSING
    }

    /// Marks the connection as closing and unparks its reader, whose next
    /// read failure is then treated as expected.
    pub(crate) fn begin_close(&mut self) {
        self.close.store(CLOSING, Ordering::Release);
        self.cancel.cancel();
    }

    pub(crate) fn take_decode_failure(&mut self) -> bool {
        std::mem::take(&mut self.decode_failed)
    }

    /// Writes `buf` to the transport. A write after close is a no-op and
    /// write errors are discarded; the reader surfaces the failure.
    pub(crate) async fn write(&mut self, buf: &[u8]) {
        if self.is_closing() {
            return;
        }
        match &mut self.transport {
            Transport::Tcp(writer) => {
                if writer.write_all(buf).await.is_err() {
                    return;
                }
                let _ = writer.flush().await;
            }
            Transport::Udp { socket, peer } => {
                let _ = socket.send_to(buf, *peer).await;
            }
        }
    }

    pub(crate) async fn close_transport(&mut self) {
        if let Transport::Tcp(writer) = &mut self.transport {
            let _ = writer.shutdown().await;
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("buffered", &self.buffer_len())
            .finish()
    }
}

/// Detached handle to a connection, valid on any thread. Operations route
/// through the owning loop's command channel and become no-ops once the
/// connection is gone.
#[derive(Clone)]
pub struct ConnHandle {
    id: ConnId,
    close: Arc<AtomicU8>,
    cmd_tx: mpsc::Sender<Command>,
}

impl ConnHandle {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn is_closing(&self) -> bool {
        self.close.load(Ordering::Acquire) == CLOSING
    }

    pub fn wake(&self) -> ServerResult<()> {
        wake_via(&self.cmd_tx, self.id)
    }

    pub fn async_write(&self, buf: Bytes) -> ServerResult<()> {
        async_write_via(&self.cmd_tx, self.id, buf)
    }
}

fn wake_via(tx: &mpsc::Sender<Command>, id: ConnId) -> ServerResult<()> {
    tx.try_send(Command::Wake(id))
        .map_err(|err| ServerError::ChannelSend(err.to_string()))
}

fn async_write_via(tx: &mpsc::Sender<Command>, id: ConnId, buf: Bytes) -> ServerResult<()> {
    let task: TaskFn = Box::new(move |conns: &mut ConnSet| {
        let fut = async move {
            if let Some(conn) = conns.get_mut(&id) {
                conn.write(&buf).await;
            }
            Ok(())
        };
        Box::pin(fut) as BoxFuture<'_, ServerResult<()>>
    });
    tx.try_send(Command::Task(task))
        .map_err(|err| ServerError::ChannelSend(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::codec::BuiltinCodec;

    async fn test_conn(cache: &[u8]) -> Conn {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local = socket.local_addr().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        Conn::udp(
            ConnId::next(),
            socket,
            local,
            local,
            Bytes::copy_from_slice(cache),
            Arc::new(BuiltinCodec),
            tx,
        )
    }

    #[tokio::test]
    async fn consume_spans_inbound_and_cache() {
        let mut conn = test_conn(b"world").await;
        conn.stash_cache();
        conn.set_cache(Bytes::from_static(b"!"));
        assert_eq!(conn.buffer_len(), 6);

        let first = conn.consume(3);
        assert_eq!(&first[..], b"wor");
        let rest = conn.consume(16);
        assert_eq!(&rest[..], b"ld!");
        assert_eq!(conn.buffer_len(), 0);
    }

    #[tokio::test]
    async fn reset_buffer_discards_everything() {
        let mut conn = test_conn(b"abc").await;
        conn.stash_cache();
        conn.set_cache(Bytes::from_static(b"def"));
        conn.reset_buffer();
        assert_eq!(conn.buffer_len(), 0);
        assert!(conn.read().is_empty());
    }

    #[tokio::test]
    async fn context_round_trip() {
        let mut conn = test_conn(b"").await;
        assert!(conn.context::<u32>().is_none());
        conn.set_context(7u32);
        assert_eq!(conn.context::<u32>(), Some(&7));
        assert!(conn.context::<String>().is_none());
        assert!(conn.take_context().is_some());
        assert!(conn.context::<u32>().is_none());
    }
}
