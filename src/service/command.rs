use std::collections::HashMap;
use std::io;

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::network::{Conn, ConnId};
use crate::service::error::{ServerError, ServerResult};

pub(crate) type ConnSet = HashMap<ConnId, Conn>;

/// A deferred unit of work executed on the owning loop, with access to its
/// connection set. `Conn::async_write` is the producer.
pub(crate) type TaskFn =
    Box<dyn for<'a> FnOnce(&'a mut ConnSet) -> BoxFuture<'a, ServerResult<()>> + Send>;

/// A tagged message on an event loop's channel. The discriminant dictates the
/// loop's transition; keeping this a sum type makes the dispatch exhaustive.
pub(crate) enum Command {
    /// A freshly accepted TCP connection to take ownership of.
    Accept(Conn),
    /// Bytes the connection's reader pulled off the socket.
    TcpData { id: ConnId, buf: Bytes },
    /// One datagram, travelling as the transient connection's cache.
    UdpData(Conn),
    /// The reader is gone; `None` means clean EOF.
    ReaderError { id: ConnId, err: Option<io::Error> },
    /// Invoke `react` again without new input.
    Wake(ConnId),
    /// Pulse from the tick driver.
    Tick,
    /// Egress only: close every connection the loop still owns.
    CloseAll,
    /// Leave the main phase carrying this error.
    Shutdown(ServerError),
    /// Run a thunk on the loop; its error is a loop-level error.
    Task(TaskFn),
}
