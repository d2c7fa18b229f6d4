use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::network::Conn;

/// Directive returned by handler callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep the connection and the server running.
    #[default]
    None,
    /// Close the connection the callback was invoked for.
    Close,
    /// Shut the whole server down.
    Shutdown,
}

/// Snapshot of the running server handed to [`EventHandler::on_init_complete`].
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// The resolved listen address (useful when binding port 0).
    pub addr: SocketAddr,
    /// Number of event loops serving connections.
    pub num_loops: usize,
    pub multicore: bool,
    pub reuse_port: bool,
    pub tcp_keepalive: Option<Duration>,
}

/// The lifecycle contract between the server core and user code.
///
/// Every method has a default body, so a handler implements only what it
/// needs. Callbacks for one connection always run on that connection's owning
/// event loop, strictly sequentially; the same handler value is shared by all
/// loops, so implementations must be thread-safe (`Send + Sync`) and should
/// return promptly.
pub trait EventHandler: Send + Sync + 'static {
    /// Called once after the listener is bound and before any loop starts.
    /// Returning [`Action::Shutdown`] aborts startup with a clean exit.
    fn on_init_complete(&self, server: &ServerInfo) -> Action {
        let _ = server;
        Action::None
    }

    /// Called when a new TCP connection has been assigned to a loop. Returned
    /// bytes are written to the peer as-is, before any data is read.
    fn on_opened(&self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        let _ = conn;
        (None, Action::None)
    }

    /// Called exactly once when a connection is torn down. `err` is `None`
    /// for a clean EOF or a close the server itself initiated.
    fn on_closed(&self, conn: &mut Conn, err: Option<&io::Error>) -> Action {
        let _ = (conn, err);
        Action::None
    }

    /// Called immediately before every non-empty write produced by a callback.
    fn pre_write(&self) {}

    /// Called when buffered bytes are available on `conn`, or after a
    /// [`Conn::wake`]. Read the current frame via [`Conn::read`]; as long as
    /// the returned bytes are non-empty the loop writes them and invokes
    /// `react` again, which lets one data command answer several pipelined
    /// frames.
    fn react(&self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        let _ = conn;
        (None, Action::None)
    }

    /// Called by the ticker when enabled; returns the delay before the next
    /// tick.
    fn tick(&self) -> (Duration, Action) {
        (Duration::from_secs(1), Action::None)
    }
}
