use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::handler::{Action, EventHandler};
use crate::network::{Codec, Conn, ConnId};
use crate::service::command::{Command, ConnSet};
use crate::service::error::{ServerError, ServerResult};
use crate::service::shutdown::ShutdownCond;

/// A worker loop owning a disjoint subset of connections. Commands are
/// processed strictly sequentially, which keeps per-connection state free of
/// data races by construction: nothing here is shared, everything arrives
/// over the channel.
pub(crate) struct EventLoop<H> {
    idx: usize,
    rx: mpsc::Receiver<Command>,
    conns: ConnSet,
    handler: Arc<H>,
    codec: Arc<dyn Codec>,
    shutdown: Arc<ShutdownCond>,
    tick_rx: Option<mpsc::Receiver<Command>>,
    tock_tx: Option<mpsc::Sender<Duration>>,
}

impl<H: EventHandler> EventLoop<H> {
    pub(crate) fn new(
        idx: usize,
        rx: mpsc::Receiver<Command>,
        handler: Arc<H>,
        codec: Arc<dyn Codec>,
        shutdown: Arc<ShutdownCond>,
        ticker: Option<(mpsc::Receiver<Command>, mpsc::Sender<Duration>)>,
    ) -> Self {
        let (tick_rx, tock_tx) = match ticker {
            Some((tick_rx, tock_tx)) => (Some(tick_rx), Some(tock_tx)),
            None => (None, None),
        };
        EventLoop {
            idx,
            rx,
            conns: ConnSet::new(),
            handler,
            codec,
            shutdown,
            tick_rx,
            tock_tx,
        }
    }

    /// Runs the loop to completion: the main phase until a fatal error, then
    /// egress until the owned set is empty and CloseAll has been seen. The
    /// two `done` senders are the phase markers the server waits on.
    pub(crate) async fn run(mut self, main_done: mpsc::Sender<()>, egress_done: mpsc::Sender<()>) {
        debug!(idx = self.idx, "event loop started");
        let fatal = self.main_phase().await;
        // dropping both tick ends stops the driver before anything else
        self.tick_rx = None;
        self.tock_tx = None;
        self.shutdown.signal(Some(fatal));
        drop(main_done);
        self.egress().await;
        debug!(idx = self.idx, "event loop exited");
        drop(egress_done);
    }

    async fn main_phase(&mut self) -> ServerError {
        loop {
            let cmd = match self.tick_rx.as_mut() {
                Some(tick_rx) => tokio::select! {
                    maybe = self.rx.recv() => maybe,
                    maybe = tick_rx.recv() => maybe,
                },
                None => self.rx.recv().await,
            };
            let Some(cmd) = cmd else {
                return ServerError::Closing;
            };
            if let Err(err) = self.dispatch(cmd).await {
                return err;
            }
        }
    }

    async fn dispatch(&mut self, cmd: Command) -> ServerResult<()> {
        match cmd {
            Command::Accept(conn) => self.on_accept(conn).await,
            Command::TcpData { id, buf } => self.on_tcp_data(id, buf).await,
            Command::UdpData(conn) => self.on_udp_data(conn).await,
            Command::ReaderError { id, err } => self.on_reader_error(id, err).await,
            Command::Wake(id) => self.on_wake(id).await,
            Command::Tick => self.on_tick().await,
            Command::Task(task) => task(&mut self.conns).await,
            Command::Shutdown(err) => Err(err),
            // only sent to loops already in egress; seeing it here still
            // means the server is tearing down
            Command::CloseAll => Err(ServerError::Closing),
        }
    }

    async fn on_accept(&mut self, conn: Conn) -> ServerResult<()> {
        let id = conn.id();
        trace!(idx = self.idx, conn = id.as_u64(), "accept");
        self.conns.insert(id, conn);
        let handler = Arc::clone(&self.handler);
        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(());
        };
        let (out, action) = handler.on_opened(conn);
        if let Some(out) = out.filter(|out| !out.is_empty()) {
            handler.pre_write();
            conn.write(&out).await;
        }
        self.apply(action, id)
    }

    async fn on_tcp_data(&mut self, id: ConnId, buf: Bytes) -> ServerResult<()> {
        let handler = Arc::clone(&self.handler);
        let codec = Arc::clone(&self.codec);
        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(());
        };
        conn.set_cache(buf);
        // the react loop: as long as the handler produces output, feed it the
        // same cache again so one data command can answer pipelined frames
        let action = loop {
            let (out, action) = handler.react(conn);
            match out.filter(|out| !out.is_empty()) {
                Some(out) => {
                    handler.pre_write();
                    // a frame the codec refuses is dropped
                    if let Ok(frame) = codec.encode(conn, out) {
                        conn.write(&frame).await;
                    }
                }
                None => break action,
            }
        };
        conn.stash_cache();
        let action = if conn.take_decode_failure() {
            Action::Close
        } else {
            action
        };
        self.apply(action, id)
    }

    async fn on_udp_data(&mut self, mut conn: Conn) -> ServerResult<()> {
        let handler = Arc::clone(&self.handler);
        let (out, action) = handler.react(&mut conn);
        if let Some(out) = out.filter(|out| !out.is_empty()) {
            handler.pre_write();
            conn.write(&out).await;
        }
        // there is no per-peer handle, so Close has nothing to act on
        match action {
            Action::Shutdown => Err(ServerError::Closing),
            _ => Ok(()),
        }
    }

    async fn on_reader_error(&mut self, id: ConnId, err: Option<io::Error>) -> ServerResult<()> {
        let Some(mut conn) = self.conns.remove(&id) else {
            return Ok(());
        };
        conn.close_transport().await;
        // a failure after the loop decided to close is expected, not an error
        let err = if conn.is_closing() { None } else { err };
        let handler = Arc::clone(&self.handler);
        match handler.on_closed(&mut conn, err.as_ref()) {
            Action::Shutdown => Err(ServerError::Closing),
            _ => Ok(()),
        }
    }

    async fn on_wake(&mut self, id: ConnId) -> ServerResult<()> {
        let handler = Arc::clone(&self.handler);
        // stale wakes for connections already gone are dropped
        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(());
        };
        let (out, action) = handler.react(conn);
        if let Some(out) = out.filter(|out| !out.is_empty()) {
            handler.pre_write();
            conn.write(&out).await;
        }
        let action = if conn.take_decode_failure() {
            Action::Close
        } else {
            action
        };
        self.apply(action, id)
    }

    async fn on_tick(&mut self) -> ServerResult<()> {
        let (delay, action) = self.handler.tick();
        if let Some(tock) = &self.tock_tx {
            let _ = tock.send(delay).await;
        }
        match action {
            Action::Shutdown => Err(ServerError::Closing),
            _ => Ok(()),
        }
    }

    fn apply(&mut self, action: Action, id: ConnId) -> ServerResult<()> {
        match action {
            Action::None => Ok(()),
            Action::Close => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.begin_close();
                }
                Ok(())
            }
            Action::Shutdown => Err(ServerError::Closing),
        }
    }

    /// Post-fatal teardown: only CloseAll and reader errors are honored until
    /// the owned set is empty, everything else is drained and discarded.
    async fn egress(&mut self) {
        let mut closed = false;
        loop {
            if closed && self.conns.is_empty() {
                break;
            }
            let Some(cmd) = self.rx.recv().await else {
                break;
            };
            match cmd {
                Command::CloseAll => {
                    closed = true;
                    for conn in self.conns.values_mut() {
                        conn.begin_close();
                    }
                }
                Command::ReaderError { id, err } => {
                    let _ = self.on_reader_error(id, err).await;
                }
                // never opened; unpark its reader so the task cannot linger
                Command::Accept(mut conn) => conn.begin_close(),
                _ => {}
            }
        }
    }
}

/// Drives the ticker for loop 0: pulse, wait for the loop to report the next
/// delay on the tock channel, sleep, pulse again. Either end dropping its
/// channel terminates the driver.
pub(crate) async fn run_ticker(tick_tx: mpsc::Sender<Command>, mut tock_rx: mpsc::Receiver<Duration>) {
    debug!("tick driver started");
    loop {
        if tick_tx.send(Command::Tick).await.is_err() {
            break;
        }
        let Some(delay) = tock_rx.recv().await else {
            break;
        };
        tokio::time::sleep(delay).await;
    }
    debug!("tick driver exited");
}
