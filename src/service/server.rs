use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::handler::{Action, EventHandler, ServerInfo};
use crate::network::listener::{ListenAddr, Listener};
use crate::network::{BuiltinCodec, Codec};
use crate::service::acceptor::{run_tcp_acceptor, run_udp_acceptor};
use crate::service::command::Command;
use crate::service::error::{ServerError, ServerResult};
use crate::service::event_loop::{run_ticker, EventLoop};
use crate::service::loop_group::{LoopGroup, LoopHandle};
use crate::service::shutdown::ShutdownCond;

/// Commands buffered per loop before producers block.
const COMMAND_BACKLOG: usize = 64;

/// Server options. Everything defaults off: one event loop, no keepalive, no
/// ticker, identity codec.
#[derive(Clone, Default)]
pub struct Options {
    /// Run one event loop per hardware thread instead of a single loop.
    pub multicore: bool,
    /// Enable TCP keepalive on accepted connections with this period.
    pub tcp_keepalive: Option<Duration>,
    /// Run the ticker on loop 0 and deliver [`EventHandler::tick`] callbacks.
    pub ticker: bool,
    /// Bind the listener with `SO_REUSEPORT`.
    pub reuse_port: bool,
    /// Frame codec for the TCP stream; identity framing when absent.
    pub codec: Option<Arc<dyn Codec>>,
}

/// Runs a server on `addr` (`tcp://host:port` or `udp://host:port`) until a
/// handler returns [`Action::Shutdown`] or the acceptor hits a fatal error.
///
/// Returns `Ok(())` for a handler-requested shutdown and the underlying
/// cause for everything else. Teardown is staged: every loop is drained out
/// of its main phase first, then all surviving connections are closed and
/// their `on_closed` callbacks run before this call returns.
pub async fn serve<H>(handler: H, addr: &str, options: Options) -> ServerResult<()>
where
    H: EventHandler,
{
    let listen: ListenAddr = addr.parse()?;
    let num_loops = if options.multicore {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        1
    };
    let codec: Arc<dyn Codec> = options
        .codec
        .clone()
        .unwrap_or_else(|| Arc::new(BuiltinCodec));
    let handler = Arc::new(handler);

    let listener = Listener::bind(&listen, options.reuse_port)?;
    let info = ServerInfo {
        addr: listener.local_addr()?,
        num_loops,
        multicore: options.multicore,
        reuse_port: options.reuse_port,
        tcp_keepalive: options.tcp_keepalive,
    };
    if handler.on_init_complete(&info) == Action::Shutdown {
        return Ok(());
    }
    info!(addr = %info.addr, loops = num_loops, "server starting");

    let shutdown = Arc::new(ShutdownCond::new());
    let (main_done_tx, mut main_done_rx) = mpsc::channel::<()>(1);
    let (egress_done_tx, mut egress_done_rx) = mpsc::channel::<()>(1);

    let mut group = LoopGroup::new();
    let mut loops = Vec::with_capacity(num_loops);
    for idx in 0..num_loops {
        let (tx, rx) = mpsc::channel(COMMAND_BACKLOG);
        let ticker = if idx == 0 && options.ticker {
            let (tick_tx, tick_rx) = mpsc::channel(1);
            let (tock_tx, tock_rx) = mpsc::channel(1);
            tokio::spawn(run_ticker(tick_tx, tock_rx));
            Some((tick_rx, tock_tx))
        } else {
            None
        };
        group.register(LoopHandle { idx, tx });
        loops.push(EventLoop::new(
            idx,
            rx,
            Arc::clone(&handler),
            Arc::clone(&codec),
            Arc::clone(&shutdown),
            ticker,
        ));
    }
    let group = Arc::new(group);
    for lp in loops {
        tokio::spawn(lp.run(main_done_tx.clone(), egress_done_tx.clone()));
    }

    match listener {
        Listener::Tcp(listener) => {
            tokio::spawn(run_tcp_acceptor(
                listener,
                Arc::clone(&group),
                Arc::clone(&shutdown),
                Arc::clone(&codec),
                options.tcp_keepalive,
            ));
        }
        Listener::Udp(socket) => {
            tokio::spawn(run_udp_acceptor(
                socket,
                Arc::clone(&group),
                Arc::clone(&shutdown),
                Arc::clone(&codec),
            ));
        }
    }

    shutdown.wait().await;
    let cause = shutdown.take_cause();
    debug!("server shutting down, draining event loops");

    // phase 1: pull every loop out of its main phase
    for lp in group.iter() {
        let _ = lp.tx.send(Command::Shutdown(ServerError::Closing)).await;
    }
    drop(main_done_tx);
    main_done_rx.recv().await;

    // phase 2: close whatever the loops still own
    for lp in group.iter() {
        let _ = lp.tx.send(Command::CloseAll).await;
    }
    drop(egress_done_tx);
    egress_done_rx.recv().await;

    info!("server shutdown complete");
    match cause {
        None | Some(ServerError::Closing) => Ok(()),
        Some(err) => Err(err),
    }
}
