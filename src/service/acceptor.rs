use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::network::listener::apply_keepalive;
use crate::network::{Codec, Conn, ConnId};
use crate::service::command::Command;
use crate::service::error::ServerError;
use crate::service::loop_group::LoopGroup;
use crate::service::shutdown::ShutdownCond;

/// Per-read scratch size for the connection readers and the UDP loop.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Blocks on accept and converts each new connection into an `Accept`
/// command plus a dedicated reader task. Transient accept failures are
/// retried with exponential backoff; a persistent failure is fatal for the
/// server. The acceptor never calls user code.
pub(crate) async fn run_tcp_acceptor(
    listener: TcpListener,
    group: Arc<LoopGroup>,
    shutdown: Arc<ShutdownCond>,
    codec: Arc<dyn Codec>,
    keepalive: Option<Duration>,
) {
    debug!("acceptor started");
    let mut backoff = 1u64;
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, remote)) => {
                backoff = 1;
                if let Some(period) = keepalive {
                    if let Err(err) = apply_keepalive(&stream, period) {
                        warn!(%err, "failed to apply tcp keepalive");
                    }
                }
                let local = match stream.local_addr() {
                    Ok(addr) => addr,
                    Err(err) => {
                        warn!(%err, "failed to resolve local address, dropping connection");
                        continue;
                    }
                };
                let (read_half, write_half) = stream.into_split();
                let id = ConnId::next();
                let cancel = CancellationToken::new();
                let lp = group.next();
                trace!(conn = id.as_u64(), loop_idx = lp.idx, peer = %remote, "accepted");
                let conn = Conn::tcp(
                    id,
                    write_half,
                    local,
                    remote,
                    cancel.clone(),
                    Arc::clone(&codec),
                    lp.tx.clone(),
                );
                let tx = lp.tx.clone();
                // ownership first, then data: the reader starts only after
                // the Accept command is in the channel
                if tx.send(Command::Accept(conn)).await.is_err() {
                    break;
                }
                tokio::spawn(run_reader(id, read_half, cancel, tx));
            }
            Err(err) => {
                if backoff > 64 {
                    error!(%err, "accept failed too many times");
                    shutdown.signal(Some(ServerError::Accept(err.to_string())));
                    break;
                }
                warn!(%err, "accept failed, backing off");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff *= 2;
            }
        }
    }
    debug!("acceptor exited");
}

/// Reads chunks off one TCP stream and ships them to the owning loop. Exits
/// on EOF (`err: None`), on a read error, or when the loop cancels the token
/// to unpark a blocked read.
async fn run_reader(
    id: ConnId,
    mut read_half: OwnedReadHalf,
    cancel: CancellationToken,
    tx: mpsc::Sender<Command>,
) {
    let mut scratch = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        let res = tokio::select! {
            _ = cancel.cancelled() => {
                Err(io::Error::new(io::ErrorKind::Interrupted, "read unblocked by close"))
            }
            res = read_half.read_buf(&mut scratch) => res,
        };
        match res {
            Ok(0) => {
                let _ = tx.send(Command::ReaderError { id, err: None }).await;
                return;
            }
            Ok(_) => {
                let buf = scratch.split().freeze();
                if tx.send(Command::TcpData { id, buf }).await.is_err() {
                    return;
                }
                scratch.reserve(READ_BUFFER_SIZE);
            }
            Err(err) => {
                let _ = tx.send(Command::ReaderError { id, err: Some(err) }).await;
                return;
            }
        }
    }
}

/// Reads datagrams into a shared scratch and hands each to a loop as a
/// transient connection; UDP peers have no lifetime, so there is nothing to
/// accept or close.
pub(crate) async fn run_udp_acceptor(
    socket: Arc<UdpSocket>,
    group: Arc<LoopGroup>,
    shutdown: Arc<ShutdownCond>,
    codec: Arc<dyn Codec>,
) {
    debug!("udp acceptor started");
    let local = match socket.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            shutdown.signal(Some(err.into()));
            return;
        }
    };
    let mut scratch = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        scratch.reserve(READ_BUFFER_SIZE);
        let res = tokio::select! {
            _ = shutdown.wait() => break,
            res = socket.recv_buf_from(&mut scratch) => res,
        };
        match res {
            Ok((_, peer)) => {
                let cache = scratch.split().freeze();
                let lp = group.next();
                let conn = Conn::udp(
                    ConnId::next(),
                    Arc::clone(&socket),
                    local,
                    peer,
                    cache,
                    Arc::clone(&codec),
                    lp.tx.clone(),
                );
                if lp.tx.send(Command::UdpData(conn)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                error!(%err, "udp read failed");
                shutdown.signal(Some(err.into()));
                break;
            }
        }
    }
    debug!("udp acceptor exited");
}
