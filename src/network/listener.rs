use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::service::error::ServerError;

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Proto {
    Tcp,
    Udp,
}

/// A parsed listen address: `tcp://host:port` or `udp://host:port`. An empty
/// host binds the wildcard address; port 0 asks the OS for a free port.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ListenAddr {
    pub(crate) proto: Proto,
    pub(crate) addr: SocketAddr,
}

impl FromStr for ListenAddr {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| ServerError::InvalidAddr(s.to_string()))?;
        let proto = match scheme {
            "tcp" => Proto::Tcp,
            "udp" => Proto::Udp,
            _ => return Err(ServerError::InvalidAddr(s.to_string())),
        };
        let host_port = if rest.starts_with(':') {
            format!("0.0.0.0{rest}")
        } else {
            rest.to_string()
        };
        let addr = host_port
            .to_socket_addrs()
            .map_err(|_| ServerError::InvalidAddr(s.to_string()))?
            .next()
            .ok_or_else(|| ServerError::InvalidAddr(s.to_string()))?;
        Ok(ListenAddr { proto, addr })
    }
}

pub(crate) enum Listener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

impl Listener {
    pub(crate) fn bind(listen: &ListenAddr, reuse_port: bool) -> io::Result<Listener> {
        match listen.proto {
            Proto::Tcp => Ok(Listener::Tcp(bind_tcp(listen.addr, reuse_port)?)),
            Proto::Udp => Ok(Listener::Udp(Arc::new(bind_udp(listen.addr, reuse_port)?))),
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr(),
            Listener::Udp(socket) => socket.local_addr(),
        }
    }
}

fn new_socket(addr: SocketAddr, ty: Type, protocol: Protocol, reuse_port: bool) -> io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

fn bind_tcp(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    let socket = new_socket(addr, Type::STREAM, Protocol::TCP, reuse_port)?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

fn bind_udp(addr: SocketAddr, reuse_port: bool) -> io::Result<UdpSocket> {
    let socket = new_socket(addr, Type::DGRAM, Protocol::UDP, reuse_port)?;
    UdpSocket::from_std(socket.into())
}

/// Keepalive goes on the raw socket before the stream is split between the
/// reader task and the owning loop.
pub(crate) fn apply_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(period);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
