//! Event-driven TCP/UDP server framework: an acceptor feeds a pool of
//! per-worker event loops over bounded command channels, and user code plugs
//! in through the [`EventHandler`] lifecycle contract.

pub mod handler;
pub mod network;
pub mod service;

pub use handler::{Action, EventHandler, ServerInfo};
pub use network::{BuiltinCodec, Codec, Conn, ConnHandle, ConnId, FixedLengthCodec, LengthFieldCodec};
pub use service::{init_tracing, serve, Options, ServerError, ServerResult};
