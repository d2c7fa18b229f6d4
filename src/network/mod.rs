//! Transport-facing pieces: the connection object handed to callbacks, the
//! frame codec hook, and listener construction.

mod codec;
mod conn;
pub(crate) mod listener;

pub use codec::{BuiltinCodec, Codec, FixedLengthCodec, LengthFieldCodec};
pub use conn::{Conn, ConnHandle, ConnId};
