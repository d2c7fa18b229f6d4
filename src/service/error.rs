use std::io;

pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Sentinel carried on the command channel to drain the event loops.
    /// `serve` maps it back to a clean exit.
    #[error("server is closing")]
    Closing,

    #[error("invalid listen address: {0}")]
    InvalidAddr(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("accept error: {0}")]
    Accept(String),

    #[error("channel send error: {0}")]
    ChannelSend(String),

    #[error("codec error: {0}")]
    Codec(String),

    /// Marker used by frame checks that ran out of buffered bytes.
    #[error("incomplete frame")]
    Incomplete,
}
