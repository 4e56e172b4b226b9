//! Crate-wide error type

use crate::ws_state::ChannelKey;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame has no `type` or `event` discriminator")]
    MissingKind,

    #[error("unknown subscription handle {0}")]
    UnknownHandle(u64),

    #[error("no channel {0}")]
    UnknownChannel(ChannelKey),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
