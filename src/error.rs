use thiserror::Error;

/// Errors surfaced by the acquisition pipeline and its adapters.
///
/// Each variant maps to a stable machine code (see [`Error::code`]) that is
/// what clients see in HTTP error bodies and realtime `error` messages.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to connect to sensor: {0}")]
    Connect(String),
    #[error("sensor i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("partial decode: {0}")]
    DecodePartial(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("subscriber outbound queue overflow")]
    SubscriberOverflow,
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine code for client-facing error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Connect(_) => "connect_error",
            Error::Io(_) => "io_error",
            Error::DecodePartial(_) => "decode_partial",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::SubscriberOverflow => "subscriber_overflow",
            Error::BadArgument(_) => "bad_argument",
            Error::InvalidFormat(_) => "invalid_format",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidFormat(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
