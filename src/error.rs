//! Error taxonomy shared by the codec, protocol, server and client.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected bytes on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown command code 0x{0:02x}")]
    UnknownCommand(u8),

    /// Error reported by the remote side (decoded status-500 body).
    #[error("remote error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        path: Option<String>,
    },

    /// Post-transfer validation failed for one item.
    #[error("validation failed for {path}: {reason}")]
    Validation { path: String, reason: String },

    /// Enumeration failed; the item set is incomplete and unsafe to diff.
    #[error("enumeration of {0} failed: {1}")]
    Enumerate(PathBuf, String),

    #[error("connection pool closed")]
    PoolClosed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Numeric code carried in the wire error record.
    pub fn wire_code(&self) -> i32 {
        match self {
            Error::Io(_) => 1,
            Error::Protocol(_) => 2,
            Error::UnknownCommand(_) => 3,
            Error::Remote { code, .. } => *code,
            Error::Validation { .. } => 4,
            Error::Enumerate(..) => 5,
            Error::PoolClosed => 6,
            Error::Config(_) => 7,
        }
    }
}
