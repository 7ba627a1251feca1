use std::fmt::{Display, Formatter};

/// Crate-wide result alias, used by every fallible public entry point.
pub type CResult<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
///
/// New variants for the replication subsystem sit alongside the storage/mvcc
/// ones rather than introducing a second error type per module.
#[derive(Debug)]
pub enum Error {
    /// An internal, unrecoverable condition (lock poisoning, invariant
    /// violation, wrapped I/O failure with added context).
    Internal(String),

    /// A parse/deserialize failure.
    Parse(String),

    /// A value was rejected by a storage or replication invariant.
    Value(String),

    /// A replication object carried a discriminator the factory doesn't know.
    UnsupportedObject(u8),

    /// The backing stream was stopped (`Stream::set_stop`) while a reader was
    /// blocked in `read_at`. Propagated as a clean termination, not a bug.
    StreamStopped,

    /// The channel to a peer died (failed `send`/`recv`, or `check_alive`
    /// found it dead). The unit of retry is the channel itself.
    ConnectionLost,

    /// A group-complete state machine was asked to do something out of
    /// order (e.g. `complete` on a group id that was never closed).
    GroupCompleteProtocol(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Value(msg) => write!(f, "value error: {}", msg),
            Error::UnsupportedObject(tag) => write!(f, "unsupported replication object tag: {}", tag),
            Error::StreamStopped => write!(f, "stream stopped"),
            Error::ConnectionLost => write!(f, "connection lost"),
            Error::GroupCompleteProtocol(msg) => write!(f, "group complete protocol error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        assert_eq!(
            Error::UnsupportedObject(7).to_string(),
            "unsupported replication object tag: 7"
        );
        assert_eq!(Error::StreamStopped.to_string(), "stream stopped");
    }
}
