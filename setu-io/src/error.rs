//! Error types for SetuIO

use std::time::Duration;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// SetuIO error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("Config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML write error
    #[error("Config write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No heartbeat seen while opening the link
    #[error("No heartbeat received within {0:?}")]
    HandshakeTimeout(Duration),

    /// Operation needs an open serial link
    #[error("Not connected")]
    NotConnected,

    /// connect() called on a live session
    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    /// Output id collision on add
    #[error("Output '{0}' already exists")]
    DuplicateOutput(String),

    /// Unknown output id
    #[error("Output '{0}' not found")]
    OutputNotFound(String),

    /// Output type outside tcp_server / tcp_client / udp
    #[error("Unsupported output type: {0}")]
    UnsupportedOutput(String),

    /// start() on a running output
    #[error("Output '{0}' is already running")]
    AlreadyRunning(String),

    /// stop() or send() on a stopped output
    #[error("Output '{0}' is not running")]
    NotRunning(String),

    /// Listener bind collided with another socket
    #[error("Address {0} is already in use")]
    AddrInUse(String),

    /// Remote end refused the connection
    #[error("Connection refused by {0}")]
    ConnectionRefused(String),

    /// Remote end did not answer in time
    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    /// No PARAM_VALUE echo within the per-call timeout
    #[error("Parameter '{0}' timed out")]
    ParamTimeout(String),

    /// Another caller is already waiting on this parameter
    #[error("Parameter '{0}' already has a request in flight")]
    ParamBusy(String),

    /// Parameter id does not fit the 16-byte wire field
    #[error("Invalid parameter name: {0}")]
    InvalidParamName(String),

    /// Outgoing message could not be serialized
    #[error("Frame encode error: {0}")]
    Encode(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify a socket-level failure for operator-facing messages.
    ///
    /// `target` is the address the socket was binding to or connecting to.
    pub fn from_socket(err: std::io::Error, target: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => Error::AddrInUse(target.to_string()),
            std::io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(target.to_string()),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Error::ConnectTimeout(target.to_string())
            }
            _ => Error::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_socket_errors_are_classified() {
        let e = Error::from_socket(IoError::from(ErrorKind::ConnectionRefused), "10.0.0.1:14550");
        assert!(matches!(e, Error::ConnectionRefused(ref t) if t == "10.0.0.1:14550"));

        let e = Error::from_socket(IoError::from(ErrorKind::AddrInUse), "0.0.0.0:5760");
        assert_eq!(e.to_string(), "Address 0.0.0.0:5760 is already in use");

        let e = Error::from_socket(IoError::from(ErrorKind::TimedOut), "host:1");
        assert!(matches!(e, Error::ConnectTimeout(_)));

        let e = Error::from_socket(IoError::from(ErrorKind::PermissionDenied), "host:1");
        assert!(matches!(e, Error::Io(_)));
    }
}
