use thiserror::Error;

/// Errors produced by the ADB wire client.
#[derive(Debug, Error)]
pub enum AdbError {
    /// The ADB server socket could not be reached at all.
    #[error("adb server not running or not reachable: {0}")]
    ServerNotRunning(#[source] std::io::Error),

    /// The peer sent bytes that violate the wire protocol.
    #[error("adb protocol error: {0}")]
    Protocol(String),

    /// The server answered `FAIL` and supplied a message.
    #[error("adb server error for command {command:?}: {message}")]
    Server {
        /// The command that was rejected.
        command: String,
        /// The server's verbatim error message.
        message: String,
    },

    /// A streaming connection ended while more data was expected.
    #[error("connection closed")]
    ConnectionClosed,

    /// The governing cancellation scope fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Any other I/O failure on the socket.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdbError {
    /// Returns `true` if the error is the server refusing a command
    /// (as opposed to a transport or framing failure).
    pub fn is_server_refusal(&self) -> bool {
        matches!(self, AdbError::Server { .. })
    }
}
