use crate::AdbError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// A persistent, line-oriented shell stream (the stdout of a long-lived
/// device-side command such as tcpdump or logcat).
///
/// Reads race against the governing cancellation token, so a cancelled
/// scope never leaves a consumer blocked on the socket. Dropping the
/// stream closes the underlying connection.
pub struct ShellStream {
    reader: BufReader<TcpStream>,
    token: CancellationToken,
}

impl ShellStream {
    pub(crate) fn new(conn: TcpStream, token: CancellationToken) -> Self {
        Self {
            reader: BufReader::with_capacity(64 * 1024, conn),
            token,
        }
    }

    /// Reads the next output line, without its trailing newline.
    ///
    /// Returns `Ok(None)` when the device side closes the stream, and
    /// [`AdbError::Cancelled`] when the governing scope is cancelled.
    pub async fn next_line(&mut self) -> Result<Option<String>, AdbError> {
        let mut line = String::new();
        tokio::select! {
            _ = self.token.cancelled() => Err(AdbError::Cancelled),
            read = self.reader.read_line(&mut line) => match read {
                Ok(0) => Ok(None),
                Ok(_) => {
                    while line.ends_with('\n') || line.ends_with('\r') {
                        line.pop();
                    }
                    Ok(Some(line))
                }
                Err(e) => Err(AdbError::Io(e)),
            },
        }
    }

    /// Cancels this stream's scope, waking any in-flight read.
    pub fn close(&self) {
        self.token.cancel();
    }
}
