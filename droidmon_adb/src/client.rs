use crate::protocol::{read_length_prefixed, read_remainder, read_status, write_command};
use crate::stream::ShellStream;
use crate::{AdbError, Device, parse_device_list};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default ADB server address.
pub const DEFAULT_ADDR: &str = "127.0.0.1:5037";

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for the ADB server's TCP wire protocol.
///
/// The client is connectionless: every operation dials a fresh connection,
/// which is how the ADB protocol is designed to be used. Long-lived
/// connections (shell streams, roster subscriptions) hand the open socket
/// back to the caller.
#[derive(Debug, Clone)]
pub struct Client {
    addr: String,
}

impl Client {
    /// Creates a client targeting `addr`; an empty string selects
    /// [`DEFAULT_ADDR`].
    pub fn new(addr: &str) -> Self {
        let addr = if addr.is_empty() { DEFAULT_ADDR } else { addr };
        Self {
            addr: addr.to_string(),
        }
    }

    /// The server address this client dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> Result<TcpStream, AdbError> {
        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(AdbError::ServerNotRunning(e)),
            Err(_) => Err(AdbError::ServerNotRunning(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "dial timed out",
            ))),
        }
    }

    /// Dials, sends `cmd`, verifies the `OKAY` status, and returns the
    /// still-open connection for the caller to read the response stream.
    pub(crate) async fn raw_command(&self, cmd: &str) -> Result<TcpStream, AdbError> {
        let mut conn = self.dial().await?;
        write_command(&mut conn, cmd).await?;
        read_status(&mut conn, cmd).await?;
        Ok(conn)
    }

    /// Sends a host command and reads the single length-prefixed reply.
    pub async fn command(&self, cmd: &str) -> Result<String, AdbError> {
        let mut conn = self.raw_command(cmd).await?;
        read_length_prefixed(&mut conn).await
    }

    /// Selects the transport for `serial`, then runs `cmd` and captures
    /// the remaining output, trimmed.
    pub async fn device_command(&self, serial: &str, cmd: &str) -> Result<String, AdbError> {
        let mut conn = self.dial().await?;

        let transport = format!("host:transport:{serial}");
        write_command(&mut conn, &transport).await?;
        read_status(&mut conn, &transport).await?;

        write_command(&mut conn, cmd).await?;
        read_status(&mut conn, cmd).await?;

        read_remainder(&mut conn).await
    }

    /// Runs a shell command on the device and returns its trimmed output.
    pub async fn shell(&self, serial: &str, command: &str) -> Result<String, AdbError> {
        self.device_command(serial, &format!("shell:{command}")).await
    }

    /// Reads a system property from the device via `getprop`.
    pub async fn getprop(&self, serial: &str, prop: &str) -> Result<String, AdbError> {
        let out = self.shell(serial, &format!("getprop {prop}")).await?;
        Ok(out.trim().to_string())
    }

    /// Fetches the current device roster (`host:devices-l`).
    pub async fn list_devices(&self) -> Result<Vec<Device>, AdbError> {
        let resp = self.command("host:devices-l").await?;
        Ok(parse_device_list(&resp, now_ms()))
    }

    /// Returns the ADB server version string.
    pub async fn server_version(&self) -> Result<String, AdbError> {
        self.command("host:version").await
    }

    /// Opens the persistent `host:track-devices-l` subscription. The
    /// server pushes a full roster frame on every device change; read
    /// them with [`read_length_prefixed`](crate::read_length_prefixed).
    /// The caller owns the connection and must drop it when done.
    pub async fn track_devices(&self) -> Result<TcpStream, AdbError> {
        let conn = self.raw_command("host:track-devices-l").await?;
        debug!(addr = %self.addr, "track-devices subscription opened");
        Ok(conn)
    }

    /// Opens a long-lived shell command on the device and returns a
    /// line-oriented stream over its stdout (e.g. for tcpdump or logcat).
    ///
    /// The stream is tied to a child of `parent`: cancelling the parent
    /// scope wakes any in-flight read and closes the connection when the
    /// stream is dropped.
    pub async fn open_shell_stream(
        &self,
        serial: &str,
        command: &str,
        parent: &CancellationToken,
    ) -> Result<ShellStream, AdbError> {
        let mut conn = self.dial().await?;

        let transport = format!("host:transport:{serial}");
        write_command(&mut conn, &transport).await?;
        read_status(&mut conn, &transport).await?;

        let shell = format!("shell:{command}");
        write_command(&mut conn, &shell).await?;
        read_status(&mut conn, &shell).await?;

        Ok(ShellStream::new(conn, parent.child_token()))
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
