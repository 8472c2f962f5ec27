//! The `droidmon_adb` crate speaks the ADB server's wire protocol over a
//! local TCP connection. It provides single-shot host commands,
//! device-targeted shell commands, long-lived shell streams (for tcpdump
//! and logcat), and the persistent `track-devices` subscription used by
//! the device tracker.
//!
//! A request is a 4-digit lower-case hex length prefix followed by the
//! payload. Responses start with a 4-byte `OKAY` or `FAIL` status; `FAIL`
//! carries a length-prefixed error message from the server.

#![warn(missing_docs)]

mod client;
mod device;
mod errors;
mod protocol;
mod stream;

pub use client::{Client, DEFAULT_ADDR};
pub use device::{Device, DeviceState, parse_device_list};
pub use errors::AdbError;
pub use protocol::{encode_command, read_length_prefixed, read_status};
pub use stream::ShellStream;
