//! Per-device network capture: socket-table polling, packet-trace
//! streaming, logcat snooping, and multi-strategy hostname/application
//! resolution.
//!
//! The [`Engine`] orchestrates one device's capture session. It probes
//! the device for a usable tcpdump, falls back to polling the kernel
//! socket tables, and feeds enriched packets and connections into
//! bounded channels for the application to drain.

mod engine;
mod net;
mod procnet;
mod resolver;
mod snooper;
mod trace;
mod types;

pub use engine::{Engine, EngineStats, PROCNET_POLL_INTERVAL};
pub use net::{is_private_ip, is_public_ip_str};
pub use procnet::ProcNetParser;
pub use resolver::Resolver;
pub use snooper::{LogcatSnooper, UrlCapture};
pub use trace::TraceParser;
pub use types::{
    CaptureMode, CaptureStats, ConnState, Connection, NetworkPacket, Protocol, is_http_port,
};
