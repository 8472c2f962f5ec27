//! The droidmon daemon: device tracking, per-device capture lifecycle,
//! property monitoring, and the typed event fan-out consumed by outer
//! transports.
//!
//! The binary in `main.rs` wires this to the command line and signal
//! handling; everything else (HTTP/SSE routing, UI) lives outside and
//! talks to [`app::App`].

pub mod app;
pub mod hub;
pub mod monitor;
pub mod tracker;
