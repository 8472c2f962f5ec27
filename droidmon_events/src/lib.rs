//! In-process publish/subscribe bus for device lifecycle events.
//!
//! The tracker publishes roster changes here; the application and the
//! device monitor react to them. Publishing is non-blocking: a single
//! bounded queue feeds one dispatcher task that invokes subscribers
//! synchronously, in registration order.

#![warn(missing_docs)]

mod bus;
mod types;

pub use bus::{Bus, Handler, DEFAULT_BUS_CAPACITY};
pub use types::{Event, EventKind};
