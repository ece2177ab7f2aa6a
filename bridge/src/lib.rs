//! BrewOS bridge-side link layer.
//!
//! The bridge owns the serial port to the controller and exposes three
//! things to the rest of the connectivity firmware: a command handle
//! with reliable (retried, acknowledged) delivery, a stream of decoded
//! telemetry events, and the link diagnostics counters.

pub mod link;
pub mod ota;
pub mod telemetry;

pub use link::{Link, LinkEvent, LinkHandle};
