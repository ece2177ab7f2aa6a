#![cfg_attr(not(test), no_std)]
//! BrewOS control-board core.
//!
//! Everything safety-relevant on the machine runs through here: the
//! reliable UART link to the bridge, the sensor fault tracking, the
//! safety supervisor that gates each 100 ms tick, the control state
//! machine, and the OTA bootloader. The crate owns no hardware — the
//! board is injected through the [`capabilities::Machine`] traits, which
//! is also what makes the whole core testable on a host.
//!
//! Typical embedding:
//!
//! ```ignore
//! let mut controller = Controller::new(board, profile);
//! loop {
//!     controller.poll(); // drain UART, run due ticks
//! }
//! ```

pub mod bootloader;
pub mod capabilities;
pub mod config;
pub mod control;
pub mod controller;
pub mod dispatch;
pub mod safety;
pub mod sensors;

pub use capabilities::{Machine, MachineProfile};
pub use controller::Controller;
