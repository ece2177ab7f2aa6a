//! Capabilities the control core consumes but does not own.
//!
//! The core is hardware-free: clocks, UART bytes, sensors, actuators,
//! persistence, events, and OTA flash all arrive through these traits.
//! Firmware implements them against the real board; the test suite
//! implements them against a scripted simulation.

use brewos_protocol::message::Severity;

/// Monotonic milliseconds since boot. Wraps after ~49 days; all interval
/// arithmetic uses `wrapping_sub`.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// The UART to the bridge board. Reads are non-blocking (the interrupt
/// ring buffer is behind this), writes are fire-and-forget.
pub trait SerialLink {
    fn read_byte(&mut self) -> Option<u8>;
    fn write(&mut self, bytes: &[u8]);
}

/// One raw sample of every input, taken at the top of each tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSensors {
    pub brew_ntc_c: f32,
    pub steam_ntc_c: f32,
    pub group_tc_c: f32,
    /// Pressure transducer output voltage.
    pub pressure_v: f32,
    pub reservoir_present: bool,
    pub tank_ok: bool,
    pub steam_level_ok: bool,
    /// Mains power draw, when a power meter is fitted.
    pub power_w: Option<f32>,
    pub lever: bool,
}

pub trait SensorBank {
    fn sample(&mut self) -> RawSensors;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heater {
    Brew,
    Steam,
}

/// Status LED patterns. Safe state blinks at 2 Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Off,
    Solid,
    Blink2Hz,
}

pub trait Actuators {
    fn set_heater_duty(&mut self, heater: Heater, duty_pct: u8);
    fn set_pump(&mut self, duty_pct: u8);
    fn set_solenoid(&mut self, open: bool);
    fn set_indicator(&mut self, pattern: Indicator);
    fn beep(&mut self, count: u8);
    /// The 2 s hardware watchdog; kicked once per tick, after the safety
    /// supervisor has run.
    fn kick_watchdog(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("persistence sink rejected the write")]
pub struct StoreError;

/// Persistence sink for the configuration blob. Synchronous: `store`
/// returns only once the blob is durable (or has failed).
pub trait ConfigStore {
    /// Read the stored blob into `buf`; `None` when nothing is stored.
    fn load(&mut self, buf: &mut [u8]) -> Option<usize>;
    fn store(&mut self, blob: &[u8]) -> Result<(), StoreError>;
}

/// Subscriber for alarms and brew-cycle reports (display, statistics).
pub trait EventSink {
    fn alarm_raised(&mut self, code: u16, severity: Severity);
    fn alarm_cleared(&mut self, code: u16);
    fn brew_cycle(&mut self, duration_ms: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlashError {
    #[error("erase failed")]
    Erase,
    #[error("write failed")]
    Write,
    #[error("access outside the reserved image region")]
    OutOfBounds,
}

/// The flash region reserved for a staged OTA image. Offsets are
/// relative to the region base; nothing outside it is reachable.
pub trait OtaFlash {
    fn capacity(&self) -> u32;
    fn erase_sector(&mut self, offset: u32) -> Result<(), FlashError>;
    fn write_page(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;
}

/// Reset into the freshly staged image.
pub trait SystemCtl {
    fn reset(&mut self);
}

/// Everything the controller needs from the board, in one bound. The
/// bootloader borrows the whole machine mutably for its session, which
/// is what makes its UART ownership exclusive.
pub trait Machine:
    Clock + SerialLink + SensorBank + Actuators + ConfigStore + EventSink + OtaFlash + SystemCtl
{
}

impl<T> Machine for T where
    T: Clock + SerialLink + SensorBank + Actuators + ConfigStore + EventSink + OtaFlash + SystemCtl
{
}

/// Fixed per-board identity, baked into the firmware build.
#[derive(Debug, Clone, Copy)]
pub struct MachineProfile {
    pub fw_version: (u8, u8, u8),
    pub machine_type: u8,
    pub pcb_type: u8,
    pub pcb_version: (u8, u8),
    pub reset_reason: u32,
    /// Draws from a removable reservoir (as opposed to plumbed-in).
    pub tank_mode: bool,
    pub has_power_meter: bool,
    pub brew_element_w: u16,
    pub steam_element_w: u16,
}
