//! Control state machine: INIT through BREWING, with SAFE dominating
//! everything.
//!
//! The machine computes intent only. Safety clamping (duty ceiling,
//! safe-state zeroing) happens in the controller after the supervisor,
//! so nothing here can override it.

use heapless::Vec;

use brewos_protocol::message::{HeatingStrategy, Mode};

use crate::capabilities::MachineProfile;
use crate::config::Config;

/// Within this of the setpoint counts as at temperature.
pub const SETPOINT_BAND_DC: i16 = 10;
/// Drop this far below the setpoint and READY degrades back to HEATING.
const READY_LOSS_DC: i16 = 30;

/// Brews shorter than this are not worth reporting.
pub const BREW_REPORT_MIN_MS: u32 = 5_000;
/// Brews at least this long count toward the cleaning reminder.
pub const BREW_COUNTED_MIN_MS: u32 = 15_000;
/// Length of a cleaning flush cycle.
pub const CLEANING_FLUSH_MS: u32 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Init,
    Idle,
    Heating,
    Ready,
    Brewing,
    Fault,
    Safe,
}

impl ControlState {
    /// Wire encoding for the STATUS payload.
    pub fn code(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Idle => 1,
            Self::Heating => 2,
            Self::Ready => 3,
            Self::Brewing => 4,
            Self::Fault => 5,
            Self::Safe => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlOutputs {
    pub brew_duty: u8,
    pub steam_duty: u8,
    pub pump_duty: u8,
    pub solenoid_open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrewEvent {
    Started,
    Finished { duration_ms: u32 },
    CleaningFinished,
}

/// Per-tick inputs, assembled by the controller after the supervisor ran.
pub struct ControlInputs<'a> {
    pub config: &'a Config,
    pub profile: &'a MachineProfile,
    /// Filtered temperatures with the calibration offset applied.
    pub brew_temp_dc: i16,
    pub steam_temp_dc: i16,
    pub lever: bool,
    pub all_sensors_seen: bool,
    /// Safety latch: forces SAFE while true.
    pub safe: bool,
    /// Non-critical fault class (stuck SSR).
    pub fault: bool,
}

pub struct ControlMachine {
    state: ControlState,
    mode: Mode,
    lever_prev: bool,
    brew_started_ms: Option<u32>,
    stop_requested: bool,
    cleaning_until_ms: Option<u32>,
}

impl ControlMachine {
    pub const fn new() -> Self {
        Self {
            state: ControlState::Init,
            mode: Mode::Idle,
            lever_prev: false,
            brew_started_ms: None,
            stop_requested: false,
            cleaning_until_ms: None,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn cleaning(&self) -> bool {
        self.cleaning_until_ms.is_some()
    }

    /// Set by the dispatcher after its own state checks.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Weight-stop edge from the bridge; honored only mid-brew.
    pub fn request_stop(&mut self) -> bool {
        if self.state == ControlState::Brewing {
            self.stop_requested = true;
            true
        } else {
            false
        }
    }

    /// Cleaning may start from READY only.
    pub fn start_cleaning(&mut self, now_ms: u32) -> bool {
        if self.state == ControlState::Ready && self.cleaning_until_ms.is_none() {
            self.cleaning_until_ms = Some(now_ms.wrapping_add(CLEANING_FLUSH_MS));
            true
        } else {
            false
        }
    }

    pub fn step(
        &mut self,
        inputs: &ControlInputs<'_>,
        now_ms: u32,
    ) -> (ControlOutputs, Vec<BrewEvent, 2>) {
        let mut events: Vec<BrewEvent, 2> = Vec::new();
        let lever_rising = inputs.lever && !self.lever_prev;
        let lever_falling = !inputs.lever && self.lever_prev;
        self.lever_prev = inputs.lever;

        // Dominant transitions first.
        if inputs.safe {
            if self.state == ControlState::Brewing {
                self.finish_brew(now_ms, &mut events);
            }
            self.cleaning_until_ms = None;
            self.state = ControlState::Safe;
        } else if self.state == ControlState::Safe {
            // Safety reset succeeded; revalidate from scratch.
            self.state = ControlState::Init;
            self.mode = Mode::Idle;
        } else if inputs.fault && self.state != ControlState::Fault {
            if self.state == ControlState::Brewing {
                self.finish_brew(now_ms, &mut events);
            }
            self.cleaning_until_ms = None;
            self.state = ControlState::Fault;
        }

        match self.state {
            ControlState::Init => {
                if inputs.all_sensors_seen {
                    self.state = ControlState::Idle;
                    log::info!("sensors valid, entering idle");
                }
            }
            ControlState::Idle => {
                if self.mode != Mode::Idle {
                    self.state = ControlState::Heating;
                }
            }
            ControlState::Heating => {
                if self.mode == Mode::Idle {
                    self.state = ControlState::Idle;
                } else if self.at_temperature(inputs) {
                    self.state = ControlState::Ready;
                    log::info!("boilers at setpoint");
                }
            }
            ControlState::Ready => {
                if let Some(until) = self.cleaning_until_ms {
                    if now_ms.wrapping_sub(until) as i32 >= 0 {
                        self.cleaning_until_ms = None;
                        let _ = events.push(BrewEvent::CleaningFinished);
                    }
                }
                if self.mode == Mode::Idle {
                    self.cleaning_until_ms = None;
                    self.state = ControlState::Idle;
                } else if lever_rising && self.cleaning_until_ms.is_none() {
                    self.state = ControlState::Brewing;
                    self.brew_started_ms = Some(now_ms);
                    self.stop_requested = false;
                    let _ = events.push(BrewEvent::Started);
                } else if self.lost_temperature(inputs) {
                    self.state = ControlState::Heating;
                }
            }
            ControlState::Brewing => {
                if lever_falling || self.stop_requested {
                    self.finish_brew(now_ms, &mut events);
                    self.state = ControlState::Ready;
                }
            }
            ControlState::Fault => {
                if !inputs.fault {
                    self.state = ControlState::Idle;
                }
            }
            ControlState::Safe => {}
        }

        (self.outputs(inputs, now_ms), events)
    }

    fn finish_brew(&mut self, now_ms: u32, events: &mut Vec<BrewEvent, 2>) {
        if let Some(started) = self.brew_started_ms.take() {
            let _ = events.push(BrewEvent::Finished {
                duration_ms: now_ms.wrapping_sub(started),
            });
        }
        self.stop_requested = false;
    }

    /// The boilers the current mode needs inside the band.
    fn at_temperature(&self, inputs: &ControlInputs<'_>) -> bool {
        let config = inputs.config;
        let brew_ok = inputs.brew_temp_dc >= config.brew_setpoint_dc - SETPOINT_BAND_DC;
        let steam_ok = inputs.steam_temp_dc >= config.steam_setpoint_dc - SETPOINT_BAND_DC;
        match self.mode {
            Mode::Idle => false,
            Mode::Brew => match config.heating_strategy {
                HeatingStrategy::BrewOnly => brew_ok,
                _ => brew_ok && steam_ok,
            },
            Mode::Steam => steam_ok,
        }
    }

    fn lost_temperature(&self, inputs: &ControlInputs<'_>) -> bool {
        let config = inputs.config;
        match self.mode {
            Mode::Idle => false,
            Mode::Brew => inputs.brew_temp_dc < config.brew_setpoint_dc - READY_LOSS_DC,
            Mode::Steam => inputs.steam_temp_dc < config.steam_setpoint_dc - READY_LOSS_DC,
        }
    }

    fn outputs(&self, inputs: &ControlInputs<'_>, now_ms: u32) -> ControlOutputs {
        let mut out = ControlOutputs::default();
        match self.state {
            ControlState::Heating | ControlState::Ready | ControlState::Brewing => {
                let (brew, steam) = self.heating_duties(inputs);
                out.brew_duty = brew;
                out.steam_duty = steam;
            }
            _ => return out,
        }

        if self.state == ControlState::Brewing {
            out.pump_duty = self.brew_pump_duty(inputs.config, now_ms);
            out.solenoid_open = true;
        } else if self.cleaning_until_ms.is_some() {
            out.pump_duty = 100;
            out.solenoid_open = true;
        }
        out
    }

    fn heating_duties(&self, inputs: &ControlInputs<'_>) -> (u8, u8) {
        let config = inputs.config;
        let mut brew = demand(inputs.brew_temp_dc, config.brew_setpoint_dc);
        let mut steam = demand(inputs.steam_temp_dc, config.steam_setpoint_dc);

        if self.mode == Mode::Idle {
            return (0, 0);
        }

        match config.heating_strategy {
            HeatingStrategy::BrewOnly => steam = 0,
            HeatingStrategy::Sequential => {
                // Brew boiler first; steam waits until brew is in band.
                if inputs.brew_temp_dc < config.brew_setpoint_dc - SETPOINT_BAND_DC {
                    steam = 0;
                }
            }
            HeatingStrategy::Parallel => {}
            HeatingStrategy::SmartStagger => {
                let budget = config.power_budget_w();
                let brew_w = f32::from(brew) / 100.0 * f32::from(inputs.profile.brew_element_w);
                let steam_w = f32::from(steam) / 100.0 * f32::from(inputs.profile.steam_element_w);
                let total = brew_w + steam_w;
                if total > budget && total > 0.0 {
                    let scale = budget / total;
                    brew = (f32::from(brew) * scale) as u8;
                    steam = (f32::from(steam) * scale) as u8;
                }
            }
        }
        (brew, steam)
    }

    fn brew_pump_duty(&self, config: &Config, now_ms: u32) -> u8 {
        let Some(started) = self.brew_started_ms else {
            return 0;
        };
        let pre = &config.preinfusion;
        if !pre.enabled {
            return 100;
        }
        let elapsed = now_ms.wrapping_sub(started);
        if elapsed < u32::from(pre.on_ms) {
            100
        } else if elapsed < u32::from(pre.on_ms) + u32::from(pre.pause_ms) {
            0
        } else {
            100
        }
    }
}

impl Default for ControlMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple two-step demand curve; PID shaping lives outside the core.
fn demand(temp_dc: i16, setpoint_dc: i16) -> u8 {
    if temp_dc < setpoint_dc - SETPOINT_BAND_DC {
        100
    } else if temp_dc < setpoint_dc {
        40
    } else {
        0
    }
}
