//! Safety supervisor: evaluates every invariant at the top of each tick,
//! before the control step and before the watchdog kick.
//!
//! Any CRITICAL condition latches `safe_state`; while it holds, the
//! controller forces every heater and pump output to zero no matter what
//! the control machine wants. Leaving safe state takes all critical
//! flags clear (over-temperature with 10 K of hysteresis) plus an
//! explicit [`SafetySupervisor::safety_reset`] call.

use heapless::Vec;

use brewos_protocol::message::{alarm, Severity};

use crate::sensors::{AnalogKind, SensorEvent, SensorTracker};

pub const BREW_MAX_C: f32 = 130.0;
pub const STEAM_MAX_C: f32 = 165.0;
pub const GROUP_MAX_C: f32 = 110.0;
/// Trip clears only this far below the limit.
pub const OVER_TEMP_HYST_C: f32 = 10.0;

/// An SSR continuously on this long with no temperature movement is
/// assumed stuck or unloaded.
pub const SSR_MAX_ON_MS: u32 = 60_000;
const SSR_TEMP_DELTA_C: f32 = 1.0;

/// Peer silence before COMM_TIMEOUT (standalone operation continues).
pub const HEARTBEAT_TIMEOUT_MS: u32 = 5_000;

/// Heater duty ceiling while an SSR fault is latched.
pub const MAX_HEATER_DUTY: u8 = 95;

/// Safety flag bits, as carried in the STATUS payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafetyFlags(u8);

impl SafetyFlags {
    pub const OVER_TEMP: u8 = 1 << 0;
    pub const WATER_LOW: u8 = 1 << 1;
    pub const SENSOR_FAULT: u8 = 1 << 2;
    pub const SSR_FAULT: u8 = 1 << 3;
    pub const COMM_TIMEOUT: u8 = 1 << 4;
    pub const ENV_CONFIG_INVALID: u8 = 1 << 5;

    const CRITICAL: u8 =
        Self::OVER_TEMP | Self::WATER_LOW | Self::SENSOR_FAULT | Self::ENV_CONFIG_INVALID;

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, mask: u8) -> bool {
        self.0 & mask != 0
    }

    pub fn any_critical(self) -> bool {
        self.0 & Self::CRITICAL != 0
    }

    fn assign(&mut self, mask: u8, on: bool) {
        if on {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }
}

/// Condition classes, worst first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SafetyClass {
    Warning,
    Fault,
    Critical,
}

/// An alarm transition to report over the link and to the event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmEdge {
    pub code: u16,
    pub severity: Severity,
    pub active: bool,
}

/// Everything the supervisor reads for one tick.
pub struct SafetyInputs<'a> {
    pub sensors: &'a SensorTracker,
    pub events: &'a [SensorEvent],
    pub env_valid: bool,
    pub tank_mode: bool,
    /// Milliseconds since the last frame from the bridge (or since boot).
    pub last_rx_age_ms: u32,
    /// Heater duties applied on the previous tick.
    pub brew_duty: u8,
    pub steam_duty: u8,
}

#[derive(Debug, Clone, Copy, Default)]
struct SsrMonitor {
    on_since_ms: Option<u32>,
    temp_at_on: f32,
    tripped: bool,
}

impl SsrMonitor {
    fn update(&mut self, duty: u8, temp_c: f32, now_ms: u32) {
        if duty == 0 {
            self.on_since_ms = None;
            self.tripped = false;
            return;
        }
        match self.on_since_ms {
            None => {
                self.on_since_ms = Some(now_ms);
                self.temp_at_on = temp_c;
            }
            Some(since) => {
                let moved = temp_c > self.temp_at_on + SSR_TEMP_DELTA_C
                    || temp_c < self.temp_at_on - SSR_TEMP_DELTA_C;
                if moved {
                    // Heat is arriving; restart the stuck-detection window.
                    self.on_since_ms = Some(now_ms);
                    self.temp_at_on = temp_c;
                } else if now_ms.wrapping_sub(since) >= SSR_MAX_ON_MS {
                    self.tripped = true;
                }
            }
        }
    }
}

pub struct SafetySupervisor {
    flags: SafetyFlags,
    safe_state: bool,
    brew_hot: bool,
    steam_hot: bool,
    group_hot: bool,
    brew_ssr: SsrMonitor,
    steam_ssr: SsrMonitor,
    active_alarms: Vec<(u16, Severity), 16>,
}

/// Trip latch with hysteresis: sets above `limit`, clears at or below
/// `limit - OVER_TEMP_HYST_C`, holds in between.
fn over_temp_latch(current: bool, temp: f32, limit: f32) -> bool {
    if temp > limit {
        true
    } else if temp <= limit - OVER_TEMP_HYST_C {
        false
    } else {
        current
    }
}

impl SafetySupervisor {
    pub const fn new() -> Self {
        Self {
            flags: SafetyFlags(0),
            safe_state: false,
            brew_hot: false,
            steam_hot: false,
            group_hot: false,
            brew_ssr: SsrMonitor {
                on_since_ms: None,
                temp_at_on: 0.0,
                tripped: false,
            },
            steam_ssr: SsrMonitor {
                on_since_ms: None,
                temp_at_on: 0.0,
                tripped: false,
            },
            active_alarms: Vec::new(),
        }
    }

    pub fn flags(&self) -> SafetyFlags {
        self.flags
    }

    pub fn is_safe(&self) -> bool {
        self.safe_state
    }

    /// True while an SSR fault (non-critical class) is present.
    pub fn fault_active(&self) -> bool {
        self.flags.contains(SafetyFlags::SSR_FAULT)
    }

    pub fn class(&self) -> Option<SafetyClass> {
        if self.flags.any_critical() {
            Some(SafetyClass::Critical)
        } else if self.flags.contains(SafetyFlags::SSR_FAULT) {
            Some(SafetyClass::Fault)
        } else if self.flags.contains(SafetyFlags::COMM_TIMEOUT) {
            Some(SafetyClass::Warning)
        } else {
            None
        }
    }

    /// Pure predicate: clears `safe_state` iff every critical flag has
    /// already cleared (hysteresis included, since the flags carry it).
    pub fn safety_reset(&mut self) -> bool {
        if self.flags.any_critical() {
            return false;
        }
        self.safe_state = false;
        true
    }

    /// Evaluate all invariants. Returns the alarm edges this tick
    /// produced and whether safe state was entered.
    pub fn evaluate(
        &mut self,
        inputs: &SafetyInputs<'_>,
        now_ms: u32,
    ) -> (Vec<AlarmEdge, 16>, bool) {
        let mut edges = Vec::new();
        let sensors = inputs.sensors;

        // Over-temperature latches run on the raw (last valid) readings,
        // so one extreme sample trips before the filter catches up.
        if sensors.brew.has_sample() {
            self.brew_hot = over_temp_latch(self.brew_hot, sensors.brew.raw_value(), BREW_MAX_C);
        }
        if sensors.steam.has_sample() {
            self.steam_hot =
                over_temp_latch(self.steam_hot, sensors.steam.raw_value(), STEAM_MAX_C);
        }
        if sensors.group.has_sample() {
            self.group_hot =
                over_temp_latch(self.group_hot, sensors.group.raw_value(), GROUP_MAX_C);
        }

        // Stuck-SSR monitors run on the duties applied last tick.
        self.brew_ssr
            .update(inputs.brew_duty, sensors.brew.raw_value(), now_ms);
        self.steam_ssr
            .update(inputs.steam_duty, sensors.steam.raw_value(), now_ms);

        let water_low =
            inputs.tank_mode && sensors.reservoir.has_sample() && !sensors.reservoir.state();
        let comm_lost = inputs.last_rx_age_ms >= HEARTBEAT_TIMEOUT_MS;

        self.flags.assign(
            SafetyFlags::OVER_TEMP,
            self.brew_hot || self.steam_hot || self.group_hot,
        );
        self.flags.assign(SafetyFlags::WATER_LOW, water_low);
        self.flags
            .assign(SafetyFlags::SENSOR_FAULT, sensors.critical_fault());
        self.flags.assign(
            SafetyFlags::SSR_FAULT,
            self.brew_ssr.tripped || self.steam_ssr.tripped,
        );
        self.flags.assign(SafetyFlags::COMM_TIMEOUT, comm_lost);
        self.flags
            .assign(SafetyFlags::ENV_CONFIG_INVALID, !inputs.env_valid);

        // Level- and edge-driven alarms.
        self.set_alarm(
            alarm::BREW_OVER_TEMP,
            Severity::Critical,
            self.brew_hot || self.group_hot,
            &mut edges,
        );
        self.set_alarm(
            alarm::STEAM_OVER_TEMP,
            Severity::Critical,
            self.steam_hot,
            &mut edges,
        );
        self.set_alarm(alarm::NO_RESERVOIR, Severity::Critical, water_low, &mut edges);
        self.set_alarm(
            alarm::TANK_LOW,
            Severity::Warning,
            sensors.tank.has_sample() && !sensors.tank.state(),
            &mut edges,
        );
        self.set_alarm(
            alarm::STEAM_LEVEL_LOW,
            Severity::Warning,
            sensors.steam_level.has_sample() && !sensors.steam_level.state(),
            &mut edges,
        );
        self.set_alarm(alarm::LINK_TIMEOUT, Severity::Warning, comm_lost, &mut edges);
        self.set_alarm(
            alarm::POWER_METER_TIMEOUT,
            Severity::Warning,
            sensors.power_stale(),
            &mut edges,
        );

        for event in inputs.events {
            match *event {
                SensorEvent::FaultLatched { kind, high } => {
                    let (code, severity) = fault_alarm(kind, high);
                    self.set_alarm(code, severity, true, &mut edges);
                }
                SensorEvent::Recovered { kind } => {
                    // Clear whichever direction had latched.
                    let (open, _) = fault_alarm(kind, false);
                    let (short, severity) = fault_alarm(kind, true);
                    self.set_alarm(open, severity, false, &mut edges);
                    self.set_alarm(short, severity, false, &mut edges);
                }
                // Level and power-meter alarms are level-driven above.
                SensorEvent::LevelChanged { .. }
                | SensorEvent::PowerMeterStale
                | SensorEvent::PowerMeterRecovered => {}
            }
        }

        let entered_safe = if self.flags.any_critical() && !self.safe_state {
            self.safe_state = true;
            log::error!("entering safe state, flags 0x{:02X}", self.flags.bits());
            true
        } else {
            false
        };

        (edges, entered_safe)
    }

    fn set_alarm(
        &mut self,
        code: u16,
        severity: Severity,
        active: bool,
        edges: &mut Vec<AlarmEdge, 16>,
    ) {
        let known = self.active_alarms.iter().position(|(c, _)| *c == code);
        match (known, active) {
            (None, true) => {
                let _ = self.active_alarms.push((code, severity));
                let _ = edges.push(AlarmEdge {
                    code,
                    severity,
                    active: true,
                });
            }
            (Some(at), false) => {
                self.active_alarms.remove(at);
                let _ = edges.push(AlarmEdge {
                    code,
                    severity,
                    active: false,
                });
            }
            _ => {}
        }
    }
}

impl Default for SafetySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Alarm code and severity for a latched analog-sensor fault.
fn fault_alarm(kind: AnalogKind, high: bool) -> (u16, Severity) {
    match (kind, high) {
        (AnalogKind::BrewNtc, false) => (alarm::BREW_NTC_OPEN, Severity::Critical),
        (AnalogKind::BrewNtc, true) => (alarm::BREW_NTC_SHORT, Severity::Critical),
        (AnalogKind::SteamNtc, false) => (alarm::STEAM_NTC_OPEN, Severity::Critical),
        (AnalogKind::SteamNtc, true) => (alarm::STEAM_NTC_SHORT, Severity::Critical),
        (AnalogKind::GroupTc, _) => (alarm::GROUP_TC_FAULT, Severity::Warning),
        (AnalogKind::Pressure, _) => (alarm::PRESSURE_FAULT, Severity::Critical),
    }
}
