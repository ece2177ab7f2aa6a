//! Message schemas: one payload struct per message type, with manual
//! little-endian codecs so the wire layout is exactly what the tables in
//! the firmware documentation say it is.
//!
//! Temperatures travel as deci-degrees (i16, 93.0 °C = 930), pressure as
//! centibar (u16, 9.00 bar = 900), PID gains as centi-units (u16,
//! kp 5.00 = 500).

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::frame::MAX_PAYLOAD;

/// Protocol version advertised in the handshake.
pub const PROTOCOL_MAJOR: u8 = 1;
pub const PROTOCOL_MINOR: u8 = 1;

/// An encoded payload.
pub type Payload = Vec<u8, MAX_PAYLOAD>;

/// Every message type on the link. 0x0n/0x1n split is controller-to-bridge
/// versus bridge-to-controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum MsgType {
    Ping = 0x00,
    Status = 0x01,
    Alarm = 0x02,
    Boot = 0x03,
    Ack = 0x04,
    Config = 0x05,
    EnvConfig = 0x08,
    PowerMeter = 0x0B,
    Handshake = 0x0C,
    Nack = 0x0D,
    SetTemp = 0x10,
    SetPid = 0x11,
    Brew = 0x13,
    SetMode = 0x14,
    SetConfig = 0x15,
    GetConfig = 0x16,
    GetEnvConfig = 0x17,
    EnterBootloader = 0x1F,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Ping,
            0x01 => Self::Status,
            0x02 => Self::Alarm,
            0x03 => Self::Boot,
            0x04 => Self::Ack,
            0x05 => Self::Config,
            0x08 => Self::EnvConfig,
            0x0B => Self::PowerMeter,
            0x0C => Self::Handshake,
            0x0D => Self::Nack,
            0x10 => Self::SetTemp,
            0x11 => Self::SetPid,
            0x13 => Self::Brew,
            0x14 => Self::SetMode,
            0x15 => Self::SetConfig,
            0x16 => Self::GetConfig,
            0x17 => Self::GetEnvConfig,
            0x1F => Self::EnterBootloader,
            _ => return None,
        })
    }
}

/// Command disposition carried in ACK/NACK frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    Invalid = 1,
    Rejected = 2,
    Failed = 3,
    Timeout = 4,
    Busy = 5,
    NotReady = 6,
}

impl ResultCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Success,
            1 => Self::Invalid,
            2 => Self::Rejected,
            3 => Self::Failed,
            4 => Self::Timeout,
            5 => Self::Busy,
            6 => Self::NotReady,
            _ => return None,
        })
    }
}

/// Alarm severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum Severity {
    Info = 0,
    Warning = 1,
    Critical = 2,
}

impl Severity {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Info,
            1 => Self::Warning,
            2 => Self::Critical,
            _ => return None,
        })
    }
}

/// Alarm codes, as reported in [`Alarm::code`].
pub mod alarm {
    pub const WATCHDOG_RESET: u16 = 0x01;
    pub const BREW_NTC_OPEN: u16 = 0x02;
    pub const BREW_NTC_SHORT: u16 = 0x03;
    pub const STEAM_NTC_OPEN: u16 = 0x04;
    pub const STEAM_NTC_SHORT: u16 = 0x05;
    pub const BREW_OVER_TEMP: u16 = 0x06;
    pub const STEAM_OVER_TEMP: u16 = 0x07;
    pub const STEAM_LEVEL_LOW: u16 = 0x08;
    pub const NO_RESERVOIR: u16 = 0x09;
    pub const TANK_LOW: u16 = 0x0A;
    pub const GROUP_TC_FAULT: u16 = 0x20;
    pub const POWER_METER_TIMEOUT: u16 = 0x21;
    pub const LINK_TIMEOUT: u16 = 0x22;
    pub const PRESSURE_FAULT: u16 = 0x23;
    pub const BREW_STARTED: u16 = 0x30;
    pub const BREW_COMPLETED: u16 = 0x31;
}

/// Water-level bits in [`Status::water_level`].
pub mod water {
    pub const RESERVOIR_PRESENT: u8 = 1 << 0;
    pub const TANK_OK: u8 = 1 << 1;
    pub const STEAM_OK: u8 = 1 << 2;
}

/// Commanded machine mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum Mode {
    Idle = 0,
    Brew = 1,
    Steam = 2,
}

impl Mode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Idle,
            1 => Self::Brew,
            2 => Self::Steam,
            _ => return None,
        })
    }
}

/// Which boiler a SET_TEMP / SET_PID addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum Boiler {
    Brew = 0,
    Steam = 1,
}

impl Boiler {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Brew,
            1 => Self::Steam,
            _ => return None,
        })
    }
}

/// Brew command actions. Starting a brew over the link is a policy
/// decision of the controller (the lever wins); stop doubles as the
/// weight-stop edge from a connected scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum BrewAction {
    Stop = 0,
    Start = 1,
    Clean = 2,
}

impl BrewAction {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Stop,
            1 => Self::Start,
            2 => Self::Clean,
            _ => return None,
        })
    }
}

/// How the two boilers share the available mains budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HeatingStrategy {
    BrewOnly = 0,
    Sequential = 1,
    Parallel = 2,
    SmartStagger = 3,
}

impl HeatingStrategy {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::BrewOnly,
            1 => Self::Sequential,
            2 => Self::Parallel,
            3 => Self::SmartStagger,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload length {0} does not match schema")]
    Length(usize),
    #[error("field value out of range")]
    Value,
    #[error("unknown message type 0x{0:02X}")]
    UnknownType(u8),
    #[error("unknown config subtype {0}")]
    UnknownSubtype(u8),
}

// Little-endian field readers; callers check lengths first.
fn u16_at(d: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([d[at], d[at + 1]])
}

fn i16_at(d: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([d[at], d[at + 1]])
}

fn u32_at(d: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([d[at], d[at + 1], d[at + 2], d[at + 3]])
}

fn f32_at(d: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([d[at], d[at + 1], d[at + 2], d[at + 3]])
}

fn check_len(d: &[u8], expected: usize) -> Result<(), PayloadError> {
    if d.len() == expected {
        Ok(())
    } else {
        Err(PayloadError::Length(d.len()))
    }
}

// ── Controller → bridge ──

/// Periodic machine status (22 bytes). Extended power telemetry lives in
/// [`PowerMeter`], not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Status {
    pub brew_temp_dc: i16,
    pub steam_temp_dc: i16,
    pub group_temp_dc: i16,
    pub pressure_cb: u16,
    pub brew_setpoint_dc: i16,
    pub steam_setpoint_dc: i16,
    pub brew_duty: u8,
    pub steam_duty: u8,
    pub pump_duty: u8,
    pub state: u8,
    pub safety_flags: u8,
    pub water_level: u8,
    pub uptime_ms: u32,
}

impl Status {
    pub const WIRE_LEN: usize = 22;

    pub fn encode(&self, out: &mut Payload) {
        let _ = out.extend_from_slice(&self.brew_temp_dc.to_le_bytes());
        let _ = out.extend_from_slice(&self.steam_temp_dc.to_le_bytes());
        let _ = out.extend_from_slice(&self.group_temp_dc.to_le_bytes());
        let _ = out.extend_from_slice(&self.pressure_cb.to_le_bytes());
        let _ = out.extend_from_slice(&self.brew_setpoint_dc.to_le_bytes());
        let _ = out.extend_from_slice(&self.steam_setpoint_dc.to_le_bytes());
        let _ = out.push(self.brew_duty);
        let _ = out.push(self.steam_duty);
        let _ = out.push(self.pump_duty);
        let _ = out.push(self.state);
        let _ = out.push(self.safety_flags);
        let _ = out.push(self.water_level);
        let _ = out.extend_from_slice(&self.uptime_ms.to_le_bytes());
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        check_len(d, Self::WIRE_LEN)?;
        Ok(Self {
            brew_temp_dc: i16_at(d, 0),
            steam_temp_dc: i16_at(d, 2),
            group_temp_dc: i16_at(d, 4),
            pressure_cb: u16_at(d, 6),
            brew_setpoint_dc: i16_at(d, 8),
            steam_setpoint_dc: i16_at(d, 10),
            brew_duty: d[12],
            steam_duty: d[13],
            pump_duty: d[14],
            state: d[15],
            safety_flags: d[16],
            water_level: d[17],
            uptime_ms: u32_at(d, 18),
        })
    }
}

/// Alarm edge report (raise and clear both travel as one of these).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Alarm {
    pub code: u16,
    pub severity: Severity,
    pub active: bool,
}

impl Alarm {
    pub const WIRE_LEN: usize = 4;

    pub fn encode(&self, out: &mut Payload) {
        let _ = out.extend_from_slice(&self.code.to_le_bytes());
        let _ = out.push(self.severity as u8);
        let _ = out.push(self.active as u8);
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        check_len(d, Self::WIRE_LEN)?;
        Ok(Self {
            code: u16_at(d, 0),
            severity: Severity::from_u8(d[2]).ok_or(PayloadError::Value)?,
            active: d[3] != 0,
        })
    }
}

/// Announced once at power-up, before anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Boot {
    pub fw_major: u8,
    pub fw_minor: u8,
    pub fw_patch: u8,
    pub machine_type: u8,
    pub pcb_type: u8,
    pub pcb_major: u8,
    pub pcb_minor: u8,
    pub reset_reason: u32,
}

impl Boot {
    pub const WIRE_LEN: usize = 11;

    pub fn encode(&self, out: &mut Payload) {
        let _ = out.push(self.fw_major);
        let _ = out.push(self.fw_minor);
        let _ = out.push(self.fw_patch);
        let _ = out.push(self.machine_type);
        let _ = out.push(self.pcb_type);
        let _ = out.push(self.pcb_major);
        let _ = out.push(self.pcb_minor);
        let _ = out.extend_from_slice(&self.reset_reason.to_le_bytes());
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        check_len(d, Self::WIRE_LEN)?;
        Ok(Self {
            fw_major: d[0],
            fw_minor: d[1],
            fw_patch: d[2],
            machine_type: d[3],
            pcb_type: d[4],
            pcb_major: d[5],
            pcb_minor: d[6],
            reset_reason: u32_at(d, 7),
        })
    }
}

/// Command acknowledgement. The same shape serves ACK and NACK; NACK is
/// the backpressure refusal, ACK carries the handler's result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub cmd_type: u8,
    pub cmd_seq: u8,
    pub result: ResultCode,
}

impl Ack {
    pub const WIRE_LEN: usize = 4;

    pub fn encode(&self, out: &mut Payload) {
        let _ = out.push(self.cmd_type);
        let _ = out.push(self.cmd_seq);
        let _ = out.push(self.result as u8);
        let _ = out.push(0); // reserved
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        check_len(d, Self::WIRE_LEN)?;
        Ok(Self {
            cmd_type: d[0],
            cmd_seq: d[1],
            result: ResultCode::from_u8(d[2]).ok_or(PayloadError::Value)?,
        })
    }
}

/// Configuration snapshot, broadcast at boot and after every accepted
/// config change. Carries the brew-side PID gains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfigSnapshot {
    pub brew_setpoint_dc: i16,
    pub steam_setpoint_dc: i16,
    pub temp_offset_dc: i16,
    pub kp_c: u16,
    pub ki_c: u16,
    pub kd_c: u16,
    pub strategy: HeatingStrategy,
    pub machine_type: u8,
}

impl ConfigSnapshot {
    pub const WIRE_LEN: usize = 15;

    pub fn encode(&self, out: &mut Payload) {
        let _ = out.extend_from_slice(&self.brew_setpoint_dc.to_le_bytes());
        let _ = out.extend_from_slice(&self.steam_setpoint_dc.to_le_bytes());
        let _ = out.extend_from_slice(&self.temp_offset_dc.to_le_bytes());
        let _ = out.extend_from_slice(&self.kp_c.to_le_bytes());
        let _ = out.extend_from_slice(&self.ki_c.to_le_bytes());
        let _ = out.extend_from_slice(&self.kd_c.to_le_bytes());
        let _ = out.push(self.strategy as u8);
        let _ = out.push(self.machine_type);
        let _ = out.push(0); // reserved
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        check_len(d, Self::WIRE_LEN)?;
        Ok(Self {
            brew_setpoint_dc: i16_at(d, 0),
            steam_setpoint_dc: i16_at(d, 2),
            temp_offset_dc: i16_at(d, 4),
            kp_c: u16_at(d, 6),
            ki_c: u16_at(d, 8),
            kd_c: u16_at(d, 10),
            strategy: HeatingStrategy::from_u8(d[12]).ok_or(PayloadError::Value)?,
            machine_type: d[13],
        })
    }
}

/// Environmental limits and the currents derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnvConfig {
    pub nominal_voltage: u16,
    pub max_current_a: f32,
    pub usable_current_a: f32,
    pub brew_element_a: f32,
    pub steam_element_a: f32,
}

impl EnvConfig {
    pub const WIRE_LEN: usize = 18;

    pub fn encode(&self, out: &mut Payload) {
        let _ = out.extend_from_slice(&self.nominal_voltage.to_le_bytes());
        let _ = out.extend_from_slice(&self.max_current_a.to_le_bytes());
        let _ = out.extend_from_slice(&self.usable_current_a.to_le_bytes());
        let _ = out.extend_from_slice(&self.brew_element_a.to_le_bytes());
        let _ = out.extend_from_slice(&self.steam_element_a.to_le_bytes());
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        check_len(d, Self::WIRE_LEN)?;
        Ok(Self {
            nominal_voltage: u16_at(d, 0),
            max_current_a: f32_at(d, 2),
            usable_current_a: f32_at(d, 6),
            brew_element_a: f32_at(d, 10),
            steam_element_a: f32_at(d, 14),
        })
    }
}

/// Extended mains telemetry, sent on its own cadence when a power meter
/// is fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PowerMeter {
    pub voltage_dv: u16,
    pub current_ca: u16,
    pub power_w: u16,
    pub energy_wh: u32,
    pub frequency_dhz: u16,
    pub power_factor_pct: u8,
}

impl PowerMeter {
    pub const WIRE_LEN: usize = 14;

    pub fn encode(&self, out: &mut Payload) {
        let _ = out.extend_from_slice(&self.voltage_dv.to_le_bytes());
        let _ = out.extend_from_slice(&self.current_ca.to_le_bytes());
        let _ = out.extend_from_slice(&self.power_w.to_le_bytes());
        let _ = out.extend_from_slice(&self.energy_wh.to_le_bytes());
        let _ = out.extend_from_slice(&self.frequency_dhz.to_le_bytes());
        let _ = out.push(self.power_factor_pct);
        let _ = out.push(0); // reserved
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        check_len(d, Self::WIRE_LEN)?;
        Ok(Self {
            voltage_dv: u16_at(d, 0),
            current_ca: u16_at(d, 2),
            power_w: u16_at(d, 4),
            energy_wh: u32_at(d, 6),
            frequency_dhz: u16_at(d, 10),
            power_factor_pct: d[12],
        })
    }
}

/// Version/capability exchange, sent by both sides at link-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Handshake {
    pub proto_major: u8,
    pub proto_minor: u8,
    pub capabilities: u8,
    pub max_packet_size: u16,
}

impl Handshake {
    pub const WIRE_LEN: usize = 6;

    pub fn encode(&self, out: &mut Payload) {
        let _ = out.push(self.proto_major);
        let _ = out.push(self.proto_minor);
        let _ = out.push(self.capabilities);
        let _ = out.push(0); // reserved
        let _ = out.extend_from_slice(&self.max_packet_size.to_le_bytes());
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        check_len(d, Self::WIRE_LEN)?;
        Ok(Self {
            proto_major: d[0],
            proto_minor: d[1],
            capabilities: d[2],
            max_packet_size: u16_at(d, 4),
        })
    }
}

// ── Bridge → controller ──

/// Link-liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ping {
    pub timestamp_ms: u32,
}

impl Ping {
    pub const WIRE_LEN: usize = 4;

    pub fn encode(&self, out: &mut Payload) {
        let _ = out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        check_len(d, Self::WIRE_LEN)?;
        Ok(Self {
            timestamp_ms: u32_at(d, 0),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetTemp {
    pub target: Boiler,
    pub temp_dc: i16,
}

impl SetTemp {
    pub const WIRE_LEN: usize = 3;

    pub fn encode(&self, out: &mut Payload) {
        let _ = out.push(self.target as u8);
        let _ = out.extend_from_slice(&self.temp_dc.to_le_bytes());
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        check_len(d, Self::WIRE_LEN)?;
        Ok(Self {
            target: Boiler::from_u8(d[0]).ok_or(PayloadError::Value)?,
            temp_dc: i16_at(d, 1),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetPid {
    pub target: Boiler,
    pub kp_c: u16,
    pub ki_c: u16,
    pub kd_c: u16,
}

impl SetPid {
    pub const WIRE_LEN: usize = 7;

    pub fn encode(&self, out: &mut Payload) {
        let _ = out.push(self.target as u8);
        let _ = out.extend_from_slice(&self.kp_c.to_le_bytes());
        let _ = out.extend_from_slice(&self.ki_c.to_le_bytes());
        let _ = out.extend_from_slice(&self.kd_c.to_le_bytes());
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        check_len(d, Self::WIRE_LEN)?;
        Ok(Self {
            target: Boiler::from_u8(d[0]).ok_or(PayloadError::Value)?,
            kp_c: u16_at(d, 1),
            ki_c: u16_at(d, 3),
            kd_c: u16_at(d, 5),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Brew {
    pub action: BrewAction,
}

impl Brew {
    pub const WIRE_LEN: usize = 1;

    pub fn encode(&self, out: &mut Payload) {
        let _ = out.push(self.action as u8);
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        check_len(d, Self::WIRE_LEN)?;
        Ok(Self {
            action: BrewAction::from_u8(d[0]).ok_or(PayloadError::Value)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetMode {
    pub mode: Mode,
}

impl SetMode {
    pub const WIRE_LEN: usize = 1;

    pub fn encode(&self, out: &mut Payload) {
        let _ = out.push(self.mode as u8);
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        check_len(d, Self::WIRE_LEN)?;
        Ok(Self {
            mode: Mode::from_u8(d[0]).ok_or(PayloadError::Value)?,
        })
    }
}

/// Config-change command: a subtype byte selects the variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetConfig {
    Strategy(HeatingStrategy),
    Preinfusion {
        on_ms: u16,
        pause_ms: u16,
        enabled: bool,
    },
    Environment {
        nominal_voltage: u16,
        max_current_a: f32,
    },
}

impl SetConfig {
    const SUB_STRATEGY: u8 = 0;
    const SUB_PREINFUSION: u8 = 1;
    const SUB_ENVIRONMENT: u8 = 2;

    pub fn encode(&self, out: &mut Payload) {
        match *self {
            Self::Strategy(strategy) => {
                let _ = out.push(Self::SUB_STRATEGY);
                let _ = out.push(strategy as u8);
            }
            Self::Preinfusion {
                on_ms,
                pause_ms,
                enabled,
            } => {
                let _ = out.push(Self::SUB_PREINFUSION);
                let _ = out.extend_from_slice(&on_ms.to_le_bytes());
                let _ = out.extend_from_slice(&pause_ms.to_le_bytes());
                let _ = out.push(enabled as u8);
            }
            Self::Environment {
                nominal_voltage,
                max_current_a,
            } => {
                let _ = out.push(Self::SUB_ENVIRONMENT);
                let _ = out.extend_from_slice(&nominal_voltage.to_le_bytes());
                let _ = out.extend_from_slice(&max_current_a.to_le_bytes());
            }
        }
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        let (&subtype, rest) = d.split_first().ok_or(PayloadError::Length(0))?;
        match subtype {
            Self::SUB_STRATEGY => {
                check_len(rest, 1)?;
                Ok(Self::Strategy(
                    HeatingStrategy::from_u8(rest[0]).ok_or(PayloadError::Value)?,
                ))
            }
            Self::SUB_PREINFUSION => {
                check_len(rest, 5)?;
                Ok(Self::Preinfusion {
                    on_ms: u16_at(rest, 0),
                    pause_ms: u16_at(rest, 2),
                    enabled: rest[4] != 0,
                })
            }
            Self::SUB_ENVIRONMENT => {
                check_len(rest, 6)?;
                Ok(Self::Environment {
                    nominal_voltage: u16_at(rest, 0),
                    max_current_a: f32_at(rest, 2),
                })
            }
            other => Err(PayloadError::UnknownSubtype(other)),
        }
    }
}

/// Switch the controller UART into the OTA bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnterBootloader {
    pub magic: Option<u32>,
}

impl EnterBootloader {
    pub const MAGIC: u32 = 0xFFFF_FFFF;

    pub fn encode(&self, out: &mut Payload) {
        if let Some(magic) = self.magic {
            let _ = out.extend_from_slice(&magic.to_le_bytes());
        }
    }

    pub fn decode(d: &[u8]) -> Result<Self, PayloadError> {
        match d.len() {
            0 => Ok(Self { magic: None }),
            4 => {
                let magic = u32_at(d, 0);
                if magic != Self::MAGIC {
                    return Err(PayloadError::Value);
                }
                Ok(Self { magic: Some(magic) })
            }
            other => Err(PayloadError::Length(other)),
        }
    }
}

/// A fully decoded message: type tag plus typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping(Ping),
    Status(Status),
    Alarm(Alarm),
    Boot(Boot),
    Ack(Ack),
    Config(ConfigSnapshot),
    EnvConfig(EnvConfig),
    PowerMeter(PowerMeter),
    Handshake(Handshake),
    Nack(Ack),
    SetTemp(SetTemp),
    SetPid(SetPid),
    Brew(Brew),
    SetMode(SetMode),
    SetConfig(SetConfig),
    GetConfig,
    GetEnvConfig,
    EnterBootloader(EnterBootloader),
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Ping(_) => MsgType::Ping,
            Self::Status(_) => MsgType::Status,
            Self::Alarm(_) => MsgType::Alarm,
            Self::Boot(_) => MsgType::Boot,
            Self::Ack(_) => MsgType::Ack,
            Self::Config(_) => MsgType::Config,
            Self::EnvConfig(_) => MsgType::EnvConfig,
            Self::PowerMeter(_) => MsgType::PowerMeter,
            Self::Handshake(_) => MsgType::Handshake,
            Self::Nack(_) => MsgType::Nack,
            Self::SetTemp(_) => MsgType::SetTemp,
            Self::SetPid(_) => MsgType::SetPid,
            Self::Brew(_) => MsgType::Brew,
            Self::SetMode(_) => MsgType::SetMode,
            Self::SetConfig(_) => MsgType::SetConfig,
            Self::GetConfig => MsgType::GetConfig,
            Self::GetEnvConfig => MsgType::GetEnvConfig,
            Self::EnterBootloader(_) => MsgType::EnterBootloader,
        }
    }

    /// Decode a payload against the schema for `msg_type`.
    pub fn decode(msg_type: u8, payload: &[u8]) -> Result<Self, PayloadError> {
        let msg_type = MsgType::from_u8(msg_type).ok_or(PayloadError::UnknownType(msg_type))?;
        Ok(match msg_type {
            MsgType::Ping => Self::Ping(Ping::decode(payload)?),
            MsgType::Status => Self::Status(Status::decode(payload)?),
            MsgType::Alarm => Self::Alarm(Alarm::decode(payload)?),
            MsgType::Boot => Self::Boot(Boot::decode(payload)?),
            MsgType::Ack => Self::Ack(Ack::decode(payload)?),
            MsgType::Config => Self::Config(ConfigSnapshot::decode(payload)?),
            MsgType::EnvConfig => Self::EnvConfig(EnvConfig::decode(payload)?),
            MsgType::PowerMeter => Self::PowerMeter(PowerMeter::decode(payload)?),
            MsgType::Handshake => Self::Handshake(Handshake::decode(payload)?),
            MsgType::Nack => Self::Nack(Ack::decode(payload)?),
            MsgType::SetTemp => Self::SetTemp(SetTemp::decode(payload)?),
            MsgType::SetPid => Self::SetPid(SetPid::decode(payload)?),
            MsgType::Brew => Self::Brew(Brew::decode(payload)?),
            MsgType::SetMode => Self::SetMode(SetMode::decode(payload)?),
            MsgType::SetConfig => Self::SetConfig(SetConfig::decode(payload)?),
            MsgType::GetConfig => {
                check_len(payload, 0)?;
                Self::GetConfig
            }
            MsgType::GetEnvConfig => {
                check_len(payload, 0)?;
                Self::GetEnvConfig
            }
            MsgType::EnterBootloader => Self::EnterBootloader(EnterBootloader::decode(payload)?),
        })
    }

    pub fn encode_payload(&self) -> Payload {
        let mut out = Payload::new();
        match self {
            Self::Ping(m) => m.encode(&mut out),
            Self::Status(m) => m.encode(&mut out),
            Self::Alarm(m) => m.encode(&mut out),
            Self::Boot(m) => m.encode(&mut out),
            Self::Ack(m) | Self::Nack(m) => m.encode(&mut out),
            Self::Config(m) => m.encode(&mut out),
            Self::EnvConfig(m) => m.encode(&mut out),
            Self::PowerMeter(m) => m.encode(&mut out),
            Self::Handshake(m) => m.encode(&mut out),
            Self::SetTemp(m) => m.encode(&mut out),
            Self::SetPid(m) => m.encode(&mut out),
            Self::Brew(m) => m.encode(&mut out),
            Self::SetMode(m) => m.encode(&mut out),
            Self::SetConfig(m) => m.encode(&mut out),
            Self::GetConfig | Self::GetEnvConfig => {}
            Self::EnterBootloader(m) => m.encode(&mut out),
        }
        out
    }
}
