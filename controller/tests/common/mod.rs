//! Scripted board simulation for driving the controller on a host.
#![allow(dead_code)]

use std::collections::VecDeque;

use brewos_controller::capabilities::{
    Actuators, Clock, ConfigStore, EventSink, FlashError, Heater, Indicator, MachineProfile,
    OtaFlash, RawSensors, SensorBank, SerialLink, StoreError, SystemCtl,
};
use brewos_controller::config::{Config, EnvLimits};
use brewos_protocol::frame;
use brewos_protocol::message::{Message, MsgType, Severity};
use brewos_protocol::parser::{Event, Parser, RawFrame};

pub const FLASH_CAPACITY: usize = 64 * 1024;

pub struct SimMachine {
    pub now: u32,
    /// Milliseconds that pass per empty UART read (lets blocking
    /// bootloader reads hit their timeouts).
    pub idle_advance: u32,

    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,

    pub sensors: RawSensors,

    pub brew_duty: u8,
    pub steam_duty: u8,
    pub pump_duty: u8,
    pub solenoid: bool,
    pub indicator: Indicator,
    pub beeps: Vec<u8>,
    pub watchdog_kicks: u32,

    pub stored: Option<Vec<u8>>,
    pub store_fail: bool,

    pub alarms: Vec<(u16, Severity, bool)>,
    pub cleared: Vec<u16>,
    pub brews: Vec<u32>,

    pub flash: Vec<u8>,
    pub erased_sectors: Vec<u32>,
    pub reset_called: bool,
}

pub fn nominal_sensors() -> RawSensors {
    RawSensors {
        brew_ntc_c: 93.0,
        steam_ntc_c: 145.0,
        group_tc_c: 88.0,
        pressure_v: 2.3,
        reservoir_present: true,
        tank_ok: true,
        steam_level_ok: true,
        power_w: None,
        lever: false,
    }
}

pub fn profile() -> MachineProfile {
    MachineProfile {
        fw_version: (1, 0, 0),
        machine_type: 1,
        pcb_type: 1,
        pcb_version: (1, 0),
        reset_reason: 0,
        tank_mode: true,
        has_power_meter: false,
        brew_element_w: 1400,
        steam_element_w: 1200,
    }
}

impl SimMachine {
    pub fn new() -> Self {
        Self {
            now: 0,
            idle_advance: 0,
            rx: VecDeque::new(),
            tx: Vec::new(),
            sensors: nominal_sensors(),
            brew_duty: 0,
            steam_duty: 0,
            pump_duty: 0,
            solenoid: false,
            indicator: Indicator::Off,
            beeps: Vec::new(),
            watchdog_kicks: 0,
            stored: None,
            store_fail: false,
            alarms: Vec::new(),
            cleared: Vec::new(),
            brews: Vec::new(),
            flash: vec![0xFF; FLASH_CAPACITY],
            erased_sectors: Vec::new(),
            reset_called: false,
        }
    }

    /// A board whose persisted config already carries valid mains limits.
    pub fn commissioned() -> Self {
        let mut machine = Self::new();
        let mut config = Config::default();
        config.env = EnvLimits {
            nominal_voltage: 230,
            max_current_a: 16.0,
        };
        brewos_controller::config::store(&mut machine, &config).unwrap();
        machine
    }

    pub fn push_frame(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }
}

impl Clock for SimMachine {
    fn now_ms(&self) -> u32 {
        self.now
    }
}

impl SerialLink for SimMachine {
    fn read_byte(&mut self) -> Option<u8> {
        match self.rx.pop_front() {
            Some(byte) => Some(byte),
            None => {
                self.now = self.now.wrapping_add(self.idle_advance);
                None
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        self.tx.extend_from_slice(bytes);
    }
}

impl SensorBank for SimMachine {
    fn sample(&mut self) -> RawSensors {
        self.sensors
    }
}

impl Actuators for SimMachine {
    fn set_heater_duty(&mut self, heater: Heater, duty_pct: u8) {
        match heater {
            Heater::Brew => self.brew_duty = duty_pct,
            Heater::Steam => self.steam_duty = duty_pct,
        }
    }

    fn set_pump(&mut self, duty_pct: u8) {
        self.pump_duty = duty_pct;
    }

    fn set_solenoid(&mut self, open: bool) {
        self.solenoid = open;
    }

    fn set_indicator(&mut self, pattern: Indicator) {
        self.indicator = pattern;
    }

    fn beep(&mut self, count: u8) {
        self.beeps.push(count);
    }

    fn kick_watchdog(&mut self) {
        self.watchdog_kicks += 1;
    }
}

impl ConfigStore for SimMachine {
    fn load(&mut self, buf: &mut [u8]) -> Option<usize> {
        let blob = self.stored.as_ref()?;
        buf[..blob.len()].copy_from_slice(blob);
        Some(blob.len())
    }

    fn store(&mut self, blob: &[u8]) -> Result<(), StoreError> {
        if self.store_fail {
            return Err(StoreError);
        }
        self.stored = Some(blob.to_vec());
        Ok(())
    }
}

impl EventSink for SimMachine {
    fn alarm_raised(&mut self, code: u16, severity: Severity) {
        self.alarms.push((code, severity, true));
    }

    fn alarm_cleared(&mut self, code: u16) {
        self.cleared.push(code);
    }

    fn brew_cycle(&mut self, duration_ms: u32) {
        self.brews.push(duration_ms);
    }
}

impl OtaFlash for SimMachine {
    fn capacity(&self) -> u32 {
        FLASH_CAPACITY as u32
    }

    fn erase_sector(&mut self, offset: u32) -> Result<(), FlashError> {
        if offset as usize + 4096 > FLASH_CAPACITY {
            return Err(FlashError::OutOfBounds);
        }
        self.erased_sectors.push(offset);
        self.flash[offset as usize..offset as usize + 4096].fill(0xFF);
        Ok(())
    }

    fn write_page(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if offset as usize + data.len() > FLASH_CAPACITY {
            return Err(FlashError::OutOfBounds);
        }
        self.flash[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        if offset as usize + buf.len() > FLASH_CAPACITY {
            return Err(FlashError::OutOfBounds);
        }
        buf.copy_from_slice(&self.flash[offset as usize..offset as usize + buf.len()]);
        Ok(())
    }
}

impl SystemCtl for SimMachine {
    fn reset(&mut self) {
        self.reset_called = true;
    }
}

/// Bridge-side frame builder with its own sequence counter.
pub struct BridgeSim {
    seq: u8,
}

impl BridgeSim {
    pub fn new() -> Self {
        Self { seq: 0 }
    }

    pub fn frame(&mut self, msg: &Message) -> Vec<u8> {
        let payload = msg.encode_payload();
        let frame = frame::encode(msg.msg_type() as u8, self.seq, &payload).unwrap();
        self.seq = self.seq.wrapping_add(1);
        frame.to_vec()
    }

    /// A frame with a raw (possibly schema-invalid) payload.
    pub fn raw_frame(&mut self, msg_type: u8, payload: &[u8]) -> Vec<u8> {
        let frame = frame::encode(msg_type, self.seq, payload).unwrap();
        self.seq = self.seq.wrapping_add(1);
        frame.to_vec()
    }

    pub fn last_seq(&self) -> u8 {
        self.seq.wrapping_sub(1)
    }
}

/// Parse everything the controller wrote into frames (non-frame bytes,
/// e.g. bootloader replies, are skipped by the parser).
pub fn parse_tx(bytes: &[u8]) -> Vec<RawFrame> {
    let mut parser = Parser::new();
    let mut frames = Vec::new();
    for &byte in bytes {
        if let Some(Event::Frame(frame)) = parser.push(byte, 0) {
            frames.push(frame);
        }
    }
    frames
}

pub fn frames_of_type(frames: &[RawFrame], msg_type: MsgType) -> Vec<RawFrame> {
    frames
        .iter()
        .filter(|f| f.msg_type == msg_type as u8)
        .cloned()
        .collect()
}
