//! The controller main object: inbound drain, the 100 ms tick, and the
//! outbound cadences.
//!
//! Ordering inside one tick is fixed: queued commands, sensor update,
//! safety supervisor, watchdog kick, control step, actuator writes,
//! outbound traffic. The inbound drain never mutates safety-relevant
//! state directly — commands park in a bounded queue until the tick.

use heapless::Deque;

use brewos_protocol::frame;
use brewos_protocol::link::{LinkEngine, LinkStats, RetryAction, SeqVerdict};
use brewos_protocol::message::{
    alarm, water, Ack, Alarm, Boot, Handshake, Message, MsgType, Ping, PowerMeter, ResultCode,
    Severity, Status,
};
use brewos_protocol::parser::{Event, Parser, RawFrame};

use crate::bootloader;
use crate::capabilities::{Heater, Indicator, Machine, MachineProfile};
use crate::config::{self, Config};
use crate::control::{
    BrewEvent, ControlInputs, ControlMachine, ControlState, BREW_COUNTED_MIN_MS,
    BREW_REPORT_MIN_MS,
};
use crate::dispatch;
use crate::safety::{AlarmEdge, SafetyInputs, SafetySupervisor, MAX_HEATER_DUTY};
use crate::sensors::SensorTracker;

/// Control tick period; the serialization point for all mutation.
pub const TICK_MS: u32 = 100;
pub const STATUS_PERIOD_MS: u32 = 500;
pub const POWER_METER_PERIOD_MS: u32 = 1_000;
/// RX silence before the controller probes the bridge.
pub const PING_SILENCE_MS: u32 = 5_000;

/// Inbound command queue depth.
pub const COMMAND_QUEUE_DEPTH: usize = 4;
/// Arrivals at or past this depth are refused with NACK BUSY.
pub const BACKPRESSURE_THRESHOLD: usize = 3;

pub struct Controller<M: Machine> {
    machine: M,
    profile: MachineProfile,
    config: Config,

    link: LinkEngine,
    parser: Parser,
    queue: Deque<RawFrame, COMMAND_QUEUE_DEPTH>,
    last_ack: Option<Ack>,

    sensors: SensorTracker,
    safety: SafetySupervisor,
    control: ControlMachine,

    started: bool,
    boot_ms: u32,
    last_tick_ms: u32,
    last_status_ms: u32,
    last_power_ms: u32,
    last_rx_ms: Option<u32>,
    last_ping_ms: u32,

    applied_brew_duty: u8,
    applied_steam_duty: u8,
    applied_pump_duty: u8,
    indicator: Indicator,
    energy_wh: f32,

    emit_config: bool,
    emit_env: bool,
    /// A bootloader command is queued; the drain must not consume the
    /// chunk stream that may already be behind it.
    bootloader_queued: bool,
    enter_bootloader: bool,
}

impl<M: Machine> Controller<M> {
    /// Build the controller around its board, loading the persisted
    /// configuration (or defaults) from the injected sink.
    pub fn new(mut machine: M, profile: MachineProfile) -> Self {
        let config = config::load(&mut machine);
        Self {
            machine,
            profile,
            config,
            link: LinkEngine::new(),
            parser: Parser::new(),
            queue: Deque::new(),
            last_ack: None,
            sensors: SensorTracker::new(),
            safety: SafetySupervisor::new(),
            control: ControlMachine::new(),
            started: false,
            boot_ms: 0,
            last_tick_ms: 0,
            last_status_ms: 0,
            last_power_ms: 0,
            last_rx_ms: None,
            last_ping_ms: 0,
            applied_brew_duty: 0,
            applied_steam_duty: 0,
            applied_pump_duty: 0,
            indicator: Indicator::Off,
            energy_wh: 0.0,
            emit_config: false,
            emit_env: false,
            bootloader_queued: false,
            enter_bootloader: false,
        }
    }

    pub fn state(&self) -> ControlState {
        self.control.state()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn link_stats(&self) -> &LinkStats {
        self.link.stats()
    }

    pub fn reset_link_stats(&mut self) {
        self.link.stats_mut().reset();
    }

    pub fn safety_flags(&self) -> u8 {
        self.safety.flags().bits()
    }

    /// Explicit safe-state reset; pure predicate per the safety design.
    pub fn safety_reset(&mut self) -> bool {
        self.safety.safety_reset()
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    /// Main-loop entry point. Drains the UART, services retries, runs a
    /// tick when one is due, and hands the UART to the bootloader when a
    /// session was ACKed.
    pub fn poll(&mut self) {
        let now = self.machine.now_ms();
        if !self.started {
            self.started = true;
            self.boot_ms = now;
            self.last_tick_ms = now;
            self.last_status_ms = now;
            self.last_power_ms = now;
            self.last_ping_ms = now;
            self.announce_boot();
        }

        self.drain(now);
        if let Some(Event::Timeout) = self.parser.check_timeout(now) {
            self.link.stats_mut().parser_timeouts += 1;
            log::warn!("parser watchdog reset");
        }
        while let Some(action) = self.link.poll_retry(now) {
            match action {
                RetryAction::Retransmit { frame, .. } => self.machine.write(&frame),
                RetryAction::GiveUp { msg_type, seq } => {
                    log::warn!("command 0x{msg_type:02X} seq {seq} timed out");
                }
            }
        }

        if now.wrapping_sub(self.last_tick_ms) >= TICK_MS {
            self.last_tick_ms = now;
            self.tick(now);
        }

        if self.enter_bootloader {
            self.enter_bootloader = false;
            match bootloader::run(&mut self.machine) {
                Ok(_) => self.machine.reset(),
                Err(error) => log::warn!("firmware update failed ({error}), resuming"),
            }
            // Whatever is left in the stream is not frame data.
            self.parser = Parser::new();
        }
    }

    // ── Inbound ──

    fn drain(&mut self, now: u32) {
        if self.bootloader_queued {
            return;
        }
        while let Some(byte) = self.machine.read_byte() {
            match self.parser.push(byte, now) {
                Some(Event::Frame(frame)) => {
                    let handoff = self.on_frame(frame, now);
                    if handoff {
                        // Bootloader command queued: bytes that follow
                        // belong to the chunk stream, not the parser.
                        return;
                    }
                }
                Some(Event::CrcError) => self.link.stats_mut().crc_errors += 1,
                Some(Event::FramingError) => self.link.stats_mut().framing_errors += 1,
                _ => {}
            }
        }
    }

    /// Returns true when the frame was a bootloader request that should
    /// stop the drain.
    fn on_frame(&mut self, frame: RawFrame, now: u32) -> bool {
        self.link
            .record_rx(frame.payload.len() + frame::HEADER_LEN + frame::CRC_LEN);
        self.last_rx_ms = Some(now);

        let Some(msg_type) = MsgType::from_u8(frame.msg_type) else {
            log::warn!("unknown message type 0x{:02X}", frame.msg_type);
            self.send_nack(frame.msg_type, frame.seq, ResultCode::Invalid);
            return false;
        };

        match self.link.filter_rx_seq(frame.seq) {
            SeqVerdict::Accept => {}
            SeqVerdict::Duplicate => {
                // Re-answer from the cache; a lost ACK must not wedge the
                // peer's retry engine, and the command is never re-applied.
                if let Some(ack) = self.last_ack {
                    if ack.cmd_type == frame.msg_type && ack.cmd_seq == frame.seq {
                        self.send_message(&Message::Ack(ack));
                    }
                }
                return false;
            }
            SeqVerdict::OutOfOrder => return false,
        }

        match msg_type {
            MsgType::Ack => {
                if let Ok(ack) = Ack::decode(&frame.payload) {
                    if let Some(outcome) =
                        self.link.resolve_ack(ack.cmd_type, ack.cmd_seq, ack.result)
                    {
                        log::debug!("tracked command 0x{:02X}: {outcome:?}", ack.cmd_type);
                    }
                }
                false
            }
            MsgType::Nack => {
                if let Ok(nack) = Ack::decode(&frame.payload) {
                    let _ = self.link.resolve_nack(nack.cmd_type, nack.cmd_seq);
                }
                false
            }
            MsgType::Handshake => {
                match Handshake::decode(&frame.payload) {
                    Ok(peer) => {
                        let negotiated = self.link.record_handshake(peer);
                        log::info!(
                            "handshake: peer {}.{}, negotiated {}.{}",
                            peer.proto_major,
                            peer.proto_minor,
                            negotiated.proto_major,
                            negotiated.proto_minor
                        );
                        let reply = Message::Handshake(self.link.local_handshake());
                        self.send_message(&reply);
                    }
                    Err(_) => self.send_nack(frame.msg_type, frame.seq, ResultCode::Invalid),
                }
                false
            }
            _ => {
                if self.queue.len() >= BACKPRESSURE_THRESHOLD {
                    // Refuse loudly; nothing is dropped in silence.
                    self.send_nack(frame.msg_type, frame.seq, ResultCode::Busy);
                    return false;
                }
                let handoff = msg_type == MsgType::EnterBootloader;
                let _ = self.queue.push_back(frame);
                self.bootloader_queued |= handoff;
                handoff
            }
        }
    }

    fn process_commands(&mut self, now: u32) {
        while let Some(cmd) = self.queue.pop_front() {
            if cmd.msg_type == MsgType::EnterBootloader as u8 {
                self.bootloader_queued = false;
            }
            let ack = match Message::decode(cmd.msg_type, &cmd.payload) {
                Err(error) => {
                    log::warn!("bad payload for 0x{:02X}: {error}", cmd.msg_type);
                    Ack {
                        cmd_type: cmd.msg_type,
                        cmd_seq: cmd.seq,
                        result: ResultCode::Invalid,
                    }
                }
                Ok(msg) => {
                    let prior = self.config.clone();
                    let outcome =
                        dispatch::handle_command(&msg, &mut self.config, &mut self.control, now);
                    let mut result = outcome.result;
                    let mut effects = outcome.effects;

                    // Config changes are atomic: persist or roll back.
                    if effects.config_changed
                        && config::store(&mut self.machine, &self.config).is_err()
                    {
                        log::warn!("config persist failed, rolling back");
                        self.config = prior;
                        result = ResultCode::Failed;
                        effects = Default::default();
                    }

                    self.emit_config |= effects.emit_config;
                    self.emit_env |= effects.emit_env;
                    self.enter_bootloader |= effects.enter_bootloader;
                    Ack {
                        cmd_type: cmd.msg_type,
                        cmd_seq: cmd.seq,
                        result,
                    }
                }
            };
            self.last_ack = Some(ack);
            self.send_message(&Message::Ack(ack));
        }
    }

    // ── The tick ──

    fn tick(&mut self, now: u32) {
        self.process_commands(now);
        if self.enter_bootloader {
            // ACK is out; the handoff happens before anything else runs.
            return;
        }

        let raw = self.machine.sample();
        let events = self.sensors.update(&raw, now);

        let last_rx_age = now.wrapping_sub(self.last_rx_ms.unwrap_or(self.boot_ms));
        let (edges, entered_safe) = self.safety.evaluate(
            &SafetyInputs {
                sensors: &self.sensors,
                events: &events,
                env_valid: self.config.env.is_valid(),
                tank_mode: self.profile.tank_mode,
                last_rx_age_ms: last_rx_age,
                brew_duty: self.applied_brew_duty,
                steam_duty: self.applied_steam_duty,
            },
            now,
        );

        // The watchdog is only ever kicked after the supervisor ran.
        self.machine.kick_watchdog();

        for edge in &edges {
            self.publish_alarm(edge);
        }

        let brew_temp_dc = self.brew_temp_dc();
        let steam_temp_dc = self.steam_temp_dc();
        let (outputs, brew_events) = self.control.step(
            &ControlInputs {
                config: &self.config,
                profile: &self.profile,
                brew_temp_dc,
                steam_temp_dc,
                lever: self.sensors.lever(),
                all_sensors_seen: self.sensors.all_seen(),
                safe: self.safety.is_safe(),
                fault: self.safety.fault_active(),
            },
            now,
        );

        if entered_safe {
            self.machine.beep(3);
        }

        // Safe state wins over whatever the control machine intended; a
        // latched SSR fault caps the duty instead of zeroing it.
        let mut brew_duty = outputs.brew_duty;
        let mut steam_duty = outputs.steam_duty;
        if self.safety.fault_active() {
            brew_duty = brew_duty.min(MAX_HEATER_DUTY);
            steam_duty = steam_duty.min(MAX_HEATER_DUTY);
        }
        let mut pump_duty = outputs.pump_duty;
        let mut solenoid = outputs.solenoid_open;
        if self.safety.is_safe() {
            brew_duty = 0;
            steam_duty = 0;
            pump_duty = 0;
            solenoid = false;
        }

        self.machine.set_heater_duty(Heater::Brew, brew_duty);
        self.machine.set_heater_duty(Heater::Steam, steam_duty);
        self.machine.set_pump(pump_duty);
        self.machine.set_solenoid(solenoid);
        self.applied_brew_duty = brew_duty;
        self.applied_steam_duty = steam_duty;
        self.applied_pump_duty = pump_duty;

        let indicator = if self.safety.is_safe() {
            Indicator::Blink2Hz
        } else {
            Indicator::Solid
        };
        if indicator != self.indicator {
            self.indicator = indicator;
            self.machine.set_indicator(indicator);
        }

        self.handle_brew_events(&brew_events, now);
        self.flush_outbound(now);
    }

    fn handle_brew_events(&mut self, events: &[BrewEvent], _now: u32) {
        for event in events {
            match *event {
                BrewEvent::Started => {
                    log::info!("brew started");
                    self.send_info_alarm(alarm::BREW_STARTED);
                }
                BrewEvent::Finished { duration_ms } => {
                    log::info!("brew finished after {duration_ms} ms");
                    self.send_info_alarm(alarm::BREW_COMPLETED);
                    if duration_ms >= BREW_REPORT_MIN_MS {
                        self.machine.brew_cycle(duration_ms);
                    }
                    if duration_ms >= BREW_COUNTED_MIN_MS {
                        self.config.cleaning_brew_count =
                            self.config.cleaning_brew_count.saturating_add(1);
                        let _ = config::store(&mut self.machine, &self.config);
                    }
                }
                BrewEvent::CleaningFinished => {
                    log::info!("cleaning cycle finished");
                    self.config.cleaning_brew_count = 0;
                    let _ = config::store(&mut self.machine, &self.config);
                }
            }
        }
    }

    // ── Outbound ──

    fn announce_boot(&mut self) {
        let (fw_major, fw_minor, fw_patch) = self.profile.fw_version;
        let (pcb_major, pcb_minor) = self.profile.pcb_version;
        let boot = Boot {
            fw_major,
            fw_minor,
            fw_patch,
            machine_type: self.profile.machine_type,
            pcb_type: self.profile.pcb_type,
            pcb_major,
            pcb_minor,
            reset_reason: self.profile.reset_reason,
        };
        log::info!(
            "boot: fw {fw_major}.{fw_minor}.{fw_patch}, machine {}",
            self.profile.machine_type
        );
        self.send_message(&Message::Boot(boot));
        self.send_message(&Message::Config(self.config.snapshot(&self.profile)));
        self.send_message(&Message::EnvConfig(self.config.env_message(&self.profile)));
    }

    fn flush_outbound(&mut self, now: u32) {
        if self.emit_config {
            self.emit_config = false;
            self.send_message(&Message::Config(self.config.snapshot(&self.profile)));
        }
        if self.emit_env {
            self.emit_env = false;
            self.send_message(&Message::EnvConfig(self.config.env_message(&self.profile)));
        }

        if now.wrapping_sub(self.last_status_ms) >= STATUS_PERIOD_MS {
            self.last_status_ms = now;
            let status = self.status(now);
            self.send_message(&Message::Status(status));
        }

        if self.profile.has_power_meter
            && now.wrapping_sub(self.last_power_ms) >= POWER_METER_PERIOD_MS
        {
            self.last_power_ms = now;
            let power = self.power_meter();
            self.send_message(&Message::PowerMeter(power));
        }

        let rx_age = now.wrapping_sub(self.last_rx_ms.unwrap_or(self.boot_ms));
        if rx_age >= PING_SILENCE_MS && now.wrapping_sub(self.last_ping_ms) >= PING_SILENCE_MS {
            self.last_ping_ms = now;
            self.send_message(&Message::Ping(Ping { timestamp_ms: now }));
        }
    }

    fn status(&self, now: u32) -> Status {
        let mut water_level = 0u8;
        if self.sensors.reservoir.state() {
            water_level |= water::RESERVOIR_PRESENT;
        }
        if self.sensors.tank.state() {
            water_level |= water::TANK_OK;
        }
        if self.sensors.steam_level.state() {
            water_level |= water::STEAM_OK;
        }
        Status {
            brew_temp_dc: self.brew_temp_dc(),
            steam_temp_dc: self.steam_temp_dc(),
            group_temp_dc: to_dc(self.sensors.group.value()),
            pressure_cb: (self.sensors.pressure_bar() * 100.0) as u16,
            brew_setpoint_dc: self.config.brew_setpoint_dc,
            steam_setpoint_dc: self.config.steam_setpoint_dc,
            brew_duty: self.applied_brew_duty,
            steam_duty: self.applied_steam_duty,
            pump_duty: self.applied_pump_duty,
            state: self.control.state().code(),
            safety_flags: self.safety.flags().bits(),
            water_level,
            uptime_ms: now.wrapping_sub(self.boot_ms),
        }
    }

    fn power_meter(&mut self) -> PowerMeter {
        let power = self.sensors.power_w();
        self.energy_wh += power * (POWER_METER_PERIOD_MS as f32 / 3_600_000.0);
        let volts = f32::from(self.config.env.nominal_voltage);
        let current_ca = if volts > 0.0 {
            (power / volts * 100.0) as u16
        } else {
            0
        };
        PowerMeter {
            voltage_dv: self.config.env.nominal_voltage * 10,
            current_ca,
            power_w: power as u16,
            energy_wh: self.energy_wh as u32,
            frequency_dhz: 0,
            power_factor_pct: 0,
        }
    }

    fn publish_alarm(&mut self, edge: &AlarmEdge) {
        log::warn!(
            "alarm 0x{:02X} {}",
            edge.code,
            if edge.active { "raised" } else { "cleared" }
        );
        if edge.active {
            self.machine.alarm_raised(edge.code, edge.severity);
        } else {
            self.machine.alarm_cleared(edge.code);
        }
        let alarm = Alarm {
            code: edge.code,
            severity: edge.severity,
            active: edge.active,
        };
        self.send_message(&Message::Alarm(alarm));
    }

    fn send_info_alarm(&mut self, code: u16) {
        self.send_message(&Message::Alarm(Alarm {
            code,
            severity: Severity::Info,
            active: true,
        }));
    }

    fn send_message(&mut self, msg: &Message) {
        let payload = msg.encode_payload();
        if let Ok(frame) = self.link.send(msg.msg_type() as u8, &payload) {
            self.machine.write(&frame);
        }
    }

    fn send_nack(&mut self, cmd_type: u8, cmd_seq: u8, result: ResultCode) {
        self.send_message(&Message::Nack(Ack {
            cmd_type,
            cmd_seq,
            result,
        }));
    }

    fn brew_temp_dc(&self) -> i16 {
        to_dc(self.sensors.brew.value()) + self.config.temp_offset_dc
    }

    fn steam_temp_dc(&self) -> i16 {
        to_dc(self.sensors.steam.value()) + self.config.temp_offset_dc
    }
}

fn to_dc(celsius: f32) -> i16 {
    (celsius * 10.0) as i16
}
