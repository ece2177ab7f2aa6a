//! Telemetry fan-out: decoded link events become structured log lines
//! and JSON records for the connectivity layers above.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use brewos_protocol::message::{water, Status};

use crate::link::LinkEvent;

/// Engineering-unit view of a STATUS frame.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    pub uptime_ms: u32,
    pub brew_c: f32,
    pub steam_c: f32,
    pub group_c: f32,
    pub pressure_bar: f32,
    pub brew_setpoint_c: f32,
    pub steam_setpoint_c: f32,
    pub brew_duty: u8,
    pub steam_duty: u8,
    pub pump_duty: u8,
    pub state: u8,
    pub safety_flags: u8,
    pub reservoir_present: bool,
    pub tank_ok: bool,
    pub steam_level_ok: bool,
}

impl From<&Status> for StatusRecord {
    fn from(status: &Status) -> Self {
        Self {
            uptime_ms: status.uptime_ms,
            brew_c: f32::from(status.brew_temp_dc) / 10.0,
            steam_c: f32::from(status.steam_temp_dc) / 10.0,
            group_c: f32::from(status.group_temp_dc) / 10.0,
            pressure_bar: f32::from(status.pressure_cb) / 100.0,
            brew_setpoint_c: f32::from(status.brew_setpoint_dc) / 10.0,
            steam_setpoint_c: f32::from(status.steam_setpoint_dc) / 10.0,
            brew_duty: status.brew_duty,
            steam_duty: status.steam_duty,
            pump_duty: status.pump_duty,
            state: status.state,
            safety_flags: status.safety_flags,
            reservoir_present: status.water_level & water::RESERVOIR_PRESENT != 0,
            tank_ok: status.water_level & water::TANK_OK != 0,
            steam_level_ok: status.water_level & water::STEAM_OK != 0,
        }
    }
}

/// Consume link events until the channel closes. Placeholder for the
/// cloud relay: everything lands in the structured log for now.
pub async fn process_events(mut events: mpsc::Receiver<LinkEvent>) {
    info!("telemetry processor started");

    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Status(status) => {
                let record = StatusRecord::from(&status);
                info!(
                    brew_c = record.brew_c,
                    steam_c = record.steam_c,
                    pressure_bar = record.pressure_bar,
                    state = record.state,
                    safety_flags = record.safety_flags,
                    "machine status"
                );
                if let Ok(json) = serde_json::to_string(&record) {
                    tracing::debug!(%json, "status record");
                }
            }
            LinkEvent::Alarm(alarm) => {
                warn!(
                    code = alarm.code,
                    severity = alarm.severity as u8,
                    active = alarm.active,
                    "alarm"
                );
            }
            LinkEvent::Boot(boot) => {
                info!(
                    fw = format!("{}.{}.{}", boot.fw_major, boot.fw_minor, boot.fw_patch),
                    machine_type = boot.machine_type,
                    reset_reason = boot.reset_reason,
                    "controller booted"
                );
            }
            LinkEvent::Config(config) => {
                info!(
                    brew_setpoint_c = f32::from(config.brew_setpoint_dc) / 10.0,
                    steam_setpoint_c = f32::from(config.steam_setpoint_dc) / 10.0,
                    strategy = ?config.strategy,
                    "configuration snapshot"
                );
            }
            LinkEvent::EnvConfig(env) => {
                info!(
                    nominal_voltage = env.nominal_voltage,
                    max_current_a = env.max_current_a,
                    usable_current_a = env.usable_current_a,
                    "environment configuration"
                );
            }
            LinkEvent::PowerMeter(power) => {
                info!(
                    power_w = power.power_w,
                    voltage_v = f32::from(power.voltage_dv) / 10.0,
                    energy_wh = power.energy_wh,
                    "power meter"
                );
            }
            LinkEvent::HandshakeComplete { negotiated, .. } => {
                info!(
                    major = negotiated.proto_major,
                    minor = negotiated.proto_minor,
                    "link handshake complete"
                );
            }
            LinkEvent::Ping { timestamp_ms } => {
                tracing::debug!(timestamp_ms, "controller ping");
            }
        }
    }

    info!("telemetry processor stopped");
}
