//! Inbound command handling: validate, apply, and pick the ACK result.
//!
//! Pure over the configuration and control machine so every rule is
//! testable without a board. The controller wraps this with the queue,
//! the backpressure NACKs, persistence, and the broadcast flags.

use brewos_protocol::message::{Boiler, BrewAction, HeatingStrategy, Message, Mode, ResultCode, SetConfig};

use crate::config::{
    Config, BREW_SETPOINT_MAX_DC, BREW_SETPOINT_MIN_DC, CURRENT_MAX_A, STEAM_SETPOINT_MAX_DC,
    STEAM_SETPOINT_MIN_DC, VOLTAGE_MAX, VOLTAGE_MIN,
};
use crate::control::{ControlMachine, ControlState};

/// What a handled command asks the controller to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandEffects {
    pub config_changed: bool,
    pub emit_config: bool,
    pub emit_env: bool,
    pub enter_bootloader: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    pub result: ResultCode,
    pub effects: CommandEffects,
}

fn ok(effects: CommandEffects) -> CommandOutcome {
    CommandOutcome {
        result: ResultCode::Success,
        effects,
    }
}

fn done(result: ResultCode) -> CommandOutcome {
    CommandOutcome {
        result,
        effects: CommandEffects::default(),
    }
}

/// Commands still answered while the environment is uncommissioned:
/// whatever is needed to commission it or look at the machine.
fn allowed_before_env(msg: &Message) -> bool {
    matches!(
        msg,
        Message::Ping(_)
            | Message::GetConfig
            | Message::GetEnvConfig
            | Message::SetConfig(SetConfig::Environment { .. })
    )
}

/// Handle one decoded command. The caller has already run the sequence
/// filter and backpressure; this is semantics only.
pub fn handle_command(
    msg: &Message,
    config: &mut Config,
    control: &mut ControlMachine,
    now_ms: u32,
) -> CommandOutcome {
    if !config.env.is_valid() && !allowed_before_env(msg) {
        return done(ResultCode::NotReady);
    }

    match msg {
        Message::Ping(_) => done(ResultCode::Success),

        Message::SetTemp(cmd) => {
            let valid = match cmd.target {
                Boiler::Brew => {
                    (BREW_SETPOINT_MIN_DC..=BREW_SETPOINT_MAX_DC).contains(&cmd.temp_dc)
                }
                Boiler::Steam => {
                    (STEAM_SETPOINT_MIN_DC..=STEAM_SETPOINT_MAX_DC).contains(&cmd.temp_dc)
                }
            };
            if !valid {
                return done(ResultCode::Invalid);
            }
            match cmd.target {
                Boiler::Brew => config.brew_setpoint_dc = cmd.temp_dc,
                Boiler::Steam => config.steam_setpoint_dc = cmd.temp_dc,
            }
            ok(CommandEffects {
                config_changed: true,
                emit_config: true,
                emit_env: false,
                enter_bootloader: false,
            })
        }

        Message::SetPid(cmd) => {
            let gains = crate::config::PidGains {
                kp_c: cmd.kp_c,
                ki_c: cmd.ki_c,
                kd_c: cmd.kd_c,
            };
            match cmd.target {
                Boiler::Brew => config.brew_pid = gains,
                Boiler::Steam => config.steam_pid = gains,
            }
            ok(CommandEffects {
                config_changed: true,
                emit_config: true,
                emit_env: false,
                enter_bootloader: false,
            })
        }

        Message::SetMode(cmd) => {
            if control.state() == ControlState::Brewing {
                // No mode games mid-extraction.
                return done(ResultCode::Rejected);
            }
            if cmd.mode == Mode::Steam && config.heating_strategy == HeatingStrategy::BrewOnly {
                // The steam boiler is never heated under BREW_ONLY.
                return done(ResultCode::Rejected);
            }
            control.set_mode(cmd.mode);
            done(ResultCode::Success)
        }

        Message::Brew(cmd) => match cmd.action {
            // Brewing starts at the lever, never over the link.
            BrewAction::Start => done(ResultCode::Rejected),
            BrewAction::Stop => {
                if control.request_stop() {
                    done(ResultCode::Success)
                } else {
                    done(ResultCode::Rejected)
                }
            }
            BrewAction::Clean => {
                if control.start_cleaning(now_ms) {
                    done(ResultCode::Success)
                } else {
                    done(ResultCode::Rejected)
                }
            }
        },

        Message::SetConfig(cmd) => match *cmd {
            SetConfig::Strategy(strategy) => {
                config.heating_strategy = strategy;
                ok(CommandEffects {
                    config_changed: true,
                    emit_config: true,
                    emit_env: false,
                    enter_bootloader: false,
                })
            }
            SetConfig::Preinfusion {
                on_ms,
                pause_ms,
                enabled,
            } => {
                config.preinfusion = crate::config::Preinfusion {
                    on_ms,
                    pause_ms,
                    enabled,
                };
                ok(CommandEffects {
                    config_changed: true,
                    emit_config: true,
                    emit_env: false,
                    enter_bootloader: false,
                })
            }
            SetConfig::Environment {
                nominal_voltage,
                max_current_a,
            } => {
                let volts_ok = (VOLTAGE_MIN..=VOLTAGE_MAX).contains(&nominal_voltage);
                let amps_ok = max_current_a > 0.0 && max_current_a <= CURRENT_MAX_A;
                if !volts_ok || !amps_ok {
                    return done(ResultCode::Invalid);
                }
                config.env = crate::config::EnvLimits {
                    nominal_voltage,
                    max_current_a,
                };
                ok(CommandEffects {
                    config_changed: true,
                    emit_config: false,
                    emit_env: true,
                    enter_bootloader: false,
                })
            }
        },

        Message::GetConfig => ok(CommandEffects {
            config_changed: false,
            emit_config: true,
            emit_env: false,
            enter_bootloader: false,
        }),

        Message::GetEnvConfig => ok(CommandEffects {
            config_changed: false,
            emit_config: false,
            emit_env: true,
            enter_bootloader: false,
        }),

        Message::EnterBootloader(_) => {
            if control.state() == ControlState::Brewing {
                return done(ResultCode::Rejected);
            }
            ok(CommandEffects {
                config_changed: false,
                emit_config: false,
                emit_env: false,
                enter_bootloader: true,
            })
        }

        // Telemetry types only travel controller-to-bridge; receiving one
        // back is a peer bug.
        Message::Status(_)
        | Message::Alarm(_)
        | Message::Boot(_)
        | Message::Ack(_)
        | Message::Config(_)
        | Message::EnvConfig(_)
        | Message::PowerMeter(_)
        | Message::Handshake(_)
        | Message::Nack(_) => done(ResultCode::Invalid),
    }
}
