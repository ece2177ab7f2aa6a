//! Persisted machine configuration.
//!
//! The record itself is plain data; persistence goes through the
//! injected [`ConfigStore`] sink as a postcard blob, so the core never
//! knows whether it lives in EEPROM, a file, or a test vector.

use brewos_protocol::message::{ConfigSnapshot, EnvConfig, HeatingStrategy};
use serde::{Deserialize, Serialize};

use crate::capabilities::{ConfigStore, MachineProfile, StoreError};

pub const BREW_SETPOINT_MIN_DC: i16 = 800;
pub const BREW_SETPOINT_MAX_DC: i16 = 1050;
pub const STEAM_SETPOINT_MIN_DC: i16 = 1200;
pub const STEAM_SETPOINT_MAX_DC: i16 = 1550;
pub const TEMP_OFFSET_LIMIT_DC: i16 = 50;

pub const VOLTAGE_MIN: u16 = 90;
pub const VOLTAGE_MAX: u16 = 260;
pub const CURRENT_MAX_A: f32 = 40.0;

/// Worst-case postcard size of [`Config`], with headroom.
pub const CONFIG_BLOB_MAX: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp_c: u16,
    pub ki_c: u16,
    pub kd_c: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preinfusion {
    pub on_ms: u16,
    pub pause_ms: u16,
    pub enabled: bool,
}

/// Mains environment. Invalid until commissioned; the dispatcher answers
/// NOT_READY to everything that needs power until it is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvLimits {
    pub nominal_voltage: u16,
    pub max_current_a: f32,
}

impl EnvLimits {
    pub fn is_valid(&self) -> bool {
        self.nominal_voltage != 0 && self.max_current_a > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub brew_setpoint_dc: i16,
    pub steam_setpoint_dc: i16,
    pub temp_offset_dc: i16,
    pub brew_pid: PidGains,
    pub steam_pid: PidGains,
    pub heating_strategy: HeatingStrategy,
    pub preinfusion: Preinfusion,
    pub env: EnvLimits,
    /// Brews between cleaning reminders.
    pub cleaning_threshold: u16,
    /// Brews since the last cleaning cycle.
    pub cleaning_brew_count: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            brew_setpoint_dc: 930,
            steam_setpoint_dc: 1450,
            temp_offset_dc: 0,
            brew_pid: PidGains {
                kp_c: 500,
                ki_c: 100,
                kd_c: 50,
            },
            steam_pid: PidGains {
                kp_c: 800,
                ki_c: 50,
                kd_c: 0,
            },
            heating_strategy: HeatingStrategy::Sequential,
            preinfusion: Preinfusion {
                on_ms: 3000,
                pause_ms: 2000,
                enabled: false,
            },
            // Zero until commissioned for the local mains.
            env: EnvLimits {
                nominal_voltage: 0,
                max_current_a: 0.0,
            },
            cleaning_threshold: 50,
            cleaning_brew_count: 0,
        }
    }
}

impl Config {
    /// The broadcast snapshot (brew-side PID gains on the wire).
    pub fn snapshot(&self, profile: &MachineProfile) -> ConfigSnapshot {
        ConfigSnapshot {
            brew_setpoint_dc: self.brew_setpoint_dc,
            steam_setpoint_dc: self.steam_setpoint_dc,
            temp_offset_dc: self.temp_offset_dc,
            kp_c: self.brew_pid.kp_c,
            ki_c: self.brew_pid.ki_c,
            kd_c: self.brew_pid.kd_c,
            strategy: self.heating_strategy,
            machine_type: profile.machine_type,
        }
    }

    /// The ENV_CONFIG broadcast, with the derived current budget.
    pub fn env_message(&self, profile: &MachineProfile) -> EnvConfig {
        let volts = f32::from(self.env.nominal_voltage);
        let per_element = |watts: u16| {
            if volts > 0.0 {
                f32::from(watts) / volts
            } else {
                0.0
            }
        };
        EnvConfig {
            nominal_voltage: self.env.nominal_voltage,
            max_current_a: self.env.max_current_a,
            usable_current_a: self.env.max_current_a * 0.95,
            brew_element_a: per_element(profile.brew_element_w),
            steam_element_a: per_element(profile.steam_element_w),
        }
    }

    /// Watts the heaters may draw together under SMART_STAGGER.
    pub fn power_budget_w(&self) -> f32 {
        const SAFETY_MARGIN_W: f32 = 100.0;
        let raw = self.env.max_current_a * 0.95 * f32::from(self.env.nominal_voltage);
        if raw > SAFETY_MARGIN_W {
            raw - SAFETY_MARGIN_W
        } else {
            0.0
        }
    }
}

/// Load the stored configuration, falling back to defaults when the sink
/// is empty or the blob does not parse.
pub fn load(store: &mut impl ConfigStore) -> Config {
    let mut buf = [0u8; CONFIG_BLOB_MAX];
    match store.load(&mut buf) {
        Some(len) => match postcard::from_bytes(&buf[..len]) {
            Ok(config) => config,
            Err(_) => {
                log::warn!("stored config blob unreadable, using defaults");
                Config::default()
            }
        },
        None => Config::default(),
    }
}

/// Persist the configuration. Synchronous; the change is durable (or
/// reported failed) when this returns.
pub fn store(sink: &mut impl ConfigStore, config: &Config) -> Result<(), StoreError> {
    let mut buf = [0u8; CONFIG_BLOB_MAX];
    let blob = postcard::to_slice(config, &mut buf).map_err(|_| StoreError)?;
    sink.store(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemStore(Option<std::vec::Vec<u8>>);

    impl ConfigStore for MemStore {
        fn load(&mut self, buf: &mut [u8]) -> Option<usize> {
            let blob = self.0.as_ref()?;
            buf[..blob.len()].copy_from_slice(blob);
            Some(blob.len())
        }

        fn store(&mut self, blob: &[u8]) -> Result<(), StoreError> {
            self.0 = Some(blob.to_vec());
            Ok(())
        }
    }

    #[test]
    fn blob_round_trip() {
        let mut sink = MemStore(None);
        let mut config = Config::default();
        config.env = EnvLimits {
            nominal_voltage: 230,
            max_current_a: 16.0,
        };
        config.cleaning_brew_count = 7;

        store(&mut sink, &config).unwrap();
        assert_eq!(load(&mut sink), config);
    }

    #[test]
    fn empty_store_yields_defaults() {
        let mut sink = MemStore(None);
        let config = load(&mut sink);
        assert_eq!(config, Config::default());
        assert!(!config.env.is_valid());
    }

    #[test]
    fn corrupt_blob_yields_defaults() {
        let mut sink = MemStore(Some(vec![0xFF; 3]));
        assert_eq!(load(&mut sink), Config::default());
    }

    #[test]
    fn power_budget_follows_env() {
        let mut config = Config::default();
        config.env = EnvLimits {
            nominal_voltage: 230,
            max_current_a: 16.0,
        };
        // 16 A × 0.95 × 230 V − 100 W margin
        let expected = 16.0 * 0.95 * 230.0 - 100.0;
        assert!((config.power_budget_w() - expected).abs() < 0.01);

        config.env.max_current_a = 0.0;
        assert_eq!(config.power_budget_w(), 0.0);
    }

    #[test]
    fn env_message_derives_currents() {
        let mut config = Config::default();
        config.env = EnvLimits {
            nominal_voltage: 230,
            max_current_a: 16.0,
        };
        let profile = test_profile();
        let env = config.env_message(&profile);
        assert!((env.usable_current_a - 15.2).abs() < 0.01);
        assert!((env.brew_element_a - 1400.0 / 230.0).abs() < 0.01);
    }

    fn test_profile() -> MachineProfile {
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
}
