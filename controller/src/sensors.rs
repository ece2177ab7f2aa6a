//! Sensor filtering and fault tracking.
//!
//! Analog channels are validated against a per-kind band, smoothed with a
//! first-order IIR filter that holds the last valid value across
//! transient faults, and latched into a fault after
//! [`FAULT_THRESHOLD`] consecutive invalid readings. Level probes are
//! debounced over [`LEVEL_DEBOUNCE`] consistent samples.

use heapless::Vec;

use crate::capabilities::RawSensors;

/// Consecutive invalid readings before a fault latches.
pub const FAULT_THRESHOLD: u8 = 10;
/// Consecutive consistent samples before a level probe flips.
pub const LEVEL_DEBOUNCE: u8 = 5;

pub const NTC_MIN_C: f32 = -20.0;
pub const NTC_MAX_C: f32 = 150.0;
pub const TC_MIN_C: f32 = -50.0;
pub const TC_MAX_C: f32 = 200.0;
pub const PRESSURE_MIN_V: f32 = 0.3;
pub const PRESSURE_MAX_V: f32 = 4.7;
pub const PRESSURE_SPAN_BAR: f32 = 20.0;

/// A fitted power meter that goes quiet for this long is reported stale.
pub const POWER_METER_TIMEOUT_MS: u32 = 5_000;

const IIR_ALPHA: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogKind {
    BrewNtc,
    SteamNtc,
    GroupTc,
    Pressure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelKind {
    Reservoir,
    Tank,
    SteamLevel,
}

/// Edges the tracker reports to the safety supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorEvent {
    /// Fault latched; `high` distinguishes short (pegged high) from open.
    FaultLatched { kind: AnalogKind, high: bool },
    Recovered { kind: AnalogKind },
    LevelChanged { kind: LevelKind, ok: bool },
    PowerMeterStale,
    PowerMeterRecovered,
}

#[derive(Debug, Clone, Copy)]
pub struct AnalogChannel {
    filtered: f32,
    raw: f32,
    has_sample: bool,
    last_valid_ms: u32,
    consecutive_failures: u8,
    fault_latched: bool,
    invalid_high: bool,
    min: f32,
    max: f32,
}

impl AnalogChannel {
    const fn new(min: f32, max: f32) -> Self {
        Self {
            filtered: 0.0,
            raw: 0.0,
            has_sample: false,
            last_valid_ms: 0,
            consecutive_failures: 0,
            fault_latched: false,
            invalid_high: false,
            min,
            max,
        }
    }

    /// The filtered value; meaningless until [`Self::has_sample`].
    pub fn value(&self) -> f32 {
        self.filtered
    }

    /// The most recent valid reading, unfiltered. The safety limits run
    /// on this so a single extreme sample is never smoothed away.
    pub fn raw_value(&self) -> f32 {
        self.raw
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    pub fn fault_latched(&self) -> bool {
        self.fault_latched
    }

    pub fn last_valid_ms(&self) -> u32 {
        self.last_valid_ms
    }

    fn update(&mut self, raw: f32, now_ms: u32) -> Option<ChannelEdge> {
        let valid = raw.is_finite() && raw >= self.min && raw <= self.max;
        if valid {
            self.consecutive_failures = 0;
            let was_latched = core::mem::take(&mut self.fault_latched);
            self.last_valid_ms = now_ms;
            self.raw = raw;
            if self.has_sample {
                self.filtered += (raw - self.filtered) * IIR_ALPHA;
            } else {
                self.filtered = raw;
                self.has_sample = true;
            }
            was_latched.then_some(ChannelEdge::Recovered)
        } else {
            // The filter holds the last valid value.
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.invalid_high = raw.is_finite() && raw > self.max;
            if self.consecutive_failures == FAULT_THRESHOLD && !self.fault_latched {
                self.fault_latched = true;
                Some(ChannelEdge::FaultLatched {
                    high: self.invalid_high,
                })
            } else {
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ChannelEdge {
    FaultLatched { high: bool },
    Recovered,
}

#[derive(Debug, Clone, Copy)]
pub struct LevelChannel {
    stable: bool,
    candidate: bool,
    run: u8,
    has_sample: bool,
}

impl LevelChannel {
    const fn new() -> Self {
        Self {
            stable: false,
            candidate: false,
            run: 0,
            has_sample: false,
        }
    }

    pub fn state(&self) -> bool {
        self.stable
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    fn update(&mut self, raw: bool) -> Option<bool> {
        if !self.has_sample {
            // Boot state is trusted as-is; debounce applies to changes.
            self.stable = raw;
            self.candidate = raw;
            self.has_sample = true;
            return None;
        }
        if raw == self.stable {
            self.run = 0;
            self.candidate = self.stable;
            return None;
        }
        if raw == self.candidate {
            self.run += 1;
        } else {
            self.candidate = raw;
            self.run = 1;
        }
        if self.run >= LEVEL_DEBOUNCE {
            self.stable = raw;
            self.run = 0;
            Some(raw)
        } else {
            None
        }
    }
}

/// All sensor channels of the machine.
pub struct SensorTracker {
    pub brew: AnalogChannel,
    pub steam: AnalogChannel,
    pub group: AnalogChannel,
    pub pressure: AnalogChannel,
    pub reservoir: LevelChannel,
    pub tank: LevelChannel,
    pub steam_level: LevelChannel,
    last_power_ms: Option<u32>,
    power_w: f32,
    power_stale: bool,
    lever: bool,
}

impl SensorTracker {
    pub const fn new() -> Self {
        Self {
            brew: AnalogChannel::new(NTC_MIN_C, NTC_MAX_C),
            steam: AnalogChannel::new(NTC_MIN_C, NTC_MAX_C),
            group: AnalogChannel::new(TC_MIN_C, TC_MAX_C),
            pressure: AnalogChannel::new(PRESSURE_MIN_V, PRESSURE_MAX_V),
            reservoir: LevelChannel::new(),
            tank: LevelChannel::new(),
            steam_level: LevelChannel::new(),
            last_power_ms: None,
            power_w: 0.0,
            power_stale: false,
            lever: false,
        }
    }

    /// Fold one raw sample in; returns the edges this sample produced.
    pub fn update(&mut self, raw: &RawSensors, now_ms: u32) -> Vec<SensorEvent, 8> {
        let mut events = Vec::new();

        let analogs = [
            (AnalogKind::BrewNtc, raw.brew_ntc_c),
            (AnalogKind::SteamNtc, raw.steam_ntc_c),
            (AnalogKind::GroupTc, raw.group_tc_c),
            (AnalogKind::Pressure, raw.pressure_v),
        ];
        for (kind, value) in analogs {
            let edge = self.channel_mut(kind).update(value, now_ms);
            match edge {
                Some(ChannelEdge::FaultLatched { high }) => {
                    let _ = events.push(SensorEvent::FaultLatched { kind, high });
                }
                Some(ChannelEdge::Recovered) => {
                    log::info!("sensor {kind:?} recovered");
                    let _ = events.push(SensorEvent::Recovered { kind });
                }
                None => {}
            }
        }

        let levels = [
            (LevelKind::Reservoir, raw.reservoir_present),
            (LevelKind::Tank, raw.tank_ok),
            (LevelKind::SteamLevel, raw.steam_level_ok),
        ];
        for (kind, value) in levels {
            if let Some(ok) = self.level_mut(kind).update(value) {
                let _ = events.push(SensorEvent::LevelChanged { kind, ok });
            }
        }

        if let Some(power) = raw.power_w {
            self.power_w = power;
            self.last_power_ms = Some(now_ms);
            if core::mem::take(&mut self.power_stale) {
                let _ = events.push(SensorEvent::PowerMeterRecovered);
            }
        } else if let Some(last) = self.last_power_ms {
            if !self.power_stale && now_ms.wrapping_sub(last) >= POWER_METER_TIMEOUT_MS {
                self.power_stale = true;
                let _ = events.push(SensorEvent::PowerMeterStale);
            }
        }

        self.lever = raw.lever;
        events
    }

    fn channel_mut(&mut self, kind: AnalogKind) -> &mut AnalogChannel {
        match kind {
            AnalogKind::BrewNtc => &mut self.brew,
            AnalogKind::SteamNtc => &mut self.steam,
            AnalogKind::GroupTc => &mut self.group,
            AnalogKind::Pressure => &mut self.pressure,
        }
    }

    fn level_mut(&mut self, kind: LevelKind) -> &mut LevelChannel {
        match kind {
            LevelKind::Reservoir => &mut self.reservoir,
            LevelKind::Tank => &mut self.tank,
            LevelKind::SteamLevel => &mut self.steam_level,
        }
    }

    /// Filtered gauge pressure in bar.
    pub fn pressure_bar(&self) -> f32 {
        if !self.pressure.has_sample() {
            return 0.0;
        }
        let span = PRESSURE_MAX_V - PRESSURE_MIN_V;
        let bar = (self.pressure.value() - PRESSURE_MIN_V) / span * PRESSURE_SPAN_BAR;
        if bar > 0.0 {
            bar
        } else {
            0.0
        }
    }

    pub fn power_w(&self) -> f32 {
        self.power_w
    }

    pub fn power_stale(&self) -> bool {
        self.power_stale
    }

    pub fn lever(&self) -> bool {
        self.lever
    }

    /// Every channel has produced at least one usable sample.
    pub fn all_seen(&self) -> bool {
        self.brew.has_sample()
            && self.steam.has_sample()
            && self.group.has_sample()
            && self.pressure.has_sample()
            && self.reservoir.has_sample()
            && self.tank.has_sample()
            && self.steam_level.has_sample()
    }

    /// A latched fault on a sensor the safety invariants depend on.
    pub fn critical_fault(&self) -> bool {
        self.brew.fault_latched() || self.steam.fault_latched() || self.pressure.fault_latched()
    }
}

impl Default for SensorTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nominal() -> RawSensors {
        RawSensors {
            brew_ntc_c: 92.0,
            steam_ntc_c: 144.0,
            group_tc_c: 88.0,
            pressure_v: 2.3,
            reservoir_present: true,
            tank_ok: true,
            steam_level_ok: true,
            power_w: None,
            lever: false,
        }
    }

    #[test]
    fn fault_latches_after_exactly_ten_failures() {
        let mut tracker = SensorTracker::new();
        tracker.update(&nominal(), 0);

        let mut raw = nominal();
        raw.brew_ntc_c = f32::NAN;

        let mut latched_at = None;
        for n in 1..=11u32 {
            let events = tracker.update(&raw, n * 100);
            let faults: std::vec::Vec<_> = events
                .iter()
                .filter(|e| matches!(e, SensorEvent::FaultLatched { .. }))
                .collect();
            if !faults.is_empty() {
                assert!(latched_at.is_none(), "fault reported twice");
                latched_at = Some(n);
            }
        }
        assert_eq!(latched_at, Some(FAULT_THRESHOLD as u32));
        assert!(tracker.brew.fault_latched());
        assert!(tracker.critical_fault());
    }

    #[test]
    fn single_valid_reading_recovers() {
        let mut tracker = SensorTracker::new();
        tracker.update(&nominal(), 0);

        let mut raw = nominal();
        raw.brew_ntc_c = 200.0; // outside the NTC band
        for n in 1..=10u32 {
            tracker.update(&raw, n * 100);
        }
        assert!(tracker.brew.fault_latched());

        let events = tracker.update(&nominal(), 1100);
        assert!(events
            .iter()
            .any(|e| matches!(e, SensorEvent::Recovered { kind: AnalogKind::BrewNtc })));
        assert!(!tracker.brew.fault_latched());
        assert!(!tracker.critical_fault());
    }

    #[test]
    fn filter_holds_last_valid_across_transients() {
        let mut tracker = SensorTracker::new();
        tracker.update(&nominal(), 0);
        let before = tracker.brew.value();

        let mut raw = nominal();
        raw.brew_ntc_c = f32::NAN;
        for n in 1..=5u32 {
            tracker.update(&raw, n * 100);
        }
        assert_eq!(tracker.brew.value(), before);

        // A transient shorter than the threshold never latches.
        assert!(!tracker.brew.fault_latched());
        tracker.update(&nominal(), 600);
        assert_eq!(tracker.brew.consecutive_failures, 0);
    }

    #[test]
    fn short_reads_high_open_reads_low() {
        let mut tracker = SensorTracker::new();
        let mut raw = nominal();
        raw.steam_ntc_c = 400.0;
        let mut events = Vec::<SensorEvent, 8>::new();
        for n in 0..10u32 {
            events = tracker.update(&raw, n * 100);
        }
        assert!(events.iter().any(|e| matches!(
            e,
            SensorEvent::FaultLatched { kind: AnalogKind::SteamNtc, high: true }
        )));
    }

    #[test]
    fn level_probe_debounces() {
        let mut tracker = SensorTracker::new();
        tracker.update(&nominal(), 0);
        assert!(tracker.reservoir.state());

        let mut raw = nominal();
        raw.reservoir_present = false;

        // Four inconsistent samples are not enough.
        for n in 1..=4u32 {
            let events = tracker.update(&raw, n * 100);
            assert!(events.is_empty(), "flipped early at sample {n}");
        }
        let events = tracker.update(&raw, 500);
        assert!(events.iter().any(|e| matches!(
            e,
            SensorEvent::LevelChanged { kind: LevelKind::Reservoir, ok: false }
        )));
        assert!(!tracker.reservoir.state());
    }

    #[test]
    fn level_glitch_resets_debounce() {
        let mut tracker = SensorTracker::new();
        tracker.update(&nominal(), 0);

        let mut absent = nominal();
        absent.reservoir_present = false;
        for _ in 0..4 {
            tracker.update(&absent, 0);
        }
        // One present sample resets the run.
        tracker.update(&nominal(), 0);
        for _ in 0..4 {
            assert!(tracker.update(&absent, 0).is_empty());
        }
        assert!(tracker.reservoir.state());
    }

    #[test]
    fn pressure_converts_to_bar() {
        let mut tracker = SensorTracker::new();
        let mut raw = nominal();
        raw.pressure_v = 0.3;
        tracker.update(&raw, 0);
        assert!(tracker.pressure_bar() < 0.01);

        // Mid-scale voltage reads mid-span. A fresh tracker avoids the IIR lag.
        let mut tracker = SensorTracker::new();
        raw.pressure_v = 2.5;
        tracker.update(&raw, 0);
        let expected = (2.5 - 0.3) / 4.4 * 20.0;
        assert!((tracker.pressure_bar() - expected).abs() < 0.01);
    }

    #[test]
    fn power_meter_staleness() {
        let mut tracker = SensorTracker::new();
        let mut raw = nominal();
        raw.power_w = Some(1200.0);
        tracker.update(&raw, 0);
        assert!(!tracker.power_stale());

        raw.power_w = None;
        let mut stale_events = 0;
        for n in 1..=60u32 {
            let events = tracker.update(&raw, n * 100);
            stale_events += events
                .iter()
                .filter(|e| matches!(e, SensorEvent::PowerMeterStale))
                .count();
        }
        assert_eq!(stale_events, 1);
        assert!(tracker.power_stale());

        raw.power_w = Some(900.0);
        let events = tracker.update(&raw, 6100);
        assert!(events
            .iter()
            .any(|e| matches!(e, SensorEvent::PowerMeterRecovered)));
    }
}
