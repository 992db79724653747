//! Policy engine: turns operator intent plus live measurements into an
//! effective charging current.
//!
//! Pure with respect to I/O — every input arrives as a field on
//! [`PolicyInput`] and the only state carried across calls is the
//! minimum-charge hysteresis timer owned by [`PolicyEngine`]. Nothing
//! here touches Modbus, the clock (beyond what's passed in), or the
//! publisher. Schedule-window membership is computed separately by
//! [`PolicyEngine::in_schedule`] and passed in, since it needs the
//! caller's timezone-aware clock.

use crate::config::{ScheduleConfig, parse_hhmm};
use chrono::Weekday;
use std::time::{Duration, Instant};

/// Operating mode selected by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Manual,
    Auto,
    Scheduled,
}

/// ESS (energy storage system) strategy, used by the solar-excess
/// computation in AUTO mode (§4.4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EssStrategy {
    Idle,
    Buying,
    Selling,
}

/// Nominal per-phase voltage used to convert watts to amperes (§4.4.2).
pub const NOMINAL_VOLTAGE: f32 = 230.0;

/// The minimum meaningful charging current, in amperes (§4.4 rule 4).
pub const MIN_CHARGING_AMPS: f32 = 6.0;

/// Everything the policy engine needs to compute one decision.
pub struct PolicyInput {
    pub mode: Mode,
    pub enable: bool,
    pub intended_amps: f32,
    pub station_max_amps: f32,
    pub max_set_current: f32,
    pub min_charging_amps: f32,
    pub low_soc: bool,
    pub price_ok: bool,
    pub in_schedule_window: bool,
    pub ess_strategy: EssStrategy,
    /// `dc_pv + ac_pv_l1 + ac_pv_l2 + ac_pv_l3`, in watts (§4.4.2).
    pub total_pv_w: f32,
    /// `sum(ac_consumption_l{1,2,3})`, in watts.
    pub consumption_w: f32,
    /// Power the charger itself is currently drawing, subtracted back out
    /// of `consumption_w` since it isn't "other" household load.
    pub ev_power_w: f32,
    /// Positive when the house battery is charging, negative when discharging.
    pub battery_w: f32,
    pub active_phases: u8,
    pub min_charge_duration: Duration,
    /// Monotonic timestamp of the last set-point write that reached at
    /// least `min_charging_amps`, as tracked by the caller's own control
    /// state. This, not `insufficient_solar_since`, is what the hysteresis
    /// gate keys on (§9 open question: `insufficient_solar_since` is an
    /// observability timestamp, never read back into the decision).
    pub last_positive_send_time: Option<Instant>,
}

/// Result of one policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyOutput {
    pub effective_amps: f32,
    /// Whether the raw AUTO-mode candidate (before hysteresis) is
    /// currently below `min_charging_amps`. The caller persists the time
    /// this first became true as `insufficient_solar_since`; this crate
    /// never reads that value back in.
    pub below_floor: bool,
}

/// Owns the minimum-charge hysteresis timer across calls. A candidate
/// current below `min_charging_amps` is held at the floor for
/// `min_charge_duration` before it's allowed to drop to zero, so brief
/// dips in available solar don't chatter the charger on and off.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    insufficient_solar_since: Option<Instant>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `now_minutes` (minutes past local midnight, 0..1440) on
    /// `weekday` falls inside any enabled schedule item. Windows wrap
    /// midnight when `end <= start`.
    pub fn in_schedule(schedule: &ScheduleConfig, weekday: Weekday, now_minutes: u32) -> bool {
        let day_bit = weekday_bit(weekday);
        schedule.items.iter().any(|item| {
            if !item.enabled || item.days_mask & day_bit == 0 {
                return false;
            }
            let (Some(start), Some(end)) = (parse_hhmm(&item.start), parse_hhmm(&item.end)) else {
                return false;
            };
            if start == end {
                return false;
            }
            if end > start {
                now_minutes >= start && now_minutes < end
            } else {
                now_minutes >= start || now_minutes < end
            }
        })
    }

    /// Compute the solar-excess candidate current (§4.4.2), in amperes,
    /// before the minimum-charge hysteresis is applied. Only called for
    /// `EssStrategy::Idle` — `buying`/`selling` are handled by the caller
    /// as flat overrides.
    fn solar_excess_amps(input: &PolicyInput) -> f32 {
        let phases = input.active_phases.clamp(1, 3) as f32;
        let adjusted_consumption = (input.consumption_w - input.ev_power_w).max(0.0);
        let excess_w = (input.total_pv_w - adjusted_consumption - input.battery_w.max(0.0)).max(0.0);
        excess_w / (phases * NOMINAL_VOLTAGE)
    }

    /// Apply the minimum-charge hysteresis to a raw candidate current:
    /// once charging has started, a dip below `min_charging_amps` is held
    /// at the floor for `min_charge_duration` before being allowed to
    /// collapse to zero. Gated on `last_positive_send_time`, not on how
    /// long the candidate itself has been low.
    fn apply_hysteresis(&mut self, candidate: f32, input: &PolicyInput, now: Instant) -> (f32, bool) {
        if candidate >= input.min_charging_amps {
            self.insufficient_solar_since = None;
            return (candidate, false);
        }
        self.insufficient_solar_since.get_or_insert(now);
        let recently_sent_positive = input
            .last_positive_send_time
            .is_some_and(|t| now.duration_since(t) < input.min_charge_duration);
        let gated = if recently_sent_positive { input.min_charging_amps } else { 0.0 };
        (gated, true)
    }

    /// Evaluate one policy tick and return the effective current in
    /// amperes, clamped to `[0, min(station_max_amps, max_set_current)]`.
    pub fn evaluate(&mut self, input: &PolicyInput, now: Instant) -> PolicyOutput {
        let ceiling = input.station_max_amps.min(input.max_set_current).max(0.0);

        if input.low_soc || !input.enable {
            self.insufficient_solar_since = None;
            return PolicyOutput {
                effective_amps: 0.0,
                below_floor: false,
            };
        }

        let raw = match input.mode {
            Mode::Manual => input.intended_amps,
            Mode::Scheduled => {
                if input.in_schedule_window {
                    input.intended_amps
                } else {
                    0.0
                }
            }
            Mode::Auto => {
                let mut amps = match input.ess_strategy {
                    // Opportunistic: the house is already importing, so there's
                    // no export to preserve — let the charger draw up to the
                    // station's advertised maximum.
                    EssStrategy::Buying => input.station_max_amps,
                    // Preserve export entirely.
                    EssStrategy::Selling => 0.0,
                    EssStrategy::Idle => Self::solar_excess_amps(input),
                };
                if !input.price_ok {
                    amps = 0.0;
                }
                amps
            }
        };

        let hysteresis_applies = matches!(input.mode, Mode::Auto);
        let (gated, below_floor) = if hysteresis_applies {
            self.apply_hysteresis(raw, input, now)
        } else {
            self.insufficient_solar_since = None;
            (raw, false)
        };

        let effective = gated.clamp(0.0, ceiling);
        PolicyOutput {
            effective_amps: effective,
            below_floor,
        }
    }
}

fn weekday_bit(day: Weekday) -> u8 {
    match day {
        Weekday::Sun => 1 << 0,
        Weekday::Mon => 1 << 1,
        Weekday::Tue => 1 << 2,
        Weekday::Wed => 1 << 3,
        Weekday::Thu => 1 << 4,
        Weekday::Fri => 1 << 5,
        Weekday::Sat => 1 << 6,
    }
}
