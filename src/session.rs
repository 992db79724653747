//! Charging session tracking
//!
//! Turns the raw "is the charger delivering power" signal into discrete
//! sessions with start/end timestamps, delivered energy, peak and
//! average power. A session doesn't start the instant power is first
//! seen: it needs two-of-either confirmation (an energy delta of at
//! least 0.01 kWh, or [`START_CONFIRMATION_SECONDS`] of continuous
//! power) before becoming active, and it tolerates a brief drop below
//! the charging threshold for up to [`SESSION_END_DELAY_SECONDS`]
//! before actually ending — short blips in AC power shouldn't fragment
//! one charge into several sessions.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Power above this threshold counts as "charging" for session purposes.
pub const CHARGING_POWER_THRESHOLD_W: f64 = 100.0;

/// Minimum continuous time above threshold before a candidate session
/// is confirmed, absent an energy-delta confirmation.
pub const START_CONFIRMATION_SECONDS: i64 = 30;

/// Minimum energy delivered before a candidate session is confirmed,
/// absent a time confirmation.
pub const START_CONFIRMATION_ENERGY_KWH: f64 = 0.01;

/// How long a drop below the charging threshold is tolerated before the
/// active session is actually ended.
pub const SESSION_END_DELAY_SECONDS: i64 = 30;

/// A confirmed or in-progress charging session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargingSession {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub start_energy_kwh: f64,
    pub end_energy_kwh: Option<f64>,
    pub energy_delivered_kwh: f64,
    pub peak_power_w: f64,
    pub average_power_w: f64,
    pub cost: Option<f64>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    Completed,
    Interrupted,
    Failed,
}

/// A not-yet-confirmed session start, tracked while power is above
/// threshold but neither confirmation rule has fired yet.
#[derive(Debug, Clone)]
struct Candidate {
    first_seen: DateTime<Utc>,
    start_energy_kwh: f64,
}

/// Serializable session-manager state for persistence (§4.6): the active
/// session (if any), the last completed one, and the lifetime counters
/// (`total_sessions`, `total_energy_kWh`) that accumulate across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionState {
    pub current_session: Option<ChargingSession>,
    pub last_session: Option<ChargingSession>,
    pub total_sessions: u64,
    pub total_energy_kwh: f64,
}

pub struct ChargingSessionManager {
    pub current_session: Option<ChargingSession>,
    pub last_session: Option<ChargingSession>,
    /// Count of sessions ended (completed or interrupted) since boot, plus
    /// whatever was restored from persistence.
    pub total_sessions: u64,
    /// Lifetime energy delivered across all ended sessions (kWh), §4.5.
    pub total_energy_kwh: f64,
    session_history: Vec<ChargingSession>,
    max_history_size: usize,
    candidate: Option<Candidate>,
    below_threshold_since: Option<DateTime<Utc>>,
}

impl ChargingSessionManager {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            current_session: None,
            last_session: None,
            total_sessions: 0,
            total_energy_kwh: 0.0,
            session_history: Vec::with_capacity(max_history_size),
            max_history_size,
            candidate: None,
            below_threshold_since: None,
        }
    }

    /// Feed one measurement into the tracker. Handles candidate
    /// confirmation, ongoing updates, and end-grace in one call so the
    /// control loop only needs to call this once per poll.
    pub fn observe(&mut self, power_w: f64, energy_kwh: f64, now: DateTime<Utc>) {
        let charging = power_w > CHARGING_POWER_THRESHOLD_W;

        if self.current_session.is_some() {
            if charging {
                self.below_threshold_since = None;
                self.update(power_w, energy_kwh, now);
            } else {
                let since = *self.below_threshold_since.get_or_insert(now);
                if (now - since).num_seconds() >= SESSION_END_DELAY_SECONDS {
                    self.end_session(energy_kwh, now);
                }
            }
            return;
        }

        if !charging {
            self.candidate = None;
            return;
        }

        let candidate = self.candidate.get_or_insert(Candidate {
            first_seen: now,
            start_energy_kwh: energy_kwh,
        });

        let energy_delta = energy_kwh - candidate.start_energy_kwh;
        let elapsed = (now - candidate.first_seen).num_seconds();

        if energy_delta >= START_CONFIRMATION_ENERGY_KWH || elapsed >= START_CONFIRMATION_SECONDS {
            let start_energy = candidate.start_energy_kwh;
            let start_time = candidate.first_seen;
            self.candidate = None;
            self.start_session_at(start_energy, start_time);
            self.update(power_w, energy_kwh, now);
        }
    }

    fn start_session_at(&mut self, start_energy_kwh: f64, start_time: DateTime<Utc>) {
        let session = ChargingSession {
            id: uuid::Uuid::new_v4().to_string(),
            start_time,
            end_time: None,
            start_energy_kwh,
            end_energy_kwh: None,
            energy_delivered_kwh: 0.0,
            peak_power_w: 0.0,
            average_power_w: 0.0,
            cost: None,
            status: SessionStatus::Active,
        };
        tracing::info!(session_id = %session.id, "charging session started");
        self.current_session = Some(session);
    }

    fn update(&mut self, power_w: f64, energy_kwh: f64, now: DateTime<Utc>) {
        let Some(session) = self.current_session.as_mut() else {
            return;
        };
        session.energy_delivered_kwh = energy_kwh - session.start_energy_kwh;
        if power_w > session.peak_power_w {
            session.peak_power_w = power_w;
        }
        let duration_hours = (now - session.start_time).num_seconds() as f64 / 3600.0;
        if duration_hours > 0.0 {
            session.average_power_w = session.energy_delivered_kwh / duration_hours * 1000.0;
        }
    }

    fn end_session(&mut self, end_energy_kwh: f64, now: DateTime<Utc>) {
        let Some(mut session) = self.current_session.take() else {
            return;
        };
        session.end_time = Some(now);
        session.end_energy_kwh = Some(end_energy_kwh);
        session.energy_delivered_kwh = end_energy_kwh - session.start_energy_kwh;
        session.status = SessionStatus::Completed;

        self.total_sessions += 1;
        self.total_energy_kwh += session.energy_delivered_kwh;

        tracing::info!(
            session_id = %session.id,
            energy_delivered_kwh = session.energy_delivered_kwh,
            total_sessions = self.total_sessions,
            total_energy_kwh = self.total_energy_kwh,
            "charging session ended"
        );

        self.last_session = Some(session.clone());
        self.session_history.push(session);
        if self.session_history.len() > self.max_history_size {
            self.session_history.remove(0);
        }
        self.below_threshold_since = None;
    }

    /// Force-end the active session on shutdown or a detected fault,
    /// marking it `Interrupted` rather than `Completed`.
    pub fn interrupt(&mut self, end_energy_kwh: f64, now: DateTime<Utc>) {
        if let Some(mut session) = self.current_session.take() {
            session.end_time = Some(now);
            session.end_energy_kwh = Some(end_energy_kwh);
            session.energy_delivered_kwh = end_energy_kwh - session.start_energy_kwh;
            session.status = SessionStatus::Interrupted;
            self.total_sessions += 1;
            self.total_energy_kwh += session.energy_delivered_kwh;
            self.last_session = Some(session.clone());
            self.session_history.push(session);
        }
        self.candidate = None;
        self.below_threshold_since = None;
    }

    pub fn get_session_stats(&self) -> serde_json::Value {
        let mut stats = serde_json::Map::new();
        match &self.current_session {
            Some(session) => {
                stats.insert("session_active".to_string(), true.into());
                stats.insert(
                    "session_duration_min".to_string(),
                    (((Utc::now() - session.start_time).num_seconds() / 60) as u64).into(),
                );
                stats.insert(
                    "energy_delivered_kwh".to_string(),
                    session.energy_delivered_kwh.into(),
                );
            }
            None => {
                stats.insert("session_active".to_string(), false.into());
                stats.insert("session_duration_min".to_string(), serde_json::Value::Null);
                stats.insert("energy_delivered_kwh".to_string(), serde_json::Value::Null);
            }
        }
        serde_json::Value::Object(stats)
    }

    /// Snapshot the persistable portion of session state (§4.6).
    pub fn get_state(&self) -> SessionState {
        SessionState {
            current_session: self.current_session.clone(),
            last_session: self.last_session.clone(),
            total_sessions: self.total_sessions,
            total_energy_kwh: self.total_energy_kwh,
        }
    }

    /// Restore session state read back from disk at boot. A session
    /// that was active when the daemon last stopped is restored as-is;
    /// the next `observe()` call resumes tracking it normally.
    pub fn restore_state(&mut self, state: SessionState) -> Result<()> {
        self.current_session = state.current_session;
        self.last_session = state.last_session;
        self.total_sessions = state.total_sessions;
        self.total_energy_kwh = state.total_energy_kwh;
        Ok(())
    }
}

impl Default for ChargingSessionManager {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn t(offset_secs: i64) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::seconds(offset_secs)
    }

    #[test]
    fn power_below_threshold_never_starts_a_session() {
        let mut mgr = ChargingSessionManager::new(10);
        mgr.observe(50.0, 0.0, t(0));
        assert!(mgr.current_session.is_none());
    }

    #[test]
    fn energy_delta_confirms_session_quickly() {
        let mut mgr = ChargingSessionManager::new(10);
        mgr.observe(2000.0, 0.0, t(0));
        assert!(mgr.current_session.is_none(), "not yet confirmed");
        mgr.observe(2000.0, 0.02, t(5));
        assert!(mgr.current_session.is_some(), "confirmed by energy delta");
    }

    #[test]
    fn time_elapsed_confirms_session_without_energy_delta() {
        let mut mgr = ChargingSessionManager::new(10);
        mgr.observe(150.0, 0.0, t(0));
        assert!(mgr.current_session.is_none());
        mgr.observe(150.0, 0.0001, t(START_CONFIRMATION_SECONDS + 1));
        assert!(mgr.current_session.is_some());
    }

    #[test]
    fn brief_drop_below_threshold_does_not_end_session() {
        let mut mgr = ChargingSessionManager::new(10);
        mgr.observe(2000.0, 0.0, t(0));
        mgr.observe(2000.0, 0.02, t(1));
        assert!(mgr.current_session.is_some());

        mgr.observe(0.0, 0.02, t(2));
        assert!(mgr.current_session.is_some(), "within grace window");

        mgr.observe(2000.0, 0.03, t(5));
        assert!(mgr.current_session.is_some(), "recovered before grace expired");
    }

    #[test]
    fn sustained_drop_ends_session_after_grace_window() {
        let mut mgr = ChargingSessionManager::new(10);
        mgr.observe(2000.0, 0.0, t(0));
        mgr.observe(2000.0, 0.02, t(1));
        assert!(mgr.current_session.is_some());

        mgr.observe(0.0, 0.02, t(2));
        mgr.observe(0.0, 0.02, t(2 + SESSION_END_DELAY_SECONDS + 1));

        assert!(mgr.current_session.is_none());
        assert!(mgr.last_session.is_some());
        assert_eq!(mgr.last_session.unwrap().status, SessionStatus::Completed);
    }

    #[test]
    fn interrupt_marks_session_interrupted() {
        let mut mgr = ChargingSessionManager::new(10);
        mgr.observe(2000.0, 0.0, t(0));
        mgr.observe(2000.0, 0.02, t(1));
        assert!(mgr.current_session.is_some());

        mgr.interrupt(0.05, t(10));
        assert!(mgr.current_session.is_none());
        assert_eq!(
            mgr.last_session.as_ref().unwrap().status,
            SessionStatus::Interrupted
        );
    }

    #[test]
    fn lifetime_counters_accumulate_across_sessions() {
        let mut mgr = ChargingSessionManager::new(10);
        mgr.observe(2000.0, 0.0, t(0));
        mgr.observe(2000.0, 0.02, t(1));
        mgr.observe(0.0, 0.02, t(2));
        mgr.observe(0.0, 0.02, t(2 + SESSION_END_DELAY_SECONDS + 1));
        assert_eq!(mgr.total_sessions, 1);
        assert!((mgr.total_energy_kwh - 0.02).abs() < 1e-9);

        mgr.observe(2000.0, 0.02, t(1000));
        mgr.observe(2000.0, 0.05, t(1001));
        mgr.observe(0.0, 0.05, t(1002));
        mgr.observe(0.0, 0.05, t(1002 + SESSION_END_DELAY_SECONDS + 1));
        assert_eq!(mgr.total_sessions, 2);
        assert!((mgr.total_energy_kwh - 0.05).abs() < 1e-9);
    }

    #[test]
    fn state_round_trips_through_restore() {
        let mut mgr = ChargingSessionManager::new(10);
        mgr.observe(2000.0, 0.0, t(0));
        mgr.observe(2000.0, 0.02, t(1));
        let state = mgr.get_state();

        let mut restored = ChargingSessionManager::new(10);
        restored.restore_state(state).unwrap();
        assert_eq!(
            restored.current_session.unwrap().id,
            mgr.current_session.unwrap().id
        );
    }

    #[test]
    fn candidate_never_becomes_session_if_power_drops_before_confirmation() {
        let mut mgr = ChargingSessionManager::new(10);
        mgr.observe(150.0, 0.0, t(0));
        mgr.observe(0.0, 0.0, t(1));
        assert!(mgr.current_session.is_none());
        mgr.observe(150.0, 0.0, t(2));
        mgr.observe(150.0, 0.0001, t(2 + START_CONFIRMATION_SECONDS + 1));
        assert!(mgr.current_session.is_some(), "candidate timer restarted cleanly");
    }
}
