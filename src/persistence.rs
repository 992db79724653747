//! On-disk persistence for operator intent and session state (§4.6)
//!
//! Survives a restart without re-deriving intent from nothing: the
//! operator's mode/start-stop/set-current choices, the minimum-charge
//! hysteresis timestamp, and the session tracker's state are all
//! written here. Writes are atomic — the new state is written to a
//! temp file in the same directory and renamed over the target, so a
//! crash mid-write never leaves a half-written, unparsable file behind
//! (invariant 6). A missing or corrupt file on load is tolerated: it's
//! logged and treated as an empty document, never a fatal error.

use crate::error::Result;
use crate::session::SessionState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything that survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    /// Operating mode: 0 = Manual, 1 = Auto, 2 = Scheduled
    pub mode: u32,

    /// Start/stop state: 0 = stopped, 1 = started
    pub start_stop: u32,

    /// Last intended set-current, in amperes
    pub set_current: f32,

    /// Unix timestamp of when the minimum-charge hysteresis first
    /// observed insufficient solar, or 0.0 if not currently running
    pub insufficient_solar_start: f64,

    /// Unix timestamp the currently-tracked session (if any) started,
    /// or 0.0 if no session is active. Mirrors `session.current_session`
    /// but kept separately for quick inspection without deserializing it.
    pub charging_start_time: f64,

    /// Session tracker state: current/last session plus the lifetime
    /// `total_sessions`/`total_energy_kWh` counters (§4.6).
    pub session: SessionState,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            mode: 0,
            start_stop: 0,
            set_current: 6.0,
            insufficient_solar_start: 0.0,
            charging_start_time: 0.0,
            session: SessionState::default(),
        }
    }
}

pub struct PersistenceManager {
    file_path: PathBuf,
    state: PersistentState,
}

impl PersistenceManager {
    pub fn new(file_path: &str) -> Self {
        Self {
            file_path: PathBuf::from(file_path),
            state: PersistentState::default(),
        }
    }

    /// Load state from disk. A missing file is the normal first-boot
    /// case; an unparsable file is logged and replaced with defaults
    /// rather than aborting startup.
    pub fn load(&mut self) -> Result<()> {
        if !self.file_path.exists() {
            tracing::info!(path = %self.file_path.display(), "no persistent state file found, using defaults");
            return Ok(());
        }

        let contents = std::fs::read_to_string(&self.file_path)?;
        match serde_json::from_str(&contents) {
            Ok(state) => {
                self.state = state;
                tracing::info!(path = %self.file_path.display(), "loaded persistent state");
            }
            Err(e) => {
                tracing::warn!(error = %e, "persistent state file unparsable, starting from defaults");
                self.state = PersistentState::default();
            }
        }

        Ok(())
    }

    /// Persist state atomically: write to `<path>.tmp` then rename over
    /// the target. Creates the parent directory if it doesn't exist yet.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let contents = serde_json::to_string_pretty(&self.state)?;
        let tmp_path = self.file_path.with_extension("tmp");
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, &self.file_path)?;
        tracing::debug!(path = %self.file_path.display(), "saved persistent state");

        Ok(())
    }

    pub fn state(&self) -> &PersistentState {
        &self.state
    }

    pub fn set_mode(&mut self, value: u32) {
        self.state.mode = value;
    }

    pub fn set_start_stop(&mut self, value: u32) {
        self.state.start_stop = value;
    }

    pub fn set_set_current(&mut self, value: f32) {
        self.state.set_current = value;
    }

    pub fn set_insufficient_solar_start(&mut self, value: f64) {
        self.state.insufficient_solar_start = value;
    }

    pub fn set_charging_start_time(&mut self, value: f64) {
        self.state.charging_start_time = value;
    }

    pub fn set_session(&mut self, session: SessionState) {
        self.state.session = session;
    }

    pub fn session(&self) -> SessionState {
        self.state.session.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn path_in(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempdir().unwrap();
        let mut mgr = PersistenceManager::new(&path_in(&dir, "state.json"));
        mgr.load().unwrap();
        assert_eq!(mgr.state().mode, 0);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = path_in(&dir, "state.json");
        let mut mgr = PersistenceManager::new(&path);
        mgr.set_mode(1);
        mgr.set_set_current(16.0);
        mgr.save().unwrap();

        let mut reloaded = PersistenceManager::new(&path);
        reloaded.load().unwrap();
        assert_eq!(reloaded.state().mode, 1);
        assert_eq!(reloaded.state().set_current, 16.0);
    }

    #[test]
    fn save_creates_missing_parent_directory() {
        let dir = tempdir().unwrap();
        let path = path_in(&dir, "nested/deep/state.json");
        let mgr = PersistenceManager::new(&path);
        mgr.save().unwrap();
        assert!(Path::new(&path).exists());
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults_without_error() {
        let dir = tempdir().unwrap();
        let path = path_in(&dir, "state.json");
        std::fs::write(&path, "not json at all").unwrap();

        let mut mgr = PersistenceManager::new(&path);
        let result = mgr.load();
        assert!(result.is_ok());
        assert_eq!(mgr.state().mode, 0);
    }

    #[test]
    fn save_does_not_leave_a_tmp_file_behind() {
        let dir = tempdir().unwrap();
        let path = path_in(&dir, "state.json");
        let mgr = PersistenceManager::new(&path);
        mgr.save().unwrap();
        assert!(!Path::new(&path).with_extension("tmp").exists());
    }
}
