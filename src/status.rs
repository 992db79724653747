//! Status mapper: IEC 61851 mode-3 state → published status code
//!
//! Turns the charger's 5-register ASCII state string into the small
//! status enum the host bus understands, then overlays the operator
//! context (enable, mode, schedule membership, low-SOC) on top of the
//! raw mapping.

/// Status codes published on the host bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected = 0,
    Connected = 1,
    Charging = 2,
    Charged = 3,
    WaitSun = 4,
    WaitStart = 6,
    LowSoc = 7,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Raw IEC 61851 mode-3 state classification, before any overlay.
fn raw_status(state: &str) -> Status {
    let s = state.trim().to_ascii_uppercase();
    if s.starts_with('A') {
        Status::Disconnected
    } else if matches!(s.as_str(), "B1" | "B2" | "C1" | "D1") {
        Status::Connected
    } else if matches!(s.as_str(), "C2" | "D2") {
        Status::Charging
    } else {
        tracing::warn!(state = %s, "unrecognized charger state, treating as disconnected");
        Status::Disconnected
    }
}

/// Tracks the previous raw status across polls so the mapper can derive
/// the optional `CHARGED` transition (§4.3).
#[derive(Debug, Default)]
pub struct StatusMapper {
    previous_raw: Option<Status>,
}

/// Context the overlay rules need beyond the raw state string.
pub struct StatusContext {
    pub enable_on: bool,
    pub auto_mode: bool,
    pub scheduled_mode: bool,
    pub in_schedule_window: bool,
    pub low_soc: bool,
    pub effective_amps: f32,
    pub min_charging_current: f32,
}

impl StatusMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map the raw state plus context into the published status, applying
    /// the overlay rules in order and updating the CHARGED-derivation memory.
    pub fn map(&mut self, state: &str, ctx: &StatusContext) -> Status {
        let raw = raw_status(state);

        let charged_transition = matches!(self.previous_raw, Some(Status::Charging))
            && matches!(raw, Status::Connected)
            && matches!(state.trim().to_ascii_uppercase().as_str(), "B1" | "B2" | "D1");
        self.previous_raw = Some(raw);

        if !matches!(raw, Status::Connected | Status::Charging) {
            return raw;
        }

        if ctx.low_soc {
            return Status::LowSoc;
        }
        if !ctx.enable_on {
            return Status::WaitStart;
        }
        if ctx.auto_mode && ctx.effective_amps <= ctx.min_charging_current {
            return Status::WaitSun;
        }
        if ctx.scheduled_mode && !ctx.in_schedule_window {
            return Status::WaitStart;
        }
        if charged_transition {
            return Status::Charged;
        }
        raw
    }
}
