//! Control engine (§4.8): the single owner of all mutating state
//!
//! A cooperative loop driven by a periodic tick and by callback events,
//! invoking the wire codec, Modbus transport, status mapper, policy
//! engine, session tracker, persistence, and publisher in the order
//! §4.8 specifies. Nothing outside this module ever touches the Modbus
//! transport or writes to the publisher's outbound paths — external
//! agents only ever reach [`crate::publisher::Publisher::request_write`],
//! which enqueues a [`ControlEvent`] this loop drains.

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::modbus::{ModbusOps, with_retry};
use crate::persistence::PersistenceManager;
use crate::policy::{EssStrategy, MIN_CHARGING_AMPS, Mode, PolicyEngine, PolicyInput};
use crate::price::{CachedPriceProvider, PriceProvider};
use crate::publisher::{ControlEvent, Publisher, PublisherValue};
use crate::session::ChargingSessionManager;
use crate::status::{Status, StatusContext, StatusMapper};
use crate::wire;
use chrono::{DateTime, Timelike, Utc, Weekday};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn mode_code(mode: Mode) -> u8 {
    match mode {
        Mode::Manual => 0,
        Mode::Auto => 1,
        Mode::Scheduled => 2,
    }
}

fn mode_from_code(code: u8) -> Result<Mode> {
    match code {
        0 => Ok(Mode::Manual),
        1 => Ok(Mode::Auto),
        2 => Ok(Mode::Scheduled),
        other => Err(GatewayError::validation("mode", format!("unknown mode code {other}"))),
    }
}

/// Operator intent (§3): mutated only by callback events or restored at boot.
#[derive(Debug, Clone, Copy)]
struct Intent {
    mode: Mode,
    enable: bool,
    intended_amps: f32,
    auto_start: bool,
}

/// Values refreshed from the device (§3).
#[derive(Debug, Clone, Default)]
struct Derived {
    station_max_amps: f32,
    active_phases: u8,
    firmware: String,
    serial: String,
    manufacturer: String,
}

/// Set-point write bookkeeping (§3, §4.9).
#[derive(Debug, Clone)]
struct ControlState {
    last_sent_amps: f32,
    last_send_time: Instant,
    last_positive_send_time: Option<Instant>,
    /// Wall-clock time the policy engine first reported its AUTO-mode
    /// candidate below the minimum charging current (§9 open question:
    /// observability only, never read back into a policy decision).
    insufficient_solar_since: Option<DateTime<Utc>>,
}

/// Last-decoded telemetry (§3).
#[derive(Debug, Clone, Default)]
struct Telemetry {
    l1_v: f64,
    l2_v: f64,
    l3_v: f64,
    l1_i: f64,
    l2_i: f64,
    l3_i: f64,
    l1_p: f64,
    l2_p: f64,
    l3_p: f64,
    total_p: f64,
    total_energy_kwh: f64,
    socket_state: String,
}

/// PV/consumption/battery readings the solar-excess calculation needs
/// (§4.4.2). These arrive from other devices on the host bus; the
/// concrete integration that feeds them is, like the price provider,
/// an external collaborator — [`GatewayEngine::set_solar_inputs`] is
/// the narrow interface it's expected to call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolarInputs {
    pub total_pv_w: f32,
    pub consumption_w: f32,
    pub battery_w: f32,
}

/// The control engine. Single-writer over the Modbus transport, the
/// publisher's outbound paths, and all fields below (§5).
pub struct GatewayEngine {
    config: Config,
    transport: Box<dyn ModbusOps>,
    publisher: Arc<Mutex<Publisher>>,
    events_rx: mpsc::UnboundedReceiver<ControlEvent>,
    persistence: PersistenceManager,

    policy: PolicyEngine,
    status_mapper: StatusMapper,
    sessions: ChargingSessionManager,

    price_provider: Option<Arc<dyn PriceProvider>>,
    price_cache: Option<CachedPriceProvider>,

    intent: Intent,
    derived: Derived,
    control: ControlState,
    telemetry: Telemetry,
    solar: SolarInputs,
    /// Asserted by an external SOC integration (out of scope here, same
    /// boundary as the price provider); defaults to false.
    low_soc: bool,
    ess_strategy: EssStrategy,

    last_status: Option<Status>,
    last_persist: Instant,
}

impl GatewayEngine {
    pub fn new(
        config: Config,
        transport: Box<dyn ModbusOps>,
        publisher: Arc<Mutex<Publisher>>,
        events_rx: mpsc::UnboundedReceiver<ControlEvent>,
        persistence: PersistenceManager,
        price_provider: Option<Arc<dyn PriceProvider>>,
    ) -> Self {
        let intended_amps = config.defaults.intended_set_current;
        let station_max_amps = config.defaults.station_max_current;
        Self {
            intent: Intent {
                mode: Mode::Manual,
                enable: false,
                intended_amps,
                auto_start: false,
            },
            derived: Derived {
                station_max_amps,
                active_phases: 3,
                ..Derived::default()
            },
            control: ControlState {
                last_sent_amps: 0.0,
                last_send_time: Instant::now(),
                last_positive_send_time: None,
                insufficient_solar_since: None,
            },
            telemetry: Telemetry::default(),
            solar: SolarInputs::default(),
            low_soc: false,
            ess_strategy: EssStrategy::Idle,
            policy: PolicyEngine::new(),
            status_mapper: StatusMapper::new(),
            sessions: ChargingSessionManager::default(),
            price_provider,
            price_cache: None,
            last_status: None,
            last_persist: Instant::now(),
            config,
            transport,
            publisher,
            events_rx,
            persistence,
        }
    }

    /// Feed in the latest PV/consumption/battery reading. Called by
    /// whatever watches the relevant host-bus paths; harmless to call
    /// from a context that never does, in which case solar-excess stays
    /// at zero and AUTO/idle behaves as if there's no PV at all.
    pub fn set_solar_inputs(&mut self, inputs: SolarInputs) {
        self.solar = inputs;
    }

    pub fn set_low_soc(&mut self, low_soc: bool) {
        self.low_soc = low_soc;
    }

    pub fn set_ess_strategy(&mut self, strategy: EssStrategy) {
        self.ess_strategy = strategy;
    }

    /// Boot sequence (§4.8): restore intent and session state, register
    /// publisher paths, connect, and read static device info.
    pub async fn boot(&mut self) -> Result<()> {
        self.persistence.load()?;
        let state = self.persistence.state().clone();
        self.intent.mode = mode_from_code(state.mode as u8).unwrap_or(Mode::Manual);
        self.intent.enable = state.start_stop != 0;
        self.intent.intended_amps = if state.set_current > 0.0 {
            state.set_current
        } else {
            self.config.defaults.intended_set_current
        };
        if state.insufficient_solar_start > 0.0 {
            self.control.insufficient_solar_since =
                DateTime::from_timestamp(state.insufficient_solar_start as i64, 0);
        }
        self.sessions.restore_state(self.persistence.session())?;

        if self.config.price.enabled
            && let Some(provider) = self.price_provider.clone()
        {
            self.price_cache = Some(CachedPriceProvider::spawn(
                provider,
                Duration::from_secs(self.config.price.cache_ttl_secs),
            ));
        }

        self.register_static_paths();

        match self.transport.connect().await {
            Ok(()) => {
                self.refresh_static_info().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "initial connect failed, will retry on tick");
            }
        }

        Ok(())
    }

    fn register_static_paths(&mut self) {
        let mut p = self.publisher.lock().expect("publisher mutex poisoned");
        p.register("/ProductName", "EV Charger Gateway".into(), false);
        p.register("/FirmwareVersion", "".into(), false);
        p.register("/Serial", "".into(), false);
        p.register("/ProductId", PublisherValue::Int(0xC024), false);
        p.register("/Connected", PublisherValue::Int(0), false);
        p.register("/Mgmt/ProcessName", "evgate".into(), false);
        p.register("/Mgmt/ProcessVersion", env!("CARGO_PKG_VERSION").into(), false);
        p.register("/Mgmt/Connection", "Modbus TCP".into(), false);
        p.register(
            "/DeviceInstance",
            PublisherValue::Int(self.config.device_instance as i64),
            false,
        );
        p.register("/Status", PublisherValue::Int(0), false);
        p.register("/Mode", PublisherValue::Int(mode_code(self.intent.mode) as i64), true);
        p.register("/StartStop", PublisherValue::Int(self.intent.enable as i64), true);
        p.register(
            "/SetCurrent",
            PublisherValue::Float(self.intent.intended_amps as f64),
            true,
        );
        p.register("/AutoStart", PublisherValue::Int(self.intent.auto_start as i64), true);
        p.register("/MaxCurrent", PublisherValue::Float(self.derived.station_max_amps as f64), false);
        p.register("/Current", PublisherValue::Float(0.0), false);
        p.register("/Ac/Current", PublisherValue::Float(0.0), false);
        p.register("/Ac/Power", PublisherValue::Float(0.0), false);
        p.register("/Ac/Energy/Forward", PublisherValue::Float(0.0), false);
        for phase in ["L1", "L2", "L3"] {
            p.register(&format!("/Ac/{phase}/Voltage"), PublisherValue::Float(0.0), false);
            p.register(&format!("/Ac/{phase}/Current"), PublisherValue::Float(0.0), false);
            p.register(&format!("/Ac/{phase}/Power"), PublisherValue::Float(0.0), false);
        }
        p.register("/Ac/PhaseCount", PublisherValue::Int(0), false);
        p.register("/ChargingTime", PublisherValue::Int(0), false);
    }

    async fn refresh_static_info(&mut self) {
        let r = self.config.registers.clone();
        let station = self.config.modbus.station_unit_id;

        if let Some(regs) = self.try_read(r.firmware_version, r.firmware_version_count, station).await {
            self.derived.firmware = wire::decode_ascii(&regs);
        }
        if let Some(regs) = self.try_read(r.station_serial, r.station_serial_count, station).await {
            self.derived.serial = wire::decode_ascii(&regs);
        }
        if let Some(regs) = self.try_read(r.manufacturer, r.manufacturer_count, station).await {
            self.derived.manufacturer = wire::decode_ascii(&regs);
        }
        if let Some(regs) = self.try_read(r.station_max_current, 2, station).await {
            let v = wire::decode_f32(&regs);
            self.derived.station_max_amps = if v > 0.0 { v } else { self.config.defaults.station_max_current };
        } else {
            self.derived.station_max_amps = self.config.defaults.station_max_current;
        }
        if let Some(regs) = self.try_read(r.phases, 1, station).await {
            let p = regs.first().copied().unwrap_or(3);
            self.derived.active_phases = if p == 1 { 1 } else { 3 };
        } else {
            self.derived.active_phases = 3;
        }

        let mut p = self.publisher.lock().expect("publisher mutex poisoned");
        p.publish("/FirmwareVersion", self.derived.firmware.clone().into());
        p.publish("/Serial", self.derived.serial.clone().into());
        p.publish(
            "/Mgmt/Connection",
            format!("Modbus TCP ({})", self.derived.manufacturer).into(),
        );
        p.publish("/MaxCurrent", PublisherValue::Float(self.derived.station_max_amps as f64));
        p.publish("/Ac/PhaseCount", PublisherValue::Int(self.derived.active_phases as i64));
        p.publish("/Connected", PublisherValue::Int(1));
    }

    /// One register block read, retried per §4.2, logged and nulled on
    /// exhaustion rather than propagated (§4.8 step 2).
    async fn try_read(&mut self, address: u16, count: u16, unit_id: u8) -> Option<Vec<u16>> {
        let max_retries = self.config.controls.max_retries;
        let delay = Duration::from_secs_f64(self.config.controls.retry_delay_secs);
        let transport = &mut self.transport;
        let result = with_retry(max_retries, delay, || {
            let t = &mut *transport;
            async move { t.read_holding(address, count, unit_id).await }
        })
        .await;
        match result {
            Ok(regs) => Some(regs),
            Err(e) => {
                tracing::debug!(address, count, unit_id, error = %e, "register read failed");
                None
            }
        }
    }

    fn local_now(&self, wall_now: DateTime<Utc>) -> (Weekday, u32) {
        match self.config.timezone.parse::<chrono_tz::Tz>() {
            Ok(tz) => {
                let local = wall_now.with_timezone(&tz);
                (local.weekday(), local.hour() * 60 + local.minute())
            }
            Err(_) => {
                tracing::warn!(timezone = %self.config.timezone, "invalid timezone, using UTC");
                (wall_now.weekday(), wall_now.hour() * 60 + wall_now.minute())
            }
        }
    }

    fn in_schedule_window(&self, wall_now: DateTime<Utc>) -> bool {
        let (weekday, minute_of_day) = self.local_now(wall_now);
        PolicyEngine::in_schedule(&self.config.schedule, weekday, minute_of_day)
    }

    /// Track when the policy engine's AUTO-mode candidate first dropped
    /// below the minimum charging current, purely for observability
    /// (§9 open question): set on the rising edge, cleared once the
    /// candidate recovers.
    fn record_hysteresis(&mut self, below_floor: bool, wall_now: DateTime<Utc>) {
        if below_floor {
            self.control.insufficient_solar_since.get_or_insert(wall_now);
        } else {
            self.control.insufficient_solar_since = None;
        }
    }

    fn price_ok(&self) -> bool {
        if !self.config.price.enabled {
            return true;
        }
        self.price_cache.as_ref().map(|c| c.current().should_charge_now).unwrap_or(true)
    }

    fn policy_input(&self, in_schedule_window: bool, price_ok: bool) -> PolicyInput {
        PolicyInput {
            mode: self.intent.mode,
            enable: self.intent.enable,
            intended_amps: self.intent.intended_amps,
            station_max_amps: self.derived.station_max_amps,
            max_set_current: self.config.controls.max_set_current,
            min_charging_amps: MIN_CHARGING_AMPS,
            low_soc: self.low_soc,
            price_ok,
            in_schedule_window,
            ess_strategy: self.ess_strategy,
            total_pv_w: self.solar.total_pv_w,
            consumption_w: self.solar.consumption_w,
            ev_power_w: self.telemetry.total_p as f32,
            battery_w: self.solar.battery_w,
            active_phases: self.derived.active_phases,
            min_charge_duration: Duration::from_secs(self.config.controls.min_charge_duration_secs),
        }
    }

    /// One tick (§4.8): poll, decode, feed the session tracker, map
    /// status, compute the effective current, write if warranted, and
    /// periodically persist. `now` drives all monotonic comparisons
    /// (watchdog, hysteresis); `wall_now` drives schedule and session
    /// timestamps — split out so tests can supply both deterministically.
    pub async fn tick(&mut self, now: Instant, wall_now: DateTime<Utc>) -> Result<()> {
        if !self.transport.is_connected() {
            let delay = Duration::from_secs_f64(self.config.controls.retry_delay_secs);
            let max_attempts = self.config.controls.max_retries;
            match self.transport.reconnect(delay, max_attempts).await {
                Ok(()) => {
                    tracing::info!("reconnected to charger");
                    self.refresh_static_info().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reconnect attempt failed, skipping tick");
                    return Ok(());
                }
            }
        }

        let r = self.config.registers.clone();
        let socket = self.config.modbus.socket_unit_id;
        let station = self.config.modbus.station_unit_id;

        let voltages = self.try_read(r.voltages, 6, socket).await;
        let currents = self.try_read(r.currents, 6, socket).await;
        let power = self.try_read(r.power, 8, socket).await;
        let energy = self.try_read(r.energy, 4, socket).await;
        let socket_state = self.try_read(r.socket_state, 5, socket).await;

        if voltages.is_none() && currents.is_none() && power.is_none() && energy.is_none() && socket_state.is_none()
        {
            tracing::error!("all modbus reads failed this tick, will reconnect next tick");
            self.transport.close();
            self.publisher
                .lock()
                .expect("publisher mutex poisoned")
                .publish("/Connected", PublisherValue::Int(0));
            return Err(GatewayError::modbus("MODBUS_READ: all register reads failed"));
        }

        if let Some(regs) = &voltages {
            self.telemetry.l1_v = wire::decode_f32(&regs[0..2]) as f64;
            self.telemetry.l2_v = wire::decode_f32(&regs[2..4]) as f64;
            self.telemetry.l3_v = wire::decode_f32(&regs[4..6]) as f64;
        }
        if let Some(regs) = &currents {
            self.telemetry.l1_i = wire::decode_f32(&regs[0..2]) as f64;
            self.telemetry.l2_i = wire::decode_f32(&regs[2..4]) as f64;
            self.telemetry.l3_i = wire::decode_f32(&regs[4..6]) as f64;
        }
        if let Some(regs) = &power {
            // 4x f32 BE: L1, L2, L3, total (the only layout 8 registers fit).
            let mut l1 = wire::decode_f32(&regs[0..2]) as f64;
            let mut l2 = wire::decode_f32(&regs[2..4]) as f64;
            let mut l3 = wire::decode_f32(&regs[4..6]) as f64;
            let mut total = wire::decode_f32(&regs[6..8]) as f64;
            let approx = |v: f64, i: f64| (v * i).round();
            if l1.abs() < 1.0 {
                l1 = approx(self.telemetry.l1_v, self.telemetry.l1_i);
            }
            if l2.abs() < 1.0 {
                l2 = approx(self.telemetry.l2_v, self.telemetry.l2_i);
            }
            if l3.abs() < 1.0 {
                l3 = approx(self.telemetry.l3_v, self.telemetry.l3_i);
            }
            if total.abs() < 1.0 {
                total = l1 + l2 + l3;
            }
            self.telemetry.l1_p = l1;
            self.telemetry.l2_p = l2;
            self.telemetry.l3_p = l3;
            self.telemetry.total_p = total;
        }
        if let Some(regs) = &energy {
            self.telemetry.total_energy_kwh = wire::decode_f64(regs) / 1000.0;
        }
        if let Some(regs) = &socket_state {
            self.telemetry.socket_state = wire::decode_ascii(regs);
        }

        if let Some(regs) = self.try_read(r.station_max_current, 2, station).await {
            let v = wire::decode_f32(&regs);
            if v > 0.0 {
                self.derived.station_max_amps = v;
            }
        }
        if let Some(regs) = self.try_read(r.phases, 1, station).await {
            if let Some(&p) = regs.first() {
                if p == 1 || p == 3 {
                    self.derived.active_phases = p as u8;
                }
            }
        }

        self.sessions
            .observe(self.telemetry.total_p, self.telemetry.total_energy_kwh, wall_now);
        let charging_time = self
            .sessions
            .current_session
            .as_ref()
            .map(|s| (wall_now - s.start_time).num_seconds().max(0))
            .unwrap_or(0);

        let in_schedule = self.in_schedule_window(wall_now);
        let status_ctx = StatusContext {
            enable_on: self.intent.enable,
            auto_mode: matches!(self.intent.mode, Mode::Auto),
            scheduled_mode: matches!(self.intent.mode, Mode::Scheduled),
            in_schedule_window: in_schedule,
            low_soc: self.low_soc,
            effective_amps: self.control.last_sent_amps,
            min_charging_current: MIN_CHARGING_AMPS,
        };
        let status = self.status_mapper.map(&self.telemetry.socket_state, &status_ctx);
        if self.last_status != Some(status) {
            tracing::info!(?status, previous = ?self.last_status, "status transition");
            self.last_status = Some(status);
        }

        let price_ok = self.price_ok();
        let input = self.policy_input(in_schedule, price_ok);
        let outcome = self.policy.evaluate(&input, now);
        let effective = outcome.effective_amps;
        self.record_hysteresis(outcome.below_floor, wall_now);

        {
            let mut p = self.publisher.lock().expect("publisher mutex poisoned");
            p.publish("/Status", PublisherValue::Int(status.code() as i64));
            p.publish("/Current", PublisherValue::Float(self.telemetry.l1_i + self.telemetry.l2_i + self.telemetry.l3_i));
            p.publish(
                "/Ac/Current",
                PublisherValue::Float(self.telemetry.l1_i + self.telemetry.l2_i + self.telemetry.l3_i),
            );
            p.publish("/Ac/Power", PublisherValue::Float(self.telemetry.total_p));
            p.publish("/Ac/Energy/Forward", PublisherValue::Float(self.telemetry.total_energy_kwh));
            p.publish("/Ac/L1/Voltage", PublisherValue::Float(self.telemetry.l1_v));
            p.publish("/Ac/L2/Voltage", PublisherValue::Float(self.telemetry.l2_v));
            p.publish("/Ac/L3/Voltage", PublisherValue::Float(self.telemetry.l3_v));
            p.publish("/Ac/L1/Current", PublisherValue::Float(self.telemetry.l1_i));
            p.publish("/Ac/L2/Current", PublisherValue::Float(self.telemetry.l2_i));
            p.publish("/Ac/L3/Current", PublisherValue::Float(self.telemetry.l3_i));
            p.publish("/Ac/L1/Power", PublisherValue::Float(self.telemetry.l1_p));
            p.publish("/Ac/L2/Power", PublisherValue::Float(self.telemetry.l2_p));
            p.publish("/Ac/L3/Power", PublisherValue::Float(self.telemetry.l3_p));
            p.publish("/ChargingTime", PublisherValue::Int(charging_time));
        }

        let force_update =
            now.duration_since(self.control.last_send_time) >= Duration::from_secs(self.config.controls.watchdog_interval_secs);
        let change = (effective - self.control.last_sent_amps).abs() > self.config.controls.update_difference_threshold;
        if force_update || change {
            if let Err(e) = self.write_set_point(effective, false, now).await {
                tracing::warn!(error = %e, "set-point write failed, watchdog will retry");
            }
        }

        if now.duration_since(self.last_persist) >= Duration::from_secs(60) {
            self.persist_snapshot();
            self.last_persist = now;
        }

        Ok(())
    }

    /// Callback handling (§4.8, §9): validate and clamp, update intent,
    /// persist, recompute, and write with verification.
    pub async fn handle_event(&mut self, event: ControlEvent, now: Instant, wall_now: DateTime<Utc>) -> Result<()> {
        {
            let mut p = self.publisher.lock().expect("publisher mutex poisoned");
            match event {
                ControlEvent::SetMode(code) => {
                    let mode = mode_from_code(code)?;
                    self.intent.mode = mode;
                    p.publish("/Mode", PublisherValue::Int(code as i64));
                    self.persistence.set_mode(code as u32);
                }
                ControlEvent::SetEnable(v) => {
                    self.intent.enable = v != 0;
                    p.publish("/StartStop", PublisherValue::Int(if v != 0 { 1 } else { 0 }));
                    self.persistence.set_start_stop(if v != 0 { 1 } else { 0 });
                }
                ControlEvent::SetCurrent(amps) => {
                    if !amps.is_finite() || amps < 0.0 {
                        return Err(GatewayError::validation("set_current", "must be a finite, non-negative amperage"));
                    }
                    self.intent.intended_amps = amps;
                    p.publish("/SetCurrent", PublisherValue::Float(amps as f64));
                    self.persistence.set_set_current(amps);
                }
                ControlEvent::SetAutoStart(v) => {
                    self.intent.auto_start = v != 0;
                    p.publish("/AutoStart", PublisherValue::Int(if v != 0 { 1 } else { 0 }));
                }
            }
        }

        if let Err(e) = self.persistence.save() {
            tracing::warn!(error = %e, "failed to persist intent change");
        }

        let in_schedule = self.in_schedule_window(wall_now);
        let price_ok = self.price_ok();
        let input = self.policy_input(in_schedule, price_ok);
        let outcome = self.policy.evaluate(&input, now);
        self.record_hysteresis(outcome.below_floor, wall_now);
        if let Err(e) = self.write_set_point(outcome.effective_amps, true, now).await {
            tracing::warn!(error = %e, "callback-originated write failed; watchdog will retry");
        }
        Ok(())
    }

    /// Drain and apply any callback events without blocking. Used by
    /// [`GatewayEngine::run`]'s event branch and available directly so
    /// tests and alternate executors can pump the queue themselves.
    pub fn try_recv_event(&mut self) -> Option<ControlEvent> {
        self.events_rx.try_recv().ok()
    }

    /// Set-point write with verification (§4.9).
    async fn write_set_point(&mut self, target_raw: f32, verify: bool, now: Instant) -> Result<()> {
        let ceiling = self.derived.station_max_amps.min(self.config.controls.max_set_current).max(0.0);
        let target = target_raw.clamp(0.0, ceiling);
        let regs = wire::encode_f32(target);

        let max_retries = self.config.controls.max_retries;
        let delay = Duration::from_secs_f64(self.config.controls.retry_delay_secs);
        let addr = self.config.registers.set_point;
        let unit = self.config.modbus.socket_unit_id;
        let transport = &mut self.transport;
        with_retry(max_retries, delay, || {
            let t = &mut *transport;
            async move { t.write_holding(addr, &regs, unit).await }
        })
        .await?;

        if verify {
            tokio::time::sleep(Duration::from_secs_f64(self.config.controls.verification_delay_secs)).await;
            let readback = self
                .try_read(addr, 2, unit)
                .await
                .ok_or_else(|| GatewayError::modbus("WRITE_VERIFY_MISMATCH: read-back failed"))?;
            let actual = wire::decode_f32(&readback);
            if (actual - target).abs() > self.config.controls.current_tolerance {
                return Err(GatewayError::modbus(format!(
                    "WRITE_VERIFY_MISMATCH: wrote {target:.2} A, read back {actual:.2} A"
                )));
            }
        }

        self.control.last_sent_amps = target;
        self.control.last_send_time = now;
        if target >= MIN_CHARGING_AMPS {
            self.control.last_positive_send_time = Some(now);
        }
        Ok(())
    }

    fn persist_snapshot(&mut self) {
        self.persistence.set_mode(mode_code(self.intent.mode) as u32);
        self.persistence.set_start_stop(self.intent.enable as u32);
        self.persistence.set_set_current(self.intent.intended_amps);
        self.persistence.set_session(self.sessions.get_state());
        let start = self
            .sessions
            .current_session
            .as_ref()
            .map(|s| s.start_time.timestamp() as f64)
            .unwrap_or(0.0);
        self.persistence.set_charging_start_time(start);
        let insufficient_solar_start = self
            .control
            .insufficient_solar_since
            .map(|t| t.timestamp() as f64)
            .unwrap_or(0.0);
        self.persistence.set_insufficient_solar_start(insufficient_solar_start);
        if let Err(e) = self.persistence.save() {
            tracing::warn!(error = %e, "failed to persist runtime snapshot");
        }
    }

    /// Shutdown (§5): best-effort zero set-point, close the transport, persist.
    async fn shutdown_sequence(&mut self) {
        tracing::info!("shutting down control engine");
        let now = Instant::now();
        if let Err(e) = self.write_set_point(0.0, false, now).await {
            tracing::warn!(error = %e, "best-effort zero set-point failed during shutdown");
        }
        self.transport.close();
        if let Some(session) = self.sessions.current_session.clone() {
            self.sessions
                .interrupt(session.end_energy_kwh.unwrap_or(self.telemetry.total_energy_kwh), Utc::now());
        }
        self.persist_snapshot();
    }

    /// Run the engine until `shutdown` resolves: boot, then alternate
    /// between the periodic tick and draining callback events.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        self.boot().await?;
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Instant::now();
                    let wall_now = Utc::now();
                    if let Err(e) = self.tick(now, wall_now).await {
                        tracing::error!(error = %e, "tick failed");
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    let now = Instant::now();
                    let wall_now = Utc::now();
                    if let Err(e) = self.handle_event(event, now, wall_now).await {
                        tracing::warn!(error = %e, "callback event rejected");
                    }
                }
                _ = &mut shutdown => break,
            }
        }
        self.shutdown_sequence().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleItem;
    use crate::modbus::fake::{FakeTransport, ScriptedFailure};
    use crate::publisher::PublisherValue;

    fn encode(v: f32) -> Vec<u16> {
        wire::encode_f32(v).to_vec()
    }

    struct Fixture {
        engine: GatewayEngine,
        publisher: Arc<Mutex<Publisher>>,
        _dir: tempfile::TempDir,
    }

    fn setup(config: Config) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = Arc::new(Mutex::new(Publisher::new(tx)));
        let dir = tempfile::tempdir().unwrap();
        let persistence = PersistenceManager::new(dir.path().join("state.json").to_str().unwrap());

        let socket = config.modbus.socket_unit_id;
        let station = config.modbus.station_unit_id;
        let mut transport = FakeTransport::new();
        transport.seed(config.registers.socket_state, socket, {
            let mut regs = vec![0u16; 5];
            let ascii = b"C2\0\0\0\0\0\0\0\0";
            for (i, chunk) in ascii.chunks(2).take(5).enumerate() {
                regs[i] = ((chunk[0] as u16) << 8) | chunk[1] as u16;
            }
            regs
        });
        transport.seed(config.registers.station_max_current, station, encode(config.controls.max_set_current));
        transport.seed(config.registers.phases, station, vec![3]);

        let engine = GatewayEngine::new(
            config,
            Box::new(transport),
            publisher.clone(),
            rx,
            persistence,
            None,
        );
        Fixture { engine, publisher, _dir: dir }
    }

    fn now() -> Instant {
        Instant::now()
    }

    fn wall_now() -> DateTime<Utc> {
        Utc::now()
    }

    #[tokio::test]
    async fn boot_connects_and_publishes_connected() {
        let mut fx = setup(Config::default());
        fx.engine.boot().await.unwrap();
        let publisher = fx.publisher.lock().unwrap();
        assert_eq!(publisher.get("/Connected"), Some(&PublisherValue::Int(1)));
    }

    #[tokio::test]
    async fn s1_small_change_under_threshold_does_not_write() {
        let mut config = Config::default();
        config.controls.update_difference_threshold = 0.1;
        config.controls.watchdog_interval_secs = 30;
        let mut fx = setup(config);
        fx.engine.boot().await.unwrap();

        fx.engine.intent.mode = Mode::Manual;
        fx.engine.intent.enable = true;
        fx.engine.intent.intended_amps = 10.05;
        fx.engine.control.last_sent_amps = 10.0;
        fx.engine.control.last_send_time = now();

        let t = now();
        fx.engine.tick(t, wall_now()).await.unwrap();

        assert_eq!(fx.engine.control.last_sent_amps, 10.0, "no write should have landed");
    }

    #[tokio::test]
    async fn s2_watchdog_refresh_forces_write() {
        let mut config = Config::default();
        config.controls.update_difference_threshold = 0.1;
        config.controls.watchdog_interval_secs = 30;
        let mut fx = setup(config);
        fx.engine.boot().await.unwrap();

        fx.engine.intent.mode = Mode::Manual;
        fx.engine.intent.enable = true;
        fx.engine.intent.intended_amps = 10.0;
        fx.engine.control.last_sent_amps = 10.0;
        fx.engine.control.last_send_time = now() - Duration::from_secs(31);

        let t = now();
        fx.engine.tick(t, wall_now()).await.unwrap();

        assert_eq!(fx.engine.control.last_sent_amps, 10.0);
        assert_eq!(fx.engine.control.last_send_time, t, "watchdog should have refreshed the write timestamp");
    }

    #[tokio::test]
    async fn s3_clamp_to_station_max() {
        let mut config = Config::default();
        config.controls.max_set_current = 64.0;
        let mut fx = setup(config);
        fx.engine.boot().await.unwrap();
        fx.engine.derived.station_max_amps = 32.0;

        fx.engine
            .handle_event(ControlEvent::SetMode(0), now(), wall_now())
            .await
            .unwrap();
        fx.engine
            .handle_event(ControlEvent::SetEnable(1), now(), wall_now())
            .await
            .unwrap();
        fx.engine
            .handle_event(ControlEvent::SetCurrent(50.0), now(), wall_now())
            .await
            .unwrap();

        assert_eq!(fx.engine.intent.intended_amps, 50.0, "intent mirrors the raw request");
        assert_eq!(fx.engine.control.last_sent_amps, 32.0, "write is clamped to station max");
        let publisher = fx.publisher.lock().unwrap();
        assert_eq!(publisher.get("/SetCurrent"), Some(&PublisherValue::Float(50.0)));
    }

    #[tokio::test]
    async fn insufficient_solar_since_tracked_and_persisted_as_observability_only() {
        let mut config = Config::default();
        config.controls.min_charge_duration_secs = 0;
        let mut fx = setup(config);
        fx.engine.boot().await.unwrap();

        fx.engine.intent.mode = Mode::Auto;
        fx.engine.intent.enable = true;
        fx.engine.set_ess_strategy(EssStrategy::Idle);
        fx.engine.set_solar_inputs(SolarInputs {
            total_pv_w: 0.0,
            consumption_w: 0.0,
            battery_w: 0.0,
        });

        assert!(fx.engine.control.insufficient_solar_since.is_none());
        fx.engine.tick(now(), wall_now()).await.unwrap();
        assert!(
            fx.engine.control.insufficient_solar_since.is_some(),
            "below-floor candidate should record the observability timestamp"
        );

        fx.engine.persist_snapshot();
        assert!(fx.engine.persistence.state().insufficient_solar_start > 0.0);

        // Recovering above the floor clears it again.
        fx.engine.set_solar_inputs(SolarInputs {
            total_pv_w: 230.0 * 3.0 * 10.0,
            consumption_w: 0.0,
            battery_w: 0.0,
        });
        fx.engine.tick(now(), wall_now()).await.unwrap();
        assert!(fx.engine.control.insufficient_solar_since.is_none());
    }

    #[tokio::test]
    async fn s5_schedule_wrap_membership() {
        let mut config = Config::default();
        config.timezone = "UTC".to_string();
        config.schedule.items.push(ScheduleItem {
            enabled: true,
            days_mask: 0x7F,
            start: "22:00".to_string(),
            end: "06:00".to_string(),
        });
        let fx = setup(config);

        let at = |h: u32, m: u32| {
            Utc::now()
                .with_hour(h)
                .unwrap()
                .with_minute(m)
                .unwrap()
                .with_second(0)
                .unwrap()
        };
        use chrono::Timelike;
        assert!(fx.engine.in_schedule_window(at(23, 30)));
        assert!(fx.engine.in_schedule_window(at(5, 59)));
        assert!(!fx.engine.in_schedule_window(at(6, 0)));
        assert!(!fx.engine.in_schedule_window(at(21, 59)));
    }

    #[tokio::test]
    async fn handle_event_rejects_out_of_range_current() {
        let mut fx = setup(Config::default());
        fx.engine.boot().await.unwrap();
        let err = fx
            .engine
            .handle_event(ControlEvent::SetCurrent(-5.0), now(), wall_now())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
        assert_eq!(fx.engine.intent.intended_amps, Config::default().defaults.intended_set_current);
    }

    #[tokio::test]
    async fn request_write_flows_through_publisher_to_engine() {
        let mut fx = setup(Config::default());
        fx.engine.boot().await.unwrap();

        {
            let publisher = fx.publisher.lock().unwrap();
            publisher
                .request_write("/SetCurrent", PublisherValue::Float(12.0))
                .unwrap();
        }

        let event = fx.engine.try_recv_event().expect("event should be queued");
        assert_eq!(event, ControlEvent::SetCurrent(12.0));
        fx.engine.handle_event(event, now(), wall_now()).await.unwrap();
        assert_eq!(fx.engine.intent.intended_amps, 12.0);
    }

    #[tokio::test]
    async fn all_reads_failing_closes_transport_and_errors() {
        let mut config = Config::default();
        let mut fx = setup(config.clone());
        fx.engine.boot().await.unwrap();

        // Replace the transport with one that fails every read.
        let mut transport = FakeTransport::new();
        transport.connected = true;
        transport.fail_next = vec![
            ScriptedFailure::Read,
            ScriptedFailure::Read,
            ScriptedFailure::Read,
            ScriptedFailure::Read,
            ScriptedFailure::Read,
        ];
        config.controls.max_retries = 1;
        fx.engine.config.controls.max_retries = 1;
        fx.engine.transport = Box::new(transport);

        let err = fx.engine.tick(now(), wall_now()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Modbus { .. }));
        assert!(!fx.engine.transport.is_connected());
        assert_eq!(
            fx.publisher.lock().unwrap().get("/Connected"),
            Some(&PublisherValue::Int(0))
        );
    }

    #[tokio::test]
    async fn reconnect_on_next_tick_republishes_connected_and_static_info() {
        let mut fx = setup(Config::default());
        fx.engine.boot().await.unwrap();

        // Simulate the outage: disconnect and clear /Connected like the
        // all-reads-failed branch does.
        fx.engine.transport.close();
        fx.publisher
            .lock()
            .unwrap()
            .publish("/Connected", PublisherValue::Int(0));

        fx.engine.tick(now(), wall_now()).await.unwrap();

        assert!(fx.engine.transport.is_connected());
        assert_eq!(
            fx.publisher.lock().unwrap().get("/Connected"),
            Some(&PublisherValue::Int(1))
        );
    }
}
