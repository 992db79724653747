//! # evgate - Modbus/TCP EV charger gateway
//!
//! A gateway daemon that makes an industrial AC EV charger reachable over
//! Modbus/TCP behave as a first-class EV-charger device on an embedded
//! energy-management host. It polls the charger on a fixed cadence,
//! decodes its register map into telemetry and a status code, derives a
//! current set-point from the active control policy (manual, solar-excess,
//! scheduled, dynamic-price), writes that set-point back with optional
//! read-back verification, tracks charging sessions across flaps, and
//! publishes everything onto a typed object-path tree external agents can
//! observe and, on a handful of paths, write to.
//!
//! ## Architecture
//!
//! - `wire`: register-level codec (big-endian floats, packed ASCII)
//! - `modbus`: the Modbus/TCP transport, retry wrapper, and bounded reconnect
//! - `status`: IEC 61851 mode-3 state → published status code
//! - `policy`: pure effective-current derivation
//! - `session`: charging session lifecycle tracking
//! - `persistence`: atomic on-disk snapshot of operator intent and sessions
//! - `publisher`: the object-path store and its callback-driven writes
//! - `price`: the dynamic-price provider boundary and its TTL cache
//! - `engine`: the control loop that owns all of the above
//! - `config`: configuration loading and validation
//! - `logging`: structured logging setup
//! - `error`: the error kinds the core distinguishes

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod modbus;
pub mod persistence;
pub mod policy;
pub mod price;
pub mod publisher;
pub mod session;
pub mod status;
pub mod wire;

pub use config::Config;
pub use engine::GatewayEngine;
pub use error::{GatewayError, Result};
