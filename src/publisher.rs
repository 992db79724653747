//! Object-path publisher (§4.7)
//!
//! A typed key→value store the control engine writes outbound telemetry
//! into, plus a small set of writable paths that external agents (the
//! host bus, a future HTTP surface) can request changes on. Per the
//! concurrency model (§5), writes to writable paths never touch control
//! state directly: they're translated into a [`ControlEvent`] and sent
//! down a channel the control loop owns the receiving end of. Reads are
//! synchronous against the in-memory store.
//!
//! The store itself ([`Publisher`]) is the in-scope part of this
//! component. Putting it on an actual host bus (D-Bus/zbus, a VRM
//! broker, anything else) is the "host-bus transport library" the spec
//! calls an external collaborator — [`bus`] wires up the thinnest
//! possible zbus adapter over it as an example of that boundary, not a
//! complete implementation of the wire protocol.

use crate::error::{GatewayError, Result};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;

/// A value published on the object tree: int, float, or string (§4.7).
#[derive(Debug, Clone, PartialEq)]
pub enum PublisherValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl PublisherValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PublisherValue::Float(v) => Some(*v),
            PublisherValue::Int(v) => Some(*v as f64),
            PublisherValue::Str(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PublisherValue::Int(v) => Some(*v),
            PublisherValue::Float(v) => Some(*v as i64),
            PublisherValue::Str(_) => None,
        }
    }
}

impl From<f32> for PublisherValue {
    fn from(v: f32) -> Self {
        PublisherValue::Float(v as f64)
    }
}

impl From<f64> for PublisherValue {
    fn from(v: f64) -> Self {
        PublisherValue::Float(v)
    }
}

impl From<u32> for PublisherValue {
    fn from(v: u32) -> Self {
        PublisherValue::Int(v as i64)
    }
}

impl From<i64> for PublisherValue {
    fn from(v: i64) -> Self {
        PublisherValue::Int(v)
    }
}

impl From<&str> for PublisherValue {
    fn from(v: &str) -> Self {
        PublisherValue::Str(v.to_string())
    }
}

impl From<String> for PublisherValue {
    fn from(v: String) -> Self {
        PublisherValue::Str(v)
    }
}

/// Tagged, compile-time-checked replacement for the loosely-typed
/// `(path, value)` callback the source dispatches (§9 REDESIGN FLAGS).
/// The control loop matches on the variant; every variant runs the
/// identical critical section described in §4.8 ("callback handling").
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    SetMode(u8),
    SetEnable(u8),
    SetCurrent(f32),
    SetAutoStart(u8),
}

/// Maps a writable path name to the `ControlEvent` variant it produces.
fn event_for_write(path: &str, value: &PublisherValue) -> Result<ControlEvent> {
    match path {
        "/Mode" => value
            .as_i64()
            .map(|v| ControlEvent::SetMode(v.clamp(0, 255) as u8))
            .ok_or_else(|| GatewayError::publisher(format!("{path}: expected an integer"))),
        "/StartStop" => value
            .as_i64()
            .map(|v| ControlEvent::SetEnable(v.clamp(0, 255) as u8))
            .ok_or_else(|| GatewayError::publisher(format!("{path}: expected an integer"))),
        "/SetCurrent" => value
            .as_f64()
            .map(|v| ControlEvent::SetCurrent(v as f32))
            .ok_or_else(|| GatewayError::publisher(format!("{path}: expected a float"))),
        "/AutoStart" => value
            .as_i64()
            .map(|v| ControlEvent::SetAutoStart(v.clamp(0, 255) as u8))
            .ok_or_else(|| GatewayError::publisher(format!("{path}: expected an integer"))),
        _ => Err(GatewayError::publisher(format!("unknown writable path: {path}"))),
    }
}

/// The object-path key→value store. Registration declares a path's
/// writability once at boot; after that, [`Publisher::publish`] is how
/// the control loop updates any path (writable or not), and
/// [`Publisher::request_write`] is how an external agent asks for a
/// writable path to change — which never mutates the store directly,
/// only enqueues a [`ControlEvent`] for the control loop to act on.
pub struct Publisher {
    values: HashMap<String, PublisherValue>,
    writable: HashSet<String>,
    events_tx: mpsc::UnboundedSender<ControlEvent>,
}

impl Publisher {
    /// Build a publisher whose writable-path requests are sent to `events_tx`.
    /// The control loop owns the paired receiver.
    pub fn new(events_tx: mpsc::UnboundedSender<ControlEvent>) -> Self {
        Self {
            values: HashMap::new(),
            writable: HashSet::new(),
            events_tx,
        }
    }

    /// Register a path with its initial value and writability. Called
    /// once per path during the boot sequence (§4.8).
    pub fn register(&mut self, path: &str, initial: PublisherValue, writable: bool) {
        self.values.insert(path.to_string(), initial);
        if writable {
            self.writable.insert(path.to_string());
        }
    }

    /// Read a path's last-published value.
    pub fn get(&self, path: &str) -> Option<&PublisherValue> {
        self.values.get(path)
    }

    /// Update a path's value. Only the control loop ever calls this —
    /// it's how outbound telemetry and intent mirrors flow to the store,
    /// regardless of whether the path is writable from the outside.
    pub fn publish(&mut self, path: &str, value: PublisherValue) {
        self.values.insert(path.to_string(), value);
    }

    /// Whether `path` accepts external writes.
    pub fn is_writable(&self, path: &str) -> bool {
        self.writable.contains(path)
    }

    /// An external agent's request to change a writable path. Validates
    /// the path is known and writable, translates `(path, value)` into a
    /// [`ControlEvent`], and enqueues it — never touches the store or any
    /// control state directly (§4.7, §5). The control loop is the only
    /// thing that calls `publish()` in response.
    pub fn request_write(&self, path: &str, value: PublisherValue) -> Result<()> {
        if !self.writable.contains(path) {
            return Err(GatewayError::publisher(format!("path not writable: {path}")));
        }
        let event = event_for_write(path, &value)?;
        self.events_tx
            .send(event)
            .map_err(|_| GatewayError::publisher("control loop event channel closed"))
    }
}

/// The thinnest possible host-bus adapter: a zbus object implementing
/// the Victron-style `com.victronenergy.evcharger` interface over a
/// shared [`Publisher`]. Property getters read the store directly;
/// setters go through [`Publisher::request_write`] exactly like any
/// other external agent would. Standing up the actual D-Bus connection,
/// well-known name, and object-tree registration is the host-bus
/// transport library's job and is out of scope here (§1) — this exists
/// only to show the interface the core expects that library to present.
pub mod bus {
    use super::{Publisher, PublisherValue};
    use std::sync::{Arc, Mutex};

    pub struct EvChargerBus {
        publisher: Arc<Mutex<Publisher>>,
    }

    impl EvChargerBus {
        pub fn new(publisher: Arc<Mutex<Publisher>>) -> Self {
            Self { publisher }
        }
    }

    #[zbus::interface(name = "com.victronenergy.evcharger")]
    impl EvChargerBus {
        #[zbus(property)]
        fn mode(&self) -> u8 {
            self.publisher
                .lock()
                .expect("publisher mutex poisoned")
                .get("/Mode")
                .and_then(PublisherValue::as_i64)
                .unwrap_or(0) as u8
        }

        #[zbus(property)]
        fn set_mode(&self, value: u8) -> zbus::Result<()> {
            let _ = self
                .publisher
                .lock()
                .expect("publisher mutex poisoned")
                .request_write("/Mode", PublisherValue::Int(value as i64));
            Ok(())
        }

        #[zbus(property)]
        fn start_stop(&self) -> u8 {
            self.publisher
                .lock()
                .expect("publisher mutex poisoned")
                .get("/StartStop")
                .and_then(PublisherValue::as_i64)
                .unwrap_or(0) as u8
        }

        #[zbus(property)]
        fn set_start_stop(&self, value: u8) -> zbus::Result<()> {
            let _ = self
                .publisher
                .lock()
                .expect("publisher mutex poisoned")
                .request_write("/StartStop", PublisherValue::Int(value as i64));
            Ok(())
        }

        #[zbus(property)]
        fn set_current(&self) -> f64 {
            self.publisher
                .lock()
                .expect("publisher mutex poisoned")
                .get("/SetCurrent")
                .and_then(PublisherValue::as_f64)
                .unwrap_or(0.0)
        }

        #[zbus(property)]
        fn set_set_current(&self, value: f64) -> zbus::Result<()> {
            let _ = self
                .publisher
                .lock()
                .expect("publisher mutex poisoned")
                .request_write("/SetCurrent", PublisherValue::Float(value));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher() -> (Publisher, mpsc::UnboundedReceiver<ControlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Publisher::new(tx), rx)
    }

    #[test]
    fn register_and_get_round_trip() {
        let (mut pub_, _rx) = publisher();
        pub_.register("/ProductName", "EVGate".into(), false);
        assert_eq!(pub_.get("/ProductName"), Some(&PublisherValue::Str("EVGate".to_string())));
    }

    #[test]
    fn publish_updates_any_path_regardless_of_writability() {
        let (mut pub_, _rx) = publisher();
        pub_.register("/Status", PublisherValue::Int(0), false);
        pub_.publish("/Status", PublisherValue::Int(2));
        assert_eq!(pub_.get("/Status"), Some(&PublisherValue::Int(2)));
    }

    #[test]
    fn request_write_rejects_unknown_path() {
        let (pub_, _rx) = publisher();
        let err = pub_.request_write("/Nonsense", PublisherValue::Int(1)).unwrap_err();
        assert!(matches!(err, GatewayError::Publisher { .. }));
    }

    #[test]
    fn request_write_rejects_non_writable_path() {
        let (mut pub_, _rx) = publisher();
        pub_.register("/Status", PublisherValue::Int(0), false);
        assert!(pub_.request_write("/Status", PublisherValue::Int(1)).is_err());
    }

    #[test]
    fn request_write_enqueues_tagged_event_for_each_writable_path() {
        let (mut pub_, mut rx) = publisher();
        pub_.register("/Mode", PublisherValue::Int(0), true);
        pub_.register("/StartStop", PublisherValue::Int(0), true);
        pub_.register("/SetCurrent", PublisherValue::Float(0.0), true);
        pub_.register("/AutoStart", PublisherValue::Int(0), true);

        pub_.request_write("/Mode", PublisherValue::Int(1)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), ControlEvent::SetMode(1));

        pub_.request_write("/StartStop", PublisherValue::Int(1)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), ControlEvent::SetEnable(1));

        pub_.request_write("/SetCurrent", PublisherValue::Float(16.5)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), ControlEvent::SetCurrent(16.5));

        pub_.request_write("/AutoStart", PublisherValue::Int(1)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), ControlEvent::SetAutoStart(1));
    }

    #[test]
    fn request_write_does_not_mutate_store_directly() {
        let (mut pub_, _rx) = publisher();
        pub_.register("/SetCurrent", PublisherValue::Float(6.0), true);
        pub_.request_write("/SetCurrent", PublisherValue::Float(16.0)).unwrap();
        // the store still holds the old value: only the control loop,
        // having consumed the event, calls publish() to update it.
        assert_eq!(pub_.get("/SetCurrent"), Some(&PublisherValue::Float(6.0)));
    }

    #[test]
    fn request_write_surfaces_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut pub_ = Publisher::new(tx);
        pub_.register("/Mode", PublisherValue::Int(0), true);
        let err = pub_.request_write("/Mode", PublisherValue::Int(1)).unwrap_err();
        assert!(matches!(err, GatewayError::Publisher { .. }));
    }
}
