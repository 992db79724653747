//! Modbus/TCP transport for the EV charger
//!
//! Owns one TCP connection to the charger and exposes read-holding /
//! write-holding operations keyed by unit-id. This module intentionally
//! keeps two concerns apart: [`with_retry`] retries a single operation a
//! bounded number of times against the *current* connection, while
//! [`ModbusOps::reconnect`] is the only path that tears down and
//! re-establishes the connection itself. The control loop decides when to
//! call which — the transport never reconnects on its own initiative. Each
//! call to `reconnect` is bounded, not indefinite; the control loop calls
//! it once per tick while disconnected, so the indefinite reconnect the
//! device sees in practice is the composition of bounded calls across ticks.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

/// The transport's read/write/connect contract, factored out as a trait
/// so the control engine (§4.8) can be driven against a fake device in
/// tests instead of a real TCP socket.
#[async_trait]
pub trait ModbusOps: Send {
    async fn connect(&mut self) -> Result<()>;
    fn close(&mut self);
    fn is_connected(&self) -> bool;
    async fn read_holding(&mut self, address: u16, count: u16, unit_id: u8) -> Result<Vec<u16>>;
    async fn write_holding(&mut self, address: u16, regs: &[u16], unit_id: u8) -> Result<()>;

    /// Bounded reconnect (§4.2): close, then retry `connect()` up to
    /// `max_attempts` times with `retry_delay` between attempts, returning
    /// as soon as one succeeds. The caller composes repeated bounded calls
    /// into the indefinite reconnect the spec describes.
    async fn reconnect(&mut self, retry_delay: Duration, max_attempts: u32) -> Result<()> {
        self.close();
        let max_attempts = max_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=max_attempts {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                    if attempt < max_attempts {
                        sleep(retry_delay).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| GatewayError::modbus("reconnect exhausted")))
    }
}

#[async_trait]
impl ModbusOps for ModbusTransport {
    async fn connect(&mut self) -> Result<()> {
        ModbusTransport::connect(self).await
    }

    fn close(&mut self) {
        ModbusTransport::close(self)
    }

    fn is_connected(&self) -> bool {
        ModbusTransport::is_connected(self)
    }

    async fn read_holding(&mut self, address: u16, count: u16, unit_id: u8) -> Result<Vec<u16>> {
        ModbusTransport::read_holding(self, address, count, unit_id).await
    }

    async fn write_holding(&mut self, address: u16, regs: &[u16], unit_id: u8) -> Result<()> {
        ModbusTransport::write_holding(self, address, regs, unit_id).await
    }
}

/// Owns the single Modbus/TCP connection to the charger.
pub struct ModbusTransport {
    client: Option<tokio_modbus::client::Context>,
    address: std::net::SocketAddr,
    connect_timeout: Duration,
    op_timeout: Duration,
}

impl ModbusTransport {
    /// Build a transport for `ip:port`. Does not connect yet.
    pub fn new(ip: &str, port: u16) -> Result<Self> {
        let address = format!("{ip}:{port}")
            .parse()
            .map_err(|e| GatewayError::modbus(format!("invalid socket address: {e}")))?;
        Ok(Self {
            client: None,
            address,
            connect_timeout: Duration::from_secs(5),
            op_timeout: Duration::from_secs(2),
        })
    }

    /// Open the TCP connection. Idempotent-ish: replaces any existing connection.
    pub async fn connect(&mut self) -> Result<()> {
        tracing::info!(address = %self.address, "connecting to charger");
        match timeout(self.connect_timeout, tcp::connect(self.address)).await {
            Ok(Ok(client)) => {
                self.client = Some(client);
                tracing::info!("connected to charger");
                Ok(())
            }
            Ok(Err(e)) => Err(GatewayError::modbus(format!("connection failed: {e}"))),
            Err(_) => Err(GatewayError::timeout("connection timed out")),
        }
    }

    /// Close the connection. A no-op if already closed.
    pub fn close(&mut self) {
        if self.client.take().is_some() {
            tracing::info!("closed charger connection");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Read `count` holding registers starting at `address` on `unit_id`.
    pub async fn read_holding(&mut self, address: u16, count: u16, unit_id: u8) -> Result<Vec<u16>> {
        let op_timeout = self.op_timeout;
        let client = self.client()?;
        client.set_slave(Slave(unit_id));
        match timeout(op_timeout, client.read_holding_registers(address, count)).await {
            Ok(Ok(Ok(regs))) => Ok(regs),
            Ok(Ok(Err(e))) => Err(GatewayError::modbus(format!("exception response: {e}"))),
            Ok(Err(e)) => Err(GatewayError::modbus(format!("read failed: {e}"))),
            Err(_) => Err(GatewayError::timeout("read timed out")),
        }
    }

    /// Write `regs` starting at `address` on `unit_id` using function code 16.
    pub async fn write_holding(&mut self, address: u16, regs: &[u16], unit_id: u8) -> Result<()> {
        let op_timeout = self.op_timeout;
        let client = self.client()?;
        client.set_slave(Slave(unit_id));
        match timeout(op_timeout, client.write_multiple_registers(address, regs)).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(GatewayError::modbus(format!("exception response: {e}"))),
            Ok(Err(e)) => Err(GatewayError::modbus(format!("write failed: {e}"))),
            Err(_) => Err(GatewayError::timeout("write timed out")),
        }
    }

    fn client(&mut self) -> Result<&mut tokio_modbus::client::Context> {
        self.client
            .as_mut()
            .ok_or_else(|| GatewayError::modbus("not connected"))
    }
}

/// Retry a fallible async operation up to `max_retries` times with a flat
/// `delay` between attempts. Retries the whole `MODBUS` failure taxonomy
/// (`CONN`, `PROTOCOL`, `TIMEOUT`, via [`GatewayError::is_retryable`]);
/// validation or other permanent failures propagate immediately without
/// consuming a retry (§4.2).
pub async fn with_retry<F, Fut, T>(max_retries: u32, delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < max_retries => {
                attempt += 1;
                tracing::debug!(attempt, error = %e, "modbus operation failed, retrying");
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// A fake [`ModbusOps`] for driving the control engine's tests without a
/// real TCP socket: a register file keyed by `(address, unit_id)` plus a
/// scripted list of per-operation failures. Shared by `engine`'s tests.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ScriptedFailure {
        Connect,
        Read,
        Write,
    }

    #[derive(Default)]
    pub struct FakeTransport {
        pub connected: bool,
        pub registers: HashMap<(u16, u8), Vec<u16>>,
        pub fail_next: Vec<ScriptedFailure>,
        pub connect_calls: u32,
        pub write_log: Vec<(u16, Vec<u16>, u8)>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&mut self, address: u16, unit_id: u8, regs: Vec<u16>) {
            self.registers.insert((address, unit_id), regs);
        }

        fn take_failure(&mut self, kind: ScriptedFailure) -> bool {
            if let Some(pos) = self.fail_next.iter().position(|f| *f == kind) {
                self.fail_next.remove(pos);
                true
            } else {
                false
            }
        }
    }

    #[async_trait]
    impl ModbusOps for FakeTransport {
        async fn connect(&mut self) -> Result<()> {
            self.connect_calls += 1;
            if self.take_failure(ScriptedFailure::Connect) {
                return Err(GatewayError::modbus("connection refused"));
            }
            self.connected = true;
            Ok(())
        }

        fn close(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn read_holding(&mut self, address: u16, count: u16, unit_id: u8) -> Result<Vec<u16>> {
            if !self.connected {
                return Err(GatewayError::modbus("not connected"));
            }
            if self.take_failure(ScriptedFailure::Read) {
                return Err(GatewayError::modbus("read failed"));
            }
            let regs = self
                .registers
                .get(&(address, unit_id))
                .cloned()
                .unwrap_or_else(|| vec![0; count as usize]);
            Ok(regs)
        }

        async fn write_holding(&mut self, address: u16, regs: &[u16], unit_id: u8) -> Result<()> {
            if !self.connected {
                return Err(GatewayError::modbus("not connected"));
            }
            if self.take_failure(ScriptedFailure::Write) {
                return Err(GatewayError::modbus("write failed"));
            }
            self.registers.insert((address, unit_id), regs.to_vec());
            self.write_log.push((address, regs.to_vec(), unit_id));
            Ok(())
        }
    }
}
