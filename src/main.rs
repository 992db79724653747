use anyhow::{Context, Result};
use evgate::config::Config;
use evgate::engine::GatewayEngine;
use evgate::modbus::ModbusTransport;
use evgate::persistence::PersistenceManager;
use evgate::price::{PriceProvider, StaticPriceProvider};
use evgate::publisher::bus::EvChargerBus;
use evgate::publisher::Publisher;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use zbus::Connection;
use zbus::fdo::{DBusProxy, RequestNameFlags};
use zbus::names::WellKnownName;

#[tokio::main]
async fn main() -> Result<()> {
    let config_override = parse_config_arg(std::env::args().skip(1))?;
    let config = Config::load_with_override(config_override.as_deref());
    evgate::logging::init_logging(&config.logging).context("failed to initialize logging")?;

    info!(version = env!("APP_VERSION"), "evgate starting up");

    let transport = ModbusTransport::new(&config.modbus.ip, config.modbus.port)
        .context("invalid Modbus connection settings")?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let publisher = Arc::new(Mutex::new(Publisher::new(events_tx)));

    let persistence_path =
        std::env::var("EVGATE_STATE_FILE").unwrap_or_else(|_| "/data/evgate_state.json".to_string());
    let persistence = PersistenceManager::new(&persistence_path);

    let price_provider: Option<Arc<dyn PriceProvider>> = if config.price.enabled {
        Some(Arc::new(StaticPriceProvider))
    } else {
        None
    };

    let bus_connection = match connect_host_bus(config.device_instance, publisher.clone()).await {
        Ok(conn) => Some(conn),
        Err(e) if config.require_bus => {
            return Err(anyhow::anyhow!("host-bus publisher required but unavailable: {e}"));
        }
        Err(e) => {
            warn!(error = %e, "host bus unavailable, continuing without it");
            None
        }
    };

    let engine = GatewayEngine::new(
        config,
        Box::new(transport),
        publisher,
        events_rx,
        persistence,
        price_provider,
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };

    let result = engine.run(shutdown).await;
    drop(bus_connection);

    match result {
        Ok(()) => {
            info!("evgate shut down cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "evgate exited with an error");
            Err(anyhow::anyhow!("gateway error: {e}"))
        }
    }
}

/// Parse the CLI surface (§6): `--config <path>` or `--config=<path>`
/// overrides the default config search list. No other flags are defined.
fn parse_config_arg(mut args: impl Iterator<Item = String>) -> Result<Option<PathBuf>> {
    while let Some(arg) = args.next() {
        if let Some(path) = arg.strip_prefix("--config=") {
            return Ok(Some(PathBuf::from(path)));
        }
        if arg == "--config" {
            let path = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("--config requires a path argument"))?;
            return Ok(Some(PathBuf::from(path)));
        }
    }
    Ok(None)
}

/// Stand up the thinnest possible host-bus connection: the system bus
/// (falling back to the session bus), serving [`EvChargerBus`] at `/`
/// under a Victron-style well-known name. The returned connection's
/// lifetime must span the engine's run loop.
async fn connect_host_bus(device_instance: u32, publisher: Arc<Mutex<Publisher>>) -> evgate::Result<Connection> {
    let connection = match Connection::system().await {
        Ok(c) => {
            info!("connected to D-Bus: system bus");
            c
        }
        Err(e_sys) => match Connection::session().await {
            Ok(c) => {
                warn!(error = %e_sys, "system bus unavailable, using session bus");
                c
            }
            Err(e_sess) => {
                return Err(evgate::GatewayError::publisher(format!(
                    "D-Bus connect failed: system={e_sys} session={e_sess}"
                )));
            }
        },
    };

    let bus = EvChargerBus::new(publisher);
    connection
        .object_server()
        .at("/", bus)
        .await
        .map_err(|e| evgate::GatewayError::publisher(format!("failed to serve object: {e}")))?;

    let service_name = format!("com.victronenergy.evcharger.evgate_{device_instance}");
    let proxy = DBusProxy::new(&connection)
        .await
        .map_err(|e| evgate::GatewayError::publisher(format!("D-Bus proxy failed: {e}")))?;
    let name = WellKnownName::try_from(service_name.as_str())
        .map_err(|e| evgate::GatewayError::publisher(format!("invalid well-known name: {e}")))?;
    proxy
        .request_name(name, RequestNameFlags::ReplaceExisting.into())
        .await
        .map_err(|e| evgate::GatewayError::publisher(format!("RequestName failed: {e}")))?;

    info!(name = %service_name, "host bus connected");
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> impl Iterator<Item = String> {
        v.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn no_config_flag_yields_none() {
        assert_eq!(parse_config_arg(args(&[])).unwrap(), None);
    }

    #[test]
    fn space_separated_config_flag() {
        let got = parse_config_arg(args(&["--config", "/etc/evgate/custom.yaml"])).unwrap();
        assert_eq!(got, Some(PathBuf::from("/etc/evgate/custom.yaml")));
    }

    #[test]
    fn equals_form_config_flag() {
        let got = parse_config_arg(args(&["--config=/tmp/x.yaml"])).unwrap();
        assert_eq!(got, Some(PathBuf::from("/tmp/x.yaml")));
    }

    #[test]
    fn dangling_config_flag_is_an_error() {
        assert!(parse_config_arg(args(&["--config"])).is_err());
    }
}
