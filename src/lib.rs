//! Republish readings of a Victron Smart Battery Sense to Home Assistant over MQTT
//!
//! The Smart Battery Sense broadcasts its battery voltage and temperature in BLE
//! advertisements, AES encrypted with a per-device key (Victron calls this
//! "instant readout"). No connection to the device is needed: we scan passively,
//! decrypt the advertisements of the configured device and publish the values
//! to the MQTT broker that Home Assistant listens on.
//!
//! At startup one Home Assistant discovery document per measurement is
//! published, so the battery shows up as a device with two sensor entities:
//!
//! - Voltage (V)
//! - Temperature (°C)
//!
//! Every publish uses QoS 2 and waits for the broker to acknowledge it before
//! the next advertisement is handled.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//!     let config = voltage_repeater::config::Config::load()?;
//!     voltage_repeater::logger::init(&config.log)?;
//!     voltage_repeater::run(config).await
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod device;
pub mod discovery;
pub mod listener;
pub mod logger;
pub mod reading;
pub mod scanner;
pub mod state;
pub mod victron;

use anyhow::Context;
use tracing::{info, warn};

pub use bus::{BusError, BusSession, Publish};
pub use config::Config;
pub use listener::{AdvertisementListener, ListenerError, ListenerState};
pub use reading::DeviceReading;
pub use scanner::{Advertisement, Scanner};
pub use state::StateDocument;

/// Run until Ctrl-C or SIGTERM, or until listening fails.
///
/// Connects to the broker, registers the Home Assistant entities and then
/// forwards readings of the configured device. The MQTT session is closed
/// before returning, also on error.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let bus = BusSession::connect(&config.mqtt).await.context("failed to connect to MQTT broker")?;

    let result = serve(&config, &bus).await;
    bus.shutdown().await;

    result
}

async fn serve(config: &Config, bus: &BusSession) -> anyhow::Result<()> {
    discovery::register(bus, &config.batterysense.id)
        .await
        .context("failed to publish Home Assistant discovery documents")?;

    let scanner = Scanner::new().await.context("failed to open Bluetooth adapter")?;
    let advertisements = scanner.start().await.context("failed to start BLE scan")?;

    let mut listener = AdvertisementListener::new(config.batterysense.clone(), bus);
    let result = listener.run(advertisements, shutdown_signal()).await;

    if let Err(e) = scanner.stop().await {
        warn!(error = %e, "failed to stop BLE scan");
    }

    result.context("stopped listening for advertisements")
}

/// Completes on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
