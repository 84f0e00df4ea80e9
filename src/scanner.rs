use std::collections::HashMap;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::{debug, info};

use crate::device::MacAddress;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}

/// Manufacturer specific data seen in one BLE advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: MacAddress,
    /// Keyed by company identifier, without the identifier bytes
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// Passive scan on the first Bluetooth adapter
pub struct Scanner {
    adapter: Adapter,
}

impl Scanner {
    pub async fn new() -> Result<Self, ScanError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next().ok_or(ScanError::NoAdapter)?;
        match adapter.adapter_info().await {
            Ok(adapter_info) => info!(adapter = %adapter_info, "using Bluetooth adapter"),
            Err(e) => debug!(error = %e, "adapter info unavailable"),
        }
        Ok(Self { adapter })
    }

    /// Start scanning and stream every advertisement that carries
    /// manufacturer data. The stream ends if the adapter stops delivering
    /// events.
    ///
    /// Addresses are only meaningful where the platform exposes them (BlueZ,
    /// Windows); CoreBluetooth hides device addresses.
    pub async fn start(&self) -> Result<BoxStream<'static, Advertisement>, ScanError> {
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("BLE scan started");

        let adapter = self.adapter.clone();
        let advertisements = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let CentralEvent::ManufacturerDataAdvertisement {
                    id,
                    manufacturer_data,
                } = event
                else {
                    return None;
                };
                match adapter.peripheral(&id).await {
                    Ok(peripheral) => Some(Advertisement {
                        address: peripheral.address().into(),
                        manufacturer_data,
                    }),
                    Err(e) => {
                        debug!(error = %e, "advertising peripheral went away");
                        None
                    }
                }
            }
        });

        Ok(advertisements.boxed())
    }

    pub async fn stop(&self) -> Result<(), ScanError> {
        self.adapter.stop_scan().await?;
        info!("BLE scan stopped");
        Ok(())
    }
}
