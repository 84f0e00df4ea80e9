//! Home Assistant MQTT discovery for the battery sense entities.
//!
//! Home Assistant creates (or refreshes) one sensor entity per config
//! document. The documents only depend on the configured device id, so publishing
//! them again after a restart updates the existing entities in place.

use serde::Serialize;
use tracing::info;

use crate::bus::{BusError, Publish};
use crate::state::STATE_TOPIC;

/// Entities expire, and show as unavailable, after this many seconds without a state update
pub const EXPIRE_AFTER_SECS: u32 = 120;

const DEVICE_NAME: &str = "Powerhouse Battery";
const DEVICE_MANUFACTURER: &str = "Victron";
const DEVICE_MODEL: &str = "Smart Battery Sense";

/// A measurement exposed as its own sensor entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    /// Used as the device class, the state document key and in topics
    pub name: &'static str,
    pub unit: &'static str,
}

pub const VOLTAGE: Measurement = Measurement { name: "voltage", unit: "V" };
pub const TEMPERATURE: Measurement = Measurement { name: "temperature", unit: "°C" };

/// Registered in this order at startup
pub const MEASUREMENTS: [Measurement; 2] = [VOLTAGE, TEMPERATURE];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryDocument {
    pub device_class: &'static str,
    pub state_topic: &'static str,
    pub unit_of_measurement: &'static str,
    pub value_template: String,
    pub unique_id: String,
    pub expire_after: u32,
    pub device: DeviceDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceDescriptor {
    pub identifiers: Vec<String>,
    pub name: &'static str,
    pub manufacturer: &'static str,
    pub model: &'static str,
}

impl DiscoveryDocument {
    pub fn new(device_id: &str, measurement: Measurement) -> Self {
        Self {
            device_class: measurement.name,
            state_topic: STATE_TOPIC,
            unit_of_measurement: measurement.unit,
            value_template: format!("{{{{ value_json.{} }}}}", measurement.name),
            unique_id: format!("{device_id}-{}", measurement.name),
            expire_after: EXPIRE_AFTER_SECS,
            device: DeviceDescriptor {
                identifiers: vec![device_id.to_string()],
                name: DEVICE_NAME,
                manufacturer: DEVICE_MANUFACTURER,
                model: DEVICE_MODEL,
            },
        }
    }
}

pub fn config_topic(measurement: Measurement) -> String {
    format!("homeassistant/sensor/powerhouse-battery-{}/config", measurement.name)
}

/// Publish the config document of every measurement, waiting for each to be
/// acknowledged. Any failure is returned immediately.
///
/// `device_id` is used verbatim in unique ids and device identifiers.
pub async fn register<P: Publish>(bus: &P, device_id: &str) -> Result<(), BusError> {
    for measurement in MEASUREMENTS {
        let topic = config_topic(measurement);
        let payload = serde_json::to_vec(&DiscoveryDocument::new(device_id, measurement))?;
        bus.publish(&topic, payload).await?;
        info!(%topic, measurement = measurement.name, "registered entity");
    }
    Ok(())
}
