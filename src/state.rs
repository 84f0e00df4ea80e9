use serde::Serialize;
use tracing::debug;

use crate::bus::{BusError, Publish};
use crate::reading::DeviceReading;

/// Shared by every entity of the battery, see [`crate::discovery`]
pub const STATE_TOPIC: &str = "homeassistant/sensor/powerhouse-battery/state";

/// The state update for the battery entities.
///
/// A measurement the device did not report is left out rather than sent as
/// `null`, so Home Assistant lets that entity expire instead of recording a
/// bogus value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
}

impl From<&DeviceReading> for StateDocument {
    fn from(reading: &DeviceReading) -> Self {
        Self {
            temperature: reading.temperature,
            voltage: reading.voltage,
        }
    }
}

/// Publishes state documents, waiting for each to be acknowledged
pub struct StatePublisher<P> {
    bus: P,
}

impl<P: Publish> StatePublisher<P> {
    pub fn new(bus: P) -> Self {
        Self { bus }
    }

    pub async fn publish(&self, state: &StateDocument) -> Result<(), BusError> {
        let payload = serde_json::to_vec(state)?;
        debug!(
            topic = STATE_TOPIC,
            payload = %String::from_utf8_lossy(&payload),
            "publishing state"
        );
        self.bus.publish(STATE_TOPIC, payload).await
    }
}
