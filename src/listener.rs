//! The advertisement listener: filter, decode and forward readings.
//!
//! BLE scanning sees every broadcast nearby, so most advertisements are
//! dropped before decoding. Decode errors that only mean "not for us" are
//! swallowed; anything else stops the listener, since it points at a protocol
//! change the decoder does not understand.

use std::future::Future;

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, info, warn, Level};

use crate::bus::{BusError, Publish};
use crate::config::DeviceConfig;
use crate::device::{AdvertisementKey, MacAddress};
use crate::scanner::Advertisement;
use crate::state::{StateDocument, StatePublisher};
use crate::victron::{self, DecodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Scanning,
    Decoding,
    Publishing,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to decode advertisement from {address}: {source}")]
    Decode {
        address: MacAddress,
        #[source]
        source: DecodeError,
    },
    #[error("failed to publish state: {0}")]
    Publish(#[from] BusError),
    #[error("BLE advertisement stream ended")]
    ScanEnded,
}

/// What became of one advertisement
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Published(StateDocument),
    Dropped,
}

/// Listens for the configured device and publishes its readings.
pub struct AdvertisementListener<P> {
    device: DeviceConfig,
    publisher: StatePublisher<P>,
    state: ListenerState,
}

impl<P: Publish> AdvertisementListener<P> {
    pub fn new(device: DeviceConfig, bus: P) -> Self {
        Self {
            device,
            publisher: StatePublisher::new(bus),
            state: ListenerState::Idle,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Handle advertisements one at a time until `shutdown` completes.
    ///
    /// Returns an error, and stops, if the stream ends or an advertisement
    /// cannot be handled.
    pub async fn run<S, F>(
        &mut self,
        mut advertisements: S,
        shutdown: F,
    ) -> Result<(), ListenerError>
    where
        S: Stream<Item = Advertisement> + Unpin,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.state = ListenerState::Scanning;
        info!(device = %self.device.mac, "listening for advertisements");

        let result = loop {
            let advertisement = tokio::select! {
                _ = &mut shutdown => break Ok(()),
                advertisement = advertisements.next() => advertisement,
            };
            let Some(advertisement) = advertisement else {
                break Err(ListenerError::ScanEnded);
            };

            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                handled = self.handle(&advertisement) => {
                    if let Err(e) = handled {
                        break Err(e);
                    }
                }
            }
        };

        self.state = ListenerState::Stopped;
        info!("stopped listening for advertisements");
        result
    }

    /// Decode one advertisement and, if it is a reading of our device,
    /// publish it. Returns once the broker acknowledged the state.
    pub async fn handle(
        &mut self,
        advertisement: &Advertisement,
    ) -> Result<Outcome, ListenerError> {
        let address = advertisement.address;

        let Some(raw) = instant_readout(advertisement) else {
            return Ok(Outcome::Dropped);
        };

        self.state = ListenerState::Decoding;
        let reading = match self.key_for(&address).and_then(|key| victron::decode(raw, key)) {
            Ok(reading) => reading,
            Err(e) if e.is_silent() => {
                debug!(%address, error = %e, "dropping advertisement");
                self.state = ListenerState::Scanning;
                return Ok(Outcome::Dropped);
            }
            Err(e) if e.is_recoverable() => {
                warn!(%address, error = %e, "dropping advertisement");
                self.state = ListenerState::Scanning;
                return Ok(Outcome::Dropped);
            }
            Err(source) => return Err(ListenerError::Decode { address, source }),
        };

        if tracing::enabled!(Level::DEBUG) {
            match serde_json::to_string(&reading) {
                Ok(json) => debug!(%address, reading = %json, "decoded advertisement"),
                Err(e) => debug!(%address, error = %e, ?reading, "decoded advertisement"),
            }
        }

        self.state = ListenerState::Publishing;
        let state = StateDocument::from(&reading);
        self.publisher.publish(&state).await?;

        self.state = ListenerState::Scanning;
        Ok(Outcome::Published(state))
    }

    /// Only the configured device has a key
    fn key_for(&self, address: &MacAddress) -> Result<&AdvertisementKey, DecodeError> {
        if *address == self.device.mac {
            Ok(&self.device.key)
        } else {
            Err(DecodeError::AdvertisementKeyMissing)
        }
    }
}

/// The Victron instant readout frame of an advertisement, if it has one
fn instant_readout(advertisement: &Advertisement) -> Option<&[u8]> {
    advertisement
        .manufacturer_data
        .get(&victron::MANUFACTURER_ID)
        .map(Vec::as_slice)
        .filter(|data| data.first() == Some(&victron::INSTANT_READOUT_PREFIX))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use futures_util::stream;

    use super::*;
    use crate::bus::test_support::RecordingBus;
    use crate::state::STATE_TOPIC;
    use crate::victron::test_support::{frame, key, record};

    fn device() -> DeviceConfig {
        DeviceConfig {
            id: "AA:BB:CC:DD:EE:FF".to_string(),
            mac: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            key: key(),
        }
    }

    fn advertisement(address: &str, raw: Vec<u8>) -> Advertisement {
        Advertisement {
            address: address.parse().unwrap(),
            manufacturer_data: HashMap::from([(victron::MANUFACTURER_ID, raw)]),
        }
    }

    fn battery_sense(voltage: u32, temperature_k: u32) -> Vec<u8> {
        frame(0xa3a4, 0x02, 0x0102, &key(), &record(voltage, temperature_k, 2))
    }

    #[tokio::test]
    async fn test_publishes_both_measurements() {
        let bus = RecordingBus::default();
        let mut listener = AdvertisementListener::new(device(), &bus);

        let outcome = listener
            .handle(&advertisement("AA:BB:CC:DD:EE:FF", battery_sense(1320, 29465)))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Published(StateDocument {
                temperature: Some(21.5),
                voltage: Some(13.2),
            })
        );
        assert_eq!(
            bus.messages(),
            vec![(STATE_TOPIC.to_string(), r#"{"temperature":21.5,"voltage":13.2}"#.to_string())]
        );
        assert_eq!(listener.state(), ListenerState::Scanning);
    }

    #[tokio::test]
    async fn test_absent_temperature_is_omitted() {
        let bus = RecordingBus::default();
        let mut listener = AdvertisementListener::new(device(), &bus);
        let raw = frame(0xa3a4, 0x02, 9, &key(), &record(1320, 0xffff, 3));

        listener.handle(&advertisement("AA:BB:CC:DD:EE:FF", raw)).await.unwrap();

        assert_eq!(bus.messages()[0].1, r#"{"voltage":13.2}"#);
    }

    #[tokio::test]
    async fn test_other_device_is_dropped() {
        let bus = RecordingBus::default();
        let mut listener = AdvertisementListener::new(device(), &bus);

        let outcome = listener
            .handle(&advertisement("11:22:33:44:55:66", battery_sense(1320, 29465)))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Dropped);
        assert!(bus.messages().is_empty());
        assert_eq!(listener.state(), ListenerState::Scanning);
    }

    #[tokio::test]
    async fn test_wrong_key_is_dropped() {
        let bus = RecordingBus::default();
        let mut listener = AdvertisementListener::new(device(), &bus);
        let other_key = "ff23456789abcdef0123456789abcdef".parse().unwrap();
        let raw = frame(0xa3a4, 0x02, 1, &other_key, &record(1320, 29465, 2));

        let outcome = listener.handle(&advertisement("AA:BB:CC:DD:EE:FF", raw)).await.unwrap();
        assert_eq!(outcome, Outcome::Dropped);
        assert!(bus.messages().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_device_is_dropped() {
        let bus = RecordingBus::default();
        let mut listener = AdvertisementListener::new(device(), &bus);
        let raw = frame(0xa053, 0x01, 1, &key(), &[0u8; 12]);

        let outcome = listener.handle(&advertisement("AA:BB:CC:DD:EE:FF", raw)).await.unwrap();
        assert_eq!(outcome, Outcome::Dropped);
        assert!(bus.messages().is_empty());
    }

    #[tokio::test]
    async fn test_non_victron_data_is_dropped() {
        let bus = RecordingBus::default();
        let mut listener = AdvertisementListener::new(device(), &bus);
        let adv = Advertisement {
            address: device().mac,
            manufacturer_data: HashMap::from([(0x004c, vec![0x02, 0x15])]),
        };

        assert_eq!(listener.handle(&adv).await.unwrap(), Outcome::Dropped);
        assert!(bus.messages().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_frame_stops_listener() {
        let bus = RecordingBus::default();
        let mut listener = AdvertisementListener::new(device(), &bus);
        let events = stream::iter(vec![
            advertisement("AA:BB:CC:DD:EE:FF", vec![0x10, 0x02, 0xa4]),
            advertisement("AA:BB:CC:DD:EE:FF", battery_sense(1320, 29465)),
        ]);

        let err = listener.run(events, std::future::pending()).await.unwrap_err();
        assert!(matches!(
            err,
            ListenerError::Decode {
                source: DecodeError::Truncated { .. },
                ..
            }
        ));
        assert!(bus.messages().is_empty());
        assert_eq!(listener.state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_publish_failure_stops_listener() {
        let bus = RecordingBus::failing();
        let mut listener = AdvertisementListener::new(device(), &bus);

        let err = listener
            .handle(&advertisement("AA:BB:CC:DD:EE:FF", battery_sense(1320, 29465)))
            .await
            .unwrap_err();
        assert!(matches!(err, ListenerError::Publish(BusError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_run_keeps_arrival_order() {
        let bus = RecordingBus::default();
        let mut listener = AdvertisementListener::new(device(), &bus);
        let events = stream::iter(vec![
            advertisement("AA:BB:CC:DD:EE:FF", battery_sense(1310, 29465)),
            advertisement("11:22:33:44:55:66", battery_sense(1500, 29465)),
            advertisement("AA:BB:CC:DD:EE:FF", battery_sense(1320, 29565)),
        ]);

        let err = listener.run(events, std::future::pending()).await.unwrap_err();
        assert!(matches!(err, ListenerError::ScanEnded));

        let payloads: Vec<String> = bus.messages().into_iter().map(|(_, p)| p).collect();
        assert_eq!(
            payloads,
            vec![
                r#"{"temperature":21.5,"voltage":13.1}"#.to_string(),
                r#"{"temperature":22.5,"voltage":13.2}"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let bus = RecordingBus::default();
        let mut listener = AdvertisementListener::new(device(), &bus);

        listener.run(stream::pending(), async {}).await.unwrap();
        assert_eq!(listener.state(), ListenerState::Stopped);
    }
}
