use std::collections::HashMap;
use std::sync::Mutex;

use aes::Aes128;
use async_trait::async_trait;
use ctr::cipher::{KeyIvInit, StreamCipher};
use futures_util::stream;
use voltage_repeater::config::DeviceConfig;
use voltage_repeater::device::AdvertisementKey;
use voltage_repeater::{
    discovery, victron, Advertisement, AdvertisementListener, BusError, ListenerError, Publish,
};

const MAC: &str = "AA:BB:CC:DD:EE:FF";
/// The same address, spelled the way it was configured
const CONFIGURED_MAC: &str = "aa:bb:cc:dd:ee:ff";
const KEY: &str = "0123456789abcdef0123456789abcdef";
const STATE_TOPIC: &str = "homeassistant/sensor/powerhouse-battery/state";

#[derive(Default)]
struct MemoryBus {
    published: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Publish for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let payload = String::from_utf8(payload).unwrap();
        self.published.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }
}

impl MemoryBus {
    fn messages(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

fn key() -> AdvertisementKey {
    KEY.parse().unwrap()
}

fn device() -> DeviceConfig {
    DeviceConfig {
        id: CONFIGURED_MAC.to_string(),
        mac: CONFIGURED_MAC.parse().unwrap(),
        key: key(),
    }
}

/// A battery monitor record: voltage in 0.01 V and temperature in 0.01 K,
/// every other field not available
fn record(voltage: u16, temperature: u16) -> Vec<u8> {
    let mut bits: u128 = 0xffff;
    bits |= (voltage as u128) << 16;
    bits |= (temperature as u128) << 48;
    // aux mode 2: temperature
    bits |= 2u128 << 64;
    bits |= 0x3fffffu128 << 66;
    bits |= 0xfffffu128 << 88;
    bits |= 0x3ffu128 << 108;
    bits.to_le_bytes()[..15].to_vec()
}

/// Encrypt a record into a Smart Battery Sense instant readout frame
fn frame(key: &AdvertisementKey, counter: u16, record: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; 16];
    iv[..2].copy_from_slice(&counter.to_le_bytes());
    let mut encrypted = record.to_vec();
    ctr::Ctr128LE::<Aes128>::new(key.as_bytes().into(), &iv.into()).apply_keystream(&mut encrypted);

    let mut raw = vec![0x10, 0x02, 0xa4, 0xa3, 0x02];
    raw.extend_from_slice(&counter.to_le_bytes());
    raw.push(key.as_bytes()[0]);
    raw.extend_from_slice(&encrypted);
    raw
}

fn advertisement(address: &str, raw: Vec<u8>) -> Advertisement {
    Advertisement {
        address: address.parse().unwrap(),
        manufacturer_data: HashMap::from([(victron::MANUFACTURER_ID, raw)]),
    }
}

#[tokio::test]
async fn test_discovery_then_state_updates() {
    let bus = MemoryBus::default();
    let device = device();

    discovery::register(&bus, &device.id).await.unwrap();

    let wrong_key: AdvertisementKey = "ffeeddccbbaa99887766554433221100".parse().unwrap();
    let events = stream::iter(vec![
        advertisement(MAC, frame(&key(), 1, &record(1320, 29465))),
        // Another device nearby
        advertisement("11:22:33:44:55:66", frame(&key(), 2, &record(1250, 29465))),
        // Our address, but not our key
        advertisement(MAC, frame(&wrong_key, 3, &record(1100, 29465))),
        advertisement(MAC, frame(&key(), 4, &record(1318, 0xffff))),
    ]);

    let mut listener = AdvertisementListener::new(device, &bus);
    let err = listener.run(events, std::future::pending()).await.unwrap_err();
    assert!(matches!(err, ListenerError::ScanEnded));

    let messages = bus.messages();
    let topics: Vec<&str> = messages.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(
        topics,
        [
            "homeassistant/sensor/powerhouse-battery-voltage/config",
            "homeassistant/sensor/powerhouse-battery-temperature/config",
            STATE_TOPIC,
            STATE_TOPIC,
        ]
    );

    let voltage: serde_json::Value = serde_json::from_str(&messages[0].1).unwrap();
    assert_eq!(voltage["unique_id"], "aa:bb:cc:dd:ee:ff-voltage");
    assert_eq!(voltage["state_topic"], STATE_TOPIC);
    assert_eq!(voltage["expire_after"], 120);

    assert_eq!(messages[2].1, r#"{"temperature":21.5,"voltage":13.2}"#);
    assert_eq!(messages[3].1, r#"{"voltage":13.18}"#);
}

#[tokio::test]
async fn test_restart_republishes_identical_discovery() {
    let first = MemoryBus::default();
    let second = MemoryBus::default();
    let id = device().id;

    discovery::register(&first, &id).await.unwrap();
    discovery::register(&second, &id).await.unwrap();

    assert_eq!(first.messages().len(), 2);
    assert_eq!(first.messages(), second.messages());
}
