//! Decoding of Victron "instant readout" BLE advertisements.
//!
//! Victron devices broadcast their live values as manufacturer specific data
//! (company id `0x02E1`), encrypted with a per-device AES-128 key.
//!
//! The frame format is:
//!
//! Start Byte | End Byte | Meaning
//! 0          | 1        | Prefix, the first byte is always 0x10
//! 2          | 3        | Product (model) id, little endian
//! 4          | 4        | Record type
//! 5          | 6        | Data counter, little endian, used as the AES-CTR nonce
//! 7          | 7        | The first byte of the encryption key, for a quick key check
//! 8          | x        | The encrypted record

mod battery_monitor;
mod bit_reader;

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use thiserror::Error;

use crate::device::AdvertisementKey;
use crate::reading::{DeviceReading, Model};

/// Bluetooth SIG company identifier of Victron Energy
pub const MANUFACTURER_ID: u16 = 0x02e1;
/// First byte of every instant readout frame
pub const INSTANT_READOUT_PREFIX: u8 = 0x10;

const HEADER_LEN: usize = 8;
const BLOCK_SIZE: usize = 16;

const RECORD_BATTERY_MONITOR: u8 = 0x02;
const SMART_BATTERY_SENSE_IDS: [u16; 2] = [0xa3a4, 0xa3a5];

type Aes128Ctr = ctr::Ctr128LE<Aes128>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// No key is known for the advertising device
    #[error("no advertisement key for this device")]
    AdvertisementKeyMissing,
    /// The key check byte in the frame does not match the configured key
    #[error("advertisement key check failed: frame has {frame:#04x}, key starts with {key:#04x}")]
    KeyMismatch { frame: u8, key: u8 },
    #[error("unknown device: model id {model_id:#06x}, record type {record_type:#04x}")]
    UnknownDevice { model_id: u16, record_type: u8 },
    #[error("frame truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

impl DecodeError {
    /// Errors that just mean the advertisement is not ours to read.
    pub fn is_silent(&self) -> bool {
        matches!(self, DecodeError::AdvertisementKeyMissing | DecodeError::KeyMismatch { .. })
    }

    /// Errors after which listening may carry on with the next advertisement.
    pub fn is_recoverable(&self) -> bool {
        self.is_silent() || matches!(self, DecodeError::UnknownDevice { .. })
    }
}

/// The unencrypted header of an instant readout frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    model_id: u16,
    record_type: u8,
    data_counter: u16,
    key_check: u8,
}

impl FrameHeader {
    fn parse(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                expected: HEADER_LEN,
                actual: raw.len(),
            });
        }
        Ok(Self {
            model_id: u16::from_le_bytes([raw[2], raw[3]]),
            record_type: raw[4],
            data_counter: u16::from_le_bytes([raw[5], raw[6]]),
            key_check: raw[7],
        })
    }

    fn model(&self) -> Result<Model, DecodeError> {
        match self.record_type {
            RECORD_BATTERY_MONITOR if SMART_BATTERY_SENSE_IDS.contains(&self.model_id) => {
                Ok(Model::SmartBatterySense)
            }
            RECORD_BATTERY_MONITOR => Ok(Model::BatteryMonitor),
            record_type => Err(DecodeError::UnknownDevice {
                model_id: self.model_id,
                record_type,
            }),
        }
    }
}

/// Decode one instant readout frame, as found in the manufacturer data of an
/// advertisement, using the device's advertisement key.
pub fn decode(raw: &[u8], key: &AdvertisementKey) -> Result<DeviceReading, DecodeError> {
    let header = FrameHeader::parse(raw)?;
    let model = header.model()?;

    let key_bytes = key.as_bytes();
    if header.key_check != key_bytes[0] {
        return Err(DecodeError::KeyMismatch {
            frame: header.key_check,
            key: key_bytes[0],
        });
    }

    let decrypted = decrypt(&raw[HEADER_LEN..], key, header.data_counter);
    battery_monitor::decode(model, &decrypted)
}

/// Decrypt an encrypted record with AES-128-CTR.
///
/// The counter block is the 16 bit data counter extended to a 128 bit little
/// endian integer. The ciphertext is PKCS#7 padded to a whole block first, so
/// short records still decrypt to a full block.
fn decrypt(encrypted: &[u8], key: &AdvertisementKey, data_counter: u16) -> Vec<u8> {
    let mut buffer = pkcs7_pad(encrypted, BLOCK_SIZE);

    let mut iv = [0u8; BLOCK_SIZE];
    iv[..2].copy_from_slice(&data_counter.to_le_bytes());

    let mut cipher = Aes128Ctr::new(key.as_bytes().into(), &iv.into());
    cipher.apply_keystream(&mut buffer);
    buffer
}

fn pkcs7_pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let padding = block_size - data.len() % block_size;
    let mut padded = Vec::with_capacity(data.len() + padding);
    padded.extend_from_slice(data);
    padded.resize(data.len() + padding, padding as u8);
    padded
}


#[test]
fn test_decode_smart_battery_sense() {
    let key = test_support::key();
    let record = test_support::record(1320, 29465, 2);
    let raw = test_support::frame(0xa3a4, 0x02, 0x1234, &key, &record);

    let reading = decode(&raw, &key).unwrap();
    assert_eq!(reading.model, Model::SmartBatterySense);
    assert_eq!(reading.voltage, Some(13.2));
    assert_eq!(reading.temperature, Some(21.5));
}

#[test]
fn test_decode_other_battery_monitor() {
    let key = test_support::key();
    let raw = test_support::frame(0xa389, 0x02, 7, &key, &test_support::record(2650, 0xffff, 3));

    let reading = decode(&raw, &key).unwrap();
    assert_eq!(reading.model, Model::BatteryMonitor);
    assert_eq!(reading.voltage, Some(26.5));
    assert_eq!(reading.temperature, None);
}

#[test]
fn test_decode_wrong_key() {
    let key = test_support::key();
    let other: AdvertisementKey = "ff23456789abcdef0123456789abcdef".parse().unwrap();
    let raw = test_support::frame(0xa3a4, 0x02, 1, &key, &test_support::record(1320, 29465, 2));

    let err = decode(&raw, &other).unwrap_err();
    assert_eq!(err, DecodeError::KeyMismatch { frame: 0x01, key: 0xff });
    assert!(err.is_silent());
}

#[test]
fn test_decode_unknown_record_type() {
    let key = test_support::key();
    // Solar charger record
    let raw = test_support::frame(0xa053, 0x01, 1, &key, &[0u8; 12]);

    let err = decode(&raw, &key).unwrap_err();
    assert_eq!(err, DecodeError::UnknownDevice { model_id: 0xa053, record_type: 0x01 });
    assert!(err.is_recoverable());
    assert!(!err.is_silent());
}

#[test]
fn test_decode_short_frame() {
    let err = decode(&[0x10, 0x02, 0xa4, 0xa3, 0x02], &test_support::key()).unwrap_err();
    assert_eq!(err, DecodeError::Truncated { expected: 8, actual: 5 });
    assert!(!err.is_recoverable());
}

#[test]
fn test_pkcs7_pad() {
    assert_eq!(pkcs7_pad(&[1, 2, 3], 4), vec![1, 2, 3, 1]);
    assert_eq!(pkcs7_pad(&[1, 2, 3, 4], 4), vec![1, 2, 3, 4, 4, 4, 4, 4]);
}
