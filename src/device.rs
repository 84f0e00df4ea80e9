use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid MAC address {0:?}, expected AA:BB:CC:DD:EE:FF")]
    MacAddress(String),
    #[error("invalid advertisement key, expected 32 hex characters: {0}")]
    AdvertisementKey(String),
}

/// A Bluetooth device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl From<btleplug::api::BDAddr> for MacAddress {
    fn from(addr: btleplug::api::BDAddr) -> Self {
        Self(addr.into_inner())
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    /// Accepts `:` or `-` separated octets in either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::MacAddress(s.to_string());
        let parts: Vec<&str> = s.trim().split(|c: char| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(parts) {
            // from_str_radix would also take a sign
            if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// The per-device AES-128 key used to encrypt instant readout advertisements.
///
/// Shown in the VictronConnect app under Product info -> Encryption data.
#[derive(Clone, PartialEq, Eq)]
pub struct AdvertisementKey([u8; 16]);

impl AdvertisementKey {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl FromStr for AdvertisementKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| ParseError::AdvertisementKey(e.to_string()))?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| ParseError::AdvertisementKey(format!("got {} bytes", b.len())))?;
        Ok(Self(bytes))
    }
}

// Keep key material out of logs.
impl fmt::Debug for AdvertisementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AdvertisementKey({:02x}..)", self.0[0])
    }
}

#[test]
fn test_parse_mac_address() {
    let mac: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
    assert_eq!(mac.as_bytes(), &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    assert_eq!(mac.to_string(), "AA:BB:CC:DD:EE:FF");

    let dashed: MacAddress = "AA-BB-CC-DD-EE-FF".parse().unwrap();
    assert_eq!(dashed, mac);
}

#[test]
fn test_parse_mac_address_invalid() {
    assert!("AA:BB:CC:DD:EE".parse::<MacAddress>().is_err());
    assert!("AA:BB:CC:DD:EE:GG".parse::<MacAddress>().is_err());
    assert!("AAA:BB:CC:DD:EE:F".parse::<MacAddress>().is_err());
    assert!("+A:BB:CC:DD:EE:FF".parse::<MacAddress>().is_err());
}

#[test]
fn test_parse_advertisement_key() {
    let key: AdvertisementKey = "0123456789abcdef0123456789abcdef".parse().unwrap();
    assert_eq!(key.as_bytes()[0], 0x01);
    assert_eq!(key.as_bytes()[15], 0xef);
    assert_eq!(format!("{key:?}"), "AdvertisementKey(01..)");
}

#[test]
fn test_parse_advertisement_key_wrong_length() {
    let err = "0123".parse::<AdvertisementKey>().unwrap_err();
    assert_eq!(err, ParseError::AdvertisementKey("got 2 bytes".to_string()));
    assert!("not hex at all, not hex at all!!".parse::<AdvertisementKey>().is_err());
}
