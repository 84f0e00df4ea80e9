use super::bit_reader::{to_signed, BitReader};
use super::DecodeError;
use crate::reading::{DeviceReading, Model};

const REMAINING_MINS_NA: u32 = 0xffff;
const VOLTAGE_NA: i32 = 0x7fff;
const AUX_NA: u32 = 0xffff;
const CURRENT_NA: u32 = 0x3fffff;
const CONSUMED_NA: u32 = 0xfffff;
const SOC_NA: u32 = 0x3ff;
const KELVIN_OFFSET: f64 = 273.15;

/// What the auxiliary input of a battery monitor is wired to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuxMode {
    StarterVoltage,
    MidpointVoltage,
    Temperature,
    Disabled,
}

impl AuxMode {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => AuxMode::StarterVoltage,
            1 => AuxMode::MidpointVoltage,
            2 => AuxMode::Temperature,
            _ => AuxMode::Disabled,
        }
    }
}

/// Decode the decrypted payload of a battery monitor record.
///
/// Layout, least significant bit first:
///
/// Bits | Field
/// 16   | Time to go, minutes
/// 16   | Battery voltage, signed, 0.01 V
/// 16   | Alarm reason
/// 16   | Aux value, meaning depends on aux mode
/// 2    | Aux mode
/// 22   | Battery current, signed, 0.001 A
/// 20   | Consumed, 0.1 Ah (reported negative)
/// 10   | State of charge, 0.1 %
pub(crate) fn decode(model: Model, decrypted: &[u8]) -> Result<DeviceReading, DecodeError> {
    let mut reader = BitReader::new(decrypted);
    let mut field = |bits: u32| {
        reader.read_unsigned(bits).ok_or(DecodeError::Truncated {
            expected: 15,
            actual: decrypted.len(),
        })
    };

    let remaining_mins = field(16)?;
    let voltage = to_signed(field(16)?, 16);
    let alarm = field(16)?;
    let aux = field(16)?;
    let aux_mode = AuxMode::from_bits(field(2)?);
    let current = field(22)?;
    let consumed = field(20)?;
    let soc = field(10)?;

    let mut reading = DeviceReading::empty(model);
    reading.remaining_mins = (remaining_mins != REMAINING_MINS_NA).then_some(remaining_mins as u16);
    reading.voltage = (voltage != VOLTAGE_NA).then(|| voltage as f64 / 100.0);
    reading.alarm = alarm as u16;
    reading.current = (current != CURRENT_NA).then(|| to_signed(current, 22) as f64 / 1000.0);
    reading.consumed_ah = (consumed != CONSUMED_NA).then(|| -(consumed as f64) / 10.0);
    reading.state_of_charge = (soc != SOC_NA).then(|| soc as f64 / 10.0);

    match aux_mode {
        AuxMode::StarterVoltage => {
            let starter = to_signed(aux, 16);
            reading.starter_voltage = (starter != VOLTAGE_NA).then(|| starter as f64 / 100.0);
        }
        AuxMode::MidpointVoltage => {
            reading.midpoint_voltage = (aux != AUX_NA).then(|| aux as f64 / 100.0);
        }
        AuxMode::Temperature => {
            reading.temperature =
                (aux != AUX_NA).then(|| round_centi(aux as f64 / 100.0 - KELVIN_OFFSET));
        }
        AuxMode::Disabled => {}
    }

    Ok(reading)
}

fn round_centi(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Packs battery monitor fields the same way the device does
    pub struct RecordBuilder {
        bits: Vec<bool>,
    }

    impl RecordBuilder {
        pub fn new() -> Self {
            Self { bits: Vec::new() }
        }

        pub fn field(mut self, value: u32, bits: u32) -> Self {
            for position in 0..bits {
                self.bits.push((value >> position) & 1 == 1);
            }
            self
        }

        pub fn build(self) -> Vec<u8> {
            let mut bytes = vec![0u8; (self.bits.len() + 7) / 8];
            for (i, bit) in self.bits.iter().enumerate() {
                if *bit {
                    bytes[i / 8] |= 1 << (i % 8);
                }
            }
            bytes
        }
    }

    /// A full record with the given voltage (0.01 V) and aux input
    pub fn record(voltage: u32, aux: u32, aux_mode: u32) -> Vec<u8> {
        RecordBuilder::new()
            .field(0xffff, 16)
            .field(voltage, 16)
            .field(0, 16)
            .field(aux, 16)
            .field(aux_mode, 2)
            .field(0x3fffff, 22)
            .field(0xfffff, 20)
            .field(0x3ff, 10)
            .build()
    }
}

#[test]
fn test_decode_battery_sense_record() {
    // 13.20 V, 294.65 K
    let payload = test_support::record(1320, 29465, 2);
    assert_eq!(payload.len(), 15);

    let reading = decode(Model::SmartBatterySense, &payload).unwrap();
    assert_eq!(reading.voltage, Some(13.2));
    assert_eq!(reading.temperature, Some(21.5));
    assert_eq!(reading.current, None);
    assert_eq!(reading.state_of_charge, None);
    assert_eq!(reading.consumed_ah, None);
    assert_eq!(reading.remaining_mins, None);
    assert_eq!(reading.alarm, 0);
}

#[test]
fn test_decode_voltage_not_available() {
    let payload = test_support::record(0x7fff, 29465, 2);
    let reading = decode(Model::SmartBatterySense, &payload).unwrap();
    assert_eq!(reading.voltage, None);
    assert_eq!(reading.temperature, Some(21.5));
}

#[test]
fn test_decode_shunt_record() {
    let payload = test_support::RecordBuilder::new()
        .field(600, 16)
        .field(2650, 16)
        .field(0, 16)
        .field(1280, 16)
        .field(0, 2)
        // -2.5 A
        .field(0x400000 - 2500, 22)
        .field(123, 20)
        .field(874, 10)
        .build();

    let reading = decode(Model::BatteryMonitor, &payload).unwrap();
    assert_eq!(reading.remaining_mins, Some(600));
    assert_eq!(reading.voltage, Some(26.5));
    assert_eq!(reading.starter_voltage, Some(12.8));
    assert_eq!(reading.temperature, None);
    assert_eq!(reading.current, Some(-2.5));
    assert_eq!(reading.consumed_ah, Some(-12.3));
    assert_eq!(reading.state_of_charge, Some(87.4));
}

#[test]
fn test_decode_truncated() {
    let err = decode(Model::BatteryMonitor, &[0u8; 8]).unwrap_err();
    assert_eq!(err, DecodeError::Truncated { expected: 15, actual: 8 });
}
