use serde::Serialize;

/// The kind of Victron device that produced a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Model {
    SmartBatterySense,
    BatteryMonitor,
}

/// A reading decoded from one advertisement.
///
/// Every measurement is optional: the device marks fields it is not
/// reporting this cycle with an N/A value, and those come through as `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReading {
    pub model: Model,
    /// Battery voltage in V
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    /// Temperature in °C
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Battery current in A, negative when discharging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    /// State of charge in %
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_of_charge: Option<f64>,
    /// Consumed charge in Ah (zero or negative)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed_ah: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_mins: Option<u16>,
    /// Starter battery voltage in V
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starter_voltage: Option<f64>,
    /// Midpoint voltage in V
    #[serde(skip_serializing_if = "Option::is_none")]
    pub midpoint_voltage: Option<f64>,
    /// Raw alarm reason bit field, 0 when no alarm is active
    pub alarm: u16,
}

impl DeviceReading {
    pub fn empty(model: Model) -> Self {
        Self {
            model,
            voltage: None,
            temperature: None,
            current: None,
            state_of_charge: None,
            consumed_ah: None,
            remaining_mins: None,
            starter_voltage: None,
            midpoint_voltage: None,
            alarm: 0,
        }
    }
}

#[test]
fn test_debug_json_omits_absent_fields() {
    let mut reading = DeviceReading::empty(Model::SmartBatterySense);
    reading.voltage = Some(13.2);
    let json = serde_json::to_string(&reading).unwrap();
    assert_eq!(json, r#"{"model":"smart_battery_sense","voltage":13.2,"alarm":0}"#);
}
