//! The device adapter.
//!
//! Every query issues a fresh request to the machine and decodes the response; nothing is
//! cached except the last successfully decoded values, which the `read_*` fallbacks hand out
//! when the machine can't be reached.

use crate::connection::{self, Transport};
use crate::registers::{
    self, AlarmFlags, Register, Request, StatusFlags, FILTER_THRESHOLD_FIELD, REGISTERS_FIELD,
    TARGET_TEMPERATURE_RANGE,
};
use serde_json::{Map, Value};
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not communicate with the device")]
    Transport(#[source] connection::Error),
    #[error("device returned malformed JSON")]
    JsonDecode(#[source] serde_json::Error),
    #[error("device response is not an object")]
    ResponseIsntObject,
    #[error("device response does not contain a `registers` list")]
    MissingRegisters,
    #[error("device response does not contain a value for register {0}")]
    MissingRegister(u16),
    #[error("register {0} contains a value that isn't numeric ({1})")]
    RegisterIsntNumber(u16, Value),
    #[error("device response does not contain the `{0}` field")]
    MissingField(&'static str),
    #[error("field `{0}` contains a value that isn't numeric ({1})")]
    FieldIsntNumber(&'static str, Value),
    #[error("value {1} of `{0}` is out of range")]
    OutOfRange(&'static str, i64),
}

/// Decoded contents of the read-only parameter block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Snapshot {
    /// Boiler temperature in °C.
    pub temperature: i64,
    pub filter_days_remaining: i64,
    pub status: StatusFlags,
    pub alarm: AlarmFlags,
    pub filter_change_threshold_days: u32,
}

impl Snapshot {
    /// The machine is on, i.e. not in standby.
    pub fn is_active(&self) -> bool {
        !self.status.contains(StatusFlags::STANDBY)
    }

    /// The boiler has reached its setpoint.
    pub fn is_ready(&self) -> bool {
        self.status.contains(StatusFlags::READY)
    }

    pub fn heater_state(&self) -> HeaterState {
        if self.is_ready() { HeaterState::Idle } else { HeaterState::Heating }
    }

    pub fn needs_filter_change(&self) -> bool {
        self.alarm.contains(AlarmFlags::NEED_CHANGE_FILTERS)
    }

    /// Remaining filter life as a percentage of the change threshold.
    ///
    /// Zero when the machine reports no threshold.
    pub fn filter_life_percent(&self) -> f64 {
        if self.filter_change_threshold_days == 0 {
            return 0.0;
        }
        self.filter_days_remaining as f64 / f64::from(self.filter_change_threshold_days) * 100.0
    }
}

/// What the boiler heater is currently doing. The machine has no way to cool.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    serde::Serialize,
    strum::VariantNames,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum HeaterState {
    Idle,
    Heating,
}

pub struct Device<T> {
    transport: T,
    last_snapshot: Mutex<Snapshot>,
    last_target_temperature: Mutex<f64>,
}

impl<T: Transport> Device<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            last_snapshot: Mutex::new(Snapshot::default()),
            last_target_temperature: Mutex::new(f64::from(*TARGET_TEMPERATURE_RANGE.start())),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn post(&self, request: Request) -> Result<String, Error> {
        self.transport.post(request).await.map_err(Error::Transport)
    }

    pub async fn fetch_read_only_state(&self) -> Result<Snapshot, Error> {
        let response = self.post(Request::ReadOnlyParameters).await?;
        let snapshot = decode_read_only(&response)?;
        debug!(?snapshot, "read device state");
        *self.last_snapshot.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
        Ok(snapshot)
    }

    /// Target temperature in °C.
    pub async fn fetch_read_write_state(&self) -> Result<f64, Error> {
        let response = self.post(Request::ReadWriteParameters).await?;
        let target = decode_read_write(&response)?;
        debug!(target_temperature = target, "read device settings");
        *self.last_target_temperature.lock().unwrap_or_else(|e| e.into_inner()) = target;
        Ok(target)
    }

    /// [`Self::fetch_read_only_state`], but falls back to the last known state on failure.
    pub async fn read_only_state(&self) -> Snapshot {
        match self.fetch_read_only_state().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    message = "reading device state failed, using last known state",
                    error = (&e as &dyn std::error::Error)
                );
                *self.last_snapshot.lock().unwrap_or_else(|e| e.into_inner())
            }
        }
    }

    /// [`Self::fetch_read_write_state`], but falls back to the last known value on failure.
    pub async fn target_temperature(&self) -> f64 {
        match self.fetch_read_write_state().await {
            Ok(target) => target,
            Err(e) => {
                warn!(
                    message = "reading target temperature failed, using last known value",
                    error = (&e as &dyn std::error::Error)
                );
                *self.last_target_temperature.lock().unwrap_or_else(|e| e.into_inner())
            }
        }
    }

    pub async fn device_info(&self) -> Result<Value, Error> {
        let response = self.post(Request::DeviceInfo).await?;
        serde_json::from_str(&response).map_err(Error::JsonDecode)
    }

    pub async fn set_power(&self, on: bool) -> Result<(), Error> {
        self.command(if on { Request::PowerOn } else { Request::Standby }).await
    }

    /// Temperatures outside of [`TARGET_TEMPERATURE_RANGE`] are clamped into it.
    pub async fn set_target_temperature(&self, celsius: i32) -> Result<(), Error> {
        let (min, max) = (*TARGET_TEMPERATURE_RANGE.start(), *TARGET_TEMPERATURE_RANGE.end());
        let clamped = celsius.clamp(min, max);
        if clamped != celsius {
            warn!(requested = celsius, clamped, "target temperature out of range");
        }
        self.command(Request::SetTemperature(clamped)).await
    }

    pub async fn reset_filter_expiration(&self) -> Result<(), Error> {
        self.command(Request::ResetFilterExpiration).await
    }

    async fn command(&self, request: Request) -> Result<(), Error> {
        debug!(command = request.name(), body = %request, "sending command");
        // The response body carries nothing of interest for writes.
        self.post(request).await?;
        Ok(())
    }
}

fn parse_object(response: &str) -> Result<Map<String, Value>, Error> {
    match serde_json::from_str::<Value>(response).map_err(Error::JsonDecode)? {
        Value::Object(obj) => Ok(obj),
        _ => Err(Error::ResponseIsntObject),
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn register_value(obj: &Map<String, Value>, register: Register) -> Result<i64, Error> {
    let pairs = obj.get(REGISTERS_FIELD).and_then(Value::as_array).ok_or(Error::MissingRegisters)?;
    let value = pairs
        .iter()
        .filter_map(|pair| match pair.as_array()?.as_slice() {
            [index, value, ..] => Some((as_integer(index)?, value)),
            _ => None,
        })
        .find(|(index, _)| *index == i64::from(register.index))
        .map(|(_, value)| value)
        .ok_or(Error::MissingRegister(register.index))?;
    as_integer(value).ok_or_else(|| Error::RegisterIsntNumber(register.index, value.clone()))
}

fn field_value(obj: &Map<String, Value>, field: &'static str) -> Result<i64, Error> {
    let value = obj.get(field).ok_or(Error::MissingField(field))?;
    as_integer(value).ok_or_else(|| Error::FieldIsntNumber(field, value.clone()))
}

fn narrow<N: TryFrom<i64>>(name: &'static str, value: i64) -> Result<N, Error> {
    N::try_from(value).map_err(|_| Error::OutOfRange(name, value))
}

/// Decode the response to [`Request::ReadOnlyParameters`].
pub fn decode_read_only(response: &str) -> Result<Snapshot, Error> {
    let obj = parse_object(response)?;
    let status = register_value(&obj, registers::STATUS)?;
    let alarm = register_value(&obj, registers::ALARM)?;
    let threshold = field_value(&obj, FILTER_THRESHOLD_FIELD)?;
    Ok(Snapshot {
        temperature: register_value(&obj, registers::TEMPERATURE)?,
        filter_days_remaining: register_value(&obj, registers::FILTER_DAYS_REMAINING)?,
        status: StatusFlags::from_bits(narrow(registers::STATUS.name, status)?),
        alarm: AlarmFlags::from_bits(narrow(registers::ALARM.name, alarm)?),
        filter_change_threshold_days: narrow(FILTER_THRESHOLD_FIELD, threshold)?,
    })
}

/// Decode the response to [`Request::ReadWriteParameters`] into the target temperature in °C.
pub fn decode_read_write(response: &str) -> Result<f64, Error> {
    let obj = parse_object(response)?;
    let register = registers::TARGET_TEMPERATURE;
    let raw = register_value(&obj, register)?;
    Ok(raw as f64 / f64::from(register.scale))
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeTransport, READ_ONLY_RESPONSE, READ_WRITE_RESPONSE};
    use super::*;

    fn snapshot(status: u16, alarm: u16) -> Snapshot {
        Snapshot {
            status: StatusFlags::from_bits(status),
            alarm: AlarmFlags::from_bits(alarm),
            ..Snapshot::default()
        }
    }

    #[test]
    fn status_queries_follow_bits() {
        for bits in 0..=u16::MAX {
            let s = snapshot(bits, bits);
            assert_eq!(s.is_active(), bits & 16 == 0, "status {bits}");
            assert_eq!(s.is_ready(), bits & 32 != 0, "status {bits}");
            assert_eq!(s.needs_filter_change(), bits & 128 != 0, "alarm {bits}");
            let expected = if bits & 32 != 0 { HeaterState::Idle } else { HeaterState::Heating };
            assert_eq!(s.heater_state(), expected);
        }
    }

    #[test]
    fn filter_life() {
        let mut s = Snapshot { filter_days_remaining: 30, ..Snapshot::default() };
        assert_eq!(s.filter_life_percent(), 0.0);
        s.filter_days_remaining = 0;
        assert_eq!(s.filter_life_percent(), 0.0);
        s.filter_days_remaining = 30;
        s.filter_change_threshold_days = 60;
        assert_eq!(s.filter_life_percent(), 50.0);
        s.filter_days_remaining = 90;
        assert_eq!(s.filter_life_percent(), 150.0);
    }

    #[test]
    fn decode_sample_read_only_block() {
        let s = decode_read_only(READ_ONLY_RESPONSE).expect("decodes");
        assert_eq!(s.temperature, 93);
        assert_eq!(s.filter_days_remaining, 5);
        assert_eq!(s.status.bits(), 48);
        assert_eq!(s.alarm.bits(), 0);
        assert_eq!(s.filter_change_threshold_days, 60);
        // 48 carries both the standby and the ready bit.
        assert!(!s.is_active());
        assert!(s.is_ready());
        assert!(!s.needs_filter_change());
        assert!((s.filter_life_percent() - 8.333).abs() < 0.001);
    }

    #[test]
    fn decode_accepts_bare_numbers() {
        let response = r#"{"registers": [[0, 91], [10, 12], [12, 16], [14, 128]],
                           "ThesholdWarningChangeFilter": 0}"#;
        let s = decode_read_only(response).expect("decodes");
        assert_eq!(s.temperature, 91);
        assert!(!s.is_active());
        assert!(s.needs_filter_change());
        assert_eq!(s.filter_life_percent(), 0.0);
    }

    #[test]
    fn decode_rejects_malformed_responses() {
        assert!(matches!(decode_read_only("<html>"), Err(Error::JsonDecode(_))));
        assert!(matches!(decode_read_only("[]"), Err(Error::ResponseIsntObject)));
        assert!(matches!(decode_read_only("{}"), Err(Error::MissingRegisters)));
        let missing = r#"{"registers": [[0, "93"], [10, "5"], [14, "0"]],
                          "ThesholdWarningChangeFilter": "60"}"#;
        assert!(matches!(decode_read_only(missing), Err(Error::MissingRegister(12))));
        let garbage = r#"{"registers": [[0, "93"], [10, "5"], [12, "hot"], [14, "0"]],
                          "ThesholdWarningChangeFilter": "60"}"#;
        assert!(matches!(decode_read_only(garbage), Err(Error::RegisterIsntNumber(12, _))));
        let no_threshold = r#"{"registers": [[0, "93"], [10, "5"], [12, "48"], [14, "0"]]}"#;
        assert!(matches!(
            decode_read_only(no_threshold),
            Err(Error::MissingField(FILTER_THRESHOLD_FIELD))
        ));
        let wide = r#"{"registers": [[0, "93"], [10, "5"], [12, "70000"], [14, "0"]],
                       "ThesholdWarningChangeFilter": "60"}"#;
        assert!(matches!(decode_read_only(wide), Err(Error::OutOfRange("STATUS", 70000))));
    }

    #[test]
    fn decode_target_temperature() {
        assert_eq!(decode_read_write(READ_WRITE_RESPONSE).expect("decodes"), 120.0);
        assert_eq!(decode_read_write(r#"{"registers": [[0, "1185"]]}"#).expect("decodes"), 118.5);
    }

    #[tokio::test]
    async fn fetches_issue_fresh_requests() {
        let device = Device::new(FakeTransport::default());
        device
            .transport()
            .reply(Request::ReadOnlyParameters, READ_ONLY_RESPONSE)
            .reply(Request::ReadOnlyParameters, READ_ONLY_RESPONSE)
            .reply(Request::ReadWriteParameters, READ_WRITE_RESPONSE);
        assert_eq!(device.fetch_read_only_state().await.expect("ok").temperature, 93);
        assert_eq!(device.fetch_read_only_state().await.expect("ok").temperature, 93);
        assert_eq!(device.fetch_read_write_state().await.expect("ok"), 120.0);
        assert_eq!(device.transport().requests(), ["key=151", "key=151", "key=152"]);
    }

    #[tokio::test]
    async fn failures_fall_back_to_last_known_values() {
        let device = Device::new(FakeTransport::default());
        device
            .transport()
            .fail(Request::ReadOnlyParameters, 500)
            .reply(Request::ReadOnlyParameters, READ_ONLY_RESPONSE)
            .fail(Request::ReadOnlyParameters, 503)
            .reply(Request::ReadWriteParameters, "not json");

        assert!(matches!(
            device.fetch_read_only_state().await,
            Err(Error::Transport(connection::Error::Status(..)))
        ));
        assert_eq!(device.read_only_state().await.temperature, 93);
        assert_eq!(device.read_only_state().await.temperature, 93);
        assert_eq!(device.target_temperature().await, 115.0);
    }

    #[tokio::test]
    async fn zero_initialised_fallback() {
        let device = Device::new(FakeTransport::default());
        device.transport().fail(Request::ReadOnlyParameters, 404);
        assert_eq!(device.read_only_state().await, Snapshot::default());
    }

    #[tokio::test]
    async fn commands() {
        let device = Device::new(FakeTransport::default());
        device.set_power(false).await.expect("sent");
        device.set_power(true).await.expect("sent");
        device.set_target_temperature(120).await.expect("sent");
        device.set_target_temperature(140).await.expect("sent");
        device.set_target_temperature(20).await.expect("sent");
        device.reset_filter_expiration().await.expect("sent");
        assert_eq!(
            device.transport().requests(),
            [
                "key=200&id=12&value=1",
                "key=200&id=11&value=1",
                "key=200&id=1&value=120",
                "key=200&id=1&value=130",
                "key=200&id=1&value=115",
                "key=200&id=23&value=0",
            ]
        );
    }

    #[tokio::test]
    async fn command_failures_are_reported() {
        let device = Device::new(FakeTransport::default());
        device.transport().fail(Request::ResetFilterExpiration, 500);
        assert!(device.reset_filter_expiration().await.is_err());
    }

    #[tokio::test]
    async fn device_info_is_raw_json() {
        let device = Device::new(FakeTransport::default());
        device.transport().reply(Request::DeviceInfo, r#"{"Model": "Cube", "Version": "1.2"}"#);
        let info = device.device_info().await.expect("ok");
        assert_eq!(info["Model"], "Cube");
    }
}
