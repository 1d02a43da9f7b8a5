//! Static knowledge about the Sanremo Cube control firmware.
//!
//! The machine exposes two parameter blocks over its `/ajax/post` endpoint: a read-only one
//! (live measurements and status bitfields) and a read-write one (settings). Each block is
//! returned as a list of `[index, "value"]` pairs. Writes go through a single generic command
//! taking a parameter `id` and a `value`.
//!
//! None of the indices, ids or bitmasks here are discoverable from the device. They are the
//! values the firmware is known to use.

use std::ops::RangeInclusive;

/// Name of the top-level JSON field containing the register pairs.
pub const REGISTERS_FIELD: &str = "registers";

/// Top-level field of the read-only block carrying the filter change threshold in days.
///
/// The misspelling is the firmware's.
pub const FILTER_THRESHOLD_FIELD: &str = "ThesholdWarningChangeFilter";

/// Target temperatures the machine accepts, in °C.
pub const TARGET_TEMPERATURE_RANGE: RangeInclusive<i32> = 115..=130;

/// Upper bound advertised for the current boiler temperature, in °C.
pub const CURRENT_TEMPERATURE_MAX: f64 = 150.0;

/// A request understood by the `/ajax/post` endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    DeviceInfo,
    ReadOnlyParameters,
    ReadWriteParameters,
    Standby,
    PowerOn,
    SetTemperature(i32),
    ResetFilterExpiration,
}

impl Request {
    /// The literal, URL-encoded body sent for this request.
    pub fn body(&self) -> String {
        match *self {
            Request::DeviceInfo => "key=150".to_string(),
            Request::ReadOnlyParameters => "key=151".to_string(),
            Request::ReadWriteParameters => "key=152".to_string(),
            Request::Standby => write_command(SET_STANDBY, 1),
            Request::PowerOn => write_command(SET_ACTIVE, 1),
            Request::SetTemperature(celsius) => write_command(SET_TEMPERATURE, celsius),
            Request::ResetFilterExpiration => write_command(RESET_FILTER_EXPIRATION, 0),
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Request::DeviceInfo | Request::ReadOnlyParameters | Request::ReadWriteParameters
        )
    }

    /// Every request kind with a representative argument, for listing purposes.
    pub fn all() -> [Request; 7] {
        [
            Request::DeviceInfo,
            Request::ReadOnlyParameters,
            Request::ReadWriteParameters,
            Request::Standby,
            Request::PowerOn,
            Request::SetTemperature(*TARGET_TEMPERATURE_RANGE.start()),
            Request::ResetFilterExpiration,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::DeviceInfo => "device-info",
            Request::ReadOnlyParameters => "read-only-parameters",
            Request::ReadWriteParameters => "read-write-parameters",
            Request::Standby => "standby",
            Request::PowerOn => "power-on",
            Request::SetTemperature(_) => "set-temperature",
            Request::ResetFilterExpiration => "reset-filter-expiration",
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.body())
    }
}

const WRITE_KEY: u16 = 200;
const SET_TEMPERATURE: u16 = 1;
const SET_ACTIVE: u16 = 11;
const SET_STANDBY: u16 = 12;
const RESET_FILTER_EXPIRATION: u16 = 23;

fn write_command(id: u16, value: i32) -> String {
    format!("key={WRITE_KEY}&id={id}&value={value}")
}

/// The parameter block a register belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Block {
    ReadOnly,
    ReadWrite,
}

impl Block {
    pub const fn request(self) -> Request {
        match self {
            Block::ReadOnly => Request::ReadOnlyParameters,
            Block::ReadWrite => Request::ReadWriteParameters,
        }
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Block::ReadOnly => "R-",
            Block::ReadWrite => "RW",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Register {
    pub block: Block,
    pub index: u16,
    pub name: &'static str,
    /// The raw value is this many times larger than the physical quantity.
    pub scale: u8,
    pub description: &'static str,
}

macro_rules! registers {
    ($($ident:ident = $block:ident $index:literal / $scale:literal, $name:literal, $description:literal;)*) => {
        $(pub const $ident: Register = Register {
            block: Block::$block,
            index: $index,
            name: $name,
            scale: $scale,
            description: $description,
        };)*

        pub const REGISTERS: &[Register] = &[$($ident),*];
    };
}

registers! {
    TEMPERATURE = ReadOnly 0 / 1, "TEMPERATURE", "Boiler temperature in °C";
    FILTER_DAYS_REMAINING = ReadOnly 10 / 1, "FILTER_DAYS_REMAINING", "Days left until the water filter should be replaced";
    STATUS = ReadOnly 12 / 1, "STATUS", "Machine status bitfield";
    ALARM = ReadOnly 14 / 1, "ALARM", "Alarm bitfield";
    TARGET_TEMPERATURE = ReadWrite 0 / 10, "TARGET_TEMPERATURE", "Boiler temperature setpoint in °C";
}

macro_rules! bitfield {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident;
        const $table:ident;
        $($flag:ident = $bit:literal, $flag_name:literal, $flag_description:literal;)*
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
        #[serde(transparent)]
        $vis struct $name(u16);

        impl $name {
            $(pub const $flag: Self = Self(1 << $bit);)*

            pub const fn from_bits(bits: u16) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> u16 {
                self.0
            }

            pub const fn contains(self, flag: Self) -> bool {
                self.0 & flag.0 == flag.0
            }

            /// Names of all the known flags set in this value.
            pub fn names(self) -> impl Iterator<Item = &'static str> {
                $table.iter().filter(move |(f, _, _)| self.contains(*f)).map(|(_, n, _)| *n)
            }
        }

        pub const $table: &[($name, &str, &str)] = &[
            $(($name::$flag, $flag_name, $flag_description)),*
        ];
    };
}

bitfield! {
    /// Contents of the [`STATUS`] register.
    pub struct StatusFlags;
    const STATUS_BITS;
    TANK_LEVEL_OK = 0, "tank-level-ok", "Water tank level is sufficient";
    BOILER_LEVEL_OK = 1, "boiler-level-ok", "Boiler water level is sufficient";
    PRE_ALARM_TANK_LEVEL = 2, "pre-alarm-tank-level", "Water tank is close to running empty";
    WATER_SOURCE = 3, "water-source", "Water is supplied from the mains rather than the tank";
    STANDBY = 4, "standby", "Machine is in standby and not heating";
    READY = 5, "ready", "Boiler has reached the setpoint";
    STEAM_BOOSTER_HEATING = 8, "steam-booster-heating", "Steam booster is heating";
    STEAM_BOOSTER_SETPOINT_OK = 9, "steam-booster-setpoint-ok", "Steam booster has reached its setpoint";
}

bitfield! {
    /// Contents of the [`ALARM`] register.
    pub struct AlarmFlags;
    const ALARM_BITS;
    NEED_CHANGE_FILTERS = 7, "need-change-filters", "Water filter is due for replacement";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_bodies() {
        assert_eq!(Request::DeviceInfo.body(), "key=150");
        assert_eq!(Request::ReadOnlyParameters.body(), "key=151");
        assert_eq!(Request::ReadWriteParameters.body(), "key=152");
        assert_eq!(Request::Standby.body(), "key=200&id=12&value=1");
        assert_eq!(Request::PowerOn.body(), "key=200&id=11&value=1");
        assert_eq!(Request::SetTemperature(120).body(), "key=200&id=1&value=120");
        assert_eq!(Request::ResetFilterExpiration.body(), "key=200&id=23&value=0");
        assert_eq!(Request::Standby.to_string(), "key=200&id=12&value=1");
    }

    #[test]
    fn bitmasks_match_firmware() {
        assert_eq!(StatusFlags::TANK_LEVEL_OK.bits(), 1);
        assert_eq!(StatusFlags::BOILER_LEVEL_OK.bits(), 2);
        assert_eq!(StatusFlags::PRE_ALARM_TANK_LEVEL.bits(), 4);
        assert_eq!(StatusFlags::WATER_SOURCE.bits(), 8);
        assert_eq!(StatusFlags::STANDBY.bits(), 16);
        assert_eq!(StatusFlags::READY.bits(), 32);
        assert_eq!(StatusFlags::STEAM_BOOSTER_HEATING.bits(), 256);
        assert_eq!(StatusFlags::STEAM_BOOSTER_SETPOINT_OK.bits(), 512);
        assert_eq!(AlarmFlags::NEED_CHANGE_FILTERS.bits(), 128);
    }

    #[test]
    fn flag_names() {
        let status = StatusFlags::from_bits(48);
        assert_eq!(status.names().collect::<Vec<_>>(), ["standby", "ready"]);
        assert_eq!(StatusFlags::default().names().count(), 0);
    }

    #[test]
    fn register_table() {
        let indices = REGISTERS.iter().map(|r| (r.block, r.index)).collect::<Vec<_>>();
        assert_eq!(
            indices,
            [
                (Block::ReadOnly, 0),
                (Block::ReadOnly, 10),
                (Block::ReadOnly, 12),
                (Block::ReadOnly, 14),
                (Block::ReadWrite, 0),
            ]
        );
        assert!(!Request::ReadOnlyParameters.is_write());
        assert!(Request::SetTemperature(115).is_write());
    }
}
