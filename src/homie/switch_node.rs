//! The minimal presentation: a standby switch and a boiler temperature sensor.

use crate::homie::node::{DeviceCommand, Node, PropertyEntry};
use crate::homie::value::{BooleanValue, CelsiusValue, PropertyDescription};
use homie5::HomieID;

static SWITCH_PROPERTIES: [PropertyEntry; 1] = [PropertyEntry {
    prop_id: HomieID::new_const("on"),
    mk_description: BooleanValue::description,
    read: |r| Box::new(BooleanValue(r.snapshot.is_active())),
    set: Some(|v| Ok(DeviceCommand::SetPower(BooleanValue::try_from(v)?.0))),
}];

static SENSOR_PROPERTIES: [PropertyEntry; 1] = [PropertyEntry {
    prop_id: HomieID::new_const("temperature"),
    mk_description: CelsiusValue::description,
    read: |r| Box::new(CelsiusValue(r.snapshot.temperature as f64)),
    set: None,
}];

pub struct SwitchNode {}

impl SwitchNode {
    pub(crate) fn new() -> Self {
        Self {}
    }
}

impl Node for SwitchNode {
    fn node_id(&self) -> HomieID {
        HomieID::new_const("switch")
    }

    fn name(&self) -> &'static str {
        "standby switch"
    }

    fn properties(&self) -> &'static [PropertyEntry] {
        &SWITCH_PROPERTIES
    }
}

pub struct TemperatureSensorNode {}

impl TemperatureSensorNode {
    pub(crate) fn new() -> Self {
        Self {}
    }
}

impl Node for TemperatureSensorNode {
    fn node_id(&self) -> HomieID {
        HomieID::new_const("temperature-sensor")
    }

    fn name(&self) -> &'static str {
        "boiler temperature sensor"
    }

    fn properties(&self) -> &'static [PropertyEntry] {
        &SENSOR_PROPERTIES
    }
}
