//! The boiler as a heater: power, temperatures and what the heater is doing.

use crate::device::HeaterState;
use crate::homie::node::{DeviceCommand, Node, PropertyEntry};
use crate::homie::value::{
    BooleanValue, CelsiusValue, EnumValue, PropertyDescription, float_range, homie_enum,
};
use crate::registers::{CURRENT_TEMPERATURE_MAX, TARGET_TEMPERATURE_RANGE};
use homie5::HomieID;
use homie5::device_description::HomiePropertyDescription;

static PROPERTIES: [PropertyEntry; 5] = [
    PropertyEntry {
        prop_id: HomieID::new_const("active"),
        mk_description: BooleanValue::description,
        read: |r| Box::new(BooleanValue(r.snapshot.is_active())),
        set: Some(|v| Ok(DeviceCommand::SetPower(BooleanValue::try_from(v)?.0))),
    },
    PropertyEntry {
        prop_id: HomieID::new_const("current-temperature"),
        mk_description: current_temperature_description,
        read: |r| Box::new(CelsiusValue(r.snapshot.temperature as f64)),
        set: None,
    },
    PropertyEntry {
        prop_id: HomieID::new_const("target-temperature"),
        mk_description: target_temperature_description,
        read: |r| Box::new(CelsiusValue(r.target_temperature)),
        set: Some(|v| {
            let celsius = CelsiusValue::try_from(v)?;
            Ok(DeviceCommand::SetTargetTemperature(celsius.whole_degrees()))
        }),
    },
    PropertyEntry {
        prop_id: HomieID::new_const("state"),
        mk_description: || homie_enum::<HeaterState>().build(),
        read: |r| Box::new(EnumValue(r.snapshot.heater_state().into())),
        set: None,
    },
    PropertyEntry {
        prop_id: HomieID::new_const("target-state"),
        mk_description: || homie_enum::<TargetHeaterState>().build(),
        read: |_| Box::new(EnumValue(TargetHeaterState::Heat.into())),
        set: Some(|v| {
            v.parse::<TargetHeaterState>().map_err(|_| ())?;
            Ok(DeviceCommand::Nothing)
        }),
    },
];

fn current_temperature_description() -> HomiePropertyDescription {
    let mut description = CelsiusValue::description();
    description.format = float_range(0.0..=CURRENT_TEMPERATURE_MAX, None);
    description
}

fn target_temperature_description() -> HomiePropertyDescription {
    let min = f64::from(*TARGET_TEMPERATURE_RANGE.start());
    let max = f64::from(*TARGET_TEMPERATURE_RANGE.end());
    let mut description = CelsiusValue::description();
    description.format = float_range(min..=max, Some(1.0));
    description
}

/// The only mode the boiler can be asked to be in.
#[derive(Clone, Copy, strum::VariantNames, strum::IntoStaticStr, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
enum TargetHeaterState {
    Heat,
}

pub struct HeaterNode {}

impl HeaterNode {
    pub(crate) fn new() -> Self {
        Self {}
    }
}

impl Node for HeaterNode {
    fn node_id(&self) -> HomieID {
        HomieID::new_const("heater")
    }

    fn name(&self) -> &'static str {
        "boiler heater"
    }

    fn properties(&self) -> &'static [PropertyEntry] {
        &PROPERTIES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Snapshot;
    use crate::homie::node::{Reading, SetError};
    use crate::registers::StatusFlags;

    fn reading(status: u16) -> Reading {
        Reading {
            snapshot: Snapshot {
                temperature: 93,
                status: StatusFlags::from_bits(status),
                ..Snapshot::default()
            },
            target_temperature: 120.0,
        }
    }

    fn value_of(values: &[(HomieID, String)], id: &'static str) -> String {
        let id = HomieID::new_const(id);
        values.iter().find(|(p, _)| *p == id).map(|(_, v)| v.clone()).expect("property exists")
    }

    #[test]
    fn values_follow_the_snapshot() {
        let node = HeaterNode::new();
        let values = node.values(&reading(48));
        assert_eq!(value_of(&values, "active"), "false");
        assert_eq!(value_of(&values, "current-temperature"), "93");
        assert_eq!(value_of(&values, "target-temperature"), "120");
        assert_eq!(value_of(&values, "state"), "idle");
        assert_eq!(value_of(&values, "target-state"), "heat");

        let values = node.values(&reading(1));
        assert_eq!(value_of(&values, "active"), "true");
        assert_eq!(value_of(&values, "state"), "heating");
    }

    #[test]
    fn settable_properties() {
        let node = HeaterNode::new();
        let id = HomieID::new_const;
        assert_eq!(node.set(&id("active"), "true"), Ok(DeviceCommand::SetPower(true)));
        assert_eq!(node.set(&id("active"), "false"), Ok(DeviceCommand::SetPower(false)));
        assert_eq!(
            node.set(&id("target-temperature"), "124.4"),
            Ok(DeviceCommand::SetTargetTemperature(124))
        );
        assert_eq!(node.set(&id("target-state"), "heat"), Ok(DeviceCommand::Nothing));
        assert!(matches!(node.set(&id("target-state"), "cool"), Err(SetError::InvalidValue(..))));
        assert!(matches!(node.set(&id("state"), "idle"), Err(SetError::NotSettable(_))));
        assert!(matches!(node.set(&id("brew"), "now"), Err(SetError::UnknownProperty(_))));
    }

    #[test]
    fn description_marks_settable_properties() {
        let description = HeaterNode::new().description();
        assert!(description.properties[&HomieID::new_const("active")].settable);
        assert!(!description.properties[&HomieID::new_const("state")].settable);
    }
}
