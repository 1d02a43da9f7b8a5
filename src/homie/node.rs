use crate::device::Snapshot;
use crate::homie::value::PropertyValue;
use homie5::HomieID;
use homie5::device_description::{HomieNodeDescription, HomiePropertyDescription};
use std::collections::BTreeMap;

/// Everything a presentation may derive property values from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Reading {
    pub(crate) snapshot: Snapshot,
    /// Target temperature in °C.
    pub(crate) target_temperature: f64,
}

/// What the device adapter should do in response to a property being set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeviceCommand {
    SetPower(bool),
    SetTargetTemperature(i32),
    ResetFilterExpiration,
    /// The value is accepted, but there is nothing to change on the device.
    Nothing,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub(crate) enum SetError {
    #[error("property `{0}` does not exist")]
    UnknownProperty(String),
    #[error("property `{0}` is not settable")]
    NotSettable(String),
    #[error("`{1}` is not a valid value for property `{0}`")]
    InvalidValue(String, String),
}

pub(crate) struct PropertyEntry {
    pub(crate) prop_id: HomieID,
    pub(crate) mk_description: fn() -> HomiePropertyDescription,
    pub(crate) read: fn(&Reading) -> Box<dyn PropertyValue>,
    pub(crate) set: Option<fn(&str) -> Result<DeviceCommand, ()>>,
}

impl PropertyEntry {
    pub(crate) fn description(&self) -> HomiePropertyDescription {
        let mut description = (self.mk_description)();
        description.settable = self.set.is_some();
        description
    }
}

pub(crate) trait Node: Send + Sync {
    /// The ID for this homie node.
    fn node_id(&self) -> HomieID;
    /// Human readable name of the node.
    fn name(&self) -> &'static str;
    fn properties(&self) -> &'static [PropertyEntry];

    /// The Homie description for the node.
    fn description(&self) -> HomieNodeDescription {
        let properties = self
            .properties()
            .iter()
            .map(|prop| (prop.prop_id.clone(), prop.description()))
            .collect::<BTreeMap<_, _>>();
        HomieNodeDescription {
            name: Some(self.name().to_string()),
            r#type: None,
            properties,
        }
    }

    /// Current values of all the properties of this node.
    fn values(&self, reading: &Reading) -> Vec<(HomieID, String)> {
        self.properties()
            .iter()
            .map(|prop| (prop.prop_id.clone(), (prop.read)(reading).value()))
            .collect()
    }

    fn set(&self, prop_id: &HomieID, value: &str) -> Result<DeviceCommand, SetError> {
        let prop = self
            .properties()
            .iter()
            .find(|p| &p.prop_id == prop_id)
            .ok_or_else(|| SetError::UnknownProperty(prop_id.to_string()))?;
        let set = prop.set.ok_or_else(|| SetError::NotSettable(prop_id.to_string()))?;
        set(value).map_err(|()| SetError::InvalidValue(prop_id.to_string(), value.to_string()))
    }
}
