use crate::homie::node::{DeviceCommand, Node, PropertyEntry};
use crate::homie::value::{
    BooleanValue, EnumValue, PercentValue, PropertyDescription, RemainingDays, homie_enum,
};
use homie5::HomieID;

static PROPERTIES: [PropertyEntry; 4] = [
    PropertyEntry {
        prop_id: HomieID::new_const("should-replace"),
        mk_description: BooleanValue::description,
        read: |r| Box::new(BooleanValue(r.snapshot.needs_filter_change())),
        set: None,
    },
    PropertyEntry {
        prop_id: HomieID::new_const("life-level"),
        mk_description: PercentValue::description,
        read: |r| Box::new(PercentValue::new(r.snapshot.filter_life_percent())),
        set: None,
    },
    PropertyEntry {
        prop_id: HomieID::new_const("remaining-time"),
        mk_description: RemainingDays::description,
        read: |r| Box::new(RemainingDays::new(r.snapshot.filter_days_remaining)),
        set: None,
    },
    PropertyEntry {
        prop_id: HomieID::new_const("replace"),
        // An action: there is no state worth retaining.
        mk_description: || homie_enum::<ReplaceAction>().retained(false).build(),
        read: |_| Box::new(EnumValue(ReplaceAction::Now.into())),
        set: Some(|v| {
            v.parse::<ReplaceAction>().map_err(|_| ())?;
            Ok(DeviceCommand::ResetFilterExpiration)
        }),
    },
];

#[derive(Clone, Copy, strum::VariantNames, strum::IntoStaticStr, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
enum ReplaceAction {
    Now,
}

pub struct FilterNode {}

impl FilterNode {
    pub(crate) fn new() -> Self {
        Self {}
    }
}

impl Node for FilterNode {
    fn node_id(&self) -> HomieID {
        HomieID::new_const("filter")
    }

    fn name(&self) -> &'static str {
        "water filter state and replacement"
    }

    fn properties(&self) -> &'static [PropertyEntry] {
        &PROPERTIES
    }
}
