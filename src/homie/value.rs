use homie5::HomieDataType;
use homie5::device_description::{
    FloatRange, HomiePropertyDescription, HomiePropertyFormat, PropertyDescriptionBuilder,
};
use std::ops::RangeInclusive;

pub(crate) fn homie_enum<T: strum::VariantNames>() -> PropertyDescriptionBuilder {
    let format = HomiePropertyFormat::Enum(T::VARIANTS.iter().copied().map(Into::into).collect());
    PropertyDescriptionBuilder::new(HomieDataType::Enum).format(format)
}

pub(crate) fn float_range(range: RangeInclusive<f64>, step: Option<f64>) -> HomiePropertyFormat {
    FloatRange {
        min: Some(*range.start()),
        max: Some(*range.end()),
        step,
    }
    .into()
}

pub(crate) trait PropertyValue: Send + Sync {
    fn value(&self) -> String;
}

pub(crate) trait PropertyDescription {
    fn description() -> HomiePropertyDescription;
}

pub(crate) struct BooleanValue(pub(crate) bool);
impl PropertyDescription for BooleanValue {
    fn description() -> HomiePropertyDescription {
        PropertyDescriptionBuilder::new(HomieDataType::Boolean).build()
    }
}
impl TryFrom<&str> for BooleanValue {
    type Error = ();
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(Self(value.parse().map_err(|_| ())?))
    }
}
impl PropertyValue for BooleanValue {
    fn value(&self) -> String {
        self.0.to_string()
    }
}

pub(crate) struct CelsiusValue(pub(crate) f64);
impl TryFrom<&str> for CelsiusValue {
    type Error = ();
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let value = value.trim().parse::<f64>().map_err(|_| ())?;
        value.is_finite().then_some(Self(value)).ok_or(())
    }
}
impl PropertyValue for CelsiusValue {
    fn value(&self) -> String {
        self.0.to_string()
    }
}
impl PropertyDescription for CelsiusValue {
    fn description() -> HomiePropertyDescription {
        PropertyDescriptionBuilder::new(HomieDataType::Float)
            .unit(homie5::HOMIE_UNIT_DEGREE_CELSIUS)
            .build()
    }
}
impl CelsiusValue {
    /// The value rounded to the whole degrees the machine accepts.
    pub(crate) fn whole_degrees(&self) -> i32 {
        self.0.round() as i32
    }
}

/// A percentage, kept within `0..=100`.
pub(crate) struct PercentValue(f64);
impl PercentValue {
    pub(crate) fn new(value: f64) -> Self {
        Self(value.clamp(0.0, 100.0))
    }
}
impl PropertyValue for PercentValue {
    fn value(&self) -> String {
        // Two decimal places are plenty for a filter gauge.
        ((self.0 * 100.0).round() / 100.0).to_string()
    }
}
impl PropertyDescription for PercentValue {
    fn description() -> HomiePropertyDescription {
        PropertyDescriptionBuilder::new(HomieDataType::Float)
            .unit("%")
            .format(float_range(0.0..=100.0, None))
            .build()
    }
}

pub(crate) struct RemainingDays(jiff::Span);
impl RemainingDays {
    /// Overdue counts are reported as nothing remaining.
    pub(crate) fn new(days: i64) -> Self {
        let span = jiff::Span::new().try_days(days.max(0)).unwrap_or_else(|_| jiff::Span::new());
        Self(span)
    }
}
impl PropertyValue for RemainingDays {
    fn value(&self) -> String {
        self.0.to_string()
    }
}
impl PropertyDescription for RemainingDays {
    fn description() -> HomiePropertyDescription {
        PropertyDescriptionBuilder::new(HomieDataType::Duration).build()
    }
}

/// A string enumeration backed by a `strum`-derived enum.
pub(crate) struct EnumValue(pub(crate) &'static str);
impl PropertyValue for EnumValue {
    fn value(&self) -> String {
        self.0.to_string()
    }
}
