use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

/// The severity scale used by the scanner, ordered from least to most severe.
///
/// Parsing through [`std::str::FromStr`] is case-insensitive, since thresholds are usually typed by people.
/// [`Severity::is_valid`] and [`Severity::at_or_above`] operate on the exact upper-case names
/// the scanner emits and accepts.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Default,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// The scanner could not determine a severity.
    Unknown,
    /// Low severity.
    Low,
    /// Medium severity. The default threshold.
    #[default]
    Medium,
    /// High severity.
    High,
    /// Critical severity.
    Critical,
}

impl Severity {
    /// Reports whether `value` is exactly one of the severity names.
    pub fn is_valid(value: &str) -> bool {
        Self::exact(value).is_some()
    }

    /// The ordered list of severities from `value` to the top of the scale.
    ///
    /// An unrecognized `value` yields an empty list rather than an error;
    /// whether the value is acceptable is [`Severity::is_valid`]'s concern.
    pub fn at_or_above(value: &str) -> Vec<Severity> {
        Self::exact(value).map(Self::and_above).unwrap_or_default()
    }

    /// The ordered list of severities from `self` to the top of the scale.
    pub fn and_above(self) -> Vec<Severity> {
        Self::iter().filter(|s| *s >= self).collect()
    }

    fn exact(value: &str) -> Option<Severity> {
        Self::iter().find(|s| s.as_ref() == value)
    }
}
