//! Unit Converter
//!
//! Every resource persists its values in one canonical unit. Values coming
//! from operators (and anything else crossing the engine boundary) are
//! converted here before they reach the hierarchy store.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Unit
// =============================================================================

/// Unit of a resource value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Unit {
    /// Countable things (instances, networks, ...)
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "B")]
    Bytes,
    #[serde(rename = "KiB")]
    Kibibytes,
    #[serde(rename = "MiB")]
    Mebibytes,
    #[serde(rename = "GiB")]
    Gibibytes,
    #[serde(rename = "TiB")]
    Tebibytes,
    #[serde(rename = "PiB")]
    Pebibytes,
    #[serde(rename = "EiB")]
    Exbibytes,
}

impl Unit {
    /// All known units
    pub const ALL: [Unit; 8] = [
        Unit::None,
        Unit::Bytes,
        Unit::Kibibytes,
        Unit::Mebibytes,
        Unit::Gibibytes,
        Unit::Tebibytes,
        Unit::Pebibytes,
        Unit::Exbibytes,
    ];

    /// Short string form ("" for countable units)
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::None => "",
            Unit::Bytes => "B",
            Unit::Kibibytes => "KiB",
            Unit::Mebibytes => "MiB",
            Unit::Gibibytes => "GiB",
            Unit::Tebibytes => "TiB",
            Unit::Pebibytes => "PiB",
            Unit::Exbibytes => "EiB",
        }
    }

    /// Base unit of this unit's family and the multiple of it
    pub fn base(&self) -> (Unit, u64) {
        match self {
            Unit::None => (Unit::None, 1),
            Unit::Bytes => (Unit::Bytes, 1),
            Unit::Kibibytes => (Unit::Bytes, 1 << 10),
            Unit::Mebibytes => (Unit::Bytes, 1 << 20),
            Unit::Gibibytes => (Unit::Bytes, 1 << 30),
            Unit::Tebibytes => (Unit::Bytes, 1 << 40),
            Unit::Pebibytes => (Unit::Bytes, 1 << 50),
            Unit::Exbibytes => (Unit::Bytes, 1 << 60),
        }
    }

    /// Render a value of this unit, e.g. `15` or `10 GiB`
    pub fn format(&self, value: u64) -> String {
        match self {
            Unit::None => value.to_string(),
            unit => format!("{} {}", value, unit.as_str()),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::None => write!(f, "countable"),
            unit => write!(f, "{}", unit.as_str()),
        }
    }
}

impl FromStr for Unit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Unit::ALL
            .iter()
            .copied()
            .find(|unit| unit.as_str() == s)
            .ok_or_else(|| Error::UnitParse(format!("unknown unit {:?}", s)))
    }
}

// =============================================================================
// Value With Unit
// =============================================================================

/// A value together with the unit it is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueWithUnit {
    pub value: u64,
    #[serde(default)]
    pub unit: Unit,
}

impl ValueWithUnit {
    pub fn new(value: u64, unit: Unit) -> Self {
        Self { value, unit }
    }

    /// Convert into `target`, rejecting other unit families and fractions
    pub fn convert_to(&self, target: Unit) -> Result<u64> {
        if self.unit == target {
            return Ok(self.value);
        }

        let (source_base, source_multiple) = self.unit.base();
        let (target_base, target_multiple) = target.base();
        if source_base != target_base {
            return Err(Error::IncompatibleUnits {
                from: self.unit.to_string(),
                to: target.to_string(),
            });
        }

        let base_value = u128::from(self.value) * u128::from(source_multiple);
        let target_multiple = u128::from(target_multiple);
        if base_value % target_multiple != 0 {
            return Err(Error::NonIntegralConversion {
                value: self.to_string(),
                unit: target.as_str().to_string(),
            });
        }

        u64::try_from(base_value / target_multiple).map_err(|_| Error::ConversionOverflow {
            value: self.to_string(),
            unit: target.as_str().to_string(),
        })
    }

    /// Parse `"10 GiB"`, `"10GiB"` or a bare number (which takes `default_unit`)
    pub fn parse(input: &str, default_unit: Unit) -> Result<Self> {
        let trimmed = input.trim();
        let split_at = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split_at);
        if digits.is_empty() {
            return Err(Error::UnitParse(format!("missing number in {:?}", input)));
        }

        let value = digits
            .parse::<u64>()
            .map_err(|e| Error::UnitParse(format!("invalid number in {:?}: {}", input, e)))?;
        let unit = match unit.trim() {
            "" => default_unit,
            name => name.parse()?,
        };

        Ok(Self { value, unit })
    }
}

impl fmt::Display for ValueWithUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.unit.format(self.value))
    }
}

// =============================================================================
// Operator Input
// =============================================================================

/// A value as submitted by an operator
///
/// Bare numbers are taken to be in the resource's canonical unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Number(u64),
    Text(String),
    Structured(ValueWithUnit),
}

impl InputValue {
    /// Convert into the canonical unit of the target resource
    pub fn to_canonical(&self, canonical: Unit) -> Result<u64> {
        match self {
            InputValue::Number(value) => Ok(*value),
            InputValue::Text(text) => ValueWithUnit::parse(text, canonical)?.convert_to(canonical),
            InputValue::Structured(value) => value.convert_to(canonical),
        }
    }
}

impl From<u64> for InputValue {
    fn from(value: u64) -> Self {
        InputValue::Number(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_convert_within_family() {
        let value = ValueWithUnit::new(2, Unit::Tebibytes);
        assert_eq!(value.convert_to(Unit::Gibibytes).unwrap(), 2048);

        let value = ValueWithUnit::new(3 << 30, Unit::Bytes);
        assert_eq!(value.convert_to(Unit::Gibibytes).unwrap(), 3);
    }

    #[test]
    fn test_incompatible_units_rejected() {
        let value = ValueWithUnit::new(10, Unit::Gibibytes);
        assert_matches!(
            value.convert_to(Unit::None),
            Err(Error::IncompatibleUnits { .. })
        );
    }

    #[test]
    fn test_fractional_result_rejected() {
        let value = ValueWithUnit::new(1536, Unit::Mebibytes);
        let err = value.convert_to(Unit::Gibibytes).unwrap_err();
        assert_eq!(
            err.to_string(),
            "value of 1536 MiB cannot be represented as integer number of GiB"
        );
    }

    #[test]
    fn test_overflow_rejected() {
        let value = ValueWithUnit::new(u64::MAX, Unit::Exbibytes);
        assert_matches!(
            value.convert_to(Unit::Bytes),
            Err(Error::ConversionOverflow { .. })
        );
    }

    #[test]
    fn test_round_trip_is_lossless() {
        for unit in [Unit::Kibibytes, Unit::Mebibytes, Unit::Gibibytes, Unit::Tebibytes] {
            for value in [0u64, 1, 7, 1024, 123_456] {
                let original = ValueWithUnit::new(value, unit);
                let bytes = original.convert_to(Unit::Bytes).unwrap();
                let back = ValueWithUnit::new(bytes, Unit::Bytes).convert_to(unit).unwrap();
                assert_eq!(back, value, "round trip of {} failed", original);
            }
        }
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(
            ValueWithUnit::parse("10 GiB", Unit::None).unwrap(),
            ValueWithUnit::new(10, Unit::Gibibytes)
        );
        assert_eq!(
            ValueWithUnit::parse("512MiB", Unit::None).unwrap(),
            ValueWithUnit::new(512, Unit::Mebibytes)
        );
        assert_eq!(
            ValueWithUnit::parse("42", Unit::Gibibytes).unwrap(),
            ValueWithUnit::new(42, Unit::Gibibytes)
        );
        assert_matches!(ValueWithUnit::parse("GiB", Unit::None), Err(Error::UnitParse(_)));
        assert_matches!(ValueWithUnit::parse("5 parsecs", Unit::None), Err(Error::UnitParse(_)));
    }

    #[test]
    fn test_input_value_deserialization() {
        let values: Vec<InputValue> =
            serde_json::from_str(r#"[16, "2 TiB", {"value": 3, "unit": "GiB"}]"#).unwrap();
        assert_eq!(values[0].to_canonical(Unit::Gibibytes).unwrap(), 16);
        assert_eq!(values[1].to_canonical(Unit::Gibibytes).unwrap(), 2048);
        assert_eq!(values[2].to_canonical(Unit::Gibibytes).unwrap(), 3);
    }

    #[test]
    fn test_unit_format() {
        assert_eq!(Unit::None.format(15), "15");
        assert_eq!(Unit::Gibibytes.format(15), "15 GiB");
        assert_eq!("MiB".parse::<Unit>().unwrap(), Unit::Mebibytes);
    }
}
