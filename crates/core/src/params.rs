//! Parameter ranges, concrete parameter values, and variants.

use crate::error::EngineError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Tolerance applied to the `(stop - start) / step` quotient so that
/// floating-point drift does not drop the last value of a range.
pub const RANGE_EPSILON: f64 = 1e-9;

/// Decimal places kept for float-valued range elements.
const FLOAT_DECIMALS: i32 = 12;

/// A concrete parameter value.
///
/// Integer-valued ranges produce `Int` so strategies that expect whole
/// numbers (periods, lookbacks) never see `10.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

impl ParamValue {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Inclusive arithmetic range `start, start+step, ..., <= stop`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl ParameterRange {
    #[must_use]
    pub const fn new(start: f64, stop: f64, step: f64) -> Self {
        Self { start, stop, step }
    }

    /// Checks `step > 0` and `stop >= start`.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidRange` naming the offending parameter.
    pub fn validate(&self, name: &str) -> Result<(), EngineError> {
        let invalid = |reason: &str| EngineError::InvalidRange {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if !(self.start.is_finite() && self.stop.is_finite() && self.step.is_finite()) {
            return Err(invalid("start, stop and step must be finite"));
        }
        if self.step <= 0.0 {
            return Err(invalid("step must be > 0"));
        }
        if self.stop < self.start {
            return Err(invalid("stop must be >= start"));
        }
        Ok(())
    }

    /// True when start, stop and step are all whole numbers.
    #[must_use]
    pub fn is_integral(&self) -> bool {
        self.start.fract() == 0.0 && self.stop.fract() == 0.0 && self.step.fract() == 0.0
    }

    /// Number of elements, `floor((stop - start) / step) + 1`.
    ///
    /// Only meaningful for a range that passed [`validate`](Self::validate).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn count(&self) -> usize {
        ((self.stop - self.start) / self.step + RANGE_EPSILON).floor() as usize + 1
    }

    /// Ascending values of the range.
    ///
    /// Each element is computed as `start + i * step` rather than by repeated
    /// addition, so error does not accumulate along the range.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn values(&self) -> Vec<ParamValue> {
        let count = self.count();
        if self.is_integral() {
            let start = self.start as i64;
            let step = self.step as i64;
            return (0..count)
                .map(|i| ParamValue::Int(start + step * i as i64))
                .collect();
        }

        let scale = 10f64.powi(FLOAT_DECIMALS);
        let mut values: Vec<ParamValue> = (0..count)
            .map(|i| {
                let raw = (i as f64).mul_add(self.step, self.start);
                ParamValue::Float((raw * scale).round() / scale)
            })
            .collect();
        values.dedup();
        values
    }
}

/// One concrete parameter assignment drawn from a grid.
///
/// Entries keep the declaration order of the grid's parameters. Serialized
/// as a JSON object in that order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Variant {
    entries: Vec<(String, ParamValue)>,
}

impl Variant {
    #[must_use]
    pub const fn new(entries: Vec<(String, ParamValue)>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

impl Serialize for Variant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ordered::serialize(&self.entries, serializer)
    }
}

impl<'de> Deserialize<'de> for Variant {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        ordered::deserialize(deserializer).map(Self::new)
    }
}

/// Serde helpers for `Vec<(String, V)>` fields represented as JSON objects.
///
/// A plain map type would lose declaration order, which drives variant
/// generation order. Duplicate keys are rejected.
pub mod ordered {
    use serde::de::{Error as _, MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::fmt;
    use std::marker::PhantomData;

    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S, V>(pairs: &[(String, V)], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        let mut map = serializer.serialize_map(Some(pairs.len()))?;
        for (key, value) in pairs {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }

    /// # Errors
    /// Fails on non-map input or duplicate keys.
    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<Vec<(String, V)>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        struct PairsVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for PairsVisitor<V> {
            type Value = Vec<(String, V)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of parameter names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut pairs: Vec<(String, V)> =
                    Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    if pairs.iter().any(|(existing, _)| *existing == key) {
                        return Err(A::Error::custom(format!("duplicate parameter `{key}`")));
                    }
                    pairs.push((key, value));
                }
                Ok(pairs)
            }
        }

        deserializer.deserialize_map(PairsVisitor(PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================
    // ParameterRange
    // ============================================

    #[test]
    fn integral_range_includes_stop() {
        let range = ParameterRange::new(5.0, 20.0, 5.0);
        assert_eq!(
            range.values(),
            vec![
                ParamValue::Int(5),
                ParamValue::Int(10),
                ParamValue::Int(15),
                ParamValue::Int(20)
            ]
        );
        assert_eq!(range.count(), 4);
    }

    #[test]
    fn integral_range_stops_below_unreachable_stop() {
        let range = ParameterRange::new(1.0, 10.0, 4.0);
        assert_eq!(
            range.values(),
            vec![ParamValue::Int(1), ParamValue::Int(5), ParamValue::Int(9)]
        );
    }

    #[test]
    fn float_range_absorbs_drift_at_boundary() {
        let range = ParameterRange::new(0.0, 0.3, 0.1);
        let values = range.values();
        assert_eq!(values.len(), 4);
        assert_eq!(values[3], ParamValue::Float(0.3));
        assert_eq!(values[1], ParamValue::Float(0.1));
    }

    #[test]
    fn single_point_range() {
        let range = ParameterRange::new(7.0, 7.0, 1.0);
        assert_eq!(range.values(), vec![ParamValue::Int(7)]);
    }

    #[test]
    fn count_matches_floor_formula() {
        for (start, stop, step) in [(0.0, 10.0, 3.0), (1.5, 4.0, 0.5), (2.0, 2.9, 0.25)] {
            let range = ParameterRange::new(start, stop, step);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let expected = ((stop - start) / step).floor() as usize + 1;
            assert_eq!(range.values().len(), expected);
        }
    }

    #[test]
    fn values_strictly_ascending_from_start() {
        let range = ParameterRange::new(0.5, 3.0, 0.25);
        let values: Vec<f64> = range.values().into_iter().map(ParamValue::as_f64).collect();
        assert!((values[0] - 0.5).abs() < f64::EPSILON);
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn validate_rejects_non_positive_step() {
        let err = ParameterRange::new(1.0, 5.0, 0.0).validate("fast").unwrap_err();
        assert!(matches!(err, EngineError::InvalidRange { ref name, .. } if name == "fast"));
        assert!(ParameterRange::new(1.0, 5.0, -1.0).validate("fast").is_err());
    }

    #[test]
    fn validate_rejects_inverted_range() {
        assert!(ParameterRange::new(5.0, 1.0, 1.0).validate("slow").is_err());
    }

    #[test]
    fn validate_rejects_nan() {
        assert!(ParameterRange::new(f64::NAN, 1.0, 1.0).validate("x").is_err());
    }

    // ============================================
    // Variant serialization
    // ============================================

    #[test]
    fn variant_serializes_in_declaration_order() {
        let variant = Variant::new(vec![
            ("slow".to_string(), ParamValue::Int(20)),
            ("fast".to_string(), ParamValue::Int(5)),
            ("k".to_string(), ParamValue::Float(1.5)),
        ]);
        let json = serde_json::to_string(&variant).unwrap();
        assert_eq!(json, r#"{"slow":20,"fast":5,"k":1.5}"#);
    }

    #[test]
    fn variant_deserializes_preserving_order() {
        let variant: Variant = serde_json::from_str(r#"{"z":1,"a":2.5}"#).unwrap();
        let names: Vec<&str> = variant.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["z", "a"]);
        assert_eq!(variant.get("a"), Some(ParamValue::Float(2.5)));
        assert_eq!(variant.get("z"), Some(ParamValue::Int(1)));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let result: Result<Variant, _> = serde_json::from_str(r#"{"a":1,"a":2}"#);
        assert!(result.is_err());
    }

    #[test]
    fn variant_display_lists_bindings() {
        let variant = Variant::new(vec![
            ("fast".to_string(), ParamValue::Int(1)),
            ("slow".to_string(), ParamValue::Int(3)),
        ]);
        assert_eq!(variant.to_string(), "fast=1, slow=3");
    }
}
