use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};

// ---------------------------------------------------------------------------
// FieldValue – a single cell of a table or index record
// ---------------------------------------------------------------------------

/// A dynamically-typed value read from a FITS table or an index record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<FieldValue>),
    Null,
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::String(s) => write!(f, "{s}"),
            FieldValue::Integer(i) => write!(f, "{i}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            FieldValue::Null => write!(f, "<null>"),
        }
    }
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Integer view; floats with no fractional part count too.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            FieldValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::String(s) => JsonValue::String(s.clone()),
            FieldValue::Integer(i) => JsonValue::from(*i),
            FieldValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            FieldValue::Bool(b) => JsonValue::Bool(*b),
            FieldValue::Array(items) => JsonValue::Array(items.iter().map(Self::to_json).collect()),
            FieldValue::Null => JsonValue::Null,
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// Arm – one spectrograph camera
// ---------------------------------------------------------------------------

/// Spectrograph arm (camera).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Arm {
    B,
    R,
    Z,
}

impl Arm {
    pub const ALL: [Arm; 3] = [Arm::B, Arm::R, Arm::Z];

    /// Prefix of this arm's HDU names, e.g. `B` in `B_FLUX`.
    pub fn hdu_prefix(self) -> &'static str {
        match self {
            Arm::B => "B",
            Arm::R => "R",
            Arm::Z => "Z",
        }
    }

    /// Prefix of this arm's record keys, e.g. `b` in `b_flux`.
    pub fn key(self) -> &'static str {
        match self {
            Arm::B => "b",
            Arm::R => "r",
            Arm::Z => "z",
        }
    }

    pub fn hdu_name(self, product: &str) -> String {
        format!("{}_{product}", self.hdu_prefix())
    }
}

impl fmt::Display for Arm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Arrays of one arm for one object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArmSpectrum {
    pub wavelength: Vec<f64>,
    pub flux: Vec<f64>,
    pub mask: Option<Vec<i64>>,
    pub ivar: Option<Vec<f64>>,
}

/// One observation of an object: per-arm arrays plus, on request, its
/// fibermap row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpectrumRecord {
    pub fibermap: Option<BTreeMap<String, FieldValue>>,
    pub arms: BTreeMap<Arm, ArmSpectrum>,
}

/// Best-fit model of one arm.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArmModel {
    pub wavelength: Vec<f64>,
    pub model: Vec<f64>,
}

/// RVSpecfit model of one observation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelRecord {
    pub arms: BTreeMap<Arm, ArmModel>,
}

fn float_array(values: &[f64]) -> JsonValue {
    JsonValue::Array(
        values
            .iter()
            .map(|v| {
                serde_json::Number::from_f64(*v)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            })
            .collect(),
    )
}

impl SpectrumRecord {
    pub fn arm(&self, arm: Arm) -> Option<&ArmSpectrum> {
        self.arms.get(&arm)
    }

    /// Flat map keyed `b_wavelength`, `b_flux`, `b_mask`, `b_ivar`, ...,
    /// and `fibermap`.
    pub fn to_map(&self) -> Map<String, JsonValue> {
        let mut map = Map::new();
        if let Some(fibermap) = &self.fibermap {
            let row: Map<String, JsonValue> = fibermap
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            map.insert("fibermap".into(), JsonValue::Object(row));
        }
        for (arm, data) in &self.arms {
            let key = arm.key();
            map.insert(format!("{key}_wavelength"), float_array(&data.wavelength));
            map.insert(format!("{key}_flux"), float_array(&data.flux));
            if let Some(mask) = &data.mask {
                map.insert(
                    format!("{key}_mask"),
                    JsonValue::Array(mask.iter().map(|&m| JsonValue::from(m)).collect()),
                );
            }
            if let Some(ivar) = &data.ivar {
                map.insert(format!("{key}_ivar"), float_array(ivar));
            }
        }
        map
    }
}

impl ModelRecord {
    pub fn arm(&self, arm: Arm) -> Option<&ArmModel> {
        self.arms.get(&arm)
    }

    /// Flat map keyed `b_wavelength`, `b_model`, ...
    pub fn to_map(&self) -> Map<String, JsonValue> {
        let mut map = Map::new();
        for (arm, data) in &self.arms {
            let key = arm.key();
            map.insert(format!("{key}_wavelength"), float_array(&data.wavelength));
            map.insert(format!("{key}_model"), float_array(&data.model));
        }
        map
    }
}

impl Serialize for SpectrumRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

impl Serialize for ModelRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keys_follow_arm_names() {
        let mut record = SpectrumRecord::default();
        record.arms.insert(
            Arm::R,
            ArmSpectrum {
                wavelength: vec![5800.0],
                flux: vec![1.25],
                mask: Some(vec![0]),
                ivar: None,
            },
        );
        let map = record.to_map();
        assert!(map.contains_key("r_wavelength"));
        assert!(map.contains_key("r_flux"));
        assert!(map.contains_key("r_mask"));
        assert!(!map.contains_key("r_ivar"));
        assert!(!map.contains_key("fibermap"));
    }

    #[test]
    fn non_finite_floats_serialize_as_null() {
        let json = serde_json::to_string(&FieldValue::Float(f64::NAN)).unwrap();
        assert_eq!(json, "null");
        let json = serde_json::to_string(&FieldValue::Array(vec![
            FieldValue::Integer(3),
            FieldValue::String("sv1".into()),
        ]))
        .unwrap();
        assert_eq!(json, r#"[3,"sv1"]"#);
    }

    #[test]
    fn integral_floats_read_as_integers() {
        assert_eq!(FieldValue::Float(17683.0).as_i64(), Some(17683));
        assert_eq!(FieldValue::Float(0.5).as_i64(), None);
        assert_eq!(FieldValue::Integer(2).as_f64(), Some(2.0));
    }
}
