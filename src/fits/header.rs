use std::fmt;

use fitsrs::card::Value;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// HeaderValue
// ---------------------------------------------------------------------------

/// Value of a header keyword.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Logical(bool),
    Int(i64),
    Float(f64),
}

impl HeaderValue {
    /// Typed copy of a card value parsed by `fitsrs`. Undefined values
    /// give `None`.
    pub fn from_card(value: &Value) -> Option<Self> {
        match value {
            Value::Integer { value, .. } => Some(HeaderValue::Int(i64::from(*value))),
            Value::Float { value, .. } => Some(HeaderValue::Float(f64::from(*value))),
            Value::Logical { value, .. } => Some(HeaderValue::Logical(*value)),
            Value::String { value, .. } => Some(HeaderValue::Str(value.trim_end().to_string())),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            HeaderValue::Int(i) => Some(*i as f64),
            HeaderValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Str(s) => write!(f, "'{s}'"),
            HeaderValue::Logical(b) => f.write_str(if *b { "T" } else { "F" }),
            HeaderValue::Int(i) => write!(f, "{i}"),
            HeaderValue::Float(v) => write!(f, "{v}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Keywords this crate reads from every HDU. Indexed table keywords are
/// added per column.
const KEYWORDS: [&str; 11] = [
    "SIMPLE", "XTENSION", "EXTNAME", "BITPIX", "NAXIS", "BSCALE", "BZERO", "PCOUNT", "GCOUNT",
    "TFIELDS", "THEAP",
];
const COLUMN_KEYWORDS: [&str; 5] = ["TFORM", "TTYPE", "TUNIT", "TSCAL", "TZERO"];

/// The keywords of one HDU needed to locate and decode its data, copied
/// out of a `fitsrs` header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    cards: Vec<(String, HeaderValue)>,
}

impl Header {
    /// Copy the known keywords out of a parsed header. `lookup` returns
    /// the card value of an exact keyword.
    pub fn collect<'h>(lookup: impl Fn(&str) -> Option<&'h Value>) -> Self {
        let mut header = Header::default();
        let mut keep = |keyword: String| {
            if let Some(value) = lookup(keyword.as_str()).and_then(HeaderValue::from_card) {
                header.cards.push((keyword, value));
            }
        };
        for keyword in KEYWORDS {
            keep(keyword.to_string());
        }
        let naxis = lookup("NAXIS").and_then(HeaderValue::from_card).and_then(|v| v.as_int());
        for i in 1..=naxis.unwrap_or(0) {
            keep(format!("NAXIS{i}"));
        }
        let tfields = lookup("TFIELDS").and_then(HeaderValue::from_card).and_then(|v| v.as_int());
        for i in 1..=tfields.unwrap_or(0) {
            for prefix in COLUMN_KEYWORDS {
                keep(format!("{prefix}{i}"));
            }
        }
        header
    }

    pub fn get(&self, keyword: &str) -> Option<&HeaderValue> {
        self.cards
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(keyword))
            .map(|(_, v)| v)
    }

    pub fn get_int(&self, keyword: &str) -> Option<i64> {
        self.get(keyword).and_then(HeaderValue::as_int)
    }

    pub fn get_float(&self, keyword: &str) -> Option<f64> {
        self.get(keyword).and_then(HeaderValue::as_float)
    }

    pub fn get_str(&self, keyword: &str) -> Option<&str> {
        self.get(keyword).and_then(HeaderValue::as_str)
    }

    /// Integer keyword that must be present.
    pub fn require_int(&self, keyword: &str) -> Result<i64> {
        self.get_int(keyword)
            .ok_or_else(|| Error::Fits(format!("missing integer keyword {keyword}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_ignore_keyword_case() {
        let header = Header {
            cards: vec![
                ("XTENSION".into(), HeaderValue::Str("BINTABLE".into())),
                ("NAXIS2".into(), HeaderValue::Float(3.0)),
                ("TZERO1".into(), HeaderValue::Float(0.5)),
            ],
        };
        assert_eq!(header.get_str("xtension"), Some("BINTABLE"));
        assert_eq!(header.get_int("naxis2"), Some(3));
        assert_eq!(header.get_int("TZERO1"), None);
        assert_eq!(header.get_float("TZERO1"), Some(0.5));
        assert!(header.require_int("TFIELDS").is_err());
    }
}
