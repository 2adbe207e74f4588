//! Dynamically typed control values.
//!
//! MQTT controls publish every value as a UTF-8 string. The control's meta
//! type decides how that string is interpreted.

use serde::{Deserialize, Serialize};

use crate::bus::BusError;

/// Value interpretation derived from a control's meta type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Boolean,
    Number,
    Text,
}

impl ValueKind {
    /// Map a Wiren Board control type (`switch`, `value`, `text`, ...) to a value kind.
    ///
    /// Unknown types are numeric, which matches how the driver framework treats them.
    pub fn from_control_type(control_type: &str) -> Self {
        match control_type {
            "switch" | "alarm" | "pushbutton" => Self::Boolean,
            "text" | "rgb" => Self::Text,
            _ => Self::Number,
        }
    }
}

/// Scalar value carried by a control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlValue {
    Boolean(bool),
    Number(f64),
    Text(String),
}

impl ControlValue {
    /// Parse a raw MQTT payload according to `kind`.
    pub fn parse(raw: &str, kind: ValueKind) -> Result<Self, BusError> {
        match kind {
            ValueKind::Boolean => match raw.trim() {
                "1" | "true" => Ok(Self::Boolean(true)),
                "0" | "false" => Ok(Self::Boolean(false)),
                other => Err(BusError::InvalidValue(format!(
                    "'{}' is not a boolean",
                    other
                ))),
            },
            ValueKind::Number => raw
                .trim()
                .parse::<f64>()
                .map(Self::Number)
                .map_err(|_| BusError::InvalidValue(format!("'{}' is not a number", raw))),
            ValueKind::Text => Ok(Self::Text(raw.to_string())),
        }
    }

    /// Format the value the way it is published on the bus.
    pub fn to_raw(&self) -> String {
        match self {
            Self::Boolean(true) => "1".to_string(),
            Self::Boolean(false) => "0".to_string(),
            Self::Number(v) => v.to_string(),
            Self::Text(v) => v.clone(),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Boolean(_) => ValueKind::Boolean,
            Self::Number(_) => ValueKind::Number,
            Self::Text(_) => ValueKind::Text,
        }
    }

    /// True when `raw` parses to the same value under this value's kind.
    pub fn matches_raw(&self, raw: &str) -> bool {
        Self::parse(raw, self.kind())
            .map(|parsed| &parsed == self)
            .unwrap_or(false)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Number(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for ControlValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<f64> for ControlValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for ControlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ControlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}
