//! Readings and the transform pipeline.
//!
//! Handlers produce [`Reading`]s; the scheduler stamps them with the owning
//! device id, runs them through the device's transform pipeline, and only
//! then caches and broadcasts them.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SdkError, SdkResult};

/// Typed value carried by a reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{}", v),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Null => write!(f, "null"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Unit of measure for a reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Full name, e.g. `celsius`.
    pub name: String,
    /// Symbol, e.g. `C`.
    pub symbol: String,
}

impl Unit {
    pub fn new(name: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbol: symbol.into(),
        }
    }
}

/// A timestamped, typed value belonging to one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    /// Owning device; stamped by the scheduler before publication.
    pub device: Uuid,
    /// Output name, e.g. `temperature`.
    pub output: String,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
    /// Decimal places a numeric value is rounded to after transforms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Extra context attached by the handler.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
}

impl Reading {
    /// Create a reading stamped with the current time. The device id is
    /// filled in by the scheduler.
    pub fn new(output: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            device: Uuid::nil(),
            output: output.into(),
            value: value.into(),
            unit: None,
            precision: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            context: HashMap::new(),
        }
    }

    /// Set the unit.
    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Set the rounding precision.
    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Attach a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// A batch of readings associated with one device.
///
/// Unit reads are wrapped into a context by the scheduler; bulk reads and
/// listeners build their own since only the handler knows the association.
#[derive(Debug, Clone)]
pub struct ReadContext {
    pub device: Uuid,
    pub readings: Vec<Reading>,
}

impl ReadContext {
    pub fn new(device: Uuid, readings: Vec<Reading>) -> Self {
        Self { device, readings }
    }
}

/// One stage of a device's reading-transform pipeline.
#[derive(Clone)]
pub enum Transform {
    /// Multiply a numeric value.
    Scale(f64),
    /// Add to a numeric value.
    Offset(f64),
    /// Arbitrary user conversion.
    Apply(Arc<dyn Fn(&Value) -> SdkResult<Value> + Send + Sync>),
}

impl Transform {
    /// Apply this stage to a value.
    pub fn apply(&self, value: &Value) -> SdkResult<Value> {
        match self {
            Self::Scale(factor) => {
                let v = numeric(value, "scale")?;
                Ok(Value::Float(v * factor))
            }
            Self::Offset(offset) => {
                let v = numeric(value, "offset")?;
                Ok(Value::Float(v + offset))
            }
            Self::Apply(f) => f(value),
        }
    }
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scale(factor) => write!(f, "Scale({})", factor),
            Self::Offset(offset) => write!(f, "Offset({})", offset),
            Self::Apply(_) => write!(f, "Apply(..)"),
        }
    }
}

fn numeric(value: &Value, what: &str) -> SdkResult<f64> {
    value.as_f64().ok_or_else(|| {
        SdkError::InvalidArgument(format!("cannot {} non-numeric value {:?}", what, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_as_f64() {
        assert_eq!(Value::Integer(3).as_f64(), Some(3.0));
        assert_eq!(Value::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::Boolean(true).as_f64(), None);
        assert_eq!(Value::Null.as_f64(), None);
    }

    #[test]
    fn test_reading_builder() {
        let reading = Reading::new("temperature", 21.5)
            .with_unit(Unit::new("celsius", "C"))
            .with_context("source", "probe-1");
        assert_eq!(reading.output, "temperature");
        assert_eq!(reading.value, Value::Float(21.5));
        assert_eq!(reading.unit.as_ref().map(|u| u.symbol.as_str()), Some("C"));
        assert_eq!(reading.context.get("source").map(String::as_str), Some("probe-1"));
        assert!(reading.timestamp > 0);
    }

    #[test]
    fn test_scale_transform() {
        let scaled = Transform::Scale(2.0).apply(&Value::Integer(4)).unwrap();
        assert_eq!(scaled, Value::Float(8.0));
    }

    #[test]
    fn test_offset_transform() {
        let shifted = Transform::Offset(-40.0).apply(&Value::Float(100.0)).unwrap();
        assert_eq!(shifted, Value::Float(60.0));
    }

    #[test]
    fn test_scale_rejects_non_numeric() {
        let err = Transform::Scale(2.0).apply(&Value::String("on".into()));
        assert!(matches!(err, Err(SdkError::InvalidArgument(_))));
    }

    #[test]
    fn test_apply_transform() {
        let to_fahrenheit = Transform::Apply(Arc::new(|v: &Value| {
            let c = v.as_f64().ok_or_else(|| {
                SdkError::InvalidArgument("not numeric".into())
            })?;
            Ok(Value::Float(c * 9.0 / 5.0 + 32.0))
        }));
        assert_eq!(
            to_fahrenheit.apply(&Value::Float(100.0)).unwrap(),
            Value::Float(212.0)
        );
    }
}
