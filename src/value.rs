//! Local attribute values.
//!
//! [`AttrValue`] mirrors the wire [`Value`] but its quantity variant holds a
//! [`Quantity`] bound to a concrete [`UnitRegistry`]. Conversion from the wire
//! is the one place where remote quantities are re-homed; it fails with
//! [`UnitError::UndefinedUnit`] when the local registry cannot resolve a unit.

use std::fmt;

use crate::protocol::Value;
use crate::units::{Quantity, UnitError, UnitRegistry};

/// Attribute value usable for arithmetic in the local process.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Quantity(Quantity),
    List(Vec<AttrValue>),
}

impl AttrValue {
    /// Strip registry bindings for transmission.
    pub fn to_wire(&self) -> Value {
        match self {
            AttrValue::Null => Value::Null,
            AttrValue::Bool(b) => Value::Bool(*b),
            AttrValue::Int(i) => Value::Int(*i),
            AttrValue::Float(x) => Value::Float(*x),
            AttrValue::Text(s) => Value::Text(s.clone()),
            AttrValue::Quantity(q) => Value::Quantity {
                magnitude: q.magnitude(),
                unit: q.unit().name().to_string(),
            },
            AttrValue::List(items) => Value::List(items.iter().map(AttrValue::to_wire).collect()),
        }
    }

    /// Rebuild a wire value in `units`, including quantities nested in lists.
    pub fn from_wire(value: Value, units: &UnitRegistry) -> Result<AttrValue, UnitError> {
        Ok(match value {
            Value::Null => AttrValue::Null,
            Value::Bool(b) => AttrValue::Bool(b),
            Value::Int(i) => AttrValue::Int(i),
            Value::Float(x) => AttrValue::Float(x),
            Value::Text(s) => AttrValue::Text(s),
            Value::Quantity { magnitude, unit } => {
                let quantity = units
                    .quantity(magnitude, &unit)
                    .map_err(|_| UnitError::UndefinedUnit(unit))?;
                AttrValue::Quantity(quantity)
            }
            Value::List(items) => AttrValue::List(
                items
                    .into_iter()
                    .map(|item| AttrValue::from_wire(item, units))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    /// Parse an operator-typed literal.
    ///
    /// Accepts `null`, `true`/`false`, integers, floats, quantities (`1.5 V`),
    /// double-quoted text, flat lists (`[1 V, 2 V]`) and falls back to bare
    /// text for anything else.
    pub fn parse_literal(text: &str, units: &UnitRegistry) -> Result<AttrValue, UnitError> {
        let text = text.trim();

        if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            if inner.trim().is_empty() {
                return Ok(AttrValue::List(Vec::new()));
            }
            return inner
                .split(',')
                .map(|item| AttrValue::parse_literal(item, units))
                .collect::<Result<Vec<_>, _>>()
                .map(AttrValue::List);
        }
        if let Some(inner) = text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
            return Ok(AttrValue::Text(inner.to_string()));
        }

        match text.to_ascii_lowercase().as_str() {
            "null" | "none" => return Ok(AttrValue::Null),
            "true" | "on" => return Ok(AttrValue::Bool(true)),
            "false" | "off" => return Ok(AttrValue::Bool(false)),
            _ => {}
        }
        if let Ok(i) = text.parse::<i64>() {
            return Ok(AttrValue::Int(i));
        }
        if let Ok(x) = text.parse::<f64>() {
            return Ok(AttrValue::Float(x));
        }

        let starts_numeric = text
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit() || c == '-' || c == '+' || c == '.');
        if starts_numeric {
            return units.parse_quantity(text).map(AttrValue::Quantity);
        }
        Ok(AttrValue::Text(text.to_string()))
    }

    /// Type name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            AttrValue::Null => "null",
            AttrValue::Bool(_) => "bool",
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::Text(_) => "text",
            AttrValue::Quantity(_) => "quantity",
            AttrValue::List(_) => "list",
        }
    }

    pub fn as_quantity(&self) -> Option<&Quantity> {
        match self {
            AttrValue::Quantity(q) => Some(q),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view of `Int` and `Float` values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(i) => Some(*i as f64),
            AttrValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Quantity> for AttrValue {
    fn from(q: Quantity) -> Self {
        AttrValue::Quantity(q)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

impl From<f64> for AttrValue {
    fn from(x: f64) -> Self {
        AttrValue::Float(x)
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Text(s)
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Quantity(q) => write!(f, "{q}"),
            other => write!(f, "{}", other.to_wire()),
        }
    }
}
