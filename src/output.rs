//! Data types exchanged with the render collaborator.
//!
//! The core never formats text itself: commands produce an [`Output`]
//! value and the embedding program renders it according to the active
//! `output_format` variable. [`ValueType`] and [`read_value`] implement
//! the value coercion used by property mappings and session variables.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum_macros::EnumString,
    strum_macros::Display,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    HexNumber,
    Boolean,
    Size,
    Time,
    Set,
    Array,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("invalid value '{value}' for type {expected}")]
    Invalid { value: String, expected: ValueType },
    #[error("value not on the list of possible choices: {0}")]
    NotAChoice(String),
}

/// A labeled single-entity listing, one row per property.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub descr: String,
    pub name: String,
    pub value: Value,
    pub vt: ValueType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub label: String,
    pub accessor: String,
    pub vt: ValueType,
}

/// A typed-column table; rows are flat documents keyed by accessor.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub columns: Vec<Column>,
    pub rows: Vec<Value>,
}

/// Everything a command may hand to the renderer.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Object(Vec<Item>),
    Table(Table),
    Sequence(Vec<Output>),
    Message(String),
    Scalar(Value),
    None,
}

impl Output {
    /// Scalar string view, used by command expansion substitution.
    pub fn as_scalar_string(&self) -> Option<String> {
        match self {
            Output::Scalar(Value::String(s)) => Some(s.clone()),
            Output::Scalar(v) => Some(v.to_string()),
            Output::Message(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// Render collaborator. Implementations live outside the core.
pub trait Renderer: Send + Sync {
    fn render(&self, output: &Output);
    fn message(&self, text: &str);
}

/// Receives live updates during a blocking task wait.
pub trait ProgressReporter: Send {
    fn update(&mut self, percentage: Option<f64>, message: Option<&str>);
    fn finish(&mut self);
}

/// No-op reporter for scripted (non-interactive) runs.
#[derive(Default)]
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn update(&mut self, _percentage: Option<f64>, _message: Option<&str>) {}
    fn finish(&mut self) {}
}

const SIZE_SUFFIXES: &[(char, i64)] = &[
    ('k', 1 << 10),
    ('m', 1 << 20),
    ('g', 1 << 30),
    ('t', 1 << 40),
];

const TIME_SUFFIXES: &[(char, i64)] = &[('s', 1), ('m', 60), ('h', 3600), ('d', 86400)];

fn invalid(raw: &Value, vt: ValueType) -> ValueError {
    ValueError::Invalid {
        value: raw.to_string(),
        expected: vt,
    }
}

fn parse_suffixed(s: &str, suffixes: &[(char, i64)]) -> Option<i64> {
    let s = s.trim();
    let last = s.chars().last()?;
    if let Some((_, mult)) = suffixes
        .iter()
        .find(|(c, _)| *c == last.to_ascii_lowercase())
    {
        let base: i64 = s[..s.len() - last.len_utf8()].trim().parse().ok()?;
        return Some(base * mult);
    }
    s.parse().ok()
}

fn parse_integer(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = s.strip_prefix("0o") {
        i64::from_str_radix(oct, 8).ok()
    } else if let Some(bin) = s.strip_prefix("0b") {
        i64::from_str_radix(bin, 2).ok()
    } else {
        s.parse().ok()
    }
}

/// Coerces a raw value (usually a string typed at the prompt) into the
/// declared value type. Set and array values accept either a JSON array
/// or a comma-separated string.
pub fn read_value(raw: &Value, vt: ValueType) -> Result<Value, ValueError> {
    match vt {
        ValueType::String => Ok(match raw {
            Value::String(s) => Value::String(s.clone()),
            Value::Null => Value::Null,
            other => Value::String(value_to_string(other)),
        }),
        ValueType::Number | ValueType::HexNumber => match raw {
            Value::Number(_) => Ok(raw.clone()),
            Value::String(s) => parse_integer(s)
                .map(Value::from)
                .ok_or_else(|| invalid(raw, vt)),
            _ => Err(invalid(raw, vt)),
        },
        ValueType::Boolean => match raw {
            Value::Bool(_) => Ok(raw.clone()),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "off" | "0" => Ok(Value::Bool(false)),
                _ => Err(invalid(raw, vt)),
            },
            _ => Err(invalid(raw, vt)),
        },
        ValueType::Size => match raw {
            Value::Number(_) => Ok(raw.clone()),
            Value::String(s) => parse_suffixed(s, SIZE_SUFFIXES)
                .map(Value::from)
                .ok_or_else(|| invalid(raw, vt)),
            _ => Err(invalid(raw, vt)),
        },
        ValueType::Time => match raw {
            Value::Number(_) => Ok(raw.clone()),
            Value::String(s) => parse_suffixed(s, TIME_SUFFIXES)
                .map(Value::from)
                .ok_or_else(|| invalid(raw, vt)),
            _ => Err(invalid(raw, vt)),
        },
        ValueType::Set | ValueType::Array => match raw {
            Value::Array(_) => Ok(raw.clone()),
            Value::String(s) => Ok(Value::Array(
                s.split(',')
                    .map(|p| Value::String(p.trim().to_string()))
                    .collect(),
            )),
            other => Ok(Value::Array(vec![other.clone()])),
        },
    }
}

/// Plain string form of a JSON value, without quoting strings.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
