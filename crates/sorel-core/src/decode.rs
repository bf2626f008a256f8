//! Register decoding
//!
//! Turns the raw 16-bit registers of one datapoint into a typed [`Value`].
//! Every [`ValueType`] has its own decode function, selected by a single match.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::datapoint::{DatapointDescriptor, ValueType, WordOrder};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{value_type:?} needs {expected} registers, got {actual}")]
    RegisterCount {
        value_type: ValueType,
        expected: usize,
        actual: usize,
    },
}

/// A decoded datapoint value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

/// Floats compare bit for bit so that change detection is deterministic
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{}", n),
            Self::Float(x) => write!(f, "{}", x),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Decode the registers of one datapoint, given in address order
pub fn decode(descriptor: &DatapointDescriptor, words: &[u16]) -> Result<Value, DecodeError> {
    let expected = usize::from(descriptor.register_span);
    if words.len() != expected {
        return Err(DecodeError::RegisterCount {
            value_type: descriptor.value_type,
            expected,
            actual: words.len(),
        });
    }

    let value = match descriptor.value_type {
        ValueType::Uint8 => decode_uint8(descriptor, words[0]),
        ValueType::Uint16 => decode_uint16(descriptor, words[0]),
        ValueType::Int16 => decode_int16(descriptor, words[0]),
        ValueType::Uint32 => decode_uint32(descriptor, words),
        ValueType::Int32 => decode_int32(descriptor, words),
        ValueType::Float32 => decode_float32(descriptor, words),
        ValueType::Bool => decode_bool(words),
        ValueType::String => decode_string(words),
    };
    Ok(value)
}

fn decode_uint8(descriptor: &DatapointDescriptor, word: u16) -> Value {
    integer(descriptor, i64::from(word & 0x00FF))
}

fn decode_uint16(descriptor: &DatapointDescriptor, word: u16) -> Value {
    integer(descriptor, i64::from(word))
}

fn decode_int16(descriptor: &DatapointDescriptor, word: u16) -> Value {
    integer(descriptor, i64::from(word as i16))
}

fn decode_uint32(descriptor: &DatapointDescriptor, words: &[u16]) -> Value {
    integer(descriptor, i64::from(combine(words, descriptor.word_order)))
}

fn decode_int32(descriptor: &DatapointDescriptor, words: &[u16]) -> Value {
    integer(descriptor, i64::from(combine(words, descriptor.word_order) as i32))
}

fn decode_float32(descriptor: &DatapointDescriptor, words: &[u16]) -> Value {
    let raw = f64::from(f32::from_bits(combine(words, descriptor.word_order)));
    if descriptor.scale_factor == 1.0 {
        Value::Float(raw)
    } else {
        Value::Float(raw * descriptor.scale_factor)
    }
}

fn decode_bool(words: &[u16]) -> Value {
    Value::Bool(words.iter().any(|w| *w != 0))
}

/// Two ASCII/UTF-8 bytes per register, high byte first, trailing NULs dropped
fn decode_string(words: &[u16]) -> Value {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    Value::Text(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

fn combine(words: &[u16], order: WordOrder) -> u32 {
    let (high, low) = match order {
        WordOrder::HighFirst => (words[0], words[1]),
        WordOrder::LowFirst => (words[1], words[0]),
    };
    (u32::from(high) << 16) | u32::from(low)
}

/// Apply labels, then the scale factor, to a raw integer
fn integer(descriptor: &DatapointDescriptor, raw: i64) -> Value {
    if let Some(label) = descriptor.labels.get(&raw) {
        return Value::Text(label.clone());
    }
    if descriptor.scale_factor == 1.0 {
        Value::Integer(raw)
    } else {
        Value::Float(raw as f64 * descriptor.scale_factor)
    }
}
