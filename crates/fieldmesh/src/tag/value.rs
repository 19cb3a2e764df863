// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed tag values and their JSON projection.
//!
//! Northbound clients speak JSON; the fabric converts incoming values to
//! the tag's declared native type before they reach a driver plugin, and
//! projects sampled values back to plain JSON on the way out.

use crate::error::{ErrorCode, Result};
use crate::tag::TagType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A value of one of the seventeen wire types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "UPPERCASE")]
pub enum TagValue {
    Bit(u8),
    Bool(bool),
    Int8(i8),
    Uint8(u8),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Word(u16),
    Dword(u32),
    Lword(u64),
}

impl TagValue {
    /// The declared type this value belongs to.
    pub fn tag_type(&self) -> TagType {
        match self {
            TagValue::Bit(_) => TagType::Bit,
            TagValue::Bool(_) => TagType::Bool,
            TagValue::Int8(_) => TagType::Int8,
            TagValue::Uint8(_) => TagType::Uint8,
            TagValue::Int16(_) => TagType::Int16,
            TagValue::Uint16(_) => TagType::Uint16,
            TagValue::Int32(_) => TagType::Int32,
            TagValue::Uint32(_) => TagType::Uint32,
            TagValue::Int64(_) => TagType::Int64,
            TagValue::Uint64(_) => TagType::Uint64,
            TagValue::Float(_) => TagType::Float,
            TagValue::Double(_) => TagType::Double,
            TagValue::String(_) => TagType::String,
            TagValue::Bytes(_) => TagType::Bytes,
            TagValue::Word(_) => TagType::Word,
            TagValue::Dword(_) => TagType::Dword,
            TagValue::Lword(_) => TagType::Lword,
        }
    }

    /// Zero value of a type, used when a register has never been written.
    pub fn zero(ty: TagType) -> TagValue {
        match ty {
            TagType::Bit => TagValue::Bit(0),
            TagType::Bool => TagValue::Bool(false),
            TagType::Int8 => TagValue::Int8(0),
            TagType::Uint8 => TagValue::Uint8(0),
            TagType::Int16 => TagValue::Int16(0),
            TagType::Uint16 => TagValue::Uint16(0),
            TagType::Int32 => TagValue::Int32(0),
            TagType::Uint32 => TagValue::Uint32(0),
            TagType::Int64 => TagValue::Int64(0),
            TagType::Uint64 => TagValue::Uint64(0),
            TagType::Float => TagValue::Float(0.0),
            TagType::Double => TagValue::Double(0.0),
            TagType::String => TagValue::String(String::new()),
            TagType::Bytes => TagValue::Bytes(Vec::new()),
            TagType::Word => TagValue::Word(0),
            TagType::Dword => TagValue::Dword(0),
            TagType::Lword => TagValue::Lword(0),
        }
    }

    /// Project to a plain JSON value (no type tag).
    pub fn to_json(&self) -> Value {
        match self {
            TagValue::Bit(v) => Value::from(*v),
            TagValue::Bool(v) => Value::from(*v),
            TagValue::Int8(v) => Value::from(*v),
            TagValue::Uint8(v) => Value::from(*v),
            TagValue::Int16(v) => Value::from(*v),
            TagValue::Uint16(v) => Value::from(*v),
            TagValue::Int32(v) => Value::from(*v),
            TagValue::Uint32(v) => Value::from(*v),
            TagValue::Int64(v) => Value::from(*v),
            TagValue::Uint64(v) => Value::from(*v),
            TagValue::Float(v) => Value::from(*v),
            TagValue::Double(v) => Value::from(*v),
            TagValue::String(v) => Value::from(v.as_str()),
            TagValue::Bytes(v) => Value::from(v.clone()),
            TagValue::Word(v) => Value::from(*v),
            TagValue::Dword(v) => Value::from(*v),
            TagValue::Lword(v) => Value::from(*v),
        }
    }

    /// Convert a plain JSON value to the declared native type.
    ///
    /// Integer range violations, fractional values for integer types and
    /// shape mismatches all fail with `GroupParameterInvalid`.
    pub fn from_json(ty: TagType, value: &Value) -> Result<TagValue> {
        let invalid = ErrorCode::GroupParameterInvalid;
        match ty {
            TagType::Bit => match value.as_u64() {
                Some(v @ 0..=1) => Ok(TagValue::Bit(v as u8)),
                _ => match value.as_bool() {
                    Some(b) => Ok(TagValue::Bit(u8::from(b))),
                    None => Err(invalid),
                },
            },
            TagType::Bool => value.as_bool().map(TagValue::Bool).ok_or(invalid),
            TagType::Int8 => int_from_json(value)
                .and_then(|v| i8::try_from(v).ok())
                .map(TagValue::Int8)
                .ok_or(invalid),
            TagType::Uint8 => uint_from_json(value)
                .and_then(|v| u8::try_from(v).ok())
                .map(TagValue::Uint8)
                .ok_or(invalid),
            TagType::Int16 => int_from_json(value)
                .and_then(|v| i16::try_from(v).ok())
                .map(TagValue::Int16)
                .ok_or(invalid),
            TagType::Uint16 => uint_from_json(value)
                .and_then(|v| u16::try_from(v).ok())
                .map(TagValue::Uint16)
                .ok_or(invalid),
            TagType::Int32 => int_from_json(value)
                .and_then(|v| i32::try_from(v).ok())
                .map(TagValue::Int32)
                .ok_or(invalid),
            TagType::Uint32 => uint_from_json(value)
                .and_then(|v| u32::try_from(v).ok())
                .map(TagValue::Uint32)
                .ok_or(invalid),
            TagType::Int64 => int_from_json(value).map(TagValue::Int64).ok_or(invalid),
            TagType::Uint64 => uint_from_json(value).map(TagValue::Uint64).ok_or(invalid),
            TagType::Float => value
                .as_f64()
                .map(|v| TagValue::Float(v as f32))
                .ok_or(invalid),
            TagType::Double => value.as_f64().map(TagValue::Double).ok_or(invalid),
            TagType::String => value
                .as_str()
                .map(|s| TagValue::String(s.to_string()))
                .ok_or(invalid),
            TagType::Bytes => {
                let arr = value.as_array().ok_or(invalid)?;
                let mut bytes = Vec::with_capacity(arr.len());
                for item in arr {
                    let b = item
                        .as_u64()
                        .and_then(|v| u8::try_from(v).ok())
                        .ok_or(invalid)?;
                    bytes.push(b);
                }
                Ok(TagValue::Bytes(bytes))
            }
            TagType::Word => uint_from_json(value)
                .and_then(|v| u16::try_from(v).ok())
                .map(TagValue::Word)
                .ok_or(invalid),
            TagType::Dword => uint_from_json(value)
                .and_then(|v| u32::try_from(v).ok())
                .map(TagValue::Dword)
                .ok_or(invalid),
            TagType::Lword => uint_from_json(value).map(TagValue::Lword).ok_or(invalid),
        }
    }
}

fn int_from_json(value: &Value) -> Option<i64> {
    value.as_i64()
}

fn uint_from_json(value: &Value) -> Option<u64> {
    value.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_range_checks() {
        assert_eq!(
            TagValue::from_json(TagType::Int8, &json!(300)),
            Err(ErrorCode::GroupParameterInvalid)
        );
        assert_eq!(
            TagValue::from_json(TagType::Uint16, &json!(-1)),
            Err(ErrorCode::GroupParameterInvalid)
        );
        assert_eq!(
            TagValue::from_json(TagType::Int16, &json!(42)),
            Ok(TagValue::Int16(42))
        );
    }

    #[test]
    fn test_from_json_shape_checks() {
        assert_eq!(
            TagValue::from_json(TagType::Bool, &json!(1)),
            Err(ErrorCode::GroupParameterInvalid)
        );
        assert_eq!(
            TagValue::from_json(TagType::String, &json!(5)),
            Err(ErrorCode::GroupParameterInvalid)
        );
        assert_eq!(
            TagValue::from_json(TagType::Bytes, &json!([1, 2, 256])),
            Err(ErrorCode::GroupParameterInvalid)
        );
    }

    #[test]
    fn test_bit_accepts_bool_and_binary() {
        assert_eq!(
            TagValue::from_json(TagType::Bit, &json!(true)),
            Ok(TagValue::Bit(1))
        );
        assert_eq!(
            TagValue::from_json(TagType::Bit, &json!(0)),
            Ok(TagValue::Bit(0))
        );
        assert_eq!(
            TagValue::from_json(TagType::Bit, &json!(2)),
            Err(ErrorCode::GroupParameterInvalid)
        );
    }

    #[test]
    fn test_json_round_trip_scalars() {
        let values = vec![
            TagValue::Int32(-123456),
            TagValue::Uint64(u64::MAX),
            TagValue::Double(1.5),
            TagValue::Word(0xabcd),
        ];
        for v in values {
            let back = TagValue::from_json(v.tag_type(), &v.to_json()).unwrap();
            assert_eq!(back, v);
        }
    }
}
