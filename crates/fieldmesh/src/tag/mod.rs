// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tag data model.
//!
//! A [`Tag`] describes one addressable data point on a field device: a
//! protocol address, a declared wire type, an attribute set and optional
//! formatting hints. Tags with the `STATIC` attribute carry their value in
//! the model itself instead of being read from the device.
//!
//! The address string is opaque to the fabric except for a trailing
//! *address option* (endianness selector, string length/mode, byte count
//! or bit index) parsed according to the declared type; see [`address`].

pub mod address;
pub mod value;

pub use address::{pack_string, unpack_string, AddressOption, ByteOrder, DwordOrder, StringMode};
pub use value::TagValue;

use crate::error::{ErrorCode, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Declared wire type of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TagType {
    Bit,
    Bool,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float,
    Double,
    String,
    Bytes,
    Word,
    Dword,
    Lword,
}

impl TagType {
    /// Fixed width in bytes, `None` for `STRING`/`BYTES`.
    pub fn width(self) -> Option<usize> {
        match self {
            TagType::Bit | TagType::Bool | TagType::Int8 | TagType::Uint8 => Some(1),
            TagType::Int16 | TagType::Uint16 | TagType::Word => Some(2),
            TagType::Int32 | TagType::Uint32 | TagType::Float | TagType::Dword => Some(4),
            TagType::Int64 | TagType::Uint64 | TagType::Double | TagType::Lword => Some(8),
            TagType::String | TagType::Bytes => None,
        }
    }
}

/// Tag attribute set packed as a bit field.
///
/// The wire layout mirrors the persisted form, so the bit values are
/// stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagAttr(u8);

impl TagAttr {
    pub const READ: TagAttr = TagAttr(0x01);
    pub const WRITE: TagAttr = TagAttr(0x02);
    pub const SUBSCRIBE: TagAttr = TagAttr(0x04);
    pub const STATIC: TagAttr = TagAttr(0x08);

    /// Empty attribute set.
    pub fn empty() -> TagAttr {
        TagAttr(0)
    }

    /// Raw bit value.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Build from raw bits, masking unknown ones.
    pub fn from_bits(bits: u8) -> TagAttr {
        TagAttr(bits & 0x0f)
    }

    pub fn contains(self, other: TagAttr) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: TagAttr) -> TagAttr {
        TagAttr(self.0 | other.0)
    }
}

impl std::ops::BitOr for TagAttr {
    type Output = TagAttr;

    fn bitor(self, rhs: TagAttr) -> TagAttr {
        self.with(rhs)
    }
}

/// One addressable data point on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub address: String,
    #[serde(rename = "type")]
    pub ty: TagType,
    pub attr: TagAttr,
    #[serde(default)]
    pub precision: u8,
    #[serde(default)]
    pub decimal: f64,
    #[serde(default)]
    pub option: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_value: Option<TagValue>,
}

impl Tag {
    /// Minimal constructor; hints default to zero.
    pub fn new(name: &str, address: &str, ty: TagType, attr: TagAttr) -> Tag {
        Tag {
            name: name.to_string(),
            address: address.to_string(),
            ty,
            attr,
            precision: 0,
            decimal: 0.0,
            option: 0,
            description: String::new(),
            static_value: None,
        }
    }

    /// Whether this tag participates in a poll snapshot.
    pub fn is_readable(&self) -> bool {
        self.attr.contains(TagAttr::READ)
            || self.attr.contains(TagAttr::SUBSCRIBE)
            || self.attr.contains(TagAttr::STATIC)
    }

    pub fn is_static(&self) -> bool {
        self.attr.contains(TagAttr::STATIC)
    }

    /// Stored static value, if any.
    pub fn static_value(&self) -> Option<&TagValue> {
        self.static_value.as_ref()
    }

    /// Store a static value. The tag must carry the `STATIC` attribute and
    /// the value must match the declared type.
    pub fn set_static_value(&mut self, value: TagValue) -> Result<()> {
        if !self.is_static() {
            return Err(ErrorCode::GroupParameterInvalid);
        }
        if value.tag_type() != self.ty {
            return Err(ErrorCode::GroupParameterInvalid);
        }
        self.static_value = Some(value);
        Ok(())
    }

    /// Dump the static value as a plain JSON value.
    pub fn static_value_json(&self) -> Result<serde_json::Value> {
        match &self.static_value {
            Some(v) => Ok(v.to_json()),
            None => Err(ErrorCode::TagNotExist),
        }
    }

    /// Load the static value from a plain JSON value, converting to the
    /// declared type.
    pub fn load_static_value(&mut self, value: &serde_json::Value) -> Result<()> {
        let v = TagValue::from_json(self.ty, value)?;
        self.set_static_value(v)
    }

    /// Parse the trailing address option according to the declared type.
    pub fn address_option(&self) -> Result<AddressOption> {
        address::parse(self.ty, &self.address)
    }
}

/// One sampled value inside a snapshot. Either `value` is present and
/// `error` is `Success`, or the read failed with `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagSample {
    pub tag: String,
    pub value: Option<TagValue>,
    pub error: ErrorCode,
}

impl TagSample {
    pub fn ok(tag: &str, value: TagValue) -> TagSample {
        TagSample {
            tag: tag.to_string(),
            value: Some(value),
            error: ErrorCode::Success,
        }
    }

    pub fn err(tag: &str, error: ErrorCode) -> TagSample {
        TagSample {
            tag: tag.to_string(),
            value: None,
            error,
        }
    }
}

/// The result of one group poll, fanned out to every subscriber of the
/// `(driver, group)` pair. Shared by reference count so fan-out never
/// copies device data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransData {
    pub driver: String,
    pub group: String,
    pub timestamp: u64,
    pub samples: Vec<TagSample>,
}

impl TransData {
    /// Look up a sample by tag name.
    pub fn sample(&self, tag: &str) -> Option<&TagSample> {
        self.samples.iter().find(|s| s.tag == tag)
    }
}

/// Shared snapshot handle as it travels on the bus.
pub type SharedTransData = Arc<TransData>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_bit_ops() {
        let a = TagAttr::READ | TagAttr::STATIC;
        assert!(a.contains(TagAttr::READ));
        assert!(a.contains(TagAttr::STATIC));
        assert!(!a.contains(TagAttr::WRITE));
        assert_eq!(TagAttr::from_bits(0xff).bits(), 0x0f);
    }

    #[test]
    fn test_readable_filter() {
        let r = Tag::new("a", "1!1", TagType::Int16, TagAttr::READ);
        let w = Tag::new("b", "1!2", TagType::Int16, TagAttr::WRITE);
        let s = Tag::new("c", "1!3", TagType::Float, TagAttr::STATIC);
        assert!(r.is_readable());
        assert!(!w.is_readable());
        assert!(s.is_readable());
    }

    #[test]
    fn test_static_value_requires_attr_and_type() {
        let mut t = Tag::new("t", "1!1", TagType::Float, TagAttr::READ);
        assert_eq!(
            t.set_static_value(TagValue::Float(1.0)),
            Err(ErrorCode::GroupParameterInvalid)
        );
        t.attr = TagAttr::STATIC;
        assert_eq!(
            t.set_static_value(TagValue::Int16(1)),
            Err(ErrorCode::GroupParameterInvalid)
        );
        assert!(t.set_static_value(TagValue::Float(3.14)).is_ok());
    }

    #[test]
    fn test_static_value_json_round_trip() {
        let cases = vec![
            (TagType::Bit, TagValue::Bit(1)),
            (TagType::Bool, TagValue::Bool(true)),
            (TagType::Int8, TagValue::Int8(-5)),
            (TagType::Uint8, TagValue::Uint8(200)),
            (TagType::Int16, TagValue::Int16(-12345)),
            (TagType::Uint16, TagValue::Uint16(54321)),
            (TagType::Int32, TagValue::Int32(-7_000_000)),
            (TagType::Uint32, TagValue::Uint32(4_000_000_000)),
            (TagType::Int64, TagValue::Int64(-9_000_000_000)),
            (TagType::Uint64, TagValue::Uint64(18_000_000_000_000_000_000)),
            (TagType::Float, TagValue::Float(3.14)),
            (TagType::Double, TagValue::Double(-2.5e10)),
            (TagType::String, TagValue::String("hello".into())),
            (TagType::Bytes, TagValue::Bytes(vec![1, 2, 3])),
            (TagType::Word, TagValue::Word(0xbeef)),
            (TagType::Dword, TagValue::Dword(0xdead_beef)),
            (TagType::Lword, TagValue::Lword(0xdead_beef_dead_beef)),
        ];
        for (ty, v) in cases {
            let mut tag = Tag::new("t", "1!1", ty, TagAttr::STATIC);
            tag.set_static_value(v.clone()).unwrap();
            let json = tag.static_value_json().unwrap();
            let mut other = Tag::new("t", "1!1", ty, TagAttr::STATIC);
            other.load_static_value(&json).unwrap();
            assert_eq!(other.static_value(), Some(&v), "type {:?}", ty);
        }
    }
}
