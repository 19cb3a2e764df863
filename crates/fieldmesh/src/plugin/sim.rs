// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Simulated register-bank driver.
//!
//! Keeps an in-memory byte bank keyed by base address. Reads decode the
//! bank through the tag's parsed address option; writes encode through
//! the same option, so a value written and read back via one option
//! yields the original value. Used by the end-to-end tests and the
//! autostart demo in place of a real field protocol.
//!
//! Address grammar: `<station>!<register>` plus the usual option suffix,
//! e.g. `1!400001`, `1!400002#BB`, `4!400010.20H`.

use crate::error::{ErrorCode, Result};
use crate::node::{LinkState, NodeKind};
use crate::plugin::{
    CachePolicy, DriverPlugin, Plugin, PluginContext, PluginInstance, PluginModule, PollPlan,
};
use crate::reactor::TimerKind;
use crate::tag::{
    address, AddressOption, Tag, TagSample, TagType, TagValue,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Plugin name in the registry.
pub const PLUGIN_NAME: &str = "sim";

/// Module descriptor.
pub fn module() -> PluginModule {
    PluginModule {
        name: PLUGIN_NAME,
        version: "1.0.0",
        description: "Simulated register bank driver",
        schema: r#"{"type":"object","properties":{"station":{"type":"integer"}}}"#,
        kind: NodeKind::Driver,
        single: false,
        single_name: "",
        timer_kind: TimerKind::Block,
        cache_policy: CachePolicy::Snapshot,
        constructor: || PluginInstance::Driver(Box::new(SimDriver::new())),
    }
}

struct SimDriver {
    ctx: Option<Arc<dyn PluginContext>>,
    bank: HashMap<String, Vec<u8>>,
}

impl SimDriver {
    fn new() -> SimDriver {
        SimDriver {
            ctx: None,
            bank: HashMap::new(),
        }
    }

    /// Bank bytes for one base address, zero-extended to `len`.
    fn bytes(&self, base: &str, len: usize) -> Vec<u8> {
        let mut out = self.bank.get(base).cloned().unwrap_or_default();
        if out.len() < len {
            out.resize(len, 0);
        }
        out
    }

    fn read_value(&self, tag: &Tag) -> Result<TagValue> {
        let opt = tag.address_option()?;
        let base = address::base(tag.ty, &tag.address);
        match opt {
            AddressOption::Endian16 { order } => {
                let b = self.bytes(&base, 2);
                let raw = address::decode_u16([b[0], b[1]], order);
                Ok(match tag.ty {
                    TagType::Int16 => TagValue::Int16(raw as i16),
                    TagType::Word => TagValue::Word(raw),
                    _ => TagValue::Uint16(raw),
                })
            }
            AddressOption::Endian32 { order } => {
                let b = self.bytes(&base, 4);
                let raw = address::decode_u32([b[0], b[1], b[2], b[3]], order);
                Ok(match tag.ty {
                    TagType::Int32 => TagValue::Int32(raw as i32),
                    TagType::Dword => TagValue::Dword(raw),
                    TagType::Float => TagValue::Float(f32::from_bits(raw)),
                    _ => TagValue::Uint32(raw),
                })
            }
            AddressOption::Endian64 { order } => {
                let b = self.bytes(&base, 8);
                let mut raw_bytes = [0u8; 8];
                raw_bytes.copy_from_slice(&b[..8]);
                let raw = address::decode_u64(raw_bytes, order);
                Ok(match tag.ty {
                    TagType::Int64 => TagValue::Int64(raw as i64),
                    TagType::Lword => TagValue::Lword(raw),
                    TagType::Double => TagValue::Double(f64::from_bits(raw)),
                    _ => TagValue::Uint64(raw),
                })
            }
            AddressOption::String { length, mode } => {
                let span = match mode {
                    crate::tag::StringMode::D => length * 2,
                    _ => length + (length & 1),
                };
                let b = self.bytes(&base, span);
                Ok(TagValue::String(address::unpack_string(&b, length, mode)?))
            }
            AddressOption::Bytes { length } => Ok(TagValue::Bytes(self.bytes(&base, length))),
            AddressOption::Bit { bit } => {
                let b = self.bytes(&base, 8);
                let mut word = [0u8; 8];
                word.copy_from_slice(&b[..8]);
                let value = u64::from_le_bytes(word);
                Ok(TagValue::Bit(address::extract_bit(value, bit.unwrap_or(0))))
            }
            AddressOption::None => {
                let b = self.bytes(&base, 1);
                Ok(match tag.ty {
                    TagType::Bool => TagValue::Bool(b[0] != 0),
                    TagType::Int8 => TagValue::Int8(b[0] as i8),
                    _ => TagValue::Uint8(b[0]),
                })
            }
        }
    }

    fn write_value(&mut self, tag: &Tag, value: &TagValue) -> Result<()> {
        if value.tag_type() != tag.ty {
            return Err(ErrorCode::GroupParameterInvalid);
        }
        let opt = tag.address_option()?;
        let base = address::base(tag.ty, &tag.address);
        let bytes: Vec<u8> = match (opt, value) {
            (AddressOption::Endian16 { order }, v) => {
                let raw = match v {
                    TagValue::Int16(x) => *x as u16,
                    TagValue::Uint16(x) => *x,
                    TagValue::Word(x) => *x,
                    _ => return Err(ErrorCode::GroupParameterInvalid),
                };
                address::encode_u16(raw, order).to_vec()
            }
            (AddressOption::Endian32 { order }, v) => {
                let raw = match v {
                    TagValue::Int32(x) => *x as u32,
                    TagValue::Uint32(x) => *x,
                    TagValue::Dword(x) => *x,
                    TagValue::Float(x) => x.to_bits(),
                    _ => return Err(ErrorCode::GroupParameterInvalid),
                };
                address::encode_u32(raw, order).to_vec()
            }
            (AddressOption::Endian64 { order }, v) => {
                let raw = match v {
                    TagValue::Int64(x) => *x as u64,
                    TagValue::Uint64(x) => *x,
                    TagValue::Lword(x) => *x,
                    TagValue::Double(x) => x.to_bits(),
                    _ => return Err(ErrorCode::GroupParameterInvalid),
                };
                address::encode_u64(raw, order).to_vec()
            }
            (AddressOption::String { length, mode }, TagValue::String(s)) => {
                address::pack_string(s, length, mode)?
            }
            (AddressOption::Bytes { length }, TagValue::Bytes(b)) => {
                if b.len() > length {
                    return Err(ErrorCode::GroupParameterInvalid);
                }
                let mut out = b.clone();
                out.resize(length, 0);
                out
            }
            (AddressOption::Bit { bit }, TagValue::Bit(v)) => {
                let cur = self.bytes(&base, 8);
                let mut word = [0u8; 8];
                word.copy_from_slice(&cur[..8]);
                let mut raw = u64::from_le_bytes(word);
                let idx = bit.unwrap_or(0);
                if *v != 0 {
                    raw |= 1 << idx;
                } else {
                    raw &= !(1 << idx);
                }
                raw.to_le_bytes().to_vec()
            }
            (AddressOption::None, v) => {
                let byte = match v {
                    TagValue::Bool(b) => u8::from(*b),
                    TagValue::Int8(x) => *x as u8,
                    TagValue::Uint8(x) => *x,
                    _ => return Err(ErrorCode::GroupParameterInvalid),
                };
                vec![byte]
            }
            _ => return Err(ErrorCode::GroupParameterInvalid),
        };
        self.bank.insert(base, bytes);
        Ok(())
    }
}

impl Plugin for SimDriver {
    fn init(&mut self, ctx: Arc<dyn PluginContext>, _load: bool) -> Result<()> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if let Some(ctx) = &self.ctx {
            ctx.set_link_state(LinkState::Connected);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(ctx) = &self.ctx {
            ctx.set_link_state(LinkState::Disconnected);
        }
        Ok(())
    }

    fn setting(&mut self, setting: &str) -> Result<()> {
        // The blob is opaque to the fabric; the simulator only insists it
        // is well-formed JSON.
        serde_json::from_str::<serde_json::Value>(setting)?;
        Ok(())
    }
}

impl DriverPlugin for SimDriver {
    fn validate_tag(&self, tag: &Tag) -> Result<()> {
        let base = address::base(tag.ty, &tag.address);
        if base.is_empty() || !base.contains('!') {
            return Err(ErrorCode::GroupParameterInvalid);
        }
        tag.address_option()?;
        Ok(())
    }

    fn group_timer(&mut self, _group: &str, plan: &PollPlan) -> Vec<TagSample> {
        plan.polled
            .iter()
            .map(|tag| match self.read_value(tag) {
                Ok(v) => TagSample::ok(&tag.name, v),
                Err(e) => TagSample::err(&tag.name, e),
            })
            .collect()
    }

    fn write_tag(&mut self, _group: &str, tag: &Tag, value: TagValue) -> ErrorCode {
        match self.write_value(tag, &value) {
            Ok(()) => ErrorCode::Success,
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagAttr;

    fn driver() -> SimDriver {
        SimDriver::new()
    }

    fn rw_tag(name: &str, address: &str, ty: TagType) -> Tag {
        Tag::new(name, address, ty, TagAttr::READ | TagAttr::WRITE)
    }

    #[test]
    fn test_write_read_round_trip_int16() {
        let mut d = driver();
        let tag = rw_tag("t", "1!400001", TagType::Int16);
        assert_eq!(
            d.write_tag("g", &tag, TagValue::Int16(-1234)),
            ErrorCode::Success
        );
        assert_eq!(d.read_value(&tag).unwrap(), TagValue::Int16(-1234));
    }

    #[test]
    fn test_write_read_round_trip_all_dword_orders() {
        for suffix in ["", "#BB", "#BL", "#LL", "#LB"] {
            let mut d = driver();
            let addr = format!("1!400001{}", suffix);
            let tag = rw_tag("t", &addr, TagType::Float);
            assert_eq!(
                d.write_tag("g", &tag, TagValue::Float(3.25)),
                ErrorCode::Success
            );
            assert_eq!(
                d.read_value(&tag).unwrap(),
                TagValue::Float(3.25),
                "suffix {:?}",
                suffix
            );
        }
    }

    #[test]
    fn test_write_read_round_trip_double_big_endian() {
        let mut d = driver();
        let tag = rw_tag("t", "1!400001#B", TagType::Double);
        assert_eq!(
            d.write_tag("g", &tag, TagValue::Double(-2.5)),
            ErrorCode::Success
        );
        assert_eq!(d.read_value(&tag).unwrap(), TagValue::Double(-2.5));
    }

    #[test]
    fn test_write_read_round_trip_string_modes() {
        for suffix in ["8H", "8L", "8D"] {
            let mut d = driver();
            let addr = format!("4!400010.{}", suffix);
            let tag = rw_tag("t", &addr, TagType::String);
            assert_eq!(
                d.write_tag("g", &tag, TagValue::String("pump".into())),
                ErrorCode::Success
            );
            assert_eq!(
                d.read_value(&tag).unwrap(),
                TagValue::String("pump".into()),
                "suffix {:?}",
                suffix
            );
        }
    }

    #[test]
    fn test_bit_write_and_extract() {
        let mut d = driver();
        let b3 = rw_tag("b3", "1!100.3", TagType::Bit);
        let b0 = rw_tag("b0", "1!100.0", TagType::Bit);
        assert_eq!(d.write_tag("g", &b3, TagValue::Bit(1)), ErrorCode::Success);
        assert_eq!(d.read_value(&b3).unwrap(), TagValue::Bit(1));
        assert_eq!(d.read_value(&b0).unwrap(), TagValue::Bit(0));
    }

    #[test]
    fn test_unwritten_register_reads_zero() {
        let d = driver();
        let tag = rw_tag("t", "1!400001", TagType::Uint32);
        assert_eq!(d.read_value(&tag).unwrap(), TagValue::Uint32(0));
    }

    #[test]
    fn test_validate_tag_rejects_bad_address() {
        let d = driver();
        assert!(d
            .validate_tag(&rw_tag("t", "400001", TagType::Int16))
            .is_err());
        assert!(d
            .validate_tag(&rw_tag("t", "1!400001#X", TagType::Int16))
            .is_err());
        assert!(d.validate_tag(&rw_tag("t", "1!400001", TagType::Int16)).is_ok());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut d = driver();
        let tag = rw_tag("t", "1!400001", TagType::Int16);
        assert_eq!(
            d.write_tag("g", &tag, TagValue::Float(1.0)),
            ErrorCode::GroupParameterInvalid
        );
    }
}
