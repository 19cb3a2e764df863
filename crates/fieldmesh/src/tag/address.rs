// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Address-option parsing and the typed byte-order conversions keyed on it.
//!
//! A tag address is an opaque protocol location except for its trailing
//! suffix, whose grammar depends on the declared type:
//!
//! | type | suffix | default |
//! |------|--------|---------|
//! | STRING | `.<len><mode>`, mode ∈ H,L,D,E | mode H; E folds to D |
//! | BYTES | `.<len>` | required |
//! | 16-bit / WORD | `#B` or `#L` | L |
//! | 32-bit / DWORD / FLOAT | `#BB` `#BL` `#LL` `#LB` | LL |
//! | 64-bit / LWORD / DOUBLE | `#B` or `#L` | L |
//! | BIT | `.<bit>` | none |
//!
//! Byte-order conversion is expressed here as explicit typed operations
//! instead of ad-hoc swaps at call sites.

use crate::error::{ErrorCode, Result};
use crate::tag::TagType;

/// Byte order for 16- and 64-bit quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

/// Byte/word order combination for 32-bit quantities. The first letter
/// selects the byte order inside each 16-bit word, the second the word
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwordOrder {
    BB,
    BL,
    LL,
    LB,
}

/// Packing mode for string registers.
///
/// `H`/`L` pack two characters per 16-bit word (high or low byte first);
/// `D` widens each character to a full word. The `E` spelling in an
/// address folds to `D` at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringMode {
    H,
    L,
    D,
}

/// Parsed view of a tag address suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressOption {
    None,
    String { length: usize, mode: StringMode },
    Bytes { length: usize },
    Endian16 { order: ByteOrder },
    Endian32 { order: DwordOrder },
    Endian64 { order: ByteOrder },
    Bit { bit: Option<u8> },
}

const BIT_INDEX_MAX: u8 = 63;

/// Parse the trailing address option according to the declared type.
pub fn parse(ty: TagType, address: &str) -> Result<AddressOption> {
    match ty {
        TagType::String => parse_string_suffix(address),
        TagType::Bytes => {
            let (length, rest) = parse_dot_number(address)?;
            if !rest.is_empty() {
                return Err(ErrorCode::GroupParameterInvalid);
            }
            Ok(AddressOption::Bytes { length })
        }
        TagType::Int16 | TagType::Uint16 | TagType::Word => {
            Ok(AddressOption::Endian16 {
                order: parse_hash_order(address, ByteOrder::Little)?,
            })
        }
        TagType::Int32 | TagType::Uint32 | TagType::Dword | TagType::Float => {
            Ok(AddressOption::Endian32 {
                order: parse_hash_order32(address)?,
            })
        }
        TagType::Int64 | TagType::Uint64 | TagType::Lword | TagType::Double => {
            Ok(AddressOption::Endian64 {
                order: parse_hash_order(address, ByteOrder::Little)?,
            })
        }
        TagType::Bit => match address.rfind('.') {
            None => Ok(AddressOption::Bit { bit: None }),
            Some(pos) => {
                let digits = &address[pos + 1..];
                let bit: u8 = digits
                    .parse()
                    .map_err(|_| ErrorCode::GroupParameterInvalid)?;
                if bit > BIT_INDEX_MAX {
                    return Err(ErrorCode::GroupParameterInvalid);
                }
                Ok(AddressOption::Bit { bit: Some(bit) })
            }
        },
        _ => Ok(AddressOption::None),
    }
}

/// `".<len><mode>"` where mode defaults to H and E folds to D.
fn parse_string_suffix(address: &str) -> Result<AddressOption> {
    let (length, rest) = parse_dot_number(address)?;
    let mode = match rest {
        "" | "H" => StringMode::H,
        "L" => StringMode::L,
        "D" | "E" => StringMode::D,
        _ => return Err(ErrorCode::GroupParameterInvalid),
    };
    Ok(AddressOption::String { length, mode })
}

/// Split the suffix after the last `'.'` into a leading number and the
/// remaining characters.
fn parse_dot_number(address: &str) -> Result<(usize, &str)> {
    let pos = address.rfind('.').ok_or(ErrorCode::GroupParameterInvalid)?;
    let suffix = &address[pos + 1..];
    let digits_end = suffix
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(suffix.len());
    if digits_end == 0 {
        return Err(ErrorCode::GroupParameterInvalid);
    }
    let length: usize = suffix[..digits_end]
        .parse()
        .map_err(|_| ErrorCode::GroupParameterInvalid)?;
    if length == 0 {
        return Err(ErrorCode::GroupParameterInvalid);
    }
    Ok((length, &suffix[digits_end..]))
}

/// `"#B"` / `"#L"` single-letter order, or the given default.
fn parse_hash_order(address: &str, default: ByteOrder) -> Result<ByteOrder> {
    match address.rfind('#') {
        None => Ok(default),
        Some(pos) => match &address[pos + 1..] {
            "B" => Ok(ByteOrder::Big),
            "L" => Ok(ByteOrder::Little),
            _ => Err(ErrorCode::GroupParameterInvalid),
        },
    }
}

/// `"#BB"` / `"#BL"` / `"#LL"` / `"#LB"`, default LL.
fn parse_hash_order32(address: &str) -> Result<DwordOrder> {
    match address.rfind('#') {
        None => Ok(DwordOrder::LL),
        Some(pos) => match &address[pos + 1..] {
            "BB" => Ok(DwordOrder::BB),
            "BL" => Ok(DwordOrder::BL),
            "LL" => Ok(DwordOrder::LL),
            "LB" => Ok(DwordOrder::LB),
            _ => Err(ErrorCode::GroupParameterInvalid),
        },
    }
}

/// Base part of an address with any option suffix removed.
pub fn base(ty: TagType, address: &str) -> String {
    let cut = match ty {
        TagType::String | TagType::Bytes | TagType::Bit => address.rfind('.'),
        TagType::Int16
        | TagType::Uint16
        | TagType::Word
        | TagType::Int32
        | TagType::Uint32
        | TagType::Dword
        | TagType::Float
        | TagType::Int64
        | TagType::Uint64
        | TagType::Lword
        | TagType::Double => address.rfind('#'),
        _ => None,
    };
    match cut {
        Some(pos) => address[..pos].to_string(),
        None => address.to_string(),
    }
}

// ============================================================================
// Typed byte-order conversions
// ============================================================================

pub fn encode_u16(v: u16, order: ByteOrder) -> [u8; 2] {
    match order {
        ByteOrder::Little => v.to_le_bytes(),
        ByteOrder::Big => v.to_be_bytes(),
    }
}

pub fn decode_u16(b: [u8; 2], order: ByteOrder) -> u16 {
    match order {
        ByteOrder::Little => u16::from_le_bytes(b),
        ByteOrder::Big => u16::from_be_bytes(b),
    }
}

pub fn encode_u32(v: u32, order: DwordOrder) -> [u8; 4] {
    let d = v.to_le_bytes();
    match order {
        DwordOrder::LL => d,
        DwordOrder::LB => [d[2], d[3], d[0], d[1]],
        DwordOrder::BB => [d[3], d[2], d[1], d[0]],
        DwordOrder::BL => [d[1], d[0], d[3], d[2]],
    }
}

pub fn decode_u32(b: [u8; 4], order: DwordOrder) -> u32 {
    let d = match order {
        DwordOrder::LL => b,
        DwordOrder::LB => [b[2], b[3], b[0], b[1]],
        DwordOrder::BB => [b[3], b[2], b[1], b[0]],
        DwordOrder::BL => [b[1], b[0], b[3], b[2]],
    };
    u32::from_le_bytes(d)
}

pub fn encode_u64(v: u64, order: ByteOrder) -> [u8; 8] {
    match order {
        ByteOrder::Little => v.to_le_bytes(),
        ByteOrder::Big => v.to_be_bytes(),
    }
}

pub fn decode_u64(b: [u8; 8], order: ByteOrder) -> u64 {
    match order {
        ByteOrder::Little => u64::from_le_bytes(b),
        ByteOrder::Big => u64::from_be_bytes(b),
    }
}

/// Extract one bit of a register word.
pub fn extract_bit(word: u64, bit: u8) -> u8 {
    ((word >> bit) & 1) as u8
}

// ============================================================================
// String register packing
// ============================================================================

/// Unpack device bytes into a string of at most `length` characters.
///
/// Trailing NUL padding is trimmed; the result must be valid UTF-8.
pub fn unpack_string(bytes: &[u8], length: usize, mode: StringMode) -> Result<String> {
    let raw: Vec<u8> = match mode {
        StringMode::H => bytes.iter().take(length).copied().collect(),
        StringMode::L => {
            let mut swapped = Vec::with_capacity(bytes.len());
            for pair in bytes.chunks(2) {
                if pair.len() == 2 {
                    swapped.push(pair[1]);
                    swapped.push(pair[0]);
                } else {
                    swapped.push(pair[0]);
                }
            }
            swapped.into_iter().take(length).collect()
        }
        StringMode::D => {
            // One character per word: the source must carry a full word
            // for every character.
            if length * 2 > bytes.len() {
                return Err(ErrorCode::GroupParameterInvalid);
            }
            bytes.iter().step_by(2).take(length).copied().collect()
        }
    };
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end])
        .map(str::to_string)
        .map_err(|_| ErrorCode::GroupParameterInvalid)
}

/// Pack a string into device bytes for a register of `length` characters.
pub fn pack_string(s: &str, length: usize, mode: StringMode) -> Result<Vec<u8>> {
    let src = s.as_bytes();
    if src.len() > length {
        return Err(ErrorCode::GroupParameterInvalid);
    }
    match mode {
        StringMode::H | StringMode::L => {
            let padded = length + (length & 1);
            let mut out = vec![0u8; padded];
            out[..src.len()].copy_from_slice(src);
            if mode == StringMode::L {
                for pair in out.chunks_mut(2) {
                    pair.swap(0, 1);
                }
            }
            Ok(out)
        }
        StringMode::D => {
            // Widening doubles the byte count; the destination register
            // must be able to hold length * 2 bytes.
            let mut out = vec![0u8; length * 2];
            for (i, &b) in src.iter().enumerate() {
                out[i * 2] = b;
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_option_with_mode() {
        let opt = parse(TagType::String, "4!400010.20H").unwrap();
        assert_eq!(
            opt,
            AddressOption::String {
                length: 20,
                mode: StringMode::H
            }
        );
    }

    #[test]
    fn test_string_mode_e_folds_to_d() {
        let opt = parse(TagType::String, "4!400010.20E").unwrap();
        assert_eq!(
            opt,
            AddressOption::String {
                length: 20,
                mode: StringMode::D
            }
        );
    }

    #[test]
    fn test_string_mode_defaults_to_h() {
        let opt = parse(TagType::String, "4!400010.8").unwrap();
        assert_eq!(
            opt,
            AddressOption::String {
                length: 8,
                mode: StringMode::H
            }
        );
    }

    #[test]
    fn test_string_requires_length() {
        assert!(parse(TagType::String, "4!400010").is_err());
        assert!(parse(TagType::String, "4!400010.0H").is_err());
    }

    #[test]
    fn test_bytes_option() {
        assert_eq!(
            parse(TagType::Bytes, "1!100.16").unwrap(),
            AddressOption::Bytes { length: 16 }
        );
        assert!(parse(TagType::Bytes, "1!100.16H").is_err());
    }

    #[test]
    fn test_endian16_defaults_little() {
        assert_eq!(
            parse(TagType::Int16, "1!400001").unwrap(),
            AddressOption::Endian16 {
                order: ByteOrder::Little
            }
        );
        assert_eq!(
            parse(TagType::Uint16, "1!400001#B").unwrap(),
            AddressOption::Endian16 {
                order: ByteOrder::Big
            }
        );
        assert!(parse(TagType::Int16, "1!400001#X").is_err());
    }

    #[test]
    fn test_endian32_combinations() {
        for (suffix, order) in [
            ("#BB", DwordOrder::BB),
            ("#BL", DwordOrder::BL),
            ("#LL", DwordOrder::LL),
            ("#LB", DwordOrder::LB),
        ] {
            let addr = format!("1!400001{}", suffix);
            assert_eq!(
                parse(TagType::Float, &addr).unwrap(),
                AddressOption::Endian32 { order }
            );
        }
        assert_eq!(
            parse(TagType::Dword, "1!400001").unwrap(),
            AddressOption::Endian32 {
                order: DwordOrder::LL
            }
        );
    }

    #[test]
    fn test_bit_option() {
        assert_eq!(
            parse(TagType::Bit, "1!400001").unwrap(),
            AddressOption::Bit { bit: None }
        );
        assert_eq!(
            parse(TagType::Bit, "1!400001.3").unwrap(),
            AddressOption::Bit { bit: Some(3) }
        );
        assert!(parse(TagType::Bit, "1!400001.64").is_err());
    }

    #[test]
    fn test_base_strips_suffix() {
        assert_eq!(base(TagType::String, "4!400010.20H"), "4!400010");
        assert_eq!(base(TagType::Int32, "1!400001#BB"), "1!400001");
        assert_eq!(base(TagType::Int16, "1!400001"), "1!400001");
    }

    #[test]
    fn test_u16_round_trip() {
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let v = 0xbeefu16;
            assert_eq!(decode_u16(encode_u16(v, order), order), v);
        }
    }

    #[test]
    fn test_u32_round_trip_all_orders() {
        for order in [
            DwordOrder::BB,
            DwordOrder::BL,
            DwordOrder::LL,
            DwordOrder::LB,
        ] {
            let v = 0x1234_5678u32;
            assert_eq!(decode_u32(encode_u32(v, order), order), v, "{:?}", order);
        }
    }

    #[test]
    fn test_u32_orders_differ_on_wire() {
        let v = 0x1234_5678u32;
        assert_eq!(encode_u32(v, DwordOrder::LL), [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(encode_u32(v, DwordOrder::BB), [0x12, 0x34, 0x56, 0x78]);
        assert_eq!(encode_u32(v, DwordOrder::LB), [0x34, 0x12, 0x78, 0x56]);
        assert_eq!(encode_u32(v, DwordOrder::BL), [0x56, 0x78, 0x12, 0x34]);
    }

    #[test]
    fn test_u64_round_trip() {
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let v = 0xdead_beef_0102_0304u64;
            assert_eq!(decode_u64(encode_u64(v, order), order), v);
        }
    }

    #[test]
    fn test_string_pack_unpack_h() {
        let packed = pack_string("ab", 4, StringMode::H).unwrap();
        assert_eq!(packed, vec![b'a', b'b', 0, 0]);
        assert_eq!(unpack_string(&packed, 4, StringMode::H).unwrap(), "ab");
    }

    #[test]
    fn test_string_pack_unpack_l() {
        let packed = pack_string("abcd", 4, StringMode::L).unwrap();
        assert_eq!(packed, vec![b'b', b'a', b'd', b'c']);
        assert_eq!(unpack_string(&packed, 4, StringMode::L).unwrap(), "abcd");
    }

    #[test]
    fn test_string_pack_unpack_d() {
        let packed = pack_string("ab", 2, StringMode::D).unwrap();
        assert_eq!(packed, vec![b'a', 0, b'b', 0]);
        assert_eq!(unpack_string(&packed, 2, StringMode::D).unwrap(), "ab");
    }

    #[test]
    fn test_unpack_d_guards_source_width() {
        // Three bytes cannot carry two widened characters.
        assert!(unpack_string(&[b'a', 0, b'b'], 2, StringMode::D).is_err());
    }

    #[test]
    fn test_pack_rejects_overlong_value() {
        assert!(pack_string("toolong", 4, StringMode::H).is_err());
    }

    #[test]
    fn test_unpack_rejects_invalid_utf8() {
        assert!(unpack_string(&[0xff, 0xfe], 2, StringMode::H).is_err());
    }
}
