//! Turns a raw register snapshot into named, human-readable values, and the
//! reverse: turns a user-supplied write into the register writes needed to
//! apply it, including read-modify-write for sub-word bitfields.

use std::collections::BTreeMap;

use crate::error::{GatewayError, Result};
use crate::spec::codec::{self, RawValue};
use crate::spec::types::{Byteorder, CodeTable, DataType, RegistryMapEntry, RegistryType, ValueDomain, WriteMode};
use crate::spec::ProtocolSpec;

/// Registers most recently read from a device, keyed by bank and address.
/// Modbus sources populate `words`; byte-addressed transports (CAN, Pylon)
/// populate `bytes` instead.
#[derive(Debug, Clone, Default)]
pub struct RegisterSnapshot {
    words: BTreeMap<(RegistryType, u32), u16>,
    bytes: BTreeMap<(RegistryType, u32), Vec<u8>>,
}

impl RegisterSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_range(&mut self, registry_type: RegistryType, start: u32, regs: &[u16]) {
        for (i, v) in regs.iter().enumerate() {
            self.words.insert((registry_type, start + i as u32), *v);
        }
    }

    pub fn insert_bytes(&mut self, registry_type: RegistryType, register: u32, raw: Vec<u8>) {
        self.bytes.insert((registry_type, register), raw);
    }

    pub fn get(&self, registry_type: RegistryType, addr: u32) -> Option<u16> {
        self.words.get(&(registry_type, addr)).copied()
    }

    pub fn get_bytes(&self, registry_type: RegistryType, addr: u32) -> Option<&[u8]> {
        self.bytes.get(&(registry_type, addr)).map(|v| v.as_slice())
    }

    fn word_span(&self, entry: &RegistryMapEntry) -> Option<Vec<u16>> {
        let span = entry.register_span();
        let mut out = Vec::with_capacity(span as usize);
        for i in 0..span {
            out.push(self.get(entry.registry_type, entry.register + i as u32)?);
        }
        Some(out)
    }
}

/// Decode every readable, present entry in `spec`'s registry map against
/// `snapshot`, producing `variable_name -> display string`.
///
/// Entries whose registers are missing from the snapshot (not covered by
/// the read ranges that were actually executed this cycle) are silently
/// skipped rather than erroring, since a single poll cycle commonly covers
/// only a subset of the full map.
pub fn process_registry(spec: &ProtocolSpec, snapshot: &RegisterSnapshot) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for entry in &spec.registry_map {
        if !entry.write_mode.is_readable() {
            continue;
        }
        if entry.concatenate {
            // Only the primary register (the first in the declared range)
            // emits a value; the rest exist purely so the join below can
            // find them.
            if entry.concatenate_registers.first().copied() != Some(entry.register) {
                continue;
            }
            if let Some(text) = render_concatenated(spec, entry, snapshot) {
                out.insert(entry.variable_name.clone(), text);
            }
            continue;
        }

        let byteorder = entry.effective_byteorder(spec.default_byteorder);
        let rendered = if let Some(regs) = snapshot.word_span(entry) {
            render_entry(spec, entry, &codec::decode(entry, &regs, byteorder))
        } else if let Some(raw) = snapshot.get_bytes(entry.registry_type, entry.register) {
            render_entry(spec, entry, &codec::decode_bytes(entry, raw, byteorder))
        } else {
            continue;
        };
        match rendered {
            Ok(text) => {
                out.insert(entry.variable_name.clone(), text);
            }
            Err(err) => {
                tracing::warn!(variable = %entry.variable_name, error = %err, "failed to decode register");
            }
        }
    }
    out
}

fn render_entry(spec: &ProtocolSpec, entry: &RegistryMapEntry, raw: &Result<RawValue>) -> Result<String> {
    let raw = match raw {
        Ok(v) => v.clone(),
        Err(e) => return Err(clone_err(e)),
    };
    let codes = spec.codes.get(&entry.codes_table_name());
    match (entry.data_type, raw) {
        (DataType::Flags8, RawValue::Integer(v)) => Ok(render_flags(v as u64, 8, codes)),
        (DataType::Flags16, RawValue::Integer(v)) => Ok(render_flags(v as u64, 16, codes)),
        (DataType::Flags32, RawValue::Integer(v)) => Ok(render_flags(v as u64, 32, codes)),
        (_, RawValue::Text(s)) => Ok(s),
        (_, RawValue::Integer(v)) => {
            if let Some(table) = codes {
                if let Some(label) = table.lookup(v) {
                    return Ok(label.to_string());
                }
            }
            if entry.unit_mod == 1.0 {
                Ok(v.to_string())
            } else {
                let scaled = v as f64 * entry.unit_mod;
                Ok(format!("{scaled:?}"))
            }
        }
    }
}

fn clone_err(e: &GatewayError) -> GatewayError {
    GatewayError::Protocol(e.to_string())
}

/// Render a `FLAGS*` window: a comma-joined list of labels for every set
/// bit (and every composite key whose bits are all set) when a matching
/// `<variable_name>_codes` table exists, otherwise the raw binary string
/// ordered from `register_bit` (least significant, first) upward.
fn render_flags(window: u64, size: u32, codes: Option<&CodeTable>) -> String {
    if let Some(table) = codes.filter(|t| !t.bit_entries.is_empty()) {
        let mut labels = Vec::new();
        for (bits, label) in &table.bit_entries {
            if bits.iter().all(|&b| (window >> b) & 1 == 1) {
                labels.push(label.clone());
            }
        }
        labels.join(",")
    } else {
        (0..size).map(|i| if (window >> i) & 1 == 1 { '1' } else { '0' }).collect()
    }
}

/// Join the individually-decoded pieces of a `concatenate`d entry (one
/// piece per register in `concatenate_registers`, in declared order) into a
/// single string. ASCII pieces have NULs replaced with spaces and the
/// joined result trimmed, matching how these registers pad unused tail
/// bytes with zeros.
fn render_concatenated(spec: &ProtocolSpec, entry: &RegistryMapEntry, snapshot: &RegisterSnapshot) -> Option<String> {
    let byteorder = entry.effective_byteorder(spec.default_byteorder);
    if entry.data_type == DataType::Ascii {
        let mut bytes = Vec::with_capacity(entry.concatenate_registers.len() * 2);
        for &reg in &entry.concatenate_registers {
            let word = snapshot.get(entry.registry_type, reg)?;
            bytes.extend_from_slice(&codec::word_bytes(word, byteorder));
        }
        let s = String::from_utf8_lossy(&bytes).replace('\0', " ");
        return Some(s.trim().to_string());
    }

    let mut joined = String::new();
    for &reg in &entry.concatenate_registers {
        let word = snapshot.get(entry.registry_type, reg)?;
        match codec::decode(entry, &[word], byteorder).ok()? {
            RawValue::Text(s) => joined.push_str(&s),
            RawValue::Integer(v) => joined.push_str(&v.to_string()),
        }
    }
    Some(joined)
}

/// Build the register writes needed to set `entry` to `value`, validating
/// the write is permitted first. Bitfield types narrower than a full
/// register require the entry's *current* register contents to merge the
/// new bits in without clobbering unrelated ones, hence `current`.
pub fn write_variable(
    entry: &RegistryMapEntry,
    value: i64,
    current: Option<&RegisterSnapshot>,
) -> Result<Vec<(RegistryType, u32, u16)>> {
    if !entry.write_mode.is_writable() {
        return Err(GatewayError::Validation(format!(
            "{} is not writable (write_mode={:?})",
            entry.variable_name, entry.write_mode
        )));
    }

    let new_regs = codec::encode(entry.data_type, value)?;

    let splice_width = match entry.data_type {
        DataType::Byte => Some(8u32),
        DataType::Flags8 => Some(8),
        DataType::Flags16 => Some(16),
        DataType::Bits(n) | DataType::SBits(n) | DataType::SMBits(n) => Some(n as u32),
        _ => None,
    };

    let merged = match splice_width {
        Some(width) if width < 16 || entry.register_bit != 0 => {
            let current = current.ok_or_else(|| {
                GatewayError::Validation(format!(
                    "{}: read-modify-write requires a current register snapshot",
                    entry.variable_name
                ))
            })?;
            let existing = current
                .get(entry.registry_type, entry.register)
                .ok_or_else(|| {
                    GatewayError::Validation(format!(
                        "{}: register {} not present in current snapshot",
                        entry.variable_name, entry.register
                    ))
                })?;
            let register_bit = entry.register_bit as u32;
            let mask: u32 = if width >= 16 { 0xFFFF } else { ((1u32 << width) - 1) << register_bit };
            let cleared = existing as u32 & !mask;
            let shifted = ((new_regs[0] as u32) << register_bit) & mask;
            vec![(cleared | shifted) as u16]
        }
        _ => new_regs,
    };

    Ok(merged
        .into_iter()
        .enumerate()
        .map(|(i, v)| (entry.registry_type, entry.register + i as u32, v))
        .collect())
}

/// Check an entry's internal consistency before it's used. Catches
/// malformed protocol spec CSV rows early rather than failing obscurely
/// mid-poll.
pub fn validate_entry_shape(entry: &RegistryMapEntry) -> Result<()> {
    if entry.variable_name.is_empty() {
        return Err(GatewayError::Spec("empty variable_name".into()));
    }
    if matches!(entry.data_type, DataType::Bits(n) | DataType::SBits(n) | DataType::SMBits(n) if n == 0)
    {
        return Err(GatewayError::Spec(format!(
            "{}: BITS width must be > 0",
            entry.variable_name
        )));
    }
    if entry.write_mode.is_writable()
        && matches!(entry.data_type, DataType::Ascii | DataType::Hex)
    {
        return Err(GatewayError::Spec(format!(
            "{}: ASCII/HEX entries cannot be writable",
            entry.variable_name
        )));
    }
    Ok(())
}

/// Score how well a decoded `value` matches `entry`'s declared domain: used
/// both to gate a write before it reaches the device and, summed across a
/// probe set, to score how well a live device matches its configured
/// protocol. A code-table hit scores 1 (0 if the table exists but doesn't
/// recognize the value); ASCII scores its participating register count
/// when the value is non-empty, alnum-clean, and (if set) matches
/// `value_regex`; everything else scores 1 when it falls within
/// `value_min..=value_max` (or the enumerated allow-list), 0 otherwise, and
/// 1 when no domain was declared at all.
pub fn validate_registry_entry(spec: &ProtocolSpec, entry: &RegistryMapEntry, value: &str) -> i64 {
    if let Some(table) = spec.codes.get(&entry.codes_table_name()) {
        return if table.reverse_lookup(value).is_some() { 1 } else { 0 };
    }

    if entry.data_type == DataType::Ascii {
        if value.is_empty() {
            return 0;
        }
        if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ' ') {
            return 0;
        }
        if let ValueDomain::Regex(pattern) = &entry.values {
            if !matches_ascii_pattern(pattern, value) {
                return 0;
            }
        }
        return entry.concatenate_registers.len().max(1) as i64;
    }

    match &entry.values {
        ValueDomain::Range { min, max } => match value.parse::<i64>() {
            Ok(v) if v >= *min && v <= *max => 1,
            _ => 0,
        },
        ValueDomain::Enum(values) => match value.parse::<i64>() {
            Ok(v) if values.contains(&v) => 1,
            _ => 0,
        },
        ValueDomain::Regex(pattern) => {
            if matches_ascii_pattern(pattern, value) {
                1
            } else {
                0
            }
        }
        ValueDomain::None => 1,
    }
}

/// A narrow, hand-rolled matcher covering the `^[...]$` bracket-class
/// patterns these protocol maps actually use — not a general regex engine.
fn matches_ascii_pattern(pattern: &str, value: &str) -> bool {
    let inner = pattern.trim_start_matches('^').trim_end_matches('$');
    if !inner.starts_with('[') {
        return true;
    }
    let Some(class_end) = inner.rfind(']') else { return true };
    let class = &inner[1..class_end];
    let negate = class.starts_with('^');
    let class = class.strip_prefix('^').unwrap_or(class);
    let ranges = parse_char_ranges(class);
    value.chars().all(|c| ranges.iter().any(|(a, b)| c >= *a && c <= *b) != negate)
}

fn parse_char_ranges(class: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = class.chars().collect();
    let mut ranges = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if i + 2 < chars.len() && chars[i + 1] == '-' {
            ranges.push((chars[i], chars[i + 2]));
            i += 3;
        } else {
            ranges.push((chars[i], chars[i]));
            i += 1;
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::types::WriteMode;
    use std::cell::Cell;

    fn entry(data_type: DataType, register: u32, write_mode: WriteMode) -> RegistryMapEntry {
        RegistryMapEntry {
            variable_name: "test_var".into(),
            documented_name: None,
            data_type,
            data_type_size: None,
            data_byteorder: None,
            register,
            register_bit: 0,
            register_byte: 0,
            registry_type: RegistryType::Holding,
            write_mode,
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

    fn spec_with(entries: Vec<RegistryMapEntry>) -> ProtocolSpec {
        ProtocolSpec {
            name: "t".into(),
            codes: Default::default(),
            registry_map: entries,
            batch_size: 45,
            default_byteorder: Byteorder::Big,
            default_read_interval_ms: 1000,
        }
    }

    #[test]
    fn process_registry_decodes_present_entries() {
        let spec = spec_with(vec![entry(DataType::UShort, 10, WriteMode::Read)]);
        let mut snap = RegisterSnapshot::new();
        snap.insert_range(RegistryType::Holding, 10, &[77]);
        let out = process_registry(&spec, &snap);
        assert_eq!(out.get("test_var").unwrap(), "77");
    }

    #[test]
    fn process_registry_skips_missing_registers() {
        let spec = spec_with(vec![entry(DataType::UShort, 10, WriteMode::Read)]);
        let snap = RegisterSnapshot::new();
        let out = process_registry(&spec, &snap);
        assert!(out.is_empty());
    }

    #[test]
    fn process_registry_applies_unit_mod() {
        let mut e = entry(DataType::UShort, 19, WriteMode::Read);
        e.unit_mod = 0.01;
        let spec = spec_with(vec![e]);
        let mut snap = RegisterSnapshot::new();
        snap.insert_range(RegistryType::Holding, 19, &[1200]);
        let out = process_registry(&spec, &snap);
        assert_eq!(out.get("test_var").unwrap(), "12.0");
    }

    #[test]
    fn process_registry_renders_flags_with_codes() {
        let mut e = entry(DataType::Flags16, 32, WriteMode::Read);
        e.variable_name = "status".into();
        let mut codes = std::collections::HashMap::new();
        let mut table = CodeTable { name: "status_codes".into(), entries: Default::default(), bit_entries: Default::default() };
        table.bit_entries.insert(vec![0], "ok".into());
        table.bit_entries.insert(vec![2], "alarm".into());
        codes.insert("status_codes".into(), table);
        let mut spec = spec_with(vec![e]);
        spec.codes = codes;
        let mut snap = RegisterSnapshot::new();
        snap.insert_range(RegistryType::Holding, 32, &[0x0005]);
        let out = process_registry(&spec, &snap);
        assert_eq!(out.get("status").unwrap(), "ok,alarm");
    }

    #[test]
    fn process_registry_joins_concatenated_ascii() {
        let mut e = entry(DataType::Ascii, 100, WriteMode::Read);
        e.variable_name = "serial".into();
        e.concatenate = true;
        e.concatenate_registers = vec![100, 101, 102, 103, 104];
        let spec = spec_with(vec![e]);
        let mut snap = RegisterSnapshot::new();
        let words: Vec<u16> = "HNOOB_24\0\0".bytes().collect::<Vec<u8>>()
            .chunks(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        snap.insert_range(RegistryType::Holding, 100, &words);
        let out = process_registry(&spec, &snap);
        assert_eq!(out.get("serial").unwrap(), "HNOOB_24");
    }

    #[test]
    fn write_variable_rejects_read_only() {
        let e = entry(DataType::UShort, 10, WriteMode::Read);
        assert!(write_variable(&e, 1, None).is_err());
    }

    #[test]
    fn write_variable_bitfield_merges_existing_bits() {
        let e = entry(DataType::Bits(4), 10, WriteMode::Write);
        let mut snap = RegisterSnapshot::new();
        snap.insert_range(RegistryType::Holding, 10, &[0b1111_0000_0000_0000]);
        let writes = write_variable(&e, 0b0101, Some(&snap)).unwrap();
        assert_eq!(writes, vec![(RegistryType::Holding, 10, 0b1111_0000_0000_0101)]);
    }

    #[test]
    fn write_variable_bitfield_shifts_by_register_bit() {
        let mut e = entry(DataType::Bits(4), 40, WriteMode::Write);
        e.register_bit = 4;
        let mut snap = RegisterSnapshot::new();
        snap.insert_range(RegistryType::Holding, 40, &[0x00F0]);
        let writes = write_variable(&e, 3, Some(&snap)).unwrap();
        assert_eq!(writes, vec![(RegistryType::Holding, 40, 0x0030)]);
    }

    #[test]
    fn validate_rejects_writable_ascii() {
        let e = entry(DataType::Ascii, 10, WriteMode::Write);
        assert!(validate_entry_shape(&e).is_err());
    }

    #[test]
    fn validate_registry_entry_checks_range() {
        let mut e = entry(DataType::UShort, 10, WriteMode::Write);
        e.values = ValueDomain::Range { min: 0, max: 100 };
        let spec = spec_with(vec![]);
        assert_eq!(validate_registry_entry(&spec, &e, "50"), 1);
        assert_eq!(validate_registry_entry(&spec, &e, "500"), 0);
    }
}
