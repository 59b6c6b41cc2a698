use std::cell::Cell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::expr;
use crate::spec::types::{
    Byteorder, CodeTable, DataType, ReadRange, RegistryMapEntry, RegistryType, ValueDomain, WriteMode,
};

/// A fully loaded, decoded protocol: code tables plus the register map(s)
/// they annotate, one map per register bank.
#[derive(Debug, Clone)]
pub struct ProtocolSpec {
    pub name: String,
    pub codes: HashMap<String, CodeTable>,
    pub registry_map: Vec<RegistryMapEntry>,
    pub batch_size: u16,
    pub default_byteorder: Byteorder,
    pub default_read_interval_ms: u64,
}

impl Default for ProtocolSpec {
    fn default() -> Self {
        ProtocolSpec {
            name: String::new(),
            codes: HashMap::new(),
            registry_map: Vec::new(),
            batch_size: 45,
            default_byteorder: Byteorder::Big,
            default_read_interval_ms: 5000,
        }
    }
}

impl ProtocolSpec {
    pub fn entry(&self, variable_name: &str) -> Option<&RegistryMapEntry> {
        self.registry_map
            .iter()
            .find(|e| e.variable_name == variable_name)
    }

    /// Load a protocol directory: `<name>.json` (settings + `*_codes` tables),
    /// one register-map CSV per bank (`<name>.registry_map.csv` for `ZERO`,
    /// `<name>.holding_registry_map.csv`, `<name>.input_registry_map.csv`),
    /// each with an optional `<map>.override.csv` sibling, plus
    /// `variable_mask.txt`/`variable_screen.txt` name filters.
    ///
    /// `transport_batch_size`/`transport_default_interval_s` are the
    /// transport's configured defaults; a `batch_size` or
    /// `default_read_interval_ms` key in the protocol's JSON settings takes
    /// precedence when present.
    pub fn load_from_dir<P: AsRef<Path>>(
        dir: P,
        transport_batch_size: u16,
        transport_default_interval_s: u64,
    ) -> Result<ProtocolSpec> {
        let dir = dir.as_ref();
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let json_path = dir.join(format!("{name}.json"));
        let (mut codes, settings) = if json_path.exists() {
            load_codes_json(&json_path)?
        } else {
            (HashMap::new(), Value::Object(serde_json::Map::new()))
        };

        let batch_size = read_setting_u16(&settings, "batch_size").unwrap_or(transport_batch_size);
        let default_byteorder = read_setting_str(&settings, "byteorder")
            .and_then(|s| Byteorder::from_str_loose(&s))
            .unwrap_or_default();
        let default_read_interval_ms = read_setting_u64(&settings, "default_read_interval_ms")
            .unwrap_or(transport_default_interval_s.saturating_mul(1000));

        let mut registry_map = Vec::new();
        for (registry_type, filename) in [
            (RegistryType::Zero, format!("{name}.registry_map.csv")),
            (RegistryType::Holding, format!("{name}.holding_registry_map.csv")),
            (RegistryType::Input, format!("{name}.input_registry_map.csv")),
        ] {
            let Some(path) = resolve_map_file(dir, &name, &filename) else {
                continue;
            };
            let mut bank_entries =
                load_registry_csv(&path, registry_type, &mut codes, default_read_interval_ms)?;

            let override_path = override_path_for(&path);
            if override_path.exists() {
                let overrides = load_registry_csv(
                    &override_path,
                    registry_type,
                    &mut codes,
                    default_read_interval_ms,
                )?;
                apply_overrides(&mut bank_entries, overrides);
            }

            coalesce_hi_lo_pairs(&mut bank_entries);
            registry_map.extend(bank_entries);
        }

        let mask_path = dir.join("variable_mask.txt");
        if mask_path.exists() {
            let mask = load_variable_filter(&mask_path)?;
            if !mask.is_empty() {
                registry_map.retain(|e| names_intersect(e, &mask));
            }
        }
        let screen_path = dir.join("variable_screen.txt");
        if screen_path.exists() {
            let screen = load_variable_filter(&screen_path)?;
            if !screen.is_empty() {
                registry_map.retain(|e| !names_intersect(e, &screen));
            }
        }

        Ok(ProtocolSpec {
            name,
            codes,
            registry_map,
            batch_size,
            default_byteorder,
            default_read_interval_ms,
        })
    }

    /// Build the read plan for the next poll cycle. Sweeps each register
    /// bank's address space in fixed, non-merging windows of `batch_size`
    /// registers; within a window, an entry is included when `init` is true
    /// or its `next_read_timestamp` has elapsed, and every included entry's
    /// `next_read_timestamp` advances to `now_ms + read_interval_ms`.
    ///
    /// Called fresh before every poll (not cached) so that entries with
    /// long `read_interval_ms` values fall out of the plan on cycles where
    /// they aren't due, instead of inflating every read.
    pub fn calculate_read_ranges(&self, batch_size: u16, init: bool, now_ms: u64) -> Vec<ReadRange> {
        let batch_size = batch_size.max(1) as u32;

        let mut max_register_by_bank: BTreeMap<RegistryType, u32> = BTreeMap::new();
        for e in &self.registry_map {
            if !is_readable_for_planning(e) {
                continue;
            }
            let end = e.register + e.register_span() as u32 - 1;
            let slot = max_register_by_bank.entry(e.registry_type).or_insert(0);
            *slot = (*slot).max(end);
        }

        let mut ranges = Vec::new();
        for (bank, max_register) in max_register_by_bank {
            let mut window_start = 0u32;
            while window_start <= max_register {
                let window_end = window_start + batch_size - 1;
                let mut lo: Option<u32> = None;
                let mut hi = 0u32;

                for e in &self.registry_map {
                    if e.registry_type != bank || !is_readable_for_planning(e) {
                        continue;
                    }
                    if e.register < window_start || e.register > window_end {
                        continue;
                    }
                    let due = init || e.next_read_timestamp.get() < now_ms;
                    if !due {
                        continue;
                    }
                    e.next_read_timestamp.set(now_ms + e.read_interval_ms);
                    let end = e.register + e.register_span() as u32 - 1;
                    lo = Some(lo.map_or(e.register, |l| l.min(e.register)));
                    hi = hi.max(end);
                }

                if let Some(start) = lo {
                    ranges.push(ReadRange {
                        registry_type: bank,
                        start,
                        length: (hi - start + 1) as u16,
                    });
                }
                window_start += batch_size;
            }
        }
        ranges
    }
}

fn is_readable_for_planning(e: &RegistryMapEntry) -> bool {
    !matches!(e.write_mode, WriteMode::ReadDisabled | WriteMode::WriteOnly)
}

fn names_intersect(e: &RegistryMapEntry, set: &HashSet<String>) -> bool {
    set.contains(&e.variable_name) || e.documented_name.as_deref().is_some_and(|d| set.contains(d))
}

/// `p.registry_map.csv` resolves, in order: the exact path under `dir`;
/// `dir/<prefix>/<file>` where `prefix` is `name` up to its first `_`;
/// finally a recursive search under `dir`.
fn resolve_map_file(dir: &Path, name: &str, filename: &str) -> Option<PathBuf> {
    let exact = dir.join(filename);
    if exact.exists() {
        return Some(exact);
    }
    let prefix = name.split('_').next().unwrap_or(name);
    let prefixed = dir.join(prefix).join(filename);
    if prefixed.exists() {
        return Some(prefixed);
    }
    find_recursive(dir, filename)
}

fn find_recursive(dir: &Path, filename: &str) -> Option<PathBuf> {
    let rd = fs::read_dir(dir).ok()?;
    let mut subdirs = Vec::new();
    for entry in rd.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_file() && path.file_name().map(|n| n == filename).unwrap_or(false) {
            return Some(path);
        }
        if path.is_dir() {
            subdirs.push(path);
        }
    }
    subdirs.iter().find_map(|sub| find_recursive(sub, filename))
}

fn override_path_for(map_path: &Path) -> PathBuf {
    let stem = map_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = stem.strip_suffix(".csv").unwrap_or(&stem);
    map_path.with_file_name(format!("{base}.override.csv"))
}

fn apply_overrides(base: &mut Vec<RegistryMapEntry>, overrides: Vec<RegistryMapEntry>) {
    for over in overrides {
        let matched = base.iter_mut().find(|e| {
            (over.documented_name.is_some() && e.documented_name == over.documented_name)
                || e.register == over.register
        });
        match matched {
            Some(existing) => merge_override(existing, &over),
            None => base.push(over),
        }
    }
}

fn merge_override(existing: &mut RegistryMapEntry, over: &RegistryMapEntry) {
    if !over.variable_name.is_empty() {
        existing.variable_name = over.variable_name.clone();
    }
    if over.documented_name.is_some() {
        existing.documented_name = over.documented_name.clone();
    }
    existing.data_type = over.data_type;
    existing.data_type_size = over.data_type_size.or(existing.data_type_size);
    existing.data_byteorder = over.data_byteorder.or(existing.data_byteorder);
    existing.register = over.register;
    existing.register_bit = over.register_bit;
    existing.register_byte = over.register_byte;
    existing.write_mode = over.write_mode;
    if over.unit.is_some() {
        existing.unit = over.unit.clone();
    }
    existing.unit_mod = over.unit_mod;
    if over.values != ValueDomain::None {
        existing.values = over.values.clone();
    }
    existing.read_interval_ms = over.read_interval_ms;
}

fn load_variable_filter(path: &Path) -> Result<HashSet<String>> {
    let content = fs::read_to_string(path)
        .map_err(|e| GatewayError::Spec(format!("reading {}: {e}", path.display())))?;
    Ok(content
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.to_string())
        .collect())
}

fn read_setting_str(settings: &Value, key: &str) -> Option<String> {
    settings.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn read_setting_u64(settings: &Value, key: &str) -> Option<u64> {
    settings.get(key).and_then(|v| v.as_u64())
}

fn read_setting_u16(settings: &Value, key: &str) -> Option<u16> {
    settings.get(key).and_then(|v| v.as_u64()).map(|v| v as u16)
}

/// Parses `p.json`, splitting top-level keys into `*_codes` tables and
/// everything else ("settings" — `byteorder`, `batch_size`,
/// `default_read_interval_ms`).
fn load_codes_json(path: &Path) -> Result<(HashMap<String, CodeTable>, Value)> {
    let content = fs::read_to_string(path)
        .map_err(|e| GatewayError::Spec(format!("reading {}: {e}", path.display())))?;
    let value: Value = serde_json::from_str(&content)
        .map_err(|e| GatewayError::Spec(format!("parsing {}: {e}", path.display())))?;

    let Value::Object(top) = value else {
        return Err(GatewayError::Spec(format!(
            "{}: expected a top-level JSON object",
            path.display()
        )));
    };

    let mut codes = HashMap::new();
    let mut settings = serde_json::Map::new();
    for (key, entries) in top {
        if key.ends_with("_codes") {
            if let Value::Object(obj) = entries {
                codes.insert(key.clone(), build_code_table(key, obj));
            }
        } else {
            settings.insert(key, entries);
        }
    }
    Ok((codes, Value::Object(settings)))
}

fn build_code_table(name: String, obj: serde_json::Map<String, Value>) -> CodeTable {
    let mut table = CodeTable {
        name,
        entries: BTreeMap::new(),
        bit_entries: BTreeMap::new(),
    };
    for (k, v) in obj {
        let text = match v {
            Value::String(s) => s,
            other => other.to_string(),
        };
        if let Some(bits) = CodeTable::parse_bit_token(&k) {
            table.bit_entries.insert(bits, text);
        } else if let Ok(code) = k.parse::<i64>() {
            table.entries.insert(code, text);
        }
    }
    table
}

/// Detects `;` vs `,` as the field delimiter by inspecting the header line.
fn detect_delimiter(first_line: &str) -> u8 {
    let semicolons = first_line.matches(';').count();
    let commas = first_line.matches(',').count();
    if commas > semicolons {
        b','
    } else {
        b';'
    }
}

fn load_registry_csv(
    path: &Path,
    registry_type: RegistryType,
    codes: &mut HashMap<String, CodeTable>,
    default_read_interval_ms: u64,
) -> Result<Vec<RegistryMapEntry>> {
    let content = fs::read_to_string(path)
        .map_err(|e| GatewayError::Spec(format!("reading {}: {e}", path.display())))?;
    let delimiter = content.lines().next().map(detect_delimiter).unwrap_or(b';');

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| GatewayError::Spec(format!("{}: {e}", path.display())))?
        .iter()
        .map(|h| h.to_ascii_lowercase().trim().replace('_', " "))
        .collect();

    let col = |name: &str| headers.iter().position(|h| h == name);

    let i_register = col("register").ok_or_else(|| missing_col("register", path))?;
    let i_variable = col("variable name");
    let i_documented = col("documented name");
    let i_unit = col("unit");
    let i_values = col("values");
    let i_dtype = col("data type");
    let i_interval = col("read interval");
    let i_read_command = col("read command");
    let i_write = col("write").or_else(|| col("writable"));

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| GatewayError::Spec(format!("{}: {e}", path.display())))?;
        let get = |i: Option<usize>| i.and_then(|i| record.get(i)).unwrap_or("").trim();

        let documented_raw = get(i_documented);
        let documented_name = if documented_raw.is_empty() {
            None
        } else {
            Some(normalize_name(documented_raw))
        };
        let variable_raw = get(i_variable);
        let variable_name = if variable_raw.is_empty() {
            documented_name.clone().unwrap_or_default()
        } else {
            normalize_name(variable_raw)
        };
        if variable_name.is_empty() || !is_valid_name(&variable_name) {
            tracing::warn!(raw = %variable_raw, "skipping row with invalid variable name");
            continue;
        }

        let Some(parsed_register) = parse_register_cell(get(Some(i_register))) else {
            tracing::warn!(variable = %variable_name, "skipping row with unparseable register cell");
            continue;
        };

        let (data_type, data_byteorder, data_type_size) = i_dtype
            .map(|_| get(i_dtype))
            .and_then(parse_data_type_cell)
            .unwrap_or((DataType::UShort, None, None));

        let (unit, unit_mod) = i_unit.map(|_| parse_unit_cell(get(i_unit))).unwrap_or((None, 1.0));

        let code_table_key = documented_name.clone().unwrap_or_else(|| variable_name.clone());
        let values = i_values
            .map(|_| parse_values_cell(get(i_values), &code_table_key, codes))
            .unwrap_or(ValueDomain::None);

        let read_command = i_read_command.map(|_| get(i_read_command)).and_then(parse_read_command);

        let read_interval_ms = i_interval
            .map(|_| parse_read_interval_ms(get(i_interval), default_read_interval_ms))
            .unwrap_or(default_read_interval_ms);

        let write_mode = i_write.map(|_| WriteMode::from_str_loose(get(i_write))).unwrap_or(WriteMode::Read);

        if parsed_register.concatenate_registers.len() > 1 {
            for &register in &parsed_register.concatenate_registers {
                out.push(RegistryMapEntry {
                    variable_name: variable_name.clone(),
                    documented_name: documented_name.clone(),
                    data_type,
                    data_type_size,
                    data_byteorder,
                    register,
                    register_bit: 0,
                    register_byte: 0,
                    registry_type,
                    write_mode,
                    concatenate: true,
                    concatenate_registers: parsed_register.concatenate_registers.clone(),
                    unit: unit.clone(),
                    unit_mod,
                    values: values.clone(),
                    read_command: read_command.clone(),
                    read_interval_ms,
                    next_read_timestamp: Cell::new(0),
                });
            }
        } else {
            out.push(RegistryMapEntry {
                variable_name,
                documented_name,
                data_type,
                data_type_size,
                data_byteorder,
                register: parsed_register.register,
                register_bit: parsed_register.register_bit,
                register_byte: parsed_register.register_byte,
                registry_type,
                write_mode,
                concatenate: false,
                concatenate_registers: Vec::new(),
                unit,
                unit_mod,
                values,
                read_command,
                read_interval_ms,
                next_read_timestamp: Cell::new(0),
            });
        }
    }
    Ok(out)
}

fn missing_col(name: &str, path: &Path) -> GatewayError {
    GatewayError::Spec(format!("{}: missing required column {name}", path.display()))
}

fn normalize_name(s: &str) -> String {
    s.trim().to_ascii_lowercase().replace([' ', '-'], "_")
}

fn is_valid_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

struct ParsedRegister {
    register: u32,
    register_bit: u8,
    register_byte: u8,
    concatenate_registers: Vec<u32>,
}

/// Parses a `register` cell in one of three forms: `N.bM` (bit `M` of
/// register `N`), `N.M` (byte `M` of register `N`), or `[r]A[-~]B` (an
/// inclusive, optionally reversed, register range implying concatenation).
/// Falls back to a plain decimal or `x`/`0x`-prefixed hex register.
fn parse_register_cell(s: &str) -> Option<ParsedRegister> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(dot_b) = s.find(".b") {
        let register = parse_int_cell(&s[..dot_b])?;
        let bit = s[dot_b + 2..].parse::<u8>().ok()?;
        return Some(ParsedRegister {
            register,
            register_bit: bit,
            register_byte: 0,
            concatenate_registers: Vec::new(),
        });
    }

    let (reversed, body) = match s.strip_prefix('r') {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => (true, rest),
        _ => (false, s),
    };
    if let Some(sep) = body.find(['-', '~']) {
        if let (Some(a), Some(b)) = (
            parse_register_bound(&body[..sep]),
            parse_register_bound(&body[sep + 1..]),
        ) {
            let mut regs: Vec<u32> = (a..=b).collect();
            if reversed {
                regs.reverse();
            }
            if let Some(&register) = regs.first() {
                return Some(ParsedRegister {
                    register,
                    register_bit: 0,
                    register_byte: 0,
                    concatenate_registers: regs,
                });
            }
        }
    }

    if let Some((n_part, m_part)) = s.split_once('.') {
        if let (Some(n), Ok(m)) = (parse_int_cell(n_part), m_part.parse::<u8>()) {
            return Some(ParsedRegister {
                register: n,
                register_bit: 0,
                register_byte: m,
                concatenate_registers: Vec::new(),
            });
        }
    }

    let register = parse_register_bound(s)?;
    Some(ParsedRegister {
        register,
        register_bit: 0,
        register_byte: 0,
        concatenate_registers: Vec::new(),
    })
}

/// A register-cell bound: a literal (decimal or `x`/`0x` hex, via
/// [`parse_int_cell`]) or, failing that, an inline arithmetic expression
/// (`(2*100)+1`) evaluated by [`expr::evaluate`] — the sandboxed
/// replacement for the original tooling's `eval()`-based register
/// templating.
fn parse_register_bound(s: &str) -> Option<u32> {
    parse_int_cell(s).or_else(|| expr::evaluate(s).ok().and_then(|v| u32::try_from(v).ok()))
}

fn parse_int_cell(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return parse_hex_padded(hex);
    }
    if let Some(hex) = s.strip_prefix('x').or_else(|| s.strip_prefix('X')) {
        return parse_hex_padded(hex);
    }
    s.parse().ok()
}

fn parse_hex_padded(hex: &str) -> Option<u32> {
    let padded = if hex.len() % 2 == 1 { format!("0{hex}") } else { hex.to_string() };
    u32::from_str_radix(&padded, 16).ok()
}

/// Parses a `data type` cell: `<TYPE>` or `<TYPE>.<length>`, with an
/// optional trailing `_LE`/`_BE` byte-order override.
pub fn parse_data_type_cell(cell: &str) -> Option<(DataType, Option<Byteorder>, Option<u16>)> {
    let upper = cell.trim().to_ascii_uppercase();
    let (upper, byteorder) = if let Some(base) = upper.strip_suffix("_LE") {
        (base.to_string(), Some(Byteorder::Little))
    } else if let Some(base) = upper.strip_suffix("_BE") {
        (base.to_string(), Some(Byteorder::Big))
    } else {
        (upper, None)
    };

    let (base, len) = match upper.split_once('.') {
        Some((b, l)) => (b.to_string(), l.trim().parse::<u16>().ok()),
        None => (upper.clone(), None),
    };

    let data_type = match base.as_str() {
        "" => DataType::UShort,
        "BYTE" | "UINT8" => DataType::Byte,
        "USHORT" | "UINT16" => DataType::UShort,
        "UINT" | "UINT32" => DataType::UInt,
        "SHORT" | "INT16" => DataType::Short,
        "INT" | "INT32" => DataType::Int,
        "FLAGS8" => DataType::Flags8,
        "FLAGS16" => DataType::Flags16,
        "FLAGS32" => DataType::Flags32,
        "ASCII" => DataType::Ascii,
        "HEX" => DataType::Hex,
        "BITS" => DataType::Bits(len.unwrap_or(1) as u8),
        "SBITS" => DataType::SBits(len.unwrap_or(1) as u8),
        "SMBITS" => DataType::SMBits(len.unwrap_or(2) as u8),
        _ => return None,
    };

    let data_type_size = match data_type {
        DataType::Ascii | DataType::Hex => Some(len.unwrap_or(1)),
        _ => None,
    };

    Some((data_type, byteorder, data_type_size))
}

/// Parses a `unit` cell. A cell containing `or` or `:` is treated as an
/// opaque unit symbol with multiplier `1`; otherwise the leading numeric
/// substring becomes `unit_mod` (zero is treated as `1`) and the remaining
/// alphanumeric tail is the unit symbol.
fn parse_unit_cell(cell: &str) -> (Option<String>, f64) {
    let cell = cell.trim();
    if cell.is_empty() {
        return (None, 1.0);
    }
    if cell.contains("or") || cell.contains(':') {
        return (Some(cell.to_string()), 1.0);
    }

    let chars: Vec<char> = cell.chars().collect();
    let mut i = 0;
    if i < chars.len() && chars[i] == '-' {
        i += 1;
    }
    let digits_start = i;
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    if i == digits_start {
        return (Some(cell.to_string()), 1.0);
    }

    let num_str: String = chars[..i].iter().collect();
    let unit_mod = num_str.parse::<f64>().unwrap_or(1.0);
    let unit_mod = if unit_mod == 0.0 { 1.0 } else { unit_mod };
    let symbol: String = chars[i..].iter().collect();
    let symbol = symbol.trim();
    let unit = if symbol.is_empty() { None } else { Some(symbol.to_string()) };
    (unit, unit_mod)
}

/// Parses a `values` cell per the register map's values grammar: a `{`
/// anywhere in the cell tries JSON (installed as `<documented_name>_codes`
/// and scored purely by code-table lookup thereafter); a `,` tries a
/// comma-separated enum list with inline `A-B` ranges; a bare `A-B`/`A~B`
/// becomes a min/max range; a `^[...]$` cell becomes an ASCII regex; a
/// single bare integer becomes a one-value enum.
fn parse_values_cell(cell: &str, code_table_key: &str, codes: &mut HashMap<String, CodeTable>) -> ValueDomain {
    let cell = cell.trim();
    if cell.is_empty() {
        return ValueDomain::None;
    }

    if cell.contains('{') {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(cell) {
            let table_name = format!("{code_table_key}_codes");
            codes.entry(table_name.clone()).or_insert_with(|| build_code_table(table_name.clone(), obj));
            return ValueDomain::None;
        }
    }

    if cell.contains(',') {
        let mut values = Vec::new();
        for tok in cell.split(',') {
            let tok = tok.trim();
            if let Some((a, b)) = tok.split_once('-') {
                if let (Ok(a), Ok(b)) = (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
                    values.extend(a..=b);
                    continue;
                }
            }
            if let Ok(v) = tok.parse::<i64>() {
                values.push(v);
            }
        }
        return ValueDomain::Enum(values);
    }

    if let Some(sep) = cell.find(['-', '~']) {
        if sep > 0 {
            if let (Ok(min), Ok(max)) = (
                cell[..sep].trim().parse::<i64>(),
                cell[sep + 1..].trim().parse::<i64>(),
            ) {
                return ValueDomain::Range { min, max };
            }
        }
    }

    if cell.starts_with('^') && cell.ends_with('$') {
        return ValueDomain::Regex(cell.to_string());
    }

    if let Ok(v) = cell.parse::<i64>() {
        return ValueDomain::Enum(vec![v]);
    }

    ValueDomain::None
}

fn parse_read_command(cell: &str) -> Option<Vec<u8>> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    if let Some(hex) = cell.strip_prefix('x').or_else(|| cell.strip_prefix('X')) {
        return decode_hex_bytes(hex);
    }
    Some(cell.as_bytes().to_vec())
}

fn decode_hex_bytes(hex: &str) -> Option<Vec<u8>> {
    let padded = if hex.len() % 2 == 1 { format!("0{hex}") } else { hex.to_string() };
    let bytes = padded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for chunk in bytes.chunks(2) {
        let s = std::str::from_utf8(chunk).ok()?;
        out.push(u8::from_str_radix(s, 16).ok()?);
    }
    Some(out)
}

/// Parses a `read interval` cell as `<value><unit>`, `unit` ∈ `{x, s, ms}`.
/// `x` multiplies `default_ms`; `s` (or no unit at all) is whole seconds;
/// `ms` is milliseconds. A missing or zero value keeps `default_ms`.
fn parse_read_interval_ms(cell: &str, default_ms: u64) -> u64 {
    let cell = cell.trim();
    if cell.is_empty() {
        return default_ms;
    }
    let split_at = cell.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(cell.len());
    let (num_part, unit) = cell.split_at(split_at);
    let Ok(n) = num_part.trim().parse::<f64>() else {
        return default_ms;
    };
    if n == 0.0 {
        return default_ms;
    }
    match unit.to_ascii_lowercase().as_str() {
        "x" => (n * default_ms as f64) as u64,
        "ms" => n as u64,
        "s" | "" => (n * 1000.0) as u64,
        _ => default_ms,
    }
}

/// Traverses the accumulated list in reverse; when an entry's
/// `documented_name` ends in `_l` and the immediately preceding entry's
/// `documented_name` is the same base with `_h`, the preceding entry
/// absorbs the successor (widened to `UINT` when both were the default
/// `USHORT`, or to the successor's type otherwise) and the successor row
/// is dropped. The merged entry keeps the `_h` entry's register as its
/// base, so its normal two-register decode produces the 32-bit value.
fn coalesce_hi_lo_pairs(entries: &mut Vec<RegistryMapEntry>) {
    let mut i = entries.len();
    while i > 1 {
        i -= 1;
        let Some(cur_doc) = entries[i].documented_name.clone() else { continue };
        let Some(base) = cur_doc.strip_suffix("_l").map(|s| s.to_string()) else { continue };
        let Some(prev_doc) = entries[i - 1].documented_name.clone() else { continue };
        if prev_doc != format!("{base}_h") {
            continue;
        }

        let successor_type = entries[i].data_type;
        entries.remove(i);
        let prev = &mut entries[i - 1];
        prev.data_type = if prev.data_type == DataType::UShort {
            if successor_type == DataType::UShort { DataType::UInt } else { successor_type }
        } else {
            prev.data_type
        };
        prev.documented_name = Some(base.clone());
        prev.variable_name = base;
    }
}

pub fn default_spec_dirs(root: &Path) -> Vec<PathBuf> {
    fs::read_dir(root)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn parse_unit_cell_extracts_multiplier_and_symbol() {
        assert_eq!(parse_unit_cell("0.01kWh"), (Some("kWh".into()), 0.01));
        assert_eq!(parse_unit_cell("V"), (Some("V".into()), 1.0));
        assert_eq!(parse_unit_cell("1:1 or direct"), (Some("1:1 or direct".into()), 1.0));
        assert_eq!(parse_unit_cell(""), (None, 1.0));
    }

    #[test]
    fn parse_register_cell_recognizes_bit_byte_and_range_forms() {
        let bit = parse_register_cell("40.b4").unwrap();
        assert_eq!((bit.register, bit.register_bit), (40, 4));

        let byte = parse_register_cell("10.2").unwrap();
        assert_eq!((byte.register, byte.register_byte), (10, 2));

        let range = parse_register_cell("100-104").unwrap();
        assert_eq!(range.concatenate_registers, vec![100, 101, 102, 103, 104]);

        let reversed = parse_register_cell("r100-102").unwrap();
        assert_eq!(reversed.concatenate_registers, vec![102, 101, 100]);

        let hex = parse_register_cell("0x1A").unwrap();
        assert_eq!(hex.register, 0x1A);
    }

    #[test]
    fn parse_values_cell_handles_every_grammar_form() {
        let mut codes = HashMap::new();
        assert_eq!(parse_values_cell("0-100", "v", &mut codes), ValueDomain::Range { min: 0, max: 100 });
        assert_eq!(
            parse_values_cell("1,3,5-7", "v", &mut codes),
            ValueDomain::Enum(vec![1, 3, 5, 6, 7])
        );
        assert_eq!(parse_values_cell("^[A-Z0-9]$", "v", &mut codes), ValueDomain::Regex("^[A-Z0-9]$".into()));
        assert_eq!(parse_values_cell(r#"{"0":"off","1":"on"}"#, "relay", &mut codes), ValueDomain::None);
        assert!(codes.contains_key("relay_codes"));
    }

    #[test]
    fn load_from_dir_decodes_freq_with_unit_mod() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            &dir.path().join(format!("{}.holding_registry_map.csv", dir.path().file_name().unwrap().to_string_lossy())),
            "register;variable name;documented name;unit;values;data type;read interval;write\n19;freq_hz;freq_hz;0.01Hz;;USHORT;;R\n",
        );
        let proto_name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        let spec = ProtocolSpec::load_from_dir(dir.path(), 45, 5).unwrap();
        assert_eq!(spec.name, proto_name);
        let entry = spec.entry("freq_hz").unwrap();
        assert_eq!(entry.register, 19);
        assert!((entry.unit_mod - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn calculate_read_ranges_respects_init_and_interval_gating() {
        let mut entries = Vec::new();
        for (register, interval) in [(5u32, 1000u64), (300, 60000)] {
            entries.push(RegistryMapEntry {
                variable_name: format!("r{register}"),
                documented_name: None,
                data_type: DataType::UShort,
                data_type_size: None,
                data_byteorder: None,
                register,
                register_bit: 0,
                register_byte: 0,
                registry_type: RegistryType::Holding,
                write_mode: WriteMode::Read,
                concatenate: false,
                concatenate_registers: Vec::new(),
                unit: None,
                unit_mod: 1.0,
                values: ValueDomain::None,
                read_command: None,
                read_interval_ms: interval,
                next_read_timestamp: Cell::new(0),
            });
        }
        let spec = ProtocolSpec {
            name: "t".into(),
            codes: HashMap::new(),
            registry_map: entries,
            batch_size: 45,
            default_byteorder: Byteorder::Big,
            default_read_interval_ms: 1000,
        };

        let initial = spec.calculate_read_ranges(45, true, 0);
        assert_eq!(initial.len(), 2);
        assert_eq!(spec.entry("r5").unwrap().next_read_timestamp.get(), 1000);
        assert_eq!(spec.entry("r300").unwrap().next_read_timestamp.get(), 60000);

        let later = spec.calculate_read_ranges(45, false, 1500);
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].start, 5);
        assert_eq!(spec.entry("r300").unwrap().next_read_timestamp.get(), 60000);
    }
}
