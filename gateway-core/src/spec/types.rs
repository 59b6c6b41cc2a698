use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;

/// Wire representation of a register's value.
///
/// `Short` decodes as a plain two's-complement `i16`, then flips the sign:
/// the field devices this crate targets publish negative readings with the
/// sign bit inverted relative to what they mean, so the raw two's-complement
/// value is negated once more to recover the intended reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Byte,
    UShort,
    UInt,
    Short,
    Int,
    Flags8,
    Flags16,
    Flags32,
    Ascii,
    Hex,
    Bits(u8),
    SBits(u8),
    SMBits(u8),
}

impl DataType {
    /// Number of bits this type occupies before any `register_bit` offset
    /// is taken into account. `Flags8`/`Flags16`/`Flags32` are windows of a
    /// fixed width; `Bits`/`SBits`/`SMBits` carry their own.
    pub fn bit_width(&self) -> u32 {
        match self {
            DataType::Flags8 => 8,
            DataType::Flags16 => 16,
            DataType::Flags32 => 32,
            DataType::Bits(n) | DataType::SBits(n) | DataType::SMBits(n) => *n as u32,
            _ => 0,
        }
    }

    fn from_base_and_len(base: &str, len: Option<u16>) -> Option<(DataType, bool)> {
        Some(match base {
            "BYTE" | "UINT8" => (DataType::Byte, false),
            "USHORT" | "UINT16" => (DataType::UShort, false),
            "UINT" | "UINT32" => (DataType::UInt, false),
            "SHORT" | "INT16" => (DataType::Short, false),
            "INT" | "INT32" => (DataType::Int, false),
            "FLAGS8" => (DataType::Flags8, false),
            "FLAGS16" => (DataType::Flags16, false),
            "FLAGS32" => (DataType::Flags32, false),
            "ASCII" => (DataType::Ascii, true),
            "HEX" => (DataType::Hex, true),
            "BITS" => (DataType::Bits(len.unwrap_or(1) as u8), false),
            "SBITS" => (DataType::SBits(len.unwrap_or(1) as u8), false),
            "SMBITS" => (DataType::SMBits(len.unwrap_or(2) as u8), false),
            _ => return None,
        })
    }

    /// Loose parser for a bare type token with no `.<length>` suffix, kept
    /// for the codes/settings JSON loader and tests. The CSV loader uses
    /// [`parse_data_type_cell`](crate::spec::loader::parse_data_type_cell)
    /// instead, which also understands the `<TYPE>.<length>` and
    /// `_LE`/`_BE` forms.
    pub fn from_str_loose(s: &str) -> Option<DataType> {
        let upper = s.trim().to_ascii_uppercase();
        DataType::from_base_and_len(&upper, None).map(|(dt, _)| dt)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Byte => write!(f, "BYTE"),
            DataType::UShort => write!(f, "USHORT"),
            DataType::UInt => write!(f, "UINT"),
            DataType::Short => write!(f, "SHORT"),
            DataType::Int => write!(f, "INT"),
            DataType::Flags8 => write!(f, "FLAGS8"),
            DataType::Flags16 => write!(f, "FLAGS16"),
            DataType::Flags32 => write!(f, "FLAGS32"),
            DataType::Ascii => write!(f, "ASCII"),
            DataType::Hex => write!(f, "HEX"),
            DataType::Bits(n) => write!(f, "BITS.{n}"),
            DataType::SBits(n) => write!(f, "SBITS.{n}"),
            DataType::SMBits(n) => write!(f, "SMBITS.{n}"),
        }
    }
}

/// Multi-register word order. Affects how `UInt`/`Int`/`Flags32` combine
/// two registers and how ASCII/HEX pack the two bytes of a single register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Byteorder {
    Big,
    Little,
}

impl Default for Byteorder {
    fn default() -> Self {
        Byteorder::Big
    }
}

impl Byteorder {
    pub fn from_str_loose(s: &str) -> Option<Byteorder> {
        match s.trim().to_ascii_lowercase().as_str() {
            "little" | "le" => Some(Byteorder::Little),
            "big" | "be" => Some(Byteorder::Big),
            _ => None,
        }
    }
}

/// Whether a registry entry may be read, written, both, or is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Read,
    ReadDisabled,
    Write,
    WriteOnly,
}

impl WriteMode {
    /// Unrecognized or blank cells default to `Read` rather than failing
    /// the row — most protocol maps leave the write column empty for the
    /// overwhelming majority of read-only registers.
    pub fn from_str_loose(s: &str) -> WriteMode {
        match s.trim().to_ascii_uppercase().as_str() {
            "RD" | "DISABLED" | "D" | "READDISABLED" | "READ_DISABLED" => WriteMode::ReadDisabled,
            "R/W" | "RW" | "W" | "YES" | "WRITE" => WriteMode::Write,
            "WO" | "WRITEONLY" | "WRITE_ONLY" => WriteMode::WriteOnly,
            _ => WriteMode::Read,
        }
    }

    pub fn is_readable(&self) -> bool {
        matches!(self, WriteMode::Read | WriteMode::Write)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, WriteMode::Write | WriteMode::WriteOnly)
    }
}

/// Modbus register bank a [`RegistryMapEntry`] lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegistryType {
    Zero,
    Holding,
    Input,
}

impl RegistryType {
    pub fn from_str_loose(s: &str) -> Option<RegistryType> {
        match s.trim().to_ascii_uppercase().as_str() {
            "0" | "ZERO" | "COIL" => Some(RegistryType::Zero),
            "HOLDING" | "H" | "4" => Some(RegistryType::Holding),
            "INPUT" | "I" | "3" => Some(RegistryType::Input),
            _ => None,
        }
    }
}

/// A named table of codes to human-readable strings, loaded from a
/// protocol's codes JSON file (or installed inline from a `values` cell).
///
/// Two kinds of key coexist: plain integer codes (`entries`, for enumerated
/// scalar types) and bit-position tokens (`bit_entries`, for `FLAGS*`
/// windows) — a single JSON key like `"b0"` or the composite `"b0&b2"`
/// names one or more bits that must all be set for the label to apply.
#[derive(Debug, Clone, Default)]
pub struct CodeTable {
    pub name: String,
    pub entries: BTreeMap<i64, String>,
    pub bit_entries: BTreeMap<Vec<u8>, String>,
}

impl CodeTable {
    pub fn lookup(&self, code: i64) -> Option<&str> {
        self.entries.get(&code).map(|s| s.as_str())
    }

    /// Find the integer code whose label matches `label` exactly, used by
    /// the write-safety validator to check a human-supplied value against
    /// an enumerated code table.
    pub fn reverse_lookup(&self, label: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|(_, v)| v.as_str() == label)
            .map(|(k, _)| *k)
    }

    /// Parse a JSON key as either a bit token (`"b0"`, `"b0&b2&b5"`) or a
    /// plain integer code, returning the bit positions (sorted) in the
    /// former case.
    pub fn parse_bit_token(key: &str) -> Option<Vec<u8>> {
        if !key.starts_with('b') {
            return None;
        }
        let mut bits = Vec::new();
        for part in key.split('&') {
            let part = part.trim().strip_prefix('b')?;
            bits.push(part.parse::<u8>().ok()?);
        }
        bits.sort_unstable();
        Some(bits)
    }
}

/// A register's allowed write/validation domain, parsed from a CSV `values`
/// cell. Distinct from [`CodeTable`]: this never produces a display label,
/// it only bounds what a write (or a protocol-score probe) considers valid.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ValueDomain {
    #[default]
    None,
    Enum(Vec<i64>),
    Range {
        min: i64,
        max: i64,
    },
    Regex(String),
}

/// One row of a protocol's register map: everything needed to read, decode,
/// and (if writable) encode a single named variable.
#[derive(Debug, Clone)]
pub struct RegistryMapEntry {
    pub variable_name: String,
    pub documented_name: Option<String>,
    pub data_type: DataType,
    /// Explicit register count for variable-width `ASCII`/`HEX` cells
    /// (the `.<length>` suffix); `None` means a single register.
    pub data_type_size: Option<u16>,
    /// Per-entry byteorder override; falls back to the protocol default
    /// when unset.
    pub data_byteorder: Option<Byteorder>,
    pub register: u32,
    /// Bit offset within the register for `BITS`/`SBITS`/`SMBITS`/`FLAGS*`
    /// windows (the `N.bM` register-cell form). Zero when not a bitfield.
    pub register_bit: u8,
    /// Byte offset within the register for byte-addressed transports (the
    /// `N.M` register-cell form, used by CAN/Pylon frame payloads rather
    /// than Modbus words).
    pub register_byte: u8,
    pub registry_type: RegistryType,
    pub write_mode: WriteMode,
    /// True for entries produced from a `[r]A-B` register-range cell; such
    /// entries share `variable_name` and `concatenate_registers` across
    /// every register in the range, and only the primary register (the
    /// first one in `concatenate_registers`) emits a value.
    pub concatenate: bool,
    pub concatenate_registers: Vec<u32>,
    pub unit: Option<String>,
    /// Multiplier applied to the decoded integer after unit-cell parsing;
    /// `1.0` when the unit cell carried no numeric prefix.
    pub unit_mod: f64,
    pub values: ValueDomain,
    pub read_command: Option<Vec<u8>>,
    /// Minimum interval, in milliseconds, between successive reads of this
    /// register in a non-initial read plan.
    pub read_interval_ms: u64,
    /// Scheduling bookkeeping for [`crate::spec::ProtocolSpec::calculate_read_ranges`];
    /// a `Cell` so ranging can take `&self` while still advancing each
    /// entry's next-eligible timestamp.
    pub next_read_timestamp: Cell<u64>,
}

impl RegistryMapEntry {
    /// Identity for range-planning / de-dup purposes: two entries that
    /// address the same register, bit, and byte are the same wire location
    /// even if their decoded names differ.
    pub fn identity(&self) -> (RegistryType, u32, u8, u8) {
        (self.registry_type, self.register, self.register_bit, self.register_byte)
    }

    pub fn effective_byteorder(&self, protocol_default: Byteorder) -> Byteorder {
        self.data_byteorder.unwrap_or(protocol_default)
    }

    /// Name of the code table this entry's decoded value is looked up in,
    /// by convention `<variable_name>_codes`.
    pub fn codes_table_name(&self) -> String {
        format!("{}_codes", self.variable_name)
    }

    /// Number of 16-bit registers this entry spans.
    pub fn register_span(&self) -> u16 {
        if self.concatenate && !self.concatenate_registers.is_empty() {
            return self.concatenate_registers.len() as u16;
        }
        match self.data_type {
            DataType::Byte | DataType::UShort | DataType::Short => 1,
            DataType::UInt | DataType::Int | DataType::Flags32 => 2,
            DataType::Ascii | DataType::Hex => self.data_type_size.unwrap_or(1).max(1),
            _ => {
                let width = self.register_bit as u32 + self.data_type.bit_width();
                (width.div_ceil(16) as u16).max(1)
            }
        }
    }
}

impl PartialEq for RegistryMapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}
impl Eq for RegistryMapEntry {}

impl std::hash::Hash for RegistryMapEntry {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

/// A contiguous, bounded run of registers that can be satisfied by a single
/// Modbus read request.
#[derive(Debug, Clone)]
pub struct ReadRange {
    pub registry_type: RegistryType,
    pub start: u32,
    pub length: u16,
}

impl ReadRange {
    pub fn end(&self) -> u32 {
        self.start + self.length as u32
    }
}
