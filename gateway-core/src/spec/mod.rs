pub mod codec;
pub mod loader;
pub mod types;

pub use codec::{coalesce_hi_lo, decode, decode_bytes, encode, RawValue};
pub use loader::ProtocolSpec;
pub use types::{
    Byteorder, CodeTable, DataType, ReadRange, RegistryMapEntry, RegistryType, ValueDomain, WriteMode,
};
