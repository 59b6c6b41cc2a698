#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod expr;
pub mod modbus;
pub mod processor;
pub mod sinks;
pub mod spec;
pub mod supervisor;
pub mod telemetry;
pub mod transports;

pub use config::{load_from_path, GatewayConfig, TransportConfig};
pub use error::{GatewayError, Result};
pub use spec::{
    Byteorder, CodeTable, DataType, ProtocolSpec, ReadRange, RegistryMapEntry, RegistryType,
    ValueDomain, WriteMode,
};
pub use supervisor::Supervisor;
