pub mod engine;
pub mod frame;
pub mod transport;

pub use engine::{ModbusEngine, WritePolicy};
pub use transport::{ModbusLink, ModbusTransport, RtuLink, TcpLink, TlsLink, UdpLink};
