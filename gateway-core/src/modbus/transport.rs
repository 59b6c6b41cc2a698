use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{GatewayError, Result};
use crate::modbus::frame::{self, FC_READ_HOLDING, FC_READ_INPUT};

/// One physical or logical link a [`super::engine::ModbusEngine`] can issue
/// requests over. Implementations exchange raw PDUs; framing (RTU's CRC16
/// vs TCP/UDP/TLS's MBAP header) is handled per-transport because the two
/// ADU shapes are incompatible at the byte level.
#[async_trait]
pub trait ModbusTransport: Send {
    async fn connect(&mut self) -> Result<()>;
    async fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    async fn read_holding_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>>;
    async fn read_input_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>>;
    async fn write_single_register(&mut self, addr: u16, value: u16) -> Result<()>;
}

/// Concrete link kinds a `[transport.*]` config section can select, enum
/// dispatched rather than boxed because `async fn` in traits isn't
/// dyn-compatible without further boxing gymnastics.
pub enum ModbusLink {
    Rtu(RtuLink),
    Tcp(TcpLink),
    Udp(UdpLink),
    Tls(TlsLink),
}

#[async_trait]
impl ModbusTransport for ModbusLink {
    async fn connect(&mut self) -> Result<()> {
        match self {
            ModbusLink::Rtu(l) => l.connect().await,
            ModbusLink::Tcp(l) => l.connect().await,
            ModbusLink::Udp(l) => l.connect().await,
            ModbusLink::Tls(l) => l.connect().await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            ModbusLink::Rtu(l) => l.disconnect().await,
            ModbusLink::Tcp(l) => l.disconnect().await,
            ModbusLink::Udp(l) => l.disconnect().await,
            ModbusLink::Tls(l) => l.disconnect().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            ModbusLink::Rtu(l) => l.is_connected(),
            ModbusLink::Tcp(l) => l.is_connected(),
            ModbusLink::Udp(l) => l.is_connected(),
            ModbusLink::Tls(l) => l.is_connected(),
        }
    }

    async fn read_holding_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>> {
        match self {
            ModbusLink::Rtu(l) => l.read_holding_registers(addr, count).await,
            ModbusLink::Tcp(l) => l.read_holding_registers(addr, count).await,
            ModbusLink::Udp(l) => l.read_holding_registers(addr, count).await,
            ModbusLink::Tls(l) => l.read_holding_registers(addr, count).await,
        }
    }

    async fn read_input_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>> {
        match self {
            ModbusLink::Rtu(l) => l.read_input_registers(addr, count).await,
            ModbusLink::Tcp(l) => l.read_input_registers(addr, count).await,
            ModbusLink::Udp(l) => l.read_input_registers(addr, count).await,
            ModbusLink::Tls(l) => l.read_input_registers(addr, count).await,
        }
    }

    async fn write_single_register(&mut self, addr: u16, value: u16) -> Result<()> {
        match self {
            ModbusLink::Rtu(l) => l.write_single_register(addr, value).await,
            ModbusLink::Tcp(l) => l.write_single_register(addr, value).await,
            ModbusLink::Udp(l) => l.write_single_register(addr, value).await,
            ModbusLink::Tls(l) => l.write_single_register(addr, value).await,
        }
    }
}

pub struct RtuLink {
    pub port: String,
    pub baud_rate: u32,
    pub unit_id: u8,
    stream: Option<tokio_serial::SerialStream>,
}

impl RtuLink {
    pub fn new(port: String, baud_rate: u32, unit_id: u8) -> Self {
        Self {
            port,
            baud_rate,
            unit_id,
            stream: None,
        }
    }

    async fn roundtrip(&mut self, pdu: Vec<u8>, function: u8) -> Result<Vec<u8>> {
        let adu = frame::build_rtu_adu(self.unit_id, &pdu);
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        stream.write_all(&adu).await?;
        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await?;
        buf.truncate(n);
        if buf.len() < 4 {
            return Err(GatewayError::Protocol("RTU response too short".into()));
        }
        let (body, crc_bytes) = buf.split_at(buf.len() - 2);
        let expected_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        if frame::crc16(body) != expected_crc {
            return Err(GatewayError::Protocol("RTU CRC mismatch".into()));
        }
        let _ = function;
        Ok(body[1..].to_vec())
    }
}

#[async_trait]
impl ModbusTransport for RtuLink {
    async fn connect(&mut self) -> Result<()> {
        use tokio_serial::SerialPortBuilderExt;
        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .timeout(Duration::from_secs(2))
            .open_native_async()
            .map_err(|e| GatewayError::TransientIo(std::io::Error::other(e)))?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.stream = None;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_holding_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>> {
        let pdu = frame::build_read_pdu(FC_READ_HOLDING, addr, count);
        let resp = self.roundtrip(pdu, FC_READ_HOLDING).await?;
        frame::parse_read_response(FC_READ_HOLDING, &resp)
    }

    async fn read_input_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>> {
        let pdu = frame::build_read_pdu(FC_READ_INPUT, addr, count);
        let resp = self.roundtrip(pdu, FC_READ_INPUT).await?;
        frame::parse_read_response(FC_READ_INPUT, &resp)
    }

    async fn write_single_register(&mut self, addr: u16, value: u16) -> Result<()> {
        let pdu = frame::build_write_single_pdu(addr, value);
        let resp = self.roundtrip(pdu, frame::FC_WRITE_SINGLE).await?;
        frame::parse_write_response(&resp)
    }
}

pub struct TcpLink {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    transaction_id: u16,
    stream: Option<TcpStream>,
}

impl TcpLink {
    pub fn new(host: String, port: u16, unit_id: u8) -> Self {
        Self {
            host,
            port,
            unit_id,
            transaction_id: 0,
            stream: None,
        }
    }

    async fn roundtrip(&mut self, pdu: Vec<u8>) -> Result<Vec<u8>> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let adu = frame::build_mbap_adu(self.transaction_id, self.unit_id, &pdu);
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        stream.write_all(&adu).await?;
        let mut header = [0u8; 7];
        stream.read_exact(&mut header).await?;
        let len = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut body = vec![0u8; len.saturating_sub(1)];
        stream.read_exact(&mut body).await?;
        Ok(body)
    }
}

#[async_trait]
impl ModbusTransport for TcpLink {
    async fn connect(&mut self) -> Result<()> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.stream = None;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_holding_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>> {
        let pdu = frame::build_read_pdu(FC_READ_HOLDING, addr, count);
        let resp = self.roundtrip(pdu).await?;
        frame::parse_read_response(FC_READ_HOLDING, &resp)
    }

    async fn read_input_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>> {
        let pdu = frame::build_read_pdu(FC_READ_INPUT, addr, count);
        let resp = self.roundtrip(pdu).await?;
        frame::parse_read_response(FC_READ_INPUT, &resp)
    }

    async fn write_single_register(&mut self, addr: u16, value: u16) -> Result<()> {
        let pdu = frame::build_write_single_pdu(addr, value);
        let resp = self.roundtrip(pdu).await?;
        frame::parse_write_response(&resp)
    }
}

pub struct UdpLink {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    transaction_id: u16,
    socket: Option<UdpSocket>,
}

impl UdpLink {
    pub fn new(host: String, port: u16, unit_id: u8) -> Self {
        Self {
            host,
            port,
            unit_id,
            transaction_id: 0,
            socket: None,
        }
    }

    async fn roundtrip(&mut self, pdu: Vec<u8>) -> Result<Vec<u8>> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let adu = frame::build_mbap_adu(self.transaction_id, self.unit_id, &pdu);
        let socket = self.socket.as_ref().ok_or_else(not_connected)?;
        socket.send(&adu).await?;
        let mut buf = vec![0u8; 300];
        let n = socket.recv(&mut buf).await?;
        buf.truncate(n);
        if buf.len() < 7 {
            return Err(GatewayError::Protocol("UDP Modbus response too short".into()));
        }
        Ok(buf[7..].to_vec())
    }
}

#[async_trait]
impl ModbusTransport for UdpLink {
    async fn connect(&mut self) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((self.host.as_str(), self.port)).await?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.socket = None;
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn read_holding_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>> {
        let pdu = frame::build_read_pdu(FC_READ_HOLDING, addr, count);
        let resp = self.roundtrip(pdu).await?;
        frame::parse_read_response(FC_READ_HOLDING, &resp)
    }

    async fn read_input_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>> {
        let pdu = frame::build_read_pdu(FC_READ_INPUT, addr, count);
        let resp = self.roundtrip(pdu).await?;
        frame::parse_read_response(FC_READ_INPUT, &resp)
    }

    async fn write_single_register(&mut self, addr: u16, value: u16) -> Result<()> {
        let pdu = frame::build_write_single_pdu(addr, value);
        let resp = self.roundtrip(pdu).await?;
        frame::parse_write_response(&resp)
    }
}

pub struct TlsLink {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    transaction_id: u16,
    stream: Option<TlsStream<TcpStream>>,
}

impl TlsLink {
    pub fn new(host: String, port: u16, unit_id: u8) -> Self {
        Self {
            host,
            port,
            unit_id,
            transaction_id: 0,
            stream: None,
        }
    }

    fn connector() -> Result<TlsConnector> {
        let mut roots = tokio_rustls::rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = tokio_rustls::rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(TlsConnector::from(std::sync::Arc::new(config)))
    }

    async fn roundtrip(&mut self, pdu: Vec<u8>) -> Result<Vec<u8>> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let adu = frame::build_mbap_adu(self.transaction_id, self.unit_id, &pdu);
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        stream.write_all(&adu).await?;
        let mut header = [0u8; 7];
        stream.read_exact(&mut header).await?;
        let len = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut body = vec![0u8; len.saturating_sub(1)];
        stream.read_exact(&mut body).await?;
        Ok(body)
    }
}

#[async_trait]
impl ModbusTransport for TlsLink {
    async fn connect(&mut self) -> Result<()> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let connector = Self::connector()?;
        let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(self.host.clone())
            .map_err(|e| GatewayError::Config(format!("invalid TLS server name: {e}")))?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(GatewayError::TransientIo)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.stream = None;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_holding_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>> {
        let pdu = frame::build_read_pdu(FC_READ_HOLDING, addr, count);
        let resp = self.roundtrip(pdu).await?;
        frame::parse_read_response(FC_READ_HOLDING, &resp)
    }

    async fn read_input_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>> {
        let pdu = frame::build_read_pdu(FC_READ_INPUT, addr, count);
        let resp = self.roundtrip(pdu).await?;
        frame::parse_read_response(FC_READ_INPUT, &resp)
    }

    async fn write_single_register(&mut self, addr: u16, value: u16) -> Result<()> {
        let pdu = frame::build_write_single_pdu(addr, value);
        let resp = self.roundtrip(pdu).await?;
        frame::parse_write_response(&resp)
    }
}

fn not_connected() -> GatewayError {
    GatewayError::Unrecoverable("Modbus transport used before connect()".into())
}
