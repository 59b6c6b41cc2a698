//! Modbus PDU encoding/decoding and the two ADU framings (RTU's CRC16
//! trailer, TCP/UDP/TLS's MBAP header) built on top of it.

use crate::error::{GatewayError, Result};

pub const FC_READ_HOLDING: u8 = 0x03;
pub const FC_READ_INPUT: u8 = 0x04;
pub const FC_WRITE_SINGLE: u8 = 0x06;

/// Modbus CRC16, polynomial 0xA001, initialized to 0xFFFF, transmitted
/// little-endian in the RTU trailer.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

pub fn build_read_pdu(function: u8, start: u16, count: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function);
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    pdu
}

pub fn build_write_single_pdu(addr: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FC_WRITE_SINGLE);
    pdu.extend_from_slice(&addr.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

pub fn build_rtu_adu(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(pdu.len() + 3);
    adu.push(unit_id);
    adu.extend_from_slice(pdu);
    let crc = crc16(&adu);
    adu.extend_from_slice(&crc.to_le_bytes());
    adu
}

pub fn build_mbap_adu(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(pdu.len() + 7);
    adu.extend_from_slice(&transaction_id.to_be_bytes());
    adu.extend_from_slice(&[0x00, 0x00]); // protocol id, always 0 for Modbus
    let len = (pdu.len() + 1) as u16;
    adu.extend_from_slice(&len.to_be_bytes());
    adu.push(unit_id);
    adu.extend_from_slice(pdu);
    adu
}

/// Parse a response PDU for function 0x03/0x04 into its registers, or map
/// an exception response (function | 0x80) to a protocol error.
pub fn parse_read_response(function: u8, pdu: &[u8]) -> Result<Vec<u16>> {
    if pdu.is_empty() {
        return Err(GatewayError::Protocol("empty Modbus response".into()));
    }
    if pdu[0] == function | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(GatewayError::Protocol(format!(
            "Modbus exception 0x{code:02X} responding to function 0x{function:02X}"
        )));
    }
    if pdu[0] != function {
        return Err(GatewayError::Protocol(format!(
            "unexpected function code 0x{:02X}, expected 0x{function:02X}",
            pdu[0]
        )));
    }
    let byte_count = *pdu.get(1).ok_or_else(|| short_pdu())? as usize;
    let data = pdu.get(2..2 + byte_count).ok_or_else(short_pdu)?;
    Ok(data
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

pub fn parse_write_response(pdu: &[u8]) -> Result<()> {
    if pdu.is_empty() {
        return Err(GatewayError::Protocol("empty Modbus response".into()));
    }
    if pdu[0] == FC_WRITE_SINGLE | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(GatewayError::Protocol(format!(
            "Modbus exception 0x{code:02X} responding to a single-register write"
        )));
    }
    if pdu[0] != FC_WRITE_SINGLE || pdu.len() < 5 {
        return Err(GatewayError::Protocol("malformed write-single-register response".into()));
    }
    Ok(())
}

fn short_pdu() -> GatewayError {
    GatewayError::Protocol("truncated Modbus PDU".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_known_vector() {
        // Read holding registers, unit 1, addr 0, count 10
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        let crc = crc16(&frame);
        assert_eq!(crc, 0xC5CD);
    }

    #[test]
    fn parse_read_response_decodes_registers() {
        let pdu = [0x03, 0x04, 0x00, 0x01, 0x00, 0x02];
        let regs = parse_read_response(0x03, &pdu).unwrap();
        assert_eq!(regs, vec![1, 2]);
    }

    #[test]
    fn parse_read_response_detects_exception() {
        let pdu = [0x83, 0x02];
        assert!(parse_read_response(0x03, &pdu).is_err());
    }

    #[test]
    fn mbap_header_includes_unit_and_length() {
        let pdu = build_read_pdu(FC_READ_HOLDING, 0, 10);
        let adu = build_mbap_adu(7, 1, &pdu);
        assert_eq!(&adu[0..2], &[0x00, 0x07]);
        assert_eq!(adu[6], 1);
    }
}
