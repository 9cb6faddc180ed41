//! Modbus RTU frame encode/decode (C1).
//!
//! Builds request frames for FC03 (read holding), FC04 (read input),
//! FC06 (write single) and FC16 (write multiple), and parses responses,
//! verifying the trailing CRC and surfacing exception responses.

pub mod crc;

use crate::error::TransportError;

pub const FC_READ_HOLDING: u8 = 0x03;
pub const FC_READ_INPUT: u8 = 0x04;
pub const FC_WRITE_SINGLE: u8 = 0x06;
pub const FC_WRITE_MULTIPLE: u8 = 0x10;
const EXCEPTION_BIT: u8 = 0x80;

/// A parsed, CRC-verified RTU frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub slave: u8,
    pub function_code: u8,
    pub payload: Vec<u8>,
}

/// Result of `verify_frame`: either a normal response or a Modbus exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifiedFrame {
    Ok(ParsedFrame),
    Exception { slave: u8, function_code: u8, exception_code: u8 },
}

pub fn build_read_holding(slave: u8, addr: u16, count: u16) -> Vec<u8> {
    build_read(slave, FC_READ_HOLDING, addr, count)
}

pub fn build_read_input(slave: u8, addr: u16, count: u16) -> Vec<u8> {
    build_read(slave, FC_READ_INPUT, addr, count)
}

fn build_read(slave: u8, fc: u8, addr: u16, count: u16) -> Vec<u8> {
    let mut frame = vec![slave, fc, (addr >> 8) as u8, addr as u8, (count >> 8) as u8, count as u8];
    crc::append_crc(&mut frame);
    frame
}

pub fn build_write_single(slave: u8, addr: u16, value: u16) -> Vec<u8> {
    let mut frame = vec![
        slave,
        FC_WRITE_SINGLE,
        (addr >> 8) as u8,
        addr as u8,
        (value >> 8) as u8,
        value as u8,
    ];
    crc::append_crc(&mut frame);
    frame
}

pub fn build_write_multiple(slave: u8, addr: u16, values: &[u16]) -> Vec<u8> {
    let count = values.len() as u16;
    let byte_count = (count * 2) as u8;
    let mut frame = vec![
        slave,
        FC_WRITE_MULTIPLE,
        (addr >> 8) as u8,
        addr as u8,
        (count >> 8) as u8,
        count as u8,
        byte_count,
    ];
    for v in values {
        frame.push((v >> 8) as u8);
        frame.push(*v as u8);
    }
    crc::append_crc(&mut frame);
    frame
}

/// Verifies length and CRC, then distinguishes a normal PDU from an
/// exception response (function byte with the high bit set).
pub fn verify_frame(bytes: &[u8]) -> Result<VerifiedFrame, TransportError> {
    if bytes.len() < 5 {
        return Err(TransportError::ShortFrame(bytes.len()));
    }
    if !crc::validate_crc(bytes) {
        return Err(TransportError::CrcMismatch(bytes[0]));
    }
    let slave = bytes[0];
    let fc_byte = bytes[1];
    let body = &bytes[2..bytes.len() - 2];
    if fc_byte & EXCEPTION_BIT != 0 {
        let exception_code = body.first().copied().unwrap_or(0);
        return Ok(VerifiedFrame::Exception {
            slave,
            function_code: fc_byte & !EXCEPTION_BIT,
            exception_code,
        });
    }
    Ok(VerifiedFrame::Ok(ParsedFrame {
        slave,
        function_code: fc_byte,
        payload: body.to_vec(),
    }))
}

/// Packs a signed 32-bit value into big-endian `(hi, lo)` registers.
pub fn s32_to_regs(value: i32) -> (u16, u16) {
    let bits = value as u32;
    (((bits >> 16) & 0xFFFF) as u16, (bits & 0xFFFF) as u16)
}

/// Reassembles a signed 32-bit value from big-endian `(hi, lo)` registers.
pub fn regs_to_s32(hi: u16, lo: u16) -> i32 {
    let bits = ((hi as u32) << 16) | (lo as u32);
    bits as i32
}

/// Extracts the two or more data registers following an FC03/FC04 byte-count
/// prefix (`payload[0]` is the byte count, registers follow big-endian).
pub fn regs_from_read_payload(payload: &[u8]) -> Vec<u16> {
    if payload.is_empty() {
        return Vec::new();
    }
    let byte_count = payload[0] as usize;
    let data = &payload[1..];
    let n = byte_count.min(data.len()) / 2;
    (0..n).map(|i| ((data[i * 2] as u16) << 8) | data[i * 2 + 1] as u16).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s32_round_trips_full_range() {
        for x in [i32::MIN, i32::MIN + 1, -1, 0, 1, 5000, i32::MAX - 1, i32::MAX] {
            let (hi, lo) = s32_to_regs(x);
            assert_eq!(regs_to_s32(hi, lo), x);
        }
    }

    #[test]
    fn build_write_multiple_matches_move_abs_scenario() {
        // S1: MOVE_ABS(5000, 8000) -> [0x0000, 0x1388, 0x0000, 0x1F40]
        let (pos_hi, pos_lo) = s32_to_regs(5000);
        let (speed_hi, speed_lo) = s32_to_regs(8000);
        let values = [pos_hi, pos_lo, speed_hi, speed_lo];
        assert_eq!(values, [0x0000, 0x1388, 0x0000, 0x1F40]);
        let frame = build_write_multiple(2, 0x0020, &values);
        assert_eq!(frame[0], 2);
        assert_eq!(frame[1], FC_WRITE_MULTIPLE);
        assert!(crc::validate_crc(&frame));
    }

    #[test]
    fn verify_frame_rejects_short_input() {
        assert!(matches!(verify_frame(&[0x01, 0x03]), Err(TransportError::ShortFrame(2))));
    }

    #[test]
    fn verify_frame_detects_exception_response() {
        let mut frame = vec![0x02, FC_READ_HOLDING | 0x80, 0x02];
        crc::append_crc(&mut frame);
        match verify_frame(&frame).unwrap() {
            VerifiedFrame::Exception { slave, function_code, exception_code } => {
                assert_eq!(slave, 2);
                assert_eq!(function_code, FC_READ_HOLDING);
                assert_eq!(exception_code, 0x02);
            }
            _ => panic!("expected exception"),
        }
    }

    #[test]
    fn verify_frame_parses_read_holding_response() {
        let mut frame = vec![0x01, FC_READ_HOLDING, 0x04, 0x00, 0x01, 0x00, 0x02];
        crc::append_crc(&mut frame);
        match verify_frame(&frame).unwrap() {
            VerifiedFrame::Ok(parsed) => {
                assert_eq!(parsed.function_code, FC_READ_HOLDING);
                let regs = regs_from_read_payload(&parsed.payload);
                assert_eq!(regs, vec![1, 2]);
            }
            _ => panic!("expected ok"),
        }
    }
}
