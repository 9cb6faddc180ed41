//! TCP Server (C5): serves the Register Image to remote Modbus TCP masters.
//!
//! Framing is MBAP header (transaction id, protocol id, length, unit id)
//! followed by a PDU, hand-rolled the same way the RTU codec in [`crate::rtu`]
//! builds and parses frames directly rather than through a higher-level
//! Modbus crate, so the same function-code semantics and Register Image
//! error mapping are shared between the serial and TCP faces.

use crate::error::ProtocolError;
use crate::register_image::RegisterImage;
use crate::rtu::{FC_READ_HOLDING, FC_READ_INPUT, FC_WRITE_MULTIPLE, FC_WRITE_SINGLE};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const MBAP_HEADER_LEN: usize = 7;
const EXCEPTION_BIT: u8 = 0x80;
const ILLEGAL_FUNCTION: u8 = 0x01;

/// Accepts connections on an already-bound `listener` until `shutdown`
/// resolves, handling each client independently so one slow master cannot
/// stall another. The listener is bound by the caller (the composition
/// root) so a failure to bind is observed before any task is spawned.
pub async fn run(
    registers: Arc<RegisterImage>,
    listener: TcpListener,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Modbus TCP server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let registers = registers.clone();
                let mut conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    info!(%peer, "Modbus TCP client connected");
                    tokio::select! {
                        _ = handle_connection(stream, registers) => {}
                        _ = conn_shutdown.changed() => {}
                    }
                    info!(%peer, "Modbus TCP client disconnected");
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, registers: Arc<RegisterImage>) {
    let mut header = [0u8; MBAP_HEADER_LEN];
    loop {
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let unit_id = header[6];
        let remaining_len = u16::from_be_bytes([header[4], header[5]]) as usize;
        if remaining_len == 0 || remaining_len > 253 {
            return;
        }
        let mut pdu = vec![0u8; remaining_len - 1];
        if stream.read_exact(&mut pdu).await.is_err() {
            return;
        }

        let response_pdu = handle_pdu(&registers, &pdu);
        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + response_pdu.len());
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&[0, 0]); // protocol id
        frame.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
        frame.push(unit_id);
        frame.extend_from_slice(&response_pdu);

        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

fn handle_pdu(registers: &RegisterImage, pdu: &[u8]) -> Vec<u8> {
    if pdu.is_empty() {
        return exception(ILLEGAL_FUNCTION, ProtocolError::IllegalFunction.exception_code());
    }
    let function_code = pdu[0];
    match function_code {
        FC_READ_HOLDING | FC_READ_INPUT if pdu.len() >= 5 => {
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
            let count = u16::from_be_bytes([pdu[3], pdu[4]]);
            let result = if function_code == FC_READ_HOLDING {
                registers.read_holding(addr, count)
            } else {
                registers.read_input(addr, count)
            };
            match result {
                Ok(regs) => {
                    debug!(function_code, addr, count, "served read");
                    let mut pdu = vec![function_code, (regs.len() * 2) as u8];
                    for r in regs {
                        pdu.extend_from_slice(&r.to_be_bytes());
                    }
                    pdu
                }
                Err(e) => {
                    warn!(function_code, addr, error = %e, "read rejected");
                    exception(function_code, e.exception_code())
                }
            }
        }
        FC_WRITE_SINGLE if pdu.len() >= 5 => {
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
            let value = u16::from_be_bytes([pdu[3], pdu[4]]);
            match registers.write_single(addr, value) {
                Ok(()) => {
                    info!(addr, value, "HR write");
                    pdu.to_vec()
                }
                Err(e) => exception(function_code, e.exception_code()),
            }
        }
        FC_WRITE_MULTIPLE if pdu.len() >= 6 => {
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
            let count = u16::from_be_bytes([pdu[3], pdu[4]]) as usize;
            let byte_count = pdu[5] as usize;
            if pdu.len() < 6 + byte_count || byte_count != count * 2 {
                return exception(function_code, ProtocolError::IllegalValue.exception_code());
            }
            let values: Vec<u16> = pdu[6..6 + byte_count]
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            match registers.write_multiple(addr, &values) {
                Ok(()) => {
                    info!(addr, count, "HR multi-write");
                    vec![function_code, pdu[1], pdu[2], pdu[3], pdu[4]]
                }
                Err(e) => exception(function_code, e.exception_code()),
            }
        }
        _ => {
            warn!(function_code, "unsupported function code");
            exception(function_code, ProtocolError::IllegalFunction.exception_code())
        }
    }
}

fn exception(function_code: u8, exception_code: u8) -> Vec<u8> {
    vec![function_code | EXCEPTION_BIT, exception_code]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_image::HR_TARGET;

    #[test]
    fn read_holding_round_trips_through_pdu_handler() {
        let registers = RegisterImage::new();
        registers.write_single(HR_TARGET, 42).unwrap();
        let request = vec![FC_READ_HOLDING, 0x00, HR_TARGET as u8, 0x00, 0x01];
        let response = handle_pdu(&registers, &request);
        assert_eq!(response, vec![FC_READ_HOLDING, 0x02, 0x00, 0x2A]);
    }

    #[test]
    fn write_single_updates_register_image() {
        let registers = RegisterImage::new();
        let request = vec![FC_WRITE_SINGLE, 0x00, 0x08, 0x00, 0x01];
        let response = handle_pdu(&registers, &request);
        assert_eq!(response, request);
        assert_eq!(registers.mode(), 1);
    }

    #[test]
    fn unknown_function_code_returns_illegal_function() {
        let registers = RegisterImage::new();
        let response = handle_pdu(&registers, &[0x05]);
        assert_eq!(response, vec![0x05 | EXCEPTION_BIT, 0x01]);
    }

    #[test]
    fn out_of_range_read_returns_illegal_address() {
        let registers = RegisterImage::new();
        let request = vec![FC_READ_HOLDING, 0x00, 200, 0x00, 0x01];
        let response = handle_pdu(&registers, &request);
        assert_eq!(response, vec![FC_READ_HOLDING | EXCEPTION_BIT, 0x02]);
    }
}
