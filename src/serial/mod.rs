//! Serial Transport (C2): a mutex-guarded half-duplex Modbus RTU channel.
//!
//! Protocol, mirrored exactly from the field controller's original transaction
//! routine: acquire the lock, flush the receive buffer, write the frame, sleep
//! 20 ms for inter-frame silence, then read in chunks of up to 256 bytes,
//! treating a 30 ms gap with no new bytes as end-of-frame, aborting the whole
//! read after `read_timeout` with no bytes at all.

pub mod utils;

use crate::config::SerialConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const INTER_FRAME_GAP: Duration = Duration::from_millis(20);
const IDLE_GAP: Duration = Duration::from_millis(30);
const CHUNK_SIZE: usize = 256;

/// Abstracts the serial transaction so the rest of the gateway (and its
/// tests) can run against a fake transport with no physical port attached.
#[async_trait]
pub trait Transact: Send + Sync {
    async fn transact(&self, frame: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

pub struct SerialTransport {
    port: Arc<Mutex<Box<dyn serialport::SerialPort>>>,
    read_timeout: Duration,
}

impl SerialTransport {
    pub fn open(cfg: &SerialConfig) -> Result<Self, TransportError> {
        let port = serialport::new(&cfg.port, cfg.baud)
            .data_bits(utils::to_serialport_data_bits(cfg.bytesize))
            .stop_bits(utils::to_serialport_stop_bits(cfg.stopbits))
            .parity(utils::parity_str_to_serialport(&cfg.parity))
            .timeout(IDLE_GAP)
            .open()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(SerialTransport {
            port: Arc::new(Mutex::new(port)),
            read_timeout: Duration::from_secs_f64(cfg.read_timeout_s),
        })
    }

    fn transact_blocking(
        port: Arc<Mutex<Box<dyn serialport::SerialPort>>>,
        frame: Vec<u8>,
        read_timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut guard = port.lock().map_err(|_| TransportError::Disconnected("poisoned".to_string()))?;

        guard.clear(serialport::ClearBuffer::Input).ok();
        guard.write_all(&frame).map_err(|e| TransportError::Io(e.to_string()))?;
        guard.flush().map_err(|e| TransportError::Io(e.to_string()))?;

        std::thread::sleep(INTER_FRAME_GAP);

        let deadline = Instant::now() + read_timeout;
        let mut response = Vec::new();
        let mut buf = [0u8; CHUNK_SIZE];

        loop {
            if Instant::now() >= deadline {
                break;
            }
            match guard.read(&mut buf) {
                Ok(0) => {
                    if !response.is_empty() {
                        break;
                    }
                }
                Ok(n) => {
                    response.extend_from_slice(&buf[..n]);
                    std::thread::sleep(IDLE_GAP);
                    // A further read attempt with nothing pending signals
                    // end-of-frame; peek by trying one more non-blocking-ish read.
                    match guard.bytes_to_read() {
                        Ok(0) => break,
                        _ => continue,
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if !response.is_empty() {
                        break;
                    }
                }
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }

        if response.is_empty() {
            return Err(TransportError::NoResponse {
                slave: frame.first().copied().unwrap_or(0),
                timeout_ms: read_timeout.as_millis() as u64,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Transact for SerialTransport {
    async fn transact(&self, frame: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        trace!(tx = %hex::encode(&frame), "serial frame out");
        let port = self.port.clone();
        let timeout = self.read_timeout;
        let result = tokio::task::spawn_blocking(move || Self::transact_blocking(port, frame, timeout))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        match &result {
            Ok(bytes) => {
                debug!(len = bytes.len(), "serial transaction completed");
                trace!(rx = %hex::encode(bytes), "serial frame in");
            }
            Err(e) => warn!(error = %e, "serial transaction failed"),
        }
        result
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex as AsyncMutex;

    /// A canned-response transport for exercising C3/C7/C8 without a real port.
    pub struct FakeTransport {
        pub responses: AsyncMutex<VecDeque<Result<Vec<u8>, TransportError>>>,
        pub sent: AsyncMutex<Vec<Vec<u8>>>,
    }

    impl FakeTransport {
        pub fn new(responses: Vec<Result<Vec<u8>, TransportError>>) -> Self {
            FakeTransport {
                responses: AsyncMutex::new(responses.into()),
                sent: AsyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transact for FakeTransport {
        async fn transact(&self, frame: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            self.sent.lock().await.push(frame.clone());
            self.responses
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::NoResponse { slave: frame[0], timeout_ms: 1000 }))
        }
    }
}
