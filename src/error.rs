//! Error types for the gateway.
//!
//! `thiserror` covers the structured, per-layer error families; `anyhow`
//! is used at the process composition root where causes are chained but
//! never matched on.

use thiserror::Error;

/// Transport-level failures on the serial link. These never propagate past
/// the device driver boundary as `Err` — they are folded into `online: false`
/// on the next Device Snapshot.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port '{0}' is not open")]
    Disconnected(String),

    #[error("no response from slave {slave} within {timeout_ms} ms")]
    NoResponse { slave: u8, timeout_ms: u64 },

    #[error("CRC mismatch in frame from slave {0}")]
    CrcMismatch(u8),

    #[error("frame too short ({0} bytes)")]
    ShortFrame(usize),

    #[error("underlying I/O error: {0}")]
    Io(String),
}

/// Modbus protocol exceptions, reported back to a remote master verbatim
/// as an exception response PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("illegal function")]
    IllegalFunction,
    #[error("illegal data address")]
    IllegalAddress,
    #[error("illegal data value")]
    IllegalValue,
}

impl ProtocolError {
    /// Standard Modbus exception code.
    pub fn exception_code(self) -> u8 {
        match self {
            ProtocolError::IllegalFunction => 0x01,
            ProtocolError::IllegalAddress => 0x02,
            ProtocolError::IllegalValue => 0x03,
        }
    }
}

/// Malformed or out-of-range input at a JSON or MANUAL-packet boundary.
/// Logged and dropped; never fatal.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unknown command type '{0}'")]
    UnknownType(String),
    #[error("field '{field}' out of range: {value}")]
    OutOfRange { field: String, value: i64 },
    #[error("missing required field '{0}'")]
    MissingField(String),
    #[error("malformed JSON: {0}")]
    Malformed(String),
}

/// Startup configuration failures. The only error family that is fatal:
/// a process that cannot parse its configuration or bind its sockets exits.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting '{field}': {reason}")]
    InvalidSetting { field: String, reason: String },
}

/// Umbrella error for the composition root, where causes are chained but
/// not matched on.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
}
