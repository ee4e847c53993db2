//! Protocol error types

use thiserror::Error;

/// Errors produced while encoding or decoding USB/IP frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// I/O error while reading or writing a frame
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer spoke a protocol version we do not understand
    #[error("unsupported protocol version {got:#06x} (expected {expected:#06x})")]
    VersionMismatch { got: u16, expected: u16 },

    /// Setup-phase operation code is not DEVLIST or IMPORT
    #[error("unknown operation code {0:#06x}")]
    UnknownOpCode(u16),

    /// URB header command is not one of the four defined commands
    #[error("unknown URB command {0:#010x}")]
    UnknownCommand(u32),

    /// Direction field was neither 0 (OUT) nor 1 (IN)
    #[error("invalid transfer direction {0}")]
    InvalidDirection(u32),

    /// Bus id text failed to parse
    #[error("invalid bus id {0:?}")]
    InvalidBusId(String),

    /// Speed value outside the Linux usb_device_speed enumeration
    #[error("invalid device speed {0}")]
    InvalidSpeed(u32),

    /// A value does not fit its fixed-width wire field
    #[error("value does not fit wire field {field}")]
    FieldOverflow { field: &'static str },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
