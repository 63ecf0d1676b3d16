use thiserror::Error;

use crate::chips::FuseKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Serial port {port} unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    #[error("Programmer handshake failed: {0}")]
    HandshakeFailed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    #[error("Timed out waiting for a response to {0}")]
    Timeout(String),

    #[error("Serial I/O failure: {0}")]
    IoFailure(String),

    #[error("Unexpected response {response:?} to {command}")]
    UnexpectedResponse { command: String, response: String },

    /// The adapter answered with its failure status (`1 <message>`)
    #[error("Programmer reported failure for {command}: {message}")]
    Rejected { command: String, message: String },

    #[error("Checksum mismatch on page {page}: received {received:#06x}, computed {computed:#06x}")]
    ChecksumMismatch {
        page: u16,
        received: u16,
        computed: u16,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Fuse value {value:#04x} is not valid for the {kind} fuse of {chip} (mask {mask:#04x})")]
    InvalidFuseValue {
        chip: &'static str,
        kind: FuseKind,
        value: u8,
        mask: u8,
    },

    #[error("Lock value {value:#04x} is not valid for {chip} (mask {mask:#04x})")]
    InvalidLockValue {
        chip: &'static str,
        value: u8,
        mask: u8,
    },

    #[error("Unknown chip: {0}")]
    UnknownChip(String),

    #[error("{chip} has no {kind} fuse")]
    UnsupportedFuse { chip: &'static str, kind: FuseKind },

    #[error("Signature {actual:02X?} does not match {chip} (expected one of {expected:02X?})")]
    SignatureMismatch {
        chip: &'static str,
        expected: Vec<[u8; 3]>,
        actual: [u8; 3],
    },

    #[error("Image address {address:#08x} is outside the {size} byte {memory} memory")]
    ImageOutOfRange {
        memory: &'static str,
        address: u32,
        size: u32,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HvppError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Another operation is already in progress on this session")]
    SessionBusy,

    #[error("Not connected to a programmer")]
    NotConnected,

    #[error("No chip selected")]
    NoChipSelected,

    /// The operation itself succeeded; only the closing `99` failed
    #[error("Operation completed but leaving programming mode failed: {0}")]
    LeaveProgModeFailed(CommError),

    #[error("Operation cancelled before it was sent")]
    Cancelled,

    #[error("Firmware error: {0}")]
    FirmwareError(String),
}

pub type HvppResult<T> = std::result::Result<T, HvppError>;
