use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unsupported protocol version: expected {expected:#04x}, got {actual:#04x}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Unknown command kind: {0:#04x}")]
    UnknownCommandKind(u8),

    #[error("Unknown code {code} for {field}")]
    UnknownCode { field: &'static str, code: u8 },

    #[error("Frame truncated")]
    Truncated,

    #[error("Invalid UTF-8 in string field")]
    InvalidString,

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}
