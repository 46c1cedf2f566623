use thiserror::Error;

/// Transit protocol error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("message schema error: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("no reachable peer")]
    NoUsableHint,

    #[error("relay did not accept the handshake")]
    RelayHandshakeFailed,

    #[error("invalid transit handshake")]
    InvalidHandshake,

    #[error("record decryption failed")]
    DecryptionFailed,

    #[error("digest mismatch: expected {expected}, got {got}")]
    DigestMismatch { expected: String, got: String },

    #[error("connection closed mid-record")]
    UnexpectedEof,

    #[error("record of {len} bytes exceeds the {max} byte limit")]
    RecordTooLarge { len: usize, max: usize },

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer cancelled")]
    Cancelled,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
