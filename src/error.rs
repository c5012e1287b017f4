use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, VaonisError>;

/// Coarse classification used by operators to tell bad input apart from a
/// rejecting or unreachable instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Nothing went over the wire, the caller supplied something unusable.
    Input,
    /// The instrument answered and refused the request.
    Rejected,
    /// The instrument could not be reached in time.
    Unreachable,
    /// Local I/O or decoding trouble.
    Local,
}

#[derive(Error, Debug)]
pub enum VaonisError {
    #[error("Challenge must contain a prefix character followed by a base64 payload")]
    InvalidChallenge,

    #[error("Unsupported Ed25519 key length: {len} bytes (expected 32 or 64)")]
    UnsupportedKeyLength { len: usize },

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Authorization key not found: {0}. Set VAONIS_AUTH_KEY_FILE or pass key material")]
    KeyMaterialNotFound(String),

    #[error("Key file path is outside allowed roots: {}", path.display())]
    PathNotAllowed { path: PathBuf },

    #[error("Unable to detect a working base URL (tried: {})", tried.join(", "))]
    BaseUrlNotDetected { tried: Vec<String> },

    #[error("Unknown operationId: {0}")]
    UnknownOperation(String),

    #[error("Invalid route manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid URL '{0}'")]
    InvalidUrl(String),

    #[error("HTTP {status} {status_text}: {body_excerpt}")]
    Http {
        status: u16,
        status_text: String,
        body_excerpt: String,
    },

    #[error("Request timed out")]
    Timeout,

    #[error("Response is not a recognizable image")]
    ImageSniffFailed,

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Status snapshot is missing field '{0}'")]
    MissingStatusField(&'static str),

    #[error("Command channel error: {0}")]
    Channel(String),

    #[error("Command channel is closed")]
    ChannelClosed,

    #[error("No acknowledgement for command #{id} before timeout")]
    AckTimeout { id: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VaonisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaonisError::InvalidChallenge
            | VaonisError::UnsupportedKeyLength { .. }
            | VaonisError::InvalidKeyMaterial(_)
            | VaonisError::KeyMaterialNotFound(_)
            | VaonisError::PathNotAllowed { .. }
            | VaonisError::UnknownOperation(_)
            | VaonisError::InvalidManifest(_)
            | VaonisError::InvalidUrl(_)
            | VaonisError::MissingStatusField(_) => ErrorKind::Input,
            VaonisError::Http { .. } | VaonisError::ImageSniffFailed => ErrorKind::Rejected,
            VaonisError::BaseUrlNotDetected { .. }
            | VaonisError::Timeout
            | VaonisError::Transport(_)
            | VaonisError::Channel(_)
            | VaonisError::ChannelClosed
            | VaonisError::AckTimeout { .. } => ErrorKind::Unreachable,
            VaonisError::Io(_) => ErrorKind::Local,
        }
    }

    /// Numeric HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            VaonisError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
