//! Error types for baskets

use std::io;

use hyper::StatusCode;
use thiserror::Error;

/// Result type for basket operations
pub type Result<T> = std::result::Result<T, BasketsError>;

/// Errors that can occur in the basket engine
#[derive(Debug, Error)]
pub enum BasketsError {
    /// Basket name does not match the naming pattern
    #[error("Invalid basket name: {0}")]
    InvalidName(String),

    /// Basket name collides with a system path
    #[error("You cannot use system path as basket name: {0}")]
    ReservedName(String),

    /// Basket configuration is malformed or out of bounds
    #[error("Invalid basket configuration: {0}")]
    InvalidConfig(String),

    /// A basket with this name already exists
    #[error("Basket with name '{0}' already exists")]
    NameConflict(String),

    /// Basket does not exist
    #[error("Basket not found: {0}")]
    NotFound(String),

    /// Credential does not match the basket token or the master token
    #[error("Unauthorized access to basket: {0}")]
    Unauthorized(String),

    /// Payload exceeds the accepted size
    #[error("Data too large: {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge {
        /// Actual size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Relational backend error
    #[error("SQL error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Durable log corrupted (CRC mismatch)
    #[error("Log corrupted at offset {offset}: expected CRC {expected:#x}, got {actual:#x}")]
    CorruptedData {
        /// Offset of the corrupted frame
        offset: u64,
        /// Expected CRC32 value
        expected: u32,
        /// Actual CRC32 value
        actual: u32,
    },

    /// Stored bytes cannot be decoded
    #[error("Invalid storage format: {0}")]
    InvalidFormat(String),

    /// Server configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Relay to a forward URL failed
    #[error("Forwarding failed: {0}")]
    Forward(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl BasketsError {
    /// Whether the error rejects caller input (no state was changed)
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidName(_)
                | Self::ReservedName(_)
                | Self::InvalidConfig(_)
                | Self::DataTooLarge { .. }
        )
    }

    /// HTTP status the routing layer should answer with
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidName(_) => StatusCode::BAD_REQUEST,
            Self::ReservedName(_) => StatusCode::FORBIDDEN,
            Self::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NameConflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::DataTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
