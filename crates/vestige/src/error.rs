//! Error types for address-space and object operations.

use thiserror::Error;
use vtypes::SchemaError;

/// One layer factory's reason for declining a construction attempt.
///
/// Rejections are expected outcomes of probing, not faults; they are
/// collected so a total resolution failure can report every candidate's
/// reason, never just the last one tried.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub layer: String,
    pub reason: String,
}

impl Rejection {
    pub fn new(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Rejection {
            layer: layer.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.layer, self.reason)
    }
}

/// Errors that can occur in address-space and object operations.
#[derive(Error, Debug)]
pub enum AsError {
    /// An address is not valid in the layer.
    #[error("Invalid address {invalid_address:#x} in layer '{layer_name}': {message}")]
    InvalidAddress {
        layer_name: String,
        invalid_address: u64,
        message: String,
    },

    /// A paged address is not valid (with page table entry information).
    #[error("Paged invalid address {invalid_address:#x} in layer '{layer_name}' (entry={entry:#x}, invalid_bits={invalid_bits}): {message}")]
    PagedInvalidAddress {
        layer_name: String,
        invalid_address: u64,
        invalid_bits: u32,
        entry: u64,
        message: String,
    },

    /// No candidate layer stack could be assembled from the image.
    #[error("No suitable address space mapping found. Tried to open image as:\n{}",
        .reasons.iter().map(|r| format!(" {}", r)).collect::<Vec<_>>().join("\n"))]
    NoAddressSpace { reasons: Vec<Rejection> },

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid parameter provided.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Schema/catalog fault.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
}

impl AsError {
    /// Create an InvalidAddress error.
    pub fn invalid_address(
        layer_name: impl Into<String>,
        addr: u64,
        msg: impl Into<String>,
    ) -> Self {
        AsError::InvalidAddress {
            layer_name: layer_name.into(),
            invalid_address: addr,
            message: msg.into(),
        }
    }

    /// Create a PagedInvalidAddress error.
    pub fn paged_invalid_address(
        layer_name: impl Into<String>,
        addr: u64,
        invalid_bits: u32,
        entry: u64,
        msg: impl Into<String>,
    ) -> Self {
        AsError::PagedInvalidAddress {
            layer_name: layer_name.into(),
            invalid_address: addr,
            invalid_bits,
            entry,
            message: msg.into(),
        }
    }

    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        AsError::InvalidParameter(msg.into())
    }
}

/// Result type for address-space and object operations.
pub type AsResult<T> = Result<T, AsError>;
