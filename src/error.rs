//! Error types for Sunkfin Core
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are categorized by domain (input, transfer, storage, etc.) so the
//! download manager can turn every failure into a typed outcome instead of
//! letting it escape as a fault.
//!
//! ## Where errors are caught
//!
//! - Transfer session: network and staging-file errors become
//!   `TransferOutcome::Failed`, user aborts become `TransferOutcome::Cancelled`
//! - Metadata store: payload/sidecar I/O becomes `CommitFailed` on save,
//!   `DecodeFailed` on load (logged and skipped), and per-file entries in a
//!   `DeletionReport` on delete
//! - FFI bridge: everything left is rendered as `{"success": false, "error": ...}`

use thiserror::Error;

/// Result type alias using our SunkfinError type
pub type Result<T> = std::result::Result<T, SunkfinError>;

/// Main error type for Sunkfin Core
#[derive(Error, Debug)]
pub enum SunkfinError {
    // ===== Input/Configuration Errors =====

    /// Generic input validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Required field is missing (e.g. an item without an identifier)
    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    /// Item identifier cannot be used as a storage key
    #[error("Invalid item identifier '{id}': {reason}")]
    InvalidItemId { id: String, reason: String },

    /// Configuration is invalid or incomplete
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ===== Transfer Errors =====

    /// Network connectivity error
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether this error might succeed if the download is restarted
        is_transient: bool,
    },

    /// Server returned unexpected status code
    #[error("Server responded with unexpected status code {status_code} for {url}")]
    UnexpectedStatusCode { status_code: u16, url: String },

    /// Server sent more bytes than it declared
    #[error("Write position ({position}) exceeds content length ({content_length})")]
    WritePositionExceedsLength { position: u64, content_length: u64 },

    /// Stream ended before the declared length was reached
    #[error("Download incomplete: {received}/{expected} bytes")]
    IncompleteTransfer { received: u64, expected: u64 },

    // ===== File/Storage Errors =====

    /// File or directory not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Generic file I/O error
    #[error("File I/O error: {0}")]
    FileIoError(String),

    /// Moving the payload or writing the sidecar failed after a successful transfer
    #[error("Failed to commit download '{id}': {reason}")]
    CommitFailed { id: String, reason: String },

    /// Sidecar could not be read or decoded
    #[error("Failed to decode metadata at {path}: {reason}")]
    DecodeFailed { path: String, reason: String },

    // ===== General Errors =====

    /// Operation was cancelled by the user
    #[error("Operation cancelled")]
    Cancelled,

    /// Logging was already initialized for this process
    #[error("Logging already initialized")]
    LoggingAlreadyInitialized,

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed server endpoint
    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),
}

// Helper methods for creating common errors
impl SunkfinError {
    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        SunkfinError::InvalidInput(message.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        SunkfinError::InternalError(message.into())
    }

    /// Create a NetworkError
    pub fn network_error<S: Into<String>>(message: S, is_transient: bool) -> Self {
        SunkfinError::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Create a CommitFailed error
    pub fn commit_failed<I: Into<String>, S: Into<String>>(id: I, reason: S) -> Self {
        SunkfinError::CommitFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Check if restarting the download might succeed
    ///
    /// Nothing retries automatically; this only tells the caller whether
    /// offering "try again" makes sense.
    pub fn is_retryable(&self) -> bool {
        match self {
            SunkfinError::NetworkError { is_transient, .. } => *is_transient,
            SunkfinError::UnexpectedStatusCode { status_code, .. } => {
                (500..=599).contains(status_code) || *status_code == 408 || *status_code == 429
            }
            SunkfinError::IncompleteTransfer { .. } => true,
            SunkfinError::ReqwestError(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            _ => false,
        }
    }

    /// Check if this is a user-initiated abort rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SunkfinError::Cancelled)
    }

    /// Check if error is related to file/disk operations
    pub fn is_file_error(&self) -> bool {
        matches!(
            self,
            SunkfinError::FileNotFound(_)
                | SunkfinError::FileIoError(_)
                | SunkfinError::CommitFailed { .. }
                | SunkfinError::DecodeFailed { .. }
                | SunkfinError::IoError(_)
        )
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            SunkfinError::Cancelled => "Download cancelled.".to_string(),
            SunkfinError::UnexpectedStatusCode { status_code: 401 | 403, .. } => {
                "The server rejected your credentials. Please log in again.".to_string()
            }
            SunkfinError::UnexpectedStatusCode { status_code: 404, .. } => {
                "This item is no longer available on the server.".to_string()
            }
            SunkfinError::CommitFailed { .. } => {
                "The download finished but could not be saved to the device. Check available storage and try again.".to_string()
            }
            e if e.is_retryable() => "The download was interrupted. Please try again.".to_string(),
            _ => self.to_string(),
        }
    }
}
