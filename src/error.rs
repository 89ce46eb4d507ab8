//! Unified error handling for offline area operations.
//!
//! Per-tile and per-points fetch failures never surface here; they are
//! swallowed and retried by the orchestrator. What remains are conditions
//! the caller has to act on: local I/O failures, invalid requests and
//! misuse of the area lifecycle.

use thiserror::Error;

/// Unified error type for offline area operations.
#[derive(Debug, Error)]
pub enum OfflineError {
    /// Local filesystem failure (permissions, out of space, ...)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Document (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Download request rejected by validation
    #[error("Invalid area request: {message}")]
    InvalidRequest { message: String },

    /// Requested area would exceed the tile budget
    #[error("Area needs {count} tiles, maximum is {max}")]
    TooManyTiles { count: u64, max: u64 },

    /// No area with this id in the registry
    #[error("Offline area '{id}' not found")]
    AreaNotFound { id: String },

    /// Operation not allowed on the permanent world area
    #[error("Offline area '{id}' is permanent and cannot be modified this way")]
    PermanentArea { id: String },

    /// A download for this area is already running
    #[error("Offline area '{id}' is already downloading")]
    AlreadyDownloading { id: String },

    /// Network fetch failure (tiles or points)
    #[error("Fetch error{}: {message}", .status_code.map(|c| format!(" ({})", c)).unwrap_or_default())]
    Fetch {
        message: String,
        status_code: Option<u16>,
    },

    /// Fire-and-forget work requested outside a tokio runtime
    #[error("No tokio runtime available to spawn background work")]
    NoRuntime,
}

impl OfflineError {
    pub(crate) fn fetch(message: impl Into<String>) -> Self {
        OfflineError::Fetch {
            message: message.into(),
            status_code: None,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        OfflineError::InvalidRequest {
            message: message.into(),
        }
    }
}

/// Result type alias for offline area operations.
pub type Result<T> = std::result::Result<T, OfflineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OfflineError::TooManyTiles {
            count: 60_000,
            max: 50_000,
        };
        assert!(err.to_string().contains("60000"));

        let err = OfflineError::Fetch {
            message: "timeout".to_string(),
            status_code: Some(503),
        };
        assert_eq!(err.to_string(), "Fetch error (503): timeout");

        assert_eq!(
            OfflineError::fetch("empty body").to_string(),
            "Fetch error: empty body"
        );
    }

    #[test]
    fn test_io_conversion() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(OfflineError::Io(_))));
    }
}
