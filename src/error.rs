//! Custom error types for the writer.
//!
//! This module defines the primary error type, `WriterError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures the acquisition
//! engine can run into, from malformed schemas to backend faults.
//!
//! ## Error Hierarchy
//!
//! - **`Schema`**: malformed or ambiguous schema markup. Fatal to the
//!   `open_entry`/`close_entry` call that hit it.
//! - **`SourceSetup`**: a data source could not be constructed, or a cached
//!   value it depends on is missing. Fatal unless the owning field is marked
//!   can-fail.
//! - **`Data`**: a fetched value could not be reconciled with the field's
//!   declared type or shape.
//! - **`Storage`**: the container backend rejected an operation.
//! - **`State`**: a lifecycle call arrived in the wrong order (e.g. `record`
//!   before `open_entry`). These are programmer errors in the caller.
//! - **`FeatureNotEnabled`**: the schema asked for a capability that was not
//!   compiled into this build (e.g. a database backend). The message tells
//!   the user which feature flag to enable.
//! - **`Write`**: the aggregate of one or more per-item failures collected by
//!   the phase engine. Nothing is silently dropped: every failing item is
//!   named in the message.
//!
//! By using `#[from]`, `WriterError` can be seamlessly created from the
//! underlying error types, simplifying error handling throughout the crate
//! with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type WriterResult<T> = std::result::Result<T, WriterError>;

/// One failing work item, captured by the phase engine.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    /// Container path of the field whose fetch or write failed.
    pub name: String,
    /// Rendered cause.
    pub message: String,
}

impl std::fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

fn join_failures(failures: &[ItemFailure]) -> String {
    failures
        .iter()
        .map(ItemFailure::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Data source setup error: {0}")]
    SourceSetup(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Writer state error: {0}")]
    State(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write failed for {} item(s): {}", .0.len(), join_failures(.0))]
    Write(Vec<ItemFailure>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WriterError::Schema("unclosed group".to_string());
        assert_eq!(err.to_string(), "Schema error: unclosed group");
    }

    #[test]
    fn test_write_error_names_every_item() {
        let err = WriterError::Write(vec![
            ItemFailure {
                name: "/entry/mca".into(),
                message: "device timeout".into(),
            },
            ItemFailure {
                name: "/entry/serial".into(),
                message: "missing key".into(),
            },
        ]);
        let rendered = err.to_string();
        assert!(rendered.contains("2 item(s)"));
        assert!(rendered.contains("/entry/mca: device timeout"));
        assert!(rendered.contains("/entry/serial: missing key"));
    }

    #[test]
    fn test_feature_not_enabled_message_names_feature() {
        let err = WriterError::FeatureNotEnabled("storage_hdf5".to_string());
        assert!(err.to_string().contains("--features storage_hdf5"));
    }
}
