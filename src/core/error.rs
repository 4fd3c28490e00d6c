/// Connector Error Module
///
/// This module defines the error type returned by every fallible connector
/// operation. Driver-facing variants carry the name of the failing call-level
/// operation and the aggregated diagnostic text read from the native handle,
/// which is never empty.
use crate::core::db::value::ValueKind;
use thiserror::Error;

/// Error type for the connector.
///
/// - Connection setup (`Connect`)
/// - Statement compilation, parameter binding and execution
/// - Row retrieval (`Fetch`)
/// - Transaction misuse and unsupported dialects
/// - Configuration and file system access
#[derive(Error, Debug)]
pub enum OdbcError {
    /// Allocating handles or connecting to the data source failed
    #[error("Connect error in {operation}: {diagnostics}")]
    Connect {
        operation: String,
        diagnostics: String,
    },

    #[error("Prepare error in {operation}: {diagnostics}")]
    Prepare {
        operation: String,
        diagnostics: String,
    },

    /// Binding parameter `index` failed; `kind` is `None` when resetting all bindings
    #[error("Bind error in {operation} for {}: {diagnostics}", bind_target(.kind, .index))]
    Bind {
        operation: String,
        kind: Option<ValueKind>,
        index: u16,
        diagnostics: String,
    },

    #[error("Execute error in {operation}: {diagnostics}")]
    Execute {
        operation: String,
        diagnostics: String,
    },

    /// Fetching a row or a column value failed; `column` is 0 for row-level failures
    #[error("Fetch error in {operation} (column {column}): {diagnostics}")]
    Fetch {
        operation: String,
        column: u16,
        diagnostics: String,
    },

    /// Transaction started twice, or ended while none is open
    #[error("Transaction state error in {operation}: {message}")]
    TransactionState { operation: String, message: String },

    #[error("Unsupported SQL dialect: {0}")]
    UnsupportedDialect(String),

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn bind_target(kind: &Option<ValueKind>, index: &u16) -> String {
    match kind {
        Some(kind) => format!("{} parameter {}", kind, index),
        None => "all parameters".to_string(),
    }
}

impl OdbcError {
    /// Name of the operation that failed, when the error came from one.
    pub fn operation(&self) -> Option<&str> {
        match self {
            OdbcError::Connect { operation, .. }
            | OdbcError::Prepare { operation, .. }
            | OdbcError::Bind { operation, .. }
            | OdbcError::Execute { operation, .. }
            | OdbcError::Fetch { operation, .. }
            | OdbcError::TransactionState { operation, .. } => Some(operation),
            _ => None,
        }
    }

    /// Aggregated diagnostic text of a driver-facing error.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            OdbcError::Connect { diagnostics, .. }
            | OdbcError::Prepare { diagnostics, .. }
            | OdbcError::Bind { diagnostics, .. }
            | OdbcError::Execute { diagnostics, .. }
            | OdbcError::Fetch { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

/// Type alias for Result to use OdbcError as the error type.
pub type Result<T> = std::result::Result<T, OdbcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OdbcError::Connect {
            operation: "SQLConnect".to_string(),
            diagnostics: "STATE: 08001, Native Error: 0: unreachable".to_string(),
        };
        insta::assert_snapshot!(err.to_string(), @"Connect error in SQLConnect: STATE: 08001, Native Error: 0: unreachable");

        let err = OdbcError::Bind {
            operation: "SQLBindParameter".to_string(),
            kind: Some(ValueKind::Text),
            index: 3,
            diagnostics: "STATE: 07009, Native Error: 0: bad index".to_string(),
        };
        insta::assert_snapshot!(err.to_string(), @"Bind error in SQLBindParameter for text parameter 3: STATE: 07009, Native Error: 0: bad index");

        let err = OdbcError::Bind {
            operation: "SQLFreeStmt(SQL_RESET_PARAMS)".to_string(),
            kind: None,
            index: 0,
            diagnostics: "STATE: HY000, Native Error: -1: rejected".to_string(),
        };
        insta::assert_snapshot!(err.to_string(), @"Bind error in SQLFreeStmt(SQL_RESET_PARAMS) for all parameters: STATE: HY000, Native Error: -1: rejected");

        let err = OdbcError::UnsupportedDialect("oracle".to_string());
        assert!(err.to_string().contains("oracle"));
    }

    #[test]
    fn test_error_accessors() {
        let err = OdbcError::Fetch {
            operation: "SQLGetData".to_string(),
            column: 2,
            diagnostics: "STATE: 22018, Native Error: 0: cast".to_string(),
        };
        assert_eq!(err.operation(), Some("SQLGetData"));
        assert!(err.diagnostics().is_some_and(|d| d.contains("22018")));

        let err = OdbcError::Config("missing".to_string());
        assert_eq!(err.operation(), None);
        assert_eq!(err.diagnostics(), None);
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: OdbcError = io_err.into();
        match err {
            OdbcError::Io(_) => {}
            _ => panic!("Expected IO error"),
        }
    }
}
