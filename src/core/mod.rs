/// Core Module
///
/// The connector's database layer and its error type.

pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{OdbcError, Result};
