// Core infrastructure modules
pub mod config;
pub mod core;
pub mod driver;

#[cfg(test)]
mod test_utils;

pub use crate::config::{ConnectionConfig, Dialect};
pub use crate::core::db::{Connection, Parameter, PreparedStatement, ResultCursor, Value, ValueKind};
pub use crate::core::{OdbcError, Result};
