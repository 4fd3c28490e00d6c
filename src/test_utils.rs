/// # Test Utilities Module
///
/// Testing infrastructure for the connector: isolated database fixtures on
/// the embedded driver, error assertion helpers and sample data.
///
/// This module provides:
/// - Connection fixtures backed by a temporary SQLite file
/// - OdbcError-specific testing helpers
/// - Sample schema and data

use crate::config::{ConnectionConfig, Dialect};
use crate::core::db::Connection;
use crate::core::Result;
use crate::driver::SqliteDriver;
use std::rc::Rc;
use tempfile::TempDir;

/// Isolated database test fixture
///
/// Owns the temporary directory holding the database file, so the file
/// outlives every connection opened through the fixture.
pub struct DatabaseFixture {
    pub name: String,
    pub driver: Rc<SqliteDriver>,
    pub connection: Connection,
    pub dir: TempDir,
}

impl DatabaseFixture {
    /// Create a new empty database with the given dialect
    pub fn new(name: &str, dialect: Dialect) -> Result<Self> {
        Self::with_config(name, |config| config.with_dialect(dialect))
    }

    /// Create a fixture whose configuration is adjusted by `configure`
    pub fn with_config<F>(name: &str, configure: F) -> Result<Self>
    where
        F: FnOnce(ConnectionConfig) -> ConnectionConfig,
    {
        let dir = TempDir::new()?;
        let path = dir.path().join(format!("{}.db", name));
        let config = configure(ConnectionConfig::new(&path.to_string_lossy()));
        let driver = Rc::new(SqliteDriver::new());
        let connection = Connection::new(driver.clone(), config)?;

        Ok(DatabaseFixture {
            name: name.to_string(),
            driver,
            connection,
            dir,
        })
    }

    /// Create fixture with sample data schema
    pub fn with_sample_data(name: &str) -> Result<Self> {
        let mut fixture = Self::new(name, Dialect::Sqlite)?;
        fixture.setup_standard_schema()?;
        fixture.populate_sample_data()?;
        Ok(fixture)
    }

    /// Set up standard test schema
    pub fn setup_standard_schema(&mut self) -> Result<()> {
        self.connection.execute(
            "CREATE TABLE users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                active BOOLEAN DEFAULT 1,
                balance REAL,
                born DATE,
                last_login TIMESTAMP,
                alarm TIME
            )",
        )?;
        self.connection.execute(
            "CREATE TABLE posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                body TEXT
            )",
        )?;
        Ok(())
    }

    /// Populate with realistic sample data
    pub fn populate_sample_data(&mut self) -> Result<()> {
        let users = [
            ("alice", "1", "12.5", "1990-04-01", "2024-01-15 08:30:00.123456", "07:00:00"),
            ("bob", "0", "0.0", "1985-12-31", "2023-06-01 22:15:10", "06:45:30"),
        ];
        for (username, active, balance, born, last_login, alarm) in users {
            self.connection.insert(&format!(
                "INSERT INTO users (username, active, balance, born, last_login, alarm) \
                 VALUES ('{}', {}, {}, '{}', '{}', '{}')",
                username, active, balance, born, last_login, alarm
            ))?;
        }
        self.connection
            .insert("INSERT INTO users (username) VALUES ('charlie')")?;

        let posts = [
            (1, "Welcome to Rust", "Rust is a systems programming language..."),
            (2, "Bob's notes", "Quotes 'inside' the body"),
            (1, "Call-level interfaces", "Handles, statements and cursors"),
        ];
        for (user_id, title, body) in posts {
            let title = crate::core::db::escape(title);
            let body = crate::core::db::escape(body);
            self.connection.insert(&format!(
                "INSERT INTO posts (user_id, title, body) VALUES ({}, '{}', '{}')",
                user_id, title, body
            ))?;
        }
        Ok(())
    }
}

/// Error testing utilities specific to OdbcError patterns
pub mod error_testing {
    use crate::core::OdbcError;

    /// Assert that an error carries the given SQLSTATE in its diagnostics
    pub fn assert_diagnostic_state<T: std::fmt::Debug>(
        result: &std::result::Result<T, OdbcError>,
        state: &str,
        context: &str,
    ) {
        match result {
            Ok(value) => panic!("Expected error with {} but got Ok({:?}) in {}", state, value, context),
            Err(e) => {
                let diagnostics = e.diagnostics().unwrap_or_default();
                assert!(
                    diagnostics.contains(&format!("STATE: {}", state)),
                    "Expected state {} in diagnostics '{}' context: {}",
                    state,
                    diagnostics,
                    context
                );
            }
        }
    }

    /// Verify error message quality (names the operation and is descriptive)
    pub fn verify_error_message_quality<T, E>(result: &std::result::Result<T, E>, context: &str)
    where
        T: std::fmt::Debug,
        E: std::fmt::Display,
    {
        if let Err(ref error) = result {
            let error_str = error.to_string();

            assert!(!error_str.is_empty(), "Error message should not be empty in {}", context);
            assert!(error_str.len() > 10, "Error message should be descriptive in {}", context);

            let has_operation_context = error_str.contains("SQL") || error_str.contains("error");
            assert!(
                has_operation_context,
                "Error should indicate what operation failed: '{}' in {}",
                error_str,
                context
            );
        }
    }
}

/// Helper macro for asserting an `OdbcError` variant
#[macro_export]
macro_rules! assert_odbc_error {
    ($result:expr, $variant:ident, $context:expr) => {
        match $result {
            Err($crate::core::OdbcError::$variant { .. }) => {}
            Ok(_) => panic!("Expected {} error but got Ok in {}", stringify!($variant), $context),
            Err(other) => panic!("Expected {} but got {:?} in {}", stringify!($variant), other, $context),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::ValueKind;
    use crate::driver::HandleKind;

    #[test]
    fn test_connection_fixture_creation() {
        let fixture = DatabaseFixture::new("test_create", Dialect::Sqlite).unwrap();
        assert_eq!(fixture.name, "test_create");
        assert_eq!(fixture.driver.open_handles(HandleKind::Connection), 1);
    }

    #[test]
    fn test_sample_data_fixture() {
        let mut fixture = DatabaseFixture::with_sample_data("test_sample").unwrap();
        let mut cursor = fixture.connection.select("SELECT COUNT(*) FROM users").unwrap();
        let row = cursor.fetch_row(&[ValueKind::Integer]).unwrap().unwrap();
        assert_eq!(row[0].as_ref().and_then(|v| v.as_i64()), Some(3));
    }
}
