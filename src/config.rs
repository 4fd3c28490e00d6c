use crate::core::{OdbcError, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use crate::driver::DriverCompletion;

/// SQL variant spoken by the data source.
///
/// Only decides which statement retrieves the last generated identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(from = "String")]
pub enum Dialect {
    MySql,
    PostgreSql,
    Sqlite,
    #[default]
    Tsql,
    /// A dialect name this connector has no last-insert-id statement for
    Other(String),
}

impl Dialect {
    /// Parses a dialect name case-insensitively; unknown names become `Other`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "mysql" => Dialect::MySql,
            "postgresql" | "postgres" => Dialect::PostgreSql,
            "sqlite" | "sqlite3" => Dialect::Sqlite,
            "tsql" | "mssql" => Dialect::Tsql,
            _ => Dialect::Other(name.trim().to_string()),
        }
    }

    /// Statement returning the identifier generated by the last insert.
    pub fn last_insert_id_statement(&self) -> Result<&'static str> {
        match self {
            Dialect::MySql => Ok("SELECT LAST_INSERT_ID()"),
            Dialect::PostgreSql => Ok("SELECT LASTVAL()"),
            Dialect::Sqlite => Ok("SELECT last_insert_rowid()"),
            Dialect::Tsql => Ok("SELECT SCOPE_IDENTITY()"),
            Dialect::Other(name) => Err(OdbcError::UnsupportedDialect(name.clone())),
        }
    }
}

impl From<String> for Dialect {
    fn from(name: String) -> Self {
        Dialect::from_name(&name)
    }
}

impl FromStr for Dialect {
    type Err = OdbcError;

    fn from_str(s: &str) -> Result<Self> {
        match Dialect::from_name(s) {
            Dialect::Other(name) => Err(OdbcError::UnsupportedDialect(name)),
            dialect => Ok(dialect),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::MySql => f.write_str("mysql"),
            Dialect::PostgreSql => f.write_str("postgresql"),
            Dialect::Sqlite => f.write_str("sqlite"),
            Dialect::Tsql => f.write_str("tsql"),
            Dialect::Other(name) => f.write_str(name),
        }
    }
}

/// Settings of one connection. Shared read-only by the connection and every
/// handle it spawns.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionConfig {
    /// Data source name, or the database path for the embedded SQLite driver
    #[serde(default)]
    pub data_source_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database selected with `USE` right after connecting
    pub database: Option<String>,
    #[serde(default)]
    pub dialect: Dialect,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Full connection string; when set it replaces DSN and credentials
    pub connection_string: Option<String>,
    #[serde(default)]
    pub completion: DriverCompletion,
}

impl ConnectionConfig {
    pub fn new(data_source_name: &str) -> Self {
        ConnectionConfig {
            data_source_name: data_source_name.to_string(),
            username: None,
            password: None,
            database: None,
            dialect: Dialect::default(),
            debug: false,
            auto_reconnect: false,
            connection_string: None,
            completion: DriverCompletion::default(),
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn with_database(mut self, database: &str) -> Self {
        self.database = Some(database.to_string());
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_connection_string(mut self, connection_string: &str) -> Self {
        self.connection_string = Some(connection_string.to_string());
        self
    }

    pub fn with_completion(mut self, completion: DriverCompletion) -> Self {
        self.completion = completion;
        self
    }

    /// Parses the `[connection]` table of a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| OdbcError::Config(e.to_string()))?;
        file.connection.validate()?;
        Ok(file.connection)
    }

    /// A connection needs either a data source name or a connection string.
    pub fn validate(&self) -> Result<()> {
        if self.data_source_name.trim().is_empty() && self.connection_string.is_none() {
            return Err(OdbcError::Config(
                "either data_source_name or connection_string must be set".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    connection: ConnectionConfig,
}

/// Loads the connection configuration from a TOML file at the given path.
///
/// # Arguments
///
/// * `path` - The file path to the TOML configuration file.
///
/// # Example
///
/// ```no_run
/// let config = odbc_connector::config::load_config("connection.toml")?;
/// println!("{:?}", config);
/// # Ok::<(), odbc_connector::core::OdbcError>(())
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ConnectionConfig> {
    let content = fs::read_to_string(path)?;
    ConnectionConfig::from_toml_str(&content)
}

/// `<config dir>/odbc-connector/connection.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("odbc-connector").join("connection.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
[connection]
data_source_name = "warehouse"
username = "etl"
password = "secret"
database = "sales"
dialect = "PostgreSQL"
debug = true
auto_reconnect = true
"#;

    #[test]
    fn test_load_config_from_str() {
        let config = ConnectionConfig::from_toml_str(SAMPLE_CONFIG).expect("Failed to parse sample config");
        assert_eq!(config.data_source_name, "warehouse");
        assert_eq!(config.username.as_deref(), Some("etl"));
        assert_eq!(config.database.as_deref(), Some("sales"));
        assert_eq!(config.dialect, Dialect::PostgreSql);
        assert!(config.debug);
        assert!(config.auto_reconnect);
        assert_eq!(config.completion, DriverCompletion::NoPrompt);
    }

    #[test]
    fn test_defaults_and_structural_equality() {
        let config = ConnectionConfig::from_toml_str("[connection]\ndata_source_name = \"dsn\"\n").unwrap();
        assert_eq!(config, ConnectionConfig::new("dsn"));
        assert_eq!(config.dialect, Dialect::Tsql);
        assert_ne!(config, ConnectionConfig::new("dsn").with_debug(true));
    }

    #[test]
    fn test_connection_string_config() {
        let config = ConnectionConfig::from_toml_str(
            r#"
[connection]
connection_string = "Driver={PostgreSQL};Server=db;Database=x"
completion = "complete_required"
"#,
        )
        .unwrap();
        assert_eq!(config.completion, DriverCompletion::CompleteRequired);
        assert!(config.data_source_name.is_empty());
    }

    #[test]
    fn test_missing_data_source_is_rejected() {
        let err = ConnectionConfig::from_toml_str("[connection]\ndebug = true\n").unwrap_err();
        assert!(matches!(err, OdbcError::Config(_)));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = ConnectionConfig::from_toml_str("[connection\n").unwrap_err();
        assert!(matches!(err, OdbcError::Config(_)));
    }

    #[test]
    fn test_dialect_names() {
        assert_eq!(Dialect::from_name("MySQL"), Dialect::MySql);
        assert_eq!(Dialect::from_name("postgres"), Dialect::PostgreSql);
        assert_eq!(Dialect::from_name("sqlite3"), Dialect::Sqlite);
        assert_eq!(Dialect::from_name("MSSQL"), Dialect::Tsql);
        assert_eq!(Dialect::from_name("oracle"), Dialect::Other("oracle".to_string()));
        assert!(matches!("oracle".parse::<Dialect>(), Err(OdbcError::UnsupportedDialect(_))));
        assert_eq!("tsql".parse::<Dialect>().unwrap(), Dialect::Tsql);
    }

    #[test]
    fn test_last_insert_id_statements() {
        assert_eq!(Dialect::MySql.last_insert_id_statement().unwrap(), "SELECT LAST_INSERT_ID()");
        assert_eq!(Dialect::PostgreSql.last_insert_id_statement().unwrap(), "SELECT LASTVAL()");
        assert_eq!(Dialect::Sqlite.last_insert_id_statement().unwrap(), "SELECT last_insert_rowid()");
        assert_eq!(Dialect::Tsql.last_insert_id_statement().unwrap(), "SELECT SCOPE_IDENTITY()");
        assert!(Dialect::Other("db2".to_string()).last_insert_id_statement().is_err());
    }

    #[test]
    fn test_load_config_missing_file_is_io_error() {
        let err = load_config("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, OdbcError::Io(_)));
    }
}
