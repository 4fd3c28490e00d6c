use odbc_connector::config::{default_config_path, load_config, ConnectionConfig, Dialect};
use odbc_connector::core::db::{Connection, Parameter, ValueKind};
use odbc_connector::driver::CallLevelApi;
use odbc_connector::Result;
use std::process::ExitCode;
use std::rc::Rc;
use tracing::info;

const SCRATCH_TABLE: &str = "odbc_connector_smoke";

const USAGE: &str = "usage: odbc-connector <dsn> [database|-] [username|-] [password|-] [dialect]\n       odbc-connector --config <file>";

fn main() -> ExitCode {
    // Initialize the logging system using tracing subscriber
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match parse_args(&args) {
        Ok(Some(config)) => config,
        Ok(None) => {
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    match smoke_test(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Builds the configuration from the command line, or from the default
/// configuration file when no arguments are given.
fn parse_args(args: &[String]) -> Result<Option<ConnectionConfig>> {
    match args {
        [] => match default_config_path() {
            Some(path) if path.exists() => load_config(path).map(Some),
            _ => Ok(None),
        },
        [flag, path] if flag == "--config" => load_config(path).map(Some),
        [flag, ..] if flag.starts_with('-') => Ok(None),
        [dsn, rest @ ..] if rest.len() <= 4 => {
            let optional = |i: usize| rest.get(i).map(String::as_str).filter(|s| *s != "-");
            let mut config = ConnectionConfig::new(dsn);
            config.database = optional(0).map(str::to_string);
            config.username = optional(1).map(str::to_string);
            config.password = optional(2).map(str::to_string);
            if let Some(dialect) = optional(3) {
                config.dialect = dialect.parse::<Dialect>()?;
            }
            config.validate()?;
            Ok(Some(config))
        }
        _ => Ok(None),
    }
}

#[cfg(feature = "odbc")]
fn driver() -> Rc<dyn CallLevelApi> {
    Rc::new(odbc_connector::driver::OdbcDriver::new())
}

#[cfg(not(feature = "odbc"))]
fn driver() -> Rc<dyn CallLevelApi> {
    Rc::new(odbc_connector::driver::SqliteDriver::new())
}

/// Creates a scratch table, writes two rows through a prepared insert, reads
/// them back and drops the table again.
fn smoke_test(config: ConnectionConfig) -> Result<()> {
    info!("Connecting to {} ({})", config.data_source_name, config.dialect);
    let mut conn = Connection::new(driver(), config)?;

    conn.execute(&format!(
        "CREATE TABLE {} (id INTEGER PRIMARY KEY, label VARCHAR(64), score DOUBLE PRECISION)",
        SCRATCH_TABLE
    ))?;

    let result = round_trip(&mut conn);
    conn.execute(&format!("DROP TABLE {}", SCRATCH_TABLE))?;
    result
}

fn round_trip(conn: &mut Connection) -> Result<()> {
    let mut insert = conn.prepare(&format!(
        "INSERT INTO {} (id, label, score) VALUES (?, ?, ?)",
        SCRATCH_TABLE
    ))?;
    for (id, label, score) in [(1i64, "first", 0.5), (2i64, "it's second", 1.25)] {
        conn.run_prepared_execute(
            &mut insert,
            &[Parameter::new(id), Parameter::new(label), Parameter::new(score)],
        )?;
    }

    let cursor = conn.select(&format!(
        "SELECT id, label, score FROM {} ORDER BY id",
        SCRATCH_TABLE
    ))?;
    let mut count = 0;
    for row in cursor.rows(&[ValueKind::Integer, ValueKind::Text, ValueKind::Float]) {
        let cells: Vec<String> = row?
            .into_iter()
            .map(|value| value.map_or_else(|| "NULL".to_string(), |v| v.to_string()))
            .collect();
        println!("{}", cells.join(" | "));
        count += 1;
    }
    println!("{} rows", count);
    Ok(())
}
