/// Prepared Statement Module
///
/// A compiled statement with its ordinal input parameters. Parameter values are
/// copied into boxed buffers owned by the statement, so callers never have to
/// keep their values alive until execution. A binding stays in place until the
/// next [`PreparedStatement::reset`] or until its ordinal is bound again.

use crate::core::db::cursor::ResultCursor;
use crate::core::db::handle::{Attempt, ConnectionHandle, StatementHandle};
use crate::core::db::value::{InvalidCalendarValue, Parameter, Value, ValueKind};
use crate::core::{OdbcError, Result};
use crate::driver::{
    poll_until_done, BoundParameter, CDataType, HandleKind, ParameterBuffer, SqlDate, SqlReturn,
    SqlTime, SqlTimestamp, SqlType, NULL_DATA,
};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Column size of a 64-bit integer parameter (digits plus sign).
const BIGINT_COLUMN_SIZE: usize = 20;
/// Precision used for double parameters.
const DOUBLE_DIGITS: usize = 15;
/// `YYYY-MM-DD`
const DATE_COLUMN_SIZE: usize = 10;
/// `HH:MM:SS`
const TIME_COLUMN_SIZE: usize = 8;
/// `YYYY-MM-DD HH:MM:SS.ffffff`
const TIMESTAMP_COLUMN_SIZE: usize = 26;
const TIMESTAMP_DIGITS: i16 = 6;

/// A statement compiled on one connection.
///
/// Move-only: exactly one `PreparedStatement` owns a native statement handle;
/// cursors created from it share the handle until they are dropped.
#[derive(Debug)]
pub struct PreparedStatement {
    handle: Rc<StatementHandle>,
    sql: String,
    debug: bool,
    bindings: BTreeMap<u16, BoundParameter>,
    executed: bool,
    no_rows: bool,
}

impl PreparedStatement {
    /// Allocates a statement handle and compiles `sql` on it.
    ///
    /// # Arguments
    ///
    /// * `connection` - Connection to prepare on; rebuilt once if it was lost
    /// * `sql` - Statement text with `?` parameter markers
    ///
    /// # Returns
    ///
    /// The prepared statement, or `OdbcError::Prepare`. The half-built handle
    /// is released on failure.
    pub fn prepare(connection: &mut ConnectionHandle, sql: &str) -> Result<Self> {
        match Self::try_prepare(connection, sql)? {
            Attempt::Done(statement) => Ok(statement),
            Attempt::ConnectionLost(error) => {
                connection.recover(error)?;
                match Self::try_prepare(connection, sql)? {
                    Attempt::Done(statement) => Ok(statement),
                    Attempt::ConnectionLost(error) => Err(error),
                }
            }
        }
    }

    fn try_prepare(connection: &ConnectionHandle, sql: &str) -> Result<Attempt<Self>> {
        let debug = connection.config().debug;
        let handle = compile(connection, sql)?;
        match handle {
            Attempt::Done(handle) => Ok(Attempt::Done(PreparedStatement {
                handle: Rc::new(handle),
                sql: sql.to_string(),
                debug,
                bindings: BTreeMap::new(),
                executed: false,
                no_rows: false,
            })),
            Attempt::ConnectionLost(error) => Ok(Attempt::ConnectionLost(error)),
        }
    }

    /// Statement text this statement was prepared from.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Number of ordinals currently bound.
    pub fn bound_parameters(&self) -> usize {
        self.bindings.len()
    }

    /// Clears every parameter binding so the statement can be rebound.
    pub fn reset(&mut self) -> Result<()> {
        let rc = self.handle.api().reset_parameters(self.handle.raw());
        if !rc.succeeded() {
            return Err(OdbcError::Bind {
                operation: "SQLFreeStmt(SQL_RESET_PARAMS)".to_string(),
                kind: None,
                index: 0,
                diagnostics: self.handle.diagnostics(rc),
            });
        }
        self.bindings.clear();
        Ok(())
    }

    /// Binds `value` as input parameter `index` (1-based), dispatching on its kind.
    ///
    /// With `is_null` set the driver receives a NULL indicator and the value
    /// itself only selects the native type.
    pub fn bind_parameter(&mut self, index: u16, value: &Value, is_null: bool) -> Result<()> {
        match value {
            Value::Boolean(v) => self.bind_boolean(index, *v, is_null),
            Value::Integer(v) => self.bind_integer(index, *v, is_null),
            Value::Float(v) => self.bind_float(index, *v, is_null),
            Value::Text(v) => self.bind_text(index, v, is_null),
            Value::Date(v) => self.bind_date(index, *v, is_null),
            Value::DateTime(v) => self.bind_date_time(index, *v, is_null),
            Value::Time(v) => self.bind_time(index, *v, is_null),
        }
    }

    /// Binds `parameters` to ordinals `1..=parameters.len()`.
    pub fn bind_all(&mut self, parameters: &[Parameter]) -> Result<()> {
        for (position, parameter) in parameters.iter().enumerate() {
            let index = u16::try_from(position + 1).map_err(|_| OdbcError::Bind {
                operation: "SQLBindParameter".to_string(),
                kind: Some(parameter.value.kind()),
                index: u16::MAX,
                diagnostics: format!("too many parameters: {}", parameters.len()),
            })?;
            self.bind_parameter(index, &parameter.value, parameter.is_null)?;
        }
        Ok(())
    }

    pub fn bind_boolean(&mut self, index: u16, value: bool, is_null: bool) -> Result<()> {
        self.bind(
            index,
            ValueKind::Boolean,
            BoundParameter {
                c_type: CDataType::Bit,
                sql_type: SqlType::Bit,
                column_size: 1,
                decimal_digits: 0,
                buffer: Box::new(ParameterBuffer::Bit(u8::from(value))),
                indicator: Box::new(indicator(is_null, std::mem::size_of::<u8>())),
            },
        )
    }

    pub fn bind_integer(&mut self, index: u16, value: i64, is_null: bool) -> Result<()> {
        self.bind(
            index,
            ValueKind::Integer,
            BoundParameter {
                c_type: CDataType::SBigInt,
                sql_type: SqlType::BigInt,
                column_size: BIGINT_COLUMN_SIZE,
                decimal_digits: 0,
                buffer: Box::new(ParameterBuffer::BigInt(value)),
                indicator: Box::new(indicator(is_null, std::mem::size_of::<i64>())),
            },
        )
    }

    pub fn bind_float(&mut self, index: u16, value: f64, is_null: bool) -> Result<()> {
        self.bind(
            index,
            ValueKind::Float,
            BoundParameter {
                c_type: CDataType::Double,
                sql_type: SqlType::Double,
                column_size: DOUBLE_DIGITS,
                decimal_digits: DOUBLE_DIGITS as i16,
                buffer: Box::new(ParameterBuffer::Double(value)),
                indicator: Box::new(indicator(is_null, std::mem::size_of::<f64>())),
            },
        )
    }

    /// Binds text with its byte length as the indicator; no terminator is needed.
    pub fn bind_text(&mut self, index: u16, value: &str, is_null: bool) -> Result<()> {
        let bytes = value.as_bytes().to_vec();
        let length = bytes.len();
        self.bind(
            index,
            ValueKind::Text,
            BoundParameter {
                c_type: CDataType::Char,
                sql_type: SqlType::Char,
                column_size: length.max(1),
                decimal_digits: 0,
                buffer: Box::new(ParameterBuffer::Text(bytes)),
                indicator: Box::new(indicator(is_null, length)),
            },
        )
    }

    /// Fails with `OdbcError::Bind` when the year does not fit the native date struct.
    pub fn bind_date(&mut self, index: u16, value: NaiveDate, is_null: bool) -> Result<()> {
        let native = SqlDate::try_from(value)
            .map_err(|e| calendar_error(ValueKind::Date, index, e))?;
        self.bind(
            index,
            ValueKind::Date,
            BoundParameter {
                c_type: CDataType::Date,
                sql_type: SqlType::Date,
                column_size: DATE_COLUMN_SIZE,
                decimal_digits: 0,
                buffer: Box::new(ParameterBuffer::Date(native)),
                indicator: Box::new(indicator(is_null, std::mem::size_of::<SqlDate>())),
            },
        )
    }

    /// Binds a timestamp decomposed into calendar fields; the fraction carries nanoseconds.
    pub fn bind_date_time(&mut self, index: u16, value: NaiveDateTime, is_null: bool) -> Result<()> {
        let native = SqlTimestamp::try_from(value)
            .map_err(|e| calendar_error(ValueKind::DateTime, index, e))?;
        self.bind(
            index,
            ValueKind::DateTime,
            BoundParameter {
                c_type: CDataType::Timestamp,
                sql_type: SqlType::Timestamp,
                column_size: TIMESTAMP_COLUMN_SIZE,
                decimal_digits: TIMESTAMP_DIGITS,
                buffer: Box::new(ParameterBuffer::Timestamp(native)),
                indicator: Box::new(indicator(is_null, std::mem::size_of::<SqlTimestamp>())),
            },
        )
    }

    pub fn bind_time(&mut self, index: u16, value: NaiveTime, is_null: bool) -> Result<()> {
        self.bind(
            index,
            ValueKind::Time,
            BoundParameter {
                c_type: CDataType::Time,
                sql_type: SqlType::Time,
                column_size: TIME_COLUMN_SIZE,
                decimal_digits: 0,
                buffer: Box::new(ParameterBuffer::Time(SqlTime::from(value))),
                indicator: Box::new(indicator(is_null, std::mem::size_of::<SqlTime>())),
            },
        )
    }

    fn bind(&mut self, index: u16, kind: ValueKind, parameter: BoundParameter) -> Result<()> {
        if self.debug {
            debug!(
                "binding {} parameter {} (null: {})",
                kind,
                index,
                parameter.is_null()
            );
        }
        let rc = self
            .handle
            .api()
            .bind_parameter(self.handle.raw(), index, &parameter);
        if !rc.succeeded() {
            return Err(OdbcError::Bind {
                operation: "SQLBindParameter".to_string(),
                kind: Some(kind),
                index,
                diagnostics: self.handle.diagnostics(rc),
            });
        }
        if rc == SqlReturn::SuccessWithInfo {
            warn!("SQLBindParameter {}: {}", index, self.handle.diagnostics(rc));
        }
        // The previous buffer of this ordinal is no longer referenced by the driver
        self.bindings.insert(index, parameter);
        Ok(())
    }

    /// Executes the statement with its current bindings.
    ///
    /// When the connection turns out to be lost, the statement is prepared again
    /// on the rebuilt connection, its bindings are re-applied and execution is
    /// retried once. Cursors created before that point become exhausted.
    pub fn execute(&mut self, connection: &mut ConnectionHandle) -> Result<()> {
        match self.try_execute(connection)? {
            Attempt::Done(()) => Ok(()),
            Attempt::ConnectionLost(error) => {
                connection.recover(error)?;
                self.rebuild(connection)?;
                match self.try_execute(connection)? {
                    Attempt::Done(()) => Ok(()),
                    Attempt::ConnectionLost(error) => Err(error),
                }
            }
        }
    }

    fn try_execute(&mut self, connection: &ConnectionHandle) -> Result<Attempt<()>> {
        let api = self.handle.api();
        let raw = self.handle.raw();
        if self.executed {
            api.close_cursor(raw);
        }
        if self.debug {
            debug!("SQLExecute: {}", self.sql);
        }
        let rc = poll_until_done(|| api.execute(raw));
        self.executed = true;
        match rc {
            SqlReturn::Success | SqlReturn::SuccessWithInfo => {
                if rc == SqlReturn::SuccessWithInfo {
                    warn!("SQLExecute: {}", self.handle.diagnostics(rc));
                }
                self.no_rows = false;
                Ok(Attempt::Done(()))
            }
            SqlReturn::NoData => {
                self.no_rows = true;
                Ok(Attempt::Done(()))
            }
            _ => {
                let error = OdbcError::Execute {
                    operation: "SQLExecute".to_string(),
                    diagnostics: self.handle.diagnostics(rc),
                };
                if connection.needed_reconnect(rc, HandleKind::Statement, raw, "SQLExecute") {
                    Ok(Attempt::ConnectionLost(error))
                } else {
                    Err(error)
                }
            }
        }
    }

    /// Prepares the statement again on the current connection and re-applies
    /// every stored binding.
    fn rebuild(&mut self, connection: &ConnectionHandle) -> Result<()> {
        let handle = match compile(connection, &self.sql)? {
            Attempt::Done(handle) => handle,
            Attempt::ConnectionLost(error) => return Err(error),
        };
        for (index, parameter) in &self.bindings {
            let rc = handle.api().bind_parameter(handle.raw(), *index, parameter);
            if !rc.succeeded() {
                return Err(OdbcError::Bind {
                    operation: "SQLBindParameter".to_string(),
                    kind: Some(kind_of(parameter)),
                    index: *index,
                    diagnostics: handle.diagnostics(rc),
                });
            }
        }
        self.handle = Rc::new(handle);
        self.executed = false;
        Ok(())
    }

    /// Rows affected by the last execution; 0 when the driver reported none.
    pub fn affected_rows(&self) -> Result<u64> {
        if self.no_rows {
            return Ok(0);
        }
        let mut count: isize = 0;
        let rc = self.handle.api().row_count(self.handle.raw(), &mut count);
        if !rc.succeeded() {
            return Err(OdbcError::Execute {
                operation: "SQLRowCount".to_string(),
                diagnostics: self.handle.diagnostics(rc),
            });
        }
        Ok(count.max(0) as u64)
    }

    /// A cursor over the result of the last execution, sharing this statement's handle.
    pub fn cursor(&self) -> ResultCursor {
        ResultCursor::new(Rc::clone(&self.handle), self.debug)
    }
}

fn indicator(is_null: bool, length: usize) -> isize {
    if is_null {
        NULL_DATA
    } else {
        length as isize
    }
}

fn calendar_error(kind: ValueKind, index: u16, error: InvalidCalendarValue) -> OdbcError {
    OdbcError::Bind {
        operation: "SQLBindParameter".to_string(),
        kind: Some(kind),
        index,
        diagnostics: error.to_string(),
    }
}

fn kind_of(parameter: &BoundParameter) -> ValueKind {
    match parameter.buffer.as_ref() {
        ParameterBuffer::Bit(_) => ValueKind::Boolean,
        ParameterBuffer::BigInt(_) => ValueKind::Integer,
        ParameterBuffer::Double(_) => ValueKind::Float,
        ParameterBuffer::Text(_) => ValueKind::Text,
        ParameterBuffer::Date(_) => ValueKind::Date,
        ParameterBuffer::Time(_) => ValueKind::Time,
        ParameterBuffer::Timestamp(_) => ValueKind::DateTime,
    }
}

/// Allocates a statement handle and prepares `sql` on it.
fn compile(connection: &ConnectionHandle, sql: &str) -> Result<Attempt<StatementHandle>> {
    let handle = connection.allocate_statement()?;
    if connection.config().debug {
        debug!("SQLPrepare: {}", sql);
    }
    let rc = poll_until_done(|| handle.api().prepare(handle.raw(), sql));
    if rc.succeeded() {
        if rc == SqlReturn::SuccessWithInfo {
            warn!("SQLPrepare: {}", handle.diagnostics(rc));
        }
        return Ok(Attempt::Done(handle));
    }
    let error = OdbcError::Prepare {
        operation: "SQLPrepare".to_string(),
        diagnostics: handle.diagnostics(rc),
    };
    if connection.needed_reconnect(rc, HandleKind::Statement, handle.raw(), "SQLPrepare") {
        Ok(Attempt::ConnectionLost(error))
    } else {
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::driver::SqliteDriver;
    use tempfile::TempDir;

    fn connect(auto_reconnect: bool) -> (TempDir, Rc<SqliteDriver>, ConnectionHandle) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prepared.db");
        let config = ConnectionConfig::new(path.to_str().unwrap()).with_auto_reconnect(auto_reconnect);
        let driver = Rc::new(SqliteDriver::new());
        let handle = ConnectionHandle::new(driver.clone(), Rc::new(config)).unwrap();
        (dir, driver, handle)
    }

    #[test]
    fn test_prepare_failure_releases_handle() {
        let (_dir, driver, mut handle) = connect(false);
        let err = PreparedStatement::prepare(&mut handle, "SELEC nonsense").unwrap_err();
        assert!(matches!(err, OdbcError::Prepare { .. }));
        assert_eq!(driver.open_handles(HandleKind::Statement), 0);
    }

    #[test]
    fn test_bind_and_execute_insert() {
        let (_dir, _driver, mut handle) = connect(false);
        handle.execute_direct("CREATE TABLE t (a INTEGER, b TEXT)").unwrap();

        let mut stmt = PreparedStatement::prepare(&mut handle, "INSERT INTO t VALUES (?, ?)").unwrap();
        stmt.bind_integer(1, 7, false).unwrap();
        stmt.bind_text(2, "seven", false).unwrap();
        stmt.execute(&mut handle).unwrap();
        assert_eq!(stmt.affected_rows().unwrap(), 1);
        assert_eq!(stmt.bound_parameters(), 2);

        stmt.reset().unwrap();
        assert_eq!(stmt.bound_parameters(), 0);
        stmt.bind_all(&[Parameter::new(8i64), Parameter::null(ValueKind::Text)]).unwrap();
        stmt.execute(&mut handle).unwrap();

        assert_eq!(handle.execute_direct("DELETE FROM t WHERE b IS NULL").unwrap(), 1);
    }

    #[test]
    fn test_bind_failure_names_kind_and_index() {
        let (_dir, _driver, mut handle) = connect(false);
        let mut stmt = PreparedStatement::prepare(&mut handle, "SELECT ?").unwrap();
        let err = stmt.bind_float(0, 1.5, false).unwrap_err();
        match err {
            OdbcError::Bind { kind, index, diagnostics, .. } => {
                assert_eq!(kind, Some(ValueKind::Float));
                assert_eq!(index, 0);
                assert!(diagnostics.contains("07009"));
            }
            other => panic!("Expected bind error, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_year_is_bind_error() {
        let (_dir, _driver, mut handle) = connect(false);
        let mut stmt = PreparedStatement::prepare(&mut handle, "SELECT ?, ?").unwrap();
        let far = NaiveDate::from_ymd_opt(40_000, 1, 1).unwrap();

        let err = stmt.bind_date(1, far, false).unwrap_err();
        assert!(matches!(
            err,
            OdbcError::Bind { kind: Some(ValueKind::Date), index: 1, .. }
        ));
        let err = stmt
            .bind_parameter(2, &Value::DateTime(far.and_hms_opt(12, 0, 0).unwrap()), false)
            .unwrap_err();
        assert!(matches!(
            err,
            OdbcError::Bind { kind: Some(ValueKind::DateTime), index: 2, .. }
        ));
        assert!(err.diagnostics().is_some_and(|d| d.contains("year 40000 out of range")));
        assert_eq!(stmt.bound_parameters(), 0);
    }

    #[test]
    fn test_reset_failure_is_bind_error() {
        let (_dir, driver, mut handle) = connect(false);
        let mut stmt = PreparedStatement::prepare(&mut handle, "SELECT ?").unwrap();
        driver.inject_failure("reset_parameters", "HY000", "reset rejected");
        let err = stmt.reset().unwrap_err();
        assert!(matches!(err, OdbcError::Bind { kind: None, .. }));
    }

    #[test]
    fn test_update_without_rows_reports_zero() {
        let (_dir, _driver, mut handle) = connect(false);
        handle.execute_direct("CREATE TABLE t (a INTEGER)").unwrap();
        let mut stmt = PreparedStatement::prepare(&mut handle, "UPDATE t SET a = ?").unwrap();
        stmt.bind_integer(1, 1, false).unwrap();
        stmt.execute(&mut handle).unwrap();
        assert_eq!(stmt.affected_rows().unwrap(), 0);
    }

    #[test]
    fn test_prepare_retries_after_lost_connection() {
        let (_dir, driver, mut handle) = connect(true);
        driver.sever_connections();
        let stmt = PreparedStatement::prepare(&mut handle, "SELECT 1").unwrap();
        assert_eq!(stmt.sql(), "SELECT 1");
        assert_eq!(driver.statement_count("SELECT 1"), 2);
    }

    #[test]
    fn test_execute_rebinds_after_lost_connection() {
        let (_dir, driver, mut handle) = connect(true);
        handle.execute_direct("CREATE TABLE t (a INTEGER)").unwrap();
        let mut stmt = PreparedStatement::prepare(&mut handle, "INSERT INTO t VALUES (?)").unwrap();
        stmt.bind_integer(1, 42, false).unwrap();

        driver.sever_connections();
        stmt.execute(&mut handle).unwrap();
        assert_eq!(stmt.affected_rows().unwrap(), 1);
        assert_eq!(driver.statement_count("INSERT INTO t VALUES (?)"), 2);
        assert_eq!(driver.open_handles(HandleKind::Statement), 1);
    }

    #[test]
    fn test_lost_connection_is_retried_only_once() {
        let (_dir, driver, mut handle) = connect(true);
        let mut stmt = PreparedStatement::prepare(&mut handle, "SELECT 1").unwrap();
        driver.inject_failures("execute", 2, "08S01", "Communication link failure");
        let err = stmt.execute(&mut handle).unwrap_err();
        assert!(matches!(err, OdbcError::Execute { .. }));
        assert_eq!(driver.statement_count("SELECT 1"), 2);
    }
}
