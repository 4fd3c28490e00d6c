/// Connection Handle Module
///
/// Owns the environment and connection-level native handles of one connection
/// and hands out statement handles scoped to it.
///
/// ## Handle lifetimes
///
/// - the connection-level handle is either connected or `RawHandle::NULL`
/// - a [`StatementHandle`] frees its native handle when dropped, unless the
///   connection it was allocated on has been torn down since; disconnecting
///   releases every statement of a connection, so those handles are stale
/// - dropping the `ConnectionHandle` disconnects and frees the connection
///   handle, then frees the environment handle
///
/// ## Reconnect-and-retry
///
/// With `auto_reconnect` set, an operation failing with a connection-lost
/// SQLSTATE rebuilds the connection from the stored configuration and is
/// retried once. See [`ConnectionHandle::needed_reconnect`]. While autocommit
/// is off the connection is never rebuilt implicitly: the open transaction
/// would be lost and the retried work committed on its own.

use crate::config::ConnectionConfig;
use crate::core::db::diagnostics::{read_diagnostics, read_diagnostics_for, reports_connection_lost};
use crate::core::{OdbcError, Result};
use crate::driver::{
    poll_until_done, CallLevelApi, Completion, HandleKind, RawHandle, SqlReturn,
};
use std::cell::Cell;
use std::rc::Rc;
use tracing::{debug, warn};

/// Outcome of one attempt at an operation that may be retried after a reconnect.
pub(crate) enum Attempt<T> {
    Done(T),
    /// The connection was lost; carries the error to raise if no retry happens
    ConnectionLost(OdbcError),
}

/// A statement-level native handle, shared by a prepared statement and the
/// cursors reading its results. The last owner frees it.
pub struct StatementHandle {
    api: Rc<dyn CallLevelApi>,
    raw: RawHandle,
    epoch: Rc<Cell<u64>>,
    born: u64,
}

impl StatementHandle {
    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    pub fn api(&self) -> &dyn CallLevelApi {
        self.api.as_ref()
    }

    /// `false` once the owning connection was disconnected or rebuilt.
    pub fn is_live(&self) -> bool {
        !self.raw.is_null() && self.epoch.get() == self.born
    }

    /// Aggregated diagnostics of this handle.
    pub fn diagnostics(&self, rc: SqlReturn) -> String {
        read_diagnostics_for(self.api.as_ref(), HandleKind::Statement, self.raw, rc)
    }
}

impl std::fmt::Debug for StatementHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementHandle")
            .field("raw", &self.raw)
            .field("live", &self.is_live())
            .finish()
    }
}

impl Drop for StatementHandle {
    fn drop(&mut self) {
        if self.is_live() {
            self.api.free_handle(HandleKind::Statement, self.raw);
        }
    }
}

/// Environment plus connection-level handle of one data source connection.
pub struct ConnectionHandle {
    api: Rc<dyn CallLevelApi>,
    config: Rc<ConnectionConfig>,
    env: RawHandle,
    dbc: RawHandle,
    /// Bumped whenever the connection-level handle is torn down
    epoch: Rc<Cell<u64>>,
    completed_connection_string: Option<String>,
    /// Autocommit switched off on the current connection
    manual_commit: bool,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("env", &self.env)
            .field("dbc", &self.dbc)
            .finish()
    }
}

impl ConnectionHandle {
    /// Allocates the environment, negotiates ODBC 3.x and connects.
    ///
    /// # Arguments
    ///
    /// * `api` - Call-level backend to drive
    /// * `config` - Shared connection configuration
    ///
    /// # Returns
    ///
    /// The connected handle, or `OdbcError::Connect` with the aggregated
    /// diagnostics. Any partially allocated native handle is released first.
    pub fn new(api: Rc<dyn CallLevelApi>, config: Rc<ConnectionConfig>) -> Result<Self> {
        let mut handle = ConnectionHandle {
            api,
            config,
            env: RawHandle::NULL,
            dbc: RawHandle::NULL,
            epoch: Rc::new(Cell::new(0)),
            completed_connection_string: None,
            manual_commit: false,
        };

        let mut env = RawHandle::NULL;
        let rc = handle.api.alloc_handle(HandleKind::Environment, RawHandle::NULL, &mut env);
        if !rc.succeeded() {
            return Err(OdbcError::Connect {
                operation: "SQLAllocHandle(SQL_HANDLE_ENV)".to_string(),
                diagnostics: read_diagnostics_for(handle.api.as_ref(), HandleKind::Environment, env, rc),
            });
        }
        handle.env = env;

        let rc = handle.api.set_odbc_version(env);
        if !rc.succeeded() {
            return Err(OdbcError::Connect {
                operation: "SQLSetEnvAttr(SQL_ATTR_ODBC_VERSION)".to_string(),
                diagnostics: read_diagnostics_for(handle.api.as_ref(), HandleKind::Environment, env, rc),
            });
        }

        handle.open_connection()?;
        Ok(handle)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn api(&self) -> &dyn CallLevelApi {
        self.api.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        !self.dbc.is_null()
    }

    /// Native connection-level handle, `RawHandle::NULL` when not connected.
    pub fn raw_connection(&self) -> RawHandle {
        self.dbc
    }

    /// `true` while autocommit is off, i.e. a transaction is open on the
    /// current connection.
    pub fn in_manual_commit(&self) -> bool {
        self.manual_commit
    }

    /// Connection string completed by the driver, when connected through one.
    pub fn completed_connection_string(&self) -> Option<&str> {
        self.completed_connection_string.as_deref()
    }

    fn open_connection(&mut self) -> Result<()> {
        let mut dbc = RawHandle::NULL;
        let rc = self.api.alloc_handle(HandleKind::Connection, self.env, &mut dbc);
        if !rc.succeeded() {
            return Err(OdbcError::Connect {
                operation: "SQLAllocHandle(SQL_HANDLE_DBC)".to_string(),
                diagnostics: read_diagnostics_for(self.api.as_ref(), HandleKind::Environment, self.env, rc),
            });
        }

        let (operation, rc) = match &self.config.connection_string {
            Some(connection_string) => {
                let mut completed = String::new();
                let rc = self.api.driver_connect(
                    dbc,
                    connection_string,
                    self.config.completion,
                    &mut completed,
                );
                if rc.succeeded() {
                    self.completed_connection_string = Some(completed);
                }
                ("SQLDriverConnect", rc)
            }
            None => (
                "SQLConnect",
                self.api.connect(
                    dbc,
                    &self.config.data_source_name,
                    self.config.username.as_deref(),
                    self.config.password.as_deref(),
                ),
            ),
        };

        if !rc.succeeded() {
            let diagnostics = read_diagnostics_for(self.api.as_ref(), HandleKind::Connection, dbc, rc);
            // Never connected: free without disconnecting
            self.api.free_handle(HandleKind::Connection, dbc);
            return Err(OdbcError::Connect {
                operation: operation.to_string(),
                diagnostics,
            });
        }
        if rc == SqlReturn::SuccessWithInfo {
            warn!(
                "{}: {}",
                operation,
                read_diagnostics(self.api.as_ref(), HandleKind::Connection, dbc)
            );
        }
        self.dbc = dbc;

        if self.config.debug {
            debug!(
                "connected to '{}' via {} ({})",
                self.config.data_source_name,
                operation,
                self.api.backend_name()
            );
        }

        if let Some(database) = self.config.database.clone() {
            let sql = format!("USE {}", database);
            match self.try_execute_direct(&sql) {
                Ok(Attempt::Done(_)) => {}
                Ok(Attempt::ConnectionLost(e)) | Err(e) => {
                    return Err(OdbcError::Connect {
                        operation: sql,
                        diagnostics: e.diagnostics().unwrap_or_default().to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    fn close_connection(&mut self) {
        if self.dbc.is_null() {
            return;
        }
        // Disconnecting releases every statement allocated on the connection
        self.epoch.set(self.epoch.get() + 1);
        let rc = self.api.disconnect(self.dbc);
        if !rc.succeeded() && self.config.debug {
            debug!(
                "SQLDisconnect: {}",
                read_diagnostics_for(self.api.as_ref(), HandleKind::Connection, self.dbc, rc)
            );
        }
        self.api.free_handle(HandleKind::Connection, self.dbc);
        self.dbc = RawHandle::NULL;
        self.completed_connection_string = None;
        // A fresh connection starts in autocommit mode
        self.manual_commit = false;
    }

    /// Tears the connection-level handle down and connects again with the
    /// stored configuration. Outstanding statement handles become stale.
    pub fn reconnect(&mut self) -> Result<()> {
        warn!("reconnecting to '{}'", self.config.data_source_name);
        self.close_connection();
        self.open_connection()
    }

    /// Decides whether a failed call on `handle` was caused by a lost connection.
    ///
    /// Only `SQL_ERROR` with a connection-lost SQLSTATE qualifies, and only when
    /// `auto_reconnect` is configured and no transaction is open. The caller
    /// then drops the stale statement handle, calls
    /// [`ConnectionHandle::reconnect`] and retries once.
    pub fn needed_reconnect(
        &self,
        rc: SqlReturn,
        kind: HandleKind,
        handle: RawHandle,
        operation: &str,
    ) -> bool {
        if !self.config.auto_reconnect || rc != SqlReturn::Error {
            return false;
        }
        let lost = reports_connection_lost(self.api.as_ref(), kind, handle);
        if !lost {
            return false;
        }
        if self.manual_commit {
            warn!(
                "{}: connection to '{}' lost inside a transaction; not reconnecting",
                operation, self.config.data_source_name
            );
            return false;
        }
        warn!("{}: connection to '{}' lost", operation, self.config.data_source_name);
        true
    }

    /// Allocates a statement handle on the current connection; `Err` holds diagnostics.
    pub(crate) fn try_allocate_statement(&self) -> std::result::Result<StatementHandle, String> {
        if self.dbc.is_null() {
            return Err("connection is not open".to_string());
        }
        let mut raw = RawHandle::NULL;
        let rc = self.api.alloc_handle(HandleKind::Statement, self.dbc, &mut raw);
        if !rc.succeeded() {
            return Err(read_diagnostics_for(self.api.as_ref(), HandleKind::Connection, self.dbc, rc));
        }
        Ok(StatementHandle {
            api: Rc::clone(&self.api),
            raw,
            epoch: Rc::clone(&self.epoch),
            born: self.epoch.get(),
        })
    }

    pub fn allocate_statement(&self) -> Result<StatementHandle> {
        self.try_allocate_statement().map_err(|diagnostics| OdbcError::Prepare {
            operation: "SQLAllocHandle(SQL_HANDLE_STMT)".to_string(),
            diagnostics,
        })
    }

    fn try_execute_direct(&self, sql: &str) -> Result<Attempt<u64>> {
        let statement = self.try_allocate_statement().map_err(|diagnostics| OdbcError::Execute {
            operation: "SQLAllocHandle(SQL_HANDLE_STMT)".to_string(),
            diagnostics,
        })?;
        if self.config.debug {
            debug!("SQLExecDirect: {}", sql);
        }
        let rc = poll_until_done(|| self.api.exec_direct(statement.raw(), sql));
        match rc {
            SqlReturn::Success | SqlReturn::SuccessWithInfo => {
                if rc == SqlReturn::SuccessWithInfo {
                    warn!("SQLExecDirect: {}", statement.diagnostics(rc));
                }
                let mut count: isize = 0;
                let rc = self.api.row_count(statement.raw(), &mut count);
                if !rc.succeeded() {
                    return Err(OdbcError::Execute {
                        operation: "SQLRowCount".to_string(),
                        diagnostics: statement.diagnostics(rc),
                    });
                }
                Ok(Attempt::Done(count.max(0) as u64))
            }
            // No rows affected
            SqlReturn::NoData => Ok(Attempt::Done(0)),
            _ => {
                let error = OdbcError::Execute {
                    operation: "SQLExecDirect".to_string(),
                    diagnostics: statement.diagnostics(rc),
                };
                if self.needed_reconnect(rc, HandleKind::Statement, statement.raw(), "SQLExecDirect") {
                    Ok(Attempt::ConnectionLost(error))
                } else {
                    Err(error)
                }
            }
        }
    }

    /// Executes `sql` without a separate prepare step.
    ///
    /// # Returns
    ///
    /// The affected-row count; 0 when the driver reports that no rows were
    /// affected. The statement handle is released on every path.
    pub fn execute_direct(&mut self, sql: &str) -> Result<u64> {
        match self.try_execute_direct(sql)? {
            Attempt::Done(count) => Ok(count),
            Attempt::ConnectionLost(error) => {
                self.recover(error)?;
                match self.try_execute_direct(sql)? {
                    Attempt::Done(count) => Ok(count),
                    Attempt::ConnectionLost(error) => Err(error),
                }
            }
        }
    }

    /// Reconnects after `original` reported a lost connection. A failed
    /// reconnect surfaces `original` rather than the connect error.
    pub(crate) fn recover(&mut self, original: OdbcError) -> Result<()> {
        match self.reconnect() {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("reconnect failed: {}", e);
                Err(original)
            }
        }
    }

    fn try_set_autocommit(&mut self, enabled: bool) -> Result<Attempt<()>> {
        let operation = "SQLSetConnectAttr(SQL_ATTR_AUTOCOMMIT)";
        if self.dbc.is_null() {
            return Err(OdbcError::Execute {
                operation: operation.to_string(),
                diagnostics: "connection is not open".to_string(),
            });
        }
        let rc = self.api.set_autocommit(self.dbc, enabled);
        if rc.succeeded() {
            if rc == SqlReturn::SuccessWithInfo {
                warn!(
                    "{}: {}",
                    operation,
                    read_diagnostics(self.api.as_ref(), HandleKind::Connection, self.dbc)
                );
            }
            self.manual_commit = !enabled;
            return Ok(Attempt::Done(()));
        }
        let error = OdbcError::Execute {
            operation: operation.to_string(),
            diagnostics: read_diagnostics_for(self.api.as_ref(), HandleKind::Connection, self.dbc, rc),
        };
        if self.needed_reconnect(rc, HandleKind::Connection, self.dbc, operation) {
            Ok(Attempt::ConnectionLost(error))
        } else {
            Err(error)
        }
    }

    /// Switches driver autocommit, retrying once after a reconnect.
    pub fn set_autocommit(&mut self, enabled: bool) -> Result<()> {
        match self.try_set_autocommit(enabled)? {
            Attempt::Done(()) => Ok(()),
            Attempt::ConnectionLost(error) => {
                self.recover(error)?;
                match self.try_set_autocommit(enabled)? {
                    Attempt::Done(()) => Ok(()),
                    Attempt::ConnectionLost(error) => Err(error),
                }
            }
        }
    }

    /// Commits or rolls back the native transaction.
    pub fn end_transaction(&self, completion: Completion) -> Result<()> {
        let operation = format!("SQLEndTran({:?})", completion);
        let rc = self.api.end_transaction(self.dbc, completion);
        if rc.succeeded() {
            if rc == SqlReturn::SuccessWithInfo {
                warn!(
                    "{}: {}",
                    operation,
                    read_diagnostics(self.api.as_ref(), HandleKind::Connection, self.dbc)
                );
            }
            return Ok(());
        }
        Err(OdbcError::Execute {
            operation,
            diagnostics: read_diagnostics_for(self.api.as_ref(), HandleKind::Connection, self.dbc, rc),
        })
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close_connection();
        if !self.env.is_null() {
            self.api.free_handle(HandleKind::Environment, self.env);
            self.env = RawHandle::NULL;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SqliteDriver;
    use tempfile::TempDir;

    fn setup(auto_reconnect: bool) -> (TempDir, Rc<SqliteDriver>, Rc<ConnectionConfig>) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("handle.db");
        let config = ConnectionConfig::new(path.to_str().unwrap()).with_auto_reconnect(auto_reconnect);
        (dir, Rc::new(SqliteDriver::new()), Rc::new(config))
    }

    #[test]
    fn test_connect_and_drop_release_all_handles() {
        let (_dir, driver, config) = setup(false);
        {
            let handle = ConnectionHandle::new(driver.clone(), config).unwrap();
            assert!(handle.is_connected());
            let _stmt = handle.allocate_statement().unwrap();
            assert_eq!(driver.open_handles(HandleKind::Statement), 1);
        }
        assert_eq!(driver.open_handles(HandleKind::Environment), 0);
        assert_eq!(driver.open_handles(HandleKind::Connection), 0);
        assert_eq!(driver.open_handles(HandleKind::Statement), 0);
    }

    #[test]
    fn test_connect_failure_frees_connection_handle() {
        let driver = Rc::new(SqliteDriver::new());
        let config = Rc::new(ConnectionConfig::new("/nonexistent-dir/for/sure/x.db"));
        let err = ConnectionHandle::new(driver.clone(), config).unwrap_err();
        match err {
            OdbcError::Connect { operation, diagnostics } => {
                assert_eq!(operation, "SQLConnect");
                assert!(diagnostics.contains("08001"));
            }
            other => panic!("Expected connect error, got {:?}", other),
        }
        assert_eq!(driver.open_handles(HandleKind::Connection), 0);
        assert_eq!(driver.open_handles(HandleKind::Environment), 0);
    }

    #[test]
    fn test_execute_direct_frees_statement_on_every_path() {
        let (_dir, driver, config) = setup(false);
        let mut handle = ConnectionHandle::new(driver.clone(), config).unwrap();
        handle.execute_direct("CREATE TABLE t (a INTEGER)").unwrap();
        assert_eq!(handle.execute_direct("INSERT INTO t VALUES (1), (2)").unwrap(), 2);
        assert_eq!(handle.execute_direct("UPDATE t SET a = 3 WHERE a > 10").unwrap(), 0);
        assert!(handle.execute_direct("SELECT * FROM missing").is_err());
        assert_eq!(driver.open_handles(HandleKind::Statement), 0);
    }

    #[test]
    fn test_database_is_selected_after_connect() {
        let (_dir, driver, config) = setup(false);
        let config = Rc::new((*config).clone().with_database("main"));
        let _handle = ConnectionHandle::new(driver.clone(), config).unwrap();
        assert_eq!(driver.statement_count("USE main"), 1);
    }

    #[test]
    fn test_execute_direct_reconnects_once() {
        let (_dir, driver, config) = setup(true);
        let mut handle = ConnectionHandle::new(driver.clone(), config).unwrap();
        handle.execute_direct("CREATE TABLE t (a INTEGER)").unwrap();

        driver.sever_connections();
        assert_eq!(handle.execute_direct("INSERT INTO t VALUES (1)").unwrap(), 1);
        assert_eq!(driver.statement_count("INSERT INTO t VALUES (1)"), 2);
        assert_eq!(driver.open_handles(HandleKind::Connection), 1);
    }

    #[test]
    fn test_lost_connection_without_auto_reconnect_fails() {
        let (_dir, driver, config) = setup(false);
        let mut handle = ConnectionHandle::new(driver.clone(), config).unwrap();
        driver.sever_connections();
        let err = handle.execute_direct("SELECT 1").unwrap_err();
        assert!(err.diagnostics().is_some_and(|d| d.contains("08S01")));
        assert_eq!(driver.statement_count("SELECT 1"), 1);
    }

    #[test]
    fn test_no_reconnect_while_autocommit_is_off() {
        let (_dir, driver, config) = setup(true);
        let mut handle = ConnectionHandle::new(driver.clone(), config).unwrap();
        handle.execute_direct("CREATE TABLE t (a INTEGER)").unwrap();
        handle.set_autocommit(false).unwrap();
        assert!(handle.in_manual_commit());

        driver.sever_connections();
        let err = handle.execute_direct("INSERT INTO t VALUES (1)").unwrap_err();
        assert!(err.diagnostics().is_some_and(|d| d.contains("08S01")));
        assert_eq!(driver.statement_count("INSERT INTO t VALUES (1)"), 1);
        assert!(handle.in_manual_commit());

        handle.reconnect().unwrap();
        assert!(!handle.in_manual_commit());
    }

    #[test]
    fn test_stale_statement_is_not_freed_twice() {
        let (_dir, driver, config) = setup(true);
        let mut handle = ConnectionHandle::new(driver.clone(), config).unwrap();
        let stale = handle.allocate_statement().unwrap();
        handle.reconnect().unwrap();
        assert!(!stale.is_live());
        let fresh = handle.allocate_statement().unwrap();
        drop(stale);
        assert!(fresh.is_live());
        assert_eq!(driver.open_handles(HandleKind::Statement), 1);
    }

    #[test]
    fn test_driver_connect_keeps_completed_string() {
        let (dir, driver, _config) = setup(false);
        let path = dir.path().join("dc.db");
        let config = ConnectionConfig::new("unused")
            .with_connection_string(&format!("Driver={{SQLite}};Database={}", path.display()));
        let handle = ConnectionHandle::new(driver, Rc::new(config)).unwrap();
        let completed = handle.completed_connection_string().unwrap();
        assert!(completed.contains(&format!("Database={};", path.display())));
    }
}
