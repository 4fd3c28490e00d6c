/// Connection Module
///
/// The connection facade: the five statement verbs (select, insert, update,
/// remove, execute) in direct and prepared form, transaction lifecycle
/// management and dialect-specific last-insert-id retrieval.

use crate::config::ConnectionConfig;
use crate::core::db::cursor::ResultCursor;
use crate::core::db::handle::ConnectionHandle;
use crate::core::db::prepared::PreparedStatement;
use crate::core::db::value::{Parameter, Value, ValueKind};
use crate::core::{OdbcError, Result};
use crate::driver::{CallLevelApi, Completion};
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Represents connection transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    /// No active transaction (autocommit mode)
    #[default]
    Autocommit,
    /// Transaction in progress
    Transaction,
}

/// Doubles every single quote so `text` can be embedded in a string literal.
pub fn escape(text: &str) -> String {
    text.replace('\'', "''")
}

/// A connection to one data source.
pub struct Connection {
    handle: ConnectionHandle,
    transaction_state: TransactionState,
    rollback_failures: RefCell<Vec<String>>,
}

impl Connection {
    /// Connects through `api` with `config`.
    ///
    /// # Returns
    ///
    /// The connection, or `OdbcError::Connect` when allocation or connecting fails.
    pub fn new(api: Rc<dyn CallLevelApi>, config: ConnectionConfig) -> Result<Self> {
        let handle = ConnectionHandle::new(api, Rc::new(config))?;
        Ok(Connection {
            handle,
            transaction_state: TransactionState::default(),
            rollback_failures: RefCell::new(Vec::new()),
        })
    }

    /// Connects through the system ODBC driver manager.
    #[cfg(feature = "odbc")]
    pub fn connect(config: ConnectionConfig) -> Result<Self> {
        Connection::new(Rc::new(crate::driver::OdbcDriver::new()), config)
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.handle.config()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Rebuilds the connection-level handle. An open transaction is lost.
    pub fn reconnect(&mut self) -> Result<()> {
        if self.is_transaction_active() {
            warn!("reconnecting with an open transaction; it is discarded");
            self.transaction_state = TransactionState::Autocommit;
        }
        self.handle.reconnect()
    }

    /// Doubles every single quote in `text`.
    pub fn escape(&self, text: &str) -> String {
        escape(text)
    }

    /// Runs a query and returns a cursor over its rows.
    pub fn select(&mut self, sql: &str) -> Result<ResultCursor> {
        let mut statement = PreparedStatement::prepare(&mut self.handle, sql)?;
        statement.execute(&mut self.handle)?;
        Ok(statement.cursor())
    }

    /// Runs an insert and returns the identifier it generated (0 if unknown).
    pub fn insert(&mut self, sql: &str) -> Result<u64> {
        self.handle.execute_direct(sql)?;
        self.last_insert_id()
    }

    /// Runs an update and returns the number of affected rows.
    pub fn update(&mut self, sql: &str) -> Result<u64> {
        self.handle.execute_direct(sql)
    }

    /// Runs a delete and returns the number of affected rows.
    pub fn remove(&mut self, sql: &str) -> Result<u64> {
        self.handle.execute_direct(sql)
    }

    /// Runs any statement and returns the number of affected rows.
    pub fn execute(&mut self, sql: &str) -> Result<u64> {
        self.handle.execute_direct(sql)
    }

    /// Compiles `sql` for repeated execution with `run_prepared_*`.
    pub fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        PreparedStatement::prepare(&mut self.handle, sql)
    }

    fn run_prepared(&mut self, statement: &mut PreparedStatement, parameters: &[Parameter]) -> Result<()> {
        statement.reset()?;
        statement.bind_all(parameters)?;
        statement.execute(&mut self.handle)
    }

    pub fn run_prepared_select(
        &mut self,
        statement: &mut PreparedStatement,
        parameters: &[Parameter],
    ) -> Result<ResultCursor> {
        self.run_prepared(statement, parameters)?;
        Ok(statement.cursor())
    }

    pub fn run_prepared_insert(
        &mut self,
        statement: &mut PreparedStatement,
        parameters: &[Parameter],
    ) -> Result<u64> {
        self.run_prepared(statement, parameters)?;
        self.last_insert_id()
    }

    pub fn run_prepared_update(
        &mut self,
        statement: &mut PreparedStatement,
        parameters: &[Parameter],
    ) -> Result<u64> {
        self.run_prepared(statement, parameters)?;
        statement.affected_rows()
    }

    pub fn run_prepared_remove(
        &mut self,
        statement: &mut PreparedStatement,
        parameters: &[Parameter],
    ) -> Result<u64> {
        self.run_prepared(statement, parameters)?;
        statement.affected_rows()
    }

    pub fn run_prepared_execute(
        &mut self,
        statement: &mut PreparedStatement,
        parameters: &[Parameter],
    ) -> Result<u64> {
        self.run_prepared(statement, parameters)?;
        statement.affected_rows()
    }

    /// Identifier generated by the last insert, via the dialect's statement.
    ///
    /// # Returns
    ///
    /// The identifier, 0 when the statement returns no row or NULL, or
    /// `OdbcError::UnsupportedDialect` when the dialect has no such statement.
    pub fn last_insert_id(&mut self) -> Result<u64> {
        let sql = self.config().dialect.last_insert_id_statement()?;
        let mut cursor = self.select(sql)?;
        let id = match cursor.fetch_row(&[ValueKind::Integer])? {
            Some(values) => match values.into_iter().next().flatten() {
                Some(Value::Integer(id)) => Some(id),
                _ => None,
            },
            None => None,
        };
        match id {
            Some(id) => Ok(u64::try_from(id).unwrap_or(0)),
            None => {
                warn!("{} returned no identifier; reporting 0", sql);
                Ok(0)
            }
        }
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.transaction_state
    }

    pub fn is_transaction_active(&self) -> bool {
        self.transaction_state == TransactionState::Transaction
    }

    /// Opens a transaction by switching driver autocommit off.
    ///
    /// # Returns
    ///
    /// `OdbcError::TransactionState` when a transaction is already open.
    pub fn start_transaction(&mut self) -> Result<()> {
        if self.is_transaction_active() {
            return Err(OdbcError::TransactionState {
                operation: "start_transaction".to_string(),
                message: "a transaction is already in progress".to_string(),
            });
        }
        if self.config().debug {
            debug!("starting transaction");
        }
        self.handle.set_autocommit(false)?;
        self.transaction_state = TransactionState::Transaction;
        Ok(())
    }

    /// Commits the open transaction and switches autocommit back on.
    ///
    /// If the commit itself fails the transaction stays open and autocommit
    /// stays off, so the caller can still roll back.
    pub fn commit_transaction(&mut self) -> Result<()> {
        self.end_transaction("commit_transaction", Completion::Commit)
    }

    /// Rolls back the open transaction and switches autocommit back on.
    ///
    /// With `report` set, a warning records that an unfinished transaction is
    /// being discarded.
    pub fn rollback_transaction(&mut self, report: bool) -> Result<()> {
        if report && self.is_transaction_active() {
            warn!("rolling back unfinished transaction");
        }
        self.end_transaction("rollback_transaction", Completion::Rollback)
    }

    fn end_transaction(&mut self, operation: &str, completion: Completion) -> Result<()> {
        if !self.is_transaction_active() {
            return Err(OdbcError::TransactionState {
                operation: operation.to_string(),
                message: "no transaction in progress".to_string(),
            });
        }
        if !self.handle.in_manual_commit() {
            // The connection was rebuilt under the transaction
            self.transaction_state = TransactionState::Autocommit;
            return Err(OdbcError::TransactionState {
                operation: operation.to_string(),
                message: "the transaction was lost when the connection was rebuilt".to_string(),
            });
        }
        if self.config().debug {
            debug!("{}", operation);
        }
        self.handle.end_transaction(completion)?;
        self.transaction_state = TransactionState::Autocommit;
        self.handle.set_autocommit(true)
    }

    /// Records a failed rollback. Never fails; safe to call while another
    /// error is propagating.
    pub fn report_rollback_failure(&self, message: &str) {
        error!("transaction rollback failed: {}", message);
        self.rollback_failures.borrow_mut().push(message.to_string());
    }

    /// Messages passed to [`Connection::report_rollback_failure`] so far.
    pub fn rollback_failures(&self) -> Vec<String> {
        self.rollback_failures.borrow().clone()
    }

    /// Starts a transaction that is rolled back unless committed.
    pub fn transaction(&mut self) -> Result<TransactionGuard<'_>> {
        self.start_transaction()?;
        Ok(TransactionGuard {
            connection: self,
            finished: false,
        })
    }
}

/// A transaction scope from [`Connection::transaction`].
///
/// Dropping the guard without [`TransactionGuard::commit`] rolls the
/// transaction back with `report` set; a failing rollback is passed to
/// [`Connection::report_rollback_failure`].
pub struct TransactionGuard<'a> {
    connection: &'a mut Connection,
    finished: bool,
}

impl TransactionGuard<'_> {
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.connection.commit_transaction()
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.connection.rollback_transaction(false)
    }
}

impl Deref for TransactionGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection
    }
}

impl DerefMut for TransactionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if self.finished || !self.connection.is_transaction_active() {
            return;
        }
        if let Err(e) = self.connection.rollback_transaction(true) {
            self.connection.report_rollback_failure(&e.to_string());
        }
    }
}
