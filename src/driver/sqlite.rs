/// SQLite Call-Level Emulation
///
/// `SqliteDriver` implements [`CallLevelApi`] on top of `rusqlite`, reproducing the
/// ODBC behaviours the connector depends on:
///
/// - diagnostics are cleared at the start of every call on a handle and read back
///   through `get_diag_rec`
/// - searched `UPDATE`/`DELETE` statements touching no rows report `SQL_NO_DATA`
/// - `get_data` into a character buffer is piecewise: truncation reports
///   `01004` with the remaining length, and the next call continues where the
///   previous one stopped
/// - manual-commit mode keeps an open transaction that `end_transaction` finishes
///   and immediately re-opens
/// - `USE <name>` succeeds without effect, since a SQLite connection has one catalog
///
/// The data source name is a SQLite database path. The MySQL, PostgreSQL and
/// T-SQL last-insert-id functions are registered on every connection, so all
/// four dialects can run against the same file.
///
/// Fault injection (`sever_connections`, `inject_failure`) and the statement log
/// exist for exercising the connector's recovery paths.

use super::{
    CallLevelApi, ColumnBuffer, Completion, DiagnosticRecord, DriverCompletion, HandleKind,
    ParameterBuffer, BoundParameter, RawHandle, SqlDate, SqlReturn, SqlTime, SqlTimestamp,
    NULL_DATA,
};
use crate::core::db::value::{parse_date, parse_time, parse_timestamp};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value as SqliteValue;
use rusqlite::Connection as SqliteConnection;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

const STATE_GENERAL_ERROR: &str = "HY000";
const STATE_SEQUENCE_ERROR: &str = "HY010";
const STATE_UNABLE_TO_CONNECT: &str = "08001";
const STATE_ALREADY_CONNECTED: &str = "08002";
const STATE_NOT_CONNECTED: &str = "08003";
const STATE_LINK_FAILURE: &str = "08S01";
const STATE_TRUNCATED: &str = "01004";
const STATE_COUNT_INCORRECT: &str = "07002";
const STATE_INVALID_INDEX: &str = "07009";
const STATE_INVALID_CAST: &str = "22018";
const STATE_INVALID_CURSOR: &str = "24000";
const STATE_CONSTRAINT: &str = "23000";
const STATE_NO_DATA_SOURCE: &str = "IM002";

/// Functions registered on every connection that report the last inserted rowid.
const LAST_INSERT_FUNCTIONS: [&str; 3] = ["last_insert_id", "lastval", "scope_identity"];

struct EnvironmentState {
    odbc3: bool,
    diagnostics: Vec<DiagnosticRecord>,
}

struct ConnectionState {
    env: usize,
    connection: Option<SqliteConnection>,
    last_rowid: Arc<AtomicI64>,
    autocommit: bool,
    severed: bool,
    diagnostics: Vec<DiagnosticRecord>,
}

struct ResultSet {
    column_count: usize,
    rows: Vec<Vec<SqliteValue>>,
    /// `None` until the first fetch
    position: Option<usize>,
}

struct StatementState {
    dbc: usize,
    sql: Option<String>,
    parameters: BTreeMap<u16, SqliteValue>,
    result: Option<ResultSet>,
    affected: isize,
    /// Column and byte offset of an unfinished piecewise character retrieval
    text_progress: Option<(u16, usize)>,
    diagnostics: Vec<DiagnosticRecord>,
}

type Failure = (&'static str, i32, String);

/// Embedded call-level driver backed by SQLite.
pub struct SqliteDriver {
    environments: RefCell<HashMap<usize, EnvironmentState>>,
    connections: RefCell<HashMap<usize, ConnectionState>>,
    statements: RefCell<HashMap<usize, StatementState>>,
    next_handle: Cell<usize>,
    statement_log: RefCell<Vec<String>>,
    injected: RefCell<HashMap<&'static str, (DiagnosticRecord, usize)>>,
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SqliteDriver {
    pub fn new() -> Self {
        SqliteDriver {
            environments: RefCell::new(HashMap::new()),
            connections: RefCell::new(HashMap::new()),
            statements: RefCell::new(HashMap::new()),
            next_handle: Cell::new(1),
            statement_log: RefCell::new(Vec::new()),
            injected: RefCell::new(HashMap::new()),
        }
    }

    /// Every SQL text passed to `prepare` or `exec_direct`, in order.
    pub fn statement_log(&self) -> Vec<String> {
        self.statement_log.borrow().clone()
    }

    /// Number of times exactly `sql` was prepared or executed directly.
    pub fn statement_count(&self, sql: &str) -> usize {
        self.statement_log.borrow().iter().filter(|s| s.as_str() == sql).count()
    }

    pub fn clear_statement_log(&self) {
        self.statement_log.borrow_mut().clear();
    }

    /// Number of live handles of `kind`.
    pub fn open_handles(&self, kind: HandleKind) -> usize {
        match kind {
            HandleKind::Environment => self.environments.borrow().len(),
            HandleKind::Connection => self.connections.borrow().len(),
            HandleKind::Statement => self.statements.borrow().len(),
        }
    }

    /// Marks every live connection as lost: further work on them or their
    /// statements fails with SQLSTATE `08S01` until they are rebuilt.
    pub fn sever_connections(&self) {
        for state in self.connections.borrow_mut().values_mut() {
            state.severed = true;
        }
    }

    /// Makes the next call of `primitive` (e.g. `"end_transaction"`) fail with `state`.
    pub fn inject_failure(&self, primitive: &'static str, state: &str, message: &str) {
        self.inject_failures(primitive, 1, state, message);
    }

    /// Makes the next `times` calls of `primitive` fail with `state`.
    pub fn inject_failures(&self, primitive: &'static str, times: usize, state: &str, message: &str) {
        let record = DiagnosticRecord {
            state: state.to_string(),
            native_error: -1,
            message: message.to_string(),
        };
        self.injected.borrow_mut().insert(primitive, (record, times));
    }

    fn take_injected(&self, primitive: &'static str) -> Option<DiagnosticRecord> {
        let mut injected = self.injected.borrow_mut();
        let (record, remaining) = injected.get_mut(primitive)?;
        let record = record.clone();
        *remaining -= 1;
        if *remaining == 0 {
            injected.remove(primitive);
        }
        Some(record)
    }

    fn allocate_id(&self) -> usize {
        let id = self.next_handle.get();
        self.next_handle.set(id + 1);
        id
    }

    fn log_statement(&self, sql: &str) {
        debug!("sqlite driver: {}", sql);
        self.statement_log.borrow_mut().push(sql.to_string());
    }

    fn post(&self, kind: HandleKind, handle: RawHandle, record: DiagnosticRecord) {
        match kind {
            HandleKind::Environment => {
                if let Some(state) = self.environments.borrow_mut().get_mut(&handle.0) {
                    state.diagnostics.push(record);
                }
            }
            HandleKind::Connection => {
                if let Some(state) = self.connections.borrow_mut().get_mut(&handle.0) {
                    state.diagnostics.push(record);
                }
            }
            HandleKind::Statement => {
                if let Some(state) = self.statements.borrow_mut().get_mut(&handle.0) {
                    state.diagnostics.push(record);
                }
            }
        }
    }

    fn fail(&self, kind: HandleKind, handle: RawHandle, failure: Failure) -> SqlReturn {
        let (state, native_error, message) = failure;
        self.post(
            kind,
            handle,
            DiagnosticRecord {
                state: state.to_string(),
                native_error,
                message,
            },
        );
        SqlReturn::Error
    }

    fn fail_injected(&self, kind: HandleKind, handle: RawHandle, record: DiagnosticRecord) -> SqlReturn {
        self.post(kind, handle, record);
        SqlReturn::Error
    }

    /// Clears diagnostics of `handle`; returns `false` when the handle is unknown.
    fn begin_call(&self, kind: HandleKind, handle: RawHandle) -> bool {
        match kind {
            HandleKind::Environment => self
                .environments
                .borrow_mut()
                .get_mut(&handle.0)
                .map(|s| s.diagnostics.clear())
                .is_some(),
            HandleKind::Connection => self
                .connections
                .borrow_mut()
                .get_mut(&handle.0)
                .map(|s| s.diagnostics.clear())
                .is_some(),
            HandleKind::Statement => self
                .statements
                .borrow_mut()
                .get_mut(&handle.0)
                .map(|s| s.diagnostics.clear())
                .is_some(),
        }
    }

    /// Checks that connection `dbc` is open and its link alive.
    fn link_status(&self, dbc: usize) -> Result<(), Failure> {
        let connections = self.connections.borrow();
        match connections.get(&dbc) {
            None => Err((STATE_NOT_CONNECTED, -1, "Connection does not exist".to_string())),
            Some(state) if state.severed => Err((
                STATE_LINK_FAILURE,
                -1,
                "Communication link failure".to_string(),
            )),
            Some(state) if state.connection.is_none() => {
                Err((STATE_NOT_CONNECTED, -1, "Connection not open".to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    fn statement_dbc(&self, stmt: RawHandle) -> Option<usize> {
        self.statements.borrow().get(&stmt.0).map(|s| s.dbc)
    }

    fn open_database(&self, dbc: RawHandle, path: &str) -> SqlReturn {
        let mut connections = self.connections.borrow_mut();
        let state = match connections.get_mut(&dbc.0) {
            Some(state) => state,
            None => return SqlReturn::InvalidHandle,
        };
        if state.connection.is_some() {
            drop(connections);
            return self.fail(
                HandleKind::Connection,
                dbc,
                (STATE_ALREADY_CONNECTED, -1, "Connection name in use".to_string()),
            );
        }

        let opened = SqliteConnection::open(path).and_then(|conn| {
            for name in LAST_INSERT_FUNCTIONS {
                let rowid = Arc::clone(&state.last_rowid);
                conn.create_scalar_function(name, 0, FunctionFlags::SQLITE_UTF8, move |_ctx| {
                    Ok(rowid.load(Ordering::SeqCst))
                })?;
            }
            Ok(conn)
        });

        match opened {
            Ok(conn) => {
                state.connection = Some(conn);
                state.autocommit = true;
                state.severed = false;
                SqlReturn::Success
            }
            Err(e) => {
                drop(connections);
                self.fail(
                    HandleKind::Connection,
                    dbc,
                    (
                        STATE_UNABLE_TO_CONNECT,
                        native_code(&e),
                        format!("[SQLite] unable to open '{}': {}", path, e),
                    ),
                )
            }
        }
    }

    /// Runs `sql` on the connection of `stmt` and stores the outcome on the statement.
    fn run(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        let dbc = match self.statement_dbc(stmt) {
            Some(dbc) => dbc,
            None => return SqlReturn::InvalidHandle,
        };
        if let Err(failure) = self.link_status(dbc) {
            return self.fail(HandleKind::Statement, stmt, failure);
        }

        let parameters = self
            .statements
            .borrow()
            .get(&stmt.0)
            .map(|s| s.parameters.clone())
            .unwrap_or_default();

        let outcome = {
            let connections = self.connections.borrow();
            let state = match connections.get(&dbc) {
                Some(state) => state,
                None => return SqlReturn::InvalidHandle,
            };
            let conn = match state.connection.as_ref() {
                Some(conn) => conn,
                None => return SqlReturn::InvalidHandle,
            };
            let outcome = run_statement(conn, sql, &parameters);
            state.last_rowid.store(conn.last_insert_rowid(), Ordering::SeqCst);
            outcome
        };

        match outcome {
            Ok((result, affected)) => {
                let no_rows_touched = result.is_none() && affected == 0 && is_searched_change(sql);
                if let Some(state) = self.statements.borrow_mut().get_mut(&stmt.0) {
                    state.result = result;
                    state.affected = affected as isize;
                    state.text_progress = None;
                }
                if no_rows_touched {
                    SqlReturn::NoData
                } else {
                    SqlReturn::Success
                }
            }
            Err(failure) => self.fail(HandleKind::Statement, stmt, failure),
        }
    }

    fn run_on_connection(&self, dbc: RawHandle, sql: &str) -> Result<(), Failure> {
        let connections = self.connections.borrow();
        let conn = connections
            .get(&dbc.0)
            .and_then(|s| s.connection.as_ref())
            .ok_or((STATE_NOT_CONNECTED, -1, "Connection not open".to_string()))?;
        conn.execute_batch(sql).map_err(|e| sqlite_failure(&e))
    }

    fn in_transaction(&self, dbc: RawHandle) -> bool {
        self.connections
            .borrow()
            .get(&dbc.0)
            .and_then(|s| s.connection.as_ref())
            .map(|c| !c.is_autocommit())
            .unwrap_or(false)
    }
}

impl CallLevelApi for SqliteDriver {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn alloc_handle(&self, kind: HandleKind, parent: RawHandle, out: &mut RawHandle) -> SqlReturn {
        *out = RawHandle::NULL;
        match kind {
            HandleKind::Environment => {
                let id = self.allocate_id();
                self.environments.borrow_mut().insert(
                    id,
                    EnvironmentState {
                        odbc3: false,
                        diagnostics: Vec::new(),
                    },
                );
                *out = RawHandle(id);
                SqlReturn::Success
            }
            HandleKind::Connection => {
                if !self.begin_call(HandleKind::Environment, parent) {
                    return SqlReturn::InvalidHandle;
                }
                let odbc3 = self
                    .environments
                    .borrow()
                    .get(&parent.0)
                    .map(|e| e.odbc3)
                    .unwrap_or(false);
                if !odbc3 {
                    return self.fail(
                        HandleKind::Environment,
                        parent,
                        (STATE_SEQUENCE_ERROR, -1, "ODBC version not set".to_string()),
                    );
                }
                let id = self.allocate_id();
                self.connections.borrow_mut().insert(
                    id,
                    ConnectionState {
                        env: parent.0,
                        connection: None,
                        last_rowid: Arc::new(AtomicI64::new(0)),
                        autocommit: true,
                        severed: false,
                        diagnostics: Vec::new(),
                    },
                );
                *out = RawHandle(id);
                SqlReturn::Success
            }
            HandleKind::Statement => {
                if !self.begin_call(HandleKind::Connection, parent) {
                    return SqlReturn::InvalidHandle;
                }
                let connected = self
                    .connections
                    .borrow()
                    .get(&parent.0)
                    .map(|s| s.connection.is_some())
                    .unwrap_or(false);
                if !connected {
                    return self.fail(
                        HandleKind::Connection,
                        parent,
                        (STATE_NOT_CONNECTED, -1, "Connection not open".to_string()),
                    );
                }
                let id = self.allocate_id();
                self.statements.borrow_mut().insert(
                    id,
                    StatementState {
                        dbc: parent.0,
                        sql: None,
                        parameters: BTreeMap::new(),
                        result: None,
                        affected: -1,
                        text_progress: None,
                        diagnostics: Vec::new(),
                    },
                );
                *out = RawHandle(id);
                SqlReturn::Success
            }
        }
    }

    fn free_handle(&self, kind: HandleKind, handle: RawHandle) -> SqlReturn {
        match kind {
            HandleKind::Environment => {
                let has_children = self.connections.borrow().values().any(|c| c.env == handle.0);
                if has_children {
                    return self.fail(
                        kind,
                        handle,
                        (STATE_SEQUENCE_ERROR, -1, "Connections still allocated".to_string()),
                    );
                }
                match self.environments.borrow_mut().remove(&handle.0) {
                    Some(_) => SqlReturn::Success,
                    None => SqlReturn::InvalidHandle,
                }
            }
            HandleKind::Connection => {
                let connected = match self.connections.borrow().get(&handle.0) {
                    Some(state) => state.connection.is_some(),
                    None => return SqlReturn::InvalidHandle,
                };
                if connected {
                    return self.fail(
                        kind,
                        handle,
                        (STATE_SEQUENCE_ERROR, -1, "Connection still open".to_string()),
                    );
                }
                self.connections.borrow_mut().remove(&handle.0);
                SqlReturn::Success
            }
            HandleKind::Statement => match self.statements.borrow_mut().remove(&handle.0) {
                Some(_) => SqlReturn::Success,
                None => SqlReturn::InvalidHandle,
            },
        }
    }

    fn set_odbc_version(&self, env: RawHandle) -> SqlReturn {
        match self.environments.borrow_mut().get_mut(&env.0) {
            Some(state) => {
                state.diagnostics.clear();
                state.odbc3 = true;
                SqlReturn::Success
            }
            None => SqlReturn::InvalidHandle,
        }
    }

    fn connect(
        &self,
        dbc: RawHandle,
        data_source_name: &str,
        _username: Option<&str>,
        _password: Option<&str>,
    ) -> SqlReturn {
        if !self.begin_call(HandleKind::Connection, dbc) {
            return SqlReturn::InvalidHandle;
        }
        if let Some(record) = self.take_injected("connect") {
            return self.fail_injected(HandleKind::Connection, dbc, record);
        }
        self.open_database(dbc, data_source_name)
    }

    fn driver_connect(
        &self,
        dbc: RawHandle,
        connection_string: &str,
        _completion: DriverCompletion,
        completed: &mut String,
    ) -> SqlReturn {
        completed.clear();
        if !self.begin_call(HandleKind::Connection, dbc) {
            return SqlReturn::InvalidHandle;
        }
        let attributes = parse_connection_string(connection_string);
        let path = attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("database") || key.eq_ignore_ascii_case("dsn"))
            .map(|(_, value)| value.clone());
        let path = match path {
            Some(path) => path,
            None => {
                return self.fail(
                    HandleKind::Connection,
                    dbc,
                    (
                        STATE_NO_DATA_SOURCE,
                        -1,
                        "Data source name not found and no default driver specified".to_string(),
                    ),
                )
            }
        };
        let rc = self.open_database(dbc, &path);
        if rc.succeeded() {
            *completed = format!("DRIVER={{SQLite}};Database={};", path);
        }
        rc
    }

    fn disconnect(&self, dbc: RawHandle) -> SqlReturn {
        if !self.begin_call(HandleKind::Connection, dbc) {
            return SqlReturn::InvalidHandle;
        }
        let closed = self
            .connections
            .borrow_mut()
            .get_mut(&dbc.0)
            .and_then(|s| s.connection.take());
        match closed {
            Some(conn) => {
                drop(conn);
                // Disconnecting releases every statement of the connection
                self.statements.borrow_mut().retain(|_, s| s.dbc != dbc.0);
                SqlReturn::Success
            }
            None => self.fail(
                HandleKind::Connection,
                dbc,
                (STATE_NOT_CONNECTED, -1, "Connection not open".to_string()),
            ),
        }
    }

    fn exec_direct(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        if !self.begin_call(HandleKind::Statement, stmt) {
            return SqlReturn::InvalidHandle;
        }
        self.log_statement(sql);
        if let Some(record) = self.take_injected("exec_direct") {
            return self.fail_injected(HandleKind::Statement, stmt, record);
        }
        self.run(stmt, sql)
    }

    fn prepare(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        if !self.begin_call(HandleKind::Statement, stmt) {
            return SqlReturn::InvalidHandle;
        }
        self.log_statement(sql);
        if let Some(record) = self.take_injected("prepare") {
            return self.fail_injected(HandleKind::Statement, stmt, record);
        }
        let dbc = match self.statement_dbc(stmt) {
            Some(dbc) => dbc,
            None => return SqlReturn::InvalidHandle,
        };
        if let Err(failure) = self.link_status(dbc) {
            return self.fail(HandleKind::Statement, stmt, failure);
        }

        let compiled = {
            let connections = self.connections.borrow();
            match connections.get(&dbc).and_then(|s| s.connection.as_ref()) {
                Some(_) if is_catalog_switch(sql) => Ok(()),
                Some(conn) => conn.prepare(sql).map(|_| ()).map_err(|e| sqlite_failure(&e)),
                None => Err((STATE_NOT_CONNECTED, -1, "Connection not open".to_string())),
            }
        };
        match compiled {
            Ok(()) => {
                if let Some(state) = self.statements.borrow_mut().get_mut(&stmt.0) {
                    state.sql = Some(sql.to_string());
                    state.result = None;
                    state.affected = -1;
                }
                SqlReturn::Success
            }
            Err(failure) => self.fail(HandleKind::Statement, stmt, failure),
        }
    }

    fn execute(&self, stmt: RawHandle) -> SqlReturn {
        if !self.begin_call(HandleKind::Statement, stmt) {
            return SqlReturn::InvalidHandle;
        }
        if let Some(record) = self.take_injected("execute") {
            return self.fail_injected(HandleKind::Statement, stmt, record);
        }
        let sql = self.statements.borrow().get(&stmt.0).and_then(|s| s.sql.clone());
        match sql {
            Some(sql) => self.run(stmt, &sql),
            None => self.fail(
                HandleKind::Statement,
                stmt,
                (STATE_SEQUENCE_ERROR, -1, "Statement not prepared".to_string()),
            ),
        }
    }

    fn reset_parameters(&self, stmt: RawHandle) -> SqlReturn {
        if !self.begin_call(HandleKind::Statement, stmt) {
            return SqlReturn::InvalidHandle;
        }
        if let Some(record) = self.take_injected("reset_parameters") {
            return self.fail_injected(HandleKind::Statement, stmt, record);
        }
        if let Some(state) = self.statements.borrow_mut().get_mut(&stmt.0) {
            state.parameters.clear();
        }
        SqlReturn::Success
    }

    fn close_cursor(&self, stmt: RawHandle) -> SqlReturn {
        if !self.begin_call(HandleKind::Statement, stmt) {
            return SqlReturn::InvalidHandle;
        }
        if let Some(state) = self.statements.borrow_mut().get_mut(&stmt.0) {
            state.result = None;
            state.text_progress = None;
        }
        SqlReturn::Success
    }

    fn bind_parameter(&self, stmt: RawHandle, index: u16, parameter: &BoundParameter) -> SqlReturn {
        if !self.begin_call(HandleKind::Statement, stmt) {
            return SqlReturn::InvalidHandle;
        }
        if let Some(record) = self.take_injected("bind_parameter") {
            return self.fail_injected(HandleKind::Statement, stmt, record);
        }
        if index == 0 {
            return self.fail(
                HandleKind::Statement,
                stmt,
                (STATE_INVALID_INDEX, -1, "Invalid descriptor index 0".to_string()),
            );
        }
        let value = if parameter.is_null() {
            SqliteValue::Null
        } else {
            parameter_value(parameter)
        };
        if let Some(state) = self.statements.borrow_mut().get_mut(&stmt.0) {
            state.parameters.insert(index, value);
        }
        SqlReturn::Success
    }

    fn fetch(&self, stmt: RawHandle) -> SqlReturn {
        if !self.begin_call(HandleKind::Statement, stmt) {
            return SqlReturn::InvalidHandle;
        }
        if let Some(record) = self.take_injected("fetch") {
            return self.fail_injected(HandleKind::Statement, stmt, record);
        }
        let advanced = {
            let mut statements = self.statements.borrow_mut();
            let state = match statements.get_mut(&stmt.0) {
                Some(state) => state,
                None => return SqlReturn::InvalidHandle,
            };
            state.text_progress = None;
            state.result.as_mut().map(|result| {
                let next = result.position.map_or(0, |p| p + 1);
                result.position = Some(next.min(result.rows.len()));
                next < result.rows.len()
            })
        };
        match advanced {
            Some(true) => SqlReturn::Success,
            Some(false) => SqlReturn::NoData,
            None => self.fail(
                HandleKind::Statement,
                stmt,
                (STATE_INVALID_CURSOR, -1, "Invalid cursor state".to_string()),
            ),
        }
    }

    fn get_data(
        &self,
        stmt: RawHandle,
        column: u16,
        target: ColumnBuffer<'_>,
        indicator: &mut isize,
    ) -> SqlReturn {
        if !self.begin_call(HandleKind::Statement, stmt) {
            return SqlReturn::InvalidHandle;
        }
        if let Some(record) = self.take_injected("get_data") {
            return self.fail_injected(HandleKind::Statement, stmt, record);
        }

        let lookup = {
            let statements = self.statements.borrow();
            let state = match statements.get(&stmt.0) {
                Some(state) => state,
                None => return SqlReturn::InvalidHandle,
            };
            let current = state.result.as_ref().and_then(|r| match r.position {
                Some(p) if p < r.rows.len() => Some((r, p)),
                _ => None,
            });
            match current {
                None => Err((STATE_INVALID_CURSOR, -1, "Invalid cursor state".to_string())),
                Some((result, _)) if column == 0 || usize::from(column) > result.column_count => {
                    Err((
                        STATE_INVALID_INDEX,
                        -1,
                        format!("Invalid descriptor index {}", column),
                    ))
                }
                Some((result, row)) => Ok((
                    result.rows[row][usize::from(column) - 1].clone(),
                    state.text_progress,
                )),
            }
        };

        let (value, progress) = match lookup {
            Ok(found) => found,
            Err(failure) => return self.fail(HandleKind::Statement, stmt, failure),
        };

        if value == SqliteValue::Null {
            *indicator = NULL_DATA;
            return SqlReturn::Success;
        }

        let converted = match target {
            ColumnBuffer::Char(buffer) => {
                let bytes = value_bytes(&value);
                let offset = match progress {
                    Some((col, offset)) if col == column => offset,
                    _ => 0,
                };
                if offset > 0 && offset >= bytes.len() {
                    return SqlReturn::NoData;
                }
                let remaining = &bytes[offset..];
                *indicator = remaining.len() as isize;
                let copied = remaining.len().min(buffer.len().saturating_sub(1));
                buffer[..copied].copy_from_slice(&remaining[..copied]);
                if let Some(terminator) = buffer.get_mut(copied) {
                    *terminator = 0;
                }
                if let Some(state) = self.statements.borrow_mut().get_mut(&stmt.0) {
                    state.text_progress = Some((column, offset + copied));
                }
                if copied < remaining.len() {
                    self.post(
                        HandleKind::Statement,
                        stmt,
                        DiagnosticRecord {
                            state: STATE_TRUNCATED.to_string(),
                            native_error: 0,
                            message: "String data, right truncated".to_string(),
                        },
                    );
                    return SqlReturn::SuccessWithInfo;
                }
                return SqlReturn::Success;
            }
            ColumnBuffer::Bit(out) => as_integer(&value).map(|v| {
                *out = u8::from(v != 0);
                std::mem::size_of::<u8>()
            }),
            ColumnBuffer::SBigInt(out) => as_integer(&value).map(|v| {
                *out = v;
                std::mem::size_of::<i64>()
            }),
            ColumnBuffer::Double(out) => as_real(&value).map(|v| {
                *out = v;
                std::mem::size_of::<f64>()
            }),
            ColumnBuffer::Date(out) => as_text(&value)
                .and_then(|t| parse_date(&t).or_else(|| parse_timestamp(&t).map(|ts| ts.date())))
                .and_then(|d: NaiveDate| SqlDate::try_from(d).ok())
                .map(|d| {
                    *out = d;
                    std::mem::size_of::<SqlDate>()
                }),
            ColumnBuffer::Time(out) => as_text(&value)
                .and_then(|t| parse_time(&t).or_else(|| parse_timestamp(&t).map(|ts| ts.time())))
                .map(|t: NaiveTime| {
                    *out = t.into();
                    std::mem::size_of::<SqlTime>()
                }),
            ColumnBuffer::Timestamp(out) => as_text(&value)
                .and_then(|t| parse_timestamp(&t))
                .and_then(|ts: NaiveDateTime| SqlTimestamp::try_from(ts).ok())
                .map(|ts| {
                    *out = ts;
                    std::mem::size_of::<SqlTimestamp>()
                }),
        };

        match converted {
            Some(len) => {
                *indicator = len as isize;
                SqlReturn::Success
            }
            None => self.fail(
                HandleKind::Statement,
                stmt,
                (
                    STATE_INVALID_CAST,
                    -1,
                    format!("Invalid character value for cast specification (column {})", column),
                ),
            ),
        }
    }

    fn row_count(&self, stmt: RawHandle, count: &mut isize) -> SqlReturn {
        if !self.begin_call(HandleKind::Statement, stmt) {
            return SqlReturn::InvalidHandle;
        }
        let statements = self.statements.borrow();
        match statements.get(&stmt.0) {
            Some(state) => {
                *count = match &state.result {
                    Some(result) => result.rows.len() as isize,
                    None => state.affected,
                };
                SqlReturn::Success
            }
            None => SqlReturn::InvalidHandle,
        }
    }

    fn set_autocommit(&self, dbc: RawHandle, enabled: bool) -> SqlReturn {
        if !self.begin_call(HandleKind::Connection, dbc) {
            return SqlReturn::InvalidHandle;
        }
        if let Some(record) = self.take_injected("set_autocommit") {
            return self.fail_injected(HandleKind::Connection, dbc, record);
        }
        if let Err(failure) = self.link_status(dbc.0) {
            return self.fail(HandleKind::Connection, dbc, failure);
        }
        let current = self
            .connections
            .borrow()
            .get(&dbc.0)
            .map(|s| s.autocommit)
            .unwrap_or(true);
        let switched = match (current, enabled) {
            (true, false) => self.run_on_connection(dbc, "BEGIN"),
            (false, true) if self.in_transaction(dbc) => self.run_on_connection(dbc, "COMMIT"),
            _ => Ok(()),
        };
        match switched {
            Ok(()) => {
                if let Some(state) = self.connections.borrow_mut().get_mut(&dbc.0) {
                    state.autocommit = enabled;
                }
                SqlReturn::Success
            }
            Err(failure) => self.fail(HandleKind::Connection, dbc, failure),
        }
    }

    fn end_transaction(&self, dbc: RawHandle, completion: Completion) -> SqlReturn {
        if !self.begin_call(HandleKind::Connection, dbc) {
            return SqlReturn::InvalidHandle;
        }
        if let Some(record) = self.take_injected("end_transaction") {
            return self.fail_injected(HandleKind::Connection, dbc, record);
        }
        if let Err(failure) = self.link_status(dbc.0) {
            return self.fail(HandleKind::Connection, dbc, failure);
        }
        let autocommit = self
            .connections
            .borrow()
            .get(&dbc.0)
            .map(|s| s.autocommit)
            .unwrap_or(true);
        if autocommit {
            return SqlReturn::Success;
        }
        let verb = match completion {
            Completion::Commit => "COMMIT",
            Completion::Rollback => "ROLLBACK",
        };
        let ended = if self.in_transaction(dbc) {
            self.run_on_connection(dbc, verb)
        } else {
            Ok(())
        };
        // Manual-commit mode: the next transaction starts right away
        match ended.and_then(|()| self.run_on_connection(dbc, "BEGIN")) {
            Ok(()) => SqlReturn::Success,
            Err(failure) => self.fail(HandleKind::Connection, dbc, failure),
        }
    }

    fn get_diag_rec(
        &self,
        kind: HandleKind,
        handle: RawHandle,
        record: i16,
        out: &mut DiagnosticRecord,
    ) -> SqlReturn {
        if record < 1 {
            return SqlReturn::Error;
        }
        let index = (record - 1) as usize;
        let found = match kind {
            HandleKind::Environment => self
                .environments
                .borrow()
                .get(&handle.0)
                .map(|s| s.diagnostics.get(index).cloned()),
            HandleKind::Connection => self
                .connections
                .borrow()
                .get(&handle.0)
                .map(|s| s.diagnostics.get(index).cloned()),
            HandleKind::Statement => self
                .statements
                .borrow()
                .get(&handle.0)
                .map(|s| s.diagnostics.get(index).cloned()),
        };
        match found {
            None => SqlReturn::InvalidHandle,
            Some(None) => SqlReturn::NoData,
            Some(Some(diagnostic)) => {
                *out = diagnostic;
                SqlReturn::Success
            }
        }
    }
}

/// Prepares, binds and runs `sql`, materialising any result rows.
fn run_statement(
    conn: &SqliteConnection,
    sql: &str,
    parameters: &BTreeMap<u16, SqliteValue>,
) -> Result<(Option<ResultSet>, usize), Failure> {
    if is_catalog_switch(sql) {
        return Ok((None, 0));
    }
    let mut statement = conn.prepare(sql).map_err(|e| sqlite_failure(&e))?;

    let expected = statement.parameter_count();
    if let Some(missing) = (1..=expected).find(|i| !parameters.contains_key(&(*i as u16))) {
        return Err((
            STATE_COUNT_INCORRECT,
            -1,
            format!("COUNT field incorrect: parameter {} is not bound", missing),
        ));
    }
    for (index, value) in parameters {
        if usize::from(*index) <= expected {
            statement
                .raw_bind_parameter(usize::from(*index), value)
                .map_err(|e| sqlite_failure(&e))?;
        }
    }

    let column_count = statement.column_count();
    if column_count == 0 {
        let affected = statement.raw_execute().map_err(|e| sqlite_failure(&e))?;
        return Ok((None, affected));
    }

    let mut rows = statement.raw_query();
    let mut collected = Vec::new();
    while let Some(row) = rows.next().map_err(|e| sqlite_failure(&e))? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(row.get::<_, SqliteValue>(i).map_err(|e| sqlite_failure(&e))?);
        }
        collected.push(values);
    }
    Ok((
        Some(ResultSet {
            column_count,
            rows: collected,
            position: None,
        }),
        0,
    ))
}

fn sqlite_failure(error: &rusqlite::Error) -> Failure {
    let state = match error {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            STATE_CONSTRAINT
        }
        _ => STATE_GENERAL_ERROR,
    };
    (state, native_code(error), format!("[SQLite] {}", error))
}

fn native_code(error: &rusqlite::Error) -> i32 {
    match error {
        rusqlite::Error::SqliteFailure(e, _) => e.extended_code,
        _ => -1,
    }
}

/// `USE <name>`: SQLite has a single catalog per connection, so switching is a no-op.
fn is_catalog_switch(sql: &str) -> bool {
    let mut words = sql.split_whitespace();
    matches!(
        (words.next(), words.next(), words.next()),
        (Some(keyword), Some(_), None) if keyword.eq_ignore_ascii_case("USE")
    )
}

fn is_searched_change(sql: &str) -> bool {
    let head = sql.trim_start();
    let keyword: String = head.chars().take(6).collect::<String>().to_ascii_uppercase();
    keyword == "UPDATE" || keyword == "DELETE"
}

fn parameter_value(parameter: &BoundParameter) -> SqliteValue {
    match parameter.buffer.as_ref() {
        ParameterBuffer::Bit(v) => SqliteValue::Integer(i64::from(*v)),
        ParameterBuffer::BigInt(v) => SqliteValue::Integer(*v),
        ParameterBuffer::Double(v) => SqliteValue::Real(*v),
        ParameterBuffer::Text(bytes) => {
            let len = usize::try_from(*parameter.indicator)
                .unwrap_or(bytes.len())
                .min(bytes.len());
            SqliteValue::Text(String::from_utf8_lossy(&bytes[..len]).into_owned())
        }
        ParameterBuffer::Date(d) => match NaiveDate::try_from(*d) {
            Ok(date) => SqliteValue::Text(date.format("%Y-%m-%d").to_string()),
            Err(_) => SqliteValue::Null,
        },
        ParameterBuffer::Time(t) => match NaiveTime::try_from(*t) {
            Ok(time) => SqliteValue::Text(time.format("%H:%M:%S").to_string()),
            Err(_) => SqliteValue::Null,
        },
        ParameterBuffer::Timestamp(ts) => match NaiveDateTime::try_from(*ts) {
            Ok(ts) => SqliteValue::Text(ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
            Err(_) => SqliteValue::Null,
        },
    }
}

fn value_bytes(value: &SqliteValue) -> Vec<u8> {
    match value {
        SqliteValue::Null => Vec::new(),
        SqliteValue::Integer(i) => i.to_string().into_bytes(),
        SqliteValue::Real(f) => f.to_string().into_bytes(),
        SqliteValue::Text(t) => t.as_bytes().to_vec(),
        SqliteValue::Blob(b) => b.clone(),
    }
}

fn as_integer(value: &SqliteValue) -> Option<i64> {
    match value {
        SqliteValue::Integer(i) => Some(*i),
        SqliteValue::Real(f) => Some(*f as i64),
        SqliteValue::Text(t) => t.trim().parse().ok(),
        _ => None,
    }
}

fn as_real(value: &SqliteValue) -> Option<f64> {
    match value {
        SqliteValue::Integer(i) => Some(*i as f64),
        SqliteValue::Real(f) => Some(*f),
        SqliteValue::Text(t) => t.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &SqliteValue) -> Option<String> {
    match value {
        SqliteValue::Text(t) => Some(t.clone()),
        _ => None,
    }
}

/// Splits `KEY=value;KEY2={braced;value}` into pairs.
fn parse_connection_string(connection_string: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = connection_string;
    while !rest.is_empty() {
        let (key, after_key) = match rest.split_once('=') {
            Some(split) => split,
            None => break,
        };
        let (value, remainder) = if let Some(braced) = after_key.strip_prefix('{') {
            match braced.split_once('}') {
                Some((value, tail)) => (value, tail.strip_prefix(';').unwrap_or(tail)),
                None => (braced, ""),
            }
        } else {
            match after_key.split_once(';') {
                Some((value, tail)) => (value, tail),
                None => (after_key, ""),
            }
        };
        pairs.push((key.trim().to_string(), value.trim().to_string()));
        rest = remainder;
    }
    pairs
}
