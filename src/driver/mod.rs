/// Call-Level API Module
///
/// This module defines the boundary between the connector and a call-level
/// SQL driver: environment/connection/statement handles, prepared execution,
/// parameter binding, columnar retrieval and diagnostic records.
///
/// ## Backends
///
/// - **ODBC** (`odbc.rs`, feature `odbc`): the system driver manager through `odbc-sys`
/// - **SQLite** (`sqlite.rs`): an embedded emulation of the same primitives on top of
///   `rusqlite`, used by the test-suite and for offline development
///
/// Every primitive mirrors its ODBC counterpart: it reports a [`SqlReturn`] and
/// writes results through out-parameters, leaving error interpretation to the caller.

#[cfg(feature = "odbc")]
pub mod odbc;
pub mod sqlite;

#[cfg(feature = "odbc")]
pub use odbc::OdbcDriver;
pub use sqlite::SqliteDriver;

use std::fmt;

/// Indicator value reporting a NULL column or parameter.
pub const NULL_DATA: isize = -1;

/// Indicator value reporting that the total length is not known.
pub const NO_TOTAL: isize = -4;

/// Return code of a call-level primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlReturn {
    Success,
    SuccessWithInfo,
    NoData,
    Error,
    InvalidHandle,
    StillExecuting,
    NeedData,
    /// Any code outside the documented set
    Other(i16),
}

impl SqlReturn {
    /// `true` for `Success` and `SuccessWithInfo` (the `SQL_SUCCEEDED` macro).
    pub fn succeeded(self) -> bool {
        matches!(self, SqlReturn::Success | SqlReturn::SuccessWithInfo)
    }

    /// Symbolic name of the return code, as used in diagnostic prefixes.
    pub fn name(self) -> String {
        match self {
            SqlReturn::Success => "SQL_SUCCESS".to_string(),
            SqlReturn::SuccessWithInfo => "SQL_SUCCESS_WITH_INFO".to_string(),
            SqlReturn::NoData => "SQL_NO_DATA".to_string(),
            SqlReturn::Error => "SQL_ERROR".to_string(),
            SqlReturn::InvalidHandle => "SQL_INVALID_HANDLE".to_string(),
            SqlReturn::StillExecuting => "SQL_STILL_EXECUTING".to_string(),
            SqlReturn::NeedData => "SQL_NEED_DATA".to_string(),
            SqlReturn::Other(code) => format!("SQLRETURN({})", code),
        }
    }

    /// Maps a raw native return code.
    pub fn from_raw(code: i16) -> Self {
        match code {
            0 => SqlReturn::Success,
            1 => SqlReturn::SuccessWithInfo,
            2 => SqlReturn::StillExecuting,
            -1 => SqlReturn::Error,
            -2 => SqlReturn::InvalidHandle,
            99 => SqlReturn::NeedData,
            100 => SqlReturn::NoData,
            other => SqlReturn::Other(other),
        }
    }
}

impl fmt::Display for SqlReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Kind of a native handle, needed wherever the API is handle-polymorphic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Environment,
    Connection,
    Statement,
}

/// Opaque native handle value. `RawHandle::NULL` is never a live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub usize);

impl RawHandle {
    pub const NULL: RawHandle = RawHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// C buffer type used when exchanging values with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CDataType {
    Bit,
    SBigInt,
    Double,
    Char,
    Date,
    Time,
    Timestamp,
}

/// SQL type a parameter is declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Bit,
    BigInt,
    Double,
    Char,
    Date,
    Time,
    Timestamp,
}

/// Native date structure (`SQL_DATE_STRUCT`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SqlDate {
    pub year: i16,
    pub month: u16,
    pub day: u16,
}

/// Native time structure (`SQL_TIME_STRUCT`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SqlTime {
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
}

/// Native timestamp structure (`SQL_TIMESTAMP_STRUCT`); `fraction` is in nanoseconds.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SqlTimestamp {
    pub year: i16,
    pub month: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub fraction: u32,
}

/// Owned storage behind one bound input parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterBuffer {
    Bit(u8),
    BigInt(i64),
    Double(f64),
    Text(Vec<u8>),
    Date(SqlDate),
    Time(SqlTime),
    Timestamp(SqlTimestamp),
}

/// A fully described input parameter.
///
/// The buffer and indicator are boxed so their addresses stay fixed for as long
/// as the owning prepared statement keeps the binding alive; drivers that defer
/// reading parameter data until execution may hold on to those addresses until
/// the statement's parameters are reset or the ordinal is rebound.
#[derive(Debug)]
pub struct BoundParameter {
    pub c_type: CDataType,
    pub sql_type: SqlType,
    pub column_size: usize,
    pub decimal_digits: i16,
    pub buffer: Box<ParameterBuffer>,
    pub indicator: Box<isize>,
}

impl BoundParameter {
    pub fn is_null(&self) -> bool {
        *self.indicator == NULL_DATA
    }
}

/// Destination of one `get_data` call.
#[derive(Debug)]
pub enum ColumnBuffer<'a> {
    Bit(&'a mut u8),
    SBigInt(&'a mut i64),
    Double(&'a mut f64),
    Char(&'a mut [u8]),
    Date(&'a mut SqlDate),
    Time(&'a mut SqlTime),
    Timestamp(&'a mut SqlTimestamp),
}

/// One diagnostic record as reported by `get_diag_rec`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticRecord {
    /// Five-character SQLSTATE
    pub state: String,
    pub native_error: i32,
    pub message: String,
}

/// Prompting behaviour of the driver-connect primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverCompletion {
    #[default]
    NoPrompt,
    Complete,
    Prompt,
    CompleteRequired,
}

/// Transaction completion requested from `end_transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Commit,
    Rollback,
}

/// The call-level primitives the connector is written against.
///
/// Implementations are single-threaded and blocking, exactly like the native
/// API they wrap: every method returns once the driver has answered.
pub trait CallLevelApi {
    /// Short backend name for logging.
    fn backend_name(&self) -> &'static str;

    /// Allocates a handle of `kind` under `parent` (`RawHandle::NULL` for environments).
    fn alloc_handle(&self, kind: HandleKind, parent: RawHandle, out: &mut RawHandle) -> SqlReturn;

    fn free_handle(&self, kind: HandleKind, handle: RawHandle) -> SqlReturn;

    /// Negotiates ODBC 3.x behaviour on an environment.
    fn set_odbc_version(&self, env: RawHandle) -> SqlReturn;

    fn connect(
        &self,
        dbc: RawHandle,
        data_source_name: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> SqlReturn;

    /// Connects with a full connection string; the completed string is written to `completed`.
    fn driver_connect(
        &self,
        dbc: RawHandle,
        connection_string: &str,
        completion: DriverCompletion,
        completed: &mut String,
    ) -> SqlReturn;

    fn disconnect(&self, dbc: RawHandle) -> SqlReturn;

    fn exec_direct(&self, stmt: RawHandle, sql: &str) -> SqlReturn;

    fn prepare(&self, stmt: RawHandle, sql: &str) -> SqlReturn;

    fn execute(&self, stmt: RawHandle) -> SqlReturn;

    /// Releases every parameter binding of `stmt`.
    fn reset_parameters(&self, stmt: RawHandle) -> SqlReturn;

    /// Discards any pending result set of `stmt` so it can be executed again.
    fn close_cursor(&self, stmt: RawHandle) -> SqlReturn;

    /// Binds `parameter` as input ordinal `index` (1-based); see [`BoundParameter`]
    /// for the lifetime contract of its buffers.
    fn bind_parameter(&self, stmt: RawHandle, index: u16, parameter: &BoundParameter) -> SqlReturn;

    fn fetch(&self, stmt: RawHandle) -> SqlReturn;

    /// Retrieves column `column` (1-based) of the current row into `target`,
    /// writing the length/indicator to `indicator`.
    fn get_data(
        &self,
        stmt: RawHandle,
        column: u16,
        target: ColumnBuffer<'_>,
        indicator: &mut isize,
    ) -> SqlReturn;

    fn row_count(&self, stmt: RawHandle, count: &mut isize) -> SqlReturn;

    fn set_autocommit(&self, dbc: RawHandle, enabled: bool) -> SqlReturn;

    fn end_transaction(&self, dbc: RawHandle, completion: Completion) -> SqlReturn;

    /// Reads diagnostic record `record` (1-based) of `handle`.
    fn get_diag_rec(
        &self,
        kind: HandleKind,
        handle: RawHandle,
        record: i16,
        out: &mut DiagnosticRecord,
    ) -> SqlReturn;
}

/// Repeats `call` while the driver reports `SqlReturn::StillExecuting`.
pub fn poll_until_done<F>(mut call: F) -> SqlReturn
where
    F: FnMut() -> SqlReturn,
{
    loop {
        let rc = call();
        if rc != SqlReturn::StillExecuting {
            return rc;
        }
    }
}
