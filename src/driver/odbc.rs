/// ODBC Driver Manager Backend
///
/// Forwards every [`CallLevelApi`] primitive to the system driver manager through
/// `odbc-sys`. Handles cross the trait boundary as [`RawHandle`] values and are
/// cast back to the native pointer types here; nothing else in the crate touches
/// raw pointers.

use super::{
    CallLevelApi, ColumnBuffer, Completion, DiagnosticRecord, DriverCompletion, HandleKind,
    ParameterBuffer, BoundParameter, RawHandle, SqlReturn,
};
use odbc_sys::{
    AttrOdbcVersion, CompletionType, ConnectionAttribute, DriverConnectOption, EnvironmentAttribute,
    FreeStmtOption, HDbc, HEnv, HStmt, Handle, HandleType, ParamType, Pointer, SmallInt,
    SqlDataType,
};
use std::ptr;
use tracing::warn;

const SQL_AUTOCOMMIT_OFF: usize = 0;
const SQL_AUTOCOMMIT_ON: usize = 1;
const COMPLETED_CONNECTION_STRING_CAPACITY: usize = 1024;
const DIAGNOSTIC_MESSAGE_CAPACITY: usize = 1024;

/// Call-level API implemented by the system ODBC driver manager.
#[derive(Debug, Default)]
pub struct OdbcDriver;

impl OdbcDriver {
    pub fn new() -> Self {
        OdbcDriver
    }
}

fn rc(native: odbc_sys::SqlReturn) -> SqlReturn {
    SqlReturn::from_raw(native.0)
}

fn handle_type(kind: HandleKind) -> HandleType {
    match kind {
        HandleKind::Environment => HandleType::Env,
        HandleKind::Connection => HandleType::Dbc,
        HandleKind::Statement => HandleType::Stmt,
    }
}

fn as_handle(handle: RawHandle) -> Handle {
    handle.0 as Handle
}

fn as_dbc(handle: RawHandle) -> HDbc {
    handle.0 as HDbc
}

fn as_stmt(handle: RawHandle) -> HStmt {
    handle.0 as HStmt
}

/// Native length of a text argument, or `None` when it does not fit the
/// driver manager's length type.
fn text_len<T: TryFrom<usize>>(what: &str, text: &str) -> Option<T> {
    let len = T::try_from(text.len()).ok();
    if len.is_none() {
        warn!("{} of {} bytes exceeds the driver length limit", what, text.len());
    }
    len
}

/// Pointer/length pair for an optional credential (`NULL`, 0 when absent).
fn text_arg(what: &str, text: Option<&str>) -> Option<(*const u8, SmallInt)> {
    match text {
        Some(t) => text_len(what, t).map(|len| (t.as_ptr(), len)),
        None => Some((ptr::null(), 0)),
    }
}

fn c_data_type(kind: super::CDataType) -> odbc_sys::CDataType {
    match kind {
        super::CDataType::Bit => odbc_sys::CDataType::Bit,
        super::CDataType::SBigInt => odbc_sys::CDataType::SBigInt,
        super::CDataType::Double => odbc_sys::CDataType::Double,
        super::CDataType::Char => odbc_sys::CDataType::Char,
        super::CDataType::Date => odbc_sys::CDataType::TypeDate,
        super::CDataType::Time => odbc_sys::CDataType::TypeTime,
        super::CDataType::Timestamp => odbc_sys::CDataType::TypeTimestamp,
    }
}

fn sql_data_type(kind: super::SqlType) -> SqlDataType {
    match kind {
        super::SqlType::Bit => SqlDataType::EXT_BIT,
        super::SqlType::BigInt => SqlDataType::EXT_BIG_INT,
        super::SqlType::Double => SqlDataType::DOUBLE,
        super::SqlType::Char => SqlDataType::CHAR,
        super::SqlType::Date => SqlDataType::DATE,
        super::SqlType::Time => SqlDataType::TIME,
        super::SqlType::Timestamp => SqlDataType::TIMESTAMP,
    }
}

impl CallLevelApi for OdbcDriver {
    fn backend_name(&self) -> &'static str {
        "odbc"
    }

    fn alloc_handle(&self, kind: HandleKind, parent: RawHandle, out: &mut RawHandle) -> SqlReturn {
        let mut native: Handle = ptr::null_mut();
        let code = unsafe { odbc_sys::SQLAllocHandle(handle_type(kind), as_handle(parent), &mut native) };
        *out = RawHandle(native as usize);
        rc(code)
    }

    fn free_handle(&self, kind: HandleKind, handle: RawHandle) -> SqlReturn {
        rc(unsafe { odbc_sys::SQLFreeHandle(handle_type(kind), as_handle(handle)) })
    }

    fn set_odbc_version(&self, env: RawHandle) -> SqlReturn {
        let version: Pointer = AttrOdbcVersion::Odbc3.into();
        rc(unsafe {
            odbc_sys::SQLSetEnvAttr(env.0 as HEnv, EnvironmentAttribute::OdbcVersion, version, 0)
        })
    }

    fn connect(
        &self,
        dbc: RawHandle,
        data_source_name: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> SqlReturn {
        let (Some(dsn_len), Some((user_ptr, user_len)), Some((password_ptr, password_len))) = (
            text_len::<SmallInt>("data source name", data_source_name),
            text_arg("user name", username),
            text_arg("password", password),
        ) else {
            return SqlReturn::Error;
        };
        rc(unsafe {
            odbc_sys::SQLConnect(
                as_dbc(dbc),
                data_source_name.as_ptr(),
                dsn_len,
                user_ptr,
                user_len,
                password_ptr,
                password_len,
            )
        })
    }

    fn driver_connect(
        &self,
        dbc: RawHandle,
        connection_string: &str,
        completion: DriverCompletion,
        completed: &mut String,
    ) -> SqlReturn {
        let option = match completion {
            DriverCompletion::NoPrompt => DriverConnectOption::NoPrompt,
            DriverCompletion::Complete => DriverConnectOption::Complete,
            DriverCompletion::Prompt => DriverConnectOption::Prompt,
            DriverCompletion::CompleteRequired => DriverConnectOption::CompleteRequired,
        };
        let Some(in_len) = text_len::<SmallInt>("connection string", connection_string) else {
            return SqlReturn::Error;
        };
        let mut out = vec![0u8; COMPLETED_CONNECTION_STRING_CAPACITY];
        let mut out_len: SmallInt = 0;
        let code = rc(unsafe {
            odbc_sys::SQLDriverConnect(
                as_dbc(dbc),
                ptr::null_mut(),
                connection_string.as_ptr(),
                in_len,
                out.as_mut_ptr(),
                COMPLETED_CONNECTION_STRING_CAPACITY as SmallInt,
                &mut out_len,
                option,
            )
        });
        completed.clear();
        if code.succeeded() {
            let len = (out_len.max(0) as usize).min(out.len());
            completed.push_str(&String::from_utf8_lossy(&out[..len]));
        }
        code
    }

    fn disconnect(&self, dbc: RawHandle) -> SqlReturn {
        rc(unsafe { odbc_sys::SQLDisconnect(as_dbc(dbc)) })
    }

    fn exec_direct(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        match text_len::<i32>("statement text", sql) {
            Some(len) => rc(unsafe { odbc_sys::SQLExecDirect(as_stmt(stmt), sql.as_ptr(), len) }),
            None => SqlReturn::Error,
        }
    }

    fn prepare(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        match text_len::<i32>("statement text", sql) {
            Some(len) => rc(unsafe { odbc_sys::SQLPrepare(as_stmt(stmt), sql.as_ptr(), len) }),
            None => SqlReturn::Error,
        }
    }

    fn execute(&self, stmt: RawHandle) -> SqlReturn {
        rc(unsafe { odbc_sys::SQLExecute(as_stmt(stmt)) })
    }

    fn reset_parameters(&self, stmt: RawHandle) -> SqlReturn {
        rc(unsafe { odbc_sys::SQLFreeStmt(as_stmt(stmt), FreeStmtOption::ResetParams) })
    }

    fn close_cursor(&self, stmt: RawHandle) -> SqlReturn {
        rc(unsafe { odbc_sys::SQLFreeStmt(as_stmt(stmt), FreeStmtOption::Close) })
    }

    fn bind_parameter(&self, stmt: RawHandle, index: u16, parameter: &BoundParameter) -> SqlReturn {
        // The boxed buffer outlives the binding; see `BoundParameter`.
        let (value, buffer_length): (Pointer, isize) = match parameter.buffer.as_ref() {
            ParameterBuffer::Bit(v) => (v as *const u8 as Pointer, 1),
            ParameterBuffer::BigInt(v) => (v as *const i64 as Pointer, 8),
            ParameterBuffer::Double(v) => (v as *const f64 as Pointer, 8),
            ParameterBuffer::Text(bytes) => (bytes.as_ptr() as Pointer, bytes.len() as isize),
            ParameterBuffer::Date(d) => (d as *const _ as Pointer, std::mem::size_of_val(d) as isize),
            ParameterBuffer::Time(t) => (t as *const _ as Pointer, std::mem::size_of_val(t) as isize),
            ParameterBuffer::Timestamp(ts) => {
                (ts as *const _ as Pointer, std::mem::size_of_val(ts) as isize)
            }
        };
        let indicator = parameter.indicator.as_ref() as *const isize as *mut isize;
        rc(unsafe {
            odbc_sys::SQLBindParameter(
                as_stmt(stmt),
                index,
                ParamType::Input,
                c_data_type(parameter.c_type),
                sql_data_type(parameter.sql_type),
                parameter.column_size,
                parameter.decimal_digits,
                value,
                buffer_length,
                indicator,
            )
        })
    }

    fn fetch(&self, stmt: RawHandle) -> SqlReturn {
        rc(unsafe { odbc_sys::SQLFetch(as_stmt(stmt)) })
    }

    fn get_data(
        &self,
        stmt: RawHandle,
        column: u16,
        target: ColumnBuffer<'_>,
        indicator: &mut isize,
    ) -> SqlReturn {
        let (c_type, value, buffer_length): (odbc_sys::CDataType, Pointer, isize) = match target {
            ColumnBuffer::Bit(v) => (odbc_sys::CDataType::Bit, v as *mut u8 as Pointer, 1),
            ColumnBuffer::SBigInt(v) => (odbc_sys::CDataType::SBigInt, v as *mut i64 as Pointer, 8),
            ColumnBuffer::Double(v) => (odbc_sys::CDataType::Double, v as *mut f64 as Pointer, 8),
            ColumnBuffer::Char(buffer) => (
                odbc_sys::CDataType::Char,
                buffer.as_mut_ptr() as Pointer,
                buffer.len() as isize,
            ),
            ColumnBuffer::Date(d) => (
                odbc_sys::CDataType::TypeDate,
                d as *mut _ as Pointer,
                std::mem::size_of::<super::SqlDate>() as isize,
            ),
            ColumnBuffer::Time(t) => (
                odbc_sys::CDataType::TypeTime,
                t as *mut _ as Pointer,
                std::mem::size_of::<super::SqlTime>() as isize,
            ),
            ColumnBuffer::Timestamp(ts) => (
                odbc_sys::CDataType::TypeTimestamp,
                ts as *mut _ as Pointer,
                std::mem::size_of::<super::SqlTimestamp>() as isize,
            ),
        };
        rc(unsafe {
            odbc_sys::SQLGetData(as_stmt(stmt), column, c_type, value, buffer_length, indicator)
        })
    }

    fn row_count(&self, stmt: RawHandle, count: &mut isize) -> SqlReturn {
        rc(unsafe { odbc_sys::SQLRowCount(as_stmt(stmt), count) })
    }

    fn set_autocommit(&self, dbc: RawHandle, enabled: bool) -> SqlReturn {
        let value = if enabled { SQL_AUTOCOMMIT_ON } else { SQL_AUTOCOMMIT_OFF };
        rc(unsafe {
            odbc_sys::SQLSetConnectAttr(
                as_dbc(dbc),
                ConnectionAttribute::AutoCommit,
                value as Pointer,
                0,
            )
        })
    }

    fn end_transaction(&self, dbc: RawHandle, completion: Completion) -> SqlReturn {
        let completion = match completion {
            Completion::Commit => CompletionType::Commit,
            Completion::Rollback => CompletionType::Rollback,
        };
        rc(unsafe { odbc_sys::SQLEndTran(HandleType::Dbc, as_handle(dbc), completion) })
    }

    fn get_diag_rec(
        &self,
        kind: HandleKind,
        handle: RawHandle,
        record: i16,
        out: &mut DiagnosticRecord,
    ) -> SqlReturn {
        let mut state = [0u8; 6];
        let mut native_error: i32 = 0;
        let mut message = vec![0u8; DIAGNOSTIC_MESSAGE_CAPACITY];
        let mut message_len: SmallInt = 0;
        let code = rc(unsafe {
            odbc_sys::SQLGetDiagRec(
                handle_type(kind),
                as_handle(handle),
                record,
                state.as_mut_ptr(),
                &mut native_error,
                message.as_mut_ptr(),
                message.len() as SmallInt,
                &mut message_len,
            )
        });
        if code.succeeded() {
            let len = (message_len.max(0) as usize).min(message.len() - 1);
            out.state = String::from_utf8_lossy(&state[..5]).into_owned();
            out.native_error = native_error;
            out.message = String::from_utf8_lossy(&message[..len]).into_owned();
        }
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oversized_text_has_no_native_length() {
        let long = "x".repeat(SmallInt::MAX as usize + 1);
        assert_eq!(text_len::<SmallInt>("connection string", &long), None);
        assert!(text_arg("password", Some(&long)).is_none());
        assert_eq!(text_len::<i32>("statement text", &long), Some(long.len() as i32));
    }

    #[test]
    fn test_absent_credential_is_null() {
        let (pointer, len) = text_arg("user name", None).unwrap();
        assert!(pointer.is_null());
        assert_eq!(len, 0);
        assert_eq!(text_arg("user name", Some("sa")).map(|(_, len)| len), Some(2));
    }
}
