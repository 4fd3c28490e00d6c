/// Diagnostic Reader
///
/// Walks the diagnostic record chain of a native handle and renders it as one
/// message. Every error the connector raises carries text produced here.

use crate::driver::{CallLevelApi, DiagnosticRecord, HandleKind, RawHandle, SqlReturn};

/// Returned when a handle has no retrievable diagnostic records.
pub const NO_DIAGNOSTICS: &str = "could not retrieve diagnostic information";

/// SQLSTATEs reporting that the connection to the data source is gone.
pub const CONNECTION_LOST_STATES: [&str; 3] = ["08S01", "08003", "08007"];

/// Reads every pending diagnostic record of `handle`, in driver order.
///
/// Stops at the first record the driver does not return successfully
/// (`SQL_NO_DATA`, `SQL_INVALID_HANDLE` or anything unexpected).
pub fn diagnostic_records(
    api: &dyn CallLevelApi,
    kind: HandleKind,
    handle: RawHandle,
) -> Vec<DiagnosticRecord> {
    let mut records = Vec::new();
    if handle.is_null() {
        return records;
    }
    let mut index: i16 = 1;
    loop {
        let mut record = DiagnosticRecord::default();
        match api.get_diag_rec(kind, handle, index, &mut record) {
            SqlReturn::Success | SqlReturn::SuccessWithInfo => records.push(record),
            _ => break,
        }
        index = match index.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }
    records
}

/// Formats one record as `STATE: <code>, Native Error: <n>: <message>`.
pub fn format_record(record: &DiagnosticRecord) -> String {
    format!(
        "STATE: {}, Native Error: {}: {}",
        record.state, record.native_error, record.message
    )
}

/// Aggregates all diagnostic records of `handle` into one message.
///
/// # Returns
///
/// One line per record, or [`NO_DIAGNOSTICS`] when none could be read; never empty.
pub fn read_diagnostics(api: &dyn CallLevelApi, kind: HandleKind, handle: RawHandle) -> String {
    let records = diagnostic_records(api, kind, handle);
    if records.is_empty() {
        return NO_DIAGNOSTICS.to_string();
    }
    records
        .iter()
        .map(format_record)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Like [`read_diagnostics`], prefixed with the name of the return code that
/// triggered the lookup.
pub fn read_diagnostics_for(
    api: &dyn CallLevelApi,
    kind: HandleKind,
    handle: RawHandle,
    rc: SqlReturn,
) -> String {
    format!("{}: {}", rc.name(), read_diagnostics(api, kind, handle))
}

/// `true` if any pending record of `handle` reports a lost connection.
pub fn reports_connection_lost(api: &dyn CallLevelApi, kind: HandleKind, handle: RawHandle) -> bool {
    diagnostic_records(api, kind, handle)
        .iter()
        .any(|r| CONNECTION_LOST_STATES.contains(&r.state.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SqliteDriver;

    fn environment(driver: &SqliteDriver) -> RawHandle {
        let mut env = RawHandle::NULL;
        driver.alloc_handle(HandleKind::Environment, RawHandle::NULL, &mut env);
        env
    }

    #[test]
    fn test_no_records_yields_fallback() {
        let driver = SqliteDriver::new();
        let env = environment(&driver);
        assert_eq!(read_diagnostics(&driver, HandleKind::Environment, env), NO_DIAGNOSTICS);
    }

    #[test]
    fn test_null_and_unknown_handles_yield_fallback() {
        let driver = SqliteDriver::new();
        assert_eq!(
            read_diagnostics(&driver, HandleKind::Statement, RawHandle::NULL),
            NO_DIAGNOSTICS
        );
        assert_eq!(
            read_diagnostics(&driver, HandleKind::Statement, RawHandle(4242)),
            NO_DIAGNOSTICS
        );
    }

    #[test]
    fn test_records_are_aggregated() {
        let driver = SqliteDriver::new();
        let env = environment(&driver);
        // ODBC version not negotiated yet: the environment reports HY010
        let mut dbc = RawHandle::NULL;
        let rc = driver.alloc_handle(HandleKind::Connection, env, &mut dbc);

        let text = read_diagnostics_for(&driver, HandleKind::Environment, env, rc);
        insta::assert_snapshot!(text, @"SQL_ERROR: STATE: HY010, Native Error: -1: ODBC version not set");
    }

    #[test]
    fn test_prefix_names_return_code() {
        let driver = SqliteDriver::new();
        let env = environment(&driver);
        let text = read_diagnostics_for(&driver, HandleKind::Environment, env, SqlReturn::NeedData);
        assert!(text.starts_with("SQL_NEED_DATA: "));
        assert!(text.ends_with(NO_DIAGNOSTICS));
    }

    #[test]
    fn test_format_record() {
        let record = DiagnosticRecord {
            state: "42S02".to_string(),
            native_error: 1,
            message: "no such table: t".to_string(),
        };
        assert_eq!(
            format_record(&record),
            "STATE: 42S02, Native Error: 1: no such table: t"
        );
    }
}
