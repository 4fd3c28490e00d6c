/// Result Cursor Module
///
/// Row-by-row access to the result of an executed statement.
///
/// ## States
///
/// - **Unbound**: created without a statement handle; never yields a row
/// - **Active**: holds a live statement handle, positioned before or on a row
/// - **Exhausted**: the driver reported no more data, or the handle went stale
///
/// There is no way back from Exhausted.
///
/// Column values are extracted by 1-based ordinal, one extractor per
/// [`ValueKind`]. NULL is reported as `None`.

use crate::core::db::handle::StatementHandle;
use crate::core::db::value::{
    days_since_epoch, micros_since_epoch, truncate_to_micros, Value, ValueKind,
};
use crate::core::{OdbcError, Result};
use crate::driver::{
    poll_until_done, ColumnBuffer, SqlDate, SqlReturn, SqlTime, SqlTimestamp, NO_TOTAL, NULL_DATA,
};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::rc::Rc;
use tracing::{debug, warn};

/// Size of the first-pass buffer for text columns, terminator included.
pub const TEXT_SCRATCH_SIZE: usize = 256;

/// A row object filled by [`ResultCursor::advance`].
pub trait ResultRow {
    fn is_valid(&self) -> bool;

    fn validate(&mut self);

    fn invalidate(&mut self);

    /// Reads the columns of the current row through the cursor's extractors.
    fn bind(&mut self, cursor: &mut ResultCursor) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Unbound,
    Active,
    Exhausted,
}

/// Cursor over the result set of a prepared statement.
#[derive(Debug)]
pub struct ResultCursor {
    handle: Option<Rc<StatementHandle>>,
    debug: bool,
    state: CursorState,
}

impl ResultCursor {
    pub(crate) fn new(handle: Rc<StatementHandle>, debug: bool) -> Self {
        ResultCursor {
            handle: Some(handle),
            debug,
            state: CursorState::Active,
        }
    }

    /// A cursor without a statement: permanently exhausted.
    pub fn empty() -> Self {
        ResultCursor {
            handle: None,
            debug: false,
            state: CursorState::Unbound,
        }
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// `true` once no further row can be produced.
    pub fn is_exhausted(&self) -> bool {
        match (&self.state, &self.handle) {
            (CursorState::Active, Some(handle)) => !handle.is_live(),
            _ => true,
        }
    }

    /// Moves to the next row and lets `row` read its columns.
    ///
    /// # Returns
    ///
    /// `Ok(true)` when a row was fetched and bound, `Ok(false)` when the cursor
    /// is (or just became) exhausted; `row` is invalidated in that case.
    pub fn advance<R: ResultRow + ?Sized>(&mut self, row: &mut R) -> Result<bool> {
        let handle = match (self.state, &self.handle) {
            (CursorState::Unbound, _) | (_, None) => {
                row.invalidate();
                return Ok(false);
            }
            (CursorState::Exhausted, _) => {
                if row.is_valid() {
                    row.invalidate();
                }
                return Ok(false);
            }
            (CursorState::Active, Some(handle)) => Rc::clone(handle),
        };

        if !handle.is_live() {
            self.finish(row);
            return Ok(false);
        }

        let rc = poll_until_done(|| handle.api().fetch(handle.raw()));
        match rc {
            SqlReturn::Success | SqlReturn::SuccessWithInfo => {
                if rc == SqlReturn::SuccessWithInfo {
                    warn!("SQLFetch: {}", handle.diagnostics(rc));
                } else if self.debug {
                    debug!("SQLFetch: row available");
                }
                if !row.is_valid() {
                    row.validate();
                }
                row.bind(self)?;
                Ok(true)
            }
            SqlReturn::NoData => {
                if self.debug {
                    debug!("SQLFetch: no more rows");
                }
                self.finish(row);
                Ok(false)
            }
            _ => Err(OdbcError::Fetch {
                operation: "SQLFetch".to_string(),
                column: 0,
                diagnostics: handle.diagnostics(rc),
            }),
        }
    }

    fn finish<R: ResultRow + ?Sized>(&mut self, row: &mut R) {
        self.state = CursorState::Exhausted;
        if row.is_valid() {
            row.invalidate();
        }
    }

    /// Fetches the next row as one value per entry of `kinds`.
    pub fn fetch_row(&mut self, kinds: &[ValueKind]) -> Result<Option<Vec<Option<Value>>>> {
        let mut row = DynamicRow::new(kinds.to_vec());
        if self.advance(&mut row)? {
            Ok(Some(row.into_values()))
        } else {
            Ok(None)
        }
    }

    /// Iterator over the remaining rows, read as `kinds`.
    pub fn rows(self, kinds: &[ValueKind]) -> Rows {
        Rows {
            cursor: self,
            kinds: kinds.to_vec(),
        }
    }

    /// Number of rows the driver reports, when it reports one.
    ///
    /// Advisory only: many drivers answer -1 for result sets.
    pub fn row_count(&self) -> Result<Option<u64>> {
        let handle = match &self.handle {
            Some(handle) if handle.is_live() => handle,
            _ => return Ok(None),
        };
        let mut count: isize = 0;
        let rc = handle.api().row_count(handle.raw(), &mut count);
        if !rc.succeeded() {
            return Err(OdbcError::Fetch {
                operation: "SQLRowCount".to_string(),
                column: 0,
                diagnostics: handle.diagnostics(rc),
            });
        }
        Ok(u64::try_from(count).ok())
    }

    /// Calls `SQLGetData` for `column`; `SQL_NO_DATA` is passed back to the caller.
    fn get_data(&self, column: u16, target: ColumnBuffer<'_>) -> Result<(SqlReturn, isize)> {
        let handle = match &self.handle {
            Some(handle) if handle.is_live() => handle,
            _ => {
                return Err(OdbcError::Fetch {
                    operation: "SQLGetData".to_string(),
                    column,
                    diagnostics: "cursor has no statement".to_string(),
                })
            }
        };
        let mut indicator: isize = 0;
        let rc = handle.api().get_data(handle.raw(), column, target, &mut indicator);
        match rc {
            SqlReturn::Success | SqlReturn::SuccessWithInfo | SqlReturn::NoData => {
                Ok((rc, indicator))
            }
            _ => Err(OdbcError::Fetch {
                operation: "SQLGetData".to_string(),
                column,
                diagnostics: handle.diagnostics(rc),
            }),
        }
    }

    /// Fixed-size retrieval; returns `true` when the column is NULL.
    fn get_fixed(&self, column: u16, target: ColumnBuffer<'_>) -> Result<bool> {
        let (rc, indicator) = self.get_data(column, target)?;
        if rc == SqlReturn::SuccessWithInfo {
            if let Some(handle) = &self.handle {
                warn!("SQLGetData column {}: {}", column, handle.diagnostics(rc));
            }
        }
        Ok(rc == SqlReturn::NoData || indicator == NULL_DATA)
    }

    pub fn extract_boolean(&mut self, column: u16) -> Result<Option<bool>> {
        let mut value: u8 = 0;
        let is_null = self.get_fixed(column, ColumnBuffer::Bit(&mut value))?;
        Ok((!is_null).then_some(value != 0))
    }

    pub fn extract_integer(&mut self, column: u16) -> Result<Option<i64>> {
        let mut value: i64 = 0;
        let is_null = self.get_fixed(column, ColumnBuffer::SBigInt(&mut value))?;
        Ok((!is_null).then_some(value))
    }

    pub fn extract_float(&mut self, column: u16) -> Result<Option<f64>> {
        let mut value: f64 = 0.0;
        let is_null = self.get_fixed(column, ColumnBuffer::Double(&mut value))?;
        Ok((!is_null).then_some(value))
    }

    /// Reads a text column of any length.
    ///
    /// The first pass reads into a [`TEXT_SCRATCH_SIZE`] buffer. When the driver
    /// reports a longer value, the remainder is fetched into a buffer sized from
    /// the reported length and appended. An unknown total length yields an
    /// empty string.
    pub fn extract_text(&mut self, column: u16) -> Result<Option<String>> {
        let mut scratch = [0u8; TEXT_SCRATCH_SIZE];
        let (rc, indicator) = self.get_data(column, ColumnBuffer::Char(&mut scratch))?;
        if rc == SqlReturn::NoData || indicator == NULL_DATA {
            return Ok(None);
        }
        if indicator == NO_TOTAL || indicator < 0 {
            warn!("SQLGetData column {}: total length unknown", column);
            return Ok(Some(String::new()));
        }

        let total = indicator as usize;
        let capacity = TEXT_SCRATCH_SIZE - 1;
        let mut bytes = scratch[..total.min(capacity)].to_vec();
        if total > capacity {
            let mut rest = vec![0u8; total - capacity + 1];
            let (rc, indicator) = self.get_data(column, ColumnBuffer::Char(&mut rest))?;
            if rc != SqlReturn::NoData && indicator >= 0 {
                let len = (indicator as usize).min(rest.len() - 1);
                bytes.extend_from_slice(&rest[..len]);
            }
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub fn extract_date(&mut self, column: u16) -> Result<Option<NaiveDate>> {
        let mut native = SqlDate::default();
        if self.get_fixed(column, ColumnBuffer::Date(&mut native))? {
            return Ok(None);
        }
        NaiveDate::try_from(native)
            .map(Some)
            .map_err(|e| calendar_error(column, e))
    }

    /// Reads a timestamp, truncated to microsecond precision.
    pub fn extract_date_time(&mut self, column: u16) -> Result<Option<NaiveDateTime>> {
        let mut native = SqlTimestamp::default();
        if self.get_fixed(column, ColumnBuffer::Timestamp(&mut native))? {
            return Ok(None);
        }
        NaiveDateTime::try_from(native)
            .map(|ts| Some(truncate_to_micros(ts)))
            .map_err(|e| calendar_error(column, e))
    }

    pub fn extract_time(&mut self, column: u16) -> Result<Option<NaiveTime>> {
        let mut native = SqlTime::default();
        if self.get_fixed(column, ColumnBuffer::Time(&mut native))? {
            return Ok(None);
        }
        NaiveTime::try_from(native)
            .map(Some)
            .map_err(|e| calendar_error(column, e))
    }

    /// A date column as days since 1970-01-01.
    pub fn extract_days_since_epoch(&mut self, column: u16) -> Result<Option<i32>> {
        Ok(self.extract_date(column)?.map(days_since_epoch))
    }

    /// A timestamp column as microseconds since 1970-01-01 00:00:00.
    pub fn extract_micros_since_epoch(&mut self, column: u16) -> Result<Option<i64>> {
        Ok(self.extract_date_time(column)?.map(micros_since_epoch))
    }

    /// Extracts `column` with the extractor for `kind`.
    pub fn extract(&mut self, column: u16, kind: ValueKind) -> Result<Option<Value>> {
        Ok(match kind {
            ValueKind::Boolean => self.extract_boolean(column)?.map(Value::Boolean),
            ValueKind::Integer => self.extract_integer(column)?.map(Value::Integer),
            ValueKind::Float => self.extract_float(column)?.map(Value::Float),
            ValueKind::Text => self.extract_text(column)?.map(Value::Text),
            ValueKind::Date => self.extract_date(column)?.map(Value::Date),
            ValueKind::DateTime => self.extract_date_time(column)?.map(Value::DateTime),
            ValueKind::Time => self.extract_time(column)?.map(Value::Time),
        })
    }
}

fn calendar_error(column: u16, error: impl std::fmt::Display) -> OdbcError {
    OdbcError::Fetch {
        operation: "SQLGetData".to_string(),
        column,
        diagnostics: error.to_string(),
    }
}

/// A row whose column kinds are known only at runtime.
#[derive(Debug, Clone, Default)]
pub struct DynamicRow {
    kinds: Vec<ValueKind>,
    values: Vec<Option<Value>>,
    valid: bool,
}

impl DynamicRow {
    pub fn new(kinds: Vec<ValueKind>) -> Self {
        DynamicRow {
            kinds,
            values: Vec::new(),
            valid: false,
        }
    }

    pub fn values(&self) -> &[Option<Value>] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Option<Value>> {
        self.values
    }
}

impl ResultRow for DynamicRow {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn validate(&mut self) {
        self.valid = true;
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.values.clear();
    }

    fn bind(&mut self, cursor: &mut ResultCursor) -> Result<()> {
        self.values.clear();
        for (position, kind) in self.kinds.iter().enumerate() {
            let column = u16::try_from(position + 1).map_err(|_| OdbcError::Fetch {
                operation: "SQLGetData".to_string(),
                column: u16::MAX,
                diagnostics: format!("too many columns: {}", self.kinds.len()),
            })?;
            self.values.push(cursor.extract(column, *kind)?);
        }
        Ok(())
    }
}

/// Iterator returned by [`ResultCursor::rows`].
pub struct Rows {
    cursor: ResultCursor,
    kinds: Vec<ValueKind>,
}

impl Iterator for Rows {
    type Item = Result<Vec<Option<Value>>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.fetch_row(&self.kinds).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::core::db::handle::ConnectionHandle;
    use crate::core::db::prepared::PreparedStatement;
    use crate::driver::SqliteDriver;

    fn select(sql: &str) -> (ConnectionHandle, PreparedStatement) {
        let driver = Rc::new(SqliteDriver::new());
        let mut handle = ConnectionHandle::new(driver, Rc::new(ConnectionConfig::new(":memory:"))).unwrap();
        let mut stmt = PreparedStatement::prepare(&mut handle, sql).unwrap();
        stmt.execute(&mut handle).unwrap();
        (handle, stmt)
    }

    #[test]
    fn test_empty_cursor_is_exhausted() {
        let mut cursor = ResultCursor::empty();
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.state(), CursorState::Unbound);

        let mut row = DynamicRow::new(vec![ValueKind::Integer]);
        row.validate();
        assert!(!cursor.advance(&mut row).unwrap());
        assert!(!row.is_valid());
        assert!(!cursor.advance(&mut row).unwrap());
        assert_eq!(cursor.row_count().unwrap(), None);
    }

    #[test]
    fn test_advance_until_exhausted() {
        let (_handle, stmt) = select("SELECT 1 UNION ALL SELECT 2 ORDER BY 1");
        let mut cursor = stmt.cursor();
        let mut row = DynamicRow::new(vec![ValueKind::Integer]);

        assert!(cursor.advance(&mut row).unwrap());
        assert!(row.is_valid());
        assert_eq!(row.values(), &[Some(Value::Integer(1))]);
        assert!(cursor.advance(&mut row).unwrap());
        assert_eq!(row.values(), &[Some(Value::Integer(2))]);

        assert!(!cursor.advance(&mut row).unwrap());
        assert!(!row.is_valid());
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.state(), CursorState::Exhausted);
        assert!(!cursor.advance(&mut row).unwrap());
    }

    #[test]
    fn test_null_columns() {
        let (_handle, stmt) = select("SELECT NULL, NULL, NULL, NULL, NULL");
        let kinds = [
            ValueKind::Boolean,
            ValueKind::Integer,
            ValueKind::Float,
            ValueKind::Text,
            ValueKind::DateTime,
        ];
        let row = stmt.cursor().fetch_row(&kinds).unwrap().unwrap();
        assert!(row.iter().all(Option::is_none));
    }

    #[test]
    fn test_text_scratch_boundaries() {
        for len in [0usize, 1, 254, 255, 256, 257, 1000] {
            let text: String = (0..len).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
            let (_handle, stmt) = select(&format!("SELECT '{}'", text));
            let mut cursor = stmt.cursor();
            let mut row = DynamicRow::new(vec![ValueKind::Text]);
            assert!(cursor.advance(&mut row).unwrap());
            assert_eq!(row.values(), &[Some(Value::Text(text.clone()))], "length {}", len);
        }
    }

    #[test]
    fn test_invalid_column_is_fetch_error() {
        let (_handle, stmt) = select("SELECT 1");
        let mut cursor = stmt.cursor();
        let mut row = DynamicRow::new(vec![ValueKind::Integer, ValueKind::Integer]);
        let err = cursor.advance(&mut row).unwrap_err();
        match err {
            OdbcError::Fetch { column, diagnostics, .. } => {
                assert_eq!(column, 2);
                assert!(diagnostics.contains("07009"));
            }
            other => panic!("Expected fetch error, got {:?}", other),
        }
    }

    #[test]
    fn test_epoch_scalars() {
        let (_handle, stmt) = select("SELECT '1970-01-11', '1970-01-01 00:00:01.000002'");
        let mut cursor = stmt.cursor();
        let mut row = DynamicRow::new(Vec::new());
        assert!(cursor.advance(&mut row).unwrap());
        assert_eq!(cursor.extract_days_since_epoch(1).unwrap(), Some(10));
        assert_eq!(cursor.extract_micros_since_epoch(2).unwrap(), Some(1_000_002));
    }

    #[test]
    fn test_rows_iterator() {
        let (_handle, stmt) = select("SELECT 'a', 1 UNION ALL SELECT 'b', 2 ORDER BY 2");
        let rows: Vec<_> = stmt
            .cursor()
            .rows(&[ValueKind::Text, ValueKind::Integer])
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], Some(Value::Text("b".to_string())));
    }
}
