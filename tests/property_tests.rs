//! Property-based tests for value conversions and text retrieval
//!
//! These tests verify, for arbitrary inputs, that:
//! - Quote escaping is reversible and doubles every quote
//! - Epoch day and microsecond conversions invert each other
//! - Text of any length survives a bind and a piecewise fetch unchanged

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime};
    use odbc_connector::config::{ConnectionConfig, Dialect};
    use odbc_connector::core::db::value::{
        date_from_days_since_epoch, date_time_from_micros_since_epoch, days_since_epoch,
        micros_since_epoch,
    };
    use odbc_connector::core::db::{escape, Connection, Parameter, Value, ValueKind};
    use odbc_connector::driver::SqliteDriver;
    use proptest::prelude::*;
    use std::rc::Rc;

    fn memory_connection() -> Connection {
        let config = ConnectionConfig::new(":memory:").with_dialect(Dialect::Sqlite);
        Connection::new(Rc::new(SqliteDriver::new()), config).unwrap()
    }

    fn arb_date() -> impl Strategy<Value = NaiveDate> {
        // 0001-01-01 through 9999-12-31
        (-719_162i32..2_932_896).prop_map(|days| date_from_days_since_epoch(days).unwrap())
    }

    fn arb_date_time() -> impl Strategy<Value = NaiveDateTime> {
        (arb_date(), 0u32..86_400, 0u32..1_000_000).prop_map(|(date, secs, micros)| {
            date.and_hms_micro_opt(secs / 3600, (secs / 60) % 60, secs % 60, micros)
                .unwrap()
        })
    }

    proptest! {
        #[test]
        fn prop_escape_doubles_quotes(text in "\\PC{0,64}") {
            let escaped = escape(&text);
            prop_assert_eq!(
                escaped.matches('\'').count(),
                2 * text.matches('\'').count()
            );
            prop_assert_eq!(escaped.replace("''", "'"), text);
        }

        #[test]
        fn prop_days_since_epoch_inverse(date in arb_date()) {
            let days = days_since_epoch(date);
            prop_assert_eq!(date_from_days_since_epoch(days), Some(date));
        }

        #[test]
        fn prop_micros_since_epoch_inverse(ts in arb_date_time()) {
            let micros = micros_since_epoch(ts);
            prop_assert_eq!(date_time_from_micros_since_epoch(micros), Some(ts));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_text_survives_select(text in "\\PC{0,400}") {
            let mut conn = memory_connection();
            let mut select = conn.prepare("SELECT ?").unwrap();
            let mut cursor = conn
                .run_prepared_select(&mut select, &[Parameter::new(text.as_str())])
                .unwrap();
            let row = cursor.fetch_row(&[ValueKind::Text]).unwrap();
            prop_assert_eq!(row, Some(vec![Some(Value::Text(text))]));
        }

        #[test]
        fn prop_integer_survives_select(value in any::<i64>()) {
            let mut conn = memory_connection();
            let mut select = conn.prepare("SELECT ?").unwrap();
            let mut cursor = conn
                .run_prepared_select(&mut select, &[Parameter::new(value)])
                .unwrap();
            let row = cursor.fetch_row(&[ValueKind::Integer]).unwrap();
            prop_assert_eq!(row, Some(vec![Some(Value::Integer(value))]));
        }

        #[test]
        fn prop_float_survives_select(value in -1.0e12f64..1.0e12) {
            let mut conn = memory_connection();
            let mut select = conn.prepare("SELECT ?").unwrap();
            let mut cursor = conn
                .run_prepared_select(&mut select, &[Parameter::new(value)])
                .unwrap();
            let row = cursor.fetch_row(&[ValueKind::Float]).unwrap();
            prop_assert_eq!(row, Some(vec![Some(Value::Float(value))]));
        }

        #[test]
        fn prop_date_time_survives_select(ts in arb_date_time()) {
            let mut conn = memory_connection();
            let mut select = conn.prepare("SELECT ?").unwrap();
            let mut cursor = conn
                .run_prepared_select(&mut select, &[Parameter::new(ts)])
                .unwrap();
            let row = cursor.fetch_row(&[ValueKind::DateTime]).unwrap();
            prop_assert_eq!(row, Some(vec![Some(Value::DateTime(ts))]));
        }
    }
}
