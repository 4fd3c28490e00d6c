/// Database Module
///
/// The call-level database layer, split into focused submodules:
/// - **Diagnostics** (`diagnostics.rs`): reads and formats driver diagnostic records
/// - **Handles** (`handle.rs`): environment, connection and statement handle lifecycle
/// - **Prepared Statements** (`prepared.rs`): compilation, parameter binding and execution
/// - **Cursors** (`cursor.rs`): row fetching and typed column extraction
/// - **Connection** (`connection.rs`): the statement verbs and transaction management
/// - **Values** (`value.rs`): the closed set of value kinds and calendar conversions
///
/// ## Error Handling
///
/// All operations return the `OdbcError` type with the failing primitive and
/// the driver diagnostics attached.
pub mod connection;
pub mod cursor;
pub mod diagnostics;
pub mod handle;
pub mod prepared;
pub mod value;

pub use connection::{escape, Connection, TransactionGuard, TransactionState};
pub use cursor::{CursorState, DynamicRow, ResultCursor, ResultRow, Rows};
pub use handle::{ConnectionHandle, StatementHandle};
pub use prepared::PreparedStatement;
pub use value::{Parameter, Value, ValueKind};
