//! Errors surfaced by the table controller and its components.

use thiserror::Error;

use statedb_types::{
    AccountId, IndexId, PrimaryKey, Revision, ServiceKey, TableId, TableKey,
};

use crate::driver::CursorId;

/// Classification of an [`Error`] for the caller's recovery decision.
///
/// Schema and driver errors abort the current operation and leave the cache
/// and journal untouched for that row. Resource errors are raised after the
/// forward operation is journaled; the caller must undo the session.
/// Session errors are fatal to the containing block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown table or index, reserved field, invalid stored type,
    /// primary-key mismatch.
    Schema,
    /// The backing store disagrees with the expected row set.
    Driver,
    /// Illegal session transition or corrupt undo stream.
    Session,
    /// The payer cannot cover a storage delta.
    Resource,
    /// An invariant of the store itself has been violated.
    Internal,
}

/// Error raised by the table controller, the undo engine or the driver.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The requested table is not part of the account's schema.
    #[error("table {table} is not defined in the schema of account {code}")]
    UnknownTable {
        /// Account whose schema was consulted.
        code: AccountId,
        /// The missing table.
        table: TableId,
    },
    /// The requested index is not part of the table definition.
    #[error("index {index} is not defined for table {table} of account {code}")]
    UnknownIndex {
        /// Account whose schema was consulted.
        code: AccountId,
        /// The owning table.
        table: TableId,
        /// The missing index.
        index: IndexId,
    },
    /// A row value uses the field name reserved for the service header.
    #[error("row {key} uses the reserved field \"{field}\"")]
    ReservedField {
        /// The offending row.
        key: ServiceKey,
        /// The reserved field name.
        field: &'static str,
    },
    /// A row value is not a document.
    #[error("row {key} is not a document")]
    InvalidStoredType {
        /// The offending row.
        key: ServiceKey,
    },
    /// The primary key inside a row value disagrees with its header.
    #[error("row {key} carries primary key {value_pk} in its value")]
    PrimaryKeyMismatch {
        /// The row as addressed by its header.
        key: ServiceKey,
        /// The key found inside the value.
        value_pk: PrimaryKey,
    },
    /// A row expected in the backing store is missing.
    #[error("row {key} is missing from the backing store")]
    AbsentObject {
        /// The missing row.
        key: ServiceKey,
    },
    /// The backing store returned a row where the end of an index was
    /// expected.
    #[error("driver returned row {key} where the end of the index was expected")]
    WrongObject {
        /// The unexpected row.
        key: ServiceKey,
    },
    /// A row was inserted over an existing row with the same key.
    #[error("duplicate row {key} in the backing store")]
    DuplicateRow {
        /// The duplicated row.
        key: ServiceKey,
    },
    /// A cursor id is unknown to the driver.
    #[error("unknown cursor {id}")]
    UnknownCursor {
        /// The unknown cursor id.
        id: CursorId,
    },
    /// A session was opened at a revision not above the table's current one.
    #[error("bad revision {current} (new {requested}) for table {table}")]
    BadSessionRevision {
        /// The affected table.
        table: TableKey,
        /// The table's current revision.
        current: Revision,
        /// The revision requested for the new session.
        requested: Revision,
    },
    /// The head frame of a table does not match the revision being undone
    /// or squashed.
    #[error("wrong {operation} revision {requested} != {current}")]
    WrongSessionRevision {
        /// `"undo"` or `"squash"`.
        operation: &'static str,
        /// The revision requested by the caller.
        requested: Revision,
        /// The revision actually current.
        current: Revision,
    },
    /// No session is active for the requested transition.
    #[error("no active session for {operation}")]
    NoActiveSession {
        /// The rejected operation.
        operation: &'static str,
    },
    /// A table's undo stack is in the wrong stage for the transition.
    #[error("wrong stage of table {table} on {operation}")]
    WrongStage {
        /// The affected table.
        table: TableKey,
        /// The rejected operation.
        operation: &'static str,
    },
    /// A squash needs a previous frame the table does not have.
    #[error("table {table} has no previous state to merge into")]
    NoPreviousState {
        /// The affected table.
        table: TableKey,
    },
    /// The undo stream holds a record with an unusable tag.
    #[error("unknown undo record tag on row {key} while reading the undo stream")]
    UnknownUndoRecord {
        /// The corrupt undo row.
        key: ServiceKey,
    },
    /// `set_revision` was called while undo frames exist.
    #[error("cannot set revision while there is an existing undo stack")]
    NonEmptyUndoStack,
    /// The payer cannot cover the storage delta.
    #[error("payer {payer} cannot cover storage delta {delta} at slot {time_slot}")]
    StorageBudget {
        /// The failing payer.
        payer: AccountId,
        /// The rejected delta, in bytes.
        delta: i64,
        /// The slot of the charge.
        time_slot: u32,
    },
    /// The requested driver kind is not shipped with the core.
    #[error("driver \"{0}\" must be provided by the host")]
    DriverUnavailable(crate::driver::DriverKind),
    /// A driver-kind string did not parse.
    #[error("invalid connection type \"{0}\"")]
    UnknownConnectionType(String),
    /// A system-account string did not parse.
    #[error("invalid system account \"{0}\"")]
    InvalidSystemAccount(String),
    /// A row value failed to serialize or deserialize.
    #[error("row serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Classifies the error for the caller's recovery decision.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownTable { .. }
            | Error::UnknownIndex { .. }
            | Error::ReservedField { .. }
            | Error::InvalidStoredType { .. }
            | Error::PrimaryKeyMismatch { .. }
            | Error::UnknownConnectionType(_)
            | Error::InvalidSystemAccount(_)
            | Error::Serialization(_) => ErrorKind::Schema,
            Error::AbsentObject { .. }
            | Error::WrongObject { .. }
            | Error::DuplicateRow { .. }
            | Error::UnknownCursor { .. }
            | Error::DriverUnavailable(_) => ErrorKind::Driver,
            Error::BadSessionRevision { .. }
            | Error::WrongSessionRevision { .. }
            | Error::NoActiveSession { .. }
            | Error::WrongStage { .. }
            | Error::NoPreviousState { .. }
            | Error::UnknownUndoRecord { .. }
            | Error::NonEmptyUndoStack => ErrorKind::Session,
            Error::StorageBudget { .. } => ErrorKind::Resource,
        }
    }

    /// A stable machine tag naming the failure.
    pub fn tag(&self) -> &'static str {
        match self {
            Error::UnknownTable { .. } => "unknown_table",
            Error::UnknownIndex { .. } => "unknown_index",
            Error::ReservedField { .. } => "reserved_field",
            Error::InvalidStoredType { .. } => "invalid_stored_type",
            Error::PrimaryKeyMismatch { .. } => "primary_key_mismatch",
            Error::AbsentObject { .. } => "absent_object",
            Error::WrongObject { .. } => "wrong_object",
            Error::DuplicateRow { .. } => "duplicate_row",
            Error::UnknownCursor { .. } => "unknown_cursor",
            Error::BadSessionRevision { .. } => "bad_session_revision",
            Error::WrongSessionRevision { .. } => "wrong_session_revision",
            Error::NoActiveSession { .. } => "no_active_session",
            Error::WrongStage { .. } => "wrong_stage",
            Error::NoPreviousState { .. } => "no_previous_state",
            Error::UnknownUndoRecord { .. } => "unknown_undo_record",
            Error::NonEmptyUndoStack => "non_empty_undo_stack",
            Error::StorageBudget { .. } => "storage_budget",
            Error::DriverUnavailable(_) => "driver_unavailable",
            Error::UnknownConnectionType(_) => "unknown_connection_type",
            Error::InvalidSystemAccount(_) => "invalid_system_account",
            Error::Serialization(_) => "serialization",
        }
    }
}
