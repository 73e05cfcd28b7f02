//! Seam to the backing-store driver.
//!
//! The driver owns the persistent row set and the cursors over it. The
//! controller keeps it at arm's length: pending writes are buffered in the
//! [`Journal`](crate::journal::Journal) and handed over on flush, so the
//! driver only ever sees completed batches.

pub mod memory;

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use serde_json::Value;

use statedb_types::{AccountId, EntityDescriptor, ObjectValue, PrimaryKey};

use crate::{error::Error, journal::Journal};

pub use memory::{DriverStats, MemoryDriver};

/// Identifier of an open driver cursor.
pub type CursorId = u64;

/// Position of a driver cursor: its id and the primary key of the row under
/// it (`END` past the last row).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CursorInfo {
    /// The cursor id.
    pub id: CursorId,
    /// The primary key under the cursor.
    pub pk: PrimaryKey,
}

/// Contract required of a backing-store driver.
///
/// Index keys arrive as JSON tuples matching a prefix of the index orders;
/// `Value::Null` addresses the start of the index.
pub trait Driver {
    /// Opens a cursor at the first row whose key is not less than `key`.
    fn lower_bound(&mut self, index: EntityDescriptor, key: Value) -> Result<CursorInfo, Error>;

    /// Opens a cursor at the first row whose key is strictly greater than
    /// `key`.
    fn upper_bound(&mut self, index: EntityDescriptor, key: Value) -> Result<CursorInfo, Error>;

    /// Opens a cursor at the row `(key, pk)`, or at the first position
    /// after it.
    fn locate_to(
        &mut self,
        index: EntityDescriptor,
        key: Value,
        pk: PrimaryKey,
    ) -> Result<CursorInfo, Error>;

    /// Opens a cursor at the first row of an index.
    fn begin(&mut self, index: EntityDescriptor) -> Result<CursorInfo, Error>;

    /// Opens a cursor past the last row of an index.
    fn end(&mut self, index: EntityDescriptor) -> Result<CursorInfo, Error>;

    /// The current position of a cursor.
    fn current(&mut self, id: CursorId) -> Result<CursorInfo, Error>;

    /// Advances a cursor and returns its new position.
    fn next(&mut self, id: CursorId) -> Result<CursorInfo, Error>;

    /// Steps a cursor back and returns its new position.
    fn prev(&mut self, id: CursorId) -> Result<CursorInfo, Error>;

    /// Duplicates a cursor at its current position.
    fn clone_cursor(&mut self, id: CursorId) -> Result<CursorInfo, Error>;

    /// Closes a cursor. Unknown ids are ignored.
    fn close(&mut self, id: CursorId);

    /// Closes every cursor opened over an account's tables.
    fn close_code_cursors(&mut self, code: AccountId);

    /// The row under a cursor, or `None` at the end position.
    fn object_at_cursor(&mut self, id: CursorId) -> Result<Option<ObjectValue>, Error>;

    /// Reads a row by primary key, or `None` when absent.
    fn object_by_pk(
        &mut self,
        table: &EntityDescriptor,
        pk: PrimaryKey,
    ) -> Result<Option<ObjectValue>, Error>;

    /// The next free primary key of a table.
    fn available_pk(&mut self, table: &EntityDescriptor) -> Result<PrimaryKey, Error>;

    /// Reserves `pk` so [`available_pk`](Self::available_pk) never hands it
    /// out again.
    fn skip_pk(&mut self, table: &EntityDescriptor, pk: PrimaryKey);

    /// Applies every buffered change of the journal, in arrival order per
    /// row, data and undo stream of one logical operation together.
    fn apply_all_changes(&mut self, journal: &Journal) -> Result<(), Error>;

    /// Applies the buffered changes of one account's tables.
    fn apply_code_changes(&mut self, journal: &Journal, code: AccountId) -> Result<(), Error>;

    /// Drops every row, cursor and reservation.
    fn drop_db(&mut self) -> Result<(), Error>;

    /// Creates an index over a table.
    fn create_index(&mut self, index: &EntityDescriptor) -> Result<(), Error>;

    /// Drops an index.
    fn drop_index(&mut self, index: &EntityDescriptor) -> Result<(), Error>;

    /// Switches data-stream application into rollback-replay mode: inserts
    /// upsert, removals of missing rows are ignored. Active until
    /// [`disable_undo_restore`](Self::disable_undo_restore).
    fn enable_undo_restore(&mut self);

    /// Leaves rollback-replay mode.
    fn disable_undo_restore(&mut self);
}

/// Kind of backing-store driver to connect to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DriverKind {
    /// The in-memory driver shipped with the core.
    Memory,
    /// A MongoDB driver provided by the host process.
    MongoDb,
}

impl Display for DriverKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            DriverKind::Memory => write!(f, "memory"),
            DriverKind::MongoDb => write!(f, "mongodb"),
        }
    }
}

impl FromStr for DriverKind {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "memory" => Ok(DriverKind::Memory),
            "mongodb" => Ok(DriverKind::MongoDb),
            other => Err(Error::UnknownConnectionType(other.to_string())),
        }
    }
}

/// Construction parameters of the store: the driver kind, its address and
/// the system account owning the undo and schema tables.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Which driver to connect to.
    pub kind: DriverKind,
    /// Driver address. Ignored by the in-memory driver.
    pub address: String,
    /// The system account owning the undo and schema tables.
    pub sys_code: AccountId,
}

impl StoreConfig {
    /// An in-memory store owned by `sys_code`.
    pub fn in_memory(sys_code: AccountId) -> StoreConfig {
        StoreConfig {
            kind: DriverKind::Memory,
            address: String::new(),
            sys_code,
        }
    }

    /// Parses CLI-style arguments. An empty system account selects the
    /// default one.
    pub fn from_args(kind: &str, address: &str, sys_code: &str) -> Result<StoreConfig, Error> {
        let sys_code = if sys_code.is_empty() {
            AccountId::SYSTEM
        } else {
            sys_code
                .parse()
                .map(AccountId)
                .map_err(|_| Error::InvalidSystemAccount(sys_code.to_string()))?
        };
        Ok(StoreConfig {
            kind: kind.parse()?,
            address: address.to_string(),
            sys_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{AccountId, DriverKind, StoreConfig};

    #[test]
    fn driver_kind_parses_case_insensitively() {
        assert_eq!("MongoDB".parse::<DriverKind>().unwrap(), DriverKind::MongoDb);
        assert_eq!("memory".parse::<DriverKind>().unwrap(), DriverKind::Memory);
        assert!("oracle".parse::<DriverKind>().is_err());
    }

    #[test]
    fn config_args_default_the_system_account() {
        let config = StoreConfig::from_args("mongodb", "mongodb://localhost", "").unwrap();
        assert_eq!(config.kind, DriverKind::MongoDb);
        assert_eq!(config.sys_code, AccountId::SYSTEM);

        let config = StoreConfig::from_args("memory", "", "42").unwrap();
        assert_eq!(config.sys_code, AccountId(42));

        assert!(StoreConfig::from_args("memory", "", "not-a-number").is_err());
    }
}
