//! Buffer of pending write operations against the backing store.
//!
//! Every table write produces entries in up to two streams: the **data**
//! stream holds the observable rows, the **undo** stream holds the
//! compensation records the undo engine persists alongside them. The
//! journal keeps both per table, in arrival order, until the controller
//! flushes them to the driver — either everything at once or one account's
//! tables at a time.

use std::collections::BTreeMap;

use statedb_types::{AccountId, ObjectValue, Revision, ServiceState, TableKey};

/// One pending write against the backing store.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    /// Insert a new row.
    Insert(ObjectValue),
    /// Replace an existing row. When the value is `Null` only the service
    /// header of the stored row is replaced.
    Update(ObjectValue),
    /// Delete the row addressed by the header.
    Remove(ServiceState),
    /// Rewrite the stored row's revision from `from` to the header's
    /// revision. On the undo stream this moves the record between frames.
    Revision {
        /// The revision the stored row currently carries.
        from: Revision,
        /// The addressed row, carrying the new revision.
        service: ServiceState,
    },
}

impl WriteOp {
    /// The header of the addressed row.
    pub fn service(&self) -> &ServiceState {
        match self {
            WriteOp::Insert(obj) | WriteOp::Update(obj) => &obj.service,
            WriteOp::Remove(service) | WriteOp::Revision { service, .. } => service,
        }
    }
}

/// The pending operations of one table, split by stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableChanges {
    /// Operations against the observable rows, in arrival order.
    pub data: Vec<WriteOp>,
    /// Operations against the undo stream, in arrival order.
    pub undo: Vec<WriteOp>,
}

impl TableChanges {
    fn is_empty(&self) -> bool {
        self.data.is_empty() && self.undo.is_empty()
    }
}

/// The pending-write buffer. Tables are kept in `(code, scope, table)`
/// order so a flush walks accounts contiguously and deterministically.
#[derive(Debug, Default)]
pub struct Journal {
    tables: BTreeMap<TableKey, TableChanges>,
}

impl Journal {
    /// Creates an empty journal.
    pub fn new() -> Journal {
        Journal::default()
    }

    /// Appends an operation to a table's data stream.
    pub fn write_data(&mut self, table: TableKey, op: WriteOp) {
        self.tables.entry(table).or_default().data.push(op);
    }

    /// Appends an operation to a table's undo stream.
    pub fn write_undo(&mut self, table: TableKey, op: WriteOp) {
        self.tables.entry(table).or_default().undo.push(op);
    }

    /// Appends one data operation and one undo operation for the same
    /// logical write.
    pub fn write(&mut self, table: TableKey, data: WriteOp, undo: WriteOp) {
        let changes = self.tables.entry(table).or_default();
        changes.data.push(data);
        changes.undo.push(undo);
    }

    /// All buffered changes, table by table.
    pub fn changes(&self) -> impl Iterator<Item = (&TableKey, &TableChanges)> {
        self.tables.iter()
    }

    /// The buffered changes of one account's tables.
    pub fn code_changes(&self, code: AccountId) -> impl Iterator<Item = (&TableKey, &TableChanges)> {
        self.tables
            .iter()
            .filter(move |(key, _)| key.code == code)
    }

    /// Whether any change is buffered.
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(TableChanges::is_empty)
    }

    /// Discards everything.
    pub fn clear(&mut self) {
        self.tables.clear();
    }

    /// Discards the buffered changes of one account's tables.
    pub fn clear_code(&mut self, code: AccountId) {
        self.tables.retain(|key, _| key.code != code);
    }
}
