use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    name::{AccountId, ScopeId, TableId},
    primary_key::PrimaryKey,
    revision::{Revision, IMPOSSIBLE_REVISION},
};

/// The reserved field name under which the service header is persisted next
/// to the row value. User payloads must never contain this field.
pub const SERVICE_FIELD: &str = "_service_";

/// Identity of a table: `(code, scope, table)`.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TableKey {
    /// Owning account of the table's schema.
    pub code: AccountId,
    /// Subdivision of the table.
    pub scope: ScopeId,
    /// Table identifier within the account's schema.
    pub table: TableId,
}

impl Display for TableKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.code, self.scope, self.table)
    }
}

/// Identity of a row: table identity plus primary key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    /// The owning table.
    pub table: TableKey,
    /// The row's primary key.
    pub pk: PrimaryKey,
}

impl Display for ServiceKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.pk)
    }
}

/// Tag distinguishing the role of a persisted undo row.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum UndoRecordKind {
    /// Not an undo row.
    #[default]
    None,
    /// The row was created at this revision; undo removes it.
    NewValue,
    /// Pre-image of an updated row; undo restores it.
    OldValue,
    /// Full pre-image of a removed row; undo reinserts it.
    RemovedValue,
    /// Reservation of the next free primary key; undo restores the
    /// allocation boundary.
    NextPk,
}

impl Display for UndoRecordKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let tag = match self {
            UndoRecordKind::None => "none",
            UndoRecordKind::NewValue => "new",
            UndoRecordKind::OldValue => "old",
            UndoRecordKind::RemovedValue => "removed",
            UndoRecordKind::NextPk => "next-pk",
        };
        write!(f, "{}", tag)
    }
}

/// Per-row metadata stored alongside the typed value.
///
/// The `undo_*` shadow fields are meaningful only on rows of the undo
/// stream: they snapshot the live row's header at the moment the undo
/// record was taken, so a rollback can restore it bit-exactly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    /// Owning account of the table's schema.
    pub code: AccountId,
    /// Subdivision of the table.
    pub scope: ScopeId,
    /// Table identifier.
    pub table: TableId,
    /// The row's primary key.
    pub pk: PrimaryKey,
    /// Account billed for the row's storage bytes.
    pub payer: AccountId,
    /// Account owning the row; empty means "same as payer".
    pub owner: AccountId,
    /// Canonical storage size of the value, in bytes.
    pub size: u64,
    /// Whether the row is held in RAM by the hosting node.
    pub in_ram: bool,
    /// Block time slot the row's storage was last billed at. Rollback
    /// refunds land on this slot.
    pub time_slot: u32,
    /// Revision the row was last written at.
    pub revision: Revision,

    /// Allocation-ordered unique key of an undo row.
    pub undo_pk: PrimaryKey,
    /// Role of the undo row; `None` on live rows.
    pub undo_rec: UndoRecordKind,
    /// Snapshot of `revision` taken when the undo record was created.
    pub undo_revision: Revision,
    /// Snapshot of `payer`.
    pub undo_payer: AccountId,
    /// Snapshot of `size`.
    pub undo_size: u64,
    /// Snapshot of `in_ram`.
    pub undo_in_ram: bool,
}

impl Default for ServiceState {
    fn default() -> Self {
        ServiceState {
            code: AccountId::EMPTY,
            scope: ScopeId(0),
            table: TableId(0),
            pk: PrimaryKey::UNSET,
            payer: AccountId::EMPTY,
            owner: AccountId::EMPTY,
            size: 0,
            in_ram: false,
            time_slot: 0,
            revision: IMPOSSIBLE_REVISION,
            undo_pk: PrimaryKey::UNSET,
            undo_rec: UndoRecordKind::None,
            undo_revision: IMPOSSIBLE_REVISION,
            undo_payer: AccountId::EMPTY,
            undo_size: 0,
            undo_in_ram: false,
        }
    }
}

impl ServiceState {
    /// The owning table's identity.
    pub fn table_key(&self) -> TableKey {
        TableKey {
            code: self.code,
            scope: self.scope,
            table: self.table,
        }
    }

    /// The row's identity.
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey {
            table: self.table_key(),
            pk: self.pk,
        }
    }
}

/// A row: service header plus the dynamically typed document value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectValue {
    /// The row's service header.
    pub service: ServiceState,
    /// The row's document value.
    pub value: Value,
}

impl ObjectValue {
    /// The row's primary key.
    pub fn pk(&self) -> PrimaryKey {
        self.service.pk
    }

    /// Returns `true` when the object carries no row (a missing-object
    /// marker returned by driver reads).
    pub fn is_null(&self) -> bool {
        self.value.is_null() && !self.service.pk.is_good()
    }

    /// A copy of the object carrying the service header only. Used for
    /// journal operations that address a row without shipping its value.
    pub fn clone_service(&self) -> ObjectValue {
        ObjectValue {
            service: self.service.clone(),
            value: Value::Null,
        }
    }
}
