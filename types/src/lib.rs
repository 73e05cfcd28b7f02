//! Shared data model of the `statedb` transactional object store.
//!
//! The crate defines the scalar identifiers, the per-row service header and
//! the typed object value that flow between the table controller, the row
//! cache, the undo engine and the backing-store driver.

#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_qualifications
)]

mod name;
mod payer;
mod primary_key;
mod revision;
mod schema_def;
mod service;

pub use name::{AccountId, IndexId, ScopeId, TableId};
pub use payer::{StoragePayer, TimeSlot};
pub use primary_key::PrimaryKey;
pub use revision::{Revision, IMPOSSIBLE_REVISION, START_REVISION};
pub use schema_def::{extract_u64, EntityDescriptor, EntityKind, IndexDef, OrderDef, TableDef};
pub use service::{ObjectValue, ServiceKey, ServiceState, TableKey, UndoRecordKind, SERVICE_FIELD};
