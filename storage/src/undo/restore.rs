//! Reconstruction of the in-memory undo stack from the persisted undo
//! stream after a restart.
//!
//! The scan depends on one ordering only: `(revision ASC, undo_pk ASC)`,
//! provided by a composite index over the system undo table that is created
//! on demand and dropped once the stack is rebuilt. Rows whose table schema
//! has changed since they were recorded are resolved against the schema in
//! force at their revision, recovered from the undo stream itself.

use std::{collections::BTreeMap, sync::Arc};

use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::info;

use statedb_types::{
    extract_u64, AccountId, EntityDescriptor, IndexDef, IndexId, OrderDef, PrimaryKey, Revision,
    ScopeId, TableDef, TableId, UndoRecordKind, START_REVISION,
};

use crate::{
    driver::Driver,
    error::Error,
    schema::SchemaProvider,
    undo::{TableUndoStack, UndoStack, UndoStage, NEXT_PK_FIELD},
};

/// The composite `(revision, undo_pk)` index used for the restore scan.
const REVISION_INDEX: IndexId = IndexId(1);

/// The field of a schema-table row carrying the account's table
/// definitions.
const TABLES_FIELD: &str = "tables";

static UNDO_TABLE_DEF: Lazy<Arc<TableDef>> = Lazy::new(|| {
    Arc::new(TableDef {
        name: TableId::UNDO,
        pk_order: OrderDef::asc("upk"),
        indexes: vec![IndexDef {
            name: REVISION_INDEX,
            unique: true,
            orders: vec![OrderDef::asc("rev"), OrderDef::asc("upk")],
        }],
    })
});

fn revision_index(sys_code: AccountId) -> EntityDescriptor {
    let table = EntityDescriptor::table(sys_code, ScopeId(0), Arc::clone(&UNDO_TABLE_DEF));
    let index = table.table.indexes[0].clone();
    table.with_index(Arc::new(index))
}

/// Per-account history of table definitions recovered from the undo
/// stream: the pre-images of schema-table rows carry the definitions that
/// were in force before each schema change.
struct SchemaHistory {
    accounts: BTreeMap<AccountId, Vec<(Revision, Vec<Arc<TableDef>>)>>,
}

impl SchemaHistory {
    fn load<D: Driver>(
        driver: &mut D,
        index: &EntityDescriptor,
        sys_code: AccountId,
    ) -> Result<SchemaHistory, Error> {
        let mut accounts: BTreeMap<AccountId, Vec<(Revision, Vec<Arc<TableDef>>)>> =
            BTreeMap::new();

        let mut position = driver.lower_bound(index.clone(), Value::Null)?;
        let cursor = position.id;
        while position.pk != PrimaryKey::END {
            let Some(obj) = driver.object_at_cursor(cursor)? else {
                break;
            };
            position = driver.next(cursor)?;

            let service = &obj.service;
            if service.code != sys_code || service.table != TableId::SCHEMA {
                continue;
            }
            match service.undo_rec {
                UndoRecordKind::NewValue | UndoRecordKind::NextPk => continue,
                UndoRecordKind::OldValue | UndoRecordKind::RemovedValue => {}
                UndoRecordKind::None => {
                    return Err(Error::UnknownUndoRecord {
                        key: service.service_key(),
                    });
                }
            }

            let Some(defs) = obj.value.get(TABLES_FIELD) else {
                continue;
            };
            let defs: Vec<TableDef> = serde_json::from_value(defs.clone())?;
            accounts
                .entry(AccountId(service.pk.value()))
                .or_default()
                .push((
                    service.revision,
                    defs.into_iter().map(Arc::new).collect(),
                ));
        }
        driver.close(cursor);

        Ok(SchemaHistory { accounts })
    }

    /// Resolves a table descriptor as of `revision`: the oldest recorded
    /// schema change above that revision wins, the live schema is the
    /// fallback.
    fn resolve(
        &self,
        schema: &dyn SchemaProvider,
        code: AccountId,
        scope: ScopeId,
        table: TableId,
        revision: Revision,
    ) -> Result<EntityDescriptor, Error> {
        if let Some(entries) = self.accounts.get(&code) {
            for (entry_revision, defs) in entries {
                if *entry_revision > revision {
                    let def = defs
                        .iter()
                        .find(|def| def.name == table)
                        .ok_or(Error::UnknownTable { code, table })?;
                    return Ok(EntityDescriptor::table(code, scope, Arc::clone(def)));
                }
            }
        }
        schema
            .find_table(code, scope, table)
            .ok_or(Error::UnknownTable { code, table })
    }
}

impl UndoStack {
    /// Rebuilds the in-memory undo stack from the persisted undo stream.
    /// A no-op when the engine already holds state (replays, warm starts).
    pub(crate) fn restore<D: Driver>(
        &mut self,
        driver: &mut D,
        schema: &dyn SchemaProvider,
        sys_code: AccountId,
    ) -> Result<(), Error> {
        if self.revision != START_REVISION || self.tail_revision != START_REVISION {
            info!(
                head = self.revision,
                tail = self.tail_revision,
                "skip restore of the undo state"
            );
            return Ok(());
        }

        let index = revision_index(sys_code);
        driver.create_index(&index)?;

        let history = SchemaHistory::load(driver, &index, sys_code)?;

        let mut position = driver.lower_bound(index.clone(), Value::Null)?;
        let cursor = position.id;
        let mut first_row = true;
        while position.pk != PrimaryKey::END {
            let Some(obj) = driver.object_at_cursor(cursor)? else {
                break;
            };
            position = driver.next(cursor)?;
            let service = obj.service.clone();

            let descriptor = history.resolve(
                schema,
                service.code,
                service.scope,
                service.table,
                service.revision,
            )?;

            let current_revision = self.revision;
            let stack = self
                .tables
                .entry(service.table_key())
                .or_insert_with(|| TableUndoStack::new(descriptor, current_revision));
            if stack.revision() != service.revision {
                stack.start_session(service.revision)?;
            }

            if service.undo_pk.is_good() && service.undo_pk.value() >= self.undo_pk {
                self.undo_pk = service.undo_pk.value() + 1;
            }
            if service.revision > self.revision {
                self.revision = service.revision;
            }
            if first_row {
                self.tail_revision = service.revision - 1;
                first_row = false;
            }

            match service.undo_rec {
                UndoRecordKind::NewValue => {
                    stack.head()?.new_values.insert(obj.pk().value(), obj);
                }
                UndoRecordKind::OldValue => {
                    stack.head()?.old_values.insert(obj.pk().value(), obj);
                }
                UndoRecordKind::RemovedValue => {
                    stack.head()?.removed_values.insert(obj.pk().value(), obj);
                }
                UndoRecordKind::NextPk => {
                    let reserved =
                        extract_u64(&obj.value, NEXT_PK_FIELD).ok_or(Error::UnknownUndoRecord {
                            key: service.service_key(),
                        })?;
                    stack.head()?;
                    stack.set_head_next_pk(PrimaryKey(reserved), service.undo_pk);
                }
                UndoRecordKind::None => {
                    return Err(Error::UnknownUndoRecord {
                        key: service.service_key(),
                    });
                }
            }
        }
        driver.close(cursor);
        driver.drop_index(&index)?;

        if self.revision != self.tail_revision {
            self.stage = UndoStage::Stack;
            let revision = self.revision;
            for stack in self.tables.values_mut() {
                if stack.revision() != revision {
                    stack.start_session(revision)?;
                }
            }
        }

        info!(
            head = self.revision,
            tail = self.tail_revision,
            tables = self.tables.len(),
            "undo state restored"
        );
        Ok(())
    }
}
