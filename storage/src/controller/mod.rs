//! The table controller: the public read/write façade over the driver,
//! cache, journal and undo engine.
//!
//! The controller is a by-value composite of its components. Every public
//! operation runs on one logical owner (the block-executing context);
//! nothing here locks or interleaves.

#[cfg(test)]
mod tests;

use std::{rc::Rc, sync::Arc};

use serde_json::{json, Value};
use tracing::debug;

use statedb_types::{
    AccountId, EntityDescriptor, IndexId, ObjectValue, PrimaryKey, Revision, ServiceKey,
    StoragePayer, TableKey, SERVICE_FIELD, START_REVISION,
};

use crate::{
    cache::{CacheObjectRef, RowCache},
    driver::{CursorId, Driver, DriverKind, MemoryDriver, StoreConfig},
    error::Error,
    journal::Journal,
    resource::ResourceManager,
    schema::SchemaProvider,
    storage_size::canonical_storage_size,
    undo::{UndoCtx, UndoStack},
};

/// How a keyed `lower_bound` may be served.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CursorKind {
    /// A real cursor over the full row set.
    ManyRecords,
    /// Serve from RAM only; never open a real cursor (a miss is `End`).
    InRAM,
    /// A single row is wanted; a cache hit short-circuits the driver.
    OneRecord,
}

/// Where a [`FindInfo`] points.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CursorHandle {
    /// Past the end, with no driver cursor open.
    End,
    /// Served from the row cache, with no driver cursor open.
    Ram,
    /// An open driver cursor.
    Driver(CursorId),
}

/// Result of a cursor-positioning operation: the handle, the primary key
/// under it and, when the row was served from RAM, a strong cache handle.
#[derive(Clone, Debug)]
pub struct FindInfo {
    /// The cursor handle.
    pub cursor: CursorHandle,
    /// The primary key under the cursor, `END` past the last row.
    pub pk: PrimaryKey,
    /// Strong handle to the cached row, when one backs this position.
    pub entry: Option<CacheObjectRef>,
    /// The table the cursor ranges over.
    pub table: TableKey,
}

impl FindInfo {
    fn end(table: TableKey) -> FindInfo {
        FindInfo {
            cursor: CursorHandle::End,
            pk: PrimaryKey::END,
            entry: None,
            table,
        }
    }

    fn at(cursor: CursorHandle, pk: PrimaryKey, entry: Option<CacheObjectRef>, table: TableKey) -> FindInfo {
        FindInfo {
            cursor,
            pk,
            entry,
            table,
        }
    }

    /// Whether the cursor points past the last row.
    pub fn is_end(&self) -> bool {
        self.pk == PrimaryKey::END
    }
}

/// Addresses one index of a table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IndexRequest {
    /// The owning table.
    pub table: TableKey,
    /// The index within the table's definition.
    pub index: IndexId,
}

/// The transactional object store: schema-typed tables over a backing
/// driver, with write-through caching, storage billing and a versioned
/// undo stack.
pub struct Controller<D: Driver> {
    driver: D,
    schema: Rc<dyn SchemaProvider>,
    resource: Rc<dyn ResourceManager>,
    journal: Journal,
    cache: RowCache,
    undo: UndoStack,
    sys_code: AccountId,
}

impl Controller<MemoryDriver> {
    /// Opens a store per `config`. Only the in-memory driver ships with the
    /// core; other kinds must be provided by the host through
    /// [`Controller::new`].
    pub fn open(
        config: StoreConfig,
        schema: Rc<dyn SchemaProvider>,
        resource: Rc<dyn ResourceManager>,
    ) -> Result<Controller<MemoryDriver>, Error> {
        match config.kind {
            DriverKind::Memory => Ok(Controller::new(
                MemoryDriver::new(),
                schema,
                resource,
                config.sys_code,
            )),
            other => Err(Error::DriverUnavailable(other)),
        }
    }
}

impl<D: Driver> Controller<D> {
    /// Assembles a controller over an already-connected driver.
    pub fn new(
        driver: D,
        schema: Rc<dyn SchemaProvider>,
        resource: Rc<dyn ResourceManager>,
        sys_code: AccountId,
    ) -> Controller<D> {
        Controller {
            driver,
            schema,
            resource,
            journal: Journal::new(),
            cache: RowCache::new(),
            undo: UndoStack::new(),
            sys_code,
        }
    }

    /// The backing driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Tears the controller down, handing the driver back to the host.
    pub fn into_driver(self) -> D {
        self.driver
    }

    /// The system account owning the undo and schema tables.
    pub fn sys_code(&self) -> AccountId {
        self.sys_code
    }

    /// The current session revision.
    pub fn revision(&self) -> Revision {
        self.undo.revision()
    }

    // ---- database lifecycle ------------------------------------------------

    /// Drops every cached value, undo frame, pending change and stored row.
    pub fn drop_db(&mut self) -> Result<(), Error> {
        self.cache.clear();
        self.undo.clear();
        self.journal.clear();
        self.driver.drop_db()
    }

    /// Re-creates an empty database and verifies the registered table
    /// structure by creating every declared index.
    pub fn initialize_db(&mut self) -> Result<(), Error> {
        self.drop_db()?;
        for table in self.schema.tables() {
            for index in table.table.indexes.clone() {
                let descriptor = table.with_index(Arc::new(index));
                self.driver.create_index(&descriptor)?;
            }
        }
        Ok(())
    }

    /// Rebuilds the in-memory undo stack from the backing store after a
    /// restart.
    pub fn restore_db(&mut self) -> Result<(), Error> {
        self.undo
            .restore(&mut self.driver, self.schema.as_ref(), self.sys_code)
    }

    // ---- sessions ----------------------------------------------------------

    /// Opens a nested undo session. With `enabled = false` nothing is
    /// recorded and [`IMPOSSIBLE_REVISION`](statedb_types::IMPOSSIBLE_REVISION)
    /// is returned.
    pub fn start_undo_session(&mut self, enabled: bool) -> Result<Revision, Error> {
        let revision = self.undo.start_undo_session(enabled)?;
        if enabled {
            self.cache.start_session(revision);
        }
        Ok(revision)
    }

    /// Accepts the head session, keeping its frames for a later commit or
    /// squash and releasing unreferenced cache entries.
    pub fn push_revision(&mut self, revision: Revision) -> Result<(), Error> {
        if revision != self.undo.revision() {
            return Err(Error::WrongSessionRevision {
                operation: "push",
                requested: revision,
                current: self.undo.revision(),
            });
        }
        self.cache.push_session(revision);
        Ok(())
    }

    /// Folds the head session into its parent.
    pub fn squash_revision(&mut self, revision: Revision) -> Result<(), Error> {
        let mut ctx = UndoCtx {
            driver: &mut self.driver,
            cache: &mut self.cache,
            journal: &mut self.journal,
            resource: self.resource.as_ref(),
        };
        self.undo.squash(revision, &mut ctx)?;
        self.cache.squash_session(revision);
        Ok(())
    }

    /// Rolls back the head session, in memory and in the backing store.
    pub fn undo_revision(&mut self, revision: Revision) -> Result<(), Error> {
        self.driver.enable_undo_restore();
        let outcome = (|| {
            let mut ctx = UndoCtx {
                driver: &mut self.driver,
                cache: &mut self.cache,
                journal: &mut self.journal,
                resource: self.resource.as_ref(),
            };
            self.undo.undo(revision, &mut ctx)?;
            self.cache.undo_session(revision);
            self.flush_all()
        })();
        self.driver.disable_undo_restore();
        outcome
    }

    /// Rolls back the current head session.
    pub fn undo_last_revision(&mut self) -> Result<(), Error> {
        self.undo_revision(self.undo.revision())
    }

    /// Makes every session at or below `revision` permanent.
    pub fn commit_revision(&mut self, revision: Revision) -> Result<(), Error> {
        self.undo.commit(revision, &mut self.journal)
    }

    /// Aligns the store to `revision` after genesis or snapshot import.
    pub fn set_revision(&mut self, revision: Revision) -> Result<(), Error> {
        self.undo.set_revision(revision)
    }

    // ---- flushing ----------------------------------------------------------

    /// Flushes every pending change to the driver. The journal is cleared
    /// only once the driver accepted the batch.
    pub fn apply_all_changes(&mut self) -> Result<(), Error> {
        self.flush_all()
    }

    /// Flushes the pending changes of one account's tables.
    pub fn apply_code_changes(&mut self, code: AccountId) -> Result<(), Error> {
        debug!(%code, "flushing account changes");
        self.driver.apply_code_changes(&self.journal, code)?;
        self.journal.clear_code(code);
        Ok(())
    }

    fn flush_all(&mut self) -> Result<(), Error> {
        if self.journal.is_empty() {
            self.journal.clear();
            return Ok(());
        }
        debug!("flushing pending changes");
        self.driver.apply_all_changes(&self.journal)?;
        self.journal.clear();
        Ok(())
    }

    // ---- cursor reads ------------------------------------------------------

    /// Positions a cursor at the first row of `index` whose key is not less
    /// than `key`. `OneRecord` and `InRAM` short-circuit on cache or
    /// negative-cache hits; a unique-index cache hit overrides whatever row
    /// the driver would report, because the driver does not yet see pending
    /// writes.
    pub fn lower_bound(
        &mut self,
        request: &IndexRequest,
        kind: CursorKind,
        key: &[u8],
    ) -> Result<FindInfo, Error> {
        let index = self.index_descriptor(request)?;
        let table = index.table_key();

        let mut key_value = None;
        let mut canonical = None;
        if !key.is_empty() {
            let value = self.schema.index_key_to_object(&index, key)?;
            canonical = Some(serde_json::to_vec(&value)?);
            key_value = Some(value);
        }

        let mut hit = None;
        let mut negative = None;
        if let Some(canonical) = &canonical {
            let unique = index
                .index
                .as_ref()
                .map(|def| def.unique)
                .unwrap_or(false);
            if unique {
                hit = self.cache.find_by_index(&index, canonical);
            }
            if hit.is_none() {
                negative = self.cache.find_unsuccess(&index, canonical);
            }
        }

        match kind {
            CursorKind::ManyRecords => {}
            CursorKind::InRAM if hit.is_none() && negative.is_none() => {
                return Ok(FindInfo::end(table));
            }
            CursorKind::InRAM | CursorKind::OneRecord => {
                if let Some(entry) = hit.take() {
                    let pk = entry.borrow().pk();
                    return Ok(FindInfo::at(CursorHandle::Ram, pk, Some(entry), table));
                }
                if let Some(landing) = negative {
                    return Ok(FindInfo::at(CursorHandle::Ram, landing, None, table));
                }
                // a OneRecord miss goes to the driver
            }
        }

        let query = key_value.clone().unwrap_or(Value::Null);
        let cursor = self.driver.lower_bound(index.clone(), query)?;

        if let Some(entry) = hit {
            let pk = entry.borrow().pk();
            return Ok(FindInfo::at(
                CursorHandle::Driver(cursor.id),
                pk,
                Some(entry),
                table,
            ));
        }
        if let Some(landing) = negative {
            return Ok(FindInfo::at(
                CursorHandle::Driver(cursor.id),
                landing,
                None,
                table,
            ));
        }

        let mut entry = None;
        if let (Some(canonical), Some(query)) = (&canonical, &key_value) {
            if cursor.pk.is_good() {
                if let Some(cached) = self.cache.find(&ServiceKey {
                    table,
                    pk: cursor.pk,
                }) {
                    if !index_key_matches(&index, cached.borrow().value(), query) {
                        self.cache.emplace_unsuccess(&index, canonical, cursor.pk);
                    }
                    entry = Some(cached);
                }
            } else {
                self.cache.emplace_unsuccess(&index, canonical, cursor.pk);
            }
        }

        Ok(FindInfo::at(
            CursorHandle::Driver(cursor.id),
            cursor.pk,
            entry,
            table,
        ))
    }

    /// Positions a cursor at the first row whose primary key is not less
    /// than `pk`, with the same cache short-circuits as the keyed form.
    pub fn lower_bound_pk(
        &mut self,
        table: &TableKey,
        kind: CursorKind,
        pk: PrimaryKey,
    ) -> Result<FindInfo, Error> {
        let descriptor = self.table_descriptor(table)?;
        let row_key = ServiceKey { table: *table, pk };

        let mut hit = self.cache.find(&row_key);
        let negative = if hit.is_none() {
            self.cache.find_unsuccess_pk(table, pk)
        } else {
            None
        };

        match kind {
            CursorKind::ManyRecords => {}
            CursorKind::InRAM if hit.is_none() && negative.is_none() => {
                return Ok(FindInfo::end(*table));
            }
            CursorKind::InRAM | CursorKind::OneRecord => {
                if let Some(entry) = hit.take() {
                    let found = entry.borrow().pk();
                    return Ok(FindInfo::at(CursorHandle::Ram, found, Some(entry), *table));
                }
                if let Some(landing) = negative {
                    return Ok(FindInfo::at(CursorHandle::Ram, landing, None, *table));
                }
            }
        }

        let cursor = self
            .driver
            .lower_bound(descriptor, json!(pk.value()))?;

        if let Some(entry) = hit {
            let found = entry.borrow().pk();
            return Ok(FindInfo::at(
                CursorHandle::Driver(cursor.id),
                found,
                Some(entry),
                *table,
            ));
        }
        if let Some(landing) = negative {
            return Ok(FindInfo::at(
                CursorHandle::Driver(cursor.id),
                landing,
                None,
                *table,
            ));
        }

        if pk != cursor.pk {
            self.cache.emplace_unsuccess_pk(table, pk, cursor.pk);
        }
        Ok(FindInfo::at(
            CursorHandle::Driver(cursor.id),
            cursor.pk,
            None,
            *table,
        ))
    }

    /// Positions a cursor by an already-decoded key, bypassing every cache.
    /// Serves out-of-band readers that must see exactly the driver state.
    pub fn lower_bound_value(
        &mut self,
        request: &IndexRequest,
        key: &Value,
    ) -> Result<FindInfo, Error> {
        let index = self.index_descriptor(request)?;
        let table = index.table_key();
        let cursor = self.driver.lower_bound(index, key.clone())?;
        Ok(FindInfo::at(
            CursorHandle::Driver(cursor.id),
            cursor.pk,
            None,
            table,
        ))
    }

    /// Positions a cursor at the first row of `index` whose key is strictly
    /// greater than `key`.
    pub fn upper_bound(&mut self, request: &IndexRequest, key: &[u8]) -> Result<FindInfo, Error> {
        let index = self.index_descriptor(request)?;
        let table = index.table_key();
        let query = if key.is_empty() {
            Value::Null
        } else {
            self.schema.index_key_to_object(&index, key)?
        };
        let cursor = self.driver.upper_bound(index, query)?;
        Ok(FindInfo::at(
            CursorHandle::Driver(cursor.id),
            cursor.pk,
            None,
            table,
        ))
    }

    /// Positions a cursor at the first row whose primary key is strictly
    /// greater than `pk`.
    pub fn upper_bound_pk(&mut self, table: &TableKey, pk: PrimaryKey) -> Result<FindInfo, Error> {
        let descriptor = self.table_descriptor(table)?;
        let cursor = self.driver.upper_bound(descriptor, json!(pk.value()))?;
        Ok(FindInfo::at(
            CursorHandle::Driver(cursor.id),
            cursor.pk,
            None,
            *table,
        ))
    }

    /// Positions a cursor at exactly `(key, pk)`, or at the first position
    /// after it. Used to re-seat cursors handed out earlier.
    pub fn locate_to(
        &mut self,
        request: &IndexRequest,
        key: &[u8],
        pk: PrimaryKey,
    ) -> Result<FindInfo, Error> {
        let index = self.index_descriptor(request)?;
        let table = index.table_key();
        let query = if key.is_empty() {
            Value::Null
        } else {
            self.schema.index_key_to_object(&index, key)?
        };
        let cursor = self.driver.locate_to(index, query, pk)?;
        Ok(FindInfo::at(
            CursorHandle::Driver(cursor.id),
            cursor.pk,
            None,
            table,
        ))
    }

    /// Positions a cursor at the first row of an index.
    pub fn begin(&mut self, request: &IndexRequest) -> Result<FindInfo, Error> {
        let index = self.index_descriptor(request)?;
        let table = index.table_key();
        let cursor = self.driver.begin(index)?;
        Ok(FindInfo::at(
            CursorHandle::Driver(cursor.id),
            cursor.pk,
            None,
            table,
        ))
    }

    /// Positions a cursor past the last row of an index.
    pub fn end(&mut self, request: &IndexRequest) -> Result<FindInfo, Error> {
        let index = self.index_descriptor(request)?;
        let table = index.table_key();
        let cursor = self.driver.end(index)?;
        Ok(FindInfo::at(
            CursorHandle::Driver(cursor.id),
            cursor.pk,
            None,
            table,
        ))
    }

    /// Advances a cursor. RAM-served positions have nothing to advance to
    /// and step to `End`.
    pub fn next(&mut self, info: &mut FindInfo) -> Result<PrimaryKey, Error> {
        info.entry = None;
        match info.cursor {
            CursorHandle::Driver(id) => {
                info.pk = self.driver.next(id)?.pk;
            }
            CursorHandle::Ram | CursorHandle::End => {
                info.pk = PrimaryKey::END;
            }
        }
        Ok(info.pk)
    }

    /// Steps a cursor back.
    pub fn prev(&mut self, info: &mut FindInfo) -> Result<PrimaryKey, Error> {
        info.entry = None;
        match info.cursor {
            CursorHandle::Driver(id) => {
                info.pk = self.driver.prev(id)?.pk;
            }
            CursorHandle::Ram | CursorHandle::End => {
                info.pk = PrimaryKey::END;
            }
        }
        Ok(info.pk)
    }

    /// Materialises the row under a cursor that may have been positioned by
    /// key only. Cache-served positions return their entry; anything else
    /// is read through the cache.
    pub fn current(&mut self, info: &FindInfo) -> Result<CacheObjectRef, Error> {
        if let Some(entry) = &info.entry {
            return Ok(Rc::clone(entry));
        }
        if !info.pk.is_good() {
            return Err(Error::AbsentObject {
                key: ServiceKey {
                    table: info.table,
                    pk: info.pk,
                },
            });
        }
        let descriptor = self.table_descriptor(&info.table)?;
        self.read_object(&descriptor, info.pk, false)
    }

    /// Duplicates a cursor at its position.
    pub fn clone_cursor(&mut self, info: &FindInfo) -> Result<FindInfo, Error> {
        match info.cursor {
            CursorHandle::Driver(id) => {
                let cursor = self.driver.clone_cursor(id)?;
                Ok(FindInfo::at(
                    CursorHandle::Driver(cursor.id),
                    info.pk,
                    info.entry.clone(),
                    info.table,
                ))
            }
            _ => Ok(info.clone()),
        }
    }

    /// Closes a cursor's driver handle, if it has one.
    pub fn close(&mut self, info: &mut FindInfo) {
        if let CursorHandle::Driver(id) = info.cursor {
            self.driver.close(id);
        }
        info.cursor = CursorHandle::End;
        info.entry = None;
    }

    /// Closes every driver cursor opened over an account's tables.
    pub fn close_code_cursors(&mut self, code: AccountId) {
        self.driver.close_code_cursors(code);
    }

    // ---- keyed reads -------------------------------------------------------

    /// Reads a row by primary key: from the cache when present, through the
    /// driver otherwise. `None` when the row does not exist.
    pub fn object_by_pk(
        &mut self,
        table: &TableKey,
        pk: PrimaryKey,
    ) -> Result<Option<ObjectValue>, Error> {
        if let Some(entry) = self.cache.find(&ServiceKey { table: *table, pk }) {
            return Ok(Some(entry.borrow().object()));
        }
        let descriptor = self.table_descriptor(table)?;
        let Some(obj) = self.driver.object_by_pk(&descriptor, pk)? else {
            return Ok(None);
        };
        self.validate_object(&descriptor, &obj)?;
        Ok(Some(self.cache.emplace(&descriptor, obj).borrow().object()))
    }

    /// The cached row for `pk`, read through the driver on a miss. Fails
    /// when the row does not exist. With `with_blob` the serialized form is
    /// attached to the entry.
    pub fn get_cache_object(
        &mut self,
        table: &TableKey,
        pk: PrimaryKey,
        with_blob: bool,
    ) -> Result<CacheObjectRef, Error> {
        let descriptor = self.table_descriptor(table)?;
        self.read_object(&descriptor, pk, with_blob)
    }

    /// The next free primary key of a table, as the driver sees it.
    pub fn available_pk(&mut self, table: &TableKey) -> Result<PrimaryKey, Error> {
        let descriptor = self.table_descriptor(table)?;
        self.driver.available_pk(&descriptor)
    }

    /// Materialises a row under the next free primary key, asking the
    /// driver for a fresh hint when the local one is exhausted.
    pub fn create_cache_object(&mut self, table: &TableKey) -> Result<CacheObjectRef, Error> {
        let descriptor = self.table_descriptor(table)?;
        if let Some(entry) = self.cache.create(&descriptor) {
            return Ok(entry);
        }
        let pk = self.driver.available_pk(&descriptor)?;
        self.cache.set_next_pk(table, pk);
        let entry = self
            .cache
            .create(&descriptor)
            .expect("a fresh next-pk hint was just set");
        Ok(entry)
    }

    /// Materialises a row under an explicit primary key.
    pub fn create_cache_object_with_pk(
        &mut self,
        table: &TableKey,
        pk: PrimaryKey,
    ) -> Result<CacheObjectRef, Error> {
        let descriptor = self.table_descriptor(table)?;
        Ok(self.cache.create_with_pk(&descriptor, pk))
    }

    /// Releases a row materialised by
    /// [`create_cache_object`](Self::create_cache_object) that will not be
    /// inserted after all.
    pub fn destroy_cache_object(&mut self, entry: &CacheObjectRef) {
        let key = entry.borrow().service().service_key();
        self.cache.remove(&key.table, key.pk);
    }

    // ---- writes ------------------------------------------------------------

    /// Inserts a row from its serialized payload. Returns the billed
    /// storage delta in bytes.
    pub fn insert(
        &mut self,
        table: &TableKey,
        payer: StoragePayer,
        pk: PrimaryKey,
        data: &[u8],
    ) -> Result<i64, Error> {
        let descriptor = self.table_descriptor(table)?;
        let value = self.schema.to_object(&descriptor, data)?;
        let obj = ObjectValue {
            service: descriptor.to_service(pk),
            value,
        };
        self.insert_object(&descriptor, payer, obj)
    }

    /// Inserts a row through a live cache entry, keeping the entry
    /// coherent.
    pub fn insert_entry(
        &mut self,
        entry: &CacheObjectRef,
        value: Value,
        payer: StoragePayer,
    ) -> Result<i64, Error> {
        let (table, pk) = {
            let borrowed = entry.borrow();
            (borrowed.service().table_key(), borrowed.pk())
        };
        let descriptor = self.table_descriptor(&table)?;
        let obj = ObjectValue {
            service: descriptor.to_service(pk),
            value,
        };
        self.insert_object(&descriptor, payer, obj)
    }

    /// Updates a row from its serialized payload. Returns the billed
    /// storage delta in bytes.
    pub fn update(
        &mut self,
        table: &TableKey,
        mut payer: StoragePayer,
        pk: PrimaryKey,
        data: &[u8],
    ) -> Result<i64, Error> {
        let descriptor = self.table_descriptor(table)?;
        let value = self.schema.to_object(&descriptor, data)?;
        let obj = ObjectValue {
            service: descriptor.to_service(pk),
            value,
        };
        let orig = self.read_object(&descriptor, pk, false)?.borrow().object();
        payer.in_ram = orig.service.in_ram;
        self.update_object(&descriptor, payer, obj, orig)
    }

    /// Updates a row through a live cache entry. The entry keeps its
    /// original content if billing rejects the write.
    pub fn update_entry(
        &mut self,
        entry: &CacheObjectRef,
        value: Value,
        mut payer: StoragePayer,
    ) -> Result<i64, Error> {
        let orig = entry.borrow().object();
        let descriptor = self.table_descriptor(&orig.service.table_key())?;
        let obj = ObjectValue {
            service: descriptor.to_service(orig.pk()),
            value,
        };
        payer.in_ram = orig.service.in_ram;
        self.update_object(&descriptor, payer, obj, orig)
    }

    /// Removes a row. Returns the refunded storage delta in bytes
    /// (negative).
    pub fn remove(
        &mut self,
        table: &TableKey,
        payer: StoragePayer,
        pk: PrimaryKey,
    ) -> Result<i64, Error> {
        let descriptor = self.table_descriptor(table)?;
        let orig = self.read_object(&descriptor, pk, false)?.borrow().object();
        self.remove_object(&descriptor, payer, orig)
    }

    /// Removes the row behind a live cache entry.
    pub fn remove_entry(
        &mut self,
        entry: &CacheObjectRef,
        payer: StoragePayer,
    ) -> Result<i64, Error> {
        let orig = entry.borrow().object();
        let descriptor = self.table_descriptor(&orig.service.table_key())?;
        self.remove_object(&descriptor, payer, orig)
    }

    /// Flips the `in_ram` flag of a row with a size-zero billing delta.
    pub fn change_ram_state(
        &mut self,
        entry: &CacheObjectRef,
        mut payer: StoragePayer,
    ) -> Result<(), Error> {
        let orig = entry.borrow().object();
        let descriptor = self.table_descriptor(&orig.service.table_key())?;
        let mut obj = orig.clone();
        obj.service.in_ram = payer.in_ram;
        payer.size = obj.service.size;
        payer.delta = 0;
        self.update_object(&descriptor, payer, obj, orig)?;
        Ok(())
    }

    // ---- serialization helpers ---------------------------------------------

    /// Encodes a row value into its serialized payload.
    pub fn serialize(&self, table: &TableKey, value: &Value) -> Result<Vec<u8>, Error> {
        let descriptor = self.table_descriptor(table)?;
        self.schema.to_bytes(&descriptor, value)
    }

    /// Decodes a serialized payload into a row value.
    pub fn deserialize(&self, table: &TableKey, data: &[u8]) -> Result<Value, Error> {
        let descriptor = self.table_descriptor(table)?;
        self.schema.to_object(&descriptor, data)
    }

    // ---- internals ---------------------------------------------------------

    #[cfg(test)]
    pub(crate) fn undo_stack(&self) -> &UndoStack {
        &self.undo
    }

    fn table_descriptor(&self, table: &TableKey) -> Result<EntityDescriptor, Error> {
        self.schema
            .find_table(table.code, table.scope, table.table)
            .ok_or(Error::UnknownTable {
                code: table.code,
                table: table.table,
            })
    }

    fn index_descriptor(&self, request: &IndexRequest) -> Result<EntityDescriptor, Error> {
        self.schema
            .find_index(
                request.table.code,
                request.table.scope,
                request.table.table,
                request.index,
            )
            .ok_or(Error::UnknownIndex {
                code: request.table.code,
                table: request.table.table,
                index: request.index,
            })
    }

    fn read_object(
        &mut self,
        descriptor: &EntityDescriptor,
        pk: PrimaryKey,
        with_blob: bool,
    ) -> Result<CacheObjectRef, Error> {
        let key = ServiceKey {
            table: descriptor.table_key(),
            pk,
        };
        let entry = match self.cache.find(&key) {
            Some(entry) => entry,
            None => {
                let obj = self
                    .driver
                    .object_by_pk(descriptor, pk)?
                    .ok_or(Error::AbsentObject { key })?;
                self.validate_object(descriptor, &obj)?;
                self.cache.emplace(descriptor, obj)
            }
        };
        if with_blob && !entry.borrow().has_blob() {
            let blob = self.schema.to_bytes(descriptor, entry.borrow().value())?;
            entry.borrow_mut().set_blob(blob);
        }
        Ok(entry)
    }

    /// Checks the shape every stored value must have: a document, without
    /// the reserved service field.
    fn validate_object(
        &self,
        descriptor: &EntityDescriptor,
        obj: &ObjectValue,
    ) -> Result<(), Error> {
        let key = ServiceKey {
            table: descriptor.table_key(),
            pk: obj.pk(),
        };
        let Some(map) = obj.value.as_object() else {
            return Err(Error::InvalidStoredType { key });
        };
        if map.contains_key(SERVICE_FIELD) {
            return Err(Error::ReservedField {
                key,
                field: SERVICE_FIELD,
            });
        }
        Ok(())
    }

    /// Checks the primary key stored inside the value against the header.
    /// Tables may keep the key outside the document; the check applies only
    /// when the pk field is present.
    fn validate_pk_value(
        &self,
        descriptor: &EntityDescriptor,
        obj: &ObjectValue,
    ) -> Result<(), Error> {
        let mut stored = Some(&obj.value);
        for step in descriptor.pk_order().field.split('.') {
            stored = stored.and_then(|value| value.get(step));
        }
        let Some(stored) = stored else {
            return Ok(());
        };
        if stored.as_u64() != Some(obj.pk().value()) {
            return Err(Error::PrimaryKeyMismatch {
                key: ServiceKey {
                    table: descriptor.table_key(),
                    pk: obj.pk(),
                },
                value_pk: stored.as_u64().map(PrimaryKey).unwrap_or(PrimaryKey::UNSET),
            });
        }
        Ok(())
    }

    fn add_usage(&self, charge: &StoragePayer) -> Result<(), Error> {
        if charge.payer.is_empty() || charge.delta == 0 {
            return Ok(());
        }
        self.resource
            .add_storage_usage(charge.payer, charge.delta, charge.time_slot)
    }

    fn insert_object(
        &mut self,
        descriptor: &EntityDescriptor,
        mut charge: StoragePayer,
        mut obj: ObjectValue,
    ) -> Result<i64, Error> {
        self.validate_object(descriptor, &obj)?;
        self.validate_pk_value(descriptor, &obj)?;

        charge.size = canonical_storage_size(&obj.value);
        charge.in_ram = true;
        charge.delta += charge.size as i64;
        charge.set_payer_in(&mut obj.service);
        obj.service.revision = self.undo.revision();

        let mut ctx = UndoCtx {
            driver: &mut self.driver,
            cache: &mut self.cache,
            journal: &mut self.journal,
            resource: self.resource.as_ref(),
        };
        self.undo.insert(descriptor, obj.clone(), &mut ctx)?;
        self.cache.emplace(descriptor, obj);

        if self.undo.revision() > START_REVISION {
            self.add_usage(&charge)?;
        }
        Ok(charge.delta)
    }

    fn update_object(
        &mut self,
        descriptor: &EntityDescriptor,
        mut charge: StoragePayer,
        mut obj: ObjectValue,
        orig: ObjectValue,
    ) -> Result<i64, Error> {
        self.validate_object(descriptor, &obj)?;
        self.validate_pk_value(descriptor, &obj)?;

        charge.size = canonical_storage_size(&obj.value);
        charge.delta += charge.size as i64 - orig.service.size as i64;
        if charge.delta <= 0 {
            // a shrinking row refunds the owner when one is named
            charge.payer = charge.owner;
        }
        charge.get_payer_from(&orig.service);
        charge.set_payer_in(&mut obj.service);
        obj.service.revision = self.undo.revision();

        let mut ctx = UndoCtx {
            driver: &mut self.driver,
            cache: &mut self.cache,
            journal: &mut self.journal,
            resource: self.resource.as_ref(),
        };
        self.undo.update(descriptor, orig, obj.clone(), &mut ctx)?;

        if self.undo.revision() > START_REVISION {
            self.add_usage(&charge)?;
        }
        self.cache.emplace(descriptor, obj);
        Ok(charge.delta)
    }

    fn remove_object(
        &mut self,
        descriptor: &EntityDescriptor,
        mut refund: StoragePayer,
        orig: ObjectValue,
    ) -> Result<i64, Error> {
        let pk = orig.pk();
        refund.get_payer_from(&orig.service);
        refund.size = orig.service.size;
        refund.delta = -(orig.service.size as i64);

        let mut ctx = UndoCtx {
            driver: &mut self.driver,
            cache: &mut self.cache,
            journal: &mut self.journal,
            resource: self.resource.as_ref(),
        };
        self.undo.remove(descriptor, orig, &mut ctx)?;

        if self.undo.revision() > START_REVISION {
            self.add_usage(&refund)?;
        }
        self.cache.remove(&descriptor.table_key(), pk);
        Ok(refund.delta)
    }
}

/// Whether a row's index key matches a query prefix exactly.
fn index_key_matches(index: &EntityDescriptor, row_value: &Value, query: &Value) -> bool {
    let Some(orders) = index.index.as_ref().map(|def| &def.orders) else {
        return false;
    };
    let Some(components) = query.as_array() else {
        return false;
    };
    components
        .iter()
        .zip(orders.iter())
        .all(|(component, order)| order.project(row_value) == component)
}
