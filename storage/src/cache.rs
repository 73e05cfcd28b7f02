//! Write-through row cache.
//!
//! The cache owns its entries; cursors and internal bookkeeping hold `Weak`
//! handles or plain row keys. Besides materialized rows it remembers
//! negative lookups ("this key is absent, the cursor landed at pk X") and
//! the next free primary key per table, so repeated contract reads and
//! inserts stay off the driver.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    rc::Rc,
};

use serde_json::Value;

use statedb_types::{
    EntityDescriptor, IndexId, ObjectValue, PrimaryKey, Revision, ServiceKey, ServiceState,
    TableKey, IMPOSSIBLE_REVISION,
};

/// A cached row. The value and the serialized blob are kept coherent: any
/// mutation of the value drops the blob.
#[derive(Debug)]
pub struct CacheObject {
    service: ServiceState,
    value: Value,
    blob: Option<Vec<u8>>,
}

impl CacheObject {
    fn new(service: ServiceState, value: Value) -> CacheObject {
        CacheObject {
            service,
            value,
            blob: None,
        }
    }

    /// The row's primary key.
    pub fn pk(&self) -> PrimaryKey {
        self.service.pk
    }

    /// The row's service header.
    pub fn service(&self) -> &ServiceState {
        &self.service
    }

    /// The row's document value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// A full copy of the row.
    pub fn object(&self) -> ObjectValue {
        ObjectValue {
            service: self.service.clone(),
            value: self.value.clone(),
        }
    }

    /// Replaces the whole row, dropping the blob.
    pub fn set_object(&mut self, object: ObjectValue) {
        self.service = object.service;
        self.value = object.value;
        self.blob = None;
    }

    /// Replaces the service header only.
    pub fn set_service(&mut self, service: ServiceState) {
        self.service = service;
    }

    /// Replaces the document value, dropping the blob.
    pub fn set_value(&mut self, value: Value) {
        self.value = value;
        self.blob = None;
    }

    /// Whether a serialized blob is attached.
    pub fn has_blob(&self) -> bool {
        self.blob.is_some()
    }

    /// Attaches the serialized form of the value.
    pub fn set_blob(&mut self, blob: Vec<u8>) {
        self.blob = Some(blob);
    }

    /// The attached serialized form, if any.
    pub fn blob(&self) -> Option<&[u8]> {
        self.blob.as_deref()
    }
}

/// Shared handle to a cached row.
pub type CacheObjectRef = Rc<RefCell<CacheObject>>;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct IndexKey {
    table: TableKey,
    index: IndexId,
    key: Vec<u8>,
}

/// The row cache.
#[derive(Debug, Default)]
pub struct RowCache {
    entries: BTreeMap<ServiceKey, CacheObjectRef>,
    /// Unique-index hits: full key tuple to the row holding it.
    positive: BTreeMap<IndexKey, PrimaryKey>,
    /// Negative lookups: key tuple to the pk the cursor landed at
    /// (possibly `END`). Any write to the owning table clears these.
    negative: BTreeMap<IndexKey, PrimaryKey>,
    next_pks: BTreeMap<TableKey, PrimaryKey>,
}

impl RowCache {
    /// Creates an empty cache.
    pub fn new() -> RowCache {
        RowCache::default()
    }

    /// Looks up a row by identity.
    pub fn find(&self, key: &ServiceKey) -> Option<CacheObjectRef> {
        self.entries.get(key).cloned()
    }

    /// Looks up a row through a unique index by its canonical key bytes.
    pub fn find_by_index(
        &self,
        index: &EntityDescriptor,
        key: &[u8],
    ) -> Option<CacheObjectRef> {
        let pk = *self.positive.get(&Self::index_key(index, key))?;
        self.find(&ServiceKey {
            table: index.table_key(),
            pk,
        })
    }

    /// Looks up a remembered negative result for an index key. The returned
    /// pk is where the cursor landed when the key was found absent.
    pub fn find_unsuccess(&self, index: &EntityDescriptor, key: &[u8]) -> Option<PrimaryKey> {
        self.negative.get(&Self::index_key(index, key)).copied()
    }

    /// Looks up a remembered negative result for a primary-key lookup.
    pub fn find_unsuccess_pk(&self, table: &TableKey, pk: PrimaryKey) -> Option<PrimaryKey> {
        self.negative.get(&Self::pk_key(table, pk)).copied()
    }

    /// Inserts or refreshes a row, keeping the entry identity stable for
    /// holders of existing handles, and registers the row under every
    /// unique index of its table.
    pub fn emplace(&mut self, table: &EntityDescriptor, object: ObjectValue) -> CacheObjectRef {
        let key = object.service.service_key();
        let entry = match self.entries.get(&key) {
            Some(entry) => {
                entry.borrow_mut().set_object(object);
                Rc::clone(entry)
            }
            None => {
                let entry = Rc::new(RefCell::new(CacheObject::new(
                    object.service,
                    object.value,
                )));
                self.entries.insert(key, Rc::clone(&entry));
                entry
            }
        };
        self.register_unique_keys(table, &entry);
        entry
    }

    fn register_unique_keys(&mut self, table: &EntityDescriptor, entry: &CacheObjectRef) {
        let row = entry.borrow();
        for index in table.table.indexes.iter().filter(|index| index.unique) {
            let projected = Value::Array(
                index
                    .orders
                    .iter()
                    .map(|order| order.project(row.value()).clone())
                    .collect(),
            );
            let key = match serde_json::to_vec(&projected) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            self.positive.insert(
                IndexKey {
                    table: table.table_key(),
                    index: index.name,
                    key,
                },
                row.pk(),
            );
        }
    }

    /// Remembers that an index key has no exact match; `landing` is the pk
    /// the cursor stopped at.
    pub fn emplace_unsuccess(
        &mut self,
        index: &EntityDescriptor,
        key: &[u8],
        landing: PrimaryKey,
    ) {
        self.negative.insert(Self::index_key(index, key), landing);
    }

    /// Remembers that a primary-key lookup has no exact match.
    pub fn emplace_unsuccess_pk(
        &mut self,
        table: &TableKey,
        pk: PrimaryKey,
        landing: PrimaryKey,
    ) {
        self.negative.insert(Self::pk_key(table, pk), landing);
    }

    /// Forgets every index memo of a table. Called before any write to it.
    pub fn clear_unsuccess(&mut self, table: &TableKey) {
        self.negative.retain(|key, _| key.table != *table);
        self.positive.retain(|key, _| key.table != *table);
    }

    /// Materialises a row for a primary key that has not been allocated
    /// yet. Returns `None` when the local pk hint is exhausted and the
    /// driver must be asked for the next free key.
    pub fn create(&mut self, table: &EntityDescriptor) -> Option<CacheObjectRef> {
        let hint = self.next_pks.get(&table.table_key()).copied()?;
        if !hint.is_good() {
            return None;
        }
        self.next_pks.insert(table.table_key(), hint.next());
        Some(self.create_with_pk(table, hint))
    }

    /// Materialises a row under an explicit primary key.
    pub fn create_with_pk(&mut self, table: &EntityDescriptor, pk: PrimaryKey) -> CacheObjectRef {
        let entry = Rc::new(RefCell::new(CacheObject::new(
            table.to_service(pk),
            Value::Null,
        )));
        self.entries.insert(
            ServiceKey {
                table: table.table_key(),
                pk,
            },
            Rc::clone(&entry),
        );
        entry
    }

    /// Sets the next-free-pk hint of a table.
    pub fn set_next_pk(&mut self, table: &TableKey, pk: PrimaryKey) {
        self.next_pks.insert(*table, pk);
    }

    /// The next-free-pk hint of a table, if known.
    pub fn next_pk(&self, table: &TableKey) -> Option<PrimaryKey> {
        self.next_pks.get(table).copied()
    }

    /// Drops a row from the cache.
    pub fn remove(&mut self, table: &TableKey, pk: PrimaryKey) {
        self.entries.remove(&ServiceKey { table: *table, pk });
    }

    /// Rewrites the cached revision of a row, if the row is cached.
    pub fn set_revision(&mut self, key: &ServiceKey, revision: Revision) {
        if let Some(entry) = self.entries.get(key) {
            entry.borrow_mut().service.revision = revision;
        }
    }

    /// Marks the start of a session. Entries written from here on carry
    /// revisions at or above `revision` and are the ones a rollback evicts.
    pub fn start_session(&mut self, _revision: Revision) {}

    /// Commit barrier: entries nobody references any more and whose
    /// revision is at or below `revision` are dropped.
    pub fn push_session(&mut self, revision: Revision) {
        self.entries.retain(|_, entry| {
            Rc::strong_count(entry) > 1 || entry.borrow().service.revision > revision
        });
    }

    /// Folds the head session into its parent. Entry revisions are adjusted
    /// by the undo engine as it squashes, so nothing is evicted here.
    pub fn squash_session(&mut self, _revision: Revision) {}

    /// Rolls back a session: evicts every entry written at or above
    /// `revision` (and entries created but never inserted), and forgets all
    /// index memos.
    pub fn undo_session(&mut self, revision: Revision) {
        self.entries.retain(|_, entry| {
            let rev = entry.borrow().service.revision;
            rev != IMPOSSIBLE_REVISION && rev < revision
        });
        self.negative.clear();
        self.positive.clear();
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.negative.clear();
        self.positive.clear();
        self.next_pks.clear();
    }

    fn index_key(index: &EntityDescriptor, key: &[u8]) -> IndexKey {
        IndexKey {
            table: index.table_key(),
            index: index.index_id(),
            key: key.to_vec(),
        }
    }

    fn pk_key(table: &TableKey, pk: PrimaryKey) -> IndexKey {
        IndexKey {
            table: *table,
            index: IndexId::PRIMARY,
            key: pk.value().to_le_bytes().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use statedb_types::{AccountId, IndexDef, OrderDef, ScopeId, TableDef, TableId};

    use super::*;

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::table(
            AccountId(1),
            ScopeId(0),
            Arc::new(TableDef {
                name: TableId(10),
                pk_order: OrderDef::asc("id"),
                indexes: vec![IndexDef {
                    name: IndexId(1),
                    unique: true,
                    orders: vec![OrderDef::asc("name")],
                }],
            }),
        )
    }

    fn row(table: &EntityDescriptor, pk: u64, name: &str, revision: Revision) -> ObjectValue {
        let mut service = table.to_service(pk.into());
        service.revision = revision;
        ObjectValue {
            service,
            value: json!({"id": pk, "name": name}),
        }
    }

    #[test]
    fn emplace_keeps_entry_identity() {
        let table = descriptor();
        let mut cache = RowCache::new();
        let first = cache.emplace(&table, row(&table, 5, "a", 1));
        let second = cache.emplace(&table, row(&table, 5, "b", 2));
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(second.borrow().value()["name"], json!("b"));
    }

    #[test]
    fn unique_index_lookup_finds_emplaced_rows() {
        let table = descriptor();
        let index = table.with_index(Arc::new(table.table.indexes[0].clone()));
        let mut cache = RowCache::new();
        cache.emplace(&table, row(&table, 5, "alice", 1));

        let key = serde_json::to_vec(&json!(["alice"])).unwrap();
        let hit = cache.find_by_index(&index, &key).unwrap();
        assert_eq!(hit.borrow().pk(), PrimaryKey(5));

        cache.clear_unsuccess(&table.table_key());
        assert!(cache.find_by_index(&index, &key).is_none());
    }

    #[test]
    fn negative_memos_cleared_per_table() {
        let table = descriptor();
        let index = table.with_index(Arc::new(table.table.indexes[0].clone()));
        let mut cache = RowCache::new();
        cache.emplace_unsuccess(&index, b"[\"bob\"]", PrimaryKey::END);
        assert_eq!(
            cache.find_unsuccess(&index, b"[\"bob\"]"),
            Some(PrimaryKey::END)
        );

        cache.clear_unsuccess(&table.table_key());
        assert!(cache.find_unsuccess(&index, b"[\"bob\"]").is_none());
    }

    #[test]
    fn create_consumes_the_next_pk_hint() {
        let table = descriptor();
        let mut cache = RowCache::new();
        assert!(cache.create(&table).is_none());

        cache.set_next_pk(&table.table_key(), PrimaryKey(7));
        let entry = cache.create(&table).unwrap();
        assert_eq!(entry.borrow().pk(), PrimaryKey(7));
        assert_eq!(cache.next_pk(&table.table_key()), Some(PrimaryKey(8)));
    }

    #[test]
    fn undo_session_evicts_entries_of_the_session() {
        let table = descriptor();
        let mut cache = RowCache::new();
        cache.emplace(&table, row(&table, 1, "old", 1));
        cache.emplace(&table, row(&table, 2, "new", 2));
        cache.create_with_pk(&table, PrimaryKey(3));

        cache.undo_session(2);
        assert!(cache
            .find(&ServiceKey {
                table: table.table_key(),
                pk: PrimaryKey(1),
            })
            .is_some());
        assert!(cache
            .find(&ServiceKey {
                table: table.table_key(),
                pk: PrimaryKey(2),
            })
            .is_none());
        assert!(cache
            .find(&ServiceKey {
                table: table.table_key(),
                pk: PrimaryKey(3),
            })
            .is_none());
    }
}
