//! In-memory document driver.
//!
//! Holds the applied row set purely in memory. Used for testing and for
//! hosts that replay from genesis on every start; the call-counting
//! instrumentation lets tests assert which reads were served from the
//! controller's cache without touching the driver.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

use serde_json::{json, Value};

use statedb_types::{
    AccountId, EntityDescriptor, IndexId, ObjectValue, PrimaryKey, Revision, ServiceKey, TableId,
    TableKey,
};

use crate::{
    driver::{CursorId, CursorInfo, Driver},
    error::Error,
    journal::{Journal, TableChanges, WriteOp},
};

/// Call counters of the in-memory driver.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DriverStats {
    /// `lower_bound` calls served.
    pub lower_bounds: u64,
    /// `upper_bound` calls served.
    pub upper_bounds: u64,
    /// `object_by_pk` calls served.
    pub object_reads: u64,
    /// `object_at_cursor` calls served.
    pub cursor_reads: u64,
    /// Flush batches applied.
    pub applies: u64,
}

struct CursorRow {
    key: Vec<Value>,
    pk: PrimaryKey,
    undo_key: Option<(Revision, u64)>,
}

struct MemCursor {
    code: AccountId,
    table: TableKey,
    rows: Vec<CursorRow>,
    pos: usize,
}

impl MemCursor {
    fn info(&self, id: CursorId) -> CursorInfo {
        let pk = self
            .rows
            .get(self.pos)
            .map(|row| row.pk)
            .unwrap_or(PrimaryKey::END);
        CursorInfo { id, pk }
    }
}

/// The in-memory driver.
#[derive(Default)]
pub struct MemoryDriver {
    tables: BTreeMap<TableKey, BTreeMap<u64, ObjectValue>>,
    undo_rows: BTreeMap<(Revision, u64), ObjectValue>,
    cursors: BTreeMap<CursorId, MemCursor>,
    next_cursor: CursorId,
    reserved_pks: BTreeMap<TableKey, PrimaryKey>,
    indexes: BTreeSet<(TableKey, IndexId)>,
    undo_restore: bool,
    stats: DriverStats,
}

impl MemoryDriver {
    /// Creates an empty driver.
    pub fn new() -> MemoryDriver {
        MemoryDriver::default()
    }

    /// The call counters.
    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    /// The applied data rows, for state comparison in tests.
    pub fn data_rows(&self) -> &BTreeMap<TableKey, BTreeMap<u64, ObjectValue>> {
        &self.tables
    }

    /// The applied undo rows keyed by `(revision, undo_pk)`.
    pub fn undo_stream(&self) -> &BTreeMap<(Revision, u64), ObjectValue> {
        &self.undo_rows
    }

    /// A deep copy of the applied state, for bitwise state comparison.
    pub fn snapshot(
        &self,
    ) -> (
        BTreeMap<TableKey, BTreeMap<u64, ObjectValue>>,
        BTreeMap<(Revision, u64), ObjectValue>,
    ) {
        (self.tables.clone(), self.undo_rows.clone())
    }

    fn open_cursor(&mut self, index: &EntityDescriptor, rows: Vec<CursorRow>, pos: usize) -> CursorInfo {
        self.next_cursor += 1;
        let id = self.next_cursor;
        let cursor = MemCursor {
            code: index.code,
            table: index.table_key(),
            rows,
            pos,
        };
        let info = cursor.info(id);
        self.cursors.insert(id, cursor);
        info
    }

    fn cursor_mut(&mut self, id: CursorId) -> Result<&mut MemCursor, Error> {
        self.cursors
            .get_mut(&id)
            .ok_or(Error::UnknownCursor { id })
    }

    fn ordered_rows(&self, index: &EntityDescriptor) -> Vec<CursorRow> {
        if index.table.name == TableId::UNDO {
            return self
                .undo_rows
                .iter()
                .map(|((revision, undo_pk), row)| CursorRow {
                    key: vec![json!(revision), json!(undo_pk)],
                    pk: row.service.pk,
                    undo_key: Some((*revision, *undo_pk)),
                })
                .collect();
        }

        let Some(rows) = self.tables.get(&index.table_key()) else {
            return Vec::new();
        };
        let descending = index_directions(index);
        let mut out: Vec<CursorRow> = rows
            .iter()
            .map(|(pk, row)| CursorRow {
                key: index_key_of(index, *pk, &row.value),
                pk: PrimaryKey(*pk),
                undo_key: None,
            })
            .collect();
        out.sort_by(|a, b| {
            key_cmp(&a.key, &b.key, &descending).then_with(|| a.pk.cmp(&b.pk))
        });
        out
    }

    fn seek(&mut self, index: EntityDescriptor, key: Value, strict: bool) -> CursorInfo {
        let rows = self.ordered_rows(&index);
        let target = key_tuple(key);
        let descending = index_directions(&index);
        let pos = rows
            .iter()
            .position(|row| {
                let order = prefix_cmp(&row.key, &target, &descending);
                if strict {
                    order == Ordering::Greater
                } else {
                    order != Ordering::Less
                }
            })
            .unwrap_or(rows.len());
        self.open_cursor(&index, rows, pos)
    }

    fn apply_table(&mut self, table: &TableKey, changes: &TableChanges) -> Result<(), Error> {
        for op in &changes.data {
            self.apply_data(table, op)?;
        }
        for op in &changes.undo {
            self.apply_undo(op)?;
        }
        Ok(())
    }

    fn apply_data(&mut self, table: &TableKey, op: &WriteOp) -> Result<(), Error> {
        let tolerant = self.undo_restore;
        let rows = self.tables.entry(*table).or_default();
        let key = ServiceKey {
            table: *table,
            pk: op.service().pk,
        };
        let raw = op.service().pk.value();
        match op {
            WriteOp::Insert(obj) => {
                if rows.contains_key(&raw) && !tolerant {
                    return Err(Error::DuplicateRow { key });
                }
                rows.insert(raw, obj.clone());
            }
            WriteOp::Update(obj) => match rows.get_mut(&raw) {
                Some(stored) => {
                    if obj.value.is_null() {
                        stored.service = obj.service.clone();
                    } else {
                        *stored = obj.clone();
                    }
                }
                None if tolerant => {
                    rows.insert(raw, obj.clone());
                }
                None => return Err(Error::AbsentObject { key }),
            },
            WriteOp::Remove(_) => {
                if rows.remove(&raw).is_none() && !tolerant {
                    return Err(Error::AbsentObject { key });
                }
            }
            WriteOp::Revision { service, .. } => match rows.get_mut(&raw) {
                Some(stored) => stored.service.revision = service.revision,
                None if tolerant => {}
                None => return Err(Error::AbsentObject { key }),
            },
        }
        Ok(())
    }

    fn apply_undo(&mut self, op: &WriteOp) -> Result<(), Error> {
        let tolerant = self.undo_restore;
        let service = op.service();
        let at = (service.revision, service.undo_pk.value());
        let key = service.service_key();
        match op {
            WriteOp::Insert(obj) => {
                if self.undo_rows.contains_key(&at) && !tolerant {
                    return Err(Error::DuplicateRow { key });
                }
                self.undo_rows.insert(at, obj.clone());
            }
            WriteOp::Update(obj) => match self.undo_rows.get_mut(&at) {
                Some(stored) => {
                    if obj.value.is_null() {
                        stored.service = obj.service.clone();
                    } else {
                        *stored = obj.clone();
                    }
                }
                None if tolerant => {
                    self.undo_rows.insert(at, obj.clone());
                }
                None => return Err(Error::AbsentObject { key }),
            },
            WriteOp::Remove(_) => {
                if self.undo_rows.remove(&at).is_none() && !tolerant {
                    return Err(Error::AbsentObject { key });
                }
            }
            WriteOp::Revision { from, service } => {
                match self.undo_rows.remove(&(*from, service.undo_pk.value())) {
                    Some(mut stored) => {
                        stored.service.revision = service.revision;
                        self.undo_rows
                            .insert((service.revision, service.undo_pk.value()), stored);
                    }
                    None if tolerant => {}
                    None => return Err(Error::AbsentObject { key }),
                }
            }
        }
        Ok(())
    }
}

impl Driver for MemoryDriver {
    fn lower_bound(&mut self, index: EntityDescriptor, key: Value) -> Result<CursorInfo, Error> {
        self.stats.lower_bounds += 1;
        Ok(self.seek(index, key, false))
    }

    fn upper_bound(&mut self, index: EntityDescriptor, key: Value) -> Result<CursorInfo, Error> {
        self.stats.upper_bounds += 1;
        Ok(self.seek(index, key, true))
    }

    fn locate_to(
        &mut self,
        index: EntityDescriptor,
        key: Value,
        pk: PrimaryKey,
    ) -> Result<CursorInfo, Error> {
        let rows = self.ordered_rows(&index);
        let target = key_tuple(key);
        let descending = index_directions(&index);
        let pos = rows
            .iter()
            .position(|row| match prefix_cmp(&row.key, &target, &descending) {
                Ordering::Less => false,
                Ordering::Greater => true,
                Ordering::Equal => row.pk >= pk,
            })
            .unwrap_or(rows.len());
        Ok(self.open_cursor(&index, rows, pos))
    }

    fn begin(&mut self, index: EntityDescriptor) -> Result<CursorInfo, Error> {
        let rows = self.ordered_rows(&index);
        Ok(self.open_cursor(&index, rows, 0))
    }

    fn end(&mut self, index: EntityDescriptor) -> Result<CursorInfo, Error> {
        let rows = self.ordered_rows(&index);
        let pos = rows.len();
        Ok(self.open_cursor(&index, rows, pos))
    }

    fn current(&mut self, id: CursorId) -> Result<CursorInfo, Error> {
        let cursor = self.cursor_mut(id)?;
        Ok(cursor.info(id))
    }

    fn next(&mut self, id: CursorId) -> Result<CursorInfo, Error> {
        let cursor = self.cursor_mut(id)?;
        if cursor.pos < cursor.rows.len() {
            cursor.pos += 1;
        }
        Ok(cursor.info(id))
    }

    fn prev(&mut self, id: CursorId) -> Result<CursorInfo, Error> {
        let cursor = self.cursor_mut(id)?;
        if cursor.pos == 0 {
            // nothing before the first row
            cursor.pos = cursor.rows.len();
        } else if cursor.pos >= cursor.rows.len() {
            cursor.pos = cursor.rows.len().saturating_sub(1);
        } else {
            cursor.pos -= 1;
        }
        Ok(cursor.info(id))
    }

    fn clone_cursor(&mut self, id: CursorId) -> Result<CursorInfo, Error> {
        let cursor = self.cursors.get(&id).ok_or(Error::UnknownCursor { id })?;
        let copy = MemCursor {
            code: cursor.code,
            table: cursor.table,
            rows: cursor
                .rows
                .iter()
                .map(|row| CursorRow {
                    key: row.key.clone(),
                    pk: row.pk,
                    undo_key: row.undo_key,
                })
                .collect(),
            pos: cursor.pos,
        };
        self.next_cursor += 1;
        let new_id = self.next_cursor;
        let info = copy.info(new_id);
        self.cursors.insert(new_id, copy);
        Ok(info)
    }

    fn close(&mut self, id: CursorId) {
        self.cursors.remove(&id);
    }

    fn close_code_cursors(&mut self, code: AccountId) {
        self.cursors.retain(|_, cursor| cursor.code != code);
    }

    fn object_at_cursor(&mut self, id: CursorId) -> Result<Option<ObjectValue>, Error> {
        self.stats.cursor_reads += 1;
        let cursor = self.cursors.get(&id).ok_or(Error::UnknownCursor { id })?;
        let Some(row) = cursor.rows.get(cursor.pos) else {
            return Ok(None);
        };
        if let Some(undo_key) = row.undo_key {
            return Ok(self.undo_rows.get(&undo_key).cloned());
        }
        Ok(self
            .tables
            .get(&cursor.table)
            .and_then(|rows| rows.get(&row.pk.value()))
            .cloned())
    }

    fn object_by_pk(
        &mut self,
        table: &EntityDescriptor,
        pk: PrimaryKey,
    ) -> Result<Option<ObjectValue>, Error> {
        self.stats.object_reads += 1;
        Ok(self
            .tables
            .get(&table.table_key())
            .and_then(|rows| rows.get(&pk.value()))
            .cloned())
    }

    fn available_pk(&mut self, table: &EntityDescriptor) -> Result<PrimaryKey, Error> {
        let key = table.table_key();
        let after_rows = self
            .tables
            .get(&key)
            .and_then(|rows| rows.keys().next_back())
            .map(|max| PrimaryKey(max + 1))
            .unwrap_or(PrimaryKey(0));
        let floor = self
            .reserved_pks
            .get(&key)
            .copied()
            .unwrap_or(PrimaryKey(0));
        Ok(after_rows.max(floor))
    }

    fn skip_pk(&mut self, table: &EntityDescriptor, pk: PrimaryKey) {
        if !pk.is_good() {
            return;
        }
        let floor = self.reserved_pks.entry(table.table_key()).or_insert(PrimaryKey(0));
        *floor = (*floor).max(pk.next());
    }

    fn apply_all_changes(&mut self, journal: &Journal) -> Result<(), Error> {
        self.stats.applies += 1;
        let changes: Vec<(TableKey, TableChanges)> = journal
            .changes()
            .map(|(key, changes)| (*key, changes.clone()))
            .collect();
        for (table, table_changes) in &changes {
            self.apply_table(table, table_changes)?;
        }
        Ok(())
    }

    fn apply_code_changes(&mut self, journal: &Journal, code: AccountId) -> Result<(), Error> {
        self.stats.applies += 1;
        let changes: Vec<(TableKey, TableChanges)> = journal
            .code_changes(code)
            .map(|(key, changes)| (*key, changes.clone()))
            .collect();
        for (table, table_changes) in &changes {
            self.apply_table(table, table_changes)?;
        }
        Ok(())
    }

    fn drop_db(&mut self) -> Result<(), Error> {
        self.tables.clear();
        self.undo_rows.clear();
        self.cursors.clear();
        self.reserved_pks.clear();
        self.indexes.clear();
        Ok(())
    }

    fn create_index(&mut self, index: &EntityDescriptor) -> Result<(), Error> {
        self.indexes.insert((index.table_key(), index.index_id()));
        Ok(())
    }

    fn drop_index(&mut self, index: &EntityDescriptor) -> Result<(), Error> {
        self.indexes.remove(&(index.table_key(), index.index_id()));
        Ok(())
    }

    fn enable_undo_restore(&mut self) {
        self.undo_restore = true;
    }

    fn disable_undo_restore(&mut self) {
        self.undo_restore = false;
    }
}

fn index_key_of(index: &EntityDescriptor, pk: u64, value: &Value) -> Vec<Value> {
    match &index.index {
        Some(def) => def
            .orders
            .iter()
            .map(|order| order.project(value).clone())
            .collect(),
        None => vec![json!(pk)],
    }
}

fn index_directions(index: &EntityDescriptor) -> Vec<bool> {
    match &index.index {
        Some(def) => def.orders.iter().map(|order| order.descending).collect(),
        None => vec![false],
    }
}

fn key_tuple(key: Value) -> Vec<Value> {
    match key {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        scalar => vec![scalar],
    }
}

fn key_cmp(a: &[Value], b: &[Value], descending: &[bool]) -> Ordering {
    for (pos, (left, right)) in a.iter().zip(b.iter()).enumerate() {
        let mut order = value_cmp(left, right);
        if descending.get(pos).copied().unwrap_or(false) {
            order = order.reverse();
        }
        if order != Ordering::Equal {
            return order;
        }
    }
    a.len().cmp(&b.len())
}

/// Compares a row key against a query prefix: only the query's components
/// participate, so a shorter query matches every extension of its prefix.
fn prefix_cmp(row: &[Value], target: &[Value], descending: &[bool]) -> Ordering {
    for (pos, query) in target.iter().enumerate() {
        let Some(component) = row.get(pos) else {
            return Ordering::Less;
        };
        let mut order = value_cmp(component, query);
        if descending.get(pos).copied().unwrap_or(false) {
            order = order.reverse();
        }
        if order != Ordering::Equal {
            return order;
        }
    }
    Ordering::Equal
}

fn value_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over document values: rank by type, then by value. Numbers
/// compare exactly when both sides are integers of the same signedness and
/// as doubles otherwise.
fn value_cmp(a: &Value, b: &Value) -> Ordering {
    let ranks = value_rank(a).cmp(&value_rank(b));
    if ranks != Ordering::Equal {
        return ranks;
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(left), Value::Bool(right)) => left.cmp(right),
        (Value::Number(left), Value::Number(right)) => {
            if let (Some(l), Some(r)) = (left.as_u64(), right.as_u64()) {
                return l.cmp(&r);
            }
            if let (Some(l), Some(r)) = (left.as_i64(), right.as_i64()) {
                return l.cmp(&r);
            }
            let l = left.as_f64().unwrap_or(f64::NAN);
            let r = right.as_f64().unwrap_or(f64::NAN);
            l.total_cmp(&r)
        }
        (Value::String(left), Value::String(right)) => left.cmp(right),
        (Value::Array(left), Value::Array(right)) => {
            for (l, r) in left.iter().zip(right.iter()) {
                let order = value_cmp(l, r);
                if order != Ordering::Equal {
                    return order;
                }
            }
            left.len().cmp(&right.len())
        }
        (left, right) => left.to_string().cmp(&right.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use statedb_types::{IndexDef, OrderDef, ScopeId, ServiceState, TableDef};

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

    fn row(table: &EntityDescriptor, pk: u64, name: &str) -> ObjectValue {
        ObjectValue {
            service: ServiceState {
                code: table.code,
                scope: table.scope,
                table: table.table.name,
                pk: pk.into(),
                ..ServiceState::default()
            },
            value: json!({"id": pk, "name": name}),
        }
    }

    fn driver_with_rows(names: &[(u64, &str)]) -> MemoryDriver {
        let table = descriptor();
        let mut journal = Journal::new();
        for (pk, name) in names {
            journal.write_data(
                table.table_key(),
                WriteOp::Insert(row(&table, *pk, name)),
            );
        }
        let mut driver = MemoryDriver::new();
        driver.apply_all_changes(&journal).unwrap();
        driver
    }

    #[test]
    fn lower_and_upper_bound_over_a_secondary_index() {
        let table = descriptor();
        let index = table.with_index(Arc::new(table.table.indexes[0].clone()));
        let mut driver = driver_with_rows(&[(1, "carol"), (2, "alice"), (3, "bob")]);

        let at = driver
            .lower_bound(index.clone(), json!(["bob"]))
            .unwrap();
        assert_eq!(at.pk, PrimaryKey(3));

        let after = driver
            .upper_bound(index.clone(), json!(["bob"]))
            .unwrap();
        assert_eq!(after.pk, PrimaryKey(1)); // "carol"

        let past = driver.upper_bound(index, json!(["zed"])).unwrap();
        assert_eq!(past.pk, PrimaryKey::END);
    }

    #[test]
    fn cursor_walks_rows_in_key_order() {
        let table = descriptor();
        let index = table.with_index(Arc::new(table.table.indexes[0].clone()));
        let mut driver = driver_with_rows(&[(1, "carol"), (2, "alice"), (3, "bob")]);

        let begin = driver.begin(index).unwrap();
        assert_eq!(begin.pk, PrimaryKey(2));
        assert_eq!(driver.next(begin.id).unwrap().pk, PrimaryKey(3));
        assert_eq!(driver.next(begin.id).unwrap().pk, PrimaryKey(1));
        assert_eq!(driver.next(begin.id).unwrap().pk, PrimaryKey::END);
        assert_eq!(driver.prev(begin.id).unwrap().pk, PrimaryKey(1));
    }

    #[test]
    fn strict_application_rejects_bad_batches() {
        let table = descriptor();
        let mut driver = driver_with_rows(&[(1, "a")]);

        let mut journal = Journal::new();
        journal.write_data(table.table_key(), WriteOp::Insert(row(&table, 1, "dup")));
        assert!(matches!(
            driver.apply_all_changes(&journal),
            Err(Error::DuplicateRow { .. })
        ));

        let mut journal = Journal::new();
        journal.write_data(
            table.table_key(),
            WriteOp::Remove(row(&table, 9, "x").service),
        );
        assert!(matches!(
            driver.apply_all_changes(&journal),
            Err(Error::AbsentObject { .. })
        ));
    }

    #[test]
    fn undo_restore_mode_tolerates_replays() {
        let table = descriptor();
        let mut driver = driver_with_rows(&[(1, "a")]);
        driver.enable_undo_restore();

        let mut journal = Journal::new();
        journal.write_data(table.table_key(), WriteOp::Insert(row(&table, 1, "b")));
        journal.write_data(
            table.table_key(),
            WriteOp::Remove(row(&table, 9, "x").service),
        );
        driver.apply_all_changes(&journal).unwrap();
        driver.disable_undo_restore();

        let rows = driver.data_rows().get(&table.table_key()).unwrap();
        assert_eq!(rows.get(&1).unwrap().value["name"], json!("b"));
    }

    #[test]
    fn skip_pk_suppresses_reserved_keys() {
        let table = descriptor();
        let mut driver = driver_with_rows(&[(4, "a")]);
        assert_eq!(driver.available_pk(&table).unwrap(), PrimaryKey(5));

        driver.skip_pk(&table, PrimaryKey(9));
        assert_eq!(driver.available_pk(&table).unwrap(), PrimaryKey(10));
    }
}
