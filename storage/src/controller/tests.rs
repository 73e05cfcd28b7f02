use std::{
    cell::RefCell,
    collections::BTreeSet,
    rc::Rc,
};

use proptest::prelude::*;
use serde_json::{json, Value};

use statedb_types::{
    AccountId, IndexDef, IndexId, OrderDef, PrimaryKey, ScopeId, StoragePayer, TableDef, TableId,
    TableKey, TimeSlot, UndoRecordKind,
};

use crate::{
    driver::MemoryDriver,
    error::{Error, ErrorKind},
    resource::ResourceManager,
    schema::DocumentSchema,
};

use super::{Controller, CursorHandle, CursorKind, IndexRequest};

const SYS: AccountId = AccountId(1);
const CODE: AccountId = AccountId(100);
const TABLE: TableId = TableId(10);
const NAME_INDEX: IndexId = IndexId(1);
const SLOT: TimeSlot = 1;

const P1: AccountId = AccountId(7);
const P2: AccountId = AccountId(8);

#[derive(Debug, Default)]
struct RecordingResources {
    calls: RefCell<Vec<(AccountId, i64, TimeSlot)>>,
    budget: RefCell<Option<i64>>,
}

impl RecordingResources {
    fn calls(&self) -> Vec<(AccountId, i64, TimeSlot)> {
        self.calls.borrow().clone()
    }

    fn total(&self) -> i64 {
        self.calls.borrow().iter().map(|(_, delta, _)| delta).sum()
    }

    fn limit(&self, budget: i64) {
        *self.budget.borrow_mut() = Some(budget);
    }
}

impl ResourceManager for RecordingResources {
    fn add_storage_usage(
        &self,
        payer: AccountId,
        delta: i64,
        time_slot: TimeSlot,
    ) -> Result<(), Error> {
        if let Some(budget) = *self.budget.borrow() {
            if delta > budget {
                return Err(Error::StorageBudget {
                    payer,
                    delta,
                    time_slot,
                });
            }
        }
        self.calls.borrow_mut().push((payer, delta, time_slot));
        Ok(())
    }
}

fn schema() -> DocumentSchema {
    DocumentSchema::new().with_table(
        CODE,
        TableDef {
            name: TABLE,
            pk_order: OrderDef::asc("id"),
            indexes: vec![IndexDef {
                name: NAME_INDEX,
                unique: true,
                orders: vec![OrderDef::asc("name")],
            }],
        },
    )
}

struct Fixture {
    controller: Controller<MemoryDriver>,
    resources: Rc<RecordingResources>,
}

fn fixture() -> Fixture {
    fixture_over(MemoryDriver::new())
}

fn fixture_over(driver: MemoryDriver) -> Fixture {
    let resources = Rc::new(RecordingResources::default());
    let controller = Controller::new(
        driver,
        Rc::new(schema()),
        Rc::clone(&resources) as Rc<dyn ResourceManager>,
        SYS,
    );
    Fixture {
        controller,
        resources,
    }
}

fn table_key() -> TableKey {
    TableKey {
        code: CODE,
        scope: ScopeId(0),
        table: TABLE,
    }
}

fn name_index() -> IndexRequest {
    IndexRequest {
        table: table_key(),
        index: NAME_INDEX,
    }
}

fn payer(account: AccountId) -> StoragePayer {
    StoragePayer::new(account, SLOT)
}

/// `{"x": n}`: 12 bytes of canonical storage.
fn plain(n: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({ "x": n })).unwrap()
}

fn named(pk: u64, name: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({ "id": pk, "name": name })).unwrap()
}

fn data_row(controller: &Controller<MemoryDriver>, pk: u64) -> Option<Value> {
    controller
        .driver()
        .data_rows()
        .get(&table_key())
        .and_then(|rows| rows.get(&pk))
        .map(|obj| obj.value.clone())
}

fn undo_rows_for_pk(controller: &Controller<MemoryDriver>, pk: u64) -> usize {
    controller
        .driver()
        .undo_stream()
        .values()
        .filter(|obj| obj.service.pk == PrimaryKey(pk))
        .count()
}

// ---- end-to-end scenarios --------------------------------------------------

#[test]
fn s1_insert_then_commit_leaves_one_billed_row() {
    let Fixture {
        mut controller,
        resources,
    } = fixture();

    let rev = controller.start_undo_session(true).unwrap();
    assert_eq!(rev, 1);

    let delta = controller
        .insert(&table_key(), payer(P1), PrimaryKey(10), &plain(1))
        .unwrap();
    assert_eq!(delta, 12);

    controller.commit_revision(1).unwrap();
    controller.apply_all_changes().unwrap();

    let rows = controller.driver().data_rows().get(&table_key()).unwrap();
    assert_eq!(rows.len(), 1);
    let row = rows.get(&10).unwrap();
    assert_eq!(row.service.revision, 1);
    assert_eq!(row.service.payer, P1);
    assert_eq!(row.service.size, 12);
    assert!(controller.driver().undo_stream().is_empty());

    assert_eq!(resources.calls(), vec![(P1, 12, SLOT)]);
}

#[test]
fn s2_insert_then_undo_refunds_and_clears_everything() {
    let Fixture {
        mut controller,
        resources,
    } = fixture();

    let rev = controller.start_undo_session(true).unwrap();
    controller
        .insert(&table_key(), payer(P1), PrimaryKey(10), &plain(1))
        .unwrap();
    controller.undo_revision(rev).unwrap();

    assert_eq!(data_row(&controller, 10), None);
    assert!(controller.driver().undo_stream().is_empty());
    assert_eq!(
        controller.object_by_pk(&table_key(), PrimaryKey(10)).unwrap(),
        None
    );
    assert_eq!(resources.calls(), vec![(P1, 12, SLOT), (P1, -12, SLOT)]);
}

#[test]
fn s3_remove_then_reinsert_squashes_into_an_update() {
    let Fixture { mut controller, .. } = fixture();

    let rev = controller.start_undo_session(true).unwrap();
    controller
        .insert(&table_key(), payer(P1), PrimaryKey(10), &plain(1))
        .unwrap();
    controller.commit_revision(rev).unwrap();
    controller.apply_all_changes().unwrap();

    let rev2 = controller.start_undo_session(true).unwrap();
    controller
        .remove(&table_key(), payer(P1), PrimaryKey(10))
        .unwrap();

    let rev3 = controller.start_undo_session(true).unwrap();
    let value_b = serde_json::to_vec(&json!({"x": 1, "y": 2})).unwrap();
    controller
        .insert(&table_key(), payer(P2), PrimaryKey(10), &value_b)
        .unwrap();

    controller.squash_revision(rev3).unwrap();

    // the head frame at rev2 holds the deletion's pre-image, re-typed
    let stack = controller.undo_stack().table(&table_key()).unwrap();
    let head = stack.stack.back().unwrap();
    assert_eq!(head.revision, rev2);
    let entry = head.old_values.get(&10).unwrap();
    assert_eq!(entry.service.undo_rec, UndoRecordKind::OldValue);
    assert_eq!(entry.value, json!({"x": 1}));
    assert_eq!(entry.service.undo_payer, P1);
    assert_eq!(entry.service.undo_size, 12);
    assert!(head.removed_values.is_empty());
    assert!(head.new_values.is_empty());

    // the live row is the reinserted one
    let live = controller
        .object_by_pk(&table_key(), PrimaryKey(10))
        .unwrap()
        .unwrap();
    assert_eq!(live.value, json!({"x": 1, "y": 2}));
    assert_eq!(live.service.payer, P2);
    assert_eq!(live.service.size, 19);

    // undoing the merged frame restores the original row
    controller.undo_revision(rev2).unwrap();
    let restored = controller
        .object_by_pk(&table_key(), PrimaryKey(10))
        .unwrap()
        .unwrap();
    assert_eq!(restored.value, json!({"x": 1}));
    assert_eq!(restored.service.payer, P1);
    assert_eq!(restored.service.size, 12);
}

#[test]
fn s4_insert_then_remove_squashes_to_nothing() {
    let Fixture { mut controller, .. } = fixture();

    controller.start_undo_session(true).unwrap();
    controller
        .insert(&table_key(), payer(P1), PrimaryKey(10), &plain(1))
        .unwrap();

    let rev2 = controller.start_undo_session(true).unwrap();
    controller
        .remove(&table_key(), payer(P1), PrimaryKey(10))
        .unwrap();
    controller.squash_revision(rev2).unwrap();
    controller.apply_all_changes().unwrap();

    assert_eq!(data_row(&controller, 10), None);
    assert_eq!(undo_rows_for_pk(&controller, 10), 0);
}

#[test]
fn s5_restore_rebuilds_the_stack_and_squashes_identically() {
    let Fixture { mut controller, .. } = fixture();

    let rev1 = controller.start_undo_session(true).unwrap();
    controller
        .insert(&table_key(), payer(P1), PrimaryKey(10), &plain(1))
        .unwrap();
    controller.commit_revision(rev1).unwrap();

    let rev2 = controller.start_undo_session(true).unwrap();
    controller
        .remove(&table_key(), payer(P1), PrimaryKey(10))
        .unwrap();

    let rev3 = controller.start_undo_session(true).unwrap();
    let value_b = serde_json::to_vec(&json!({"x": 1, "y": 2})).unwrap();
    controller
        .insert(&table_key(), payer(P2), PrimaryKey(10), &value_b)
        .unwrap();
    controller.apply_all_changes().unwrap();

    // the process "terminates" here; a fresh controller restores the stack
    let Fixture {
        mut controller, ..
    } = fixture_over(controller.into_driver());
    controller.restore_db().unwrap();
    assert_eq!(controller.revision(), rev3);

    let stack = controller.undo_stack().table(&table_key()).unwrap();
    assert_eq!(stack.stack.len(), 2);
    assert_eq!(stack.stack[0].revision, rev2);
    assert!(stack.stack[0].removed_values.contains_key(&10));
    assert_eq!(stack.stack[1].revision, rev3);
    assert!(stack.stack[1].new_values.contains_key(&10));
    assert_eq!(stack.stack[1].next_pk, PrimaryKey(10));

    // the same squash as the in-process run
    controller.squash_revision(rev3).unwrap();
    let stack = controller.undo_stack().table(&table_key()).unwrap();
    let head = stack.stack.back().unwrap();
    assert_eq!(head.revision, rev2);
    let entry = head.old_values.get(&10).unwrap();
    assert_eq!(entry.service.undo_rec, UndoRecordKind::OldValue);
    assert_eq!(entry.value, json!({"x": 1}));

    controller.undo_revision(rev2).unwrap();
    let restored = controller
        .object_by_pk(&table_key(), PrimaryKey(10))
        .unwrap()
        .unwrap();
    assert_eq!(restored.value, json!({"x": 1}));
    assert_eq!(restored.service.payer, P1);
}

#[test]
fn s6_unique_index_hits_bypass_the_driver() {
    let Fixture { mut controller, .. } = fixture();

    controller.start_undo_session(true).unwrap();
    controller
        .insert(&table_key(), payer(P1), PrimaryKey(10), &named(10, "k"))
        .unwrap();

    let before = controller.driver().stats().lower_bounds;
    let info = controller
        .lower_bound(&name_index(), CursorKind::OneRecord, b"\"k\"")
        .unwrap();
    assert_eq!(info.pk, PrimaryKey(10));
    assert!(matches!(info.cursor, CursorHandle::Ram));
    assert_eq!(controller.driver().stats().lower_bounds, before);

    controller
        .remove(&table_key(), payer(P1), PrimaryKey(10))
        .unwrap();
    let info = controller
        .lower_bound(&name_index(), CursorKind::InRAM, b"\"k\"")
        .unwrap();
    assert!(info.is_end());
    assert_eq!(controller.driver().stats().lower_bounds, before);
}

// ---- universal invariants --------------------------------------------------

#[test]
fn round_trip_write_read() {
    let Fixture { mut controller, .. } = fixture();

    controller.start_undo_session(true).unwrap();
    controller
        .insert(&table_key(), payer(P1), PrimaryKey(3), &named(3, "alice"))
        .unwrap();

    let read = controller
        .object_by_pk(&table_key(), PrimaryKey(3))
        .unwrap()
        .unwrap();
    assert_eq!(read.value, json!({"id": 3, "name": "alice"}));
    assert_eq!(read.service.payer, P1);
    assert_eq!(read.service.owner, P1);
    assert!(read.service.in_ram);
    assert_eq!(read.pk(), PrimaryKey(3));
}

#[test]
fn commit_is_terminal() {
    let Fixture { mut controller, .. } = fixture();

    let rev = controller.start_undo_session(true).unwrap();
    controller
        .insert(&table_key(), payer(P1), PrimaryKey(10), &plain(1))
        .unwrap();
    controller.commit_revision(rev).unwrap();
    controller.apply_all_changes().unwrap();
    let before = controller.driver().snapshot();

    let outcome = controller.undo_revision(rev);
    assert!(matches!(
        outcome.as_ref().map_err(Error::kind),
        Err(ErrorKind::Session)
    ));
    assert_eq!(controller.driver().snapshot(), before);
    assert_eq!(controller.revision(), rev);
}

#[test]
fn stepwise_squash_equals_one_session() {
    let one_session = {
        let Fixture {
            mut controller,
            resources,
        } = fixture();
        let rev = controller.start_undo_session(true).unwrap();
        controller
            .insert(&table_key(), payer(P1), PrimaryKey(1), &named(1, "a"))
            .unwrap();
        controller
            .insert(&table_key(), payer(P1), PrimaryKey(2), &named(2, "b"))
            .unwrap();
        controller
            .update(&table_key(), payer(P1), PrimaryKey(1), &named(1, "a2"))
            .unwrap();
        controller
            .remove(&table_key(), payer(P1), PrimaryKey(2))
            .unwrap();
        controller.apply_all_changes().unwrap();
        let rows = controller.driver().data_rows().clone();
        controller.undo_revision(rev).unwrap();
        (rows, resources.total(), controller.driver().data_rows().clone())
    };

    let stepwise = {
        let Fixture {
            mut controller,
            resources,
        } = fixture();
        controller.start_undo_session(true).unwrap();
        controller
            .insert(&table_key(), payer(P1), PrimaryKey(1), &named(1, "a"))
            .unwrap();
        controller.start_undo_session(true).unwrap();
        controller
            .insert(&table_key(), payer(P1), PrimaryKey(2), &named(2, "b"))
            .unwrap();
        let rev3 = controller.start_undo_session(true).unwrap();
        controller
            .update(&table_key(), payer(P1), PrimaryKey(1), &named(1, "a2"))
            .unwrap();
        controller
            .remove(&table_key(), payer(P1), PrimaryKey(2))
            .unwrap();
        controller.squash_revision(rev3).unwrap();
        controller.squash_revision(rev3 - 1).unwrap();
        controller.apply_all_changes().unwrap();
        let rows = controller.driver().data_rows().clone();
        controller.undo_revision(rev3 - 2).unwrap();
        (rows, resources.total(), controller.driver().data_rows().clone())
    };

    assert_eq!(one_session.0, stepwise.0);
    assert_eq!(one_session.1, stepwise.1);
    assert_eq!(one_session.1, 0);
    assert_eq!(one_session.2, stepwise.2);
}

#[test]
fn negative_lookups_invalidate_on_any_table_write() {
    let Fixture { mut controller, .. } = fixture();

    controller.start_undo_session(true).unwrap();
    controller
        .insert(&table_key(), payer(P1), PrimaryKey(1), &named(1, "a"))
        .unwrap();
    controller.apply_all_changes().unwrap();

    // a miss goes to the driver and is memoized
    let before = controller.driver().stats().lower_bounds;
    let info = controller
        .lower_bound(&name_index(), CursorKind::OneRecord, b"\"zed\"")
        .unwrap();
    assert!(info.is_end());
    assert_eq!(controller.driver().stats().lower_bounds, before + 1);

    let info = controller
        .lower_bound(&name_index(), CursorKind::OneRecord, b"\"zed\"")
        .unwrap();
    assert!(info.is_end());
    assert!(matches!(info.cursor, CursorHandle::Ram));
    assert_eq!(controller.driver().stats().lower_bounds, before + 1);

    // any write to the table drops the memo, regardless of key
    controller
        .insert(&table_key(), payer(P1), PrimaryKey(2), &named(2, "b"))
        .unwrap();
    let info = controller
        .lower_bound(&name_index(), CursorKind::OneRecord, b"\"zed\"")
        .unwrap();
    assert!(info.is_end());
    assert_eq!(controller.driver().stats().lower_bounds, before + 2);
}

#[test]
fn restore_is_idempotent() {
    let Fixture { mut controller, .. } = fixture();

    let rev1 = controller.start_undo_session(true).unwrap();
    controller
        .insert(&table_key(), payer(P1), PrimaryKey(1), &named(1, "a"))
        .unwrap();
    controller.commit_revision(rev1).unwrap();
    let rev2 = controller.start_undo_session(true).unwrap();
    controller
        .update(&table_key(), payer(P1), PrimaryKey(1), &named(1, "a2"))
        .unwrap();
    controller
        .insert(&table_key(), payer(P2), PrimaryKey(2), &named(2, "b"))
        .unwrap();
    controller.apply_all_changes().unwrap();

    let summarize = |controller: &Controller<MemoryDriver>| {
        let stack = controller.undo_stack().table(&table_key()).unwrap();
        stack
            .stack
            .iter()
            .map(|frame| {
                (
                    frame.revision,
                    frame.new_values.keys().copied().collect::<Vec<_>>(),
                    frame.old_values.keys().copied().collect::<Vec<_>>(),
                    frame.removed_values.keys().copied().collect::<Vec<_>>(),
                    frame.next_pk,
                )
            })
            .collect::<Vec<_>>()
    };

    let Fixture {
        mut controller, ..
    } = fixture_over(controller.into_driver());
    controller.restore_db().unwrap();
    assert_eq!(controller.revision(), rev2);
    let first = summarize(&controller);

    let Fixture {
        mut controller, ..
    } = fixture_over(controller.into_driver());
    controller.restore_db().unwrap();
    let second = summarize(&controller);

    assert_eq!(first, second);
}

#[test]
fn available_pk_grows_with_applied_inserts() {
    let Fixture { mut controller, .. } = fixture();

    assert_eq!(controller.available_pk(&table_key()).unwrap(), PrimaryKey(0));

    let rev = controller.start_undo_session(true).unwrap();
    for pk in 0..3u64 {
        controller
            .insert(
                &table_key(),
                payer(P1),
                PrimaryKey(pk),
                &named(pk, &format!("row-{pk}")),
            )
            .unwrap();
    }
    controller.commit_revision(rev).unwrap();
    controller.apply_all_changes().unwrap();

    assert_eq!(controller.available_pk(&table_key()).unwrap(), PrimaryKey(3));

    // a removed key stays reserved
    let rev = controller.start_undo_session(true).unwrap();
    controller
        .remove(&table_key(), payer(P1), PrimaryKey(2))
        .unwrap();
    controller.commit_revision(rev).unwrap();
    controller.apply_all_changes().unwrap();
    assert_eq!(controller.available_pk(&table_key()).unwrap(), PrimaryKey(3));
}

#[test]
fn created_entries_consume_sequential_keys() {
    let Fixture { mut controller, .. } = fixture();

    let first = controller.create_cache_object(&table_key()).unwrap();
    let second = controller.create_cache_object(&table_key()).unwrap();
    assert_eq!(first.borrow().pk(), PrimaryKey(0));
    assert_eq!(second.borrow().pk(), PrimaryKey(1));

    controller.destroy_cache_object(&second);
    let third = controller.create_cache_object(&table_key()).unwrap();
    assert_eq!(third.borrow().pk(), PrimaryKey(2));
}

#[test]
fn genesis_writes_record_rows_but_never_bill() {
    let Fixture {
        mut controller,
        resources,
    } = fixture();

    // no session: genesis mode
    let delta = controller
        .insert(&table_key(), payer(P1), PrimaryKey(10), &plain(1))
        .unwrap();
    assert_eq!(delta, 12);
    controller.apply_all_changes().unwrap();

    let row = controller.driver().data_rows()[&table_key()].get(&10).unwrap().clone();
    assert_eq!(row.service.revision, 0);
    assert!(resources.calls().is_empty());
    assert!(controller.driver().undo_stream().is_empty());
}

#[test]
fn billing_failure_is_raised_after_the_forward_op() {
    let Fixture {
        mut controller,
        resources,
    } = fixture();
    resources.limit(5);

    let rev = controller.start_undo_session(true).unwrap();
    let outcome = controller.insert(&table_key(), payer(P1), PrimaryKey(10), &plain(1));
    assert!(matches!(
        outcome.as_ref().map_err(Error::kind),
        Err(ErrorKind::Resource)
    ));

    // the forward op is journaled; rolling the session back clears it
    controller.undo_revision(rev).unwrap();
    assert_eq!(data_row(&controller, 10), None);
    assert!(controller.driver().undo_stream().is_empty());
}

// ---- cursor behavior -------------------------------------------------------

#[test]
fn upper_bound_is_strictly_greater() {
    let Fixture { mut controller, .. } = fixture();

    let rev = controller.start_undo_session(true).unwrap();
    for (pk, name) in [(1u64, "a"), (2, "b"), (3, "c")] {
        controller
            .insert(&table_key(), payer(P1), PrimaryKey(pk), &named(pk, name))
            .unwrap();
    }
    controller.commit_revision(rev).unwrap();
    controller.apply_all_changes().unwrap();

    let lower = controller
        .lower_bound(&name_index(), CursorKind::ManyRecords, b"\"b\"")
        .unwrap();
    assert_eq!(lower.pk, PrimaryKey(2));

    let upper = controller.upper_bound(&name_index(), b"\"b\"").unwrap();
    assert_eq!(upper.pk, PrimaryKey(3));

    let past = controller.upper_bound(&name_index(), b"\"c\"").unwrap();
    assert!(past.is_end());
}

#[test]
fn cursors_walk_and_materialise_rows() {
    let Fixture { mut controller, .. } = fixture();

    let rev = controller.start_undo_session(true).unwrap();
    for (pk, name) in [(1u64, "carol"), (2, "alice"), (3, "bob")] {
        controller
            .insert(&table_key(), payer(P1), PrimaryKey(pk), &named(pk, name))
            .unwrap();
    }
    controller.commit_revision(rev).unwrap();
    controller.apply_all_changes().unwrap();

    let mut info = controller.begin(&name_index()).unwrap();
    assert_eq!(info.pk, PrimaryKey(2));
    let entry = controller.current(&info).unwrap();
    assert_eq!(entry.borrow().value()["name"], json!("alice"));

    assert_eq!(controller.next(&mut info).unwrap(), PrimaryKey(3));
    assert_eq!(controller.next(&mut info).unwrap(), PrimaryKey(1));
    assert_eq!(controller.next(&mut info).unwrap(), PrimaryKey::END);
    assert_eq!(controller.prev(&mut info).unwrap(), PrimaryKey(1));
    controller.close(&mut info);

    let mut end = controller.end(&name_index()).unwrap();
    assert!(end.is_end());
    assert_eq!(controller.prev(&mut end).unwrap(), PrimaryKey(1));
    controller.close(&mut end);
}

#[test]
fn pending_rows_override_the_driver_cursor() {
    let Fixture { mut controller, .. } = fixture();

    controller.start_undo_session(true).unwrap();
    controller
        .insert(&table_key(), payer(P1), PrimaryKey(10), &named(10, "k"))
        .unwrap();
    // nothing flushed: the driver sees an empty table

    let info = controller
        .lower_bound(&name_index(), CursorKind::ManyRecords, b"\"k\"")
        .unwrap();
    assert_eq!(info.pk, PrimaryKey(10));
    assert!(info.entry.is_some());
}

#[test]
fn lower_bound_by_pk_short_circuits_on_cached_rows() {
    let Fixture { mut controller, .. } = fixture();

    controller.start_undo_session(true).unwrap();
    controller
        .insert(&table_key(), payer(P1), PrimaryKey(5), &plain(1))
        .unwrap();

    let before = controller.driver().stats().lower_bounds;
    let info = controller
        .lower_bound_pk(&table_key(), CursorKind::OneRecord, PrimaryKey(5))
        .unwrap();
    assert_eq!(info.pk, PrimaryKey(5));
    assert!(matches!(info.cursor, CursorHandle::Ram));
    assert_eq!(controller.driver().stats().lower_bounds, before);

    let info = controller
        .lower_bound_pk(&table_key(), CursorKind::InRAM, PrimaryKey(6))
        .unwrap();
    assert!(info.is_end());
    assert_eq!(controller.driver().stats().lower_bounds, before);
}

// ---- validation and errors -------------------------------------------------

#[test]
fn schema_errors_identify_the_request() {
    let Fixture { mut controller, .. } = fixture();

    let missing = TableKey {
        code: CODE,
        scope: ScopeId(0),
        table: TableId(99),
    };
    let outcome = controller.insert(&missing, payer(P1), PrimaryKey(1), &plain(1));
    assert!(matches!(outcome, Err(Error::UnknownTable { .. })));

    let missing_index = IndexRequest {
        table: table_key(),
        index: IndexId(9),
    };
    let outcome = controller.lower_bound(&missing_index, CursorKind::ManyRecords, b"");
    assert!(matches!(outcome, Err(Error::UnknownIndex { .. })));
}

#[test]
fn writes_reject_malformed_values() {
    let Fixture { mut controller, .. } = fixture();
    controller.start_undo_session(true).unwrap();

    let reserved = serde_json::to_vec(&json!({"_service_": 1})).unwrap();
    let outcome = controller.insert(&table_key(), payer(P1), PrimaryKey(1), &reserved);
    assert!(matches!(outcome, Err(Error::ReservedField { .. })));

    let scalar = serde_json::to_vec(&json!(42)).unwrap();
    let outcome = controller.insert(&table_key(), payer(P1), PrimaryKey(1), &scalar);
    assert!(matches!(outcome, Err(Error::InvalidStoredType { .. })));

    let mismatched = serde_json::to_vec(&json!({"id": 5, "name": "x"})).unwrap();
    let outcome = controller.insert(&table_key(), payer(P1), PrimaryKey(1), &mismatched);
    assert!(matches!(outcome, Err(Error::PrimaryKeyMismatch { .. })));

    let outcome = controller.update(&table_key(), payer(P1), PrimaryKey(77), &plain(1));
    assert!(matches!(outcome, Err(Error::AbsentObject { .. })));
}

#[test]
fn change_ram_state_keeps_the_billing_delta_at_zero() {
    let Fixture {
        mut controller,
        resources,
    } = fixture();

    controller.start_undo_session(true).unwrap();
    controller
        .insert(&table_key(), payer(P1), PrimaryKey(4), &plain(1))
        .unwrap();
    let calls_after_insert = resources.calls().len();

    let entry = controller
        .get_cache_object(&table_key(), PrimaryKey(4), false)
        .unwrap();
    assert!(entry.borrow().service().in_ram);

    let mut evict = payer(P1);
    evict.in_ram = false;
    controller.change_ram_state(&entry, evict).unwrap();

    assert!(!entry.borrow().service().in_ram);
    assert_eq!(resources.calls().len(), calls_after_insert);
}

// ---- property-based invariants ---------------------------------------------

fn op_sequence() -> impl Strategy<Value = Vec<(u8, u64, i64)>> {
    prop::collection::vec((0u8..3, 0u64..6, 0i64..100), 0..24)
}

proptest! {
    /// Any sequence of valid writes in one session is fully reversed by
    /// undoing that session: the driver-visible state compares bitwise
    /// equal, and the billing deltas sum to zero.
    #[test]
    fn undo_restores_prior_state(ops in op_sequence()) {
        let Fixture { mut controller, resources } = fixture();

        let base = controller.start_undo_session(true).unwrap();
        for pk in 0..3u64 {
            controller
                .insert(
                    &table_key(),
                    payer(P1),
                    PrimaryKey(pk),
                    &named(pk, &format!("row-{pk}")),
                )
                .unwrap();
        }
        controller.commit_revision(base).unwrap();
        controller.apply_all_changes().unwrap();

        let before = controller.driver().snapshot();
        let billed_before = resources.total();
        let mut live: BTreeSet<u64> = (0..3).collect();

        let rev = controller.start_undo_session(true).unwrap();
        for (kind, pk, n) in ops {
            let bytes = serde_json::to_vec(
                &json!({"id": pk, "name": format!("row-{pk}"), "x": n}),
            )
            .unwrap();
            let write_exists = live.contains(&pk);
            match (kind, write_exists) {
                (0, false) | (1, false) => {
                    controller
                        .insert(&table_key(), payer(P2), PrimaryKey(pk), &bytes)
                        .unwrap();
                    live.insert(pk);
                }
                (0, true) | (1, true) => {
                    controller
                        .update(&table_key(), payer(P2), PrimaryKey(pk), &bytes)
                        .unwrap();
                }
                (_, true) => {
                    controller
                        .remove(&table_key(), payer(P2), PrimaryKey(pk))
                        .unwrap();
                    live.remove(&pk);
                }
                (_, false) => {}
            }
        }

        controller.undo_revision(rev).unwrap();
        prop_assert_eq!(controller.driver().snapshot(), before);
        prop_assert_eq!(resources.total(), billed_before);
    }
}
