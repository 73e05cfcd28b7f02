//! The undo engine: per-table stacks of revision frames and their
//! cross-table composition.
//!
//! Every write inside an active session records a reverse delta in the
//! current frame of the written table and mirrors it into the undo stream
//! of the journal, so the same rollback is possible in memory and after a
//! restart. Sessions nest: `squash` folds the head frame into its parent by
//! the composition rules of [`merge_frames`], `undo` applies the head frame
//! in reverse, `commit` drops frames from the tail and deletes their
//! persisted compensation records.

mod restore;

use std::collections::{BTreeMap, VecDeque};

use serde_json::json;
use tracing::error;

use statedb_types::{
    AccountId, EntityDescriptor, ObjectValue, PrimaryKey, Revision, ServiceState, TableKey,
    UndoRecordKind, IMPOSSIBLE_REVISION, START_REVISION,
};

use crate::{
    cache::RowCache,
    driver::Driver,
    error::Error,
    journal::{Journal, WriteOp},
    resource::ResourceManager,
};

/// The field of a next-pk reservation row holding the reserved key.
pub(crate) const NEXT_PK_FIELD: &str = "next_pk";

/// Collaborators an undo operation works through.
pub(crate) struct UndoCtx<'a, D: Driver> {
    pub(crate) driver: &'a mut D,
    pub(crate) cache: &'a mut RowCache,
    pub(crate) journal: &'a mut Journal,
    pub(crate) resource: &'a dyn ResourceManager,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum UndoStage {
    Unknown,
    New,
    Stack,
}

/// One revision frame of a table: the reverse deltas recorded at that
/// revision, keyed by primary key, plus an optional next-pk reservation.
#[derive(Debug)]
pub(crate) struct UndoState {
    pub(crate) revision: Revision,
    pub(crate) new_values: BTreeMap<u64, ObjectValue>,
    pub(crate) old_values: BTreeMap<u64, ObjectValue>,
    pub(crate) removed_values: BTreeMap<u64, ObjectValue>,
    pub(crate) next_pk: PrimaryKey,
    undo_next_pk: PrimaryKey,
}

impl UndoState {
    fn new(revision: Revision) -> UndoState {
        UndoState {
            revision,
            new_values: BTreeMap::new(),
            old_values: BTreeMap::new(),
            removed_values: BTreeMap::new(),
            next_pk: PrimaryKey::UNSET,
            undo_next_pk: PrimaryKey::UNSET,
        }
    }

    pub(crate) fn has_next_pk(&self) -> bool {
        self.next_pk != PrimaryKey::UNSET
    }
}

/// The undo stack of one table: a deque of revision frames driven by a
/// three-state machine.
#[derive(Debug)]
pub(crate) struct TableUndoStack {
    pub(crate) descriptor: EntityDescriptor,
    key: TableKey,
    stage: UndoStage,
    revision: Revision,
    pub(crate) stack: VecDeque<UndoState>,
    undo_next_pk: BTreeMap<Revision, PrimaryKey>,
}

impl TableUndoStack {
    fn new(descriptor: EntityDescriptor, revision: Revision) -> TableUndoStack {
        TableUndoStack {
            key: descriptor.table_key(),
            descriptor,
            stage: UndoStage::New,
            revision,
            stack: VecDeque::new(),
            undo_next_pk: BTreeMap::new(),
        }
    }

    pub(crate) fn revision(&self) -> Revision {
        self.revision
    }

    fn head_revision(&self) -> Revision {
        self.stack.back().map(|state| state.revision).unwrap_or(0)
    }

    fn start_session(&mut self, revision: Revision) -> Result<(), Error> {
        if self.revision >= revision {
            error!(
                table = %self.key,
                current = self.revision,
                requested = revision,
                "bad revision for table session"
            );
            return Err(Error::BadSessionRevision {
                table: self.key,
                current: self.revision,
                requested: revision,
            });
        }
        self.revision = revision;
        self.stage = UndoStage::New;
        Ok(())
    }

    fn head(&mut self) -> Result<&mut UndoState, Error> {
        match self.stage {
            UndoStage::New => {
                self.stage = UndoStage::Stack;
                let revision = self.revision;
                self.stack.push_back(UndoState::new(revision));
            }
            UndoStage::Stack => {}
            UndoStage::Unknown => {
                return Err(Error::WrongStage {
                    table: self.key,
                    operation: "head",
                });
            }
        }
        Ok(self.stack.back_mut().expect("stage Stack implies a frame"))
    }

    /// Records a next-pk reservation in the head frame. Reservations are
    /// deduplicated per revision: the first reservation of a revision keeps
    /// its undo key.
    fn set_head_next_pk(&mut self, next_pk: PrimaryKey, undo_pk: PrimaryKey) -> PrimaryKey {
        let revision = self.revision;
        let actual = *self.undo_next_pk.entry(revision).or_insert(undo_pk);
        let head = self
            .stack
            .back_mut()
            .expect("a head frame exists when a reservation is recorded");
        head.next_pk = next_pk;
        head.undo_next_pk = actual;
        actual
    }

    /// Pops the head frame for rollback, checking it carries `revision`.
    fn take_head(&mut self, revision: Revision) -> Result<UndoState, Error> {
        let head = self.stack.pop_back().ok_or(Error::WrongStage {
            table: self.key,
            operation: "undo",
        })?;
        if head.revision != revision {
            error!(
                table = %self.key,
                head_revision = head.revision,
                requested = revision,
                "wrong revision at the head of the undo stack"
            );
            return Err(Error::WrongSessionRevision {
                operation: "undo",
                requested: revision,
                current: head.revision,
            });
        }
        self.undo_next_pk.remove(&revision);
        self.step_down();
        Ok(head)
    }

    /// Bookkeeping step shared by `undo` and `squash` when no frame exists
    /// at the departing revision.
    fn step_down(&mut self) {
        self.revision -= 1;
        self.update_stage();
    }

    /// Bookkeeping of a squash: the head frame (if any) moves down one
    /// revision together with the table.
    fn squash_down(&mut self) {
        if self.stage == UndoStage::Stack {
            if let Some(head) = self.stack.back_mut() {
                head.revision -= 1;
            }
        }
        self.step_down();
    }

    fn update_stage(&mut self) {
        if self
            .stack
            .back()
            .map(|head| head.revision == self.revision)
            .unwrap_or(false)
        {
            self.stage = UndoStage::Stack;
        } else if self.revision > START_REVISION {
            self.stage = UndoStage::New;
        } else {
            self.revision = IMPOSSIBLE_REVISION;
            self.stage = UndoStage::Unknown;
        }
    }

    fn is_dead(&self) -> bool {
        self.stack.is_empty()
    }
}

/// The engine owning every table's undo stack, the session revision counter
/// and the allocation of undo keys.
#[derive(Debug)]
pub struct UndoStack {
    stage: UndoStage,
    revision: Revision,
    tail_revision: Revision,
    undo_pk: u64,
    tables: BTreeMap<TableKey, TableUndoStack>,
}

impl Default for UndoStack {
    fn default() -> Self {
        UndoStack {
            stage: UndoStage::Unknown,
            revision: START_REVISION,
            tail_revision: START_REVISION,
            undo_pk: 1,
            tables: BTreeMap::new(),
        }
    }
}

impl UndoStack {
    /// Creates an engine with no recorded state.
    pub fn new() -> UndoStack {
        UndoStack::default()
    }

    /// The current session revision.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Whether a session is active; outside a session writes go straight to
    /// the data stream.
    pub fn enabled(&self) -> bool {
        self.stage != UndoStage::Unknown
    }

    #[cfg(test)]
    pub(crate) fn tail_revision(&self) -> Revision {
        self.tail_revision
    }

    /// Drops every frame and resets the revision counters.
    pub(crate) fn clear(&mut self) {
        self.tables.clear();
        self.revision = START_REVISION;
        self.tail_revision = START_REVISION;
        self.stage = UndoStage::Unknown;
        self.undo_pk = 1;
    }

    /// Aligns the engine to `revision` after genesis or snapshot import.
    /// Only legal while no undo frames exist.
    pub(crate) fn set_revision(&mut self, revision: Revision) -> Result<(), Error> {
        if !self.tables.is_empty() {
            return Err(Error::NonEmptyUndoStack);
        }
        self.revision = revision;
        self.tail_revision = revision;
        self.stage = UndoStage::Unknown;
        Ok(())
    }

    /// Opens a session one revision above the current one and enrolls every
    /// known table. A disabled session records nothing and yields
    /// [`IMPOSSIBLE_REVISION`].
    pub(crate) fn start_undo_session(&mut self, enabled: bool) -> Result<Revision, Error> {
        if !enabled {
            return Ok(IMPOSSIBLE_REVISION);
        }
        self.revision += 1;
        for table in self.tables.values_mut() {
            table.start_session(self.revision)?;
        }
        self.stage = UndoStage::Stack;
        Ok(self.revision)
    }

    #[cfg(test)]
    pub(crate) fn table(&self, key: &TableKey) -> Option<&TableUndoStack> {
        self.tables.get(key)
    }

    fn next_undo_pk(counter: &mut u64) -> PrimaryKey {
        if !PrimaryKey(*counter).is_good() {
            *counter = 1;
        }
        let pk = PrimaryKey(*counter);
        *counter += 1;
        pk
    }

    /// Snapshots the live header fields into the shadow fields and stamps
    /// the object as an undo row of the current revision.
    fn init_undo_object(
        service: &mut ServiceState,
        revision: Revision,
        undo_pk: PrimaryKey,
        record: UndoRecordKind,
    ) {
        service.undo_revision = service.revision;
        service.undo_payer = service.payer;
        service.undo_size = service.size;
        service.undo_in_ram = service.in_ram;
        service.revision = revision;
        service.undo_pk = undo_pk;
        service.undo_rec = record;
    }

    /// Refreshes the live header fields an undo entry tracks for the row it
    /// compensates. The entry's `owner` stays at its pre-image value: undo
    /// restores it as-is, having no shadow copy for it.
    fn copy_live_fields(dst: &mut ServiceState, src: &ServiceState) {
        dst.payer = src.payer;
        dst.size = src.size;
        dst.in_ram = src.in_ram;
    }

    /// Reverses the billing of an updated row: the current payer gives the
    /// current size back, the snapshot payer is charged the snapshot size
    /// again. Equal payers collapse into one net delta.
    fn refund_restored(
        service: &ServiceState,
        resource: &dyn ResourceManager,
    ) -> Result<(), Error> {
        let slot = service.time_slot;
        if service.payer == service.undo_payer {
            let delta = service.undo_size as i64 - service.size as i64;
            if delta != 0 && !service.payer.is_empty() {
                resource.add_storage_usage(service.payer, delta, slot)?;
            }
            return Ok(());
        }
        if service.size != 0 && !service.payer.is_empty() {
            resource.add_storage_usage(service.payer, -(service.size as i64), slot)?;
        }
        if service.undo_size != 0 && !service.undo_payer.is_empty() {
            resource.add_storage_usage(service.undo_payer, service.undo_size as i64, slot)?;
        }
        Ok(())
    }

    /// Restores the snapshot fields of an undo entry into its live fields,
    /// producing the row as it stood before the compensated write.
    fn restore_undo_fields(service: &mut ServiceState) {
        service.revision = service.undo_revision;
        service.payer = service.undo_payer;
        service.size = service.undo_size;
        service.in_ram = service.undo_in_ram;
        service.undo_pk = PrimaryKey::UNSET;
        service.undo_rec = UndoRecordKind::None;
        service.undo_revision = IMPOSSIBLE_REVISION;
        service.undo_payer = AccountId::EMPTY;
        service.undo_size = 0;
        service.undo_in_ram = false;
    }

    fn next_pk_service(descriptor: &EntityDescriptor, revision: Revision, undo_pk: PrimaryKey) -> ServiceState {
        let mut service = descriptor.to_service(PrimaryKey::UNSET);
        service.revision = revision;
        service.undo_pk = undo_pk;
        service.undo_rec = UndoRecordKind::NextPk;
        service
    }

    fn next_pk_object(
        descriptor: &EntityDescriptor,
        revision: Revision,
        undo_pk: PrimaryKey,
        reserved: PrimaryKey,
    ) -> ObjectValue {
        ObjectValue {
            service: Self::next_pk_service(descriptor, revision, undo_pk),
            value: json!({ NEXT_PK_FIELD: reserved.value() }),
        }
    }

    /// Records an insert. Inside a session the reverse delta lands in the
    /// table's head frame; a reinsert over a row removed in the same frame
    /// is re-typed as an update of that deleted row.
    pub(crate) fn insert<D: Driver>(
        &mut self,
        table: &EntityDescriptor,
        obj: ObjectValue,
        ctx: &mut UndoCtx<'_, D>,
    ) -> Result<(), Error> {
        let key = table.table_key();
        ctx.cache.clear_unsuccess(&key);
        if !self.enabled() {
            ctx.journal.write_data(key, WriteOp::Insert(obj));
            return Ok(());
        }

        let revision = self.revision;
        let counter = &mut self.undo_pk;
        let stack = self
            .tables
            .entry(key)
            .or_insert_with(|| TableUndoStack::new(table.clone(), revision));

        let pk = obj.pk();
        ctx.journal.write_data(key, WriteOp::Insert(obj.clone()));

        let head = stack.head()?;
        if let Some(mut removed) = head.removed_values.remove(&pk.value()) {
            // reinsert over a same-frame deletion: del+ins becomes upd
            Self::copy_live_fields(&mut removed.service, &obj.service);
            removed.service.undo_rec = UndoRecordKind::OldValue;
            ctx.journal
                .write_undo(key, WriteOp::Update(removed.clone_service()));
            head.old_values.insert(pk.value(), removed);
            return Ok(());
        }

        let mut undo_obj = obj;
        Self::init_undo_object(
            &mut undo_obj.service,
            revision,
            Self::next_undo_pk(counter),
            UndoRecordKind::NewValue,
        );
        ctx.journal
            .write_undo(key, WriteOp::Insert(undo_obj.clone_service()));
        let needs_reservation = !head.has_next_pk();
        head.new_values.insert(pk.value(), undo_obj);

        if needs_reservation {
            let undo_pk = Self::next_undo_pk(counter);
            let undo_pk = stack.set_head_next_pk(pk, undo_pk);
            ctx.journal.write_undo(
                key,
                WriteOp::Insert(Self::next_pk_object(table, revision, undo_pk, pk)),
            );
        }
        Ok(())
    }

    /// Records an update; `orig` is the pre-image of the row.
    pub(crate) fn update<D: Driver>(
        &mut self,
        table: &EntityDescriptor,
        orig: ObjectValue,
        obj: ObjectValue,
        ctx: &mut UndoCtx<'_, D>,
    ) -> Result<(), Error> {
        let key = table.table_key();
        ctx.cache.clear_unsuccess(&key);
        if !self.enabled() {
            ctx.journal.write_data(key, WriteOp::Update(obj));
            return Ok(());
        }

        let revision = self.revision;
        let counter = &mut self.undo_pk;
        let stack = self
            .tables
            .entry(key)
            .or_insert_with(|| TableUndoStack::new(table.clone(), revision));

        let pk = orig.pk();
        ctx.journal.write_data(key, WriteOp::Update(obj.clone()));

        let head = stack.head()?;
        if let Some(entry) = head.new_values.get_mut(&pk.value()) {
            Self::copy_live_fields(&mut entry.service, &obj.service);
            ctx.journal
                .write_undo(key, WriteOp::Update(entry.clone_service()));
            return Ok(());
        }
        if let Some(entry) = head.old_values.get_mut(&pk.value()) {
            // the frame already holds the oldest pre-image
            Self::copy_live_fields(&mut entry.service, &obj.service);
            return Ok(());
        }

        let mut pre_image = orig;
        Self::init_undo_object(
            &mut pre_image.service,
            revision,
            Self::next_undo_pk(counter),
            UndoRecordKind::OldValue,
        );
        Self::copy_live_fields(&mut pre_image.service, &obj.service);
        ctx.journal
            .write_undo(key, WriteOp::Insert(pre_image.clone()));
        head.old_values.insert(pk.value(), pre_image);
        Ok(())
    }

    /// Records a removal; `orig` is the full pre-image. The removed key is
    /// reserved at the driver so it is never handed out again.
    pub(crate) fn remove<D: Driver>(
        &mut self,
        table: &EntityDescriptor,
        orig: ObjectValue,
        ctx: &mut UndoCtx<'_, D>,
    ) -> Result<(), Error> {
        let key = table.table_key();
        ctx.cache.clear_unsuccess(&key);
        ctx.driver.skip_pk(table, orig.pk());
        if !self.enabled() {
            ctx.journal.write_data(key, WriteOp::Remove(orig.service));
            return Ok(());
        }

        let revision = self.revision;
        let counter = &mut self.undo_pk;
        let stack = self
            .tables
            .entry(key)
            .or_insert_with(|| TableUndoStack::new(table.clone(), revision));

        let pk = orig.pk();
        ctx.journal
            .write_data(key, WriteOp::Remove(orig.service.clone()));

        let head = stack.head()?;
        if let Some(created) = head.new_values.remove(&pk.value()) {
            // new+del within one frame vanishes entirely
            ctx.journal.write_undo(key, WriteOp::Remove(created.service));
            return Ok(());
        }
        if let Some(mut entry) = head.old_values.remove(&pk.value()) {
            entry.service.undo_rec = UndoRecordKind::RemovedValue;
            ctx.journal.write_undo(key, WriteOp::Update(entry.clone()));
            head.removed_values.insert(pk.value(), entry);
            return Ok(());
        }

        let mut pre_image = orig;
        Self::init_undo_object(
            &mut pre_image.service,
            revision,
            Self::next_undo_pk(counter),
            UndoRecordKind::RemovedValue,
        );
        ctx.journal
            .write_undo(key, WriteOp::Insert(pre_image.clone()));
        head.removed_values.insert(pk.value(), pre_image);
        Ok(())
    }

    /// Rolls back the head session of every table, restoring rows and the
    /// next-pk hints, and drops the session's persisted undo rows.
    pub(crate) fn undo<D: Driver>(
        &mut self,
        revision: Revision,
        ctx: &mut UndoCtx<'_, D>,
    ) -> Result<(), Error> {
        if !self.enabled() {
            return Err(Error::NoActiveSession { operation: "undo" });
        }
        if self.revision != revision {
            error!(
                current = self.revision,
                requested = revision,
                "wrong undo revision"
            );
            return Err(Error::WrongSessionRevision {
                operation: "undo",
                requested: revision,
                current: self.revision,
            });
        }

        self.for_tables(|stack| {
            if stack.stack.is_empty() {
                return Ok(());
            }
            Self::undo_table(stack, revision, ctx)
        })?;

        self.revision -= 1;
        if self.revision == self.tail_revision {
            self.stage = UndoStage::Unknown;
        }
        Ok(())
    }

    fn undo_table<D: Driver>(
        stack: &mut TableUndoStack,
        revision: Revision,
        ctx: &mut UndoCtx<'_, D>,
    ) -> Result<(), Error> {
        if revision > stack.head_revision() {
            stack.step_down();
            return Ok(());
        }

        let key = stack.key;
        let descriptor = stack.descriptor.clone();
        let frame = stack.take_head(revision)?;
        ctx.cache.clear_unsuccess(&key);

        for (_, mut obj) in frame.old_values {
            let undo_service = obj.service.clone();
            Self::refund_restored(&undo_service, ctx.resource)?;
            Self::restore_undo_fields(&mut obj.service);
            ctx.cache.emplace(&descriptor, obj.clone());
            ctx.journal
                .write(key, WriteOp::Update(obj), WriteOp::Remove(undo_service));
        }

        for (_, obj) in frame.new_values {
            // refund the whole row: it is about to disappear
            if obj.service.size != 0 && !obj.service.payer.is_empty() {
                ctx.resource.add_storage_usage(
                    obj.service.payer,
                    -(obj.service.size as i64),
                    obj.service.time_slot,
                )?;
            }
            ctx.cache.remove(&key, obj.pk());
            ctx.driver.skip_pk(&descriptor, obj.pk());
            ctx.journal.write(
                key,
                WriteOp::Remove(obj.service.clone()),
                WriteOp::Remove(obj.service),
            );
        }

        for (_, mut obj) in frame.removed_values {
            let undo_service = obj.service.clone();
            // the refunded removal is reinstated
            if undo_service.undo_size != 0 && !undo_service.undo_payer.is_empty() {
                ctx.resource.add_storage_usage(
                    undo_service.undo_payer,
                    undo_service.undo_size as i64,
                    undo_service.time_slot,
                )?;
            }
            Self::restore_undo_fields(&mut obj.service);
            ctx.cache.emplace(&descriptor, obj.clone());
            ctx.journal
                .write(key, WriteOp::Insert(obj), WriteOp::Remove(undo_service));
        }

        if frame.next_pk != PrimaryKey::UNSET {
            ctx.cache.set_next_pk(&key, frame.next_pk);
            ctx.journal.write_undo(
                key,
                WriteOp::Remove(Self::next_pk_service(
                    &descriptor,
                    revision,
                    frame.undo_next_pk,
                )),
            );
        }
        Ok(())
    }

    /// Folds the head session of every table into its parent session.
    pub(crate) fn squash<D: Driver>(
        &mut self,
        revision: Revision,
        ctx: &mut UndoCtx<'_, D>,
    ) -> Result<(), Error> {
        if !self.enabled() {
            return Err(Error::NoActiveSession { operation: "squash" });
        }
        if self.revision != revision {
            error!(
                current = self.revision,
                requested = revision,
                "wrong squash revision"
            );
            return Err(Error::WrongSessionRevision {
                operation: "squash",
                requested: revision,
                current: self.revision,
            });
        }

        let tail_revision = self.tail_revision;
        self.for_tables(|stack| {
            if stack.stack.is_empty() {
                return Ok(());
            }
            Self::squash_table(stack, revision, tail_revision, ctx)
        })?;

        self.revision -= 1;
        if self.revision == self.tail_revision {
            self.stage = UndoStage::Unknown;
        }
        Ok(())
    }

    fn squash_table<D: Driver>(
        stack: &mut TableUndoStack,
        revision: Revision,
        tail_revision: Revision,
        ctx: &mut UndoCtx<'_, D>,
    ) -> Result<(), Error> {
        if revision > stack.head_revision() {
            stack.squash_down();
            return Ok(());
        }
        let head_revision = stack.head_revision();
        if head_revision != revision {
            error!(
                table = %stack.key,
                head_revision,
                requested = revision,
                "wrong squash revision at the head of the undo stack"
            );
            return Err(Error::WrongSessionRevision {
                operation: "squash",
                requested: revision,
                current: head_revision,
            });
        }

        if stack.stack.len() == 1 {
            if revision - 1 > tail_revision {
                return Self::shift_state_down(stack, ctx);
            }
            return Self::merge_into_base(stack, ctx);
        }

        let prev_revision = stack.stack[stack.stack.len() - 2].revision;
        if prev_revision != revision - 1 {
            // frames are not adjacent; the head just moves down
            return Self::shift_state_down(stack, ctx);
        }

        Self::merge_frames(stack, ctx)
    }

    /// Moves the head frame one revision down, rewriting the revision of
    /// every affected row in both streams.
    fn shift_state_down<D: Driver>(
        stack: &mut TableUndoStack,
        ctx: &mut UndoCtx<'_, D>,
    ) -> Result<(), Error> {
        let key = stack.key;
        let descriptor = stack.descriptor.clone();

        let head = stack.head()?;
        let revision = head.revision;

        let mut shift = |obj: &mut ObjectValue, has_data: bool| {
            let mut service = obj.service.clone();
            service.revision = revision - 1;
            if has_data {
                ctx.cache
                    .set_revision(&obj.service.service_key(), revision - 1);
                ctx.journal.write(
                    key,
                    WriteOp::Revision {
                        from: revision,
                        service: service.clone(),
                    },
                    WriteOp::Revision {
                        from: revision,
                        service,
                    },
                );
            } else {
                ctx.journal.write_undo(
                    key,
                    WriteOp::Revision {
                        from: revision,
                        service,
                    },
                );
            }
            obj.service.revision = revision - 1;
        };

        for obj in head.old_values.values_mut() {
            shift(obj, true);
        }
        for obj in head.new_values.values_mut() {
            shift(obj, true);
        }
        for obj in head.removed_values.values_mut() {
            shift(obj, false);
        }

        let has_reservation = head.has_next_pk();
        let undo_next_pk = head.undo_next_pk;

        if has_reservation {
            let mut service = Self::next_pk_service(&descriptor, revision, undo_next_pk);
            service.revision = revision - 1;
            ctx.journal.write_undo(
                key,
                WriteOp::Revision {
                    from: revision,
                    service,
                },
            );
            if let Some(reservation) = stack.undo_next_pk.remove(&revision) {
                stack.undo_next_pk.insert(revision - 1, reservation);
            }
        }

        stack.squash_down();
        Ok(())
    }

    /// Merges the only frame of a table into the committed base: the data
    /// rows move down a revision and every compensation record is dropped.
    fn merge_into_base<D: Driver>(
        stack: &mut TableUndoStack,
        ctx: &mut UndoCtx<'_, D>,
    ) -> Result<(), Error> {
        let key = stack.key;
        let descriptor = stack.descriptor.clone();
        let revision = stack.head_revision();
        let frame = stack.take_head(revision)?;

        for obj in frame.old_values.values().chain(frame.new_values.values()) {
            let mut service = obj.service.clone();
            service.revision = revision - 1;
            ctx.cache
                .set_revision(&obj.service.service_key(), revision - 1);
            ctx.journal.write(
                key,
                WriteOp::Revision {
                    from: revision,
                    service,
                },
                WriteOp::Remove(obj.service.clone()),
            );
        }
        for obj in frame.removed_values.values() {
            ctx.journal
                .write_undo(key, WriteOp::Remove(obj.service.clone()));
        }
        if frame.has_next_pk() {
            ctx.journal.write_undo(
                key,
                WriteOp::Remove(Self::next_pk_service(
                    &descriptor,
                    revision,
                    frame.undo_next_pk,
                )),
            );
        }
        Ok(())
    }

    /// Merges the head frame (B) into its adjacent parent (A), one primary
    /// key at a time:
    ///
    /// | A \ B      | new   | upd(was=Y) | del(was=Y) | nop        |
    /// |------------|-------|------------|------------|------------|
    /// | new(v)     | fatal | new        | nop        | new(v)     |
    /// | upd(was=X) | fatal | upd(was=X) | del(was=X) | upd(was=X) |
    /// | del(was=X) | upd(was=X) | fatal | fatal      | del(was=X) |
    /// | nop        | new   | upd(was=Y) | del(was=Y) | nop        |
    ///
    /// The fatal cells violate causal timing and abort the process.
    fn merge_frames<D: Driver>(
        stack: &mut TableUndoStack,
        ctx: &mut UndoCtx<'_, D>,
    ) -> Result<(), Error> {
        let key = stack.key;
        let descriptor = stack.descriptor.clone();
        let b = stack.stack.pop_back().expect("squash checked the head frame");
        let b_revision = b.revision;
        let a = stack
            .stack
            .back_mut()
            .expect("merge_frames requires two frames");
        let a_revision = a.revision;
        let mut move_reservation = false;

        for (raw, mut obj) in b.old_values {
            let row_key = obj.service.service_key();
            let merged = if a.new_values.contains_key(&raw) {
                a.new_values.get_mut(&raw)
            } else {
                a.old_values.get_mut(&raw)
            };
            if let Some(entry) = merged {
                // new+upd -> new and upd+upd -> upd keep A's pre-image
                Self::copy_live_fields(&mut entry.service, &obj.service);
                ctx.cache.set_revision(&row_key, a_revision);
                let mut service = obj.service.clone();
                service.revision = a_revision;
                ctx.journal.write(
                    key,
                    WriteOp::Revision {
                        from: b_revision,
                        service,
                    },
                    WriteOp::Remove(obj.service.clone()),
                );
                continue;
            }
            assert!(
                !a.removed_values.contains_key(&raw),
                "illegal composition del+upd for row {}",
                row_key
            );
            // nop+upd: B's record moves down
            ctx.cache.set_revision(&row_key, a_revision);
            let mut service = obj.service.clone();
            service.revision = a_revision;
            ctx.journal.write(
                key,
                WriteOp::Revision {
                    from: b_revision,
                    service: service.clone(),
                },
                WriteOp::Revision {
                    from: b_revision,
                    service,
                },
            );
            obj.service.revision = a_revision;
            a.old_values.insert(raw, obj);
        }

        for (raw, obj) in b.new_values {
            let row_key = obj.service.service_key();
            assert!(
                !a.new_values.contains_key(&raw) && !a.old_values.contains_key(&raw),
                "illegal composition over a live row {}",
                row_key
            );
            ctx.cache.set_revision(&row_key, a_revision);
            if let Some(mut removed) = a.removed_values.remove(&raw) {
                // del+ins -> upd whose pre-image is the deleted row
                let mut service = obj.service.clone();
                service.revision = a_revision;
                ctx.journal.write_data(
                    key,
                    WriteOp::Revision {
                        from: b_revision,
                        service,
                    },
                );
                ctx.journal
                    .write_undo(key, WriteOp::Remove(obj.service.clone()));
                removed.service.undo_rec = UndoRecordKind::OldValue;
                ctx.journal.write_undo(key, WriteOp::Update(removed.clone()));
                a.old_values.insert(raw, removed);
            } else {
                // nop+new: B's record moves down
                let mut service = obj.service.clone();
                service.revision = a_revision;
                ctx.journal.write(
                    key,
                    WriteOp::Revision {
                        from: b_revision,
                        service: service.clone(),
                    },
                    WriteOp::Revision {
                        from: b_revision,
                        service,
                    },
                );
                let mut obj = obj;
                obj.service.revision = a_revision;
                a.new_values.insert(raw, obj);
            }
        }

        for (raw, obj) in b.removed_values {
            let row_key = obj.service.service_key();
            if let Some(created) = a.new_values.remove(&raw) {
                // new+del vanishes entirely, on disk as well
                ctx.journal
                    .write_undo(key, WriteOp::Remove(obj.service.clone()));
                ctx.journal
                    .write_undo(key, WriteOp::Remove(created.service));
                continue;
            }
            if let Some(mut entry) = a.old_values.remove(&raw) {
                // upd+del -> del keeping A's pre-image
                ctx.journal
                    .write_undo(key, WriteOp::Remove(obj.service.clone()));
                entry.service.undo_rec = UndoRecordKind::RemovedValue;
                ctx.journal.write_undo(key, WriteOp::Update(entry.clone()));
                a.removed_values.insert(raw, entry);
                continue;
            }
            assert!(
                !a.removed_values.contains_key(&raw),
                "illegal composition del+del for row {}",
                row_key
            );
            // nop+del: B's record moves down
            let mut service = obj.service.clone();
            service.revision = a_revision;
            ctx.journal.write_undo(
                key,
                WriteOp::Revision {
                    from: b_revision,
                    service,
                },
            );
            let mut obj = obj;
            obj.service.revision = a_revision;
            a.removed_values.insert(raw, obj);
        }

        if b.next_pk != PrimaryKey::UNSET {
            if !a.has_next_pk() {
                let mut service = Self::next_pk_service(&descriptor, b_revision, b.undo_next_pk);
                service.revision = a_revision;
                ctx.journal.write_undo(
                    key,
                    WriteOp::Revision {
                        from: b_revision,
                        service,
                    },
                );
                a.next_pk = b.next_pk;
                a.undo_next_pk = b.undo_next_pk;
                move_reservation = true;
            } else {
                ctx.journal.write_undo(
                    key,
                    WriteOp::Remove(Self::next_pk_service(
                        &descriptor,
                        b_revision,
                        b.undo_next_pk,
                    )),
                );
            }
        }

        if move_reservation {
            if let Some(reservation) = stack.undo_next_pk.remove(&b_revision) {
                stack.undo_next_pk.insert(a_revision, reservation);
            }
        } else {
            stack.undo_next_pk.remove(&b_revision);
        }
        stack.step_down();
        Ok(())
    }

    /// Makes every revision at or below `revision` permanent: the matching
    /// tail frames are dropped and their persisted compensation records
    /// deleted. Committing at or below the tail is a replay and does
    /// nothing.
    pub(crate) fn commit(&mut self, revision: Revision, journal: &mut Journal) -> Result<(), Error> {
        if revision <= self.tail_revision {
            return Ok(());
        }

        self.for_tables(|stack| Self::commit_table(stack, revision, journal))?;

        self.tail_revision = revision;
        if self.revision == self.tail_revision {
            self.stage = UndoStage::Unknown;
        }
        Ok(())
    }

    fn commit_table(
        stack: &mut TableUndoStack,
        revision: Revision,
        journal: &mut Journal,
    ) -> Result<(), Error> {
        let key = stack.key;
        let descriptor = stack.descriptor.clone();
        stack.undo_next_pk.retain(|rev, _| *rev >= revision);

        while let Some(front) = stack.stack.front() {
            if front.revision > revision {
                break;
            }
            let frame = stack.stack.pop_front().expect("front frame just observed");
            for obj in frame
                .old_values
                .values()
                .chain(frame.new_values.values())
                .chain(frame.removed_values.values())
            {
                journal.write_undo(key, WriteOp::Remove(obj.service.clone()));
            }
            if frame.has_next_pk() {
                journal.write_undo(
                    key,
                    WriteOp::Remove(Self::next_pk_service(
                        &descriptor,
                        frame.revision,
                        frame.undo_next_pk,
                    )),
                );
            }
            if stack.stack.is_empty() {
                stack.revision = IMPOSSIBLE_REVISION;
                stack.stage = UndoStage::Unknown;
            }
        }
        Ok(())
    }

    /// Walks every table, dropping the ones whose stacks are exhausted.
    fn for_tables<F>(&mut self, mut visit: F) -> Result<(), Error>
    where
        F: FnMut(&mut TableUndoStack) -> Result<(), Error>,
    {
        let keys: Vec<TableKey> = self.tables.keys().copied().collect();
        for key in keys {
            let stack = self
                .tables
                .get_mut(&key)
                .expect("table keys were just collected");
            visit(stack)?;
            if stack.is_dead() {
                self.tables.remove(&key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use statedb_types::{OrderDef, ScopeId, TableDef, TableId};

    use crate::{driver::MemoryDriver, resource::UnlimitedResources};

    use super::*;

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::table(
            AccountId(9),
            ScopeId(0),
            Arc::new(TableDef {
                name: TableId(20),
                pk_order: OrderDef::asc("id"),
                indexes: Vec::new(),
            }),
        )
    }

    fn row(table: &EntityDescriptor, pk: u64) -> ObjectValue {
        let mut service = table.to_service(PrimaryKey(pk));
        service.size = 12;
        ObjectValue {
            service,
            value: json!({"id": pk}),
        }
    }

    struct Collaborators {
        driver: MemoryDriver,
        cache: RowCache,
        journal: Journal,
        resources: UnlimitedResources,
    }

    impl Collaborators {
        fn new() -> Collaborators {
            Collaborators {
                driver: MemoryDriver::new(),
                cache: RowCache::new(),
                journal: Journal::new(),
                resources: UnlimitedResources,
            }
        }

        fn ctx(&mut self) -> UndoCtx<'_, MemoryDriver> {
            UndoCtx {
                driver: &mut self.driver,
                cache: &mut self.cache,
                journal: &mut self.journal,
                resource: &self.resources,
            }
        }
    }

    #[test]
    fn disabled_sessions_record_nothing() {
        let mut engine = UndoStack::new();
        assert_eq!(
            engine.start_undo_session(false).unwrap(),
            IMPOSSIBLE_REVISION
        );
        assert!(!engine.enabled());

        let mut side = Collaborators::new();
        engine
            .insert(&descriptor(), row(&descriptor(), 1), &mut side.ctx())
            .unwrap();
        assert!(engine.table(&descriptor().table_key()).is_none());
        // the write still reached the data stream
        assert!(!side.journal.is_empty());
    }

    #[test]
    fn set_revision_requires_an_empty_stack() {
        let mut engine = UndoStack::new();
        let mut side = Collaborators::new();

        engine.start_undo_session(true).unwrap();
        engine
            .insert(&descriptor(), row(&descriptor(), 1), &mut side.ctx())
            .unwrap();

        assert!(matches!(
            engine.set_revision(10),
            Err(Error::NonEmptyUndoStack)
        ));

        engine.undo(1, &mut side.ctx()).unwrap();
        engine.set_revision(10).unwrap();
        assert_eq!(engine.revision(), 10);
    }

    #[test]
    fn undo_outside_a_session_is_a_session_fault() {
        let mut engine = UndoStack::new();
        let mut side = Collaborators::new();
        assert!(matches!(
            engine.undo(1, &mut side.ctx()),
            Err(Error::NoActiveSession { .. })
        ));
    }

    #[test]
    fn undo_checks_the_head_revision() {
        let mut engine = UndoStack::new();
        let mut side = Collaborators::new();
        engine.start_undo_session(true).unwrap();

        assert!(matches!(
            engine.undo(5, &mut side.ctx()),
            Err(Error::WrongSessionRevision {
                operation: "undo",
                ..
            })
        ));
    }

    #[test]
    fn commit_below_the_tail_is_a_replay_noop() {
        let mut engine = UndoStack::new();
        let mut side = Collaborators::new();

        engine.start_undo_session(true).unwrap();
        engine
            .insert(&descriptor(), row(&descriptor(), 1), &mut side.ctx())
            .unwrap();
        engine.commit(1, &mut side.journal).unwrap();
        assert_eq!(engine.tail_revision(), 1);

        // a replayed commit touches nothing
        let journal_len = side.journal.changes().count();
        engine.commit(1, &mut side.journal).unwrap();
        assert_eq!(side.journal.changes().count(), journal_len);
    }

    #[test]
    fn nested_sessions_step_the_revision() {
        let mut engine = UndoStack::new();
        assert_eq!(engine.start_undo_session(true).unwrap(), 1);
        assert_eq!(engine.start_undo_session(true).unwrap(), 2);
        assert_eq!(engine.start_undo_session(true).unwrap(), 3);
        assert_eq!(engine.revision(), 3);
        assert!(engine.enabled());
    }

    fn valued(table: &EntityDescriptor, pk: u64, tag: &str) -> ObjectValue {
        let mut service = table.to_service(PrimaryKey(pk));
        service.size = 12;
        ObjectValue {
            service,
            value: json!({"id": pk, "tag": tag}),
        }
    }

    /// Exercises every legal cell of the frame-composition table over one
    /// squash: pk1 new+upd, pk2 new+del, pk3 upd+upd, pk4 upd+del,
    /// pk5 del+ins, pk6 nop+upd, pk7 nop+del, pk8 new+nop.
    #[test]
    fn squash_composes_frames_per_the_matrix() {
        let table = descriptor();
        let mut engine = UndoStack::new();
        let mut side = Collaborators::new();

        // committed base rows for the cells that need pre-images
        for pk in [3u64, 4, 5, 6, 7] {
            engine
                .insert(&table, valued(&table, pk, "base"), &mut side.ctx())
                .unwrap();
        }
        side.driver.apply_all_changes(&side.journal).unwrap();
        side.journal.clear();

        // frame A
        engine.start_undo_session(true).unwrap();
        for pk in [1u64, 2, 8] {
            engine
                .insert(&table, valued(&table, pk, "a-new"), &mut side.ctx())
                .unwrap();
        }
        for pk in [3u64, 4] {
            engine
                .update(
                    &table,
                    valued(&table, pk, "base"),
                    valued(&table, pk, "a-upd"),
                    &mut side.ctx(),
                )
                .unwrap();
        }
        engine
            .remove(&table, valued(&table, 5, "base"), &mut side.ctx())
            .unwrap();

        // frame B
        engine.start_undo_session(true).unwrap();
        for pk in [1u64, 3, 6] {
            engine
                .update(
                    &table,
                    valued(&table, pk, "before-b"),
                    valued(&table, pk, "b-upd"),
                    &mut side.ctx(),
                )
                .unwrap();
        }
        for pk in [2u64, 4, 7] {
            engine
                .remove(&table, valued(&table, pk, "before-b"), &mut side.ctx())
                .unwrap();
        }
        engine
            .insert(&table, valued(&table, 5, "b-ins"), &mut side.ctx())
            .unwrap();

        engine.squash(2, &mut side.ctx()).unwrap();

        let stack = engine.table(&table.table_key()).unwrap();
        assert_eq!(stack.stack.len(), 1);
        let frame = &stack.stack[0];
        assert_eq!(frame.revision, 1);

        // new+upd -> new; new+nop -> new
        assert!(frame.new_values.contains_key(&1));
        assert!(frame.new_values.contains_key(&8));
        // new+del -> nop
        assert!(!frame.new_values.contains_key(&2));
        assert!(!frame.removed_values.contains_key(&2));
        // upd+upd -> upd keeping the older pre-image
        assert_eq!(frame.old_values[&3].value["tag"], json!("base"));
        // upd+del -> del keeping the older pre-image
        assert_eq!(frame.removed_values[&4].value["tag"], json!("base"));
        assert_eq!(
            frame.removed_values[&4].service.undo_rec,
            UndoRecordKind::RemovedValue
        );
        // del+ins -> upd whose pre-image is the deleted row
        assert_eq!(frame.old_values[&5].value["tag"], json!("base"));
        assert_eq!(
            frame.old_values[&5].service.undo_rec,
            UndoRecordKind::OldValue
        );
        // nop+upd and nop+del move down into the parent
        assert_eq!(frame.old_values[&6].service.revision, 1);
        assert_eq!(frame.removed_values[&7].service.revision, 1);

        // the persisted undo stream mirrors the composed frame
        side.driver.apply_all_changes(&side.journal).unwrap();
        side.journal.clear();

        let per_pk = |pk: u64| {
            side.driver
                .undo_stream()
                .values()
                .filter(|obj| obj.service.pk == PrimaryKey(pk))
                .map(|obj| obj.service.undo_rec)
                .collect::<Vec<_>>()
        };
        assert_eq!(per_pk(1), vec![UndoRecordKind::NewValue]);
        assert_eq!(per_pk(2), Vec::new());
        assert_eq!(per_pk(3), vec![UndoRecordKind::OldValue]);
        assert_eq!(per_pk(4), vec![UndoRecordKind::RemovedValue]);
        assert_eq!(per_pk(5), vec![UndoRecordKind::OldValue]);
        assert_eq!(per_pk(6), vec![UndoRecordKind::OldValue]);
        assert_eq!(per_pk(7), vec![UndoRecordKind::RemovedValue]);
        assert_eq!(per_pk(8), vec![UndoRecordKind::NewValue]);
    }
}

