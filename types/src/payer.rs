use serde::{Deserialize, Serialize};

use crate::{name::AccountId, service::ServiceState};

/// Block time slot a storage charge is attributed to.
pub type TimeSlot = u32;

/// Billing context of one table write: who pays for how many bytes at which
/// time slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePayer {
    /// Account owning the affected row.
    pub owner: AccountId,
    /// Account charged for the storage delta.
    pub payer: AccountId,
    /// Signed storage delta in bytes.
    pub delta: i64,
    /// Canonical storage size of the written value.
    pub size: u64,
    /// Block time slot of the charge.
    pub time_slot: TimeSlot,
    /// Whether the row is held in RAM.
    pub in_ram: bool,
}

impl StoragePayer {
    /// A payer context where `owner` both owns and pays.
    pub fn new(owner: AccountId, time_slot: TimeSlot) -> StoragePayer {
        StoragePayer {
            owner,
            payer: owner,
            time_slot,
            ..StoragePayer::default()
        }
    }

    /// Fills the empty fields from a prior row's header.
    ///
    /// This is the preserving variant: fields already set are never
    /// overwritten, only empty `owner`/`payer` inherit the prior payer.
    pub fn get_payer_from(&mut self, orig: &ServiceState) {
        if self.owner.is_empty() {
            self.owner = if orig.owner.is_empty() {
                orig.payer
            } else {
                orig.owner
            };
        }
        if self.payer.is_empty() {
            self.payer = orig.payer;
        }
    }

    /// Stamps the billing outcome into a row's header.
    pub fn set_payer_in(&self, service: &mut ServiceState) {
        service.payer = self.payer;
        service.owner = self.owner;
        service.size = self.size;
        service.in_ram = self.in_ram;
        service.time_slot = self.time_slot;
    }
}
