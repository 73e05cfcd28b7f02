//! Seam to the resource manager that bills storage bytes.

use statedb_types::{AccountId, StoragePayer, TimeSlot};

use crate::error::Error;

/// Provider of storage-usage accounting.
///
/// The controller reports every billable storage delta here; whether the
/// payer has budget is this provider's decision and a rejection surfaces to
/// the caller as a resource error.
pub trait ResourceManager {
    /// Accounts `delta` bytes to `payer` at `time_slot`. A rejection means
    /// the payer cannot cover the delta.
    fn add_storage_usage(
        &self,
        payer: AccountId,
        delta: i64,
        time_slot: TimeSlot,
    ) -> Result<(), Error>;

    /// A billing context where `owner` both owns and pays at `time_slot`.
    fn get_storage_payer(&self, time_slot: TimeSlot, owner: AccountId) -> StoragePayer {
        StoragePayer::new(owner, time_slot)
    }
}

/// A resource manager that accepts every delta. Used at genesis and in
/// tests that are not about billing.
#[derive(Debug, Default)]
pub struct UnlimitedResources;

impl ResourceManager for UnlimitedResources {
    fn add_storage_usage(
        &self,
        _payer: AccountId,
        _delta: i64,
        _time_slot: TimeSlot,
    ) -> Result<(), Error> {
        Ok(())
    }
}
