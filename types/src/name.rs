//! Numeric identifiers of accounts, scopes, tables and indexes.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Identifier of an account (a contract code owner or a storage payer).
///
/// The zero id is the "empty" account: on update and remove it means
/// "inherit the payer from the prior row".
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AccountId(pub u64);

impl AccountId {
    /// The empty account id.
    pub const EMPTY: AccountId = AccountId(0);

    /// The default system account, owner of the undo and schema tables.
    pub const SYSTEM: AccountId = AccountId(1);

    /// Returns `true` for the empty account id.
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl Display for AccountId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a table subdivision within one account's tables.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ScopeId(pub u64);

impl Display for ScopeId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a table within an account's schema.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TableId(pub u64);

impl TableId {
    /// The distinguished system table holding the persisted undo stream.
    pub const UNDO: TableId = TableId(1);
    /// The system table whose rows carry per-account schema definitions.
    pub const SCHEMA: TableId = TableId(2);
}

impl Display for TableId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a secondary index within a table definition.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct IndexId(pub u64);

impl IndexId {
    /// The implicit primary-key index of every table.
    pub const PRIMARY: IndexId = IndexId(0);
}

impl Display for IndexId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
