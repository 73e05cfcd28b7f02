use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// A row's primary key.
///
/// Two sentinel values are excluded from the usable key space: [`UNSET`]
/// marks a key that has not been assigned yet, [`END`] marks the position
/// past the last row of an index.
///
/// [`UNSET`]: PrimaryKey::UNSET
/// [`END`]: PrimaryKey::END
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PrimaryKey(pub u64);

impl PrimaryKey {
    /// A key that has not been assigned.
    pub const UNSET: PrimaryKey = PrimaryKey(u64::MAX);
    /// The position past the last row of an index.
    pub const END: PrimaryKey = PrimaryKey(u64::MAX - 1);

    /// Returns `true` when the key is a usable row key, excluding both
    /// sentinels.
    pub fn is_good(&self) -> bool {
        *self != Self::UNSET && *self != Self::END
    }

    /// The raw key value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The key following this one. The successor of a sentinel is [`UNSET`].
    ///
    /// [`UNSET`]: PrimaryKey::UNSET
    pub fn next(&self) -> PrimaryKey {
        if self.is_good() {
            PrimaryKey(self.0 + 1)
        } else {
            Self::UNSET
        }
    }
}

impl Default for PrimaryKey {
    fn default() -> Self {
        Self::UNSET
    }
}

impl From<u64> for PrimaryKey {
    fn from(raw: u64) -> Self {
        PrimaryKey(raw)
    }
}

impl Display for PrimaryKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Self::UNSET => write!(f, "unset"),
            Self::END => write!(f, "end"),
            PrimaryKey(raw) => write!(f, "{}", raw),
        }
    }
}
