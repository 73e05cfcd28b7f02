/// Monotonically increasing identifier of a session / undo frame.
pub type Revision = i64;

/// Marks "no active session".
pub const IMPOSSIBLE_REVISION: Revision = -1;

/// The genesis revision. Rows written at this revision are recorded but
/// never billed; every session runs at a strictly greater revision.
pub const START_REVISION: Revision = 0;
