//! User-visible, recoverable errors (spec §7 tier 1). Protocol warnings
//! (tier 2) are logged in place via `tracing::warn!` and do not appear
//! here; fatal invariant violations (tier 3) are `panic!`, not `Result`.

use utils::id::NodeId;

use crate::lock_state::LockKind;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("lock unavailable: held by {holder} as {kind:?}")]
    LockUnavailable { holder: NodeId, kind: LockKind },

    #[error("not ready: no peers known or startup recovery not finished")]
    NotReady,

    #[error("permission denied: ddl locking is not permitted by configuration")]
    PermissionDenied,

    #[error("config limit: database id {db} exceeds max_databases")]
    ConfigLimit { db: u32 },
}
