mod lock_context;
mod lock_manager;
mod lock_type;
mod lock_util;
mod resource;

pub use lock_context::{LockContext, LockHierarchy};
pub use lock_manager::{Lock, LockManager};
pub use lock_type::LockType;
pub use lock_util::ensure_sufficient;
pub use resource::ResourceName;

use thiserror::Error;

/// Failures surfaced by lock operations. All are checked before any state
/// changes, so a failed call leaves no partial effects. Blocking on a queue
/// is normal control flow, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// Acquire/promote targets a lock the transaction already effectively
    /// holds.
    #[error("duplicate lock request: {0}")]
    DuplicateLockRequest(String),

    /// Release/promote/escalate targets a resource the transaction holds no
    /// lock on.
    #[error("no lock held: {0}")]
    NoLockHeld(String),

    /// The request violates multigranularity or substitutability rules,
    /// including an explicit NL acquire.
    #[error("invalid lock request: {0}")]
    InvalidLock(String),

    /// Mutation attempted on a readonly context.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}
