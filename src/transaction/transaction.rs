use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

pub type TransactionId = u64;
pub const INVALID_TRANSACTION_ID: TransactionId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Running,
    Committing,
    Aborting,
    /// Aborting because restart recovery decided the transaction lost.
    RecoveryAborting,
    Complete,
}

impl TransactionStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            TransactionStatus::Running => 0,
            TransactionStatus::Committing => 1,
            TransactionStatus::Aborting => 2,
            TransactionStatus::RecoveryAborting => 3,
            TransactionStatus::Complete => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TransactionStatus::Running),
            1 => Some(TransactionStatus::Committing),
            2 => Some(TransactionStatus::Aborting),
            3 => Some(TransactionStatus::RecoveryAborting),
            4 => Some(TransactionStatus::Complete),
            _ => None,
        }
    }
}

/// Handle for one transaction. The lock manager parks a transaction on its
/// own condition variable rather than on any lock-manager state: the gate is
/// armed with `prepare_block` while the manager mutex is held, and `block` is
/// only called after that mutex has been released, so a wakeup between the
/// two calls cannot be lost.
pub struct Transaction {
    trans_num: TransactionId,
    status: Mutex<TransactionStatus>,
    blocked: Mutex<bool>,
    unblocked: Condvar,
    cleanup: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

impl Transaction {
    pub fn new(trans_num: TransactionId) -> Self {
        Transaction {
            trans_num,
            status: Mutex::new(TransactionStatus::Running),
            blocked: Mutex::new(false),
            unblocked: Condvar::new(),
            cleanup: OnceCell::new(),
        }
    }

    pub fn trans_num(&self) -> TransactionId {
        self.trans_num
    }

    pub fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: TransactionStatus) {
        *self.status.lock() = status;
    }

    /// Arm the gate. Must be called before the caller gives up whatever
    /// serialization made the decision to block.
    pub fn prepare_block(&self) {
        *self.blocked.lock() = true;
    }

    /// Park until some other transaction calls `unblock`. Returns
    /// immediately if `unblock` already ran since `prepare_block`.
    pub fn block(&self) {
        let mut blocked = self.blocked.lock();
        while *blocked {
            self.unblocked.wait(&mut blocked);
        }
    }

    pub fn unblock(&self) {
        let mut blocked = self.blocked.lock();
        *blocked = false;
        self.unblocked.notify_all();
    }

    pub fn is_blocked(&self) -> bool {
        *self.blocked.lock()
    }

    /// Install the cleanup hook recovery invokes when it ends this
    /// transaction (e.g. releasing all of its locks). Later installs are
    /// ignored.
    pub fn set_cleanup(&self, f: Box<dyn Fn() + Send + Sync>) {
        let _ = self.cleanup.set(f);
    }

    pub fn cleanup(&self) {
        if let Some(f) = self.cleanup.get() {
            f();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("trans_num", &self.trans_num)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn unblock_before_block_is_not_lost() {
        let txn = Arc::new(Transaction::new(1));
        txn.prepare_block();
        txn.unblock();
        // Must not park.
        txn.block();
    }

    #[test]
    fn block_waits_for_unblock() {
        let txn = Arc::new(Transaction::new(2));
        txn.prepare_block();
        let waiter = {
            let txn = txn.clone();
            thread::spawn(move || txn.block())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(txn.is_blocked());
        txn.unblock();
        waiter.join().unwrap();
        assert!(!txn.is_blocked());
    }
}
