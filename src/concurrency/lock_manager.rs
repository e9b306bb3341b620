//! Flat lock manager: bookkeeping for which transactions hold which locks on
//! which resources, plus the per-resource FIFO wait queue. Multigranularity
//! rules live one layer up in [`crate::concurrency::LockContext`]; code
//! should usually go through a context instead of calling this directly.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::concurrency::{LockError, LockType, ResourceName};
use crate::transaction::{Transaction, TransactionId};

/// A granted lock, mirrored in the owning resource's grant list and the
/// owning transaction's lock list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub name: ResourceName,
    pub lock_type: LockType,
    pub txn_id: TransactionId,
}

/// A request parked in a resource's wait queue. `release_names` carries the
/// deferred releases of an acquire-and-release that could not be granted
/// immediately; they are performed when the request is eventually granted.
struct LockRequest {
    txn: Arc<Transaction>,
    lock: Lock,
    release_names: Vec<ResourceName>,
}

#[derive(Default)]
struct ResourceEntry {
    /// Granted locks, in order of acquisition.
    locks: Vec<Lock>,
    /// Requests that could not be satisfied when they were made.
    waiting: VecDeque<LockRequest>,
}

#[derive(Default)]
struct LockManagerState {
    transaction_locks: HashMap<TransactionId, Vec<Lock>>,
    resource_entries: HashMap<ResourceName, ResourceEntry>,
}

impl LockManagerState {
    fn entry(&mut self, name: &ResourceName) -> &mut ResourceEntry {
        self.resource_entries.entry(name.clone()).or_default()
    }

    fn lock_type_of(&self, txn_id: TransactionId, name: &ResourceName) -> LockType {
        self.resource_entries
            .get(name)
            .and_then(|entry| entry.locks.iter().find(|l| l.txn_id == txn_id))
            .map(|l| l.lock_type)
            .unwrap_or(LockType::NL)
    }

    /// Check `lock_type` against preexisting grants and queued requests on
    /// `name`, ignoring anything owned by `except`. The queue participates so
    /// that a compatible newcomer cannot starve already-queued waiters of a
    /// conflicting type.
    fn check_compatible(
        &self,
        name: &ResourceName,
        lock_type: LockType,
        except: TransactionId,
    ) -> bool {
        let Some(entry) = self.resource_entries.get(name) else {
            return true;
        };
        for lock in &entry.locks {
            if lock.txn_id == except {
                continue;
            }
            if !LockType::compatible(lock_type, lock.lock_type) {
                return false;
            }
        }
        for request in &entry.waiting {
            if request.lock.txn_id == except {
                continue;
            }
            if !LockType::compatible(lock_type, request.lock.lock_type) {
                return false;
            }
        }
        true
    }

    /// Check `lock_type` against current grants only, ignoring `except`.
    /// Used when draining the wait queue.
    fn check_compatible_with_grants(
        &self,
        name: &ResourceName,
        lock_type: LockType,
        except: TransactionId,
    ) -> bool {
        let Some(entry) = self.resource_entries.get(name) else {
            return true;
        };
        entry
            .locks
            .iter()
            .filter(|l| l.txn_id != except)
            .all(|l| LockType::compatible(lock_type, l.lock_type))
    }

    /// Install `lock`, assuming compatibility was already verified. If the
    /// transaction already holds a lock on the resource the grant is swapped
    /// in place, preserving the acquisition position in both the resource's
    /// grant list and the transaction's lock list.
    fn grant_or_update(&mut self, lock: Lock) {
        let entry = self.entry(&lock.name);
        if let Some(existing) = entry.locks.iter_mut().find(|l| l.txn_id == lock.txn_id) {
            existing.lock_type = lock.lock_type;
            if let Some(txn_locks) = self.transaction_locks.get_mut(&lock.txn_id) {
                if let Some(mirror) = txn_locks.iter_mut().find(|l| l.name == lock.name) {
                    mirror.lock_type = lock.lock_type;
                }
            }
            return;
        }
        entry.locks.push(lock.clone());
        self.transaction_locks
            .entry(lock.txn_id)
            .or_default()
            .push(lock);
    }

    /// Remove the transaction's grant on `name` and drain the queue.
    fn release_lock(&mut self, txn_id: TransactionId, name: &ResourceName) {
        if let Some(entry) = self.resource_entries.get_mut(name) {
            entry.locks.retain(|l| l.txn_id != txn_id);
        }
        if let Some(txn_locks) = self.transaction_locks.get_mut(&txn_id) {
            txn_locks.retain(|l| &l.name != name);
            if txn_locks.is_empty() {
                self.transaction_locks.remove(&txn_id);
            }
        }
        self.process_queue(name);
    }

    /// Grant queued requests front-to-back until the head cannot be granted.
    /// The head is never skipped to admit a compatible later request. A
    /// granted request performs its deferred releases (draining those queues
    /// in turn) and unblocks its transaction.
    fn process_queue(&mut self, name: &ResourceName) {
        loop {
            let front = match self.resource_entries.get(name) {
                Some(entry) => match entry.waiting.front() {
                    Some(request) => (request.lock.txn_id, request.lock.lock_type),
                    None => return,
                },
                None => return,
            };
            if !self.check_compatible_with_grants(name, front.1, front.0) {
                return;
            }
            let request = self
                .resource_entries
                .get_mut(name)
                .and_then(|entry| entry.waiting.pop_front())
                .expect("front request observed above");
            trace!(
                "lock granted from queue: txn={} resource={} type={}",
                request.lock.txn_id,
                request.lock.name,
                request.lock.lock_type
            );
            self.grant_or_update(request.lock.clone());
            for released in &request.release_names {
                if released != name {
                    self.release_lock(request.lock.txn_id, released);
                }
            }
            request.txn.unblock();
        }
    }
}

/// The serialization point for all lock state. One process-wide mutex guards
/// every mutation; the manager never parks a transaction while holding it —
/// blocking follows the prepare_block / drop mutex / block discipline against
/// the transaction's own gate.
#[derive(Default)]
pub struct LockManager {
    state: Mutex<LockManagerState>,
}

impl LockManager {
    pub fn new() -> Self {
        LockManager::default()
    }

    /// Acquire `lock_type` on `name` for `txn`, releasing every lock in
    /// `release_names` in the same atomic step once the grant succeeds.
    ///
    /// All error checking happens before any state changes. If the request is
    /// not compatible, it is placed at the *front* of the queue and the
    /// transaction blocks; the releases happen when the request is granted.
    /// Re-granting on a resource being released keeps the original
    /// acquisition position.
    pub fn acquire_and_release(
        &self,
        txn: &Arc<Transaction>,
        name: &ResourceName,
        lock_type: LockType,
        release_names: Vec<ResourceName>,
    ) -> Result<(), LockError> {
        let txn_id = txn.trans_num();
        let mut should_block = false;
        {
            let mut state = self.state.lock();
            if state.lock_type_of(txn_id, name) != LockType::NL
                && !release_names.contains(name)
            {
                return Err(LockError::DuplicateLockRequest(format!(
                    "transaction {} already holds a lock on {}",
                    txn_id, name
                )));
            }
            for released in &release_names {
                if state.lock_type_of(txn_id, released) == LockType::NL {
                    return Err(LockError::NoLockHeld(format!(
                        "transaction {} holds no lock on {}",
                        txn_id, released
                    )));
                }
            }
            let lock = Lock {
                name: name.clone(),
                lock_type,
                txn_id,
            };
            if state.check_compatible(name, lock_type, txn_id) {
                state.grant_or_update(lock);
                for released in &release_names {
                    if released != name {
                        state.release_lock(txn_id, released);
                    }
                }
            } else {
                txn.prepare_block();
                state.entry(name).waiting.push_front(LockRequest {
                    txn: txn.clone(),
                    lock,
                    release_names,
                });
                should_block = true;
            }
        }
        if should_block {
            trace!("txn={} blocking on {} ({})", txn_id, name, lock_type);
            txn.block();
        }
        Ok(())
    }

    /// Acquire `lock_type` on `name` for `txn`. Incompatible requests (with
    /// either current grants or queued requests of other transactions) go to
    /// the *back* of the queue and block.
    pub fn acquire(
        &self,
        txn: &Arc<Transaction>,
        name: &ResourceName,
        lock_type: LockType,
    ) -> Result<(), LockError> {
        let txn_id = txn.trans_num();
        let mut should_block = false;
        {
            let mut state = self.state.lock();
            if state.lock_type_of(txn_id, name) != LockType::NL {
                return Err(LockError::DuplicateLockRequest(format!(
                    "transaction {} already holds a lock on {}",
                    txn_id, name
                )));
            }
            let lock = Lock {
                name: name.clone(),
                lock_type,
                txn_id,
            };
            if state.check_compatible(name, lock_type, txn_id) {
                state.grant_or_update(lock);
            } else {
                txn.prepare_block();
                state.entry(name).waiting.push_back(LockRequest {
                    txn: txn.clone(),
                    lock,
                    release_names: Vec::new(),
                });
                should_block = true;
            }
        }
        if should_block {
            trace!("txn={} blocking on {} ({})", txn_id, name, lock_type);
            txn.block();
        }
        Ok(())
    }

    /// Release `txn`'s lock on `name` and drain the resource's queue.
    pub fn release(&self, txn: &Arc<Transaction>, name: &ResourceName) -> Result<(), LockError> {
        let txn_id = txn.trans_num();
        let mut state = self.state.lock();
        if state.lock_type_of(txn_id, name) == LockType::NL {
            return Err(LockError::NoLockHeld(format!(
                "transaction {} holds no lock on {}",
                txn_id, name
            )));
        }
        state.release_lock(txn_id, name);
        Ok(())
    }

    /// Promote `txn`'s lock on `name` to `new_type`. A valid promotion swaps
    /// the grant in place (acquisition position preserved); an incompatible
    /// one is queued at the *front* and blocks.
    pub fn promote(
        &self,
        txn: &Arc<Transaction>,
        name: &ResourceName,
        new_type: LockType,
    ) -> Result<(), LockError> {
        let txn_id = txn.trans_num();
        let mut should_block = false;
        {
            let mut state = self.state.lock();
            let current = state.lock_type_of(txn_id, name);
            if current == LockType::NL {
                return Err(LockError::NoLockHeld(format!(
                    "transaction {} holds no lock on {}",
                    txn_id, name
                )));
            }
            if current == new_type {
                return Err(LockError::DuplicateLockRequest(format!(
                    "transaction {} already holds {} on {}",
                    txn_id, new_type, name
                )));
            }
            if !LockType::substitutable(new_type, current) {
                return Err(LockError::InvalidLock(format!(
                    "{} is not a promotion of {}",
                    new_type, current
                )));
            }
            let lock = Lock {
                name: name.clone(),
                lock_type: new_type,
                txn_id,
            };
            if state.check_compatible(name, new_type, txn_id) {
                state.grant_or_update(lock);
            } else {
                txn.prepare_block();
                state.entry(name).waiting.push_front(LockRequest {
                    txn: txn.clone(),
                    lock,
                    release_names: Vec::new(),
                });
                should_block = true;
            }
        }
        if should_block {
            trace!(
                "txn={} blocking on promote {} ({})",
                txn_id,
                name,
                new_type
            );
            txn.block();
        }
        Ok(())
    }

    /// The lock `txn` holds on `name`, or `NL`.
    pub fn lock_type(&self, txn_id: TransactionId, name: &ResourceName) -> LockType {
        self.state.lock().lock_type_of(txn_id, name)
    }

    /// Locks held by `txn`, in order of acquisition.
    pub fn locks_of(&self, txn_id: TransactionId) -> Vec<Lock> {
        self.state
            .lock()
            .transaction_locks
            .get(&txn_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Locks held on `name`, in order of acquisition.
    pub fn locks_on(&self, name: &ResourceName) -> Vec<Lock> {
        self.state
            .lock()
            .resource_entries
            .get(name)
            .map(|entry| entry.locks.clone())
            .unwrap_or_default()
    }

    /// Number of requests waiting on `name`.
    pub fn queue_len(&self, name: &ResourceName) -> usize {
        self.state
            .lock()
            .resource_entries
            .get(name)
            .map(|entry| entry.waiting.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn txn(id: TransactionId) -> Arc<Transaction> {
        Arc::new(Transaction::new(id))
    }

    fn res(name: &str) -> ResourceName {
        ResourceName::new_root("database").child(name)
    }

    #[test]
    fn shared_locks_coexist() {
        let manager = LockManager::new();
        let a = res("a");
        let t1 = txn(1);
        let t2 = txn(2);

        manager.acquire(&t1, &a, LockType::S).unwrap();
        manager.acquire(&t2, &a, LockType::S).unwrap();
        assert_eq!(manager.lock_type(1, &a), LockType::S);
        assert_eq!(manager.lock_type(2, &a), LockType::S);
        assert_eq!(manager.locks_on(&a).len(), 2);
    }

    #[test]
    fn duplicate_acquire_rejected() {
        let manager = LockManager::new();
        let a = res("a");
        let t1 = txn(1);
        manager.acquire(&t1, &a, LockType::S).unwrap();
        assert!(matches!(
            manager.acquire(&t1, &a, LockType::X),
            Err(LockError::DuplicateLockRequest(_))
        ));
    }

    #[test]
    fn release_without_lock_rejected() {
        let manager = LockManager::new();
        let t1 = txn(1);
        assert!(matches!(
            manager.release(&t1, &res("a")),
            Err(LockError::NoLockHeld(_))
        ));
    }

    #[test]
    fn invalid_promotion_rejected() {
        let manager = LockManager::new();
        let a = res("a");
        let t1 = txn(1);
        manager.acquire(&t1, &a, LockType::X).unwrap();
        assert!(matches!(
            manager.promote(&t1, &a, LockType::S),
            Err(LockError::InvalidLock(_))
        ));
        assert!(matches!(
            manager.promote(&t1, &a, LockType::X),
            Err(LockError::DuplicateLockRequest(_))
        ));
    }

    #[test]
    fn conflicting_acquire_blocks_until_release() {
        let manager = Arc::new(LockManager::new());
        let a = res("a");
        let t1 = txn(1);
        let t2 = txn(2);

        manager.acquire(&t1, &a, LockType::X).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let manager = manager.clone();
            let a = a.clone();
            let t2 = t2.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                manager.acquire(&t2, &a, LockType::S).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst));
        assert_eq!(manager.queue_len(&a), 1);

        manager.release(&t1, &a).unwrap();
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(manager.lock_type(2, &a), LockType::S);
    }

    #[test]
    fn queue_drains_compatible_prefix_in_fifo_order() {
        // T1 holds X(A); T2 then T3 queue S(A). On release both drain.
        let manager = Arc::new(LockManager::new());
        let a = res("a");
        let t1 = txn(1);
        let t2 = txn(2);
        let t3 = txn(3);

        manager.acquire(&t1, &a, LockType::X).unwrap();

        let spawn_acquire = |t: Arc<Transaction>| {
            let manager = manager.clone();
            let a = a.clone();
            thread::spawn(move || manager.acquire(&t, &a, LockType::S).unwrap())
        };
        let h2 = spawn_acquire(t2.clone());
        while manager.queue_len(&a) < 1 {
            thread::sleep(Duration::from_millis(1));
        }
        let h3 = spawn_acquire(t3.clone());
        while manager.queue_len(&a) < 2 {
            thread::sleep(Duration::from_millis(1));
        }

        manager.release(&t1, &a).unwrap();
        h2.join().unwrap();
        h3.join().unwrap();
        assert_eq!(manager.lock_type(2, &a), LockType::S);
        assert_eq!(manager.lock_type(3, &a), LockType::S);
        assert_eq!(manager.queue_len(&a), 0);
    }

    #[test]
    fn queued_request_blocks_compatible_newcomer() {
        // Queue S(A) X(A); an arriving S(A) must queue behind the X rather
        // than jump it, and queue processing must stop at the X head.
        let manager = Arc::new(LockManager::new());
        let a = res("a");
        let t1 = txn(1);
        let t2 = txn(2);
        let t3 = txn(3);

        manager.acquire(&t1, &a, LockType::S).unwrap();
        let h2 = {
            let (manager, a, t2) = (manager.clone(), a.clone(), t2.clone());
            thread::spawn(move || manager.acquire(&t2, &a, LockType::X).unwrap())
        };
        while manager.queue_len(&a) < 1 {
            thread::sleep(Duration::from_millis(1));
        }

        // S is compatible with the S grant but not with the queued X.
        let h3 = {
            let (manager, a, t3) = (manager.clone(), a.clone(), t3.clone());
            thread::spawn(move || manager.acquire(&t3, &a, LockType::S).unwrap())
        };
        while manager.queue_len(&a) < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(manager.lock_type(3, &a), LockType::NL);

        manager.release(&t1, &a).unwrap();
        h2.join().unwrap();
        assert_eq!(manager.lock_type(2, &a), LockType::X);
        // T3 still parked behind T2's X.
        assert_eq!(manager.lock_type(3, &a), LockType::NL);

        manager.release(&t2, &a).unwrap();
        h3.join().unwrap();
        assert_eq!(manager.lock_type(3, &a), LockType::S);
    }

    #[test]
    fn promote_is_queued_at_front() {
        // T1 holds S(A); T2 queues X(A); T1's promote to X goes to the head
        // of the queue, ahead of T2.
        let manager = Arc::new(LockManager::new());
        let a = res("a");
        let t1 = txn(1);
        let t2 = txn(2);
        let t3 = txn(3);

        manager.acquire(&t1, &a, LockType::S).unwrap();
        manager.acquire(&t3, &a, LockType::S).unwrap();

        let h2 = {
            let (manager, a, t2) = (manager.clone(), a.clone(), t2.clone());
            thread::spawn(move || manager.acquire(&t2, &a, LockType::X).unwrap())
        };
        while manager.queue_len(&a) < 1 {
            thread::sleep(Duration::from_millis(1));
        }

        // T1's own S is ignored, but T3's S grant and T2's queued X conflict.
        let h1 = {
            let (manager, a, t1) = (manager.clone(), a.clone(), t1.clone());
            thread::spawn(move || manager.promote(&t1, &a, LockType::X).unwrap())
        };
        while manager.queue_len(&a) < 2 {
            thread::sleep(Duration::from_millis(1));
        }

        // T3 releases; the queue head (T1's promote) is granted first.
        manager.release(&t3, &a).unwrap();
        h1.join().unwrap();
        assert_eq!(manager.lock_type(1, &a), LockType::X);
        assert_eq!(manager.lock_type(2, &a), LockType::NL);

        manager.release(&t1, &a).unwrap();
        h2.join().unwrap();
        assert_eq!(manager.lock_type(2, &a), LockType::X);
    }

    #[test]
    fn promote_preserves_acquisition_order() {
        let manager = LockManager::new();
        let a = res("a");
        let b = res("b");
        let t1 = txn(1);

        manager.acquire(&t1, &a, LockType::S).unwrap();
        manager.acquire(&t1, &b, LockType::X).unwrap();
        manager.promote(&t1, &a, LockType::X).unwrap();

        let locks = manager.locks_of(1);
        assert_eq!(locks[0].name, a);
        assert_eq!(locks[0].lock_type, LockType::X);
        assert_eq!(locks[1].name, b);
    }

    #[test]
    fn acquire_and_release_is_atomic_and_keeps_position() {
        let manager = LockManager::new();
        let a = res("a");
        let b = res("b");
        let t1 = txn(1);

        manager.acquire(&t1, &a, LockType::S).unwrap();
        manager.acquire(&t1, &b, LockType::S).unwrap();
        manager
            .acquire_and_release(&t1, &a, LockType::X, vec![a.clone(), b.clone()])
            .unwrap();

        assert_eq!(manager.lock_type(1, &a), LockType::X);
        assert_eq!(manager.lock_type(1, &b), LockType::NL);
        let locks = manager.locks_of(1);
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].name, a);
    }

    #[test]
    fn acquire_and_release_validates_release_set() {
        let manager = LockManager::new();
        let a = res("a");
        let b = res("b");
        let t1 = txn(1);

        manager.acquire(&t1, &a, LockType::S).unwrap();
        // b is not held.
        assert!(matches!(
            manager.acquire_and_release(&t1, &a, LockType::X, vec![a.clone(), b.clone()]),
            Err(LockError::NoLockHeld(_))
        ));
        // a held but not in the release set.
        assert!(matches!(
            manager.acquire_and_release(&t1, &a, LockType::X, vec![]),
            Err(LockError::DuplicateLockRequest(_))
        ));
        // Failed calls must not have mutated anything.
        assert_eq!(manager.lock_type(1, &a), LockType::S);
    }

    #[test]
    fn deferred_release_runs_when_queued_request_is_granted() {
        // T2 waits to upgrade A while releasing B; T3 waits on B. When T1
        // frees A, T2's grant must release B and wake T3 in the same step.
        let manager = Arc::new(LockManager::new());
        let a = res("a");
        let b = res("b");
        let t1 = txn(1);
        let t2 = txn(2);
        let t3 = txn(3);

        manager.acquire(&t1, &a, LockType::X).unwrap();
        manager.acquire(&t2, &b, LockType::X).unwrap();

        let h2 = {
            let (manager, a, b, t2) = (manager.clone(), a.clone(), b.clone(), t2.clone());
            thread::spawn(move || {
                manager
                    .acquire_and_release(&t2, &a, LockType::X, vec![b])
                    .unwrap()
            })
        };
        while manager.queue_len(&a) < 1 {
            thread::sleep(Duration::from_millis(1));
        }

        let h3 = {
            let (manager, b, t3) = (manager.clone(), b.clone(), t3.clone());
            thread::spawn(move || manager.acquire(&t3, &b, LockType::S).unwrap())
        };
        while manager.queue_len(&b) < 1 {
            thread::sleep(Duration::from_millis(1));
        }

        manager.release(&t1, &a).unwrap();
        h2.join().unwrap();
        h3.join().unwrap();
        assert_eq!(manager.lock_type(2, &a), LockType::X);
        assert_eq!(manager.lock_type(2, &b), LockType::NL);
        assert_eq!(manager.lock_type(3, &b), LockType::S);
    }
}
