//! Hierarchical (multigranularity) locking layered over the flat
//! [`LockManager`]. A [`LockContext`] is a cheap handle onto one node of a
//! resource tree; the tree itself is a flat, index-addressed arena owned by
//! [`LockHierarchy`], so nodes reference their parents by id and nothing owns
//! anything cyclically.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::concurrency::{LockError, LockManager, LockType, ResourceName};
use crate::transaction::{Transaction, TransactionId};

struct ContextNode {
    name: ResourceName,
    parent: Option<usize>,
    children: HashMap<String, usize>,
    /// transaction id -> number of locks that transaction holds on strict
    /// descendants of this node.
    num_child_locks: HashMap<TransactionId, usize>,
    readonly: bool,
    child_locks_disabled: bool,
}

/// Owner of the context tree. Lock state lives in the manager; the hierarchy
/// only tracks structure, readonly flags, and descendant-lock counters.
pub struct LockHierarchy {
    manager: Arc<LockManager>,
    nodes: RwLock<Vec<ContextNode>>,
    index: DashMap<ResourceName, usize>,
}

impl LockHierarchy {
    pub fn new(manager: Arc<LockManager>) -> Arc<Self> {
        Arc::new(LockHierarchy {
            manager,
            nodes: RwLock::new(Vec::new()),
            index: DashMap::new(),
        })
    }

    pub fn manager(&self) -> &Arc<LockManager> {
        &self.manager
    }

    /// Root context for `name`, created on first use.
    pub fn context(self: &Arc<Self>, name: impl Into<String>) -> LockContext {
        let resource = ResourceName::new_root(name);
        let id = self.intern(resource, None, false);
        LockContext {
            hierarchy: self.clone(),
            id,
        }
    }

    /// Context for the database root.
    pub fn database_context(self: &Arc<Self>) -> LockContext {
        self.context("database")
    }

    /// Walk (and create) the path of contexts down to `name`.
    pub fn from_resource_name(self: &Arc<Self>, name: &ResourceName) -> LockContext {
        let segments = name.segments();
        let mut ctx = self.context(segments[0].clone());
        for segment in &segments[1..] {
            ctx = ctx.child_context(segment.clone());
        }
        ctx
    }

    fn intern(&self, name: ResourceName, parent: Option<usize>, readonly: bool) -> usize {
        if let Some(existing) = self.index.get(&name) {
            return *existing;
        }
        let mut nodes = self.nodes.write();
        // Double-check under the write lock.
        if let Some(existing) = self.index.get(&name) {
            return *existing;
        }
        let id = nodes.len();
        nodes.push(ContextNode {
            name: name.clone(),
            parent,
            children: HashMap::new(),
            num_child_locks: HashMap::new(),
            readonly,
            child_locks_disabled: readonly,
        });
        if let Some(parent_id) = parent {
            let segment = name.last_segment().to_string();
            nodes[parent_id].children.insert(segment, id);
        }
        self.index.insert(name, id);
        id
    }

    fn increment_ancestors(&self, id: usize, txn_id: TransactionId) {
        let mut nodes = self.nodes.write();
        let mut current = nodes[id].parent;
        while let Some(ancestor) = current {
            *nodes[ancestor].num_child_locks.entry(txn_id).or_insert(0) += 1;
            current = nodes[ancestor].parent;
        }
    }

    /// Decrement the descendant-lock counter of every strict ancestor of
    /// `name`, dropping entries that reach zero.
    fn decrement_ancestors_of(&self, name: &ResourceName, txn_id: TransactionId) {
        let mut nodes = self.nodes.write();
        let mut current = name.parent();
        while let Some(ancestor_name) = current {
            if let Some(id) = self.index.get(&ancestor_name).map(|e| *e) {
                if let Some(count) = nodes[id].num_child_locks.get_mut(&txn_id) {
                    *count -= 1;
                    if *count == 0 {
                        nodes[id].num_child_locks.remove(&txn_id);
                    }
                }
            }
            current = ancestor_name.parent();
        }
    }
}

/// Handle to one node in the hierarchy. Cloning is cheap; all clones share
/// the same underlying node.
#[derive(Clone)]
pub struct LockContext {
    hierarchy: Arc<LockHierarchy>,
    id: usize,
}

impl LockContext {
    pub fn resource_name(&self) -> ResourceName {
        self.hierarchy.nodes.read()[self.id].name.clone()
    }

    pub fn parent_context(&self) -> Option<LockContext> {
        self.hierarchy.nodes.read()[self.id]
            .parent
            .map(|id| LockContext {
                hierarchy: self.hierarchy.clone(),
                id,
            })
    }

    /// Child context for `name`, created on first use. Children of a
    /// readonly context, or of a context with child locks disabled, are
    /// readonly themselves.
    pub fn child_context(&self, name: impl Into<String>) -> LockContext {
        let name = name.into();
        let (child_name, readonly) = {
            let nodes = self.hierarchy.nodes.read();
            let node = &nodes[self.id];
            if let Some(&id) = node.children.get(&name) {
                return LockContext {
                    hierarchy: self.hierarchy.clone(),
                    id,
                };
            }
            (
                node.name.child(name),
                node.readonly || node.child_locks_disabled,
            )
        };
        let id = self.hierarchy.intern(child_name, Some(self.id), readonly);
        LockContext {
            hierarchy: self.hierarchy.clone(),
            id,
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.hierarchy.nodes.read()[self.id].readonly
    }

    /// Make all new child contexts readonly. Used for indices and temporary
    /// tables, where finer-grain locks are disallowed.
    pub fn disable_child_locks(&self) {
        self.hierarchy.nodes.write()[self.id].child_locks_disabled = true;
    }

    /// Number of locks `txn_id` holds on strict descendants of this context.
    pub fn num_children(&self, txn_id: TransactionId) -> usize {
        self.hierarchy.nodes.read()[self.id]
            .num_child_locks
            .get(&txn_id)
            .copied()
            .unwrap_or(0)
    }

    /// The lock `txn` holds on exactly this resource, or `NL`.
    pub fn explicit_lock_type(&self, txn: &Arc<Transaction>) -> LockType {
        self.hierarchy
            .manager
            .lock_type(txn.trans_num(), &self.resource_name())
    }

    /// The lock `txn` holds here either explicitly or by inheritance: an S,
    /// X, or SIX ancestor confers S, X, or S respectively; intent-only
    /// ancestors confer nothing.
    pub fn effective_lock_type(&self, txn: &Arc<Transaction>) -> LockType {
        let explicit = self.explicit_lock_type(txn);
        if explicit != LockType::NL {
            return explicit;
        }
        let mut ancestor = self.parent_context();
        while let Some(ctx) = ancestor {
            match ctx.explicit_lock_type(txn) {
                LockType::S => return LockType::S,
                LockType::X => return LockType::X,
                LockType::SIX => return LockType::S,
                _ => {}
            }
            ancestor = ctx.parent_context();
        }
        LockType::NL
    }

    /// Acquire `lock_type` here for `txn`, enforcing parent-permits-child
    /// against the parent context's explicit lock.
    pub fn acquire(&self, txn: &Arc<Transaction>, lock_type: LockType) -> Result<(), LockError> {
        let name = self.resource_name();
        if self.is_readonly() {
            return Err(LockError::UnsupportedOperation(format!(
                "context {} is readonly",
                name
            )));
        }
        if lock_type == LockType::NL {
            return Err(LockError::InvalidLock(
                "NL cannot be acquired explicitly; use release".to_string(),
            ));
        }
        if self.explicit_lock_type(txn) == lock_type {
            return Err(LockError::DuplicateLockRequest(format!(
                "transaction {} already holds {} on {}",
                txn.trans_num(),
                lock_type,
                name
            )));
        }
        if let Some(parent) = self.parent_context() {
            let parent_type = parent.effective_lock_type(txn);
            if !LockType::can_be_parent(parent_type, lock_type) {
                return Err(LockError::InvalidLock(format!(
                    "{} on {} does not permit {} on child {}",
                    parent_type,
                    parent.resource_name(),
                    lock_type,
                    name
                )));
            }
        }
        self.hierarchy.manager.acquire(txn, &name, lock_type)?;
        self.hierarchy.increment_ancestors(self.id, txn.trans_num());
        Ok(())
    }

    /// Release `txn`'s lock here. Rejected while any strict descendant still
    /// holds an S or X lock; descendants holding only intent locks do not
    /// block the release.
    pub fn release(&self, txn: &Arc<Transaction>) -> Result<(), LockError> {
        let name = self.resource_name();
        if self.is_readonly() {
            return Err(LockError::UnsupportedOperation(format!(
                "context {} is readonly",
                name
            )));
        }
        let txn_id = txn.trans_num();
        if self.hierarchy.manager.lock_type(txn_id, &name) == LockType::NL {
            return Err(LockError::NoLockHeld(format!(
                "transaction {} holds no lock on {}",
                txn_id, name
            )));
        }
        for lock in self.hierarchy.manager.locks_of(txn_id) {
            if lock.name.is_descendant_of(&name)
                && matches!(lock.lock_type, LockType::S | LockType::X)
            {
                return Err(LockError::InvalidLock(format!(
                    "cannot release {} while descendant {} holds {}",
                    name, lock.name, lock.lock_type
                )));
            }
        }
        self.hierarchy.manager.release(txn, &name)?;
        self.hierarchy.decrement_ancestors_of(&name, txn_id);
        Ok(())
    }

    /// Promote `txn`'s lock here to `new_type`. Promoting to SIX from
    /// IS/IX/S atomically releases every S and IS lock the transaction holds
    /// on strict descendants; SIX under an SIX ancestor is redundant and
    /// rejected.
    pub fn promote(&self, txn: &Arc<Transaction>, new_type: LockType) -> Result<(), LockError> {
        let name = self.resource_name();
        if self.is_readonly() {
            return Err(LockError::UnsupportedOperation(format!(
                "context {} is readonly",
                name
            )));
        }
        let txn_id = txn.trans_num();
        let current = self.explicit_lock_type(txn);
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
        if new_type == LockType::SIX {
            if self.has_six_ancestor(txn) {
                return Err(LockError::InvalidLock(
                    "SIX under an SIX ancestor is redundant".to_string(),
                ));
            }
            let descendants = self.sis_descendants(txn);
            let mut release_names = descendants.clone();
            release_names.push(name.clone());
            self.hierarchy
                .manager
                .acquire_and_release(txn, &name, LockType::SIX, release_names)?;
            for released in &descendants {
                self.hierarchy.decrement_ancestors_of(released, txn_id);
            }
            Ok(())
        } else {
            self.hierarchy.manager.promote(txn, &name, new_type)
        }
    }

    /// Collapse all of `txn`'s locks on strict descendants of this context,
    /// together with this context's own lock, into a single S or X lock
    /// here: X when this context or any descendant holds IX, X, or SIX, else
    /// S. One mutating manager call; a no-op when there is nothing to
    /// collapse and the lock here is already S or X.
    pub fn escalate(&self, txn: &Arc<Transaction>) -> Result<(), LockError> {
        let name = self.resource_name();
        if self.is_readonly() {
            return Err(LockError::UnsupportedOperation(format!(
                "context {} is readonly",
                name
            )));
        }
        let txn_id = txn.trans_num();
        let current = self.hierarchy.manager.lock_type(txn_id, &name);
        if current == LockType::NL {
            return Err(LockError::NoLockHeld(format!(
                "transaction {} holds no lock on {}",
                txn_id, name
            )));
        }
        let descendants: Vec<_> = self
            .hierarchy
            .manager
            .locks_of(txn_id)
            .into_iter()
            .filter(|lock| lock.name.is_descendant_of(&name))
            .collect();
        if descendants.is_empty() && matches!(current, LockType::S | LockType::X) {
            return Ok(());
        }
        let wants_exclusive = std::iter::once(current)
            .chain(descendants.iter().map(|l| l.lock_type))
            .any(|t| matches!(t, LockType::IX | LockType::X | LockType::SIX));
        let target = if wants_exclusive {
            LockType::X
        } else {
            LockType::S
        };

        let mut release_names: Vec<_> = descendants.iter().map(|l| l.name.clone()).collect();
        release_names.push(name.clone());
        self.hierarchy
            .manager
            .acquire_and_release(txn, &name, target, release_names)?;
        for lock in &descendants {
            self.hierarchy.decrement_ancestors_of(&lock.name, txn_id);
        }
        Ok(())
    }

    fn has_six_ancestor(&self, txn: &Arc<Transaction>) -> bool {
        let mut ancestor = self.parent_context();
        while let Some(ctx) = ancestor {
            if ctx.explicit_lock_type(txn) == LockType::SIX {
                return true;
            }
            ancestor = ctx.parent_context();
        }
        false
    }

    /// Names of every S or IS lock `txn` holds on strict descendants.
    fn sis_descendants(&self, txn: &Arc<Transaction>) -> Vec<ResourceName> {
        let name = self.resource_name();
        self.hierarchy
            .manager
            .locks_of(txn.trans_num())
            .into_iter()
            .filter(|lock| {
                lock.name.is_descendant_of(&name)
                    && matches!(lock.lock_type, LockType::S | LockType::IS)
            })
            .map(|lock| lock.name)
            .collect()
    }
}

impl std::fmt::Debug for LockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LockContext({})", self.resource_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<LockHierarchy>, LockContext) {
        let hierarchy = LockHierarchy::new(Arc::new(LockManager::new()));
        let db = hierarchy.database_context();
        (hierarchy, db)
    }

    fn txn(id: TransactionId) -> Arc<Transaction> {
        Arc::new(Transaction::new(id))
    }

    /// Descendant counters must equal the actual count of strict-descendant
    /// locks for every node.
    fn assert_counters_consistent(hierarchy: &Arc<LockHierarchy>, txn_ids: &[TransactionId]) {
        let names: Vec<ResourceName> = hierarchy
            .index
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            let ctx = hierarchy.from_resource_name(&name);
            for &txn_id in txn_ids {
                let actual = hierarchy
                    .manager()
                    .locks_of(txn_id)
                    .into_iter()
                    .filter(|l| l.name.is_descendant_of(&name))
                    .count();
                assert_eq!(
                    ctx.num_children(txn_id),
                    actual,
                    "counter mismatch at {} for txn {}",
                    name,
                    txn_id
                );
            }
        }
    }

    /// Every held (ancestor, descendant) pair must satisfy
    /// parent-permits-child, and SIX may not sit above S/IS.
    fn assert_hierarchy_legal(hierarchy: &Arc<LockHierarchy>, txn_ids: &[TransactionId]) {
        for &txn_id in txn_ids {
            let locks = hierarchy.manager().locks_of(txn_id);
            for descendant in &locks {
                for ancestor in &locks {
                    if !descendant.name.is_descendant_of(&ancestor.name) {
                        continue;
                    }
                    if descendant.name.parent().as_ref() == Some(&ancestor.name) {
                        assert!(
                            LockType::can_be_parent(ancestor.lock_type, descendant.lock_type),
                            "{} {} does not permit {} {}",
                            ancestor.lock_type,
                            ancestor.name,
                            descendant.lock_type,
                            descendant.name
                        );
                    }
                    assert!(
                        !(ancestor.lock_type == LockType::SIX
                            && matches!(descendant.lock_type, LockType::S | LockType::IS)),
                        "S/IS under SIX at {}",
                        descendant.name
                    );
                }
            }
        }
    }

    #[test]
    fn acquire_requires_parent_intent() {
        let (_h, db) = setup();
        let table = db.child_context("table1");
        let t1 = txn(1);

        assert!(matches!(
            table.acquire(&t1, LockType::S),
            Err(LockError::InvalidLock(_))
        ));
        db.acquire(&t1, LockType::IS).unwrap();
        table.acquire(&t1, LockType::S).unwrap();
        assert_eq!(db.num_children(1), 1);
    }

    #[test]
    fn nl_acquire_is_invalid() {
        let (_h, db) = setup();
        let t1 = txn(1);
        assert!(matches!(
            db.acquire(&t1, LockType::NL),
            Err(LockError::InvalidLock(_))
        ));
    }

    #[test]
    fn release_blocked_by_strong_descendants_only() {
        let (hierarchy, db) = setup();
        let table = db.child_context("table1");
        let page = table.child_context("3");
        let t1 = txn(1);

        db.acquire(&t1, LockType::IX).unwrap();
        table.acquire(&t1, LockType::IX).unwrap();
        page.acquire(&t1, LockType::X).unwrap();

        // X below forbids releasing the table lock.
        assert!(matches!(
            table.release(&t1),
            Err(LockError::InvalidLock(_))
        ));

        page.release(&t1).unwrap();
        table.release(&t1).unwrap();

        // Intent-only descendants do not block release.
        table.acquire(&t1, LockType::IS).unwrap();
        db.release(&t1).unwrap();
        assert_eq!(
            hierarchy.manager().lock_type(1, &db.resource_name()),
            LockType::NL
        );
        assert_counters_consistent(&hierarchy, &[1]);
    }

    #[test]
    fn promote_to_six_releases_sis_descendants() {
        let (hierarchy, db) = setup();
        let table = db.child_context("table1");
        let p3 = table.child_context("3");
        let p4 = table.child_context("4");
        let t1 = txn(1);

        db.acquire(&t1, LockType::IX).unwrap();
        table.acquire(&t1, LockType::IX).unwrap();
        p3.acquire(&t1, LockType::S).unwrap();
        p4.acquire(&t1, LockType::IS).unwrap();

        table.promote(&t1, LockType::SIX).unwrap();

        assert_eq!(table.explicit_lock_type(&t1), LockType::SIX);
        assert_eq!(p3.explicit_lock_type(&t1), LockType::NL);
        assert_eq!(p4.explicit_lock_type(&t1), LockType::NL);
        assert_eq!(table.num_children(1), 0);
        assert_eq!(db.num_children(1), 1);
        assert_counters_consistent(&hierarchy, &[1]);
        assert_hierarchy_legal(&hierarchy, &[1]);
    }

    #[test]
    fn promote_to_six_under_six_ancestor_rejected() {
        let (_h, db) = setup();
        let table = db.child_context("table1");
        let t1 = txn(1);

        db.acquire(&t1, LockType::IX).unwrap();
        db.promote(&t1, LockType::SIX).unwrap();
        table.acquire(&t1, LockType::IX).unwrap();
        assert!(matches!(
            table.promote(&t1, LockType::SIX),
            Err(LockError::InvalidLock(_))
        ));
    }

    #[test]
    fn escalate_collapses_to_exclusive() {
        // IX(db), IX(table), S(page3), X(page5): table.escalate -> X(table).
        let (hierarchy, db) = setup();
        let table = db.child_context("table1");
        let p3 = table.child_context("3");
        let p5 = table.child_context("5");
        let t1 = txn(1);

        db.acquire(&t1, LockType::IX).unwrap();
        table.acquire(&t1, LockType::IX).unwrap();
        p3.acquire(&t1, LockType::S).unwrap();
        p5.acquire(&t1, LockType::X).unwrap();
        assert_eq!(db.num_children(1), 3);

        table.escalate(&t1).unwrap();

        assert_eq!(db.explicit_lock_type(&t1), LockType::IX);
        assert_eq!(table.explicit_lock_type(&t1), LockType::X);
        assert_eq!(p3.explicit_lock_type(&t1), LockType::NL);
        assert_eq!(p5.explicit_lock_type(&t1), LockType::NL);
        assert_eq!(table.num_children(1), 0);
        assert_eq!(db.num_children(1), 1);
        assert_counters_consistent(&hierarchy, &[1]);
        assert_hierarchy_legal(&hierarchy, &[1]);
    }

    #[test]
    fn escalate_to_shared_and_idempotence() {
        let (hierarchy, db) = setup();
        let table = db.child_context("table1");
        let p3 = table.child_context("3");
        let t1 = txn(1);

        db.acquire(&t1, LockType::IS).unwrap();
        table.acquire(&t1, LockType::IS).unwrap();
        p3.acquire(&t1, LockType::S).unwrap();

        table.escalate(&t1).unwrap();
        assert_eq!(table.explicit_lock_type(&t1), LockType::S);
        assert_eq!(p3.explicit_lock_type(&t1), LockType::NL);

        // Escalating again changes nothing.
        table.escalate(&t1).unwrap();
        assert_eq!(table.explicit_lock_type(&t1), LockType::S);
        assert_counters_consistent(&hierarchy, &[1]);
    }

    #[test]
    fn escalate_without_lock_rejected() {
        let (_h, db) = setup();
        let t1 = txn(1);
        assert!(matches!(
            db.escalate(&t1),
            Err(LockError::NoLockHeld(_))
        ));
    }

    #[test]
    fn effective_lock_type_inherits() {
        let (_h, db) = setup();
        let table = db.child_context("table1");
        let page = table.child_context("3");
        let t1 = txn(1);

        assert_eq!(page.effective_lock_type(&t1), LockType::NL);

        db.acquire(&t1, LockType::IX).unwrap();
        assert_eq!(page.effective_lock_type(&t1), LockType::NL);

        table.acquire(&t1, LockType::X).unwrap();
        assert_eq!(page.effective_lock_type(&t1), LockType::X);
        assert_eq!(page.explicit_lock_type(&t1), LockType::NL);
    }

    #[test]
    fn six_ancestor_confers_shared() {
        let (_h, db) = setup();
        let table = db.child_context("table1");
        let page = table.child_context("3");
        let t1 = txn(1);

        db.acquire(&t1, LockType::IX).unwrap();
        db.promote(&t1, LockType::SIX).unwrap();
        assert_eq!(page.effective_lock_type(&t1), LockType::S);
        assert_eq!(table.effective_lock_type(&t1), LockType::S);
    }

    #[test]
    fn readonly_contexts_reject_mutation() {
        let (_h, db) = setup();
        let index = db.child_context("index1");
        index.disable_child_locks();
        let leaf = index.child_context("leaf0");
        let t1 = txn(1);

        db.acquire(&t1, LockType::IX).unwrap();
        index.acquire(&t1, LockType::X).unwrap();

        assert!(matches!(
            leaf.acquire(&t1, LockType::X),
            Err(LockError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            leaf.release(&t1),
            Err(LockError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            leaf.promote(&t1, LockType::X),
            Err(LockError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            leaf.escalate(&t1),
            Err(LockError::UnsupportedOperation(_))
        ));
    }
}
